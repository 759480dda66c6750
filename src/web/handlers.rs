//! HTTP request handlers.

use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::OnceLock;

use super::{auth, AppState};
use crate::db::{
    DbError, Target, PROBE_MODE_HTTP, PROBE_MODE_ICMP, PROBE_MODE_IPERF, PROBE_MODE_SSH,
};
use crate::monitor::localize_trace_en;

// ============================================================================
// Errors
// ============================================================================

/// API error kinds, mapped onto HTTP status codes.
#[derive(Debug)]
pub enum ApiError {
    InvalidInput(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    TooManyRequests(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidInput(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m),
            ApiError::Forbidden(m) => (StatusCode::FORBIDDEN, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::TooManyRequests(m) => (StatusCode::TOO_MANY_REQUESTS, m),
            ApiError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Conflict => {
                ApiError::Conflict("Target with this address already exists".to_string())
            }
            DbError::NotFound => ApiError::NotFound("not found".to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Validation
// ============================================================================

/// Shell metacharacters never valid in a probe address.
const ADDRESS_META_CHARS: &str = ";|&$`\"'<>(){}[]";

/// IPv4 dotted-quad, IPv6 hex/colon, or RFC 1123 domain.
fn address_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([a-zA-Z0-9]([a-zA-Z0-9\-]{0,61}[a-zA-Z0-9])?\.)*[a-zA-Z]{2,}$|^\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}$|^[a-fA-F0-9:]+$",
        )
        .unwrap()
    })
}

fn validate_address(address: &str) -> Result<(), ApiError> {
    if address.is_empty() {
        return Err(ApiError::InvalidInput("address is required".to_string()));
    }
    if address.len() > 128 {
        return Err(ApiError::InvalidInput(
            "address must be at most 128 characters".to_string(),
        ));
    }
    if address.chars().any(|c| ADDRESS_META_CHARS.contains(c)) {
        return Err(ApiError::InvalidInput(
            "address contains invalid characters".to_string(),
        ));
    }
    if !address_pattern().is_match(address) {
        return Err(ApiError::InvalidInput(
            "invalid address format: only domain names and IP addresses allowed".to_string(),
        ));
    }
    Ok(())
}

/// Normalize the `ssh_key` field inside a probe config: CRLF to LF, stray CR
/// removed, trimmed, trailing newline enforced. Invalid JSON passes through.
fn clean_ssh_key_in_config(config_json: &str) -> String {
    let mut config: serde_json::Value = match serde_json::from_str(config_json) {
        Ok(v) => v,
        Err(_) => return config_json.to_string(),
    };

    if let Some(obj) = config.as_object_mut() {
        if let Some(key) = obj.get("ssh_key").and_then(|v| v.as_str()) {
            if !key.is_empty() {
                let mut cleaned = key.replace("\r\n", "\n").replace('\r', "");
                cleaned = cleaned.trim().to_string();
                cleaned.push('\n');
                obj.insert("ssh_key".to_string(), serde_json::Value::String(cleaned));
            }
        }
    }

    serde_json::to_string(&config).unwrap_or_else(|_| config_json.to_string())
}

// ============================================================================
// Setup & login
// ============================================================================

pub async fn handle_need_setup(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "need_setup": !state.store.has_any_user() }))
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

pub async fn handle_setup(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> ApiResult<impl IntoResponse> {
    if state.store.has_any_user() {
        return Err(ApiError::Forbidden("Setup already completed".to_string()));
    }

    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(ApiError::InvalidInput(
            "Username must be 3-32 characters".to_string(),
        ));
    }
    if req.password.len() < 6 || req.password.len() > 72 {
        return Err(ApiError::InvalidInput(
            "Password must be 6-72 characters".to_string(),
        ));
    }

    let hashed = auth::hash_password(&req.password)
        .map_err(|e| ApiError::Internal(format!("failed to hash password: {}", e)))?;

    let mut user = crate::db::User {
        id: 0,
        created_at: Utc::now(),
        username: req.username,
        password: hashed,
    };
    state.store.save_user(&mut user)?;

    Ok(Json(json!({ "message": "Setup successful" })))
}

pub async fn handle_login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<CredentialsRequest>,
) -> ApiResult<impl IntoResponse> {
    if !state.login_limiter.allow(addr.ip()) {
        return Err(ApiError::TooManyRequests(
            "Too many login attempts, try again later".to_string(),
        ));
    }

    let user = state
        .store
        .get_user(&req.username)
        .map_err(|_| ApiError::Unauthorized("Invalid credentials".to_string()))?;

    if !auth::verify_password(&user.password, &req.password) {
        return Err(ApiError::Unauthorized("Invalid credentials".to_string()));
    }

    let token = auth::generate_token(&state.jwt_secret, &user.username)
        .map_err(|e| ApiError::Internal(format!("token generation failed: {}", e)))?;

    Ok(Json(json!({ "token": token })))
}

#[derive(Debug, Deserialize)]
pub struct PasswordRequest {
    pub new_password: String,
}

pub async fn handle_update_password(
    State(state): State<AppState>,
    Json(req): Json<PasswordRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.new_password.len() < 6 || req.new_password.len() > 72 {
        return Err(ApiError::InvalidInput(
            "Password must be 6-72 characters".to_string(),
        ));
    }

    let user = state
        .store
        .get_first_user()
        .map_err(|_| ApiError::NotFound("No user found in system".to_string()))?;

    let hashed = auth::hash_password(&req.new_password)
        .map_err(|e| ApiError::Internal(format!("failed to hash password: {}", e)))?;
    state.store.update_user_password(user.id, &hashed)?;

    Ok(Json(json!({ "message": "Password updated" })))
}

// ============================================================================
// Measurements
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let targets = state.store.get_targets(false)?;

    let mut rows = Vec::with_capacity(targets.len());
    for target in targets {
        match state.store.get_latest_record(&target.address) {
            Ok(rec) => rows.push(json!({
                "target": target,
                "latency": rec.latency_ms,
                "loss": rec.packet_loss,
                "speed_down": rec.speed_down,
                "speed_up": rec.speed_up,
                "updated_at": rec.created_at,
            })),
            // a target with no samples yet still gets a row
            Err(_) => rows.push(json!({
                "target": target,
                "latency": 0,
                "loss": 0,
                "speed_down": 0,
                "speed_up": 0,
                "updated_at": null,
            })),
        }
    }

    Ok(Json(json!({ "targets": rows })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub target: String,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

pub async fn handle_history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<impl IntoResponse> {
    if query.target.is_empty() {
        return Err(ApiError::InvalidInput("target is required".to_string()));
    }

    let end = query
        .end
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let start = query
        .start
        .as_deref()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| end - ChronoDuration::hours(6));

    let records = state.store.get_history(&query.target, start, end)?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
pub struct TraceQuery {
    pub target: String,
    #[serde(default)]
    pub lang: Option<String>,
}

pub async fn handle_trace(
    State(state): State<AppState>,
    Query(query): Query<TraceQuery>,
) -> ApiResult<Response> {
    if query.target.is_empty() {
        return Err(ApiError::InvalidInput("target is required".to_string()));
    }

    let record = state
        .store
        .get_latest_trace(&query.target)
        .map_err(|_| ApiError::NotFound("trace not found".to_string()))?;
    let raw = record.trace_json.unwrap_or_default();

    // stored bytes are returned verbatim unless an English swap is requested
    let body = match query.lang.as_deref() {
        Some(lang) if !lang.is_empty() && !lang.starts_with("zh") => localize_trace_en(&raw),
        _ => raw,
    };

    Ok((
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ProbeRequest {
    #[serde(default)]
    pub target: String,
}

pub async fn handle_probe(
    State(state): State<AppState>,
    Query(query): Query<ProbeRequest>,
    body: String,
) -> ApiResult<impl IntoResponse> {
    // target may arrive in the body or the query string; both are optional
    let mut target = serde_json::from_str::<ProbeRequest>(&body)
        .map(|req| req.target)
        .unwrap_or_default();
    if target.is_empty() {
        target = query.target;
    }

    if !target.is_empty() {
        validate_address(&target)?;
    }

    state.monitor.trigger_probe(&target);
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Probe triggered", "target": target })),
    ))
}

// ============================================================================
// Target CRUD
// ============================================================================

pub async fn handle_get_targets(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let targets = state.store.get_targets(false)?;
    Ok(Json(targets))
}

pub async fn handle_save_target(
    State(state): State<AppState>,
    Json(mut target): Json<Target>,
) -> ApiResult<impl IntoResponse> {
    validate_address(&target.address)?;
    if target.name.is_empty() || target.name.len() > 64 {
        return Err(ApiError::InvalidInput(
            "name must be 1-64 characters".to_string(),
        ));
    }

    if target.probe_type.is_empty() {
        target.probe_type = PROBE_MODE_ICMP.to_string();
    }
    match target.probe_type.as_str() {
        PROBE_MODE_ICMP | PROBE_MODE_HTTP | PROBE_MODE_SSH | PROBE_MODE_IPERF => {}
        _ => return Err(ApiError::InvalidInput("invalid probe_type".to_string())),
    }

    if target.probe_type == PROBE_MODE_SSH && !target.probe_config.is_empty() {
        target.probe_config = clean_ssh_key_in_config(&target.probe_config);
    }

    if target.id == 0 {
        state.store.create_target(&mut target)?;
    } else {
        let existing = state
            .store
            .get_target(target.id)
            .map_err(|_| ApiError::NotFound("Target not found".to_string()))?;
        target.created_at = existing.created_at;
        state.store.update_target(&target)?;
        target = state.store.get_target(target.id)?;
    }

    Ok(Json(target))
}

pub async fn handle_delete_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<impl IntoResponse> {
    state
        .store
        .delete_target(id)
        .map_err(|_| ApiError::NotFound("Target not found".to_string()))?;
    Ok(Json(json!({ "message": "Target deleted" })))
}

// ============================================================================
// Logs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub lines: Option<usize>,
    #[serde(default)]
    pub level: Option<String>,
}

pub async fn handle_get_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let lines = match query.lines {
        Some(n) if (1..=1000).contains(&n) => n,
        _ => 100,
    };

    let mut entries = match query.level.as_deref().filter(|l| !l.is_empty()) {
        Some(filter) => {
            let levels: Vec<String> = filter.split(',').map(str::to_string).collect();
            state.logs.by_levels(&levels)
        }
        None => state.logs.tail(lines),
    };

    if entries.len() > lines {
        entries.drain(..entries.len() - lines);
    }

    Json(json!({ "logs": entries, "count": entries.len() }))
}

// ============================================================================
// Database management
// ============================================================================

pub async fn handle_database_stats(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let stats = state
        .store
        .database_stats(&state.config.db_path, state.config.retention_days)?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
pub struct CleanRequest {
    #[serde(default)]
    pub days: Option<i64>,
}

pub async fn handle_clean_database(
    State(state): State<AppState>,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let days = serde_json::from_str::<CleanRequest>(&body)
        .ok()
        .and_then(|req| req.days)
        .unwrap_or(state.config.retention_days);
    if days < 0 {
        return Err(ApiError::InvalidInput(
            "days must not be negative".to_string(),
        ));
    }

    let deleted = state.store.clean_old_records(days)?;
    tracing::info!("cleaned {} records older than {} days", deleted, days);

    Ok(Json(json!({
        "message": format!("Deleted {} records older than {} days", deleted, days),
        "deleted": deleted,
    })))
}

pub async fn handle_vacuum_database(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    state.store.vacuum()?;
    tracing::info!("database vacuumed");
    Ok(Json(json!({ "message": "Database vacuumed successfully" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_address_accepts_common_forms() {
        for addr in [
            "8.8.8.8",
            "192.168.1.254",
            "example.com",
            "sub.domain.example.org",
            "my-host.example.io",
            "2001:db8::1",
            "fe80::1",
            "localhost",
        ] {
            assert!(validate_address(addr).is_ok(), "rejected {}", addr);
        }
    }

    #[test]
    fn test_validate_address_rejects_metacharacters() {
        for c in ADDRESS_META_CHARS.chars() {
            let addr = format!("8.8.8.8{}x", c);
            assert!(
                matches!(validate_address(&addr), Err(ApiError::InvalidInput(_))),
                "accepted {:?}",
                addr
            );
        }
        assert!(validate_address("8.8.8.8; rm -rf /").is_err());
    }

    #[test]
    fn test_validate_address_rejects_empty_and_oversized() {
        assert!(validate_address("").is_err());
        let long = format!("{}.com", "a".repeat(130));
        assert!(validate_address(&long).is_err());
    }

    #[test]
    fn test_clean_ssh_key_normalizes_line_endings() {
        let config = r#"{"user":"probe","ssh_key":"-----BEGIN KEY-----\r\nabc\r\ndef\r\n-----END KEY-----"}"#;
        let cleaned = clean_ssh_key_in_config(config);
        let parsed: serde_json::Value = serde_json::from_str(&cleaned).unwrap();
        let key = parsed["ssh_key"].as_str().unwrap();
        assert!(!key.contains('\r'));
        assert!(key.ends_with("-----END KEY-----\n"));
    }

    #[test]
    fn test_clean_ssh_key_idempotent() {
        let config = r#"{"user":"probe","ssh_key":"-----BEGIN KEY-----\nabc\n-----END KEY-----\n"}"#;
        let once = clean_ssh_key_in_config(config);
        let twice = clean_ssh_key_in_config(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_clean_ssh_key_passes_invalid_json_through() {
        assert_eq!(clean_ssh_key_in_config("not json"), "not json");
    }
}
