//! Configuration module for RouteSight.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "data/routesight.db")
    pub db_path: String,
    /// Directory (or direct .mmdb path) holding GeoIP databases
    pub geoip_path: Option<String>,
    /// Explicit city MMDB path, overrides `geoip_path`
    pub geoip_city_db: Option<String>,
    /// Explicit ISP MMDB path, overrides `geoip_path`
    pub geoip_isp_db: Option<String>,
    /// Mirror URL for the city database download
    pub geoip_mirror: String,
    /// JWT signing secret; when unset a random per-process secret is used
    pub jwt_secret: Option<String>,
    /// Retention horizon reported by the database stats endpoint
    pub retention_days: i64,
}

const DEFAULT_GEOIP_MIRROR: &str =
    "https://raw.githubusercontent.com/P3TERX/GeoLite.mmdb/download/GeoLite2-City.mmdb";

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "data/routesight.db".to_string(),
            geoip_path: None,
            geoip_city_db: None,
            geoip_isp_db: None,
            geoip_mirror: DEFAULT_GEOIP_MIRROR.to_string(),
            jwt_secret: None,
            retention_days: 30,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `RS_HTTP_PORT`: HTTP port (default: 8080)
    /// - `RS_DB_PATH`: SQLite database path (default: "data/routesight.db")
    /// - `RS_GEOIP_PATH`: directory holding MMDB files, or a direct `.mmdb` path
    /// - `RS_GEOIP_CITY_DB` / `RS_GEOIP_ISP_DB`: explicit database paths
    /// - `RS_GEOIP_MIRROR`: download mirror for the city database
    /// - `RS_JWT_SECRET`: token signing secret (random per process when unset)
    /// - `RS_RETENTION_DAYS`: retention horizon in days (default: 30)
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("RS_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("RS_DB_PATH") {
            if !db_path.is_empty() {
                cfg.db_path = db_path;
            }
        }

        cfg.geoip_path = env::var("RS_GEOIP_PATH").ok().filter(|s| !s.is_empty());
        cfg.geoip_city_db = env::var("RS_GEOIP_CITY_DB").ok().filter(|s| !s.is_empty());
        cfg.geoip_isp_db = env::var("RS_GEOIP_ISP_DB").ok().filter(|s| !s.is_empty());

        if let Ok(mirror) = env::var("RS_GEOIP_MIRROR") {
            if !mirror.is_empty() {
                cfg.geoip_mirror = mirror;
            }
        }

        cfg.jwt_secret = env::var("RS_JWT_SECRET").ok().filter(|s| !s.is_empty());

        if let Ok(days_str) = env::var("RS_RETENTION_DAYS") {
            if let Ok(days) = days_str.parse::<i64>() {
                if days > 0 {
                    cfg.retention_days = days;
                }
            }
        }

        cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "data/routesight.db");
        assert_eq!(cfg.retention_days, 30);
        assert!(cfg.jwt_secret.is_none());
    }
}
