//! GeoIP module: dual-source IP geolocation.
//!
//! Resolution order: ip2region (xdb) wins for China IPs, otherwise the MMDB
//! city database (GeoLite2 or DB-IP layout), with an optional MMDB ISP
//! database for carrier names.

mod china;
mod provider;
mod xdb;

pub use provider::{GeoError, Location, Provider};
pub use xdb::XdbSearcher;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ServerConfig;

/// Resolved database file locations. Each is optional.
#[derive(Debug, Default)]
pub struct GeoPaths {
    pub city: Option<PathBuf>,
    pub isp: Option<PathBuf>,
    pub xdb: Option<PathBuf>,
}

/// An MMDB below this size is assumed truncated or corrupt.
const MIN_MMDB_BYTES: u64 = 10 * 1024 * 1024;

/// Derive database paths from the configuration.
///
/// `RS_GEOIP_CITY_DB`/`RS_GEOIP_ISP_DB` win outright; otherwise
/// `RS_GEOIP_PATH` is treated as a direct `.mmdb` file or as a directory
/// holding the conventional file names. The default directory is
/// `data/geoip`. An `ip2region.xdb` sitting next to the MMDBs is picked up
/// when present.
pub fn resolve_paths(cfg: &ServerConfig) -> GeoPaths {
    let mut paths = GeoPaths {
        city: cfg.geoip_city_db.as_ref().map(PathBuf::from),
        isp: cfg.geoip_isp_db.as_ref().map(PathBuf::from),
        xdb: None,
    };

    let base = cfg
        .geoip_path
        .clone()
        .unwrap_or_else(|| "data/geoip".to_string());

    if base.to_lowercase().ends_with(".mmdb") {
        let file = PathBuf::from(&base);
        if paths.city.is_none() {
            paths.city = Some(file.clone());
        }
        if let Some(dir) = file.parent() {
            paths.xdb = existing(dir.join("ip2region.xdb"));
        }
    } else {
        let dir = PathBuf::from(&base);
        if paths.city.is_none() {
            paths.city = Some(dir.join("GeoLite2-City.mmdb"));
        }
        if paths.isp.is_none() {
            let isp = dir.join("GeoLite2-ISP.mmdb");
            if isp.exists() {
                paths.isp = Some(isp);
            }
        }
        paths.xdb = existing(dir.join("ip2region.xdb"));
    }

    paths
}

fn existing(p: PathBuf) -> Option<PathBuf> {
    p.exists().then_some(p)
}

/// Download the city database from the mirror when the local copy is missing
/// or smaller than the validity heuristic. Failures are logged, not fatal.
pub async fn ensure_city_db(path: &Path, mirror: &str) {
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.len() > MIN_MMDB_BYTES {
            return;
        }
        tracing::warn!(
            "GeoIP city database at {} is only {} bytes, re-downloading",
            path.display(),
            meta.len()
        );
    }

    if let Err(e) = download_city_db(path, mirror).await {
        tracing::warn!("GeoIP download failed: {}", e);
    }
}

async fn download_city_db(path: &Path, mirror: &str) -> Result<(), String> {
    if mirror.is_empty() {
        return Err("geoip download url missing".to_string());
    }
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| e.to_string())?;
    }

    tracing::info!("Downloading GeoIP database from {}", mirror);
    let resp = reqwest::get(mirror).await.map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("geoip download failed: HTTP {}", resp.status()));
    }
    let body = resp.bytes().await.map_err(|e| e.to_string())?;

    // Write to a temp file first so a failed download never clobbers a
    // working database.
    let tmp = path.with_extension("mmdb.tmp");
    std::fs::write(&tmp, &body).map_err(|e| e.to_string())?;
    std::fs::rename(&tmp, path).map_err(|e| e.to_string())?;

    tracing::info!(
        "GeoIP database updated: {} ({} bytes)",
        path.display(),
        body.len()
    );
    Ok(())
}

/// Build the provider from configuration. Returns `None` when no usable
/// database could be opened; enrichment is simply skipped in that case.
pub async fn init_provider(cfg: &ServerConfig) -> Option<Arc<Provider>> {
    let paths = resolve_paths(cfg);

    if let Some(city) = &paths.city {
        ensure_city_db(city, &cfg.geoip_mirror).await;
    }

    match Provider::open(paths.city.as_deref(), paths.isp.as_deref(), paths.xdb.as_deref()) {
        Ok(Some(p)) => {
            tracing::info!("GeoIP enabled: {}", p.describe());
            Some(Arc::new(p))
        }
        Ok(None) => {
            tracing::info!(
                "GeoIP disabled: no database found (set RS_GEOIP_PATH or RS_GEOIP_CITY_DB)"
            );
            None
        }
        Err(e) => {
            tracing::warn!("GeoIP disabled: {}", e);
            None
        }
    }
}
