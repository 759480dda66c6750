//! The GeoIP provider: IP string in, `Location` out.

use maxminddb::{geoip2, Reader};
use serde::Serialize;
use std::net::IpAddr;
use std::path::Path;
use thiserror::Error;

use super::china;
use super::xdb::{self, XdbRecord, XdbSearcher};

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("invalid IP: {0}")]
    InvalidIp(String),
    #[error("failed to open database: {0}")]
    Open(String),
}

/// Resolved location attributes. Primary name fields carry Chinese with an
/// English fallback; the `*_en` fields always carry English when known. Any
/// field the databases cannot resolve stays empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Location {
    pub city: String,
    pub city_en: String,
    pub subdiv: String,
    pub subdiv_en: String,
    pub country: String,
    pub country_en: String,
    pub iso_code: String,
    pub isp: String,
    pub latitude: f64,
    pub longitude: f64,
    /// "city", "subdivision", "country" or "none"
    pub precision: String,
}

/// Chinese names for common country codes, used with the DB-IP layout which
/// is English-only.
static COUNTRY_CODE_TO_CHINESE: &[(&str, &str)] = &[
    ("CN", "中国"),
    ("US", "美国"),
    ("JP", "日本"),
    ("KR", "韩国"),
    ("DE", "德国"),
    ("FR", "法国"),
    ("GB", "英国"),
    ("RU", "俄罗斯"),
    ("SG", "新加坡"),
    ("HK", "香港"),
    ("TW", "台湾"),
    ("AU", "澳大利亚"),
    ("CA", "加拿大"),
    ("NL", "荷兰"),
    ("IN", "印度"),
    ("BR", "巴西"),
];

fn chinese_country_name(code: &str) -> Option<&'static str> {
    COUNTRY_CODE_TO_CHINESE
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, n)| *n)
}

/// City database layout, detected from the MMDB metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
enum CityLayout {
    /// GeoLite2-City / GeoIP2-City: nested localized `names` maps.
    MaxMind,
    /// DB-IP and everything else: flat English-only fields.
    DbIp,
}

/// DB-IP City Lite record shape.
#[derive(serde::Deserialize)]
struct DbIpRecord<'a> {
    #[serde(default)]
    city: Option<&'a str>,
    #[serde(default)]
    state1: Option<&'a str>,
    #[serde(default)]
    country_code: Option<&'a str>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
}

pub struct Provider {
    city: Option<(Reader<Vec<u8>>, CityLayout)>,
    isp: Option<Reader<Vec<u8>>>,
    xdb: Option<XdbSearcher>,
}

impl Provider {
    /// Open whichever databases exist. Missing files are skipped; a city
    /// database that exists but cannot be parsed is an error. Returns
    /// `Ok(None)` when nothing usable was found.
    pub fn open(
        city_path: Option<&Path>,
        isp_path: Option<&Path>,
        xdb_path: Option<&Path>,
    ) -> Result<Option<Self>, GeoError> {
        let city = match city_path {
            Some(p) if p.exists() => {
                let reader = Reader::open_readfile(p)
                    .map_err(|e| GeoError::Open(format!("{}: {}", p.display(), e)))?;
                let layout = match reader.metadata.database_type.as_str() {
                    "GeoLite2-City" | "GeoIP2-City" => CityLayout::MaxMind,
                    _ => CityLayout::DbIp,
                };
                Some((reader, layout))
            }
            _ => None,
        };

        let isp = match isp_path {
            Some(p) if p.exists() => match Reader::open_readfile(p) {
                Ok(r) => Some(r),
                Err(e) => {
                    tracing::warn!("GeoIP ISP database unusable ({}): {}", p.display(), e);
                    None
                }
            },
            _ => None,
        };

        let xdb = match xdb_path {
            Some(p) if p.exists() => match XdbSearcher::open(p) {
                Ok(x) => Some(x),
                Err(e) => {
                    tracing::warn!("ip2region database unusable ({}): {}", p.display(), e);
                    None
                }
            },
            _ => None,
        };

        if city.is_none() && isp.is_none() && xdb.is_none() {
            return Ok(None);
        }
        Ok(Some(Self { city, isp, xdb }))
    }

    pub fn describe(&self) -> String {
        format!(
            "city={} isp={} xdb={}",
            self.city.is_some(),
            self.isp.is_some(),
            self.xdb.is_some()
        )
    }

    /// Resolve an IP string. Only unparseable input is an error; unresolvable
    /// fields come back empty.
    ///
    /// ip2region wins for China IPs (its city-level accuracy for Chinese
    /// networks exceeds MMDB); sources are never mixed within one record.
    pub fn lookup(&self, ip_str: &str) -> Result<Location, GeoError> {
        let ip: IpAddr = ip_str
            .trim()
            .parse()
            .map_err(|_| GeoError::InvalidIp(ip_str.to_string()))?;

        if let (Some(searcher), IpAddr::V4(v4)) = (&self.xdb, ip) {
            if let Some(region) = searcher.search(v4) {
                let record = xdb::parse_region(&region);
                if record.country == "中国" {
                    return Ok(location_from_xdb(record));
                }
            }
        }

        let mut loc = Location::default();

        if let Some((reader, layout)) = &self.city {
            match layout {
                CityLayout::MaxMind => fill_from_maxmind(&mut loc, reader, ip),
                CityLayout::DbIp => fill_from_dbip(&mut loc, reader, ip),
            }
        }
        loc.precision = derive_precision(&loc).to_string();

        if let Some(reader) = &self.isp {
            if let Ok(record) = reader.lookup::<geoip2::Isp>(ip) {
                loc.isp = record
                    .organization
                    .or(record.isp)
                    .unwrap_or_default()
                    .to_string();
            }
        }

        Ok(loc)
    }
}

fn fill_from_maxmind(loc: &mut Location, reader: &Reader<Vec<u8>>, ip: IpAddr) {
    let record: geoip2::City = match reader.lookup(ip) {
        Ok(r) => r,
        Err(_) => return,
    };

    if let Some(names) = record.city.as_ref().and_then(|c| c.names.as_ref()) {
        loc.city_en = names.get("en").copied().unwrap_or_default().to_string();
        loc.city = names
            .get("zh-CN")
            .copied()
            .unwrap_or_default()
            .to_string();
        if loc.city.is_empty() {
            loc.city = loc.city_en.clone();
        }
    }

    if let Some(sub) = record
        .subdivisions
        .as_ref()
        .and_then(|s| s.first())
        .and_then(|s| s.names.as_ref())
    {
        loc.subdiv_en = sub.get("en").copied().unwrap_or_default().to_string();
        loc.subdiv = sub.get("zh-CN").copied().unwrap_or_default().to_string();
        if loc.subdiv.is_empty() {
            loc.subdiv = loc.subdiv_en.clone();
        }
    }

    if let Some(country) = record.country.as_ref() {
        if let Some(names) = country.names.as_ref() {
            loc.country_en = names.get("en").copied().unwrap_or_default().to_string();
            loc.country = names
                .get("zh-CN")
                .copied()
                .unwrap_or_default()
                .to_string();
            if loc.country.is_empty() {
                loc.country = loc.country_en.clone();
            }
        }
        loc.iso_code = country.iso_code.unwrap_or_default().to_string();
    }

    if let Some(location) = record.location.as_ref() {
        loc.latitude = location.latitude.unwrap_or(0.0);
        loc.longitude = location.longitude.unwrap_or(0.0);
    }
}

fn fill_from_dbip(loc: &mut Location, reader: &Reader<Vec<u8>>, ip: IpAddr) {
    let record: DbIpRecord = match reader.lookup(ip) {
        Ok(r) => r,
        Err(_) => return,
    };

    loc.city_en = record.city.unwrap_or_default().to_string();
    loc.city = loc.city_en.clone();

    loc.subdiv_en = record.state1.unwrap_or_default().to_string();
    loc.subdiv = loc.subdiv_en.clone();

    let code = record.country_code.unwrap_or_default();
    loc.iso_code = code.to_string();
    loc.country_en = code.to_string();
    loc.country = chinese_country_name(code)
        .map(str::to_string)
        .unwrap_or_else(|| code.to_string());

    loc.latitude = record.latitude.unwrap_or(0.0);
    loc.longitude = record.longitude.unwrap_or(0.0);
}

fn location_from_xdb(record: XdbRecord) -> Location {
    let mut loc = Location {
        country: "中国".to_string(),
        country_en: "China".to_string(),
        iso_code: "CN".to_string(),
        subdiv: record.subdiv.clone(),
        city: record.city.clone(),
        isp: record.isp,
        ..Default::default()
    };
    if let Some((lat, lon)) = china::coords_for(&record.city, &record.subdiv) {
        loc.latitude = lat;
        loc.longitude = lon;
    }
    loc.precision = derive_precision(&loc).to_string();
    loc
}

fn derive_precision(loc: &Location) -> &'static str {
    if !loc.city.is_empty() || !loc.city_en.is_empty() {
        "city"
    } else if !loc.subdiv.is_empty() || !loc.subdiv_en.is_empty() {
        "subdivision"
    } else if !loc.country.is_empty() || !loc.country_en.is_empty() {
        "country"
    } else {
        "none"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_ip_is_the_only_error() {
        let provider = Provider {
            city: None,
            isp: None,
            xdb: None,
        };
        assert!(matches!(
            provider.lookup("not-an-ip"),
            Err(GeoError::InvalidIp(_))
        ));
        // no databases: empty location, precision "none"
        let loc = provider.lookup("8.8.8.8").unwrap();
        assert_eq!(loc.precision, "none");
        assert!(loc.city.is_empty());
    }

    #[test]
    fn test_location_from_xdb_city_precision() {
        let loc = location_from_xdb(XdbRecord {
            country: "中国".to_string(),
            subdiv: "上海".to_string(),
            city: "上海市".to_string(),
            isp: "电信".to_string(),
        });
        assert_eq!(loc.country, "中国");
        assert_eq!(loc.country_en, "China");
        assert_eq!(loc.iso_code, "CN");
        assert_eq!(loc.isp, "电信");
        assert_eq!(loc.precision, "city");
        assert!((loc.latitude - 31.2304).abs() < 1e-6);
        // ip2region has no English city/subdiv names
        assert!(loc.city_en.is_empty());
    }

    #[test]
    fn test_location_from_xdb_subdivision_precision() {
        let loc = location_from_xdb(XdbRecord {
            country: "中国".to_string(),
            subdiv: "广东".to_string(),
            city: String::new(),
            isp: String::new(),
        });
        assert_eq!(loc.precision, "subdivision");
        assert!(loc.latitude > 0.0);
    }

    #[test]
    fn test_derive_precision_ladder() {
        let mut loc = Location::default();
        assert_eq!(derive_precision(&loc), "none");
        loc.country_en = "Germany".to_string();
        assert_eq!(derive_precision(&loc), "country");
        loc.subdiv = "Hessen".to_string();
        assert_eq!(derive_precision(&loc), "subdivision");
        loc.city = "Frankfurt".to_string();
        assert_eq!(derive_precision(&loc), "city");
    }

    #[test]
    fn test_chinese_country_names() {
        assert_eq!(chinese_country_name("US"), Some("美国"));
        assert_eq!(chinese_country_name("XX"), None);
    }
}
