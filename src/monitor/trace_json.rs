//! Canonical trace payload: serialization, GeoIP enrichment and locale swap.
//!
//! The payload written to `trace_json` is returned verbatim by the trace
//! endpoint, so its shape is a wire contract.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::geoip::Provider;
use crate::probe::{MtrResult, TraceResult};

fn is_zero(v: &f64) -> bool {
    *v == 0.0
}

/// One enriched hop of the stored trace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceHop {
    pub hop: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    pub ip: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub latency_last_ms: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub latency_avg_ms: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub latency_best_ms: f64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub latency_worst_ms: f64,
    pub loss: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub asn: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub city: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subdiv: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub city_en: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subdiv_en: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub country_en: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub isp: String,
    #[serde(rename = "lat", default, skip_serializing_if = "is_zero")]
    pub latitude: f64,
    #[serde(rename = "lon", default, skip_serializing_if = "is_zero")]
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub geo_precision: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TracePayload {
    pub target: String,
    pub truncated: bool,
    pub hops: Vec<TraceHop>,
}

/// Serialize an MTR result into the canonical payload, resolving hop
/// hostnames and attaching geo attributes.
pub async fn from_mtr(res: &MtrResult, truncated: bool, geo: Option<&Provider>) -> Vec<u8> {
    let mut hops = Vec::with_capacity(res.hops.len());
    for h in &res.hops {
        let ip = resolve_ip(&h.host).await;
        let mut hop = TraceHop {
            hop: h.hop,
            host: h.host.clone(),
            ip,
            latency_last_ms: h.last,
            latency_avg_ms: h.avg,
            latency_best_ms: h.best,
            latency_worst_ms: h.worst,
            loss: h.loss,
            asn: h.asn.clone(),
            ..Default::default()
        };
        enrich_hop(&mut hop, geo);
        hops.push(hop);
    }

    let payload = TracePayload {
        target: res.target.clone(),
        truncated,
        hops,
    };
    serde_json::to_vec(&payload).unwrap_or_else(|_| b"[]".to_vec())
}

/// Serialize a classical traceroute result into the canonical payload.
pub async fn from_traceroute(res: &TraceResult, geo: Option<&Provider>) -> Vec<u8> {
    let mut hops = Vec::with_capacity(res.hops.len());
    for h in &res.hops {
        let mut hop = TraceHop {
            hop: h.hop,
            ip: h.ip.clone(),
            latency_last_ms: h.latency.as_secs_f64() * 1000.0,
            loss: h.loss,
            ..Default::default()
        };
        enrich_hop(&mut hop, geo);
        hops.push(hop);
    }

    let payload = TracePayload {
        target: res.target.clone(),
        truncated: false,
        hops,
    };
    serde_json::to_vec(&payload).unwrap_or_else(|_| b"[]".to_vec())
}

fn enrich_hop(hop: &mut TraceHop, geo: Option<&Provider>) {
    let Some(provider) = geo else { return };
    if hop.ip.is_empty() || hop.ip == "*" {
        return;
    }
    if let Ok(loc) = provider.lookup(&hop.ip) {
        hop.city = loc.city;
        hop.subdiv = loc.subdiv;
        hop.country = loc.country;
        hop.city_en = loc.city_en;
        hop.subdiv_en = loc.subdiv_en;
        hop.country_en = loc.country_en;
        hop.isp = loc.isp;
        hop.latitude = loc.latitude;
        hop.longitude = loc.longitude;
        hop.geo_precision = loc.precision;
    }
}

/// Resolve an MTR host column to an address usable for enrichment. Literals
/// and the `*` placeholder pass through; hostnames resolve with IPv4
/// preference, falling back to the name itself.
async fn resolve_ip(host: &str) -> String {
    if host.is_empty() || host == "*" {
        return host.to_string();
    }
    if host.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }

    match tokio::net::lookup_host(format!("{}:0", host)).await {
        Ok(addrs) => {
            let addrs: Vec<_> = addrs.collect();
            addrs
                .iter()
                .find(|sa| sa.is_ipv4())
                .or_else(|| addrs.first())
                .map(|sa| sa.ip().to_string())
                .unwrap_or_else(|| host.to_string())
        }
        Err(_) => host.to_string(),
    }
}

/// Substitute the localized name fields with their English counterparts
/// where present. Unknown payloads pass through untouched; the operation is
/// idempotent.
pub fn localize_trace_en(raw: &[u8]) -> Vec<u8> {
    let mut payload: serde_json::Value = match serde_json::from_slice(raw) {
        Ok(v) => v,
        Err(_) => return raw.to_vec(),
    };

    if let Some(hops) = payload.get_mut("hops").and_then(|h| h.as_array_mut()) {
        for hop in hops {
            let Some(obj) = hop.as_object_mut() else { continue };
            for (field, en_field) in [
                ("city", "city_en"),
                ("subdiv", "subdiv_en"),
                ("country", "country_en"),
            ] {
                let en = obj
                    .get(en_field)
                    .and_then(|v| v.as_str())
                    .filter(|s| !s.is_empty())
                    .map(str::to_string);
                if let Some(en) = en {
                    obj.insert(field.to_string(), serde_json::Value::String(en));
                }
            }
        }
    }

    serde_json::to_vec(&payload).unwrap_or_else(|_| raw.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::MtrHop;

    fn mtr_result() -> MtrResult {
        MtrResult {
            target: "8.8.8.8".to_string(),
            hops: vec![
                MtrHop {
                    hop: 1,
                    host: "192.168.1.1".to_string(),
                    last: 0.5,
                    avg: 0.6,
                    best: 0.4,
                    worst: 1.0,
                    loss: 0.0,
                    asn: String::new(),
                },
                MtrHop {
                    hop: 2,
                    host: "*".to_string(),
                    loss: 100.0,
                    ..Default::default()
                },
            ],
        }
    }

    #[tokio::test]
    async fn test_from_mtr_canonical_shape() {
        let bytes = from_mtr(&mtr_result(), true, None).await;
        let payload: serde_json::Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(payload["target"], "8.8.8.8");
        assert_eq!(payload["truncated"], true);
        let hops = payload["hops"].as_array().unwrap();
        assert_eq!(hops.len(), 2);
        assert_eq!(hops[0]["ip"], "192.168.1.1");
        assert_eq!(hops[0]["latency_avg_ms"], 0.6);
        // zero/empty optionals are omitted
        assert!(hops[1].get("latency_avg_ms").is_none());
        assert!(hops[1].get("asn").is_none());
        assert_eq!(hops[1]["loss"], 100.0);
        assert_eq!(hops[1]["ip"], "*");
    }

    #[tokio::test]
    async fn test_payload_roundtrips_through_model() {
        let bytes = from_mtr(&mtr_result(), false, None).await;
        let payload: TracePayload = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(payload.hops.len(), 2);
        assert!(!payload.truncated);
    }

    #[test]
    fn test_localize_swaps_when_english_present() {
        let raw = r#"{"target":"t","truncated":false,"hops":[
            {"hop":1,"ip":"1.2.3.4","loss":0,
             "city":"上海","city_en":"Shanghai",
             "subdiv":"上海","subdiv_en":"Shanghai",
             "country":"中国","country_en":"China"}
        ]}"#.as_bytes();
        let localized = localize_trace_en(raw);
        let payload: serde_json::Value = serde_json::from_slice(&localized).unwrap();
        let hop = &payload["hops"][0];
        assert_eq!(hop["city"], "Shanghai");
        assert_eq!(hop["subdiv"], "Shanghai");
        assert_eq!(hop["country"], "China");
        // English fields are kept so the swap stays reversible upstream
        assert_eq!(hop["city_en"], "Shanghai");
    }

    #[test]
    fn test_localize_keeps_fields_without_english() {
        let raw = r#"{"target":"t","truncated":false,"hops":[
            {"hop":1,"ip":"1.2.3.4","loss":0,"city":"北京"}
        ]}"#.as_bytes();
        let localized = localize_trace_en(raw);
        let payload: serde_json::Value = serde_json::from_slice(&localized).unwrap();
        assert_eq!(payload["hops"][0]["city"], "北京");
    }

    #[test]
    fn test_localize_idempotent() {
        let raw = r#"{"target":"t","truncated":false,"hops":[
            {"hop":1,"ip":"1.2.3.4","loss":0,"city":"上海","city_en":"Shanghai"}
        ]}"#.as_bytes();
        let once = localize_trace_en(raw);
        let twice = localize_trace_en(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_localize_passes_garbage_through() {
        let raw = b"not json at all";
        assert_eq!(localize_trace_en(raw), raw.to_vec());
    }
}
