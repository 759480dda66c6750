//! Reader for the ip2region v2 `.xdb` binary format.
//!
//! Layout: a 256-byte header, a 256x256 vector index (8 bytes per cell:
//! start/end pointers into the segment index), then 14-byte segment entries
//! `{ start_ip: u32, end_ip: u32, data_len: u16, data_ptr: u32 }`, all
//! little-endian. The whole file is held in memory; lookups are lock-free.

use std::io;
use std::net::Ipv4Addr;
use std::path::Path;

const HEADER_LEN: usize = 256;
const VECTOR_CELLS: usize = 256 * 256;
const VECTOR_CELL_LEN: usize = 8;
const SEGMENT_LEN: usize = 14;

pub struct XdbSearcher {
    buf: Vec<u8>,
}

impl XdbSearcher {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let buf = std::fs::read(path)?;
        if buf.len() < HEADER_LEN + VECTOR_CELLS * VECTOR_CELL_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "xdb file too small for header and vector index",
            ));
        }
        Ok(Self { buf })
    }

    #[cfg(test)]
    pub fn from_bytes(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    /// Find the region string for an IPv4 address, e.g.
    /// `中国|0|上海|上海市|电信`. Returns `None` when no segment covers the
    /// address.
    pub fn search(&self, ip: Ipv4Addr) -> Option<String> {
        let ip = u32::from(ip);
        let il0 = (ip >> 24) as usize;
        let il1 = ((ip >> 16) & 0xff) as usize;
        let cell = HEADER_LEN + (il0 * 256 + il1) * VECTOR_CELL_LEN;

        let sptr = self.read_u32(cell)? as usize;
        let eptr = self.read_u32(cell + 4)? as usize;
        if sptr == 0 || eptr < sptr {
            return None;
        }

        let mut low = 0i64;
        let mut high = ((eptr - sptr) / SEGMENT_LEN) as i64;
        while low <= high {
            let mid = (low + high) / 2;
            let p = sptr + (mid as usize) * SEGMENT_LEN;
            let sip = self.read_u32(p)?;
            let eip = self.read_u32(p + 4)?;
            if ip < sip {
                high = mid - 1;
            } else if ip > eip {
                low = mid + 1;
            } else {
                let data_len = self.read_u16(p + 8)? as usize;
                let data_ptr = self.read_u32(p + 10)? as usize;
                let data = self.buf.get(data_ptr..data_ptr + data_len)?;
                return Some(String::from_utf8_lossy(data).into_owned());
            }
        }

        None
    }

    fn read_u16(&self, offset: usize) -> Option<u16> {
        let b = self.buf.get(offset..offset + 2)?;
        Some(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&self, offset: usize) -> Option<u32> {
        let b = self.buf.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// A region string split into its meaningful fields. The stock data format is
/// `国家|区域|省份|城市|ISP`; some builds omit the area field. `0` marks an
/// empty field in both shapes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct XdbRecord {
    pub country: String,
    pub subdiv: String,
    pub city: String,
    pub isp: String,
}

pub fn parse_region(region: &str) -> XdbRecord {
    let parts: Vec<&str> = region.split('|').collect();
    let field = |i: usize| -> String {
        match parts.get(i) {
            Some(&"0") | None => String::new(),
            Some(s) => s.to_string(),
        }
    };

    match parts.len() {
        5.. => XdbRecord {
            country: field(0),
            subdiv: field(2),
            city: field(3),
            isp: field(4),
        },
        4 => XdbRecord {
            country: field(0),
            subdiv: field(1),
            city: field(2),
            isp: field(3),
        },
        _ => XdbRecord {
            country: field(0),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal xdb image holding one segment for 1.2.0.0/16.
    fn synthetic_xdb(region: &str) -> Vec<u8> {
        let vector_end = HEADER_LEN + VECTOR_CELLS * VECTOR_CELL_LEN;
        let seg_ptr = vector_end;
        let data_ptr = seg_ptr + SEGMENT_LEN;

        let mut buf = vec![0u8; data_ptr + region.len()];

        // vector cell for 1.2.x.x
        let cell = HEADER_LEN + (1 * 256 + 2) * VECTOR_CELL_LEN;
        buf[cell..cell + 4].copy_from_slice(&(seg_ptr as u32).to_le_bytes());
        buf[cell + 4..cell + 8].copy_from_slice(&(seg_ptr as u32).to_le_bytes());

        // one segment: 1.2.0.0 - 1.2.255.255
        let sip = u32::from(Ipv4Addr::new(1, 2, 0, 0));
        let eip = u32::from(Ipv4Addr::new(1, 2, 255, 255));
        buf[seg_ptr..seg_ptr + 4].copy_from_slice(&sip.to_le_bytes());
        buf[seg_ptr + 4..seg_ptr + 8].copy_from_slice(&eip.to_le_bytes());
        buf[seg_ptr + 8..seg_ptr + 10].copy_from_slice(&(region.len() as u16).to_le_bytes());
        buf[seg_ptr + 10..seg_ptr + 14].copy_from_slice(&(data_ptr as u32).to_le_bytes());

        buf[data_ptr..].copy_from_slice(region.as_bytes());
        buf
    }

    #[test]
    fn test_search_hit_and_miss() {
        let region = "中国|0|上海|上海市|电信";
        let searcher = XdbSearcher::from_bytes(synthetic_xdb(region));

        let hit = searcher.search(Ipv4Addr::new(1, 2, 3, 4)).unwrap();
        assert_eq!(hit, region);

        assert!(searcher.search(Ipv4Addr::new(9, 9, 9, 9)).is_none());
    }

    #[test]
    fn test_parse_region_five_fields() {
        let rec = parse_region("中国|0|上海|上海市|电信");
        assert_eq!(rec.country, "中国");
        assert_eq!(rec.subdiv, "上海");
        assert_eq!(rec.city, "上海市");
        assert_eq!(rec.isp, "电信");
    }

    #[test]
    fn test_parse_region_four_fields() {
        let rec = parse_region("中国|广东|深圳市|联通");
        assert_eq!(rec.country, "中国");
        assert_eq!(rec.subdiv, "广东");
        assert_eq!(rec.city, "深圳市");
        assert_eq!(rec.isp, "联通");
    }

    #[test]
    fn test_parse_region_zero_means_empty() {
        let rec = parse_region("美国|0|0|0|0");
        assert_eq!(rec.country, "美国");
        assert!(rec.subdiv.is_empty());
        assert!(rec.city.is_empty());
        assert!(rec.isp.is_empty());
    }
}
