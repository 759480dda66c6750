//! Embedded coordinate table for Chinese provinces and major cities.
//!
//! The ip2region data carries no coordinates, so China-resolved records get
//! theirs from this table. Lookup order: `city + "市"`, `city`,
//! `subdiv + "省"`, `subdiv`.

/// (name, latitude, longitude)
static CHINA_COORDS: &[(&str, f64, f64)] = &[
    // Municipalities & SARs
    ("北京市", 39.9042, 116.4074),
    ("上海市", 31.2304, 121.4737),
    ("天津市", 39.3434, 117.3616),
    ("重庆市", 29.4316, 106.9123),
    ("香港", 22.3193, 114.1694),
    ("澳门", 22.1987, 113.5439),
    // Provinces (capital coordinates)
    ("河北省", 38.0428, 114.5149),
    ("山西省", 37.8706, 112.5489),
    ("辽宁省", 41.8057, 123.4315),
    ("吉林省", 43.8868, 125.3245),
    ("黑龙江省", 45.8038, 126.5349),
    ("江苏省", 32.0603, 118.7969),
    ("浙江省", 30.2741, 120.1551),
    ("安徽省", 31.8612, 117.2857),
    ("福建省", 26.0745, 119.2965),
    ("江西省", 28.6820, 115.8579),
    ("山东省", 36.6512, 117.1201),
    ("河南省", 34.7466, 113.6254),
    ("湖北省", 30.5928, 114.3055),
    ("湖南省", 28.2282, 112.9388),
    ("广东省", 23.1291, 113.2644),
    ("海南省", 20.0440, 110.1999),
    ("四川省", 30.5728, 104.0668),
    ("贵州省", 26.6470, 106.6302),
    ("云南省", 25.0389, 102.7183),
    ("陕西省", 34.3416, 108.9398),
    ("甘肃省", 36.0611, 103.8343),
    ("青海省", 36.6171, 101.7782),
    ("台湾省", 25.0330, 121.5654),
    // Autonomous regions
    ("内蒙古", 40.8424, 111.7490),
    ("广西", 22.8170, 108.3665),
    ("西藏", 29.6520, 91.1721),
    ("宁夏", 38.4872, 106.2309),
    ("新疆", 43.8256, 87.6168),
    // Major cities
    ("广州市", 23.1291, 113.2644),
    ("深圳市", 22.5431, 114.0579),
    ("杭州市", 30.2741, 120.1551),
    ("南京市", 32.0603, 118.7969),
    ("苏州市", 31.2989, 120.5853),
    ("无锡市", 31.4912, 120.3119),
    ("成都市", 30.5728, 104.0668),
    ("武汉市", 30.5928, 114.3055),
    ("西安市", 34.3416, 108.9398),
    ("郑州市", 34.7466, 113.6254),
    ("长沙市", 28.2282, 112.9388),
    ("合肥市", 31.8612, 117.2857),
    ("福州市", 26.0745, 119.2965),
    ("厦门市", 24.4798, 118.0894),
    ("济南市", 36.6512, 117.1201),
    ("青岛市", 36.0671, 120.3826),
    ("大连市", 38.9140, 121.6147),
    ("沈阳市", 41.8057, 123.4315),
    ("哈尔滨市", 45.8038, 126.5349),
    ("长春市", 43.8868, 125.3245),
    ("石家庄市", 38.0428, 114.5149),
    ("太原市", 37.8706, 112.5489),
    ("昆明市", 25.0389, 102.7183),
    ("贵阳市", 26.6470, 106.6302),
    ("南宁市", 22.8170, 108.3665),
    ("南昌市", 28.6820, 115.8579),
    ("兰州市", 36.0611, 103.8343),
    ("西宁市", 36.6171, 101.7782),
    ("银川市", 38.4872, 106.2309),
    ("乌鲁木齐市", 43.8256, 87.6168),
    ("拉萨市", 29.6520, 91.1721),
    ("呼和浩特市", 40.8424, 111.7490),
    ("海口市", 20.0440, 110.1999),
    ("三亚市", 18.2528, 109.5119),
    ("东莞市", 23.0207, 113.7518),
    ("佛山市", 23.0218, 113.1219),
    ("珠海市", 22.2707, 113.5767),
    ("宁波市", 29.8683, 121.5440),
    ("温州市", 27.9938, 120.6994),
    ("徐州市", 34.2044, 117.2857),
    ("烟台市", 37.4638, 121.4479),
    ("唐山市", 39.6305, 118.1804),
    ("泉州市", 24.8741, 118.6757),
];

fn exact(name: &str) -> Option<(f64, f64)> {
    CHINA_COORDS
        .iter()
        .find(|(n, _, _)| *n == name)
        .map(|(_, lat, lon)| (*lat, *lon))
}

/// Resolve coordinates for a China record, trying the city first and falling
/// back to the province.
pub fn coords_for(city: &str, subdiv: &str) -> Option<(f64, f64)> {
    if !city.is_empty() {
        if let Some(c) = exact(&format!("{}市", city)) {
            return Some(c);
        }
        if let Some(c) = exact(city) {
            return Some(c);
        }
    }
    if !subdiv.is_empty() {
        if let Some(c) = exact(&format!("{}省", subdiv)) {
            return Some(c);
        }
        if let Some(c) = exact(subdiv) {
            return Some(c);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_city_with_suffix() {
        // city stored without the 市 suffix resolves via city+"市"
        let (lat, lon) = coords_for("上海", "上海").unwrap();
        assert!((lat - 31.2304).abs() < 1e-6);
        assert!((lon - 121.4737).abs() < 1e-6);
    }

    #[test]
    fn test_city_exact() {
        assert!(coords_for("深圳市", "广东").is_some());
    }

    #[test]
    fn test_province_fallback() {
        // unknown city falls back to subdiv+"省"
        let (lat, _) = coords_for("不存在的城市", "广东").unwrap();
        assert!((lat - 23.1291).abs() < 1e-6);
    }

    #[test]
    fn test_autonomous_region_without_suffix() {
        assert!(coords_for("", "新疆").is_some());
    }

    #[test]
    fn test_unknown_yields_none() {
        assert!(coords_for("Nowhere", "Nothing").is_none());
    }
}
