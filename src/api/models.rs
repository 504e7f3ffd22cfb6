use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Detail level requested from the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Extension {
    #[default]
    Base,
    All,
}

impl Extension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Extension::Base => "base",
            Extension::All => "all",
        }
    }
}

/// A single page request against one rectangular cell
#[derive(Debug, Clone, PartialEq)]
pub struct PoiQuery {
    pub key: String,
    /// Two corners, `left,top|right,bottom`
    pub polygon: String,
    pub keywords: String,
    pub types: String,
    pub extension: Extension,
    pub page: u32,
    pub page_size: u32,
}

/// Raw response body. Every field is optional because the service is known
/// to omit fields on throttled or truncated responses.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PoiResponse {
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub count: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub info: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub infocode: Option<String>,
    #[serde(default)]
    pub pois: Option<Vec<Poi>>,
}

impl PoiResponse {
    pub fn info_code(&self) -> Option<u32> {
        self.infocode.as_deref().and_then(|code| code.trim().parse().ok())
    }

    /// Total matches for the whole cell, not just this page
    pub fn total(&self) -> Option<u32> {
        self.count.as_deref().and_then(|count| count.trim().parse().ok())
    }
}

/// One point of interest as returned by the service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Poi {
    #[serde(default, deserialize_with = "lenient_string")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub name: Option<String>,
    #[serde(default, rename = "type", deserialize_with = "lenient_string")]
    pub kind: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub typecode: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub address: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub location: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub tel: Option<String>,
    #[serde(default, rename = "pname", deserialize_with = "lenient_string")]
    pub province_name: Option<String>,
    #[serde(default, rename = "pcode", deserialize_with = "lenient_string")]
    pub province_code: Option<String>,
    #[serde(default, rename = "cityname", deserialize_with = "lenient_string")]
    pub city_name: Option<String>,
    #[serde(default, rename = "citycode", deserialize_with = "lenient_string")]
    pub city_code: Option<String>,
    #[serde(default, rename = "adname", deserialize_with = "lenient_string")]
    pub ad_name: Option<String>,
    #[serde(default, rename = "adcode", deserialize_with = "lenient_string")]
    pub ad_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub postcode: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub website: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub biz_type: Option<String>,
}

impl Poi {
    /// Longitude and latitude parsed from the `lng,lat` location string
    pub fn lng_lat(&self) -> Option<(f64, f64)> {
        let location = self.location.as_deref()?;
        let (lng, lat) = location.split_once(',')?;
        Some((lng.trim().parse().ok()?, lat.trim().parse().ok()?))
    }
}

/// A successfully classified page
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoiPage {
    /// Matches the service reports for the whole cell
    pub count: u32,
    pub pois: Vec<Poi>,
}

/// Empty values come back as `[]`, numbers sometimes unquoted.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        Some(Value::Array(items)) => {
            let parts: Vec<String> = items
                .into_iter()
                .filter_map(|item| match item {
                    Value::String(s) => Some(s),
                    Value::Null => None,
                    other => Some(other.to_string()),
                })
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(";"))
            }
        }
        Some(other) => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lenient_fields() {
        let body = r#"{
            "status": "1",
            "count": 37,
            "info": "OK",
            "infocode": "10000",
            "pois": [
                {"id": "B0FFG", "name": "Cafe", "tel": [], "location": "114.30,30.59", "biz_type": ["diner", "cafe"]}
            ]
        }"#;

        let response: PoiResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.total(), Some(37));
        assert_eq!(response.info_code(), Some(10000));

        let poi = &response.pois.as_ref().unwrap()[0];
        assert_eq!(poi.tel, None);
        assert_eq!(poi.biz_type.as_deref(), Some("diner;cafe"));
        assert_eq!(poi.lng_lat(), Some((114.30, 30.59)));
    }

    #[test]
    fn test_missing_fields_default_to_none() {
        let response: PoiResponse = serde_json::from_str(r#"{"infocode": "10000"}"#).unwrap();
        assert_eq!(response.status, None);
        assert_eq!(response.pois, None);
        assert_eq!(response.total(), None);
    }

    #[test]
    fn test_bad_location() {
        let poi = Poi {
            location: Some("nowhere".to_string()),
            ..Default::default()
        };
        assert_eq!(poi.lng_lat(), None);
    }
}
