use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::hash::{Ref, SizedRef};

/// an HTTP header or trailer block
///
/// single-valued headers encode as a bare string, multi-valued ones as an
/// array. keys are kept sorted so encoded requests are canonical.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Header(pub BTreeMap<String, Vec<String>>);

impl Header {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// first value for a key, if any
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.first()).map(|s| s.as_str())
    }

    pub fn values(&self, key: &str) -> &[String] {
        self.0.get(key).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.0.insert(key.to_string(), vec![value.to_string()]);
    }

    pub fn append(&mut self, key: &str, value: &str) {
        self.0
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }
}

impl Serialize for Header {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut m = serializer.serialize_map(Some(self.0.len()))?;
        for (k, arr) in &self.0 {
            match arr.len() {
                0 => m.serialize_entry(k, &Option::<String>::None)?,
                1 => m.serialize_entry(k, &arr[0])?,
                _ => m.serialize_entry(k, arr)?,
            }
        }
        m.end()
    }
}

impl<'de> Deserialize<'de> for Header {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
            None,
        }
        let raw: BTreeMap<String, OneOrMany> = BTreeMap::deserialize(deserializer)?;
        let mut out = BTreeMap::new();
        for (k, v) in raw {
            let arr = match v {
                OneOrMany::One(s) => vec![s],
                OneOrMany::Many(a) => a,
                OneOrMany::None => vec![],
            };
            out.insert(k, arr);
        }
        Ok(Header(out))
    }
}

/// a captured HTTP request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub url: Url,
    #[serde(default, skip_serializing_if = "Header::is_empty")]
    pub header: Header,
    #[serde(default)]
    pub body: SizedRef,
    #[serde(default, skip_serializing_if = "Header::is_empty")]
    pub trailer: Header,
}

/// a captured HTTP response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Header::is_empty")]
    pub header: Header,
    #[serde(default)]
    pub body: SizedRef,
    #[serde(default, skip_serializing_if = "Header::is_empty")]
    pub trailer: Header,
}

/// binds a response to a specific request
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub request: Ref,
    pub response: Ref,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{decode, encode_to_vec, Object};

    #[test]
    fn test_header_one_or_many() {
        let mut h = Header::default();
        h.set("Accept", "text/html");
        h.append("X-Multi", "a");
        h.append("X-Multi", "b");

        let json = serde_json::to_string(&h).unwrap();
        assert!(json.contains("\"Accept\":\"text/html\""));
        assert!(json.contains("\"X-Multi\":[\"a\",\"b\"]"));

        let back: Header = serde_json::from_str(&json).unwrap();
        assert_eq!(h, back);
    }

    #[test]
    fn test_request_roundtrip() {
        let mut header = Header::default();
        header.set("Accept", "*/*");
        let obj = Object::HttpRequest(Request {
            method: "GET".to_string(),
            url: Url::parse("https://example.com/x?q=1").unwrap(),
            header,
            body: SizedRef::new(Ref::empty(), 0),
            trailer: Header::default(),
        });
        let buf = encode_to_vec(&obj).unwrap();
        assert_eq!(decode(&buf[..]).unwrap(), obj);
    }

    #[test]
    fn test_session_roundtrip() {
        let obj = Object::HttpSession(Session {
            request: Ref::from_bytes(b"req"),
            response: Ref::from_bytes(b"resp"),
        });
        let buf = encode_to_vec(&obj).unwrap();
        assert_eq!(decode(&buf[..]).unwrap(), obj);
    }
}
