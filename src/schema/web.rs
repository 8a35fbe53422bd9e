use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::hash::{is_zero_u64, Ref};

/// a captured HTTP body together with its provenance
///
/// `ts` mirrors the server's `Last-Modified` when one was sent; it is left
/// out otherwise so that refetches of unchanged content encode to the same
/// blob.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebContent {
    pub url: String,
    pub r#ref: Ref,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub etag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{decode, encode_to_vec, Object};

    #[test]
    fn test_web_content_roundtrip() {
        let obj = Object::WebContent(WebContent {
            url: "https://example.com/x".to_string(),
            r#ref: Ref::from_bytes(b"body"),
            size: 4,
            etag: "abc".to_string(),
            ts: None,
        });
        let buf = encode_to_vec(&obj).unwrap();
        assert_eq!(decode(&buf[..]).unwrap(), obj);
        // absent ts is omitted entirely
        assert!(!String::from_utf8_lossy(&buf).contains("\"ts\""));
    }

    #[test]
    fn test_web_content_ts_rfc3339() {
        let ts: DateTime<Utc> = "2020-01-02T03:04:05Z".parse().unwrap();
        let obj = Object::WebContent(WebContent {
            url: "https://example.com/y".to_string(),
            r#ref: Ref::from_bytes(b"body"),
            size: 4,
            etag: String::new(),
            ts: Some(ts),
        });
        let buf = encode_to_vec(&obj).unwrap();
        assert!(String::from_utf8_lossy(&buf).contains("2020-01-02T03:04:05Z"));
        assert_eq!(decode(&buf[..]).unwrap(), obj);
    }
}
