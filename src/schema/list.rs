use serde::{de, Deserialize, Serialize};

use crate::hash::{Ref, SizedRef};

use super::{Stats, TYPE_DIR_ENTRY, TYPE_SIZED_REF};

/// one entry in a directory
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DirEntry {
    pub r#ref: Ref,
    pub name: String,
    #[serde(default, skip_serializing_if = "Stats::is_empty")]
    pub stats: Stats,
}

impl DirEntry {
    /// bytes of raw data transitively referenced by this entry
    pub fn size(&self) -> u64 {
        self.stats.size()
    }

    pub fn count(&self) -> u64 {
        self.stats.count()
    }
}

/// ordered list of refs to entries of a specific element type
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct List {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub elem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<Ref>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<Ref>,
    #[serde(default, skip_serializing_if = "Stats::is_empty")]
    pub stats: Stats,
}

/// an element stored inline in an [`InlineList`]
///
/// inline elements are encoded bare; the list's `elem` field names their
/// type, so decoding is driven by it rather than a per-element tag.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum InlineItem {
    DirEntry(DirEntry),
    SizedRef(SizedRef),
}

impl InlineItem {
    pub fn references(&self) -> Vec<Ref> {
        match self {
            InlineItem::DirEntry(e) => vec![e.r#ref],
            InlineItem::SizedRef(sr) => {
                if sr.r#ref.is_zero() {
                    vec![]
                } else {
                    vec![sr.r#ref]
                }
            }
        }
    }

    /// ref of the blob this element points to
    pub fn data_blob(&self) -> Ref {
        match self {
            InlineItem::DirEntry(e) => e.r#ref,
            InlineItem::SizedRef(sr) => sr.r#ref,
        }
    }

    pub fn as_dir_entry(&self) -> Option<&DirEntry> {
        match self {
            InlineItem::DirEntry(e) => Some(e),
            _ => None,
        }
    }
}

/// list with its elements inlined instead of stored as separate blobs
#[derive(Clone, Debug, PartialEq, Default, Serialize)]
pub struct InlineList {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub elem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#ref: Option<Ref>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub list: Vec<InlineItem>,
    #[serde(default, skip_serializing_if = "Stats::is_empty")]
    pub stats: Stats,
}

impl<'de> Deserialize<'de> for InlineList {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Raw {
            #[serde(default)]
            elem: String,
            #[serde(default)]
            r#ref: Option<Ref>,
            #[serde(default)]
            list: Vec<serde_json::Value>,
            #[serde(default)]
            stats: Stats,
        }
        let raw = Raw::deserialize(deserializer)?;
        let mut list = Vec::with_capacity(raw.list.len());
        for v in raw.list {
            let item = match raw.elem.as_str() {
                TYPE_DIR_ENTRY => {
                    InlineItem::DirEntry(serde_json::from_value(v).map_err(de::Error::custom)?)
                }
                TYPE_SIZED_REF => {
                    InlineItem::SizedRef(serde_json::from_value(v).map_err(de::Error::custom)?)
                }
                other => {
                    return Err(de::Error::custom(format!(
                        "unsupported list element: {other:?}"
                    )))
                }
            };
            list.push(item);
        }
        Ok(InlineList {
            elem: raw.elem,
            r#ref: raw.r#ref,
            list,
            stats: raw.stats,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{decode, encode_to_vec, Object};

    #[test]
    fn test_inline_list_roundtrip() {
        let obj = Object::InlineList(InlineList {
            elem: TYPE_DIR_ENTRY.to_string(),
            r#ref: None,
            list: vec![
                InlineItem::DirEntry(DirEntry {
                    r#ref: Ref::from_bytes(b"a"),
                    name: "a.txt".to_string(),
                    stats: Stats::with_size(1),
                }),
                InlineItem::DirEntry(DirEntry {
                    r#ref: Ref::from_bytes(b"b"),
                    name: "b.txt".to_string(),
                    stats: Stats::with_size(1),
                }),
            ],
            stats: Stats::with_size(2),
        });
        let buf = encode_to_vec(&obj).unwrap();
        // inline elements are encoded without their own @type tag
        assert_eq!(
            String::from_utf8_lossy(&buf).matches("@type").count(),
            1,
            "only the list itself carries a tag"
        );
        assert_eq!(decode(&buf[..]).unwrap(), obj);
    }

    #[test]
    fn test_inline_list_of_sized_refs() {
        let full = Ref::from_bytes(b"full stream");
        let obj = Object::InlineList(InlineList {
            elem: TYPE_SIZED_REF.to_string(),
            r#ref: Some(full),
            list: vec![
                InlineItem::SizedRef(SizedRef::new(Ref::from_bytes(b"c1"), 5)),
                InlineItem::SizedRef(SizedRef::new(Ref::from_bytes(b"c2"), 6)),
            ],
            stats: Stats::with_size(11),
        });
        let buf = encode_to_vec(&obj).unwrap();
        match decode(&buf[..]).unwrap() {
            Object::InlineList(l) => {
                assert_eq!(l.r#ref, Some(full));
                assert_eq!(l.list.len(), 2);
                assert_eq!(l.stats.size(), 11);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_inline_list_rejects_unknown_elem() {
        let buf = b"{\n \"@type\": \"cas:InlineList\",\n \"elem\": \"cas:Nope\",\n \"list\": [{}]\n}\n";
        assert!(decode(&buf[..]).is_err());
    }

    #[test]
    fn test_list_roundtrip() {
        let obj = Object::List(List {
            elem: TYPE_DIR_ENTRY.to_string(),
            r#ref: None,
            list: vec![Ref::from_bytes(b"p1"), Ref::from_bytes(b"p2")],
            stats: Stats::with_size(100),
        });
        let buf = encode_to_vec(&obj).unwrap();
        assert_eq!(decode(&buf[..]).unwrap(), obj);
    }
}
