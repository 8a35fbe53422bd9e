//! tagged JSON schema envelope
//!
//! a schema blob is an ordinary blob whose bytes begin with the magic
//! prefix and decode to a JSON object carrying a `@type` field. the bytes
//! produced by [`encode`] are exactly the bytes hashed to form the ref, so
//! encoding is deterministic: one-space indentation, canonical (sorted) map
//! keys, no HTML escaping and a single trailing newline.

mod file;
mod http;
mod list;
mod pipeline;
mod web;

use std::collections::BTreeMap;
use std::io::{self, Read};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{Pin, Ref, SchemaRef, SizedRef};

pub use file::{Compressed, Multipart};
pub use http::{Header, Request, Response, Session};
pub use list::{DirEntry, InlineItem, InlineList, List};
pub use pipeline::TransformOp;
pub use web::WebContent;

/// magic prefix shared by every schema blob
pub const MAGIC: &[u8] = b"{\n \"@type\":";

/// length of [`MAGIC`]; the cheap sniff reads exactly this many bytes
pub const MAGIC_SIZE: usize = MAGIC.len();

/// upper bound that guards the schema parser
pub const MAX_SCHEMA_SIZE: u64 = 16 * 1024 * 1024;

pub const TYPE_DIR_ENTRY: &str = "cas:DirEntry";
pub const TYPE_LIST: &str = "cas:List";
pub const TYPE_INLINE_LIST: &str = "cas:InlineList";
pub const TYPE_SIZED_REF: &str = "cas:SizedRef";
pub const TYPE_SCHEMA_REF: &str = "cas:SchemaRef";
pub const TYPE_PIN: &str = "cas:Pin";
pub const TYPE_WEB_CONTENT: &str = "cas:WebContent";
pub const TYPE_COMPRESSED: &str = "cas:Compressed";
pub const TYPE_TRANSFORM_OP: &str = "cas:TransformOp";
pub const TYPE_MULTIPART: &str = "cas:Multipart";
pub const TYPE_HTTP_REQUEST: &str = "http:Request";
pub const TYPE_HTTP_RESPONSE: &str = "http:Response";
pub const TYPE_HTTP_SESSION: &str = "http:Session";
pub const TYPE_LOCAL_DIR_CONFIG: &str = "cas:LocalDirConfig";
pub const TYPE_HTTP_CLIENT_CONFIG: &str = "cas:HTTPClientConfig";

const KNOWN_TYPES: &[&str] = &[
    TYPE_DIR_ENTRY,
    TYPE_LIST,
    TYPE_INLINE_LIST,
    TYPE_SIZED_REF,
    TYPE_SCHEMA_REF,
    TYPE_PIN,
    TYPE_WEB_CONTENT,
    TYPE_COMPRESSED,
    TYPE_TRANSFORM_OP,
    TYPE_MULTIPART,
    TYPE_HTTP_REQUEST,
    TYPE_HTTP_RESPONSE,
    TYPE_HTTP_SESSION,
    TYPE_LOCAL_DIR_CONFIG,
    TYPE_HTTP_CLIENT_CONFIG,
];

/// checks if a type name belongs to the registry
pub fn known_type(typ: &str) -> bool {
    KNOWN_TYPES.contains(&typ)
}

/// string-keyed counters carried by lists and directory entries
///
/// advisory and recomputable; `size` accumulates raw bytes transitively
/// referenced, `cnt` accumulates object counts. keys stay sorted so the
/// encoded form is stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stats(pub BTreeMap<String, u64>);

impl Stats {
    pub const DATA_SIZE: &'static str = "size";
    pub const DATA_COUNT: &'static str = "cnt";

    pub fn with_size(size: u64) -> Stats {
        let mut s = Stats::default();
        s.set(Self::DATA_SIZE, size);
        s
    }

    pub fn size(&self) -> u64 {
        self.0.get(Self::DATA_SIZE).copied().unwrap_or(0)
    }

    pub fn count(&self) -> u64 {
        self.0.get(Self::DATA_COUNT).copied().unwrap_or(0)
    }

    pub fn set(&mut self, key: &str, v: u64) {
        if v == 0 {
            self.0.remove(key);
        } else {
            self.0.insert(key.to_string(), v);
        }
    }

    pub fn add(&mut self, key: &str, v: u64) {
        if v != 0 {
            *self.0.entry(key.to_string()).or_default() += v;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// storage configuration envelope for a local directory backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDirConfig {
    pub dir: String,
}

/// storage configuration envelope for a remote HTTP backend
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    pub url: String,
}

/// the registry of schema object types, keyed on the `@type` tag
///
/// modelled as a closed tagged variant: every recognised type is a variant,
/// so reference traversal is exhaustive and decoding is independent of any
/// registration order.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "@type")]
pub enum Object {
    #[serde(rename = "cas:DirEntry")]
    DirEntry(DirEntry),
    #[serde(rename = "cas:List")]
    List(List),
    #[serde(rename = "cas:InlineList")]
    InlineList(InlineList),
    #[serde(rename = "cas:SizedRef")]
    SizedRef(SizedRef),
    #[serde(rename = "cas:SchemaRef")]
    SchemaRef(SchemaRef),
    #[serde(rename = "cas:Pin")]
    Pin(Pin),
    #[serde(rename = "cas:WebContent")]
    WebContent(WebContent),
    #[serde(rename = "cas:Compressed")]
    Compressed(Compressed),
    #[serde(rename = "cas:TransformOp")]
    TransformOp(TransformOp),
    #[serde(rename = "cas:Multipart")]
    Multipart(Multipart),
    #[serde(rename = "http:Request")]
    HttpRequest(Request),
    #[serde(rename = "http:Response")]
    HttpResponse(Response),
    #[serde(rename = "http:Session")]
    HttpSession(Session),
    #[serde(rename = "cas:LocalDirConfig")]
    LocalDirConfig(LocalDirConfig),
    #[serde(rename = "cas:HTTPClientConfig")]
    HttpClientConfig(HttpClientConfig),
}

impl Object {
    /// registered name of this object's type
    pub fn type_name(&self) -> &'static str {
        match self {
            Object::DirEntry(_) => TYPE_DIR_ENTRY,
            Object::List(_) => TYPE_LIST,
            Object::InlineList(_) => TYPE_INLINE_LIST,
            Object::SizedRef(_) => TYPE_SIZED_REF,
            Object::SchemaRef(_) => TYPE_SCHEMA_REF,
            Object::Pin(_) => TYPE_PIN,
            Object::WebContent(_) => TYPE_WEB_CONTENT,
            Object::Compressed(_) => TYPE_COMPRESSED,
            Object::TransformOp(_) => TYPE_TRANSFORM_OP,
            Object::Multipart(_) => TYPE_MULTIPART,
            Object::HttpRequest(_) => TYPE_HTTP_REQUEST,
            Object::HttpResponse(_) => TYPE_HTTP_RESPONSE,
            Object::HttpSession(_) => TYPE_HTTP_SESSION,
            Object::LocalDirConfig(_) => TYPE_LOCAL_DIR_CONFIG,
            Object::HttpClientConfig(_) => TYPE_HTTP_CLIENT_CONFIG,
        }
    }

    /// outbound refs this object conceptually depends on
    pub fn references(&self) -> Vec<Ref> {
        fn one(r: Ref) -> Vec<Ref> {
            if r.is_zero() {
                vec![]
            } else {
                vec![r]
            }
        }
        match self {
            Object::DirEntry(e) => one(e.r#ref),
            Object::List(l) => l.list.clone(),
            Object::InlineList(l) => l.list.iter().flat_map(|e| e.references()).collect(),
            Object::SizedRef(sr) => one(sr.r#ref),
            Object::SchemaRef(sr) => one(sr.r#ref),
            Object::Pin(p) => one(p.r#ref),
            Object::WebContent(c) => one(c.r#ref),
            Object::Compressed(c) => vec![c.arch.r#ref, c.r#ref.r#ref],
            Object::TransformOp(t) => vec![t.src, t.op, t.dst],
            Object::Multipart(m) => {
                let mut refs = one(m.r#ref);
                refs.extend(m.parts.iter().map(|sr| sr.r#ref));
                refs
            }
            Object::HttpRequest(r) => one(r.body.r#ref),
            Object::HttpResponse(r) => one(r.body.r#ref),
            Object::HttpSession(s) => vec![s.request, s.response],
            Object::LocalDirConfig(_) | Object::HttpClientConfig(_) => vec![],
        }
    }

    /// ref of the raw data blob this object wraps, if it is a plain wrapper
    pub fn data_blob(&self) -> Option<Ref> {
        match self {
            Object::SizedRef(sr) => Some(sr.r#ref),
            Object::SchemaRef(sr) => Some(sr.r#ref),
            Object::WebContent(c) => Some(c.r#ref),
            _ => None,
        }
    }

    /// decode from an already-parsed JSON value, reporting unknown types
    pub fn from_value(v: serde_json::Value) -> Result<Object> {
        let typ = v
            .get("@type")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .to_string();
        match serde_json::from_value::<Object>(v) {
            Ok(o) => Ok(o),
            Err(_) if !known_type(&typ) => Err(Error::UnsupportedType(typ)),
            Err(e) => Err(e.into()),
        }
    }
}

/// checks if the buffer is likely to contain a schema object
///
/// the buffer should be at least [`MAGIC_SIZE`] bytes.
pub fn is_schema(p: &[u8]) -> bool {
    p.len() >= MAGIC_SIZE && &p[..MAGIC_SIZE] == MAGIC
}

/// encode an object into its canonical blob form
pub fn encode_to_vec(obj: &Object) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
    obj.serialize(&mut ser)?;
    buf.push(b'\n');
    Ok(buf)
}

/// encode an object to a writer; the written bytes are the hashed bytes
pub fn encode<W: io::Write>(w: &mut W, obj: &Object) -> Result<()> {
    let buf = encode_to_vec(obj)?;
    w.write_all(&buf)
        .map_err(|e| Error::from_io(e, "<schema>"))?;
    Ok(())
}

fn read_rest<R: Read>(head: [u8; MAGIC_SIZE], r: R) -> Result<Vec<u8>> {
    let mut data = head.to_vec();
    let mut limited = r.take(MAX_SCHEMA_SIZE - MAGIC_SIZE as u64 + 1);
    limited
        .read_to_end(&mut data)
        .map_err(|e| Error::from_io(e, "<schema>"))?;
    if data.len() as u64 > MAX_SCHEMA_SIZE {
        return Err(Error::SchemaTooLarge);
    }
    Ok(data)
}

fn sniff<R: Read>(r: &mut R) -> Result<[u8; MAGIC_SIZE]> {
    let mut head = [0u8; MAGIC_SIZE];
    let mut n = 0;
    while n < MAGIC_SIZE {
        let read = r
            .read(&mut head[n..])
            .map_err(|e| Error::from_io(e, "<schema>"))?;
        if read == 0 {
            return Err(Error::NotSchema);
        }
        n += read;
    }
    if !is_schema(&head) {
        return Err(Error::NotSchema);
    }
    Ok(head)
}

/// decode a schema object from a reader
///
/// fails with [`Error::NotSchema`] when the first bytes do not match the
/// magic; the sniffed bytes are re-joined with the remainder, so the reader
/// does not need to be seekable.
pub fn decode<R: Read>(mut r: R) -> Result<Object> {
    let head = sniff(&mut r)?;
    let data = read_rest(head, r)?;
    let v: serde_json::Value = serde_json::from_slice(&data)?;
    Object::from_value(v)
}

/// decode only the `@type` of a schema object
pub fn decode_type<R: Read>(mut r: R) -> Result<String> {
    let head = sniff(&mut r)?;
    let data = read_rest(head, r)?;
    #[derive(Deserialize)]
    struct Head {
        #[serde(rename = "@type")]
        typ: String,
    }
    let h: Head = serde_json::from_slice(&data)?;
    Ok(h.typ)
}

/// decode an object from plain JSON without requiring the magic framing
///
/// used for configuration files, which embed schema objects in a larger
/// document.
pub fn decode_json_value(v: serde_json::Value) -> Result<Object> {
    Object::from_value(v)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Object {
        Object::DirEntry(DirEntry {
            r#ref: Ref::from_bytes(b"data"),
            name: "hello.txt".to_string(),
            stats: Stats::with_size(4),
        })
    }

    #[test]
    fn test_magic_size() {
        assert_eq!(MAGIC_SIZE, 11);
    }

    #[test]
    fn test_encode_starts_with_magic() {
        let buf = encode_to_vec(&sample()).unwrap();
        assert!(is_schema(&buf));
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("{\n \"@type\": \"cas:DirEntry\","));
        assert!(text.ends_with("}\n"));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let a = encode_to_vec(&sample()).unwrap();
        let b = encode_to_vec(&sample()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_roundtrip() {
        let buf = encode_to_vec(&sample()).unwrap();
        let obj = decode(&buf[..]).unwrap();
        assert_eq!(obj, sample());
    }

    #[test]
    fn test_decode_type() {
        let buf = encode_to_vec(&sample()).unwrap();
        assert_eq!(decode_type(&buf[..]).unwrap(), TYPE_DIR_ENTRY);
    }

    #[test]
    fn test_decode_not_schema() {
        assert!(matches!(decode(&b"raw data"[..]), Err(Error::NotSchema)));
        assert!(matches!(decode(&b""[..]), Err(Error::NotSchema)));
        // valid JSON but without the exact magic framing
        assert!(matches!(
            decode(&b"{\"@type\": \"cas:DirEntry\"}"[..]),
            Err(Error::NotSchema)
        ));
    }

    #[test]
    fn test_decode_unknown_type() {
        let buf = b"{\n \"@type\": \"cas:NoSuchThing\",\n \"x\": 1\n}\n";
        assert!(is_schema(buf));
        match decode(&buf[..]) {
            Err(Error::UnsupportedType(t)) => assert_eq!(t, "cas:NoSuchThing"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_is_schema_short_buffer() {
        assert!(!is_schema(b"{\n"));
    }

    #[test]
    fn test_stats() {
        let mut st = Stats::default();
        assert!(st.is_empty());
        st.add(Stats::DATA_SIZE, 5);
        st.add(Stats::DATA_SIZE, 7);
        st.add(Stats::DATA_COUNT, 1);
        assert_eq!(st.size(), 12);
        assert_eq!(st.count(), 1);
        // zero values are not stored
        st.set(Stats::DATA_COUNT, 0);
        assert_eq!(st.count(), 0);
        assert_eq!(st.0.len(), 1);
    }

    #[test]
    fn test_references() {
        let r1 = Ref::from_bytes(b"1");
        let r2 = Ref::from_bytes(b"2");
        let obj = Object::List(List {
            elem: TYPE_DIR_ENTRY.to_string(),
            r#ref: None,
            list: vec![r1, r2],
            stats: Stats::default(),
        });
        assert_eq!(obj.references(), vec![r1, r2]);

        let sess = Object::HttpSession(Session {
            request: r1,
            response: r2,
        });
        assert_eq!(sess.references(), vec![r1, r2]);
    }

    #[test]
    fn test_data_blob() {
        let r = Ref::from_bytes(b"payload");
        let obj = Object::SizedRef(SizedRef::new(r, 7));
        assert_eq!(obj.data_blob(), Some(r));
        assert_eq!(sample().data_blob(), None);
    }

    #[test]
    fn test_ref_stability() {
        // the hash of an encoded object must be stable for a given object
        let a = Ref::from_bytes(&encode_to_vec(&sample()).unwrap());
        let b = Ref::from_bytes(&encode_to_vec(&sample()).unwrap());
        assert_eq!(a, b);
    }
}
