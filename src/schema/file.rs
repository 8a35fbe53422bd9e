use serde::{Deserialize, Serialize};

use crate::hash::{Ref, SizedRef};

/// pairs a compressed blob with its decompressed counterpart
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Compressed {
    pub algo: String,
    /// the archive (compressed bytes)
    pub arch: SizedRef,
    /// the decompressed content
    pub r#ref: SizedRef,
}

/// alternate chunked form: a blob reassembled from sized parts
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Multipart {
    /// ref of the whole content, when known
    #[serde(default, skip_serializing_if = "Ref::is_zero")]
    pub r#ref: Ref,
    pub parts: Vec<SizedRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{decode, encode_to_vec, Object};

    #[test]
    fn test_compressed_roundtrip() {
        let obj = Object::Compressed(Compressed {
            algo: "gzip".to_string(),
            arch: SizedRef::new(Ref::from_bytes(b"gz"), 10),
            r#ref: SizedRef::new(Ref::from_bytes(b"plain"), 20),
        });
        let buf = encode_to_vec(&obj).unwrap();
        assert_eq!(decode(&buf[..]).unwrap(), obj);
        assert_eq!(obj.references().len(), 2);
    }

    #[test]
    fn test_multipart_roundtrip() {
        let obj = Object::Multipart(Multipart {
            r#ref: Ref::from_bytes(b"whole"),
            parts: vec![
                SizedRef::new(Ref::from_bytes(b"p1"), 1),
                SizedRef::new(Ref::from_bytes(b"p2"), 2),
            ],
        });
        let buf = encode_to_vec(&obj).unwrap();
        assert_eq!(decode(&buf[..]).unwrap(), obj);
        assert_eq!(obj.references().len(), 3);
    }
}
