use serde::{Deserialize, Serialize};

use crate::hash::Ref;

/// record that running tool `op` on `src` produced `dst`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformOp {
    pub src: Ref,
    pub op: Ref,
    pub dst: Ref,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{decode, encode_to_vec, Object};

    #[test]
    fn test_transform_op_roundtrip() {
        let obj = Object::TransformOp(TransformOp {
            src: Ref::from_bytes(b"in"),
            op: Ref::from_bytes(b"tool"),
            dst: Ref::from_bytes(b"out"),
        });
        let buf = encode_to_vec(&obj).unwrap();
        assert_eq!(decode(&buf[..]).unwrap(), obj);
        assert_eq!(obj.references().len(), 3);
    }
}
