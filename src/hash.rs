use std::fmt;
use std::io::{self, Read};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// name of the default hash algorithm
pub const DEFAULT_ALGO: &str = "sha256";

const SHA256_SIZE: usize = 32;

/// hash algorithms usable in a [`Ref`]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub enum Algo {
    Sha256,
}

impl Algo {
    pub fn name(&self) -> &'static str {
        match self {
            Algo::Sha256 => "sha256",
        }
    }

    /// digest size in bytes
    pub fn size(&self) -> usize {
        match self {
            Algo::Sha256 => SHA256_SIZE,
        }
    }

    fn from_name(name: &str) -> Result<Algo> {
        match name {
            "sha256" => Ok(Algo::Sha256),
            _ => Err(Error::UnsupportedAlgo(name.to_string())),
        }
    }
}

/// reference to a blob in content-addressable storage
///
/// a pair of a hash algorithm and the digest value. refs are plain values:
/// comparable, hashable and cheap to copy. the text form is
/// `"<algo>:<lowercase hex>"`. a default-constructed ref is *zero*
/// (uninitialized); a ref equal to the digest of no input is *empty*.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Ref {
    algo: Option<Algo>,
    digest: [u8; SHA256_SIZE],
}

fn empty_ref() -> &'static Ref {
    static EMPTY: OnceLock<Ref> = OnceLock::new();
    EMPTY.get_or_init(|| Ref::from_bytes(b""))
}

/// checks if a string looks like the text form of a ref
pub fn is_ref_string(s: &str) -> bool {
    s.starts_with("sha256:")
}

impl Ref {
    /// zero (uninitialized) ref
    pub fn zero() -> Ref {
        Ref::default()
    }

    /// ref of the zero-length blob under the default algorithm
    pub fn empty() -> Ref {
        *empty_ref()
    }

    /// compute the ref of a byte slice with the default algorithm
    pub fn from_bytes(p: &[u8]) -> Ref {
        let mut h = Hasher::new();
        h.update(p);
        h.finalize()
    }

    /// create a ref from an algorithm name and a raw digest
    pub fn make(algo: &str, digest: &[u8]) -> Result<Ref> {
        let algo = Algo::from_name(algo)?;
        if digest.len() != algo.size() {
            return Err(Error::WrongDigestSize {
                algo: algo.name(),
                expected: algo.size(),
                got: digest.len(),
            });
        }
        let mut r = Ref {
            algo: Some(algo),
            digest: [0; SHA256_SIZE],
        };
        r.digest[..digest.len()].copy_from_slice(digest);
        Ok(r)
    }

    /// parse the text form; an empty string parses to the zero ref
    pub fn parse(s: &str) -> Result<Ref> {
        if s.is_empty() {
            return Ok(Ref::zero());
        }
        let (name, hex_digest) = s.split_once(':').ok_or(Error::NotARef)?;
        let algo = Algo::from_name(name)?;
        if hex_digest.len() != algo.size() * 2 {
            return Err(Error::WrongDigestSize {
                algo: algo.name(),
                expected: algo.size(),
                got: hex_digest.len() / 2,
            });
        }
        // the wire form is lowercase hex only
        if hex_digest.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(Error::BadEncoding);
        }
        let raw = hex::decode(hex_digest).map_err(|_| Error::BadEncoding)?;
        Ref::make(name, &raw)
    }

    /// true for an uninitialized ref
    pub fn is_zero(&self) -> bool {
        *self == Ref::default()
    }

    /// true if this ref describes a zero-length blob
    pub fn is_empty(&self) -> bool {
        self == empty_ref()
    }

    pub fn algo(&self) -> Option<Algo> {
        self.algo
    }

    /// raw digest bytes
    pub fn digest(&self) -> &[u8] {
        match self.algo {
            Some(a) => &self.digest[..a.size()],
            None => &[],
        }
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.algo {
            Some(a) => write!(f, "{}:{}", a.name(), hex::encode(self.digest())),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            return write!(f, "Ref(zero)");
        }
        write!(f, "Ref({}:{})", self.algo.unwrap().name(), &hex::encode(self.digest())[..12])
    }
}

impl Serialize for Ref {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Ref {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ref::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// streaming hasher producing a [`Ref`] with the default algorithm
pub struct Hasher {
    inner: Sha256,
    size: u64,
}

impl Default for Hasher {
    fn default() -> Self {
        Self::new()
    }
}

impl Hasher {
    pub fn new() -> Hasher {
        Hasher {
            inner: Sha256::new(),
            size: 0,
        }
    }

    pub fn update(&mut self, p: &[u8]) {
        self.inner.update(p);
        self.size += p.len() as u64;
    }

    /// bytes hashed so far
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn finalize(self) -> Ref {
        let digest: [u8; SHA256_SIZE] = self.inner.finalize().into();
        Ref {
            algo: Some(Algo::Sha256),
            digest,
        }
    }

    /// finalize into a sized ref carrying the byte count
    pub fn finalize_sized(self) -> SizedRef {
        let size = self.size;
        SizedRef {
            r#ref: self.finalize(),
            size,
        }
    }
}

impl io::Write for Hasher {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        self.update(p);
        Ok(p.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// read a stream to the end and return its ref and size
pub fn hash_reader<R: Read>(r: &mut R) -> Result<SizedRef> {
    let mut h = Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf).map_err(|e| Error::from_io(e, "<reader>"))?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    Ok(h.finalize_sized())
}

/// a ref paired with the size of the blob it describes
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct SizedRef {
    pub r#ref: Ref,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,
}

impl SizedRef {
    pub fn new(r: Ref, size: u64) -> SizedRef {
        SizedRef { r#ref: r, size }
    }
}

/// a ref that describes a schema blob of a known type
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct SchemaRef {
    pub r#ref: Ref,
    #[serde(default, skip_serializing_if = "is_zero_u64")]
    pub size: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub r#type: String,
}

impl SchemaRef {
    /// drop the type, keeping ref and size
    pub fn sized_ref(&self) -> SizedRef {
        SizedRef {
            r#ref: self.r#ref,
            size: self.size,
        }
    }
}

/// a named mutable pointer to a ref
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct Pin {
    pub name: String,
    pub r#ref: Ref,
}

pub(crate) fn is_zero_u64(v: &u64) -> bool {
    *v == 0
}
