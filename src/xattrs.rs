//! extended-attribute cache for refs on regular files
//!
//! files that went through the store carry their ref in `user.cas.hash`,
//! guarded by `user.cas.size` and `user.cas.mtime` (little-endian u64,
//! nanoseconds since epoch for mtime). a cached ref is only trusted while
//! both guards still match the file. the local backend additionally tags
//! blobs with `user.cas.schema.type`; an empty value means the blob was
//! sniffed and confirmed to not be a schema blob.

use std::fs::Metadata;
use std::path::Path;
use std::time::UNIX_EPOCH;

use crate::error::{IoResultExt, Result};
use crate::hash::{Ref, SizedRef};

const NS: &str = "user.cas.";

pub const ATTR_HASH: &str = "hash";
pub const ATTR_SIZE: &str = "size";
pub const ATTR_MTIME: &str = "mtime";
pub const ATTR_SCHEMA_TYPE: &str = "schema.type";

/// read a raw attribute; None when not set
pub fn get(path: &Path, name: &str) -> Result<Option<Vec<u8>>> {
    xattr::get(path, format!("{NS}{name}")).with_path(path)
}

pub fn set(path: &Path, name: &str, value: &[u8]) -> Result<()> {
    xattr::set(path, format!("{NS}{name}"), value).with_path(path)
}

pub fn get_string(path: &Path, name: &str) -> Result<Option<String>> {
    Ok(get(path, name)?.map(|v| String::from_utf8_lossy(&v).into_owned()))
}

pub fn set_string(path: &Path, name: &str, value: &str) -> Result<()> {
    set(path, name, value.as_bytes())
}

pub fn get_u64(path: &Path, name: &str) -> Result<Option<u64>> {
    let data = match get(path, name)? {
        Some(d) if d.len() == 8 => d,
        _ => return Ok(None),
    };
    let mut b = [0u8; 8];
    b.copy_from_slice(&data);
    Ok(Some(u64::from_le_bytes(b)))
}

pub fn set_u64(path: &Path, name: &str, v: u64) -> Result<()> {
    set(path, name, &v.to_le_bytes())
}

fn mtime_nanos(meta: &Metadata) -> u64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// size of a file plus its cached ref, when the cache is still valid
///
/// the ref is dropped silently if size or mtime changed since it was saved;
/// callers fall back to hashing the content.
pub fn stat(path: &Path) -> Result<SizedRef> {
    let meta = std::fs::metadata(path).with_path(path)?;
    let sr = SizedRef::new(Ref::zero(), meta.len());

    let raw = match get_string(path, ATTR_HASH) {
        Ok(Some(s)) if !s.is_empty() => s,
        _ => return Ok(sr),
    };
    let r = match Ref::parse(&raw) {
        Ok(r) => r,
        Err(_) => return Ok(sr),
    };
    match get_u64(path, ATTR_SIZE) {
        Ok(Some(size)) if size == meta.len() => {}
        _ => return Ok(sr),
    }
    match get_u64(path, ATTR_MTIME) {
        Ok(Some(nanos)) if nanos == mtime_nanos(&meta) => {}
        _ => return Ok(sr),
    }
    Ok(SizedRef::new(r, meta.len()))
}

/// persist a computed ref on the file, guarded by its current size and mtime
///
/// a no-op when the file was modified after `snapshot` was taken.
pub fn save_ref(path: &Path, snapshot: &Metadata, r: &Ref) -> Result<()> {
    let now = std::fs::metadata(path).with_path(path)?;
    if now.len() != snapshot.len() || mtime_nanos(&now) != mtime_nanos(snapshot) {
        return Ok(());
    }
    set_u64(path, ATTR_SIZE, snapshot.len())?;
    set_u64(path, ATTR_MTIME, mtime_nanos(snapshot))?;
    set_string(path, ATTR_HASH, &r.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xattrs_supported(dir: &Path) -> bool {
        let p = dir.join("probe");
        std::fs::write(&p, b"x").unwrap();
        set_string(&p, "probe", "1").is_ok()
    }

    #[test]
    fn test_stat_without_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();

        let sr = stat(&path).unwrap();
        assert_eq!(sr.size, 5);
        assert!(sr.r#ref.is_zero());
    }

    #[test]
    fn test_save_and_stat_ref() {
        let dir = tempfile::tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        let r = Ref::from_bytes(b"hello");

        save_ref(&path, &meta, &r).unwrap();
        let sr = stat(&path).unwrap();
        assert_eq!(sr.r#ref, r);
        assert_eq!(sr.size, 5);
    }

    #[test]
    fn test_stale_cache_dropped() {
        let dir = tempfile::tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let meta = std::fs::metadata(&path).unwrap();
        save_ref(&path, &meta, &Ref::from_bytes(b"hello")).unwrap();

        // change the content; size guard invalidates the cached ref
        std::fs::write(&path, b"hello world").unwrap();
        let sr = stat(&path).unwrap();
        assert!(sr.r#ref.is_zero());
        assert_eq!(sr.size, 11);
    }

    #[test]
    fn test_save_ref_skips_modified_file() {
        let dir = tempfile::tempdir().unwrap();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let path = dir.path().join("f");
        std::fs::write(&path, b"hello").unwrap();
        let meta = std::fs::metadata(&path).unwrap();

        std::fs::write(&path, b"changed!").unwrap();
        save_ref(&path, &meta, &Ref::from_bytes(b"hello")).unwrap();
        assert!(get(&path, ATTR_HASH).unwrap().is_none());
    }
}
