//! restoring stored content back onto the filesystem
//!
//! checkout decodes the root ref and dispatches on shape: directory lists
//! recreate a tree, chunk lists are reassembled through a concatenating
//! reader, wrapper objects are unwrapped to their data blob, raw blobs are
//! written verbatim. written files get their ref cached back into xattrs.

use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{Hasher, Ref, SizedRef};
use crate::schema::{self, InlineList, List, Object};
use crate::store::Store;
use crate::xattrs;

impl Store {
    /// restore the content of `r` into `dst`, which must not exist yet
    pub fn checkout(&self, cancel: &CancelToken, r: &Ref, dst: &Path) -> Result<()> {
        if dst.symlink_metadata().is_ok() {
            return Err(Error::TargetExists(dst.to_path_buf()));
        }
        self.checkout_file_or_dir(cancel, r, dst)
    }

    fn checkout_file_or_dir(&self, cancel: &CancelToken, r: &Ref, dst: &Path) -> Result<()> {
        match self.decode_schema(cancel, r) {
            Ok(obj) => self.checkout_object(cancel, r, &obj, dst),
            Err(Error::NotSchema) => self.checkout_blob(cancel, r, dst),
            Err(e) => Err(e),
        }
    }

    fn checkout_object(
        &self,
        cancel: &CancelToken,
        oref: &Ref,
        obj: &Object,
        dst: &Path,
    ) -> Result<()> {
        match obj {
            Object::InlineList(l) => match l.elem.as_str() {
                schema::TYPE_DIR_ENTRY => self.checkout_inline_dir(cancel, l, dst),
                schema::TYPE_SIZED_REF => {
                    let sr = SizedRef::new(l.r#ref.unwrap_or_default(), l.stats.size());
                    self.checkout_multipart(cancel, obj, sr, dst)
                }
                other => Err(Error::UnsupportedType(other.to_string())),
            },
            Object::List(l) => match l.elem.as_str() {
                schema::TYPE_DIR_ENTRY => self.checkout_joined_dir(cancel, l, dst),
                schema::TYPE_SIZED_REF => {
                    let sr = SizedRef::new(l.r#ref.unwrap_or_default(), l.stats.size());
                    self.checkout_multipart(cancel, obj, sr, dst)
                }
                other => Err(Error::UnsupportedType(other.to_string())),
            },
            other => match other.data_blob() {
                // unwrap the pointed blob
                Some(r) => self.checkout_blob(cancel, &r, dst),
                // unknown shape: keep the raw schema bytes
                None => self.checkout_blob(cancel, oref, dst),
            },
        }
    }

    fn checkout_inline_dir(
        &self,
        cancel: &CancelToken,
        list: &InlineList,
        dst: &Path,
    ) -> Result<()> {
        fs::create_dir_all(dst).with_path(dst)?;
        for item in &list.list {
            cancel.err()?;
            let ent = item
                .as_dir_entry()
                .ok_or_else(|| Error::UnsupportedType(list.elem.clone()))?;
            let spath = dst.join(&ent.name);
            match self.decode_schema(cancel, &ent.r#ref) {
                // a sub-directory, chunk list or wrapped blob
                Ok(sub) => self.checkout_object(cancel, &ent.r#ref, &sub, &spath)?,
                // a plain file blob
                Err(Error::NotSchema) => self.checkout_blob(cancel, &ent.r#ref, &spath)?,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn checkout_joined_dir(&self, cancel: &CancelToken, list: &List, dst: &Path) -> Result<()> {
        fs::create_dir_all(dst).with_path(dst)?;
        for r in &list.list {
            cancel.err()?;
            let sub = match self.decode_schema(cancel, r) {
                Ok(sub) => sub,
                Err(Error::NotSchema) => {
                    return Err(Error::UnsupportedType("<data>".to_string()))
                }
                Err(e) => return Err(e),
            };
            match &sub {
                Object::List(_) | Object::InlineList(_) => {
                    // pages of the same directory keep filling dst
                    self.checkout_object(cancel, r, &sub, dst)?;
                }
                other => return Err(Error::UnsupportedType(other.type_name().to_string())),
            }
        }
        Ok(())
    }

    fn checkout_blob(&self, cancel: &CancelToken, r: &Ref, dst: &Path) -> Result<()> {
        let (rc, size) = self.fetch_blob(cancel, r)?;
        self.checkout_blob_data(cancel, rc, SizedRef::new(*r, size), dst)
    }

    fn checkout_multipart(
        &self,
        cancel: &CancelToken,
        obj: &Object,
        sr: SizedRef,
        dst: &Path,
    ) -> Result<()> {
        let mut mr = MultipartReader {
            s: self,
            cancel: cancel.clone(),
            parts: Vec::new(),
            cur: None,
        };
        mr.add_parts_from(obj)?;
        self.checkout_blob_data(cancel, Box::new(mr), sr, dst)
    }

    /// write a verified stream to a file, caching the ref in xattrs
    fn checkout_blob_data(
        &self,
        cancel: &CancelToken,
        mut rc: Box<dyn Read + Send + '_>,
        sr: SizedRef,
        dst: &Path,
    ) -> Result<()> {
        let mut f = fs::File::create(dst).with_path(dst)?;
        let mut h = if sr.r#ref.is_zero() {
            None
        } else {
            Some(Hasher::new())
        };
        let mut buf = [0u8; 64 * 1024];
        loop {
            cancel.err()?;
            let n = rc.read(&mut buf).map_err(|e| Error::from_io(e, dst))?;
            if n == 0 {
                break;
            }
            if let Some(h) = &mut h {
                h.update(&buf[..n]);
            }
            f.write_all(&buf[..n]).with_path(dst)?;
        }
        if let Some(h) = h {
            let got = h.finalize();
            if got != sr.r#ref {
                drop(f);
                let _ = fs::remove_file(dst);
                return Err(Error::RefMismatch {
                    expected: sr.r#ref,
                    got,
                });
            }
        }
        f.sync_all().with_path(dst)?;
        drop(f);
        if !sr.r#ref.is_zero() {
            let meta = fs::metadata(dst).with_path(dst)?;
            let _ = xattrs::save_ref(dst, &meta, &sr.r#ref);
        }
        Ok(())
    }
}

/// concatenates (possibly nested) part blobs into a single stream
struct MultipartReader<'a> {
    s: &'a Store,
    cancel: CancelToken,
    /// stack, last part is read first
    parts: Vec<Ref>,
    cur: Option<Box<dyn Read + Send + 'a>>,
}

impl MultipartReader<'_> {
    fn add_parts_from(&mut self, obj: &Object) -> Result<()> {
        match obj {
            Object::InlineList(l) if l.elem == schema::TYPE_SIZED_REF => {
                for item in l.list.iter().rev() {
                    self.parts.push(item.data_blob());
                }
                Ok(())
            }
            Object::List(l) if l.elem == schema::TYPE_SIZED_REF => {
                for r in l.list.iter().rev() {
                    self.parts.push(*r);
                }
                Ok(())
            }
            Object::Multipart(m) => {
                for p in m.parts.iter().rev() {
                    self.parts.push(p.r#ref);
                }
                Ok(())
            }
            other => match other.data_blob() {
                Some(r) => {
                    self.parts.push(r);
                    Ok(())
                }
                None => Err(Error::UnsupportedType(other.type_name().to_string())),
            },
        }
    }
}

impl Read for MultipartReader<'_> {
    fn read(&mut self, p: &mut [u8]) -> io::Result<usize> {
        loop {
            if self.cancel.is_cancelled() {
                return Err(Error::Cancelled.into_io());
            }
            if let Some(cur) = &mut self.cur {
                let n = cur.read(p)?;
                if n != 0 {
                    return Ok(n);
                }
                self.cur = None;
                continue;
            }
            let r = match self.parts.pop() {
                Some(r) => r,
                None => return Ok(0),
            };
            match self.s.decode_schema(&self.cancel, &r) {
                Ok(obj) => self.add_parts_from(&obj).map_err(Error::into_io)?,
                Err(Error::NotSchema) => {
                    let (rc, _) = self
                        .s
                        .fetch_blob(&self.cancel, &r)
                        .map_err(Error::into_io)?;
                    self.cur = Some(rc);
                }
                Err(e) => return Err(e.into_io()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SplitConfig, StoreConfig};
    use crate::storage::MemoryStorage;
    use std::sync::Arc;

    fn mem_store() -> Store {
        Store::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_checkout_raw_blob() {
        let s = mem_store();
        let cancel = CancelToken::new();
        let sr = s
            .store_blob(&cancel, &mut &b"plain file"[..], &StoreConfig::default())
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        s.checkout(&cancel, &sr.r#ref, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"plain file");
    }

    #[test]
    fn test_checkout_refuses_existing_target() {
        let s = mem_store();
        let cancel = CancelToken::new();
        let sr = s
            .store_blob(&cancel, &mut &b"x"[..], &StoreConfig::default())
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("out");
        fs::write(&dst, b"already here").unwrap();
        assert!(matches!(
            s.checkout(&cancel, &sr.r#ref, &dst),
            Err(Error::TargetExists(_))
        ));
    }

    #[test]
    fn test_checkout_dir_roundtrip() {
        let src = tempfile::tempdir().unwrap();
        fs::write(src.path().join("file1.txt"), b"content1").unwrap();
        fs::write(src.path().join("empty"), b"").unwrap();
        fs::create_dir_all(src.path().join("dir1/dir2")).unwrap();
        fs::write(src.path().join("dir1/file2.txt"), b"content2").unwrap();
        fs::write(src.path().join("dir1/dir2/file3.txt"), b"content3").unwrap();

        let s = mem_store();
        let cancel = CancelToken::new();
        let sr = s.store_file_path(&cancel, src.path()).unwrap();

        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("restored");
        s.checkout(&cancel, &sr.r#ref, &dst).unwrap();

        assert_eq!(fs::read(dst.join("file1.txt")).unwrap(), b"content1");
        assert_eq!(fs::read(dst.join("empty")).unwrap(), b"");
        assert_eq!(fs::read(dst.join("dir1/file2.txt")).unwrap(), b"content2");
        assert_eq!(
            fs::read(dst.join("dir1/dir2/file3.txt")).unwrap(),
            b"content3"
        );
    }

    #[test]
    fn test_checkout_large_dir_pages() {
        let src = tempfile::tempdir().unwrap();
        for i in 0..1100u32 {
            fs::write(src.path().join(format!("f{i:04}")), format!("{i}")).unwrap();
        }
        let s = mem_store();
        let cancel = CancelToken::new();
        let sr = s.store_file_path(&cancel, src.path()).unwrap();

        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("restored");
        s.checkout(&cancel, &sr.r#ref, &dst).unwrap();

        let count = fs::read_dir(&dst).unwrap().count();
        assert_eq!(count, 1100);
        assert_eq!(fs::read(dst.join("f0042")).unwrap(), b"42");
        assert_eq!(fs::read(dst.join("f1099")).unwrap(), b"1099");
    }

    #[test]
    fn test_checkout_chunked_file() {
        let s = mem_store();
        let cancel = CancelToken::new();
        let data: Vec<u8> = (0..255u8).cycle().take(10_000).collect();
        let conf = StoreConfig {
            split: Some(SplitConfig {
                max: 4096,
                ..Default::default()
            }),
            ..Default::default()
        };
        let sr = s.store_blob(&cancel, &mut &data[..], &conf).unwrap();

        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("big");
        s.checkout(&cancel, &sr.r#ref, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), data);

        // the file carries the hash of the whole content, not the list
        if let Ok(cached) = xattrs::stat(&dst) {
            if !cached.r#ref.is_zero() {
                assert_eq!(cached.r#ref, Ref::from_bytes(&data));
            }
        }
    }

    #[test]
    fn test_checkout_wrapped_blob() {
        let s = mem_store();
        let cancel = CancelToken::new();
        let blob = s
            .store_blob(&cancel, &mut &b"wrapped"[..], &StoreConfig::default())
            .unwrap();
        let wrapper = s
            .store_schema(&cancel, &Object::SizedRef(blob))
            .unwrap();

        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("unwrapped");
        s.checkout(&cancel, &wrapper.r#ref, &dst).unwrap();
        assert_eq!(fs::read(&dst).unwrap(), b"wrapped");
    }

    #[test]
    fn test_checkout_unknown_schema_writes_raw_bytes() {
        let s = mem_store();
        let cancel = CancelToken::new();
        let obj = Object::TransformOp(schema::TransformOp {
            src: Ref::from_bytes(b"1"),
            op: Ref::from_bytes(b"2"),
            dst: Ref::from_bytes(b"3"),
        });
        let sr = s.store_schema(&cancel, &obj).unwrap();

        let out = tempfile::tempdir().unwrap();
        let dst = out.path().join("schema.json");
        s.checkout(&cancel, &sr.r#ref, &dst).unwrap();
        let raw = fs::read(&dst).unwrap();
        assert!(schema::is_schema(&raw));
    }
}
