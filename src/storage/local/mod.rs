//! local directory backend
//!
//! layout under the store root:
//!
//! ```text
//! blobs/<algo>:<hex>           read-only, one file per blob
//! pins/<name>                  text file containing "<algo>:<hex>"
//! tmp/                         in-flight writes
//! indexes/@type/<typ>/<ref>    hard-link index by schema type
//! unindexed/<ref>              hard-links for blobs awaiting classification
//! ```
//!
//! the kernel provides all atomicity: writers use uniquely-named temp files
//! and a final rename/linkat, so concurrent writers to the same root are
//! safe and duplicate writes of the same ref collapse. the schema index is
//! derived state and can be rebuilt at any time.

mod tmpfile;

use std::collections::{HashSet, VecDeque};
use std::fs::{self, File, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{Pin, Ref, SchemaRef, SizedRef};
use crate::schema;
use crate::xattrs;

use super::{
    BlobIndexer, BlobIter, BlobSource, BlobStorage, BlobStream, BlobWriter, HashWriter, PinIter,
    PinStorage, SchemaIter, Storage,
};
use tmpfile::TmpFile;

const DIR_BLOBS: &str = "blobs";
const DIR_PINS: &str = "pins";
const DIR_TMP: &str = "tmp";
const DIR_INDEX: &str = "indexes";
const DIR_UNINDEXED: &str = "unindexed";

const INDEX_TYPE: &str = "@type";

const RO_PERM: u32 = 0o444;
const RW_PERM: u32 = 0o644;
const DIR_PERM: u32 = 0o755;

/// blob storage in a local directory
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// open a store at `dir`, creating the layout when `create` is set
    pub fn new(dir: &Path, create: bool) -> Result<LocalStorage> {
        let root = dir.to_path_buf();
        if !root.join(DIR_BLOBS).is_dir() {
            if !create {
                return Err(Error::from_io(
                    io::Error::new(io::ErrorKind::NotFound, "store not found"),
                    &root,
                ));
            }
            fs::create_dir_all(&root).with_path(&root)?;
            for name in [DIR_BLOBS, DIR_PINS, DIR_TMP] {
                let path = root.join(name);
                fs::create_dir_all(&path).with_path(&path)?;
                fs::set_permissions(&path, Permissions::from_mode(DIR_PERM)).with_path(&path)?;
            }
        }
        let s = LocalStorage { root };
        s.init_indexes()?;
        Ok(s)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn init_indexes(&self) -> Result<()> {
        let type_index = self.root.join(DIR_INDEX).join(INDEX_TYPE);
        fs::create_dir_all(&type_index).with_path(&type_index)?;
        let unindexed = self.root.join(DIR_UNINDEXED);
        fs::create_dir_all(&unindexed).with_path(&unindexed)?;
        Ok(())
    }

    fn blob_path(&self, r: &Ref) -> PathBuf {
        self.root.join(DIR_BLOBS).join(r.to_string())
    }

    fn pin_path(&self, name: &str) -> Result<PathBuf> {
        validate_pin_name(name)?;
        Ok(self.root.join(DIR_PINS).join(name))
    }

    fn unindexed_path(&self, name: &str) -> PathBuf {
        self.root.join(DIR_UNINDEXED).join(name)
    }

    fn type_index_dir(&self, typ: &str) -> PathBuf {
        self.root.join(DIR_INDEX).join(INDEX_TYPE).join(typ)
    }

    /// detect and clean up the one corruption we can spot cheaply: a blob
    /// stored with a non-empty ref but zero bytes on disk, the residue of a
    /// crash between rename and fsync
    fn remove_if_invalid(&self, size: u64, r: &Ref) -> Result<bool> {
        if size != 0 || r.is_empty() {
            return Ok(false);
        }
        warn!(%r, "removing corrupt zero-size blob");
        let path = self.blob_path(r);
        let mismatch = Error::RefMismatch {
            expected: *r,
            got: Ref::empty(),
        };
        if fs::set_permissions(&path, Permissions::from_mode(0o666)).is_err() {
            return Err(mismatch);
        }
        if fs::remove_file(&path).is_err() {
            return Err(mismatch);
        }
        Ok(true)
    }

    /// import a local file by cloning filesystem blocks instead of copying
    ///
    /// the clone is hashed (it is a stable snapshot even if the source
    /// keeps changing) and then renamed into `blobs/`.
    pub fn import_file(&self, cancel: &CancelToken, path: &Path) -> Result<SizedRef> {
        cancel.err()?;
        let (tmp, sr) = tmpfile::clone_file(path, &self.root.join(DIR_TMP))?;
        if sr.size == 0 {
            return Ok(sr);
        }
        fs::set_permissions(tmp.path(), Permissions::from_mode(RO_PERM))
            .with_path(tmp.path())?;
        let dest = self.blob_path(&sr.r#ref);
        tmp.into_temp_path()
            .persist(&dest)
            .map_err(|e| Error::from_io(e.error, &dest))?;
        Ok(sr)
    }

    /// cached schema type of a blob, sniffing and tagging when missing
    ///
    /// returns an empty string for confirmed data blobs. blob files are
    /// read-only, so writing the tag needs a chmod round-trip.
    fn blob_schema_type(&self, path: &Path, force: bool) -> Result<String> {
        if !force {
            if let Some(typ) = xattrs::get_string(path, xattrs::ATTR_SCHEMA_TYPE)? {
                return Ok(typ);
            }
        }
        let f = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(Error::from_io(e, path)),
        };
        let typ = match schema::decode_type(f) {
            Ok(t) => t,
            Err(Error::NotSchema) => String::new(),
            Err(e) => return Err(e),
        };
        fs::set_permissions(path, Permissions::from_mode(RW_PERM)).with_path(path)?;
        let res = xattrs::set_string(path, xattrs::ATTR_SCHEMA_TYPE, &typ);
        let _ = fs::set_permissions(path, Permissions::from_mode(RO_PERM));
        res?;
        Ok(typ)
    }

    /// classify one `unindexed/` entry: drop data blobs, move schema blobs
    /// into their type directory
    fn promote_unindexed(&self, name: &str) -> Result<String> {
        let path = self.unindexed_path(name);
        let f = match File::open(&path) {
            Ok(f) => f,
            // blob gone, someone else promoted it
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(String::new()),
            Err(e) => return Err(Error::from_io(e, &path)),
        };
        let typ = match schema::decode_type(f) {
            Ok(t) => t,
            Err(Error::NotSchema) => String::new(),
            Err(e) => return Err(e),
        };
        if typ.is_empty() {
            fs::remove_file(&path).with_path(&path)?;
            return Ok(String::new());
        }
        let dir = self.type_index_dir(&typ);
        let dest = dir.join(name);
        match fs::rename(&path, &dest) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&dir).with_path(&dir)?;
                fs::rename(&path, &dest).with_path(&dest)?;
            }
            Err(e) => return Err(Error::from_io(e, &dest)),
        }
        Ok(typ)
    }
}

/// sorted listing of the regular files in a directory; empty when missing
fn sorted_dir(dir: &Path) -> Result<Vec<(String, u64)>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::from_io(e, dir)),
    };
    let mut out = Vec::new();
    for entry in rd {
        let entry = entry.with_path(dir)?;
        let meta = entry.metadata().with_path(dir)?;
        if !meta.is_file() {
            continue;
        }
        out.push((entry.file_name().to_string_lossy().into_owned(), meta.len()));
    }
    out.sort();
    Ok(out)
}

fn validate_pin_name(name: &str) -> Result<()> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0'])
    {
        return Err(Error::InvalidPinName(name.to_string()));
    }
    Ok(())
}

impl BlobSource for LocalStorage {
    fn stat_blob(&self, cancel: &CancelToken, r: &Ref) -> Result<u64> {
        cancel.err()?;
        if r.is_zero() {
            return Err(Error::InvalidRef);
        }
        let path = self.blob_path(r);
        let meta = fs::metadata(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::from_io(e, &path)
            }
        })?;
        if self.remove_if_invalid(meta.len(), r)? {
            return Err(Error::NotFound);
        }
        Ok(meta.len())
    }

    fn fetch_blob(&self, cancel: &CancelToken, r: &Ref) -> Result<BlobStream<'_>> {
        cancel.err()?;
        if r.is_zero() {
            return Err(Error::InvalidRef);
        }
        let path = self.blob_path(r);
        let f = File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::from_io(e, &path)
            }
        })?;
        let meta = f.metadata().with_path(&path)?;
        if self.remove_if_invalid(meta.len(), r)? {
            return Err(Error::NotFound);
        }
        Ok((Box::new(f), meta.len()))
    }

    fn iterate_blobs(&self, cancel: &CancelToken) -> BlobIter<'_> {
        let entries = match sorted_dir(&self.root.join(DIR_BLOBS)) {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let cancel = cancel.clone();
        let mut entries = VecDeque::from(entries);
        Box::new(std::iter::from_fn(move || loop {
            if let Err(e) = cancel.err() {
                return Some(Err(e));
            }
            let (name, size) = entries.pop_front()?;
            let r = match Ref::parse(&name) {
                Ok(r) => r,
                Err(e) => return Some(Err(e)),
            };
            match self.remove_if_invalid(size, &r) {
                Ok(true) => continue,
                Ok(false) => return Some(Ok(SizedRef::new(r, size))),
                Err(e) => return Some(Err(e)),
            }
        }))
    }
}

impl BlobStorage for LocalStorage {
    fn begin_blob<'a>(&'a self, cancel: &CancelToken) -> Result<Box<dyn BlobWriter + 'a>> {
        cancel.err()?;
        let tmp = TmpFile::create(&self.root, &self.root.join(DIR_TMP))?;
        Ok(Box::new(LocalBlobWriter {
            s: self,
            tmp: Some(tmp),
            hw: HashWriter::new(),
            committed: false,
        }))
    }
}

struct LocalBlobWriter<'a> {
    s: &'a LocalStorage,
    tmp: Option<TmpFile>,
    hw: HashWriter,
    committed: bool,
}

impl Write for LocalBlobWriter<'_> {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        let n = self.hw.write(p)?;
        match &mut self.tmp {
            Some(tmp) => tmp.write_all(&p[..n])?,
            None => return Err(Error::BlobCompleted.into_io()),
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.tmp {
            Some(tmp) => tmp.flush(),
            None => Ok(()),
        }
    }
}

impl BlobWriter for LocalBlobWriter<'_> {
    fn size(&self) -> u64 {
        self.hw.size()
    }

    fn complete(&mut self) -> Result<SizedRef> {
        self.hw.complete()
    }

    fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Err(Error::BlobCompleted);
        }
        self.hw.commit()?;
        let tmp = match self.tmp.take() {
            Some(tmp) => tmp,
            None => return Err(Error::BlobDiscarded),
        };
        self.committed = true;
        let sr = self.hw.complete()?;
        if sr.size == 0 {
            // dropping the temp file discards it; empty blobs are synthetic
            return Ok(());
        }
        let dest = self.s.blob_path(&sr.r#ref);
        tmp.commit(&dest)?;
        // queue for schema classification
        let uni = self.s.unindexed_path(&sr.r#ref.to_string());
        match fs::hard_link(&dest, &uni) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(Error::from_io(e, &uni)),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.tmp = None;
        self.hw.close()
    }
}

impl PinStorage for LocalStorage {
    fn set_pin(&self, cancel: &CancelToken, name: &str, r: &Ref) -> Result<()> {
        cancel.err()?;
        let path = self.pin_path(name)?;
        fs::write(&path, r.to_string()).with_path(&path)?;
        fs::set_permissions(&path, Permissions::from_mode(RW_PERM)).with_path(&path)?;
        Ok(())
    }

    fn delete_pin(&self, cancel: &CancelToken, name: &str) -> Result<()> {
        cancel.err()?;
        let path = self.pin_path(name)?;
        fs::remove_file(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::from_io(e, &path)
            }
        })
    }

    fn get_pin(&self, cancel: &CancelToken, name: &str) -> Result<Ref> {
        cancel.err()?;
        let path = self.pin_path(name)?;
        let data = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound
            } else {
                Error::from_io(e, &path)
            }
        })?;
        Ref::parse(data.trim())
    }

    fn iterate_pins(&self, cancel: &CancelToken) -> PinIter<'_> {
        let entries = match sorted_dir(&self.root.join(DIR_PINS)) {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let cancel = cancel.clone();
        let pins_dir = self.root.join(DIR_PINS);
        let mut entries = VecDeque::from(entries);
        Box::new(std::iter::from_fn(move || {
            if let Err(e) = cancel.err() {
                return Some(Err(e));
            }
            let (name, _) = entries.pop_front()?;
            let path = pins_dir.join(&name);
            let res = fs::read_to_string(&path)
                .with_path(&path)
                .and_then(|data| Ref::parse(data.trim()))
                .map(|r| Pin { name, r#ref: r });
            Some(res)
        }))
    }
}

impl BlobIndexer for LocalStorage {
    fn fetch_schema(&self, cancel: &CancelToken, r: &Ref) -> Result<BlobStream<'_>> {
        cancel.err()?;
        if r.is_zero() {
            return Err(Error::InvalidRef);
        }
        if let Ok(Some(typ)) = xattrs::get_string(&self.blob_path(r), xattrs::ATTR_SCHEMA_TYPE) {
            if typ.is_empty() {
                return Err(Error::NotSchema);
            }
        }
        self.fetch_blob(cancel, r)
    }

    fn iterate_schema(&self, cancel: &CancelToken, types: &[String]) -> SchemaIter<'_> {
        if types.is_empty() {
            return self.iterate_schema_any(cancel, false);
        }
        let cancel = cancel.clone();
        let filter: HashSet<String> = types.iter().cloned().collect();
        let mut pending: VecDeque<String> = types.iter().cloned().collect();
        let mut current: Option<(String, VecDeque<(String, u64)>)> = None;
        let mut unindexed: Option<VecDeque<(String, u64)>> = None;
        Box::new(std::iter::from_fn(move || loop {
            if let Err(e) = cancel.err() {
                return Some(Err(e));
            }
            // drain the current per-type index directory
            if let Some((typ, entries)) = current.as_mut() {
                if let Some((name, size)) = entries.pop_front() {
                    let typ = typ.clone();
                    let res = Ref::parse(&name).map(|r| SchemaRef {
                        r#ref: r,
                        size,
                        r#type: typ,
                    });
                    return Some(res);
                }
            }
            if let Some(typ) = pending.pop_front() {
                match sorted_dir(&self.type_index_dir(&typ)) {
                    Ok(entries) => current = Some((typ, VecDeque::from(entries))),
                    Err(e) => return Some(Err(e)),
                }
                continue;
            }
            // all indexed types listed; drain the unclassified backlog
            if unindexed.is_none() {
                match sorted_dir(&self.root.join(DIR_UNINDEXED)) {
                    Ok(v) => unindexed = Some(VecDeque::from(v)),
                    Err(e) => return Some(Err(e)),
                }
            }
            let (name, size) = unindexed.as_mut().unwrap().pop_front()?;
            match self.promote_unindexed(&name) {
                Ok(typ) if !typ.is_empty() && filter.contains(&typ) => {
                    let res = Ref::parse(&name).map(|r| SchemaRef {
                        r#ref: r,
                        size,
                        r#type: typ,
                    });
                    return Some(res);
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e)),
            }
        }))
    }

    fn reindex_schema(&self, cancel: &CancelToken, force: bool) -> Result<()> {
        if force {
            let unindexed = self.root.join(DIR_UNINDEXED);
            let indexes = self.root.join(DIR_INDEX);
            fs::remove_dir_all(&unindexed).with_path(&unindexed)?;
            fs::remove_dir_all(&indexes).with_path(&indexes)?;
            self.init_indexes()?;
            // mark every blob as unindexed again
            for (name, _) in sorted_dir(&self.root.join(DIR_BLOBS))? {
                cancel.err()?;
                let src = self.root.join(DIR_BLOBS).join(&name);
                let dst = self.unindexed_path(&name);
                match fs::hard_link(&src, &dst) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(Error::from_io(e, &dst)),
                }
            }
        }
        // full scan refreshing the xattr type cache
        for item in self.iterate_schema_any(cancel, true) {
            item?;
        }
        Ok(())
    }
}

impl LocalStorage {
    fn iterate_schema_any(&self, cancel: &CancelToken, force: bool) -> SchemaIter<'_> {
        let entries = match sorted_dir(&self.root.join(DIR_BLOBS)) {
            Ok(v) => v,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };
        let cancel = cancel.clone();
        let mut entries = VecDeque::from(entries);
        Box::new(std::iter::from_fn(move || loop {
            if let Err(e) = cancel.err() {
                return Some(Err(e));
            }
            let (name, size) = entries.pop_front()?;
            let r = match Ref::parse(&name) {
                Ok(r) => r,
                Err(e) => return Some(Err(e)),
            };
            match self.remove_if_invalid(size, &r) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => return Some(Err(e)),
            }
            let path = self.root.join(DIR_BLOBS).join(&name);
            match self.blob_schema_type(&path, force) {
                Ok(typ) if typ.is_empty() => continue,
                Ok(typ) => {
                    return Some(Ok(SchemaRef {
                        r#ref: r,
                        size,
                        r#type: typ,
                    }))
                }
                Err(e) => return Some(Err(e)),
            }
        }))
    }
}

impl Storage for LocalStorage {
    fn as_indexer(&self) -> Option<&dyn BlobIndexer> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{Object, Stats, TransformOp, WebContent};
    use crate::storage::write_bytes;
    use std::io::Read;

    fn test_store() -> (tempfile::TempDir, LocalStorage) {
        let dir = tempfile::tempdir().unwrap();
        let s = LocalStorage::new(&dir.path().join("store"), true).unwrap();
        (dir, s)
    }

    fn xattrs_supported(dir: &Path) -> bool {
        let p = dir.join("xattr_probe");
        std::fs::write(&p, b"x").unwrap();
        xattrs::set_string(&p, "probe", "1").is_ok()
    }

    #[test]
    fn test_layout_created() {
        let (dir, _s) = test_store();
        let root = dir.path().join("store");
        for sub in ["blobs", "pins", "tmp", "indexes/@type", "unindexed"] {
            assert!(root.join(sub).is_dir(), "missing {sub}");
        }
    }

    #[test]
    fn test_open_missing_without_create() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalStorage::new(&dir.path().join("nope"), false).is_err());
    }

    #[test]
    fn test_blob_roundtrip() {
        let (_dir, s) = test_store();
        let cancel = CancelToken::new();
        let sr = write_bytes(&cancel, &s, b"hello world").unwrap();
        assert_eq!(sr.size, 11);
        assert_eq!(
            sr.r#ref.to_string(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );

        assert_eq!(s.stat_blob(&cancel, &sr.r#ref).unwrap(), 11);
        let (mut rc, sz) = s.fetch_blob(&cancel, &sr.r#ref).unwrap();
        assert_eq!(sz, 11);
        let mut out = Vec::new();
        rc.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"hello world");

        // blob files are read-only
        let meta = fs::metadata(s.blob_path(&sr.r#ref)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o444);
    }

    #[test]
    fn test_dedup_same_content() {
        let (_dir, s) = test_store();
        let cancel = CancelToken::new();
        let a = write_bytes(&cancel, &s, b"dup").unwrap();
        let b = write_bytes(&cancel, &s, b"dup").unwrap();
        assert_eq!(a, b);
        let blobs: Vec<_> = s.iterate_blobs(&cancel).collect::<Result<_>>().unwrap();
        assert_eq!(blobs.len(), 1);
    }

    #[test]
    fn test_empty_blob_not_written() {
        let (_dir, s) = test_store();
        let cancel = CancelToken::new();
        let sr = write_bytes(&cancel, &s, b"").unwrap();
        assert!(sr.r#ref.is_empty());
        assert!(matches!(
            s.stat_blob(&cancel, &sr.r#ref),
            Err(Error::NotFound)
        ));
        let blobs: Vec<_> = s.iterate_blobs(&cancel).collect::<Result<_>>().unwrap();
        assert!(blobs.is_empty());
    }

    #[test]
    fn test_write_after_complete_fails() {
        let (_dir, s) = test_store();
        let cancel = CancelToken::new();
        let mut w = s.begin_blob(&cancel).unwrap();
        w.write_all(b"data").unwrap();
        w.complete().unwrap();
        assert!(w.write_all(b"more").is_err());
        w.commit().unwrap();
        // a second commit is a misuse, while close stays a no-op
        assert!(matches!(w.commit(), Err(Error::BlobCompleted)));
        w.close().unwrap();
    }

    #[test]
    fn test_discarded_writer_leaves_no_temp() {
        let (dir, s) = test_store();
        let cancel = CancelToken::new();
        let mut w = s.begin_blob(&cancel).unwrap();
        w.write_all(b"doomed").unwrap();
        w.close().unwrap();
        assert!(matches!(w.commit(), Err(Error::BlobDiscarded)));

        let tmp = dir.path().join("store").join("tmp");
        assert!(fs::read_dir(tmp).unwrap().next().is_none());
    }

    #[test]
    fn test_corrupt_zero_size_blob_removed() {
        let (_dir, s) = test_store();
        let cancel = CancelToken::new();
        let r = Ref::from_bytes(b"will be corrupted");
        fs::write(s.blob_path(&r), b"").unwrap();

        assert!(matches!(s.stat_blob(&cancel, &r), Err(Error::NotFound)));
        assert!(!s.blob_path(&r).exists());
    }

    #[test]
    fn test_iterate_sorted() {
        let (_dir, s) = test_store();
        let cancel = CancelToken::new();
        for i in 0..10u8 {
            write_bytes(&cancel, &s, &[i]).unwrap();
        }
        let refs: Vec<_> = s.iterate_blobs(&cancel).collect::<Result<_>>().unwrap();
        assert_eq!(refs.len(), 10);
        let names: Vec<String> = refs.iter().map(|sr| sr.r#ref.to_string()).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_pins() {
        let (_dir, s) = test_store();
        let cancel = CancelToken::new();
        let r1 = Ref::from_bytes(b"1");
        let r2 = Ref::from_bytes(b"2");

        s.set_pin(&cancel, "root", &r1).unwrap();
        s.set_pin(&cancel, "root", &r2).unwrap();
        assert_eq!(s.get_pin(&cancel, "root").unwrap(), r2);

        s.set_pin(&cancel, "other", &r1).unwrap();
        let pins: Vec<_> = s.iterate_pins(&cancel).collect::<Result<_>>().unwrap();
        assert_eq!(pins.len(), 2);
        assert_eq!(pins[0].name, "other");
        assert_eq!(pins[1].name, "root");

        s.delete_pin(&cancel, "root").unwrap();
        assert!(matches!(s.get_pin(&cancel, "root"), Err(Error::NotFound)));
        assert!(matches!(
            s.delete_pin(&cancel, "root"),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn test_pin_name_validation() {
        let (_dir, s) = test_store();
        let cancel = CancelToken::new();
        let r = Ref::from_bytes(b"x");
        assert!(matches!(
            s.set_pin(&cancel, "a/b", &r),
            Err(Error::InvalidPinName(_))
        ));
        assert!(matches!(
            s.set_pin(&cancel, "..", &r),
            Err(Error::InvalidPinName(_))
        ));
    }

    #[test]
    fn test_import_file() {
        let (dir, s) = test_store();
        let cancel = CancelToken::new();
        let src = dir.path().join("big.bin");
        fs::write(&src, b"imported contents").unwrap();

        match s.import_file(&cancel, &src) {
            Ok(sr) => {
                assert_eq!(sr.size, 17);
                assert_eq!(sr.r#ref, Ref::from_bytes(b"imported contents"));
                assert_eq!(s.stat_blob(&cancel, &sr.r#ref).unwrap(), 17);
            }
            // the test filesystem may not support block cloning
            Err(Error::CloneUnsupported) => {}
            Err(e) => panic!("unexpected: {e}"),
        }
    }

    fn store_schema_blob(s: &LocalStorage, obj: &Object) -> SizedRef {
        let buf = schema::encode_to_vec(obj).unwrap();
        write_bytes(&CancelToken::new(), s, &buf).unwrap()
    }

    #[test]
    fn test_schema_index() {
        let (dir, s) = test_store();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let cancel = CancelToken::new();

        write_bytes(&cancel, &s, b"raw one").unwrap();
        write_bytes(&cancel, &s, b"raw two").unwrap();
        let t1 = store_schema_blob(
            &s,
            &Object::TransformOp(TransformOp {
                src: Ref::from_bytes(b"a"),
                op: Ref::from_bytes(b"b"),
                dst: Ref::from_bytes(b"c"),
            }),
        );
        let w1 = store_schema_blob(
            &s,
            &Object::WebContent(WebContent {
                url: "https://example.com".into(),
                r#ref: Ref::from_bytes(b"body"),
                size: 4,
                etag: String::new(),
                ts: None,
            }),
        );

        // typed iteration promotes unindexed entries on the fly
        let ops: Vec<_> = s
            .iterate_schema(&cancel, &[schema::TYPE_TRANSFORM_OP.to_string()])
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].r#ref, t1.r#ref);
        assert_eq!(ops[0].r#type, schema::TYPE_TRANSFORM_OP);

        // promoted entries now live in the per-type index directory
        assert!(s
            .type_index_dir(schema::TYPE_TRANSFORM_OP)
            .join(t1.r#ref.to_string())
            .exists());

        // untyped iteration sees all schema blobs and only them
        let all: Vec<_> = s
            .iterate_schema(&cancel, &[])
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().any(|sr| sr.r#ref == w1.r#ref));

        // fetch_schema rejects raw blobs once they are tagged
        let raw = Ref::from_bytes(b"raw one");
        assert!(matches!(
            s.fetch_schema(&cancel, &raw),
            Err(Error::NotSchema)
        ));
    }

    #[test]
    fn test_reindex_force() {
        let (dir, s) = test_store();
        if !xattrs_supported(dir.path()) {
            return;
        }
        let cancel = CancelToken::new();

        for i in 0..5u8 {
            write_bytes(&cancel, &s, &[b'r', i]).unwrap();
        }
        for i in 0..3u8 {
            store_schema_blob(
                &s,
                &Object::TransformOp(TransformOp {
                    src: Ref::from_bytes(&[i]),
                    op: Ref::from_bytes(b"op"),
                    dst: Ref::from_bytes(&[i, i]),
                }),
            );
        }

        s.reindex_schema(&cancel, true).unwrap();

        let ops: Vec<_> = s
            .iterate_schema(&cancel, &[schema::TYPE_TRANSFORM_OP.to_string()])
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(ops.len(), 3);

        // after classification the unindexed backlog is empty
        let left = sorted_dir(&dir.path().join("store").join("unindexed")).unwrap();
        assert!(left.is_empty());
    }
}
