//! turning files and directory trees into schema trees
//!
//! files become blobs (reusing cached refs from xattrs, or filesystem
//! block cloning when both sides are local), directories become
//! [`InlineList`]s of [`DirEntry`] paged at [`FAN_OUT`] children and joined
//! by [`List`] nodes until a single root remains. every level carries
//! aggregated size/count stats, and ordering is lexicographic by name at
//! every level, so directory refs are canonical.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{Hasher, Ref, SizedRef};
use crate::schema::{self, DirEntry, InlineItem, InlineList, List, Object, Stats};
use crate::storage::{BlobIter, BlobWriter, HashWriter};
use crate::store::{complete_blob, Store, DEFAULT_DIR, FAN_OUT};
use crate::xattrs;

/// a file-like source of bytes that can remember its ref
pub trait FileDesc {
    fn name(&self) -> String;

    /// open for reading; the sized ref carries the declared size and, when
    /// the source caches one, a trusted content ref
    fn open(&mut self) -> Result<(Box<dyn Read + Send>, SizedRef)>;

    /// persist a computed ref back to the source, best effort
    fn set_ref(&mut self, sr: &SizedRef);

    /// path on the local filesystem, when the source is a plain file
    fn local_path(&self) -> Option<&Path> {
        None
    }
}

/// descriptor for a plain local file, with the xattr ref cache
pub struct LocalFile {
    path: PathBuf,
    meta: Option<fs::Metadata>,
}

pub fn local_file(path: impl Into<PathBuf>) -> LocalFile {
    LocalFile {
        path: path.into(),
        meta: None,
    }
}

impl FileDesc for LocalFile {
    fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn open(&mut self) -> Result<(Box<dyn Read + Send>, SizedRef)> {
        let f = fs::File::open(&self.path).with_path(&self.path)?;
        self.meta = Some(f.metadata().with_path(&self.path)?);
        let sr = xattrs::stat(&self.path)?;
        Ok((Box::new(f), sr))
    }

    fn set_ref(&mut self, sr: &SizedRef) {
        let meta = match &self.meta {
            Some(m) if m.len() == sr.size => m,
            _ => return,
        };
        if let Err(e) = xattrs::save_ref(&self.path, meta, &sr.r#ref) {
            warn!(path = %self.path.display(), "cannot save ref: {e}");
        }
    }

    fn local_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// size of a file plus its cached ref, when the xattr cache is still valid
pub fn stat_file(path: &Path) -> Result<SizedRef> {
    xattrs::stat(path)
}

/// hash a local file, reusing and refreshing the xattr cache
pub fn hash_file(cancel: &CancelToken, path: &Path, force: bool) -> Result<SizedRef> {
    cancel.err()?;
    if !force {
        if let Ok(sr) = xattrs::stat(path) {
            if !sr.r#ref.is_zero() {
                return Ok(sr);
            }
        }
    }
    let meta = fs::metadata(path).with_path(path)?;
    let mut f = fs::File::open(path).with_path(path)?;
    let mut h = Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        cancel.err()?;
        let n = f.read(&mut buf).with_path(path)?;
        if n == 0 {
            break;
        }
        h.update(&buf[..n]);
    }
    let sr = h.finalize_sized();
    if let Err(e) = xattrs::save_ref(path, &meta, &sr.r#ref) {
        warn!(path = %path.display(), "cannot save ref: {e}");
    }
    Ok(sr)
}

impl Store {
    fn store_as_file(
        &self,
        cancel: &CancelToken,
        fd: &mut dyn FileDesc,
        index_only: bool,
    ) -> Result<DirEntry> {
        let (mut rc, hint) = fd.open()?;

        if !hint.r#ref.is_zero() {
            // the source knows its ref already
            let ent = DirEntry {
                r#ref: hint.r#ref,
                name: fd.name(),
                stats: Stats::with_size(hint.size),
            };
            if index_only {
                return Ok(ent);
            }
            if self.stat_blob(cancel, &hint.r#ref).is_ok() {
                return Ok(ent);
            }
        }

        let mut fw: Box<dyn BlobWriter + '_> = if index_only {
            Box::new(HashWriter::new())
        } else {
            if let (Some(path), Some(local)) = (fd.local_path(), self.local()) {
                // same filesystem: clone blocks instead of copying bytes
                if let Ok(sr) = local.import_file(cancel, path) {
                    let ent = DirEntry {
                        r#ref: sr.r#ref,
                        name: fd.name(),
                        stats: Stats::with_size(sr.size),
                    };
                    fd.set_ref(&sr);
                    return Ok(ent);
                }
            }
            self.begin_blob(cancel)?
        };

        let res = (|| {
            let n = crate::storage::copy_blob(cancel, fw.as_mut(), rc.as_mut())?;
            if n != hint.size {
                return Err(Error::FileChanged);
            }
            let sr = complete_blob(fw.as_mut(), Ref::zero())?;
            if sr.size != hint.size {
                return Err(Error::FileChanged);
            }
            Ok(sr)
        })();
        let _ = fw.close();
        let sr = res?;

        fd.set_ref(&sr);
        Ok(DirEntry {
            r#ref: sr.r#ref,
            name: fd.name(),
            stats: Stats::with_size(sr.size),
        })
    }

    /// store a file and wrap it in a [`DirEntry`] schema blob
    pub fn store_file(&self, cancel: &CancelToken, fd: &mut dyn FileDesc) -> Result<SizedRef> {
        let ent = self.store_as_file(cancel, fd, false)?;
        self.store_schema(cancel, &Object::DirEntry(ent))
    }

    /// register a file by hash without persisting its bytes
    pub fn index_file(&self, cancel: &CancelToken, fd: &mut dyn FileDesc) -> Result<SizedRef> {
        let ent = self.store_as_file(cancel, fd, true)?;
        self.store_schema(cancel, &Object::DirEntry(ent))
    }

    /// store a file or a whole directory tree from a path
    pub fn store_file_path(&self, cancel: &CancelToken, path: &Path) -> Result<SizedRef> {
        self.store_path(cancel, path, false)
    }

    /// index a file or directory tree without persisting data bytes
    pub fn index_file_path(&self, cancel: &CancelToken, path: &Path) -> Result<SizedRef> {
        self.store_path(cancel, path, true)
    }

    fn store_path(&self, cancel: &CancelToken, path: &Path, index_only: bool) -> Result<SizedRef> {
        let meta = fs::metadata(path).with_path(path)?;
        if meta.is_dir() {
            let (sr, _) = self.store_dir(cancel, path, index_only)?;
            return Ok(sr);
        }
        let mut fd = local_file(path);
        let ent = self.store_as_file(cancel, &mut fd, index_only)?;
        Ok(SizedRef::new(ent.r#ref, ent.size()))
    }

    fn store_dir(
        &self,
        cancel: &CancelToken,
        dir: &Path,
        index_only: bool,
    ) -> Result<(SizedRef, DirEntry)> {
        cancel.err()?;
        let mut names: Vec<(String, bool)> = Vec::new();
        for entry in fs::read_dir(dir).with_path(dir)? {
            let entry = entry.with_path(dir)?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == DEFAULT_DIR {
                continue;
            }
            let is_dir = entry.file_type().with_path(dir)?.is_dir();
            names.push((name, is_dir));
        }
        names.sort();

        let mut base: Vec<DirEntry> = Vec::with_capacity(names.len());
        for (name, is_dir) in names {
            cancel.err()?;
            let fpath = dir.join(&name);
            if is_dir {
                let (sr, mut ent) = self.store_dir(cancel, &fpath, index_only)?;
                ent.r#ref = sr.r#ref;
                ent.name = name;
                base.push(ent);
            } else {
                let mut fd = local_file(&fpath);
                base.push(self.store_as_file(cancel, &mut fd, index_only)?);
            }
        }
        base.sort_by(|a, b| a.name.cmp(&b.name));

        if base.len() <= FAN_OUT {
            return self.store_dir_list(cancel, base);
        }

        // page the entries, then join pages level by level to one root
        let mut level: Vec<List> = Vec::new();
        let mut refs: Vec<Ref> = Vec::new();
        let mut cur = new_join_node();
        let pages: Vec<&[DirEntry]> = base.chunks(FAN_OUT).collect();
        let last = pages.len() - 1;
        for (i, page) in pages.into_iter().enumerate() {
            let (sr, ent) = self.store_dir_list(cancel, page.to_vec())?;
            cur.stats.add(Stats::DATA_SIZE, ent.size());
            cur.stats.add(Stats::DATA_COUNT, ent.count());
            cur.list.push(sr.r#ref);
            if cur.list.len() >= FAN_OUT || i == last {
                let sr = self.store_schema(cancel, &Object::List(cur.clone()))?;
                level.push(std::mem::replace(&mut cur, new_join_node()));
                refs.push(sr.r#ref);
            }
        }
        while level.len() > 1 {
            let mut new_level = Vec::new();
            let mut new_refs = Vec::new();
            for (group, grefs) in level.chunks(FAN_OUT).zip(refs.chunks(FAN_OUT)) {
                let (sr, node) = self.store_dir_join(cancel, grefs.to_vec(), group)?;
                new_level.push(node);
                new_refs.push(sr.r#ref);
            }
            level = new_level;
            refs = new_refs;
        }
        let top = level.remove(0);
        let sr = self.store_schema(cancel, &Object::List(top.clone()))?;
        let ent = DirEntry {
            r#ref: sr.r#ref,
            name: String::new(),
            stats: top.stats,
        };
        Ok((sr, ent))
    }

    fn store_dir_list(
        &self,
        cancel: &CancelToken,
        list: Vec<DirEntry>,
    ) -> Result<(SizedRef, DirEntry)> {
        let mut stats = Stats::default();
        for e in &list {
            stats.add(Stats::DATA_COUNT, e.count() + 1);
            stats.add(Stats::DATA_SIZE, e.size());
        }
        let obj = Object::InlineList(InlineList {
            elem: schema::TYPE_DIR_ENTRY.to_string(),
            r#ref: None,
            list: list.into_iter().map(InlineItem::DirEntry).collect(),
            stats: stats.clone(),
        });
        let sr = self.store_schema(cancel, &obj)?;
        let ent = DirEntry {
            r#ref: sr.r#ref,
            name: String::new(),
            stats,
        };
        Ok((sr, ent))
    }

    fn store_dir_join(
        &self,
        cancel: &CancelToken,
        refs: Vec<Ref>,
        nodes: &[List],
    ) -> Result<(SizedRef, List)> {
        let mut stats = Stats::default();
        for n in nodes {
            stats.add(Stats::DATA_COUNT, n.stats.count());
            stats.add(Stats::DATA_SIZE, n.stats.size());
        }
        let node = List {
            elem: schema::TYPE_DIR_ENTRY.to_string(),
            r#ref: None,
            list: refs,
            stats,
        };
        let sr = self.store_schema(cancel, &Object::List(node.clone()))?;
        Ok((sr, node))
    }

    /// walk a schema DAG yielding only the raw data blobs inside it
    pub fn iterate_data_blobs_in(&self, cancel: &CancelToken, root: Ref) -> BlobIter<'_> {
        let cancel = cancel.clone();
        let mut pending: Vec<Ref> = vec![root];
        Box::new(std::iter::from_fn(move || loop {
            if let Err(e) = cancel.err() {
                return Some(Err(e));
            }
            let r = pending.pop()?;
            let obj = match self.decode_schema(&cancel, &r) {
                Ok(obj) => obj,
                Err(Error::NotSchema) => {
                    // a real data blob
                    match self.stat_blob(&cancel, &r) {
                        Ok(size) => return Some(Ok(SizedRef::new(r, size))),
                        Err(Error::NotFound) => continue,
                        Err(e) => return Some(Err(e)),
                    }
                }
                Err(e) => return Some(Err(e)),
            };
            match obj {
                Object::DirEntry(e) => pending.push(e.r#ref),
                Object::InlineList(l) => {
                    pending.extend(l.list.iter().map(|e| e.data_blob()));
                }
                Object::List(l) => pending.extend(l.list),
                Object::Multipart(m) => {
                    pending.extend(m.parts.iter().map(|p| p.r#ref));
                }
                other => {
                    if let Some(r) = other.data_blob() {
                        pending.push(r);
                    }
                }
            }
        }))
    }
}

fn new_join_node() -> List {
    List {
        elem: schema::TYPE_DIR_ENTRY.to_string(),
        r#ref: None,
        list: Vec::new(),
        stats: Stats::default(),
    }
}
