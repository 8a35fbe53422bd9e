use std::collections::{BTreeMap, HashMap};
use std::io::{self, Cursor, Write};
use std::sync::RwLock;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::hash::{Pin, Ref, SchemaRef, SizedRef};
use crate::schema;

use super::{
    BlobIndexer, BlobIter, BlobSource, BlobStorage, BlobStream, BlobWriter, HashWriter, PinIter,
    PinStorage, SchemaIter, Storage,
};

#[derive(Default)]
struct Inner {
    blobs: HashMap<Ref, Vec<u8>>,
    pins: BTreeMap<String, Ref>,
    types: HashMap<Ref, String>,
}

/// reference in-memory backend
///
/// a reader/writer lock guards the maps: readers iterate concurrently,
/// commits and pin mutations are exclusive. committed buffers that start
/// with the schema magic get their decoded type recorded, which makes this
/// backend a native [`BlobIndexer`].
#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage::default()
    }
}

impl BlobSource for MemoryStorage {
    fn stat_blob(&self, cancel: &CancelToken, r: &Ref) -> Result<u64> {
        cancel.err()?;
        if r.is_zero() {
            return Err(Error::InvalidRef);
        }
        let inner = self.inner.read().unwrap();
        match inner.blobs.get(r) {
            Some(b) => Ok(b.len() as u64),
            None => Err(Error::NotFound),
        }
    }

    fn fetch_blob(&self, cancel: &CancelToken, r: &Ref) -> Result<BlobStream<'_>> {
        cancel.err()?;
        if r.is_zero() {
            return Err(Error::InvalidRef);
        }
        let inner = self.inner.read().unwrap();
        match inner.blobs.get(r) {
            Some(b) => Ok((Box::new(Cursor::new(b.clone())), b.len() as u64)),
            None => Err(Error::NotFound),
        }
    }

    fn iterate_blobs(&self, cancel: &CancelToken) -> BlobIter<'_> {
        let inner = self.inner.read().unwrap();
        let mut refs: Vec<SizedRef> = inner
            .blobs
            .iter()
            .map(|(r, b)| SizedRef::new(*r, b.len() as u64))
            .collect();
        refs.sort_by_key(|sr| sr.r#ref);
        let cancel = cancel.clone();
        Box::new(refs.into_iter().map(move |sr| {
            cancel.err()?;
            Ok(sr)
        }))
    }
}

impl BlobStorage for MemoryStorage {
    fn begin_blob<'a>(&'a self, cancel: &CancelToken) -> Result<Box<dyn BlobWriter + 'a>> {
        cancel.err()?;
        Ok(Box::new(MemWriter {
            s: self,
            buf: Vec::new(),
            hw: HashWriter::new(),
            committed: false,
        }))
    }
}

struct MemWriter<'a> {
    s: &'a MemoryStorage,
    buf: Vec<u8>,
    hw: HashWriter,
    committed: bool,
}

impl Write for MemWriter<'_> {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        let n = self.hw.write(p)?;
        self.buf.extend_from_slice(&p[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for MemWriter<'_> {
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
        self.committed = true;
        let sr = self.hw.complete()?;
        if sr.size == 0 {
            // empty blobs are synthesised on fetch, never stored
            return Ok(());
        }
        let buf = std::mem::take(&mut self.buf);
        let mut inner = self.s.inner.write().unwrap();
        if schema::is_schema(&buf) {
            if let Ok(typ) = schema::decode_type(&buf[..]) {
                inner.types.insert(sr.r#ref, typ);
            }
        }
        inner.blobs.insert(sr.r#ref, buf);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.hw.close()
    }
}

impl PinStorage for MemoryStorage {
    fn set_pin(&self, cancel: &CancelToken, name: &str, r: &Ref) -> Result<()> {
        cancel.err()?;
        let mut inner = self.inner.write().unwrap();
        inner.pins.insert(name.to_string(), *r);
        Ok(())
    }

    fn delete_pin(&self, cancel: &CancelToken, name: &str) -> Result<()> {
        cancel.err()?;
        let mut inner = self.inner.write().unwrap();
        inner.pins.remove(name);
        Ok(())
    }

    fn get_pin(&self, cancel: &CancelToken, name: &str) -> Result<Ref> {
        cancel.err()?;
        let inner = self.inner.read().unwrap();
        inner.pins.get(name).copied().ok_or(Error::NotFound)
    }

    fn iterate_pins(&self, cancel: &CancelToken) -> PinIter<'_> {
        let inner = self.inner.read().unwrap();
        let pins: Vec<Pin> = inner
            .pins
            .iter()
            .map(|(name, r)| Pin {
                name: name.clone(),
                r#ref: *r,
            })
            .collect();
        let cancel = cancel.clone();
        Box::new(pins.into_iter().map(move |p| {
            cancel.err()?;
            Ok(p)
        }))
    }
}

impl BlobIndexer for MemoryStorage {
    fn fetch_schema(&self, cancel: &CancelToken, r: &Ref) -> Result<BlobStream<'_>> {
        cancel.err()?;
        if r.is_zero() {
            return Err(Error::InvalidRef);
        }
        {
            let inner = self.inner.read().unwrap();
            match inner.types.get(r) {
                Some(typ) if !typ.is_empty() => {}
                _ => return Err(Error::NotSchema),
            }
        }
        self.fetch_blob(cancel, r)
    }

    fn iterate_schema(&self, cancel: &CancelToken, types: &[String]) -> SchemaIter<'_> {
        let inner = self.inner.read().unwrap();
        let mut refs: Vec<SchemaRef> = inner
            .types
            .iter()
            .filter(|(_, typ)| !typ.is_empty())
            .filter(|(_, typ)| types.is_empty() || types.contains(typ))
            .filter_map(|(r, typ)| {
                inner.blobs.get(r).map(|b| SchemaRef {
                    r#ref: *r,
                    size: b.len() as u64,
                    r#type: typ.clone(),
                })
            })
            .collect();
        refs.sort_by_key(|sr| sr.r#ref);
        let cancel = cancel.clone();
        Box::new(refs.into_iter().map(move |sr| {
            cancel.err()?;
            Ok(sr)
        }))
    }

    fn reindex_schema(&self, _cancel: &CancelToken, _force: bool) -> Result<()> {
        // the type map is maintained on commit, so there is nothing to do
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn as_indexer(&self) -> Option<&dyn BlobIndexer> {
        Some(self)
    }
}
