use std::io::{self, Write};

use crate::error::{Error, Result};
use crate::hash::{Hasher, SizedRef};

use super::BlobWriter;

/// a [`BlobWriter`] that hashes bytes without storing them
///
/// this is the engine of index-only mode: callers run the normal
/// write/complete/commit protocol and obtain a real [`SizedRef`], but no
/// blob lands in any backend. backends also embed it to hash alongside
/// their own writes.
#[derive(Default)]
pub struct HashWriter {
    h: Option<Hasher>,
    sr: Option<SizedRef>,
}

impl HashWriter {
    pub fn new() -> HashWriter {
        HashWriter {
            h: Some(Hasher::new()),
            sr: None,
        }
    }
}

impl Write for HashWriter {
    fn write(&mut self, p: &[u8]) -> io::Result<usize> {
        match &mut self.h {
            Some(h) => {
                h.update(p);
                Ok(p.len())
            }
            None => Err(Error::BlobCompleted.into_io()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BlobWriter for HashWriter {
    fn size(&self) -> u64 {
        match (&self.h, &self.sr) {
            (Some(h), _) => h.size(),
            (None, Some(sr)) => sr.size,
            (None, None) => 0,
        }
    }

    fn complete(&mut self) -> Result<SizedRef> {
        if let Some(h) = self.h.take() {
            let sr = h.finalize_sized();
            self.sr = Some(sr);
            return Ok(sr);
        }
        self.sr.ok_or(Error::BlobDiscarded)
    }

    fn commit(&mut self) -> Result<()> {
        if self.h.is_some() {
            self.complete()?;
        }
        if self.sr.is_none() {
            return Err(Error::BlobDiscarded);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.h = None;
        Ok(())
    }
}
