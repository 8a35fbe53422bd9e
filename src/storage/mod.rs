//! blob storage backends and their capability traits
//!
//! a backend exposes some subset of: reading blobs ([`BlobSource`]),
//! writing blobs ([`BlobStorage`]), mutable named pointers ([`PinStorage`])
//! and a schema-type index ([`BlobIndexer`]). the [`Storage`] supertrait is
//! what the façade in [`crate::store`] layers policy on top of.

pub mod config;
mod hash;
pub mod http;
pub mod local;
pub mod memory;
pub mod server;
mod verify;

use std::io::{self, Read, Write};

use crate::cancel::CancelToken;
use crate::error::Result;
use crate::hash::{Pin, Ref, SchemaRef, SizedRef};

pub use config::open_storage;
pub use hash::HashWriter;
pub use http::HttpClient;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use verify::VerifyReader;

/// a readable blob stream together with its size
pub type BlobStream<'a> = (Box<dyn Read + Send + 'a>, u64);

pub type BlobIter<'a> = Box<dyn Iterator<Item = Result<SizedRef>> + 'a>;
pub type PinIter<'a> = Box<dyn Iterator<Item = Result<Pin>> + 'a>;
pub type SchemaIter<'a> = Box<dyn Iterator<Item = Result<SchemaRef>> + 'a>;

/// read-only access to immutable blobs
pub trait BlobSource: Send + Sync {
    /// size of a stored blob; `NotFound` when missing, `InvalidRef` for a
    /// zero ref
    fn stat_blob(&self, cancel: &CancelToken, r: &Ref) -> Result<u64>;

    /// open a blob for reading
    fn fetch_blob(&self, cancel: &CancelToken, r: &Ref) -> Result<BlobStream<'_>>;

    /// list all blobs, ordered by ref
    ///
    /// snapshots are not required to be globally consistent with concurrent
    /// writers, but every yielded ref is valid.
    fn iterate_blobs(&self, cancel: &CancelToken) -> BlobIter<'_>;
}

/// blob storage that also accepts writes
pub trait BlobStorage: BlobSource {
    /// start writing a new blob; see [`BlobWriter`] for the life cycle
    fn begin_blob<'a>(&'a self, cancel: &CancelToken) -> Result<Box<dyn BlobWriter + 'a>>;
}

/// mutable named pointers layered over immutable blobs
pub trait PinStorage: Send + Sync {
    fn set_pin(&self, cancel: &CancelToken, name: &str, r: &Ref) -> Result<()>;
    fn delete_pin(&self, cancel: &CancelToken, name: &str) -> Result<()>;
    /// `NotFound` when the pin does not exist
    fn get_pin(&self, cancel: &CancelToken, name: &str) -> Result<Ref>;
    fn iterate_pins(&self, cancel: &CancelToken) -> PinIter<'_>;
}

/// optional schema-type index over a blob storage
pub trait BlobIndexer: Send + Sync {
    /// fetch a blob known to be a schema blob; `NotSchema` for raw data
    fn fetch_schema(&self, cancel: &CancelToken, r: &Ref) -> Result<BlobStream<'_>>;

    /// list schema blobs, optionally restricted to the given types
    fn iterate_schema(&self, cancel: &CancelToken, types: &[String]) -> SchemaIter<'_>;

    /// rebuild the index; with `force` every blob is reclassified
    fn reindex_schema(&self, cancel: &CancelToken, force: bool) -> Result<()>;
}

/// the full backend contract: blobs plus pins
pub trait Storage: BlobStorage + PinStorage {
    /// native schema index, when the backend maintains one
    ///
    /// the façade falls back to sniffing blobs one by one otherwise.
    fn as_indexer(&self) -> Option<&dyn BlobIndexer> {
        None
    }
}

/// writes one immutable blob in three phases
///
/// bytes are streamed with `write`, sealed with `complete` (which yields
/// the final ref and size; all writes afterwards fail with
/// `BlobCompleted`), then either persisted with `commit` or dropped with
/// `close`. `commit` completes implicitly when needed and closes the
/// writer; `close` after `commit` is a no-op, so it is safe to call
/// unconditionally on every exit path. completing an empty blob yields the
/// empty ref, and committing it writes nothing: empty blobs are synthesised
/// on fetch instead of being stored.
pub trait BlobWriter: Write {
    /// bytes written so far
    fn size(&self) -> u64;

    fn complete(&mut self) -> Result<SizedRef>;

    fn commit(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// store a byte slice as a single blob
pub fn write_bytes(
    cancel: &CancelToken,
    s: &dyn BlobStorage,
    data: &[u8],
) -> Result<SizedRef> {
    let mut w = s.begin_blob(cancel)?;
    let res = (|| {
        w.write_all(data)
            .map_err(|e| crate::error::Error::from_io(e, "<blob>"))?;
        let sr = w.complete()?;
        w.commit()?;
        Ok(sr)
    })();
    w.close()?;
    res
}

/// copy a stream into a blob writer, observing cancellation
pub(crate) fn copy_blob<R: Read + ?Sized>(
    cancel: &CancelToken,
    w: &mut dyn BlobWriter,
    r: &mut R,
) -> Result<u64> {
    let mut buf = [0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        cancel.err()?;
        let n = r
            .read(&mut buf)
            .map_err(|e| crate::error::Error::from_io(e, "<blob>"))?;
        if n == 0 {
            return Ok(total);
        }
        w.write_all(&buf[..n])
            .map_err(|e| crate::error::Error::from_io(e, "<blob>"))?;
        total += n as u64;
    }
}

/// an empty read stream used when synthesising empty blobs
pub(crate) fn empty_stream() -> Box<dyn Read + Send + 'static> {
    Box::new(io::empty())
}
