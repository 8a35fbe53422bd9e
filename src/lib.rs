//! hoard - content-addressable storage
//!
//! a library and daemon for storing immutable byte blobs keyed by the hash
//! of their contents, with JSON schema blobs describing structure on top
//! (files, directory trees, chunked streams, captured HTTP exchanges) and
//! mutable named pins as the roots of the otherwise immutable DAG.
//!
//! # Core concepts
//!
//! - **Blob**: immutable bytes addressed by a [`Ref`] (`sha256:<hex>`)
//! - **Schema blob**: a blob holding a tagged JSON object that references
//!   other blobs ([`schema::Object`])
//! - **Pin**: a mutable named pointer to a ref
//! - **Store**: the façade adding verification, deduplication, chunking
//!   and schema handling over a pluggable storage backend
//!
//! # Example
//!
//! ```no_run
//! use hoard::{CancelToken, OpenOptions, Store};
//!
//! let cancel = CancelToken::new();
//! let store = Store::open(&OpenOptions {
//!     dir: ".cas".into(),
//!     create: true,
//! })?;
//!
//! // store a directory tree and pin its root
//! let sr = store.store_file_path(&cancel, "data".as_ref())?;
//! store.set_pin(&cancel, "root", &sr.r#ref)?;
//!
//! // restore it elsewhere
//! let root = store.get_pin(&cancel, "root")?;
//! store.checkout(&cancel, &root, "restored".as_ref())?;
//! # Ok::<(), hoard::Error>(())
//! ```

mod cancel;
mod checkout;
mod error;
mod hash;
mod xattrs;

pub mod config;
pub mod files;
pub mod httpcache;
pub mod pipeline;
pub mod schema;
pub mod storage;
pub mod store;
pub mod web;

pub use cancel::CancelToken;
pub use config::Config;
pub use error::{Error, Result};
pub use files::{hash_file, local_file, stat_file, FileDesc, LocalFile};
pub use hash::{hash_reader, is_ref_string, Hasher, Pin, Ref, SchemaRef, SizedRef};
pub use store::{
    OpenOptions, SplitConfig, Store, StoreConfig, DEFAULT_DIR, DEFAULT_PIN, FAN_OUT,
};
