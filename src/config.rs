//! store configuration file
//!
//! a single JSON document co-located with the store root:
//!
//! ```json
//! { "storage": { "@type": "cas:LocalDirConfig", "dir": "." } }
//! ```
//!
//! the `storage` value is an ordinary schema object, so the same registry
//! that decodes blobs decodes configurations.

use std::fs;
use std::path::Path;

use serde_json::json;

use crate::error::{Error, IoResultExt, Result};
use crate::schema::{self, Object};
use crate::storage::LocalStorage;

pub const CONFIG_NAME: &str = "config.json";

/// full configuration of a store
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// the primary storage backend
    pub storage: Object,
}

/// read a config file
pub fn read_config(path: &Path) -> Result<Config> {
    let data = fs::read(path).with_path(path)?;
    let doc: serde_json::Value = serde_json::from_slice(&data)?;
    let storage = doc
        .get("storage")
        .cloned()
        .ok_or_else(|| Error::Config("missing storage section".to_string()))?;
    Ok(Config {
        storage: schema::decode_json_value(storage)?,
    })
}

/// write a config file
pub fn write_config(path: &Path, conf: &Config) -> Result<()> {
    let doc = json!({ "storage": &conf.storage });
    let data = serde_json::to_vec_pretty(&doc)?;
    fs::write(path, data).with_path(path)?;
    Ok(())
}

/// create a store directory with a config file and backend layout
pub fn init_dir(dir: &Path, conf: &Config) -> Result<()> {
    let cfg_path = dir.join(CONFIG_NAME);
    if cfg_path.exists() {
        return Err(Error::TargetExists(cfg_path));
    }
    fs::create_dir_all(dir).with_path(dir)?;
    if let Object::LocalDirConfig(c) = &conf.storage {
        LocalStorage::new(&dir.join(&c.dir), true)?;
    }
    write_config(&cfg_path, conf)
}
