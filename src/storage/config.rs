//! opening backends from configuration envelopes

use std::path::Path;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::Object;

use super::{HttpClient, LocalStorage, Storage};

/// open the backend described by a configuration schema object
///
/// relative local paths are resolved against `base`, the directory holding
/// the configuration file.
pub fn open_storage(base: &Path, conf: &Object) -> Result<Arc<dyn Storage>> {
    match conf {
        Object::LocalDirConfig(c) => {
            let dir = base.join(&c.dir);
            Ok(Arc::new(LocalStorage::new(&dir, false)?))
        }
        Object::HttpClientConfig(c) => Ok(Arc::new(HttpClient::new(&c.url))),
        other => Err(Error::UnsupportedType(other.type_name().to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{LocalDirConfig, WebContent};
    use crate::hash::Ref;

    #[test]
    fn test_open_local() {
        let dir = tempfile::tempdir().unwrap();
        LocalStorage::new(&dir.path().join("store"), true).unwrap();

        let conf = Object::LocalDirConfig(LocalDirConfig {
            dir: "store".to_string(),
        });
        assert!(open_storage(dir.path(), &conf).is_ok());
    }

    #[test]
    fn test_open_rejects_non_config() {
        let dir = tempfile::tempdir().unwrap();
        let conf = Object::WebContent(WebContent {
            url: "https://example.com".into(),
            r#ref: Ref::from_bytes(b"x"),
            size: 1,
            etag: String::new(),
            ts: None,
        });
        assert!(matches!(
            open_storage(dir.path(), &conf),
            Err(Error::UnsupportedType(_))
        ));
    }
}
