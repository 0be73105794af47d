use std::path::Path;
use std::sync::Arc;

use slatedb::object_store::ObjectStore;
use slatedb::Db;
use thiserror::Error;

use crate::settings::Backend;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("slatedb error: {0}")]
    Slate(#[from] slatedb::Error),
    #[error("invalid object store location {location}: {message}")]
    InvalidLocation { location: String, message: String },
}

/// Object store backing a SlateDB database, plus the path the database
/// should be opened at.
pub struct ResolvedStore {
    pub store: Arc<dyn ObjectStore>,
    pub db_path: String,
}

pub fn resolve_object_store(backend: &Backend, path: &str) -> Result<ResolvedStore, StorageError> {
    match backend {
        Backend::Fs => local_store(path),
        Backend::Memory => Ok(ResolvedStore {
            store: Arc::new(slatedb::object_store::memory::InMemory::new()),
            db_path: path.to_string(),
        }),
        // `path` is a URL such as s3://bucket/prefix or gs://bucket/prefix.
        Backend::S3 | Backend::Gcs | Backend::Url => Ok(ResolvedStore {
            store: Db::resolve_object_store(path)?,
            db_path: path.to_string(),
        }),
    }
}

fn local_store(path: &str) -> Result<ResolvedStore, StorageError> {
    let invalid = |message: String| StorageError::InvalidLocation {
        location: path.to_string(),
        message,
    };
    let root = Path::new(path);
    std::fs::create_dir_all(root).map_err(|e| invalid(format!("create root: {e}")))?;
    // Relative roots such as "./data" are URL-encoded inconsistently by the
    // object store, so always hand it an absolute path.
    let absolute = root
        .canonicalize()
        .map_err(|e| invalid(format!("canonicalize: {e}")))?
        .to_string_lossy()
        .into_owned();
    let fs = slatedb::object_store::local::LocalFileSystem::new_with_prefix(&absolute)
        .map_err(|e| invalid(e.to_string()))?;
    Ok(ResolvedStore {
        store: Arc::new(fs),
        db_path: absolute,
    })
}
