//! Storage Backend Abstraction
//!
//! The engine never writes bytes itself: every physical store, delete or
//! restore goes through a `BackendAdapter`. Tiered backends stage work in
//! working subsets and report one outcome per file, even when part of the
//! subset fails.

pub mod local_store;
pub mod mock_store;


use log::info;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{BackendKind, StorageDefinition};
use crate::error::{EngineError, Result};
use crate::model::{FileRequest, RequestType};

use self::local_store::LocalStore;
use self::mock_store::MockStore;

/// A ledger request as seen by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingFile {
    pub request_id: i64,
    pub request_type: RequestType,
    pub checksum: String,
    pub algorithm: String,
    pub storage: String,
    pub sub_directory: Option<String>,
    pub origin_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: u64,
}

impl From<&FileRequest> for WorkingFile {
    fn from(request: &FileRequest) -> Self {
        Self {
            request_id: request.id,
            request_type: request.request_type,
            checksum: request.checksum.clone(),
            algorithm: request.algorithm.clone(),
            storage: request.storage.clone(),
            sub_directory: request.sub_directory.clone(),
            origin_url: request.origin_url.clone(),
            file_name: request.file_name.clone(),
            file_size: request.file_size,
        }
    }
}

/// Files staged together for one physical operation.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkingSubset {
    pub storage: String,
    pub files: Vec<WorkingFile>,
}

/// Per-file result of executing a working subset.
#[derive(Debug, Clone, PartialEq)]
pub enum FileOutcome {
    /// `url` is the stored or restored location, `None` for deletions.
    Success { request_id: i64, url: Option<String> },
    Failure { request_id: i64, cause: String },
}

impl FileOutcome {
    pub fn from_result(request_id: i64, result: Result<Option<String>>) -> Self {
        match result {
            Ok(url) => FileOutcome::Success { request_id, url },
            Err(e) => FileOutcome::Failure {
                request_id,
                cause: e.to_string(),
            },
        }
    }

    pub fn request_id(&self) -> i64 {
        match self {
            FileOutcome::Success { request_id, .. } | FileOutcome::Failure { request_id, .. } => *request_id,
        }
    }
}

/// One file inside a package.
#[derive(Debug, Clone, PartialEq)]
pub struct PackagedFile {
    pub request_id: i64,
    pub checksum: String,
    pub filename: String,
    pub origin_url: Option<String>,
    pub size: u64,
}

/// Everything a backend needs to write one package.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageContents {
    pub package_id: i64,
    pub storage: String,
    pub storage_subdirectory: String,
    pub archive_name: String,
    /// Directory the archive is written to.
    pub parent_path: String,
    pub files: Vec<PackagedFile>,
}

/// Physical operations of one storage.
pub trait BackendAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// Store (or copy) one file. Returns its URL.
    fn store(&self, file: &WorkingFile) -> Result<String>;

    /// Write a closed package as one archive. Returns the archive URL.
    fn store_package(&self, contents: &PackageContents) -> Result<String>;

    fn delete(&self, checksum: &str, storage: &str) -> Result<()>;

    /// Make a file from an offline tier available. Returns where it can be read.
    fn restore(&self, file: &WorkingFile) -> Result<String>;

    fn subset_size(&self) -> usize {
        100
    }

    /// Split files into working subsets.
    fn prepare(&self, files: Vec<WorkingFile>) -> Vec<WorkingSubset> {
        let size = self.subset_size().max(1);
        let mut subsets = Vec::new();
        let mut current: Vec<WorkingFile> = Vec::with_capacity(size);
        for file in files {
            current.push(file);
            if current.len() == size {
                subsets.push(WorkingSubset {
                    storage: self.name().to_string(),
                    files: std::mem::take(&mut current),
                });
            }
        }
        if !current.is_empty() {
            subsets.push(WorkingSubset {
                storage: self.name().to_string(),
                files: current,
            });
        }
        subsets
    }

    /// Run a subset, one outcome per file.
    fn execute(&self, subset: &WorkingSubset) -> Vec<FileOutcome> {
        execute_per_file(self, subset)
    }
}

/// Run each file of `subset` through the single-file operations.
pub fn execute_per_file<B: BackendAdapter + ?Sized>(backend: &B, subset: &WorkingSubset) -> Vec<FileOutcome> {
    subset
        .files
        .iter()
        .map(|file| {
            let result = match file.request_type {
                RequestType::Store | RequestType::Copy => backend.store(file).map(Some),
                RequestType::Delete => backend.delete(&file.checksum, &file.storage).map(|_| None),
                RequestType::Cache => backend.restore(file).map(Some),
            };
            FileOutcome::from_result(file.request_id, result)
        })
        .collect()
}

/// Backends and their definitions, by storage name.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn BackendAdapter>>,
    definitions: HashMap<String, StorageDefinition>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create one backend per configured storage.
    pub fn from_config(storages: &[StorageDefinition]) -> Result<Self> {
        let mut registry = Self::new();
        for definition in storages {
            let backend: Arc<dyn BackendAdapter> = match definition.kind {
                BackendKind::Local => Arc::new(LocalStore::new(definition)?),
                BackendKind::Mock => Arc::new(MockStore::new(definition)),
            };
            info!(
                "Storage {} served by {:?} backend (packaging: {})",
                definition.name, definition.kind, definition.packaging
            );
            registry.register(definition.clone(), backend);
        }
        Ok(registry)
    }

    pub fn register(&mut self, definition: StorageDefinition, backend: Arc<dyn BackendAdapter>) {
        self.backends.insert(definition.name.clone(), backend);
        self.definitions.insert(definition.name.clone(), definition);
    }

    pub fn get(&self, storage: &str) -> Result<Arc<dyn BackendAdapter>> {
        self.backends
            .get(storage)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("storage {}", storage)))
    }

    pub fn definition(&self, storage: &str) -> Option<&StorageDefinition> {
        self.definitions.get(storage)
    }

    pub fn contains(&self, storage: &str) -> bool {
        self.backends.contains_key(storage)
    }

    /// Store requests for this storage go through the packaging engine.
    pub fn is_packaging(&self, storage: &str) -> bool {
        self.definitions.get(storage).map(|d| d.packaging).unwrap_or(false)
    }

    pub fn storages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}
