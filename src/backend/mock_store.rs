//! Mock implementation of BackendAdapter for testing

use log::info;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::backend::{execute_per_file, BackendAdapter, FileOutcome, PackageContents, WorkingFile, WorkingSubset};
use crate::config::StorageDefinition;
use crate::error::{EngineError, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory backend with failure injection
pub struct MockStore {
    name: String,
    subset_size: usize,
    // checksum -> url
    files: Mutex<HashMap<String, String>>,
    packages: Mutex<Vec<PackageContents>>,
    failing: Mutex<HashSet<String>>,
    fail_packages: AtomicBool,
    executed_subsets: AtomicUsize,
}

impl MockStore {
    pub fn new(definition: &StorageDefinition) -> Self {
        Self::named(&definition.name, definition.subset_size)
    }

    pub fn named(name: &str, subset_size: usize) -> Self {
        Self {
            name: name.to_string(),
            subset_size: subset_size.max(1),
            files: Mutex::new(HashMap::new()),
            packages: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            fail_packages: AtomicBool::new(false),
            executed_subsets: AtomicUsize::new(0),
        }
    }

    /// Every operation on `checksum` fails from now on.
    pub fn fail_checksum(&self, checksum: &str) {
        lock(&self.failing).insert(checksum.to_string());
    }

    pub fn fail_packages(&self, fail: bool) {
        self.fail_packages.store(fail, Ordering::SeqCst);
    }

    pub fn contains(&self, checksum: &str) -> bool {
        lock(&self.files).contains_key(checksum)
    }

    pub fn file_count(&self) -> usize {
        lock(&self.files).len()
    }

    /// Archive names of the packages written so far.
    pub fn stored_packages(&self) -> Vec<String> {
        lock(&self.packages).iter().map(|p| p.archive_name.clone()).collect()
    }

    pub fn package(&self, archive_name: &str) -> Option<PackageContents> {
        lock(&self.packages).iter().find(|p| p.archive_name == archive_name).cloned()
    }

    pub fn executed_subsets(&self) -> usize {
        self.executed_subsets.load(Ordering::SeqCst)
    }

    fn check(&self, checksum: &str) -> Result<()> {
        if lock(&self.failing).contains(checksum) {
            return Err(EngineError::backend(&self.name, format!("injected failure for {}", checksum)));
        }
        Ok(())
    }
}

impl BackendAdapter for MockStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn store(&self, file: &WorkingFile) -> Result<String> {
        self.check(&file.checksum)?;
        let url = match &file.sub_directory {
            Some(dir) => format!("mock://{}/{}/{}", self.name, dir, file.checksum),
            None => format!("mock://{}/{}", self.name, file.checksum),
        };
        lock(&self.files).insert(file.checksum.clone(), url.clone());
        Ok(url)
    }

    fn store_package(&self, contents: &PackageContents) -> Result<String> {
        if self.fail_packages.load(Ordering::SeqCst) {
            return Err(EngineError::backend(&self.name, "injected package failure"));
        }
        for file in &contents.files {
            self.check(&file.checksum)?;
        }
        let url = format!(
            "mock://{}/{}/{}.zip",
            self.name, contents.storage_subdirectory, contents.archive_name
        );
        lock(&self.packages).push(contents.clone());
        info!("Mock package {} written with {} files", contents.archive_name, contents.files.len());
        Ok(url)
    }

    fn delete(&self, checksum: &str, _storage: &str) -> Result<()> {
        self.check(checksum)?;
        lock(&self.files).remove(checksum);
        Ok(())
    }

    fn restore(&self, file: &WorkingFile) -> Result<String> {
        self.check(&file.checksum)?;
        if !self.contains(&file.checksum) {
            return Err(EngineError::backend(&self.name, format!("{} is not stored here", file.checksum)));
        }
        Ok(format!("mock://{}/cache/{}", self.name, file.checksum))
    }

    fn subset_size(&self) -> usize {
        self.subset_size
    }

    fn execute(&self, subset: &WorkingSubset) -> Vec<FileOutcome> {
        self.executed_subsets.fetch_add(1, Ordering::SeqCst);
        execute_per_file(self, subset)
    }
}
