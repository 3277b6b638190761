//! Archive intake and package dispatch
//!
//! Inbound `FileArchiveRequestEvent`s become waiting files. Closed packages
//! are handed to their storage backend, and the outcome flags the package and
//! its files `STORED`/`PACKAGED` or `ERROR`.

use log::{debug, error, info};
use std::sync::Arc;

use crate::backend::{BackendRegistry, PackageContents, PackagedFile};
use crate::bus::{BatchHandler, BusEvent, FileArchiveRequestEvent};
use crate::error::{EngineError, Result};
use crate::model::{ArchiveSource, PackageReference, PackageStatus};
use crate::packaging::PackageStore;

/// Result of one package dispatch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackageDispatchReport {
    pub stored: usize,
    pub failed: usize,
}

pub struct ArchiveService {
    packages: Arc<dyn PackageStore>,
    backends: Arc<BackendRegistry>,
    page_size: usize,
}

impl ArchiveService {
    pub fn new(packages: Arc<dyn PackageStore>, backends: Arc<BackendRegistry>, page_size: usize) -> Self {
        Self {
            packages,
            backends,
            page_size: page_size.max(1),
        }
    }

    /// Write every `TO_STORE` package, one page at a time.
    pub fn dispatch_packages(&self) -> Result<PackageDispatchReport> {
        let mut report = PackageDispatchReport::default();
        loop {
            let closed = self.packages.packages_by_status(PackageStatus::ToStore, self.page_size)?;
            if closed.is_empty() {
                break;
            }
            for package in closed {
                match self.write_package(&package) {
                    Ok(url) => {
                        self.packages.mark_package_stored(package.id, &url)?;
                        report.stored += 1;
                    }
                    Err(e) => {
                        error!("Package {} could not be written: {}", package.id, e);
                        self.packages.mark_package_error(package.id, &e.to_string())?;
                        report.failed += 1;
                    }
                }
            }
        }
        if report.stored + report.failed > 0 {
            info!("Package dispatch: {} stored, {} failed", report.stored, report.failed);
        }
        Ok(report)
    }

    fn write_package(&self, package: &PackageReference) -> Result<String> {
        let backend = self.backends.get(&package.storage)?;
        let files = self.packages.files_of_package(package.id)?;
        let parent_path = files
            .first()
            .map(|f| f.final_archive_parent_path.clone())
            .ok_or_else(|| EngineError::Internal(format!("package {} has no file", package.id)))?;
        let contents = PackageContents {
            package_id: package.id,
            storage: package.storage.clone(),
            storage_subdirectory: package.storage_subdirectory.clone(),
            archive_name: package.archive_name.clone(),
            parent_path,
            files: files
                .into_iter()
                .map(|f| PackagedFile {
                    request_id: f.storage_request_id,
                    checksum: f.checksum,
                    filename: f.filename,
                    origin_url: f.origin_url,
                    size: f.size,
                })
                .collect(),
        };
        debug!(
            "Writing package {} ({} files, {} bytes) to {}",
            package.archive_name,
            contents.files.len(),
            package.size,
            package.storage
        );
        backend.store_package(&contents)
    }
}

impl BatchHandler for ArchiveService {
    fn name(&self) -> &str {
        "archive-intake"
    }

    fn handle_batch(&self, events: &[BusEvent]) -> Result<()> {
        for event in events {
            if let BusEvent::FileArchiveRequest(request) = event {
                // ids on the bus belong to the caller, never to the ledger
                let request = FileArchiveRequestEvent {
                    source: ArchiveSource::External,
                    ..request.clone()
                };
                match self.packages.insert_waiting(&request) {
                    Ok(_) => {}
                    Err(EngineError::Validation(cause)) => self.packages.reject_request(&request, &cause)?,
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(())
    }
}
