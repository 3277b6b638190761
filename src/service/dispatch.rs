//! Dispatch of `TODO` requests
//!
//! Store requests targeting a packaging storage are handed to the packaging
//! engine. Everything else goes to the storage backend in working subsets.
//! A request is flagged `PENDING` before any physical operation starts.

use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::backend::{BackendRegistry, FileOutcome, WorkingFile};
use crate::bus::FileArchiveRequestEvent;
use crate::error::{EngineError, Result};
use crate::ledger::RequestLedger;
use crate::model::{ArchiveSource, FileRequest, RequestStatus, RequestType};
use crate::packaging::PackageStore;
use crate::service::result_service::ResultService;

const MISSING_OUTCOME: &str = "backend reported no outcome for this file";

/// Counts of one dispatch run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub packaged: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl DispatchReport {
    fn absorb(&mut self, other: DispatchReport) {
        self.packaged += other.packaged;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }

    fn handled(&self) -> usize {
        self.packaged + self.succeeded + self.failed
    }
}

pub struct RequestDispatcher {
    ledger: Arc<dyn RequestLedger>,
    packages: Arc<dyn PackageStore>,
    backends: Arc<BackendRegistry>,
    results: Arc<ResultService>,
    page_size: usize,
}

impl RequestDispatcher {
    pub fn new(
        ledger: Arc<dyn RequestLedger>,
        packages: Arc<dyn PackageStore>,
        backends: Arc<BackendRegistry>,
        results: Arc<ResultService>,
        page_size: usize,
    ) -> Self {
        Self {
            ledger,
            packages,
            backends,
            results,
            page_size: page_size.max(1),
        }
    }

    /// Dispatch every `TODO` request of every type.
    pub fn dispatch_all(&self) -> Result<DispatchReport> {
        let mut total = DispatchReport::default();
        for request_type in RequestType::ALL {
            total.absorb(self.dispatch(request_type)?);
        }
        Ok(total)
    }

    /// Dispatch `TODO` requests of one type, page by page.
    pub fn dispatch(&self, request_type: RequestType) -> Result<DispatchReport> {
        let mut total = DispatchReport::default();
        loop {
            let page = self.ledger.page_by_status(request_type, RequestStatus::Todo, self.page_size)?;
            let full = page.len() == self.page_size;
            if page.is_empty() {
                break;
            }
            let report = self.dispatch_page(page)?;
            total.absorb(report);
            if !full || report.handled() == 0 {
                break;
            }
        }
        if total.handled() > 0 {
            info!(
                "Dispatched {} requests: {} packaged, {} succeeded, {} failed",
                request_type, total.packaged, total.succeeded, total.failed
            );
        }
        Ok(total)
    }

    fn dispatch_page(&self, page: Vec<FileRequest>) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut by_storage: BTreeMap<String, Vec<FileRequest>> = BTreeMap::new();

        for request in page {
            if !self.backends.contains(&request.storage) {
                self.ledger
                    .mark_error(request.id, &format!("unknown storage {}", request.storage))?;
                report.failed += 1;
            } else if request.request_type == RequestType::Store && self.backends.is_packaging(&request.storage) {
                if self.hand_to_packaging(&request)? {
                    report.packaged += 1;
                } else {
                    report.failed += 1;
                }
            } else {
                by_storage.entry(request.storage.clone()).or_default().push(request);
            }
        }

        for (storage, requests) in by_storage {
            let (succeeded, failed) = self.run_on_backend(&storage, requests)?;
            report.succeeded += succeeded;
            report.failed += failed;
        }
        Ok(report)
    }

    /// Record the request as a waiting file, then flag it `PENDING`. Returns
    /// false when the request was failed instead.
    fn hand_to_packaging(&self, request: &FileRequest) -> Result<bool> {
        let definition = self
            .backends
            .definition(&request.storage)
            .ok_or_else(|| EngineError::NotFound(format!("storage {}", request.storage)))?;
        let subdirectory = request.sub_directory.clone().unwrap_or_default();
        let staged = definition.parent_path_for(&subdirectory).and_then(|parent_path| {
            self.stage_waiting(&FileArchiveRequestEvent {
                request_id: request.id,
                storage: request.storage.clone(),
                checksum: request.checksum.clone(),
                file_name: request.file_name.clone().unwrap_or_else(|| request.checksum.clone()),
                storage_subdirectory: subdirectory.clone(),
                final_archive_parent_url: definition.parent_url_for(&subdirectory),
                final_archive_parent_path: parent_path,
                file_size: request.file_size,
                origin_url: request.origin_url.clone(),
                source: ArchiveSource::Ledger,
            })
        });

        match staged {
            Ok(()) => {
                self.ledger.mark_pending(&[request.id])?;
                Ok(true)
            }
            Err(EngineError::Validation(cause)) => {
                self.ledger.mark_error(request.id, &cause)?;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// A retried request may already have a waiting file from an earlier
    /// attempt; that file is reopened so an answer is guaranteed.
    fn stage_waiting(&self, event: &FileArchiveRequestEvent) -> Result<()> {
        if self.packages.insert_waiting(event)? {
            return Ok(());
        }
        match self.packages.reopen(event)? {
            Some(previous) => {
                debug!("Request {} reopened its {} waiting file", event.request_id, previous);
                Ok(())
            }
            None => Err(EngineError::Internal(format!(
                "waiting file of request {} disappeared during dispatch",
                event.request_id
            ))),
        }
    }

    fn run_on_backend(&self, storage: &str, requests: Vec<FileRequest>) -> Result<(usize, usize)> {
        let backend = self.backends.get(storage)?;
        let ids: Vec<i64> = requests.iter().map(|r| r.id).collect();
        let pending = self.ledger.mark_pending(&ids)?;
        if pending.len() < ids.len() {
            warn!("{} requests changed before dispatch on {}", ids.len() - pending.len(), storage);
        }
        let files: Vec<WorkingFile> = requests
            .iter()
            .filter(|r| pending.contains(&r.id))
            .map(WorkingFile::from)
            .collect();

        let mut succeeded = 0;
        let mut failed = 0;
        for subset in backend.prepare(files) {
            let mut reported: HashMap<i64, FileOutcome> = backend
                .execute(&subset)
                .into_iter()
                .map(|outcome| (outcome.request_id(), outcome))
                .collect();
            // every staged file gets exactly one outcome
            let outcomes: Vec<FileOutcome> = subset
                .files
                .iter()
                .map(|file| {
                    reported.remove(&file.request_id).unwrap_or_else(|| {
                        error!("No outcome from {} for request {}", storage, file.request_id);
                        FileOutcome::Failure {
                            request_id: file.request_id,
                            cause: MISSING_OUTCOME.to_string(),
                        }
                    })
                })
                .collect();
            for outcome in &outcomes {
                match outcome {
                    FileOutcome::Success { .. } => succeeded += 1,
                    FileOutcome::Failure { .. } => failed += 1,
                }
            }
            self.results.apply_outcomes(&outcomes)?;
        }
        Ok((succeeded, failed))
    }
}
