//! Application of per-file outcomes to the ledger and resolution of groups

use log::{debug, warn};
use std::sync::Arc;

use crate::backend::FileOutcome;
use crate::bus::{BatchHandler, BusEvent, FileArchiveResponseEvent, RequestGroupResultEvent};
use crate::error::Result;
use crate::ledger::{GroupLedger, RequestLedger};
use crate::model::ArchiveSource;

pub struct ResultService {
    ledger: Arc<dyn RequestLedger>,
    groups: Arc<dyn GroupLedger>,
}

impl ResultService {
    pub fn new(ledger: Arc<dyn RequestLedger>, groups: Arc<dyn GroupLedger>) -> Self {
        Self { ledger, groups }
    }

    /// Record backend outcomes. Successful requests are completed and removed.
    pub fn apply_outcomes(&self, outcomes: &[FileOutcome]) -> Result<(usize, usize)> {
        let mut done = Vec::new();
        let mut failed = 0;
        for outcome in outcomes {
            match outcome {
                FileOutcome::Success { request_id, url } => {
                    if self.ledger.complete(*request_id, url.as_deref())?.is_some() {
                        done.push(*request_id);
                    }
                }
                FileOutcome::Failure { request_id, cause } => {
                    match self.ledger.mark_error(*request_id, cause)? {
                        Some(_) => failed += 1,
                        None => warn!("Failure for unknown or finished request {}: {}", request_id, cause),
                    }
                }
            }
        }
        let removed = self.ledger.remove_done(&done)?;
        debug!("Applied {} outcomes: {} done, {} failed", outcomes.len(), removed, failed);
        Ok((removed, failed))
    }

    fn archive_outcome(response: &FileArchiveResponseEvent) -> FileOutcome {
        if response.error {
            FileOutcome::Failure {
                request_id: response.request_id,
                cause: response
                    .error_cause
                    .clone()
                    .unwrap_or_else(|| "archive failed".to_string()),
            }
        } else {
            FileOutcome::Success {
                request_id: response.request_id,
                url: response.file_url.clone(),
            }
        }
    }

    /// Remove resolved groups; their result events wait in the outbox.
    pub fn resolve_groups(&self, limit: usize) -> Result<Vec<RequestGroupResultEvent>> {
        let resolved = self.groups.take_resolved(limit)?;
        let failed = resolved.iter().filter(|event| event.error).count();
        if failed > 0 {
            warn!("{} of {} resolved groups carry errors", failed, resolved.len());
        }
        Ok(resolved)
    }
}

impl BatchHandler for ResultService {
    fn name(&self) -> &str {
        "ledger-results"
    }

    fn handle_batch(&self, events: &[BusEvent]) -> Result<()> {
        let outcomes: Vec<FileOutcome> = events
            .iter()
            .filter_map(|event| match event {
                BusEvent::FileArchiveResponse(response) if response.source == ArchiveSource::Ledger => {
                    Some(Self::archive_outcome(response))
                }
                _ => None,
            })
            .collect();
        if outcomes.is_empty() {
            return Ok(());
        }
        self.apply_outcomes(&outcomes)?;
        Ok(())
    }
}
