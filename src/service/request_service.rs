//! Intake of request groups into the ledger

use log::{debug, info};
use serde::Serialize;
use std::sync::Arc;

use crate::backend::BackendRegistry;
use crate::dto::FileRequestDto;
use crate::error::{EngineError, Result};
use crate::ledger::{GroupLedger, RequestLedger};
use crate::model::{RequestGroup, RequestResultInfo, RequestType, SubmitOutcome};
use crate::service::user_context::UserContext;

/// Current state of a group that has not been resolved yet.
#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: RequestGroup,
    pub results: Vec<RequestResultInfo>,
}

/// Counts returned to the caller after a group submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubmitSummary {
    pub group_id: String,
    pub created: usize,
    pub merged: usize,
}

pub struct RequestService {
    ledger: Arc<dyn RequestLedger>,
    groups: Arc<dyn GroupLedger>,
    backends: Arc<BackendRegistry>,
}

impl RequestService {
    pub fn new(ledger: Arc<dyn RequestLedger>, groups: Arc<dyn GroupLedger>, backends: Arc<BackendRegistry>) -> Self {
        Self { ledger, groups, backends }
    }

    /// Submit validated DTOs as one group.
    pub fn submit_group<D: FileRequestDto>(
        &self,
        group_id: &str,
        requests: Vec<D>,
        context: &UserContext,
    ) -> Result<SubmitSummary> {
        let group_id = group_id.trim();
        if group_id.is_empty() {
            return Err(EngineError::validation("group id is mandatory"));
        }
        let request_type = match requests.first() {
            Some(first) => first.request_type(),
            None => return Err(EngineError::validation(format!("group {} has no request", group_id))),
        };
        if let Some(unknown) = requests.iter().find(|r| !self.backends.contains(r.storage())) {
            return Err(EngineError::validation(format!(
                "unknown storage {} for checksum {}",
                unknown.storage(),
                unknown.checksum()
            )));
        }

        let rows = requests.into_iter().map(|dto| dto.into_new_request(context)).collect();
        let outcomes = self.ledger.submit_group(group_id, request_type, rows)?;

        let mut summary = SubmitSummary {
            group_id: group_id.to_string(),
            ..SubmitSummary::default()
        };
        for outcome in &outcomes {
            match outcome {
                SubmitOutcome::Created(_) => summary.created += 1,
                SubmitOutcome::Merged(_) => summary.merged += 1,
            }
        }
        info!(
            "Group {} accepted for user {}: {} created, {} merged",
            group_id, context.user_id, summary.created, summary.merged
        );
        Ok(summary)
    }

    pub fn group_status(&self, group_id: &str) -> Result<GroupStatus> {
        let group = self
            .groups
            .find_group(group_id)?
            .ok_or_else(|| EngineError::NotFound(format!("group {}", group_id)))?;
        let results = self.groups.results(group_id)?;
        debug!("Group {} has {}/{} results", group_id, results.len(), group.expected);
        Ok(GroupStatus { group, results })
    }

    pub fn retry_errors(&self, request_type: RequestType, storage: Option<&str>) -> Result<usize> {
        self.ledger.retry_errors(request_type, storage)
    }

    pub fn delete_errors(&self, request_type: RequestType, storage: Option<&str>) -> Result<usize> {
        self.ledger.delete_errors(request_type, storage)
    }
}
