//! Request Ledger
//!
//! Durable bookkeeping of file requests and of the groups callers submit them
//! in. A request is unique per `(request_type, checksum, storage)`: submitting
//! the same key again merges owners and group ids into the existing row.

pub mod sqlite_store;

#[cfg(test)]
mod comprehensive_test;

use chrono::{DateTime, Utc};

use crate::bus::RequestGroupResultEvent;
use crate::error::Result;
use crate::model::{
    FileRequest, NewFileRequest, RequestGroup, RequestResultInfo, RequestStatus, RequestType,
    SubmitOutcome,
};

/// Durable table of file requests.
pub trait RequestLedger: Send + Sync {
    /// Create a row, or merge into the active row with the same key.
    fn submit(&self, request: NewFileRequest, group_id: Option<&str>) -> Result<SubmitOutcome>;

    /// Create a group and submit all of its members in one transaction.
    fn submit_group(
        &self,
        group_id: &str,
        request_type: RequestType,
        requests: Vec<NewFileRequest>,
    ) -> Result<Vec<SubmitOutcome>>;

    fn find(&self, id: i64) -> Result<Option<FileRequest>>;

    fn find_by_key(&self, request_type: RequestType, checksum: &str, storage: &str) -> Result<Option<FileRequest>>;

    /// Oldest-first page of requests in `status`.
    fn page_by_status(&self, request_type: RequestType, status: RequestStatus, limit: usize) -> Result<Vec<FileRequest>>;

    /// `TODO -> PENDING` for each id still in `TODO`. Returns the ids moved.
    fn mark_pending(&self, ids: &[i64]) -> Result<Vec<i64>>;

    /// `-> DONE` and record a successful result in every group of the request.
    fn complete(&self, id: i64, result_url: Option<&str>) -> Result<Option<FileRequest>>;

    /// Delete rows in `DONE`.
    fn remove_done(&self, ids: &[i64]) -> Result<usize>;

    /// `-> ERROR` with `cause` and record failed results. Idempotent.
    fn mark_error(&self, id: i64, cause: &str) -> Result<Option<FileRequest>>;

    /// Forced re-submission: `ERROR -> TODO`.
    fn retry_errors(&self, request_type: RequestType, storage: Option<&str>) -> Result<usize>;

    /// Administrative deletion of `ERROR` rows.
    fn delete_errors(&self, request_type: RequestType, storage: Option<&str>) -> Result<usize>;

    /// Fail every `TODO` request created before `cutoff`.
    fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<FileRequest>>;

    /// `PENDING -> TODO` for requests whose dispatch was interrupted. Requests
    /// handed to the packaging engine are left alone.
    fn requeue_interrupted(&self) -> Result<usize>;
}

/// Fan-in of per-request outcomes under caller-supplied group ids.
pub trait GroupLedger: Send + Sync {
    fn find_group(&self, id: &str) -> Result<Option<RequestGroup>>;

    fn results(&self, group_id: &str) -> Result<Vec<RequestResultInfo>>;

    /// Remove up to `limit` groups whose members all reported, queueing one
    /// `RequestGroupResultEvent` per group in the outbox.
    fn take_resolved(&self, limit: usize) -> Result<Vec<RequestGroupResultEvent>>;
}
