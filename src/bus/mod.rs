//! Message bus port and the events exchanged with the rest of the system.
//!
//! The engine only assumes that all events of one outbound batch are handed
//! to subscribers together. Ordering across batches is not relied upon.

pub mod memory;
pub mod outbox;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::model::{ArchiveSource, RequestResultInfo, RequestType};
use crate::safe_path::{check_relative, check_segment};

/// Asks the packaging engine to archive one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileArchiveRequestEvent {
    pub request_id: i64,
    pub storage: String,
    pub checksum: String,
    pub file_name: String,
    pub storage_subdirectory: String,
    pub final_archive_parent_url: String,
    pub final_archive_parent_path: String,
    pub file_size: u64,
    /// Where the backend reads the content from when writing the package.
    #[serde(default)]
    pub origin_url: Option<String>,
    /// `request_id` is unique within this source only.
    #[serde(default)]
    pub source: ArchiveSource,
}

impl FileArchiveRequestEvent {
    pub fn validate(&self) -> Result<()> {
        let mandatory = [
            ("storage", &self.storage),
            ("checksum", &self.checksum),
            ("file_name", &self.file_name),
            ("final_archive_parent_url", &self.final_archive_parent_url),
        ];
        for (field, value) in mandatory {
            if value.trim().is_empty() {
                return Err(EngineError::validation(format!(
                    "archive request {}: {} is mandatory",
                    self.request_id, field
                )));
            }
        }
        check_segment("checksum", &self.checksum)?;
        check_segment("file_name", &self.file_name)?;
        check_relative("storage_subdirectory", &self.storage_subdirectory)?;
        Ok(())
    }
}

/// Outcome of an archive request: the predicted URL, or a failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileArchiveResponseEvent {
    pub request_id: i64,
    pub file_url: Option<String>,
    pub error: bool,
    pub error_cause: Option<String>,
    /// Source of the answered request.
    #[serde(default)]
    pub source: ArchiveSource,
}

impl FileArchiveResponseEvent {
    pub fn success(request_id: i64, file_url: String) -> Self {
        Self {
            request_id,
            file_url: Some(file_url),
            error: false,
            error_cause: None,
            source: ArchiveSource::External,
        }
    }

    pub fn failure(request_id: i64, cause: impl Into<String>) -> Self {
        Self {
            request_id,
            file_url: None,
            error: true,
            error_cause: Some(cause.into()),
            source: ArchiveSource::External,
        }
    }

    pub fn with_source(mut self, source: ArchiveSource) -> Self {
        self.source = source;
        self
    }
}

/// Sent once every member of a request group has an outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGroupResultEvent {
    pub group_id: String,
    pub request_type: RequestType,
    /// True when at least one member failed.
    pub error: bool,
    pub results: Vec<RequestResultInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BusEvent {
    FileArchiveRequest(FileArchiveRequestEvent),
    FileArchiveResponse(FileArchiveResponseEvent),
    RequestGroupResult(RequestGroupResultEvent),
}

/// Receives whole batches from the bus.
pub trait BatchHandler: Send + Sync {
    fn name(&self) -> &str;

    /// Handle one batch. Returning an error leaves the batch in the outbox so
    /// it is delivered again, so handlers must tolerate redelivery.
    fn handle_batch(&self, events: &[BusEvent]) -> Result<()>;
}

/// Abstract batched publish/subscribe transport.
pub trait MessageBus: Send + Sync {
    fn publish_batch(&self, events: Vec<BusEvent>) -> Result<()>;

    fn subscribe_batch(&self, handler: Arc<dyn BatchHandler>);
}
