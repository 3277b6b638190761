//! Persistent entities of the request ledger and the packaging engine.

pub mod status;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};
pub use status::{FileStatus, PackageStatus, RequestStatus};

/// Operation carried by a ledger request and by its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Store,
    Copy,
    Delete,
    /// Make a file available from an offline tier (restore to cache).
    Cache,
}

impl RequestType {
    pub const ALL: [RequestType; 4] = [
        RequestType::Store,
        RequestType::Copy,
        RequestType::Delete,
        RequestType::Cache,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestType::Store => "STORE",
            RequestType::Copy => "COPY",
            RequestType::Delete => "DELETE",
            RequestType::Cache => "CACHE",
        }
    }
}

impl fmt::Display for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "STORE" => Ok(RequestType::Store),
            "COPY" => Ok(RequestType::Copy),
            "DELETE" => Ok(RequestType::Delete),
            "CACHE" | "AVAILABILITY" => Ok(RequestType::Cache),
            other => Err(EngineError::validation(format!("unknown request type: {}", other))),
        }
    }
}

/// Who asked for a file to be archived. Request ids are only unique within
/// one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveSource {
    /// A store request of this engine's ledger.
    Ledger,
    /// A request received from the bus.
    #[default]
    External,
}

impl ArchiveSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArchiveSource::Ledger => "LEDGER",
            ArchiveSource::External => "EXTERNAL",
        }
    }
}

impl fmt::Display for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArchiveSource {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LEDGER" => Ok(ArchiveSource::Ledger),
            "EXTERNAL" => Ok(ArchiveSource::External),
            other => Err(EngineError::validation(format!("unknown archive source: {}", other))),
        }
    }
}

/// A durable ledger row. One per `(request_type, checksum, storage)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRequest {
    pub id: i64,
    pub request_type: RequestType,
    pub checksum: String,
    pub algorithm: String,
    pub storage: String,
    pub sub_directory: Option<String>,
    pub origin_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: u64,
    pub owners: BTreeSet<String>,
    pub session_owner: Option<String>,
    pub session: Option<String>,
    pub group_ids: BTreeSet<String>,
    pub status: RequestStatus,
    pub error_cause: Option<String>,
    pub creation_date: DateTime<Utc>,
}

/// The fields a caller supplies for a new ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFileRequest {
    pub request_type: RequestType,
    pub checksum: String,
    pub algorithm: String,
    pub storage: String,
    pub sub_directory: Option<String>,
    pub origin_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: u64,
    pub owner: Option<String>,
    pub session_owner: Option<String>,
    pub session: Option<String>,
}

/// Outcome of submitting a request to the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Created(i64),
    /// Merged into the existing active row with this id.
    Merged(i64),
}

impl SubmitOutcome {
    pub fn id(&self) -> i64 {
        match self {
            SubmitOutcome::Created(id) | SubmitOutcome::Merged(id) => *id,
        }
    }
}

/// A file waiting for, or bound to, a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileInBuildingPackage {
    pub id: i64,
    pub source: ArchiveSource,
    pub storage_request_id: i64,
    pub storage: String,
    pub checksum: String,
    pub filename: String,
    pub storage_subdirectory: String,
    pub final_archive_parent_url: String,
    pub final_archive_parent_path: String,
    pub origin_url: Option<String>,
    pub size: u64,
    pub status: FileStatus,
    pub package_id: Option<i64>,
    pub error_cause: Option<String>,
    pub creation_date: DateTime<Utc>,
}

/// A logical archive aggregating small files for one `(storage, subdirectory)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageReference {
    pub id: i64,
    pub storage: String,
    pub storage_subdirectory: String,
    pub size: u64,
    pub status: PackageStatus,
    /// Package-scoped unique token used in predicted file URLs.
    pub archive_name: String,
    pub stored_url: Option<String>,
    pub error_cause: Option<String>,
    pub creation_date: DateTime<Utc>,
}

/// A batch submitted by a caller under one correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestGroup {
    pub id: String,
    pub request_type: RequestType,
    /// Number of distinct requests that must report before resolution.
    pub expected: u32,
    pub creation_date: DateTime<Utc>,
}

/// The outcome of one member request of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestResultInfo {
    pub group_id: String,
    pub request_type: RequestType,
    pub result_file_url: Option<String>,
    pub request_checksum: String,
    pub request_storage: String,
    pub error: bool,
    pub error_cause: Option<String>,
}

pub(crate) fn to_millis(date: &DateTime<Utc>) -> i64 {
    date.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or_default()
}
