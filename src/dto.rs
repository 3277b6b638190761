//! Inbound request DTOs.
//!
//! Mandatory fields are checked when a DTO is built, whether through `new` or
//! through deserialization, so an invalid request never reaches the ledger.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::model::{NewFileRequest, RequestType};
use crate::safe_path::{check_relative, check_segment};
use crate::service::user_context::UserContext;

fn mandatory(field: &str, value: String) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(EngineError::validation(format!("{} is mandatory", field)));
    }
    Ok(trimmed.to_string())
}

fn optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Checksums name files on the storages.
fn checksum(value: String) -> Result<String> {
    let checksum = mandatory("checksum", value)?;
    check_segment("checksum", &checksum)?;
    Ok(checksum)
}

fn sub_directory(value: Option<String>) -> Result<Option<String>> {
    let sub_directory = optional(value);
    if let Some(dir) = &sub_directory {
        check_relative("sub_directory", dir)?;
    }
    Ok(sub_directory)
}

fn file_name(value: Option<String>) -> Result<Option<String>> {
    let file_name = optional(value);
    if let Some(name) = &file_name {
        check_segment("file_name", name)?;
    }
    Ok(file_name)
}

/// Common conversion of a validated DTO into a ledger row.
pub trait FileRequestDto {
    fn request_type(&self) -> RequestType;
    fn checksum(&self) -> &str;
    fn storage(&self) -> &str;
    fn into_new_request(self, context: &UserContext) -> NewFileRequest;
}

#[derive(Debug, Deserialize)]
struct RawStorageRequest {
    owner: String,
    checksum: String,
    algorithm: String,
    origin_url: String,
    storage: String,
    sub_directory: Option<String>,
    file_name: Option<String>,
    #[serde(default)]
    file_size: u64,
}

/// Store a file, read from `origin_url`, into `storage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawStorageRequest")]
pub struct FileStorageRequestDto {
    pub owner: String,
    pub checksum: String,
    pub algorithm: String,
    pub origin_url: String,
    pub storage: String,
    pub sub_directory: Option<String>,
    pub file_name: Option<String>,
    pub file_size: u64,
}

impl FileStorageRequestDto {
    pub fn new(
        owner: impl Into<String>,
        checksum: impl Into<String>,
        algorithm: impl Into<String>,
        origin_url: impl Into<String>,
        storage: impl Into<String>,
        sub_directory: Option<String>,
    ) -> Result<Self> {
        Self::try_from(RawStorageRequest {
            owner: owner.into(),
            checksum: checksum.into(),
            algorithm: algorithm.into(),
            origin_url: origin_url.into(),
            storage: storage.into(),
            sub_directory,
            file_name: None,
            file_size: 0,
        })
    }

    pub fn with_file(mut self, name: impl Into<String>, file_size: u64) -> Result<Self> {
        self.file_name = file_name(Some(name.into()))?;
        self.file_size = file_size;
        Ok(self)
    }
}

impl TryFrom<RawStorageRequest> for FileStorageRequestDto {
    type Error = EngineError;

    fn try_from(raw: RawStorageRequest) -> Result<Self> {
        Ok(Self {
            owner: mandatory("owner", raw.owner)?,
            checksum: checksum(raw.checksum)?,
            algorithm: mandatory("algorithm", raw.algorithm)?,
            origin_url: mandatory("origin_url", raw.origin_url)?,
            storage: mandatory("storage", raw.storage)?,
            sub_directory: sub_directory(raw.sub_directory)?,
            file_name: file_name(raw.file_name)?,
            file_size: raw.file_size,
        })
    }
}

impl FileRequestDto for FileStorageRequestDto {
    fn request_type(&self) -> RequestType {
        RequestType::Store
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn storage(&self) -> &str {
        &self.storage
    }

    fn into_new_request(self, context: &UserContext) -> NewFileRequest {
        NewFileRequest {
            request_type: RequestType::Store,
            checksum: self.checksum,
            algorithm: self.algorithm,
            storage: self.storage,
            sub_directory: self.sub_directory,
            origin_url: Some(self.origin_url),
            file_name: self.file_name,
            file_size: self.file_size,
            owner: Some(self.owner),
            session_owner: context.session_owner(),
            session: context.session.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCopyRequest {
    owner: String,
    checksum: String,
    storage: String,
    sub_directory: Option<String>,
    origin_url: Option<String>,
}

/// Copy an already stored file into another storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCopyRequest")]
pub struct FileCopyDto {
    pub owner: String,
    pub checksum: String,
    pub storage: String,
    pub sub_directory: Option<String>,
    pub origin_url: Option<String>,
}

impl FileCopyDto {
    pub fn new(
        owner: impl Into<String>,
        checksum: impl Into<String>,
        storage: impl Into<String>,
        sub_directory: Option<String>,
        origin_url: Option<String>,
    ) -> Result<Self> {
        Self::try_from(RawCopyRequest {
            owner: owner.into(),
            checksum: checksum.into(),
            storage: storage.into(),
            sub_directory,
            origin_url,
        })
    }
}

impl TryFrom<RawCopyRequest> for FileCopyDto {
    type Error = EngineError;

    fn try_from(raw: RawCopyRequest) -> Result<Self> {
        Ok(Self {
            owner: mandatory("owner", raw.owner)?,
            checksum: checksum(raw.checksum)?,
            storage: mandatory("storage", raw.storage)?,
            sub_directory: sub_directory(raw.sub_directory)?,
            origin_url: optional(raw.origin_url),
        })
    }
}

impl FileRequestDto for FileCopyDto {
    fn request_type(&self) -> RequestType {
        RequestType::Copy
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn storage(&self) -> &str {
        &self.storage
    }

    fn into_new_request(self, context: &UserContext) -> NewFileRequest {
        NewFileRequest {
            request_type: RequestType::Copy,
            checksum: self.checksum,
            algorithm: String::new(),
            storage: self.storage,
            sub_directory: self.sub_directory,
            origin_url: self.origin_url,
            file_name: None,
            file_size: 0,
            owner: Some(self.owner),
            session_owner: context.session_owner(),
            session: context.session.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDeletionRequest {
    owner: String,
    checksum: String,
    storage: String,
}

/// Delete a file from a storage on behalf of an owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawDeletionRequest")]
pub struct FileDeletionDto {
    pub owner: String,
    pub checksum: String,
    pub storage: String,
}

impl FileDeletionDto {
    pub fn new(
        owner: impl Into<String>,
        checksum: impl Into<String>,
        storage: impl Into<String>,
    ) -> Result<Self> {
        Self::try_from(RawDeletionRequest {
            owner: owner.into(),
            checksum: checksum.into(),
            storage: storage.into(),
        })
    }
}

impl TryFrom<RawDeletionRequest> for FileDeletionDto {
    type Error = EngineError;

    fn try_from(raw: RawDeletionRequest) -> Result<Self> {
        Ok(Self {
            owner: mandatory("owner", raw.owner)?,
            checksum: checksum(raw.checksum)?,
            storage: mandatory("storage", raw.storage)?,
        })
    }
}

impl FileRequestDto for FileDeletionDto {
    fn request_type(&self) -> RequestType {
        RequestType::Delete
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn storage(&self) -> &str {
        &self.storage
    }

    fn into_new_request(self, context: &UserContext) -> NewFileRequest {
        NewFileRequest {
            request_type: RequestType::Delete,
            checksum: self.checksum,
            algorithm: String::new(),
            storage: self.storage,
            sub_directory: None,
            origin_url: None,
            file_name: None,
            file_size: 0,
            owner: Some(self.owner),
            session_owner: context.session_owner(),
            session: context.session.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCacheRequest {
    checksum: String,
    storage: String,
    owner: Option<String>,
}

/// Make a file stored on an offline tier available again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawCacheRequest")]
pub struct FileCacheRequestDto {
    pub checksum: String,
    pub storage: String,
    pub owner: Option<String>,
}

impl FileCacheRequestDto {
    pub fn new(checksum: impl Into<String>, storage: impl Into<String>) -> Result<Self> {
        Self::try_from(RawCacheRequest {
            checksum: checksum.into(),
            storage: storage.into(),
            owner: None,
        })
    }
}

impl TryFrom<RawCacheRequest> for FileCacheRequestDto {
    type Error = EngineError;

    fn try_from(raw: RawCacheRequest) -> Result<Self> {
        Ok(Self {
            checksum: checksum(raw.checksum)?,
            storage: mandatory("storage", raw.storage)?,
            owner: optional(raw.owner),
        })
    }
}

impl FileRequestDto for FileCacheRequestDto {
    fn request_type(&self) -> RequestType {
        RequestType::Cache
    }

    fn checksum(&self) -> &str {
        &self.checksum
    }

    fn storage(&self) -> &str {
        &self.storage
    }

    fn into_new_request(self, context: &UserContext) -> NewFileRequest {
        NewFileRequest {
            request_type: RequestType::Cache,
            checksum: self.checksum,
            algorithm: String::new(),
            storage: self.storage,
            sub_directory: None,
            origin_url: None,
            file_name: None,
            file_size: 0,
            owner: self.owner,
            session_owner: context.session_owner(),
            session: context.session.clone(),
        }
    }
}
