//! Lifecycle state machines for requests, packaged files and packages.
//!
//! Every status change goes through `transition`, which rejects moves that are
//! not part of the lifecycle. Rows are persisted with the `as_str` form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{EngineError, Result};

fn invalid(from: impl fmt::Display, to: impl fmt::Display) -> EngineError {
    EngineError::InvalidTransition {
        from: from.to_string(),
        to: to.to_string(),
    }
}

macro_rules! status_text {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = EngineError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(EngineError::Internal(format!(
                        "unknown {} value: {}", stringify!($ty), other
                    ))),
                }
            }
        }
    };
}

/// Status of a ledger `FileRequest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Todo,
    Pending,
    Done,
    Error,
}

status_text!(RequestStatus {
    Todo => "TODO",
    Pending => "PENDING",
    Done => "DONE",
    Error => "ERROR",
});

impl RequestStatus {
    /// `Pending -> Todo` requeues work interrupted by a crash and
    /// `Error -> Todo` is the explicit retry.
    pub fn transition(self, to: RequestStatus) -> Result<RequestStatus> {
        use RequestStatus::*;
        match (self, to) {
            (Todo, Pending) | (Todo, Error) => Ok(to),
            (Pending, Done) | (Pending, Error) | (Pending, Todo) => Ok(to),
            (Error, Todo) | (Error, Error) => Ok(to),
            _ => Err(invalid(self, to)),
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, RequestStatus::Done)
    }
}

/// Status of a `FileInBuildingPackage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileStatus {
    WaitingPackage,
    Building,
    Packaged,
    Error,
}

status_text!(FileStatus {
    WaitingPackage => "WAITING_PACKAGE",
    Building => "BUILDING",
    Packaged => "PACKAGED",
    Error => "ERROR",
});

impl FileStatus {
    pub fn transition(self, to: FileStatus) -> Result<FileStatus> {
        use FileStatus::*;
        match (self, to) {
            (WaitingPackage, Building) | (WaitingPackage, Error) => Ok(to),
            (Building, Packaged) | (Building, Error) => Ok(to),
            // a failed file waits again when its request is retried
            (Error, WaitingPackage) => Ok(to),
            _ => Err(invalid(self, to)),
        }
    }
}

/// Status of a `PackageReference`. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PackageStatus {
    Building,
    ToStore,
    Stored,
    Error,
}

status_text!(PackageStatus {
    Building => "BUILDING",
    ToStore => "TO_STORE",
    Stored => "STORED",
    Error => "ERROR",
});

impl PackageStatus {
    pub fn transition(self, to: PackageStatus) -> Result<PackageStatus> {
        use PackageStatus::*;
        match (self, to) {
            (Building, ToStore) | (Building, Error) => Ok(to),
            (ToStore, Stored) | (ToStore, Error) => Ok(to),
            _ => Err(invalid(self, to)),
        }
    }
}
