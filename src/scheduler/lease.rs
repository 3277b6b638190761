//! Durable scheduler lease
//!
//! One row per lease name in `scheduler_lease`. A holder keeps the lease by
//! renewing it before `expires_at`; anyone may take over an expired lease.
//! The `dirty` flag is set while a holder runs a unit of work and survives
//! the holder, so whoever runs next knows the last run did not finish.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use rusqlite::{params, OptionalExtension};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::model::to_millis;

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    /// The lease was free, expired or held by another owner before.
    Acquired,
    /// We already held it; the deadline was pushed back.
    Renewed,
    /// Another owner holds a live lease.
    Busy,
}

impl LeaseState {
    pub fn is_held(&self) -> bool {
        !matches!(self, LeaseState::Busy)
    }
}

pub struct Lease {
    db: Arc<Database>,
    name: String,
    owner: String,
    ttl: Duration,
}

static OWNER_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Owner name unique to this process start, so a restarted process never
/// mistakes its predecessor's lease for its own.
pub fn unique_owner(prefix: &str) -> String {
    let started = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!(
        "{}-{}-{:x}-{}",
        prefix,
        std::process::id(),
        started,
        OWNER_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

impl Lease {
    pub fn new(db: Arc<Database>, name: impl Into<String>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            db,
            name: name.into(),
            owner: owner.into(),
            ttl,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn acquire(&self, now: DateTime<Utc>) -> Result<LeaseState> {
        let now_ms = to_millis(&now);
        let expires = to_millis(&(now + self.ttl));
        self.db.immediate(|tx| {
            let current: Option<(String, i64)> = tx
                .query_row(
                    "SELECT owner, expires_at FROM scheduler_lease WHERE name = ?1",
                    params![self.name],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            let state = match &current {
                Some((owner, expires_at)) if *expires_at > now_ms && owner != &self.owner => {
                    debug!("Lease {} is held by {}", self.name, owner);
                    return Ok(LeaseState::Busy);
                }
                Some((owner, expires_at)) if *expires_at > now_ms && owner == &self.owner => LeaseState::Renewed,
                _ => LeaseState::Acquired,
            };

            tx.execute(
                "INSERT INTO scheduler_lease (name, owner, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at",
                params![self.name, self.owner, expires],
            )?;
            if state == LeaseState::Acquired {
                info!("Lease {} acquired by {}", self.name, self.owner);
            }
            Ok(state)
        })
    }

    /// Push the deadline back. Fails with `LeaseLost` once the lease expired or
    /// changed hands.
    pub fn renew(&self, now: DateTime<Utc>) -> Result<()> {
        let updated = self.db.immediate(|tx| {
            Ok(tx.execute(
                "UPDATE scheduler_lease SET expires_at = ?3
                 WHERE name = ?1 AND owner = ?2 AND expires_at > ?4",
                params![self.name, self.owner, to_millis(&(now + self.ttl)), to_millis(&now)],
            )?)
        })?;
        if updated == 0 {
            warn!("Lease {} lost by {}", self.name, self.owner);
            return Err(EngineError::LeaseLost(self.name.clone()));
        }
        Ok(())
    }

    /// Flag the start of a unit of work. Returns true when the previous unit,
    /// by any holder, never reached `finish_work`.
    pub fn begin_work(&self) -> Result<bool> {
        let previous = self.db.immediate(|tx| {
            let dirty: Option<bool> = tx
                .query_row(
                    "SELECT dirty FROM scheduler_lease WHERE name = ?1 AND owner = ?2",
                    params![self.name, self.owner],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(dirty) = dirty else {
                return Err(EngineError::LeaseLost(self.name.clone()));
            };
            tx.execute(
                "UPDATE scheduler_lease SET dirty = 1 WHERE name = ?1 AND owner = ?2",
                params![self.name, self.owner],
            )?;
            Ok(dirty)
        })?;
        if previous {
            warn!("Lease {}: the previous run did not finish", self.name);
        }
        Ok(previous)
    }

    pub fn finish_work(&self) -> Result<()> {
        let updated = self.db.immediate(|tx| {
            Ok(tx.execute(
                "UPDATE scheduler_lease SET dirty = 0 WHERE name = ?1 AND owner = ?2",
                params![self.name, self.owner],
            )?)
        })?;
        if updated == 0 {
            return Err(EngineError::LeaseLost(self.name.clone()));
        }
        Ok(())
    }

    pub fn release(&self) -> Result<()> {
        self.db.immediate(|tx| {
            tx.execute(
                "DELETE FROM scheduler_lease WHERE name = ?1 AND owner = ?2",
                params![self.name, self.owner],
            )?;
            Ok(())
        })?;
        debug!("Lease {} released by {}", self.name, self.owner);
        Ok(())
    }
}
