//! SQLite implementation of the request and group ledgers

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use crate::bus::outbox;
use crate::bus::{BusEvent, RequestGroupResultEvent};
use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::ledger::{GroupLedger, RequestLedger};
use crate::model::{
    from_millis, to_millis, ArchiveSource, FileRequest, NewFileRequest, RequestGroup, RequestResultInfo,
    RequestStatus, RequestType, SubmitOutcome,
};

const REQUEST_COLUMNS: &str = "id, request_type, checksum, algorithm, storage, sub_directory, \
     origin_url, file_name, file_size, session_owner, session, status, error_cause, creation_date";

struct RequestRow {
    id: i64,
    request_type: String,
    checksum: String,
    algorithm: String,
    storage: String,
    sub_directory: Option<String>,
    origin_url: Option<String>,
    file_name: Option<String>,
    file_size: i64,
    session_owner: Option<String>,
    session: Option<String>,
    status: String,
    error_cause: Option<String>,
    creation_date: i64,
}

impl RequestRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            request_type: row.get(1)?,
            checksum: row.get(2)?,
            algorithm: row.get(3)?,
            storage: row.get(4)?,
            sub_directory: row.get(5)?,
            origin_url: row.get(6)?,
            file_name: row.get(7)?,
            file_size: row.get(8)?,
            session_owner: row.get(9)?,
            session: row.get(10)?,
            status: row.get(11)?,
            error_cause: row.get(12)?,
            creation_date: row.get(13)?,
        })
    }

    fn into_request(self, conn: &Connection) -> Result<FileRequest> {
        let owners = string_set(conn, "SELECT owner FROM file_request_owner WHERE request_id = ?1", self.id)?;
        let group_ids = string_set(conn, "SELECT group_id FROM file_request_group WHERE request_id = ?1", self.id)?;
        Ok(FileRequest {
            id: self.id,
            request_type: self.request_type.parse()?,
            checksum: self.checksum,
            algorithm: self.algorithm,
            storage: self.storage,
            sub_directory: self.sub_directory,
            origin_url: self.origin_url,
            file_name: self.file_name,
            file_size: self.file_size.max(0) as u64,
            owners,
            session_owner: self.session_owner,
            session: self.session,
            group_ids,
            status: self.status.parse()?,
            error_cause: self.error_cause,
            creation_date: from_millis(self.creation_date),
        })
    }
}

fn string_set(conn: &Connection, sql: &str, id: i64) -> Result<BTreeSet<String>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
    let mut values = BTreeSet::new();
    for row in rows {
        values.insert(row?);
    }
    Ok(values)
}

fn load_request(conn: &Connection, id: i64) -> Result<Option<FileRequest>> {
    let sql = format!("SELECT {} FROM file_request WHERE id = ?1", REQUEST_COLUMNS);
    let row = conn.query_row(&sql, params![id], RequestRow::read).optional()?;
    match row {
        Some(row) => Ok(Some(row.into_request(conn)?)),
        None => Ok(None),
    }
}

fn load_requests(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<FileRequest>> {
    let mut stmt = conn.prepare(sql)?;
    let rows: Vec<RequestRow> = stmt
        .query_map(params, RequestRow::read)?
        .collect::<rusqlite::Result<_>>()?;
    rows.into_iter().map(|row| row.into_request(conn)).collect()
}

fn key_lookup(conn: &Connection, request_type: RequestType, checksum: &str, storage: &str) -> Result<Option<(i64, RequestStatus)>> {
    let row = conn
        .query_row(
            "SELECT id, status FROM file_request WHERE request_type = ?1 AND checksum = ?2 AND storage = ?3",
            params![request_type.as_str(), checksum, storage],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
        )
        .optional()?;
    match row {
        Some((id, status)) => Ok(Some((id, status.parse()?))),
        None => Ok(None),
    }
}

/// Move one row through the request state machine. Returns false when the
/// row is no longer in `from`.
fn set_status(conn: &Connection, id: i64, from: RequestStatus, to: RequestStatus, cause: Option<&str>) -> Result<bool> {
    from.transition(to)?;
    let changed = conn.execute(
        "UPDATE file_request SET status = ?1, error_cause = ?2 WHERE id = ?3 AND status = ?4",
        params![to.as_str(), cause, id, from.as_str()],
    )?;
    Ok(changed == 1)
}

fn attach(conn: &Connection, id: i64, owner: Option<&str>, group_id: Option<&str>) -> Result<()> {
    if let Some(owner) = owner {
        conn.execute(
            "INSERT OR IGNORE INTO file_request_owner (request_id, owner) VALUES (?1, ?2)",
            params![id, owner],
        )?;
    }
    if let Some(group_id) = group_id {
        conn.execute(
            "INSERT OR IGNORE INTO file_request_group (request_id, group_id) VALUES (?1, ?2)",
            params![id, group_id],
        )?;
    }
    Ok(())
}

fn insert_request(conn: &Connection, request: &NewFileRequest, now: DateTime<Utc>) -> Result<Option<i64>> {
    let inserted = conn.execute(
        "INSERT INTO file_request (request_type, checksum, algorithm, storage, sub_directory, origin_url,
             file_name, file_size, session_owner, session, status, creation_date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(request_type, checksum, storage) DO NOTHING",
        params![
            request.request_type.as_str(),
            request.checksum,
            request.algorithm,
            request.storage,
            request.sub_directory,
            request.origin_url,
            request.file_name,
            request.file_size as i64,
            request.session_owner,
            request.session,
            RequestStatus::Todo.as_str(),
            to_millis(&now),
        ],
    )?;
    if inserted == 1 {
        Ok(Some(conn.last_insert_rowid()))
    } else {
        Ok(None)
    }
}

/// Create or merge one request. Must run inside a write transaction.
fn submit_in_tx(conn: &Connection, request: &NewFileRequest, group_id: Option<&str>) -> Result<SubmitOutcome> {
    let now = Utc::now();
    let outcome = match key_lookup(conn, request.request_type, &request.checksum, &request.storage)? {
        Some((id, RequestStatus::Done)) => {
            // finished but not yet purged: the key is free again
            conn.execute("DELETE FROM file_request WHERE id = ?1", params![id])?;
            match insert_request(conn, request, now)? {
                Some(new_id) => SubmitOutcome::Created(new_id),
                None => return Err(EngineError::Internal(format!("could not recreate request {}", id))),
            }
        }
        Some((id, RequestStatus::Error)) => {
            set_status(conn, id, RequestStatus::Error, RequestStatus::Todo, None)?;
            conn.execute(
                "UPDATE file_request SET creation_date = ?1, origin_url = COALESCE(?2, origin_url) WHERE id = ?3",
                params![to_millis(&now), request.origin_url, id],
            )?;
            info!("Request {} resubmitted after error, back to TODO", id);
            SubmitOutcome::Merged(id)
        }
        Some((id, _)) => SubmitOutcome::Merged(id),
        None => match insert_request(conn, request, now)? {
            Some(id) => SubmitOutcome::Created(id),
            None => {
                // another writer won the unique key
                let (id, _) = key_lookup(conn, request.request_type, &request.checksum, &request.storage)?
                    .ok_or_else(|| EngineError::Internal("request vanished during submit".into()))?;
                SubmitOutcome::Merged(id)
            }
        },
    };
    attach(conn, outcome.id(), request.owner.as_deref(), group_id)?;
    debug!(
        "Submitted {} request checksum={} storage={}: {:?}",
        request.request_type, request.checksum, request.storage, outcome
    );
    Ok(outcome)
}

/// Upsert the outcome of `request` into each of its still-open groups.
fn record_outcome(conn: &Connection, request: &FileRequest, result_url: Option<&str>, error_cause: Option<&str>) -> Result<()> {
    for group_id in &request.group_ids {
        let info = RequestResultInfo {
            group_id: group_id.clone(),
            request_type: request.request_type,
            result_file_url: result_url.map(str::to_string),
            request_checksum: request.checksum.clone(),
            request_storage: request.storage.clone(),
            error: error_cause.is_some(),
            error_cause: error_cause.map(str::to_string),
        };
        upsert_result(conn, &info)?;
    }
    Ok(())
}

fn upsert_result(conn: &Connection, info: &RequestResultInfo) -> Result<()> {
    let written = conn.execute(
        "INSERT INTO request_result_info
             (group_id, request_type, result_file_url, request_checksum, request_storage, error, error_cause)
         SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7 WHERE EXISTS (SELECT 1 FROM request_group WHERE id = ?1)
         ON CONFLICT(group_id, request_checksum, request_storage) DO UPDATE SET
             result_file_url = excluded.result_file_url,
             error = excluded.error,
             error_cause = excluded.error_cause",
        params![
            info.group_id,
            info.request_type.as_str(),
            info.result_file_url,
            info.request_checksum,
            info.request_storage,
            info.error,
            info.error_cause,
        ],
    )?;
    if written == 0 {
        debug!("Group {} already resolved, result for {} not recorded", info.group_id, info.request_checksum);
    }
    Ok(())
}

fn read_results(conn: &Connection, group_id: &str) -> Result<Vec<RequestResultInfo>> {
    let mut stmt = conn.prepare(
        "SELECT group_id, request_type, result_file_url, request_checksum, request_storage, error, error_cause
         FROM request_result_info WHERE group_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map(params![group_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, Option<String>>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
            row.get::<_, bool>(5)?,
            row.get::<_, Option<String>>(6)?,
        ))
    })?;
    let mut results = Vec::new();
    for row in rows {
        let (group_id, request_type, result_file_url, request_checksum, request_storage, error, error_cause) = row?;
        results.push(RequestResultInfo {
            group_id,
            request_type: request_type.parse()?,
            result_file_url,
            request_checksum,
            request_storage,
            error,
            error_cause,
        });
    }
    Ok(results)
}

/// SQLite-backed ledger for requests and request groups.
pub struct SqliteLedger {
    db: Arc<Database>,
}

impl SqliteLedger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

impl RequestLedger for SqliteLedger {
    fn submit(&self, request: NewFileRequest, group_id: Option<&str>) -> Result<SubmitOutcome> {
        self.db.immediate(|tx| submit_in_tx(tx, &request, group_id))
    }

    fn submit_group(&self, group_id: &str, request_type: RequestType, requests: Vec<NewFileRequest>) -> Result<Vec<SubmitOutcome>> {
        if requests.is_empty() {
            return Err(EngineError::validation(format!("group {} has no request", group_id)));
        }
        if let Some(other) = requests.iter().find(|r| r.request_type != request_type) {
            return Err(EngineError::validation(format!(
                "group {} is a {} group but contains a {} request",
                group_id, request_type, other.request_type
            )));
        }
        let expected = requests
            .iter()
            .map(|r| (r.checksum.as_str(), r.storage.as_str()))
            .collect::<HashSet<_>>()
            .len();

        self.db.immediate(|tx| {
            let created = tx.execute(
                "INSERT INTO request_group (id, request_type, expected, creation_date)
                 VALUES (?1, ?2, ?3, ?4) ON CONFLICT(id) DO NOTHING",
                params![group_id, request_type.as_str(), expected as i64, to_millis(&Utc::now())],
            )?;
            if created == 0 {
                return Err(EngineError::validation(format!("group {} already exists", group_id)));
            }
            let mut outcomes = Vec::with_capacity(requests.len());
            for request in &requests {
                outcomes.push(submit_in_tx(tx, request, Some(group_id))?);
            }
            info!("Group {} created with {} distinct {} requests", group_id, expected, request_type);
            Ok(outcomes)
        })
    }

    fn find(&self, id: i64) -> Result<Option<FileRequest>> {
        self.db.with_conn(|conn| load_request(conn, id))
    }

    fn find_by_key(&self, request_type: RequestType, checksum: &str, storage: &str) -> Result<Option<FileRequest>> {
        self.db.with_conn(|conn| match key_lookup(conn, request_type, checksum, storage)? {
            Some((id, _)) => load_request(conn, id),
            None => Ok(None),
        })
    }

    fn page_by_status(&self, request_type: RequestType, status: RequestStatus, limit: usize) -> Result<Vec<FileRequest>> {
        let sql = format!(
            "SELECT {} FROM file_request WHERE request_type = ?1 AND status = ?2 ORDER BY id LIMIT ?3",
            REQUEST_COLUMNS
        );
        self.db
            .with_conn(|conn| load_requests(conn, &sql, params![request_type.as_str(), status.as_str(), limit as i64]))
    }

    fn mark_pending(&self, ids: &[i64]) -> Result<Vec<i64>> {
        self.db.immediate(|tx| {
            let mut moved = Vec::with_capacity(ids.len());
            for &id in ids {
                if set_status(tx, id, RequestStatus::Todo, RequestStatus::Pending, None)? {
                    moved.push(id);
                }
            }
            Ok(moved)
        })
    }

    fn complete(&self, id: i64, result_url: Option<&str>) -> Result<Option<FileRequest>> {
        self.db.immediate(|tx| {
            let mut request = match load_request(tx, id)? {
                Some(request) => request,
                None => return Ok(None),
            };
            match request.status {
                RequestStatus::Todo => {
                    // answered before the dispatcher recorded the hand-off
                    set_status(tx, id, RequestStatus::Todo, RequestStatus::Pending, None)?;
                    request.status = RequestStatus::Pending;
                }
                RequestStatus::Pending => {}
                RequestStatus::Done => return Ok(Some(request)),
                RequestStatus::Error => {
                    warn!("Ignoring late success for request {} already in error", id);
                    return Ok(Some(request));
                }
            }
            set_status(tx, id, request.status, RequestStatus::Done, None)?;
            request.status = RequestStatus::Done;
            record_outcome(tx, &request, result_url, None)?;
            Ok(Some(request))
        })
    }

    fn remove_done(&self, ids: &[i64]) -> Result<usize> {
        self.db.immediate(|tx| {
            let mut removed = 0;
            for &id in ids {
                removed += tx.execute(
                    "DELETE FROM file_request WHERE id = ?1 AND status = ?2",
                    params![id, RequestStatus::Done.as_str()],
                )?;
            }
            Ok(removed)
        })
    }

    fn mark_error(&self, id: i64, cause: &str) -> Result<Option<FileRequest>> {
        self.db.immediate(|tx| {
            let mut request = match load_request(tx, id)? {
                Some(request) => request,
                None => return Ok(None),
            };
            if request.status == RequestStatus::Done {
                warn!("Ignoring late failure for request {} already done: {}", id, cause);
                return Ok(Some(request));
            }
            if !set_status(tx, id, request.status, RequestStatus::Error, Some(cause))? {
                return Err(EngineError::Internal(format!("request {} changed during mark_error", id)));
            }
            request.status = RequestStatus::Error;
            request.error_cause = Some(cause.to_string());
            record_outcome(tx, &request, None, Some(cause))?;
            warn!("Request {} ({} {}) failed: {}", id, request.request_type, request.checksum, cause);
            Ok(Some(request))
        })
    }

    fn retry_errors(&self, request_type: RequestType, storage: Option<&str>) -> Result<usize> {
        self.db.immediate(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id FROM file_request WHERE request_type = ?1 AND status = ?2 AND (?3 IS NULL OR storage = ?3)",
            )?;
            let ids: Vec<i64> = stmt
                .query_map(params![request_type.as_str(), RequestStatus::Error.as_str(), storage], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            let now = to_millis(&Utc::now());
            let mut retried = 0;
            for id in ids {
                if set_status(tx, id, RequestStatus::Error, RequestStatus::Todo, None)? {
                    tx.execute("UPDATE file_request SET creation_date = ?1 WHERE id = ?2", params![now, id])?;
                    retried += 1;
                }
            }
            info!("{} {} requests in error scheduled for retry", retried, request_type);
            Ok(retried)
        })
    }

    fn delete_errors(&self, request_type: RequestType, storage: Option<&str>) -> Result<usize> {
        self.db.immediate(|tx| {
            let deleted = tx.execute(
                "DELETE FROM file_request WHERE request_type = ?1 AND status = ?2 AND (?3 IS NULL OR storage = ?3)",
                params![request_type.as_str(), RequestStatus::Error.as_str(), storage],
            )?;
            info!("{} {} requests in error deleted", deleted, request_type);
            Ok(deleted)
        })
    }

    fn expire_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<FileRequest>> {
        let sql = format!(
            "SELECT {} FROM file_request WHERE status = ?1 AND creation_date < ?2 ORDER BY id",
            REQUEST_COLUMNS
        );
        self.db.immediate(|tx| {
            let stale = load_requests(tx, &sql, params![RequestStatus::Todo.as_str(), to_millis(&cutoff)])?;
            let mut expired = Vec::with_capacity(stale.len());
            for mut request in stale {
                let cause = EngineError::Expired(format!(
                    "not dispatched since {}",
                    request.creation_date.format("%Y-%m-%d %H:%M:%S UTC")
                ))
                .to_string();
                if set_status(tx, request.id, RequestStatus::Todo, RequestStatus::Error, Some(&cause))? {
                    request.status = RequestStatus::Error;
                    record_outcome(tx, &request, None, Some(&cause))?;
                    request.error_cause = Some(cause);
                    expired.push(request);
                }
            }
            if !expired.is_empty() {
                warn!("{} requests expired", expired.len());
            }
            Ok(expired)
        })
    }

    fn requeue_interrupted(&self) -> Result<usize> {
        self.db.immediate(|tx| {
            let mut stmt = tx.prepare(
                "SELECT id FROM file_request WHERE status = ?1
                 AND id NOT IN (SELECT storage_request_id FROM file_in_building_package WHERE source = ?2)",
            )?;
            let ids: Vec<i64> = stmt
                .query_map(params![RequestStatus::Pending.as_str(), ArchiveSource::Ledger.as_str()], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;
            let mut requeued = 0;
            for id in ids {
                if set_status(tx, id, RequestStatus::Pending, RequestStatus::Todo, None)? {
                    requeued += 1;
                }
            }
            if requeued > 0 {
                info!("{} interrupted requests requeued", requeued);
            }
            Ok(requeued)
        })
    }
}

impl GroupLedger for SqliteLedger {
    fn find_group(&self, id: &str) -> Result<Option<RequestGroup>> {
        self.db.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, request_type, expected, creation_date FROM request_group WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;
            match row {
                Some((id, request_type, expected, creation_date)) => Ok(Some(RequestGroup {
                    id,
                    request_type: request_type.parse()?,
                    expected: expected as u32,
                    creation_date: from_millis(creation_date),
                })),
                None => Ok(None),
            }
        })
    }

    fn results(&self, group_id: &str) -> Result<Vec<RequestResultInfo>> {
        self.db.with_conn(|conn| read_results(conn, group_id))
    }

    fn take_resolved(&self, limit: usize) -> Result<Vec<RequestGroupResultEvent>> {
        self.db.immediate(|tx| {
            let mut stmt = tx.prepare(
                "SELECT g.id, g.request_type FROM request_group g
                 WHERE (SELECT COUNT(*) FROM request_result_info r WHERE r.group_id = g.id) >= g.expected
                 ORDER BY g.creation_date LIMIT ?1",
            )?;
            let groups: Vec<(String, String)> = stmt
                .query_map(params![limit as i64], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<rusqlite::Result<_>>()?;

            let mut events = Vec::with_capacity(groups.len());
            for (group_id, request_type) in groups {
                let results = read_results(tx, &group_id)?;
                let event = RequestGroupResultEvent {
                    error: results.iter().any(|r| r.error),
                    group_id: group_id.clone(),
                    request_type: request_type.parse()?,
                    results,
                };
                outbox::enqueue(tx, &BusEvent::RequestGroupResult(event.clone()))?;
                tx.execute("DELETE FROM request_group WHERE id = ?1", params![group_id])?;
                tx.execute("DELETE FROM file_request_group WHERE group_id = ?1", params![group_id])?;
                info!(
                    "Group {} resolved with {} results ({})",
                    group_id,
                    event.results.len(),
                    if event.error { "with errors" } else { "success" }
                );
                events.push(event);
            }
            Ok(events)
        })
    }
}
