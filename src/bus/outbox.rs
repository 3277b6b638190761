//! Durable outbox.
//!
//! Events are written in the same transaction as the state change that
//! produced them and published afterwards, so a crash between commit and
//! publish delays an event but never loses it.

use chrono::Utc;
use log::{debug, warn};
use rusqlite::{params, Connection};
use std::sync::Arc;

use crate::bus::{BusEvent, MessageBus};
use crate::database::Database;
use crate::error::Result;
use crate::model::to_millis;

/// Record `event` for publication. Call inside the producing transaction.
pub fn enqueue(conn: &Connection, event: &BusEvent) -> Result<i64> {
    let payload = bincode::serialize(event)?;
    conn.execute(
        "INSERT INTO event_outbox (payload, creation_date) VALUES (?1, ?2)",
        params![payload, to_millis(&Utc::now())],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Publishes outbox rows to the bus in id order.
pub struct Outbox {
    db: Arc<Database>,
    bus: Arc<dyn MessageBus>,
    batch_size: usize,
}

impl Outbox {
    pub fn new(db: Arc<Database>, bus: Arc<dyn MessageBus>, batch_size: usize) -> Self {
        Self {
            db,
            bus,
            batch_size: batch_size.max(1),
        }
    }

    /// Number of events waiting for publication.
    pub fn pending(&self) -> Result<usize> {
        self.db.with_conn(|conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM event_outbox", [], |row| row.get(0))?;
            Ok(count as usize)
        })
    }

    /// Publish until the outbox is empty. Rows are deleted only after the bus
    /// accepted their batch.
    pub fn flush(&self) -> Result<usize> {
        let mut published = 0;
        loop {
            let rows = self.read_batch()?;
            if rows.is_empty() {
                break;
            }
            let last_id = rows.last().map(|(id, _)| *id).unwrap_or_default();
            let count = rows.len();
            let mut events = Vec::with_capacity(count);
            for (id, payload) in rows {
                match bincode::deserialize::<BusEvent>(&payload) {
                    Ok(event) => events.push(event),
                    Err(e) => warn!("Dropping undecodable outbox row {}: {}", id, e),
                }
            }

            self.bus.publish_batch(events)?;
            self.db.with_conn(|conn| {
                conn.execute("DELETE FROM event_outbox WHERE id <= ?1", params![last_id])?;
                Ok(())
            })?;
            published += count;
            debug!("Flushed {} outbox events", count);
        }
        Ok(published)
    }

    fn read_batch(&self) -> Result<Vec<(i64, Vec<u8>)>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, payload FROM event_outbox ORDER BY id LIMIT ?1")?;
            let rows = stmt.query_map(params![self.batch_size as i64], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut batch = Vec::new();
            for row in rows {
                batch.push(row?);
            }
            Ok(batch)
        })
    }
}
