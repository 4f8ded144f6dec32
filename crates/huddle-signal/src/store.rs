//! SQLite persistence for call negotiation state
//!
//! The store is the single source of truth that lets a peer arriving after
//! the caller already produced an offer (and some candidates) reconstruct
//! the full negotiation context in one read. Every mutation refreshes a
//! sliding `expires_at`; SQLite has no native TTL index, so rows past their
//! expiry are treated as absent by every query and physically removed by
//! the server's background sweep.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{debug, info};

use huddle_core::RelayError;

use crate::messages::{CallState, Role};

/// SQLite-backed session store
pub struct CallStore {
    conn: Mutex<Connection>,
    ttl_secs: u64,
}

impl CallStore {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P, ttl_secs: u64) -> Result<Self, RelayError> {
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
            ttl_secs,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory database (no durability across restarts)
    pub fn in_memory(ttl_secs: u64) -> Result<Self, RelayError> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
            ttl_secs,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), RelayError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS calls (
                call_id TEXT PRIMARY KEY,
                offer TEXT,
                answer TEXT,
                offer_candidates TEXT NOT NULL DEFAULT '[]',
                answer_candidates TEXT NOT NULL DEFAULT '[]',
                updated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_calls_expires_at ON calls(expires_at);
            "#,
        )
        .map_err(db_err)?;

        info!("Call store schema initialized");
        Ok(())
    }

    /// Insert a new call with empty negotiation state and a fresh TTL
    pub fn create(&self, call_id: &str) -> Result<(), RelayError> {
        let conn = self.lock()?;
        let now = current_timestamp();

        let result = conn.execute(
            "INSERT INTO calls (call_id, offer, answer, offer_candidates, answer_candidates, updated_at, expires_at)
             VALUES (?1, NULL, NULL, '[]', '[]', ?2, ?3)",
            params![call_id, now, now + self.ttl_secs as i64],
        );

        match result {
            Ok(_) => {
                debug!("Call created in store: {}", call_id);
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(RelayError::conflict(call_id))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    /// Fetch the current negotiation state, or `None` for unknown/expired ids
    pub fn get(&self, call_id: &str) -> Result<Option<CallState>, RelayError> {
        let conn = self.lock()?;
        let now = current_timestamp();

        let row = conn
            .query_row(
                "SELECT call_id, offer, answer, offer_candidates, answer_candidates, updated_at, expires_at
                 FROM calls WHERE call_id = ?1 AND expires_at > ?2",
                params![call_id, now],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()
            .map_err(db_err)?;

        let Some((call_id, offer, answer, offer_cands, answer_cands, updated_at, expires_at)) = row
        else {
            return Ok(None);
        };

        Ok(Some(CallState {
            call_id,
            offer: parse_opt_json(offer)?,
            answer: parse_opt_json(answer)?,
            offer_candidates: parse_json_array(&offer_cands)?,
            answer_candidates: parse_json_array(&answer_cands)?,
            updated_at,
            expires_at,
        }))
    }

    /// Last-write-wins upsert of the role's session description.
    /// Refreshes the sliding TTL; `NotFound` if the call does not exist.
    pub fn set_description(
        &self,
        call_id: &str,
        role: Role,
        description: &Value,
    ) -> Result<(), RelayError> {
        let conn = self.lock()?;
        let now = current_timestamp();
        let text = serde_json::to_string(description)
            .map_err(|e| RelayError::Malformed(e.to_string()))?;

        let sql = match role {
            Role::Offer => {
                "UPDATE calls SET offer = ?2, updated_at = ?3, expires_at = ?4
                 WHERE call_id = ?1 AND expires_at > ?3"
            }
            Role::Answer => {
                "UPDATE calls SET answer = ?2, updated_at = ?3, expires_at = ?4
                 WHERE call_id = ?1 AND expires_at > ?3"
            }
        };

        let updated = conn
            .execute(sql, params![call_id, text, now, now + self.ttl_secs as i64])
            .map_err(db_err)?;

        if updated == 0 {
            return Err(RelayError::not_found(call_id));
        }
        Ok(())
    }

    /// Append a candidate to the role's sequence (single atomic UPDATE).
    /// Refreshes the sliding TTL; `NotFound` if the call does not exist.
    pub fn append_candidate(
        &self,
        call_id: &str,
        role: Role,
        candidate: &Value,
    ) -> Result<(), RelayError> {
        let conn = self.lock()?;
        let now = current_timestamp();
        let text =
            serde_json::to_string(candidate).map_err(|e| RelayError::Malformed(e.to_string()))?;

        let sql = match role {
            Role::Offer => {
                "UPDATE calls
                 SET offer_candidates = json_insert(offer_candidates, '$[#]', json(?2)),
                     updated_at = ?3, expires_at = ?4
                 WHERE call_id = ?1 AND expires_at > ?3"
            }
            Role::Answer => {
                "UPDATE calls
                 SET answer_candidates = json_insert(answer_candidates, '$[#]', json(?2)),
                     updated_at = ?3, expires_at = ?4
                 WHERE call_id = ?1 AND expires_at > ?3"
            }
        };

        let updated = conn
            .execute(sql, params![call_id, text, now, now + self.ttl_secs as i64])
            .map_err(db_err)?;

        if updated == 0 {
            return Err(RelayError::not_found(call_id));
        }
        Ok(())
    }

    /// Remove a call immediately (hangup path)
    pub fn delete(&self, call_id: &str) -> Result<(), RelayError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM calls WHERE call_id = ?1", params![call_id])
            .map_err(db_err)?;
        debug!("Call deleted from store: {}", call_id);
        Ok(())
    }

    /// Ids of calls past their expiry, for the background sweep
    pub fn list_expired(&self) -> Result<Vec<String>, RelayError> {
        let conn = self.lock()?;
        let now = current_timestamp();

        let mut stmt = conn
            .prepare("SELECT call_id FROM calls WHERE expires_at <= ?1")
            .map_err(db_err)?;
        let ids: Vec<String> = stmt
            .query_map(params![now], |row| row.get(0))
            .map_err(db_err)?
            .filter_map(|r| r.ok())
            .collect();

        Ok(ids)
    }

    /// Delete a call only if it is still expired (it may have been
    /// refreshed between the sweep's listing and this call).
    /// Returns true if a row was removed.
    pub fn delete_if_expired(&self, call_id: &str) -> Result<bool, RelayError> {
        let conn = self.lock()?;
        let now = current_timestamp();

        let deleted = conn
            .execute(
                "DELETE FROM calls WHERE call_id = ?1 AND expires_at <= ?2",
                params![call_id, now],
            )
            .map_err(db_err)?;

        Ok(deleted > 0)
    }

    /// Number of live (unexpired) calls
    pub fn call_count(&self) -> Result<usize, RelayError> {
        let conn = self.lock()?;
        let now = current_timestamp();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM calls WHERE expires_at > ?1",
                params![now],
                |row| row.get(0),
            )
            .map_err(db_err)?;

        Ok(count as usize)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, RelayError> {
        self.conn
            .lock()
            .map_err(|_| RelayError::Storage("connection lock poisoned".into()))
    }
}

fn db_err(e: rusqlite::Error) -> RelayError {
    RelayError::Storage(e.to_string())
}

fn parse_opt_json(text: Option<String>) -> Result<Option<Value>, RelayError> {
    match text {
        Some(t) => serde_json::from_str(&t)
            .map(Some)
            .map_err(|e| RelayError::Storage(format!("corrupt stored description: {}", e))),
        None => Ok(None),
    }
}

fn parse_json_array(text: &str) -> Result<Vec<Value>, RelayError> {
    serde_json::from_str(text)
        .map_err(|e| RelayError::Storage(format!("corrupt stored candidate list: {}", e)))
}

/// Get current Unix timestamp
fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock before Unix epoch")
        .as_secs() as i64
}
