//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled SQLite,
//! wrapped in async via `tokio::task::spawn_blocking`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use coweave_core::{
    CoValueHeader, KnownState, RawCoID, SessionID, Signature, Transaction,
};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{
    overlap, SessionWrite, Store, StoredMetadata, StoredTransactions, WriteOutcome,
};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` on the connection in a blocking task.
    async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await?
    }
}

fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_signature(bytes: Vec<u8>) -> Result<Signature> {
    let arr: [u8; 64] = bytes
        .try_into()
        .map_err(|_| StoreError::InvalidData("signature is not 64 bytes".into()))?;
    Ok(Signature(arr))
}

fn parse_session(text: String) -> Result<SessionID> {
    text.parse()
        .map_err(|_| StoreError::InvalidData(format!("bad session id {}", text)))
}

fn session_count(conn: &Connection, id: &RawCoID, session: &SessionID) -> Result<u32> {
    let count: Option<u32> = conn
        .query_row(
            "SELECT tx_count FROM sessions WHERE co_id = ?1 AND session_id = ?2",
            params![id.as_bytes().as_slice(), session.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    Ok(count.unwrap_or(0))
}

#[async_trait]
impl Store for SqliteStore {
    async fn load_metadata(&self, id: &RawCoID) -> Result<Option<StoredMetadata>> {
        let id = *id;
        self.with_conn(move |conn| {
            let header: Option<Vec<u8>> = conn
                .query_row(
                    "SELECT header FROM covalues WHERE co_id = ?1",
                    params![id.as_bytes().as_slice()],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(header) = header else {
                return Ok(None);
            };
            let header: CoValueHeader = decode(&header)?;

            let mut stmt = conn.prepare(
                "SELECT session_id, tx_count FROM sessions WHERE co_id = ?1 ORDER BY session_id",
            )?;
            let rows = stmt
                .query_map(params![id.as_bytes().as_slice()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut known_state = KnownState::empty(id);
            known_state.header = true;
            for (session, count) in rows {
                known_state.sessions.insert(parse_session(session)?, count);
            }

            Ok(Some(StoredMetadata { header, known_state }))
        })
        .await
    }

    async fn load_transactions(
        &self,
        id: &RawCoID,
        session: &SessionID,
        from: u32,
        to: u32,
    ) -> Result<StoredTransactions> {
        let id = *id;
        let session = session.clone();
        self.with_conn(move |conn| {
            let co = id.as_bytes().to_vec();

            let mut stmt = conn.prepare(
                "SELECT tx FROM transactions
                 WHERE co_id = ?1 AND session_id = ?2 AND tx_index >= ?3 AND tx_index < ?4
                 ORDER BY tx_index",
            )?;
            let blobs = stmt
                .query_map(params![co, session.as_str(), from, to], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let transactions = blobs
                .iter()
                .map(|blob| decode::<Transaction>(blob))
                .collect::<Result<Vec<_>>>()?;

            let mut stmt = conn.prepare(
                "SELECT tx_index, signature FROM signatures
                 WHERE co_id = ?1 AND session_id = ?2 AND tx_index >= ?3 AND tx_index < ?4",
            )?;
            let rows = stmt
                .query_map(params![co, session.as_str(), from, to], |row| {
                    Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let mut signatures = BTreeMap::new();
            for (idx, sig) in rows {
                signatures.insert(idx, decode_signature(sig)?);
            }

            Ok(StoredTransactions {
                transactions,
                signatures,
            })
        })
        .await
    }

    async fn write(
        &self,
        id: &RawCoID,
        header: &CoValueHeader,
        sessions: &[SessionWrite],
    ) -> Result<WriteOutcome> {
        if header.id() != *id {
            return Err(StoreError::HeaderMismatch(*id));
        }
        let id = *id;
        let header_bytes = encode(header)?;
        let sessions = sessions.to_vec();

        self.with_conn(move |conn| {
            let now = now_millis();
            let tx = conn.transaction()?;
            let mut outcome = WriteOutcome::default();

            outcome.created = tx.execute(
                "INSERT OR IGNORE INTO covalues (co_id, header, created_at) VALUES (?1, ?2, ?3)",
                params![id.as_bytes().as_slice(), header_bytes, now],
            )? > 0;

            for write in &sessions {
                let have = session_count(&tx, &id, &write.session_id)?;
                let skip = overlap(&id, write, have)?;

                for (i, transaction) in write.transactions.iter().enumerate() {
                    let index = write.after + i as u32;
                    let bytes = encode(transaction)?;
                    if (i as u32) < skip {
                        let stored: Option<Vec<u8>> = tx
                            .query_row(
                                "SELECT tx FROM transactions
                                 WHERE co_id = ?1 AND session_id = ?2 AND tx_index = ?3",
                                params![id.as_bytes().as_slice(), write.session_id.as_str(), index],
                                |row| row.get(0),
                            )
                            .optional()?;
                        if stored.as_deref() != Some(bytes.as_slice()) {
                            return Err(StoreError::Conflict {
                                id,
                                session: write.session_id.clone(),
                                index,
                            });
                        }
                        continue;
                    }
                    tx.execute(
                        "INSERT INTO transactions (co_id, session_id, tx_index, tx) VALUES (?1, ?2, ?3, ?4)",
                        params![id.as_bytes().as_slice(), write.session_id.as_str(), index, bytes],
                    )?;
                }

                for (idx, sig) in &write.signatures {
                    tx.execute(
                        "INSERT OR REPLACE INTO signatures (co_id, session_id, tx_index, signature)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![id.as_bytes().as_slice(), write.session_id.as_str(), idx, sig.0.as_slice()],
                    )?;
                }

                let end = write.end().max(have);
                tx.execute(
                    "INSERT INTO sessions (co_id, session_id, tx_count, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (co_id, session_id) DO UPDATE SET tx_count = ?3, updated_at = ?4",
                    params![id.as_bytes().as_slice(), write.session_id.as_str(), end, now],
                )?;
                outcome.appended += end - have;
            }

            tx.commit()?;
            debug!(id = %id, appended = outcome.appended, created = outcome.created, "stored");
            Ok(outcome)
        })
        .await
    }
}
