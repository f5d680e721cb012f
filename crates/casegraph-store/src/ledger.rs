//! Append-only extraction ledger: sessions, steps and published entities.
//!
//! Steps are keyed by `(session_id, step_number)` and are write-once. Step
//! numbers are assigned here, under the ledger write lock, as `len + 1`, which
//! keeps every session's numbering contiguous from 1. Sessions only change
//! through status/aggregate updates, and entity sets only while a session is
//! still in progress.

use crate::model::{
    CaseId, EntityKey, ExtractionSession, ExtractionStep, PublishedEntity, SessionAggregates,
    SessionId, SessionStatus, StepDraft,
};
use crate::persistence::{WalError, WriteAheadLog};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("session {0} is closed")]
    SessionClosed(SessionId),
    #[error("session {0} already exists")]
    DuplicateSession(SessionId),
    #[error("ledger log is corrupt: {0}")]
    Corrupt(String),
    #[error("ledger is open read-only")]
    ReadOnly,
    #[error(transparent)]
    Wal(WalError),
}

impl From<WalError> for LedgerError {
    fn from(err: WalError) -> Self {
        match err {
            WalError::ChecksumMismatch { .. }
            | WalError::Decode { .. }
            | WalError::Rejected(_) => {
                LedgerError::Corrupt(err.to_string())
            }
            WalError::ReadOnly(_) => LedgerError::ReadOnly,
            other => LedgerError::Wal(other),
        }
    }
}

/// One durable ledger mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LedgerRecord {
    SessionStarted(ExtractionSession),
    StepAppended(ExtractionStep),
    EntitiesReplaced {
        session_id: SessionId,
        entities: Vec<PublishedEntity>,
    },
    SessionClosed {
        session_id: SessionId,
        status: SessionStatus,
        aggregates: SessionAggregates,
        ended_at: DateTime<Utc>,
        failure_reason: Option<String>,
    },
}

#[derive(Default)]
struct LedgerTables {
    sessions: HashMap<SessionId, ExtractionSession>,
    /// Session ids in start order
    order: Vec<SessionId>,
    steps: HashMap<SessionId, Vec<ExtractionStep>>,
    entities: HashMap<SessionId, BTreeMap<EntityKey, PublishedEntity>>,
}

impl LedgerTables {
    fn check_open(&self, session_id: SessionId) -> Result<(), LedgerError> {
        match self.sessions.get(&session_id) {
            None => Err(LedgerError::UnknownSession(session_id)),
            Some(s) if s.status.is_closed() => Err(LedgerError::SessionClosed(session_id)),
            Some(_) => Ok(()),
        }
    }

    fn apply(&mut self, record: LedgerRecord) -> Result<(), LedgerError> {
        match record {
            LedgerRecord::SessionStarted(session) => {
                let id = session.id;
                if self.sessions.insert(id, session).is_some() {
                    return Err(LedgerError::DuplicateSession(id));
                }
                self.order.push(id);
                self.steps.insert(id, Vec::new());
                self.entities.insert(id, BTreeMap::new());
            }
            LedgerRecord::StepAppended(step) => {
                self.check_open(step.session_id)?;
                let steps = self.steps.entry(step.session_id).or_default();
                let expected = steps.len() as u32 + 1;
                if step.step_number != expected {
                    return Err(LedgerError::Corrupt(format!(
                        "session {} step {} recorded where {} was expected",
                        step.session_id, step.step_number, expected
                    )));
                }
                steps.push(step);
            }
            LedgerRecord::EntitiesReplaced {
                session_id,
                entities,
            } => {
                self.check_open(session_id)?;
                let table = entities.into_iter().map(|e| (e.key(), e)).collect();
                self.entities.insert(session_id, table);
            }
            LedgerRecord::SessionClosed {
                session_id,
                status,
                aggregates,
                ended_at,
                failure_reason,
            } => {
                self.check_open(session_id)?;
                let session = self
                    .sessions
                    .get_mut(&session_id)
                    .ok_or(LedgerError::UnknownSession(session_id))?;
                session.status = status;
                session.aggregates = aggregates;
                session.ended_at = Some(ended_at);
                session.failure_reason = failure_reason;
            }
        }
        Ok(())
    }
}

/// The ledger. Cheap to share behind an `Arc`.
pub struct Ledger {
    tables: RwLock<LedgerTables>,
    wal: Option<WriteAheadLog>,
    read_only: bool,
}

impl Ledger {
    /// Volatile ledger (tests, dry runs).
    pub fn in_memory() -> Self {
        Self {
            tables: RwLock::new(LedgerTables::default()),
            wal: None,
            read_only: false,
        }
    }

    /// Durable ledger backed by a write-ahead log; replays existing records.
    /// The caller must be the only writer of `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let wal = WriteAheadLog::open(path.as_ref())?;
        let tables = Self::replay(&wal)?;
        Ok(Self {
            tables: RwLock::new(tables),
            wal: Some(wal),
            read_only: false,
        })
    }

    /// Snapshot of a ledger another process may still be writing. The file is
    /// never modified and every write is refused; a missing file reads as empty.
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let (tables, wal) = if path.exists() {
            let wal = WriteAheadLog::open_read_only(path)?;
            (Self::replay(&wal)?, Some(wal))
        } else {
            (LedgerTables::default(), None)
        };
        Ok(Self {
            tables: RwLock::new(tables),
            wal,
            read_only: true,
        })
    }

    fn replay(wal: &WriteAheadLog) -> Result<LedgerTables, LedgerError> {
        let mut tables = LedgerTables::default();
        let replayed = wal.replay(|record: LedgerRecord| {
            tables
                .apply(record)
                .map_err(|e| WalError::Rejected(e.to_string()))
        })?;
        tracing::info!(
            path = %wal.path().display(),
            records = replayed,
            sessions = tables.sessions.len(),
            writable = wal.is_writable(),
            "replayed extraction ledger"
        );
        Ok(tables)
    }

    fn commit(&self, tables: &mut LedgerTables, record: LedgerRecord) -> Result<(), LedgerError> {
        if self.read_only {
            return Err(LedgerError::ReadOnly);
        }
        // Preconditions are checked before logging; a rejected record never
        // reaches the WAL.
        match &record {
            LedgerRecord::SessionStarted(s) if tables.sessions.contains_key(&s.id) => {
                return Err(LedgerError::DuplicateSession(s.id));
            }
            LedgerRecord::SessionStarted(_) => {}
            LedgerRecord::StepAppended(step) => tables.check_open(step.session_id)?,
            LedgerRecord::EntitiesReplaced { session_id, .. }
            | LedgerRecord::SessionClosed { session_id, .. } => tables.check_open(*session_id)?,
        }
        if let Some(wal) = &self.wal {
            wal.append(&record)?;
        }
        tables.apply(record)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    pub fn insert_session(&self, session: ExtractionSession) -> Result<(), LedgerError> {
        let mut tables = self.tables.write();
        self.commit(&mut tables, LedgerRecord::SessionStarted(session))
    }

    /// Append a step, assigning the next contiguous step number.
    pub fn append_step(
        &self,
        session_id: SessionId,
        draft: StepDraft,
    ) -> Result<ExtractionStep, LedgerError> {
        let mut tables = self.tables.write();
        tables.check_open(session_id)?;
        let next = tables.steps.get(&session_id).map_or(0, |s| s.len()) as u32 + 1;
        let step = ExtractionStep::from_draft(session_id, next, draft);
        self.commit(&mut tables, LedgerRecord::StepAppended(step.clone()))?;
        Ok(step)
    }

    /// Replace the entity set of an in-progress session.
    pub fn upsert_entities(
        &self,
        session_id: SessionId,
        entities: Vec<PublishedEntity>,
    ) -> Result<(), LedgerError> {
        let mut tables = self.tables.write();
        self.commit(
            &mut tables,
            LedgerRecord::EntitiesReplaced {
                session_id,
                entities,
            },
        )
    }

    pub fn close_session(
        &self,
        session_id: SessionId,
        status: SessionStatus,
        aggregates: SessionAggregates,
        failure_reason: Option<String>,
    ) -> Result<ExtractionSession, LedgerError> {
        let mut tables = self.tables.write();
        self.commit(
            &mut tables,
            LedgerRecord::SessionClosed {
                session_id,
                status,
                aggregates,
                ended_at: Utc::now(),
                failure_reason,
            },
        )?;
        tables
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or(LedgerError::UnknownSession(session_id))
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn session(&self, session_id: SessionId) -> Result<ExtractionSession, LedgerError> {
        self.tables
            .read()
            .sessions
            .get(&session_id)
            .cloned()
            .ok_or(LedgerError::UnknownSession(session_id))
    }

    pub fn steps(&self, session_id: SessionId) -> Result<Vec<ExtractionStep>, LedgerError> {
        self.tables
            .read()
            .steps
            .get(&session_id)
            .cloned()
            .ok_or(LedgerError::UnknownSession(session_id))
    }

    pub fn step_count(&self, session_id: SessionId) -> Result<u32, LedgerError> {
        self.tables
            .read()
            .steps
            .get(&session_id)
            .map(|s| s.len() as u32)
            .ok_or(LedgerError::UnknownSession(session_id))
    }

    pub fn entities(&self, session_id: SessionId) -> Result<Vec<PublishedEntity>, LedgerError> {
        self.tables
            .read()
            .entities
            .get(&session_id)
            .map(|t| t.values().cloned().collect())
            .ok_or(LedgerError::UnknownSession(session_id))
    }

    /// Sessions in start order, optionally filtered by case.
    pub fn list_sessions(&self, case_id: Option<&CaseId>) -> Vec<ExtractionSession> {
        let tables = self.tables.read();
        tables
            .order
            .iter()
            .filter_map(|id| tables.sessions.get(id))
            .filter(|s| case_id.map_or(true, |c| &s.case_id == c))
            .cloned()
            .collect()
    }

    pub fn is_durable(&self) -> bool {
        self.wal.is_some()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }
}
