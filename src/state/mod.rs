//! Durable case state
//!
//! The stateful engine treats the append-only event log as the source of
//! truth and snapshots as a cache: firings are deterministic, so replaying
//! `read()`'s output reproduces case state byte-exactly. Entries are
//! flushed before any case-altering operation is acknowledged.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::case::CaseId;
use crate::error::{WorkflowError, WorkflowResult};
use crate::events::ExternalEvent;

/// One durable log entry: an external event and when it was applied
///
/// The timestamp is replayed as-is so reconstructed history rows match the
/// original run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Sequence number within the case, starting at 1
    pub seq: u64,
    /// When the event was applied
    pub at: DateTime<Utc>,
    /// The event itself
    pub event: ExternalEvent,
}

impl LogEntry {
    /// Encode for the durable log
    ///
    /// Entries carry dynamic JSON payloads, which need a self-describing
    /// format; the snapshot framing stays bincode.
    pub fn encode(&self) -> WorkflowResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| WorkflowError::StatePersistence(e.to_string()))
    }

    /// Decode from the durable log
    pub fn decode(bytes: &[u8]) -> WorkflowResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| WorkflowError::StatePersistence(e.to_string()))
    }
}

/// A stored snapshot: the covered sequence number and the state bytes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    /// Entries up to and including this sequence are covered
    pub seq: u64,
    /// Case state bytes
    pub state: Vec<u8>,
}

/// Persistence contract for the stateful engine
#[async_trait]
pub trait CasePersistence: Send + Sync {
    /// Append one entry; durable before return
    async fn append(&self, case_id: CaseId, entry: &LogEntry) -> WorkflowResult<()>;

    /// Store a snapshot covering everything up to `seq`; durable before
    /// return
    async fn snapshot(&self, case_id: CaseId, seq: u64, state: &[u8]) -> WorkflowResult<()>;

    /// Latest snapshot (if any) and the entries recorded after it
    async fn read(
        &self,
        case_id: CaseId,
    ) -> WorkflowResult<Option<(Option<SnapshotData>, Vec<LogEntry>)>>;

    /// Cases present in the store
    async fn list_cases(&self) -> WorkflowResult<Vec<CaseId>>;
}

/// Sled-backed persistence: one tree for the log, one for snapshots
pub struct SledStore {
    db: sled::Db,
    log: sled::Tree,
    snapshots: sled::Tree,
}


impl SledStore {
    /// Open (or create) a store under `path`
    pub fn open<P: AsRef<Path>>(path: P) -> WorkflowResult<Self> {
        let db = sled::open(path)?;
        let log = db.open_tree("case_log")?;
        let snapshots = db.open_tree("case_snapshots")?;
        Ok(Self { db, log, snapshots })
    }

    fn log_key(case_id: CaseId, seq: u64) -> Vec<u8> {
        let mut key = case_id.0.as_bytes().to_vec();
        key.extend_from_slice(&seq.to_be_bytes());
        key
    }

    fn case_prefix(case_id: CaseId) -> Vec<u8> {
        case_id.0.as_bytes().to_vec()
    }
}

#[async_trait]
impl CasePersistence for SledStore {
    async fn append(&self, case_id: CaseId, entry: &LogEntry) -> WorkflowResult<()> {
        let key = Self::log_key(case_id, entry.seq);
        self.log.insert(key, entry.encode()?)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn snapshot(&self, case_id: CaseId, seq: u64, state: &[u8]) -> WorkflowResult<()> {
        let record = SnapshotData {
            seq,
            state: state.to_vec(),
        };
        let bytes = bincode::serialize(&record)
            .map_err(|e| WorkflowError::StatePersistence(e.to_string()))?;
        self.snapshots.insert(Self::case_prefix(case_id), bytes)?;
        self.db.flush_async().await?;
        Ok(())
    }

    async fn read(
        &self,
        case_id: CaseId,
    ) -> WorkflowResult<Option<(Option<SnapshotData>, Vec<LogEntry>)>> {
        let snapshot = self
            .snapshots
            .get(Self::case_prefix(case_id))?
            .map(|bytes| {
                bincode::deserialize::<SnapshotData>(&bytes)
                    .map_err(|e| WorkflowError::StatePersistence(e.to_string()))
            })
            .transpose()?;
        let covered_seq = snapshot.as_ref().map(|s| s.seq).unwrap_or(0);

        let mut entries = Vec::new();
        for kv in self.log.scan_prefix(Self::case_prefix(case_id)) {
            let (_, value) = kv?;
            let entry = LogEntry::decode(&value)?;
            if entry.seq > covered_seq {
                entries.push(entry);
            }
        }
        entries.sort_by_key(|e| e.seq);

        if snapshot.is_none() && entries.is_empty() {
            return Ok(None);
        }
        Ok(Some((snapshot, entries)))
    }

    async fn list_cases(&self) -> WorkflowResult<Vec<CaseId>> {
        let mut cases = std::collections::BTreeSet::new();
        for key in self.snapshots.iter().keys() {
            let key = key?;
            if let Ok(uuid) = uuid::Uuid::from_slice(&key) {
                cases.insert(CaseId(uuid));
            }
        }
        for key in self.log.iter().keys() {
            let key = key?;
            if key.len() >= 16 {
                if let Ok(uuid) = uuid::Uuid::from_slice(&key[..16]) {
                    cases.insert(CaseId(uuid));
                }
            }
        }
        Ok(cases.into_iter().collect())
    }
}
