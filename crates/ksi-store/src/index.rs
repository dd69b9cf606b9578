//! Event-log sidecar index.
//!
//! The router's event log is append-only NDJSON on disk; this index maps
//! correlation, session and agent ids to `(file, offset)` pointers so
//! queries never scan log files.

use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::store::{LOG_INDEX, Store};

/// Which id space a pointer is indexed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Keyed by correlation id.
    Correlation,
    /// Keyed by provider session id.
    Session,
    /// Keyed by agent id.
    Agent,
}

impl IndexKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Correlation => "correlation",
            Self::Session => "session",
            Self::Agent => "agent",
        }
    }
}

/// Position of one log line on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPointer {
    /// Log file name (one per day).
    pub file: String,
    /// Byte offset of the line start within the file.
    pub offset: u64,
}

impl Store {
    /// Record that log sequence `seq` for `key` lives at `pointer`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::Io`] on engine failure.
    pub fn index_log_entry(
        &self,
        kind: IndexKind,
        key: &str,
        seq: u64,
        pointer: &LogPointer,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(pointer)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(LOG_INDEX)?;
            table.insert((kind.as_str(), key, seq), bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// All recorded pointers for `key`, in append order, capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::StoreError::Io`] on engine failure.
    pub fn log_offsets(
        &self,
        kind: IndexKind,
        key: &str,
        limit: usize,
    ) -> StoreResult<Vec<LogPointer>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(LOG_INDEX)?;
        let mut pointers = Vec::new();
        for item in table.range((kind.as_str(), key, 0)..)? {
            let (k, v) = item?;
            let (k_kind, k_key, _) = k.value();
            if k_kind != kind.as_str() || k_key != key {
                break;
            }
            if pointers.len() >= limit {
                break;
            }
            pointers.push(serde_json::from_slice(v.value())?);
        }
        Ok(pointers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_round_trip_in_order() {
        let store = Store::in_memory().unwrap();
        for seq in [2u64, 0, 1] {
            store
                .index_log_entry(
                    IndexKind::Correlation,
                    "corr_1",
                    seq,
                    &LogPointer {
                        file: "events-2026-08-01.ndjson".to_owned(),
                        offset: seq * 100,
                    },
                )
                .unwrap();
        }
        let pointers = store
            .log_offsets(IndexKind::Correlation, "corr_1", 10)
            .unwrap();
        let offsets: Vec<u64> = pointers.iter().map(|p| p.offset).collect();
        assert_eq!(offsets, vec![0, 100, 200]);

        assert!(store
            .log_offsets(IndexKind::Session, "corr_1", 10)
            .unwrap()
            .is_empty());
    }
}
