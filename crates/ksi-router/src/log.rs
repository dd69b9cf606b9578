//! The durable event log.
//!
//! Append-only newline-delimited JSON under a configured root, one file
//! per UTC day. Every dispatched event gets a `dispatch` line *before*
//! any handler runs or any reply frame is sent; a compact `outcome` line
//! follows once its handlers finish. Replay consumes dispatch lines in
//! file order, which is the system's global event order.
//!
//! A sidecar index in the store maps correlation, session and agent ids
//! to `(file, offset)` so lookups never scan the log.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;

use chrono::Utc;
use ksi_core::{Event, EventContext, EventId};
use ksi_store::{IndexKind, LogPointer, Store};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{RouterError, RouterResult};

/// Key under which the next log sequence number persists.
const META_NS: &str = "log_meta";
const META_KEY: &str = "next_seq";

/// One NDJSON log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum LogEntry {
    /// Written before dispatch; carries the full event.
    Dispatch {
        /// Global append sequence.
        seq: u64,
        /// Event name.
        name: String,
        /// System-stamped context.
        context: EventContext,
        /// Input payload.
        data: serde_json::Value,
    },
    /// Written after the event's handlers finish.
    Outcome {
        /// Sequence of the matching dispatch line.
        seq: u64,
        /// Event id of the matching dispatch line.
        event_id: EventId,
        /// Per-handler outcomes.
        outcomes: Vec<LogOutcome>,
        /// Wall time spent in handlers.
        duration_ms: u64,
    },
}

/// Outcome of one handler invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOutcome {
    /// Whether the handler returned a result.
    pub ok: bool,
    /// The error string when it did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct LogState {
    day: String,
    writer: BufWriter<File>,
    file_name: String,
    offset: u64,
    next_seq: u64,
}

/// Append-only event log with daily rotation.
pub struct EventLog {
    root: PathBuf,
    store: Arc<Store>,
    state: Mutex<LogState>,
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog").field("root", &self.root).finish_non_exhaustive()
    }
}

fn file_name_for(day: &str) -> String {
    format!("events-{day}.ndjson")
}

/// Highest sequence recorded in the newest log file, if any.
///
/// Sequences grow monotonically across days, so the lexicographically
/// last day file is sufficient. Torn trailing lines are skipped.
fn recover_last_seq(root: &Path) -> Option<u64> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(root)
        .ok()?
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("events-") && n.ends_with(".ndjson"))
        })
        .collect();
    files.sort();
    let newest = files.pop()?;
    let file = File::open(&newest).ok()?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let Ok(line) = line else { break };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(LogEntry::Dispatch { seq, .. } | LogEntry::Outcome { seq, .. }) => {
                last = Some(last.map_or(seq, |prior: u64| prior.max(seq)));
            },
            Err(e) => warn!(path = %newest.display(), error = %e, "skipping torn log line"),
        }
    }
    last
}

fn open_day_file(root: &Path, day: &str) -> RouterResult<(BufWriter<File>, String, u64)> {
    let name = file_name_for(day);
    let path = root.join(&name);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| RouterError::LogWrite(format!("{}: {e}", path.display())))?;
    let offset = file
        .metadata()
        .map_err(|e| RouterError::LogWrite(e.to_string()))?
        .len();
    Ok((BufWriter::new(file), name, offset))
}

impl EventLog {
    /// Open the log under `root`, resuming the persisted sequence.
    ///
    /// The counter in the store commits separately from the NDJSON flush,
    /// so a crash between the two leaves it behind the file. Reusing a
    /// sequence would silently collide in the sidecar index (it keys
    /// pointers by `(kind, key, seq)`), so the counter is reconciled
    /// against the newest log file's last recorded sequence and the
    /// larger of the two wins.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::LogWrite`] if the directory or the current
    /// day file cannot be created.
    pub fn open(root: &Path, store: Arc<Store>) -> RouterResult<Self> {
        std::fs::create_dir_all(root)
            .map_err(|e| RouterError::LogWrite(format!("{}: {e}", root.display())))?;
        let persisted = store
            .get_json::<u64>(META_NS, META_KEY)
            .map_err(|e| RouterError::LogWrite(e.to_string()))?
            .unwrap_or(0);
        let next_seq = persisted.max(recover_last_seq(root).map_or(0, |seq| seq + 1));
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let (writer, file_name, offset) = open_day_file(root, &day)?;
        Ok(Self {
            root: root.to_path_buf(),
            store,
            state: Mutex::new(LogState {
                day,
                writer,
                file_name,
                offset,
                next_seq,
            }),
        })
    }

    /// Append the dispatch line for `event` and index it. Returns the
    /// assigned sequence.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::LogWrite`] on any write failure — fatal to
    /// the daemon.
    pub fn append_dispatch(&self, event: &Event) -> RouterResult<u64> {
        let mut state = self.state.lock().expect("event log lock poisoned");
        self.rotate_if_needed(&mut state)?;

        let seq = state.next_seq;
        let entry = LogEntry::Dispatch {
            seq,
            name: event.name.as_str().to_owned(),
            context: event.context.clone(),
            data: event.data.clone(),
        };
        let offset = self.write_line(&mut state, &entry)?;
        state.next_seq += 1;

        let pointer = LogPointer {
            file: state.file_name.clone(),
            offset,
        };
        self.store
            .set_json(META_NS, META_KEY, &state.next_seq)
            .map_err(|e| RouterError::LogWrite(e.to_string()))?;

        // Sidecar indexes. Index failures degrade queries, not durability.
        let ctx = &event.context;
        let mut index = |kind: IndexKind, key: &str| {
            if let Err(e) = self.store.index_log_entry(kind, key, seq, &pointer) {
                warn!(error = %e, "failed to index log entry");
            }
        };
        index(IndexKind::Correlation, ctx.correlation_id.as_str());
        if let Some(agent_id) = &ctx.agent_id {
            index(IndexKind::Agent, agent_id.as_str());
        }
        if let Some(session) = event.data.get("session_id").and_then(|v| v.as_str()) {
            index(IndexKind::Session, session);
        }
        Ok(seq)
    }

    /// Append the outcome line for a previously dispatched event.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::LogWrite`] on write failure.
    pub fn append_outcome(
        &self,
        seq: u64,
        event_id: EventId,
        outcomes: Vec<LogOutcome>,
        duration_ms: u64,
    ) -> RouterResult<()> {
        let mut state = self.state.lock().expect("event log lock poisoned");
        self.rotate_if_needed(&mut state)?;
        let entry = LogEntry::Outcome {
            seq,
            event_id,
            outcomes,
            duration_ms,
        };
        self.write_line(&mut state, &entry)?;
        Ok(())
    }

    fn rotate_if_needed(&self, state: &mut LogState) -> RouterResult<()> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        if day != state.day {
            let (writer, file_name, offset) = open_day_file(&self.root, &day)?;
            state.day = day;
            state.writer = writer;
            state.file_name = file_name;
            state.offset = offset;
        }
        Ok(())
    }

    /// Serialize, write, flush. Returns the line's start offset.
    fn write_line(&self, state: &mut LogState, entry: &LogEntry) -> RouterResult<u64> {
        let mut line =
            serde_json::to_vec(entry).map_err(|e| RouterError::LogWrite(e.to_string()))?;
        line.push(b'\n');
        let offset = state.offset;
        state
            .writer
            .write_all(&line)
            .map_err(|e| RouterError::LogWrite(e.to_string()))?;
        state
            .writer
            .flush()
            .map_err(|e| RouterError::LogWrite(e.to_string()))?;
        state.offset += line.len() as u64;
        Ok(offset)
    }

    /// Read every log line under `root` in file order, oldest day first.
    ///
    /// Unparseable lines are skipped with a warning so a torn trailing
    /// write cannot block recovery.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::LogWrite`] if the directory listing fails.
    pub fn replay<F: FnMut(LogEntry)>(root: &Path, mut visit: F) -> RouterResult<()> {
        if !root.is_dir() {
            return Ok(());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(root)
            .map_err(|e| RouterError::LogWrite(e.to_string()))?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("events-") && n.ends_with(".ndjson"))
            })
            .collect();
        files.sort();
        for path in files {
            let file = match File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable log file");
                    continue;
                },
            };
            for line in BufReader::new(file).lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<LogEntry>(&line) {
                    Ok(entry) => visit(entry),
                    Err(e) => warn!(path = %path.display(), error = %e, "skipping torn log line"),
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksi_core::EventName;
    use serde_json::json;

    fn event(name: &str, data: serde_json::Value) -> Event {
        Event::new(EventName::parse(name).unwrap(), data, EventContext::root())
    }

    #[test]
    fn test_append_and_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        let log = EventLog::open(dir.path(), Arc::clone(&store)).unwrap();

        let first = event("agent:spawn", json!({"component": "x"}));
        let second = event("completion:async", json!({"session_id": "s-1"}));
        let seq0 = log.append_dispatch(&first).unwrap();
        let seq1 = log.append_dispatch(&second).unwrap();
        assert_eq!((seq0, seq1), (0, 1));
        log.append_outcome(seq0, first.context.event_id.clone(), vec![LogOutcome { ok: true, error: None }], 3)
            .unwrap();

        let mut dispatches = Vec::new();
        let mut outcomes = 0;
        EventLog::replay(dir.path(), |entry| match entry {
            LogEntry::Dispatch { seq, name, .. } => dispatches.push((seq, name)),
            LogEntry::Outcome { .. } => outcomes += 1,
        })
        .unwrap();
        assert_eq!(
            dispatches,
            vec![(0, "agent:spawn".to_owned()), (1, "completion:async".to_owned())]
        );
        assert_eq!(outcomes, 1);
    }

    #[test]
    fn test_sequence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        {
            let log = EventLog::open(dir.path(), Arc::clone(&store)).unwrap();
            log.append_dispatch(&event("a:b", json!({}))).unwrap();
        }
        let log = EventLog::open(dir.path(), Arc::clone(&store)).unwrap();
        let seq = log.append_dispatch(&event("a:c", json!({}))).unwrap();
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_stale_counter_reconciled_against_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        {
            let log = EventLog::open(dir.path(), Arc::clone(&store)).unwrap();
            log.append_dispatch(&event("a:b", json!({}))).unwrap();
            log.append_dispatch(&event("a:c", json!({}))).unwrap();
        }
        // Simulate a crash between the file flush and the counter commit:
        // the file holds seqs 0 and 1 but the store never saw them.
        store.set_json(META_NS, META_KEY, &0u64).unwrap();

        let log = EventLog::open(dir.path(), Arc::clone(&store)).unwrap();
        let seq = log.append_dispatch(&event("a:d", json!({}))).unwrap();
        assert_eq!(seq, 2, "reused sequences would corrupt the sidecar index");

        // Replay sees three distinct dispatch sequences.
        let mut seqs = Vec::new();
        EventLog::replay(dir.path(), |entry| {
            if let LogEntry::Dispatch { seq, .. } = entry {
                seqs.push(seq);
            }
        })
        .unwrap();
        assert_eq!(seqs, vec![0, 1, 2]);
    }

    #[test]
    fn test_sidecar_indexes_written() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::in_memory().unwrap());
        let log = EventLog::open(dir.path(), Arc::clone(&store)).unwrap();

        let mut e = event("completion:result", json!({"session_id": "s-9"}));
        e.context.agent_id = Some(ksi_core::AgentId::from("a1"));
        log.append_dispatch(&e).unwrap();

        assert_eq!(
            store
                .log_offsets(IndexKind::Correlation, e.context.correlation_id.as_str(), 10)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(store.log_offsets(IndexKind::Agent, "a1", 10).unwrap().len(), 1);
        assert_eq!(store.log_offsets(IndexKind::Session, "s-9", 10).unwrap().len(), 1);
    }
}
