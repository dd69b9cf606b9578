//! Store handle, table definitions, KV and queue surfaces.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::types::KvPage;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// KV surface: `(namespace, key)` → raw bytes.
pub(crate) const KV: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("kv");

/// Queue items: `(queue, seq)` → raw bytes.
pub(crate) const QUEUE_ITEMS: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("queue_items");

/// Queue cursors: queue → `(head, tail)`. `head == tail` means empty.
pub(crate) const QUEUE_META: TableDefinition<&str, (u64, u64)> =
    TableDefinition::new("queue_meta");

/// Entities: `(type, id)` → JSON [`crate::EntityRecord`].
pub(crate) const ENTITIES: TableDefinition<(&str, &str), &[u8]> = TableDefinition::new("entities");

/// Forward edges: `(from_type, from_id, kind, to_type, to_id)` → JSON props.
pub(crate) const RELS_FWD: TableDefinition<(&str, &str, &str, &str, &str), &[u8]> =
    TableDefinition::new("relationships");

/// Reverse edges: `(to_type, to_id, kind, from_type, from_id)` → unit.
pub(crate) const RELS_REV: TableDefinition<(&str, &str, &str, &str, &str), ()> =
    TableDefinition::new("relationships_rev");

/// Event-log sidecar index: `(index_kind, key, seq)` → JSON [`crate::LogPointer`].
pub(crate) const LOG_INDEX: TableDefinition<(&str, &str, u64), &[u8]> =
    TableDefinition::new("log_index");

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Handle to the embedded database.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Store {
    pub(crate) db: Database,
    /// Per-queue wakeup signals for [`Store::pop_wait`].
    queue_signals: DashMap<String, Arc<Notify>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the engine cannot open the file.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
        }
        let db = Database::create(path)?;
        let store = Self {
            db,
            queue_signals: DashMap::new(),
        };
        store.ensure_tables()?;
        debug!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Open an in-memory store (tests).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] if the engine fails to initialise.
    pub fn in_memory() -> StoreResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        let store = Self {
            db,
            queue_signals: DashMap::new(),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Create every table so later read transactions never race table
    /// creation.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        {
            txn.open_table(KV)?;
            txn.open_table(QUEUE_ITEMS)?;
            txn.open_table(QUEUE_META)?;
            txn.open_table(ENTITIES)?;
            txn.open_table(RELS_FWD)?;
            txn.open_table(RELS_REV)?;
            txn.open_table(LOG_INDEX)?;
        }
        txn.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // KV
    // -----------------------------------------------------------------------

    /// Read a value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn get(&self, namespace: &str, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV)?;
        Ok(table.get((namespace, key))?.map(|g| g.value().to_vec()))
    }

    /// Write a value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn set(&self, namespace: &str, key: &str, value: &[u8]) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV)?;
            table.insert((namespace, key), value)?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Delete a value. Returns whether the key existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn delete(&self, namespace: &str, key: &str) -> StoreResult<bool> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut table = txn.open_table(KV)?;
            table.remove((namespace, key))?.is_some()
        };
        txn.commit()?;
        Ok(existed)
    }

    /// List keys in a namespace, optionally filtered by a glob over the key.
    ///
    /// Returns at most `limit` entries in key order; a continuation token is
    /// included when truncated. Pass the token back as `token` to resume.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidGlob`] for a malformed pattern and
    /// [`StoreError::Io`] on engine failure.
    pub fn list(
        &self,
        namespace: &str,
        glob: Option<&str>,
        limit: usize,
        token: Option<&str>,
    ) -> StoreResult<KvPage> {
        let matcher = glob
            .map(|g| {
                globset::Glob::new(g)
                    .map(|g| g.compile_matcher())
                    .map_err(|e| StoreError::InvalidGlob(e.to_string()))
            })
            .transpose()?;

        let txn = self.db.begin_read()?;
        let table = txn.open_table(KV)?;
        let start_key = token.unwrap_or("");
        let mut entries = Vec::new();
        let mut next_token = None;

        for item in table.range((namespace, start_key)..)? {
            let (k, v) = item?;
            let (ns, key) = k.value();
            if ns != namespace {
                break;
            }
            // Inclusive range start: skip the token key itself on resume.
            if token == Some(key) {
                continue;
            }
            if let Some(m) = &matcher {
                if !m.is_match(key) {
                    continue;
                }
            }
            if entries.len() >= limit {
                next_token = entries.last().map(|(k, _): &(String, Vec<u8>)| k.clone());
                break;
            }
            entries.push((key.to_owned(), v.value().to_vec()));
        }
        Ok(KvPage {
            entries,
            next_token,
        })
    }

    /// Atomic compare-and-set.
    ///
    /// `expected = None` means "create only if absent"; `new = None` means
    /// "delete". The comparison and the write happen in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when the current value does not
    /// match `expected`, [`StoreError::Io`] on engine failure.
    pub fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StoreResult<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(KV)?;
            let current = table.get((namespace, key))?.map(|g| g.value().to_vec());
            if current.as_deref() != expected {
                return Err(StoreError::Conflict(format!("cas failed on {namespace}/{key}")));
            }
            match new {
                Some(value) => {
                    table.insert((namespace, key), value)?;
                },
                None => {
                    table.remove((namespace, key))?;
                },
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// JSON convenience over [`Store::get`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Corrupt`] if the stored bytes fail to
    /// deserialize.
    pub fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        namespace: &str,
        key: &str,
    ) -> StoreResult<Option<T>> {
        match self.get(namespace, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// JSON convenience over [`Store::set`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn set_json<T: serde::Serialize>(
        &self,
        namespace: &str,
        key: &str,
        value: &T,
    ) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(namespace, key, &bytes)
    }

    // -----------------------------------------------------------------------
    // Queue
    // -----------------------------------------------------------------------

    /// Append to a FIFO queue. Returns the assigned sequence number.
    ///
    /// With `max = Some(n)`, a queue already holding `n` items rejects the
    /// push with [`StoreError::Capacity`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Capacity`] or [`StoreError::Io`].
    pub fn push(&self, queue: &str, value: &[u8], max: Option<u64>) -> StoreResult<u64> {
        let txn = self.db.begin_write()?;
        let seq = {
            let mut meta = txn.open_table(QUEUE_META)?;
            let (head, tail) = meta.get(queue)?.map_or((0, 0), |g| g.value());
            if let Some(max) = max {
                if tail - head >= max {
                    return Err(StoreError::Capacity(format!("queue {queue} is full")));
                }
            }
            let mut items = txn.open_table(QUEUE_ITEMS)?;
            items.insert((queue, tail), value)?;
            meta.insert(queue, (head, tail + 1))?;
            tail
        };
        txn.commit()?;
        self.signal(queue).notify_one();
        Ok(seq)
    }

    /// Pop the oldest item, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn pop(&self, queue: &str) -> StoreResult<Option<Vec<u8>>> {
        let txn = self.db.begin_write()?;
        let popped = {
            let mut meta = txn.open_table(QUEUE_META)?;
            let (head, tail) = meta.get(queue)?.map_or((0, 0), |g| g.value());
            if head == tail {
                None
            } else {
                let mut items = txn.open_table(QUEUE_ITEMS)?;
                let value = items.remove((queue, head))?.map(|g| g.value().to_vec());
                meta.insert(queue, (head + 1, tail))?;
                value
            }
        };
        txn.commit()?;
        Ok(popped)
    }

    /// Number of items currently queued.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn length(&self, queue: &str) -> StoreResult<u64> {
        let txn = self.db.begin_read()?;
        let meta = txn.open_table(QUEUE_META)?;
        Ok(meta.get(queue)?.map_or(0, |g| {
            let (head, tail) = g.value();
            tail - head
        }))
    }

    /// Pop, waiting up to `timeout` for an item to arrive.
    ///
    /// Returns `None` on timeout. Wakeups are edge-triggered by
    /// [`Store::push`]; a permit stored before the wait begins is consumed
    /// immediately, so pushes are never missed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub async fn pop_wait(&self, queue: &str, timeout: Duration) -> StoreResult<Option<Vec<u8>>> {
        let notify = self.signal(queue);
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = notify.notified();
            if let Some(value) = self.pop(queue)? {
                return Ok(Some(value));
            }
            tokio::select! {
                () = notified => {},
                () = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    fn signal(&self, queue: &str) -> Arc<Notify> {
        self.queue_signals
            .entry(queue.to_owned())
            .or_insert_with(|| Arc::new(Notify::new()))
            .value()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_round_trip() {
        let store = Store::in_memory().unwrap();
        assert!(store.get("ns", "k").unwrap().is_none());
        store.set("ns", "k", b"v").unwrap();
        assert_eq!(store.get("ns", "k").unwrap().as_deref(), Some(&b"v"[..]));
        assert!(store.delete("ns", "k").unwrap());
        assert!(!store.delete("ns", "k").unwrap());
    }

    #[test]
    fn test_kv_namespaces_are_disjoint() {
        let store = Store::in_memory().unwrap();
        store.set("a", "k", b"1").unwrap();
        store.set("b", "k", b"2").unwrap();
        assert_eq!(store.get("a", "k").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(store.get("b", "k").unwrap().as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn test_list_glob_and_pagination() {
        let store = Store::in_memory().unwrap();
        for key in ["alpha", "beta", "gamma", "ghost"] {
            store.set("ns", key, b"x").unwrap();
        }
        let page = store.list("ns", Some("g*"), 10, None).unwrap();
        let keys: Vec<_> = page.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["gamma", "ghost"]);
        assert!(page.next_token.is_none());

        let first = store.list("ns", None, 2, None).unwrap();
        assert_eq!(first.entries.len(), 2);
        let token = first.next_token.clone().unwrap();
        let rest = store.list("ns", None, 10, Some(&token)).unwrap();
        assert_eq!(rest.entries.len(), 2);
        assert!(rest.next_token.is_none());
    }

    #[test]
    fn test_compare_and_set() {
        let store = Store::in_memory().unwrap();
        // Create if absent.
        store.compare_and_set("ns", "k", None, Some(b"1")).unwrap();
        // Stale expectation fails.
        let err = store
            .compare_and_set("ns", "k", Some(b"0"), Some(b"2"))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // Fresh expectation succeeds.
        store
            .compare_and_set("ns", "k", Some(b"1"), Some(b"2"))
            .unwrap();
        // CAS delete.
        store.compare_and_set("ns", "k", Some(b"2"), None).unwrap();
        assert!(store.get("ns", "k").unwrap().is_none());
    }

    #[test]
    fn test_queue_fifo() {
        let store = Store::in_memory().unwrap();
        store.push("q", b"a", None).unwrap();
        store.push("q", b"b", None).unwrap();
        assert_eq!(store.length("q").unwrap(), 2);
        assert_eq!(store.pop("q").unwrap().as_deref(), Some(&b"a"[..]));
        assert_eq!(store.pop("q").unwrap().as_deref(), Some(&b"b"[..]));
        assert!(store.pop("q").unwrap().is_none());
    }

    #[test]
    fn test_queue_capacity() {
        let store = Store::in_memory().unwrap();
        store.push("q", b"a", Some(1)).unwrap();
        let err = store.push("q", b"b", Some(1)).unwrap_err();
        assert!(matches!(err, StoreError::Capacity(_)));
    }

    #[tokio::test]
    async fn test_pop_wait_wakes_on_push() {
        let store = std::sync::Arc::new(Store::in_memory().unwrap());
        let waiter = std::sync::Arc::clone(&store);
        let handle = tokio::spawn(async move {
            waiter.pop_wait("q", Duration::from_secs(5)).await.unwrap()
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push("q", b"late", None).unwrap();
        let got = handle.await.unwrap();
        assert_eq!(got.as_deref(), Some(&b"late"[..]));
    }

    #[tokio::test]
    async fn test_pop_wait_times_out() {
        let store = Store::in_memory().unwrap();
        let got = store.pop_wait("q", Duration::from_millis(30)).await.unwrap();
        assert!(got.is_none());
    }
}
