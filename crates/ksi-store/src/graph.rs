//! Entity / relationship surface.
//!
//! Entities are `(type, id)` handles with JSON property bags; relationships
//! are directed typed edges kept in a forward table and a mirrored reverse
//! table so both directions scan as a prefix. `parent_of` is constrained to
//! a forest (no self-loops, one parent per node, no ancestor cycles).
//! Deletes — cascading or not — remove every edge touching the removed
//! entities so no dangling edge survives.

use std::collections::{HashSet, VecDeque};

use chrono::Utc;
use redb::ReadableTable;
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::store::{ENTITIES, RELS_FWD, RELS_REV, Store};
use crate::types::{
    Direction, EntityRecord, EntityRef, NeighborPage, RelRecord, TraversePage, UpdateMode,
};

/// Relationship kind whose presence makes a delete cascade to the target.
pub(crate) const KIND_OWNS: &str = "owns";

/// Relationship kind constrained to a forest.
pub(crate) const KIND_PARENT_OF: &str = "parent_of";

/// Separator used inside neighbor continuation tokens.
const TOKEN_SEP: char = '\u{1}';

/// Resumable BFS state carried inside a traverse continuation token.
#[derive(Serialize, Deserialize)]
struct TraverseCursor {
    frontier: Vec<(EntityRef, u32)>,
    visited: Vec<EntityRef>,
}

impl Store {
    // -----------------------------------------------------------------------
    // Entities
    // -----------------------------------------------------------------------

    /// Create an entity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if `(type, id)` already exists.
    pub fn create_entity(
        &self,
        entity: &EntityRef,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<EntityRecord> {
        let now = Utc::now();
        let record = EntityRecord {
            properties,
            created_at: now,
            updated_at: now,
        };
        let bytes = serde_json::to_vec(&record)?;
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(ENTITIES)?;
            let key = (entity.entity_type.as_str(), entity.id.as_str());
            if table.get(key)?.is_some() {
                return Err(StoreError::Conflict(format!("entity {entity} already exists")));
            }
            table.insert(key, bytes.as_slice())?;
        }
        txn.commit()?;
        Ok(record)
    }

    /// Read an entity.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure or
    /// [`StoreError::Corrupt`] if the stored record fails to deserialize.
    pub fn get_entity(&self, entity: &EntityRef) -> StoreResult<Option<EntityRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTITIES)?;
        match table.get((entity.entity_type.as_str(), entity.id.as_str()))? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Update an entity's properties by merge or replace.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the entity does not exist.
    pub fn update_entity(
        &self,
        entity: &EntityRef,
        properties: serde_json::Map<String, serde_json::Value>,
        mode: UpdateMode,
    ) -> StoreResult<EntityRecord> {
        let txn = self.db.begin_write()?;
        let record = {
            let mut table = txn.open_table(ENTITIES)?;
            let key = (entity.entity_type.as_str(), entity.id.as_str());
            let mut record: EntityRecord = match table.get(key)? {
                Some(guard) => serde_json::from_slice(guard.value())?,
                None => return Err(StoreError::NotFound(format!("entity {entity}"))),
            };
            match mode {
                UpdateMode::Merge => {
                    for (k, v) in properties {
                        record.properties.insert(k, v);
                    }
                },
                UpdateMode::Replace => {
                    record.properties = properties;
                },
            }
            record.updated_at = Utc::now();
            let bytes = serde_json::to_vec(&record)?;
            table.insert(key, bytes.as_slice())?;
            record
        };
        txn.commit()?;
        Ok(record)
    }

    /// Delete an entity and every edge touching it.
    ///
    /// With `cascade = true`, entities reachable over outbound `owns` edges
    /// are deleted too (cycle-safe). Returns the number of entities removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the root entity does not exist.
    pub fn delete_entity(&self, entity: &EntityRef, cascade: bool) -> StoreResult<u64> {
        let txn = self.db.begin_write()?;
        let deleted = {
            let mut entities = txn.open_table(ENTITIES)?;
            let mut fwd = txn.open_table(RELS_FWD)?;
            let mut rev = txn.open_table(RELS_REV)?;

            if entities
                .get((entity.entity_type.as_str(), entity.id.as_str()))?
                .is_none()
            {
                return Err(StoreError::NotFound(format!("entity {entity}")));
            }

            // Collect the delete set up front; `owns` edges drive the cascade.
            let mut targets: Vec<EntityRef> = Vec::new();
            let mut visited: HashSet<EntityRef> = HashSet::new();
            let mut frontier: VecDeque<EntityRef> = VecDeque::new();
            frontier.push_back(entity.clone());
            visited.insert(entity.clone());
            while let Some(current) = frontier.pop_front() {
                if cascade {
                    for edge in scan_out(&fwd, &current, Some(KIND_OWNS))? {
                        if visited.insert(edge.to.clone()) {
                            frontier.push_back(edge.to);
                        }
                    }
                }
                targets.push(current);
            }

            for target in &targets {
                // Outbound edges and their reverse mirrors.
                for edge in scan_out(&fwd, target, None)? {
                    fwd.remove((
                        edge.from.entity_type.as_str(),
                        edge.from.id.as_str(),
                        edge.kind.as_str(),
                        edge.to.entity_type.as_str(),
                        edge.to.id.as_str(),
                    ))?;
                    rev.remove((
                        edge.to.entity_type.as_str(),
                        edge.to.id.as_str(),
                        edge.kind.as_str(),
                        edge.from.entity_type.as_str(),
                        edge.from.id.as_str(),
                    ))?;
                }
                // Inbound edges and their forward mirrors.
                for edge in scan_in(&rev, target, None)? {
                    fwd.remove((
                        edge.from.entity_type.as_str(),
                        edge.from.id.as_str(),
                        edge.kind.as_str(),
                        edge.to.entity_type.as_str(),
                        edge.to.id.as_str(),
                    ))?;
                    rev.remove((
                        edge.to.entity_type.as_str(),
                        edge.to.id.as_str(),
                        edge.kind.as_str(),
                        edge.from.entity_type.as_str(),
                        edge.from.id.as_str(),
                    ))?;
                }
                entities.remove((target.entity_type.as_str(), target.id.as_str()))?;
            }
            targets.len() as u64
        };
        txn.commit()?;
        Ok(deleted)
    }

    /// All entities of one type, in id order.
    ///
    /// Unbounded; intended for startup reconciliation and administrative
    /// listings, not hot paths.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn entities_of_type(&self, entity_type: &str) -> StoreResult<Vec<EntityRecord>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTITIES)?;
        let mut out = Vec::new();
        for item in table.range((entity_type, "")..)? {
            let (k, v) = item?;
            let (t, _) = k.value();
            if t != entity_type {
                break;
            }
            out.push(serde_json::from_slice(v.value())?);
        }
        Ok(out)
    }

    /// All entity ids of one type, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn entity_ids_of_type(&self, entity_type: &str) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(ENTITIES)?;
        let mut out = Vec::new();
        for item in table.range((entity_type, "")..)? {
            let (k, _) = item?;
            let (t, id) = k.value();
            if t != entity_type {
                break;
            }
            out.push(id.to_owned());
        }
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Relationships
    // -----------------------------------------------------------------------

    /// Create a directed relationship.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if either endpoint is missing.
    /// - [`StoreError::Conflict`] for a duplicate edge, a `parent_of`
    ///   self-loop, a second parent, or a `parent_of` ancestor cycle.
    pub fn create_relationship(
        &self,
        from: &EntityRef,
        kind: &str,
        to: &EntityRef,
        properties: serde_json::Map<String, serde_json::Value>,
    ) -> StoreResult<()> {
        if kind == KIND_PARENT_OF && from == to {
            return Err(StoreError::Conflict("parent_of self-loop".to_owned()));
        }
        let bytes = serde_json::to_vec(&properties)?;
        let txn = self.db.begin_write()?;
        {
            let entities = txn.open_table(ENTITIES)?;
            for endpoint in [from, to] {
                if entities
                    .get((endpoint.entity_type.as_str(), endpoint.id.as_str()))?
                    .is_none()
                {
                    return Err(StoreError::NotFound(format!("entity {endpoint}")));
                }
            }
            let mut fwd = txn.open_table(RELS_FWD)?;
            let mut rev = txn.open_table(RELS_REV)?;
            let fwd_key = (
                from.entity_type.as_str(),
                from.id.as_str(),
                kind,
                to.entity_type.as_str(),
                to.id.as_str(),
            );
            if fwd.get(fwd_key)?.is_some() {
                return Err(StoreError::Conflict(format!(
                    "relationship {from} -{kind}-> {to} already exists"
                )));
            }
            if kind == KIND_PARENT_OF {
                // One parent per node.
                if parent_of(&rev, to)?.is_some() {
                    return Err(StoreError::Conflict(format!("entity {to} already has a parent")));
                }
                // `to` must not be an ancestor of `from`.
                let mut cursor = Some(from.clone());
                while let Some(current) = cursor {
                    if &current == to {
                        return Err(StoreError::Conflict(format!(
                            "parent_of cycle: {to} is an ancestor of {from}"
                        )));
                    }
                    cursor = parent_of(&rev, &current)?;
                }
            }
            fwd.insert(fwd_key, bytes.as_slice())?;
            rev.insert(
                (
                    to.entity_type.as_str(),
                    to.id.as_str(),
                    kind,
                    from.entity_type.as_str(),
                    from.id.as_str(),
                ),
                (),
            )?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Delete a relationship. Returns whether the edge existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn delete_relationship(
        &self,
        from: &EntityRef,
        kind: &str,
        to: &EntityRef,
    ) -> StoreResult<bool> {
        let txn = self.db.begin_write()?;
        let existed = {
            let mut fwd = txn.open_table(RELS_FWD)?;
            let mut rev = txn.open_table(RELS_REV)?;
            let existed = fwd
                .remove((
                    from.entity_type.as_str(),
                    from.id.as_str(),
                    kind,
                    to.entity_type.as_str(),
                    to.id.as_str(),
                ))?
                .is_some();
            rev.remove((
                to.entity_type.as_str(),
                to.id.as_str(),
                kind,
                from.entity_type.as_str(),
                from.id.as_str(),
            ))?;
            existed
        };
        txn.commit()?;
        Ok(existed)
    }

    /// List edges touching an entity, optionally filtered by kind.
    ///
    /// Returns at most `limit` edges; a continuation token is included when
    /// truncated.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Io`] on engine failure.
    pub fn neighbors(
        &self,
        entity: &EntityRef,
        kind: Option<&str>,
        direction: Direction,
        limit: usize,
        token: Option<&str>,
    ) -> StoreResult<NeighborPage> {
        let txn = self.db.begin_read()?;
        let edges: Vec<RelRecord> = match direction {
            Direction::Out => {
                let fwd = txn.open_table(RELS_FWD)?;
                scan_out(&fwd, entity, kind)?
            },
            Direction::In => {
                let rev = txn.open_table(RELS_REV)?;
                let fwd = txn.open_table(RELS_FWD)?;
                let mut edges = scan_in(&rev, entity, kind)?;
                // Reverse entries carry no properties; hydrate from forward.
                for edge in &mut edges {
                    if let Some(guard) = fwd.get((
                        edge.from.entity_type.as_str(),
                        edge.from.id.as_str(),
                        edge.kind.as_str(),
                        edge.to.entity_type.as_str(),
                        edge.to.id.as_str(),
                    ))? {
                        edge.properties = serde_json::from_slice(guard.value())?;
                    }
                }
                edges
            },
        };

        let start = match token {
            Some(token) => edges
                .iter()
                .position(|e| edge_token(e, direction) == token)
                .map_or(0, |i| i + 1),
            None => 0,
        };
        let page: Vec<RelRecord> = edges.iter().skip(start).take(limit).cloned().collect();
        let next_token = if start + page.len() < edges.len() {
            page.last().map(|e| edge_token(e, direction))
        } else {
            None
        };
        Ok(NeighborPage {
            edges: page,
            next_token,
        })
    }

    /// Cycle-safe BFS over outbound edges.
    ///
    /// Visits at most `limit` entities per call; when more remain, the page
    /// carries a continuation token encoding the BFS frontier.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if `start` does not exist (only on
    /// the first page).
    pub fn traverse(
        &self,
        start: &EntityRef,
        max_depth: u32,
        kind_filter: Option<&str>,
        limit: usize,
        token: Option<&str>,
    ) -> StoreResult<TraversePage> {
        let txn = self.db.begin_read()?;
        let fwd = txn.open_table(RELS_FWD)?;

        let (mut frontier, mut visited): (VecDeque<(EntityRef, u32)>, HashSet<EntityRef>) =
            match token {
                Some(token) => {
                    let cursor: TraverseCursor = serde_json::from_str(token)
                        .map_err(|e| StoreError::InvalidGlob(format!("bad traverse token: {e}")))?;
                    (
                        cursor.frontier.into_iter().collect(),
                        cursor.visited.into_iter().collect(),
                    )
                },
                None => {
                    let entities = txn.open_table(ENTITIES)?;
                    if entities
                        .get((start.entity_type.as_str(), start.id.as_str()))?
                        .is_none()
                    {
                        return Err(StoreError::NotFound(format!("entity {start}")));
                    }
                    let mut visited = HashSet::new();
                    visited.insert(start.clone());
                    (VecDeque::from([(start.clone(), 0)]), visited)
                },
            };

        let mut entities_out = Vec::new();
        while let Some((current, depth)) = frontier.pop_front() {
            if depth < max_depth {
                for edge in scan_out(&fwd, &current, kind_filter)? {
                    if visited.insert(edge.to.clone()) {
                        frontier.push_back((edge.to, depth + 1));
                    }
                }
            }
            entities_out.push((current, depth));
            if entities_out.len() >= limit && !frontier.is_empty() {
                let cursor = TraverseCursor {
                    frontier: frontier.into_iter().collect(),
                    visited: visited.into_iter().collect(),
                };
                return Ok(TraversePage {
                    entities: entities_out,
                    next_token: Some(serde_json::to_string(&cursor)?),
                });
            }
        }
        Ok(TraversePage {
            entities: entities_out,
            next_token: None,
        })
    }
}

// ---------------------------------------------------------------------------
// Scan helpers
// ---------------------------------------------------------------------------

/// Collect outbound edges of `entity` from the forward table.
fn scan_out<T: ReadableTable<(&'static str, &'static str, &'static str, &'static str, &'static str), &'static [u8]>>(
    fwd: &T,
    entity: &EntityRef,
    kind: Option<&str>,
) -> StoreResult<Vec<RelRecord>> {
    let mut edges = Vec::new();
    let start = (
        entity.entity_type.as_str(),
        entity.id.as_str(),
        kind.unwrap_or(""),
        "",
        "",
    );
    for item in fwd.range(start..)? {
        let (k, v) = item?;
        let (ft, fi, k_kind, tt, ti) = k.value();
        if ft != entity.entity_type || fi != entity.id {
            break;
        }
        if let Some(kind) = kind {
            if k_kind != kind {
                break;
            }
        }
        edges.push(RelRecord {
            from: EntityRef::new(ft, fi),
            kind: k_kind.to_owned(),
            to: EntityRef::new(tt, ti),
            properties: serde_json::from_slice(v.value())?,
        });
    }
    Ok(edges)
}

/// Collect inbound edges of `entity` from the reverse table (no properties).
fn scan_in<T: ReadableTable<(&'static str, &'static str, &'static str, &'static str, &'static str), ()>>(
    rev: &T,
    entity: &EntityRef,
    kind: Option<&str>,
) -> StoreResult<Vec<RelRecord>> {
    let mut edges = Vec::new();
    let start = (
        entity.entity_type.as_str(),
        entity.id.as_str(),
        kind.unwrap_or(""),
        "",
        "",
    );
    for item in rev.range(start..)? {
        let (k, _) = item?;
        let (tt, ti, k_kind, ft, fi) = k.value();
        if tt != entity.entity_type || ti != entity.id {
            break;
        }
        if let Some(kind) = kind {
            if k_kind != kind {
                break;
            }
        }
        edges.push(RelRecord {
            from: EntityRef::new(ft, fi),
            kind: k_kind.to_owned(),
            to: EntityRef::new(tt, ti),
            properties: serde_json::Map::new(),
        });
    }
    Ok(edges)
}

/// The single `parent_of` parent of `entity`, if any.
fn parent_of<T: ReadableTable<(&'static str, &'static str, &'static str, &'static str, &'static str), ()>>(
    rev: &T,
    entity: &EntityRef,
) -> StoreResult<Option<EntityRef>> {
    Ok(scan_in(rev, entity, Some(KIND_PARENT_OF))?
        .into_iter()
        .next()
        .map(|e| e.from))
}

/// Stable token naming one edge within a neighbor listing.
fn edge_token(edge: &RelRecord, direction: Direction) -> String {
    let peer = match direction {
        Direction::Out => &edge.to,
        Direction::In => &edge.from,
    };
    format!(
        "{}{TOKEN_SEP}{}{TOKEN_SEP}{}",
        edge.kind, peer.entity_type, peer.id
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> serde_json::Map<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), serde_json::Value::String((*v).to_owned())))
            .collect()
    }

    #[test]
    fn test_entity_lifecycle() {
        let store = Store::in_memory().unwrap();
        let agent = EntityRef::new("agent", "a1");
        store.create_entity(&agent, props(&[("state", "ready")])).unwrap();

        let err = store.create_entity(&agent, props(&[])).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let record = store
            .update_entity(&agent, props(&[("state", "running")]), UpdateMode::Merge)
            .unwrap();
        assert_eq!(record.properties["state"], "running");

        let record = store
            .update_entity(&agent, props(&[("other", "x")]), UpdateMode::Replace)
            .unwrap();
        assert!(!record.properties.contains_key("state"));

        store.delete_entity(&agent, false).unwrap();
        assert!(store.get_entity(&agent).unwrap().is_none());
    }

    #[test]
    fn test_relationship_requires_endpoints() {
        let store = Store::in_memory().unwrap();
        let a = EntityRef::new("agent", "a");
        let b = EntityRef::new("agent", "b");
        store.create_entity(&a, props(&[])).unwrap();
        let err = store
            .create_relationship(&a, "spawned", &b, props(&[]))
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_parent_of_is_a_forest() {
        let store = Store::in_memory().unwrap();
        let a = EntityRef::new("agent", "a");
        let b = EntityRef::new("agent", "b");
        let c = EntityRef::new("agent", "c");
        for e in [&a, &b, &c] {
            store.create_entity(e, props(&[])).unwrap();
        }
        // Self-loop rejected.
        assert!(store.create_relationship(&a, "parent_of", &a, props(&[])).is_err());

        store.create_relationship(&a, "parent_of", &b, props(&[])).unwrap();
        // Second parent rejected.
        let err = store
            .create_relationship(&c, "parent_of", &b, props(&[]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // Cycle rejected: b is a descendant of a, so b cannot parent a.
        let err = store
            .create_relationship(&b, "parent_of", &a, props(&[]))
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn test_neighbors_directions_and_paging() {
        let store = Store::in_memory().unwrap();
        let orch = EntityRef::new("orchestration", "o1");
        store.create_entity(&orch, props(&[])).unwrap();
        for i in 0..3 {
            let child = EntityRef::new("agent", format!("a{i}"));
            store.create_entity(&child, props(&[])).unwrap();
            store
                .create_relationship(&orch, "owns", &child, props(&[]))
                .unwrap();
        }

        let out = store
            .neighbors(&orch, Some("owns"), Direction::Out, 2, None)
            .unwrap();
        assert_eq!(out.edges.len(), 2);
        let token = out.next_token.clone().unwrap();
        let rest = store
            .neighbors(&orch, Some("owns"), Direction::Out, 10, Some(&token))
            .unwrap();
        assert_eq!(rest.edges.len(), 1);
        assert!(rest.next_token.is_none());

        let a0 = EntityRef::new("agent", "a0");
        let inbound = store
            .neighbors(&a0, None, Direction::In, 10, None)
            .unwrap();
        assert_eq!(inbound.edges.len(), 1);
        assert_eq!(inbound.edges[0].from, orch);
    }

    #[test]
    fn test_cascade_delete_leaves_no_dangling_edges() {
        let store = Store::in_memory().unwrap();
        let orch = EntityRef::new("orchestration", "o1");
        let a = EntityRef::new("agent", "a");
        let b = EntityRef::new("agent", "b");
        let outside = EntityRef::new("session", "s");
        for e in [&orch, &a, &b, &outside] {
            store.create_entity(e, props(&[])).unwrap();
        }
        store.create_relationship(&orch, "owns", &a, props(&[])).unwrap();
        store.create_relationship(&a, "owns", &b, props(&[])).unwrap();
        store.create_relationship(&b, "depends_on", &outside, props(&[])).unwrap();

        let deleted = store.delete_entity(&orch, true).unwrap();
        assert_eq!(deleted, 3);
        assert!(store.get_entity(&a).unwrap().is_none());
        assert!(store.get_entity(&b).unwrap().is_none());
        // The outside entity survives with no inbound edges left behind.
        assert!(store.get_entity(&outside).unwrap().is_some());
        let inbound = store.neighbors(&outside, None, Direction::In, 10, None).unwrap();
        assert!(inbound.edges.is_empty());
    }

    #[test]
    fn test_traverse_bfs_with_depth_cap_and_token() {
        let store = Store::in_memory().unwrap();
        let root = EntityRef::new("orchestration", "root");
        store.create_entity(&root, props(&[])).unwrap();
        let mut parents = vec![root.clone()];
        for depth in 0..3 {
            let mut next = Vec::new();
            for (i, parent) in parents.iter().enumerate() {
                for j in 0..2 {
                    let child = EntityRef::new("agent", format!("d{depth}_{i}_{j}"));
                    store.create_entity(&child, props(&[])).unwrap();
                    store
                        .create_relationship(parent, "owns", &child, props(&[]))
                        .unwrap();
                    next.push(child);
                }
            }
            parents = next;
        }

        // Depth cap: root + 2 children only.
        let shallow = store.traverse(&root, 1, None, 100, None).unwrap();
        assert_eq!(shallow.entities.len(), 3);
        assert!(shallow.next_token.is_none());

        // Pagination walks the full tree (1 + 2 + 4 + 8 = 15 nodes).
        let mut seen = 0;
        let mut token: Option<String> = None;
        loop {
            let page = store
                .traverse(&root, 10, None, 4, token.as_deref())
                .unwrap();
            seen += page.entities.len();
            match page.next_token {
                Some(t) => token = Some(t),
                None => break,
            }
        }
        assert_eq!(seen, 15);
    }
}
