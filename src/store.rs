//! SQLite-backed relational corpus store
//!
//! Trees persist as node rows carrying a nested-interval span encoding: a
//! single pre-order numbering pass assigns each node an `(span_left,
//! span_right)` pair such that a node's span strictly contains the spans of
//! exactly its descendants.  Dominance and precedence then reduce to
//! interval and rank comparisons, with no recursive joins at read time.
//! Root rows carry their corpus ordinal in `rank`; children carry their
//! sibling position.
//!
//! A store wraps a single connection and expects one writer at a time;
//! mutations run in their own transaction, so an insert or delete either
//! fully commits its span/rank bookkeeping or rolls back.

use std::path::Path;

use rusqlite::{Connection, OptionalExtension, Statement, params, params_from_iter};
use rustc_hash::FxHashMap;
use thiserror::Error;
use tracing::debug;

use crate::query::SqlFragment;
use crate::tree::{NodeId, Tree};

/// Errors raised by the relational store
#[derive(Debug, Error)]
pub enum StoreError {
    /// Span/rank corruption detected on reconstitution; the store was
    /// mutated outside this module's discipline.
    #[error("store integrity violation: {0}")]
    Integrity(String),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
}

const SCHEMA: &str = "
create table if not exists nodes (
    id         integer primary key,
    label      text not null,
    text       text,
    parent     integer references nodes(id),
    span_left  integer not null,
    span_right integer not null,
    rank       integer not null
);
create table if not exists metadata (
    node  integer not null references nodes(id),
    key   text not null,
    value text not null
);
create index if not exists nodes_label on nodes(label);
create index if not exists nodes_parent on nodes(parent);
create index if not exists nodes_span on nodes(span_left, span_right);
create index if not exists metadata_node on metadata(node);
";

/// A corpus persisted in SQLite
pub struct CorpusDb {
    conn: Connection,
    next_id: i64,
    next_span: i64,
}

/// One root row: its id and span range
#[derive(Debug, Clone, Copy)]
pub(crate) struct RootRow {
    pub id: i64,
    pub left: i64,
    pub right: i64,
}

impl CorpusDb {
    /// Open an in-memory store.
    pub fn in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Open (or create) a store at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        // LIKE must be case-sensitive to agree with direct evaluation
        conn.pragma_update(None, "case_sensitive_like", true)?;
        // Nodes are written children-before-parent (spans are assigned on the
        // post-order exit), so the declared parent foreign key must not be
        // enforced mid-transaction; the store guards its own integrity via the
        // span/rank discipline in `check_integrity`.
        conn.pragma_update(None, "foreign_keys", false)?;
        let next_id: i64 =
            conn.query_row("select coalesce(max(id), 0) + 1 from nodes", [], |r| r.get(0))?;
        let next_span: i64 = conn.query_row(
            "select coalesce(max(span_right), -1) + 1 from nodes",
            [],
            |r| r.get(0),
        )?;
        debug!(next_id, next_span, "opened corpus store");
        Ok(CorpusDb { conn, next_id, next_span })
    }

    /// Number of trees in the store.
    pub fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self.conn.query_row(
            "select count(*) from nodes where parent is null",
            [],
            |r| r.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }

    /// Append `tree` at the end of the corpus.
    pub fn push_tree(&mut self, tree: &Tree) -> Result<(), StoreError> {
        let len = self.len()?;
        self.insert_tree(len, tree)
    }

    /// Insert `tree` at corpus position `pos`; later trees shift one
    /// ordinal to the right but keep their spans.  Insertion is atomic:
    /// either all rows and rank shifts commit, or none do.
    ///
    /// Panics if `pos` is greater than the current tree count.
    pub fn insert_tree(&mut self, pos: usize, tree: &Tree) -> Result<(), StoreError> {
        let len = self.len()?;
        assert!(pos <= len, "insert position {pos} out of range 0..={len}");
        let mut next_id = self.next_id;
        let mut next_span = self.next_span;
        let tx = self.conn.transaction()?;
        tx.execute(
            "update nodes set rank = rank + 1 where parent is null and rank >= ?1",
            params![pos as i64],
        )?;
        {
            let mut insert_node = tx.prepare(
                "insert into nodes (id, label, text, parent, span_left, span_right, rank) \
                 values (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            let mut insert_meta =
                tx.prepare("insert into metadata (node, key, value) values (?1, ?2, ?3)")?;
            persist_node(
                tree,
                tree.root(),
                None,
                pos as i64,
                &mut next_id,
                &mut next_span,
                &mut insert_node,
                &mut insert_meta,
            )?;
        }
        tx.commit()?;
        debug!(pos, rows = next_id - self.next_id, "inserted tree");
        self.next_id = next_id;
        self.next_span = next_span;
        Ok(())
    }

    /// Remove and return the tree at `pos`, purging its span range and all
    /// of its metadata rows.  Panics if `pos` is out of range.
    pub fn remove_tree(&mut self, pos: usize) -> Result<Tree, StoreError> {
        let root = self.root_at(pos)?;
        let (tree, _) = self.reconstitute(root.id)?;
        let tx = self.conn.transaction()?;
        tx.execute(
            "delete from metadata where node in \
             (select id from nodes where span_left >= ?1 and span_right <= ?2)",
            params![root.left, root.right],
        )?;
        tx.execute(
            "delete from nodes where span_left >= ?1 and span_right <= ?2",
            params![root.left, root.right],
        )?;
        tx.execute(
            "update nodes set rank = rank - 1 where parent is null and rank > ?1",
            params![pos as i64],
        )?;
        tx.commit()?;
        debug!(pos, "removed tree");
        Ok(tree)
    }

    /// Reconstitute the tree at corpus position `pos`.
    pub fn tree(&self, pos: usize) -> Result<Tree, StoreError> {
        let root = self.root_at(pos)?;
        Ok(self.reconstitute(root.id)?.0)
    }

    fn root_at(&self, pos: usize) -> Result<RootRow, StoreError> {
        let len = self.len()?;
        assert!(pos < len, "position {pos} out of range 0..{len}");
        let row = self
            .conn
            .query_row(
                "select id, span_left, span_right from nodes \
                 where parent is null and rank = ?1",
                params![pos as i64],
                |r| Ok(RootRow { id: r.get(0)?, left: r.get(1)?, right: r.get(2)? }),
            )
            .optional()?;
        row.ok_or_else(|| {
            StoreError::Integrity(format!("no root carries corpus ordinal {pos}"))
        })
    }

    /// All roots in corpus order, verifying that ordinals are contiguous.
    pub(crate) fn roots(&self) -> Result<Vec<RootRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "select id, span_left, span_right, rank from nodes \
             where parent is null order by rank",
        )?;
        let rows = stmt
            .query_map([], |r| {
                Ok((
                    RootRow { id: r.get(0)?, left: r.get(1)?, right: r.get(2)? },
                    r.get::<_, i64>(3)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let mut roots = Vec::with_capacity(rows.len());
        for (ordinal, (root, rank)) in rows.into_iter().enumerate() {
            if rank != ordinal as i64 {
                return Err(StoreError::Integrity(format!(
                    "root ordinals are not contiguous: found rank {rank} at position {ordinal}"
                )));
            }
            roots.push(root);
        }
        Ok(roots)
    }

    /// Rebuild the subtree rooted at the row `root` by span-ordered
    /// retrieval, and return it along with the row-id to node-id mapping.
    /// Any violation of the span/rank discipline is a fatal
    /// [`StoreError::Integrity`].
    pub(crate) fn reconstitute(
        &self,
        root: i64,
    ) -> Result<(Tree, FxHashMap<i64, NodeId>), StoreError> {
        struct Row {
            id: i64,
            label: String,
            text: Option<String>,
            parent: Option<i64>,
            left: i64,
            right: i64,
            rank: i64,
        }

        let (left, right) = self.conn.query_row(
            "select span_left, span_right from nodes where id = ?1",
            params![root],
            |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)),
        )?;
        let mut stmt = self.conn.prepare(
            "select id, label, text, parent, span_left, span_right, rank from nodes \
             where span_left >= ?1 and span_right <= ?2 order by span_left",
        )?;
        let rows = stmt
            .query_map(params![left, right], |r| {
                Ok(Row {
                    id: r.get(0)?,
                    label: r.get(1)?,
                    text: r.get(2)?,
                    parent: r.get(3)?,
                    left: r.get(4)?,
                    right: r.get(5)?,
                    rank: r.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let first = match rows.first() {
            Some(row) if row.id == root && row.left == left => row,
            _ => {
                return Err(StoreError::Integrity(format!(
                    "row {root} is not the head of its span range"
                )));
            }
        };
        let mut tree = Tree::with_root(first.label.clone(), first.text.clone());
        let mut map = FxHashMap::default();
        map.insert(root, tree.root());

        // open ancestors: (row id, span_right, node id, children so far)
        let mut stack: Vec<(i64, i64, NodeId, i64)> = vec![(first.id, first.right, tree.root(), 0)];
        for row in &rows[1..] {
            while stack.last().is_some_and(|top| row.left > top.1) {
                stack.pop();
            }
            let Some(top) = stack.last_mut() else {
                return Err(StoreError::Integrity(format!(
                    "row {} falls outside the span of its root", row.id
                )));
            };
            if row.right > top.1 {
                return Err(StoreError::Integrity(format!(
                    "span of row {} overlaps the span of row {}", row.id, top.0
                )));
            }
            if row.parent != Some(top.0) {
                return Err(StoreError::Integrity(format!(
                    "parent pointer of row {} disagrees with span nesting", row.id
                )));
            }
            if tree.is_leaf(top.2) {
                return Err(StoreError::Integrity(format!(
                    "leaf row {} has children", top.0
                )));
            }
            if row.rank != top.3 {
                return Err(StoreError::Integrity(format!(
                    "sibling ranks under row {} are not contiguous", top.0
                )));
            }
            top.3 += 1;
            let node = tree.push_child(top.2, row.label.clone(), row.text.clone());
            map.insert(row.id, node);
            stack.push((row.id, row.right, node, 0));
        }

        let mut mstmt = self.conn.prepare(
            "select node, key, value from metadata where node in \
             (select id from nodes where span_left >= ?1 and span_right <= ?2) \
             order by rowid",
        )?;
        let entries = mstmt
            .query_map(params![left, right], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        for (row_id, key, value) in entries {
            let Some(&node) = map.get(&row_id) else {
                return Err(StoreError::Integrity(format!(
                    "metadata row references unknown node {row_id}"
                )));
            };
            tree.metadata_mut(node).set(key, value);
        }
        Ok((tree, map))
    }

    /// Verify that the whole store obeys the span/rank discipline: every
    /// tree reconstitutes, root spans are mutually disjoint, and no node or
    /// metadata row is orphaned.
    pub fn check_integrity(&self) -> Result<(), StoreError> {
        let mut roots = self.roots()?;
        for root in &roots {
            self.reconstitute(root.id)?;
        }
        roots.sort_unstable_by_key(|r| r.left);
        for pair in roots.windows(2) {
            if pair[1].left <= pair[0].right {
                return Err(StoreError::Integrity(format!(
                    "root spans {} and {} overlap",
                    pair[0].id, pair[1].id
                )));
            }
        }
        let strays: i64 = self.conn.query_row(
            "select count(*) from nodes n where n.parent is not null and not exists \
             (select 1 from nodes r where r.parent is null \
              and n.span_left > r.span_left and n.span_right < r.span_right)",
            [],
            |r| r.get(0),
        )?;
        if strays > 0 {
            return Err(StoreError::Integrity(format!(
                "{strays} nodes fall outside every root span"
            )));
        }
        let orphans: i64 = self.conn.query_row(
            "select count(*) from metadata where node not in (select id from nodes)",
            [],
            |r| r.get(0),
        )?;
        if orphans > 0 {
            return Err(StoreError::Integrity(format!(
                "{orphans} metadata rows reference deleted nodes"
            )));
        }
        Ok(())
    }

    /// Run a compiled predicate over every node row, returning matching
    /// `(id, span_left)` pairs in span order — one relational query for the
    /// whole corpus.
    pub(crate) fn matching_rows(
        &self,
        fragment: &SqlFragment,
    ) -> Result<Vec<(i64, i64)>, StoreError> {
        let sql = format!(
            "select n0.id, n0.span_left from nodes n0 where {} order by n0.span_left",
            fragment.predicate
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(fragment.params.iter()), |r| {
                Ok((r.get(0)?, r.get(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

/// Insert one node and its subtree: ids are assigned in pre-order, spans by
/// the enter/exit counter, ranks by sibling position.
#[allow(clippy::too_many_arguments)]
fn persist_node(
    tree: &Tree,
    node: NodeId,
    parent_row: Option<i64>,
    rank: i64,
    next_id: &mut i64,
    next_span: &mut i64,
    insert_node: &mut Statement<'_>,
    insert_meta: &mut Statement<'_>,
) -> Result<(), StoreError> {
    let row = *next_id;
    *next_id += 1;
    let left = *next_span;
    *next_span += 1;
    for (position, &child) in tree.children(node).iter().enumerate() {
        persist_node(
            tree,
            child,
            Some(row),
            position as i64,
            next_id,
            next_span,
            insert_node,
            insert_meta,
        )?;
    }
    let right = *next_span;
    *next_span += 1;
    insert_node.execute(params![
        row,
        tree.label(node),
        tree.text(node),
        parent_row,
        left,
        right,
        rank
    ])?;
    for (key, value) in tree.metadata(node).iter() {
        insert_meta.execute(params![row, key, value])?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::penn::parse;

    fn sample() -> Tree {
        parse("(IP (NP (D a) (N dog)) (VBD chased) (NP (D the) (ADJ speedy) (N+N mailman)))")
            .unwrap()
    }

    fn fetch_one(db: &CorpusDb, sql: &str) -> i64 {
        db.conn.query_row(sql, [], |r| r.get(0)).unwrap()
    }

    #[test]
    fn test_insert_and_len() {
        let mut db = CorpusDb::in_memory().unwrap();
        assert!(db.is_empty().unwrap());
        db.push_tree(&sample()).unwrap();
        assert_eq!(db.len().unwrap(), 1);
        assert_eq!(
            fetch_one(&db, "select count(*) from nodes where label = 'NP'"),
            2
        );
    }

    #[test]
    fn test_span_encoding() {
        let mut db = CorpusDb::in_memory().unwrap();
        db.push_tree(&sample()).unwrap();
        // the root's span contains every other span in its tree
        let root_left = fetch_one(&db, "select span_left from nodes where label = 'IP'");
        let root_right = fetch_one(&db, "select span_right from nodes where label = 'IP'");
        let escapees = fetch_one(
            &db,
            &format!(
                "select count(*) from nodes where label != 'IP' \
                 and not (span_left > {root_left} and span_right < {root_right})"
            ),
        );
        assert_eq!(escapees, 0);
        // sibling ranks under the second NP are 0, 1, 2 in order
        let ranks = {
            let mut stmt = db
                .conn
                .prepare(
                    "select c.rank from nodes c join nodes p on c.parent = p.id \
                     where p.label = 'NP' and p.rank = 2 order by c.span_left",
                )
                .unwrap();
            stmt.query_map([], |r| r.get::<_, i64>(0))
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap()
        };
        assert_eq!(ranks, vec![0, 1, 2]);
    }

    #[test]
    fn test_reconstitute_round_trip() {
        let mut db = CorpusDb::in_memory().unwrap();
        let tree = sample();
        db.push_tree(&tree).unwrap();
        let rebuilt = db.tree(0).unwrap();
        assert_eq!(rebuilt, tree);
        assert_eq!(rebuilt.urtext(rebuilt.root()), "a dog chased the speedy mailman");
    }

    #[test]
    fn test_metadata_round_trip() {
        let mut db = CorpusDb::in_memory().unwrap();
        let tree =
            parse("( (IP (NP-SBJ-1 (PRO He)) (VBD left) (METADATA (COMMENT x))) (ID t1))").unwrap();
        db.push_tree(&tree).unwrap();
        let rebuilt = db.tree(0).unwrap();
        assert_eq!(rebuilt, tree);
        assert_eq!(rebuilt.metadata(rebuilt.root()).get("ID").unwrap(), "t1");
    }

    #[test]
    fn test_insert_at_position_shifts_ranks() {
        let mut db = CorpusDb::in_memory().unwrap();
        let first = parse("(A (X x))").unwrap();
        let second = parse("(B (Y y))").unwrap();
        let third = parse("(C (Z z))").unwrap();
        db.push_tree(&first).unwrap();
        db.push_tree(&second).unwrap();
        db.insert_tree(1, &third).unwrap();
        let labels: Vec<String> = (0..3)
            .map(|pos| {
                let tree = db.tree(pos).unwrap();
                tree.label(tree.root()).to_string()
            })
            .collect();
        assert_eq!(labels, vec!["A", "C", "B"]);
    }

    #[test]
    fn test_remove_purges_rows() {
        let mut db = CorpusDb::in_memory().unwrap();
        db.push_tree(&sample()).unwrap();
        db.push_tree(&parse("( (NP (PRO he)) (ID keep))").unwrap()).unwrap();
        let removed = db.remove_tree(0).unwrap();
        assert_eq!(removed, sample());
        assert_eq!(db.len().unwrap(), 1);
        // no orphaned metadata rows
        let orphans = fetch_one(
            &db,
            "select count(*) from metadata where node not in (select id from nodes)",
        );
        assert_eq!(orphans, 0);
        // the remaining tree is intact and now first
        let rest = db.tree(0).unwrap();
        assert_eq!(rest.label(rest.root()), "NP");
    }

    #[test]
    fn test_integrity_detection() {
        let mut db = CorpusDb::in_memory().unwrap();
        db.push_tree(&sample()).unwrap();
        // sabotage a parent pointer behind the store's back
        db.conn
            .execute(
                "update nodes set parent = (select id from nodes where label = 'VBD') \
                 where label = 'D' and rank = 0",
                [],
            )
            .unwrap();
        assert!(matches!(db.tree(0), Err(StoreError::Integrity(_))));
    }

    #[test]
    fn test_persist_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("corpus.db");
        let tree = sample();
        {
            let mut db = CorpusDb::open(&path).unwrap();
            db.push_tree(&tree).unwrap();
        }
        let db = CorpusDb::open(&path).unwrap();
        assert_eq!(db.len().unwrap(), 1);
        assert_eq!(db.tree(0).unwrap(), tree);
    }
}
