//! Corpus aggregates: in-memory tree sequences and the store façade
//!
//! [`Corpus`] and [`CorpusDb`] expose the same surface — ordered access by
//! position, insertion and removal, membership, and `matching_trees` — over
//! the two backings.  The in-memory path evaluates queries by walking each
//! tree; the store-backed path runs the compiled relational form, falling
//! back to direct re-checking for queries with no exact translation.  The
//! two paths agree node-for-node.  Conversions (`to_db`/`to_corpus`) are
//! lossless up to node uid reassignment.

use std::borrow::Cow;

use crate::query::Query;
use crate::store::{CorpusDb, RootRow, StoreError};
use crate::tree::{NodeId, Tree};

/// One matching tree and its matching nodes, in pre-order
#[derive(Debug, Clone)]
pub struct Match<'a> {
    pub tree: Cow<'a, Tree>,
    pub nodes: Vec<NodeId>,
}

/// An ordered, mutable, in-memory sequence of trees
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Corpus {
    trees: Vec<Tree>,
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_trees(trees: Vec<Tree>) -> Self {
        Corpus { trees }
    }

    pub fn len(&self) -> usize {
        self.trees.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trees.is_empty()
    }

    pub fn get(&self, pos: usize) -> Option<&Tree> {
        self.trees.get(pos)
    }

    /// Insert at `pos`, shifting later trees.  Panics if `pos > len`.
    pub fn insert(&mut self, pos: usize, tree: Tree) {
        self.trees.insert(pos, tree);
    }

    pub fn push(&mut self, tree: Tree) {
        self.trees.push(tree);
    }

    /// Remove and return the tree at `pos`.  Panics if out of range.
    pub fn remove(&mut self, pos: usize) -> Tree {
        self.trees.remove(pos)
    }

    /// Structural membership test.
    pub fn contains(&self, tree: &Tree) -> bool {
        self.trees.iter().any(|t| t == tree)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Tree> {
        self.trees.iter()
    }

    /// Lazily yield each tree with at least one node satisfying `query`,
    /// in corpus order, with matching nodes in pre-order.  Re-invoke to
    /// rescan.
    pub fn matching_trees<'a>(&'a self, query: &'a Query) -> impl Iterator<Item = Match<'a>> + 'a {
        self.trees.iter().filter_map(move |tree| {
            let nodes: Vec<NodeId> = tree
                .pre_order()
                .filter(|&node| query.match_tree(tree, node))
                .collect();
            if nodes.is_empty() {
                None
            } else {
                Some(Match { tree: Cow::Borrowed(tree), nodes })
            }
        })
    }

    /// Project every tree into a fresh in-memory store.
    pub fn to_db(&self) -> Result<CorpusDb, StoreError> {
        let mut db = CorpusDb::in_memory()?;
        for tree in &self.trees {
            db.push_tree(tree)?;
        }
        Ok(db)
    }
}

impl FromIterator<Tree> for Corpus {
    fn from_iter<I: IntoIterator<Item = Tree>>(iter: I) -> Self {
        Corpus { trees: iter.into_iter().collect() }
    }
}

impl IntoIterator for Corpus {
    type Item = Tree;
    type IntoIter = std::vec::IntoIter<Tree>;

    fn into_iter(self) -> Self::IntoIter {
        self.trees.into_iter()
    }
}

impl<'a> IntoIterator for &'a Corpus {
    type Item = &'a Tree;
    type IntoIter = std::slice::Iter<'a, Tree>;

    fn into_iter(self) -> Self::IntoIter {
        self.trees.iter()
    }
}

impl CorpusDb {
    /// Project the whole store back into an in-memory corpus.
    pub fn to_corpus(&self) -> Result<Corpus, StoreError> {
        let mut trees = Vec::with_capacity(self.len()?);
        for pos in 0..self.len()? {
            trees.push(self.tree(pos)?);
        }
        Ok(Corpus::from_trees(trees))
    }

    /// Structural membership test.
    pub fn contains(&self, tree: &Tree) -> Result<bool, StoreError> {
        for pos in 0..self.len()? {
            if self.tree(pos)? == *tree {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Lazily yield each stored tree with at least one node satisfying
    /// `query`, in corpus order, with matching nodes in pre-order.
    ///
    /// When the query compiles to a relational fragment, one SQL execution
    /// finds every matching row and only the trees with hits are
    /// reconstituted.  Otherwise each tree is reconstituted and re-checked
    /// with [`Query::match_tree`]; either way the results are identical to
    /// the in-memory path.
    pub fn matching_trees<'a>(&'a self, query: &'a Query) -> DbMatches<'a> {
        DbMatches { db: self, query, state: State::Unplanned }
    }
}

/// Iterator over store-backed query matches
pub struct DbMatches<'a> {
    db: &'a CorpusDb,
    query: &'a Query,
    state: State,
}

enum State {
    Unplanned,
    Running {
        roots: Vec<RootRow>,
        /// Matching row ids per root when the query compiled; `None` means
        /// every tree is re-checked directly.
        hits: Option<Vec<Vec<i64>>>,
        pos: usize,
    },
    Done,
}

impl DbMatches<'_> {
    fn plan(&self) -> Result<State, StoreError> {
        let roots = self.db.roots()?;
        let hits = match self.query.to_sql() {
            Some(fragment) => {
                let rows = self.db.matching_rows(&fragment)?;
                let mut hits: Vec<Vec<i64>> = vec![Vec::new(); roots.len()];
                // roots ordered by span position, for containment lookup
                let mut by_left: Vec<usize> = (0..roots.len()).collect();
                by_left.sort_unstable_by_key(|&i| roots[i].left);
                for (id, left) in rows {
                    let slot = by_left
                        .partition_point(|&i| roots[i].left <= left)
                        .checked_sub(1)
                        .map(|p| by_left[p])
                        .filter(|&i| left <= roots[i].right);
                    let Some(slot) = slot else {
                        return Err(StoreError::Integrity(format!(
                            "matching row {id} falls outside every root span"
                        )));
                    };
                    hits[slot].push(id);
                }
                Some(hits)
            }
            None => None,
        };
        Ok(State::Running { roots, hits, pos: 0 })
    }

    fn step(&mut self) -> Result<Option<Match<'static>>, StoreError> {
        if matches!(self.state, State::Unplanned) {
            self.state = self.plan()?;
        }
        let State::Running { roots, hits, pos } = &mut self.state else {
            return Ok(None);
        };
        while *pos < roots.len() {
            let index = *pos;
            *pos += 1;
            let root = roots[index];
            match hits {
                Some(hits) => {
                    let ids = &hits[index];
                    if ids.is_empty() {
                        continue;
                    }
                    let (tree, map) = self.db.reconstitute(root.id)?;
                    let nodes = ids
                        .iter()
                        .map(|id| {
                            map.get(id).copied().ok_or_else(|| {
                                StoreError::Integrity(format!(
                                    "matching row {id} vanished during reconstitution"
                                ))
                            })
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Some(Match { tree: Cow::Owned(tree), nodes }));
                }
                None => {
                    let (tree, _) = self.db.reconstitute(root.id)?;
                    let nodes: Vec<NodeId> = tree
                        .pre_order()
                        .filter(|&node| self.query.match_tree(&tree, node))
                        .collect();
                    if nodes.is_empty() {
                        continue;
                    }
                    return Ok(Some(Match { tree: Cow::Owned(tree), nodes }));
                }
            }
        }
        Ok(None)
    }
}

impl Iterator for DbMatches<'_> {
    type Item = Result<Match<'static>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.step() {
            Ok(Some(m)) => Some(Ok(m)),
            Ok(None) => {
                self.state = State::Done;
                None
            }
            Err(error) => {
                self.state = State::Done;
                Some(Err(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::penn::{parse, trees};
    use crate::query::{dash_tag, idoms, label, text};

    fn fixture() -> Corpus {
        trees(
            "(IP-MAT (NP-SBJ (PRO He)) (VBD left))\n\n\
             (IP-MAT (NP-SBJ (D The) (N dog)) (VBD barked))\n\n\
             (CP-QUE (C whether))",
        )
        .map(|t| t.unwrap())
        .collect()
    }

    #[test]
    fn test_sequence_operations() {
        let mut corpus = fixture();
        assert_eq!(corpus.len(), 3);
        let first = corpus.get(0).unwrap().clone();
        assert!(corpus.contains(&first));
        let removed = corpus.remove(0);
        assert_eq!(removed, first);
        assert_eq!(corpus.len(), 2);
        assert!(!corpus.contains(&first));
        corpus.insert(1, removed);
        let labels: Vec<&str> = corpus
            .iter()
            .map(|t| t.label(t.root()))
            .collect();
        assert_eq!(labels, vec!["IP-MAT", "IP-MAT", "CP-QUE"]);
    }

    #[test]
    fn test_matching_trees_in_memory() {
        let corpus = fixture();
        let query = label("NP-SBJ");
        let matches: Vec<Match> = corpus.matching_trees(&query).collect();
        assert_eq!(matches.len(), 2);
        let first = &matches[0];
        assert_eq!(first.nodes.len(), 1);
        assert_eq!(first.tree.urtext(first.nodes[0]), "He");
        // restartable: a second scan sees the same results
        assert_eq!(corpus.matching_trees(&query).count(), 2);
    }

    #[test]
    fn test_matching_trees_scenario() {
        // the verb directly above "left", and nothing else
        let corpus = fixture();
        let query = label("VBD") & idoms(text("left"));
        let matches: Vec<Match> = corpus.matching_trees(&query).collect();
        assert_eq!(matches.len(), 1);
        let m = &matches[0];
        assert_eq!(m.nodes.len(), 1);
        assert_eq!(m.tree.label(m.nodes[0]), "VBD");
        assert_eq!(m.tree.text(m.tree.children(m.nodes[0])[0]), Some("left"));
    }

    #[test]
    fn test_db_matching_agrees() {
        let corpus = fixture();
        let db = corpus.to_db().unwrap();
        for query in [
            label("NP-SBJ"),
            label("VBD") & idoms(text("left")),
            dash_tag("QUE"),
        ] {
            let direct: Vec<Match> = corpus.matching_trees(&query).collect();
            let indexed: Vec<Match> = db
                .matching_trees(&query)
                .collect::<Result<_, _>>()
                .unwrap();
            assert_eq!(direct.len(), indexed.len(), "count differs for {query}");
            for (d, i) in direct.iter().zip(&indexed) {
                assert_eq!(*d.tree, *i.tree, "trees differ for {query}");
                let d_labels: Vec<&str> =
                    d.nodes.iter().map(|&n| d.tree.label(n)).collect();
                let i_labels: Vec<&str> =
                    i.nodes.iter().map(|&n| i.tree.label(n)).collect();
                assert_eq!(d_labels, i_labels, "nodes differ for {query}");
            }
        }
    }

    #[test]
    fn test_round_trip_projection() {
        let corpus = fixture();
        let db = corpus.to_db().unwrap();
        let back = db.to_corpus().unwrap();
        assert_eq!(corpus, back);
        assert!(db.contains(corpus.get(1).unwrap()).unwrap());
        assert!(!db.contains(&parse("(X (Y z))").unwrap()).unwrap());
    }
}
