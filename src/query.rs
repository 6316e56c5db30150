//! Boolean query algebra over tree nodes
//!
//! A [`Query`] is a tagged-variant value evaluated by two interpreters over
//! the same variant list: [`Query::match_tree`] walks a [`Tree`] directly,
//! and [`Query::to_sql`] compiles the query to a relational predicate over
//! the store's `nodes` rows.  The two must agree on every node; when a
//! predicate has no exact relational translation, `to_sql` returns `None`
//! and store-backed matching re-checks candidates with `match_tree`.
//!
//! Queries compose with [`And`](Query::And)/[`Or`](Query::Or)/
//! [`Not`](Query::Not); the `&`, `|` and `~` operators are sugar for the
//! same constructors.  `Display` renders the parenthesized surface syntax
//! that [`parse_query`](crate::parser::parse_query) reads back.

use std::fmt;
use std::ops;

use regex::Regex;

use crate::tree::{NodeId, Tree};

/// A query over tree nodes
#[derive(Debug, Clone)]
pub enum Query {
    /// Label comparison: exact, or equal up to trailing dash tags
    Label { text: String, exact: bool },
    /// Regular-expression label match (compared by pattern source)
    LabelRx { source: String, rx: Regex },
    /// Some dash tag of the label equals the argument
    DashTag { tag: String },
    /// Leaf text equality
    Text { text: String },
    /// Some proper descendant matches (strict dominance)
    Doms(Box<Query>),
    /// Some immediate child matches
    Idoms(Box<Query>),
    /// The immediate right sibling matches
    Sprec(Box<Query>),
    /// Some right sibling matches, at any distance
    SprecAny(Box<Query>),
    And(Box<Query>, Box<Query>),
    Or(Box<Query>, Box<Query>),
    Not(Box<Query>),
}

/// Match the node label: equal to `text`, or `text` followed by dash tags.
pub fn label(text: impl Into<String>) -> Query {
    Query::Label { text: text.into(), exact: false }
}

/// Match the node label exactly.
pub fn label_exact(text: impl Into<String>) -> Query {
    Query::Label { text: text.into(), exact: true }
}

/// Match the node label against a regular expression.
pub fn label_rx(rx: Regex) -> Query {
    Query::LabelRx { source: rx.as_str().to_string(), rx }
}

/// Match a dash tag of the node label (`dash_tag("SBJ")` matches `NP-SBJ`).
pub fn dash_tag(tag: impl Into<String>) -> Query {
    Query::DashTag { tag: tag.into() }
}

/// Match a leaf with exactly this text.
pub fn text(text: impl Into<String>) -> Query {
    Query::Text { text: text.into() }
}

/// Match nodes with a proper descendant satisfying `query`.
pub fn doms(query: Query) -> Query {
    Query::Doms(Box::new(query))
}

/// Match nodes with an immediate child satisfying `query`.
pub fn idoms(query: Query) -> Query {
    Query::Idoms(Box::new(query))
}

/// Match nodes whose immediate right sibling satisfies `query`.
pub fn sprec(query: Query) -> Query {
    Query::Sprec(Box::new(query))
}

/// Match nodes with any right sibling satisfying `query`.
pub fn sprec_any(query: Query) -> Query {
    Query::SprecAny(Box::new(query))
}

impl Query {
    /// Direct evaluation: does `node` of `tree` satisfy this query?
    pub fn match_tree(&self, tree: &Tree, node: NodeId) -> bool {
        match self {
            Query::Label { text, exact } => {
                let label = tree.label(node);
                if *exact {
                    label == text
                } else {
                    bare_label_matches(label, text)
                }
            }
            Query::LabelRx { rx, .. } => rx.is_match(tree.label(node)),
            Query::DashTag { tag } => tree.label(node).split('-').skip(1).any(|seg| seg == tag),
            Query::Text { text } => tree.text(node) == Some(text.as_str()),
            Query::Doms(inner) => tree
                .descendants(node)
                .any(|descendant| inner.match_tree(tree, descendant)),
            Query::Idoms(inner) => tree
                .children(node)
                .iter()
                .any(|&child| inner.match_tree(tree, child)),
            Query::Sprec(inner) => tree
                .right_sibling(node)
                .is_some_and(|sibling| inner.match_tree(tree, sibling)),
            Query::SprecAny(inner) => {
                let mut next = tree.right_sibling(node);
                while let Some(sibling) = next {
                    if inner.match_tree(tree, sibling) {
                        return true;
                    }
                    next = tree.right_sibling(sibling);
                }
                false
            }
            Query::And(left, right) => left.match_tree(tree, node) && right.match_tree(tree, node),
            Query::Or(left, right) => left.match_tree(tree, node) || right.match_tree(tree, node),
            Query::Not(inner) => !inner.match_tree(tree, node),
        }
    }

    /// Compile to a relational predicate over a `nodes` row aliased `n0`.
    ///
    /// Returns `None` when some sub-predicate has no exact relational
    /// translation (regex labels, `LIKE` metacharacters in a label or
    /// dash-tag argument, or a `-` inside a dash-tag argument); callers
    /// then fall back to direct evaluation.
    pub fn to_sql(&self) -> Option<SqlFragment> {
        let mut params = Vec::new();
        let mut fresh = 0;
        let predicate = self.sql_predicate("n0", &mut fresh, &mut params)?;
        Some(SqlFragment { predicate, params })
    }

    fn sql_predicate(
        &self,
        alias: &str,
        fresh: &mut usize,
        params: &mut Vec<String>,
    ) -> Option<String> {
        match self {
            Query::Label { text, exact } => {
                if *exact {
                    params.push(text.clone());
                    Some(format!("{alias}.label = ?"))
                } else {
                    if has_like_metachars(text) {
                        return None;
                    }
                    params.push(text.clone());
                    params.push(format!("{text}-%"));
                    Some(format!("({alias}.label = ? OR {alias}.label LIKE ?)"))
                }
            }
            Query::LabelRx { .. } => None,
            Query::DashTag { tag } => {
                // a tag containing `-` spans segment boundaries, which LIKE
                // cannot see; leave those to the direct evaluator
                if has_like_metachars(tag) || tag.contains('-') {
                    return None;
                }
                params.push(format!("%-{tag}"));
                params.push(format!("%-{tag}-%"));
                Some(format!("({alias}.label LIKE ? OR {alias}.label LIKE ?)"))
            }
            Query::Text { text } => {
                // IS gives two-valued comparison against NULL non-leaf rows
                params.push(text.clone());
                Some(format!("{alias}.text IS ?"))
            }
            Query::Doms(inner) => {
                let d = next_alias(fresh);
                let sub = inner.sql_predicate(&d, fresh, params)?;
                Some(format!(
                    "EXISTS (SELECT 1 FROM nodes {d} WHERE {d}.span_left > {alias}.span_left \
                     AND {d}.span_right < {alias}.span_right AND {sub})"
                ))
            }
            Query::Idoms(inner) => {
                let c = next_alias(fresh);
                let sub = inner.sql_predicate(&c, fresh, params)?;
                Some(format!(
                    "EXISTS (SELECT 1 FROM nodes {c} WHERE {c}.parent = {alias}.id AND {sub})"
                ))
            }
            Query::Sprec(inner) => {
                let r = next_alias(fresh);
                let sub = inner.sql_predicate(&r, fresh, params)?;
                Some(format!(
                    "({alias}.parent IS NOT NULL AND EXISTS (SELECT 1 FROM nodes {r} \
                     WHERE {r}.parent = {alias}.parent AND {r}.rank = {alias}.rank + 1 AND {sub}))"
                ))
            }
            Query::SprecAny(inner) => {
                let r = next_alias(fresh);
                let sub = inner.sql_predicate(&r, fresh, params)?;
                Some(format!(
                    "({alias}.parent IS NOT NULL AND EXISTS (SELECT 1 FROM nodes {r} \
                     WHERE {r}.parent = {alias}.parent AND {r}.rank > {alias}.rank AND {sub}))"
                ))
            }
            Query::And(left, right) => {
                let l = left.sql_predicate(alias, fresh, params)?;
                let r = right.sql_predicate(alias, fresh, params)?;
                Some(format!("({l} AND {r})"))
            }
            Query::Or(left, right) => {
                let l = left.sql_predicate(alias, fresh, params)?;
                let r = right.sql_predicate(alias, fresh, params)?;
                Some(format!("({l} OR {r})"))
            }
            Query::Not(inner) => {
                let sub = inner.sql_predicate(alias, fresh, params)?;
                Some(format!("NOT {sub}"))
            }
        }
    }
}

/// A compiled relational predicate over a `nodes` row aliased `n0`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlFragment {
    /// Boolean SQL expression
    pub predicate: String,
    /// Parameters bound positionally inside `predicate`
    pub params: Vec<String>,
}

fn bare_label_matches(label: &str, text: &str) -> bool {
    match label.strip_prefix(text) {
        Some("") => true,
        Some(rest) => rest.starts_with('-'),
        None => false,
    }
}

fn has_like_metachars(s: &str) -> bool {
    s.contains('%') || s.contains('_')
}

fn next_alias(fresh: &mut usize) -> String {
    *fresh += 1;
    format!("n{fresh}")
}

// Regexes are compared by pattern source.
impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Query::Label { text: a, exact: x }, Query::Label { text: b, exact: y }) => {
                a == b && x == y
            }
            (Query::LabelRx { source: a, .. }, Query::LabelRx { source: b, .. }) => a == b,
            (Query::DashTag { tag: a }, Query::DashTag { tag: b }) => a == b,
            (Query::Text { text: a }, Query::Text { text: b }) => a == b,
            (Query::Doms(a), Query::Doms(b))
            | (Query::Idoms(a), Query::Idoms(b))
            | (Query::Sprec(a), Query::Sprec(b))
            | (Query::SprecAny(a), Query::SprecAny(b))
            | (Query::Not(a), Query::Not(b)) => a == b,
            (Query::And(al, ar), Query::And(bl, br))
            | (Query::Or(al, ar), Query::Or(bl, br)) => al == bl && ar == br,
            _ => false,
        }
    }
}

impl Eq for Query {}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Query::Label { text, exact: false } => write!(f, "label({})", quote(text)),
            Query::Label { text, exact: true } => write!(f, "label({}, exact)", quote(text)),
            Query::LabelRx { source, .. } => write!(f, "label_rx({})", quote(source)),
            Query::DashTag { tag } => write!(f, "dash_tag({})", quote(tag)),
            Query::Text { text } => write!(f, "text({})", quote(text)),
            Query::Doms(inner) => write!(f, "doms({inner})"),
            Query::Idoms(inner) => write!(f, "idoms({inner})"),
            Query::Sprec(inner) => write!(f, "sprec({inner})"),
            Query::SprecAny(inner) => write!(f, "sprec_any({inner})"),
            Query::And(left, right) => write!(f, "({left} & {right})"),
            Query::Or(left, right) => write!(f, "({left} | {right})"),
            Query::Not(inner) => write!(f, "~{inner}"),
        }
    }
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

impl ops::BitAnd for Query {
    type Output = Query;

    fn bitand(self, rhs: Query) -> Query {
        Query::And(Box::new(self), Box::new(rhs))
    }
}

impl ops::BitOr for Query {
    type Output = Query;

    fn bitor(self, rhs: Query) -> Query {
        Query::Or(Box::new(self), Box::new(rhs))
    }
}

impl ops::Not for Query {
    type Output = Query;

    fn not(self) -> Query {
        Query::Not(Box::new(self))
    }
}
