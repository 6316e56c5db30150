//! Bracken: storage and queries for constituency treebanks
//!
//! A toolkit for holding syntactically annotated parse trees, searching
//! them with a small boolean query algebra, and persisting whole corpora
//! in a relational store that answers the same queries without walking
//! every tree.

pub mod corpus; // Corpus aggregates over both backings
pub mod label; // Label grammar: dash tags and coindexation indices
pub mod parser; // Query surface-syntax parser
pub mod penn; // Bracketed treebank reading and writing
pub mod query; // Boolean query algebra with dual evaluators
pub mod store; // SQLite-backed relational store
pub mod tree; // Arena tree model

// Re-exports for convenience
pub use corpus::{Corpus, Match};
pub use label::{IndexKind, MalformedLabel, ParsedLabel};
pub use parser::{QueryError, parse_query};
pub use penn::{ParseError, ParseOptions, parse, render, render_corpus, trees, trees_from_documents};
pub use query::{
    Query, dash_tag, doms, idoms, label, label_exact, label_rx, sprec, sprec_any, text,
};
pub use store::{CorpusDb, StoreError};
pub use tree::{Metadata, Node, NodeId, Tree, TreeData, TreeError};
