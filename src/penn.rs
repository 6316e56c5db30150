//! Penn-style bracketed treebank reading and writing
//!
//! Parses nested `(LABEL child …)` groups into [`Tree`]s and renders trees
//! back out.  Reading is lazy: [`trees`] yields one result per top-level
//! bracket group and recovers at the next group after an error, so a bad
//! tree never aborts a whole corpus file.

use std::fmt;

use memchr::memchr2;
use tracing::warn;

use crate::label::label_and_index;
use crate::tree::{self, Metadata, NodeId, Tree};

/// Error for text that violates the bracketed grammar
#[derive(Debug)]
pub struct ParseError {
    /// Byte offset of the offending token
    pub offset: usize,
    pub message: String,
    /// Whatever subtree had been completed when parsing failed
    pub partial: Option<Tree>,
}

impl ParseError {
    fn new(offset: usize, message: impl Into<String>) -> ParseError {
        ParseError { offset, message: message.into(), partial: None }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "parse error at byte {}: {}", self.offset, self.message)
    }
}

impl std::error::Error for ParseError {}

/// Metadata keys accepted without a warning
pub const RECOGNIZED_KEYS: [&str; 6] = ["ID", "INDEX", "IDX-TYPE", "LEMMA", "ODATE", "COMMENT"];

/// Parser configuration
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Metadata keys accepted without being flagged.  Unrecognized keys are
    /// still kept, so dialect-specific annotations survive a round trip.
    pub recognized_keys: Vec<String>,
}

impl Default for ParseOptions {
    fn default() -> Self {
        ParseOptions {
            recognized_keys: RECOGNIZED_KEYS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Open(usize),
    Close(usize),
    Word { offset: usize, text: &'a str },
}

struct Tokenizer<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(text: &'a str) -> Self {
        Tokenizer { text, pos: 0 }
    }

    fn next_token(&mut self) -> Option<Token<'a>> {
        let bytes = self.text.as_bytes();
        while self.pos < bytes.len() && bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
        if self.pos >= bytes.len() {
            return None;
        }
        match bytes[self.pos] {
            b'(' => {
                let token = Token::Open(self.pos);
                self.pos += 1;
                Some(token)
            }
            b')' => {
                let token = Token::Close(self.pos);
                self.pos += 1;
                Some(token)
            }
            _ => {
                let start = self.pos;
                // bulk-scan to the next bracket, then trim at whitespace
                let tail = &bytes[start..];
                let mut end = start + memchr2(b'(', b')', tail).unwrap_or(tail.len());
                if let Some(ws) = bytes[start..end].iter().position(|b| b.is_ascii_whitespace()) {
                    end = start + ws;
                }
                self.pos = end;
                Some(Token::Word { offset: start, text: &self.text[start..end] })
            }
        }
    }
}

enum SExpr<'a> {
    Word { offset: usize, text: &'a str },
    Group { offset: usize, items: Vec<SExpr<'a>> },
}

impl SExpr<'_> {
    fn offset(&self) -> usize {
        match self {
            SExpr::Word { offset, .. } | SExpr::Group { offset, .. } => *offset,
        }
    }
}

/// Read one complete bracket group; the opening `(` has been consumed.
fn read_group<'a>(tokens: &mut Tokenizer<'a>, open: usize) -> Result<SExpr<'a>, ParseError> {
    let mut stack: Vec<(usize, Vec<SExpr<'a>>)> = vec![(open, Vec::new())];
    loop {
        let Some(token) = tokens.next_token() else {
            let mut error = ParseError::new(tokens.pos, "unbalanced brackets: unexpected end of input");
            error.partial = partial_from_stack(stack);
            return Err(error);
        };
        match token {
            Token::Open(offset) => stack.push((offset, Vec::new())),
            Token::Word { offset, text } => {
                stack.last_mut().unwrap().1.push(SExpr::Word { offset, text });
            }
            Token::Close(_) => {
                let (offset, items) = stack.pop().unwrap();
                let group = SExpr::Group { offset, items };
                match stack.last_mut() {
                    Some(frame) => frame.1.push(group),
                    None => return Ok(group),
                }
            }
        }
    }
}

/// Best-effort tree for an error report: the outermost completed subgroup.
fn partial_from_stack(stack: Vec<(usize, Vec<SExpr<'_>>)>) -> Option<Tree> {
    let options = ParseOptions::default();
    let (_, items) = stack.into_iter().next()?;
    items
        .iter()
        .rev()
        .find(|item| matches!(item, SExpr::Group { .. }))
        .and_then(|group| build_node(group, &options).ok())
}

/// Lazy iterator over the top-level bracket groups of a text.
///
/// Each item is an independently parsed tree; after an `Err` the iterator
/// resumes at the next top-level group.  Re-create the iterator to rescan
/// the same text.
pub struct TreeIterator<'a> {
    tokens: Tokenizer<'a>,
    options: ParseOptions,
}

impl TreeIterator<'_> {
    /// Current byte position in the input.
    pub fn position(&self) -> usize {
        self.tokens.pos
    }
}

impl Iterator for TreeIterator<'_> {
    type Item = Result<Tree, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let open = match self.tokens.next_token()? {
            Token::Open(offset) => offset,
            Token::Close(offset) => {
                return Some(Err(ParseError::new(offset, "unbalanced brackets: unexpected `)`")));
            }
            Token::Word { offset, .. } => {
                return Some(Err(ParseError::new(offset, "expected `(` at top level")));
            }
        };
        match read_group(&mut self.tokens, open) {
            Ok(group) => Some(build_root(&group, &self.options)),
            Err(error) => Some(Err(error)),
        }
    }
}

/// Iterate over the trees in `text` with default options.
pub fn trees(text: &str) -> TreeIterator<'_> {
    trees_with(text, ParseOptions::default())
}

/// Iterate over the trees in `text`.
pub fn trees_with(text: &str, options: ParseOptions) -> TreeIterator<'_> {
    TreeIterator { tokens: Tokenizer::new(text), options }
}

/// Consume a loader-supplied sequence of (identifier, bracketed text)
/// pairs, yielding every tree in document order tagged with its document
/// identifier.  Loader failures are the loader's to report; this only sees
/// text it was actually handed.
pub fn trees_from_documents<'a, I>(
    documents: I,
) -> impl Iterator<Item = (String, Result<Tree, ParseError>)>
where
    I: IntoIterator<Item = (String, &'a str)>,
{
    documents
        .into_iter()
        .flat_map(|(id, text)| trees(text).map(move |result| (id.clone(), result)))
}

/// Parse exactly one tree from `text`.
pub fn parse(text: &str) -> Result<Tree, ParseError> {
    let mut iter = trees(text);
    let tree = iter
        .next()
        .ok_or_else(|| ParseError::new(0, "no tree found"))??;
    let position = iter.position();
    if iter.next().is_some() {
        return Err(ParseError::new(position, "trailing content after tree"));
    }
    Ok(tree)
}

/// Process a top-level group, unwrapping the label-less `( (IP …) (ID x))`
/// form when present.
fn build_root(group: &SExpr<'_>, options: &ParseOptions) -> Result<Tree, ParseError> {
    let SExpr::Group { offset, items } = group else {
        unreachable!("top-level item is always a group")
    };
    match items.first() {
        None => Err(ParseError::new(*offset, "empty bracket group")),
        Some(SExpr::Word { .. }) => build_node(group, options),
        Some(SExpr::Group { .. }) => {
            // wrapper: one real tree plus (ID …) / (METADATA …) comments
            let mut id = None;
            let mut metadata = Vec::new();
            let mut inner = None;
            for item in items {
                let SExpr::Group { offset, items } = item else {
                    return Err(ParseError::new(item.offset(), "stray word in wrapper group"));
                };
                match items.first() {
                    Some(SExpr::Word { text: "ID", .. }) => {
                        let [_, SExpr::Word { text, .. }] = items.as_slice() else {
                            return Err(ParseError::new(*offset, "malformed (ID …) group"));
                        };
                        id = Some(text.to_string());
                    }
                    Some(SExpr::Word { text: "METADATA", .. }) => {
                        read_metadata_group(items, *offset, options, &mut metadata)?;
                    }
                    _ => {
                        if inner.replace(item).is_some() {
                            return Err(ParseError::new(
                                *offset,
                                "too many children of a label-less root",
                            ));
                        }
                    }
                }
            }
            let inner = inner
                .ok_or_else(|| ParseError::new(*offset, "wrapper group without a tree"))?;
            let mut tree = build_node(inner, options)?;
            let root = tree.root();
            for (key, value) in metadata {
                tree.metadata_mut(root).set(key, value);
            }
            if let Some(id) = id {
                flag_key(options, "ID", *offset);
                tree.metadata_mut(root).set(tree::ID_KEY, id);
            }
            Ok(tree)
        }
    }
}

/// Build a node from a labelled group, absorbing trailing `(METADATA …)`
/// comments into the node's metadata.
fn build_node(group: &SExpr<'_>, options: &ParseOptions) -> Result<Tree, ParseError> {
    let SExpr::Group { offset, items } = group else {
        return Err(ParseError::new(group.offset(), "expected a bracket group"));
    };
    let Some(first) = items.first() else {
        return Err(ParseError::new(*offset, "empty bracket group"));
    };
    let SExpr::Word { text: label, .. } = first else {
        return Err(ParseError::new(first.offset(), "node has an empty label"));
    };
    if label.is_empty() {
        return Err(ParseError::new(first.offset(), "node has an empty label"));
    }

    let mut metadata = Vec::new();
    let mut rest: &[SExpr<'_>] = &items[1..];
    while let Some(SExpr::Group { offset, items }) = rest.last() {
        if !matches!(items.first(), Some(SExpr::Word { text: "METADATA", .. })) {
            break;
        }
        read_metadata_group(items, *offset, options, &mut metadata)?;
        rest = &rest[..rest.len() - 1];
    }

    let mut tree = match rest {
        [] => {
            return Err(ParseError::new(*offset, "node has too few children"));
        }
        [SExpr::Word { text, .. }] => {
            if tree::is_trace_text(text) {
                let (stripped, index) = label_and_index(text);
                let mut tree = Tree::leaf(label, &stripped);
                if let Some((kind, n)) = index
                    && tree.index(tree.root()).is_none()
                {
                    tree.set_index(tree.root(), kind, n);
                }
                tree
            } else {
                Tree::leaf(label, text)
            }
        }
        _ => {
            if let Some(word) = rest.iter().find(|item| matches!(item, SExpr::Word { .. })) {
                return Err(ParseError::new(
                    word.offset(),
                    "leaf has too many children",
                ));
            }
            let children = rest
                .iter()
                .map(|child| build_node(child, options))
                .collect::<Result<Vec<_>, _>>()?;
            Tree::non_terminal(label, children)
        }
    };
    let root = tree.root();
    for (key, value) in metadata {
        tree.metadata_mut(root).set(key, value);
    }
    Ok(tree)
}

/// Read the `(KEY value)` pairs of a `(METADATA …)` group.
fn read_metadata_group(
    items: &[SExpr<'_>],
    offset: usize,
    options: &ParseOptions,
    out: &mut Vec<(String, String)>,
) -> Result<(), ParseError> {
    for item in &items[1..] {
        let SExpr::Group { offset: pair_offset, items: pair } = item else {
            return Err(ParseError::new(offset, "malformed (METADATA …) group"));
        };
        let [SExpr::Word { text: key, .. }, SExpr::Word { text: value, .. }] = pair.as_slice()
        else {
            return Err(ParseError::new(*pair_offset, "malformed metadata pair"));
        };
        flag_key(options, key, *pair_offset);
        out.push((key.to_string(), value.to_string()));
    }
    Ok(())
}

fn flag_key(options: &ParseOptions, key: &str, offset: usize) {
    if !options.recognized_keys.iter().any(|k| k == key) {
        warn!(key, offset, "unrecognized metadata key");
    }
}

/// Render a tree in the canonical indented bracketed form.
///
/// Coindexation indices are re-embedded in labels (or trace texts), extra
/// metadata is emitted as a trailing `(METADATA …)` group, and a root `ID`
/// produces the label-less wrapper form.  `parse` accepts everything this
/// emits, and `render(parse(render(t))) == render(t)`.
pub fn render(tree: &Tree) -> String {
    let root = tree.root();
    let mut out = String::new();
    match tree.metadata(root).try_get(tree::ID_KEY) {
        Some(id) => {
            out.push_str("( ");
            render_node(tree, root, 2, true, &mut out);
            out.push_str("\n  (ID ");
            out.push_str(id);
            out.push_str("))");
        }
        None => render_node(tree, root, 0, false, &mut out),
    }
    out
}

/// Render a whole corpus, one tree per paragraph.
pub fn render_corpus<'a>(trees: impl IntoIterator<Item = &'a Tree>) -> String {
    let rendered: Vec<String> = trees.into_iter().map(render).collect();
    rendered.join("\n\n")
}

fn render_node(tree: &Tree, id: NodeId, indent: usize, skip_id: bool, out: &mut String) {
    let index = index_suffix(tree, id);
    if tree.is_leaf(id) {
        let text = tree.text(id).unwrap_or_default();
        out.push('(');
        if tree.is_trace(id) {
            // trace leaves carry the index on the text
            out.push_str(tree.label(id));
            out.push(' ');
            out.push_str(text);
            out.push_str(&index);
        } else {
            out.push_str(tree.label(id));
            out.push_str(&index);
            out.push(' ');
            out.push_str(text);
        }
        render_metadata(tree.metadata(id), skip_id, out);
        out.push(')');
    } else {
        let head = format!("({}{} ", tree.label(id), index);
        let child_indent = indent + head.len();
        out.push_str(&head);
        for (i, &child) in tree.children(id).iter().enumerate() {
            if i > 0 {
                out.push('\n');
                out.push_str(&" ".repeat(child_indent));
            }
            render_node(tree, child, child_indent, false, out);
        }
        render_metadata(tree.metadata(id), skip_id, out);
        out.push(')');
    }
}

fn render_metadata(metadata: &Metadata, skip_id: bool, out: &mut String) {
    let skipped = |key: &str| {
        key == tree::INDEX_KEY || key == tree::IDX_TYPE_KEY || (skip_id && key == tree::ID_KEY)
    };
    let extra: Vec<(&str, &str)> = metadata.iter().filter(|(k, _)| !skipped(k)).collect();
    if extra.is_empty() {
        return;
    }
    out.push_str(" (METADATA");
    for (key, value) in extra {
        out.push_str(" (");
        out.push_str(key);
        out.push(' ');
        out.push_str(value);
        out.push(')');
    }
    out.push(')');
}

fn index_suffix(tree: &Tree, id: NodeId) -> String {
    match tree.index(id) {
        Some((kind, n)) => format!("{}{}", kind.connector(), n),
        None => String::new(),
    }
}
