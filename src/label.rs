//! Label grammar: dash tags and coindexation indices
//!
//! Treebank labels pack three things into one token: a bare category
//! (`NP`), zero or more dash tags (`-SBJ`), and an optional trailing
//! coindexation index (`-1` for movement indices, `=1` for gaps).  This
//! module splits a label into those parts and recombines them losslessly.

use thiserror::Error;

/// Error for labels that violate the label grammar
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("malformed label: {0}")]
pub struct MalformedLabel(pub String);

/// How a coindexation index attaches to its label
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// `-n`: a movement index
    Regular,
    /// `=n`: a gapping index
    Gap,
}

impl IndexKind {
    /// The character joining the index to the label
    pub fn connector(self) -> char {
        match self {
            IndexKind::Regular => '-',
            IndexKind::Gap => '=',
        }
    }

    /// Value stored under the `IDX-TYPE` metadata key
    pub fn as_str(self) -> &'static str {
        match self {
            IndexKind::Regular => "regular",
            IndexKind::Gap => "gap",
        }
    }
}

/// A label split into its grammatical parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLabel {
    pub bare: String,
    pub dash_tags: Vec<String>,
    pub index: Option<(IndexKind, u32)>,
}

/// Split a label into (bare label, dash tags, index).
///
/// The accepted grammar is `bare ("-" tag)* (("-" | "=") digits)?` where
/// `bare` and each `tag` are nonempty and contain neither `-` nor `=`.
/// [`recombine`] is a two-sided inverse of this function over that grammar.
pub fn split(label: &str) -> Result<ParsedLabel, MalformedLabel> {
    if label.is_empty() {
        return Err(MalformedLabel(label.to_string()));
    }
    let malformed = || MalformedLabel(label.to_string());
    let mut rest = label;
    let mut index = None;
    match label.matches('=').count() {
        0 => {}
        1 => {
            let (head, tail) = label.rsplit_once('=').unwrap();
            if head.is_empty() || !is_index(tail) {
                return Err(malformed());
            }
            index = Some((IndexKind::Gap, tail.parse().map_err(|_| malformed())?));
            rest = head;
        }
        _ => return Err(malformed()),
    }
    let mut segments: Vec<&str> = rest.split('-').collect();
    if index.is_none() && segments.len() > 1 && is_index(segments.last().unwrap()) {
        let digits = segments.pop().unwrap();
        index = Some((IndexKind::Regular, digits.parse().map_err(|_| malformed())?));
    }
    if segments.iter().any(|s| s.is_empty()) {
        return Err(malformed());
    }
    Ok(ParsedLabel {
        bare: segments[0].to_string(),
        dash_tags: segments[1..].iter().map(|s| s.to_string()).collect(),
        index,
    })
}

/// Recombine parts produced by [`split`] back into a label string.
///
/// Fails with [`MalformedLabel`] when the parts fall outside the accepted
/// grammar (empty or separator-bearing segments, or a final all-digit dash
/// tag with no index, which could not survive a round trip).
pub fn recombine(parts: &ParsedLabel) -> Result<String, MalformedLabel> {
    let mut out = parts.bare.clone();
    for tag in &parts.dash_tags {
        out.push('-');
        out.push_str(tag);
    }
    if let Some((kind, n)) = parts.index {
        out.push(kind.connector());
        out.push_str(&n.to_string());
    }
    // the result must split back to the same parts
    if split(&out).ok().as_ref() != Some(parts) {
        return Err(MalformedLabel(out));
    }
    Ok(out)
}

/// Lenient split used when reading labels (or trace texts) from treebank
/// text: extracts a well-formed trailing index, leaving anything else in
/// place untouched.
pub fn label_and_index(s: &str) -> (String, Option<(IndexKind, u32)>) {
    if let Some((head, tail)) = s.rsplit_once('=')
        && !head.is_empty()
        && is_index(tail)
        && let Ok(n) = tail.parse()
    {
        return (head.to_string(), Some((IndexKind::Gap, n)));
    }
    if let Some((head, tail)) = s.rsplit_once('-')
        && !head.is_empty()
        && is_index(tail)
        && let Ok(n) = tail.parse()
    {
        return (head.to_string(), Some((IndexKind::Regular, n)));
    }
    (s.to_string(), None)
}

fn is_index(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_plain() {
        let parts = split("NP").unwrap();
        assert_eq!(parts.bare, "NP");
        assert!(parts.dash_tags.is_empty());
        assert_eq!(parts.index, None);
    }

    #[test]
    fn test_split_tags_and_index() {
        let parts = split("NP-SBJ-1").unwrap();
        assert_eq!(parts.bare, "NP");
        assert_eq!(parts.dash_tags, vec!["SBJ"]);
        assert_eq!(parts.index, Some((IndexKind::Regular, 1)));

        let parts = split("CP-REL=2").unwrap();
        assert_eq!(parts.bare, "CP");
        assert_eq!(parts.dash_tags, vec!["REL"]);
        assert_eq!(parts.index, Some((IndexKind::Gap, 2)));
    }

    #[test]
    fn test_split_multiple_tags() {
        let parts = split("NP-SBJ-RSP").unwrap();
        assert_eq!(parts.bare, "NP");
        assert_eq!(parts.dash_tags, vec!["SBJ", "RSP"]);
        assert_eq!(parts.index, None);
    }

    #[test]
    fn test_split_rejects() {
        assert!(split("").is_err());
        assert!(split("-SBJ").is_err());
        assert!(split("NP-").is_err());
        assert!(split("NP--SBJ").is_err());
        assert!(split("NP=X").is_err());
        assert!(split("NP=1=2").is_err());
    }

    #[test]
    fn test_round_trip() {
        for label in ["NP", "NP-SBJ", "NP-SBJ-1", "IP-MAT", "CP-REL=2", "N+N", "*T*"] {
            let parts = split(label).unwrap();
            assert_eq!(recombine(&parts).unwrap(), label);
        }
    }

    #[test]
    fn test_recombine_rejects_ambiguous() {
        // a final all-digit tag would re-split as an index
        let parts = ParsedLabel {
            bare: "NP".to_string(),
            dash_tags: vec!["1".to_string()],
            index: None,
        };
        assert!(recombine(&parts).is_err());

        let parts = ParsedLabel {
            bare: "N-P".to_string(),
            dash_tags: vec![],
            index: None,
        };
        assert!(recombine(&parts).is_err());
    }

    #[test]
    fn test_label_and_index_lenient() {
        assert_eq!(
            label_and_index("NP-SBJ-1"),
            ("NP-SBJ".to_string(), Some((IndexKind::Regular, 1)))
        );
        assert_eq!(
            label_and_index("CP=3"),
            ("CP".to_string(), Some((IndexKind::Gap, 3)))
        );
        // not a well-formed index: left alone
        assert_eq!(label_and_index("NP-SBJ"), ("NP-SBJ".to_string(), None));
        assert_eq!(label_and_index("A=B"), ("A=B".to_string(), None));
        assert_eq!(
            label_and_index("*T*-2"),
            ("*T*".to_string(), Some((IndexKind::Regular, 2)))
        );
    }
}
