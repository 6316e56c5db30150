//! Parser for the query surface syntax
//!
//! Parses the textual query form (`label("NP") & idoms(text("left"))`)
//! into a [`Query`] using a pest grammar.  The syntax is exactly what
//! [`Query`]'s `Display` emits, so rendering and parsing round-trip.

use pest::Parser;
use pest::iterators::Pair;
use pest_derive::Parser;
use regex::Regex;
use thiserror::Error;

use crate::query::{self, Query};

#[derive(Parser)]
#[grammar = "query.pest"]
struct QueryParser;

/// Error type for query-syntax parsing failures
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("query error: {0}")]
    ParseError(#[from] pest::error::Error<Rule>),

    #[error("query error: unknown function: {0}")]
    UnknownFunction(String),

    #[error("query error: wrong arguments for {0}")]
    BadArguments(String),

    #[error("query error: invalid regex: {0}")]
    BadRegex(#[from] regex::Error),
}

/// Parse a query string into a [`Query`].
pub fn parse_query(input: &str) -> Result<Query, QueryError> {
    let mut pairs = QueryParser::parse(Rule::query, input)?;
    let query_pair = pairs.next().unwrap();
    let or_expr = query_pair.into_inner().next().unwrap();
    build_or(or_expr)
}

fn build_or(pair: Pair<Rule>) -> Result<Query, QueryError> {
    let mut inner = pair.into_inner();
    let mut query = build_and(inner.next().unwrap())?;
    for rhs in inner {
        query = Query::Or(Box::new(query), Box::new(build_and(rhs)?));
    }
    Ok(query)
}

fn build_and(pair: Pair<Rule>) -> Result<Query, QueryError> {
    let mut inner = pair.into_inner();
    let mut query = build_unary(inner.next().unwrap())?;
    for rhs in inner {
        query = Query::And(Box::new(query), Box::new(build_unary(rhs)?));
    }
    Ok(query)
}

fn build_unary(pair: Pair<Rule>) -> Result<Query, QueryError> {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::negation => {
            let operand = inner.into_inner().next().unwrap();
            Ok(Query::Not(Box::new(build_unary(operand)?)))
        }
        Rule::primary => build_primary(inner),
        rule => panic!("unexpected rule in unary: {rule:?}"),
    }
}

fn build_primary(pair: Pair<Rule>) -> Result<Query, QueryError> {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::call => build_call(inner),
        Rule::or_expr => build_or(inner),
        rule => panic!("unexpected rule in primary: {rule:?}"),
    }
}

enum Arg {
    Str(String),
    Exact,
    Sub(Query),
}

fn build_call(pair: Pair<Rule>) -> Result<Query, QueryError> {
    let mut inner = pair.into_inner();
    let name = inner.next().unwrap().as_str().to_string();
    let args = inner
        .next()
        .unwrap()
        .into_inner()
        .map(build_arg)
        .collect::<Result<Vec<_>, _>>()?;
    let bad_args = || QueryError::BadArguments(name.clone());

    match name.as_str() {
        "label" => {
            let mut args = args.into_iter();
            let text = match args.next() {
                Some(Arg::Str(text)) => text,
                _ => return Err(bad_args()),
            };
            match (args.next(), args.next()) {
                (None, _) => Ok(query::label(text)),
                (Some(Arg::Exact), None) => Ok(query::label_exact(text)),
                _ => Err(bad_args()),
            }
        }
        "label_rx" => match args.as_slice() {
            [Arg::Str(source)] => Ok(query::label_rx(Regex::new(source)?)),
            _ => Err(bad_args()),
        },
        "dash_tag" => match args.as_slice() {
            [Arg::Str(tag)] => Ok(query::dash_tag(tag.clone())),
            _ => Err(bad_args()),
        },
        "text" => match args.as_slice() {
            [Arg::Str(text)] => Ok(query::text(text.clone())),
            _ => Err(bad_args()),
        },
        "doms" | "idoms" | "sprec" | "sprec_any" => {
            let mut args = args.into_iter();
            let (Some(Arg::Sub(sub)), None) = (args.next(), args.next()) else {
                return Err(bad_args());
            };
            Ok(match name.as_str() {
                "doms" => query::doms(sub),
                "idoms" => query::idoms(sub),
                "sprec" => query::sprec(sub),
                _ => query::sprec_any(sub),
            })
        }
        _ => Err(QueryError::UnknownFunction(name)),
    }
}

fn build_arg(pair: Pair<Rule>) -> Result<Arg, QueryError> {
    let inner = pair.into_inner().next().unwrap();
    match inner.as_rule() {
        Rule::string => {
            let raw = inner.into_inner().next().unwrap().as_str();
            Ok(Arg::Str(unescape(raw)))
        }
        Rule::keyword => Ok(Arg::Exact),
        Rule::or_expr => Ok(Arg::Sub(build_or(inner)?)),
        rule => panic!("unexpected rule in arg: {rule:?}"),
    }
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{dash_tag, doms, idoms, label, label_exact, sprec, text};

    #[test]
    fn test_parse_leaf_predicates() {
        assert_eq!(parse_query(r#"label("NP")"#).unwrap(), label("NP"));
        assert_eq!(
            parse_query(r#"label("NP", exact)"#).unwrap(),
            label_exact("NP")
        );
        assert_eq!(parse_query(r#"dash_tag("SBJ")"#).unwrap(), dash_tag("SBJ"));
        assert_eq!(parse_query(r#"text("left")"#).unwrap(), text("left"));
    }

    #[test]
    fn test_parse_wrappers_and_operators() {
        assert_eq!(
            parse_query(r#"label("VBD") & idoms(text("left"))"#).unwrap(),
            label("VBD") & idoms(text("left"))
        );
        assert_eq!(
            parse_query(r#"~label("NP") | doms(sprec(label("VP")))"#).unwrap(),
            !label("NP") | doms(sprec(label("VP")))
        );
    }

    #[test]
    fn test_operator_precedence() {
        // & binds tighter than |
        assert_eq!(
            parse_query(r#"label("A") & label("B") | label("C")"#).unwrap(),
            (label("A") & label("B")) | label("C")
        );
        assert_eq!(
            parse_query(r#"label("A") & (label("B") | label("C"))"#).unwrap(),
            label("A") & (label("B") | label("C"))
        );
        // & is left-associative
        assert_eq!(
            parse_query(r#"label("A") & label("B") & label("C")"#).unwrap(),
            (label("A") & label("B")) & label("C")
        );
    }

    #[test]
    fn test_string_escapes() {
        assert_eq!(
            parse_query(r#"text("a \"b\" \\c")"#).unwrap(),
            text(r#"a "b" \c"#)
        );
    }

    #[test]
    fn test_display_round_trip() {
        let queries = [
            label("NP"),
            label_exact("NP-SBJ"),
            dash_tag("SBJ"),
            text("left"),
            crate::query::label_rx(Regex::new("^[NV]P").unwrap()),
            label("VBD") & idoms(text("left")),
            !label("NP") | (doms(label("PRO")) & crate::query::sprec_any(label("VP"))),
            sprec(label("B") | label("C")),
        ];
        for query in queries {
            let rendered = query.to_string();
            let reparsed = parse_query(&rendered).unwrap();
            assert_eq!(reparsed, query, "round trip failed for {rendered}");
        }
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            parse_query(r#"frobnicate("NP")"#),
            Err(QueryError::UnknownFunction(name)) if name == "frobnicate"
        ));
        assert!(matches!(
            parse_query(r#"label(doms(label("X")))"#),
            Err(QueryError::BadArguments(_))
        ));
        assert!(matches!(
            parse_query(r#"doms("NP")"#),
            Err(QueryError::BadArguments(_))
        ));
        assert!(matches!(
            parse_query(r#"label_rx("[unclosed")"#),
            Err(QueryError::BadRegex(_))
        ));
        assert!(matches!(
            parse_query("label(\"NP\") &"),
            Err(QueryError::ParseError(_))
        ));
        assert!(parse_query("").is_err());
    }
}
