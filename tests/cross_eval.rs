//! Cross-evaluator agreement: every query must produce identical results
//! whether it is evaluated by walking trees directly or compiled against
//! the relational store — including the shapes that have no exact
//! relational translation and take the re-checking fallback.

use bracken::{
    Corpus, Match, Query, dash_tag, doms, idoms, label, label_exact, label_rx, parse_query, sprec,
    sprec_any, text, trees,
};
use regex::Regex;

const CORPUS: &str = "\
( (IP-MAT (NP-SBJ-1 (PRO He)) (VBD left) (NP (NP *T*-1))) (ID a-01))

(IP-MAT (NP-SBJ (D The) (N dog)) (VBD chased) (NP-OB1 (D the) (N cat)))

(IP-SUB (NP-SBJ (PRO it)) (BED was) (ADJP (ADJ late)))

(CP-QUE (C whether) (IP-SUB (NP-SBJ (PRO he)) (VBD left)))

(NP (D a) (CODE {COM:x}) (N example))";

fn fixture() -> Corpus {
    trees(CORPUS).map(|t| t.unwrap()).collect()
}

/// Flatten matches into comparable shape: per tree, the rendered tree and
/// each matching node as (label, depth).
fn summarize(matches: Vec<Match>) -> Vec<(String, Vec<(String, usize)>)> {
    matches
        .into_iter()
        .map(|m| {
            let nodes = m
                .nodes
                .iter()
                .map(|&n| (m.tree.label(n).to_string(), m.tree.depth(n)))
                .collect();
            (bracken::render(&m.tree), nodes)
        })
        .collect()
}

fn assert_agreement(query: &Query) {
    let corpus = fixture();
    let db = corpus.to_db().unwrap();
    let direct = summarize(corpus.matching_trees(query).collect());
    let indexed = summarize(
        db.matching_trees(query)
            .collect::<Result<Vec<_>, _>>()
            .unwrap(),
    );
    assert_eq!(direct, indexed, "evaluators disagree on {query}");
}

#[test]
fn label_queries_agree() {
    assert_agreement(&label("NP"));
    assert_agreement(&label("NP-SBJ"));
    assert_agreement(&label_exact("NP"));
    assert_agreement(&label_exact("IP-MAT"));
    assert_agreement(&label("XP"));
}

#[test]
fn dash_tag_and_text_agree() {
    assert_agreement(&dash_tag("SBJ"));
    assert_agreement(&dash_tag("QUE"));
    assert_agreement(&text("left"));
    assert_agreement(&text("*T*"));
    assert_agreement(&text("nope"));
}

#[test]
fn dominance_queries_agree() {
    assert_agreement(&doms(label("PRO")));
    assert_agreement(&idoms(label("NP-SBJ")));
    assert_agreement(&doms(text("left")));
    assert_agreement(&idoms(text("left")));
    assert_agreement(&doms(doms(label("PRO"))));
}

#[test]
fn precedence_queries_agree() {
    assert_agreement(&sprec(label("VBD")));
    assert_agreement(&sprec_any(label("NP-OB1")));
    assert_agreement(&sprec(text("left")));
    assert_agreement(&sprec_any(label("N")));
}

#[test]
fn boolean_combinations_agree() {
    assert_agreement(&(label("VBD") & idoms(text("left"))));
    assert_agreement(&(label("NP") | label("ADJP")));
    assert_agreement(&!label("NP"));
    assert_agreement(&!text("left"));
    assert_agreement(&(!doms(label("PRO")) & label("IP-MAT")));
    assert_agreement(&(label("IP-SUB") & doms(label("PRO") | text("late"))));
    assert_agreement(&!(label("NP") & sprec(label("VBD"))));
}

#[test]
fn fallback_shapes_agree() {
    // no exact relational translation: these exercise the re-check path
    let shapes = [
        label_rx(Regex::new("^[NV]P").unwrap()),
        label_rx(Regex::new("SBJ$").unwrap()),
        label("NP%"),
        dash_tag("S_J"),
        dash_tag("SBJ-1"),
        label_rx(Regex::new("^IP").unwrap()) & idoms(label("NP-SBJ")),
    ];
    for query in &shapes {
        assert!(query.to_sql().is_none(), "{query} should not compile");
        assert_agreement(query);
    }
}

#[test]
fn parsed_queries_agree() {
    for source in [
        r#"label("NP-SBJ")"#,
        r#"label("VBD") & idoms(text("left"))"#,
        r#"~label("NP") & doms(text("late"))"#,
        r#"sprec(label("VBD")) | dash_tag("QUE")"#,
    ] {
        let query = parse_query(source).unwrap();
        assert_agreement(&query);
    }
}

#[test]
fn dominance_is_strict_and_transitive() {
    let corpus = fixture();
    for tree in corpus.iter() {
        let nodes: Vec<_> = tree.pre_order().collect();
        for &a in &nodes {
            assert!(!tree.is_ancestor(a, a));
            for &b in &nodes {
                for &c in &nodes {
                    if tree.is_ancestor(a, b) && tree.is_ancestor(b, c) {
                        assert!(tree.is_ancestor(a, c));
                    }
                }
            }
        }
    }
}

#[test]
fn subject_np_scenario() {
    let corpus: Corpus = trees("(IP-MAT (NP-SBJ (PRO He)) (VBD left))")
        .map(|t| t.unwrap())
        .collect();
    let query = label("NP-SBJ");
    let matches: Vec<Match> = corpus.matching_trees(&query).collect();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].nodes.len(), 1);
    assert_eq!(matches[0].tree.urtext(matches[0].nodes[0]), "He");

    let db = corpus.to_db().unwrap();
    let matches: Vec<Match> = db
        .matching_trees(&query)
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].tree.urtext(matches[0].nodes[0]), "He");
}
