// expr.rs — Symbol engine for control-edge expressions
//
// Control edges carry conditions and assignments as expression strings over
// scalar program symbols. This module tokenizes them with `logos` to extract
// free symbols and to rewrite symbol references (identifier-exact, never
// substring matches).
//
// Preconditions: expressions are plain ASCII/UTF-8 strings.
// Postconditions: `rename` preserves every non-identifier byte of the input.
// Failure modes: unrecognized bytes are treated as opaque text and kept.
// Side effects: none.

use std::collections::BTreeSet;

use logos::Logos;

use crate::ir::ProgramGraph;

/// Expression tokens. Only identifiers matter to the transform; everything
/// else is carried through untouched.
#[derive(Logos, Debug, Clone, PartialEq)]
pub enum Token {
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*")]
    Ident,

    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?")]
    Number,

    #[regex(r"[+\-*/%<>=!&|^(),\[\]\s:]+")]
    Other,
}

/// Free symbols of an expression, in lexical order.
pub fn free_symbols(expr: &str) -> BTreeSet<String> {
    let mut lex = Token::lexer(expr);
    let mut syms = BTreeSet::new();
    while let Some(tok) = lex.next() {
        if tok == Ok(Token::Ident) {
            syms.insert(lex.slice().to_string());
        }
    }
    syms
}

/// Rewrite every identifier equal to `from` into `to`, leaving all other
/// text (operators, numbers, unknown bytes) byte-identical.
pub fn rename(expr: &str, from: &str, to: &str) -> String {
    let mut lex = Token::lexer(expr);
    let mut out = String::with_capacity(expr.len());
    let mut last_end = 0;
    while let Some(tok) = lex.next() {
        let span = lex.span();
        out.push_str(&expr[last_end..span.start]);
        if tok == Ok(Token::Ident) && lex.slice() == from {
            out.push_str(to);
        } else {
            out.push_str(lex.slice());
        }
        last_end = span.end;
    }
    out.push_str(&expr[last_end..]);
    out
}

/// Symbols that are compile-time constants for a graph: every symbol used in
/// some array shape or edge expression that is never the target of a
/// control-edge assignment.
pub fn constant_symbols(graph: &ProgramGraph) -> BTreeSet<String> {
    let mut used = BTreeSet::new();
    for desc in graph.arrays.values() {
        for s in desc.free_symbols() {
            used.insert(s.to_string());
        }
    }
    let mut assigned = BTreeSet::new();
    for edge in graph.control_edges() {
        if let Some(cond) = &edge.condition {
            used.extend(free_symbols(cond));
        }
        for (sym, rhs) in &edge.assignments {
            assigned.insert(sym.clone());
            used.extend(free_symbols(rhs));
        }
    }
    used.difference(&assigned).cloned().collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
