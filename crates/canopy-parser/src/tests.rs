use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::Rc;

use expect_test::{expect, Expect};
use pretty_assertions::assert_eq;
use triomphe::Arc;

use crate::input::StrInput;
use crate::language::{
    ExternalScanner, ExternalTokens, Language, LanguageRef, LexMode, ParseAction, ParseTableEntry,
    StateId, SymbolId, SymbolMetadata, SYM_END, SYM_ERROR,
};
use crate::length::Length;
use crate::lexer::LexCursor;
use crate::parser::{LogKind, Parser};
use crate::subtree::Subtree;
use crate::tree::{InputEdit, Tree};

// --- fixture plumbing -----------------------------------------------------

fn shift(state: StateId) -> ParseAction {
    ParseAction::Shift {
        state,
        is_repetition: false,
    }
}

fn reduce(symbol: SymbolId, child_count: u32) -> ParseAction {
    reduce_prec(symbol, child_count, 0)
}

fn reduce_prec(symbol: SymbolId, child_count: u32, dynamic_precedence: i32) -> ParseAction {
    ParseAction::Reduce {
        symbol,
        child_count,
        dynamic_precedence,
        alias_sequence_id: 0,
    }
}

fn table(
    state_count: usize,
    entries: &[(StateId, SymbolId, &[ParseAction])],
) -> Vec<HashMap<SymbolId, ParseTableEntry>> {
    let mut states = vec![HashMap::new(); state_count];
    for (state, symbol, actions) in entries {
        states[*state as usize].insert(
            *symbol,
            ParseTableEntry {
                actions: actions.to_vec(),
                reusable: true,
            },
        );
    }
    states
}

fn gotos(
    state_count: usize,
    entries: &[(StateId, SymbolId, StateId)],
) -> Vec<HashMap<SymbolId, StateId>> {
    let mut states = vec![HashMap::new(); state_count];
    for (state, symbol, target) in entries {
        states[*state as usize].insert(*symbol, *target);
    }
    states
}

fn plain_lex_modes(state_count: usize) -> Vec<LexMode> {
    vec![
        LexMode {
            lex_state: 1,
            external_lex_state: 0,
        };
        state_count
    ]
}

fn hidden() -> SymbolMetadata {
    SymbolMetadata::default()
}

fn token() -> SymbolMetadata {
    SymbolMetadata {
        visible: true,
        named: false,
        supertype: false,
    }
}

fn named() -> SymbolMetadata {
    SymbolMetadata {
        visible: true,
        named: true,
        supertype: false,
    }
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|name| name.to_string()).collect()
}

fn pos(bytes: u32) -> Length {
    Length::new(bytes, 0, bytes)
}

fn edit(start: u32, old_end: u32, new_end: u32) -> InputEdit {
    InputEdit {
        start_byte: start,
        old_end_byte: old_end,
        new_end_byte: new_end,
        start_position: pos(start),
        old_end_position: pos(old_end),
        new_end_position: pos(new_end),
    }
}

fn parser_for(language: &LanguageRef) -> Parser {
    let mut parser = Parser::new();
    parser.set_language(language.clone()).unwrap();
    parser
}

fn assert_tree(tree: &Tree, expected: Expect) {
    expected.assert_eq(&format!("{tree:?}"));
}

fn find_error_repeats(node: &Subtree, out: &mut Vec<Subtree>) {
    if node.is_error_repeat() {
        out.push(node.clone());
    }
    for child in node.children() {
        find_error_repeats(child, out);
    }
}

/// Every leaf with its byte range, in text order.
fn collect_leaves(tree: &Tree) -> Vec<(SymbolId, u32, u32, Subtree)> {
    fn walk(node: &Subtree, start: u32, out: &mut Vec<(SymbolId, u32, u32, Subtree)>) {
        if node.child_count() == 0 {
            out.push((
                node.symbol(),
                start + node.padding().bytes,
                start + node.total_bytes(),
                node.clone(),
            ));
            return;
        }
        let mut child_start = start;
        for child in node.children() {
            walk(child, child_start, out);
            child_start += child.total_bytes();
        }
    }
    let mut leaves = Vec::new();
    walk(&tree.root, 0, &mut leaves);
    leaves
}

/// The leaves must tile the input exactly: no gap, no overlap.
fn assert_covers(tree: &Tree, input: &str) {
    let mut position = 0;
    fn walk(node: &Subtree, position: &mut u32) {
        if node.child_count() == 0 {
            *position += node.total_bytes();
            return;
        }
        let before = *position;
        for child in node.children() {
            walk(child, position);
        }
        assert_eq!(*position - before, node.total_bytes());
    }
    walk(&tree.root, &mut position);
    assert_eq!(position, input.len() as u32);
    assert_eq!(tree.total_bytes(), input.len() as u32);
}

/// Error costs and extents must summarize exactly from children; error
/// wrappers (including hidden repetitions) always add an intrinsic penalty.
fn assert_consistent(node: &Subtree) {
    if node.child_count() == 0 {
        return;
    }
    let cost_sum: u32 = node.children().iter().map(|child| child.error_cost()).sum();
    if node.is_error() || node.is_error_repeat() {
        assert!(node.error_cost() > cost_sum);
    } else {
        assert_eq!(node.error_cost(), cost_sum);
    }
    let mut extent = Length::ZERO;
    for child in node.children() {
        extent += child.total_size();
    }
    assert_eq!(node.total_size(), extent);
    for child in node.children() {
        assert_consistent(child);
    }
}

// --- "words" language: document := identifier*, `#` comments are extra ----

const WORD_ID: SymbolId = 1;
const WORD_COMMENT: SymbolId = 2;
const WORD_DOC: SymbolId = 3;

fn lex_words(cursor: &mut LexCursor<'_, '_>, _state: u16) -> bool {
    while matches!(cursor.lookahead(), Some(' ' | '\t' | '\n')) {
        cursor.skip();
    }
    match cursor.lookahead() {
        None => {
            cursor.accept(SYM_END);
            true
        }
        Some('#') => {
            cursor.advance();
            while !matches!(cursor.lookahead(), None | Some('\n')) {
                cursor.advance();
            }
            cursor.accept(WORD_COMMENT);
            true
        }
        Some(c) if c.is_ascii_alphabetic() => {
            while matches!(cursor.lookahead(), Some(c) if c.is_ascii_alphabetic()) {
                cursor.advance();
            }
            cursor.accept(WORD_ID);
            true
        }
        _ => false,
    }
}

fn words_language() -> LanguageRef {
    words_language_with_version(crate::language::LANGUAGE_VERSION)
}

fn words_language_with_version(version: u32) -> LanguageRef {
    let extra: &[ParseAction] = &[ParseAction::ShiftExtra];
    Arc::new(Language {
        name: "words".to_string(),
        version,
        symbol_count: 4,
        token_count: 3,
        parse_table: table(
            5,
            &[
                (1, WORD_ID, &[shift(2)]),
                (1, SYM_END, &[reduce(WORD_DOC, 0)]),
                (1, WORD_COMMENT, extra),
                (2, WORD_ID, &[reduce(WORD_DOC, 1)]),
                (2, SYM_END, &[reduce(WORD_DOC, 1)]),
                (2, WORD_COMMENT, extra),
                (3, WORD_ID, &[shift(4)]),
                (3, SYM_END, &[ParseAction::Accept]),
                (3, WORD_COMMENT, extra),
                (4, WORD_ID, &[reduce(WORD_DOC, 2)]),
                (4, SYM_END, &[reduce(WORD_DOC, 2)]),
                (4, WORD_COMMENT, extra),
            ],
        ),
        next_states: gotos(
            5,
            &[
                (1, WORD_ID, 2),
                (1, WORD_DOC, 3),
                (3, WORD_ID, 4),
            ],
        ),
        lex_modes: plain_lex_modes(5),
        lex_fn: lex_words,
        keyword_lex_fn: None,
        keyword_capture_token: None,
        external_tokens: None,
        symbols: vec![hidden(), named(), token(), named()],
        symbol_names: names(&["end", "identifier", "comment", "document"]),
        alias_sequences: vec![Vec::new()],
    })
}

#[test]
fn parses_a_flat_word_list() {
    let language = words_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("aaa bbb ccc", None).unwrap();
    assert_eq!(tree.error_cost(), 0);
    assert_covers(&tree, "aaa bbb ccc");
    assert_consistent(&tree.root);
    let leaves = collect_leaves(&tree);
    assert!(leaves.iter().all(|(_, _, _, leaf)| !leaf.is_fragile()));
    assert!(leaves[0].3.is_named());
    assert_tree(
        &tree,
        expect![[r#"
            document@0..11
                document@0..7
                    document@0..3
                        identifier@0..3
                    identifier@4..7
                identifier@8..11
        "#]],
    );
}

#[test]
fn empty_input_yields_an_empty_root() {
    let language = words_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("", None).unwrap();
    assert_eq!(tree.error_cost(), 0);
    assert_eq!(tree.total_bytes(), 0);
    assert_tree(
        &tree,
        expect![[r#"
            document@0..0
        "#]],
    );
    // The root's only child is the accepted end-of-input token.
    assert_eq!(tree.root.child_count(), 1);
    assert_eq!(tree.root.children()[0].symbol(), SYM_END);
    assert!(tree.root.children()[0].is_extra());
}

#[test]
fn whitespace_only_input_is_padding_on_the_final_token() {
    let language = words_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("   ", None).unwrap();
    assert_eq!(tree.error_cost(), 0);
    assert_covers(&tree, "   ");
    assert!(tree.root.children().iter().all(|child| child.is_extra()));
}

#[test]
fn comments_are_attached_as_extra_tokens() {
    let language = words_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("aaa # hi", None).unwrap();
    assert_eq!(tree.error_cost(), 0);
    assert_covers(&tree, "aaa # hi");
    assert_tree(
        &tree,
        expect![[r#"
            document@0..8
                identifier@0..3
                comment@4..8
        "#]],
    );
}

#[test]
fn unlexable_bytes_become_an_error_leaf() {
    let language = words_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("abc 123 def", None).unwrap();
    assert!(tree.error_cost() > 0);
    assert_covers(&tree, "abc 123 def");
    assert_consistent(&tree.root);

    // The digits, which no recognizer accepts, come out as one error leaf
    // spanning exactly their three bytes.
    let leaves = collect_leaves(&tree);
    let error_leaves: Vec<_> = leaves
        .iter()
        .filter(|(symbol, _, _, _)| *symbol == SYM_ERROR)
        .collect();
    assert_eq!(error_leaves.len(), 1);
    let (_, start, end, leaf) = error_leaves[0];
    assert_eq!((*start, *end), (4, 7));
    assert_eq!(leaf.lookahead_char(), Some('1'));

    assert_tree(
        &tree,
        expect![[r#"
            document@0..11
                ERROR@0..7
                    identifier@0..3
                    ERROR@4..7
                identifier@8..11
        "#]],
    );
}

#[test]
fn error_at_the_last_byte_produces_a_trailing_error_leaf() {
    let language = words_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("abc !", None).unwrap();
    assert!(tree.error_cost() > 0);
    assert_covers(&tree, "abc !");
    let leaves = collect_leaves(&tree);
    let (symbol, start, end, _) = leaves
        .iter()
        .find(|(symbol, _, _, _)| *symbol == SYM_ERROR)
        .expect("one error leaf");
    assert_eq!((*symbol, *start, *end), (SYM_ERROR, 4, 5));
}

#[test]
fn reparse_reuses_unchanged_leaves_by_identity() {
    let language = words_language();
    let mut parser = parser_for(&language);
    let mut tree = parser.parse_str("aaa bbb ccc", None).unwrap();
    let old_leaves = collect_leaves(&tree);

    tree.edit(&edit(4, 7, 7));
    let new_tree = parser.parse_str("aaa BBB ccc", Some(&tree)).unwrap();
    assert_eq!(new_tree.error_cost(), 0);
    assert_covers(&new_tree, "aaa BBB ccc");
    assert_tree(
        &new_tree,
        expect![[r#"
            document@0..11
                document@0..7
                    document@0..3
                        identifier@0..3
                    identifier@4..7
                identifier@8..11
        "#]],
    );

    let new_leaves = collect_leaves(&new_tree);
    assert_eq!(old_leaves.len(), new_leaves.len());
    // First and last identifiers come back as the same objects.
    assert!(Subtree::ptr_eq(&old_leaves[0].3, &new_leaves[0].3));
    assert!(Subtree::ptr_eq(&old_leaves[2].3, &new_leaves[2].3));
    // The edited middle identifier is fresh.
    assert!(!Subtree::ptr_eq(&old_leaves[1].3, &new_leaves[1].3));
}

#[test]
fn reparse_after_noop_edit_is_identical() {
    let language = words_language();
    let mut parser = parser_for(&language);
    let mut tree = parser.parse_str("aaa bbb", None).unwrap();
    let before = format!("{tree:?}");

    tree.edit(&edit(3, 3, 3));
    let new_tree = parser.parse_str("aaa bbb", Some(&tree)).unwrap();
    assert_eq!(before, format!("{new_tree:?}"));
}

#[test]
fn incremental_parse_matches_parse_from_scratch() {
    let language = words_language();
    let mut parser = parser_for(&language);

    let mut tree = parser.parse_str("aaa bbb ccc", None).unwrap();
    tree.edit(&edit(4, 7, 8));
    let incremental = parser.parse_str("aaa beeb ccc", Some(&tree)).unwrap();
    let scratch = parser.parse_str("aaa beeb ccc", None).unwrap();
    assert_eq!(format!("{scratch:?}"), format!("{incremental:?}"));
    assert_covers(&incremental, "aaa beeb ccc");
}

#[test]
fn halt_on_error_wraps_the_remaining_input() {
    let language = words_language();
    let mut parser = parser_for(&language);
    parser.halt_on_error(true);
    let tree = parser.parse_str("abc 123 def", None).unwrap();
    assert!(tree.error_cost() > 0);
    assert_covers(&tree, "abc 123 def");
    assert_tree(
        &tree,
        expect![[r#"
            ERROR@0..11
                identifier@0..3
                ERROR@4..7
                ERROR@7..11
        "#]],
    );
}

#[test]
fn table_lookups_expose_reduce_actions() {
    let language = words_language();
    assert!(language.has_reduce_action(2, SYM_END));
    assert!(!language.has_reduce_action(3, SYM_END));
    assert!(language.has_actions(3, SYM_END));
}

#[test]
fn tree_comparison_is_antisymmetric() {
    let language = words_language();
    let a = Subtree::make_leaf(WORD_ID, Length::ZERO, pos(3), &language);
    let b = Subtree::make_leaf(WORD_COMMENT, Length::ZERO, pos(3), &language);
    assert_eq!(crate::subtree::compare(&a, &b), Ordering::Less);
    assert_eq!(crate::subtree::compare(&b, &a), Ordering::Greater);
    assert_eq!(crate::subtree::compare(&a, &a), Ordering::Equal);
}

#[test]
fn rejects_an_incompatible_language_version() {
    let language = words_language_with_version(8);
    let mut parser = Parser::new();
    let error = parser.set_language(language).unwrap_err();
    assert_eq!(error.version, 8);
    assert!(error.to_string().contains("not compatible"));
}

#[test]
fn logger_reports_parse_and_lex_events() {
    let language = words_language();
    let mut parser = parser_for(&language);
    let messages: Rc<RefCell<Vec<(LogKind, String)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = messages.clone();
    parser.set_logger(Some(Box::new(move |kind, message| {
        sink.borrow_mut().push((kind, message.to_string()));
    })));

    parser.parse_str("aaa bbb", None).unwrap();
    let messages = messages.borrow();
    assert!(messages.iter().any(|(kind, _)| *kind == LogKind::Lex));
    assert!(messages
        .iter()
        .any(|(kind, message)| *kind == LogKind::Parse && message.starts_with("shift")));
    assert!(messages
        .iter()
        .any(|(kind, message)| *kind == LogKind::Parse && message.starts_with("reduce")));

    // No parse may ever run more than the allowed number of versions.
    for (_, message) in messages.iter() {
        if let Some(rest) = message.strip_prefix("process version:") {
            let version: usize = rest
                .split_whitespace()
                .next()
                .unwrap()
                .parse()
                .unwrap();
            assert!(version < crate::parser::MAX_VERSION_COUNT);
        }
    }
}

// --- "sums" language: expression := number plus number | number -----------

const SUM_NUM: SymbolId = 1;
const SUM_PLUS: SymbolId = 2;
const SUM_EXPR: SymbolId = 3;
const SUM_SOURCE: SymbolId = 4;

fn lex_sums(cursor: &mut LexCursor<'_, '_>, _state: u16) -> bool {
    while matches!(cursor.lookahead(), Some(' ')) {
        cursor.skip();
    }
    match cursor.lookahead() {
        None => {
            cursor.accept(SYM_END);
            true
        }
        Some('+') => {
            cursor.advance();
            cursor.accept(SUM_PLUS);
            true
        }
        Some(c) if c.is_ascii_digit() => {
            while matches!(cursor.lookahead(), Some(c) if c.is_ascii_digit()) {
                cursor.advance();
            }
            cursor.accept(SUM_NUM);
            true
        }
        _ => false,
    }
}

fn sums_language() -> LanguageRef {
    Arc::new(Language {
        name: "sums".to_string(),
        version: crate::language::LANGUAGE_VERSION,
        symbol_count: 5,
        token_count: 3,
        parse_table: table(
            7,
            &[
                (1, SUM_NUM, &[shift(2)]),
                (2, SYM_END, &[reduce(SUM_EXPR, 1)]),
                (2, SUM_PLUS, &[shift(4)]),
                (3, SYM_END, &[reduce(SUM_SOURCE, 1)]),
                (4, SUM_NUM, &[shift(5)]),
                (5, SYM_END, &[reduce(SUM_EXPR, 3)]),
                (6, SYM_END, &[ParseAction::Accept]),
            ],
        ),
        next_states: gotos(
            7,
            &[
                (1, SUM_NUM, 2),
                (1, SUM_EXPR, 3),
                (1, SUM_SOURCE, 6),
                (2, SUM_PLUS, 4),
                (4, SUM_NUM, 5),
            ],
        ),
        lex_modes: plain_lex_modes(7),
        lex_fn: lex_sums,
        keyword_lex_fn: None,
        keyword_capture_token: None,
        external_tokens: None,
        symbols: vec![hidden(), named(), token(), named(), hidden()],
        symbol_names: names(&["end", "number", "plus", "expression", "source"]),
        alias_sequences: vec![Vec::new()],
    })
}

#[test]
fn parses_a_well_formed_sum() {
    let language = sums_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("1 + 2", None).unwrap();
    assert_eq!(tree.error_cost(), 0);
    assert_covers(&tree, "1 + 2");
    assert_tree(
        &tree,
        expect![[r#"
            expression@0..5
                number@0..1
                plus@2..3
                number@4..5
        "#]],
    );
}

#[test]
fn recovers_by_inserting_a_missing_token() {
    let language = sums_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("1 2", None).unwrap();
    assert!(tree.error_cost() > 0);
    assert_covers(&tree, "1 2");
    assert_consistent(&tree.root);
    assert_tree(
        &tree,
        expect![[r#"
            expression@0..3
                number@0..1
                MISSING plus@1..1
                number@2..3
        "#]],
    );

    let leaves = collect_leaves(&tree);
    let missing: Vec<_> = leaves
        .iter()
        .filter(|(_, _, _, leaf)| leaf.is_missing())
        .collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].0, SUM_PLUS);
    assert_eq!(missing[0].3.total_bytes(), 0);
}

// --- "pairs" language: ambiguous parenthesis rules with precedence --------

const PAIR_LPAREN: SymbolId = 1;
const PAIR_RPAREN: SymbolId = 2;
const PAIR_PAIR: SymbolId = 3;
const PAIR_GROUP: SymbolId = 4;
const PAIR_SOURCE: SymbolId = 5;

fn lex_pairs(cursor: &mut LexCursor<'_, '_>, _state: u16) -> bool {
    while matches!(cursor.lookahead(), Some(' ')) {
        cursor.skip();
    }
    match cursor.lookahead() {
        None => {
            cursor.accept(SYM_END);
            true
        }
        Some('(') => {
            cursor.advance();
            cursor.accept(PAIR_LPAREN);
            true
        }
        Some(')') => {
            cursor.advance();
            cursor.accept(PAIR_RPAREN);
            true
        }
        _ => false,
    }
}

fn pairs_language() -> LanguageRef {
    Arc::new(Language {
        name: "pairs".to_string(),
        version: crate::language::LANGUAGE_VERSION,
        symbol_count: 6,
        token_count: 3,
        parse_table: table(
            6,
            &[
                (1, PAIR_LPAREN, &[shift(2)]),
                (2, PAIR_RPAREN, &[shift(3)]),
                (
                    3,
                    SYM_END,
                    &[
                        reduce_prec(PAIR_PAIR, 2, 2),
                        reduce_prec(PAIR_GROUP, 2, 1),
                    ],
                ),
                (4, SYM_END, &[reduce(PAIR_SOURCE, 1)]),
                (5, SYM_END, &[ParseAction::Accept]),
            ],
        ),
        next_states: gotos(
            6,
            &[
                (1, PAIR_LPAREN, 2),
                (2, PAIR_RPAREN, 3),
                (1, PAIR_PAIR, 4),
                (1, PAIR_GROUP, 4),
                (1, PAIR_SOURCE, 5),
            ],
        ),
        lex_modes: plain_lex_modes(6),
        lex_fn: lex_pairs,
        keyword_lex_fn: None,
        keyword_capture_token: None,
        external_tokens: None,
        symbols: vec![hidden(), token(), token(), named(), named(), hidden()],
        symbol_names: names(&["end", "(", ")", "pair", "group", "source"]),
        alias_sequences: vec![Vec::new()],
    })
}

#[test]
fn ambiguity_is_resolved_by_dynamic_precedence() {
    let language = pairs_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("()", None).unwrap();
    assert_eq!(tree.error_cost(), 0);
    assert_covers(&tree, "()");
    // Both rules match; the one with the higher dynamic precedence wins and
    // the root ends up with exactly one (visible) child.
    assert_tree(
        &tree,
        expect![[r#"
            pair@0..2
                (@0..1
                )@1..2
        "#]],
    );
}

// --- "keywords" language: if_statement := "if" identifier -----------------

const KW_IDENT: SymbolId = 1;
const KW_IF: SymbolId = 2;
const KW_STMT: SymbolId = 3;
const KW_SOURCE: SymbolId = 4;

fn lex_idents(cursor: &mut LexCursor<'_, '_>, _state: u16) -> bool {
    while matches!(cursor.lookahead(), Some(' ')) {
        cursor.skip();
    }
    match cursor.lookahead() {
        None => {
            cursor.accept(SYM_END);
            true
        }
        Some(c) if c.is_ascii_alphabetic() => {
            while matches!(cursor.lookahead(), Some(c) if c.is_ascii_alphabetic()) {
                cursor.advance();
            }
            cursor.accept(KW_IDENT);
            true
        }
        _ => false,
    }
}

fn lex_if_keyword(cursor: &mut LexCursor<'_, '_>, _state: u16) -> bool {
    if cursor.lookahead() == Some('i') {
        cursor.advance();
        if cursor.lookahead() == Some('f') {
            cursor.advance();
            cursor.accept(KW_IF);
            return true;
        }
    }
    false
}

fn keywords_language() -> LanguageRef {
    Arc::new(Language {
        name: "keywords".to_string(),
        version: crate::language::LANGUAGE_VERSION,
        symbol_count: 5,
        token_count: 3,
        parse_table: table(
            6,
            &[
                (1, KW_IF, &[shift(2)]),
                (2, KW_IDENT, &[shift(3)]),
                (3, SYM_END, &[reduce(KW_STMT, 2)]),
                (4, SYM_END, &[reduce(KW_SOURCE, 1)]),
                (5, SYM_END, &[ParseAction::Accept]),
            ],
        ),
        next_states: gotos(
            6,
            &[
                (1, KW_IF, 2),
                (2, KW_IDENT, 3),
                (1, KW_STMT, 4),
                (1, KW_SOURCE, 5),
            ],
        ),
        lex_modes: plain_lex_modes(6),
        lex_fn: lex_idents,
        keyword_lex_fn: Some(lex_if_keyword),
        keyword_capture_token: Some(KW_IDENT),
        external_tokens: None,
        symbols: vec![hidden(), named(), token(), named(), hidden()],
        symbol_names: names(&["end", "identifier", "if", "if_statement", "source"]),
        alias_sequences: vec![Vec::new()],
    })
}

#[test]
fn keyword_lexer_reclassifies_captured_words() {
    let language = keywords_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("if x", None).unwrap();
    assert_eq!(tree.error_cost(), 0);
    assert_covers(&tree, "if x");
    assert_tree(
        &tree,
        expect![[r#"
            if_statement@0..4
                if@0..2
                identifier@3..4
        "#]],
    );

    // Each leaf remembers the parse state it was scanned under.
    let leaves = collect_leaves(&tree);
    assert_eq!(leaves[0].0, KW_IF);
    assert_eq!(leaves[0].3.parse_state(), 1);
    assert!(leaves[0].3.is_keyword());
    assert_eq!(leaves[1].0, KW_IDENT);
    assert_eq!(leaves[1].3.parse_state(), 2);
}

// --- "strings" language: string := '"' string_content '"' ----------------

const STR_QUOTE: SymbolId = 1;
const STR_CONTENT: SymbolId = 2;
const STR_STRING: SymbolId = 3;
const STR_SOURCE: SymbolId = 4;

fn lex_strings(cursor: &mut LexCursor<'_, '_>, _state: u16) -> bool {
    while matches!(cursor.lookahead(), Some(' ')) {
        cursor.skip();
    }
    match cursor.lookahead() {
        None => {
            cursor.accept(SYM_END);
            true
        }
        Some('"') => {
            cursor.advance();
            cursor.accept(STR_QUOTE);
            true
        }
        _ => false,
    }
}

struct StringContentScanner {
    last_content_len: u8,
}

impl ExternalScanner for StringContentScanner {
    fn scan(&mut self, cursor: &mut LexCursor<'_, '_>, valid_tokens: &[bool]) -> Option<u16> {
        if !valid_tokens.first().copied().unwrap_or(false) {
            return None;
        }
        let mut len = 0u8;
        while let Some(c) = cursor.lookahead() {
            if c == '"' {
                break;
            }
            cursor.advance();
            len += 1;
        }
        if len == 0 {
            return None;
        }
        cursor.mark_end();
        self.last_content_len = len;
        Some(0)
    }

    fn serialize(&mut self, buffer: &mut [u8]) -> usize {
        buffer[0] = self.last_content_len;
        1
    }

    fn deserialize(&mut self, buffer: &[u8]) {
        self.last_content_len = buffer.first().copied().unwrap_or(0);
    }
}

fn make_string_scanner() -> Box<dyn ExternalScanner> {
    Box::new(StringContentScanner {
        last_content_len: 0,
    })
}

fn strings_language() -> LanguageRef {
    let mut lex_modes = plain_lex_modes(7);
    // Only the state between the quotes may produce the external token.
    lex_modes[2].external_lex_state = 1;
    Arc::new(Language {
        name: "strings".to_string(),
        version: crate::language::LANGUAGE_VERSION,
        symbol_count: 5,
        token_count: 3,
        parse_table: table(
            7,
            &[
                (1, STR_QUOTE, &[shift(2)]),
                (2, STR_CONTENT, &[shift(3)]),
                (3, STR_QUOTE, &[shift(4)]),
                (4, SYM_END, &[reduce(STR_STRING, 3)]),
                (5, SYM_END, &[reduce(STR_SOURCE, 1)]),
                (6, SYM_END, &[ParseAction::Accept]),
            ],
        ),
        next_states: gotos(
            7,
            &[
                (1, STR_QUOTE, 2),
                (2, STR_CONTENT, 3),
                (3, STR_QUOTE, 4),
                (1, STR_STRING, 5),
                (1, STR_SOURCE, 6),
            ],
        ),
        lex_modes,
        lex_fn: lex_strings,
        keyword_lex_fn: None,
        keyword_capture_token: None,
        external_tokens: Some(ExternalTokens {
            states: vec![Vec::new(), vec![true]],
            symbol_map: vec![STR_CONTENT],
            create: make_string_scanner,
        }),
        symbols: vec![hidden(), token(), named(), named(), hidden()],
        symbol_names: names(&["end", "\"", "string_content", "string", "source"]),
        alias_sequences: vec![Vec::new()],
    })
}

#[test]
fn external_scanner_produces_string_contents() {
    let language = strings_language();
    let mut parser = parser_for(&language);
    let tree = parser.parse_str("\"ab\"", None).unwrap();
    assert_eq!(tree.error_cost(), 0);
    assert_covers(&tree, "\"ab\"");
    assert!(tree.root.has_external_tokens());
    assert_tree(
        &tree,
        expect![[r#"
            string@0..4
                "@0..1
                string_content@1..3
                "@3..4
        "#]],
    );

    let leaves = collect_leaves(&tree);
    let content = &leaves[1].3;
    assert_eq!(content.symbol(), STR_CONTENT);
    assert!(content.has_external_tokens());
    assert!(content.external_token_state().is_some());
}

#[test]
fn external_token_is_not_reused_when_its_bytes_change() {
    let language = strings_language();
    let mut parser = parser_for(&language);
    let mut tree = parser.parse_str("\"ab\"", None).unwrap();
    let old_leaves = collect_leaves(&tree);

    tree.edit(&edit(2, 3, 3));
    let new_tree = parser.parse_str("\"ac\"", Some(&tree)).unwrap();
    assert_eq!(new_tree.error_cost(), 0);
    assert_covers(&new_tree, "\"ac\"");

    let new_leaves = collect_leaves(&new_tree);
    // The opening quote is untouched and comes back by identity; the edited
    // content is lexed afresh by the external scanner.
    assert!(Subtree::ptr_eq(&old_leaves[0].3, &new_leaves[0].3));
    assert!(!Subtree::ptr_eq(&old_leaves[1].3, &new_leaves[1].3));
}

#[test]
fn external_scanner_state_round_trips() {
    let mut scanner = make_string_scanner();
    let mut input = StrInput::new("hello\"");
    let mut cursor = LexCursor::new(&mut input, Length::ZERO);
    assert_eq!(scanner.scan(&mut cursor, &[true]), Some(0));

    let mut buffer = [0u8; 8];
    let used = scanner.serialize(&mut buffer);

    let mut restored = make_string_scanner();
    restored.deserialize(&buffer[..used]);
    let mut buffer_again = [0u8; 8];
    let used_again = restored.serialize(&mut buffer_again);
    assert_eq!(&buffer[..used], &buffer_again[..used_again]);
}

// --- "letters" language: document := "a"; "x" lexes but is valid nowhere --

const LET_A: SymbolId = 1;
const LET_X: SymbolId = 2;
const LET_DOC: SymbolId = 3;

fn lex_letters(cursor: &mut LexCursor<'_, '_>, _state: u16) -> bool {
    while matches!(cursor.lookahead(), Some(' ')) {
        cursor.skip();
    }
    match cursor.lookahead() {
        None => {
            cursor.accept(SYM_END);
            true
        }
        Some('a') => {
            cursor.advance();
            cursor.accept(LET_A);
            true
        }
        Some('x') => {
            cursor.advance();
            cursor.accept(LET_X);
            true
        }
        _ => false,
    }
}

fn letters_language() -> LanguageRef {
    Arc::new(Language {
        name: "letters".to_string(),
        version: crate::language::LANGUAGE_VERSION,
        symbol_count: 4,
        token_count: 3,
        parse_table: table(
            4,
            &[
                (1, LET_A, &[shift(2)]),
                (2, SYM_END, &[reduce(LET_DOC, 1)]),
                (3, SYM_END, &[ParseAction::Accept]),
            ],
        ),
        next_states: gotos(4, &[(1, LET_A, 2), (1, LET_DOC, 3)]),
        lex_modes: plain_lex_modes(4),
        lex_fn: lex_letters,
        keyword_lex_fn: None,
        keyword_capture_token: None,
        external_tokens: None,
        symbols: vec![hidden(), token(), token(), named()],
        symbol_names: names(&["end", "a", "x", "document"]),
        alias_sequences: vec![Vec::new()],
    })
}

#[test]
fn skipped_tokens_accumulate_into_an_error_repetition() {
    // No state shifts or reduces on `x`, so neither missing-token insertion
    // nor a summary jump can consume it; the parser must fall back to
    // skipping it into the error repetition.
    let language = letters_language();
    let mut parser = parser_for(&language);

    let one_skip = parser.parse_str("a x", None).unwrap();
    assert!(one_skip.error_cost() > 0);
    assert_covers(&one_skip, "a x");
    assert_consistent(&one_skip.root);
    assert_tree(
        &one_skip,
        expect![[r#"
            ERROR@0..3
                a@0..1
                x@2..3
        "#]],
    );

    let mut repeats = Vec::new();
    find_error_repeats(&one_skip.root, &mut repeats);
    assert_eq!(repeats.len(), 1);
    assert!(repeats[0].error_cost() > 0);
    assert_eq!(repeats[0].children().len(), 1);
    assert_eq!(repeats[0].children()[0].symbol(), LET_X);

    // Skipping a second token must cost strictly more than skipping one.
    let two_skips = parser.parse_str("a x x", None).unwrap();
    assert!(two_skips.error_cost() > one_skip.error_cost());
    assert_covers(&two_skips, "a x x");
    assert_consistent(&two_skips.root);
    assert_tree(
        &two_skips,
        expect![[r#"
            ERROR@0..5
                a@0..1
                x@2..3
                x@4..5
        "#]],
    );

    let mut repeats = Vec::new();
    find_error_repeats(&two_skips.root, &mut repeats);
    assert_eq!(repeats.len(), 2);
    for repeat in &repeats {
        assert!(repeat.error_cost() > 0);
    }
}
