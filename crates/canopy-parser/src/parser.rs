use std::cmp::Ordering;
use std::fmt;

use triomphe::Arc;

use crate::error::IncompatibleLanguageError;
use crate::input::{Input, StrInput};
use crate::language::{
    ExternalScanner, Language, ParseAction, StateId, SymbolId, ERROR_STATE,
    LANGUAGE_VERSION, MIN_COMPATIBLE_LANGUAGE_VERSION, START_STATE, SYM_END, SYM_ERROR_REPEAT,
};
use crate::lexer::{self, external_states_equal, LexCursor, TokenCache};
use crate::length::Length;
use crate::reuse::ReusableNode;
use crate::stack::{Stack, StackVersion};
use crate::subtree::{
    compare, Subtree, ERROR_COST_PER_RECOVERY, ERROR_COST_PER_SKIPPED_CHAR,
    ERROR_COST_PER_SKIPPED_LINE, ERROR_COST_PER_SKIPPED_TREE, NONE_STATE,
};
use crate::tree::Tree;

pub(crate) const MAX_VERSION_COUNT: usize = 6;
pub(crate) const MAX_SUMMARY_DEPTH: u32 = 16;
pub(crate) const MAX_COST_DIFFERENCE: u32 = 16 * ERROR_COST_PER_SKIPPED_TREE;

/// Which subsystem produced a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Parse,
    Lex,
}

/// Structured log sink; see [`Parser::set_logger`].
pub type Logger = Box<dyn FnMut(LogKind, &str)>;

macro_rules! log {
    ($parser:expr, $kind:expr, $($arg:tt)*) => {
        if let Some(logger) = &mut $parser.logger {
            logger($kind, &format!($($arg)*));
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorComparison {
    TakeLeft,
    PreferLeft,
    None,
    PreferRight,
    TakeRight,
}

#[derive(Debug, Clone, Copy)]
struct ErrorStatus {
    cost: u32,
    node_count: u32,
    dynamic_precedence: i32,
    is_in_error: bool,
}

/// An incremental, error-tolerant GLR parser.
///
/// A parser drives whatever [`Language`] table it was given over a byte
/// [`Input`], producing a [`Tree`] for every input: syntax problems surface
/// as `ERROR` and `MISSING` nodes inside the tree, never as a failed parse.
///
/// ## Example
///
/// ```no_run
/// use canopy_parser::{LanguageRef, Parser};
/// # fn get_language() -> LanguageRef { unimplemented!() }
///
/// let mut parser = Parser::new();
/// parser.set_language(get_language()).unwrap();
/// let tree = parser.parse_str("fn main() {}", None).unwrap();
/// assert_eq!(tree.error_cost(), 0);
/// ```
///
/// A parser is strictly single-threaded: one `parse` call runs to completion
/// on the calling thread. Distinct parsers are independent and may run in
/// parallel, each with its own external-scanner payload.
pub struct Parser {
    language: Option<Arc<Language>>,
    external_payload: Option<Box<dyn ExternalScanner>>,
    stack: Stack,
    token_cache: TokenCache,
    reusable_node: ReusableNode,
    finished_tree: Option<Subtree>,
    accept_count: usize,
    in_ambiguity: bool,
    halt_on_error: bool,
    logger: Option<Logger>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parser")
            .field(
                "language",
                &self.language.as_ref().map(|lang| lang.name.as_str()),
            )
            .field("halt_on_error", &self.halt_on_error)
            .finish_non_exhaustive()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            language: None,
            external_payload: None,
            stack: Stack::new(),
            token_cache: TokenCache::default(),
            reusable_node: ReusableNode::none(),
            finished_tree: None,
            accept_count: 0,
            in_ambiguity: false,
            halt_on_error: false,
            logger: None,
        }
    }

    /// Select the language to parse with. Rejects tables whose format
    /// version this runtime cannot drive; creates the external-scanner
    /// payload when the table declares one.
    pub fn set_language(&mut self, language: Arc<Language>) -> Result<(), IncompatibleLanguageError> {
        if language.version < MIN_COMPATIBLE_LANGUAGE_VERSION || language.version > LANGUAGE_VERSION
        {
            return Err(IncompatibleLanguageError {
                version: language.version,
                minimum: MIN_COMPATIBLE_LANGUAGE_VERSION,
                maximum: LANGUAGE_VERSION,
            });
        }
        self.external_payload = language
            .external_tokens
            .as_ref()
            .map(|external| (external.create)());
        self.language = Some(language);
        Ok(())
    }

    pub fn language(&self) -> Option<&Arc<Language>> {
        self.language.as_ref()
    }

    /// When set, a parse whose best version has a nonzero error cost stops
    /// early and wraps the remaining input under a single error root.
    pub fn halt_on_error(&mut self, halt: bool) {
        self.halt_on_error = halt;
    }

    /// Install (or remove) a structured log sink for parse and lex events.
    pub fn set_logger(&mut self, logger: Option<Logger>) {
        self.logger = logger;
    }

    /// Parse in-memory text. See [`Parser::parse`].
    pub fn parse_str(&mut self, text: &str, old_tree: Option<&Tree>) -> Option<Tree> {
        let mut input = StrInput::new(text);
        self.parse(&mut input, old_tree)
    }

    /// Parse `input`, reusing unchanged subtrees of `old_tree` when one is
    /// supplied (it must have had every edit applied via [`Tree::edit`]).
    ///
    /// Returns `None` only when no language has been set.
    pub fn parse(&mut self, input: &mut dyn Input, old_tree: Option<&Tree>) -> Option<Tree> {
        let lang = self.language.clone()?;

        self.stack.clear();
        self.token_cache.clear();
        self.finished_tree = None;
        self.accept_count = 0;
        self.in_ambiguity = false;
        self.reusable_node = match old_tree {
            Some(tree) => ReusableNode::new(Some(tree.root.clone())),
            None => ReusableNode::none(),
        };

        let mut last_position = Length::ZERO;
        loop {
            let mut cursor = self.reusable_node.clone();
            let mut version = 0;
            while version < self.stack.version_count() {
                if !self.stack.is_active(version) {
                    version += 1;
                    continue;
                }
                cursor = self.reusable_node.clone();
                while self.stack.is_active(version) {
                    log!(
                        self,
                        LogKind::Parse,
                        "process version:{} state:{} row:{} col:{}",
                        version,
                        self.stack.state(version),
                        self.stack.position(version).row,
                        self.stack.position(version).column,
                    );
                    self.advance(version, &mut cursor, input, &lang);
                    let position = self.stack.position(version);
                    if position > last_position || (version > 0 && position == last_position) {
                        last_position = position;
                        break;
                    }
                }
                version += 1;
            }
            self.reusable_node = cursor;

            let min_error_cost = self.condense_stack(&lang);
            if let Some(tree) = &self.finished_tree {
                if tree.error_cost() < min_error_cost {
                    break;
                }
            } else if self.halt_on_error && min_error_cost > 0 {
                self.halt_parse(input, &lang);
                break;
            }

            self.in_ambiguity = self.stack.version_count() > 1;
            let any_active = (0..self.stack.version_count()).any(|v| self.stack.is_active(v));
            if !any_active {
                break;
            }
        }

        if self.finished_tree.is_none() {
            self.halt_parse(input, &lang);
        }
        let root = self
            .finished_tree
            .take()
            .expect("halt_parse always produces a tree");
        log!(self, LogKind::Parse, "done error_cost:{}", root.error_cost());
        self.stack.clear();
        self.reusable_node = ReusableNode::none();
        Some(Tree::new(root, lang))
    }

    // --- lookahead selection ---------------------------------------------

    fn can_reuse_first_leaf(&self, state: StateId, tree: &Subtree, lang: &Language) -> bool {
        let leaf = tree.first_leaf();
        let entry = lang.table_entry(state, leaf.symbol);
        let reusable = entry.map(|entry| entry.reusable).unwrap_or(false);
        if !reusable {
            return false;
        }
        let current_mode = lang.lex_mode(state);
        leaf.lex_mode == current_mode
            || (Some(leaf.symbol) != lang.keyword_capture_token && !leaf.is_keyword)
    }

    fn get_lookahead(
        &mut self,
        version: StackVersion,
        cursor: &mut ReusableNode,
        input: &mut dyn Input,
        lang: &Language,
    ) -> Subtree {
        let position = self.stack.position(version);
        let state = self.stack.state(version);

        // 1. A subtree of the previous parse, if one lines up exactly here.
        while let Some(candidate) = cursor.tree().cloned() {
            let start = cursor.byte_index();
            if start < position.bytes {
                if start + candidate.total_bytes() <= position.bytes || !cursor.descend() {
                    cursor.advance();
                }
                continue;
            }
            if start > position.bytes {
                break;
            }
            if !external_states_equal(
                cursor.last_external_token(),
                self.stack.last_external_token(version),
            ) {
                break;
            }
            let intact = !candidate.has_changes()
                && !candidate.is_error()
                && !candidate.is_error_repeat()
                && !candidate.is_missing()
                && !candidate.fragile_left()
                && !candidate.fragile_right()
                && !(self.in_ambiguity && candidate.child_count() > 0);
            if intact && self.can_reuse_first_leaf(state, &candidate, lang) {
                log!(
                    self,
                    LogKind::Parse,
                    "reuse_node symbol:{} size:{}",
                    lang.symbol_name(candidate.symbol()),
                    candidate.total_bytes()
                );
                return candidate;
            }
            if cursor.descend() {
                continue;
            }
            cursor.advance_past_leaf();
        }

        // 2. The memoized token from another version at the same spot.
        let external = self.stack.last_external_token(version).cloned();
        if let Some(token) = self.token_cache.get(position.bytes, external.as_ref()) {
            if self.can_reuse_first_leaf(state, &token, lang) {
                return token;
            }
        }

        // 3. Run the recognizers.
        log!(self, LogKind::Lex, "lex state:{} byte:{}", state, position.bytes);
        let token = lexer::lex(
            input,
            lang,
            self.external_payload.as_mut(),
            position,
            external.as_ref(),
            state,
        );
        log!(
            self,
            LogKind::Lex,
            "lexed symbol:{} size:{}",
            lang.symbol_name(token.symbol()),
            token.total_bytes()
        );
        self.token_cache
            .set(token.clone(), position.bytes, external);
        token
    }

    // --- the per-version step --------------------------------------------

    fn advance(
        &mut self,
        version: StackVersion,
        cursor: &mut ReusableNode,
        input: &mut dyn Input,
        lang: &Language,
    ) {
        loop {
            let state = self.stack.state(version);
            let mut lookahead = self.get_lookahead(version, cursor, input, lang);
            let lookup_symbol = lookahead.first_leaf().symbol;
            let actions = lang.actions(state, lookup_symbol).to_vec();

            let mut last_reduction_version: Option<StackVersion> = None;
            for action in &actions {
                match *action {
                    ParseAction::Shift {
                        state: next_state,
                        is_repetition,
                    } => {
                        if is_repetition {
                            continue;
                        }
                        let next_state =
                            self.breakdown_lookahead(&mut lookahead, state, next_state, cursor, lang);
                        self.shift(version, next_state, lookahead, false, cursor, lang);
                        return;
                    }
                    ParseAction::ShiftExtra => {
                        // Extra tokens are not shifted while recovering; they
                        // are folded into the surrounding error instead.
                        if state == ERROR_STATE {
                            continue;
                        }
                        let next_state =
                            self.breakdown_lookahead(&mut lookahead, state, state, cursor, lang);
                        self.shift(version, next_state, lookahead, true, cursor, lang);
                        return;
                    }
                    ParseAction::Reduce {
                        symbol,
                        child_count,
                        dynamic_precedence,
                        alias_sequence_id,
                    } => {
                        log!(
                            self,
                            LogKind::Parse,
                            "reduce symbol:{} child_count:{}",
                            lang.symbol_name(symbol),
                            child_count
                        );
                        let is_fragile = actions.len() > 1;
                        let reduction_version = self.reduce(
                            version,
                            symbol,
                            child_count,
                            dynamic_precedence,
                            alias_sequence_id,
                            is_fragile,
                            lang,
                        );
                        last_reduction_version = Some(reduction_version);
                    }
                    ParseAction::Accept => {
                        log!(self, LogKind::Parse, "accept");
                        self.accept(version, lookahead, lang);
                        return;
                    }
                    ParseAction::Recover => {
                        while lookahead.child_count() > 0 && cursor.descend() {
                            lookahead = cursor
                                .tree()
                                .cloned()
                                .expect("descend leaves the cursor on a child");
                        }
                        self.recover(version, lookahead, lang);
                        return;
                    }
                }
            }

            if let Some(reduction_version) = last_reduction_version {
                self.stack.renumber_version(reduction_version, version);
                continue;
            }

            if state == ERROR_STATE {
                self.recover(version, lookahead, lang);
                return;
            }

            if self.breakdown_top_of_stack(version, lang) {
                continue;
            }

            log!(
                self,
                LogKind::Parse,
                "detect_error lookahead:{}",
                lang.symbol_name(lookahead.first_leaf().symbol)
            );
            self.stack.pause(version, lookahead.first_leaf().symbol);
            return;
        }
    }

    /// A reused lookahead may be too coarse for the current state: descend
    /// until its saved parse state matches, then recompute the GOTO target.
    fn breakdown_lookahead(
        &mut self,
        lookahead: &mut Subtree,
        state: StateId,
        next_state: StateId,
        cursor: &mut ReusableNode,
        lang: &Language,
    ) -> StateId {
        if lookahead.child_count() == 0 {
            return next_state;
        }
        while lookahead.child_count() > 0 && lookahead.parse_state() != state {
            if !cursor.descend() {
                break;
            }
            *lookahead = cursor
                .tree()
                .cloned()
                .expect("descend leaves the cursor on a child");
        }
        if lookahead.child_count() > 0 {
            lang.next_state(state, lookahead.symbol())
        } else {
            next_state
        }
    }

    fn shift(
        &mut self,
        version: StackVersion,
        state: StateId,
        mut lookahead: Subtree,
        extra: bool,
        cursor: &mut ReusableNode,
        lang: &Language,
    ) {
        log!(
            self,
            LogKind::Parse,
            "shift symbol:{} state:{}",
            lang.symbol_name(lookahead.symbol()),
            state
        );
        let from_cursor = cursor
            .tree()
            .map(|tree| Subtree::ptr_eq(tree, &lookahead))
            .unwrap_or(false);
        if extra {
            lookahead.make_mut().extra = true;
        }
        let is_pending = lookahead.child_count() > 0;
        if lookahead.has_external_tokens() {
            self.stack.set_last_external_token(
                version,
                lookahead.external_token_state().cloned(),
            );
        }
        self.stack.push(version, Some(lookahead), is_pending, state);
        if from_cursor {
            cursor.advance();
        }
        self.token_cache.clear();
    }

    #[allow(clippy::too_many_arguments)]
    fn reduce(
        &mut self,
        version: StackVersion,
        symbol: SymbolId,
        child_count: u32,
        dynamic_precedence: i32,
        alias_sequence_id: u16,
        is_fragile: bool,
        lang: &Language,
    ) -> StackVersion {
        let initial_version_count = self.stack.version_count();
        let slices = self.stack.pop_count(version, child_count);
        let mut last_version = version;

        let mut i = 0;
        while i < slices.len() {
            let slice = &slices[i];
            let slice_version = slice.version;
            last_version = slice_version;

            let (children, trailing_extras) = strip_trailing_extras(slice.subtrees.clone());
            let mut parent = Subtree::make_node(symbol, children, alias_sequence_id, lang);

            // Paths that rejoined at the same interior node yield alternative
            // child arrays for the same new version; keep the best one.
            while i + 1 < slices.len() && slices[i + 1].version == slice_version {
                i += 1;
                let (children, _) = strip_trailing_extras(slices[i].subtrees.clone());
                let candidate = Subtree::make_node(symbol, children, alias_sequence_id, lang);
                if self.select_tree(&parent, &candidate) {
                    parent = candidate;
                }
            }

            let slice_state = self.stack.state(slice_version);
            let next_state = lang.next_state(slice_state, symbol);
            let fragile = is_fragile
                || self.in_ambiguity
                || slices.len() > 1
                || initial_version_count > 1;
            {
                let data = parent.make_mut();
                data.dynamic_precedence += dynamic_precedence;
                if fragile {
                    data.fragile_left = true;
                    data.fragile_right = true;
                    data.parse_state = NONE_STATE;
                } else {
                    data.parse_state = slice_state;
                }
            }

            self.stack.push(slice_version, Some(parent), false, next_state);
            for extra in trailing_extras {
                self.stack.push(slice_version, Some(extra), false, next_state);
            }
            i += 1;
        }

        for v in MAX_VERSION_COUNT..self.stack.version_count() {
            self.stack.halt(v);
        }

        // Newly forked versions that landed on the same key fold back together.
        let mut v = initial_version_count;
        while v < self.stack.version_count() {
            let mut merged = false;
            for j in initial_version_count..v {
                if self.stack.merge(j, v) {
                    if last_version == v {
                        last_version = j;
                    } else if last_version > v {
                        last_version -= 1;
                    }
                    merged = true;
                    break;
                }
            }
            if !merged {
                v += 1;
            }
        }

        last_version
    }

    fn accept(&mut self, version: StackVersion, mut lookahead: Subtree, lang: &Language) {
        lookahead.make_mut().extra = true;
        self.stack.push(version, Some(lookahead), false, START_STATE);

        let slices = self.stack.pop_all(version);
        for slice in &slices {
            let trees = &slice.subtrees;
            let Some(root_index) = trees.iter().rposition(|tree| !tree.is_extra()) else {
                continue;
            };
            let root = &trees[root_index];
            let mut children = Vec::with_capacity(trees.len() - 1 + root.child_count());
            children.extend(trees[..root_index].iter().cloned());
            children.extend(root.children().iter().cloned());
            children.extend(trees[root_index + 1..].iter().cloned());
            let candidate =
                Subtree::make_node(root.symbol(), children, root.alias_sequence_id(), lang);

            let keep_candidate = match &self.finished_tree {
                Some(existing) => self.select_tree(existing, &candidate),
                None => true,
            };
            if keep_candidate {
                self.finished_tree = Some(candidate);
            }
        }

        self.accept_count += 1;
        if let Some(slice) = slices.first() {
            self.stack.remove_version(slice.version);
        }
        self.stack.halt(version);
    }

    fn breakdown_top_of_stack(&mut self, version: StackVersion, lang: &Language) -> bool {
        let mut did_break_down = false;
        loop {
            let mut pending = false;
            let slices = self.stack.pop_pending(version);
            if slices.is_empty() {
                break;
            }
            did_break_down = true;
            for slice in slices {
                let Some(parent) = slice.subtrees.first() else {
                    continue;
                };
                let mut state = self.stack.state(slice.version);
                for child in parent.children() {
                    let child_pending = child.child_count() > 0;
                    if child.is_error() || child.is_error_repeat() {
                        state = ERROR_STATE;
                    } else if !child.is_extra() {
                        state = lang.next_state(state, child.symbol());
                    }
                    self.stack
                        .push(slice.version, Some(child.clone()), child_pending, state);
                    pending = child_pending;
                }
            }
            if !pending {
                break;
            }
        }
        if did_break_down {
            self.token_cache.clear();
        }
        did_break_down
    }

    // --- tree selection ---------------------------------------------------

    /// Decide between two trees covering the same span: `true` keeps `right`.
    fn select_tree(&self, left: &Subtree, right: &Subtree) -> bool {
        if right.error_cost() < left.error_cost() {
            return true;
        }
        if left.error_cost() < right.error_cost() {
            return false;
        }
        if right.dynamic_precedence() > left.dynamic_precedence() {
            return true;
        }
        if left.dynamic_precedence() > right.dynamic_precedence() {
            return false;
        }
        if left.error_cost() > 0 {
            return false;
        }
        compare(left, right) == Ordering::Greater
    }

    // --- version condensation ---------------------------------------------

    fn version_status(&self, version: StackVersion) -> ErrorStatus {
        let is_in_error =
            self.stack.is_paused(version) || self.stack.state(version) == ERROR_STATE;
        let cost = self.stack.error_cost(version)
            + if is_in_error { ERROR_COST_PER_RECOVERY } else { 0 };
        ErrorStatus {
            cost,
            node_count: self.stack.node_count_since_error(version),
            dynamic_precedence: self.stack.dynamic_precedence(version),
            is_in_error,
        }
    }

    fn compare_versions(&self, a: ErrorStatus, b: ErrorStatus) -> ErrorComparison {
        if !a.is_in_error && b.is_in_error {
            return if a.cost < b.cost {
                ErrorComparison::TakeLeft
            } else {
                ErrorComparison::PreferLeft
            };
        }
        if a.is_in_error && !b.is_in_error {
            return if b.cost < a.cost {
                ErrorComparison::TakeRight
            } else {
                ErrorComparison::PreferRight
            };
        }
        if a.cost < b.cost {
            return if (b.cost - a.cost) * (1 + a.node_count) > MAX_COST_DIFFERENCE {
                ErrorComparison::TakeLeft
            } else {
                ErrorComparison::PreferLeft
            };
        }
        if b.cost < a.cost {
            return if (a.cost - b.cost) * (1 + b.node_count) > MAX_COST_DIFFERENCE {
                ErrorComparison::TakeRight
            } else {
                ErrorComparison::PreferRight
            };
        }
        match a.dynamic_precedence.cmp(&b.dynamic_precedence) {
            Ordering::Greater => ErrorComparison::PreferLeft,
            Ordering::Less => ErrorComparison::PreferRight,
            Ordering::Equal => ErrorComparison::None,
        }
    }

    /// Merge equivalent versions, drop dominated ones, cap the rest, and
    /// resume at most one paused version. Returns the lowest error cost
    /// among surviving versions.
    fn condense_stack(&mut self, lang: &Language) -> u32 {
        let mut min_error_cost = u32::MAX;
        let mut i = 0;
        while i < self.stack.version_count() {
            if self.stack.is_halted(i) {
                self.stack.remove_version(i);
                continue;
            }
            let mut status_i = self.version_status(i);
            if !status_i.is_in_error && status_i.cost < min_error_cost {
                min_error_cost = status_i.cost;
            }

            let mut removed_i = false;
            let mut j = 0;
            while j < i {
                let status_j = self.version_status(j);
                match self.compare_versions(status_j, status_i) {
                    ErrorComparison::TakeLeft => {
                        log!(self, LogKind::Parse, "remove_version:{i}");
                        self.stack.remove_version(i);
                        removed_i = true;
                        break;
                    }
                    ErrorComparison::PreferLeft | ErrorComparison::None => {
                        if self.stack.merge(j, i) {
                            log!(self, LogKind::Parse, "merge version:{i} into:{j}");
                            removed_i = true;
                            break;
                        }
                        j += 1;
                    }
                    ErrorComparison::PreferRight => {
                        if self.stack.merge(j, i) {
                            log!(self, LogKind::Parse, "merge version:{i} into:{j}");
                            removed_i = true;
                            break;
                        }
                        self.stack.swap_versions(j, i);
                        status_i = self.version_status(i);
                        j += 1;
                    }
                    ErrorComparison::TakeRight => {
                        log!(self, LogKind::Parse, "remove_version:{j}");
                        self.stack.remove_version(j);
                        i -= 1;
                    }
                }
            }
            if !removed_i {
                i += 1;
            }
        }

        while self.stack.version_count() > MAX_VERSION_COUNT {
            let last = self.stack.version_count() - 1;
            self.stack.remove_version(last);
        }

        if self.stack.version_count() > 0 {
            let mut has_unpaused_version = false;
            let mut v = 0;
            while v < self.stack.version_count() {
                if self.stack.is_paused(v) {
                    if !has_unpaused_version && self.accept_count < MAX_VERSION_COUNT {
                        log!(self, LogKind::Parse, "resume version:{v}");
                        min_error_cost = min_error_cost.min(self.stack.error_cost(v));
                        let lookahead_symbol = self.stack.resume(v);
                        self.handle_error(v, lookahead_symbol, lang);
                        has_unpaused_version = true;
                    }
                } else {
                    has_unpaused_version = true;
                }
                v += 1;
            }
        }
        min_error_cost
    }

    // --- error recovery ---------------------------------------------------

    /// Fork every reduction the table allows at each relevant version,
    /// regardless of lookahead. Returns whether some resulting version can
    /// shift (or recover on) the lookahead symbol.
    fn do_all_potential_reductions(
        &mut self,
        starting_version: StackVersion,
        lookahead_symbol: Option<SymbolId>,
        lang: &Language,
    ) -> bool {
        let initial_version_count = self.stack.version_count();
        let mut can_shift_lookahead_symbol = false;

        let mut version = starting_version;
        loop {
            if version >= self.stack.version_count() {
                break;
            }
            if !self.stack.is_active(version) {
                version = if version == starting_version {
                    initial_version_count
                } else {
                    version + 1
                };
                continue;
            }
            let mut merged = false;
            for j in initial_version_count..version {
                if self.stack.merge(j, version) {
                    merged = true;
                    break;
                }
            }
            if merged {
                continue;
            }

            let state = self.stack.state(version);
            let mut has_shift_action = false;
            let mut reduce_actions: Vec<(SymbolId, u32, i32, u16)> = Vec::new();
            let (first, end) = match lookahead_symbol {
                Some(symbol) => (symbol, symbol + 1),
                None => (1, lang.token_count),
            };
            for symbol in first..end {
                for action in lang.actions(state, symbol) {
                    match *action {
                        // Both Shift and Recover make the lookahead
                        // consumable, so both count as shift-capable here.
                        ParseAction::Shift { is_repetition, .. } => {
                            if !is_repetition {
                                has_shift_action = true;
                            }
                        }
                        ParseAction::Recover => has_shift_action = true,
                        ParseAction::Reduce {
                            symbol,
                            child_count,
                            dynamic_precedence,
                            alias_sequence_id,
                        } if child_count > 0 => {
                            let entry = (symbol, child_count, dynamic_precedence, alias_sequence_id);
                            if !reduce_actions.contains(&entry) {
                                reduce_actions.push(entry);
                            }
                        }
                        _ => {}
                    }
                }
            }

            // Each reduce forks: the popped paths become new versions while
            // this version's head stays put.
            for (symbol, child_count, dynamic_precedence, alias_sequence_id) in reduce_actions {
                self.reduce(
                    version,
                    symbol,
                    child_count,
                    dynamic_precedence,
                    alias_sequence_id,
                    true,
                    lang,
                );
            }

            if has_shift_action {
                can_shift_lookahead_symbol = true;
            }

            version = if version == starting_version {
                initial_version_count
            } else {
                version + 1
            };
        }
        can_shift_lookahead_symbol
    }

    /// A version ran out of actions: collapse the stack by every possible
    /// reduction, try to buy progress with a synthesized missing token, then
    /// mark the discontinuity and remember the spine for later recovery.
    fn handle_error(
        &mut self,
        version: StackVersion,
        lookahead_symbol: SymbolId,
        lang: &Language,
    ) {
        let before_reductions = self.stack.version_count();
        self.do_all_potential_reductions(version, None, lang);
        let after_reductions = self.stack.version_count();

        let mut did_insert_missing = false;
        let mut v = version;
        loop {
            if !did_insert_missing {
                let state = self.stack.state(v);
                for missing in 1..lang.token_count {
                    let state_after = lang.next_state(state, missing);
                    if state_after == ERROR_STATE || state_after == state {
                        continue;
                    }
                    if !lang.has_actions(state_after, lookahead_symbol) {
                        continue;
                    }
                    let attempt = self.stack.copy_version(v);
                    let missing_tree = Subtree::make_missing_leaf(missing, lang);
                    self.stack.push(attempt, Some(missing_tree), false, state_after);
                    if self.do_all_potential_reductions(attempt, Some(lookahead_symbol), lang) {
                        log!(
                            self,
                            LogKind::Parse,
                            "insert_missing symbol:{}",
                            lang.symbol_name(missing)
                        );
                        did_insert_missing = true;
                        break;
                    }
                    // The insertion bought nothing; discard it and its forks.
                    while self.stack.version_count() > attempt {
                        self.stack.remove_version(self.stack.version_count() - 1);
                    }
                }
            }

            self.stack.push(v, None, false, ERROR_STATE);
            v = if v == version { before_reductions } else { v + 1 };
            if v >= after_reductions {
                break;
            }
        }

        // Fold every discontinuity head back into the original version.
        let mut remaining = after_reductions - before_reductions;
        let mut index = before_reductions;
        while remaining > 0 && index < self.stack.version_count() {
            if !self.stack.merge(version, index) {
                index += 1;
            }
            remaining -= 1;
        }

        self.stack.record_summary(version, MAX_SUMMARY_DEPTH);
    }

    fn better_version_exists(&self, version: StackVersion, cost: u32) -> bool {
        let status = ErrorStatus {
            cost,
            node_count: self.stack.node_count_since_error(version),
            dynamic_precedence: self.stack.dynamic_precedence(version),
            is_in_error: false,
        };
        for v in 0..self.stack.version_count() {
            if v == version || self.stack.is_halted(v) {
                continue;
            }
            let other = self.version_status(v);
            if self.compare_versions(other, status) == ErrorComparison::TakeLeft {
                return true;
            }
        }
        false
    }

    /// In the error state with a lookahead in hand: either jump back to a
    /// summarized state that can consume it, finish at end of input, or skip
    /// the token into the growing error subtree.
    fn recover(&mut self, version: StackVersion, lookahead: Subtree, lang: &Language) {
        let previous_version_count = self.stack.version_count();
        let position = self.stack.position(version);
        let node_count_since_error = self.stack.node_count_since_error(version);
        let current_error_cost = self.stack.error_cost(version);

        let mut did_recover = false;
        if !lookahead.is_error() && !lookahead.is_error_repeat() {
            let summary = self.stack.get_summary(version).to_vec();
            for entry in summary {
                if entry.state == ERROR_STATE {
                    continue;
                }
                if entry.position.bytes == position.bytes {
                    continue;
                }
                let mut depth = entry.depth;
                if node_count_since_error > 0 {
                    depth += 1;
                }

                let mut would_merge = false;
                for v in 0..previous_version_count {
                    if v != version
                        && self.stack.is_active(v)
                        && self.stack.state(v) == entry.state
                        && self.stack.position(v).bytes == position.bytes
                    {
                        would_merge = true;
                        break;
                    }
                }
                if would_merge {
                    continue;
                }

                let new_cost = current_error_cost
                    + depth * ERROR_COST_PER_SKIPPED_TREE
                    + (position.bytes - entry.position.bytes) * ERROR_COST_PER_SKIPPED_CHAR
                    + (position.row - entry.position.row) * ERROR_COST_PER_SKIPPED_LINE;
                if self.better_version_exists(version, new_cost) {
                    break;
                }

                if lang.has_actions(entry.state, lookahead.first_leaf().symbol)
                    && self.recover_to_state(version, depth, entry.state, lang)
                {
                    log!(
                        self,
                        LogKind::Parse,
                        "recover_to_previous state:{} depth:{}",
                        entry.state,
                        depth
                    );
                    did_recover = true;
                    break;
                }
            }
        }

        // recover_to_state may leave behind heads that went nowhere.
        let mut v = previous_version_count;
        while v < self.stack.version_count() {
            if !self.stack.is_active(v) {
                self.stack.remove_version(v);
            } else {
                v += 1;
            }
        }
        if did_recover {
            return;
        }

        if lookahead.symbol() == SYM_END {
            log!(self, LogKind::Parse, "recover_eof");
            let error = Subtree::make_node(crate::language::SYM_ERROR, Vec::new(), 0, lang);
            self.stack.push(version, Some(error), false, START_STATE);
            self.accept(version, lookahead, lang);
            return;
        }

        log!(
            self,
            LogKind::Parse,
            "skip_token symbol:{}",
            lang.symbol_name(lookahead.first_leaf().symbol)
        );
        let mut children = Vec::new();
        if node_count_since_error > 0 {
            let mut slices = self.stack.pop_count(version, 1);
            if !slices.is_empty() {
                let first_version = slices[0].version;
                self.stack.renumber_version(first_version, version);
                children.extend(slices.remove(0).subtrees);
                // Alternate error paths are abandoned.
                let mut leftovers: Vec<StackVersion> = slices
                    .iter()
                    .map(|slice| {
                        if slice.version > first_version {
                            slice.version - 1
                        } else {
                            slice.version
                        }
                    })
                    .collect();
                leftovers.sort_unstable();
                leftovers.dedup();
                for v in leftovers.into_iter().rev() {
                    self.stack.remove_version(v);
                }
            }
        }
        let has_external = lookahead.has_external_tokens();
        let external_state = lookahead.external_token_state().cloned();
        children.push(lookahead);
        let error_repeat = Subtree::make_node(SYM_ERROR_REPEAT, children, 0, lang);
        self.stack.push(version, Some(error_repeat), false, ERROR_STATE);
        if has_external {
            self.stack.set_last_external_token(version, external_state);
        }
        self.token_cache.clear();
    }

    /// Pop `depth` trees and resume at `goal_state`, wrapping everything
    /// popped into an extra error node so the text stays covered.
    fn recover_to_state(
        &mut self,
        version: StackVersion,
        depth: u32,
        goal_state: StateId,
        lang: &Language,
    ) -> bool {
        let slices = self.stack.pop_count(version, depth);
        let mut success = false;
        let mut seen_versions: Vec<StackVersion> = Vec::new();
        let mut first_good: Option<StackVersion> = None;

        for slice in slices {
            if seen_versions.contains(&slice.version) {
                continue;
            }
            seen_versions.push(slice.version);

            if self.stack.state(slice.version) != goal_state {
                self.stack.halt(slice.version);
                continue;
            }

            let mut subtrees = slice.subtrees;
            // A previous recovery may have left an error node on top of the
            // goal state; fold its children in so errors stay contiguous.
            if let Some(existing_error) = self.stack.pop_error(slice.version) {
                let mut merged = Vec::with_capacity(existing_error.child_count() + subtrees.len());
                merged.extend(existing_error.children().iter().cloned());
                merged.append(&mut subtrees);
                subtrees = merged;
            }

            let (error_children, trailing_extras) = strip_trailing_extras(subtrees);
            if !error_children.is_empty() {
                let mut error =
                    Subtree::make_node(crate::language::SYM_ERROR, error_children, 0, lang);
                error.make_mut().extra = true;
                self.stack.push(slice.version, Some(error), false, goal_state);
            }
            for extra in trailing_extras {
                self.stack.push(slice.version, Some(extra), false, goal_state);
            }
            if first_good.is_none() {
                first_good = Some(slice.version);
            }
            success = true;
        }
        if let Some(good) = first_good {
            self.stack.renumber_version(good, version);
        }
        success
    }

    /// Give up on further recovery: consume the rest of the input into one
    /// error node under an error root and accept.
    fn halt_parse(&mut self, input: &mut dyn Input, lang: &Language) {
        log!(self, LogKind::Parse, "halting_parse");
        if self.stack.version_count() == 0 {
            self.stack.clear();
        }
        let position = self.stack.position(0);
        let mut cursor = LexCursor::new(input, position);
        while !cursor.eof() {
            cursor.advance();
        }
        let end = cursor.current_position();
        let remaining = end - position;
        if !remaining.is_zero() {
            let filler = Subtree::make_error(remaining, Length::ZERO, None, lang);
            self.stack.push(0, Some(filler), false, ERROR_STATE);
        }
        let error_root = Subtree::make_node(crate::language::SYM_ERROR, Vec::new(), 0, lang);
        self.stack.push(0, Some(error_root), false, ERROR_STATE);
        let eof = Subtree::make_leaf(SYM_END, Length::ZERO, Length::ZERO, lang);
        self.accept(0, eof, lang);
    }
}

fn strip_trailing_extras(mut subtrees: Vec<Subtree>) -> (Vec<Subtree>, Vec<Subtree>) {
    let mut trailing = Vec::new();
    while subtrees.last().map(|tree| tree.is_extra()).unwrap_or(false) {
        trailing.push(subtrees.pop().expect("checked non-empty"));
    }
    trailing.reverse();
    (subtrees, trailing)
}
