use std::collections::HashMap;
use std::fmt;

use triomphe::Arc;

use crate::lexer::LexCursor;

pub type SymbolId = u16;
pub type StateId = u16;

/// A shared handle to an immutable language table.
pub type LanguageRef = Arc<Language>;

/// The end-of-input terminal.
pub const SYM_END: SymbolId = 0;
/// Synthetic symbol for error nodes and error leaves.
pub const SYM_ERROR: SymbolId = u16::MAX;
/// Synthetic symbol grouping consecutive skipped tokens during recovery.
pub const SYM_ERROR_REPEAT: SymbolId = u16::MAX - 1;

/// The reserved state in which the parser lexes and shifts while recovering.
pub const ERROR_STATE: StateId = 0;
/// The initial state; also where an accepted root is pushed.
pub const START_STATE: StateId = 1;

/// Table-format version produced by the current table compiler.
pub const LANGUAGE_VERSION: u32 = 9;
/// Oldest table-format version this runtime can still drive.
pub const MIN_COMPATIBLE_LANGUAGE_VERSION: u32 = 9;

/// Size of the scratch buffer shared between the lexer and external-scanner
/// state serialization. Callers must not retain pointers into it across
/// calls; trees embed only the serialized bytes.
pub const SERIALIZATION_BUFFER_SIZE: usize = 1024;

/// One entry in the action table: what the parser may do upon seeing a given
/// terminal in a given state. Several actions at one entry mean the grammar
/// is locally ambiguous and the stack forks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseAction {
    Shift {
        state: StateId,
        is_repetition: bool,
    },
    /// Shift a token that does not participate in grammatical structure
    /// (whitespace, comments). The automaton stays in its current state.
    ShiftExtra,
    Reduce {
        symbol: SymbolId,
        child_count: u32,
        dynamic_precedence: i32,
        alias_sequence_id: u16,
    },
    Accept,
    /// Shift into the error state; emitted by the table for states that can
    /// resume after a skipped-token recovery.
    Recover,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParseTableEntry {
    /// Reductions of larger child count sort before smaller ones.
    pub actions: Vec<ParseAction>,
    /// Whether a token produced under this entry may be reused verbatim by a
    /// later incremental parse reaching the same state.
    pub reusable: bool,
}

/// Lexing configuration for one parse state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LexMode {
    pub lex_state: u16,
    pub external_lex_state: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SymbolMetadata {
    pub visible: bool,
    pub named: bool,
    pub supertype: bool,
}

/// A scanner supplied by the language for tokens the built-in lexer cannot
/// recognize. One payload exists per parser; its state is persisted inside
/// produced trees via `serialize`/`deserialize`.
pub trait ExternalScanner {
    /// Attempt to recognize one of the `valid_tokens` at the cursor.
    /// Returns the raw external token index on success. The raw index is
    /// mapped into the grammar's symbol space through
    /// [`ExternalTokens::symbol_map`].
    fn scan(&mut self, cursor: &mut LexCursor<'_, '_>, valid_tokens: &[bool]) -> Option<u16>;

    /// Write the scanner's current state into `buffer`, returning the number
    /// of bytes used (at most [`SERIALIZATION_BUFFER_SIZE`]).
    fn serialize(&mut self, buffer: &mut [u8]) -> usize;

    /// Restore state previously produced by `serialize`. An empty buffer
    /// resets the scanner to its initial state.
    fn deserialize(&mut self, buffer: &[u8]);
}

pub struct ExternalTokens {
    /// `states[external_lex_state][raw_token]` — which raw external tokens
    /// are valid in each external lex state.
    pub states: Vec<Vec<bool>>,
    /// Raw external token index → grammar symbol.
    pub symbol_map: Vec<SymbolId>,
    /// Creates the per-parser scanner payload; dropped with the parser.
    pub create: fn() -> Box<dyn ExternalScanner>,
}

impl fmt::Debug for ExternalTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalTokens")
            .field("states", &self.states)
            .field("symbol_map", &self.symbol_map)
            .finish_non_exhaustive()
    }
}

/// An immutable language table: everything the runtime needs to drive the LR
/// automaton and the lexer for one grammar.
///
/// Tables are produced ahead of time by a table compiler and may be shared
/// across parsers without synchronization.
#[derive(Debug)]
pub struct Language {
    pub name: String,
    pub version: u32,
    pub symbol_count: u16,
    pub token_count: u16,
    /// `parse_table[state]` maps a terminal to its entry.
    pub parse_table: Vec<HashMap<SymbolId, ParseTableEntry>>,
    /// `next_states[state]` maps a symbol to the GOTO target.
    pub next_states: Vec<HashMap<SymbolId, StateId>>,
    /// Indexed by parse state; entry 0 is the error-recovery lex mode.
    pub lex_modes: Vec<LexMode>,
    pub lex_fn: fn(&mut LexCursor<'_, '_>, u16) -> bool,
    pub keyword_lex_fn: Option<fn(&mut LexCursor<'_, '_>, u16) -> bool>,
    /// The word token that keyword lexing may re-classify.
    pub keyword_capture_token: Option<SymbolId>,
    pub external_tokens: Option<ExternalTokens>,
    /// Indexed by symbol id; the reserved symbols are handled separately.
    pub symbols: Vec<SymbolMetadata>,
    pub symbol_names: Vec<String>,
    /// `alias_sequences[id][child_index]`; id 0 is the empty sequence and
    /// symbol 0 within a sequence means "no alias for this child".
    pub alias_sequences: Vec<Vec<SymbolId>>,
}

impl Language {
    pub fn state_count(&self) -> usize {
        self.parse_table.len()
    }

    pub(crate) fn table_entry(&self, state: StateId, symbol: SymbolId) -> Option<&ParseTableEntry> {
        self.parse_table.get(state as usize)?.get(&symbol)
    }

    pub(crate) fn actions(&self, state: StateId, symbol: SymbolId) -> &[ParseAction] {
        self.table_entry(state, symbol)
            .map(|entry| entry.actions.as_slice())
            .unwrap_or(&[])
    }

    pub(crate) fn has_actions(&self, state: StateId, symbol: SymbolId) -> bool {
        !self.actions(state, symbol).is_empty()
    }

    pub(crate) fn has_reduce_action(&self, state: StateId, symbol: SymbolId) -> bool {
        self.actions(state, symbol)
            .iter()
            .any(|action| matches!(action, ParseAction::Reduce { .. }))
    }

    /// The GOTO function, extended over terminals for recovery probing.
    /// Returns [`ERROR_STATE`] when no transition exists.
    pub(crate) fn next_state(&self, state: StateId, symbol: SymbolId) -> StateId {
        self.next_states
            .get(state as usize)
            .and_then(|map| map.get(&symbol))
            .copied()
            .unwrap_or(ERROR_STATE)
    }

    pub(crate) fn lex_mode(&self, state: StateId) -> LexMode {
        self.lex_modes
            .get(state as usize)
            .copied()
            .unwrap_or_default()
    }

    pub(crate) fn enabled_external_tokens(&self, external_lex_state: u16) -> &[bool] {
        match &self.external_tokens {
            Some(external) if external_lex_state != 0 => external
                .states
                .get(external_lex_state as usize)
                .map(|valid| valid.as_slice())
                .unwrap_or(&[]),
            _ => &[],
        }
    }

    pub fn symbol_metadata(&self, symbol: SymbolId) -> SymbolMetadata {
        match symbol {
            SYM_ERROR => SymbolMetadata {
                visible: true,
                named: true,
                supertype: false,
            },
            SYM_ERROR_REPEAT => SymbolMetadata::default(),
            _ => self
                .symbols
                .get(symbol as usize)
                .copied()
                .unwrap_or_default(),
        }
    }

    pub fn symbol_name(&self, symbol: SymbolId) -> &str {
        match symbol {
            SYM_ERROR => "ERROR",
            SYM_ERROR_REPEAT => "_error_repeat",
            _ => self
                .symbol_names
                .get(symbol as usize)
                .map(String::as_str)
                .unwrap_or("(unknown)"),
        }
    }

    pub(crate) fn alias_at(&self, alias_sequence_id: u16, child_index: usize) -> Option<SymbolId> {
        let sequence = self.alias_sequences.get(alias_sequence_id as usize)?;
        match sequence.get(child_index) {
            Some(&alias) if alias != 0 => Some(alias),
            _ => None,
        }
    }
}
