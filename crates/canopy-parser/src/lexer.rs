use triomphe::Arc;

use crate::input::Input;
use crate::language::{
    ExternalScanner, Language, StateId, SymbolId, ERROR_STATE, SERIALIZATION_BUFFER_SIZE,
};
use crate::length::Length;
use crate::subtree::Subtree;

/// The character-level interface handed to a language's lex functions and
/// external scanner. It pulls chunks from the [`Input`] on demand and tracks
/// the padding/content split of the token being recognized.
pub struct LexCursor<'p, 'i> {
    input: &'p mut (dyn Input + 'i),
    chunk: Vec<u8>,
    chunk_start: u32,
    start_position: Length,
    token_start: Length,
    token_end: Option<Length>,
    current: Length,
    lookahead: Option<char>,
    result: Option<SymbolId>,
    last_byte_scanned: Option<u32>,
}

impl<'p, 'i> LexCursor<'p, 'i> {
    pub(crate) fn new(input: &'p mut (dyn Input + 'i), position: Length) -> Self {
        let mut cursor = Self {
            input,
            chunk: Vec::new(),
            chunk_start: position.bytes,
            start_position: position,
            token_start: position,
            token_end: None,
            current: position,
            lookahead: None,
            result: None,
            last_byte_scanned: None,
        };
        cursor.refill();
        cursor.decode();
        cursor
    }

    fn refill(&mut self) {
        self.chunk = self.input.read(self.current.bytes).to_vec();
        self.chunk_start = self.current.bytes;
    }

    fn decode(&mut self) {
        let offset = (self.current.bytes - self.chunk_start) as usize;
        if offset >= self.chunk.len() {
            self.refill();
            if self.chunk.is_empty() {
                self.lookahead = None;
                return;
            }
        }
        let offset = (self.current.bytes - self.chunk_start) as usize;
        let bytes = &self.chunk[offset..];
        self.lookahead = match std::str::from_utf8(&bytes[..bytes.len().min(4)]) {
            Ok(text) => text.chars().next(),
            Err(err) if err.valid_up_to() > 0 => {
                std::str::from_utf8(&bytes[..err.valid_up_to()])
                    .expect("validated prefix")
                    .chars()
                    .next()
            }
            // Not valid UTF-8; surface the raw byte so lexing can skip it.
            Err(_) => Some(bytes[0] as char),
        };
        if self.lookahead.is_some() {
            let reach = self.current.bytes;
            self.last_byte_scanned = Some(self.last_byte_scanned.map_or(reach, |b| b.max(reach)));
        }
    }

    /// The next character of the input, or `None` at the end.
    pub fn lookahead(&self) -> Option<char> {
        self.lookahead
    }

    pub fn eof(&self) -> bool {
        self.lookahead.is_none()
    }

    /// Consume the lookahead character into the token.
    pub fn advance(&mut self) {
        if let Some(c) = self.lookahead {
            if c == '\n' {
                self.current.row += 1;
                self.current.column = 0;
            } else {
                self.current.column += c.len_utf8() as u32;
            }
            self.current.bytes += c.len_utf8() as u32;
            self.decode();
        }
    }

    /// Consume the lookahead character as padding preceding the token.
    pub fn skip(&mut self) {
        self.advance();
        self.token_start = self.current;
    }

    /// Remember the current position as the end of the token; the recognizer
    /// may keep reading lookahead past it.
    pub fn mark_end(&mut self) {
        self.token_end = Some(self.current);
    }

    /// Record a recognized token ending at the current position.
    pub fn accept(&mut self, symbol: SymbolId) {
        self.result = Some(symbol);
        self.token_end = Some(self.current);
    }

    pub(crate) fn result(&self) -> Option<SymbolId> {
        self.result
    }

    pub(crate) fn token_start(&self) -> Length {
        self.token_start
    }

    pub(crate) fn token_end(&self) -> Length {
        self.token_end.unwrap_or(self.current)
    }

    pub(crate) fn current_position(&self) -> Length {
        self.current
    }

    pub(crate) fn last_byte_scanned(&self) -> Option<u32> {
        self.last_byte_scanned
    }

    pub(crate) fn padding(&self) -> Length {
        self.token_start - self.start_position
    }
}

/// Single-slot memoization of the most recent token, keyed by position and
/// external-scanner state. Forking versions frequently re-lex the same spot;
/// the cache makes the second ask free.
#[derive(Default)]
pub(crate) struct TokenCache {
    token: Option<Subtree>,
    byte_index: u32,
    external_state: Option<Arc<Vec<u8>>>,
}

impl TokenCache {
    pub fn get(&self, byte_index: u32, external_state: Option<&Arc<Vec<u8>>>) -> Option<Subtree> {
        let token = self.token.as_ref()?;
        if self.byte_index == byte_index
            && external_states_equal(self.external_state.as_ref(), external_state)
        {
            Some(token.clone())
        } else {
            None
        }
    }

    pub fn set(&mut self, token: Subtree, byte_index: u32, external_state: Option<Arc<Vec<u8>>>) {
        self.token = Some(token);
        self.byte_index = byte_index;
        self.external_state = external_state;
    }

    pub fn clear(&mut self) {
        self.token = None;
        self.external_state = None;
    }
}

pub(crate) fn external_states_equal(a: Option<&Arc<Vec<u8>>>, b: Option<&Arc<Vec<u8>>>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a == b,
        // A missing state and an empty serialized state are the same thing.
        (Some(state), None) | (None, Some(state)) => state.is_empty(),
    }
}

/// Run the recognizers at `position` and produce exactly one token tree: a
/// leaf on success, an error leaf spanning every byte no recognizer would
/// take otherwise.
pub(crate) fn lex(
    input: &mut dyn Input,
    lang: &Language,
    external: Option<&mut Box<dyn ExternalScanner>>,
    position: Length,
    last_external_token: Option<&Arc<Vec<u8>>>,
    state: StateId,
) -> Subtree {
    let lex_mode = lang.lex_mode(state);
    let valid_external = lang.enabled_external_tokens(lex_mode.external_lex_state);
    let mut error_mode = state == ERROR_STATE;

    let mut scan_position = position;
    let mut last_byte_scanned: Option<u32> = None;
    let mut first_error_char: Option<char> = None;
    let mut error_start = position;
    let mut error_end = position;
    let mut skipped_error = false;

    let mut external = external;
    let mut found: Option<FoundToken> = None;

    loop {
        // External tokens take precedence when the state allows any.
        if !valid_external.is_empty() {
            if let Some(scanner) = external.as_deref_mut() {
                match last_external_token {
                    Some(state) => scanner.deserialize(state),
                    None => scanner.deserialize(&[]),
                }
                let mut cursor = LexCursor::new(input, scan_position);
                let raw = scanner.scan(&mut cursor, valid_external);
                track_scan(&mut last_byte_scanned, &cursor);
                if let Some(raw) = raw {
                    let consumed = cursor.token_end().bytes > scan_position.bytes;
                    if !error_mode || consumed {
                        let mut buffer = [0u8; SERIALIZATION_BUFFER_SIZE];
                        let used = scanner.serialize(&mut buffer);
                        found = Some(FoundToken {
                            symbol: *lang
                                .external_tokens
                                .as_ref()
                                .expect("external scan without external tokens")
                                .symbol_map
                                .get(raw as usize)
                                .unwrap_or(&0),
                            padding: cursor.padding(),
                            size: cursor.token_end() - cursor.token_start(),
                            is_external: true,
                            external_state: Some(Arc::new(buffer[..used].to_vec())),
                        });
                    }
                }
            }
        }

        let mut failed_token_start = scan_position;
        if found.is_none() {
            let lex_state = if error_mode {
                lang.lex_mode(ERROR_STATE).lex_state
            } else {
                lex_mode.lex_state
            };
            let mut cursor = LexCursor::new(input, scan_position);
            let ok = (lang.lex_fn)(&mut cursor, lex_state);
            track_scan(&mut last_byte_scanned, &cursor);
            // Whatever padding the recognizer skipped stays padding even if
            // the token itself was rejected.
            failed_token_start = cursor.token_start();
            if ok {
                if let Some(symbol) = cursor.result() {
                    found = Some(FoundToken {
                        symbol,
                        padding: cursor.padding(),
                        size: cursor.token_end() - cursor.token_start(),
                        is_external: false,
                        external_state: None,
                    });
                }
            }
        }

        if found.is_some() {
            break;
        }

        if !error_mode {
            // Retry the whole position under the error-recovery lex state.
            error_mode = true;
            scan_position = position;
            continue;
        }

        // Nothing matches here. Extend the error span one character and try
        // again from the next position.
        if !skipped_error {
            skipped_error = true;
            error_start = failed_token_start;
            scan_position = failed_token_start;
        }
        let mut cursor = LexCursor::new(input, scan_position);
        if first_error_char.is_none() {
            first_error_char = cursor.lookahead();
        }
        if cursor.eof() {
            error_end = scan_position;
            break;
        }
        cursor.advance();
        track_scan(&mut last_byte_scanned, &cursor);
        scan_position = cursor.current_position();
        error_end = scan_position;
    }

    if skipped_error {
        // A recognizer finally matched (or we hit the end); everything up to
        // there becomes one error leaf. The matched token is re-lexed by the
        // next call.
        let padding = error_start - position;
        let size = error_end - error_start;
        let mut token = Subtree::make_error(size, padding, first_error_char, lang);
        let data = token.make_mut();
        data.parse_state = state;
        data.first_leaf.lex_mode = lex_mode;
        data.bytes_scanned = bytes_scanned(last_byte_scanned, position);
        return token;
    }

    let mut found = found.expect("loop only exits with a token or an error span");

    // A keyword lexer can re-classify the captured word token, provided it
    // spans exactly the same bytes and the keyword is valid in this state.
    let mut is_keyword = false;
    if !found.is_external && Some(found.symbol) == lang.keyword_capture_token {
        if let Some(keyword_lex_fn) = lang.keyword_lex_fn {
            let token_start = position + found.padding;
            let mut cursor = LexCursor::new(input, token_start);
            let ok = keyword_lex_fn(&mut cursor, 0);
            track_scan(&mut last_byte_scanned, &cursor);
            if ok {
                if let Some(keyword) = cursor.result() {
                    let same_end = cursor.token_end() == token_start + found.size;
                    if same_end && lang.has_actions(state, keyword) {
                        found.symbol = keyword;
                        is_keyword = true;
                    }
                }
            }
        }
    }

    let mut token = Subtree::make_leaf(found.symbol, found.padding, found.size, lang);
    let data = token.make_mut();
    data.parse_state = state;
    data.first_leaf.lex_mode = lex_mode;
    data.first_leaf.is_keyword = is_keyword;
    data.bytes_scanned = bytes_scanned(last_byte_scanned, position);
    data.is_keyword = is_keyword;
    if found.is_external {
        data.has_external_tokens = true;
        data.external_token_state = found.external_state;
    }
    token
}

struct FoundToken {
    symbol: SymbolId,
    padding: Length,
    size: Length,
    is_external: bool,
    external_state: Option<Arc<Vec<u8>>>,
}

fn track_scan(last_byte_scanned: &mut Option<u32>, cursor: &LexCursor<'_, '_>) {
    if let Some(reach) = cursor.last_byte_scanned() {
        *last_byte_scanned = Some(last_byte_scanned.map_or(reach, |b| b.max(reach)));
    }
}

fn bytes_scanned(last_byte_scanned: Option<u32>, start: Length) -> u32 {
    match last_byte_scanned {
        Some(last) => last - start.bytes + 1,
        None => 0,
    }
}
