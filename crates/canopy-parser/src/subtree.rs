use std::cmp::Ordering;

use triomphe::Arc;

use crate::language::{Language, LexMode, StateId, SymbolId, SYM_ERROR, SYM_ERROR_REPEAT};
use crate::length::Length;

pub(crate) const ERROR_COST_PER_SKIPPED_TREE: u32 = 100;
pub(crate) const ERROR_COST_PER_SKIPPED_LINE: u32 = 30;
pub(crate) const ERROR_COST_PER_SKIPPED_CHAR: u32 = 1;
pub(crate) const ERROR_COST_PER_MISSING_TREE: u32 = 110;
pub(crate) const ERROR_COST_PER_RECOVERY: u32 = 500;

/// Marks a parse state invalidated by an ambiguous reduction; nodes carrying
/// it are rebuilt rather than reused on a later incremental parse.
pub(crate) const NONE_STATE: StateId = StateId::MAX;

/// Both reserved error symbols: the visible `ERROR` wrapper and the hidden
/// repetition that accumulates skipped tokens. Nodes with either symbol
/// carry the intrinsic per-skip penalty.
fn is_error_symbol(symbol: SymbolId) -> bool {
    symbol == SYM_ERROR || symbol == SYM_ERROR_REPEAT
}

/// The token at the front of a subtree, together with the lex mode under
/// which it was originally tokenized. Reuse is only sound when the mode at
/// the reuse site matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct FirstLeaf {
    pub symbol: SymbolId,
    pub lex_mode: LexMode,
    pub is_keyword: bool,
}

/// The payload of one syntax-tree node. Immutable once wrapped in a
/// [`Subtree`]; all derived fields are computed at construction.
#[derive(Debug, Clone)]
pub(crate) struct SubtreeData {
    pub symbol: SymbolId,
    pub parse_state: StateId,
    pub padding: Length,
    pub size: Length,
    /// How far past its own start this subtree's production looked. Anything
    /// within this span invalidates the subtree for reuse when edited.
    pub bytes_scanned: u32,
    pub error_cost: u32,
    pub dynamic_precedence: i32,
    pub alias_sequence_id: u16,
    pub children: Vec<Subtree>,
    pub first_leaf: FirstLeaf,
    /// First character of an unrecognized span, kept for error leaves.
    pub lookahead_char: Option<char>,
    pub visible: bool,
    pub named: bool,
    pub extra: bool,
    pub fragile_left: bool,
    pub fragile_right: bool,
    pub is_missing: bool,
    pub is_keyword: bool,
    pub has_changes: bool,
    pub has_external_tokens: bool,
    /// Serialized external-scanner state as of the last external token
    /// inside this subtree.
    pub external_token_state: Option<Arc<Vec<u8>>>,
}

impl SubtreeData {
    fn leaf(symbol: SymbolId, padding: Length, size: Length, lang: &Language) -> Self {
        let metadata = lang.symbol_metadata(symbol);
        SubtreeData {
            symbol,
            parse_state: NONE_STATE,
            padding,
            size,
            bytes_scanned: padding.bytes + size.bytes,
            error_cost: 0,
            dynamic_precedence: 0,
            alias_sequence_id: 0,
            children: Vec::new(),
            first_leaf: FirstLeaf {
                symbol,
                lex_mode: LexMode::default(),
                is_keyword: false,
            },
            lookahead_char: None,
            visible: metadata.visible,
            named: metadata.named,
            extra: false,
            fragile_left: false,
            fragile_right: false,
            is_missing: false,
            is_keyword: false,
            has_changes: false,
            has_external_tokens: false,
            external_token_state: None,
        }
    }
}

/// A reference-counted syntax-tree node. Cloning is cheap and shares the
/// node; children are always shared between copies.
#[derive(Debug, Clone)]
pub(crate) struct Subtree(Arc<SubtreeData>);

impl Subtree {
    pub fn new(data: SubtreeData) -> Self {
        Subtree(Arc::new(data))
    }

    /// An ordinary token. The lexer fills in lexing details afterwards via
    /// [`Subtree::make_mut`] before the tree escapes it.
    pub fn make_leaf(symbol: SymbolId, padding: Length, size: Length, lang: &Language) -> Self {
        Subtree::new(SubtreeData::leaf(symbol, padding, size, lang))
    }

    /// A leaf covering a byte span no recognizer accepted.
    pub fn make_error(
        size: Length,
        padding: Length,
        first_error_char: Option<char>,
        lang: &Language,
    ) -> Self {
        let mut data = SubtreeData::leaf(SYM_ERROR, padding, size, lang);
        data.lookahead_char = first_error_char;
        data.fragile_left = true;
        data.fragile_right = true;
        data.error_cost = ERROR_COST_PER_RECOVERY
            + ERROR_COST_PER_SKIPPED_CHAR * size.bytes
            + ERROR_COST_PER_SKIPPED_LINE * size.row;
        Subtree::new(data)
    }

    /// A zero-width token synthesized during recovery to satisfy the grammar.
    pub fn make_missing_leaf(symbol: SymbolId, lang: &Language) -> Self {
        let mut data = SubtreeData::leaf(symbol, Length::ZERO, Length::ZERO, lang);
        data.is_missing = true;
        data.error_cost = ERROR_COST_PER_MISSING_TREE;
        Subtree::new(data)
    }

    /// An internal node. Size, cost, fragility and first-leaf data are all
    /// summarized from the children.
    pub fn make_node(
        symbol: SymbolId,
        children: Vec<Subtree>,
        alias_sequence_id: u16,
        lang: &Language,
    ) -> Self {
        let metadata = lang.symbol_metadata(symbol);
        let mut data = SubtreeData {
            symbol,
            parse_state: NONE_STATE,
            padding: Length::ZERO,
            size: Length::ZERO,
            bytes_scanned: 0,
            error_cost: 0,
            dynamic_precedence: 0,
            alias_sequence_id,
            children: Vec::new(),
            first_leaf: FirstLeaf {
                symbol,
                lex_mode: LexMode::default(),
                is_keyword: false,
            },
            lookahead_char: None,
            visible: metadata.visible,
            named: metadata.named,
            extra: false,
            fragile_left: false,
            fragile_right: false,
            is_missing: false,
            is_keyword: false,
            has_changes: false,
            has_external_tokens: false,
            external_token_state: None,
        };
        data.set_children(children);
        Subtree::new(data)
    }

    /// A shallow clone of this node's payload; children stay shared. The
    /// caller adjusts scalar fields and seals it again with [`Subtree::new`].
    pub fn make_copy(&self) -> SubtreeData {
        (*self.0).clone()
    }

    /// Mutable access for construction-time adjustments, copying the payload
    /// only if the node is already shared.
    pub fn make_mut(&mut self) -> &mut SubtreeData {
        Arc::make_mut(&mut self.0)
    }

    pub fn ptr_eq(a: &Subtree, b: &Subtree) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }

    pub fn symbol(&self) -> SymbolId {
        self.0.symbol
    }

    pub fn parse_state(&self) -> StateId {
        self.0.parse_state
    }

    pub fn padding(&self) -> Length {
        self.0.padding
    }

    pub fn size(&self) -> Length {
        self.0.size
    }

    /// Padding plus content: the whole extent this node accounts for.
    pub fn total_size(&self) -> Length {
        self.0.padding + self.0.size
    }

    pub fn total_bytes(&self) -> u32 {
        self.total_size().bytes
    }

    pub fn bytes_scanned(&self) -> u32 {
        self.0.bytes_scanned
    }

    pub fn error_cost(&self) -> u32 {
        self.0.error_cost
    }

    pub fn dynamic_precedence(&self) -> i32 {
        self.0.dynamic_precedence
    }

    pub fn alias_sequence_id(&self) -> u16 {
        self.0.alias_sequence_id
    }

    pub fn children(&self) -> &[Subtree] {
        &self.0.children
    }

    pub fn child_count(&self) -> usize {
        self.0.children.len()
    }

    pub fn first_leaf(&self) -> FirstLeaf {
        self.0.first_leaf
    }

    pub fn lookahead_char(&self) -> Option<char> {
        self.0.lookahead_char
    }

    pub fn is_error(&self) -> bool {
        self.0.symbol == SYM_ERROR
    }

    pub fn is_error_repeat(&self) -> bool {
        self.0.symbol == SYM_ERROR_REPEAT
    }

    pub fn is_missing(&self) -> bool {
        self.0.is_missing
    }

    pub fn is_keyword(&self) -> bool {
        self.0.is_keyword
    }

    pub fn is_extra(&self) -> bool {
        self.0.extra
    }

    pub fn is_visible(&self) -> bool {
        self.0.visible
    }

    pub fn is_named(&self) -> bool {
        self.0.named
    }

    pub fn is_fragile(&self) -> bool {
        self.0.fragile_left || self.0.fragile_right
    }

    pub fn fragile_left(&self) -> bool {
        self.0.fragile_left
    }

    pub fn fragile_right(&self) -> bool {
        self.0.fragile_right
    }

    pub fn has_changes(&self) -> bool {
        self.0.has_changes
    }

    pub fn has_external_tokens(&self) -> bool {
        self.0.has_external_tokens
    }

    pub fn external_token_state(&self) -> Option<&Arc<Vec<u8>>> {
        self.0.external_token_state.as_ref()
    }
}

impl SubtreeData {
    /// Attach `children` and recompute every summarized field.
    pub fn set_children(&mut self, children: Vec<Subtree>) {
        self.children = children;

        self.padding = Length::ZERO;
        self.size = Length::ZERO;
        self.bytes_scanned = 0;
        self.dynamic_precedence = 0;
        self.has_changes = false;
        self.has_external_tokens = false;
        self.external_token_state = None;

        let is_error = is_error_symbol(self.symbol);
        let mut child_costs = 0;
        let mut skipped_tree_cost = 0;
        let mut offset = Length::ZERO;
        for (i, child) in self.children.iter().enumerate() {
            if i == 0 {
                self.padding = child.padding();
                self.size = child.size();
            } else {
                self.size = (offset + child.total_size()) - self.padding;
            }

            let scan_reach = offset.bytes + child.bytes_scanned();
            if scan_reach > self.bytes_scanned {
                self.bytes_scanned = scan_reach;
            }

            child_costs += child.error_cost();
            if is_error && child.is_visible() {
                skipped_tree_cost += ERROR_COST_PER_SKIPPED_TREE;
            }
            self.dynamic_precedence += child.dynamic_precedence();
            self.has_changes |= child.has_changes();
            if child.has_external_tokens() {
                self.has_external_tokens = true;
                if child.external_token_state().is_some() {
                    self.external_token_state = child.external_token_state().cloned();
                }
            }

            offset += child.total_size();
        }

        self.error_cost = child_costs + skipped_tree_cost;
        if is_error {
            self.error_cost += ERROR_COST_PER_RECOVERY
                + ERROR_COST_PER_SKIPPED_CHAR * self.size.bytes
                + ERROR_COST_PER_SKIPPED_LINE * self.size.row;
            self.fragile_left = true;
            self.fragile_right = true;
        } else {
            if let Some(first) = self.children.first() {
                self.fragile_left = first.fragile_left();
            }
            if let Some(last) = self.children.last() {
                self.fragile_right = last.fragile_right();
            }
        }

        self.first_leaf = self
            .children
            .iter()
            .find(|child| child.total_bytes() > 0)
            .or_else(|| self.children.first())
            .map(|child| child.first_leaf())
            .unwrap_or(FirstLeaf {
                symbol: self.symbol,
                lex_mode: LexMode::default(),
                is_keyword: false,
            });
    }
}

/// A total order over trees used to break ties between equally scored
/// parses: earlier start, then smaller symbol, then children, pairwise.
pub(crate) fn compare(a: &Subtree, b: &Subtree) -> Ordering {
    if Subtree::ptr_eq(a, b) {
        return Ordering::Equal;
    }
    a.padding()
        .bytes
        .cmp(&b.padding().bytes)
        .then_with(|| a.symbol().cmp(&b.symbol()))
        .then_with(|| a.child_count().cmp(&b.child_count()))
        .then_with(|| {
            for (left, right) in a.children().iter().zip(b.children()) {
                let ordering = compare(left, right);
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        })
}
