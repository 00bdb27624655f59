use std::fmt;

use triomphe::Arc;

use crate::language::{Language, SymbolId};
use crate::length::Length;
use crate::subtree::Subtree;

/// One text edit, described in both byte offsets and row/column positions.
/// The three positions must agree with the three byte offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputEdit {
    pub start_byte: u32,
    pub old_end_byte: u32,
    pub new_end_byte: u32,
    pub start_position: Length,
    pub old_end_position: Length,
    pub new_end_position: Length,
}

/// A concrete syntax tree covering one input text.
///
/// The caller owns the tree. To reparse after changing the text, apply every
/// edit with [`Tree::edit`] and hand the tree back to
/// [`Parser::parse`](crate::Parser::parse); subtrees whose byte range was not
/// invalidated are reused by identity.
#[derive(Clone)]
pub struct Tree {
    pub(crate) root: Subtree,
    pub(crate) language: Arc<Language>,
}

impl Tree {
    pub(crate) fn new(root: Subtree, language: Arc<Language>) -> Self {
        Self { root, language }
    }

    /// Total extent of the parsed text.
    pub fn size(&self) -> Length {
        self.root.total_size()
    }

    pub fn total_bytes(&self) -> u32 {
        self.root.total_bytes()
    }

    /// Accumulated cost of every skipped span, skipped token and synthesized
    /// token in the tree. Zero means the input parsed cleanly.
    pub fn error_cost(&self) -> u32 {
        self.root.error_cost()
    }

    /// Adjust the tree for one text edit: every node whose range moved is
    /// repositioned, and every node overlapping the edited span (or whose
    /// recorded lookahead reached into it) is marked as changed so the next
    /// incremental parse rebuilds it instead of reusing it.
    pub fn edit(&mut self, edit: &InputEdit) {
        self.root = edit_subtree(&self.root, Length::ZERO, edit);
    }
}

fn length_sub(a: Length, b: Length) -> Length {
    if a.bytes <= b.bytes {
        Length::ZERO
    } else {
        a - b
    }
}

fn edit_subtree(tree: &Subtree, node_start: Length, edit: &InputEdit) -> Subtree {
    let padding_end = node_start + tree.padding();
    let node_end = padding_end + tree.size();
    let scan_end_byte = node_start.bytes + tree.bytes_scanned().max(tree.total_bytes());

    // Relative positions mean nodes on either side of the edit need no
    // adjustment at all; only the overlapped spine changes. The consulted
    // span `[node_start, scan_end)` is exclusive at both seams, except that
    // a pure insertion sitting exactly on the node's start does land in it.
    let ends_before = edit.old_end_byte < node_start.bytes
        || (edit.old_end_byte == node_start.bytes && edit.start_byte != edit.old_end_byte);
    if edit.start_byte >= scan_end_byte || ends_before {
        return tree.clone();
    }

    let mut data = tree.make_copy();
    data.has_changes = true;

    if tree.child_count() == 0 {
        if edit.start_byte < padding_end.bytes {
            if edit.old_end_byte <= padding_end.bytes {
                // The padding absorbs the whole edit.
                data.padding = length_sub(edit.new_end_position, node_start)
                    + length_sub(padding_end, edit.old_end_position);
            } else {
                // The edit runs past the padding into (or beyond) the content.
                data.padding = length_sub(edit.new_end_position, node_start);
                data.size = length_sub(node_end, edit.old_end_position);
            }
        } else if edit.start_byte <= node_end.bytes {
            if edit.old_end_byte <= node_end.bytes {
                data.size = length_sub(edit.new_end_position, padding_end)
                    + length_sub(node_end, edit.old_end_position);
            } else {
                // The tail of this token was deleted; keep the untouched
                // prefix, the rest will be lexed fresh.
                data.size = length_sub(edit.start_position, padding_end);
            }
        }
        // Otherwise only the lookahead span was touched; positions stand.
    } else {
        let mut children = Vec::with_capacity(tree.child_count());
        let mut child_start = node_start;
        for child in tree.children() {
            children.push(edit_subtree(child, child_start, edit));
            child_start += children.last().expect("just pushed").total_size();
        }
        data.set_children(children);
        data.has_changes = true;
    }

    Subtree::new(data)
}

impl fmt::Debug for Tree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_subtree(f, &self.root, &self.language, Length::ZERO, 0, None)
    }
}

fn write_subtree(
    f: &mut fmt::Formatter<'_>,
    tree: &Subtree,
    lang: &Language,
    node_start: Length,
    indent: usize,
    alias: Option<SymbolId>,
) -> fmt::Result {
    let start = node_start + tree.padding();
    let end = start + tree.size();

    let symbol = alias.unwrap_or_else(|| tree.symbol());
    // Error repetitions stay hidden; only their contents are shown, under
    // whichever ERROR node wraps them.
    let visible = alias.is_some() || tree.is_visible() || tree.is_error() || tree.is_missing();

    let child_indent = if visible {
        write!(f, "{:indent$}", "", indent = indent)?;
        if tree.is_missing() {
            writeln!(
                f,
                "MISSING {}@{}..{}",
                lang.symbol_name(symbol),
                start.bytes,
                end.bytes
            )?;
        } else {
            writeln!(
                f,
                "{}@{}..{}",
                lang.symbol_name(symbol),
                start.bytes,
                end.bytes
            )?;
        }
        indent + 4
    } else {
        indent
    };

    let mut child_start = node_start;
    let mut structural_index = 0;
    for child in tree.children() {
        let child_alias = if child.is_extra() {
            None
        } else {
            let alias = lang.alias_at(tree.alias_sequence_id(), structural_index);
            structural_index += 1;
            alias
        };
        write_subtree(f, child, lang, child_start, child_indent, child_alias)?;
        child_start += child.total_size();
    }
    Ok(())
}
