use triomphe::Arc;

use crate::subtree::Subtree;

#[derive(Clone)]
struct ReuseEntry {
    tree: Subtree,
    child_index: usize,
    byte_index: u32,
}

/// Walks a previous tree in byte order, offering each node as a candidate
/// for reuse by the current parse. Advancing never revisits a node; the
/// cursor only moves forward through the old text.
#[derive(Clone)]
pub(crate) struct ReusableNode {
    stack: Vec<ReuseEntry>,
    last_external_token: Option<Arc<Vec<u8>>>,
}

impl ReusableNode {
    pub fn new(root: Option<Subtree>) -> Self {
        let mut stack = Vec::new();
        if let Some(tree) = root {
            stack.push(ReuseEntry {
                tree,
                child_index: 0,
                byte_index: 0,
            });
        }
        Self {
            stack,
            last_external_token: None,
        }
    }

    pub fn none() -> Self {
        Self::new(None)
    }

    /// The candidate subtree, if any remains.
    pub fn tree(&self) -> Option<&Subtree> {
        self.stack.last().map(|entry| &entry.tree)
    }

    /// Byte at which the candidate begins (including its padding).
    pub fn byte_index(&self) -> u32 {
        self.stack.last().map(|entry| entry.byte_index).unwrap_or(0)
    }

    /// External-scanner state in effect just before the candidate.
    pub fn last_external_token(&self) -> Option<&Arc<Vec<u8>>> {
        self.last_external_token.as_ref()
    }

    /// Replace the candidate with its first child. Fails on leaves.
    pub fn descend(&mut self) -> bool {
        let Some(top) = self.stack.last() else {
            return false;
        };
        let Some(child) = top.tree.children().first().cloned() else {
            return false;
        };
        let byte_index = top.byte_index;
        self.stack.push(ReuseEntry {
            tree: child,
            child_index: 0,
            byte_index,
        });
        true
    }

    /// Move past the candidate to its in-order successor, remembering any
    /// external-scanner state it carried.
    pub fn advance(&mut self) {
        let Some(last) = self.stack.last() else {
            return;
        };
        let next_byte = last.byte_index + last.tree.total_bytes();
        if last.tree.has_external_tokens() {
            if let Some(state) = last.tree.external_token_state() {
                self.last_external_token = Some(state.clone());
            }
        }

        loop {
            let Some(done) = self.stack.pop() else {
                return;
            };
            let Some(parent) = self.stack.last() else {
                return;
            };
            let sibling_index = done.child_index + 1;
            if let Some(sibling) = parent.tree.children().get(sibling_index).cloned() {
                self.stack.push(ReuseEntry {
                    tree: sibling,
                    child_index: sibling_index,
                    byte_index: next_byte,
                });
                return;
            }
        }
    }

    /// Skip exactly the candidate's first leaf: descend to it, then advance.
    /// The rest of the candidate remains available for reuse.
    pub fn advance_past_leaf(&mut self) {
        while self.descend() {}
        self.advance();
    }
}
