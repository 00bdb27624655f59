use std::cell::{Cell, RefCell};
use std::rc::Rc;

use triomphe::Arc;

use crate::language::{StateId, SymbolId, ERROR_STATE, START_STATE};
use crate::length::Length;
use crate::lexer::external_states_equal;
use crate::subtree::Subtree;

pub(crate) type StackVersion = usize;

/// One node of the stack DAG. Links point backwards, head to predecessor,
/// so sharing after forks and merges can never form a cycle.
pub(crate) struct StackNode {
    state: StateId,
    position: Length,
    links: RefCell<Vec<StackLink>>,
    /// Nodes pushed on the cheapest path from the root to here.
    node_count: Cell<u32>,
    error_cost: Cell<u32>,
    dynamic_precedence: Cell<i32>,
}

pub(crate) struct StackLink {
    node: Rc<StackNode>,
    /// `None` marks a discontinuity inserted by error recovery.
    subtree: Option<Subtree>,
    is_pending: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum HeadStatus {
    Active,
    Paused,
    Halted,
}

struct StackHead {
    node: Rc<StackNode>,
    status: HeadStatus,
    last_external_token: Option<Arc<Vec<u8>>>,
    summary: Option<Vec<StackSummaryEntry>>,
    node_count_at_last_error: u32,
    lookahead_when_paused: Option<SymbolId>,
}

impl StackHead {
    fn copy(&self) -> StackHead {
        StackHead {
            node: self.node.clone(),
            status: self.status,
            last_external_token: self.last_external_token.clone(),
            summary: None,
            node_count_at_last_error: self.node_count_at_last_error,
            lookahead_when_paused: self.lookahead_when_paused,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StackSummaryEntry {
    pub position: Length,
    pub depth: u32,
    pub state: StateId,
}

/// One group of subtrees popped off a version; several slices share a
/// version when distinct paths rejoined at the same interior node.
pub(crate) struct StackSlice {
    pub version: StackVersion,
    pub subtrees: Vec<Subtree>,
}

fn root_node() -> Rc<StackNode> {
    Rc::new(StackNode {
        state: START_STATE,
        position: Length::ZERO,
        links: RefCell::new(Vec::new()),
        node_count: Cell::new(0),
        error_cost: Cell::new(0),
        dynamic_precedence: Cell::new(0),
    })
}

/// Merge `link` into `node`'s predecessors, deduplicating identical links
/// and rejoining predecessors that carry the same automaton key.
fn add_link(node: &Rc<StackNode>, link: StackLink) {
    if Rc::ptr_eq(node, &link.node) {
        return;
    }
    let mut transitive: Option<Rc<StackNode>> = None;
    {
        let links = node.links.borrow();
        for existing in links.iter() {
            if Rc::ptr_eq(&existing.node, &link.node) {
                match (&existing.subtree, &link.subtree) {
                    (Some(a), Some(b)) if Subtree::ptr_eq(a, b) => return,
                    (None, None) => return,
                    _ => {}
                }
            } else if existing.node.state == link.node.state
                && existing.node.position == link.node.position
            {
                transitive = Some(existing.node.clone());
                break;
            }
        }
    }
    if let Some(target) = transitive {
        let incoming = link.node.links.borrow().len();
        for i in 0..incoming {
            let sublink = {
                let links = link.node.links.borrow();
                StackLink {
                    node: links[i].node.clone(),
                    subtree: links[i].subtree.clone(),
                    is_pending: links[i].is_pending,
                }
            };
            add_link(&target, sublink);
        }
        return;
    }

    if node.error_cost.get() > link.node.error_cost.get() {
        node.error_cost.set(link.node.error_cost.get());
    }
    if node.node_count.get() < link.node.node_count.get() {
        node.node_count.set(link.node.node_count.get());
    }
    node.links.borrow_mut().push(link);
}

/// The Graph-Structured Stack: a DAG of LR states with trees on its edges,
/// addressed through numbered versions, one per live head.
pub(crate) struct Stack {
    heads: Vec<StackHead>,
}

impl Stack {
    pub fn new() -> Self {
        let mut stack = Stack { heads: Vec::new() };
        stack.clear();
        stack
    }

    /// Drop every version and start over with a single active head in the
    /// initial state.
    pub fn clear(&mut self) {
        self.heads.clear();
        self.heads.push(StackHead {
            node: root_node(),
            status: HeadStatus::Active,
            last_external_token: None,
            summary: None,
            node_count_at_last_error: 0,
            lookahead_when_paused: None,
        });
    }

    pub fn version_count(&self) -> usize {
        self.heads.len()
    }

    pub fn state(&self, version: StackVersion) -> StateId {
        self.heads[version].node.state
    }

    pub fn position(&self, version: StackVersion) -> Length {
        self.heads[version].node.position
    }

    pub fn error_cost(&self, version: StackVersion) -> u32 {
        self.heads[version].node.error_cost.get()
    }

    pub fn dynamic_precedence(&self, version: StackVersion) -> i32 {
        self.heads[version].node.dynamic_precedence.get()
    }

    pub fn node_count_since_error(&self, version: StackVersion) -> u32 {
        let head = &self.heads[version];
        head.node
            .node_count
            .get()
            .saturating_sub(head.node_count_at_last_error)
    }

    pub fn is_active(&self, version: StackVersion) -> bool {
        self.heads[version].status == HeadStatus::Active
    }

    pub fn is_paused(&self, version: StackVersion) -> bool {
        self.heads[version].status == HeadStatus::Paused
    }

    pub fn is_halted(&self, version: StackVersion) -> bool {
        self.heads[version].status == HeadStatus::Halted
    }

    pub fn last_external_token(&self, version: StackVersion) -> Option<&Arc<Vec<u8>>> {
        self.heads[version].last_external_token.as_ref()
    }

    pub fn set_last_external_token(&mut self, version: StackVersion, token: Option<Arc<Vec<u8>>>) {
        self.heads[version].last_external_token = token;
    }

    /// Push one tree (or a recovery discontinuity) onto a version.
    pub fn push(
        &mut self,
        version: StackVersion,
        subtree: Option<Subtree>,
        is_pending: bool,
        state: StateId,
    ) {
        let head = &mut self.heads[version];
        let previous = head.node.clone();
        let is_discontinuity = subtree.is_none();
        let position = match &subtree {
            Some(tree) => previous.position + tree.total_size(),
            None => previous.position,
        };
        let (cost, precedence) = match &subtree {
            Some(tree) => (tree.error_cost(), tree.dynamic_precedence()),
            None => (0, 0),
        };
        let node = Rc::new(StackNode {
            state,
            position,
            node_count: Cell::new(previous.node_count.get() + 1),
            error_cost: Cell::new(previous.error_cost.get() + cost),
            dynamic_precedence: Cell::new(previous.dynamic_precedence.get() + precedence),
            links: RefCell::new(vec![StackLink {
                node: previous,
                subtree,
                is_pending,
            }]),
        });
        if state == ERROR_STATE && is_discontinuity {
            head.node_count_at_last_error = node.node_count.get();
        }
        head.node = node;
    }

    /// All distinct paths of `count` grammatical trees below a version's
    /// head. Extra trees and recovery discontinuities ride along without
    /// counting. The popped-from head is left in place: every path tail
    /// becomes a new version appended after the existing ones, and the
    /// caller commits by renumbering (or removing) versions.
    pub fn pop_count(&mut self, version: StackVersion, count: u32) -> Vec<StackSlice> {
        self.pop_paths(version, |trees, _| {
            if trees < count {
                PathStep::Continue
            } else {
                PathStep::Stop
            }
        })
    }

    /// Pop only the top entries that were pushed as pending breakdowns.
    /// The first resulting path replaces `version` itself.
    pub fn pop_pending(&mut self, version: StackVersion) -> Vec<StackSlice> {
        let head_snapshot = self.heads[version].copy();
        let link_count = head_snapshot.node.links.borrow().len();
        let mut slices: Vec<StackSlice> = Vec::new();
        let mut assigned: Vec<(Rc<StackNode>, StackVersion)> = Vec::new();

        for i in 0..link_count {
            let pending_link = {
                let links = head_snapshot.node.links.borrow();
                let link = &links[i];
                match (&link.subtree, link.is_pending) {
                    (Some(tree), true) => Some((link.node.clone(), tree.clone())),
                    _ => None,
                }
            };
            let Some((target, tree)) = pending_link else {
                continue;
            };
            let existing = assigned
                .iter()
                .find(|(node, _)| Rc::ptr_eq(node, &target))
                .map(|(_, v)| *v);
            let slice_version = match existing {
                Some(v) => v,
                None => {
                    let mut copy = head_snapshot.copy();
                    copy.node = target.clone();
                    self.heads.push(copy);
                    let v = self.heads.len() - 1;
                    assigned.push((target, v));
                    v
                }
            };
            slices.push(StackSlice {
                version: slice_version,
                subtrees: vec![tree],
            });
        }

        if let Some(first_version) = slices.first().map(|slice| slice.version) {
            self.renumber_version(first_version, version);
            for slice in &mut slices {
                if slice.version == first_version {
                    slice.version = version;
                } else if slice.version > first_version {
                    slice.version -= 1;
                }
            }
        }
        slices
    }

    /// Pop every path all the way to the stack root.
    pub fn pop_all(&mut self, version: StackVersion) -> Vec<StackSlice> {
        self.pop_paths(version, |_, node| {
            if node.links.borrow().is_empty() {
                PathStep::Stop
            } else {
                PathStep::Continue
            }
        })
    }

    /// Pop the top entry if it is an error tree, returning it. Used to fold
    /// consecutive skipped tokens into one error subtree.
    pub fn pop_error(&mut self, version: StackVersion) -> Option<Subtree> {
        let head_node = self.heads[version].node.clone();
        let is_error = {
            let links = head_node.links.borrow();
            links.len() == 1
                && links[0]
                    .subtree
                    .as_ref()
                    .map(|tree| tree.is_error())
                    .unwrap_or(false)
        };
        if !is_error {
            return None;
        }
        let mut slices = self.pop_count(version, 1);
        debug_assert_eq!(slices.len(), 1);
        let slice_version = slices[0].version;
        self.renumber_version(slice_version, version);
        slices.pop().and_then(|mut slice| slice.subtrees.pop())
    }

    pub fn copy_version(&mut self, version: StackVersion) -> StackVersion {
        let copy = self.heads[version].copy();
        self.heads.push(copy);
        self.heads.len() - 1
    }

    /// Combine two versions whose automaton keys agree: the losing head's
    /// predecessor links fold into the kept head and the version disappears.
    pub fn merge(&mut self, left: StackVersion, right: StackVersion) -> bool {
        if !self.can_merge(left, right) {
            return false;
        }
        let right_node = self.heads[right].node.clone();
        let left_node = self.heads[left].node.clone();
        let link_count = right_node.links.borrow().len();
        for i in 0..link_count {
            let link = {
                let links = right_node.links.borrow();
                StackLink {
                    node: links[i].node.clone(),
                    subtree: links[i].subtree.clone(),
                    is_pending: links[i].is_pending,
                }
            };
            add_link(&left_node, link);
        }
        self.remove_version(right);
        true
    }

    pub fn can_merge(&self, left: StackVersion, right: StackVersion) -> bool {
        let a = &self.heads[left];
        let b = &self.heads[right];
        a.status == HeadStatus::Active
            && b.status == HeadStatus::Active
            && a.node.state == b.node.state
            && a.node.position == b.node.position
            && external_states_equal(
                a.last_external_token.as_ref(),
                b.last_external_token.as_ref(),
            )
    }

    pub fn halt(&mut self, version: StackVersion) {
        self.heads[version].status = HeadStatus::Halted;
    }

    pub fn pause(&mut self, version: StackVersion, lookahead: SymbolId) {
        let head = &mut self.heads[version];
        head.status = HeadStatus::Paused;
        head.lookahead_when_paused = Some(lookahead);
    }

    pub fn resume(&mut self, version: StackVersion) -> SymbolId {
        let head = &mut self.heads[version];
        debug_assert_eq!(head.status, HeadStatus::Paused);
        head.status = HeadStatus::Active;
        head.lookahead_when_paused
            .take()
            .expect("resumed a version that was never paused")
    }

    pub fn remove_version(&mut self, version: StackVersion) {
        self.heads.remove(version);
    }

    /// Move version `source` into slot `target`, discarding what was there.
    pub fn renumber_version(&mut self, source: StackVersion, target: StackVersion) {
        if source == target {
            return;
        }
        debug_assert!(source > target);
        let head = self.heads.remove(source);
        self.heads[target] = head;
    }

    pub fn swap_versions(&mut self, left: StackVersion, right: StackVersion) {
        self.heads.swap(left, right);
    }

    /// Record the spine of states above this head, up to `max_depth` trees
    /// deep, for later recovery jumps.
    pub fn record_summary(&mut self, version: StackVersion, max_depth: u32) {
        let mut summary = Vec::new();
        let mut visit = vec![(self.heads[version].node.clone(), 0u32)];
        while let Some((node, depth)) = visit.pop() {
            let entry = StackSummaryEntry {
                position: node.position,
                depth,
                state: node.state,
            };
            if !summary.contains(&entry) {
                summary.push(entry);
            }
            if depth == max_depth {
                continue;
            }
            for link in node.links.borrow().iter() {
                let next_depth = depth + u32::from(link.subtree.is_some());
                visit.push((link.node.clone(), next_depth));
            }
        }
        self.heads[version].summary = Some(summary);
    }

    pub fn get_summary(&self, version: StackVersion) -> &[StackSummaryEntry] {
        self.heads[version]
            .summary
            .as_deref()
            .unwrap_or(&[])
    }

    fn pop_paths(
        &mut self,
        version: StackVersion,
        keep_going: impl Fn(u32, &Rc<StackNode>) -> PathStep,
    ) -> Vec<StackSlice> {
        struct Path {
            node: Rc<StackNode>,
            subtrees: Vec<Subtree>,
            tree_count: u32,
        }

        let head_snapshot = self.heads[version].copy();
        let mut finished: Vec<Path> = Vec::new();
        let mut pending = vec![Path {
            node: head_snapshot.node.clone(),
            subtrees: Vec::new(),
            tree_count: 0,
        }];

        while let Some(path) = pending.pop() {
            if keep_going(path.tree_count, &path.node) == PathStep::Stop {
                finished.push(path);
                continue;
            }
            let link_count = path.node.links.borrow().len();
            if link_count == 0 {
                // Ran out of stack before the goal; the path ends at the root.
                finished.push(path);
                continue;
            }
            // Reverse so the first link is explored first off the work list.
            for i in (0..link_count).rev() {
                let links = path.node.links.borrow();
                let link = &links[i];
                let mut subtrees = path.subtrees.clone();
                let mut tree_count = path.tree_count;
                if let Some(tree) = &link.subtree {
                    subtrees.push(tree.clone());
                    if !tree.is_extra() {
                        tree_count += 1;
                    }
                }
                let next = Path {
                    node: link.node.clone(),
                    subtrees,
                    tree_count,
                };
                drop(links);
                pending.push(next);
            }
        }

        let mut slices: Vec<StackSlice> = Vec::new();
        let mut assigned: Vec<(Rc<StackNode>, StackVersion)> = Vec::new();
        for mut path in finished {
            path.subtrees.reverse();
            let existing = assigned
                .iter()
                .find(|(node, _)| Rc::ptr_eq(node, &path.node))
                .map(|(_, v)| *v);
            let slice_version = match existing {
                Some(v) => v,
                None => {
                    let mut copy = head_snapshot.copy();
                    copy.node = path.node.clone();
                    self.heads.push(copy);
                    let v = self.heads.len() - 1;
                    assigned.push((path.node.clone(), v));
                    v
                }
            };
            let slice = StackSlice {
                version: slice_version,
                subtrees: path.subtrees,
            };
            // Slices of one version stay adjacent so reductions can treat
            // them as alternative child arrays for a single head.
            match slices.iter().rposition(|s| s.version == slice_version) {
                Some(index) => slices.insert(index + 1, slice),
                None => slices.push(slice),
            }
        }
        slices
    }
}

#[derive(PartialEq, Eq, Clone, Copy)]
enum PathStep {
    Continue,
    Stop,
}
