//! # Modification list
//!
//! While a packet's payload is being rewritten, every insertion/deletion is
//! recorded here first as `(first_position_in_packet, absolute_position,
//! offset)` triples rather than applied directly to the
//! [`ByteStreamMaintainer`](crate::maintainer::ByteStreamMaintainer). Only
//! once the packet reaches its final state does [`commit`](ModificationList::commit)
//! push the recorded offsets into the maintainer's trees — committing twice,
//! or adding further modifications after a commit, is a programming error a
//! well-behaved caller should not do, so a list freezes itself on commit.

use mbox_wire::Seq32;

use crate::maintainer::ByteStreamMaintainer;

#[derive(Debug, Clone, Copy)]
struct ModificationNode {
    first_position: Seq32,
    position: Seq32,
    offset: i32,
}

#[derive(Debug, Default)]
pub struct ModificationList {
    nodes: Vec<ModificationNode>,
    committed: bool,
}

impl ModificationList {
    pub fn new() -> Self {
        ModificationList::default()
    }

    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Record a modification. Returns `false` (and does nothing) if this
    /// list has already been committed.
    ///
    /// `first_position` is the lowest sequence number possible for the
    /// packet this modification belongs to — it lets [`merge_nodes`] tell
    /// apart modifications that are adjacent within the same packet (and so
    /// safe to merge) from ones that merely collide in absolute position.
    pub fn add_modification(&mut self, first_position: Seq32, position: Seq32, offset: i32) -> bool {
        if self.committed {
            return false;
        }
        self.nodes.push(ModificationNode {
            first_position,
            position,
            offset,
        });
        true
    }

    /// Merge adjacent or overlapping deletions recorded against the same
    /// packet into a single node, so the maintainer sees one offset per
    /// contiguous removed span instead of one per removed byte.
    fn merge_nodes(&mut self) {
        if self.nodes.len() < 2 {
            return;
        }
        self.nodes.sort_by_key(|n| n.position);

        let mut merged: Vec<ModificationNode> = Vec::with_capacity(self.nodes.len());
        for node in self.nodes.drain(..) {
            match merged.last_mut() {
                Some(prev)
                    if same_sign(prev.offset, node.offset)
                        && prev.first_position == node.first_position
                        && adjacent(prev, &node) =>
                {
                    prev.offset += node.offset;
                }
                _ => merged.push(node),
            }
        }
        self.nodes = merged;
    }

    /// Push every recorded modification into `maintainer`'s ack and seq
    /// trees, then freeze this list against further use.
    pub fn commit(&mut self, maintainer: &mut ByteStreamMaintainer) {
        if self.committed {
            tracing::warn!("ModificationList committed twice");
            return;
        }
        self.merge_nodes();
        for node in &self.nodes {
            maintainer.insert_in_ack_tree(node.position, node.offset);
            maintainer.insert_in_seq_tree(node.position, node.offset);
        }
        self.committed = true;
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.committed = false;
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

fn same_sign(a: i32, b: i32) -> bool {
    (a >= 0) == (b >= 0)
}

/// Two deletion/insertion nodes from the same packet are adjacent if one's
/// position immediately follows the byte span the other's offset implies.
fn adjacent(prev: &ModificationNode, next: &ModificationNode) -> bool {
    if prev.offset < 0 {
        // prev deletes bytes starting at prev.position; next is adjacent if
        // it starts where prev's deleted span ends.
        next.position.value() == prev.position.value().wrapping_add((-prev.offset) as u32)
    } else {
        next.position == prev.position
    }
}
