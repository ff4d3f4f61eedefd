// The instruction graph stores every node of a method in one arena with intrusive prev/next
// links per block. Nodes are never physically removed while a method compiles: stages empty
// them instead, which keeps cursors held by in-flight traversals valid, and traversal
// iterators skip empty nodes. Blocks carry their first/last node plus predecessor/successor
// arrays recomputed from terminators on demand. Branch targets live on the node in an
// explicit target list; a phi node additionally carries a parallel array naming the source
// block of each operand.

use smallvec::SmallVec;

use crate::core::error::{CompileError, CompileResult};
use crate::core::instruction::{Arity, Condition, FlowControl, IrOp, IrType, Opcode};
use crate::core::operand::Operand;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

/// One instruction cell.
#[derive(Debug, Clone)]
pub struct Node {
    pub opcode: Opcode,
    pub results: SmallVec<[Operand; 2]>,
    pub operands: SmallVec<[Operand; 3]>,
    /// Associated managed type, where the opcode alone does not determine it.
    pub ty: Option<IrType>,
    pub cond: Option<Condition>,
    /// Branch targets for branch/conditional-branch/switch nodes.
    pub targets: SmallVec<[BlockId; 2]>,
    /// Source blocks paralleling the operand array. Present only on phis.
    pub phi_blocks: Option<Vec<BlockId>>,
    pub block: BlockId,
    prev: Option<NodeId>,
    next: Option<NodeId>,
    empty: bool,
    /// Section offset of the first emitted byte, recorded by emission.
    pub offset: Option<u32>,
}

impl Node {
    pub fn new(opcode: Opcode) -> Node {
        Node {
            opcode,
            results: SmallVec::new(),
            operands: SmallVec::new(),
            ty: None,
            cond: None,
            targets: SmallVec::new(),
            phi_blocks: None,
            block: BlockId(0),
            prev: None,
            next: None,
            empty: false,
            offset: None,
        }
    }

    pub fn ir(op: IrOp) -> Node {
        Node::new(Opcode::Ir(op))
    }

    pub fn result(mut self, op: Operand) -> Node {
        self.results.push(op);
        self
    }

    pub fn operand(mut self, op: Operand) -> Node {
        self.operands.push(op);
        self
    }

    pub fn with_ty(mut self, ty: IrType) -> Node {
        self.ty = Some(ty);
        self
    }

    pub fn with_cond(mut self, cond: Condition) -> Node {
        self.cond = Some(cond);
        self
    }

    pub fn target(mut self, block: BlockId) -> Node {
        self.targets.push(block);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.empty
    }

    pub fn is_phi(&self) -> bool {
        self.opcode == Opcode::Ir(IrOp::Phi)
    }

    /// Verify result/operand counts against the descriptor's declared arity.
    pub fn check_shape(&self, stage: &'static str) -> CompileResult<()> {
        let desc = self.opcode.desc();
        if self.results.len() != desc.results as usize {
            return Err(CompileError::invariant(
                stage,
                format!(
                    "{} has {} results, descriptor declares {}",
                    desc.name,
                    self.results.len(),
                    desc.results
                ),
            ));
        }
        if let Arity::Fixed(count) = desc.operands {
            if self.operands.len() != count as usize {
                return Err(CompileError::invariant(
                    stage,
                    format!(
                        "{} has {} operands, descriptor declares {}",
                        desc.name,
                        self.operands.len(),
                        count
                    ),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
struct BlockData {
    first: Option<NodeId>,
    last: Option<NodeId>,
    preds: Vec<BlockId>,
    succs: Vec<BlockId>,
}

/// Per-method instruction graph: a node arena plus the basic-block list.
#[derive(Debug, Default)]
pub struct InstrGraph {
    nodes: Vec<Node>,
    blocks: Vec<BlockData>,
}

impl InstrGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BlockData::default());
        id
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn preds(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block.0 as usize].preds
    }

    pub fn succs(&self, block: BlockId) -> &[BlockId] {
        &self.blocks[block.0 as usize].succs
    }

    fn push_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Append a node at the end of a block.
    pub fn append(&mut self, block: BlockId, mut node: Node) -> NodeId {
        node.block = block;
        node.prev = self.blocks[block.0 as usize].last;
        node.next = None;
        let id = self.push_node(node);
        match self.blocks[block.0 as usize].last {
            Some(last) => self.nodes[last.0 as usize].next = Some(id),
            None => self.blocks[block.0 as usize].first = Some(id),
        }
        self.blocks[block.0 as usize].last = Some(id);
        id
    }

    /// Prepend a node at the top of a block.
    pub fn prepend(&mut self, block: BlockId, mut node: Node) -> NodeId {
        node.block = block;
        node.prev = None;
        node.next = self.blocks[block.0 as usize].first;
        let id = self.push_node(node);
        match self.blocks[block.0 as usize].first {
            Some(first) => self.nodes[first.0 as usize].prev = Some(id),
            None => self.blocks[block.0 as usize].last = Some(id),
        }
        self.blocks[block.0 as usize].first = Some(id);
        id
    }

    /// Insert a node immediately before the cursor node.
    pub fn insert_before(&mut self, cursor: NodeId, mut node: Node) -> NodeId {
        let block = self.nodes[cursor.0 as usize].block;
        let prev = self.nodes[cursor.0 as usize].prev;
        node.block = block;
        node.prev = prev;
        node.next = Some(cursor);
        let id = self.push_node(node);
        self.nodes[cursor.0 as usize].prev = Some(id);
        match prev {
            Some(p) => self.nodes[p.0 as usize].next = Some(id),
            None => self.blocks[block.0 as usize].first = Some(id),
        }
        id
    }

    /// Insert a node immediately after the cursor node.
    pub fn insert_after(&mut self, cursor: NodeId, mut node: Node) -> NodeId {
        let block = self.nodes[cursor.0 as usize].block;
        let next = self.nodes[cursor.0 as usize].next;
        node.block = block;
        node.prev = Some(cursor);
        node.next = next;
        let id = self.push_node(node);
        self.nodes[cursor.0 as usize].next = Some(id);
        match next {
            Some(n) => self.nodes[n.0 as usize].prev = Some(id),
            None => self.blocks[block.0 as usize].last = Some(id),
        }
        id
    }

    /// Turn a node into a no-op placeholder. The cell stays linked so
    /// in-flight cursors remain valid; traversals skip it.
    pub fn empty_node(&mut self, id: NodeId) {
        let node = &mut self.nodes[id.0 as usize];
        node.opcode = Opcode::Ir(IrOp::Nop);
        node.results.clear();
        node.operands.clear();
        node.targets.clear();
        node.phi_blocks = None;
        node.ty = None;
        node.cond = None;
        node.empty = true;
    }

    /// Split a block before `at`: `at` and everything after it move into a
    /// fresh block, which is returned. The caller is responsible for
    /// re-terminating the original block.
    pub fn split_block_before(&mut self, at: NodeId) -> BlockId {
        let old_block = self.nodes[at.0 as usize].block;
        let new_block = self.create_block();
        let prev = self.nodes[at.0 as usize].prev;

        let old_last = self.blocks[old_block.0 as usize].last;
        match prev {
            Some(p) => self.nodes[p.0 as usize].next = None,
            None => self.blocks[old_block.0 as usize].first = None,
        }
        self.blocks[old_block.0 as usize].last = prev;
        self.nodes[at.0 as usize].prev = None;

        self.blocks[new_block.0 as usize].first = Some(at);
        self.blocks[new_block.0 as usize].last = old_last;

        let mut cursor = Some(at);
        while let Some(id) = cursor {
            self.nodes[id.0 as usize].block = new_block;
            cursor = self.nodes[id.0 as usize].next;
        }
        new_block
    }

    /// Iterate the non-empty nodes of a block in order.
    pub fn block_nodes(&self, block: BlockId) -> BlockNodes<'_> {
        BlockNodes {
            graph: self,
            cursor: self.blocks[block.0 as usize].first,
        }
    }

    /// Iterate the non-empty nodes of a block in reverse order.
    pub fn block_nodes_rev(&self, block: BlockId) -> BlockNodesRev<'_> {
        BlockNodesRev {
            graph: self,
            cursor: self.blocks[block.0 as usize].last,
        }
    }

    /// Last non-empty node of a block.
    pub fn terminator(&self, block: BlockId) -> Option<NodeId> {
        self.block_nodes_rev(block).next()
    }

    /// First node of the block's terminator group: the trailing contiguous
    /// run of conditional branches and jumps (a trailing switch joins the
    /// group). Copies that must execute on an outgoing edge are inserted
    /// before this node.
    pub fn terminator_group_start(&self, block: BlockId) -> Option<NodeId> {
        let mut start = None;
        for id in self.block_nodes_rev(block) {
            match self.node(id).opcode.desc().flow {
                FlowControl::Branch | FlowControl::ConditionalBranch | FlowControl::Switch => {
                    start = Some(id);
                }
                _ => break,
            }
        }
        start
    }

    /// Recompute predecessor/successor arrays from node targets.
    pub fn recompute_edges(&mut self) {
        for data in &mut self.blocks {
            data.preds.clear();
            data.succs.clear();
        }
        for block in 0..self.blocks.len() as u32 {
            let block = BlockId(block);
            let mut succs: Vec<BlockId> = Vec::new();
            for id in self.block_nodes(block) {
                for &target in &self.node(id).targets {
                    if !succs.contains(&target) {
                        succs.push(target);
                    }
                }
            }
            for &succ in &succs {
                let preds = &mut self.blocks[succ.0 as usize].preds;
                if !preds.contains(&block) {
                    preds.push(block);
                }
            }
            self.blocks[block.0 as usize].succs = succs;
        }
    }

    /// The phi nodes at the top of a block. Phis are contiguous; iteration
    /// stops at the first non-phi node.
    pub fn block_phis(&self, block: BlockId) -> Vec<NodeId> {
        let mut phis = Vec::new();
        for id in self.block_nodes(block) {
            if self.node(id).is_phi() {
                phis.push(id);
            } else {
                break;
            }
        }
        phis
    }
}

pub struct BlockNodes<'g> {
    graph: &'g InstrGraph,
    cursor: Option<NodeId>,
}

impl<'g> Iterator for BlockNodes<'g> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        while let Some(id) = self.cursor {
            self.cursor = self.graph.nodes[id.0 as usize].next;
            if !self.graph.nodes[id.0 as usize].empty {
                return Some(id);
            }
        }
        None
    }
}

pub struct BlockNodesRev<'g> {
    graph: &'g InstrGraph,
    cursor: Option<NodeId>,
}

impl<'g> Iterator for BlockNodesRev<'g> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        while let Some(id) = self.cursor {
            self.cursor = self.graph.nodes[id.0 as usize].prev;
            if !self.graph.nodes[id.0 as usize].empty {
                return Some(id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::operand::VRegId;

    fn add_node() -> Node {
        Node::ir(IrOp::Add32)
            .result(Operand::VReg(VRegId(0)))
            .operand(Operand::i32(1))
            .operand(Operand::i32(2))
    }

    #[test]
    fn append_links_nodes_in_order() {
        let mut graph = InstrGraph::new();
        let b = graph.create_block();
        let n1 = graph.append(b, Node::ir(IrOp::Nop));
        let n2 = graph.append(b, add_node());
        let order: Vec<_> = graph.block_nodes(b).collect();
        assert_eq!(order, vec![n1, n2]);
        let rev: Vec<_> = graph.block_nodes_rev(b).collect();
        assert_eq!(rev, vec![n2, n1]);
    }

    #[test]
    fn emptied_nodes_are_skipped_but_stay_linked() {
        let mut graph = InstrGraph::new();
        let b = graph.create_block();
        let n1 = graph.append(b, add_node());
        let n2 = graph.append(b, add_node());
        let n3 = graph.append(b, add_node());
        graph.empty_node(n2);
        let order: Vec<_> = graph.block_nodes(b).collect();
        assert_eq!(order, vec![n1, n3]);
        // Insertion relative to the emptied cursor still works.
        let n4 = graph.insert_after(n2, add_node());
        let order: Vec<_> = graph.block_nodes(b).collect();
        assert_eq!(order, vec![n1, n4, n3]);
    }

    #[test]
    fn insert_before_first_updates_block_head() {
        let mut graph = InstrGraph::new();
        let b = graph.create_block();
        let n1 = graph.append(b, add_node());
        let n0 = graph.insert_before(n1, Node::ir(IrOp::Nop));
        let order: Vec<_> = graph.block_nodes(b).collect();
        assert_eq!(order, vec![n0, n1]);
    }

    #[test]
    fn edges_follow_targets() {
        let mut graph = InstrGraph::new();
        let a = graph.create_block();
        let b = graph.create_block();
        let c = graph.create_block();
        graph.append(
            a,
            Node::ir(IrOp::CmpBranch32)
                .operand(Operand::i32(0))
                .operand(Operand::i32(1))
                .with_cond(Condition::Equal)
                .target(b),
        );
        graph.append(a, Node::ir(IrOp::Jmp).target(c));
        graph.append(b, Node::ir(IrOp::ReturnVoid));
        graph.append(c, Node::ir(IrOp::ReturnVoid));
        graph.recompute_edges();
        assert_eq!(graph.succs(a), &[b, c]);
        assert_eq!(graph.preds(b), &[a]);
        assert_eq!(graph.preds(c), &[a]);
    }

    #[test]
    fn terminator_group_spans_trailing_branches() {
        let mut graph = InstrGraph::new();
        let a = graph.create_block();
        let b = graph.create_block();
        let c = graph.create_block();
        let add = graph.append(a, add_node());
        let cmp = graph.append(
            a,
            Node::ir(IrOp::CmpBranch32)
                .operand(Operand::i32(0))
                .operand(Operand::i32(1))
                .with_cond(Condition::Less)
                .target(b),
        );
        graph.append(a, Node::ir(IrOp::Jmp).target(c));
        assert_eq!(graph.terminator_group_start(a), Some(cmp));
        assert_ne!(graph.terminator_group_start(a), Some(add));
    }

    #[test]
    fn split_block_moves_tail_nodes() {
        let mut graph = InstrGraph::new();
        let a = graph.create_block();
        let n1 = graph.append(a, add_node());
        let n2 = graph.append(a, add_node());
        let n3 = graph.append(a, add_node());
        let b = graph.split_block_before(n2);
        assert_eq!(graph.block_nodes(a).collect::<Vec<_>>(), vec![n1]);
        assert_eq!(graph.block_nodes(b).collect::<Vec<_>>(), vec![n2, n3]);
        assert_eq!(graph.node(n2).block, b);
        assert_eq!(graph.node(n3).block, b);
    }

    #[test]
    fn shape_check_catches_arity_mismatch() {
        let bad = Node::ir(IrOp::Add32).operand(Operand::i32(1));
        assert!(bad.check_shape("test").is_err());
        assert!(add_node().check_shape("test").is_ok());
    }
}
