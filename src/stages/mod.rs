// The stage pipeline. Each stage is a boxed trait object with initialize/run/finish hooks
// mutating the shared MethodContext; the driver is a linear loop that short-circuits on the
// first error and captures an IR dump after every stage the trace filter selects. Stages
// communicate only through the context: the graph, the register and slot tables, the flags,
// and the counters.

pub mod decode;
pub mod dce;
pub mod fold;
pub mod gvn;
pub mod inline;
pub mod leave_ssa;
pub mod long_expand;
pub mod protected;
pub mod regalloc;
pub mod sccp;
pub mod ssa;
pub mod stack_frame;

use std::collections::HashMap;

use crate::compile::options::Options;
use crate::core::error::CompileResult;
use crate::core::graph::{BlockId, InstrGraph};
use crate::core::operand::{StackSlotId, StackSlots, VRegId, VirtualRegisters};
use crate::core::trace::{dump_graph, Counters, MethodTrace};
use crate::ty::{MethodId, TypeLayout, TypeSystem};

/// A relocation request recorded during emission, relative to the start of
/// the method's code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reloc {
    pub kind: RelocKind,
    /// Offset of the fixup within the method body.
    pub offset: u32,
    pub target: String,
    pub addend: i64,
}

/// How the linker must patch a fixup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// 32-bit PC-relative, patched against the next instruction.
    Relative32,
    /// Absolute pointer-wide address.
    Absolute,
}

/// A protected region mapped onto the block graph.
#[derive(Debug, Clone)]
pub struct RegionInfo {
    pub kind: crate::ty::HandlerKind,
    pub try_entry: BlockId,
    pub handler_entry: BlockId,
}

/// All per-method state the stages operate on.
pub struct MethodContext<'a> {
    pub method: MethodId,
    pub ts: &'a TypeSystem,
    pub layout: &'a TypeLayout,
    pub options: &'a Options,

    pub graph: InstrGraph,
    pub vregs: VirtualRegisters,
    pub slots: StackSlots,
    /// Stack slots of the incoming parameters, in signature order.
    pub params: Vec<StackSlotId>,
    /// Virtual registers holding parameters after the prologue.
    pub param_vregs: Vec<VRegId>,
    /// Virtual registers of the CIL locals.
    pub local_vregs: Vec<VRegId>,

    pub is_in_ssa_form: bool,
    pub has_protected_regions: bool,
    /// Handler entry blocks; roots besides the prologue.
    pub handler_blocks: Vec<BlockId>,
    /// Protected regions, mapped to blocks by the decoder.
    pub regions: Vec<RegionInfo>,

    pub prologue: Option<BlockId>,
    pub epilogue: Option<BlockId>,
    pub return_vreg: Option<VRegId>,

    pub counters: Counters,
    pub trace: MethodTrace,

    /// Filled by the stack-layout stage.
    pub frame_size: u32,
    /// Pool registers the method writes; saved and restored around the body.
    pub saved_regs: Vec<crate::core::operand::PhysReg>,
    /// Filled by the emission stage.
    pub code: Vec<u8>,
    pub relocations: Vec<Reloc>,
    pub block_offsets: HashMap<BlockId, u32>,
}

impl<'a> MethodContext<'a> {
    pub fn new(
        method: MethodId,
        ts: &'a TypeSystem,
        layout: &'a TypeLayout,
        options: &'a Options,
    ) -> Self {
        MethodContext {
            method,
            ts,
            layout,
            options,
            graph: InstrGraph::new(),
            vregs: VirtualRegisters::new(),
            slots: StackSlots::new(),
            params: Vec::new(),
            param_vregs: Vec::new(),
            local_vregs: Vec::new(),
            is_in_ssa_form: false,
            has_protected_regions: false,
            handler_blocks: Vec::new(),
            regions: Vec::new(),
            prologue: None,
            epilogue: None,
            return_vreg: None,
            counters: Counters::new(),
            trace: MethodTrace::new(ts.method_symbol(method)),
            frame_size: 0,
            saved_regs: Vec::new(),
            code: Vec::new(),
            relocations: Vec::new(),
            block_offsets: HashMap::new(),
        }
    }

    /// Blocks reachable from the prologue, in reverse post-order.
    pub fn reverse_post_order(&self) -> Vec<BlockId> {
        let entry = match self.prologue {
            Some(entry) => entry,
            None => return Vec::new(),
        };
        let block_count = self.graph.block_count();
        let mut visited = vec![false; block_count];
        let mut post = Vec::with_capacity(block_count);
        let mut stack = vec![(entry, false)];
        while let Some((block, processed)) = stack.pop() {
            if processed {
                post.push(block);
                continue;
            }
            if visited[block.0 as usize] {
                continue;
            }
            visited[block.0 as usize] = true;
            stack.push((block, true));
            for &succ in self.graph.succs(block) {
                if !visited[succ.0 as usize] {
                    stack.push((succ, false));
                }
            }
        }
        post.reverse();
        post
    }

    /// Block order used for liveness and emission: reachable blocks first,
    /// then handler blocks and anything else left over.
    pub fn linear_block_order(&self) -> Vec<BlockId> {
        let mut order = self.reverse_post_order();
        let mut seen = vec![false; self.graph.block_count()];
        for &b in &order {
            seen[b.0 as usize] = true;
        }
        for b in self.graph.block_ids() {
            if !seen[b.0 as usize] && self.graph.block_nodes(b).next().is_some() {
                order.push(b);
            }
        }
        order
    }
}

/// One pipeline transformation.
pub trait Stage {
    fn name(&self) -> &'static str;

    fn initialize(&mut self, _ctx: &mut MethodContext) -> CompileResult<()> {
        Ok(())
    }

    fn run(&mut self, ctx: &mut MethodContext) -> CompileResult<()>;

    fn finish(&mut self, _ctx: &mut MethodContext) -> CompileResult<()> {
        Ok(())
    }
}

/// Run the stages in order, dumping after each one the filter selects. The
/// cancel flag is checked between stages; a cancelled run returns false.
pub fn run_pipeline(
    ctx: &mut MethodContext,
    stages: &mut [Box<dyn Stage>],
    cancel: Option<&std::sync::atomic::AtomicBool>,
) -> CompileResult<bool> {
    for stage in stages {
        if let Some(flag) = cancel {
            if flag.load(std::sync::atomic::Ordering::Relaxed) {
                log::debug!("cancelled before stage {}", stage.name());
                return Ok(false);
            }
        }
        log::debug!("stage {} on {}", stage.name(), ctx.trace.method);
        stage.initialize(ctx)?;
        stage.run(ctx)?;
        stage.finish(ctx)?;
        if ctx.options.trace_filter.captures(stage.name()) {
            let dump = dump_graph(&ctx.graph, &ctx.vregs);
            ctx.trace.record(stage.name(), dump);
        }
    }
    Ok(true)
}
