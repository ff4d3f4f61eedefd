// The compilation drivers. MethodCompiler owns the canonical stage pipeline and runs it over
// one method's context, checking the cancel flag between stages. AssemblyCompiler drains the
// method queue with a scoped worker pool; per-method state is thread-local and the only
// shared structures are the read-only type system and the layout engine behind its mutex.
// Workers produce finished artifacts (bytes plus relocation requests); a single-threaded
// commit phase inserts them into the linker in stable method order, allocates static field
// storage, and merges counters and traces. A method failure is recorded and skipped unless
// the stop-on-first-error option is set; linker errors abort the build.

pub mod options;

pub use options::{Options, Target};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::error::{CompileError, CompileResult};
use crate::core::trace::{Counters, MethodTrace};
use crate::linker::{LinkKind, Linker, SectionKind};
use crate::stages::{self, MethodContext, Reloc, RelocKind, Stage};
use crate::ty::{MethodId, TypeLayout};

/// Output of one method's pipeline run.
pub struct CompiledMethod {
    pub method: MethodId,
    pub symbol: String,
    pub code: Vec<u8>,
    pub relocations: Vec<Reloc>,
    pub counters: Counters,
    pub trace: MethodTrace,
}

/// The canonical stage order. Optimization stages honor their own toggles;
/// long-integer expansion is semantic and always present.
fn build_pipeline(options: &Options) -> Vec<Box<dyn Stage>> {
    let mut pipeline: Vec<Box<dyn Stage>> = vec![
        Box::new(stages::decode::CilDecoderStage),
        Box::new(stages::protected::ProtectedRegionStage),
        Box::new(stages::ssa::SsaConstructionStage),
        Box::new(stages::fold::ConstantFoldingStage),
        Box::new(stages::sccp::SparseConditionalConstantStage),
        Box::new(stages::gvn::ValueNumberingStage),
        Box::new(stages::dce::DeadCodeEliminationStage),
        Box::new(stages::inline::InlineStage),
    ];
    if options.two_pass_optimizations {
        pipeline.push(Box::new(stages::fold::ConstantFoldingStage));
        pipeline.push(Box::new(stages::dce::DeadCodeEliminationStage));
    }
    pipeline.push(Box::new(stages::long_expand::LongExpansionStage));
    pipeline.push(Box::new(stages::leave_ssa::LeaveSsaStage));
    pipeline.push(Box::new(crate::x64::lowering::PlatformLoweringStage));
    pipeline.push(Box::new(crate::x64::tweak::PlatformTweakStage));
    pipeline.push(Box::new(crate::x64::tweak::FixedRegisterStage));
    pipeline.push(Box::new(stages::regalloc::RegisterAllocationStage));
    pipeline.push(Box::new(stages::stack_frame::StackLayoutStage));
    pipeline.push(Box::new(crate::x64::emit::CodeEmissionStage));
    pipeline
}

/// Per-method driver.
pub struct MethodCompiler<'a> {
    layout: &'a TypeLayout,
    options: &'a Options,
}

impl<'a> MethodCompiler<'a> {
    pub fn new(layout: &'a TypeLayout, options: &'a Options) -> Self {
        Self { layout, options }
    }

    /// Run the pipeline. Returns `None` when the cancel flag aborted the
    /// method between stages.
    pub fn compile(
        &self,
        method: MethodId,
        cancel: &AtomicBool,
    ) -> CompileResult<Option<CompiledMethod>> {
        let ts = self.layout.type_system();
        let mut ctx = MethodContext::new(method, ts, self.layout, self.options);
        let mut pipeline = build_pipeline(self.options);
        if !stages::run_pipeline(&mut ctx, &mut pipeline, Some(cancel))? {
            return Ok(None);
        }
        Ok(Some(CompiledMethod {
            method,
            symbol: ts.method_symbol(method),
            code: ctx.code,
            relocations: ctx.relocations,
            counters: ctx.counters,
            trace: ctx.trace,
        }))
    }
}

/// Build-level outcome.
pub struct AssemblyResult {
    pub methods_compiled: usize,
    pub failures: Vec<(String, CompileError)>,
    pub counters: Counters,
    pub traces: Vec<MethodTrace>,
}

/// Whole-assembly driver: parallel per-method compilation, single-threaded
/// linker commit.
pub struct AssemblyCompiler {
    layout: Arc<TypeLayout>,
    options: Options,
    cancel: Arc<AtomicBool>,
}

impl AssemblyCompiler {
    pub fn new(layout: Arc<TypeLayout>, options: Options) -> Self {
        Self {
            layout,
            options,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked by queued and in-flight methods.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn compile_all(
        &self,
        linker: &mut dyn Linker,
        worker_count: usize,
    ) -> CompileResult<AssemblyResult> {
        let ts = self.layout.type_system();
        let mut methods: Vec<MethodId> = ts.methods_with_bodies().collect();
        methods.reverse();
        let queue = Mutex::new(methods);
        type Outcome = (MethodId, CompileResult<Option<CompiledMethod>>);
        let results: Mutex<Vec<Outcome>> = Mutex::new(Vec::new());

        let workers = worker_count.max(1);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    let compiler = MethodCompiler::new(&self.layout, &self.options);
                    loop {
                        if self.cancel.load(Ordering::Relaxed) {
                            break;
                        }
                        let Some(method) = queue.lock().pop() else { break };
                        let outcome = compiler.compile(method, &self.cancel);
                        if outcome.is_err() && self.options.stop_on_first_error {
                            self.cancel.store(true, Ordering::Relaxed);
                        }
                        results.lock().push((method, outcome));
                    }
                });
            }
        });

        // Single-threaded commit: stable order regardless of worker timing.
        let mut results = results.into_inner();
        results.sort_by_key(|(method, _)| method.0);

        // Static fields get zeroed storage up front.
        for ty in ts.all_types() {
            for &field in &ts.type_def(ty).fields {
                let fdef = ts.field(field);
                if !fdef.is_static {
                    continue;
                }
                let symbol = crate::stages::decode::static_field_symbol(ts, field);
                let size = self.layout.field_size(field).max(1) as usize;
                linker.allocate(&symbol, SectionKind::Bss, size, self.layout.ptr_align())?;
            }
        }

        let mut counters = Counters::new();
        let mut traces = Vec::new();
        let mut failures = Vec::new();
        let mut methods_compiled = 0usize;

        for (method, outcome) in results {
            match outcome {
                Ok(Some(compiled)) => {
                    let region = linker.allocate(
                        &compiled.symbol,
                        SectionKind::Text,
                        compiled.code.len(),
                        16,
                    )?;
                    region.copy_from_slice(&compiled.code);
                    for reloc in &compiled.relocations {
                        let kind = match reloc.kind {
                            RelocKind::Relative32 => LinkKind::Relative32,
                            RelocKind::Absolute => LinkKind::Absolute,
                        };
                        linker.link(
                            kind,
                            &compiled.symbol,
                            reloc.offset as u64,
                            &reloc.target,
                            reloc.addend,
                        )?;
                    }
                    counters.merge(&compiled.counters);
                    traces.push(compiled.trace);
                    methods_compiled += 1;
                }
                Ok(None) => {
                    // Cancelled in flight.
                }
                Err(error) => {
                    let symbol = ts.method_symbol(method);
                    log::warn!("{symbol}: {error}");
                    if self.options.stop_on_first_error {
                        return Err(error);
                    }
                    failures.push((symbol, error));
                }
            }
        }

        Ok(AssemblyResult {
            methods_compiled,
            failures,
            counters,
            traces,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::ObjectFileLinker;
    use crate::ty::{CilBody, CilOp, MethodSig, Primitive, TypeSystemBuilder};

    fn small_assembly() -> Arc<TypeLayout> {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let cls = b.class("Math");
        let add_body = CilBody {
            locals: vec![],
            ops: vec![CilOp::LdArg(0), CilOp::LdArg(1), CilOp::Add, CilOp::Ret],
            protected: Vec::new(),
        };
        b.static_method(cls, "Add", MethodSig::new(vec![i4, i4], Some(i4)), add_body);
        let mul_body = CilBody {
            locals: vec![],
            ops: vec![CilOp::LdArg(0), CilOp::LdArg(0), CilOp::Mul, CilOp::Ret],
            protected: Vec::new(),
        };
        b.static_method(cls, "Square", MethodSig::new(vec![i4], Some(i4)), mul_body);
        Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap())
    }

    #[test]
    fn compiles_methods_into_the_linker() {
        let layout = small_assembly();
        let compiler = AssemblyCompiler::new(layout, Options::default());
        let mut linker = ObjectFileLinker::new(true, 0);
        let result = compiler.compile_all(&mut linker, 2).unwrap();
        assert_eq!(result.methods_compiled, 2);
        assert!(result.failures.is_empty());
        assert!(linker.get_symbol("Math::Add").is_some());
        assert!(linker.get_symbol("Math::Square").is_some());
        assert!(!linker.symbol_bytes("Math::Add").unwrap().is_empty());
    }

    #[test]
    fn failures_are_recorded_without_aborting_the_queue() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let cls = b.class("Mixed");
        let ctor = b.method(
            cls,
            ".ctor",
            crate::ty::MethodFlags::default(),
            MethodSig::new(vec![], None),
            None,
        );
        let bad_body = CilBody {
            locals: vec![],
            ops: vec![CilOp::NewObj(ctor), CilOp::Pop, CilOp::Ret],
            protected: Vec::new(),
        };
        b.static_method(cls, "Bad", MethodSig::new(vec![], None), bad_body);
        let good_body = CilBody {
            locals: vec![],
            ops: vec![CilOp::LdArg(0), CilOp::Ret],
            protected: Vec::new(),
        };
        b.static_method(cls, "Good", MethodSig::new(vec![i4], Some(i4)), good_body);
        let layout = Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap());

        let compiler = AssemblyCompiler::new(layout, Options::default());
        let mut linker = ObjectFileLinker::new(true, 0);
        let result = compiler.compile_all(&mut linker, 1).unwrap();
        assert_eq!(result.methods_compiled, 1);
        assert_eq!(result.failures.len(), 1);
        assert!(result.failures[0].0.contains("Bad"));
    }

    #[test]
    fn static_fields_land_in_bss() {
        let mut b = TypeSystemBuilder::new();
        let i4 = b.primitive(Primitive::I4);
        let cls = b.class("Holder");
        b.static_field(cls, "counter", i4);
        let body = CilBody {
            locals: vec![],
            ops: vec![CilOp::LdcI4(0), CilOp::Ret],
            protected: Vec::new(),
        };
        b.static_method(cls, "M", MethodSig::new(vec![], Some(i4)), body);
        let layout = Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap());
        let compiler = AssemblyCompiler::new(layout, Options::default());
        let mut linker = ObjectFileLinker::new(true, 0);
        compiler.compile_all(&mut linker, 1).unwrap();
        let record = linker.get_symbol("Holder::counter").unwrap();
        assert_eq!(record.section, SectionKind::Bss);
        assert_eq!(record.size, 4);
    }
}
