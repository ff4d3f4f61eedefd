//! End-to-end pipeline tests: synthesized type systems compiled through
//! every stage into linker sections, with the emitted machine code checked
//! by disassembly.

use std::sync::Arc;

use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use mosac::compile::{AssemblyCompiler, Options};
use mosac::linker::{Linker, ObjectFileLinker, SectionKind};
use mosac::ty::{CilBody, CilOp, MethodSig, Primitive, TypeLayout, TypeSystemBuilder};

fn mnemonics(code: &[u8]) -> Vec<Mnemonic> {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let mut out = Vec::new();
    while decoder.can_decode() {
        out.push(decoder.decode().mnemonic());
    }
    out
}

#[test]
fn straightline_add_compiles_to_valid_code() {
    let mut b = TypeSystemBuilder::new();
    let i4 = b.primitive(Primitive::I4);
    let cls = b.class("Math");
    let body = CilBody {
        locals: vec![],
        ops: vec![CilOp::LdArg(0), CilOp::LdArg(1), CilOp::Add, CilOp::Ret],
        protected: Vec::new(),
    };
    b.static_method(cls, "Add", MethodSig::new(vec![i4, i4], Some(i4)), body);
    let layout = Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap());

    let compiler = AssemblyCompiler::new(layout, Options::default());
    let mut linker = ObjectFileLinker::new(true, 0);
    let result = compiler.compile_all(&mut linker, 1).unwrap();
    assert_eq!(result.methods_compiled, 1);
    assert!(result.failures.is_empty());

    let code = linker.symbol_bytes("Math::Add").unwrap();
    let ops = mnemonics(code);
    assert_eq!(*ops.first().unwrap(), Mnemonic::Push, "prologue starts with push rbp");
    assert_eq!(*ops.last().unwrap(), Mnemonic::Ret);
    assert!(ops.contains(&Mnemonic::Add), "no add instruction in {ops:?}");
}

#[test]
fn loops_and_branches_survive_the_whole_pipeline() {
    // Sum the integers below the argument with a do-while loop.
    let mut b = TypeSystemBuilder::new();
    let i4 = b.primitive(Primitive::I4);
    let cls = b.class("Math");
    let body = CilBody {
        locals: vec![i4, i4],
        ops: vec![
            // local0 = 0 (sum), local1 = 0 (i)
            CilOp::LdcI4(0),
            CilOp::StLoc(0),
            CilOp::LdcI4(0),
            CilOp::StLoc(1),
            // loop: sum += i; i += 1; if (i < n) loop
            CilOp::LdLoc(0),
            CilOp::LdLoc(1),
            CilOp::Add,
            CilOp::StLoc(0),
            CilOp::LdLoc(1),
            CilOp::LdcI4(1),
            CilOp::Add,
            CilOp::StLoc(1),
            CilOp::LdLoc(1),
            CilOp::LdArg(0),
            CilOp::Blt(4),
            CilOp::LdLoc(0),
            CilOp::Ret,
        ],
        protected: Vec::new(),
    };
    b.static_method(cls, "SumBelow", MethodSig::new(vec![i4], Some(i4)), body);
    let layout = Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap());

    let compiler = AssemblyCompiler::new(layout, Options::default());
    let mut linker = ObjectFileLinker::new(true, 0);
    let result = compiler.compile_all(&mut linker, 1).unwrap();
    assert_eq!(result.methods_compiled, 1, "{:?}", result.failures);

    let code = linker.symbol_bytes("Math::SumBelow").unwrap();
    let ops = mnemonics(code);
    assert!(ops.contains(&Mnemonic::Cmp));
    assert!(ops.iter().any(|m| matches!(
        m,
        Mnemonic::Jl | Mnemonic::Jge | Mnemonic::Je | Mnemonic::Jne
    )));
}

#[test]
fn field_access_resolves_layout_offsets() {
    let mut b = TypeSystemBuilder::new();
    let i4 = b.primitive(Primitive::I4);
    let i2 = b.primitive(Primitive::I2);
    let cls = b.class("Pair");
    b.field(cls, "first", i4);
    let second = b.field(cls, "second", i2);
    let body = CilBody {
        locals: vec![],
        ops: vec![CilOp::LdArg(0), CilOp::LdFld(second), CilOp::Ret],
        protected: Vec::new(),
    };
    b.method(
        cls,
        "Second",
        mosac::ty::MethodFlags::default(),
        MethodSig::new(vec![], Some(i4)),
        Some(body),
    );
    let layout = Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap());
    assert_eq!(layout.field_offset(second), 8);

    let compiler = AssemblyCompiler::new(layout, Options::default());
    let mut linker = ObjectFileLinker::new(true, 0);
    let result = compiler.compile_all(&mut linker, 1).unwrap();
    assert_eq!(result.methods_compiled, 1, "{:?}", result.failures);

    // movsx with the field displacement baked in.
    let code = linker.symbol_bytes("Pair::Second").unwrap();
    let ops = mnemonics(code);
    assert!(ops.contains(&Mnemonic::Movsx), "no widening load in {ops:?}");
}

#[test]
fn cross_method_calls_leave_relocations() {
    let mut b = TypeSystemBuilder::new();
    let i4 = b.primitive(Primitive::I4);
    let cls = b.class("Calls");
    let callee_body = CilBody {
        locals: vec![],
        ops: vec![
            CilOp::LdArg(0),
            CilOp::LdArg(0),
            CilOp::Mul,
            CilOp::LdArg(0),
            CilOp::Add,
            CilOp::Ret,
        ],
        protected: Vec::new(),
    };
    let callee = b.static_method(
        cls,
        "Poly",
        MethodSig::new(vec![i4], Some(i4)),
        callee_body,
    );
    let caller_body = CilBody {
        locals: vec![],
        ops: vec![CilOp::LdcI4(9), CilOp::Call(callee), CilOp::Ret],
        protected: Vec::new(),
    };
    b.static_method(cls, "Main", MethodSig::new(vec![], Some(i4)), caller_body);
    let layout = Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap());

    // Disable inlining so the call and its relocation survive.
    let options = Options {
        inlining: false,
        ..Options::default()
    };
    let compiler = AssemblyCompiler::new(layout, options);
    let mut linker = ObjectFileLinker::new(true, 0);
    let result = compiler.compile_all(&mut linker, 2).unwrap();
    assert_eq!(result.methods_compiled, 2, "{:?}", result.failures);

    assert!(linker
        .links()
        .iter()
        .any(|l| l.in_symbol == "Calls::Main" && l.target == "Calls::Poly"));

    let object_bytes = linker.build_object().unwrap();
    assert_eq!(&object_bytes[..4], b"\x7fELF");
}

#[test]
fn static_field_round_trip_uses_rip_relative_loads() {
    let mut b = TypeSystemBuilder::new();
    let i4 = b.primitive(Primitive::I4);
    let cls = b.class("Counter");
    let field = b.static_field(cls, "value", i4);
    let body = CilBody {
        locals: vec![],
        ops: vec![
            CilOp::LdSFld(field),
            CilOp::LdcI4(1),
            CilOp::Add,
            CilOp::StSFld(field),
            CilOp::LdSFld(field),
            CilOp::Ret,
        ],
        protected: Vec::new(),
    };
    b.static_method(cls, "Bump", MethodSig::new(vec![], Some(i4)), body);
    let layout = Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap());

    let compiler = AssemblyCompiler::new(layout, Options::default());
    let mut linker = ObjectFileLinker::new(true, 0);
    let result = compiler.compile_all(&mut linker, 1).unwrap();
    assert_eq!(result.methods_compiled, 1, "{:?}", result.failures);

    assert_eq!(
        linker.get_symbol("Counter::value").unwrap().section,
        SectionKind::Bss
    );
    // Load and store against the static symbol.
    let static_links = linker
        .links()
        .iter()
        .filter(|l| l.target == "Counter::value")
        .count();
    assert!(static_links >= 2, "expected load and store relocations");
}

#[test]
fn optimizations_shrink_constant_code() {
    let build = |optimize: bool| {
        let mut b2 = TypeSystemBuilder::new();
        let i4 = b2.primitive(Primitive::I4);
        let cls = b2.class("Math");
        let body = CilBody {
            locals: vec![i4],
            ops: vec![
                CilOp::LdcI4(6),
                CilOp::LdcI4(7),
                CilOp::Mul,
                CilOp::StLoc(0),
                CilOp::LdLoc(0),
                CilOp::Ret,
            ],
            protected: Vec::new(),
        };
        b2.static_method(cls, "Answer", MethodSig::new(vec![], Some(i4)), body);
        let layout = Arc::new(TypeLayout::new(Arc::new(b2.build()), 8, 8).unwrap());
        let options = Options {
            optimize,
            ..Options::default()
        };
        let compiler = AssemblyCompiler::new(layout, options);
        let mut linker = ObjectFileLinker::new(true, 0);
        compiler.compile_all(&mut linker, 1).unwrap();
        linker.symbol_bytes("Math::Answer").unwrap().to_vec()
    };
    let optimized = build(true);
    let unoptimized = build(false);
    assert!(
        optimized.len() <= unoptimized.len(),
        "optimized code should not be larger"
    );
    // The multiply itself is folded away.
    assert!(!mnemonics(&optimized).contains(&Mnemonic::Imul));
}

#[test]
fn counters_report_stage_activity() {
    let mut b = TypeSystemBuilder::new();
    let i4 = b.primitive(Primitive::I4);
    let cls = b.class("Math");
    let body = CilBody {
        locals: vec![],
        ops: vec![CilOp::LdcI4(1), CilOp::LdcI4(2), CilOp::Add, CilOp::Ret],
        protected: Vec::new(),
    };
    b.static_method(cls, "Two", MethodSig::new(vec![], Some(i4)), body);
    let layout = Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap());
    let compiler = AssemblyCompiler::new(layout, Options::default());
    let mut linker = ObjectFileLinker::new(true, 0);
    let result = compiler.compile_all(&mut linker, 1).unwrap();
    assert!(result.counters.get("decode.nodes") > 0);
    assert!(result.counters.get("emit.bytes") > 0);
}

#[test]
fn stage_traces_use_block_headers() {
    let mut b = TypeSystemBuilder::new();
    let i4 = b.primitive(Primitive::I4);
    let cls = b.class("Math");
    let body = CilBody {
        locals: vec![],
        ops: vec![CilOp::LdArg(0), CilOp::Ret],
        protected: Vec::new(),
    };
    b.static_method(cls, "Id", MethodSig::new(vec![i4], Some(i4)), body);
    let layout = Arc::new(TypeLayout::new(Arc::new(b.build()), 8, 8).unwrap());
    let options = Options {
        trace_filter: mosac::core::trace::TraceFilter::only(["decode"]),
        ..Options::default()
    };
    let compiler = AssemblyCompiler::new(layout, options);
    let mut linker = ObjectFileLinker::new(true, 0);
    let result = compiler.compile_all(&mut linker, 1).unwrap();
    let trace = &result.traces[0];
    let dump = trace.stage_dump("decode").unwrap();
    assert!(dump.contains("Block #0"));
    assert!(dump.contains("L_0000:"));
}
