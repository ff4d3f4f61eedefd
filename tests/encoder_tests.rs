//! Encoder validation against a disassembler: every form the emitter uses
//! must decode back to the mnemonic and operands it was asked for.

use iced_x86::{Decoder, DecoderOptions, Mnemonic, OpKind, Register};
use mosac::core::instruction::Condition;
use mosac::x64::encoder::Encoder;
use mosac::x64::regs;

fn decode_one(code: &[u8]) -> iced_x86::Instruction {
    let mut decoder = Decoder::with_ip(64, code, 0, DecoderOptions::NONE);
    let instruction = decoder.decode();
    assert_eq!(
        decoder.position(),
        code.len(),
        "trailing bytes after {instruction}"
    );
    instruction
}

#[test]
fn register_moves_decode_back() {
    let mut e = Encoder::new();
    e.mov_rr(true, regs::R12, regs::RSI);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Mov);
    assert_eq!(i.op0_register(), Register::R12);
    assert_eq!(i.op1_register(), Register::RSI);
}

#[test]
fn immediate_moves_decode_back() {
    let mut e = Encoder::new();
    e.mov32_ri(regs::RDI, -7);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Mov);
    assert_eq!(i.op0_register(), Register::EDI);
    assert_eq!(i.immediate32() as i32, -7);
}

#[test]
fn frame_accesses_decode_back() {
    let mut e = Encoder::new();
    e.mov_load(false, regs::RAX, regs::RBP, 16);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Mov);
    assert_eq!(i.op0_register(), Register::EAX);
    assert_eq!(i.memory_base(), Register::RBP);
    assert_eq!(i.memory_displacement64(), 16);
}

#[test]
fn arithmetic_decodes_back() {
    let mut e = Encoder::new();
    e.arith_rr(0x2B, false, regs::RBX, regs::R9);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Sub);
    assert_eq!(i.op0_register(), Register::EBX);
    assert_eq!(i.op1_register(), Register::R9D);
}

#[test]
fn float_arithmetic_selects_width_by_prefix() {
    let mut e = Encoder::new();
    e.sse_arith_rr(0x5C, false, regs::xmm(3), regs::xmm(7));
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Subss);

    let mut e = Encoder::new();
    e.sse_arith_rr(0x5C, true, regs::xmm(3), regs::xmm(7));
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Subsd);
}

#[test]
fn conversions_decode_back() {
    let mut e = Encoder::new();
    e.cvtsi2_rr(true, false, regs::xmm(2), regs::RDX);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Cvtsi2sd);

    let mut e = Encoder::new();
    e.cvtt2si_rr(false, regs::RAX, regs::xmm(1));
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Cvttss2si);
}

#[test]
fn shifts_decode_back() {
    let mut e = Encoder::new();
    e.shift_ri(7, true, regs::R13, 3);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Sar);
    assert_eq!(i.op0_register(), Register::R13);
    assert_eq!(i.immediate8(), 3);
}

#[test]
fn setcc_and_jcc_share_condition_codes() {
    let mut e = Encoder::new();
    e.setcc(Condition::UnsignedLess, regs::RBX);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Setb);

    let mut e = Encoder::new();
    e.jcc(Condition::UnsignedLess);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Jb);
}

#[test]
fn memory_forms_use_the_expected_addressing() {
    let mut e = Encoder::new();
    e.mov_store(true, regs::RBP, -24, regs::R8);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Mov);
    assert_eq!(i.op0_kind(), OpKind::Memory);
    assert_eq!(i.memory_base(), Register::RBP);
    assert_eq!(i.memory_displacement64() as i64, -24);
    assert_eq!(i.op1_register(), Register::R8);
}

#[test]
fn rip_relative_loads_decode_back() {
    let mut e = Encoder::new();
    let hole = e.mov_load_rip(false, regs::RCX);
    e.patch32(hole, 0x100);
    let i = decode_one(e.bytes());
    assert_eq!(i.mnemonic(), Mnemonic::Mov);
    assert!(i.is_ip_rel_memory_operand());
}
