// Byte-level x86-64 encoding. Every method appends one instruction to the buffer:
// legacy prefixes first, then REX when any extended register, width or 8-bit
// uniform-register bit demands it, then the opcode bytes, modR/M, an optional SIB for
// RSP/R12 bases, displacement and immediate. Memory operands always use the
// mod=10/disp32 form, so the emitted length of a form never depends on operand values
// and re-encoding a node yields identical bytes. Methods that leave a hole for the
// linker or a branch fixup return the hole's buffer offset.

use crate::core::instruction::Condition;
use crate::core::operand::PhysReg;

/// Condition-code nibble shared by Jcc (0F 80+cc) and SETcc (0F 90+cc).
pub fn condition_code(cond: Condition) -> u8 {
    match cond {
        Condition::UnsignedLess | Condition::Carry => 0x2,
        Condition::UnsignedGreaterOrEqual | Condition::NoCarry => 0x3,
        Condition::Equal => 0x4,
        Condition::NotEqual => 0x5,
        Condition::UnsignedLessOrEqual => 0x6,
        Condition::UnsignedGreater => 0x7,
        Condition::Less => 0xC,
        Condition::GreaterOrEqual => 0xD,
        Condition::LessOrEqual => 0xE,
        Condition::Greater => 0xF,
    }
}

/// Append-only instruction buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Patch a previously returned 32-bit hole.
    pub fn patch32(&mut self, at: usize, value: i32) {
        self.buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn emit8(&mut self, byte: u8) {
        self.buf.push(byte);
    }

    fn emit32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    fn emit64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// REX prefix; emitted when any bit is set or when forced (8-bit access
    /// to SPL/BPL/SIL/DIL).
    fn rex(&mut self, w: bool, reg: u8, rm: u8, force: bool) {
        let mut rex = 0x40u8;
        if w {
            rex |= 0x08;
        }
        if reg >= 8 {
            rex |= 0x04;
        }
        if rm >= 8 {
            rex |= 0x01;
        }
        if rex != 0x40 || force {
            self.emit8(rex);
        }
    }

    fn modrm_rr(&mut self, reg: u8, rm: u8) {
        self.emit8(0xC0 | ((reg & 7) << 3) | (rm & 7));
    }

    /// mod=10 disp32 memory form; RSP/R12 bases take the SIB byte.
    fn modrm_mem(&mut self, reg: u8, base: u8, disp: i32) {
        self.emit8(0x80 | ((reg & 7) << 3) | (base & 7));
        if base & 7 == 4 {
            self.emit8(0x24);
        }
        self.emit32(disp);
    }

    /// RIP-relative memory form. Returns the disp32 hole offset.
    fn modrm_rip(&mut self, reg: u8) -> usize {
        self.emit8(((reg & 7) << 3) | 0x05);
        let at = self.buf.len();
        self.emit32(0);
        at
    }

    fn instr_rr(&mut self, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8, rm: u8) {
        if let Some(p) = prefix {
            self.emit8(p);
        }
        self.rex(w, reg, rm, false);
        self.buf.extend_from_slice(opcode);
        self.modrm_rr(reg, rm);
    }

    fn instr_mem(
        &mut self,
        prefix: Option<u8>,
        w: bool,
        opcode: &[u8],
        reg: u8,
        base: u8,
        disp: i32,
    ) {
        if let Some(p) = prefix {
            self.emit8(p);
        }
        self.rex(w, reg, base, false);
        self.buf.extend_from_slice(opcode);
        self.modrm_mem(reg, base, disp);
    }

    fn instr_rip(&mut self, prefix: Option<u8>, w: bool, opcode: &[u8], reg: u8) -> usize {
        if let Some(p) = prefix {
            self.emit8(p);
        }
        self.rex(w, reg, 0, false);
        self.buf.extend_from_slice(opcode);
        self.modrm_rip(reg)
    }

    // ---- moves ----

    pub fn mov_rr(&mut self, wide: bool, dst: PhysReg, src: PhysReg) {
        self.instr_rr(None, wide, &[0x8B], dst.id, src.id);
    }

    pub fn mov32_ri(&mut self, dst: PhysReg, imm: i32) {
        self.rex(false, 0, dst.id, false);
        self.emit8(0xB8 + (dst.id & 7));
        self.emit32(imm);
    }

    /// mov r64, imm64. Returns the imm64 hole offset for absolute
    /// relocations.
    pub fn mov64_ri(&mut self, dst: PhysReg, imm: i64) -> usize {
        self.rex(true, 0, dst.id, false);
        self.emit8(0xB8 + (dst.id & 7));
        let at = self.buf.len();
        self.emit64(imm);
        at
    }

    pub fn mov_load(&mut self, wide: bool, dst: PhysReg, base: PhysReg, disp: i32) {
        self.instr_mem(None, wide, &[0x8B], dst.id, base.id, disp);
    }

    pub fn mov_store(&mut self, wide: bool, base: PhysReg, disp: i32, src: PhysReg) {
        self.instr_mem(None, wide, &[0x89], src.id, base.id, disp);
    }

    pub fn mov_store8(&mut self, base: PhysReg, disp: i32, src: PhysReg) {
        self.rex(false, src.id, base.id, src.id >= 4);
        self.emit8(0x88);
        self.modrm_mem(src.id, base.id, disp);
    }

    pub fn mov_store16(&mut self, base: PhysReg, disp: i32, src: PhysReg) {
        self.emit8(0x66);
        self.rex(false, src.id, base.id, false);
        self.emit8(0x89);
        self.modrm_mem(src.id, base.id, disp);
    }

    pub fn mov_load_rip(&mut self, wide: bool, dst: PhysReg) -> usize {
        self.instr_rip(None, wide, &[0x8B], dst.id)
    }

    pub fn mov_store_rip(&mut self, wide: bool, src: PhysReg) -> usize {
        self.instr_rip(None, wide, &[0x89], src.id)
    }

    pub fn mov_store8_rip(&mut self, src: PhysReg) -> usize {
        self.rex(false, src.id, 0, src.id >= 4);
        self.emit8(0x88);
        self.modrm_rip(src.id)
    }

    pub fn mov_store16_rip(&mut self, src: PhysReg) -> usize {
        self.emit8(0x66);
        self.rex(false, src.id, 0, false);
        self.emit8(0x89);
        self.modrm_rip(src.id)
    }

    // ---- widening moves ----

    pub fn movsx8_rr(&mut self, dst: PhysReg, src: PhysReg) {
        self.instr_rr(None, false, &[0x0F, 0xBE], dst.id, src.id);
    }

    pub fn movsx16_rr(&mut self, dst: PhysReg, src: PhysReg) {
        self.instr_rr(None, false, &[0x0F, 0xBF], dst.id, src.id);
    }

    pub fn movzx8_rr(&mut self, dst: PhysReg, src: PhysReg) {
        self.instr_rr(None, false, &[0x0F, 0xB6], dst.id, src.id);
    }

    pub fn movzx16_rr(&mut self, dst: PhysReg, src: PhysReg) {
        self.instr_rr(None, false, &[0x0F, 0xB7], dst.id, src.id);
    }

    pub fn movsxd_rr(&mut self, dst: PhysReg, src: PhysReg) {
        self.instr_rr(None, true, &[0x63], dst.id, src.id);
    }

    pub fn movsx8_load(&mut self, dst: PhysReg, base: PhysReg, disp: i32) {
        self.instr_mem(None, false, &[0x0F, 0xBE], dst.id, base.id, disp);
    }

    pub fn movsx16_load(&mut self, dst: PhysReg, base: PhysReg, disp: i32) {
        self.instr_mem(None, false, &[0x0F, 0xBF], dst.id, base.id, disp);
    }

    pub fn movzx8_load(&mut self, dst: PhysReg, base: PhysReg, disp: i32) {
        self.instr_mem(None, false, &[0x0F, 0xB6], dst.id, base.id, disp);
    }

    pub fn movzx16_load(&mut self, dst: PhysReg, base: PhysReg, disp: i32) {
        self.instr_mem(None, false, &[0x0F, 0xB7], dst.id, base.id, disp);
    }

    pub fn movsx8_load_rip(&mut self, dst: PhysReg) -> usize {
        self.instr_rip(None, false, &[0x0F, 0xBE], dst.id)
    }

    pub fn movsx16_load_rip(&mut self, dst: PhysReg) -> usize {
        self.instr_rip(None, false, &[0x0F, 0xBF], dst.id)
    }

    pub fn movzx8_load_rip(&mut self, dst: PhysReg) -> usize {
        self.instr_rip(None, false, &[0x0F, 0xB6], dst.id)
    }

    pub fn movzx16_load_rip(&mut self, dst: PhysReg) -> usize {
        self.instr_rip(None, false, &[0x0F, 0xB7], dst.id)
    }

    // ---- integer arithmetic ----

    /// reg <- reg op r/m forms: ADD 03, ADC 13, SUB 2B, SBB 1B, AND 23,
    /// OR 0B, XOR 33, CMP 3B.
    pub fn arith_rr(&mut self, opcode: u8, wide: bool, dst: PhysReg, src: PhysReg) {
        self.instr_rr(None, wide, &[opcode], dst.id, src.id);
    }

    /// 81 /n imm32 group: ADD 0, OR 1, ADC 2, SBB 3, AND 4, SUB 5, XOR 6,
    /// CMP 7.
    pub fn arith_ri(&mut self, group: u8, wide: bool, dst: PhysReg, imm: i32) {
        self.rex(wide, 0, dst.id, false);
        self.emit8(0x81);
        self.modrm_rr(group, dst.id);
        self.emit32(imm);
    }

    pub fn imul_rr(&mut self, wide: bool, dst: PhysReg, src: PhysReg) {
        self.instr_rr(None, wide, &[0x0F, 0xAF], dst.id, src.id);
    }

    pub fn imul_ri(&mut self, wide: bool, dst: PhysReg, src: PhysReg, imm: i32) {
        self.rex(wide, dst.id, src.id, false);
        self.emit8(0x69);
        self.modrm_rr(dst.id, src.id);
        self.emit32(imm);
    }

    pub fn not_r(&mut self, wide: bool, reg: PhysReg) {
        self.rex(wide, 0, reg.id, false);
        self.emit8(0xF7);
        self.modrm_rr(2, reg.id);
    }

    /// Shift group C1/D3: SHL 4, SHR 5, SAR 7.
    pub fn shift_ri(&mut self, group: u8, wide: bool, reg: PhysReg, imm: u8) {
        self.rex(wide, 0, reg.id, false);
        self.emit8(0xC1);
        self.modrm_rr(group, reg.id);
        self.emit8(imm);
    }

    pub fn shift_cl(&mut self, group: u8, wide: bool, reg: PhysReg) {
        self.rex(wide, 0, reg.id, false);
        self.emit8(0xD3);
        self.modrm_rr(group, reg.id);
    }

    pub fn cdq(&mut self) {
        self.emit8(0x99);
    }

    pub fn cqo(&mut self) {
        self.emit8(0x48);
        self.emit8(0x99);
    }

    /// F7 group: DIV 6, IDIV 7.
    pub fn div_r(&mut self, group: u8, wide: bool, reg: PhysReg) {
        self.rex(wide, 0, reg.id, false);
        self.emit8(0xF7);
        self.modrm_rr(group, reg.id);
    }

    // ---- flags and control flow ----

    pub fn setcc(&mut self, cond: Condition, dst: PhysReg) {
        self.rex(false, 0, dst.id, dst.id >= 4);
        self.emit8(0x0F);
        self.emit8(0x90 + condition_code(cond));
        self.modrm_rr(0, dst.id);
    }

    /// Jcc rel32. Returns the rel32 hole offset.
    pub fn jcc(&mut self, cond: Condition) -> usize {
        self.emit8(0x0F);
        self.emit8(0x80 + condition_code(cond));
        let at = self.buf.len();
        self.emit32(0);
        at
    }

    /// JMP rel32. Returns the rel32 hole offset.
    pub fn jmp(&mut self) -> usize {
        self.emit8(0xE9);
        let at = self.buf.len();
        self.emit32(0);
        at
    }

    /// CALL rel32. Returns the rel32 hole offset.
    pub fn call(&mut self) -> usize {
        self.emit8(0xE8);
        let at = self.buf.len();
        self.emit32(0);
        at
    }

    pub fn call_r(&mut self, reg: PhysReg) {
        self.rex(false, 0, reg.id, false);
        self.emit8(0xFF);
        self.modrm_rr(2, reg.id);
    }

    pub fn push_r(&mut self, reg: PhysReg) {
        self.rex(false, 0, reg.id, false);
        self.emit8(0x50 + (reg.id & 7));
    }

    pub fn push_imm32(&mut self, imm: i32) {
        self.emit8(0x68);
        self.emit32(imm);
    }

    pub fn pop_r(&mut self, reg: PhysReg) {
        self.rex(false, 0, reg.id, false);
        self.emit8(0x58 + (reg.id & 7));
    }

    pub fn ret(&mut self) {
        self.emit8(0xC3);
    }

    // ---- scalar SSE ----

    /// Scalar-single ops use the F3 prefix, scalar-double F2; the operand
    /// width alone selects between them.
    fn sse_prefix(double: bool) -> u8 {
        if double {
            0xF2
        } else {
            0xF3
        }
    }

    pub fn sse_mov_rr(&mut self, double: bool, dst: PhysReg, src: PhysReg) {
        self.instr_rr(
            Some(Self::sse_prefix(double)),
            false,
            &[0x0F, 0x10],
            dst.id,
            src.id,
        );
    }

    pub fn sse_load(&mut self, double: bool, dst: PhysReg, base: PhysReg, disp: i32) {
        self.instr_mem(
            Some(Self::sse_prefix(double)),
            false,
            &[0x0F, 0x10],
            dst.id,
            base.id,
            disp,
        );
    }

    pub fn sse_store(&mut self, double: bool, base: PhysReg, disp: i32, src: PhysReg) {
        self.instr_mem(
            Some(Self::sse_prefix(double)),
            false,
            &[0x0F, 0x11],
            src.id,
            base.id,
            disp,
        );
    }

    pub fn sse_load_rip(&mut self, double: bool, dst: PhysReg) -> usize {
        self.instr_rip(Some(Self::sse_prefix(double)), false, &[0x0F, 0x10], dst.id)
    }

    pub fn sse_store_rip(&mut self, double: bool, src: PhysReg) -> usize {
        self.instr_rip(Some(Self::sse_prefix(double)), false, &[0x0F, 0x11], src.id)
    }

    /// 0F 58 add, 0F 5C sub, 0F 59 mul, 0F 5E div, behind F3/F2.
    pub fn sse_arith_rr(&mut self, opcode: u8, double: bool, dst: PhysReg, src: PhysReg) {
        self.instr_rr(
            Some(Self::sse_prefix(double)),
            false,
            &[0x0F, opcode],
            dst.id,
            src.id,
        );
    }

    pub fn ucomi_rr(&mut self, double: bool, a: PhysReg, b: PhysReg) {
        if double {
            self.emit8(0x66);
        }
        self.rex(false, a.id, b.id, false);
        self.buf.extend_from_slice(&[0x0F, 0x2E]);
        self.modrm_rr(a.id, b.id);
    }

    pub fn cvtsi2_rr(&mut self, double: bool, wide_src: bool, dst: PhysReg, src: PhysReg) {
        self.instr_rr(
            Some(Self::sse_prefix(double)),
            wide_src,
            &[0x0F, 0x2A],
            dst.id,
            src.id,
        );
    }

    pub fn cvtss2sd_rr(&mut self, dst: PhysReg, src: PhysReg) {
        self.instr_rr(Some(0xF3), false, &[0x0F, 0x5A], dst.id, src.id);
    }

    pub fn cvtsd2ss_rr(&mut self, dst: PhysReg, src: PhysReg) {
        self.instr_rr(Some(0xF2), false, &[0x0F, 0x5A], dst.id, src.id);
    }

    pub fn cvtt2si_rr(&mut self, double: bool, dst: PhysReg, src: PhysReg) {
        self.instr_rr(
            Some(Self::sse_prefix(double)),
            false,
            &[0x0F, 0x2C],
            dst.id,
            src.id,
        );
    }

    /// movd/movq xmm <- r32/r64, for materializing float constants.
    pub fn movd_xr(&mut self, wide: bool, dst: PhysReg, src: PhysReg) {
        self.emit8(0x66);
        self.rex(wide, dst.id, src.id, false);
        self.buf.extend_from_slice(&[0x0F, 0x6E]);
        self.modrm_rr(dst.id, src.id);
    }
}
