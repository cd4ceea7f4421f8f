//! Code and unwind tables of the x86-64 trampolines.
//!
//! Emission records, for each trampoline, the offsets at which its frame
//! changes shape in a [`FrameLayout`]. The unwind table is then derived from
//! the layout alone by [`unwind_table`], so the two can be checked
//! independently: the tests below unwind through every instruction boundary
//! of a simulated frame instead of inspecting bytes.

use cranelift_assembler_x64::{
    Amode, AmodeOffset, AmodeOffsetPlusKnownOffset, GprMem, Imm32, Imm64, Inst, Registers,
    TrapCode, gpr, inst,
};
use jit_eh_unwinder::{Reg, RegisterSet, UnwindTableBuilder};

/// Bytes the throw trampolines push to build a [`RegisterSet`].
const SPILL_SIZE: usize = 64;
const _: () = assert!(core::mem::size_of::<RegisterSet>() == SPILL_SIZE);

/// Trampoline operands are always physical registers.
#[derive(Debug)]
pub(crate) struct Regs;

impl Registers for Regs {
    type ReadGpr = u8;
    type ReadWriteGpr = u8;
    type WriteGpr = u8;
    type ReadXmm = u8;
    type ReadWriteXmm = u8;
    type WriteXmm = u8;
}

/// Where the frame of a trampoline changes shape.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct FrameLayout {
    /// After `push rbp`.
    pub pushed_fp: u32,
    /// After `mov rbp, rsp`.
    pub established: u32,
    /// After each push of a callee-saved register, in push order.
    pub saved: Vec<(Reg, u32)>,
    /// After `rbp` is pushed once more and replaced by a foreign frame
    /// pointer, with `rsp` then `cfa_offset` bytes below the CFA.
    pub fp_borrowed: Option<(u32, i32)>,
    /// After the trampoline's own `rbp` is popped back.
    pub fp_returned: Option<u32>,
    /// After the frame is torn down, at the final `ret`.
    pub torn_down: Option<u32>,
}

/// A trampoline body and the layout of its frame.
#[derive(Clone, Debug)]
pub(crate) struct Emitted {
    pub code: Vec<u8>,
    pub layout: FrameLayout,
}

/// Unwind operations describing a frame with `layout`.
pub(crate) fn unwind_table(name: &'static str, layout: &FrameLayout) -> UnwindTableBuilder {
    let mut table = UnwindTableBuilder::new(name);
    // At entry only the return address is on the stack.
    table
        .define_cfa(0, Reg::Sp, 8)
        .save(0, Reg::Ip, -8)
        .define_cfa(layout.pushed_fp, Reg::Sp, 16)
        .save(layout.pushed_fp, Reg::Fp, -16)
        .define_cfa(layout.established, Reg::Fp, 16);
    for (i, &(reg, when)) in layout.saved.iter().enumerate() {
        table.save(when, reg, -24 - 8 * i as i32);
    }
    if let Some((when, offset)) = layout.fp_borrowed {
        table.define_cfa(when, Reg::Sp, offset);
    }
    if let Some(when) = layout.fp_returned {
        table.define_cfa(when, Reg::Fp, 16);
    }
    if let Some(when) = layout.torn_down {
        table.define_cfa(when, Reg::Sp, 8);
    }
    table
}

/// Hardware encoding of the register holding `reg`.
fn enc(reg: Reg) -> u8 {
    match reg {
        Reg::Sp => gpr::enc::RSP,
        Reg::Fp => gpr::enc::RBP,
        Reg::Rbx => gpr::enc::RBX,
        Reg::R12 => gpr::enc::R12,
        Reg::R13 => gpr::enc::R13,
        Reg::R14 => gpr::enc::R14,
        Reg::R15 => gpr::enc::R15,
        Reg::Ip => unreachable!("the instruction pointer is not a general purpose register"),
    }
}

/// `[base + disp]`
fn mem(base: u8, disp: i32) -> GprMem<u8, u8> {
    GprMem::Mem(Amode::ImmReg {
        base,
        simm32: AmodeOffsetPlusKnownOffset {
            simm32: AmodeOffset::new(disp),
            offset: None,
        },
        trap: None,
    })
}

/// Encodes instructions and tracks the offset of the next one.
#[derive(Default)]
struct Emitter {
    code: Vec<u8>,
    layout: FrameLayout,
}

impl Emitter {
    fn emit(&mut self, inst: impl Into<Inst<Regs>>) {
        inst.into().encode(&mut self.code);
    }

    fn offset(&self) -> u32 {
        self.code.len() as u32
    }

    fn push(&mut self, reg: u8) {
        self.emit(inst::pushq_o::<Regs>::new(reg));
    }

    fn pop(&mut self, reg: u8) {
        self.emit(inst::popq_o::<Regs>::new(reg));
    }

    /// `mov dst, src`
    fn mov(&mut self, dst: u8, src: u8) {
        self.emit(inst::movq_mr::<Regs>::new(GprMem::Gpr(dst), src));
    }

    /// `mov dst, [base + disp]`
    fn load(&mut self, dst: u8, base: u8, disp: i32) {
        self.emit(inst::movq_rm::<Regs>::new(dst, mem(base, disp)));
    }

    fn prologue(&mut self) {
        self.push(gpr::enc::RBP);
        self.layout.pushed_fp = self.offset();
        self.mov(gpr::enc::RBP, gpr::enc::RSP);
        self.layout.established = self.offset();
    }

    /// Push the trampoline frame's registers as a [`RegisterSet`], which
    /// then starts at `rsp`.
    ///
    /// The `ip` slot is left for the entry point to fill: it is called with
    /// `rsp` at the register set, so its return address, an IP inside the
    /// trampoline after the frame is established, is the word just below.
    fn push_frame(&mut self) {
        for reg in [Reg::R15, Reg::R14, Reg::R13, Reg::R12, Reg::Rbx, Reg::Fp] {
            self.push(enc(reg));
        }
        self.push(gpr::enc::RSP);
        self.push(gpr::enc::RAX);
    }

    fn call_entry(&mut self, entry: usize) {
        self.emit(inst::movabsq_oi::<Regs>::new(
            gpr::enc::RAX,
            Imm64::new(entry as u64),
        ));
        self.emit(inst::callq_m::<Regs>::new(GprMem::Gpr(gpr::enc::RAX)));
        // The entry points never return.
        self.emit(inst::ud2_zo::new(TrapCode(core::num::NonZeroU8::MIN)));
    }

    fn finish(self) -> Emitted {
        Emitted {
            code: self.code,
            layout: self.layout,
        }
    }
}

/// `extern "C" fn(exception)`: calls
/// `entry(exception, regs: *const RegisterSet, rethrow: u32)`.
pub(crate) fn emit_throw(rethrow: bool, entry: usize) -> Emitted {
    let mut e = Emitter::default();
    e.prologue();
    e.push_frame();
    // rdi already holds the exception.
    e.mov(gpr::enc::RSI, gpr::enc::RSP);
    e.emit(inst::movl_oi::<Regs>::new(
        gpr::enc::RDX,
        Imm32::new(u32::from(rethrow)),
    ));
    e.call_entry(entry);
    e.finish()
}

/// `extern "C" fn(token: u32, offset: u32)`: calls
/// `entry(token, offset, regs: *const RegisterSet)`.
pub(crate) fn emit_throw_token(entry: usize) -> Emitted {
    let mut e = Emitter::default();
    e.prologue();
    e.push_frame();
    // rdi and rsi already hold the token and the offset.
    e.mov(gpr::enc::RDX, gpr::enc::RSP);
    e.call_entry(entry);
    e.finish()
}

/// `extern "C" fn(regs: *const RegisterSet, target: usize, exception: usize) -> usize`.
///
/// Saves its own callee-saved registers, installs `rbp`, `rbx` and
/// `r12`-`r15` from `regs`, calls `target(exception)` and returns its result.
pub(crate) fn emit_call_filter() -> Emitted {
    let mut e = Emitter::default();
    e.prologue();

    for reg in Reg::CALLEE_SAVED {
        e.push(enc(reg));
        let when = e.offset();
        e.layout.saved.push((reg, when));
    }

    e.mov(gpr::enc::RAX, gpr::enc::RSI);
    e.mov(gpr::enc::R11, gpr::enc::RDI);
    e.mov(gpr::enc::RDI, gpr::enc::RDX);
    for reg in Reg::CALLEE_SAVED {
        e.load(enc(reg), gpr::enc::R11, RegisterSet::offset_of(reg));
    }

    // Keep our rbp on the stack while the handler's frame pointer is live;
    // this also realigns the stack for the call.
    e.push(gpr::enc::RBP);
    let borrowed_cfa = 16 + 8 * (Reg::CALLEE_SAVED.len() as i32 + 1);
    e.layout.fp_borrowed = Some((e.offset(), borrowed_cfa));
    e.load(
        gpr::enc::RBP,
        gpr::enc::R11,
        RegisterSet::offset_of(Reg::Fp),
    );
    e.emit(inst::callq_m::<Regs>::new(GprMem::Gpr(gpr::enc::RAX)));
    e.pop(gpr::enc::RBP);
    e.layout.fp_returned = Some(e.offset());

    for reg in Reg::CALLEE_SAVED.iter().rev() {
        e.pop(enc(*reg));
    }
    e.pop(gpr::enc::RBP);
    e.layout.torn_down = Some(e.offset());
    e.emit(inst::retq_zo::new());

    e.finish()
}
