//! Stack unwinding across JIT-generated code.
//!
//! This crate is the unwinding library the exception backend is built on. It
//! provides a cursor abstraction ([`Cursor`]) that is the canonical answer to
//! "where on the stack are we", and two ways for a cursor to get from a frame
//! to its caller:
//!
//! * Code that has no static unwind information but was generated at runtime
//!   registers a [`DynamicUnwindInfo`] in a [`DynamicTable`]. The descriptor is
//!   a small declarative list of "the CFA is X from here on" and "register R is
//!   saved at CFA+N from here on" operations.
//! * Everything else is expected to maintain the frame-pointer chain, which is
//!   what JIT-compiled methods do on x86-64.
//!
//! The stepping logic is written once against the [`Machine`] trait, so the
//! very same code walks the live stack ([`NativeMachine`]) and an in-memory
//! simulated stack ([`SimMachine`]) that tests use to check unwind tables by
//! actually unwinding through them.

#![deny(missing_docs)]

use thiserror::Error;

mod arch;
mod dynamic;
pub mod eh_frame;
mod machine;
pub mod sim;
mod stackwalk;

pub use arch::{
    NEXT_OLDER_FP_FROM_FP_OFFSET, NEXT_OLDER_SP_FROM_FP_OFFSET, RETURN_ADDRESS_FROM_FP_OFFSET,
};
pub use dynamic::{DynamicTable, DynamicUnwindInfo, UnwindOp, UnwindTableBuilder};
pub use machine::{Machine, NativeMachine};
pub use sim::{Resumed, SimCursor, SimFrame, SimMachine, SimStack, SimStackBuilder};
pub use stackwalk::{FramePointerCursor, NativeCursor};

/// A register the unwinder knows how to track across frames.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Reg {
    /// The instruction pointer. As a saved register this is the return address.
    Ip,
    /// The stack pointer.
    Sp,
    /// The frame pointer (`rbp`).
    Fp,
    /// Callee-saved `rbx`.
    Rbx,
    /// Callee-saved `r12`.
    R12,
    /// Callee-saved `r13`.
    R13,
    /// Callee-saved `r14`.
    R14,
    /// Callee-saved `r15`.
    R15,
}

impl Reg {
    /// The callee-saved registers other than the frame pointer, in the order
    /// they are laid out in a [`RegisterSet`].
    pub const CALLEE_SAVED: [Reg; 5] = [Reg::Rbx, Reg::R12, Reg::R13, Reg::R14, Reg::R15];

    /// DWARF register number, with `Ip` mapped to the return-address column.
    pub fn dwarf(self) -> gimli::Register {
        match self {
            Reg::Ip => gimli::X86_64::RA,
            Reg::Sp => gimli::X86_64::RSP,
            Reg::Fp => gimli::X86_64::RBP,
            Reg::Rbx => gimli::X86_64::RBX,
            Reg::R12 => gimli::X86_64::R12,
            Reg::R13 => gimli::X86_64::R13,
            Reg::R14 => gimli::X86_64::R14,
            Reg::R15 => gimli::X86_64::R15,
        }
    }
}

/// The register state of one frame.
///
/// The layout is fixed: generated code (the call-filter trampoline) and the
/// context-restore routine load registers from it by offset.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterSet {
    /// Instruction pointer.
    pub ip: usize,
    /// Stack pointer.
    pub sp: usize,
    /// Frame pointer.
    pub fp: usize,
    /// `rbx`.
    pub rbx: usize,
    /// `r12`.
    pub r12: usize,
    /// `r13`.
    pub r13: usize,
    /// `r14`.
    pub r14: usize,
    /// `r15`.
    pub r15: usize,
}

impl RegisterSet {
    /// Byte offset of `reg` within the `#[repr(C)]` layout.
    pub const fn offset_of(reg: Reg) -> i32 {
        let index = match reg {
            Reg::Ip => 0,
            Reg::Sp => 1,
            Reg::Fp => 2,
            Reg::Rbx => 3,
            Reg::R12 => 4,
            Reg::R13 => 5,
            Reg::R14 => 6,
            Reg::R15 => 7,
        };
        index * core::mem::size_of::<usize>() as i32
    }

    /// Read one register.
    pub fn get(&self, reg: Reg) -> usize {
        match reg {
            Reg::Ip => self.ip,
            Reg::Sp => self.sp,
            Reg::Fp => self.fp,
            Reg::Rbx => self.rbx,
            Reg::R12 => self.r12,
            Reg::R13 => self.r13,
            Reg::R14 => self.r14,
            Reg::R15 => self.r15,
        }
    }

    /// Write one register.
    pub fn set(&mut self, reg: Reg, value: usize) {
        let slot = match reg {
            Reg::Ip => &mut self.ip,
            Reg::Sp => &mut self.sp,
            Reg::Fp => &mut self.fp,
            Reg::Rbx => &mut self.rbx,
            Reg::R12 => &mut self.r12,
            Reg::R13 => &mut self.r13,
            Reg::R14 => &mut self.r14,
            Reg::R15 => &mut self.r15,
        };
        *slot = value;
    }
}

/// Failures of the unwinding primitives.
///
/// The exception backend treats every one of these as stack corruption; they
/// are typed so the fatal message says what went wrong.
#[derive(Debug, Error)]
pub enum UnwindError {
    /// A stack slot could not be read or written.
    #[error("no readable stack word at {0:#x}")]
    BadAddress(usize),
    /// A frame pointer violated the ABI's alignment.
    #[error("frame pointer {0:#x} is not 16-byte aligned")]
    MisalignedFrame(usize),
    /// The frame-pointer chain does not move strictly towards older frames.
    #[error("frame pointer chain goes from {fp:#x} to {next:#x}")]
    NonMonotonicFrame {
        /// The frame pointer being stepped from.
        fp: usize,
        /// The caller frame pointer found in its slot.
        next: usize,
    },
    /// A dynamic descriptor has no CFA rule in effect at `pc`.
    #[error("no CFA rule in effect at {pc:#x}")]
    NoCfaRule {
        /// The instruction pointer being unwound.
        pc: usize,
    },
    /// A dynamic descriptor does not say where the return address lives at `pc`.
    #[error("no saved return address in effect at {pc:#x}")]
    MissingReturnAddress {
        /// The instruction pointer being unwound.
        pc: usize,
    },
    /// A descriptor covers no code.
    #[error("descriptor `{name}` covers an empty range {start:#x}..{end:#x}")]
    EmptyRange {
        /// Descriptor name.
        name: &'static str,
        /// First covered byte.
        start: usize,
        /// One past the last covered byte.
        end: usize,
    },
    /// A descriptor overlaps one that is already registered.
    #[error("descriptor `{name}` at {start:#x}..{end:#x} overlaps `{existing}`")]
    Overlap {
        /// Descriptor being registered.
        name: &'static str,
        /// First covered byte.
        start: usize,
        /// One past the last covered byte.
        end: usize,
        /// Name of the registered descriptor it collides with.
        existing: &'static str,
    },
    /// Operations were not given in instruction order.
    #[error("unwind operations must be ordered by instruction offset ({when} after {previous})")]
    UnorderedOps {
        /// Offset of the out-of-order operation.
        when: u32,
        /// Offset of the operation before it.
        previous: u32,
    },
    /// An operation takes effect beyond the end of the code it describes.
    #[error("unwind operation at offset {when} is outside the {len}-byte code range")]
    OpOutOfRange {
        /// Offset of the operation.
        when: u32,
        /// Length of the described code.
        len: usize,
    },
    /// `.eh_frame` encoding failed.
    #[error("failed to encode .eh_frame: {0}")]
    EhFrame(#[from] gimli::write::Error),
}

/// A position on a stack, able to move to older frames.
///
/// # Safety
///
/// Implementations must report register values that describe one real frame;
/// callers feed them back into [`Cursor::resume`], which installs them on the
/// processor.
pub unsafe trait Cursor: Clone {
    /// Read a register of the current frame.
    fn get_reg(&self, reg: Reg) -> Result<usize, UnwindError>;

    /// Overwrite a register of the current frame. Only affects the cursor, not
    /// the memory of the stack.
    fn set_reg(&mut self, reg: Reg, value: usize) -> Result<(), UnwindError>;

    /// Move to the caller's frame.
    ///
    /// Returns `Ok(false)`, leaving the cursor untouched, when the current
    /// frame is the outermost one.
    fn step(&mut self) -> Result<bool, UnwindError>;

    /// The stack address where the current frame keeps its return address.
    fn return_address_slot(&self) -> Result<usize, UnwindError>;

    /// Store `value` in the stack word at `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be a slot of a frame that is live and will not be returned
    /// to expecting the old value.
    unsafe fn write_word(&mut self, addr: usize, value: usize) -> Result<(), UnwindError>;

    /// Name of the dynamically registered code covering the current IP.
    fn proc_name(&self) -> Option<&'static str>;

    /// All registers of the current frame.
    fn registers(&self) -> RegisterSet;

    /// Install the current frame's registers on the processor and jump to its
    /// instruction pointer.
    ///
    /// # Safety
    ///
    /// The frame must still be live and its registers must be what the code
    /// at the instruction pointer expects.
    unsafe fn resume(&self) -> !;
}
