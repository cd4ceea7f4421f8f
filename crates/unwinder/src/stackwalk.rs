//! Stepping from a frame to its caller.
//!
//! A [`FramePointerCursor`] knows two ways to get from a frame to the next
//! older one. Code that registered a [`DynamicUnwindInfo`] is unwound by
//! evaluating that descriptor at the current instruction pointer, which is
//! exact even in the middle of a prologue. Everything else is expected to keep
//! the frame-pointer chain intact, which JIT-compiled methods do:
//!
//! ```text
//!     | ...               |
//!     | Caller Frame      |
//!     | ...               | <-- caller SP = FP + 16    |
//!     |-------------------|                            |
//!     | Return Address    | <-- FP + 8               Stack
//!     | Previous FP       | <-- FP                   Grows
//!     | ...               |                          Down
//!     | Callee Frame      |                            |
//!     | ...               | <-- SP                     V
//! ```
//!
//! A zero frame pointer or a zero return address terminates the chain; that
//! frame is the outermost one. Anything else that does not look like a frame
//! (misaligned frame pointers, a chain that does not move strictly towards
//! older frames) is reported as an error rather than followed.

use crate::arch;
use crate::dynamic::{DynamicTable, DynamicUnwindInfo};
use crate::machine::{Machine, NativeMachine};
use crate::{Cursor, Reg, RegisterSet, UnwindError};

/// A cursor that unwinds with dynamic descriptors and the frame-pointer chain.
#[derive(Clone, Debug)]
pub struct FramePointerCursor<M: Machine> {
    regs: RegisterSet,
    machine: M,
    table: &'static DynamicTable,
}

/// A cursor over the running thread's stack.
pub type NativeCursor = FramePointerCursor<NativeMachine>;

impl<M: Machine> FramePointerCursor<M> {
    /// A cursor at the frame described by `regs`, consulting `table` for
    /// generated code.
    ///
    /// # Safety
    ///
    /// `regs` must describe a frame on the stack `machine` gives access to.
    pub unsafe fn new(machine: M, table: &'static DynamicTable, regs: RegisterSet) -> Self {
        FramePointerCursor {
            regs,
            machine,
            table,
        }
    }

    /// The machine this cursor reads through.
    pub fn machine(&self) -> &M {
        &self.machine
    }

    fn dynamic_info(&self) -> Option<&'static DynamicUnwindInfo> {
        self.table.find(self.regs.ip)
    }

    fn step_frame_pointer(&mut self) -> Result<bool, UnwindError> {
        let fp = self.regs.fp;
        if fp == 0 {
            return Ok(false);
        }
        if !arch::fp_is_aligned(fp) {
            return Err(UnwindError::MisalignedFrame(fp));
        }

        // SAFETY: `fp` is a trusted frame pointer per the contract of `new`,
        // and each step below only ever moves to strictly older frames.
        let (pc, next) = unsafe {
            (
                self.machine
                    .read(fp + arch::RETURN_ADDRESS_FROM_FP_OFFSET)?,
                self.machine.read(fp + arch::NEXT_OLDER_FP_FROM_FP_OFFSET)?,
            )
        };
        if pc == 0 {
            return Ok(false);
        }
        if next != 0 && next <= fp {
            return Err(UnwindError::NonMonotonicFrame { fp, next });
        }

        self.regs.ip = pc;
        self.regs.sp = fp + arch::NEXT_OLDER_SP_FROM_FP_OFFSET;
        self.regs.fp = next;
        Ok(true)
    }
}

impl NativeCursor {
    /// A cursor over the running thread's stack at `regs`, using the global
    /// descriptor table.
    ///
    /// # Safety
    ///
    /// `regs` must describe a live frame of the current thread.
    pub unsafe fn from_registers(regs: RegisterSet) -> Self {
        unsafe { FramePointerCursor::new(NativeMachine, DynamicTable::global(), regs) }
    }

    /// A cursor at the frame of the caller of this function.
    ///
    /// # Safety
    ///
    /// Stepping the returned cursor is only meaningful when the calling code
    /// maintains frame pointers.
    #[inline(always)]
    pub unsafe fn capture() -> Self {
        unsafe { Self::from_registers(arch::capture_registers()) }
    }
}

unsafe impl<M: Machine> Cursor for FramePointerCursor<M> {
    fn get_reg(&self, reg: Reg) -> Result<usize, UnwindError> {
        Ok(self.regs.get(reg))
    }

    fn set_reg(&mut self, reg: Reg, value: usize) -> Result<(), UnwindError> {
        self.regs.set(reg, value);
        Ok(())
    }

    fn step(&mut self) -> Result<bool, UnwindError> {
        log::trace!(
            "step from ip={:#x} sp={:#x} fp={:#x}",
            self.regs.ip,
            self.regs.sp,
            self.regs.fp
        );
        match self.dynamic_info() {
            Some(info) => {
                // SAFETY: the descriptor covers the current IP, so the frame
                // is executing the code it describes.
                let caller = unsafe { info.unwind(&self.regs, &self.machine)? };
                if caller.ip == 0 {
                    return Ok(false);
                }
                self.regs = caller;
                Ok(true)
            }
            None => self.step_frame_pointer(),
        }
    }

    fn return_address_slot(&self) -> Result<usize, UnwindError> {
        match self.dynamic_info() {
            Some(info) => info.return_address_slot(&self.regs),
            None => {
                let fp = self.regs.fp;
                if fp == 0 || !arch::fp_is_aligned(fp) {
                    return Err(UnwindError::MisalignedFrame(fp));
                }
                Ok(fp + arch::RETURN_ADDRESS_FROM_FP_OFFSET)
            }
        }
    }

    unsafe fn write_word(&mut self, addr: usize, value: usize) -> Result<(), UnwindError> {
        unsafe { self.machine.write(addr, value) }
    }

    fn proc_name(&self) -> Option<&'static str> {
        self.dynamic_info().map(|info| info.name())
    }

    fn registers(&self) -> RegisterSet {
        self.regs
    }

    unsafe fn resume(&self) -> ! {
        unsafe { self.machine.resume(&self.regs) }
    }
}
