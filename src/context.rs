//! The processor context handed between the frame walker and the dispatch
//! engine.

use crate::fatal::OrFatal;
use jit_eh_unwinder::{Cursor, NativeCursor, Reg, RegisterSet};

/// Execution state of one frame: its instruction pointer, stack pointer and
/// frame pointer, plus the unwinder cursor positioned at that frame.
///
/// The scalar fields are derived from the cursor and re-derived after every
/// step, so both always describe the same frame. The frame pointer here is
/// the stack pointer of the *caller*, i.e. the canonical frame address of
/// this frame.
///
/// Once a step finds no caller, the context is marked as the end of the
/// stack and stays at the outermost frame.
#[derive(Clone, Debug)]
pub struct ProcessorContext<C> {
    ip: usize,
    sp: usize,
    fp: usize,
    end_of_stack: bool,
    cursor: C,
}

impl<C: Cursor> ProcessorContext<C> {
    /// A context for the frame `cursor` is positioned at.
    pub fn from_cursor(cursor: C) -> Self {
        let mut ctx = ProcessorContext {
            ip: 0,
            sp: 0,
            fp: 0,
            end_of_stack: false,
            cursor,
        };
        ctx.refresh();
        ctx
    }

    /// Instruction pointer of the frame.
    pub fn ip(&self) -> usize {
        self.ip
    }

    /// Stack pointer of the frame.
    pub fn sp(&self) -> usize {
        self.sp
    }

    /// Frame pointer of the frame: the stack pointer of its caller.
    pub fn fp(&self) -> usize {
        self.fp
    }

    /// Whether a step has already failed to find a caller of this frame.
    pub fn is_end_of_stack(&self) -> bool {
        self.end_of_stack
    }

    /// The underlying cursor.
    pub fn cursor(&self) -> &C {
        &self.cursor
    }

    /// All registers the cursor tracks for this frame.
    pub fn registers(&self) -> RegisterSet {
        self.cursor.registers()
    }

    /// Set the instruction pointer execution resumes at.
    pub fn set_ip(&mut self, ip: usize) {
        self.cursor
            .set_reg(Reg::Ip, ip)
            .or_fatal("failed to set the instruction pointer");
        self.ip = ip;
    }

    /// Set the stack pointer execution resumes with.
    pub fn set_sp(&mut self, sp: usize) {
        self.cursor
            .set_reg(Reg::Sp, sp)
            .or_fatal("failed to set the stack pointer");
        self.sp = sp;
    }

    /// Overwrite a callee-saved register of the frame.
    pub fn set_reg(&mut self, reg: Reg, value: usize) {
        self.cursor
            .set_reg(reg, value)
            .or_fatal("failed to set a register");
        match reg {
            Reg::Ip => self.ip = value,
            Reg::Sp => self.sp = value,
            _ => {}
        }
    }

    /// Move to the caller's frame, returning `false` at the outermost frame.
    pub fn step_to_caller(&mut self) -> bool {
        let moved = self
            .cursor
            .step()
            .or_fatal("failed to unwind to the caller frame");
        if moved {
            self.refresh();
        } else {
            self.end_of_stack = true;
        }
        moved
    }

    pub(crate) fn cursor_mut(&mut self) -> &mut C {
        &mut self.cursor
    }

    /// Re-derive the scalar fields from the cursor.
    ///
    /// The frame pointer is taken from a copy of the cursor stepped once; at
    /// the outermost frame the copy stays put and reports this frame's own
    /// stack pointer.
    pub fn refresh(&mut self) {
        self.ip = self
            .cursor
            .get_reg(Reg::Ip)
            .or_fatal("failed to read the instruction pointer");
        self.sp = self
            .cursor
            .get_reg(Reg::Sp)
            .or_fatal("failed to read the stack pointer");

        let mut parent = self.cursor.clone();
        parent
            .step()
            .or_fatal("failed to unwind to the parent frame");
        self.fp = parent
            .get_reg(Reg::Sp)
            .or_fatal("failed to read the parent stack pointer");
    }

    /// Transfer control to this context.
    ///
    /// # Safety
    ///
    /// The frame must still be live, and whatever code is at the instruction
    /// pointer must expect this register state.
    pub unsafe fn restore(&self) -> ! {
        let mut cursor = self.cursor.clone();
        cursor
            .set_reg(Reg::Ip, self.ip)
            .or_fatal("failed to set the instruction pointer");
        cursor
            .set_reg(Reg::Sp, self.sp)
            .or_fatal("failed to set the stack pointer");
        log::debug!("restoring context ip={:#x} sp={:#x}", self.ip, self.sp);
        unsafe { cursor.resume() }
    }
}

/// The context-restore routine handed out to the dispatch engine.
///
/// # Safety
///
/// `ctx` must point to a context produced by a walk of the current thread's
/// stack whose frame is still live.
pub unsafe extern "C" fn restore_context(ctx: *const ProcessorContext<NativeCursor>) -> ! {
    unsafe { (*ctx).restore() }
}
