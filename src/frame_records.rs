//! The per-thread chain of manually saved frame records.
//!
//! Methods whose prologue does not save callee-saved registers in a way the
//! unwinder can describe (call-out wrappers, mostly) instead push a
//! [`FrameRecord`] on entry and pop it on exit. The chain has exactly three
//! operations, all here:
//!
//! * [`FrameRecordChain::push`], from a wrapper prologue;
//! * [`FrameRecordChain::pop`], from the matching epilogue;
//! * [`FrameRecordChain::prune`], from the frame walker, which only ever
//!   removes records whose frame has been unwound past.
//!
//! Records are ordered by call depth, innermost on top.

use crate::fatal::fatal_error;
use jit_eh_unwinder::{Reg, RegisterSet};
use std::cell::RefCell;

/// Which way the stack grows.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StackGrowth {
    /// Deeper frames live at lower addresses (x86-64).
    Down,
    /// Deeper frames live at higher addresses.
    Up,
}

impl StackGrowth {
    /// Whether a frame at `inner` is strictly deeper than one at `outer`.
    pub fn is_deeper(self, inner: usize, outer: usize) -> bool {
        match self {
            StackGrowth::Down => inner < outer,
            StackGrowth::Up => inner > outer,
        }
    }

    /// Whether a walk currently at frame pointer `fp` has unwound past (or is
    /// leaving) the frame that pushed a record at `bp`.
    pub fn is_unwound_past(self, bp: usize, fp: usize) -> bool {
        !self.is_deeper(fp, bp)
    }
}

/// A record pushed by a method that saves its caller's state manually.
///
/// The layout is shared with JIT-generated prologues.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FrameRecord {
    /// Frame pointer of the pushing frame, in the walker's sense: its
    /// caller's stack pointer.
    pub bp: usize,
    /// `rbx` at the time of the push.
    pub rbx: usize,
    /// `r12` at the time of the push.
    pub r12: usize,
    /// `r13` at the time of the push.
    pub r13: usize,
    /// `r14` at the time of the push.
    pub r14: usize,
    /// `r15` at the time of the push.
    pub r15: usize,
}

impl FrameRecord {
    /// A record for the frame at `bp` saving the callee-saved registers of
    /// `regs`.
    pub fn new(bp: usize, regs: &RegisterSet) -> Self {
        FrameRecord {
            bp,
            rbx: regs.rbx,
            r12: regs.r12,
            r13: regs.r13,
            r14: regs.r14,
            r15: regs.r15,
        }
    }

    /// The saved callee-saved registers.
    pub fn saved_registers(&self) -> [(Reg, usize); 5] {
        [
            (Reg::Rbx, self.rbx),
            (Reg::R12, self.r12),
            (Reg::R13, self.r13),
            (Reg::R14, self.r14),
            (Reg::R15, self.r15),
        ]
    }
}

/// What a [`FrameRecordChain::prune`] removed.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Pruned {
    /// Number of records removed.
    pub count: usize,
    /// The outermost record removed.
    pub last: Option<FrameRecord>,
}

/// One thread's frame records, innermost last.
#[derive(Clone, Debug)]
pub struct FrameRecordChain {
    growth: StackGrowth,
    records: Vec<FrameRecord>,
}

impl FrameRecordChain {
    /// An empty chain for a stack growing in `growth` direction.
    pub fn new(growth: StackGrowth) -> Self {
        FrameRecordChain {
            growth,
            records: Vec::new(),
        }
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no record is live.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The innermost record.
    pub fn top(&self) -> Option<&FrameRecord> {
        self.records.last()
    }

    /// Live records, outermost first.
    pub fn iter(&self) -> impl Iterator<Item = &FrameRecord> {
        self.records.iter()
    }

    /// Push a record on entry to a frame deeper than every recorded one.
    #[track_caller]
    pub fn push(&mut self, record: FrameRecord) {
        if let Some(top) = self.top() {
            if !self.growth.is_deeper(record.bp, top.bp) {
                fatal_error(format_args!(
                    "frame record at {:#x} pushed above record at {:#x}",
                    record.bp, top.bp
                ));
            }
        }
        log::trace!("push frame record bp={:#x}", record.bp);
        self.records.push(record);
    }

    /// Pop the record of the frame at `bp` on its normal exit.
    #[track_caller]
    pub fn pop(&mut self, bp: usize) -> FrameRecord {
        match self.records.pop() {
            Some(record) if record.bp == bp => {
                log::trace!("pop frame record bp={bp:#x}");
                record
            }
            Some(record) => fatal_error(format_args!(
                "frame at {bp:#x} popped the record of frame {:#x}",
                record.bp
            )),
            None => fatal_error(format_args!(
                "frame at {bp:#x} popped from an empty record chain"
            )),
        }
    }

    /// Remove every record whose frame the walk, now at `fp`, has reached or
    /// unwound past. Never pushes.
    pub fn prune(&mut self, fp: usize) -> Pruned {
        let mut pruned = Pruned::default();
        while let Some(top) = self.top() {
            if !self.growth.is_unwound_past(top.bp, fp) {
                break;
            }
            log::trace!("prune stale frame record bp={:#x} at fp={fp:#x}", top.bp);
            pruned.last = self.records.pop();
            pruned.count += 1;
        }
        pruned
    }
}

thread_local! {
    static CHAIN: RefCell<FrameRecordChain> = RefCell::new(FrameRecordChain::new(StackGrowth::Down));
}

/// Run `f` with the calling thread's chain.
pub fn with_current_thread<R>(f: impl FnOnce(&mut FrameRecordChain) -> R) -> R {
    CHAIN.with(|chain| f(&mut chain.borrow_mut()))
}

/// Prologue hook for generated wrappers: push `*record` on the calling
/// thread's chain.
///
/// # Safety
///
/// `record` must point to a valid [`FrameRecord`].
pub unsafe extern "C" fn jit_eh_push_frame_record(record: *const FrameRecord) {
    let record = unsafe { *record };
    with_current_thread(|chain| chain.push(record));
}

/// Epilogue hook for generated wrappers: pop the record of the frame at `bp`.
pub extern "C" fn jit_eh_pop_frame_record(bp: usize) {
    with_current_thread(|chain| {
        chain.pop(bp);
    });
}
