//! An in-memory stand-in for a thread's stack.
//!
//! Unwind tables for generated code are verified by actually unwinding
//! through them, and the exception entry points are exercised end to end, on
//! a [`SimMachine`]: a sparse map of stack words. Resuming a simulated cursor
//! cannot jump anywhere, so it unwinds the Rust stack with a [`Resumed`]
//! payload carrying the registers that would have been installed.

use crate::dynamic::DynamicTable;
use crate::machine::Machine;
use crate::stackwalk::FramePointerCursor;
use crate::{RegisterSet, UnwindError};
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

/// A simulated stack memory. Clones share the same memory.
#[derive(Clone, Debug, Default)]
pub struct SimMachine {
    words: Rc<RefCell<BTreeMap<usize, usize>>>,
}

impl SimMachine {
    /// An empty memory; every read fails until the word is written.
    pub fn new() -> Self {
        SimMachine::default()
    }

    /// Store a word.
    pub fn poke(&self, addr: usize, value: usize) {
        self.words.borrow_mut().insert(addr, value);
    }

    /// Load a word, if it was ever written.
    pub fn peek(&self, addr: usize) -> Option<usize> {
        self.words.borrow().get(&addr).copied()
    }
}

unsafe impl Machine for SimMachine {
    unsafe fn read(&self, addr: usize) -> Result<usize, UnwindError> {
        self.peek(addr).ok_or(UnwindError::BadAddress(addr))
    }

    unsafe fn write(&self, addr: usize, value: usize) -> Result<(), UnwindError> {
        if addr % core::mem::size_of::<usize>() != 0 {
            return Err(UnwindError::BadAddress(addr));
        }
        self.poke(addr, value);
        Ok(())
    }

    unsafe fn resume(&self, regs: &RegisterSet) -> ! {
        log::trace!("simulated resume at ip={:#x} sp={:#x}", regs.ip, regs.sp);
        panic::panic_any(Resumed(*regs))
    }
}

/// Panic payload of a simulated resume.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Resumed(pub RegisterSet);

impl Resumed {
    /// Run `f`, returning the registers it resumed to, or `None` if it
    /// returned normally. Other panics propagate.
    pub fn catch(f: impl FnOnce()) -> Option<RegisterSet> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(_) => None,
            Err(payload) => match payload.downcast::<Resumed>() {
                Ok(resumed) => Some(resumed.0),
                Err(other) => panic::resume_unwind(other),
            },
        }
    }
}

/// A cursor over a simulated stack.
pub type SimCursor = FramePointerCursor<SimMachine>;

/// One frame of a [`SimStack`].
#[derive(Copy, Clone, Debug)]
pub struct SimFrame {
    ip: usize,
    size: usize,
}

impl SimFrame {
    /// A frame stopped at `ip` whose locals occupy `size` bytes below its
    /// saved frame pointer. `size` must be a multiple of 16.
    pub fn new(ip: usize, size: usize) -> Self {
        assert_eq!(size % 16, 0, "frame sizes keep the stack 16-byte aligned");
        SimFrame { ip, size }
    }
}

/// Lays out a frame-pointer chain in a [`SimMachine`].
#[derive(Clone, Debug)]
pub struct SimStackBuilder {
    top: usize,
    frames: Vec<SimFrame>,
    table: &'static DynamicTable,
    callee_saved: RegisterSet,
}

impl SimStackBuilder {
    /// Add the next older frame.
    pub fn frame(mut self, frame: SimFrame) -> Self {
        self.frames.push(frame);
        self
    }

    /// Unwind generated code with `table` instead of the global table.
    pub fn table(mut self, table: &'static DynamicTable) -> Self {
        self.table = table;
        self
    }

    /// Values of `rbx` and `r12`-`r15` in the innermost frame. Frame-pointer
    /// unwinding leaves them untouched, so every frame reports them.
    pub fn callee_saved(mut self, regs: RegisterSet) -> Self {
        self.callee_saved = regs;
        self
    }

    /// Write the frames to memory.
    pub fn build(self) -> SimStack {
        let machine = SimMachine::new();
        let mut regs = Vec::with_capacity(self.frames.len());

        // Outermost frame first: its frame record is all zeroes, which ends
        // the chain.
        let mut caller: Option<RegisterSet> = None;
        for frame in self.frames.iter().rev() {
            let fp = match caller {
                Some(caller) => caller.sp - 16,
                None => self.top - 16,
            };
            let (next_fp, ra) = caller.map_or((0, 0), |c| (c.fp, c.ip));
            machine.poke(fp, next_fp);
            machine.poke(fp + 8, ra);
            let frame_regs = RegisterSet {
                ip: frame.ip,
                sp: fp - frame.size,
                fp,
                ..self.callee_saved
            };
            regs.push(frame_regs);
            caller = Some(frame_regs);
        }
        regs.reverse();

        SimStack {
            machine,
            regs,
            table: self.table,
        }
    }
}

/// A simulated stack of frames, innermost first.
#[derive(Clone, Debug)]
pub struct SimStack {
    machine: SimMachine,
    regs: Vec<RegisterSet>,
    table: &'static DynamicTable,
}

impl SimStack {
    /// Start laying out a stack whose highest address is `top`.
    pub fn builder(top: usize) -> SimStackBuilder {
        assert_eq!(top % 16, 0, "the stack top must be 16-byte aligned");
        SimStackBuilder {
            top,
            frames: Vec::new(),
            table: DynamicTable::global(),
            callee_saved: RegisterSet::default(),
        }
    }

    /// The memory the frames live in.
    pub fn machine(&self) -> &SimMachine {
        &self.machine
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.regs.len()
    }

    /// Whether the stack has no frames.
    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Registers of frame `index`, counting from the innermost.
    pub fn frame_registers(&self, index: usize) -> RegisterSet {
        self.regs[index]
    }

    /// A cursor at the innermost frame.
    pub fn cursor(&self) -> SimCursor {
        self.cursor_at(self.regs[0])
    }

    /// A cursor at an arbitrary register state on this stack, for frames
    /// (such as generated stubs) that were not laid out by the builder.
    pub fn cursor_at(&self, regs: RegisterSet) -> SimCursor {
        // SAFETY: simulated memory never faults.
        unsafe { FramePointerCursor::new(self.machine.clone(), self.table, regs) }
    }
}
