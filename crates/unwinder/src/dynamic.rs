//! Unwind descriptors for code generated at runtime.
//!
//! Code emitted by the runtime itself (trampolines) has no `.eh_frame` entry
//! and does not necessarily keep a plain frame-pointer layout at every
//! instruction. Each such block is described by a [`DynamicUnwindInfo`]: a
//! declarative list of [`UnwindOp`]s saying, from a given instruction offset
//! onward, how to compute the canonical frame address (CFA) and where the
//! caller's registers were saved relative to it.
//!
//! Descriptors are registered once in a [`DynamicTable`] and are never
//! mutated or freed afterwards; the code they describe lives for the rest of
//! the process.

use crate::machine::Machine;
use crate::{Reg, RegisterSet, UnwindError};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

/// One step of a dynamic unwind description.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnwindOp {
    /// From instruction offset `when` onward, the CFA is `reg + offset`.
    DefineCfa {
        /// Instruction offset at which the rule takes effect.
        when: u32,
        /// Base register.
        reg: Reg,
        /// Signed displacement from the base register.
        offset: i32,
    },
    /// From instruction offset `when` onward, the caller's value of `reg` is
    /// stored at `CFA + cfa_offset`.
    SaveReg {
        /// Instruction offset at which the save is complete.
        when: u32,
        /// The saved register; [`Reg::Ip`] denotes the return address.
        reg: Reg,
        /// Signed displacement of the save slot from the CFA.
        cfa_offset: i32,
    },
}

impl UnwindOp {
    /// Instruction offset at which this operation takes effect.
    pub fn when(&self) -> u32 {
        match *self {
            UnwindOp::DefineCfa { when, .. } | UnwindOp::SaveReg { when, .. } => when,
        }
    }
}

const REG_COUNT: usize = 8;

fn reg_index(reg: Reg) -> usize {
    (RegisterSet::offset_of(reg) as usize) / core::mem::size_of::<usize>()
}

const ALL_REGS: [Reg; REG_COUNT] = [
    Reg::Ip,
    Reg::Sp,
    Reg::Fp,
    Reg::Rbx,
    Reg::R12,
    Reg::R13,
    Reg::R14,
    Reg::R15,
];

/// The rules in effect at one instruction offset.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct FrameRules {
    cfa: Option<(Reg, i32)>,
    saved: [Option<i32>; REG_COUNT],
}

impl FrameRules {
    fn cfa(&self, regs: &RegisterSet, pc: usize) -> Result<usize, UnwindError> {
        let (reg, offset) = self.cfa.ok_or(UnwindError::NoCfaRule { pc })?;
        Ok(regs.get(reg).wrapping_add_signed(offset as isize))
    }

    fn saved(&self, reg: Reg) -> Option<i32> {
        self.saved[reg_index(reg)]
    }
}

/// Unwind description of one block of generated code.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicUnwindInfo {
    name: &'static str,
    start: usize,
    end: usize,
    ops: Vec<UnwindOp>,
}

impl DynamicUnwindInfo {
    /// Human-readable name of the code block.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// First byte of the described code.
    pub fn start(&self) -> usize {
        self.start
    }

    /// One past the last byte of the described code.
    pub fn end(&self) -> usize {
        self.end
    }

    /// The operations, ordered by instruction offset.
    pub fn ops(&self) -> &[UnwindOp] {
        &self.ops
    }

    /// Whether `pc` lies inside the described code.
    pub fn contains(&self, pc: usize) -> bool {
        self.start <= pc && pc < self.end
    }

    pub(crate) fn rules_at(&self, offset: u32) -> FrameRules {
        let mut rules = FrameRules::default();
        for op in self.ops.iter().take_while(|op| op.when() <= offset) {
            match *op {
                UnwindOp::DefineCfa { reg, offset, .. } => rules.cfa = Some((reg, offset)),
                UnwindOp::SaveReg {
                    reg, cfa_offset, ..
                } => rules.saved[reg_index(reg)] = Some(cfa_offset),
            }
        }
        rules
    }

    fn rules_for(&self, pc: usize) -> FrameRules {
        debug_assert!(self.contains(pc));
        self.rules_at((pc - self.start) as u32)
    }

    /// Where the frame described by `regs` keeps its return address.
    pub fn return_address_slot(&self, regs: &RegisterSet) -> Result<usize, UnwindError> {
        let pc = regs.ip;
        let rules = self.rules_for(pc);
        let cfa = rules.cfa(regs, pc)?;
        let offset = rules
            .saved(Reg::Ip)
            .ok_or(UnwindError::MissingReturnAddress { pc })?;
        Ok(cfa.wrapping_add_signed(offset as isize))
    }

    /// Compute the caller's registers from the registers of a frame stopped
    /// inside this code.
    ///
    /// Registers without a save rule keep their value; the caller's stack
    /// pointer is the CFA.
    ///
    /// # Safety
    ///
    /// `regs` must describe a frame that is executing this code, and `machine`
    /// must be the stack that frame lives on.
    pub unsafe fn unwind<M: Machine>(
        &self,
        regs: &RegisterSet,
        machine: &M,
    ) -> Result<RegisterSet, UnwindError> {
        let pc = regs.ip;
        let rules = self.rules_for(pc);
        let cfa = rules.cfa(regs, pc)?;
        if rules.saved(Reg::Ip).is_none() {
            return Err(UnwindError::MissingReturnAddress { pc });
        }

        let mut caller = *regs;
        for reg in ALL_REGS {
            if let Some(offset) = rules.saved(reg) {
                let slot = cfa.wrapping_add_signed(offset as isize);
                caller.set(reg, unsafe { machine.read(slot)? });
            }
        }
        caller.sp = cfa;

        log::trace!(
            "unwound `{}`+{:#x}: cfa={:#x} ip={:#x} fp={:#x}",
            self.name,
            pc - self.start,
            cfa,
            caller.ip,
            caller.fp
        );
        Ok(caller)
    }
}

/// Accumulates the operations of a [`DynamicUnwindInfo`] while its code is
/// being laid out.
#[derive(Clone, Debug)]
pub struct UnwindTableBuilder {
    name: &'static str,
    ops: Vec<UnwindOp>,
}

impl UnwindTableBuilder {
    /// Start a description for the code block called `name`.
    pub fn new(name: &'static str) -> Self {
        UnwindTableBuilder {
            name,
            ops: Vec::new(),
        }
    }

    /// From `when` onward the CFA is `reg + offset`.
    pub fn define_cfa(&mut self, when: u32, reg: Reg, offset: i32) -> &mut Self {
        self.ops.push(UnwindOp::DefineCfa { when, reg, offset });
        self
    }

    /// From `when` onward the caller's `reg` is saved at `CFA + cfa_offset`.
    pub fn save(&mut self, when: u32, reg: Reg, cfa_offset: i32) -> &mut Self {
        self.ops.push(UnwindOp::SaveReg {
            when,
            reg,
            cfa_offset,
        });
        self
    }

    /// Operations recorded so far.
    pub fn ops(&self) -> &[UnwindOp] {
        &self.ops
    }

    /// Attach the operations to the `len` bytes of code at `start`.
    pub fn finish(self, start: usize, len: usize) -> Result<DynamicUnwindInfo, UnwindError> {
        let end = start.checked_add(len).unwrap_or(usize::MAX);
        if len == 0 || end == usize::MAX {
            return Err(UnwindError::EmptyRange {
                name: self.name,
                start,
                end,
            });
        }
        let mut previous = 0;
        for op in &self.ops {
            let when = op.when();
            if when < previous {
                return Err(UnwindError::UnorderedOps { when, previous });
            }
            if when as usize >= len {
                return Err(UnwindError::OpOutOfRange { when, len });
            }
            previous = when;
        }
        Ok(DynamicUnwindInfo {
            name: self.name,
            start,
            end,
            ops: self.ops,
        })
    }
}

/// Registry of dynamic unwind descriptors, keyed by code range.
#[derive(Debug)]
pub struct DynamicTable {
    // Keyed by end address so a lookup is a single range query.
    ranges: RwLock<BTreeMap<usize, &'static DynamicUnwindInfo>>,
}

static GLOBAL: DynamicTable = DynamicTable::new();

impl DynamicTable {
    /// An empty table.
    pub const fn new() -> Self {
        DynamicTable {
            ranges: RwLock::new(BTreeMap::new()),
        }
    }

    /// The table consulted when unwinding the live stack.
    pub fn global() -> &'static DynamicTable {
        &GLOBAL
    }

    /// Register `info` for the rest of the process.
    ///
    /// The descriptor is leaked: the code it describes is never freed either.
    pub fn register(
        &self,
        info: DynamicUnwindInfo,
    ) -> Result<&'static DynamicUnwindInfo, UnwindError> {
        let mut ranges = self.ranges.write().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, existing)) = ranges.range(info.start + 1..).next() {
            if existing.start < info.end {
                return Err(UnwindError::Overlap {
                    name: info.name,
                    start: info.start,
                    end: info.end,
                    existing: existing.name,
                });
            }
        }
        let info: &'static DynamicUnwindInfo = Box::leak(Box::new(info));
        ranges.insert(info.end, info);
        log::debug!(
            "registered unwind info `{}` for {:#x}..{:#x} ({} ops)",
            info.name,
            info.start,
            info.end,
            info.ops.len()
        );
        Ok(info)
    }

    /// The descriptor covering `pc`, if any.
    pub fn find(&self, pc: usize) -> Option<&'static DynamicUnwindInfo> {
        let ranges = self.ranges.read().unwrap_or_else(PoisonError::into_inner);
        ranges
            .range(pc.checked_add(1)?..)
            .next()
            .map(|(_, info)| *info)
            .filter(|info| info.contains(pc))
    }

    /// Number of registered descriptors.
    pub fn len(&self) -> usize {
        self.ranges
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether nothing has been registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DynamicTable {
    fn default() -> Self {
        DynamicTable::new()
    }
}
