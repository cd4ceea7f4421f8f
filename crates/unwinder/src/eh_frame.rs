//! Lowering dynamic descriptors to `.eh_frame` for the platform unwinder.
//!
//! The frame walker never needs this: it evaluates [`DynamicUnwindInfo`]
//! directly. Registering the same information with the system unwinder lets
//! debuggers, profilers and native panics walk through generated code too.

use crate::dynamic::{DynamicUnwindInfo, UnwindOp};
use crate::{Reg, UnwindError};
use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, EhFrame, EndianVec,
    FrameDescriptionEntry, FrameTable,
};
use gimli::{Encoding, Format, LittleEndian};
use std::sync::OnceLock;

fn create_cie() -> CommonInformationEntry {
    let mut entry = CommonInformationEntry::new(
        Encoding {
            address_size: 8,
            format: Format::Dwarf32,
            version: 1,
        },
        1,  // Code alignment factor
        -8, // Data alignment factor
        Reg::Ip.dwarf(),
    );
    entry.fde_address_encoding = gimli::constants::DW_EH_PE_absptr;
    entry
}

fn instruction(op: &UnwindOp) -> (u32, CallFrameInstruction) {
    match *op {
        UnwindOp::DefineCfa { when, reg, offset } => {
            (when, CallFrameInstruction::Cfa(reg.dwarf(), offset))
        }
        UnwindOp::SaveReg {
            when,
            reg,
            cfa_offset,
        } => (when, CallFrameInstruction::Offset(reg.dwarf(), cfa_offset)),
    }
}

/// Encode `info` as a `.eh_frame` section: one CIE, one FDE with absolute
/// addresses, and a zero terminator.
pub fn write_eh_frame(info: &DynamicUnwindInfo) -> Result<Vec<u8>, UnwindError> {
    let mut table = FrameTable::default();
    let cie_id = table.add_cie(create_cie());

    let mut fde = FrameDescriptionEntry::new(
        Address::Constant(info.start() as u64),
        (info.end() - info.start()) as u32,
    );
    for op in info.ops() {
        let (offset, instruction) = instruction(op);
        fde.add_instruction(offset, instruction);
    }
    table.add_fde(cie_id, fde);

    let mut eh_frame = EhFrame(EndianVec::new(LittleEndian));
    table.write_eh_frame(&mut eh_frame)?;
    let mut bytes = eh_frame.0.into_vec();
    bytes.extend_from_slice(&[0; 4]);
    Ok(bytes)
}

unsafe extern "C" {
    // libgcc / libunwind import
    fn __register_frame(fde: *const u8);
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        fn detect_libunwind() -> bool {
            true
        }
    } else if #[cfg(unix)] {
        fn detect_libunwind() -> bool {
            let symbol = c"__unw_add_dynamic_fde";
            unsafe { !libc::dlsym(libc::RTLD_DEFAULT, symbol.as_ptr()).is_null() }
        }
    } else {
        fn detect_libunwind() -> bool {
            false
        }
    }
}

/// libgcc's `__register_frame` walks a zero-terminated list of entries
/// starting at the section, while libunwind takes one FDE at a time.
///
/// libunwind is always the unwinder on macOS. Elsewhere it is recognized by
/// `__unw_add_dynamic_fde`, a symbol only it exports.
fn using_libunwind() -> bool {
    static USING_LIBUNWIND: OnceLock<bool> = OnceLock::new();
    *USING_LIBUNWIND.get_or_init(|| {
        let found = detect_libunwind();
        log::debug!(
            "system unwinder is {}",
            if found { "libunwind" } else { "libgcc" }
        );
        found
    })
}

/// Offsets of the FDEs in a section produced by [`write_eh_frame`], skipping
/// the leading CIE.
fn fde_offsets(section: &[u8]) -> Vec<usize> {
    let end = section.len() - 4;
    let mut offsets = Vec::new();
    let mut current = 0;
    while current < end {
        let len = u32::from_le_bytes([
            section[current],
            section[current + 1],
            section[current + 2],
            section[current + 3],
        ]) as usize;
        if current != 0 {
            offsets.push(current);
        }
        // The length does not count itself.
        current += len + 4;
    }
    offsets
}

/// Encode `info` and hand it to the platform unwinder. The encoded section is
/// leaked: registrations are never withdrawn.
///
/// # Safety
///
/// `info` must describe code that stays mapped for the rest of the process.
pub unsafe fn register_with_system(info: &DynamicUnwindInfo) -> Result<(), UnwindError> {
    let bytes: &'static [u8] = Vec::leak(write_eh_frame(info)?);

    unsafe {
        if using_libunwind() {
            for offset in fde_offsets(bytes) {
                __register_frame(bytes.as_ptr().add(offset));
            }
        } else {
            __register_frame(bytes.as_ptr());
        }
    }

    log::debug!(
        "registered .eh_frame for `{}` at {:#x}..{:#x}",
        info.name(),
        info.start(),
        info.end()
    );
    Ok(())
}
