//! The memory and control-transfer primitives a cursor is built on.

use crate::{RegisterSet, UnwindError, arch};

/// Access to the stack being walked.
///
/// # Safety
///
/// `resume` must either transfer control to the given registers or diverge
/// without returning; callers rely on it never coming back.
pub unsafe trait Machine: Clone {
    /// Read the word at `addr`.
    ///
    /// # Safety
    ///
    /// For a live stack, `addr` must be a slot of a frame found by unwinding.
    unsafe fn read(&self, addr: usize) -> Result<usize, UnwindError>;

    /// Write the word at `addr`.
    ///
    /// # Safety
    ///
    /// Same as [`Machine::read`]; additionally nothing may rely on the old
    /// value.
    unsafe fn write(&self, addr: usize, value: usize) -> Result<(), UnwindError>;

    /// Install `regs` and continue executing at `regs.ip`.
    ///
    /// # Safety
    ///
    /// See [`crate::Cursor::resume`].
    unsafe fn resume(&self, regs: &RegisterSet) -> !;
}

/// The stack of the running thread.
#[derive(Copy, Clone, Debug, Default)]
pub struct NativeMachine;

fn check_word_address(addr: usize) -> Result<(), UnwindError> {
    if addr == 0 || addr % core::mem::size_of::<usize>() != 0 {
        return Err(UnwindError::BadAddress(addr));
    }
    Ok(())
}

unsafe impl Machine for NativeMachine {
    unsafe fn read(&self, addr: usize) -> Result<usize, UnwindError> {
        check_word_address(addr)?;
        Ok(unsafe { *(addr as *const usize) })
    }

    unsafe fn write(&self, addr: usize, value: usize) -> Result<(), UnwindError> {
        check_word_address(addr)?;
        unsafe { *(addr as *mut usize) = value };
        Ok(())
    }

    unsafe fn resume(&self, regs: &RegisterSet) -> ! {
        log::trace!(
            "resuming at ip={:#x} sp={:#x} fp={:#x}",
            regs.ip,
            regs.sp,
            regs.fp
        );
        unsafe { arch::resume(regs) }
    }
}
