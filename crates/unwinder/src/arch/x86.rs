//! x86-64 definitions of the architecture-specific unwinding primitives.

use crate::RegisterSet;

/// Snapshot the registers of the frame this is inlined into.
///
/// Everything is stored through a single pointer so no captured register can
/// be overwritten by another output before it has been read.
#[inline(always)]
pub fn capture_registers() -> RegisterSet {
    let mut regs = RegisterSet::default();
    unsafe {
        core::arch::asm!(
            "mov [rdi + 8], rsp",
            "mov [rdi + 16], rbp",
            "mov [rdi + 24], rbx",
            "mov [rdi + 32], r12",
            "mov [rdi + 40], r13",
            "mov [rdi + 48], r14",
            "mov [rdi + 56], r15",
            "lea rax, [rip]",
            "mov [rdi], rax",
            in("rdi") &mut regs as *mut RegisterSet,
            out("rax") _,
            options(nostack, preserves_flags),
        );
    }
    regs
}

/// Install `regs` on the processor and jump to `regs.ip`.
///
/// # Safety
///
/// The target frame must be live, `regs.sp` must point into it, and the code
/// at `regs.ip` must expect exactly this register state.
pub unsafe fn resume(regs: &RegisterSet) -> ! {
    unsafe {
        core::arch::asm!(
            "mov rbx, [rdi + 24]",
            "mov r12, [rdi + 32]",
            "mov r13, [rdi + 40]",
            "mov r14, [rdi + 48]",
            "mov r15, [rdi + 56]",
            "mov rbp, [rdi + 16]",
            "mov rsp, [rdi + 8]",
            "jmp qword ptr [rdi]",
            in("rdi") regs as *const RegisterSet,
            options(noreturn),
        )
    }
}

/// The current frame pointer points to the next older frame pointer.
pub const NEXT_OLDER_FP_FROM_FP_OFFSET: usize = 0;

/// SP of caller is FP in callee plus size of FP/return address pair.
pub const NEXT_OLDER_SP_FROM_FP_OFFSET: usize = 16;

/// The return address sits right above the saved frame pointer.
pub const RETURN_ADDRESS_FROM_FP_OFFSET: usize = 8;

/// Frame pointers are aligned to twice the size of a pointer.
pub fn fp_is_aligned(fp: usize) -> bool {
    fp % (2 * core::mem::size_of::<usize>()) == 0
}
