//! Hardware faults in managed code, turned into managed exceptions.

use crate::exceptions::{FaultKind, ObjectRef};
use crate::fatal::fatal_error;
use core::ffi::c_void;
use jit_eh_unwinder::{NativeCursor, RegisterSet};
use std::io;
use std::mem::{self, MaybeUninit};
use std::ptr;
use std::sync::Once;

/// The faulting instruction pointer recorded in a signal context, or `None`
/// on platforms this backend cannot read it on.
///
/// # Safety
///
/// `sigctx` must be the `ucontext_t` a signal handler was invoked with.
pub unsafe fn ip_from_fault_context(sigctx: *const c_void) -> Option<usize> {
    unsafe { registers_from_fault_context(sigctx) }.map(|regs| regs.ip)
}

/// The registers of the faulting frame recorded in a signal context, or
/// `None` on unsupported platforms.
///
/// # Safety
///
/// `sigctx` must be the `ucontext_t` a signal handler was invoked with.
pub unsafe fn registers_from_fault_context(sigctx: *const c_void) -> Option<RegisterSet> {
    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
            let cx = unsafe { &*sigctx.cast::<libc::ucontext_t>() };
            let gregs = &cx.uc_mcontext.gregs;
            let reg = |index: libc::c_int| gregs[index as usize] as usize;
            Some(RegisterSet {
                ip: reg(libc::REG_RIP),
                sp: reg(libc::REG_RSP),
                fp: reg(libc::REG_RBP),
                rbx: reg(libc::REG_RBX),
                r12: reg(libc::REG_R12),
                r13: reg(libc::REG_R13),
                r14: reg(libc::REG_R14),
                r15: reg(libc::REG_R15),
            })
        } else if #[cfg(all(target_os = "macos", target_arch = "x86_64"))] {
            let cx = unsafe { &*sigctx.cast::<libc::ucontext_t>() };
            let ss = unsafe { &(*cx.uc_mcontext).__ss };
            Some(RegisterSet {
                ip: ss.__rip as usize,
                sp: ss.__rsp as usize,
                fp: ss.__rbp as usize,
                rbx: ss.__rbx as usize,
                r12: ss.__r12 as usize,
                r13: ss.__r13 as usize,
                r14: ss.__r14 as usize,
                r15: ss.__r15 as usize,
            })
        } else {
            let _ = sigctx;
            None
        }
    }
}

/// Dispatch `exception` for the fault recorded in `sigctx`.
///
/// With `test_only` set, only reports whether a handler exists. Otherwise a
/// found handler is resumed and this never returns.
///
/// # Safety
///
/// Must be called from the signal handler `sigctx` was passed to, on the
/// faulting thread, with a backend installed.
pub unsafe fn handle_fault(sigctx: *const c_void, exception: ObjectRef, test_only: bool) -> bool {
    let Some(regs) = (unsafe { registers_from_fault_context(sigctx) }) else {
        fatal_error(format_args!("cannot read fault contexts on this platform"));
    };
    unsafe {
        let cursor = NativeCursor::from_registers(regs);
        crate::backend().handle_fault(cursor, exception, test_only)
    }
}

static mut PREV_SIGSEGV: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGBUS: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGILL: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();
static mut PREV_SIGFPE: MaybeUninit<libc::sigaction> = MaybeUninit::uninit();

/// Install the fault handlers. Only the first call has an effect.
///
/// Signal handlers are chained LIFO, so this should run after any other
/// crash handler is installed. Faults outside managed code, or that the
/// object model does not map to an exception, are forwarded to the handler
/// that was installed before.
pub fn install_fault_handlers() {
    static INIT: Once = Once::new();
    INIT.call_once(|| unsafe {
        register(&raw mut PREV_SIGSEGV, libc::SIGSEGV);
        register(&raw mut PREV_SIGBUS, libc::SIGBUS);
        register(&raw mut PREV_SIGILL, libc::SIGILL);
        register(&raw mut PREV_SIGFPE, libc::SIGFPE);
        log::debug!("installed fault handlers");
    });
}

unsafe fn register(slot: *mut MaybeUninit<libc::sigaction>, signal: libc::c_int) {
    unsafe {
        let mut handler: libc::sigaction = mem::zeroed();
        // SA_SIGINFO for the fault context, SA_ONSTACK to survive stack
        // overflow on the alternate stack, SA_NODEFER so a fault inside the
        // handler reaches the previous handler.
        handler.sa_flags = libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_ONSTACK;
        handler.sa_sigaction = fault_handler as usize;
        libc::sigemptyset(&mut handler.sa_mask);
        if libc::sigaction(signal, &handler, (*slot).as_mut_ptr()) != 0 {
            fatal_error(format_args!(
                "unable to install signal handler: {}",
                io::Error::last_os_error()
            ));
        }
    }
}

/// Turn the fault into a managed exception if it happened in managed code.
/// Returns `false` if it is not ours; otherwise does not return.
unsafe fn dispatch_fault(signum: libc::c_int, context: *const c_void) -> bool {
    let Some(backend) = crate::installed() else {
        return false;
    };
    let Some(kind) = FaultKind::from_signal(signum) else {
        return false;
    };
    let Some(ip) = (unsafe { ip_from_fault_context(context) }) else {
        return false;
    };
    let domain = backend.objects.current_domain();
    if backend.registry.lookup(domain, ip).is_none() {
        return false;
    }
    let Some(exception) = backend.objects.exception_for_fault(kind) else {
        return false;
    };
    log::debug!("{kind:?} at {ip:#x} raised exception {:#x}", exception.0);
    unsafe { handle_fault(context, exception, false) }
}

unsafe extern "C" fn fault_handler(
    signum: libc::c_int,
    siginfo: *mut libc::siginfo_t,
    context: *mut c_void,
) {
    let previous = match signum {
        libc::SIGSEGV => &raw const PREV_SIGSEGV,
        libc::SIGBUS => &raw const PREV_SIGBUS,
        libc::SIGFPE => &raw const PREV_SIGFPE,
        libc::SIGILL => &raw const PREV_SIGILL,
        _ => fatal_error(format_args!("unknown signal: {signum}")),
    };
    if unsafe { dispatch_fault(signum, context) } {
        return;
    }

    // Not a fault in managed code: forward it. Without a previous handler,
    // restore the default disposition and return, so the faulting
    // instruction re-executes and crashes the normal way.
    unsafe {
        let previous = &*(*previous).as_ptr();
        if previous.sa_flags & libc::SA_SIGINFO != 0 {
            mem::transmute::<usize, extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut c_void)>(
                previous.sa_sigaction,
            )(signum, siginfo, context)
        } else if previous.sa_sigaction == libc::SIG_DFL || previous.sa_sigaction == libc::SIG_IGN {
            libc::sigaction(signum, previous, ptr::null_mut());
        } else {
            mem::transmute::<usize, extern "C" fn(libc::c_int)>(previous.sa_sigaction)(signum)
        }
    }
}
