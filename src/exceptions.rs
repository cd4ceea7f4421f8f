//! Raising exceptions: the entry points behind the trampolines and the fault
//! handlers.
//!
//! Every entry point starts from a cursor positioned at the frame that raised
//! the exception (a trampoline frame, or the faulting managed frame), skips
//! foreign frames up to the first managed one, and hands the resulting context
//! to the [`DispatchEngine`]. If the engine finds a handler, the context it
//! leaves behind is restored and the entry point never returns.

use crate::Backend;
use crate::context::ProcessorContext;
use crate::fatal::{OrFatal, fatal_error};
use crate::registry::DomainId;
use crate::stackwalk::FrameWalker;
use jit_eh_unwinder::{Cursor, NativeCursor, Reg, RegisterSet};

/// A managed object reference.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ObjectRef(pub usize);

/// The hardware fault behind a signal.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Access to unmapped or protected memory; usually a null reference.
    AccessViolation,
    /// A misaligned or otherwise invalid bus access.
    Misaligned,
    /// Integer division by zero or overflow.
    Arithmetic,
    /// An undefined instruction.
    IllegalInstruction,
}

impl FaultKind {
    /// The fault a signal number reports, if it is one this backend handles.
    pub fn from_signal(signum: libc::c_int) -> Option<FaultKind> {
        match signum {
            libc::SIGSEGV => Some(FaultKind::AccessViolation),
            libc::SIGBUS => Some(FaultKind::Misaligned),
            libc::SIGFPE => Some(FaultKind::Arithmetic),
            libc::SIGILL => Some(FaultKind::IllegalInstruction),
            _ => None,
        }
    }
}

/// The parts of the managed object model raising an exception needs.
pub trait ObjectModel: Send + Sync {
    /// The domain of the calling thread.
    fn current_domain(&self) -> DomainId;

    /// Whether `object` is an instance of the exception base type.
    fn is_exception(&self, object: ObjectRef) -> bool;

    /// Forget the stack trace captured by an earlier throw of `exception`.
    fn clear_stack_trace(&self, exception: ObjectRef);

    /// Construct the exception a type token emitted by an inline check
    /// stands for.
    fn exception_from_token(&self, token: u32) -> ObjectRef;

    /// The exception a hardware fault in managed code turns into, or `None`
    /// if the fault is not a managed exception.
    fn exception_for_fault(&self, kind: FaultKind) -> Option<ObjectRef>;
}

/// The architecture-neutral handler search.
pub trait DispatchEngine<C: Cursor>: Send + Sync {
    /// Search for a handler of `exception`, starting at the managed frame
    /// `ctx` describes.
    ///
    /// Returns `true` if a handler was found; unless `test_only` is set, `ctx`
    /// then describes where execution resumes. The engine walks further
    /// frames with `walker`.
    fn dispatch(
        &self,
        walker: &FrameWalker<'_>,
        ctx: &mut ProcessorContext<C>,
        exception: ObjectRef,
        throw_ip: usize,
        test_only: bool,
    ) -> bool;
}

impl<C: Cursor> Backend<C> {
    /// Throw `exception` from the frame `cursor` is positioned at.
    ///
    /// A first throw clears the stack trace of a previous one; a rethrow
    /// keeps it.
    ///
    /// # Safety
    ///
    /// `cursor` must describe a live frame of the current thread's stack,
    /// and everything between it and the handler is discarded without
    /// running destructors.
    pub unsafe fn raise(&self, cursor: C, exception: ObjectRef, rethrow: bool) -> ! {
        if !rethrow && self.objects.is_exception(exception) {
            self.objects.clear_stack_trace(exception);
        }
        let mut ctx = ProcessorContext::from_cursor(cursor);
        // The managed frame's IP is a return address; point into the call.
        if !self.dispatch_from(&mut ctx, exception, 1, false) {
            fatal_error(format_args!(
                "no handler for exception {:#x} thrown at {:#x}",
                exception.0,
                ctx.ip()
            ));
        }
        unsafe { ctx.restore() }
    }

    /// Throw the exception for `token` from the JIT code that called the
    /// throw-by-token trampoline, attributing it to the instruction `offset`
    /// bytes before the call's return address.
    ///
    /// # Safety
    ///
    /// As for [`Backend::raise`]; additionally `cursor` must be positioned
    /// at the throw-by-token trampoline frame.
    pub unsafe fn raise_at_fault_site(&self, mut cursor: C, token: u32, offset: usize) -> ! {
        let exception = self.objects.exception_from_token(token);
        unsafe {
            rewrite_return_address(&mut cursor, offset);
            self.raise(cursor, exception, false)
        }
    }

    /// Dispatch `exception` for a hardware fault in the frame `cursor` is
    /// positioned at.
    ///
    /// With `test_only` set, only reports whether a handler exists. Otherwise
    /// a found handler is resumed and this never returns.
    ///
    /// # Safety
    ///
    /// As for [`Backend::raise`].
    pub unsafe fn handle_fault(&self, cursor: C, exception: ObjectRef, test_only: bool) -> bool {
        let mut ctx = ProcessorContext::from_cursor(cursor);
        // A fault IP is the faulting instruction itself.
        let found = self.dispatch_from(&mut ctx, exception, 0, test_only);
        if test_only {
            return found;
        }
        if !found {
            fatal_error(format_args!(
                "no handler for exception {:#x} raised by a fault at {:#x}",
                exception.0,
                ctx.ip()
            ));
        }
        unsafe { ctx.restore() }
    }

    fn dispatch_from(
        &self,
        ctx: &mut ProcessorContext<C>,
        exception: ObjectRef,
        ip_adjust: usize,
        test_only: bool,
    ) -> bool {
        let walker = self.walker();
        let method = walker.unwind_to_method(ctx);
        let throw_ip = ctx.ip() + ip_adjust;
        log::debug!(
            "dispatching exception {:#x} from `{}` at {throw_ip:#x}{}",
            exception.0,
            method.name,
            if test_only { " (test only)" } else { "" }
        );
        drop(method);
        self.dispatcher
            .dispatch(&walker, ctx, exception, throw_ip, test_only)
    }
}

/// Make the frame above `cursor` report that it is executing the instruction
/// `offset` bytes before its actual return address, and return that address.
///
/// Inline checks in JIT code call the throw-by-token trampoline instead of
/// materializing the exception at every check site. Rewriting the saved
/// return address attributes the exception to the check itself without a
/// table of check sites. This is the only place a return address is written.
///
/// # Safety
///
/// The frame at `cursor` must never return normally once this is called.
pub unsafe fn rewrite_return_address<C: Cursor>(cursor: &mut C, offset: usize) -> usize {
    let slot = cursor
        .return_address_slot()
        .or_fatal("failed to locate the return address");
    let mut caller = cursor.clone();
    if !caller.step().or_fatal("failed to unwind the throw site") {
        fatal_error(format_args!("the throw site has no caller"));
    }
    let return_address = caller
        .get_reg(Reg::Ip)
        .or_fatal("failed to read the return address");
    let Some(fault) = return_address.checked_sub(offset) else {
        fatal_error(format_args!(
            "fault offset {offset:#x} is larger than the return address {return_address:#x}"
        ));
    };
    unsafe {
        cursor
            .write_word(slot, fault)
            .or_fatal("failed to rewrite the return address");
    }
    log::debug!("rewrote return address {return_address:#x} to fault site {fault:#x}");
    fault
}

/// The registers of the trampoline frame that called an entry point.
///
/// # Safety
///
/// Must be called directly from the entry point with the `regs` its
/// trampoline passed: the trampoline calls with `rsp` at `regs`, so the word
/// just below is the entry point's return address into the trampoline.
#[inline(always)]
unsafe fn trampoline_registers(regs: *const RegisterSet) -> RegisterSet {
    unsafe {
        let mut frame = *regs;
        frame.ip = *regs.cast::<usize>().sub(1);
        frame
    }
}

/// Called by the throw and rethrow trampolines.
pub(crate) unsafe extern "C" fn throw_entry(
    exception: usize,
    regs: *const RegisterSet,
    rethrow: u32,
) -> ! {
    let backend = crate::backend();
    unsafe {
        let cursor = NativeCursor::from_registers(trampoline_registers(regs));
        backend.raise(cursor, ObjectRef(exception), rethrow != 0)
    }
}

/// Called by the throw-by-token trampoline.
pub(crate) unsafe extern "C" fn throw_token_entry(
    token: u32,
    offset: u32,
    regs: *const RegisterSet,
) -> ! {
    let backend = crate::backend();
    unsafe {
        let cursor = NativeCursor::from_registers(trampoline_registers(regs));
        backend.raise_at_fault_site(cursor, token, offset as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::registry::{CompiledMethodInfo, JitInfoTable};
    use jit_eh_unwinder::{Resumed, SimCursor, SimFrame, SimStack};
    use std::sync::{Arc, Mutex};

    const DOMAIN: DomainId = DomainId(3);
    const EXCEPTION: ObjectRef = ObjectRef(0xe0);
    const HANDLER_IP: usize = 0x1080;

    #[derive(Default)]
    struct Objects {
        cleared: Mutex<Vec<ObjectRef>>,
    }

    impl ObjectModel for Objects {
        fn current_domain(&self) -> DomainId {
            DOMAIN
        }
        fn is_exception(&self, object: ObjectRef) -> bool {
            object.0 >= 0xe0
        }
        fn clear_stack_trace(&self, exception: ObjectRef) {
            self.cleared.lock().unwrap().push(exception);
        }
        fn exception_from_token(&self, token: u32) -> ObjectRef {
            ObjectRef(0xe000 + token as usize)
        }
        fn exception_for_fault(&self, kind: FaultKind) -> Option<ObjectRef> {
            (kind == FaultKind::AccessViolation).then_some(ObjectRef(0xe0_0001))
        }
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Dispatched {
        exception: ObjectRef,
        throw_ip: usize,
        frame_ip: usize,
        test_only: bool,
    }

    /// Records each call and resumes at `HANDLER_IP` in the frame it is
    /// given, if `handles` is set.
    struct Engine {
        handles: bool,
        calls: Mutex<Vec<Dispatched>>,
    }

    impl<C: Cursor> DispatchEngine<C> for Engine {
        fn dispatch(
            &self,
            _walker: &FrameWalker<'_>,
            ctx: &mut ProcessorContext<C>,
            exception: ObjectRef,
            throw_ip: usize,
            test_only: bool,
        ) -> bool {
            self.calls.lock().unwrap().push(Dispatched {
                exception,
                throw_ip,
                frame_ip: ctx.ip(),
                test_only,
            });
            if self.handles && !test_only {
                ctx.set_ip(HANDLER_IP);
            }
            self.handles
        }
    }

    struct Fixture {
        backend: Backend<SimCursor>,
        objects: Arc<Objects>,
        engine: Arc<Engine>,
    }

    impl Fixture {
        fn new(handles: bool) -> Fixture {
            let registry = Arc::new(JitInfoTable::new());
            registry
                .register(
                    DOMAIN,
                    CompiledMethodInfo::new("Managed.Run", 0x1000, 0x100),
                )
                .unwrap();
            let objects = Arc::new(Objects::default());
            let engine = Arc::new(Engine {
                handles,
                calls: Mutex::new(Vec::new()),
            });
            let backend = Backend::new(&Config::new(), registry, objects.clone(), engine.clone());
            Fixture {
                backend,
                objects,
                engine,
            }
        }

        fn calls(&self) -> Vec<Dispatched> {
            self.engine.calls.lock().unwrap().clone()
        }
    }

    fn stack() -> SimStack {
        SimStack::builder(0x10_0000)
            .frame(SimFrame::new(0x9000, 32)) // native helper
            .frame(SimFrame::new(0x1040, 32)) // Managed.Run
            .frame(SimFrame::new(0x9900, 16)) // thread start
            .build()
    }

    #[test]
    fn raise_skips_to_the_managed_frame_and_restores() {
        let _ = env_logger::try_init();
        let fixture = Fixture::new(true);
        let stack = stack();
        let regs =
            Resumed::catch(|| unsafe { fixture.backend.raise(stack.cursor(), EXCEPTION, false) })
                .unwrap();

        assert_eq!(
            fixture.calls(),
            [Dispatched {
                exception: EXCEPTION,
                throw_ip: 0x1041,
                frame_ip: 0x1040,
                test_only: false,
            }]
        );
        assert_eq!(regs.ip, HANDLER_IP);
        assert_eq!(regs.sp, stack.frame_registers(1).sp);
        assert_eq!(*fixture.objects.cleared.lock().unwrap(), [EXCEPTION]);
    }

    #[test]
    fn rethrow_keeps_the_stack_trace() {
        let fixture = Fixture::new(true);
        let stack = stack();
        Resumed::catch(|| unsafe { fixture.backend.raise(stack.cursor(), EXCEPTION, true) })
            .unwrap();
        assert!(fixture.objects.cleared.lock().unwrap().is_empty());

        // Non-exception objects are never touched either.
        Resumed::catch(|| unsafe { fixture.backend.raise(stack.cursor(), ObjectRef(1), false) })
            .unwrap();
        assert!(fixture.objects.cleared.lock().unwrap().is_empty());
    }

    #[test]
    #[should_panic(expected = "no handler for exception 0xe0")]
    fn unhandled_raise_is_fatal() {
        let fixture = Fixture::new(false);
        unsafe { fixture.backend.raise(stack().cursor(), EXCEPTION, false) }
    }

    #[test]
    fn handle_fault_uses_the_fault_ip() {
        let fixture = Fixture::new(true);
        let stack = SimStack::builder(0x10_0000)
            .frame(SimFrame::new(0x1010, 32)) // faulting Managed.Run
            .frame(SimFrame::new(0x9900, 16))
            .build();

        let found = unsafe {
            fixture
                .backend
                .handle_fault(stack.cursor(), EXCEPTION, true)
        };
        assert!(found);
        let regs = Resumed::catch(|| unsafe {
            fixture
                .backend
                .handle_fault(stack.cursor(), EXCEPTION, false);
        })
        .unwrap();
        assert_eq!(regs.ip, HANDLER_IP);

        let calls = fixture.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].test_only);
        assert!(!calls[1].test_only);
        assert!(calls.iter().all(|c| c.throw_ip == 0x1010));
    }

    #[test]
    fn test_only_dispatch_reports_no_handler() {
        let fixture = Fixture::new(false);
        let found = unsafe {
            fixture
                .backend
                .handle_fault(stack().cursor(), EXCEPTION, true)
        };
        assert!(!found);
    }

    #[test]
    fn rewrite_return_address_points_into_the_caller() {
        let stack = stack();
        let mut cursor = stack.cursor();
        let slot = cursor.return_address_slot().unwrap();
        assert_eq!(stack.machine().peek(slot), Some(0x1040));

        let fault = unsafe { rewrite_return_address(&mut cursor, 0x18) };
        assert_eq!(fault, 0x1028);
        assert_eq!(stack.machine().peek(slot), Some(0x1028));
        assert!(cursor.step().unwrap());
        assert_eq!(cursor.get_reg(Reg::Ip).unwrap(), 0x1028);
    }

    #[test]
    #[should_panic(expected = "is larger than the return address")]
    fn rewrite_underflow_is_fatal() {
        let mut cursor = stack().cursor();
        unsafe { rewrite_return_address(&mut cursor, 0x2000) };
    }

    #[test]
    fn raise_at_fault_site_reports_the_check() {
        let fixture = Fixture::new(true);
        let stack = stack();
        Resumed::catch(|| unsafe { fixture.backend.raise_at_fault_site(stack.cursor(), 7, 0x30) })
            .unwrap();
        let calls = fixture.calls();
        assert_eq!(calls[0].exception, ObjectRef(0xe007));
        assert_eq!(calls[0].frame_ip, 0x1010);
        assert_eq!(calls[0].throw_ip, 0x1011);
    }

    #[test]
    fn fault_kinds() {
        assert_eq!(
            FaultKind::from_signal(libc::SIGSEGV),
            Some(FaultKind::AccessViolation)
        );
        assert_eq!(
            FaultKind::from_signal(libc::SIGFPE),
            Some(FaultKind::Arithmetic)
        );
        assert_eq!(FaultKind::from_signal(libc::SIGINT), None);
    }

    #[test]
    fn trampoline_frame_takes_ip_from_the_return_address() {
        // The return address into the trampoline, then the pushed registers.
        let words: [usize; 9] = [0x7000_0042, 0, 0x5ff0, 0x6000, 1, 2, 3, 4, 5];
        let regs = unsafe { trampoline_registers(words.as_ptr().add(1).cast()) };
        assert_eq!(regs.ip, 0x7000_0042);
        assert_eq!(regs.sp, 0x5ff0);
        assert_eq!(regs.fp, 0x6000);
        assert_eq!(regs.rbx, 1);
        assert_eq!(regs.r15, 5);
    }
}
