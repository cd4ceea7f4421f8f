use crate::{Engine, HANDLER_OFFSET, Objects, backend, registry};
use anyhow::Result;
use jit_eh::unwinder::{NativeCursor, Resumed, SimCursor, SimFrame, SimStack};
use jit_eh::{Backend, Config, JitInfoTable, ObjectRef};
use std::sync::Arc;

const EXCEPTION: ObjectRef = ObjectRef(0xe0);

fn runtime(catch_in: Option<&'static str>) -> (Backend<SimCursor>, Arc<Objects>, Arc<Engine>) {
    let objects = Arc::new(Objects::default());
    let engine = Engine::new(catch_in);
    let registry = registry(&[("M1", 0x1000), ("M2", 0x2000), ("M3", 0x3000)]);
    let backend = backend(registry, objects.clone(), engine.clone());
    (backend, objects, engine)
}

/// Three managed frames with two foreign frames interleaved, below a native
/// throw helper.
fn stack() -> SimStack {
    SimStack::builder(0x80_0000)
        .frame(SimFrame::new(0x9000, 32)) // throw helper
        .frame(SimFrame::new(0x1010, 48)) // M1
        .frame(SimFrame::new(0x9100, 16)) // native
        .frame(SimFrame::new(0x2020, 32)) // M2
        .frame(SimFrame::new(0x9200, 64)) // native
        .frame(SimFrame::new(0x3030, 16)) // M3
        .frame(SimFrame::new(0x9f00, 16)) // thread start
        .build()
}

#[test]
fn raise_dispatches_from_the_innermost_managed_frame() {
    let (backend, objects, engine) = runtime(Some("M2"));
    let stack = stack();

    let resumed = Resumed::catch(|| unsafe { backend.raise(stack.cursor(), EXCEPTION, false) })
        .expect("a handler should have been resumed");

    let dispatches = engine.dispatches();
    assert_eq!(dispatches.len(), 1);
    let dispatch = &dispatches[0];
    assert_eq!(dispatch.exception, EXCEPTION);
    assert_eq!(dispatch.throw_ip, 0x1011);
    assert!((0x1000..0x1100).contains(&dispatch.throw_ip));
    assert!(!dispatch.test_only);
    assert_eq!(
        dispatch.trace,
        [
            "M1 + 0x10 (0x1010)",
            "M2 + 0x20 (0x2020)",
            "M3 + 0x30 (0x3030)"
        ]
    );

    // Resumed in M2's frame at its handler.
    let m2 = stack.frame_registers(3);
    assert_eq!(resumed.ip, 0x2000 + HANDLER_OFFSET);
    assert_eq!(resumed.sp, m2.sp);
    assert_eq!(resumed.fp, m2.fp);
    assert_eq!(*objects.cleared.lock().unwrap(), [EXCEPTION]);
}

#[test]
fn walk_ends_at_an_outermost_managed_frame() {
    let (backend, _, engine) = runtime(Some("M2"));
    let stack = SimStack::builder(0x80_0000)
        .frame(SimFrame::new(0x9000, 32)) // throw helper
        .frame(SimFrame::new(0x1010, 48)) // M1
        .frame(SimFrame::new(0x2020, 32)) // M2, the thread's first frame
        .build();

    let resumed =
        Resumed::catch(|| unsafe { backend.raise(stack.cursor(), EXCEPTION, false) }).unwrap();
    assert_eq!(
        engine.dispatches()[0].trace,
        ["M1 + 0x10 (0x1010)", "M2 + 0x20 (0x2020)"]
    );
    assert_eq!(resumed.ip, 0x2000 + HANDLER_OFFSET);
    assert_eq!(resumed.sp, stack.frame_registers(2).sp);
}

#[test]
fn throw_clears_and_rethrow_keeps_the_stack_trace() {
    let (backend, objects, _) = runtime(Some("M3"));
    let stack = stack();

    Resumed::catch(|| unsafe { backend.raise(stack.cursor(), EXCEPTION, false) }).unwrap();
    assert_eq!(objects.cleared.lock().unwrap().len(), 1);

    Resumed::catch(|| unsafe { backend.raise(stack.cursor(), EXCEPTION, true) }).unwrap();
    Resumed::catch(|| unsafe { backend.raise(stack.cursor(), EXCEPTION, true) }).unwrap();
    assert_eq!(objects.cleared.lock().unwrap().len(), 1);

    Resumed::catch(|| unsafe { backend.raise(stack.cursor(), EXCEPTION, false) }).unwrap();
    assert_eq!(objects.cleared.lock().unwrap().len(), 2);
}

#[test]
fn test_only_fault_returns_without_resuming() {
    let (backend, _, engine) = runtime(Some("M3"));
    // The fault happened in M1 itself.
    let stack = SimStack::builder(0x80_0000)
        .frame(SimFrame::new(0x1044, 32))
        .frame(SimFrame::new(0x3030, 32))
        .frame(SimFrame::new(0x9f00, 16))
        .build();

    assert!(unsafe { backend.handle_fault(stack.cursor(), ObjectRef(0xe1), true) });
    let dispatches = engine.dispatches();
    assert_eq!(dispatches[0].throw_ip, 0x1044);
    assert!(dispatches[0].test_only);

    let (backend, _, _) = runtime(None);
    assert!(!unsafe { backend.handle_fault(stack.cursor(), ObjectRef(0xe1), true) });
}

#[test]
fn fault_dispatch_resumes_the_handler() {
    let (backend, _, _) = runtime(Some("M3"));
    let stack = SimStack::builder(0x80_0000)
        .frame(SimFrame::new(0x1044, 32))
        .frame(SimFrame::new(0x3030, 32))
        .frame(SimFrame::new(0x9f00, 16))
        .build();
    let resumed = Resumed::catch(|| unsafe {
        backend.handle_fault(stack.cursor(), ObjectRef(0xe1), false);
    })
    .unwrap();
    assert_eq!(resumed.ip, 0x3000 + HANDLER_OFFSET);
    assert_eq!(resumed.sp, stack.frame_registers(1).sp);
}

#[test]
#[should_panic(expected = "without finding managed code")]
fn raise_without_managed_frames_is_fatal() {
    let (backend, _, _) = runtime(Some("M1"));
    let stack = SimStack::builder(0x80_0000)
        .frame(SimFrame::new(0x9000, 32))
        .frame(SimFrame::new(0x9f00, 16))
        .build();
    unsafe { backend.raise(stack.cursor(), EXCEPTION, false) }
}

#[test]
fn backend_installs_once() -> Result<()> {
    let make = || {
        Backend::<NativeCursor>::new(
            &Config::new(),
            Arc::new(JitInfoTable::new()),
            Arc::new(Objects::default()),
            Engine::new(None),
        )
    };
    jit_eh::install(make())?;
    let err = jit_eh::install(make()).unwrap_err();
    assert!(err.to_string().contains("already installed"));
    Ok(())
}
