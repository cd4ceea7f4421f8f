mod dispatch;
mod fault_offset;
mod frame_records;
mod trampolines;

use jit_eh::unwinder::Cursor;
use jit_eh::{
    Backend, CompiledMethodInfo, Config, DispatchEngine, DomainId, FaultKind, FrameRecordChain,
    FrameWalker, JitInfoTable, ObjectModel, ObjectRef, ProcessorContext, StackGrowth,
};
use std::sync::{Arc, Mutex};

pub(crate) const DOMAIN: DomainId = DomainId(1);

/// Offset of the catch block inside every method of the test runtime.
pub(crate) const HANDLER_OFFSET: usize = 0x80;

/// A runtime object model where every object at or above `0xe0` is an
/// exception.
#[derive(Default)]
pub(crate) struct Objects {
    pub cleared: Mutex<Vec<ObjectRef>>,
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
        ObjectRef(0x1_0000 + token as usize)
    }

    fn exception_for_fault(&self, kind: FaultKind) -> Option<ObjectRef> {
        match kind {
            FaultKind::AccessViolation => Some(ObjectRef(0xe1)),
            FaultKind::Arithmetic => Some(ObjectRef(0xe2)),
            _ => None,
        }
    }
}

/// What the engine saw for one dispatch.
#[derive(Clone, Debug, Default)]
pub(crate) struct Dispatch {
    pub exception: ObjectRef,
    pub throw_ip: usize,
    pub test_only: bool,
    /// Trace strings of every managed frame from the throw site outward.
    pub trace: Vec<String>,
}

/// A dispatch engine catching in the first method named `catch_in`, at
/// `HANDLER_OFFSET` into it.
pub(crate) struct Engine {
    pub catch_in: Option<&'static str>,
    pub dispatches: Mutex<Vec<Dispatch>>,
}

impl Engine {
    pub fn new(catch_in: Option<&'static str>) -> Arc<Engine> {
        Arc::new(Engine {
            catch_in,
            dispatches: Mutex::new(Vec::new()),
        })
    }

    pub fn dispatches(&self) -> Vec<Dispatch> {
        self.dispatches.lock().unwrap().clone()
    }
}

impl<C: Cursor> DispatchEngine<C> for Engine {
    fn dispatch(
        &self,
        walker: &FrameWalker<'_>,
        ctx: &mut ProcessorContext<C>,
        exception: ObjectRef,
        throw_ip: usize,
        test_only: bool,
    ) -> bool {
        let mut records = FrameRecordChain::new(StackGrowth::Down);
        let mut dispatch = Dispatch {
            exception,
            throw_ip,
            test_only,
            trace: Vec::new(),
        };
        let mut handler = None;
        let mut current = ctx.clone();
        let mut hint = None;
        while let Some(frame) = walker.find_jit_info(&current, hint.as_ref(), &mut records) {
            dispatch.trace.push(frame.trace.clone());
            if handler.is_none() && Some(frame.method.name.as_str()) == self.catch_in {
                // Back up from the frame the walk started at to the catching
                // method's own frame.
                let mut frame_ctx = current.clone();
                while !frame.method.contains(frame_ctx.ip()) {
                    assert!(frame_ctx.step_to_caller());
                }
                frame_ctx.set_ip(frame.method.code_start + HANDLER_OFFSET);
                handler = Some(frame_ctx);
            }
            hint = Some(frame.method);
            current = frame.context;
        }
        self.dispatches.lock().unwrap().push(dispatch);

        match handler {
            Some(handler) => {
                if !test_only {
                    *ctx = handler;
                }
                true
            }
            None => false,
        }
    }
}

/// Methods of the test runtime: `name` at `start`, 0x100 bytes each.
pub(crate) fn registry(methods: &[(&str, usize)]) -> Arc<JitInfoTable> {
    let registry = Arc::new(JitInfoTable::new());
    for &(name, start) in methods {
        registry
            .register(DOMAIN, CompiledMethodInfo::new(name, start, 0x100))
            .unwrap();
    }
    registry
}

pub(crate) fn backend<C: Cursor>(
    registry: Arc<JitInfoTable>,
    objects: Arc<Objects>,
    engine: Arc<Engine>,
) -> Backend<C> {
    let _ = env_logger::try_init();
    Backend::new(&Config::new(), registry, objects, engine)
}
