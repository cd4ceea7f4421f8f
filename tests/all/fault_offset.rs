use crate::{DOMAIN, Engine, Objects, backend, registry};
use jit_eh::unwinder::{Cursor, Resumed, SimFrame, SimStack};
use jit_eh::{Config, FrameRecordChain, FrameWalker, ProcessorContext, StackGrowth};
use std::sync::Arc;

const RETURN_ADDRESS: usize = 0x2040;

fn stack() -> SimStack {
    SimStack::builder(0x40_0000)
        .frame(SimFrame::new(0x9000, 64)) // throw-by-token trampoline
        .frame(SimFrame::new(RETURN_ADDRESS, 32)) // Checked
        .frame(SimFrame::new(0x9f00, 16))
        .build()
}

#[test]
fn walker_reports_the_rewritten_fault_site() {
    let registry = registry(&[("Checked", 0x2000)]);
    let stack = stack();
    for offset in [0, 1, 0x15, 0x40] {
        let mut cursor = stack.cursor();
        let fault = unsafe { jit_eh::rewrite_return_address(&mut cursor, offset) };
        assert_eq!(fault, RETURN_ADDRESS - offset);

        let config = Config::new();
        let walker = FrameWalker::new(&*registry, DOMAIN, &config);
        let ctx = ProcessorContext::from_cursor(cursor);
        let frame = walker
            .find_jit_info(&ctx, None, &mut FrameRecordChain::new(StackGrowth::Down))
            .unwrap();
        assert_eq!(frame.native_offset, fault - 0x2000);
        assert_eq!(
            frame.trace,
            format!("Checked + {:#x} ({fault:#x})", fault - 0x2000)
        );

        // Put the return address back for the next round.
        let slot = stack.cursor().return_address_slot().unwrap();
        stack.machine().poke(slot, RETURN_ADDRESS);
    }
}

#[test]
fn throw_by_token_dispatches_from_the_fault_site() {
    let engine = Engine::new(Some("Checked"));
    let objects = Arc::new(Objects::default());
    let backend = backend(
        registry(&[("Checked", 0x2000)]),
        objects.clone(),
        engine.clone(),
    );
    let stack = stack();

    Resumed::catch(|| unsafe { backend.raise_at_fault_site(stack.cursor(), 9, 0x12) }).unwrap();
    let dispatch = &engine.dispatches()[0];
    assert_eq!(dispatch.exception.0, 0x1_0009);
    assert_eq!(dispatch.throw_ip, RETURN_ADDRESS - 0x12 + 1);
    assert_eq!(dispatch.trace, ["Checked + 0x2e (0x202e)"]);
    // The constructed exception is a fresh throw.
    assert_eq!(objects.cleared.lock().unwrap().len(), 1);
}
