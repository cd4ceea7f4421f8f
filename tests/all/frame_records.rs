use crate::DOMAIN;
use jit_eh::frame_records::{self, jit_eh_pop_frame_record, jit_eh_push_frame_record};
use jit_eh::unwinder::{RegisterSet, SimFrame, SimStack};
use jit_eh::{
    CompiledMethodInfo, Config, FrameRecord, FrameRecordChain, FrameWalker, JitInfoTable,
    ProcessorContext, StackGrowth,
};

fn record(bp: usize) -> FrameRecord {
    FrameRecord::new(bp, &RegisterSet::default())
}

#[test]
fn unwinding_to_250_prunes_only_the_300_record() {
    let mut chain = FrameRecordChain::new(StackGrowth::Up);
    for bp in [100, 200, 300] {
        chain.push(record(bp));
    }
    let pruned = chain.prune(250);
    assert_eq!(pruned.count, 1);
    assert_eq!(pruned.last.map(|r| r.bp), Some(300));
    assert_eq!(chain.iter().map(|r| r.bp).collect::<Vec<_>>(), [100, 200]);
}

#[test]
fn pruning_removes_exactly_the_unwound_records() {
    let bps = [0x9000, 0x8800, 0x8000, 0x7000, 0x6800, 0x6000];
    for fp in (0x5000..0xa000).step_by(0x400) {
        let mut chain = FrameRecordChain::new(StackGrowth::Down);
        for bp in bps {
            chain.push(record(bp));
        }
        let stale = bps.iter().filter(|&&bp| bp <= fp).count();
        let pruned = chain.prune(fp);
        assert_eq!(pruned.count, stale, "fp={fp:#x}");
        assert_eq!(chain.len(), bps.len() - stale, "fp={fp:#x}");
        assert!(chain.iter().all(|r| r.bp > fp));
    }
}

#[test]
fn walker_prunes_the_thread_chain() {
    let registry = JitInfoTable::new();
    registry
        .register(
            DOMAIN,
            CompiledMethodInfo::new("Wrapper", 0x5000, 0x100)
                .wrapper()
                .with_frame_record(),
        )
        .unwrap();
    registry
        .register(DOMAIN, CompiledMethodInfo::new("Outer", 0x6000, 0x100))
        .unwrap();
    let stack = SimStack::builder(0x20_0000)
        .frame(SimFrame::new(0x9000, 32)) // native callee of the wrapper
        .frame(SimFrame::new(0x5010, 32)) // Wrapper
        .frame(SimFrame::new(0x6010, 32)) // Outer
        .frame(SimFrame::new(0x9f00, 16))
        .build();

    let saved = RegisterSet {
        rbx: 0x11,
        r12: 0x12,
        r13: 0x13,
        r14: 0x14,
        r15: 0x15,
        ..RegisterSet::default()
    };
    // The wrapper's frame pointer, in the walker's sense, is Outer's stack
    // pointer.
    let wrapper_bp = stack.frame_registers(2).sp;
    let rec = FrameRecord::new(wrapper_bp, &saved);
    unsafe { jit_eh_push_frame_record(&rec) };

    let config = Config::new();
    let walker = FrameWalker::new(&registry, DOMAIN, &config);
    let ctx = ProcessorContext::from_cursor(stack.cursor());
    let frame = walker.find_jit_info_current_thread(&ctx, None).unwrap();
    assert_eq!(frame.method.name, "Wrapper");
    assert!(!frame.managed);
    assert_eq!(frame.pruned.count, 1);
    assert!(frame_records::with_current_thread(|chain| chain.is_empty()));

    let regs = frame.context.registers();
    assert_eq!(regs.ip, 0x6010);
    assert_eq!(regs.rbx, 0x11);
    assert_eq!(regs.r15, 0x15);
}

#[test]
fn native_hooks_balance() {
    let outer = record(0x7fff_0000);
    let inner = record(0x7ffe_0000);
    unsafe {
        jit_eh_push_frame_record(&outer);
        jit_eh_push_frame_record(&inner);
    }
    assert_eq!(frame_records::with_current_thread(|chain| chain.len()), 2);
    jit_eh_pop_frame_record(0x7ffe_0000);
    jit_eh_pop_frame_record(0x7fff_0000);
    assert!(frame_records::with_current_thread(|chain| chain.is_empty()));
}
