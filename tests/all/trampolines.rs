use crate::{Engine, Objects, backend, registry};
use jit_eh::unwinder::{Cursor, DynamicTable, Reg, Resumed, SimFrame, SimStack};
use jit_eh::{Config, Trampolines};
use std::sync::Arc;

fn isolated() -> (Trampolines, &'static DynamicTable) {
    let table: &'static DynamicTable = Box::leak(Box::new(DynamicTable::new()));
    (Trampolines::with_table(&Config::new(), table), table)
}

#[test]
fn procedures_are_stable() {
    let throw = jit_eh::get_throw_procedure();
    assert_eq!(jit_eh::get_throw_procedure(), throw);
    let rethrow = jit_eh::get_rethrow_procedure();
    assert_eq!(jit_eh::get_rethrow_procedure(), rethrow);
    let token = jit_eh::get_throw_corlib_exception_procedure();
    assert_eq!(jit_eh::get_throw_corlib_exception_procedure(), token);
    let filter = jit_eh::get_call_filter_procedure();
    assert_eq!(jit_eh::get_call_filter_procedure(), filter);
    assert_eq!(
        jit_eh::get_restore_context_procedure(),
        jit_eh::get_restore_context_procedure()
    );

    let mut all = vec![throw, rethrow, token, filter];
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 4);

    // All of them can be unwound through from the live stack.
    for address in all {
        assert!(DynamicTable::global().find(address).is_some());
    }
}

#[test]
fn concurrent_accessors_converge() {
    let (trampolines, table) = isolated();
    let addresses: Vec<(usize, usize)> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|_| {
                s.spawn(|| {
                    (
                        trampolines.throw().address(),
                        trampolines.rethrow().address(),
                    )
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    assert!(addresses.iter().all(|&a| a == addresses[0]));
    assert_eq!(trampolines.generated(), 2);
    assert_eq!(table.len(), 2);
}

#[test]
fn walk_crosses_a_trampoline_frame() {
    let (trampolines, table) = isolated();
    let throw = trampolines.throw();
    // As seen by the entry point: its return address, the trailing `ud2`.
    let ip = throw.address() + throw.code().len() - 2;

    let stack = SimStack::builder(0x40_0000)
        .table(table)
        .frame(SimFrame::new(ip, 64))
        .frame(SimFrame::new(0x1020, 32)) // M1
        .frame(SimFrame::new(0x9f00, 16))
        .build();

    let mut cursor = stack.cursor();
    assert_eq!(cursor.proc_name(), Some("throw"));
    assert!(cursor.step().unwrap());
    assert_eq!(cursor.get_reg(Reg::Ip).unwrap(), 0x1020);
    assert_eq!(
        cursor.get_reg(Reg::Sp).unwrap(),
        stack.frame_registers(1).sp
    );
    assert_eq!(cursor.proc_name(), None);

    let engine = Engine::new(Some("M1"));
    let backend = backend(
        registry(&[("M1", 0x1000)]),
        Arc::new(Objects::default()),
        engine.clone(),
    );
    Resumed::catch(|| unsafe { backend.raise(stack.cursor(), jit_eh::ObjectRef(0xe0), false) })
        .unwrap();
    assert_eq!(engine.dispatches()[0].trace, ["M1 + 0x20 (0x1020)"]);
}

#[test]
fn system_unwind_registration_is_optional() {
    let table: &'static DynamicTable = Box::leak(Box::new(DynamicTable::new()));
    let mut config = Config::new();
    config.register_system_unwind_info(true);
    let trampolines = Trampolines::with_table(&config, table);
    let filter = trampolines.call_filter();
    assert_eq!(filter.name(), "call_filter");
    assert!(table.find(filter.address()).is_some());
}
