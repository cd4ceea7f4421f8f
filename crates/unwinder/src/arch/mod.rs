//! Architecture-specific register access and control transfer.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86;
        pub use x86::*;
    } else {
        compile_error!("the jit-eh unwinder only supports x86-64");
    }
}
