//! Exception dispatch and stack unwinding for a JIT runtime on x86-64.
//!
//! This crate is the architecture backend between JIT-compiled code and the
//! runtime's architecture-neutral exception engine:
//!
//! * [`Trampolines`] generates, once per process, the machine code that JIT
//!   code calls to throw, rethrow, throw by type token, and run filters,
//!   together with the unwind descriptors that let stack walks cross it.
//! * The entry points behind those trampolines ([`Backend::raise`] and
//!   friends) and the fault handlers ([`handle_fault`]) skip foreign frames
//!   up to the first managed frame and call the [`DispatchEngine`], then
//!   resume the handler it picked.
//! * [`FrameWalker`] answers "which method is this frame in" for the engine,
//!   pruning the per-thread [frame records](frame_records) as it goes.
//!
//! The process-wide [`Backend`] is [installed](install) once at startup:
//!
//! ```ignore
//! let backend = jit_eh::Backend::new(&Config::new(), registry, objects, engine);
//! jit_eh::install(backend)?;
//! jit_eh::install_fault_handlers();
//! let throw = jit_eh::get_throw_procedure();
//! ```

#![deny(missing_docs)]

#[cfg(not(all(target_arch = "x86_64", unix)))]
compile_error!("jit-eh only supports x86-64 unix targets");

use anyhow::{Result, bail};
use std::sync::{Arc, OnceLock};

mod code_memory;
mod config;
mod context;
mod exceptions;
mod fatal;
pub mod frame_records;
mod registry;
mod stackwalk;
mod trampolines;
mod traphandlers;

pub use crate::config::Config;
pub use crate::context::{ProcessorContext, restore_context};
pub use crate::exceptions::{
    DispatchEngine, FaultKind, ObjectModel, ObjectRef, rewrite_return_address,
};
pub use crate::frame_records::{FrameRecord, FrameRecordChain, Pruned, StackGrowth};
pub use crate::registry::{
    CompiledMethodInfo, DomainId, JitInfoTable, MethodRegistry, RegistryError,
};
pub use crate::stackwalk::{FoundFrame, FrameWalker, JitFrame};
pub use crate::trampolines::{Trampoline, TrampolineError, Trampolines};
pub use crate::traphandlers::{
    handle_fault, install_fault_handlers, ip_from_fault_context, registers_from_fault_context,
};

/// Re-export of the unwinding library the backend is built on.
pub use jit_eh_unwinder as unwinder;

use jit_eh_unwinder::{Cursor, NativeCursor};

/// The exception backend: configuration plus the runtime services it calls.
///
/// `C` is the cursor type of the stacks it walks; the installed backend uses
/// [`NativeCursor`], tests use simulated stacks.
pub struct Backend<C> {
    pub(crate) config: Config,
    pub(crate) registry: Arc<dyn MethodRegistry>,
    pub(crate) objects: Arc<dyn ObjectModel>,
    pub(crate) dispatcher: Arc<dyn DispatchEngine<C>>,
}

impl<C: Cursor> Backend<C> {
    /// Bundle `config` with the method registry, object model and dispatch
    /// engine of the runtime.
    pub fn new(
        config: &Config,
        registry: Arc<dyn MethodRegistry>,
        objects: Arc<dyn ObjectModel>,
        dispatcher: Arc<dyn DispatchEngine<C>>,
    ) -> Self {
        Backend {
            config: config.clone(),
            registry,
            objects,
            dispatcher,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// A frame walker over the calling thread's current domain.
    pub fn walker(&self) -> FrameWalker<'_> {
        FrameWalker::new(&*self.registry, self.objects.current_domain(), &self.config)
    }
}

static BACKEND: OnceLock<Backend<NativeCursor>> = OnceLock::new();

/// Install the process-wide backend used by the trampolines and fault
/// handlers. Fails if one is already installed.
///
/// The global trampolines take their configuration from the backend, so
/// install it before the first `get_*_procedure` call.
pub fn install(backend: Backend<NativeCursor>) -> Result<()> {
    let config = backend.config.clone();
    if BACKEND.set(backend).is_err() {
        bail!("an exception backend is already installed");
    }
    log::debug!("installed the exception backend");
    Trampolines::backend_installed(&config);
    Ok(())
}

pub(crate) fn installed() -> Option<&'static Backend<NativeCursor>> {
    BACKEND.get()
}

#[track_caller]
pub(crate) fn backend() -> &'static Backend<NativeCursor> {
    match installed() {
        Some(backend) => backend,
        None => fatal::fatal_error(format_args!("no exception backend is installed")),
    }
}

/// Address of the context-restore routine,
/// `unsafe extern "C" fn(*const ProcessorContext<NativeCursor>) -> !`.
pub fn get_restore_context_procedure() -> usize {
    restore_context as usize
}

/// Address of the call-filter trampoline; see [`Trampolines::call_filter`].
pub fn get_call_filter_procedure() -> usize {
    Trampolines::global().call_filter().address()
}

/// Address of the throw trampoline; see [`Trampolines::throw`].
pub fn get_throw_procedure() -> usize {
    Trampolines::global().throw().address()
}

/// Address of the rethrow trampoline; see [`Trampolines::rethrow`].
pub fn get_rethrow_procedure() -> usize {
    Trampolines::global().rethrow().address()
}

/// Address of the throw-by-token trampoline; see
/// [`Trampolines::throw_token`].
pub fn get_throw_corlib_exception_procedure() -> usize {
    Trampolines::global().throw_token().address()
}
