//! The generated trampolines between JIT code and the exception entry points.
//!
//! Each trampoline is generated at most once per [`Trampolines`] instance, on
//! first use, and lives for the rest of the process. Before its address is
//! handed out, its code is published to executable memory and its unwind
//! descriptor registered, so the frame walker can cross the trampoline frame
//! from the first call on.

use crate::code_memory;
use crate::config::Config;
use crate::exceptions::{throw_entry, throw_token_entry};
use crate::fatal::fatal_error;
use anyhow::{Context, Result};
use jit_eh_unwinder::{DynamicTable, DynamicUnwindInfo, eh_frame};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

mod x86_64;

use x86_64::Emitted;

static GLOBAL: OnceLock<Trampolines> = OnceLock::new();

/// Failures generating a trampoline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TrampolineError {
    /// The emitted code does not fit the configured capacity.
    #[error("trampoline `{name}` needs {len} bytes but the capacity is {capacity}")]
    TooLarge {
        /// Trampoline name.
        name: &'static str,
        /// Emitted code size.
        len: usize,
        /// [`Config::trampoline_capacity`].
        capacity: usize,
    },
}

/// One published trampoline.
#[derive(Debug)]
pub struct Trampoline {
    code: &'static [u8],
    unwind: &'static DynamicUnwindInfo,
}

impl Trampoline {
    /// Name the trampoline's unwind descriptor is registered under.
    pub fn name(&self) -> &'static str {
        self.unwind.name()
    }

    /// Entry address.
    pub fn address(&self) -> usize {
        self.code.as_ptr() as usize
    }

    /// The published machine code.
    pub fn code(&self) -> &'static [u8] {
        self.code
    }

    /// The registered unwind descriptor.
    pub fn unwind_info(&self) -> &'static DynamicUnwindInfo {
        self.unwind
    }
}

/// Lazily generated trampolines sharing one configuration and unwind table.
#[derive(Debug)]
pub struct Trampolines {
    config: Config,
    table: &'static DynamicTable,
    throw: OnceLock<Trampoline>,
    rethrow: OnceLock<Trampoline>,
    throw_token: OnceLock<Trampoline>,
    call_filter: OnceLock<Trampoline>,
    generated: AtomicUsize,
}

impl Trampolines {
    /// Trampolines registered with the global unwind table.
    pub fn new(config: &Config) -> Self {
        Trampolines::with_table(config, DynamicTable::global())
    }

    /// Trampolines registered with `table`.
    pub fn with_table(config: &Config, table: &'static DynamicTable) -> Self {
        Trampolines {
            config: config.clone(),
            table,
            throw: OnceLock::new(),
            rethrow: OnceLock::new(),
            throw_token: OnceLock::new(),
            call_filter: OnceLock::new(),
            generated: AtomicUsize::new(0),
        }
    }

    /// The process-wide trampolines behind the `get_*_procedure` accessors.
    ///
    /// They use the configuration of the installed backend, or the default
    /// configuration if none was installed yet. Install the backend before
    /// the first accessor call; a backend installed later does not change
    /// trampolines that already exist.
    pub fn global() -> &'static Trampolines {
        GLOBAL.get_or_init(|| {
            let config = crate::installed()
                .map(|backend| backend.config.clone())
                .unwrap_or_default();
            Trampolines::new(&config)
        })
    }

    /// Called once a backend is installed with `config`.
    pub(crate) fn backend_installed(config: &Config) {
        if let Some(global) = GLOBAL.get() {
            if !global.generates_like(config) {
                log::warn!(
                    "the global trampolines were created before the backend was installed \
                     and keep their previous configuration"
                );
            }
        }
    }

    /// Whether trampolines generated under `config` would equal these.
    pub(crate) fn generates_like(&self, config: &Config) -> bool {
        self.config.trampoline_capacity == config.trampoline_capacity
            && self.config.register_system_unwind_info == config.register_system_unwind_info
    }

    /// `extern "C" fn(exception) -> !`: throw, clearing the stack trace.
    pub fn throw(&self) -> &Trampoline {
        self.get(&self.throw, "throw", || {
            x86_64::emit_throw(false, throw_entry as usize)
        })
    }

    /// `extern "C" fn(exception) -> !`: rethrow, keeping the stack trace.
    pub fn rethrow(&self) -> &Trampoline {
        self.get(&self.rethrow, "rethrow", || {
            x86_64::emit_throw(true, throw_entry as usize)
        })
    }

    /// `extern "C" fn(token: u32, offset: u32) -> !`: build the exception
    /// for `token` and throw it from `offset` bytes before the return address.
    pub fn throw_token(&self) -> &Trampoline {
        self.get(&self.throw_token, "throw_token", || {
            x86_64::emit_throw_token(throw_token_entry as usize)
        })
    }

    /// `extern "C" fn(regs: *const RegisterSet, target, exception) -> usize`:
    /// run a filter or finally block in the frame described by `regs`.
    ///
    /// [`RegisterSet`]: jit_eh_unwinder::RegisterSet
    pub fn call_filter(&self) -> &Trampoline {
        self.get(&self.call_filter, "call_filter", x86_64::emit_call_filter)
    }

    /// How many trampolines this instance has generated.
    pub fn generated(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    fn get<'a>(
        &'a self,
        cell: &'a OnceLock<Trampoline>,
        name: &'static str,
        emit: impl FnOnce() -> Emitted,
    ) -> &'a Trampoline {
        cell.get_or_init(|| match self.generate(name, emit()) {
            Ok(trampoline) => trampoline,
            Err(e) => fatal_error(format_args!("{e:#}")),
        })
    }

    fn generate(&self, name: &'static str, emitted: Emitted) -> Result<Trampoline> {
        let capacity = self.config.trampoline_capacity;
        if emitted.code.len() > capacity {
            return Err(TrampolineError::TooLarge {
                name,
                len: emitted.code.len(),
                capacity,
            }
            .into());
        }

        let code = code_memory::publish(&emitted.code)
            .with_context(|| format!("failed to publish trampoline `{name}`"))?;
        let info = x86_64::unwind_table(name, &emitted.layout)
            .finish(code.as_ptr() as usize, code.len())
            .with_context(|| format!("invalid unwind table for trampoline `{name}`"))?;
        let unwind = self
            .table
            .register(info)
            .with_context(|| format!("failed to register unwind info of `{name}`"))?;
        if self.config.register_system_unwind_info {
            unsafe { eh_frame::register_with_system(unwind) }
                .with_context(|| format!("failed to register `{name}` with the system unwinder"))?;
        }

        self.generated.fetch_add(1, Ordering::SeqCst);
        log::debug!(
            "generated trampoline `{name}` at {:#x} ({} bytes)",
            code.as_ptr() as usize,
            code.len()
        );
        Ok(Trampoline { code, unwind })
    }
}
