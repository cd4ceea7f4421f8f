//! Finding the JIT-compiled method a frame belongs to.
//!
//! The walker transparently steps over any number of foreign (native) frames
//! so the dispatch engine only ever sees managed-to-managed transitions. Each
//! successful lookup also advances the context one more frame, so repeated
//! calls walk strictly outward without visiting a frame twice.

use crate::config::Config;
use crate::context::ProcessorContext;
use crate::fatal::{OrFatal, fatal_error};
use crate::frame_records::{self, FrameRecordChain, Pruned};
use crate::registry::{CompiledMethodInfo, DomainId, MethodRegistry};
use jit_eh_unwinder::{Cursor, Reg};
use std::sync::Arc;

/// Result of [`FrameWalker::find_frame`].
#[derive(Debug)]
pub struct FoundFrame<C> {
    /// The method the frame belongs to, or `None` if the walk reached the
    /// outermost frame without finding one.
    pub method: Option<Arc<CompiledMethodInfo>>,
    /// When a method was found, the context of its caller; otherwise the
    /// outermost frame.
    pub context: ProcessorContext<C>,
    /// Whether the frame is user code rather than a runtime wrapper.
    pub managed: bool,
    /// Instruction pointer of the identified frame.
    pub ip: usize,
    /// Frame records removed because the walk has left their frames.
    pub pruned: Pruned,
}

/// Result of [`FrameWalker::find_jit_info`].
#[derive(Debug)]
pub struct JitFrame<C> {
    /// The method the frame belongs to.
    pub method: Arc<CompiledMethodInfo>,
    /// The context of the method's caller.
    pub context: ProcessorContext<C>,
    /// Whether the frame is user code rather than a runtime wrapper.
    pub managed: bool,
    /// `"{name} + {offset:#x} ({ip:#x})"`.
    pub trace: String,
    /// Offset of the frame's instruction pointer from the method start.
    pub native_offset: usize,
    /// Frame records removed because the walk has left their frames.
    pub pruned: Pruned,
}

/// Walks frames of one domain, consulting a [`MethodRegistry`].
#[derive(Clone, Copy)]
pub struct FrameWalker<'a> {
    registry: &'a dyn MethodRegistry,
    domain: DomainId,
    max_frames: usize,
}

impl<'a> FrameWalker<'a> {
    /// A walker looking up methods of `domain` in `registry`.
    pub fn new(registry: &'a dyn MethodRegistry, domain: DomainId, config: &Config) -> Self {
        FrameWalker {
            registry,
            domain,
            max_frames: config.max_frames,
        }
    }

    /// The domain methods are looked up in.
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    fn method_at(
        &self,
        ip: usize,
        hint: Option<&Arc<CompiledMethodInfo>>,
    ) -> Option<Arc<CompiledMethodInfo>> {
        // The hint avoids a registry lookup while unwinding a stack overflow.
        match hint {
            Some(hint) if hint.contains(ip) => Some(hint.clone()),
            _ => self.registry.lookup(self.domain, ip),
        }
    }

    fn current_ip<C: Cursor>(ctx: &ProcessorContext<C>) -> usize {
        ctx.cursor()
            .get_reg(Reg::Ip)
            .or_fatal("failed to read the instruction pointer")
    }

    #[track_caller]
    fn count_frame(&self, frames: &mut usize) {
        *frames += 1;
        if *frames > self.max_frames {
            fatal_error(format_args!(
                "stack walk visited more than {} frames",
                self.max_frames
            ));
        }
    }

    /// Step `ctx` over foreign frames until it is at a frame of a compiled
    /// method, and return that method. The context is left at that frame.
    ///
    /// Reaching the outermost frame first is fatal.
    pub fn unwind_to_method<C: Cursor>(
        &self,
        ctx: &mut ProcessorContext<C>,
    ) -> Arc<CompiledMethodInfo> {
        let mut frames = 0;
        loop {
            let ip = Self::current_ip(ctx);
            if let Some(method) = self.registry.lookup(self.domain, ip) {
                log::trace!("first managed frame: `{}` at {ip:#x}", method.name);
                return method;
            }
            log::trace!("skipping foreign frame at {ip:#x}");
            self.count_frame(&mut frames);
            if !ctx.step_to_caller() {
                fatal_error(format_args!(
                    "reached the outermost frame at {ip:#x} without finding managed code"
                ));
            }
        }
    }

    /// Find the method of the nearest frame at or above `ctx` and return the
    /// context of that frame's caller.
    ///
    /// Frame records the walk has reached or unwound past are pruned from
    /// `records`. If the method keeps a frame record, the callee-saved
    /// registers saved in its own record are installed in the returned
    /// context.
    pub fn find_frame<C: Cursor>(
        &self,
        ctx: &ProcessorContext<C>,
        hint: Option<&Arc<CompiledMethodInfo>>,
        records: &mut FrameRecordChain,
    ) -> FoundFrame<C> {
        let mut ctx = ctx.clone();
        if ctx.is_end_of_stack() {
            // The previous lookup already consumed the outermost frame.
            let ip = ctx.ip();
            return FoundFrame {
                method: None,
                context: ctx,
                managed: false,
                ip,
                pruned: Pruned::default(),
            };
        }
        let mut frames = 0;
        loop {
            let ip = Self::current_ip(&ctx);
            log::trace!(
                "visiting frame ip={ip:#x} sp={:#x} fp={:#x}",
                ctx.sp(),
                ctx.fp()
            );

            if let Some(method) = self.method_at(ip, hint) {
                let managed = !method.is_wrapper;
                let fp = ctx.fp();
                let pruned = records.prune(fp);
                let owned = pruned
                    .last
                    .filter(|record| method.saves_frame_record && record.bp == fp);

                ctx.step_to_caller();
                if let Some(record) = owned {
                    log::trace!("restoring callee-saved registers of `{}`", method.name);
                    for (reg, value) in record.saved_registers() {
                        ctx.set_reg(reg, value);
                    }
                }
                return FoundFrame {
                    method: Some(method),
                    context: ctx,
                    managed,
                    ip,
                    pruned,
                };
            }

            self.count_frame(&mut frames);
            if !ctx.step_to_caller() {
                return FoundFrame {
                    method: None,
                    context: ctx,
                    managed: false,
                    ip,
                    pruned: Pruned::default(),
                };
            }
        }
    }

    /// [`FrameWalker::find_frame`] plus the description the dispatch engine
    /// uses for stack traces. Returns `None` at the end of the stack.
    pub fn find_jit_info<C: Cursor>(
        &self,
        ctx: &ProcessorContext<C>,
        hint: Option<&Arc<CompiledMethodInfo>>,
        records: &mut FrameRecordChain,
    ) -> Option<JitFrame<C>> {
        let found = self.find_frame(ctx, hint, records);
        let method = found.method?;
        let native_offset = found.ip - method.code_start;
        let trace = format!("{} + {native_offset:#x} ({:#x})", method.name, found.ip);
        Some(JitFrame {
            method,
            context: found.context,
            managed: found.managed,
            trace,
            native_offset,
            pruned: found.pruned,
        })
    }

    /// [`FrameWalker::find_jit_info`] against the calling thread's frame
    /// record chain.
    pub fn find_jit_info_current_thread<C: Cursor>(
        &self,
        ctx: &ProcessorContext<C>,
        hint: Option<&Arc<CompiledMethodInfo>>,
    ) -> Option<JitFrame<C>> {
        frame_records::with_current_thread(|records| self.find_jit_info(ctx, hint, records))
    }
}
