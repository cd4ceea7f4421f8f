//! Executable memory for generated trampolines.

use anyhow::{Context, Result, anyhow};
use core::ffi::c_void;
use rustix::mm::{MapFlags, MprotectFlags, ProtFlags};
use std::ptr;

fn round_up_to_page(len: usize) -> usize {
    let page = rustix::param::page_size();
    len.div_ceil(page) * page
}

/// Copy `code` into freshly mapped pages, make them read-only and executable,
/// and synchronize the instruction cache.
///
/// The mapping is never unmapped: trampolines live as long as the process.
pub fn publish(code: &[u8]) -> Result<&'static [u8]> {
    anyhow::ensure!(!code.is_empty(), "cannot publish an empty code buffer");
    let size = round_up_to_page(code.len());

    let base = unsafe {
        rustix::mm::mmap_anonymous(
            ptr::null_mut(),
            size,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE,
        )
        .with_context(|| format!("failed to map {size} bytes of code memory"))?
    };

    unsafe {
        ptr::copy_nonoverlapping(code.as_ptr(), base.cast::<u8>(), code.len());
        rustix::mm::mprotect(base, size, MprotectFlags::READ | MprotectFlags::EXEC)
            .context("unable to make code memory read-only and executable")?;

        wasmtime_jit_icache_coherence::clear_cache(base.cast::<c_void>().cast_const(), code.len())
            .map_err(|e| anyhow!("failed to clear the instruction cache: {e:?}"))?;
    }
    wasmtime_jit_icache_coherence::pipeline_flush_mt()
        .map_err(|e| anyhow!("failed to flush the instruction pipeline: {e:?}"))?;

    log::debug!(
        "published {} bytes of code at {:#x}",
        code.len(),
        base as usize
    );
    Ok(unsafe { std::slice::from_raw_parts(base.cast::<u8>().cast_const(), code.len()) })
}
