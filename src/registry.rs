//! Compiled-method metadata and the registry mapping code addresses to it.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

/// An application domain; methods are registered and looked up per domain.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub u32);

/// Description of one JIT-compiled method.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompiledMethodInfo {
    /// Display name, used in trace strings.
    pub name: String,
    /// First byte of the method's code.
    pub code_start: usize,
    /// Length of the method's code in bytes.
    pub code_size: usize,
    /// Non-user-code wrapper; its frames are not reported as managed.
    pub is_wrapper: bool,
    /// The method pushes a frame record instead of saving callee-saved
    /// registers itself.
    pub saves_frame_record: bool,
}

impl CompiledMethodInfo {
    /// A plain managed method.
    pub fn new(name: impl Into<String>, code_start: usize, code_size: usize) -> Self {
        CompiledMethodInfo {
            name: name.into(),
            code_start,
            code_size,
            is_wrapper: false,
            saves_frame_record: false,
        }
    }

    /// Mark the method as a runtime wrapper.
    pub fn wrapper(mut self) -> Self {
        self.is_wrapper = true;
        self
    }

    /// Mark the method as pushing a frame record.
    pub fn with_frame_record(mut self) -> Self {
        self.saves_frame_record = true;
        self
    }

    /// One past the last byte of the method's code.
    ///
    /// Saturates for a range running past the end of the address space,
    /// which [`JitInfoTable::register`] rejects.
    pub fn code_end(&self) -> usize {
        self.code_start.saturating_add(self.code_size)
    }

    /// Whether `ip` lies in `[code_start, code_start + code_size)`.
    pub fn contains(&self, ip: usize) -> bool {
        ip.checked_sub(self.code_start)
            .is_some_and(|offset| offset < self.code_size)
    }
}

/// Maps instruction pointers to the method containing them.
pub trait MethodRegistry: Send + Sync {
    /// The method of `domain` whose code contains `ip`.
    fn lookup(&self, domain: DomainId, ip: usize) -> Option<Arc<CompiledMethodInfo>>;
}

/// Failures registering a method.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// The method has no code.
    #[error("method `{0}` has no code")]
    Empty(String),
    /// The method's code overlaps a method already registered.
    #[error("method `{name}` overlaps `{existing}`")]
    Overlap {
        /// The method being registered.
        name: String,
        /// The method already covering part of its range.
        existing: String,
    },
    /// The method's code runs past the end of the address space.
    #[error("method `{name}` at {start:#x} with {size:#x} bytes overflows the address space")]
    AddressOverflow {
        /// The method being registered.
        name: String,
        /// Its code start.
        start: usize,
        /// Its code size.
        size: usize,
    },
}

/// A [`MethodRegistry`] keeping per-domain tables of code ranges.
#[derive(Debug, Default)]
pub struct JitInfoTable {
    // Per domain, keyed by code end address.
    domains: RwLock<HashMap<DomainId, BTreeMap<usize, Arc<CompiledMethodInfo>>>>,
}

impl JitInfoTable {
    /// An empty table.
    pub fn new() -> Self {
        JitInfoTable::default()
    }

    /// Add a method to `domain`.
    pub fn register(
        &self,
        domain: DomainId,
        info: CompiledMethodInfo,
    ) -> Result<Arc<CompiledMethodInfo>, RegistryError> {
        if info.code_size == 0 {
            return Err(RegistryError::Empty(info.name));
        }
        if info.code_start.checked_add(info.code_size).is_none() {
            return Err(RegistryError::AddressOverflow {
                name: info.name,
                start: info.code_start,
                size: info.code_size,
            });
        }
        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        let methods = domains.entry(domain).or_default();
        if let Some((_, existing)) = methods.range(info.code_start + 1..).next() {
            if existing.code_start < info.code_end() {
                return Err(RegistryError::Overlap {
                    name: info.name,
                    existing: existing.name.clone(),
                });
            }
        }
        log::debug!(
            "registered method `{}` at {:#x}..{:#x} in domain {}",
            info.name,
            info.code_start,
            info.code_end(),
            domain.0
        );
        let info = Arc::new(info);
        methods.insert(info.code_end(), info.clone());
        Ok(info)
    }

    /// Remove the method of `domain` starting at `code_start`.
    pub fn unregister(
        &self,
        domain: DomainId,
        code_start: usize,
    ) -> Option<Arc<CompiledMethodInfo>> {
        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        let methods = domains.get_mut(&domain)?;
        let end = methods
            .range(code_start + 1..)
            .next()
            .filter(|(_, info)| info.code_start == code_start)
            .map(|(end, _)| *end)?;
        methods.remove(&end)
    }
}

impl MethodRegistry for JitInfoTable {
    fn lookup(&self, domain: DomainId, ip: usize) -> Option<Arc<CompiledMethodInfo>> {
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        domains
            .get(&domain)?
            .range(ip.checked_add(1)?..)
            .next()
            .filter(|(_, info)| info.contains(ip))
            .map(|(_, info)| info.clone())
    }
}
