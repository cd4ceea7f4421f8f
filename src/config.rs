//! Tunables of the exception backend.

/// Global configuration options used to build a [`crate::Backend`] and the
/// trampolines it relies on.
///
/// This structure exposes a builder-like interface and is primarily consumed
/// by [`crate::Backend::new`] and [`crate::Trampolines::new`].
#[derive(Clone, Debug)]
pub struct Config {
    pub(crate) max_frames: usize,
    pub(crate) register_system_unwind_info: bool,
    pub(crate) trampoline_capacity: usize,
}

impl Config {
    /// Creates a new configuration object with the default configuration
    /// specified.
    pub fn new() -> Self {
        Config {
            max_frames: 1 << 16,
            register_system_unwind_info: false,
            trampoline_capacity: 256,
        }
    }

    /// Upper bound on the number of frames a single stack walk may visit.
    ///
    /// A walk that gets this far is looping over a corrupted stack and is
    /// treated as a fatal error.
    ///
    /// The default value for this is `1 << 16`.
    pub fn max_frames(&mut self, frames: usize) -> &mut Self {
        self.max_frames = frames;
        self
    }

    /// Whether to also describe each generated trampoline to the platform
    /// unwinder through `.eh_frame`.
    ///
    /// The frame walker never needs this. It helps debuggers, profilers and
    /// native backtraces get through trampoline frames.
    ///
    /// The default value for this is `false`.
    pub fn register_system_unwind_info(&mut self, enable: bool) -> &mut Self {
        self.register_system_unwind_info = enable;
        self
    }

    /// Maximum size in bytes of one generated trampoline; generation fails if
    /// the emitted code is larger.
    ///
    /// The default value for this is `256`.
    pub fn trampoline_capacity(&mut self, bytes: usize) -> &mut Self {
        self.trampoline_capacity = bytes;
        self
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}
