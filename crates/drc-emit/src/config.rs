//! Code generation options.

/// Which memory access tiers the emitter may use.
///
/// Accesses always stay correct with every option off: they then go
/// through the host read/write hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EmitConfig {
    /// Inline the memory-map lookup for addresses only known at run time.
    pub inline_fast_path: bool,
    /// Bake the host address of compile-time constant addresses on
    /// directly mapped pages into the code.
    pub const_direct: bool,
    /// Emit a verify entry that checks the block's source before running it.
    pub verify_entry: bool,
}

impl Default for EmitConfig {
    fn default() -> Self {
        Self {
            inline_fast_path: true,
            const_direct: true,
            verify_entry: true,
        }
    }
}

impl EmitConfig {
    #[must_use]
    pub const fn with_inline_fast_path(mut self, enabled: bool) -> Self {
        self.inline_fast_path = enabled;
        self
    }

    #[must_use]
    pub const fn with_const_direct(mut self, enabled: bool) -> Self {
        self.const_direct = enabled;
        self
    }

    #[must_use]
    pub const fn with_verify_entry(mut self, enabled: bool) -> Self {
        self.verify_entry = enabled;
        self
    }
}
