// config.rs - Context configuration

use crate::memory::{AllocationMode, DEFAULT_PADDING};

/// Tunables applied to every instance a context creates.
#[derive(Debug, Clone, Copy)]
pub struct WasmConfig {
    /// Growth policy for memories the context allocates.
    pub allocation_mode: AllocationMode,
    /// On-demand growth increment in bytes; growth requests are rounded
    /// up to a multiple of this before page rounding.
    pub memory_padding: u64,
}

impl Default for WasmConfig {
    fn default() -> Self {
        WasmConfig {
            allocation_mode: AllocationMode::OnDemand,
            memory_padding: DEFAULT_PADDING,
        }
    }
}
