//! Inspector configuration with defaults.

use serde::{Deserialize, Serialize};

/// Top-level configuration for snapshot inspection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InspectorConfig {
    /// Benign-pattern filter configuration.
    pub filter: FilterConfig,
}

/// Configuration for the suspicion filter pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Suppress executable-private findings on heap-flagged subregions.
    ///
    /// Disabled by default: many loaders JIT out of heap allocations, but
    /// so does injected shellcode, and the conservative posture is to keep
    /// the finding.
    pub suppress_heap_private_exec: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            suppress_heap_private_exec: false,
        }
    }
}
