//! Debugger settings.
//!
//! Settings are read from a toml file (`~/.config/strata/config.toml` by default). Every field is
//! optional, missing fields take default values.

use crate::debugger::Error;
use crate::muted_error;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Serve reads of read-only sections from the executable file instead of the live target.
    pub trust_readonly_sections: bool,
    /// Cache stack memory reads.
    pub stack_cache: bool,
    /// Cache code memory reads.
    pub code_cache: bool,
    /// Show breakpoint instructions in memory reads instead of the original bytes.
    pub show_breakpoint_shadows: bool,
    /// Stop stepping in code without line information instead of stepping out of it.
    pub step_stop_if_no_debug: bool,
    /// Size of a single data cache line, in bytes. Must be a power of two.
    pub dcache_line_size: usize,
    /// Maximum number of lines in a data cache.
    pub dcache_size: usize,
    /// Redirect accesses to mapped overlay sections to their load addresses.
    pub overlay_debugging: bool,
    /// Addresses not covered by any user defined memory region are inaccessible.
    pub inaccessible_by_default: bool,
    /// Maximum number of instructions kept in the execution recording log.
    pub record_insn_limit: usize,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            trust_readonly_sections: false,
            stack_cache: true,
            code_cache: true,
            show_breakpoint_shadows: false,
            step_stop_if_no_debug: false,
            dcache_line_size: 64,
            dcache_size: 4096,
            overlay_debugging: false,
            inaccessible_by_default: true,
            record_insn_limit: 200_000,
        }
    }
}

impl DebuggerConfig {
    fn validate(self) -> Result<Self, Error> {
        if !self.dcache_line_size.is_power_of_two() || self.dcache_line_size < 2 {
            return Err(Error::Config(format!(
                "dcache_line_size must be a power of two greater than one, got {}",
                self.dcache_line_size
            )));
        }
        if self.dcache_size == 0 {
            return Err(Error::Config("dcache_size must be positive".to_string()));
        }
        Ok(self)
    }

    pub fn from_toml(text: &str) -> Result<Self, Error> {
        let cfg: DebuggerConfig = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        cfg.validate()
    }

    /// Load settings from a file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml(&text)
    }

    /// Load settings from the default location. Missing or broken files fall back to defaults.
    pub fn load_default() -> Self {
        default_path()
            .filter(|p| p.exists())
            .and_then(|p| muted_error!(Self::load(&p), "load default config:"))
            .unwrap_or_default()
    }
}

pub fn default_path() -> Option<PathBuf> {
    home::home_dir().map(|home| home.join(".config").join("strata").join("config.toml"))
}

/// Startup configuration (set only once, at program start).
static CONFIG: OnceLock<DebuggerConfig> = OnceLock::new();

/// Set startup configuration. Returns `false` if it was already set.
pub fn set(config: DebuggerConfig) -> bool {
    CONFIG.set(config).is_ok()
}

/// Startup configuration or defaults if nothing was set.
pub fn current() -> DebuggerConfig {
    CONFIG.get().cloned().unwrap_or_default()
}
