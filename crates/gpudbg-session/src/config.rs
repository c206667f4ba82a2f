//! Debug session configuration.
//!
//! Defaults suit production. A few environment variables exist for bring-up and CI:
//!
//! - `GPUDBG_DISABLE=1`: never enable debug support, whatever the kernel reports.
//! - `GPUDBG_SBA_TRACKING_MODE=per-context|single`: SBA tracking buffer sharing.
//! - `GPUDBG_CLOS_NUM_CACHE_WAYS=<n>`: reserve exactly `n` ways per cache region instead of
//!   deriving the count from the requested size.

use serde::{Deserialize, Serialize};

pub const DISABLE_ENV: &str = "GPUDBG_DISABLE";
pub const SBA_TRACKING_MODE_ENV: &str = "GPUDBG_SBA_TRACKING_MODE";
pub const CLOS_NUM_CACHE_WAYS_ENV: &str = "GPUDBG_CLOS_NUM_CACHE_WAYS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SbaTrackingMode {
    /// One tracking buffer per execution context.
    #[default]
    PerContext,
    /// The device runs all contexts in one address space; one shared buffer.
    Single,
}

impl SbaTrackingMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "per-context" | "per_context" | "0" => Some(Self::PerContext),
            "single" | "single-address-space" | "1" => Some(Self::Single),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebuggerConfig {
    /// Master switch. When false, sessions open inactive without probing the kernel.
    pub enabled: bool,
    pub sba_tracking_mode: SbaTrackingMode,
    /// Fixed ways count for cache region reservations.
    pub clos_num_cache_ways: Option<u16>,
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sba_tracking_mode: SbaTrackingMode::PerContext,
            clos_num_cache_ways: None,
        }
    }
}

/// `1`, `true`, `yes` or `on`, case-insensitive and ignoring surrounding whitespace.
fn is_truthy(raw: &str) -> bool {
    ["1", "true", "yes", "on"]
        .iter()
        .any(|accepted| raw.trim().eq_ignore_ascii_case(accepted))
}

impl DebuggerConfig {
    /// Defaults overlaid with the `GPUDBG_*` environment variables.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if lookup(DISABLE_ENV).is_some_and(|raw| is_truthy(&raw)) {
            self.enabled = false;
        }
        if let Some(raw) = lookup(SBA_TRACKING_MODE_ENV) {
            match SbaTrackingMode::parse(&raw) {
                Some(mode) => self.sba_tracking_mode = mode,
                None => tracing::warn!(value = %raw, "ignoring unknown {SBA_TRACKING_MODE_ENV}"),
            }
        }
        if let Some(raw) = lookup(CLOS_NUM_CACHE_WAYS_ENV) {
            match raw.trim().parse::<u16>() {
                Ok(ways) => self.clos_num_cache_ways = Some(ways),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid {CLOS_NUM_CACHE_WAYS_ENV}"),
            }
        }
        self
    }
}
