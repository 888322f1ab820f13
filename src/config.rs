//! Profiler configuration from the environment
//!
//! The launcher communicates with the preloaded shim exclusively through
//! environment variables: the module and offset naming the instruction to
//! watch, and an optional speedup factor scaling the per-hit virtual delay.
//! The configuration is read once and frozen for the lifetime of the
//! process; children re-read it after exec.

use std::env;
use std::sync::LazyLock;

use crate::errors::{ProfileError, Result};

/// Module whose load base anchors the profiled instruction pointer.
pub const ENV_MODULE: &str = "TARGET_MODULE";
/// Hex offset of the profiled instruction within the target module.
pub const ENV_OFFSET: &str = "TARGET_OFFSET";
/// Optional speedup factor in [0, 1] scaling the injected delay.
pub const ENV_SPEEDUP: &str = "SPEEDUP_FACTOR";

/// Nanoseconds of task-clock time between samples.
pub const SAMPLE_PERIOD: u64 = 10_000;
/// Samples the drain handler is expected to find per timer firing.
pub const SAMPLE_BATCH: u64 = 4;

/// Startup configuration, immutable once read.
#[derive(Debug, Clone, PartialEq)]
pub struct StartupConfig {
    /// Substring matched against loaded module paths.
    pub module: String,
    /// Offset string exactly as received, echoed into the report.
    pub offset_hex: String,
    /// Parsed offset within the target module.
    pub offset: u64,
    /// Validated speedup factor, if one was supplied.
    pub speedup_factor: Option<f64>,
    /// Factor string exactly as received, echoed into the report.
    pub speedup_factor_raw: Option<String>,
}

impl StartupConfig {
    /// Parse a configuration from its raw string parts.
    pub fn parse(module: &str, offset_hex: &str, factor: Option<&str>) -> Result<Self> {
        if module.is_empty() {
            return Err(ProfileError::InvalidConfig(
                "target module name is empty".to_string(),
            ));
        }

        let digits = offset_hex
            .trim()
            .trim_start_matches("0x")
            .trim_start_matches("0X");
        let offset = u64::from_str_radix(digits, 16).map_err(|_| {
            ProfileError::InvalidConfig(format!("bad hex offset {:?}", offset_hex))
        })?;

        let speedup_factor = match factor {
            None => None,
            Some(s) => {
                let f: f64 = s.trim().parse().map_err(|_| {
                    ProfileError::InvalidConfig(format!("bad speedup factor {:?}", s))
                })?;
                if !(0.0..=1.0).contains(&f) {
                    return Err(ProfileError::InvalidConfig(format!(
                        "speedup factor {} outside [0, 1]",
                        f
                    )));
                }
                Some(f)
            }
        };

        Ok(Self {
            module: module.to_string(),
            offset_hex: offset_hex.to_string(),
            offset,
            speedup_factor,
            speedup_factor_raw: factor.map(str::to_string),
        })
    }

    /// Read the configuration from the environment. Returns `None` when the
    /// required variables are missing or malformed; the caller is expected
    /// to run the application unprofiled in that case.
    pub fn from_env() -> Option<Self> {
        let module = env::var(ENV_MODULE).ok()?;
        let offset = env::var(ENV_OFFSET).ok()?;
        let factor = env::var(ENV_SPEEDUP).ok();

        match Self::parse(&module, &offset, factor.as_deref()) {
            Ok(config) => Some(config),
            Err(e) => {
                log::warn!("ignoring profiler configuration: {}", e);
                None
            }
        }
    }

    /// Nanoseconds of delay injected per server call recorded in a frame.
    pub fn delay_unit_ns(&self) -> u64 {
        let factor = self.speedup_factor.unwrap_or(1.0);
        (factor * SAMPLE_PERIOD as f64).round() as u64
    }
}

static CONFIG: LazyLock<Option<StartupConfig>> = LazyLock::new(StartupConfig::from_env);

/// The process-wide configuration snapshot, taken on first access.
pub fn startup_config() -> Option<&'static StartupConfig> {
    CONFIG.as_ref()
}

/// The per-server-call delay for this process; full sample period when no
/// configuration (or no factor) is present.
pub fn delay_unit_ns() -> u64 {
    startup_config()
        .map(StartupConfig::delay_unit_ns)
        .unwrap_or(SAMPLE_PERIOD)
}
