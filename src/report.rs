//! Run report written at application exit
//!
//! One text file per profiled process, keyed by pid, consumed by the
//! offline analysis that fits speedup curves across runs.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use crate::errors::Result;

/// Everything one profiled run reports back to the launcher.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub module: String,
    pub offset: String,
    pub speedup_factor: Option<String>,
    pub hits: u64,
    pub samples: u64,
    pub virtual_delay_ns: u64,
    pub wall_ns: u64,
}

impl RunReport {
    /// File name for this process's report.
    pub fn file_name() -> String {
        format!("{}.txt", process::id())
    }

    /// The report as text, one field per line.
    pub fn render(&self) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}\n{}\n{}\n",
            self.module,
            self.offset,
            self.speedup_factor.as_deref().unwrap_or(""),
            self.hits,
            self.samples,
            self.virtual_delay_ns,
            self.wall_ns,
        )
    }

    /// Write the report under `dir`, returning the path written.
    pub fn write_to(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(Self::file_name());
        fs::write(&path, self.render())?;
        Ok(path)
    }

    /// Write `<pid>.txt` into the working directory; if the file cannot be
    /// opened, dump the report to standard error instead.
    pub fn write_or_stderr(&self) {
        if let Err(e) = self.write_to(Path::new(".")) {
            log::warn!("cannot write report file: {}", e);
            eprint!("{}", self.render());
        }
    }
}
