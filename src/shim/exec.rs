//! execve interposition: keep children instrumented
//!
//! Long pipelines replace their images, which would strip the preload and
//! profiler variables from any environment the caller builds by hand. The
//! interposed execve rebuilds the child environment with the relevant
//! variables first, then appends the caller's entries, capped at 100 in
//! total.

use std::env;
use std::ffi::{CStr, CString};
use std::ptr;

use libc::{c_char, c_int};

use crate::config;
use crate::errors::{ProfileError, Result};
use crate::shim::{real, set_errno};

/// Environment variables reconstructed from this process for the child.
const PRESERVED_VARS: [&str; 4] = [
    "LD_PRELOAD",
    config::ENV_MODULE,
    config::ENV_OFFSET,
    config::ENV_SPEEDUP,
];

/// Upper bound on the combined child environment.
const MAX_ENV_ENTRIES: usize = 100;

/// Build the child environment: preserved profiler variables first (those
/// set in this process), then the caller's entries.
pub fn build_exec_env(caller: &[CString]) -> Result<Vec<CString>> {
    let mut merged = Vec::with_capacity(PRESERVED_VARS.len() + caller.len());

    for key in PRESERVED_VARS {
        if let Ok(value) = env::var(key) {
            if let Ok(entry) = CString::new(format!("{}={}", key, value)) {
                merged.push(entry);
            }
        }
    }

    let preserved = merged.len();
    for entry in caller {
        if merged.len() >= MAX_ENV_ENTRIES {
            return Err(ProfileError::EnvTooLarge(preserved + caller.len()));
        }
        merged.push(entry.clone());
    }

    Ok(merged)
}

#[no_mangle]
pub unsafe extern "C" fn execve(
    pathname: *const c_char,
    argv: *const *const c_char,
    envp: *const *const c_char,
) -> c_int {
    let mut caller = Vec::new();
    if !envp.is_null() {
        let mut i = 0;
        loop {
            let entry = *envp.add(i);
            if entry.is_null() {
                break;
            }
            caller.push(CStr::from_ptr(entry).to_owned());
            i += 1;
        }
    }

    let merged = match build_exec_env(&caller) {
        Ok(merged) => merged,
        Err(e) => {
            set_errno(e.raw_os_error());
            return -1;
        }
    };

    let mut env_ptrs: Vec<*const c_char> = merged.iter().map(|entry| entry.as_ptr()).collect();
    env_ptrs.push(ptr::null());

    real::execve()(pathname, argv, env_ptrs.as_ptr())
}
