//! Process startup interposition
//!
//! The preloaded library shadows `__libc_start_main` to slip a wrapper
//! around the application's entry point: resolve the profiled instruction
//! from the configuration, start the sample collector, run the real main,
//! then stop sampling and write the report. When any of that is not
//! possible the application runs exactly as it would unprofiled.

use std::ffi::CStr;
use std::fs;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_int, c_void};

use crate::config::{self, SAMPLE_BATCH, SAMPLE_PERIOD};
use crate::report::RunReport;
use crate::sampler;
use crate::shim::real::{self, MainFn};
use crate::shim::socket;
use crate::timeutils;

static REAL_MAIN: AtomicUsize = AtomicUsize::new(0);

struct ModuleSearch {
    needle: String,
    base: u64,
    found: bool,
}

unsafe extern "C" fn find_module(
    info: *mut libc::dl_phdr_info,
    _size: libc::size_t,
    data: *mut c_void,
) -> c_int {
    let search = &mut *(data as *mut ModuleSearch);

    let name_ptr = (*info).dlpi_name;
    let name = if name_ptr.is_null() || *name_ptr == 0 {
        // The main executable reports an empty name.
        match fs::read_link("/proc/self/exe") {
            Ok(path) => path.to_string_lossy().into_owned(),
            Err(_) => return 0,
        }
    } else {
        CStr::from_ptr(name_ptr).to_string_lossy().into_owned()
    };

    if name.contains(&search.needle) {
        search.base = (*info).dlpi_addr;
        search.found = true;
        return 1; // stop iteration
    }
    0
}

/// Load base of the first loaded object whose path contains `target`.
pub fn module_base(target: &str) -> Option<u64> {
    let mut search = ModuleSearch {
        needle: target.to_string(),
        base: 0,
        found: false,
    };
    unsafe {
        libc::dl_iterate_phdr(Some(find_module), &mut search as *mut ModuleSearch as *mut c_void)
    };
    search.found.then_some(search.base)
}

fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("warn");
    let _ = env_logger::Builder::from_env(env).try_init();
}

unsafe fn run_real_main(
    argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    let addr = REAL_MAIN.load(Ordering::SeqCst);
    if addr == 0 {
        // Nothing sensible to run without the saved entry point.
        libc::_exit(1);
    }
    let main: MainFn = mem::transmute::<usize, MainFn>(addr);
    main(argc, argv, envp)
}

unsafe extern "C" fn profiled_main(
    argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    init_logging();

    let Some(cfg) = config::startup_config() else {
        log::warn!(
            "{} or {} not set, running without profiler",
            config::ENV_MODULE,
            config::ENV_OFFSET
        );
        return run_real_main(argc, argv, envp);
    };

    let Some(base) = module_base(&cfg.module) else {
        log::warn!(
            "target module {:?} not loaded, running without profiler",
            cfg.module
        );
        return run_real_main(argc, argv, envp);
    };
    let target_ip = base.wrapping_add(cfg.offset);

    let collector = sampler::collector();
    if let Err(e) = collector.init(target_ip, SAMPLE_PERIOD, SAMPLE_BATCH) {
        log::warn!("cannot initialize sample collector ({}), running without profiler", e);
        return run_real_main(argc, argv, envp);
    }
    if let Err(e) = collector.start() {
        log::warn!("cannot start sample collector ({}), running without profiler", e);
        let _ = collector.stop();
        return run_real_main(argc, argv, envp);
    }

    let started = timeutils::now();
    let status = run_real_main(argc, argv, envp);
    let finished = timeutils::now();

    if let Err(e) = collector.stop() {
        log::warn!("cannot stop sample collector: {}", e);
    }

    let report = RunReport {
        module: cfg.module.clone(),
        offset: cfg.offset_hex.clone(),
        speedup_factor: cfg.speedup_factor_raw.clone(),
        hits: collector.hits(),
        samples: collector.samples(),
        virtual_delay_ns: socket::total_virtual_delay_ns(),
        wall_ns: timeutils::diff_ns(&finished, &started) as u64,
    };
    report.write_or_stderr();

    status
}

#[no_mangle]
pub unsafe extern "C" fn __libc_start_main(
    main: unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int,
    argc: c_int,
    argv: *mut *mut c_char,
    init: *mut c_void,
    fini: *mut c_void,
    rtld_fini: *mut c_void,
    stack_end: *mut c_void,
) -> c_int {
    REAL_MAIN.store(main as usize, Ordering::SeqCst);
    let start_main = real::libc_start_main();
    start_main(profiled_main, argc, argv, init, fini, rtld_fini, stack_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_the_main_executable_by_name() {
        // The test binary's own path always contains "vtprof".
        let exe = fs::read_link("/proc/self/exe").unwrap();
        let name = exe.file_name().unwrap().to_str().unwrap().to_string();
        assert!(module_base(&name).is_some());
    }

    #[test]
    fn finds_libc_by_substring() {
        assert!(module_base("libc").is_some());
    }

    #[test]
    fn missing_module_reports_none() {
        assert!(module_base("no-such-module-on-earth.so.999").is_none());
    }

    #[test]
    fn shared_object_base_is_nonzero() {
        // The main executable may load at 0 without PIE; a shared library
        // never does.
        let base = module_base("libc").unwrap();
        assert_ne!(base, 0);
    }
}
