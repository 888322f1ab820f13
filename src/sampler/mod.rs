//! Sample collection via the kernel performance-event facility
//!
//! The collector opens a software task-clock counter sampling the
//! instruction pointer and call chain, maps its ring buffer, and arms a
//! per-thread interval timer whose SIGPROF drains the ring and counts how
//! often the profiled address was executing. The drain runs inside the
//! signal handler on the application's stack: it touches only the mapped
//! ring, a fixed stack scratch, and a handful of atomics.

pub mod ring;

use std::mem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::gettid;
use perf_event_open_sys::bindings as perf;
use perf_event_open_sys::ioctls;

use crate::errors::{ProfileError, Result};
use self::ring::{DATA_SIZE, HEADER_PAGE, MAP_SIZE, RECORD_HEADER_LEN, RECORD_SCRATCH};

/// POSIX timer id. Only ever touched from the owning thread; the raw
/// handle itself is freely movable.
struct TimerId(libc::timer_t);

unsafe impl Send for TimerId {}

struct Inner {
    perf_fd: RawFd,
    timer: Option<TimerId>,
    interval_ns: u64,
}

/// Process-wide sample collector.
///
/// Counters and the ring-buffer pointer live in atomics so the signal
/// handler can read them without locking; everything else sits behind a
/// mutex taken only from init/start/stop.
pub struct SampleCollector {
    inner: Mutex<Inner>,
    ring_map: AtomicPtr<u8>,
    target_ip: AtomicU64,
    hits: AtomicU64,
    samples: AtomicU64,
    draining: AtomicBool,
}

static COLLECTOR: SampleCollector = SampleCollector::new();

/// The process-wide collector instance.
pub fn collector() -> &'static SampleCollector {
    &COLLECTOR
}

extern "C" fn handle_sigprof(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    COLLECTOR.drain();
}

impl SampleCollector {
    const fn new() -> Self {
        SampleCollector {
            inner: Mutex::new(Inner {
                perf_fd: -1,
                timer: None,
                interval_ns: 0,
            }),
            ring_map: AtomicPtr::new(ptr::null_mut()),
            target_ip: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            samples: AtomicU64::new(0),
            draining: AtomicBool::new(false),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    /// Open the counter, map its ring buffer, create the per-thread timer
    /// and install the SIGPROF handler. The counter stays disabled until
    /// [`start`](Self::start).
    pub fn init(&self, target_ip: u64, sample_period: u64, batch_size: u64) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.perf_fd >= 0 {
            return Err(ProfileError::AlreadyInitialized);
        }

        let mut attr = perf::perf_event_attr::default();
        attr.size = mem::size_of::<perf::perf_event_attr>() as u32;
        attr.type_ = perf::PERF_TYPE_SOFTWARE;
        attr.config = perf::PERF_COUNT_SW_TASK_CLOCK as u64;
        attr.sample_type = (perf::PERF_SAMPLE_IP
            | perf::PERF_SAMPLE_CALLCHAIN) as u64;
        attr.__bindgen_anon_1.sample_period = sample_period;
        attr.__bindgen_anon_2.wakeup_events = batch_size as u32;
        attr.set_exclude_idle(1);
        attr.set_exclude_kernel(1);
        attr.set_disabled(1);

        let fd = unsafe {
            libc::syscall(
                libc::SYS_perf_event_open,
                &attr,
                0 as libc::pid_t,
                -1 as libc::c_int,
                -1 as libc::c_int,
                perf::PERF_FLAG_FD_CLOEXEC as libc::c_ulong,
            )
        };
        if fd < 0 {
            return Err(Errno::last().into());
        }
        let fd = fd as RawFd;

        let map = unsafe {
            libc::mmap(
                ptr::null_mut(),
                MAP_SIZE,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if map == libc::MAP_FAILED {
            let errno = Errno::last();
            unsafe { libc::close(fd) };
            return Err(errno.into());
        }

        // Route the interval timer's signal to this thread, measured in
        // this thread's CPU time.
        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = libc::SIGPROF;
        sev.sigev_notify_thread_id = gettid().as_raw();

        let mut timer: libc::timer_t = ptr::null_mut();
        if unsafe { libc::timer_create(libc::CLOCK_THREAD_CPUTIME_ID, &mut sev, &mut timer) } != 0
        {
            let errno = Errno::last();
            unsafe {
                libc::munmap(map, MAP_SIZE);
                libc::close(fd);
            }
            return Err(errno.into());
        }

        let action = SigAction::new(
            SigHandler::SigAction(handle_sigprof),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        if let Err(errno) = unsafe { signal::sigaction(Signal::SIGPROF, &action) } {
            unsafe {
                libc::timer_delete(timer);
                libc::munmap(map, MAP_SIZE);
                libc::close(fd);
            }
            return Err(errno.into());
        }

        self.target_ip.store(target_ip, Ordering::Relaxed);
        self.ring_map.store(map as *mut u8, Ordering::Release);
        inner.perf_fd = fd;
        inner.timer = Some(TimerId(timer));
        inner.interval_ns = sample_period * batch_size;
        Ok(())
    }

    /// Arm the interval timer and enable the counter.
    pub fn start(&self) -> Result<()> {
        let inner = self.lock_inner();
        if inner.perf_fd < 0 {
            return Err(ProfileError::NotInitialized);
        }
        let timer = inner.timer.as_ref().ok_or(ProfileError::NotInitialized)?;

        let interval = libc::timespec {
            tv_sec: (inner.interval_ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (inner.interval_ns % 1_000_000_000) as libc::c_long,
        };
        let spec = libc::itimerspec {
            it_interval: interval,
            it_value: interval,
        };
        if unsafe { libc::timer_settime(timer.0, 0, &spec, ptr::null_mut()) } != 0 {
            return Err(Errno::last().into());
        }

        if unsafe { ioctls::ENABLE(inner.perf_fd, 0) } < 0 {
            return Err(Errno::last().into());
        }
        Ok(())
    }

    /// Disarm the timer, disable and close the counter, unmap the ring.
    /// Counters remain readable afterwards.
    pub fn stop(&self) -> Result<()> {
        let mut inner = self.lock_inner();
        if inner.perf_fd < 0 {
            return Err(ProfileError::NotInitialized);
        }

        if let Some(timer) = inner.timer.take() {
            unsafe { libc::timer_delete(timer.0) };
        }
        unsafe { ioctls::DISABLE(inner.perf_fd, 0) };

        // Clear the handler's view of the mapping before tearing it down.
        let map = self.ring_map.swap(ptr::null_mut(), Ordering::AcqRel);
        if !map.is_null() {
            unsafe { libc::munmap(map as *mut libc::c_void, MAP_SIZE) };
        }
        unsafe { libc::close(inner.perf_fd) };
        inner.perf_fd = -1;
        Ok(())
    }

    /// Samples whose instruction pointer or call chain matched the target.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total records consumed from the ring.
    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }

    /// Drain pending records from the ring buffer. Signal-handler entry
    /// point: no allocation, no locks, reentrancy guarded by a flag.
    pub fn drain(&self) {
        if self.draining.swap(true, Ordering::Acquire) {
            // A prior invocation is still processing on this thread.
            return;
        }

        let map = self.ring_map.load(Ordering::Acquire);
        if map.is_null() {
            self.draining.store(false, Ordering::Release);
            return;
        }

        let page = map as *mut perf::perf_event_mmap_page;
        let head = unsafe { ptr::read_volatile(ptr::addr_of!((*page).data_head)) };
        fence(Ordering::Acquire);
        let mut tail = unsafe { ptr::read_volatile(ptr::addr_of!((*page).data_tail)) };

        // Records between tail and head are stable until data_tail is
        // advanced past them.
        let data = unsafe { slice::from_raw_parts(map.add(HEADER_PAGE) as *const u8, DATA_SIZE) };
        let target = self.target_ip.load(Ordering::Relaxed);
        let mut body = [0u8; RECORD_SCRATCH];

        while tail + (RECORD_HEADER_LEN as u64) < head {
            let size = ring::record_size(data, tail);
            if size < RECORD_HEADER_LEN {
                break;
            }
            let body_len = (size - RECORD_HEADER_LEN).min(RECORD_SCRATCH);
            ring::copy_from_ring(data, tail + RECORD_HEADER_LEN as u64, &mut body[..body_len]);

            let hits = ring::count_target_hits(&body[..body_len], target);
            if hits > 0 {
                self.hits.fetch_add(hits, Ordering::Relaxed);
            }
            self.samples.fetch_add(1, Ordering::Relaxed);
            tail += size as u64;
        }

        fence(Ordering::Release);
        unsafe { ptr::write_volatile(ptr::addr_of_mut!((*page).data_tail), tail) };

        self.draining.store(false, Ordering::Release);
    }
}
