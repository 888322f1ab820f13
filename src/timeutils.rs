//! Monotonic-clock arithmetic on `timespec` values
//!
//! Packet wake-up times and poll timeouts are plain `libc::timespec`
//! instants from `CLOCK_MONOTONIC`, so they can be produced and compared
//! without heap allocation on any code path, including teardown.

use nix::time::{clock_gettime, ClockId};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Current `CLOCK_MONOTONIC` time.
pub fn now() -> libc::timespec {
    // clock_gettime on CLOCK_MONOTONIC cannot fail on Linux
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC).expect("clock_gettime(CLOCK_MONOTONIC)");
    libc::timespec {
        tv_sec: ts.tv_sec(),
        tv_nsec: ts.tv_nsec(),
    }
}

/// Add `ns` nanoseconds to `t`, keeping `tv_nsec` normalized below one second.
pub fn add_ns(t: &mut libc::timespec, ns: u64) {
    let mut add_sec = (ns / NANOS_PER_SEC as u64) as libc::time_t;
    let ns_rem = (ns % NANOS_PER_SEC as u64) as libc::c_long;

    t.tv_nsec += ns_rem;
    add_sec += (t.tv_nsec / NANOS_PER_SEC) as libc::time_t;
    t.tv_nsec %= NANOS_PER_SEC;
    t.tv_sec += add_sec;
}

/// Returns true when `a <= b`, i.e. instant `a` has already passed at time `b`.
pub fn time_passed(a: &libc::timespec, b: &libc::timespec) -> bool {
    a.tv_sec < b.tv_sec || (a.tv_sec == b.tv_sec && a.tv_nsec <= b.tv_nsec)
}

/// Returns `a - b` as a normalized timespec. Assumes `a >= b`.
pub fn time_diff(a: &libc::timespec, b: &libc::timespec) -> libc::timespec {
    let mut sec_diff = a.tv_sec - b.tv_sec;
    let nsec_diff = if a.tv_nsec < b.tv_nsec {
        sec_diff -= 1;
        NANOS_PER_SEC + a.tv_nsec - b.tv_nsec
    } else {
        a.tv_nsec - b.tv_nsec
    };
    libc::timespec {
        tv_sec: sec_diff,
        tv_nsec: nsec_diff,
    }
}

/// Returns `a - b` in whole nanoseconds. Assumes `a >= b`.
pub fn diff_ns(a: &libc::timespec, b: &libc::timespec) -> i64 {
    let d = time_diff(a, b);
    d.tv_sec * NANOS_PER_SEC + d.tv_nsec
}

/// Returns `a - b` in whole milliseconds. Assumes `a >= b`.
pub fn diff_ms(a: &libc::timespec, b: &libc::timespec) -> i64 {
    diff_ns(a, b) / 1_000_000
}
