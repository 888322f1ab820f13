//! Lazy resolution of the real libc entry points
//!
//! Every interposed function shadows its libc counterpart in the dynamic
//! symbol table, so calling the wrapper by name from inside this library
//! would recurse into the shim. The real implementations are looked up
//! once via `dlsym(RTLD_NEXT, ...)` and cached in process statics.
//!
//! Resolution failure is fatal: any later interposed call would crash
//! anyway, so the process exits immediately with a diagnostic written via
//! a raw syscall (the usual channels are themselves interposed).

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{c_char, c_int, c_void, size_t, sockaddr, socklen_t, ssize_t};

pub(crate) type MainFn =
    unsafe extern "C" fn(c_int, *mut *mut c_char, *mut *mut c_char) -> c_int;

pub(crate) type ReadFn = unsafe extern "C" fn(c_int, *mut c_void, size_t) -> ssize_t;
pub(crate) type WriteFn = unsafe extern "C" fn(c_int, *const c_void, size_t) -> ssize_t;
pub(crate) type CloseFn = unsafe extern "C" fn(c_int) -> c_int;
pub(crate) type ConnectFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;
pub(crate) type AcceptFn = unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t) -> c_int;
pub(crate) type Accept4Fn =
    unsafe extern "C" fn(c_int, *mut sockaddr, *mut socklen_t, c_int) -> c_int;
pub(crate) type EpollPwaitFn = unsafe extern "C" fn(
    c_int,
    *mut libc::epoll_event,
    c_int,
    c_int,
    *const libc::sigset_t,
) -> c_int;
pub(crate) type ExecveFn =
    unsafe extern "C" fn(*const c_char, *const *const c_char, *const *const c_char) -> c_int;
pub(crate) type LibcStartMainFn = unsafe extern "C" fn(
    MainFn,
    c_int,
    *mut *mut c_char,
    *mut c_void,
    *mut c_void,
    *mut c_void,
    *mut c_void,
) -> c_int;

fn fatal_unresolved(symbol: &str) -> ! {
    // stderr through a raw syscall: libc::write resolves back into the shim.
    let msg = format!("vtprof: failed to resolve real `{}`, exiting\n", symbol);
    unsafe {
        libc::syscall(
            libc::SYS_write,
            2 as c_int,
            msg.as_ptr() as *const c_void,
            msg.len(),
        );
        libc::_exit(1);
    }
}

fn resolve(symbol: &'static str, cache: &AtomicUsize) -> usize {
    let cached = cache.load(Ordering::Acquire);
    if cached != 0 {
        return cached;
    }
    let addr = unsafe { libc::dlsym(libc::RTLD_NEXT, symbol.as_ptr() as *const c_char) };
    if addr.is_null() {
        fatal_unresolved(&symbol[..symbol.len() - 1]);
    }
    cache.store(addr as usize, Ordering::Release);
    addr as usize
}

macro_rules! real_fn {
    ($fn_name:ident, $symbol:literal, $ty:ty) => {
        pub(crate) fn $fn_name() -> $ty {
            static CACHE: AtomicUsize = AtomicUsize::new(0);
            let addr = resolve(concat!($symbol, "\0"), &CACHE);
            unsafe { mem::transmute::<usize, $ty>(addr) }
        }
    };
}

real_fn!(read, "read", ReadFn);
real_fn!(write, "write", WriteFn);
real_fn!(close, "close", CloseFn);
real_fn!(connect, "connect", ConnectFn);
real_fn!(accept, "accept", AcceptFn);
real_fn!(accept4, "accept4", Accept4Fn);
real_fn!(epoll_pwait, "epoll_pwait", EpollPwaitFn);
real_fn!(execve, "execve", ExecveFn);
real_fn!(libc_start_main, "__libc_start_main", LibcStartMainFn);
