//! Socket interposition: framing on egress, virtual delay on ingress
//!
//! Descriptors registered on connect/accept own a packet queue. Writes to
//! them are wrapped in a magic-prefixed frame; reads buffer incoming
//! frames and release each packet only once its wake-up instant has passed
//! in real time. `epoll_pwait` reconciles kernel readiness with queued
//! packets so event loops observe delayed data "arriving" late.
//!
//! The exported C-ABI wrappers stay thin; the `_impl` functions carry the
//! logic and are exercised directly by the integration tests.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::slice;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{LazyLock, Mutex, MutexGuard};

use libc::{c_int, c_void, size_t, socklen_t, ssize_t};
use nix::errno::Errno;
use nix::poll::{ppoll, PollFd, PollFlags};
use nix::sys::time::TimeSpec;

use crate::config;
use crate::errors::{ProfileError, Result};
use crate::io::frame::{self, FrameHeader, HEADER_LEN, MAGIC_LEN, PACKET_SIZE};
use crate::io::pool::{Buffer, BufferPool, BUFFER_LEN, DEFAULT_POOL_BUFFERS};
use crate::io::queue::{Packet, PacketQueue};
use crate::io::table::{DescriptorTable, SharedQueue};
use crate::shim::{real, set_errno};
use crate::timeutils;

static TABLE: LazyLock<DescriptorTable> = LazyLock::new(DescriptorTable::new);
static POOL: LazyLock<Mutex<BufferPool>> =
    LazyLock::new(|| Mutex::new(BufferPool::new(DEFAULT_POOL_BUFFERS)));
static TOTAL_DELAY_NS: AtomicU64 = AtomicU64::new(0);

/// The process-wide descriptor table.
pub fn descriptor_table() -> &'static DescriptorTable {
    &TABLE
}

/// Total virtual delay injected into this process's ingress, nanoseconds.
pub fn total_virtual_delay_ns() -> u64 {
    TOTAL_DELAY_NS.load(Ordering::Relaxed)
}

/// The process-wide buffer pool.
pub fn buffer_pool() -> &'static Mutex<BufferPool> {
    &POOL
}

fn pool() -> MutexGuard<'static, BufferPool> {
    POOL.lock().unwrap_or_else(|poison| poison.into_inner())
}

fn acquire_buffer() -> Option<Box<Buffer>> {
    pool().acquire()
}

fn release_buffer(buf: Box<Buffer>) {
    pool().release(buf);
}

fn lock_queue(queue: &SharedQueue) -> MutexGuard<'_, PacketQueue> {
    queue.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// One blocking real read plus frame parsing, appending completed packets
/// to `queue`. A read may carry several frames, and a frame may span
/// several reads; additional reads are issued only to finish the packet in
/// progress. Returns the bytes consumed, `Ok(0)` when the peer hit EOF
/// before producing anything.
pub fn refill(fd: RawFd, queue: &mut PacketQueue) -> Result<usize> {
    let mut scratch = acquire_buffer().ok_or(ProfileError::PoolExhausted)?;
    let result = refill_from(fd, queue, &mut scratch);
    release_buffer(scratch);
    result
}

fn refill_from(fd: RawFd, queue: &mut PacketQueue, scratch: &mut Buffer) -> Result<usize> {
    let read_fn = real::read();

    let n = unsafe { read_fn(fd, scratch.data.as_mut_ptr() as *mut c_void, PACKET_SIZE) };
    if n == 0 {
        return Ok(0);
    }
    if n < 0 {
        return Err(Errno::last().into());
    }

    let base = timeutils::now();
    let delay_unit = config::delay_unit_ns();

    let mut avail = n as usize;
    let mut total = avail;
    let mut consumed = 0usize;
    let mut pending: Option<Packet> = None;

    while consumed < avail {
        if pending.is_none() {
            let rest = &scratch.data[consumed..avail];
            let (len, wakeup) = if rest.len() >= HEADER_LEN && frame::starts_with_magic(rest) {
                let header = FrameHeader::decode(&rest[MAGIC_LEN..HEADER_LEN]);
                consumed += HEADER_LEN;

                let delay = delay_unit * header.number_server_calls as u64;
                if delay > 0 {
                    TOTAL_DELAY_NS.fetch_add(delay, Ordering::Relaxed);
                }
                let mut wakeup = base;
                timeutils::add_ns(&mut wakeup, delay);

                // The write side caps payloads at a pool buffer.
                ((header.data_size as usize).min(BUFFER_LEN), wakeup)
            } else {
                // No header: the rest of this read is one undelayed packet.
                (rest.len(), base)
            };

            let buffer = acquire_buffer().ok_or(ProfileError::PoolExhausted)?;
            pending = Some(Packet {
                buffer,
                len,
                nread: 0,
                wakeup,
            });
        }

        let packet = pending.as_mut().expect("packet in progress");
        let to_copy = packet.remaining().min(avail - consumed);
        packet.buffer.data[packet.nread..packet.nread + to_copy]
            .copy_from_slice(&scratch.data[consumed..consumed + to_copy]);
        consumed += to_copy;
        packet.nread += to_copy;

        if packet.remaining() == 0 {
            let mut done = pending.take().expect("completed packet");
            done.nread = 0;
            queue.push(done);
        } else {
            // Partial frame: its tail arrives in the next read.
            let n = unsafe { read_fn(fd, scratch.data.as_mut_ptr() as *mut c_void, PACKET_SIZE) };
            if n <= 0 {
                if let Some(partial) = pending.take() {
                    release_buffer(partial.buffer);
                }
                if n < 0 {
                    return Err(Errno::last().into());
                }
                return Ok(total);
            }
            avail = n as usize;
            total += avail;
            consumed = 0;
        }
    }

    Ok(total)
}

/// Interposed read: deliver from the descriptor's queue, waiting out the
/// head packet's wake-up time when necessary.
pub fn read_impl(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    let Some(queue) = TABLE.lookup(fd) else {
        let n = unsafe { real::read()(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        if n < 0 {
            return Err(Errno::last().into());
        }
        return Ok(n as usize);
    };

    let mut queue = lock_queue(&queue);
    if queue.is_empty() {
        if refill(fd, &mut queue)? == 0 {
            return Ok(0);
        }
        if queue.is_empty() {
            // The read ended before completing a single packet.
            return Ok(0);
        }
    }

    loop {
        let now = timeutils::now();
        let head_wakeup = queue.peek().expect("head packet").wakeup;

        if timeutils::time_passed(&head_wakeup, &now) {
            let (copied, finished) = {
                let head = queue.peek_mut().expect("head packet");
                let to_copy = head.remaining().min(buf.len());
                buf[..to_copy]
                    .copy_from_slice(&head.buffer.data[head.nread..head.nread + to_copy]);
                head.nread += to_copy;
                (to_copy, head.remaining() == 0)
            };
            if finished {
                let done = queue.pop();
                release_buffer(done.buffer);
            }
            return Ok(copied);
        }

        // Head packet is still in the future: wait for either its wake-up
        // or new data to buffer in the meantime.
        let timeout = timeutils::time_diff(&head_wakeup, &now);
        let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        let timeout = TimeSpec::new(timeout.tv_sec, timeout.tv_nsec);

        match ppoll(&mut fds, Some(timeout), None) {
            Err(errno) => return Err(errno.into()),
            Ok(n) if n > 0 => {
                let readable = fds[0]
                    .revents()
                    .is_some_and(|revents| revents.contains(PollFlags::POLLIN));
                if readable {
                    // Errors are ignored: the head packet still serves.
                    let _ = refill(fd, &mut queue);
                }
            }
            Ok(_) => {} // timed out, head is now due
        }
    }
}

/// Interposed write: frame the payload for tracked descriptors and report
/// only the payload bytes back to the caller.
pub fn write_impl(fd: RawFd, buf: &[u8]) -> Result<usize> {
    if !TABLE.contains(fd) {
        let n = unsafe { real::write()(fd, buf.as_ptr() as *const c_void, buf.len()) };
        if n < 0 {
            return Err(Errno::last().into());
        }
        return Ok(n as usize);
    }

    let mut frame_buf = [0u8; PACKET_SIZE];
    let header = FrameHeader::for_payload(buf.len());
    let total = frame::encode_frame(&header, buf, &mut frame_buf);

    let n = unsafe { real::write()(fd, frame_buf.as_ptr() as *const c_void, total) };
    if n < 0 {
        return Err(Errno::last().into());
    }
    Ok((n as usize).saturating_sub(HEADER_LEN))
}

/// Remove the descriptor's queue, returning its buffers to the pool, then
/// close for real.
pub fn close_impl(fd: RawFd) -> Result<()> {
    if let Some(queue) = TABLE.remove(fd) {
        let mut queue = lock_queue(&queue);
        while !queue.is_empty() {
            let packet = queue.pop();
            release_buffer(packet.buffer);
        }
    }
    if unsafe { real::close()(fd) } < 0 {
        return Err(Errno::last().into());
    }
    Ok(())
}

/// Earliest wake-up instant across all queued head packets.
fn earliest_wakeup() -> Option<libc::timespec> {
    let mut earliest: Option<libc::timespec> = None;
    for (_, queue) in TABLE.snapshot() {
        let queue = lock_queue(&queue);
        if let Some(head) = queue.peek() {
            let sooner = earliest
                .map(|e| timeutils::time_passed(&head.wakeup, &e))
                .unwrap_or(true);
            if sooner {
                earliest = Some(head.wakeup);
            }
        }
    }
    earliest
}

fn synthesize_ready(events: &mut [libc::epoll_event], at: &libc::timespec) -> usize {
    let mut count = 0;
    for (fd, queue) in TABLE.snapshot() {
        if count == events.len() {
            break;
        }
        let queue = lock_queue(&queue);
        let releasable = queue
            .peek()
            .is_some_and(|head| timeutils::time_passed(&head.wakeup, at));
        if releasable {
            events[count] = libc::epoll_event {
                events: libc::EPOLLIN as u32,
                u64: fd as u64,
            };
            count += 1;
        }
    }
    count
}

/// Interposed epoll wait: report queued packets whose wake-up has passed,
/// hide kernel-ready descriptors whose data is still in the future, and
/// keep waiting within the caller's timeout budget until something is
/// releasable.
///
/// Queue-held descriptors are considered candidates regardless of which
/// epoll instance they are registered with; the table does not track epoll
/// membership.
pub fn epoll_pwait_impl(
    epfd: RawFd,
    events: &mut [libc::epoll_event],
    timeout: c_int,
    sigmask: *const libc::sigset_t,
) -> Result<usize> {
    let start = timeutils::now();
    let max = events.len();

    let mut nfds = synthesize_ready(events, &start);
    let mut spent_ms: c_int = 0;

    while nfds == 0 && (timeout < 0 || timeout > spent_ms) {
        // Refilled-but-not-yet-due data is invisible to the kernel, so the
        // real wait is capped at the earliest queued wake-up; expiry of
        // that cap re-enters the scan below instead of ending the call.
        let pending = earliest_wakeup();
        let remaining = if timeout < 0 { -1 } else { timeout - spent_ms };
        let wait = match pending {
            Some(wakeup) => {
                let now = timeutils::now();
                let until = if timeutils::time_passed(&wakeup, &now) {
                    0
                } else {
                    timeutils::diff_ms(&wakeup, &now).min(c_int::MAX as i64 - 1) as c_int + 1
                };
                if remaining < 0 {
                    until
                } else {
                    until.min(remaining)
                }
            }
            None => remaining,
        };

        let n = unsafe {
            real::epoll_pwait()(epfd, events.as_mut_ptr(), max as c_int, wait, sigmask)
        };
        if n < 0 {
            return Err(Errno::last().into());
        }
        if n == 0 && pending.is_none() {
            // Genuine timeout with nothing queued anywhere.
            return Ok(0);
        }

        let at = timeutils::now();

        // Every readable fd we own gets refilled so the kernel will not
        // re-report the same bytes; events whose head packet is still in
        // the future are compacted out of the returned region.
        let mut curr = 0usize;
        let mut end = n as usize;
        while curr < end {
            let event = events[curr];
            if event.events & libc::EPOLLIN as u32 != 0 {
                let fd = event.u64 as RawFd;
                if let Some(queue) = TABLE.lookup(fd) {
                    let mut queue = lock_queue(&queue);
                    let _ = refill(fd, &mut queue);
                    let releasable = queue
                        .peek()
                        .is_some_and(|head| timeutils::time_passed(&head.wakeup, &at));
                    if releasable {
                        curr += 1;
                    } else {
                        end -= 1;
                        events.swap(curr, end);
                    }
                    continue;
                }
            }
            curr += 1;
        }
        nfds = end;

        if timeout >= 0 {
            spent_ms = timeutils::diff_ms(&at, &start) as c_int;
        }

        // Packets that came due while we were waiting on the kernel.
        for (fd, queue) in TABLE.snapshot() {
            if nfds == max {
                break;
            }
            let queue = lock_queue(&queue);
            let releasable = queue
                .peek()
                .is_some_and(|head| timeutils::time_passed(&head.wakeup, &at));
            if releasable {
                events[nfds] = libc::epoll_event {
                    events: libc::EPOLLIN as u32,
                    u64: fd as u64,
                };
                nfds += 1;
            }
        }
    }

    Ok(nfds)
}

// ---------------------------------------------------------------------------
// C ABI entry points
// ---------------------------------------------------------------------------

#[no_mangle]
pub unsafe extern "C" fn connect(
    sockfd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> c_int {
    let ret = real::connect()(sockfd, addr, addrlen);
    if ret == 0 || (ret == -1 && Errno::last() == Errno::EINPROGRESS) {
        TABLE.register(sockfd);
    }
    ret
}

#[no_mangle]
pub unsafe extern "C" fn accept(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> c_int {
    let fd = real::accept()(sockfd, addr, addrlen);
    if fd >= 0 {
        TABLE.register(fd);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn accept4(
    sockfd: c_int,
    addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
    flags: c_int,
) -> c_int {
    let fd = real::accept4()(sockfd, addr, addrlen, flags);
    if fd >= 0 {
        TABLE.register(fd);
    }
    fd
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: c_int) -> c_int {
    match close_impl(fd) {
        Ok(()) => 0,
        Err(e) => {
            set_errno(e.raw_os_error());
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: c_int, buf: *mut c_void, count: size_t) -> ssize_t {
    if buf.is_null() || !TABLE.contains(fd) {
        return real::read()(fd, buf, count);
    }
    let slice = slice::from_raw_parts_mut(buf as *mut u8, count);
    match read_impl(fd, slice) {
        Ok(n) => n as ssize_t,
        Err(e) => {
            set_errno(e.raw_os_error());
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: c_int, buf: *const c_void, count: size_t) -> ssize_t {
    if buf.is_null() || !TABLE.contains(fd) {
        return real::write()(fd, buf, count);
    }
    let slice = slice::from_raw_parts(buf as *const u8, count);
    match write_impl(fd, slice) {
        Ok(n) => n as ssize_t,
        Err(e) => {
            set_errno(e.raw_os_error());
            -1
        }
    }
}

#[no_mangle]
pub unsafe extern "C" fn epoll_pwait(
    epfd: c_int,
    events: *mut libc::epoll_event,
    maxevents: c_int,
    timeout: c_int,
    sigmask: *const libc::sigset_t,
) -> c_int {
    if events.is_null() || maxevents <= 0 {
        return real::epoll_pwait()(epfd, events, maxevents, timeout, sigmask);
    }
    let slice = slice::from_raw_parts_mut(events, maxevents as usize);
    match epoll_pwait_impl(epfd, slice, timeout, sigmask) {
        Ok(n) => n as c_int,
        Err(e) => {
            set_errno(e.raw_os_error());
            -1
        }
    }
}
