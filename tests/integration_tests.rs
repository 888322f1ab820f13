//! Integration tests for vtprof
//!
//! These drive the interposition internals end-to-end over real
//! socketpairs: framing on egress, buffered virtual-delay release on
//! ingress, and epoll readiness synthesis. The C ABI wrappers stay thin,
//! so the `_impl` functions exercised here carry all the logic.

use std::os::unix::io::RawFd;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use vtprof::config;
use vtprof::io::frame::{self, FrameHeader, HEADER_LEN, MAX_PAYLOAD, PACKET_SIZE};
use vtprof::shim::socket::{
    close_impl, descriptor_table, epoll_pwait_impl, read_impl, refill, total_virtual_delay_ns,
    write_impl,
};
use vtprof::timeutils;

static INTEGRATION_TEST_LOCK: Mutex<()> = Mutex::new(());

/// A connected AF_UNIX stream pair, closed on drop.
struct SocketPair {
    left: RawFd,
    right: RawFd,
}

impl SocketPair {
    fn new() -> Self {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0, "socketpair failed");
        SocketPair {
            left: fds[0],
            right: fds[1],
        }
    }
}

impl Drop for SocketPair {
    fn drop(&mut self) {
        // close_impl also unregisters interposed descriptors.
        let _ = close_impl(self.left);
        let _ = close_impl(self.right);
    }
}

fn write_raw(fd: RawFd, bytes: &[u8]) {
    let n = unsafe { libc::write(fd, bytes.as_ptr() as *const libc::c_void, bytes.len()) };
    assert_eq!(n, bytes.len() as libc::ssize_t);
}

/// Build a frame with an explicit server-call count, as an instrumented
/// sender that performed upstream work would.
fn framed(payload: &[u8], server_calls: u32) -> Vec<u8> {
    let header = FrameHeader {
        number_server_calls: server_calls,
        total_virtual_delay: 0,
        data_size: payload.len() as u32,
    };
    let mut out = vec![0u8; HEADER_LEN + payload.len()];
    let total = frame::encode_frame(&header, payload, &mut out);
    out.truncate(total);
    out
}

/// Shimmed write to shimmed read delivers the exact payload, header
/// invisible to both ends.
#[test]
fn framed_roundtrip_payload_sizes() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    for n in [1usize, 100, 1000, MAX_PAYLOAD] {
        let pair = SocketPair::new();
        descriptor_table().register(pair.left);
        descriptor_table().register(pair.right);

        let payload: Vec<u8> = (0..n).map(|i| (i % 251) as u8).collect();
        let written = write_impl(pair.left, &payload).unwrap();
        assert_eq!(written, n, "payload accounting for n={}", n);

        let mut buf = vec![0u8; PACKET_SIZE];
        let mut got = Vec::new();
        while got.len() < n {
            let r = read_impl(pair.right, &mut buf).unwrap();
            assert!(r > 0, "unexpected EOF at {} of {}", got.len(), n);
            got.extend_from_slice(&buf[..r]);
        }
        assert_eq!(got, payload, "roundtrip for n={}", n);
    }
}

/// A non-shimmed writer's bytes arrive unmodified and without delay.
#[test]
fn unframed_peer_passes_through() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.right);

    let delay_before = total_virtual_delay_ns();
    write_raw(pair.left, b"hello\n");

    let start = Instant::now();
    let mut buf = [0u8; 64];
    let n = read_impl(pair.right, &mut buf).unwrap();

    assert_eq!(&buf[..n], b"hello\n");
    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(total_virtual_delay_ns(), delay_before);
}

/// A zero-delay frame is deliverable immediately.
#[test]
fn framed_peer_zero_delay() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.right);

    write_raw(pair.left, &framed(b"abc", 0));

    let start = Instant::now();
    let mut buf = [0u8; 64];
    let n = read_impl(pair.right, &mut buf).unwrap();

    assert_eq!(&buf[..n], b"abc");
    assert!(start.elapsed() < Duration::from_millis(50));
}

/// Delivery of a delayed frame waits out the wake-up time and accounts
/// the injected delay.
#[test]
fn framed_peer_nonzero_delay() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.right);

    let server_calls = 5u32;
    let expected_delay = config::delay_unit_ns() * server_calls as u64;
    let delay_before = total_virtual_delay_ns();

    write_raw(pair.left, &framed(b"delayed", server_calls));

    let before = timeutils::now();
    let mut buf = [0u8; 64];
    let n = read_impl(pair.right, &mut buf).unwrap();
    let after = timeutils::now();

    assert_eq!(&buf[..n], b"delayed");
    assert!(
        timeutils::diff_ns(&after, &before) as u64 >= expected_delay,
        "first byte arrived before the wake-up time"
    );
    assert_eq!(total_virtual_delay_ns() - delay_before, expected_delay);
}

/// Several frames in one kernel read are queued and delivered in order.
#[test]
fn multiple_frames_in_one_read() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.right);

    let mut wire = framed(b"first", 0);
    wire.extend_from_slice(&framed(b"second", 0));
    write_raw(pair.left, &wire);

    let mut buf = [0u8; 64];
    let n = read_impl(pair.right, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"first");
    let n = read_impl(pair.right, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"second");
}

/// A frame split across two writes is reassembled by continuation reads.
#[test]
fn frame_spanning_two_reads() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.right);

    let payload: Vec<u8> = (0..600).map(|i| (i % 249) as u8).collect();
    let wire = framed(&payload, 0);
    let (head, tail) = wire.split_at(HEADER_LEN + 250);

    write_raw(pair.left, head);
    let writer_fd = pair.left;
    let tail = tail.to_vec();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        write_raw(writer_fd, &tail);
    });

    let mut buf = vec![0u8; PACKET_SIZE];
    let mut got = Vec::new();
    while got.len() < payload.len() {
        let n = read_impl(pair.right, &mut buf).unwrap();
        assert!(n > 0);
        got.extend_from_slice(&buf[..n]);
    }
    writer.join().unwrap();
    assert_eq!(got, payload);
}

/// A consumer with a small buffer drains one packet across several reads.
#[test]
fn partial_consumption_preserves_prefix_order() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.left);
    descriptor_table().register(pair.right);

    let payload: Vec<u8> = (0..300).map(|i| (i % 253) as u8).collect();
    write_impl(pair.left, &payload).unwrap();

    let mut got = Vec::new();
    let mut buf = [0u8; 64];
    while got.len() < payload.len() {
        let n = read_impl(pair.right, &mut buf).unwrap();
        assert!(n > 0);
        got.extend_from_slice(&buf[..n]);
    }
    assert_eq!(got, payload);
}

/// Writes beyond the frame budget are silently truncated; the caller sees
/// the payload bytes that actually fit.
#[test]
fn oversized_write_truncates_to_frame_budget() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.left);

    let payload = vec![0xa5u8; MAX_PAYLOAD + 100];
    let written = write_impl(pair.left, &payload).unwrap();
    assert_eq!(written, MAX_PAYLOAD);
}

/// Ten descriptors hold future packets, one holds a due packet: epoll
/// reports exactly the due descriptor, promptly.
#[test]
fn epoll_reports_only_due_descriptors() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let mut pairs = Vec::new();
    for _ in 0..11 {
        pairs.push(SocketPair::new());
    }

    // Ten future packets...
    for pair in &pairs[..10] {
        descriptor_table().register(pair.right);
        write_raw(pair.left, &framed(b"future", 50_000));
        // Prime the queue without delivering.
        let queue = descriptor_table().lookup(pair.right).unwrap();
        let mut queue = queue.lock().unwrap();
        refill(pair.right, &mut queue).unwrap();
        assert!(!queue.is_empty());
    }

    // ...and one due now.
    let due = &pairs[10];
    descriptor_table().register(due.right);
    write_raw(due.left, &framed(b"now", 0));
    {
        let queue = descriptor_table().lookup(due.right).unwrap();
        let mut queue = queue.lock().unwrap();
        refill(due.right, &mut queue).unwrap();
    }

    let epfd = unsafe { libc::epoll_create1(0) };
    assert!(epfd >= 0);

    let start = Instant::now();
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 32];
    let n = epoll_pwait_impl(epfd, &mut events, -1, std::ptr::null()).unwrap();

    assert!(start.elapsed() < Duration::from_millis(100));
    assert_eq!(n, 1);
    let event = events[0];
    assert_eq!(event.u64 as RawFd, due.right);
    assert_ne!(event.events & libc::EPOLLIN as u32, 0);

    unsafe { libc::close(epfd) };
}

/// With nothing queued and nothing registered, the shim honors the
/// caller's timeout through the real epoll.
#[test]
fn epoll_timeout_propagates() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let epfd = unsafe { libc::epoll_create1(0) };
    assert!(epfd >= 0);

    let start = Instant::now();
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
    let n = epoll_pwait_impl(epfd, &mut events, 50, std::ptr::null()).unwrap();

    assert_eq!(n, 0);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(45), "returned too early");
    assert!(elapsed < Duration::from_millis(500), "overshot the timeout");

    unsafe { libc::close(epfd) };
}

/// A kernel-ready descriptor whose data is still in the future is hidden
/// from the caller until its wake-up passes.
#[test]
fn epoll_hides_future_data_until_due() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.right);

    let epfd = unsafe { libc::epoll_create1(0) };
    assert!(epfd >= 0);
    let mut ev = libc::epoll_event {
        events: libc::EPOLLIN as u32,
        u64: pair.right as u64,
    };
    let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pair.right, &mut ev) };
    assert_eq!(rc, 0);

    // ~20ms in the future at the default delay unit.
    let server_calls = (20_000_000 / config::delay_unit_ns().max(1)) as u32;
    write_raw(pair.left, &framed(b"later", server_calls));

    let start = Instant::now();
    let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
    let n = epoll_pwait_impl(epfd, &mut events, 2000, std::ptr::null()).unwrap();
    let elapsed = start.elapsed();

    assert_eq!(n, 1);
    assert_eq!(events[0].u64 as RawFd, pair.right);
    assert!(
        elapsed >= Duration::from_millis(15),
        "event released {}ms in, before the wake-up time",
        elapsed.as_millis()
    );

    let mut buf = [0u8; 16];
    let r = read_impl(pair.right, &mut buf).unwrap();
    assert_eq!(&buf[..r], b"later");

    unsafe { libc::close(epfd) };
}

/// EOF on an interposed descriptor surfaces as a zero-byte read.
#[test]
fn eof_propagates_through_shim() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.right);

    unsafe { libc::shutdown(pair.left, libc::SHUT_WR) };
    let mut buf = [0u8; 16];
    assert_eq!(read_impl(pair.right, &mut buf).unwrap(), 0);
}

/// Closing an interposed descriptor unregisters it; subsequent traffic on
/// a reused fd number is untouched unless re-registered.
#[test]
fn close_unregisters_descriptor() {
    let _lock = INTEGRATION_TEST_LOCK.lock();

    let pair = SocketPair::new();
    descriptor_table().register(pair.left);
    assert!(descriptor_table().contains(pair.left));

    close_impl(pair.left).unwrap();
    assert!(!descriptor_table().contains(pair.left));

    // Only right is left open; drop will close it again harmlessly.
}
