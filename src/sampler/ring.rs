//! Perf ring-buffer geometry and record scanning
//!
//! The kernel publishes samples into a shared mapping of one header page
//! followed by a power-of-two number of data pages. Records wrap at the
//! end of the data area, so consumers copy them out in up to two chunks
//! before parsing. Everything here is allocation-free: the drain runs in
//! a signal handler.

/// Size of the mmap header page holding producer/consumer offsets.
pub const HEADER_PAGE: usize = 0x1000;

/// Data pages in the ring. The mapping must be (1 + 2^n) pages long.
pub const DATA_PAGES: usize = 1 << 3;

/// Bytes of record storage in the ring.
pub const DATA_SIZE: usize = DATA_PAGES * 0x1000;

/// Total mapping size.
pub const MAP_SIZE: usize = HEADER_PAGE + DATA_SIZE;

/// Stack scratch for one record body.
pub const RECORD_SCRATCH: usize = 4096;

/// Bytes of one `perf_event_header` (u32 type, u16 misc, u16 size).
pub const RECORD_HEADER_LEN: usize = 8;

/// Copy `out.len()` bytes starting at ring offset `index` out of the data
/// area, handling wraparound at the end of `data`. `data.len()` must be a
/// power of two.
pub fn copy_from_ring(data: &[u8], index: u64, out: &mut [u8]) {
    let start = index as usize & (data.len() - 1);
    let end = start + out.len();

    if end <= data.len() {
        out.copy_from_slice(&data[start..end]);
    } else {
        let first = data.len() - start;
        out[..first].copy_from_slice(&data[start..]);
        out[first..].copy_from_slice(&data[..end - data.len()]);
    }
}

/// Total record size declared by the header at ring offset `index`.
pub fn record_size(data: &[u8], index: u64) -> usize {
    let mut header = [0u8; RECORD_HEADER_LEN];
    copy_from_ring(data, index, &mut header);
    u16::from_ne_bytes([header[6], header[7]]) as usize
}

/// Count how often `target` appears in a sample body: once for the sampled
/// instruction pointer, plus once per matching call-chain frame.
///
/// Body layout: `u64 ip`, `u64 nr`, then `nr` call-chain addresses. Bodies
/// truncated by the scratch buffer are scanned as far as they go.
pub fn count_target_hits(body: &[u8], target: u64) -> u64 {
    if body.len() < 8 {
        return 0;
    }
    let ip = u64::from_ne_bytes(body[0..8].try_into().unwrap());
    let mut hits = u64::from(ip == target);

    if body.len() < 16 {
        return hits;
    }
    let nr = u64::from_ne_bytes(body[8..16].try_into().unwrap());
    for i in 0..nr {
        let off = 16 + (i as usize) * 8;
        if off + 8 > body.len() {
            break;
        }
        let addr = u64::from_ne_bytes(body[off..off + 8].try_into().unwrap());
        if addr == target {
            hits += 1;
        }
    }
    hits
}
