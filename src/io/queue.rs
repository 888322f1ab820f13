//! Bounded per-descriptor packet queue
//!
//! Each interposed socket owns one `PacketQueue`: a fixed-capacity ring of
//! packets ordered by arrival, not by wake-up time. The head packet is
//! always the next delivery candidate; it may be consumed across several
//! application reads, so `peek_mut` hands out a mutable reference instead
//! of copying.

use crate::io::pool::Buffer;

/// Capacity of one packet queue. Must be a power of two.
pub const QUEUE_CAPACITY: usize = 1024;

/// One framed payload in flight between the wire and the application.
pub struct Packet {
    /// Pool buffer holding the payload. Returned to the pool on consumption.
    pub buffer: Box<Buffer>,
    /// Total payload length.
    pub len: usize,
    /// Bytes already delivered to the application.
    pub nread: usize,
    /// Monotonic instant before which this packet must not be delivered.
    pub wakeup: libc::timespec,
}

impl Packet {
    /// Bytes not yet delivered.
    pub fn remaining(&self) -> usize {
        self.len - self.nread
    }
}

/// A bounded FIFO ring of packets for one socket descriptor.
pub struct PacketQueue {
    slots: Box<[Option<Packet>]>,
    head: usize,
    tail: usize,
    size: usize,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketQueue {
    pub fn new() -> Self {
        const { assert!(QUEUE_CAPACITY.is_power_of_two()) };
        PacketQueue {
            slots: (0..QUEUE_CAPACITY).map(|_| None).collect(),
            head: 0,
            tail: 0,
            size: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Append a packet. Overflow is a programming error: the ingress path
    /// is expected to bound in-flight packets well below capacity.
    pub fn push(&mut self, packet: Packet) {
        assert!(self.size < QUEUE_CAPACITY, "packet queue overflow");
        self.slots[self.tail] = Some(packet);
        self.tail = (self.tail + 1) & (QUEUE_CAPACITY - 1);
        self.size += 1;
    }

    /// Remove and return the head packet. Popping an empty queue is a
    /// programming error.
    pub fn pop(&mut self) -> Packet {
        assert!(self.size > 0, "pop from empty packet queue");
        let packet = self.slots[self.head].take().expect("occupied head slot");
        self.head = (self.head + 1) & (QUEUE_CAPACITY - 1);
        self.size -= 1;
        packet
    }

    /// The head packet, if any.
    pub fn peek(&self) -> Option<&Packet> {
        if self.size == 0 {
            None
        } else {
            self.slots[self.head].as_ref()
        }
    }

    /// Mutable access to the head packet so the consumer can advance
    /// `nread` in place.
    pub fn peek_mut(&mut self) -> Option<&mut Packet> {
        if self.size == 0 {
            None
        } else {
            self.slots[self.head].as_mut()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::pool::BufferPool;

    fn packet(pool: &mut BufferPool, tag: u8) -> Packet {
        let mut buffer = pool.acquire().expect("pool buffer");
        buffer.data[0] = tag;
        Packet {
            buffer,
            len: 1,
            nread: 0,
            wakeup: libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            },
        }
    }

    #[test]
    fn test_new_queue_is_empty() {
        let q = PacketQueue::new();
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
        assert!(q.peek().is_none());
    }

    #[test]
    fn test_fifo_order_preserved() {
        let mut pool = BufferPool::new(16);
        let mut q = PacketQueue::new();
        for tag in 0..16u8 {
            q.push(packet(&mut pool, tag));
        }
        for tag in 0..16u8 {
            let p = q.pop();
            assert_eq!(p.buffer.data[0], tag);
            pool.release(p.buffer);
        }
        assert!(q.is_empty());
    }

    #[test]
    fn test_peek_mut_updates_in_place() {
        let mut pool = BufferPool::new(1);
        let mut q = PacketQueue::new();
        q.push(packet(&mut pool, 9));

        q.peek_mut().unwrap().nread = 1;
        assert_eq!(q.peek().unwrap().remaining(), 0);

        let p = q.pop();
        assert_eq!(p.nread, 1);
        pool.release(p.buffer);
    }

    #[test]
    fn wraparound_keeps_fifo_order() {
        let mut pool = BufferPool::new(4);
        let mut q = PacketQueue::new();

        // Cycle enough packets through to wrap the ring indices several
        // times with a small live window.
        let mut expected = 0u8;
        for tag in 0..200u8 {
            q.push(packet(&mut pool, tag));
            if q.len() == 3 {
                let p = q.pop();
                assert_eq!(p.buffer.data[0], expected);
                expected = expected.wrapping_add(1);
                pool.release(p.buffer);
            }
        }
    }

    #[test]
    #[should_panic(expected = "packet queue overflow")]
    fn overflow_panics() {
        let mut q = PacketQueue::new();
        let mut pool = BufferPool::new(QUEUE_CAPACITY + 1);
        for _ in 0..=QUEUE_CAPACITY {
            q.push(packet(&mut pool, 0));
        }
    }

    #[test]
    #[should_panic(expected = "pop from empty packet queue")]
    fn empty_pop_panics() {
        let mut q = PacketQueue::new();
        let _ = q.pop();
    }
}
