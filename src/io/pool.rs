//! Fixed-population buffer pool
//!
//! Ingress reads land in pool buffers instead of fresh allocations. A
//! buffer is either threaded on the pool's free list or owned by exactly
//! one in-flight [`Packet`](crate::io::queue::Packet); Rust ownership makes
//! the "never both, never neither" invariant structural. An empty pool is
//! the back-pressure signal: `acquire` returns `None` and the caller
//! surfaces the failure instead of growing the pool.

/// Payload capacity of one buffer in bytes.
pub const BUFFER_LEN: usize = 1024;

/// Default number of buffers in the process-wide pool.
pub const DEFAULT_POOL_BUFFERS: usize = 1024;

/// A fixed-capacity byte buffer with an intrinsic free-list link.
pub struct Buffer {
    next: Option<Box<Buffer>>,
    /// Payload storage.
    pub data: [u8; BUFFER_LEN],
}

impl Buffer {
    fn boxed() -> Box<Buffer> {
        Box::new(Buffer {
            next: None,
            data: [0u8; BUFFER_LEN],
        })
    }
}

/// A pool of equally sized buffers on a singly-linked free list.
pub struct BufferPool {
    head: Option<Box<Buffer>>,
    free: usize,
}

impl BufferPool {
    /// Allocate `buffers` buffers and push them all onto the free list.
    pub fn new(buffers: usize) -> Self {
        let mut pool = BufferPool {
            head: None,
            free: 0,
        };
        for _ in 0..buffers {
            pool.release(Buffer::boxed());
        }
        pool
    }

    /// Remove and return the head of the free list, or `None` when the
    /// pool is exhausted.
    pub fn acquire(&mut self) -> Option<Box<Buffer>> {
        let mut buf = self.head.take()?;
        self.head = buf.next.take();
        self.free -= 1;
        Some(buf)
    }

    /// Prepend `buf` to the free list.
    pub fn release(&mut self, mut buf: Box<Buffer>) {
        buf.next = self.head.take();
        self.head = Some(buf);
        self.free += 1;
    }

    /// Number of buffers currently on the free list.
    pub fn free_buffers(&self) -> usize {
        self.free
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        // Unlink iteratively so a long free list cannot recurse through
        // nested Box drops. Buffers checked out at this point are owned by
        // live packets and freed with them.
        let mut current = self.head.take();
        while let Some(mut buf) = current {
            current = buf.next.take();
        }
    }
}
