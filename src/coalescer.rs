//! Input write coalescing
//!
//! Small keystroke-sized writes are collected in a [`RingBuffer`] and handed
//! to the child's input endpoint in larger batches. A batch is written when it
//! reaches the flush threshold, when the buffer would overflow, or when the
//! flush timer armed by the first buffered byte expires.

use std::io::{self, Write};
use std::time::{Duration, Instant};

use crate::config::CoalescerConfig;

/// Fixed-capacity circular byte queue
///
/// Holds at most `capacity - 1` bytes so that equal cursors always mean empty.
/// Single producer, single consumer; never overwrites unread data.
#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
}

impl RingBuffer {
    /// Create a ring buffer; capacities below 2 are raised to 2
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(2)].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn available_to_read(&self) -> usize {
        if self.write >= self.read {
            self.write - self.read
        } else {
            self.capacity() - self.read + self.write
        }
    }

    pub fn available_to_write(&self) -> usize {
        self.capacity() - 1 - self.available_to_read()
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn is_full(&self) -> bool {
        self.available_to_write() == 0
    }

    /// Append as much of `data` as fits; returns the number of bytes taken
    pub fn write(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.available_to_write());
        if n == 0 {
            return 0;
        }

        let cap = self.capacity();
        let first = n.min(cap - self.write);
        self.buf[self.write..self.write + first].copy_from_slice(&data[..first]);
        let second = n - first;
        if second > 0 {
            self.buf[..second].copy_from_slice(&data[first..n]);
        }

        self.write = (self.write + n) % cap;
        n
    }

    /// Readable bytes as two contiguous segments, oldest first
    ///
    /// The second segment is empty unless the data wraps around the end.
    pub fn read_slices(&self) -> (&[u8], &[u8]) {
        if self.write >= self.read {
            (&self.buf[self.read..self.write], &[])
        } else {
            (&self.buf[self.read..], &self.buf[..self.write])
        }
    }

    /// Mark `n` bytes as read
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.available_to_read());
        self.read = (self.read + n) % self.capacity();
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

/// Batches writes to `W` through a ring buffer
#[derive(Debug)]
pub struct WriteCoalescer<W: Write> {
    ring: RingBuffer,
    sink: W,
    threshold: usize,
    interval: Duration,
    deadline: Option<Instant>,
}

impl<W: Write> WriteCoalescer<W> {
    pub fn new(sink: W, config: &CoalescerConfig) -> Self {
        Self::with_params(
            sink,
            config.capacity,
            config.flush_threshold,
            config.flush_interval(),
        )
    }

    pub fn with_params(sink: W, capacity: usize, threshold: usize, interval: Duration) -> Self {
        let ring = RingBuffer::with_capacity(capacity);
        let threshold = threshold.clamp(1, ring.capacity() - 1);
        Self {
            ring,
            sink,
            threshold,
            interval,
            deadline: None,
        }
    }

    /// Queue `data`, flushing whenever the buffer fills or crosses the threshold
    ///
    /// Fails with `WouldBlock` if the sink accepts nothing while the buffer is
    /// full; bytes queued before that point stay queued.
    pub fn write(&mut self, mut data: &[u8]) -> io::Result<()> {
        loop {
            let n = self.ring.write(data);
            data = &data[n..];
            if data.is_empty() {
                break;
            }
            if self.flush()? == 0 {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
        }

        if self.ring.available_to_read() >= self.threshold {
            self.flush()?;
        } else if self.deadline.is_none() && !self.ring.is_empty() {
            self.deadline = Some(Instant::now() + self.interval);
        }
        Ok(())
    }

    /// Write buffered bytes to the sink; returns how many were accepted
    ///
    /// A wrapped buffer goes out as two writes. Only accepted bytes are
    /// consumed, and a short write or `WouldBlock` stops the flush with the
    /// rest still queued.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut total = 0;
        while !self.ring.is_empty() {
            let (segment, _) = self.ring.read_slices();
            let len = segment.len();
            match self.sink.write(segment) {
                Ok(0) => {
                    self.rearm();
                    return Err(io::Error::from(io::ErrorKind::WriteZero));
                },
                Ok(n) => {
                    self.ring.consume(n);
                    total += n;
                    if n < len {
                        break;
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    self.rearm();
                    return Err(e);
                },
            }
        }

        if total > 0 {
            match self.sink.flush() {
                Ok(()) => {},
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {},
                Err(e) => return Err(e),
            }
            tracing::trace!(
                bytes = total,
                pending = self.ring.available_to_read(),
                "coalescer flushed"
            );
        }

        self.rearm();
        Ok(total)
    }

    /// Flush if the timer has expired at `now`
    pub fn poll_timer(&mut self, now: Instant) -> io::Result<usize> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.flush(),
            _ => Ok(0),
        }
    }

    /// When the oldest buffered byte must be flushed
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Bytes waiting to be flushed
    pub fn pending(&self) -> usize {
        self.ring.available_to_read()
    }

    pub fn sink(&self) -> &W {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut W {
        &mut self.sink
    }

    fn rearm(&mut self) {
        self.deadline = if self.ring.is_empty() {
            None
        } else {
            Some(Instant::now() + self.interval)
        };
    }
}
