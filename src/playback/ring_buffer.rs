//! Lock-free ring buffer for rendered audio frames
//!
//! Single-producer single-consumer byte ring sized in frames of the rendering
//! format. The producer is the decoder worker, the consumer is the real-time
//! render callback.
//!
//! Design:
//! - `write()` and `read()` are wait-free and never allocate
//! - Only whole frames move; partial reads/writes return the frame count
//!   actually transferred
//! - Positions are monotonic byte counters; the writer publishes with
//!   Release, the reader observes with Acquire (and vice versa)
//! - `reset()` and `reconfigure()` require quiescence: neither side may be
//!   mid-operation. The engine establishes this with the mute protocol
//!   before touching either.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// SPSC byte ring holding interleaved audio frames.
pub struct FrameRing {
    /// Backing storage; replaced only under the quiescence precondition
    buf: UnsafeCell<Box<[u8]>>,

    /// Capacity in bytes (always a whole number of frames)
    capacity_bytes: AtomicUsize,

    /// Size of one frame in bytes
    bytes_per_frame: AtomicUsize,

    /// Total bytes ever written (monotonic)
    write_pos: AtomicU64,

    /// Total bytes ever read (monotonic)
    read_pos: AtomicU64,
}

// One writer thread, one reader thread; the byte ranges they touch are
// disjoint by construction (reader never advances past write_pos, writer
// never laps read_pos).
unsafe impl Send for FrameRing {}
unsafe impl Sync for FrameRing {}

impl FrameRing {
    /// Create a ring holding `capacity_frames` frames of `bytes_per_frame`
    /// bytes each.
    pub fn new(capacity_frames: usize, bytes_per_frame: usize) -> Self {
        let capacity_bytes = capacity_frames * bytes_per_frame;
        FrameRing {
            buf: UnsafeCell::new(vec![0u8; capacity_bytes].into_boxed_slice()),
            capacity_bytes: AtomicUsize::new(capacity_bytes),
            bytes_per_frame: AtomicUsize::new(bytes_per_frame),
            write_pos: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
        }
    }

    pub fn capacity_frames(&self) -> usize {
        let bpf = self.bytes_per_frame.load(Ordering::Relaxed);
        self.capacity_bytes.load(Ordering::Relaxed) / bpf
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame.load(Ordering::Relaxed)
    }

    /// Frames available to the reader.
    pub fn frames_readable(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        let bpf = self.bytes_per_frame.load(Ordering::Relaxed);
        ((w - r) as usize) / bpf
    }

    /// Frames available to the writer.
    pub fn frames_writable(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        let cap = self.capacity_bytes.load(Ordering::Relaxed);
        let bpf = self.bytes_per_frame.load(Ordering::Relaxed);
        (cap - (w - r) as usize) / bpf
    }

    /// Commit up to `data.len() / bytes_per_frame` frames.
    ///
    /// Returns the number of frames actually written (less than requested
    /// when space is lacking, zero for an empty input). Wait-free; called
    /// only by the producer.
    pub fn write(&self, data: &[u8]) -> usize {
        let bpf = self.bytes_per_frame.load(Ordering::Relaxed);
        let cap = self.capacity_bytes.load(Ordering::Relaxed);

        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        let free_bytes = cap - (w - r) as usize;

        let want_frames = data.len() / bpf;
        let n_frames = want_frames.min(free_bytes / bpf);
        if n_frames == 0 {
            return 0;
        }
        let n_bytes = n_frames * bpf;

        let start = (w as usize) % cap;
        let first = n_bytes.min(cap - start);
        unsafe {
            let base = (*self.buf.get()).as_mut_ptr();
            std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(start), first);
            if first < n_bytes {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr().add(first),
                    base,
                    n_bytes - first,
                );
            }
        }

        self.write_pos.store(w + n_bytes as u64, Ordering::Release);
        n_frames
    }

    /// Read up to `out.len() / bytes_per_frame` frames into `out`.
    ///
    /// Returns the number of frames actually read. Wait-free; called only by
    /// the consumer. The caller fills any shortfall with silence.
    pub fn read(&self, out: &mut [u8]) -> usize {
        let bpf = self.bytes_per_frame.load(Ordering::Relaxed);
        let cap = self.capacity_bytes.load(Ordering::Relaxed);

        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Relaxed);
        let avail_bytes = (w - r) as usize;

        let want_frames = out.len() / bpf;
        let n_frames = want_frames.min(avail_bytes / bpf);
        if n_frames == 0 {
            return 0;
        }
        let n_bytes = n_frames * bpf;

        let start = (r as usize) % cap;
        let first = n_bytes.min(cap - start);
        unsafe {
            let base = (*self.buf.get()).as_ptr();
            std::ptr::copy_nonoverlapping(base.add(start), out.as_mut_ptr(), first);
            if first < n_bytes {
                std::ptr::copy_nonoverlapping(
                    base,
                    out.as_mut_ptr().add(first),
                    n_bytes - first,
                );
            }
        }

        self.read_pos.store(r + n_bytes as u64, Ordering::Release);
        n_frames
    }

    /// Discard all buffered frames.
    ///
    /// Precondition: neither reader nor writer is mid-operation (the engine
    /// mutes the output and lets the worker perform the reset itself).
    pub fn reset(&self) {
        self.write_pos.store(0, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Release);
    }

    /// Replace the backing storage for a new capacity and frame size.
    ///
    /// Same precondition as [`reset`](Self::reset). Used when the rendering
    /// format changes and when the first decoder establishes the format.
    pub fn reconfigure(&self, capacity_frames: usize, bytes_per_frame: usize) {
        let capacity_bytes = capacity_frames * bytes_per_frame;
        unsafe {
            *self.buf.get() = vec![0u8; capacity_bytes].into_boxed_slice();
        }
        self.bytes_per_frame.store(bytes_per_frame, Ordering::Relaxed);
        self.capacity_bytes.store(capacity_bytes, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Relaxed);
        self.read_pos.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_ring_is_empty() {
        let ring = FrameRing::new(128, 8);
        assert_eq!(ring.capacity_frames(), 128);
        assert_eq!(ring.bytes_per_frame(), 8);
        assert_eq!(ring.frames_readable(), 0);
        assert_eq!(ring.frames_writable(), 128);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let ring = FrameRing::new(16, 4);

        let data: Vec<u8> = (0..32).collect(); // 8 frames
        assert_eq!(ring.write(&data), 8);
        assert_eq!(ring.frames_readable(), 8);
        assert_eq!(ring.frames_writable(), 8);

        let mut out = vec![0u8; 32];
        assert_eq!(ring.read(&mut out), 8);
        assert_eq!(out, data);
        assert_eq!(ring.frames_readable(), 0);
    }

    #[test]
    fn test_partial_write_when_full() {
        let ring = FrameRing::new(4, 2);

        let data = [1u8; 12]; // 6 frames into a 4-frame ring
        assert_eq!(ring.write(&data), 4);
        assert_eq!(ring.write(&data), 0);
        assert_eq!(ring.frames_writable(), 0);
    }

    #[test]
    fn test_partial_read_when_short() {
        let ring = FrameRing::new(8, 2);

        ring.write(&[7u8; 6]); // 3 frames
        let mut out = [0u8; 16]; // asks for 8
        assert_eq!(ring.read(&mut out), 3);
        assert_eq!(&out[..6], &[7u8; 6]);
        assert_eq!(&out[6..], &[0u8; 10]);
    }

    #[test]
    fn test_zero_sized_ops_do_not_advance() {
        let ring = FrameRing::new(8, 4);
        ring.write(&[1u8; 8]); // 2 frames

        assert_eq!(ring.write(&[]), 0);
        let mut empty: [u8; 0] = [];
        assert_eq!(ring.read(&mut empty), 0);
        // A sub-frame slice moves nothing either
        assert_eq!(ring.write(&[0u8; 3]), 0);
        assert_eq!(ring.frames_readable(), 2);
    }

    #[test]
    fn test_wraparound() {
        let ring = FrameRing::new(4, 2);

        // Fill, drain half, refill across the wrap point
        assert_eq!(ring.write(&[1, 1, 2, 2, 3, 3, 4, 4]), 4);
        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out), 2);
        assert_eq!(out, [1, 1, 2, 2]);

        assert_eq!(ring.write(&[5, 5, 6, 6]), 2);
        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out), 4);
        assert_eq!(out, [3, 3, 4, 4, 5, 5, 6, 6]);
    }

    #[test]
    fn test_reset_discards_content() {
        let ring = FrameRing::new(8, 2);
        ring.write(&[9u8; 8]);
        assert_eq!(ring.frames_readable(), 4);

        ring.reset();
        assert_eq!(ring.frames_readable(), 0);
        assert_eq!(ring.frames_writable(), 8);
    }

    #[test]
    fn test_reconfigure_changes_geometry() {
        let ring = FrameRing::new(8, 2);
        ring.write(&[1u8; 8]);

        ring.reconfigure(16, 4);
        assert_eq!(ring.capacity_frames(), 16);
        assert_eq!(ring.bytes_per_frame(), 4);
        assert_eq!(ring.frames_readable(), 0);
        assert_eq!(ring.frames_writable(), 16);
    }

    #[test]
    fn test_concurrent_stream_integrity() {
        // One producer, one consumer, a few hundred thousand patterned frames.
        let ring = Arc::new(FrameRing::new(1_024, 4));
        let total_frames: u64 = 200_000;

        let producer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                let mut frame_idx: u64 = 0;
                let mut chunk = vec![0u8; 64 * 4];
                while frame_idx < total_frames {
                    let frames = (total_frames - frame_idx).min(64);
                    for i in 0..frames as usize {
                        let bytes = ((frame_idx + i as u64) as u32).to_le_bytes();
                        chunk[i * 4..i * 4 + 4].copy_from_slice(&bytes);
                    }
                    let written = ring.write(&chunk[..frames as usize * 4]);
                    frame_idx += written as u64;
                    if written == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut expected: u64 = 0;
        let mut out = vec![0u8; 128 * 4];
        while expected < total_frames {
            let read = ring.read(&mut out);
            for i in 0..read {
                let got = u32::from_le_bytes(out[i * 4..i * 4 + 4].try_into().unwrap());
                assert_eq!(got as u64, expected, "stream corrupted at frame {}", expected);
                expected += 1;
            }
            if read == 0 {
                std::thread::yield_now();
            }
        }

        producer.join().unwrap();
    }
}
