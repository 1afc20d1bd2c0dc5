//! Render-event channel
//!
//! Fixed-capacity SPSC byte ring carrying event records from the real-time
//! render callback to the notifier. Records are variable length, each
//! starting with a 4-byte tag:
//!
//! - rendering started:  tag + sequence (u64) + host time (u64) — 20 bytes
//! - rendering complete: tag + sequence (u64) + host time (u64) — 20 bytes
//! - out of audio:       tag + host time (u64)                  — 12 bytes
//!
//! The writer never blocks: a record that does not fit is dropped and
//! counted. Records are committed whole, so the reader always sees intact
//! framing.

use ringbuf::{traits::*, HeapCons, HeapProd, HeapRb};

const TAG_RENDERING_STARTED: u32 = u32::from_le_bytes(*b"rbgn");
const TAG_RENDERING_COMPLETE: u32 = u32::from_le_bytes(*b"rend");
const TAG_OUT_OF_AUDIO: u32 = u32::from_le_bytes(*b"noau");

/// Largest record size (tag + two u64 payloads).
const MAX_RECORD_BYTES: usize = 20;

/// Event emitted by the render callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    RenderingStarted { sequence: u64, host_time: u64 },
    RenderingComplete { sequence: u64, host_time: u64 },
    OutOfAudio { host_time: u64 },
}

/// Create a render-event channel with the given byte capacity.
pub fn render_event_channel(capacity_bytes: usize) -> (RenderEventWriter, RenderEventReader) {
    let rb = HeapRb::<u8>::new(capacity_bytes);
    let (prod, cons) = rb.split();
    (
        RenderEventWriter { prod },
        RenderEventReader { cons },
    )
}

/// Producer half, owned by the render callback.
pub struct RenderEventWriter {
    prod: HeapProd<u8>,
}

impl RenderEventWriter {
    /// Push an event record.
    ///
    /// Returns false (and writes nothing) when the record does not fit.
    /// Wait-free and allocation-free.
    pub fn push(&mut self, event: RenderEvent) -> bool {
        let mut record = [0u8; MAX_RECORD_BYTES];
        let len = encode(event, &mut record);

        if self.prod.vacant_len() < len {
            return false;
        }
        self.prod.push_slice(&record[..len]);
        true
    }
}

/// Consumer half, owned by the notifier.
pub struct RenderEventReader {
    cons: HeapCons<u8>,
}

impl RenderEventReader {
    /// Pop the next complete event record, if any.
    pub fn pop(&mut self) -> Option<RenderEvent> {
        if self.cons.occupied_len() < 4 {
            return None;
        }

        let tag = self.pop_u32();
        match tag {
            TAG_RENDERING_STARTED => Some(RenderEvent::RenderingStarted {
                sequence: self.pop_u64(),
                host_time: self.pop_u64(),
            }),
            TAG_RENDERING_COMPLETE => Some(RenderEvent::RenderingComplete {
                sequence: self.pop_u64(),
                host_time: self.pop_u64(),
            }),
            TAG_OUT_OF_AUDIO => Some(RenderEvent::OutOfAudio {
                host_time: self.pop_u64(),
            }),
            _ => None,
        }
    }

    fn pop_u32(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        self.cons.pop_slice(&mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn pop_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.cons.pop_slice(&mut bytes);
        u64::from_le_bytes(bytes)
    }
}

fn encode(event: RenderEvent, out: &mut [u8; MAX_RECORD_BYTES]) -> usize {
    match event {
        RenderEvent::RenderingStarted { sequence, host_time } => {
            out[0..4].copy_from_slice(&TAG_RENDERING_STARTED.to_le_bytes());
            out[4..12].copy_from_slice(&sequence.to_le_bytes());
            out[12..20].copy_from_slice(&host_time.to_le_bytes());
            20
        }
        RenderEvent::RenderingComplete { sequence, host_time } => {
            out[0..4].copy_from_slice(&TAG_RENDERING_COMPLETE.to_le_bytes());
            out[4..12].copy_from_slice(&sequence.to_le_bytes());
            out[12..20].copy_from_slice(&host_time.to_le_bytes());
            20
        }
        RenderEvent::OutOfAudio { host_time } => {
            out[0..4].copy_from_slice(&TAG_OUT_OF_AUDIO.to_le_bytes());
            out[4..12].copy_from_slice(&host_time.to_le_bytes());
            12
        }
    }
}
