//! Decoder state slot
//!
//! One slot owns one decoder, its converter, and the per-track atomics the
//! three threads coordinate through:
//!
//! - the worker mutates the decoder/converter and advances
//!   `frames_decoded`/`frames_converted`
//! - the render callback advances `frames_rendered` and flips the rendering
//!   flags; it never touches the decoder or converter
//! - any thread may request cancellation or a seek; the worker honors both
//!   at conversion boundaries
//!
//! Counter invariants, at every observation:
//! `frames_rendered <= frames_converted`, and a slot that reaches
//! `rendering_finished` has `frames_rendered == frames_converted` with
//! `decoding_finished` set (cancellation rewinds `frames_converted` to keep
//! the equality).

use crate::audio::converter::Converter;
use crate::audio::decoder::Decoder;
use crate::audio::types::AudioFormat;
use crate::events::TrackInfo;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

/// Slot flag bits.
pub mod flag {
    pub const DECODING_STARTED: u32 = 1 << 0;
    pub const DECODING_FINISHED: u32 = 1 << 1;
    pub const RENDERING_STARTED: u32 = 1 << 2;
    pub const RENDERING_FINISHED: u32 = 1 << 3;
    pub const CANCEL_REQUESTED: u32 = 1 << 4;
    pub const MARKED_FOR_REMOVAL: u32 = 1 << 5;
}

/// Sentinel for "no seek pending".
pub const NO_SEEK: i64 = -1;

/// Sentinel for "frame length unknown".
pub const UNKNOWN_LENGTH: i64 = -1;

/// Per-track decoder state.
pub struct DecoderSlot {
    /// Enqueue-order sequence number, assigned at creation
    pub sequence: u64,

    flags: AtomicU32,

    /// Frames pulled from the decoder, at the decoder's input rate
    pub frames_decoded: AtomicU64,

    /// Frames produced by the converter, at the rendering format's rate
    pub frames_converted: AtomicU64,

    /// Frames of this track consumed by the render callback
    pub frames_rendered: AtomicU64,

    /// Total output-rate frames; revised to the exact value at end of stream
    frame_length: AtomicI64,

    /// Pending seek target in output-rate frames, or [`NO_SEEK`]
    frame_to_seek: AtomicI64,

    native_format: AudioFormat,
    seekable: bool,
    url: Option<String>,

    /// Owned decoder; locked only by the worker and (briefly, with the worker
    /// parked by the mute protocol) the facade. Never on the render path.
    pub(crate) decoder: Mutex<Box<dyn Decoder>>,

    /// Owned converter; worker only.
    pub(crate) converter: Mutex<Converter>,
}

impl std::fmt::Debug for DecoderSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderSlot")
            .field("sequence", &self.sequence)
            .field("native_format", &self.native_format)
            .field("seekable", &self.seekable)
            .field("url", &self.url)
            .finish()
    }
}

impl DecoderSlot {
    /// Build a slot around an opened decoder and its converter.
    pub(crate) fn new(sequence: u64, decoder: Box<dyn Decoder>, converter: Converter) -> Self {
        let native_format = decoder.format();
        let seekable = decoder.supports_seeking();
        let url = decoder.url();
        let estimated_input_length = decoder.frame_length();

        // Length estimate scaled to the output rate; exact value lands at EOS
        let output_rate = converter.output_format().sample_rate;
        let frame_length = if estimated_input_length < 0 {
            UNKNOWN_LENGTH
        } else {
            crate::audio::types::scale_frames(
                estimated_input_length as u64,
                native_format.sample_rate,
                output_rate,
            ) as i64
        };

        DecoderSlot {
            sequence,
            flags: AtomicU32::new(0),
            frames_decoded: AtomicU64::new(0),
            frames_converted: AtomicU64::new(0),
            frames_rendered: AtomicU64::new(0),
            frame_length: AtomicI64::new(frame_length),
            frame_to_seek: AtomicI64::new(NO_SEEK),
            native_format,
            seekable,
            url,
            decoder: Mutex::new(decoder),
            converter: Mutex::new(converter),
        }
    }

    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::AcqRel);
    }

    /// Set flags and return the prior value, so a terminal transition can be
    /// claimed by exactly one thread.
    pub(crate) fn set_flags_returning(&self, bits: u32) -> u32 {
        self.flags.fetch_or(bits, Ordering::AcqRel)
    }

    pub(crate) fn clear_flags(&self, bits: u32) {
        self.flags.fetch_and(!bits, Ordering::AcqRel);
    }

    pub fn has_flags(&self, bits: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bits == bits
    }

    pub fn has_any_flag(&self, bits: u32) -> bool {
        self.flags.load(Ordering::Acquire) & bits != 0
    }

    /// Whether the render callback may still attribute frames to this slot.
    pub fn is_renderable(&self) -> bool {
        !self.has_any_flag(flag::RENDERING_FINISHED | flag::MARKED_FOR_REMOVAL)
    }

    /// Whether the worker still owes this slot decode work.
    pub fn needs_decoding(&self) -> bool {
        !self.has_any_flag(flag::DECODING_FINISHED | flag::MARKED_FOR_REMOVAL)
    }

    pub fn request_cancel(&self) {
        self.set_flags(flag::CANCEL_REQUESTED);
    }

    pub fn cancel_requested(&self) -> bool {
        self.has_flags(flag::CANCEL_REQUESTED)
    }

    /// Terminal transition for a cancelled slot.
    ///
    /// Both finished flags are set together with the removal mark, and
    /// `frames_converted` is rewound to `frames_rendered` so the counter
    /// equality invariant holds on the terminal state. Idempotent; returns
    /// the prior flags so the caller can tell whether it won the transition.
    pub(crate) fn finish_cancelled(&self) -> u32 {
        let rendered = self.frames_rendered.load(Ordering::Acquire);
        self.frames_converted.store(rendered, Ordering::Release);
        self.set_flags_returning(
            flag::DECODING_FINISHED | flag::RENDERING_FINISHED | flag::MARKED_FOR_REMOVAL,
        )
    }

    /// Store a seek target in output-rate frames. May be called from any
    /// thread; the worker consumes it at the next conversion boundary.
    pub fn request_seek(&self, frame: i64) {
        self.frame_to_seek.store(frame, Ordering::Release);
    }

    pub fn pending_seek(&self) -> Option<i64> {
        match self.frame_to_seek.load(Ordering::Acquire) {
            NO_SEEK => None,
            frame => Some(frame),
        }
    }

    pub(crate) fn clear_seek(&self) {
        self.frame_to_seek.store(NO_SEEK, Ordering::Release);
    }

    pub fn frame_length(&self) -> i64 {
        self.frame_length.load(Ordering::Acquire)
    }

    pub(crate) fn set_frame_length(&self, frames: i64) {
        self.frame_length.store(frames, Ordering::Release);
    }

    pub fn native_format(&self) -> &AudioFormat {
        &self.native_format
    }

    pub fn seekable(&self) -> bool {
        self.seekable
    }

    /// Converted frames not yet attributed by the render callback.
    pub fn frames_pending_render(&self) -> u64 {
        let converted = self.frames_converted.load(Ordering::Acquire);
        let rendered = self.frames_rendered.load(Ordering::Acquire);
        converted.saturating_sub(rendered)
    }

    pub fn track_info(&self) -> TrackInfo {
        TrackInfo {
            sequence: self.sequence,
            url: self.url.clone(),
            format: self.native_format.clone(),
            frame_length: self.frame_length(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::converter::Converter;
    use crate::audio::decoder::Decoder;
    use crate::error::Result;

    struct StubDecoder {
        format: AudioFormat,
        length: i64,
    }

    impl Decoder for StubDecoder {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn is_open(&self) -> bool {
            true
        }
        fn format(&self) -> AudioFormat {
            self.format.clone()
        }
        fn frame_length(&self) -> i64 {
            self.length
        }
        fn current_frame(&self) -> i64 {
            0
        }
        fn supports_seeking(&self) -> bool {
            true
        }
        fn read(&mut self, _buf: &mut [f32], _max_frames: usize) -> Result<usize> {
            Ok(0)
        }
    }

    fn make_slot(sequence: u64) -> DecoderSlot {
        let format = AudioFormat::pcm_f32(48_000, 2);
        let decoder = Box::new(StubDecoder { format: format.clone(), length: 96_000 });
        let converter = Converter::new(&format, &format, 2_048).unwrap();
        DecoderSlot::new(sequence, decoder, converter)
    }

    #[test]
    fn test_new_slot_state() {
        let slot = make_slot(7);
        assert_eq!(slot.sequence, 7);
        assert!(!slot.has_any_flag(u32::MAX));
        assert!(slot.is_renderable());
        assert!(slot.needs_decoding());
        assert_eq!(slot.pending_seek(), None);
        assert_eq!(slot.frame_length(), 96_000);
        assert!(slot.seekable());
    }

    #[test]
    fn test_flag_transitions() {
        let slot = make_slot(1);

        slot.set_flags(flag::DECODING_STARTED);
        assert!(slot.has_flags(flag::DECODING_STARTED));
        assert!(slot.needs_decoding());

        slot.set_flags(flag::DECODING_FINISHED);
        assert!(!slot.needs_decoding());
        assert!(slot.is_renderable());

        slot.set_flags(flag::RENDERING_FINISHED | flag::MARKED_FOR_REMOVAL);
        assert!(!slot.is_renderable());
    }

    #[test]
    fn test_cancel_keeps_counter_equality() {
        let slot = make_slot(1);
        slot.frames_converted.store(10_000, Ordering::Release);
        slot.frames_rendered.store(4_000, Ordering::Release);

        slot.request_cancel();
        assert!(slot.cancel_requested());
        slot.finish_cancelled();

        assert!(slot.has_flags(flag::DECODING_FINISHED | flag::RENDERING_FINISHED));
        assert!(slot.has_flags(flag::MARKED_FOR_REMOVAL));
        assert_eq!(
            slot.frames_converted.load(Ordering::Acquire),
            slot.frames_rendered.load(Ordering::Acquire),
        );
        assert_eq!(slot.frames_pending_render(), 0);
    }

    #[test]
    fn test_seek_request_lifecycle() {
        let slot = make_slot(1);

        slot.request_seek(44_100);
        assert_eq!(slot.pending_seek(), Some(44_100));

        slot.clear_seek();
        assert_eq!(slot.pending_seek(), None);
    }

    #[test]
    fn test_length_estimate_scales_to_output_rate() {
        let native = AudioFormat::pcm_f32(44_100, 2);
        let rendering = AudioFormat::pcm_f32(48_000, 2);
        let decoder = Box::new(StubDecoder { format: native.clone(), length: 44_100 });
        let converter = Converter::new(&native, &rendering, 2_048).unwrap();
        let slot = DecoderSlot::new(1, decoder, converter);

        // One second of audio is one second at either rate
        assert_eq!(slot.frame_length(), 48_000);
    }
}
