//! Decoder worker thread
//!
//! One dedicated thread drives every decoder: it dequeues pending decoders,
//! installs slots into the active table, and runs the chunked decode loop
//! (convert → write ring buffer → honor seek/cancel/reset requests).
//!
//! The worker is cooperative with the output: every operation that would
//! violate the ring buffer's SPSC invariants (reset, reallocation, output
//! reconfiguration) goes through the mute protocol first. One loop iteration
//! touches at most one decoder; slots are decoded in sequence order so
//! track k always finishes decoding before track k+1 begins.

use crate::audio::converter::Converter;
use crate::audio::decoder::Decoder;
use crate::audio::types::{reverse_bits_in_place, scale_frames, AudioFormat, SampleEncoding};
use crate::error::Error;
use crate::events::ControlEvent;
use crate::playback::engine::Shared;
use crate::playback::slot::{flag, DecoderSlot};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::audio::output::OutputSink;

pub(crate) fn spawn(
    shared: Arc<Shared>,
    sink: Arc<Mutex<Box<dyn OutputSink>>>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("gapless-decoder".into())
        .spawn(move || {
            let mut worker = Worker {
                shared,
                sink,
                out_format: None,
                chunk_f32: Vec::new(),
                chunk_bytes: Vec::new(),
            };
            worker.run();
        })
}

struct Worker {
    shared: Arc<Shared>,
    sink: Arc<Mutex<Box<dyn OutputSink>>>,

    /// Rendering format cached at slot installation
    out_format: Option<AudioFormat>,

    /// Reused conversion buffer (interleaved f32)
    chunk_f32: Vec<f32>,

    /// Reused byte staging buffer for ring writes
    chunk_bytes: Vec<u8>,
}

impl Worker {
    fn run(&mut self) {
        info!("decoder worker started");
        let shared = Arc::clone(&self.shared);

        loop {
            if shared.state.shutdown.load(Ordering::Acquire) {
                break;
            }

            self.service_requests();

            if let Some(slot) = shared.table.lowest_needing_decode() {
                if slot.cancel_requested() {
                    self.finish_cancelled(slot);
                } else {
                    self.decode_chunk(slot);
                }
                continue;
            }

            shared.state.installing.store(true, Ordering::Release);
            match self.dequeue_pending() {
                Some(decoder) => {
                    self.start_decoder(decoder);
                    shared.state.installing.store(false, Ordering::Release);
                }
                None => {
                    shared.state.installing.store(false, Ordering::Release);
                    shared
                        .worker_sem
                        .wait_timeout(shared.config.worker_idle_timeout());
                }
            }
        }

        info!("decoder worker stopped");
    }

    fn dequeue_pending(&self) -> Option<Box<dyn Decoder>> {
        self.shared.pending.lock().unwrap().queue.pop_front()
    }

    fn sink_running(&self) -> bool {
        self.sink.lock().unwrap().is_running()
    }

    // ------------------------------------------------------------------
    // Control requests: ring purges and seeks
    // ------------------------------------------------------------------

    fn service_requests(&mut self) {
        let shared = Arc::clone(&self.shared);

        if shared.state.ring_needs_reset.swap(false, Ordering::AcqRel) {
            self.purge_ring();
        }

        loop {
            let slot = shared.table.lowest_pending_seek();
            match slot {
                Some(slot) => self.handle_seek(slot),
                None => break,
            }
        }
    }

    /// Discard all buffered audio and bring every surviving slot back to its
    /// rendered position. Runs under the mute protocol; if the control
    /// thread already holds the mute (skip handshake), ownership transfers
    /// here and the unmute below releases it.
    fn purge_ring(&mut self) {
        let shared = Arc::clone(&self.shared);
        let state = &shared.state;

        if !state.output_muted.load(Ordering::Acquire) {
            state.begin_mute(self.sink_running(), shared.config.mute_timeout());
        }

        shared.ring.reset();
        let rendered = state.frames_rendered.load(Ordering::Acquire);
        state.frames_converted.store(rendered, Ordering::Release);

        shared.table.for_each(|slot| {
            if slot.is_renderable() {
                self.resync_slot(slot);
            }
        });

        state.end_mute();
        debug!("ring buffer purged");
    }

    /// Re-align a slot whose buffered-but-unrendered output was discarded.
    ///
    /// Seekable decoders rewind to the rendered position and re-decode from
    /// there; others lose the discarded tail.
    fn resync_slot(&self, slot: &DecoderSlot) {
        let rendered = slot.frames_rendered.load(Ordering::Acquire);
        let converted = slot.frames_converted.load(Ordering::Acquire);
        if converted == rendered {
            return;
        }

        let mut converter = slot.converter.lock().unwrap();
        converter.reset();
        let native_rate = slot.native_format().sample_rate;
        let out_rate = converter.output_format().sample_rate;

        if slot.seekable() {
            let mut decoder = slot.decoder.lock().unwrap();
            let input_target = scale_frames(rendered, out_rate, native_rate) as i64;
            let actual = decoder.seek_to_frame(input_target);
            if actual >= 0 {
                let out_pos = scale_frames(actual as u64, native_rate, out_rate);
                slot.frames_decoded.store(actual as u64, Ordering::Release);
                slot.frames_converted.store(out_pos, Ordering::Release);
                slot.frames_rendered.store(out_pos, Ordering::Release);
                slot.clear_flags(flag::DECODING_FINISHED);
                debug!(
                    "track {} re-aligned to frame {} after purge",
                    slot.sequence, out_pos
                );
                return;
            }
        }

        slot.frames_converted.store(rendered, Ordering::Release);
        debug!("track {} truncated at frame {} after purge", slot.sequence, rendered);
    }

    fn handle_seek(&mut self, slot: &DecoderSlot) {
        let target = match slot.pending_seek() {
            Some(target) => target,
            None => return,
        };
        let shared = Arc::clone(&self.shared);
        let state = &shared.state;
        debug!("seeking track {} to frame {}", slot.sequence, target);

        if !state.output_muted.load(Ordering::Acquire) {
            state.begin_mute(self.sink_running(), shared.config.mute_timeout());
        }

        let native_rate = slot.native_format().sample_rate;
        let seek_result = {
            let mut converter = slot.converter.lock().unwrap();
            let out_rate = converter.output_format().sample_rate;
            let mut decoder = slot.decoder.lock().unwrap();
            let input_target = scale_frames(target as u64, out_rate, native_rate) as i64;
            let actual = decoder.seek_to_frame(input_target);
            if actual < 0 {
                None
            } else {
                converter.reset();
                Some((actual as u64, out_rate))
            }
        };

        match seek_result {
            None => {
                // Request cleared, counters untouched; playback continues
                // from the current position
                slot.clear_seek();
                state.end_mute();
                shared.notify(ControlEvent::EngineError(Error::SeekFailed { frame: target }));
            }
            Some((actual_input, out_rate)) => {
                shared.ring.reset();
                let out_pos = scale_frames(actual_input, native_rate, out_rate);
                slot.frames_decoded.store(actual_input, Ordering::Release);
                slot.frames_converted.store(out_pos, Ordering::Release);
                slot.frames_rendered.store(out_pos, Ordering::Release);
                slot.clear_flags(flag::DECODING_FINISHED);
                state.frames_converted.store(out_pos, Ordering::Release);
                state.frames_rendered.store(out_pos, Ordering::Release);

                shared.table.for_each(|other| {
                    if other.sequence != slot.sequence && other.is_renderable() {
                        self.resync_slot(other);
                    }
                });

                slot.clear_seek();
                state.end_mute();
                debug!("track {} now at frame {}", slot.sequence, out_pos);
            }
        }
    }

    // ------------------------------------------------------------------
    // Decode loop
    // ------------------------------------------------------------------

    fn decode_chunk(&mut self, slot: &DecoderSlot) {
        let shared = Arc::clone(&self.shared);
        let chunk = shared.config.write_chunk_frames;

        if shared.ring.frames_writable() < chunk {
            shared
                .worker_sem
                .wait_timeout(shared.config.worker_poll_timeout());
            return;
        }

        let out_format = match &self.out_format {
            Some(format) => format.clone(),
            None => match shared.pending.lock().unwrap().rendering_format.clone() {
                Some(format) => format,
                None => {
                    shared
                        .worker_sem
                        .wait_timeout(shared.config.worker_poll_timeout());
                    return;
                }
            },
        };

        if slot.native_format().encoding == SampleEncoding::Dsd {
            self.decode_dsd_chunk(slot, &out_format, chunk);
            return;
        }

        let channels = out_format.channels as usize;
        self.chunk_f32.resize(chunk * channels, 0.0);

        let mut read_err: Option<Error> = None;
        let fill_result = {
            let mut decoder = slot.decoder.lock().unwrap();
            let mut converter = slot.converter.lock().unwrap();
            let frames_decoded = &slot.frames_decoded;
            let read_err = &mut read_err;
            let mut provider = move |buf: &mut [f32], max_frames: usize| -> usize {
                match decoder.read(buf, max_frames) {
                    Ok(n) => {
                        frames_decoded.fetch_add(n as u64, Ordering::Release);
                        n
                    }
                    Err(e) => {
                        *read_err = Some(e);
                        0
                    }
                }
            };
            converter.fill(&mut self.chunk_f32, chunk, &mut provider)
        };
        let (produced, decode_err) = match fill_result {
            Ok(n) => (n, read_err),
            Err(e) => (0, Some(e)),
        };

        if produced > 0 {
            self.mark_decoding_started(slot);
            encode_samples(&self.chunk_f32[..produced * channels], &out_format, &mut self.chunk_bytes);
            let written = shared.ring.write(&self.chunk_bytes);
            if written < produced {
                warn!(
                    "ring refused {} of {} frames for track {}",
                    produced - written,
                    produced,
                    slot.sequence
                );
            }
            slot.frames_converted
                .fetch_add(written as u64, Ordering::AcqRel);
            shared
                .state
                .frames_converted
                .fetch_add(written as u64, Ordering::AcqRel);
        }

        if let Some(e) = decode_err {
            // Mid-stream failure: surface it and treat the track as ended,
            // which may produce a short render
            warn!("decode error on track {}: {}", slot.sequence, e);
            shared.notify(ControlEvent::EngineError(e));
            self.finish_decoding(slot);
        } else if produced < chunk {
            self.finish_decoding(slot);
        }
    }

    fn decode_dsd_chunk(&mut self, slot: &DecoderSlot, out_format: &AudioFormat, chunk: usize) {
        let shared = Arc::clone(&self.shared);
        let bytes_per_frame = out_format.bytes_per_frame();
        self.chunk_bytes.clear();
        self.chunk_bytes.resize(chunk * bytes_per_frame, out_format.silence_byte());

        let mut decode_err: Option<Error> = None;
        let read = {
            let mut decoder = slot.decoder.lock().unwrap();
            match decoder.read_dsd(&mut self.chunk_bytes[..chunk * bytes_per_frame], chunk) {
                Ok(n) => n,
                Err(e) => {
                    decode_err = Some(e);
                    0
                }
            }
        };

        if read > 0 {
            if slot.native_format().bit_order != out_format.bit_order {
                reverse_bits_in_place(&mut self.chunk_bytes[..read * bytes_per_frame]);
            }
            self.mark_decoding_started(slot);
            slot.frames_decoded.fetch_add(read as u64, Ordering::Release);
            let written = shared.ring.write(&self.chunk_bytes[..read * bytes_per_frame]);
            slot.frames_converted
                .fetch_add(written as u64, Ordering::AcqRel);
            shared
                .state
                .frames_converted
                .fetch_add(written as u64, Ordering::AcqRel);
        }

        if let Some(e) = decode_err {
            warn!("decode error on track {}: {}", slot.sequence, e);
            shared.notify(ControlEvent::EngineError(e));
            self.finish_decoding(slot);
        } else if read < chunk {
            self.finish_decoding(slot);
        }
    }

    fn mark_decoding_started(&self, slot: &DecoderSlot) {
        if !slot.has_flags(flag::DECODING_STARTED) {
            slot.set_flags(flag::DECODING_STARTED);
            debug!("track {} decoding started", slot.sequence);
            self.shared.notify(ControlEvent::DecodingStarted(slot.sequence));
        }
    }

    /// End-of-stream handling: record the exact frame length and, when the
    /// render callback has already consumed everything this track produced,
    /// finish the rendering side as well (nothing further will ever be
    /// attributed to it).
    fn finish_decoding(&self, slot: &DecoderSlot) {
        let total = slot.frames_converted.load(Ordering::Acquire);
        slot.set_frame_length(total as i64);
        info!("track {} decoding finished: {} frames", slot.sequence, total);
        // Notify before raising the flag: the render thread can only
        // complete the slot once the flag is visible, which keeps the
        // decoding-finished callback ahead of rendering-complete
        self.shared.notify(ControlEvent::DecodingFinished(slot.sequence));
        slot.set_flags(flag::DECODING_FINISHED);

        if slot.frames_pending_render() == 0 {
            // The render callback has nothing left to attribute (zero-length
            // stream, or the ring drained right at end of stream); finish
            // the rendering side here
            let started = slot.has_flags(flag::RENDERING_STARTED);
            let prior =
                slot.set_flags_returning(flag::RENDERING_FINISHED | flag::MARKED_FOR_REMOVAL);
            if prior & flag::RENDERING_FINISHED == 0 {
                if started {
                    self.shared
                        .notify(ControlEvent::RenderingComplete(slot.sequence));
                }
                self.shared.collector_sem.signal();
            }
        }
    }

    fn finish_cancelled(&self, slot: &DecoderSlot) {
        debug!("track {} decoding cancelled", slot.sequence);
        let prior = slot.finish_cancelled();
        self.shared.notify_cancellation(slot.sequence, prior);
        // Purge this track's unrendered audio at the next boundary
        self.shared
            .state
            .ring_needs_reset
            .store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Starting the next decoder
    // ------------------------------------------------------------------

    fn start_decoder(&mut self, mut decoder: Box<dyn Decoder>) {
        let shared = Arc::clone(&self.shared);

        if !decoder.is_open() {
            if let Err(e) = decoder.open() {
                warn!("decoder failed to open: {}", e);
                let err = match e {
                    open_err @ Error::DecoderOpenFailed { .. } => open_err,
                    other => Error::DecoderOpenFailed {
                        reason: other.to_string(),
                    },
                };
                shared.notify(ControlEvent::EngineError(err));
                return;
            }
        }

        let native = decoder.format();
        let current = shared.pending.lock().unwrap().rendering_format.clone();

        let out_format = match current {
            Some(format) if format.seamless_with(&native) => format,
            Some(old) => {
                self.await_drain();
                match self.configure_output(&native) {
                    Ok(new) => {
                        info!("rendering format changed: {} -> {}", old, new);
                        shared.notify(ControlEvent::FormatMismatch { old, new: new.clone() });
                        new
                    }
                    Err(e) => {
                        shared.notify(ControlEvent::EngineError(e));
                        return;
                    }
                }
            }
            None => match self.configure_output(&native) {
                Ok(format) => format,
                Err(e) => {
                    shared.notify(ControlEvent::EngineError(e));
                    return;
                }
            },
        };

        // The worker owns the writer side, so the ring is (re)shaped here,
        // never by the facade. Only when nothing is buffered: a pending
        // capacity change waits for the next format change or first decoder
        let wanted_capacity = shared.pending.lock().unwrap().ring_capacity_frames;
        if shared.table.active_count() == 0
            && (shared.ring.bytes_per_frame() != out_format.bytes_per_frame()
                || shared.ring.capacity_frames() != wanted_capacity)
        {
            let state = &shared.state;
            if !state.output_muted.load(Ordering::Acquire) {
                state.begin_mute(self.sink_running(), shared.config.mute_timeout());
            }
            shared
                .ring
                .reconfigure(wanted_capacity, out_format.bytes_per_frame());
            state.end_mute();
            debug!(
                "ring buffer allocated: {} frames x {} bytes",
                wanted_capacity,
                out_format.bytes_per_frame()
            );
        }

        let converter = match Converter::new(&native, &out_format, shared.config.write_chunk_frames) {
            Ok(converter) => converter,
            Err(e) => {
                warn!("converter init failed for {}: {}", native, e);
                shared.notify(ControlEvent::EngineError(e));
                return;
            }
        };

        let sequence = shared.state.next_sequence();
        let mut slot = Box::new(DecoderSlot::new(sequence, decoder, converter));
        shared.notify(ControlEvent::TrackInstalled(slot.track_info()));

        loop {
            match shared.table.install(slot) {
                Ok(()) => break,
                Err(rejected) => {
                    slot = rejected;
                    if shared.state.shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    debug!("active table full; waiting for the collector");
                    shared.collector_sem.signal();
                    shared
                        .worker_sem
                        .wait_timeout(shared.config.worker_poll_timeout());
                }
            }
        }

        info!("track {} installed ({})", sequence, native);
        self.out_format = Some(out_format);
    }

    /// Format-change protocol, phase one: wait until the render callback
    /// reports every previously decoded frame rendered and no slot active.
    fn await_drain(&self) {
        let shared = Arc::clone(&self.shared);
        let state = &shared.state;

        state.format_mismatch.store(true, Ordering::Release);
        debug!("format change: draining prior audio");

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if !state.format_mismatch.load(Ordering::Acquire) {
                break;
            }
            // With the output paused the render callback cannot report the
            // drain; check directly
            let drained = !shared.table.has_renderable()
                && state.frames_converted.load(Ordering::Acquire)
                    == state.frames_rendered.load(Ordering::Acquire);
            if drained || state.shutdown.load(Ordering::Acquire) {
                state.format_mismatch.store(false, Ordering::Release);
                break;
            }
            if Instant::now() >= deadline {
                warn!("format-change drain timed out");
                state.format_mismatch.store(false, Ordering::Release);
                break;
            }
            shared.worker_sem.wait_timeout(Duration::from_millis(50));
        }
    }

    /// Format-change protocol, phase two: reconfigure the output and
    /// reallocate the ring buffer under the pending-queue mutex with the
    /// output muted.
    fn configure_output(&self, native: &AudioFormat) -> crate::error::Result<AudioFormat> {
        let shared = Arc::clone(&self.shared);
        let state = &shared.state;
        let mut pending = shared.pending.lock().unwrap();

        if !state.output_muted.load(Ordering::Acquire) {
            state.begin_mute(self.sink_running(), shared.config.mute_timeout());
        }

        let result = self.sink.lock().unwrap().setup_for(native);
        let out = match result {
            Ok(format) => {
                shared
                    .ring
                    .reconfigure(pending.ring_capacity_frames, format.bytes_per_frame());
                state
                    .silence_byte
                    .store(format.silence_byte(), Ordering::Release);
                pending.rendering_format = Some(format.clone());
                debug!("output configured: {}", format);
                Ok(format)
            }
            Err(e) => Err(e),
        };

        state.end_mute();
        out
    }
}

/// Encode interleaved f32 samples into the rendering format's byte layout.
fn encode_samples(samples: &[f32], format: &AudioFormat, out: &mut Vec<u8>) {
    out.clear();
    match format.encoding {
        SampleEncoding::PcmF32 => {
            out.reserve(samples.len() * 4);
            for &s in samples {
                out.extend_from_slice(&s.to_le_bytes());
            }
        }
        SampleEncoding::PcmS16 => {
            out.reserve(samples.len() * 2);
            for &s in samples {
                let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
                out.extend_from_slice(&v.to_le_bytes());
            }
        }
        SampleEncoding::Dsd => unreachable!("DSD bypasses sample encoding"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_f32_le() {
        let mut out = Vec::new();
        encode_samples(&[0.0, 1.0], &AudioFormat::pcm_f32(48_000, 2), &mut out);
        assert_eq!(out.len(), 8);
        assert_eq!(&out[0..4], &0.0f32.to_le_bytes());
        assert_eq!(&out[4..8], &1.0f32.to_le_bytes());
    }

    #[test]
    fn test_encode_s16_clamps() {
        let mut format = AudioFormat::pcm_f32(48_000, 1);
        format.encoding = SampleEncoding::PcmS16;

        let mut out = Vec::new();
        encode_samples(&[2.0, -2.0, 0.0], &format, &mut out);
        assert_eq!(out.len(), 6);
        assert_eq!(i16::from_le_bytes(out[0..2].try_into().unwrap()), i16::MAX);
        assert_eq!(i16::from_le_bytes(out[2..4].try_into().unwrap()), -i16::MAX);
        assert_eq!(i16::from_le_bytes(out[4..6].try_into().unwrap()), 0);
    }
}
