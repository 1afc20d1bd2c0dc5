//! Real-time render path
//!
//! The output sink invokes [`Renderer::render`] on its real-time thread with
//! a buffer to fill and a deadline. The entire path is wait-free: it reads
//! the ring buffer, attributes consumed frames to active slots in sequence
//! order, emits fixed-size event records, and signals semaphores. It never
//! takes a mutex, never allocates, never calls into a decoder, and never
//! invokes host callbacks directly (the pre/post render hooks excepted,
//! which the host promises are real-time safe).

use crate::audio::output::RenderStatus;
use crate::events::RenderHook;
use crate::playback::engine::Shared;
use crate::playback::event_channel::{RenderEvent, RenderEventWriter};
use crate::playback::slot::flag;
use crate::playback::state::NO_FRONT;
use std::sync::atomic::Ordering;
use std::sync::Arc;

pub(crate) struct Renderer {
    shared: Arc<Shared>,
    events: RenderEventWriter,
    pre_render: Option<RenderHook>,
    post_render: Option<RenderHook>,
}

impl Renderer {
    pub(crate) fn new(
        shared: Arc<Shared>,
        events: RenderEventWriter,
        pre_render: Option<RenderHook>,
        post_render: Option<RenderHook>,
    ) -> Self {
        Renderer {
            shared,
            events,
            pre_render,
            post_render,
        }
    }

    /// Fill `buf` with `frame_count` frames of the rendering format.
    pub(crate) fn render(&mut self, buf: &mut [u8], frame_count: usize, host_time: u64) -> RenderStatus {
        let shared = Arc::clone(&self.shared);
        let state = &shared.state;

        // Promote a pending mute request and wake the worker, which may be
        // polling for the acknowledgement
        if state.mute_requested.swap(false, Ordering::AcqRel) {
            state.output_muted.store(true, Ordering::Release);
            shared.worker_sem.signal();
        }

        // Playback begins once the first audio lands in the ring
        if state.start_on_first_audio.load(Ordering::Acquire) && shared.ring.frames_readable() > 0 {
            state.start_on_first_audio.store(false, Ordering::Release);
            state.playing.store(true, Ordering::Release);
        }

        // Format-change handshake: report when every previously decoded
        // frame has been rendered and no slot remains
        if state.format_mismatch.load(Ordering::Acquire)
            && !shared.table.has_renderable()
            && state.frames_converted.load(Ordering::Acquire)
                == state.frames_rendered.load(Ordering::Acquire)
        {
            state.format_mismatch.store(false, Ordering::Release);
            shared.worker_sem.signal();
        }

        // Silence fast path
        let silence = state.silence_byte.load(Ordering::Relaxed);
        if !state.playing.load(Ordering::Acquire)
            || state.output_muted.load(Ordering::Acquire)
            || shared.ring.frames_readable() == 0
        {
            buf.fill(silence);
            return RenderStatus::Silence;
        }

        if let Some(hook) = &self.pre_render {
            hook(buf, frame_count);
        }

        // Read what the ring holds; the tail stays silence on a short read
        let bytes_per_frame = shared.ring.bytes_per_frame();
        let frames_read = shared.ring.read(buf);
        if frames_read < frame_count {
            buf[frames_read * bytes_per_frame..].fill(silence);
        }
        state
            .frames_rendered
            .fetch_add(frames_read as u64, Ordering::AcqRel);

        // Wake the worker when a full chunk of space is free
        if shared.ring.frames_writable() >= shared.config.write_chunk_frames {
            shared.worker_sem.signal();
        }

        // Attribute the consumed frames across slots in sequence order
        let mut remaining = frames_read as u64;
        let mut cursor: Option<u64> = None;
        while remaining > 0 {
            let slot = match shared.table.renderable_after(cursor) {
                Some(slot) => slot,
                None => break,
            };

            if !slot.has_flags(flag::RENDERING_STARTED) {
                slot.set_flags(flag::RENDERING_STARTED);
                state.front_sequence.store(slot.sequence, Ordering::Release);
                self.push_event(RenderEvent::RenderingStarted {
                    sequence: slot.sequence,
                    host_time,
                });
                shared.notifier_sem.signal();
            }

            let pending = slot.frames_pending_render();
            let take = pending.min(remaining);
            if take > 0 {
                slot.frames_rendered.fetch_add(take, Ordering::AcqRel);
                remaining -= take;
            }

            let completed = slot.has_flags(flag::DECODING_FINISHED)
                && slot.frames_rendered.load(Ordering::Acquire)
                    == slot.frames_converted.load(Ordering::Acquire);
            if completed {
                let prior =
                    slot.set_flags_returning(flag::RENDERING_FINISHED | flag::MARKED_FOR_REMOVAL);
                if prior & flag::RENDERING_FINISHED == 0 {
                    self.push_event(RenderEvent::RenderingComplete {
                        sequence: slot.sequence,
                        host_time,
                    });
                    shared.collector_sem.signal();
                    shared.notifier_sem.signal();
                }
            } else if take == 0 {
                // Front slot has no frames ready and is not finished;
                // nothing further can be attributed this pass
                break;
            }

            cursor = Some(slot.sequence);
        }

        // Track the front slot; report the queue running dry
        match shared.table.front_renderable() {
            Some(front) => state.front_sequence.store(front.sequence, Ordering::Release),
            None => {
                state.front_sequence.store(NO_FRONT, Ordering::Release);
                if frames_read > 0 {
                    self.push_event(RenderEvent::OutOfAudio { host_time });
                    shared.notifier_sem.signal();
                }
            }
        }

        if let Some(hook) = &self.post_render {
            hook(buf, frame_count);
        }

        RenderStatus::Rendered
    }

    fn push_event(&mut self, event: RenderEvent) {
        if !self.events.push(event) {
            self.shared
                .state
                .events_dropped
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}
