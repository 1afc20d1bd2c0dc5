//! Player facade
//!
//! Owns the output sink, the shared concurrency state, and the three engine
//! threads (decoder worker, notifier, collector), and exposes the playback
//! operations to the host: play, enqueue, pause, resume, stop, skip, seek,
//! queue management and position queries.
//!
//! Control operations communicate with the worker through atomic requests
//! (cancel flags, seek targets, ring-reset requests) and the mute protocol;
//! none of them ever touches the ring buffer or a slot's decoder while the
//! render callback or worker could be mid-operation on it.

use crate::audio::decoder::Decoder;
use crate::audio::output::OutputSink;
use crate::audio::types::AudioFormat;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{ControlEvent, PlayerCallbacks, TrackInfo};
use crate::playback::collector;
use crate::playback::event_channel::render_event_channel;
use crate::playback::notifier;
use crate::playback::render::Renderer;
use crate::playback::ring_buffer::FrameRing;
use crate::playback::slot::flag;
use crate::playback::state::EngineState;
use crate::playback::sync::Semaphore;
use crate::playback::table::ActiveSlotTable;
use crate::playback::worker;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Pending decoders and the output configuration they bind to. The mutex is
/// held only for O(1) queue operations and (briefly, with the output muted)
/// for output reconfiguration; never on the render path, never across I/O.
pub(crate) struct Pending {
    pub queue: VecDeque<Box<dyn Decoder>>,
    pub rendering_format: Option<AudioFormat>,
    pub ring_capacity_frames: usize,
}

/// State shared by the facade, worker, render callback, notifier and
/// collector.
pub(crate) struct Shared {
    pub config: EngineConfig,
    pub state: EngineState,
    pub ring: FrameRing,
    pub table: ActiveSlotTable,
    pub pending: Mutex<Pending>,
    pub worker_sem: Semaphore,
    pub collector_sem: Semaphore,
    pub notifier_sem: Semaphore,
    pub control_tx: Sender<ControlEvent>,
}

impl Shared {
    /// Queue a control event for the notifier and wake it.
    pub(crate) fn notify(&self, event: ControlEvent) {
        if self.control_tx.send(event).is_ok() {
            self.notifier_sem.signal();
        }
    }

    /// Deliver the terminal notifications for a cancelled slot.
    ///
    /// `prior` is the flag word returned by `DecoderSlot::finish_cancelled`;
    /// the `fetch_or` there admits exactly one winner, so callers on every
    /// path (worker, skip, stop) route through here and the host receives
    /// decoding-cancelled and rendering-complete exactly once between them.
    pub(crate) fn notify_cancellation(&self, sequence: u64, prior: u32) {
        if prior & flag::MARKED_FOR_REMOVAL != 0 {
            // Another thread won the transition and has already notified
            return;
        }
        let decoding_cancelled = prior & flag::DECODING_FINISHED == 0;
        let rendering_complete = prior & flag::RENDERING_STARTED != 0
            && prior & flag::RENDERING_FINISHED == 0;
        if decoding_cancelled || rendering_complete {
            self.notify(ControlEvent::TrackCancelled {
                sequence,
                decoding_cancelled,
                rendering_complete,
            });
        }
        self.collector_sem.signal();
    }
}

/// Snapshot of ring buffer and event-channel health.
#[derive(Debug, Clone, Copy)]
pub struct RingStats {
    pub capacity_frames: usize,
    pub frames_buffered: usize,
    pub events_dropped: u64,
}

/// The gapless playback engine.
///
/// Dropping the player stops the output, shuts the engine threads down and
/// releases every slot.
pub struct Player {
    shared: Arc<Shared>,
    sink: Arc<Mutex<Box<dyn OutputSink>>>,
    worker: Option<JoinHandle<()>>,
    notifier: Option<JoinHandle<()>>,
    collector: Option<JoinHandle<()>>,
}

impl Player {
    /// Build a player around an output sink.
    ///
    /// Fails on invalid configuration, a sink that cannot open, or a thread
    /// that cannot spawn; on failure nothing is left running.
    pub fn new(
        mut sink: Box<dyn OutputSink>,
        config: EngineConfig,
        callbacks: PlayerCallbacks,
    ) -> Result<Self> {
        config.validate()?;

        let (control_tx, control_rx) = channel();
        let ring_capacity = config.ring_capacity_frames;
        let table_size = config.slot_table_size;
        let event_bytes = config.event_channel_bytes;

        let shared = Arc::new(Shared {
            config,
            state: EngineState::new(),
            // Placeholder geometry until the first decoder establishes the
            // rendering format (f32 stereo frame size)
            ring: FrameRing::new(ring_capacity, 8),
            table: ActiveSlotTable::new(table_size),
            pending: Mutex::new(Pending {
                queue: VecDeque::new(),
                rendering_format: None,
                ring_capacity_frames: ring_capacity,
            }),
            worker_sem: Semaphore::new(),
            collector_sem: Semaphore::new(),
            notifier_sem: Semaphore::new(),
            control_tx,
        });

        let callbacks = Arc::new(callbacks);
        let (event_writer, event_reader) = render_event_channel(event_bytes);

        sink.open()?;
        let mut renderer = Renderer::new(
            Arc::clone(&shared),
            event_writer,
            callbacks.pre_render.clone(),
            callbacks.post_render.clone(),
        );
        sink.set_render_fn(Box::new(move |buf, frames, host_time| {
            renderer.render(buf, frames, host_time)
        }));
        let sink: Arc<Mutex<Box<dyn OutputSink>>> = Arc::new(Mutex::new(sink));

        let worker = match worker::spawn(Arc::clone(&shared), Arc::clone(&sink)) {
            Ok(handle) => handle,
            Err(e) => {
                Self::halt(&shared, &sink, Vec::new());
                return Err(e.into());
            }
        };
        let notifier = match notifier::spawn(
            Arc::clone(&shared),
            event_reader,
            control_rx,
            Arc::clone(&callbacks),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                Self::halt(&shared, &sink, vec![worker]);
                return Err(e.into());
            }
        };
        let collector = match collector::spawn(Arc::clone(&shared)) {
            Ok(handle) => handle,
            Err(e) => {
                Self::halt(&shared, &sink, vec![worker, notifier]);
                return Err(e.into());
            }
        };

        info!("player ready (table size {}, ring {} frames)", table_size, ring_capacity);
        Ok(Player {
            shared,
            sink,
            worker: Some(worker),
            notifier: Some(notifier),
            collector: Some(collector),
        })
    }

    fn halt(shared: &Arc<Shared>, sink: &Arc<Mutex<Box<dyn OutputSink>>>, handles: Vec<JoinHandle<()>>) {
        let _ = sink.lock().unwrap().stop();
        shared.state.shutdown.store(true, Ordering::Release);
        shared.worker_sem.signal();
        shared.notifier_sem.signal();
        shared.collector_sem.signal();
        for handle in handles {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Stop current playback, clear the queue, enqueue `decoder`, and start
    /// the output. Returns once the decoder is queued, not once audible.
    pub fn play(&self, decoder: Box<dyn Decoder>) -> Result<()> {
        self.stop()?;
        self.enqueue(decoder)?;
        self.shared
            .state
            .start_on_first_audio
            .store(true, Ordering::Release);

        let start = self.sink.lock().unwrap().start();
        if let Err(e) = start {
            let _ = self.stop();
            return Err(e);
        }
        self.shared.worker_sem.signal();
        Ok(())
    }

    /// Append a decoder to the pending queue.
    ///
    /// The first decoder (empty table and queue) also configures the output
    /// and allocates the ring buffer for its format; the mutex covers the
    /// empty-check and the push so two concurrent enqueues cannot both
    /// believe they are first.
    pub fn enqueue(&self, mut decoder: Box<dyn Decoder>) -> Result<()> {
        let shared = &self.shared;
        let mut pending = shared.pending.lock().unwrap();

        // The ring buffer itself is reconfigured by the worker (the sole
        // writer) when it installs this decoder; only the output and the
        // recorded rendering format are set up here
        let first = pending.queue.is_empty()
            && shared.table.active_count() == 0
            && !shared.state.installing.load(Ordering::Acquire);
        if first {
            if !decoder.is_open() {
                decoder.open()?;
            }
            let native = decoder.format();

            let mut sink = self.sink.lock().unwrap();
            shared
                .state
                .begin_mute(sink.is_running(), shared.config.mute_timeout());
            let setup = sink.setup_for(&native);
            drop(sink);

            match setup {
                Ok(format) => {
                    shared
                        .state
                        .silence_byte
                        .store(format.silence_byte(), Ordering::Release);
                    debug!("first decoder configured output: {}", format);
                    pending.rendering_format = Some(format);
                    shared.state.end_mute();
                }
                Err(e) => {
                    shared.state.end_mute();
                    return Err(e);
                }
            }
        }

        pending.queue.push_back(decoder);
        drop(pending);
        shared.worker_sem.signal();
        Ok(())
    }

    /// Stop driving the render callback. The worker keeps decoding until the
    /// ring buffer fills. Idempotent.
    pub fn pause(&self) -> Result<()> {
        self.sink.lock().unwrap().stop()
    }

    /// Resume driving the render callback. Idempotent.
    pub fn resume(&self) -> Result<()> {
        self.sink.lock().unwrap().start()
    }

    /// Stop the output, cancel every active decoder, clear the queue and
    /// reset the session counters. Idempotent.
    pub fn stop(&self) -> Result<()> {
        let shared = &self.shared;
        self.sink.lock().unwrap().stop()?;

        shared.state.playing.store(false, Ordering::Release);
        shared
            .state
            .start_on_first_audio
            .store(false, Ordering::Release);
        shared.pending.lock().unwrap().queue.clear();

        shared.table.for_each(|slot| {
            if slot.has_flags(flag::RENDERING_FINISHED) {
                return;
            }
            slot.request_cancel();
            if slot.has_flags(flag::DECODING_FINISHED) {
                // Already drained of decode work; the worker will not
                // revisit it, so finish it here
                let prior = slot.finish_cancelled();
                shared.notify_cancellation(slot.sequence, prior);
            }
        });

        shared.state.reset_counters();
        shared.state.ring_needs_reset.store(true, Ordering::Release);
        shared.worker_sem.signal();
        shared.collector_sem.signal();
        Ok(())
    }

    /// Cancel the front track and advance to the next enqueued one.
    ///
    /// Waits (bounded) for the worker to acknowledge the cancellation, then
    /// hands the held mute to the worker, which purges the ring buffer and
    /// unmutes.
    pub fn skip_to_next(&self) -> Result<()> {
        let shared = &self.shared;
        let state = &shared.state;

        let front = shared.table.front_renderable().ok_or(Error::NoCurrentTrack)?;
        let sequence = front.sequence;
        debug!("skipping track {}", sequence);

        let sink_running = self.sink.lock().unwrap().is_running();
        state.begin_mute(sink_running, shared.config.mute_timeout());

        front.request_cancel();
        shared.worker_sem.signal();

        let deadline = Instant::now() + shared.config.skip_cancel_timeout();
        while !front.has_flags(flag::DECODING_FINISHED) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }

        // Usually the worker has already won this transition and notified;
        // this call only claims it when the wait above timed out (or the
        // front had finished decoding and the worker will never revisit it)
        let prior = front.finish_cancelled();
        shared.notify_cancellation(sequence, prior);

        // The worker performs the purge (it owns the writer side) and ends
        // the mute when done
        state.ring_needs_reset.store(true, Ordering::Release);
        shared.worker_sem.signal();

        let deadline = Instant::now() + Duration::from_millis(500);
        while state.ring_needs_reset.load(Ordering::Acquire) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        if state.ring_needs_reset.load(Ordering::Acquire) && state.output_muted.load(Ordering::Acquire)
        {
            // Worker never picked the purge up; do not leave the output muted
            state.end_mute();
        }
        Ok(())
    }

    /// Seek the front track to `frame` (rendering-format frames).
    ///
    /// Rejected when the decoder cannot seek or the target is out of range;
    /// otherwise stored for the worker to apply at the next boundary.
    pub fn seek_to_frame(&self, frame: i64) -> Result<()> {
        let shared = &self.shared;
        let front = shared.table.front_renderable().ok_or(Error::NoCurrentTrack)?;

        if !front.seekable() {
            return Err(Error::SeekUnsupported);
        }
        let length = front.frame_length();
        if frame < 0 || (length >= 0 && frame >= length) {
            return Err(Error::SeekOutOfRange { frame, length });
        }

        front.request_seek(frame);
        if !self.sink.lock().unwrap().is_running() {
            shared.state.ring_needs_reset.store(true, Ordering::Release);
        }
        shared.worker_sem.signal();
        Ok(())
    }

    /// Seek the front track to a position in seconds.
    pub fn seek_to_time(&self, seconds: f64) -> Result<()> {
        let rate = self
            .shared
            .pending
            .lock()
            .unwrap()
            .rendering_format
            .as_ref()
            .map(|f| f.sample_rate)
            .ok_or(Error::NoCurrentTrack)?;
        self.seek_to_frame((seconds * rate as f64).round() as i64)
    }

    /// Drop all pending decoders. The currently rendering track is
    /// unaffected.
    pub fn clear_queue(&self) {
        self.shared.pending.lock().unwrap().queue.clear();
    }

    /// Change the ring buffer capacity; takes effect on the next
    /// reallocation (format change or first decoder).
    pub fn set_ring_capacity(&self, frames: usize) -> Result<()> {
        if frames < self.shared.config.write_chunk_frames {
            return Err(Error::Config(format!(
                "ring capacity {} is below the write chunk size {}",
                frames, self.shared.config.write_chunk_frames
            )));
        }
        self.shared.pending.lock().unwrap().ring_capacity_frames = frames;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn is_playing(&self) -> bool {
        self.shared.state.playing.load(Ordering::Acquire)
            && self.sink.lock().unwrap().is_running()
    }

    /// Rendered position of the front track, in rendering-format frames.
    pub fn position_frames(&self) -> Option<u64> {
        self.shared
            .table
            .front_renderable()
            .map(|slot| slot.frames_rendered.load(Ordering::Acquire))
    }

    pub fn current_track(&self) -> Option<TrackInfo> {
        self.shared
            .table
            .front_renderable()
            .map(|slot| slot.track_info())
    }

    /// Tracks installed in the active table (excluding those awaiting
    /// collection).
    pub fn active_track_count(&self) -> usize {
        self.shared.table.active_count()
    }

    pub fn pending_track_count(&self) -> usize {
        self.shared.pending.lock().unwrap().queue.len()
    }

    /// Session total frames delivered to the output (excludes silence).
    pub fn frames_rendered_total(&self) -> u64 {
        self.shared.state.frames_rendered.load(Ordering::Acquire)
    }

    pub fn rendering_format(&self) -> Option<AudioFormat> {
        self.shared.pending.lock().unwrap().rendering_format.clone()
    }

    pub fn ring_stats(&self) -> RingStats {
        RingStats {
            capacity_frames: self.shared.ring.capacity_frames(),
            frames_buffered: self.shared.ring.frames_readable(),
            events_dropped: self.shared.state.events_dropped.load(Ordering::Relaxed),
        }
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        debug!("shutting down player");

        // Stop the render callback before anything else so no render pass
        // can observe teardown
        {
            let mut sink = self.sink.lock().unwrap();
            let _ = sink.stop();
            sink.close();
        }

        self.shared.state.shutdown.store(true, Ordering::Release);
        self.shared.worker_sem.signal();
        self.shared.notifier_sem.signal();
        self.shared.collector_sem.signal();

        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.collector.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.notifier.take() {
            let _ = handle.join();
        }

        info!("player shut down");
    }
}
