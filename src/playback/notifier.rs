//! Notifier thread
//!
//! Drains the render-event channel and the control channel and delivers the
//! host callbacks on a normal-priority thread, keeping every host call off
//! the real-time path. Rendering started/complete callbacks may be delayed
//! by the configured presentation latency so the application observes them
//! aligned with speaker-out. Events without a registered callback are
//! discarded.

use crate::events::{ControlEvent, PlayerCallbacks, TrackInfo};
use crate::playback::engine::Shared;
use crate::playback::event_channel::{RenderEvent, RenderEventReader};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) fn spawn(
    shared: Arc<Shared>,
    rt_events: RenderEventReader,
    control_rx: Receiver<ControlEvent>,
    callbacks: Arc<PlayerCallbacks>,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("gapless-notifier".into())
        .spawn(move || {
            let mut notifier = Notifier {
                shared,
                rt_events,
                control_rx,
                callbacks,
                tracks: HashMap::new(),
            };
            notifier.run();
        })
}

struct Notifier {
    shared: Arc<Shared>,
    rt_events: RenderEventReader,
    control_rx: Receiver<ControlEvent>,
    callbacks: Arc<PlayerCallbacks>,

    /// Track info by sequence number, registered at slot installation so
    /// render events can be resolved without touching the slot table
    tracks: HashMap<u64, TrackInfo>,
}

impl Notifier {
    fn run(&mut self) {
        debug!("notifier started");

        loop {
            let mut delivered = false;

            // Control events first: a render event is always causally
            // preceded by its control-side counterpart (audio is written
            // after decoding-started is sent, the slot completes after
            // decoding-finished is sent), so this drain order preserves
            // per-track callback order
            while let Ok(event) = self.control_rx.try_recv() {
                delivered = true;
                self.handle_control_event(event);
            }
            while let Some(event) = self.rt_events.pop() {
                delivered = true;
                self.handle_render_event(event);
            }

            if self.shared.state.shutdown.load(Ordering::Acquire) {
                // Final drain so late completion events still reach the host
                while let Ok(event) = self.control_rx.try_recv() {
                    self.handle_control_event(event);
                }
                while let Some(event) = self.rt_events.pop() {
                    self.handle_render_event(event);
                }
                break;
            }

            if !delivered {
                self.shared
                    .notifier_sem
                    .wait_timeout(Duration::from_millis(100));
            }
        }

        debug!("notifier stopped");
    }

    /// Hold rendering notifications back by the configured presentation
    /// latency so they land when the audio is audible.
    fn presentation_delay(&self) {
        let latency = self.shared.config.presentation_latency();
        if !latency.is_zero() {
            std::thread::sleep(latency);
        }
    }

    fn handle_render_event(&mut self, event: RenderEvent) {
        match event {
            RenderEvent::RenderingStarted { sequence, host_time } => {
                debug!("track {} rendering started", sequence);
                if let (Some(cb), Some(info)) =
                    (&self.callbacks.rendering_started, self.tracks.get(&sequence))
                {
                    self.presentation_delay();
                    cb(info, host_time);
                }
            }
            RenderEvent::RenderingComplete { sequence, host_time } => {
                debug!("track {} rendering complete", sequence);
                if let (Some(cb), Some(info)) =
                    (&self.callbacks.rendering_complete, self.tracks.get(&sequence))
                {
                    self.presentation_delay();
                    cb(info, host_time);
                }
                self.tracks.remove(&sequence);
            }
            RenderEvent::OutOfAudio { host_time } => {
                debug!("out of audio");
                if let Some(cb) = &self.callbacks.out_of_audio {
                    cb(host_time);
                }
            }
        }
    }

    fn handle_control_event(&mut self, event: ControlEvent) {
        match event {
            ControlEvent::TrackInstalled(info) => {
                self.tracks.insert(info.sequence, info);
            }
            ControlEvent::DecodingStarted(sequence) => {
                if let (Some(cb), Some(info)) =
                    (&self.callbacks.decoding_started, self.tracks.get(&sequence))
                {
                    cb(info);
                }
            }
            ControlEvent::DecodingFinished(sequence) => {
                if let (Some(cb), Some(info)) =
                    (&self.callbacks.decoding_finished, self.tracks.get(&sequence))
                {
                    cb(info);
                }
            }
            ControlEvent::TrackCancelled {
                sequence,
                decoding_cancelled,
                rendering_complete,
            } => {
                if decoding_cancelled {
                    if let (Some(cb), Some(info)) =
                        (&self.callbacks.decoding_cancelled, self.tracks.get(&sequence))
                    {
                        cb(info);
                    }
                }
                if rendering_complete {
                    // Forced completion off the render path; host time zero
                    // marks it as not derived from the output clock
                    if let (Some(cb), Some(info)) =
                        (&self.callbacks.rendering_complete, self.tracks.get(&sequence))
                    {
                        cb(info, 0);
                    }
                }
                self.tracks.remove(&sequence);
            }
            ControlEvent::RenderingComplete(sequence) => {
                // Completion decided off the render path (ring drained at
                // end of stream, zero-length track); host time zero marks
                // it as not derived from the output clock
                if let (Some(cb), Some(info)) =
                    (&self.callbacks.rendering_complete, self.tracks.get(&sequence))
                {
                    cb(info, 0);
                }
                self.tracks.remove(&sequence);
            }
            ControlEvent::FormatMismatch { old, new } => {
                if let Some(cb) = &self.callbacks.format_mismatch {
                    cb(&old, &new);
                }
            }
            ControlEvent::EngineError(error) => {
                warn!("engine error: {}", error);
                if let Some(cb) = &self.callbacks.error {
                    cb(&error);
                }
            }
        }
    }
}
