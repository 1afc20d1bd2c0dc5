//! Host-facing events and callbacks
//!
//! The engine communicates with its host through optional callbacks, all
//! invoked on the notifier thread (never the real-time thread), except the
//! pre/post render hooks which run on the render thread and must therefore
//! be real-time safe.
//!
//! Callbacks are plain values owned by the player; their lifetime is bounded
//! by the player's own lifetime.

use crate::audio::types::AudioFormat;
use crate::error::Error;
use std::sync::Arc;

/// Identifying snapshot of an enqueued track, passed to host callbacks.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Enqueue-order sequence number, unique for the life of the player
    pub sequence: u64,

    /// Source identifier reported by the decoder, if any
    pub url: Option<String>,

    /// The decoder's native format
    pub format: AudioFormat,

    /// Total frames at the output rate; -1 while unknown
    pub frame_length: i64,
}

/// Hook invoked on the render thread around buffer fills. Must not block,
/// allocate, or take locks.
pub type RenderHook = Arc<dyn Fn(&mut [u8], usize) + Send + Sync>;

type TrackFn = Box<dyn Fn(&TrackInfo) + Send + Sync>;
type TimedTrackFn = Box<dyn Fn(&TrackInfo, u64) + Send + Sync>;

/// The optional host callback set.
///
/// Built with the fluent `on_*` methods and handed to the player at
/// construction:
///
/// ```ignore
/// let callbacks = PlayerCallbacks::new()
///     .on_rendering_started(|track, _t| println!("now playing {:?}", track.url))
///     .on_out_of_audio(|_t| println!("queue ran dry"));
/// ```
#[derive(Default)]
pub struct PlayerCallbacks {
    pub(crate) decoding_started: Option<TrackFn>,
    pub(crate) decoding_finished: Option<TrackFn>,
    pub(crate) decoding_cancelled: Option<TrackFn>,
    pub(crate) rendering_started: Option<TimedTrackFn>,
    pub(crate) rendering_complete: Option<TimedTrackFn>,
    pub(crate) out_of_audio: Option<Box<dyn Fn(u64) + Send + Sync>>,
    pub(crate) format_mismatch: Option<Box<dyn Fn(&AudioFormat, &AudioFormat) + Send + Sync>>,
    pub(crate) error: Option<Box<dyn Fn(&Error) + Send + Sync>>,
    pub(crate) pre_render: Option<RenderHook>,
    pub(crate) post_render: Option<RenderHook>,
}

impl PlayerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The decoder produced its first frames.
    pub fn on_decoding_started(mut self, f: impl Fn(&TrackInfo) + Send + Sync + 'static) -> Self {
        self.decoding_started = Some(Box::new(f));
        self
    }

    /// The decoder reached end of stream.
    pub fn on_decoding_finished(mut self, f: impl Fn(&TrackInfo) + Send + Sync + 'static) -> Self {
        self.decoding_finished = Some(Box::new(f));
        self
    }

    /// Decoding was cancelled before end of stream.
    pub fn on_decoding_cancelled(mut self, f: impl Fn(&TrackInfo) + Send + Sync + 'static) -> Self {
        self.decoding_cancelled = Some(Box::new(f));
        self
    }

    /// The track's first frame reached the output. The second argument is the
    /// host time of the render pass that consumed it.
    pub fn on_rendering_started(
        mut self,
        f: impl Fn(&TrackInfo, u64) + Send + Sync + 'static,
    ) -> Self {
        self.rendering_started = Some(Box::new(f));
        self
    }

    /// The track's last frame reached the output.
    pub fn on_rendering_complete(
        mut self,
        f: impl Fn(&TrackInfo, u64) + Send + Sync + 'static,
    ) -> Self {
        self.rendering_complete = Some(Box::new(f));
        self
    }

    /// The last enqueued track finished rendering and nothing is queued.
    pub fn on_out_of_audio(mut self, f: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.out_of_audio = Some(Box::new(f));
        self
    }

    /// The next track's format required reconfiguring the output
    /// (old format, new format).
    pub fn on_format_mismatch(
        mut self,
        f: impl Fn(&AudioFormat, &AudioFormat) + Send + Sync + 'static,
    ) -> Self {
        self.format_mismatch = Some(Box::new(f));
        self
    }

    /// A recoverable engine error occurred.
    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    /// Real-time hook invoked before each rendered buffer. Must be wait-free.
    pub fn on_pre_render(mut self, f: impl Fn(&mut [u8], usize) + Send + Sync + 'static) -> Self {
        self.pre_render = Some(Arc::new(f));
        self
    }

    /// Real-time hook invoked after each rendered buffer. Must be wait-free.
    pub fn on_post_render(mut self, f: impl Fn(&mut [u8], usize) + Send + Sync + 'static) -> Self {
        self.post_render = Some(Arc::new(f));
        self
    }
}

/// Events sent from the worker and facade to the notifier over a regular
/// channel (the real-time path uses the render-event ring instead).
#[derive(Debug)]
pub(crate) enum ControlEvent {
    /// A slot was installed; registers the track info the notifier uses to
    /// resolve sequence numbers from render events.
    TrackInstalled(TrackInfo),
    DecodingStarted(u64),
    DecodingFinished(u64),
    /// Terminal cancellation, emitted exactly once by whichever thread won
    /// the slot's cancellation transition (worker, skip, or stop).
    TrackCancelled {
        sequence: u64,
        /// Decoding was interrupted before its natural end
        decoding_cancelled: bool,
        /// Rendering had started; its completion is delivered here because
        /// the render thread is muted (or stopped) at this point
        rendering_complete: bool,
    },
    /// Rendering finished off the render path (ring drained at end of
    /// stream, zero-length track).
    RenderingComplete(u64),
    FormatMismatch { old: AudioFormat, new: AudioFormat },
    EngineError(Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_callbacks_builder() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);

        let callbacks = PlayerCallbacks::new()
            .on_out_of_audio(move |_| {
                h.fetch_add(1, Ordering::Relaxed);
            })
            .on_error(|_| {});

        assert!(callbacks.out_of_audio.is_some());
        assert!(callbacks.error.is_some());
        assert!(callbacks.decoding_started.is_none());

        (callbacks.out_of_audio.as_ref().unwrap())(0);
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }
}
