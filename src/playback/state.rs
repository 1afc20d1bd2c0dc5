//! Shared engine state
//!
//! The atomic flags and global counters the worker, render callback, and
//! facade coordinate through, plus the mute handshake.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::warn;

/// Sentinel for "no track is currently at the front".
pub const NO_FRONT: u64 = u64::MAX;

/// Cross-thread engine state. All fields are atomics; the render callback
/// reads and writes them wait-free.
pub struct EngineState {
    /// Playback gate for the render callback; silence while false
    pub playing: AtomicBool,

    /// Set by a control thread asking the render callback to mute
    pub mute_requested: AtomicBool,

    /// While set, the render callback emits silence only
    pub output_muted: AtomicBool,

    /// Asks the worker to purge the ring buffer at its next boundary
    pub ring_needs_reset: AtomicBool,

    /// Set during the format-change protocol until all prior audio drained
    pub format_mismatch: AtomicBool,

    /// Playback begins when the ring first holds audio (set by `play`)
    pub start_on_first_audio: AtomicBool,

    /// Engine shutdown flag; threads exit when set
    pub shutdown: AtomicBool,

    /// Set while the worker is between dequeuing a decoder and installing
    /// its slot; closes the window where the table and queue both look
    /// empty to a concurrent enqueue
    pub installing: AtomicBool,

    /// Session total frames consumed by the render callback (output rate)
    pub frames_rendered: AtomicU64,

    /// Session total frames produced by the worker (output rate)
    pub frames_converted: AtomicU64,

    /// Silence byte of the current rendering format (0x00 PCM, 0x0F DSD)
    pub silence_byte: AtomicU8,

    /// Sequence number of the slot currently rendering, or [`NO_FRONT`]
    pub front_sequence: AtomicU64,

    /// Render events that did not fit the event channel
    pub events_dropped: AtomicU64,

    next_sequence: AtomicU64,
}

impl EngineState {
    pub fn new() -> Self {
        EngineState {
            playing: AtomicBool::new(false),
            mute_requested: AtomicBool::new(false),
            output_muted: AtomicBool::new(false),
            ring_needs_reset: AtomicBool::new(false),
            format_mismatch: AtomicBool::new(false),
            start_on_first_audio: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
            installing: AtomicBool::new(false),
            frames_rendered: AtomicU64::new(0),
            frames_converted: AtomicU64::new(0),
            silence_byte: AtomicU8::new(0),
            front_sequence: AtomicU64::new(NO_FRONT),
            events_dropped: AtomicU64::new(0),
            next_sequence: AtomicU64::new(0),
        }
    }

    /// Allocate the next track sequence number (monotonic, starts at 1).
    pub fn next_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Reset the session frame counters and front marker (stop path).
    pub fn reset_counters(&self) {
        self.frames_rendered.store(0, Ordering::Release);
        self.frames_converted.store(0, Ordering::Release);
        self.front_sequence.store(NO_FRONT, Ordering::Release);
    }

    /// Enter the mute protocol.
    ///
    /// With the output running, sets `mute_requested` and waits (1 ms steps,
    /// bounded by `timeout`) for the render callback to promote it to
    /// `output_muted`; otherwise mutes directly. On timeout the mute is
    /// forced: the render callback observes `output_muted` before touching
    /// the ring, so the non-thread-safe operation is still excluded.
    pub fn begin_mute(&self, output_running: bool, timeout: Duration) {
        if !output_running {
            self.mute_requested.store(false, Ordering::Release);
            self.output_muted.store(true, Ordering::Release);
            return;
        }

        self.mute_requested.store(true, Ordering::Release);
        let deadline = Instant::now() + timeout;
        while !self.output_muted.load(Ordering::Acquire) {
            if Instant::now() >= deadline {
                warn!("render callback did not acknowledge mute within {:?}", timeout);
                self.mute_requested.store(false, Ordering::Release);
                self.output_muted.store(true, Ordering::Release);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Leave the mute protocol.
    pub fn end_mute(&self) {
        self.mute_requested.store(false, Ordering::Release);
        self.output_muted.store(false, Ordering::Release);
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_numbers_are_monotonic() {
        let state = EngineState::new();
        let a = state.next_sequence();
        let b = state.next_sequence();
        let c = state.next_sequence();
        assert_eq!((a, b, c), (1, 2, 3));
    }

    #[test]
    fn test_mute_without_output_is_direct() {
        let state = EngineState::new();
        state.begin_mute(false, Duration::from_millis(100));
        assert!(state.output_muted.load(Ordering::Acquire));
        assert!(!state.mute_requested.load(Ordering::Acquire));

        state.end_mute();
        assert!(!state.output_muted.load(Ordering::Acquire));
    }

    #[test]
    fn test_mute_waits_for_promotion() {
        let state = std::sync::Arc::new(EngineState::new());

        // Stand-in for the render callback promoting the request
        let render_side = {
            let state = std::sync::Arc::clone(&state);
            std::thread::spawn(move || loop {
                if state.mute_requested.swap(false, Ordering::AcqRel) {
                    state.output_muted.store(true, Ordering::Release);
                    break;
                }
                std::thread::sleep(Duration::from_micros(100));
            })
        };

        state.begin_mute(true, Duration::from_secs(1));
        assert!(state.output_muted.load(Ordering::Acquire));
        render_side.join().unwrap();
    }

    #[test]
    fn test_mute_times_out_to_forced_mute() {
        let state = EngineState::new();
        // No render callback running to promote the request
        state.begin_mute(true, Duration::from_millis(10));
        assert!(state.output_muted.load(Ordering::Acquire));
    }

    #[test]
    fn test_reset_counters() {
        let state = EngineState::new();
        state.frames_rendered.store(5, Ordering::Release);
        state.frames_converted.store(9, Ordering::Release);
        state.front_sequence.store(3, Ordering::Release);

        state.reset_counters();
        assert_eq!(state.frames_rendered.load(Ordering::Acquire), 0);
        assert_eq!(state.frames_converted.load(Ordering::Acquire), 0);
        assert_eq!(state.front_sequence.load(Ordering::Acquire), NO_FRONT);
    }
}
