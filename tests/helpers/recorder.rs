//! Host-callback recorder
//!
//! Captures every callback the notifier delivers as a flat event list so
//! tests can assert ordering and counts.

use gapless_player::PlayerCallbacks;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub enum Ev {
    DecodingStarted(u64),
    DecodingFinished(u64),
    DecodingCancelled(u64),
    RenderingStarted(u64),
    RenderingComplete(u64),
    OutOfAudio,
    FormatMismatch(u32, u32),
    Error(String),
}

#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Ev>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a callback set that records every delivered event.
    pub fn callbacks(&self) -> PlayerCallbacks {
        let push = |events: &Arc<Mutex<Vec<Ev>>>, ev: Ev| {
            events.lock().unwrap().push(ev);
        };

        let e = Arc::clone(&self.events);
        let callbacks = PlayerCallbacks::new()
            .on_decoding_started(move |t| push(&e, Ev::DecodingStarted(t.sequence)));
        let e = Arc::clone(&self.events);
        let callbacks =
            callbacks.on_decoding_finished(move |t| push(&e, Ev::DecodingFinished(t.sequence)));
        let e = Arc::clone(&self.events);
        let callbacks =
            callbacks.on_decoding_cancelled(move |t| push(&e, Ev::DecodingCancelled(t.sequence)));
        let e = Arc::clone(&self.events);
        let callbacks =
            callbacks.on_rendering_started(move |t, _| push(&e, Ev::RenderingStarted(t.sequence)));
        let e = Arc::clone(&self.events);
        let callbacks = callbacks
            .on_rendering_complete(move |t, _| push(&e, Ev::RenderingComplete(t.sequence)));
        let e = Arc::clone(&self.events);
        let callbacks = callbacks.on_out_of_audio(move |_| push(&e, Ev::OutOfAudio));
        let e = Arc::clone(&self.events);
        let callbacks = callbacks.on_format_mismatch(move |old, new| {
            push(&e, Ev::FormatMismatch(old.sample_rate, new.sample_rate))
        });
        let e = Arc::clone(&self.events);
        callbacks.on_error(move |err| push(&e, Ev::Error(err.to_string())))
    }

    pub fn events(&self) -> Vec<Ev> {
        self.events.lock().unwrap().clone()
    }

    pub fn contains(&self, ev: &Ev) -> bool {
        self.events().contains(ev)
    }

    pub fn count(&self, ev: &Ev) -> usize {
        self.events().iter().filter(|&e| e == ev).count()
    }

    /// Index of the first occurrence, for ordering assertions.
    pub fn index_of(&self, ev: &Ev) -> Option<usize> {
        self.events().iter().position(|e| e == ev)
    }

    /// Wait until `ev` has been delivered.
    pub fn wait_for(&self, ev: &Ev, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.contains(ev) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        self.contains(ev)
    }

    /// Assert that `earlier` was delivered before `later`.
    pub fn assert_order(&self, earlier: &Ev, later: &Ev) {
        let events = self.events();
        let a = events.iter().position(|e| e == earlier);
        let b = events.iter().position(|e| e == later);
        match (a, b) {
            (Some(a), Some(b)) => assert!(
                a < b,
                "expected {:?} before {:?}; events: {:?}",
                earlier,
                later,
                events
            ),
            _ => panic!(
                "missing {:?} or {:?} in events: {:?}",
                earlier, later, events
            ),
        }
    }
}
