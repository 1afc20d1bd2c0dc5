//! Shared test infrastructure: synthetic decoders, a capturing output sink,
//! and an event recorder.
#![allow(dead_code)]

pub mod audio_generator;
pub mod capture_sink;
pub mod recorder;

pub use audio_generator::ToneDecoder;
pub use capture_sink::{CaptureMonitor, CaptureSink};
pub use recorder::{Ev, Recorder};

use std::time::{Duration, Instant};

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Initialize tracing output for a test (no-op when already set).
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
