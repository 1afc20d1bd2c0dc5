//! Capturing output sink
//!
//! A pull-model sink whose driver thread invokes the engine's render
//! function at a configurable pace (much faster than real time so tests run
//! in milliseconds) and records every rendered sample, silence included.
//! A `CaptureMonitor` handle keeps the recording reachable after the sink
//! is boxed into the player.

use gapless_player::audio::types::AudioFormat;
use gapless_player::{OutputSink, RenderFn, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub struct SinkShared {
    running: AtomicBool,
    stop_driver: AtomicBool,
    render: Mutex<Option<RenderFn>>,
    format: Mutex<AudioFormat>,
    captured: Mutex<Vec<f32>>,
    block_frames: usize,
    pace: Duration,
    epoch: Instant,
}

pub struct CaptureSink {
    shared: Arc<SinkShared>,
    driver: Option<JoinHandle<()>>,
}

/// Read-only view into the sink's recording.
#[derive(Clone)]
pub struct CaptureMonitor(Arc<SinkShared>);

impl CaptureMonitor {
    /// All rendered samples so far, silence included.
    pub fn captured(&self) -> Vec<f32> {
        self.0.captured.lock().unwrap().clone()
    }

    /// Frames (per the current format) whose samples all equal `value`.
    pub fn frames_with_value(&self, value: f32) -> usize {
        let channels = self.0.format.lock().unwrap().channels as usize;
        let captured = self.0.captured.lock().unwrap();
        captured
            .chunks_exact(channels)
            .filter(|frame| frame.iter().all(|&s| s == value))
            .count()
    }
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::with_pacing(256, Duration::from_micros(200))
    }

    pub fn with_pacing(block_frames: usize, pace: Duration) -> Self {
        CaptureSink {
            shared: Arc::new(SinkShared {
                running: AtomicBool::new(false),
                stop_driver: AtomicBool::new(false),
                render: Mutex::new(None),
                format: Mutex::new(AudioFormat::pcm_f32(48_000, 2)),
                captured: Mutex::new(Vec::new()),
                block_frames,
                pace,
                epoch: Instant::now(),
            }),
            driver: None,
        }
    }

    pub fn monitor(&self) -> CaptureMonitor {
        CaptureMonitor(Arc::clone(&self.shared))
    }
}

fn drive(shared: Arc<SinkShared>) {
    let mut buf: Vec<u8> = Vec::new();
    while !shared.stop_driver.load(Ordering::Acquire) {
        if !shared.running.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }

        let bytes_per_frame = shared.format.lock().unwrap().bytes_per_frame();
        let bytes = shared.block_frames * bytes_per_frame;
        buf.clear();
        buf.resize(bytes, 0);

        {
            let mut render = shared.render.lock().unwrap();
            if let Some(render_fn) = render.as_mut() {
                let host_time = shared.epoch.elapsed().as_nanos() as u64;
                render_fn(&mut buf, shared.block_frames, host_time);
            }
        }

        let mut captured = shared.captured.lock().unwrap();
        for chunk in buf.chunks_exact(4) {
            captured.push(f32::from_le_bytes(chunk.try_into().unwrap()));
        }
        drop(captured);

        std::thread::sleep(shared.pace);
    }
}

impl OutputSink for CaptureSink {
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.stop_driver.store(true, Ordering::Release);
        if let Some(driver) = self.driver.take() {
            let _ = driver.join();
        }
    }

    fn start(&mut self) -> Result<()> {
        self.shared.running.store(true, Ordering::Release);
        if self.driver.is_none() {
            let shared = Arc::clone(&self.shared);
            self.driver = Some(
                std::thread::Builder::new()
                    .name("capture-sink".into())
                    .spawn(move || drive(shared))
                    .expect("spawn capture driver"),
            );
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.shared.running.store(false, Ordering::Release);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    fn supports_format(&self, format: &AudioFormat) -> bool {
        format.encoding.is_pcm()
    }

    fn setup_for(&mut self, format: &AudioFormat) -> Result<AudioFormat> {
        let chosen = AudioFormat::pcm_f32(format.sample_rate, format.channels);
        *self.shared.format.lock().unwrap() = chosen.clone();
        Ok(chosen)
    }

    fn set_render_fn(&mut self, render: RenderFn) {
        *self.shared.render.lock().unwrap() = Some(render);
    }
}

impl Drop for CaptureSink {
    fn drop(&mut self) {
        self.close();
    }
}
