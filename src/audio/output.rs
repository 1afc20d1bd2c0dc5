//! Audio output sink
//!
//! The engine owns the output and hands it a non-owning render function; the
//! sink invokes that function from its real-time thread to pull audio. Any
//! pull-model device can implement [`OutputSink`]; [`CpalOutput`] is the
//! bundled implementation for system audio devices via cpal.
//!
//! cpal streams are not `Send`, so `CpalOutput` confines the stream to a
//! dedicated control thread and drives it through a command channel. The
//! handle itself is `Send` and can be shared between the player facade and
//! the decoder worker.

use crate::audio::types::AudioFormat;
use crate::error::{Error, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleFormat, SampleRate, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, sync_channel, Receiver, Sender, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, info, warn};

/// What the render function produced for a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStatus {
    /// The buffer holds rendered audio (possibly with a silence tail)
    Rendered,
    /// The whole buffer is silence
    Silence,
}

/// The engine's render entry point: fills `buffer` with `frame_count` frames
/// of the rendering format; `host_time` is a monotonic nanosecond timestamp.
pub type RenderFn = Box<dyn FnMut(&mut [u8], usize, u64) -> RenderStatus + Send>;

/// A pull-model audio output.
pub trait OutputSink: Send {
    fn open(&mut self) -> Result<()>;

    fn close(&mut self);

    fn start(&mut self) -> Result<()>;

    fn stop(&mut self) -> Result<()>;

    /// Drop any device-buffered audio. Optional.
    fn reset(&mut self) {}

    fn is_running(&self) -> bool;

    /// Whether the device can render this format directly.
    fn supports_format(&self, format: &AudioFormat) -> bool;

    /// Configure the device for a decoder's native format and return the
    /// rendering format actually chosen (which every frame handed to the
    /// render function must then conform to).
    fn setup_for(&mut self, format: &AudioFormat) -> Result<AudioFormat>;

    /// Install the render function. Must be called before `start`.
    fn set_render_fn(&mut self, render: RenderFn);
}

// ============================================================================
// cpal implementation
// ============================================================================

/// An f32 output config range the device advertises.
#[derive(Debug, Clone, Copy)]
struct CapRange {
    channels: u16,
    min_rate: u32,
    max_rate: u32,
}

enum SinkCmd {
    Start(SyncSender<Result<()>>),
    Stop(SyncSender<Result<()>>),
    Setup(AudioFormat, SyncSender<Result<AudioFormat>>),
    SetRender(RenderFn),
    Close,
}

/// System audio output via cpal.
pub struct CpalOutput {
    cmd_tx: Sender<SinkCmd>,
    running: Arc<AtomicBool>,
    caps: Vec<CapRange>,
    thread: Option<JoinHandle<()>>,
}

impl CpalOutput {
    /// Open the named device (or the default output device).
    pub fn new(device_name: Option<String>) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(false));
        let (cmd_tx, cmd_rx) = channel::<SinkCmd>();
        let (boot_tx, boot_rx) = sync_channel::<Result<Vec<CapRange>>>(1);

        let thread_running = Arc::clone(&running);
        let thread = std::thread::Builder::new()
            .name("cpal-output".into())
            .spawn(move || sink_thread(device_name, cmd_rx, boot_tx, thread_running))
            .map_err(|e| Error::Output(format!("failed to spawn output thread: {}", e)))?;

        let caps = boot_rx
            .recv()
            .map_err(|_| Error::Output("output thread terminated during startup".into()))??;

        Ok(CpalOutput {
            cmd_tx,
            running,
            caps,
            thread: Some(thread),
        })
    }

    fn roundtrip<T>(&self, make: impl FnOnce(SyncSender<Result<T>>) -> SinkCmd) -> Result<T> {
        let (tx, rx) = sync_channel(1);
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| Error::Output("output thread terminated".into()))?;
        rx.recv()
            .map_err(|_| Error::Output("output thread terminated".into()))?
    }
}

impl OutputSink for CpalOutput {
    fn open(&mut self) -> Result<()> {
        // The device is opened when the handle is constructed
        Ok(())
    }

    fn close(&mut self) {
        let _ = self.cmd_tx.send(SinkCmd::Close);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn start(&mut self) -> Result<()> {
        self.roundtrip(SinkCmd::Start)
    }

    fn stop(&mut self) -> Result<()> {
        self.roundtrip(SinkCmd::Stop)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn supports_format(&self, format: &AudioFormat) -> bool {
        format.encoding.is_pcm()
            && self.caps.iter().any(|cap| {
                cap.channels == format.channels
                    && cap.min_rate <= format.sample_rate
                    && format.sample_rate <= cap.max_rate
            })
    }

    fn setup_for(&mut self, format: &AudioFormat) -> Result<AudioFormat> {
        self.roundtrip(|tx| SinkCmd::Setup(format.clone(), tx))
    }

    fn set_render_fn(&mut self, render: RenderFn) {
        let _ = self.cmd_tx.send(SinkCmd::SetRender(render));
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.close();
    }
}

/// State confined to the output control thread (the cpal stream is !Send).
struct SinkThread {
    device: Device,
    config: Option<StreamConfig>,
    stream: Option<Stream>,
    render: Arc<Mutex<Option<RenderFn>>>,
    running: Arc<AtomicBool>,
    epoch: Instant,
}

fn sink_thread(
    device_name: Option<String>,
    cmd_rx: Receiver<SinkCmd>,
    boot_tx: SyncSender<Result<Vec<CapRange>>>,
    running: Arc<AtomicBool>,
) {
    let (device, caps) = match open_device(device_name) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = boot_tx.send(Err(e));
            return;
        }
    };
    let _ = boot_tx.send(Ok(caps));

    let mut sink = SinkThread {
        device,
        config: None,
        stream: None,
        render: Arc::new(Mutex::new(None)),
        running,
        epoch: Instant::now(),
    };

    while let Ok(cmd) = cmd_rx.recv() {
        match cmd {
            SinkCmd::Start(reply) => {
                let _ = reply.send(sink.start());
            }
            SinkCmd::Stop(reply) => {
                let _ = reply.send(sink.stop());
            }
            SinkCmd::Setup(format, reply) => {
                let _ = reply.send(sink.setup(&format));
            }
            SinkCmd::SetRender(render) => {
                *sink.render.lock().unwrap() = Some(render);
            }
            SinkCmd::Close => break,
        }
    }

    let _ = sink.stop();
    debug!("output thread exiting");
}

fn open_device(device_name: Option<String>) -> Result<(Device, Vec<CapRange>)> {
    let host = cpal::default_host();

    let device = if let Some(name) = device_name.as_ref() {
        host.output_devices()
            .map_err(|e| Error::Output(format!("failed to enumerate devices: {}", e)))?
            .find(|d| d.name().ok().as_ref() == Some(name))
            .ok_or_else(|| Error::Output(format!("device '{}' not found", name)))?
    } else {
        host.default_output_device()
            .ok_or_else(|| Error::Output("no default output device found".into()))?
    };

    info!(
        "using audio device: {}",
        device.name().unwrap_or_else(|_| "unknown".into())
    );

    let caps = device
        .supported_output_configs()
        .map_err(|e| Error::Output(format!("failed to query device configs: {}", e)))?
        .filter(|c| c.sample_format() == SampleFormat::F32)
        .map(|c| CapRange {
            channels: c.channels(),
            min_rate: c.min_sample_rate().0,
            max_rate: c.max_sample_rate().0,
        })
        .collect();

    Ok((device, caps))
}

impl SinkThread {
    fn setup(&mut self, format: &AudioFormat) -> Result<AudioFormat> {
        if !format.encoding.is_pcm() {
            return Err(Error::FormatUnsupported {
                format: format.clone(),
            });
        }

        let exact = self
            .device
            .supported_output_configs()
            .map_err(|e| Error::Output(format!("failed to query device configs: {}", e)))?
            .filter(|c| c.sample_format() == SampleFormat::F32)
            .find(|c| {
                c.channels() == format.channels
                    && c.min_sample_rate().0 <= format.sample_rate
                    && format.sample_rate <= c.max_sample_rate().0
            });

        let config = match exact {
            Some(range) => range.with_sample_rate(SampleRate(format.sample_rate)).config(),
            None => {
                // Fall back to the device default; the converter bridges the gap
                let default = self.device.default_output_config().map_err(|e| {
                    Error::Output(format!("failed to get default config: {}", e))
                })?;
                if default.sample_format() != SampleFormat::F32 {
                    return Err(Error::FormatUnsupported {
                        format: format.clone(),
                    });
                }
                default.config()
            }
        };

        let chosen = AudioFormat::pcm_f32(config.sample_rate.0, config.channels);
        debug!("output configured for {}", chosen);

        let was_running = self.stream.is_some();
        if was_running {
            self.stop()?;
        }
        self.config = Some(config);
        if was_running {
            self.start()?;
        }
        Ok(chosen)
    }

    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let config = match &self.config {
            Some(config) => config.clone(),
            None => {
                let default = self.device.default_output_config().map_err(|e| {
                    Error::OutputStartFailed {
                        reason: format!("failed to get default config: {}", e),
                    }
                })?;
                default.config()
            }
        };

        let channels = config.channels as usize;
        let bytes_per_frame = channels * 4;
        let render = Arc::clone(&self.render);
        let epoch = self.epoch;
        let mut scratch: Vec<u8> = vec![0u8; 8_192 * bytes_per_frame];

        let stream = self
            .device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    let frames = data.len() / channels;
                    let bytes = frames * bytes_per_frame;
                    if scratch.len() < bytes {
                        scratch.resize(bytes, 0);
                    }
                    let host_time = epoch.elapsed().as_nanos() as u64;

                    let mut guard = render.lock().unwrap();
                    match guard.as_mut() {
                        Some(render_fn) => {
                            render_fn(&mut scratch[..bytes], frames, host_time);
                            for (dst, src) in
                                data.iter_mut().zip(scratch[..bytes].chunks_exact(4))
                            {
                                *dst = f32::from_le_bytes(src.try_into().unwrap());
                            }
                        }
                        None => data.fill(0.0),
                    }
                },
                |err| warn!("audio stream error: {}", err),
                None,
            )
            .map_err(|e| Error::OutputStartFailed {
                reason: format!("failed to build stream: {}", e),
            })?;

        stream.play().map_err(|e| Error::OutputStartFailed {
            reason: format!("failed to start stream: {}", e),
        })?;

        self.stream = Some(stream);
        self.running.store(true, Ordering::Release);
        info!("audio stream started");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            stream
                .pause()
                .map_err(|e| Error::Output(format!("failed to pause stream: {}", e)))?;
        }
        self.running.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Device-dependent behavior is exercised manually; CI machines often
    // have no audio hardware. Constructing against a missing device must
    // fail cleanly either way.
    #[test]
    fn test_unknown_device_is_an_error() {
        let result = CpalOutput::new(Some("no-such-device-exists".into()));
        assert!(result.is_err());
    }
}
