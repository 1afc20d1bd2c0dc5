//! Synthetic decoders with exactly known output
//!
//! `ToneDecoder` produces a fixed number of frames all holding one constant
//! sample value, which makes frame accounting and gapless-boundary checks
//! exact: every rendered sample can be attributed to its source track by
//! value.

use gapless_player::audio::types::AudioFormat;
use gapless_player::{Decoder, Error, Result};
use std::time::Duration;

pub struct ToneDecoder {
    format: AudioFormat,
    total_frames: u64,
    position: u64,
    value: f32,
    opened: bool,
    seekable: bool,
    read_delay: Option<Duration>,
    fail_open: bool,
}

impl ToneDecoder {
    pub fn new(sample_rate: u32, channels: u16, total_frames: u64, value: f32) -> Self {
        ToneDecoder {
            format: AudioFormat::pcm_f32(sample_rate, channels),
            total_frames,
            position: 0,
            value,
            opened: false,
            seekable: true,
            read_delay: None,
            fail_open: false,
        }
    }

    /// Refuse seek requests.
    pub fn unseekable(mut self) -> Self {
        self.seekable = false;
        self
    }

    /// Sleep on every read, simulating a source slower than real time.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Fail `open()`, for error-path tests.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }
}

impl Decoder for ToneDecoder {
    fn open(&mut self) -> Result<()> {
        if self.fail_open {
            return Err(Error::DecoderOpenFailed {
                reason: "synthetic open failure".into(),
            });
        }
        self.opened = true;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened
    }

    fn format(&self) -> AudioFormat {
        self.format.clone()
    }

    fn frame_length(&self) -> i64 {
        self.total_frames as i64
    }

    fn current_frame(&self) -> i64 {
        self.position as i64
    }

    fn supports_seeking(&self) -> bool {
        self.seekable
    }

    fn seek_to_frame(&mut self, frame: i64) -> i64 {
        if !self.seekable || frame < 0 {
            return -1;
        }
        self.position = (frame as u64).min(self.total_frames);
        self.position as i64
    }

    fn read(&mut self, buf: &mut [f32], max_frames: usize) -> Result<usize> {
        if let Some(delay) = self.read_delay {
            std::thread::sleep(delay);
        }
        let channels = self.format.channels as usize;
        let frames = (self.total_frames - self.position).min(max_frames as u64) as usize;
        buf[..frames * channels].fill(self.value);
        self.position += frames as u64;
        Ok(frames)
    }

    fn url(&self) -> Option<String> {
        Some(format!("tone://{}", self.value))
    }
}
