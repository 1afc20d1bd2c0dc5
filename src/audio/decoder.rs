//! Decoder interface and the bundled symphonia file decoder
//!
//! The engine drives decoders exclusively through the [`Decoder`] trait; any
//! source able to produce PCM or DSD frames can be enqueued. [`FileDecoder`]
//! is the bundled implementation for local audio files (MP3, FLAC, AAC,
//! Vorbis, WAV, ...) using symphonia.

use crate::audio::types::{AudioFormat, ChannelLayout, SampleEncoding};
use crate::error::{Error, Result};
use std::path::PathBuf;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::formats::{FormatOptions, FormatReader, SeekMode, SeekTo};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

/// The capability set the engine requires from an audio source.
///
/// `read` fills interleaved f32 frames in the decoder's native format; DSD
/// sources implement `read_dsd` instead and report a DSD [`AudioFormat`].
/// All methods are called from the decoder worker thread (plus brief,
/// mute-protected calls from the player facade); implementations need not be
/// internally synchronized.
pub trait Decoder: Send {
    /// Open the source. Idempotent after the first success.
    fn open(&mut self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Native format. Valid once open.
    fn format(&self) -> AudioFormat;

    /// Total frames at the native rate; -1 (or an estimate) when unknown.
    /// Formats like MP3 only learn the exact value at end of stream.
    fn frame_length(&self) -> i64;

    /// Current position in native-rate frames.
    fn current_frame(&self) -> i64;

    fn supports_seeking(&self) -> bool {
        false
    }

    /// Seek to the given native-rate frame. Returns the frame actually
    /// reached, or -1 on failure.
    fn seek_to_frame(&mut self, _frame: i64) -> i64 {
        -1
    }

    /// Read up to `max_frames` interleaved f32 frames into `buf`
    /// (`buf.len() >= max_frames * channels`). Returns frames read;
    /// 0 means end of stream.
    fn read(&mut self, buf: &mut [f32], max_frames: usize) -> Result<usize>;

    /// Byte-level read for DSD sources. One frame is one byte per channel.
    fn read_dsd(&mut self, _buf: &mut [u8], _max_frames: usize) -> Result<usize> {
        Err(Error::Decode {
            reason: "decoder does not produce DSD".into(),
        })
    }

    /// Source identifier passed through to host callbacks.
    fn url(&self) -> Option<String> {
        None
    }
}

/// File decoder backed by symphonia.
pub struct FileDecoder {
    path: PathBuf,
    opened: Option<Opened>,
}

struct Opened {
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    format: AudioFormat,
    frame_length: i64,
    /// Frames handed out so far, native rate
    position: u64,
    /// Decoded samples not yet consumed by `read`
    leftover: Vec<f32>,
    sample_buf: Option<SampleBuffer<f32>>,
}

impl FileDecoder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileDecoder {
            path: path.into(),
            opened: None,
        }
    }

    /// Decode the next packet into `leftover`. Returns false at end of
    /// stream.
    fn decode_next_packet(opened: &mut Opened) -> Result<bool> {
        loop {
            let packet = match opened.reader.next_packet() {
                Ok(packet) => packet,
                Err(symphonia::core::errors::Error::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(false);
                }
                Err(symphonia::core::errors::Error::ResetRequired) => return Ok(false),
                Err(e) => {
                    return Err(Error::Decode {
                        reason: format!("failed to read packet: {}", e),
                    })
                }
            };

            if packet.track_id() != opened.track_id {
                continue;
            }

            match opened.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let duration = decoded.capacity() as u64;
                    let sample_buf = opened
                        .sample_buf
                        .get_or_insert_with(|| SampleBuffer::<f32>::new(duration, spec));
                    sample_buf.copy_interleaved_ref(decoded);
                    opened.leftover.extend_from_slice(sample_buf.samples());
                    return Ok(true);
                }
                Err(symphonia::core::errors::Error::DecodeError(e)) => {
                    // Recoverable: skip the damaged packet
                    warn!("skipping undecodable packet: {}", e);
                    continue;
                }
                Err(e) => {
                    return Err(Error::Decode {
                        reason: format!("decode failed: {}", e),
                    })
                }
            }
        }
    }
}

impl Decoder for FileDecoder {
    fn open(&mut self) -> Result<()> {
        if self.opened.is_some() {
            return Ok(());
        }

        let file = std::fs::File::open(&self.path).map_err(|e| Error::DecoderOpenFailed {
            reason: format!("{}: {}", self.path.display(), e),
        })?;

        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = self.path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
            .map_err(|e| Error::DecoderOpenFailed {
                reason: format!("failed to probe format: {}", e),
            })?;

        let reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::DecoderOpenFailed {
                reason: "no audio track found".into(),
            })?;

        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params.sample_rate.ok_or_else(|| Error::DecoderOpenFailed {
            reason: "sample rate not found".into(),
        })?;
        let channels = params
            .channels
            .map(|c| c.count() as u16)
            .ok_or_else(|| Error::DecoderOpenFailed {
                reason: "channel count not found".into(),
            })?;
        let frame_length = params.n_frames.map(|n| n as i64).unwrap_or(-1);

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| Error::DecoderOpenFailed {
                reason: format!("failed to create decoder: {}", e),
            })?;

        debug!(
            "opened {}: {} Hz, {} ch, {} frames",
            self.path.display(),
            sample_rate,
            channels,
            frame_length
        );

        self.opened = Some(Opened {
            reader,
            decoder,
            track_id,
            format: AudioFormat {
                sample_rate,
                channels,
                layout: ChannelLayout::for_channels(channels),
                encoding: SampleEncoding::PcmF32,
                interleaved: true,
                bit_order: crate::audio::types::BitOrder::MsbFirst,
            },
            frame_length,
            position: 0,
            leftover: Vec::new(),
            sample_buf: None,
        });
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened.is_some()
    }

    fn format(&self) -> AudioFormat {
        self.opened
            .as_ref()
            .map(|o| o.format.clone())
            .unwrap_or_else(|| AudioFormat::pcm_f32(0, 0))
    }

    fn frame_length(&self) -> i64 {
        self.opened.as_ref().map(|o| o.frame_length).unwrap_or(-1)
    }

    fn current_frame(&self) -> i64 {
        self.opened.as_ref().map(|o| o.position as i64).unwrap_or(0)
    }

    fn supports_seeking(&self) -> bool {
        true
    }

    fn seek_to_frame(&mut self, frame: i64) -> i64 {
        let Some(opened) = self.opened.as_mut() else {
            return -1;
        };
        if frame < 0 {
            return -1;
        }

        match opened.reader.seek(
            SeekMode::Accurate,
            SeekTo::TimeStamp {
                ts: frame as u64,
                track_id: opened.track_id,
            },
        ) {
            Ok(seeked) => {
                opened.decoder.reset();
                opened.leftover.clear();
                opened.position = seeked.actual_ts;
                seeked.actual_ts as i64
            }
            Err(e) => {
                warn!("seek to frame {} failed: {}", frame, e);
                -1
            }
        }
    }

    fn read(&mut self, buf: &mut [f32], max_frames: usize) -> Result<usize> {
        let opened = self.opened.as_mut().ok_or_else(|| Error::Decode {
            reason: "decoder not open".into(),
        })?;

        let channels = opened.format.channels as usize;
        let want_samples = max_frames * channels;

        while opened.leftover.len() < want_samples {
            if !Self::decode_next_packet(opened)? {
                // End of stream: the exact frame count is now known
                let exact = opened.position + (opened.leftover.len() / channels) as u64;
                opened.frame_length = exact as i64;
                break;
            }
        }

        let take_samples = opened.leftover.len().min(want_samples);
        let frames = take_samples / channels;
        buf[..frames * channels].copy_from_slice(&opened.leftover[..frames * channels]);
        opened.leftover.drain(..frames * channels);
        opened.position += frames as u64;
        Ok(frames)
    }

    fn url(&self) -> Option<String> {
        Some(self.path.display().to_string())
    }
}
