//! Format conversion between a decoder's native format and the rendering
//! format
//!
//! Wraps a stateful rubato resampler plus simple channel adaptation
//! (mono ↔ stereo). The converter pulls input through a provider callback so
//! the worker can account decoded frames at the decoder's native rate, and
//! it carries leftover output frames between calls so each `fill` can deliver
//! exactly the requested chunk until end of stream.
//!
//! Filter state is preserved across chunks; `reset()` is required after a
//! seek or a ring purge so stale filter history cannot leak into the new
//! position.

use crate::audio::types::{AudioFormat, SampleEncoding};
use crate::error::{Error, Result};
use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::debug;

/// Provider callback: fills `buf` with up to `max_frames` interleaved frames
/// in the converter's input format and returns the frames written (0 = end
/// of stream).
pub type InputProvider<'a> = dyn FnMut(&mut [f32], usize) -> usize + 'a;

pub struct Converter {
    input: AudioFormat,
    output: AudioFormat,

    /// None when input and output rates match
    resampler: Option<FastFixedIn<f32>>,

    /// Fixed input frames per resampler pass
    input_chunk_frames: usize,

    /// Provider output, input channel count
    scratch_in: Vec<f32>,

    /// Channel-adapted input, output channel count
    adapted: Vec<f32>,

    /// Output frames produced but not yet delivered
    carry: Vec<f32>,

    eos: bool,
}

impl Converter {
    /// Build a converter from `input` to `output`.
    ///
    /// Supports any matching channel count plus mono→stereo and stereo→mono;
    /// PCM may be resampled, DSD must match exactly (bit-order fixups happen
    /// at the byte level outside the converter).
    pub fn new(input: &AudioFormat, output: &AudioFormat, output_chunk_frames: usize) -> Result<Self> {
        let convert_err = |reason: String| Error::ConverterInit {
            from: input.clone(),
            to: output.clone(),
            reason,
        };

        if input.encoding.is_pcm() != output.encoding.is_pcm() {
            return Err(convert_err("cannot convert between PCM and DSD".into()));
        }
        if !input.encoding.is_pcm()
            && (input.sample_rate != output.sample_rate || input.channels != output.channels)
        {
            return Err(convert_err("DSD streams cannot be resampled".into()));
        }

        let (in_ch, out_ch) = (input.channels, output.channels);
        if in_ch != out_ch && !matches!((in_ch, out_ch), (1, 2) | (2, 1)) {
            return Err(convert_err(format!(
                "unsupported channel adaptation {} -> {}",
                in_ch, out_ch
            )));
        }

        let (resampler, input_chunk_frames) = if input.encoding.is_pcm()
            && input.sample_rate != output.sample_rate
        {
            let ratio = output.sample_rate as f64 / input.sample_rate as f64;
            let input_chunk = ((output_chunk_frames as f64 / ratio).ceil() as usize).max(256);
            let resampler = FastFixedIn::<f32>::new(
                ratio,
                1.0,
                PolynomialDegree::Septic,
                input_chunk,
                out_ch as usize,
            )
            .map_err(|e| convert_err(format!("failed to create resampler: {}", e)))?;

            debug!(
                "converter resampling {} Hz -> {} Hz ({} ch, input chunk {})",
                input.sample_rate, output.sample_rate, out_ch, input_chunk
            );
            (Some(resampler), input_chunk)
        } else {
            (None, output_chunk_frames.max(1))
        };

        Ok(Converter {
            input: input.clone(),
            output: output.clone(),
            resampler,
            input_chunk_frames,
            scratch_in: Vec::new(),
            adapted: Vec::new(),
            carry: Vec::new(),
            eos: false,
        })
    }

    pub fn input_format(&self) -> &AudioFormat {
        &self.input
    }

    pub fn output_format(&self) -> &AudioFormat {
        &self.output
    }

    /// Clear filter state and any carried frames. Required after a seek or a
    /// ring purge.
    pub fn reset(&mut self) {
        if let Some(rs) = &mut self.resampler {
            rs.reset();
        }
        self.carry.clear();
        self.eos = false;
    }

    /// Produce up to `target_frames` interleaved output frames into `out`,
    /// pulling input from `provider` as needed.
    ///
    /// Returns the frames produced. A return shorter than `target_frames`
    /// means the provider reached end of stream and the resampler tail has
    /// been drained.
    pub fn fill(
        &mut self,
        out: &mut [f32],
        target_frames: usize,
        provider: &mut InputProvider<'_>,
    ) -> Result<usize> {
        if self.input.encoding == SampleEncoding::Dsd {
            return Err(Error::Decode {
                reason: "DSD streams bypass the converter".into(),
            });
        }

        let out_ch = self.output.channels as usize;
        let in_ch = self.input.channels as usize;
        let mut produced = 0usize;

        loop {
            // Deliver carried frames first
            if !self.carry.is_empty() && produced < target_frames {
                let take = (self.carry.len() / out_ch).min(target_frames - produced);
                let take_samples = take * out_ch;
                out[produced * out_ch..(produced + take) * out_ch]
                    .copy_from_slice(&self.carry[..take_samples]);
                self.carry.drain(..take_samples);
                produced += take;
            }

            if produced == target_frames || self.eos {
                break;
            }

            // Pull one input chunk
            let want = self.input_chunk_frames;
            self.scratch_in.resize(want * in_ch, 0.0);
            let got = provider(&mut self.scratch_in[..want * in_ch], want);

            if got == 0 {
                self.eos = true;
                if let Some(rs) = &mut self.resampler {
                    let tail = rs
                        .process_partial(Option::<&[Vec<f32>]>::None, None)
                        .map_err(|e| Error::Decode {
                            reason: format!("resampler drain failed: {}", e),
                        })?;
                    interleave_into(&tail, &mut self.carry);
                }
                continue;
            }

            adapt_channels(&self.scratch_in[..got * in_ch], in_ch, out_ch, &mut self.adapted);

            match &mut self.resampler {
                None => self.carry.extend_from_slice(&self.adapted[..got * out_ch]),
                Some(rs) => {
                    let planar = deinterleave(&self.adapted[..got * out_ch], out_ch);
                    let result = if got == self.input_chunk_frames {
                        rs.process(&planar, None)
                    } else {
                        rs.process_partial(Some(&planar), None)
                    };
                    let out_planar = result.map_err(|e| Error::Decode {
                        reason: format!("resampling failed: {}", e),
                    })?;
                    interleave_into(&out_planar, &mut self.carry);
                }
            }
        }

        Ok(produced)
    }
}

/// Adapt interleaved samples between channel counts.
fn adapt_channels(input: &[f32], in_ch: usize, out_ch: usize, out: &mut Vec<f32>) {
    out.clear();
    if in_ch == out_ch {
        out.extend_from_slice(input);
        return;
    }
    match (in_ch, out_ch) {
        (1, 2) => {
            out.reserve(input.len() * 2);
            for &s in input {
                out.push(s);
                out.push(s);
            }
        }
        (2, 1) => {
            out.reserve(input.len() / 2);
            for pair in input.chunks_exact(2) {
                out.push((pair[0] + pair[1]) * 0.5);
            }
        }
        _ => unreachable!("channel adaptation validated at construction"),
    }
}

/// Convert interleaved samples to planar for rubato.
fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, &s) in frame.iter().enumerate() {
            planar[ch].push(s);
        }
    }
    planar
}

/// Append planar output interleaved.
fn interleave_into(planar: &[Vec<f32>], out: &mut Vec<f32>) {
    if planar.is_empty() {
        return;
    }
    let channels = planar.len();
    let frames = planar[0].len();
    out.reserve(frames * channels);
    for i in 0..frames {
        for ch in planar {
            out.push(ch[i]);
        }
    }
}
