//! Error types for the playback engine
//!
//! Expected errors use `Result<T, Error>` with meaningful variants; on the
//! real-time path errors are converted to event records or flags, never
//! propagated as values.

use crate::audio::types::AudioFormat;
use thiserror::Error;

/// Main error type for the playback engine.
#[derive(Debug, Error)]
pub enum Error {
    /// A decoder failed to open its source
    #[error("decoder failed to open: {reason}")]
    DecoderOpenFailed { reason: String },

    /// The output sink cannot play this format
    #[error("output does not support format {format}")]
    FormatUnsupported { format: AudioFormat },

    /// A converter could not be built for the given format pair
    #[error("cannot convert {from} to {to}: {reason}")]
    ConverterInit {
        from: AudioFormat,
        to: AudioFormat,
        reason: String,
    },

    /// Mid-stream decode failure
    #[error("decode error: {reason}")]
    Decode { reason: String },

    /// The decoder refused a seek request
    #[error("seek to frame {frame} failed")]
    SeekFailed { frame: i64 },

    /// Seek requested on a decoder that cannot seek
    #[error("decoder does not support seeking")]
    SeekUnsupported,

    /// Seek target outside the track
    #[error("seek target {frame} out of range 0..{length}")]
    SeekOutOfRange { frame: i64, length: i64 },

    /// Every active-decoder slot is occupied
    #[error("no free decoder slot")]
    TableFull,

    /// The output sink refused to start
    #[error("output failed to start: {reason}")]
    OutputStartFailed { reason: String },

    /// Other output device errors
    #[error("audio output error: {0}")]
    Output(String),

    /// An operation that targets the current track found none
    #[error("no track is currently playing")]
    NoCurrentTrack,

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// IO errors from file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias using our error type.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::FormatUnsupported {
            format: AudioFormat::pcm_f32(44_100, 2),
        };
        assert_eq!(err.to_string(), "output does not support format 44100 Hz / 2 ch / f32");

        let err = Error::SeekOutOfRange { frame: -1, length: 96_000 };
        assert_eq!(err.to_string(), "seek target -1 out of range 0..96000");
    }
}
