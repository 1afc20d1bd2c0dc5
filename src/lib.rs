//! # Gapless Player
//!
//! A gapless audio playback engine. Decoders are enqueued in order, their
//! output is stitched into one continuous stream at a fixed rendering
//! format, and a pull-model output sink consumes that stream in real time.
//!
//! **Architecture:** three cooperating threads around lock-free plumbing:
//! - a high-priority decoder worker (decode → convert → ring buffer)
//! - the output's real-time render callback (wait-free: no locks, no
//!   allocation, no decoder calls)
//! - a notifier delivering host callbacks off the real-time path, plus a
//!   background collector reclaiming finished decoder slots
//!
//! Audio stack: symphonia (bundled file decoder) + rubato (conversion) +
//! cpal (output).
//!
//! ```no_run
//! use gapless_player::{CpalOutput, EngineConfig, FileDecoder, Player, PlayerCallbacks};
//!
//! let sink = Box::new(CpalOutput::new(None)?);
//! let callbacks = PlayerCallbacks::new()
//!     .on_rendering_started(|track, _| println!("playing {:?}", track.url));
//! let player = Player::new(sink, EngineConfig::default(), callbacks)?;
//!
//! player.play(Box::new(FileDecoder::new("a.flac")))?;
//! player.enqueue(Box::new(FileDecoder::new("b.flac")))?; // gapless follow-up
//! # Ok::<(), gapless_player::Error>(())
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod playback;

pub use audio::{
    AudioFormat, BitOrder, ChannelLayout, Converter, CpalOutput, Decoder, FileDecoder, OutputSink,
    RenderFn, RenderStatus, SampleEncoding,
};
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use events::{PlayerCallbacks, TrackInfo};
pub use playback::{Player, RingStats};
