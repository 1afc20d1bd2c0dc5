//! Engine configuration
//!
//! Tunables for the playback engine, loadable from a TOML file or built in
//! code. Values are validated once at engine construction; afterwards the
//! configuration is immutable (the ring capacity may be changed at runtime
//! through the player, taking effect on the next ring reallocation).

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_ring_capacity() -> usize {
    16_384
}

fn default_write_chunk() -> usize {
    2_048
}

fn default_slot_table_size() -> usize {
    8
}

fn default_event_channel_bytes() -> usize {
    256
}

fn default_worker_idle_timeout_ms() -> u64 {
    5_000
}

fn default_worker_poll_timeout_ms() -> u64 {
    100
}

fn default_collector_interval_ms() -> u64 {
    10_000
}

fn default_collector_grace_ms() -> u64 {
    100
}

fn default_skip_cancel_timeout_ms() -> u64 {
    100
}

fn default_mute_timeout_ms() -> u64 {
    500
}

/// Playback engine tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Ring buffer capacity in frames of the rendering format (~340 ms at
    /// 48 kHz with the default). Reallocated only on format changes.
    pub ring_capacity_frames: usize,

    /// Frames the decoder worker produces per conversion pass. The render
    /// callback wakes the worker whenever this much space is free.
    pub write_chunk_frames: usize,

    /// Number of entries in the active-decoder table. Must be at least twice
    /// the expected number of concurrently unfinished tracks.
    pub slot_table_size: usize,

    /// Capacity of the render-event channel in bytes.
    pub event_channel_bytes: usize,

    /// How long the worker sleeps between decoders when the pending queue is
    /// empty (milliseconds).
    pub worker_idle_timeout_ms: u64,

    /// How long the worker sleeps inside the decode loop when the ring buffer
    /// is full (milliseconds).
    pub worker_poll_timeout_ms: u64,

    /// Collector wakeup interval (milliseconds).
    pub collector_interval_ms: u64,

    /// Grace window between removing a slot from the table and destroying it
    /// (milliseconds). Must comfortably exceed one render period.
    pub collector_grace_ms: u64,

    /// How long skip-to-next waits for the front decoder to acknowledge
    /// cancellation before proceeding anyway (milliseconds).
    pub skip_cancel_timeout_ms: u64,

    /// Upper bound on waiting for the render callback to acknowledge a mute
    /// request (milliseconds).
    pub mute_timeout_ms: u64,

    /// Delay applied to rendering started/complete notifications so the host
    /// observes them aligned with speaker-out (milliseconds).
    pub presentation_latency_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            ring_capacity_frames: default_ring_capacity(),
            write_chunk_frames: default_write_chunk(),
            slot_table_size: default_slot_table_size(),
            event_channel_bytes: default_event_channel_bytes(),
            worker_idle_timeout_ms: default_worker_idle_timeout_ms(),
            worker_poll_timeout_ms: default_worker_poll_timeout_ms(),
            collector_interval_ms: default_collector_interval_ms(),
            collector_grace_ms: default_collector_grace_ms(),
            skip_cancel_timeout_ms: default_skip_cancel_timeout_ms(),
            mute_timeout_ms: default_mute_timeout_ms(),
            presentation_latency_ms: 0,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    ///
    /// Missing keys fall back to their defaults; the result is validated.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("failed to read config file: {}", e)))?;

        let config: EngineConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("failed to parse TOML: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Check tunables for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.write_chunk_frames == 0 {
            return Err(Error::Config("write_chunk_frames must be nonzero".into()));
        }
        if self.ring_capacity_frames < self.write_chunk_frames {
            return Err(Error::Config(format!(
                "ring_capacity_frames ({}) must be >= write_chunk_frames ({})",
                self.ring_capacity_frames, self.write_chunk_frames
            )));
        }
        if self.slot_table_size < 2 {
            return Err(Error::Config("slot_table_size must be at least 2".into()));
        }
        if self.event_channel_bytes < 32 {
            return Err(Error::Config("event_channel_bytes must be at least 32".into()));
        }
        Ok(())
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_idle_timeout_ms)
    }

    pub fn worker_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.worker_poll_timeout_ms)
    }

    pub fn collector_interval(&self) -> Duration {
        Duration::from_millis(self.collector_interval_ms)
    }

    pub fn collector_grace(&self) -> Duration {
        Duration::from_millis(self.collector_grace_ms)
    }

    pub fn skip_cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.skip_cancel_timeout_ms)
    }

    pub fn mute_timeout(&self) -> Duration {
        Duration::from_millis(self.mute_timeout_ms)
    }

    pub fn presentation_latency(&self) -> Duration {
        Duration::from_millis(self.presentation_latency_ms)
    }
}
