//! Validated configuration for a [`Storer`](crate::storer::Storer)/[`Repeater`](crate::repeater::Repeater)
//! pair.
//!
//! Mirrors the builder-validated `DiskBufferConfig`/`DiskBufferConfigBuilder` split this crate's
//! teacher uses: defaults live on the builder, `build()` performs the parameter validation the
//! original Go proxy's argument-parsing layer would otherwise silently skip, and the resulting
//! `SpoolConfig` is immutable and cheap to clone.

use std::{path::PathBuf, time::Duration};

use snafu::Snafu;

/// Default period between chunk rotations.
pub const DEFAULT_CHUNK_LIFETIME: Duration = Duration::from_secs(5);

/// Default initial TTL (number of delivery attempts) for a newly-stored record.
pub const DEFAULT_REPEAT_NUMBER: i32 = 3;

/// Default capacity of both the inbound data channel and the outbound chunk-path channel.
pub const DEFAULT_BUFFER_SIZE: usize = 10_000;

/// Default back-off window the repeater waits between attempts at the same record.
pub const DEFAULT_REPEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors produced while validating a [`SpoolConfigBuilder`].
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("parameter '{}' was invalid: {}", param_name, reason))]
    InvalidParameter {
        param_name: &'static str,
        reason: String,
    },
}

/// Immutable, validated configuration shared by a `Storer`/`Repeater` pair operating on the same
/// storage directory.
#[derive(Debug, Clone)]
pub struct SpoolConfig {
    /// Directory holding this spool's chunk files. Must be unique to this spool; an advisory
    /// lock file (`buffer.lock`) prevents two `Storer`s from sharing one directory.
    pub storage_dir: PathBuf,

    /// Initial TTL (number of delivery attempts) assigned to a newly-stored record.
    pub repeat_number: i32,

    /// How long the current chunk stays open for writes before the `Storer` rotates it out.
    ///
    /// This is the maximum latency between a request being enqueued and its chunk becoming
    /// visible to the `Repeater`.
    pub chunk_lifetime: Duration,

    /// Minimum time the `Repeater` waits between attempts at the same record (the back-off
    /// filter in `Chunk::for_each_active`).
    pub repeat_timeout: Duration,

    /// Capacity of the bounded inbound data channel and outbound chunk-path channel.
    pub buffer_size: usize,
}

/// Builder for [`SpoolConfig`].
#[derive(Debug, Clone)]
pub struct SpoolConfigBuilder {
    storage_dir: PathBuf,
    repeat_number: Option<i32>,
    chunk_lifetime: Option<Duration>,
    repeat_timeout: Option<Duration>,
    buffer_size: Option<usize>,
}

impl SpoolConfigBuilder {
    /// Starts a builder rooted at `storage_dir`.
    pub fn from_path(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            repeat_number: None,
            chunk_lifetime: None,
            repeat_timeout: None,
            buffer_size: None,
        }
    }

    /// Sets the initial TTL assigned to a newly-stored record. Defaults to
    /// [`DEFAULT_REPEAT_NUMBER`].
    pub fn repeat_number(mut self, amount: i32) -> Self {
        self.repeat_number = Some(amount);
        self
    }

    /// Sets the chunk rotation period. Defaults to [`DEFAULT_CHUNK_LIFETIME`].
    pub fn chunk_lifetime(mut self, duration: Duration) -> Self {
        self.chunk_lifetime = Some(duration);
        self
    }

    /// Sets the back-off window between attempts at the same record. Defaults to
    /// [`DEFAULT_REPEAT_TIMEOUT`].
    pub fn repeat_timeout(mut self, duration: Duration) -> Self {
        self.repeat_timeout = Some(duration);
        self
    }

    /// Sets the capacity of both bounded channels. Defaults to [`DEFAULT_BUFFER_SIZE`].
    pub fn buffer_size(mut self, amount: usize) -> Self {
        self.buffer_size = Some(amount);
        self
    }

    /// Consumes this builder and constructs a [`SpoolConfig`], validating every parameter.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidParameter`] if `repeat_number` is less than `1`,
    /// `buffer_size` is `0`, or `chunk_lifetime`/`repeat_timeout` is zero.
    pub fn build(self) -> Result<SpoolConfig, ConfigError> {
        let repeat_number = self.repeat_number.unwrap_or(DEFAULT_REPEAT_NUMBER);
        let chunk_lifetime = self.chunk_lifetime.unwrap_or(DEFAULT_CHUNK_LIFETIME);
        let repeat_timeout = self.repeat_timeout.unwrap_or(DEFAULT_REPEAT_TIMEOUT);
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);

        if repeat_number < 1 {
            return Err(ConfigError::InvalidParameter {
                param_name: "repeat_number",
                reason: "must be at least 1".to_string(),
            });
        }

        if chunk_lifetime.is_zero() {
            return Err(ConfigError::InvalidParameter {
                param_name: "chunk_lifetime",
                reason: "cannot be zero".to_string(),
            });
        }

        if repeat_timeout.is_zero() {
            return Err(ConfigError::InvalidParameter {
                param_name: "repeat_timeout",
                reason: "cannot be zero; use a small non-zero duration to effectively disable back-off".to_string(),
            });
        }

        if buffer_size == 0 {
            return Err(ConfigError::InvalidParameter {
                param_name: "buffer_size",
                reason: "cannot be zero".to_string(),
            });
        }

        Ok(SpoolConfig {
            storage_dir: self.storage_dir,
            repeat_number,
            chunk_lifetime,
            repeat_timeout,
            buffer_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = SpoolConfigBuilder::from_path("/tmp/spool-test")
            .build()
            .expect("defaults must validate");
        assert_eq!(config.repeat_number, DEFAULT_REPEAT_NUMBER);
        assert_eq!(config.buffer_size, DEFAULT_BUFFER_SIZE);
    }

    #[test]
    fn rejects_zero_repeat_number() {
        let err = SpoolConfigBuilder::from_path("/tmp/spool-test")
            .repeat_number(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { param_name, .. } if param_name == "repeat_number"));
    }

    #[test]
    fn rejects_zero_chunk_lifetime() {
        let err = SpoolConfigBuilder::from_path("/tmp/spool-test")
            .chunk_lifetime(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { param_name, .. } if param_name == "chunk_lifetime"));
    }

    #[test]
    fn rejects_zero_buffer_size() {
        let err = SpoolConfigBuilder::from_path("/tmp/spool-test")
            .buffer_size(0)
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidParameter { param_name, .. } if param_name == "buffer_size"));
    }
}
