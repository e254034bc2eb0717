//! Connection configuration

use std::time::Duration;

use crate::error::{Error, Result};

/// Slic multiplexing configuration
#[derive(Debug, Clone)]
pub struct SlicOptions {
    /// Supported Slic versions, most preferred first
    pub versions: Vec<u64>,

    /// Application protocol carried over Slic
    pub application_protocol: String,

    /// Incoming bidirectional streams the peer may keep open at once
    pub max_bidirectional_streams: u64,

    /// Incoming unidirectional streams the peer may keep open at once
    pub max_unidirectional_streams: u64,

    /// Largest payload we want in a single stream frame
    pub packet_max_size: u64,

    /// Largest frame accepted from the peer
    pub max_frame_size: usize,
}

impl Default for SlicOptions {
    fn default() -> Self {
        Self {
            versions: vec![1],
            application_protocol: "ice2".to_string(),
            max_bidirectional_streams: 100,
            max_unidirectional_streams: 100,
            packet_max_size: 32 * 1024,      // 32 KiB
            max_frame_size: 1024 * 1024,     // 1 MiB
        }
    }
}

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Idle timeout offered during the handshake; the lower of both sides wins
    pub idle_timeout: Duration,

    /// Send pings while idle even when nothing is being dispatched
    pub keep_alive: bool,

    /// Time allowed for a graceful close before the connection is aborted
    pub close_timeout: Duration,

    /// Time allowed for the Slic and control stream handshakes
    pub connect_timeout: Duration,

    /// Dispatch one incoming request at a time
    pub serialize_dispatch: bool,

    /// Largest request or response frame accepted
    pub max_message_size: usize,

    /// Runtime to spawn dispatches on instead of the current one
    pub dispatch_runtime: Option<tokio::runtime::Handle>,

    /// Slic configuration
    pub slic: SlicOptions,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            keep_alive: false,
            close_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            serialize_dispatch: false,
            max_message_size: 16 * 1024 * 1024, // 16 MiB
            dispatch_runtime: None,
            slic: SlicOptions::default(),
        }
    }
}

impl ConnectionOptions {
    /// Incoming stream limits advertised to the peer
    #[must_use]
    pub fn incoming_limits(&self) -> (u64, u64) {
        if self.serialize_dispatch {
            (1, 1)
        } else {
            (
                self.slic.max_bidirectional_streams,
                self.slic.max_unidirectional_streams,
            )
        }
    }

    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns `Error::InvalidConfig` on zero limits, zero timeouts or an
    /// empty version list
    pub fn validate(&self) -> Result<()> {
        if self.idle_timeout.is_zero() {
            return Err(Error::InvalidConfig("idle_timeout must be non-zero".into()));
        }
        if self.close_timeout.is_zero() {
            return Err(Error::InvalidConfig("close_timeout must be non-zero".into()));
        }
        if self.connect_timeout.is_zero() {
            return Err(Error::InvalidConfig("connect_timeout must be non-zero".into()));
        }
        if self.max_message_size == 0 {
            return Err(Error::InvalidConfig("max_message_size must be non-zero".into()));
        }
        let slic = &self.slic;
        if slic.versions.is_empty() {
            return Err(Error::InvalidConfig("at least one Slic version is required".into()));
        }
        if slic.application_protocol.is_empty() {
            return Err(Error::InvalidConfig("application_protocol must not be empty".into()));
        }
        if slic.max_bidirectional_streams == 0 || slic.max_unidirectional_streams == 0 {
            return Err(Error::InvalidConfig("stream limits must be non-zero".into()));
        }
        if slic.packet_max_size == 0 || slic.max_frame_size == 0 {
            return Err(Error::InvalidConfig("frame sizes must be non-zero".into()));
        }
        if slic.packet_max_size > slic.max_frame_size as u64 {
            return Err(Error::InvalidConfig(
                "packet_max_size must not exceed max_frame_size".into(),
            ));
        }
        Ok(())
    }
}
