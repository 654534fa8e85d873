//! Capture lifecycle state machine.

use std::fmt;

use log::{debug, warn};

use crate::buffer::BufferPool;
use crate::error::{CameraError, Result};
use crate::traits::CameraDevice;

/// Lifecycle state of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device open.
    Closed,
    /// Device open, nothing negotiated.
    Opened,
    /// Format and buffers negotiated, not streaming.
    Configured,
    /// Device producing frames.
    Streaming,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opened => "opened",
            Self::Configured => "configured",
            Self::Streaming => "streaming",
        };
        f.write_str(name)
    }
}

/// Tracks the lifecycle and issues the stream on/off directives.
#[derive(Debug)]
pub struct CaptureState {
    state: SessionState,
}

impl Default for CaptureState {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureState {
    /// A closed session.
    pub const fn new() -> Self {
        Self {
            state: SessionState::Closed,
        }
    }

    /// Current state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether frames are being produced. No device interaction.
    pub const fn is_capturing(&self) -> bool {
        matches!(self.state, SessionState::Streaming)
    }

    /// Closed → Opened.
    pub fn mark_opened(&mut self) -> Result<()> {
        self.advance(SessionState::Closed, SessionState::Opened)
    }

    /// Opened → Configured.
    pub fn mark_configured(&mut self) -> Result<()> {
        self.advance(SessionState::Opened, SessionState::Configured)
    }

    /// Any state → Closed.
    pub fn mark_closed(&mut self) {
        self.state = SessionState::Closed;
    }

    /// Configured → Streaming.
    ///
    /// Queues every buffer and issues stream-on. On failure the driver
    /// queue is dropped again and the state stays `Configured`.
    pub fn start_capturing<D: CameraDevice>(
        &mut self,
        device: &mut D,
        pool: &mut BufferPool,
    ) -> Result<()> {
        match self.state {
            SessionState::Streaming => return Ok(()),
            SessionState::Configured => {}
            other => return Err(CameraError::InvalidState(other)),
        }

        if pool.method().is_streaming() {
            let started = pool
                .queue_all(device)
                .and_then(|()| device.stream_on());
            if let Err(err) = started {
                if let Err(off_err) = device.stream_off() {
                    debug!("stream-off after failed start: {off_err}");
                }
                pool.reclaim();
                return Err(err);
            }
        }

        self.state = SessionState::Streaming;
        debug!("capture started ({} i/o)", pool.method());
        Ok(())
    }

    /// Streaming → Configured.
    ///
    /// A rejected stream-off is logged and the session is treated as
    /// stopped anyway. No-op outside `Streaming`.
    pub fn stop_capturing<D: CameraDevice>(&mut self, device: &mut D, pool: &mut BufferPool) {
        if self.state != SessionState::Streaming {
            return;
        }

        if pool.method().is_streaming() {
            if let Err(err) = device.stream_off() {
                warn!("stream-off failed, assuming the stream is dead: {err}");
            }
            pool.reclaim();
        }

        self.state = SessionState::Configured;
        debug!("capture stopped");
    }

    fn advance(&mut self, from: SessionState, to: SessionState) -> Result<()> {
        if self.state != from {
            return Err(CameraError::InvalidState(self.state));
        }
        self.state = to;
        Ok(())
    }
}
