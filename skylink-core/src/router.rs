//! Command dispatch between callers, sessions and backends

use std::fmt;

use bytes::Bytes;

use crate::backend::BackendController;
use crate::command::log::{self, Direction};
use crate::command::{BufferType, Command, CommandEncoder};
use crate::session::DeviceSession;

/// Counters of the command router
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Commands handed to a backend
    pub sent: u64,
    /// Commands decoded and delivered to listeners
    pub received: u64,
    /// Sends or receptions ignored because the device was not connected
    pub dropped: u64,
    pub encode_errors: u64,
    pub send_errors: u64,
    pub decode_errors: u64,
}

impl fmt::Display for RouterStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Command Router Stats:")?;
        writeln!(f, "  Sent: {}", self.sent)?;
        writeln!(f, "  Received: {}", self.received)?;
        writeln!(f, "  Dropped: {}", self.dropped)?;
        writeln!(f, "  Encode errors: {}", self.encode_errors)?;
        writeln!(f, "  Send errors: {}", self.send_errors)?;
        writeln!(f, "  Decode errors: {}", self.decode_errors)?;
        Ok(())
    }
}

/// Routes outgoing commands to backends and incoming commands to listeners
///
/// Lives on the controller event loop; both directions require the session
/// to be connected and are otherwise silent no-ops.
#[derive(Debug, Default)]
pub struct CommandRouter {
    stats: RouterStats,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Encode a command and transmit it through `backend`
    pub fn send(
        &mut self,
        session: &DeviceSession,
        backend: &dyn BackendController,
        encoder: CommandEncoder,
    ) -> bool {
        let handle = session.handle();
        if !session.is_connected() {
            tracing::warn!("Dropping command for {}: session is {}", handle, session.state());
            self.stats.dropped += 1;
            return false;
        }

        let mut command = Command::empty();
        if let Err(e) = encoder(&mut command).and_then(|()| command.validate()) {
            tracing::warn!("Failed to encode command for {}: {}", handle, e);
            self.stats.encode_errors += 1;
            return false;
        }

        log::log_command(Direction::Sent, handle, &command);
        match backend.send(handle, command) {
            Ok(()) => {
                self.stats.sent += 1;
                true
            }
            Err(e) => {
                tracing::warn!("Failed to send command to {}: {}", handle, e);
                self.stats.send_errors += 1;
                false
            }
        }
    }

    /// Decode received bytes and deliver the command
    ///
    /// The device listener sees the command first, then every command
    /// listener in registration order. The listener list is snapshotted
    /// before delivery; a listener removed during delivery, even by an
    /// earlier listener, is skipped.
    pub fn dispatch(&mut self, session: &mut DeviceSession, buffer: BufferType, raw: Bytes) -> bool {
        let handle = session.handle();
        if !session.is_connected() {
            tracing::debug!("Dropping received command from {}: session is {}", handle, session.state());
            self.stats.dropped += 1;
            return false;
        }

        let command = match Command::decode(buffer, raw) {
            Ok(command) => command,
            Err(e) => {
                tracing::warn!("Failed to decode command from {}: {}", handle, e);
                self.stats.decode_errors += 1;
                return false;
            }
        };

        log::log_command(Direction::Received, handle, &command);
        self.stats.received += 1;

        if let Some(listener) = session.device_listener() {
            listener.on_command_received(&command);
        }
        for registration in session.command_listeners() {
            registration.deliver(handle, &command);
        }
        true
    }
}
