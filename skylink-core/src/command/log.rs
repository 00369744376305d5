//! Process-wide command logging filter
//!
//! The level is read on every sent and received command, so it is kept in an
//! atomic. The set of "frequent" commands (sent many times per second, such
//! as piloting) is installed once during initialization and read-only after.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use super::{Command, CommandId};
use crate::device::DeviceHandle;

/// Which commands get logged
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CommandLogLevel {
    /// Log nothing
    None = 0,
    /// Log acknowledged commands, except frequent ones
    #[default]
    AckOnlyWithoutFrequent = 1,
    /// Log all acknowledged commands
    AckOnly = 2,
    /// Log every command
    All = 3,
}

impl CommandLogLevel {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => CommandLogLevel::None,
            2 => CommandLogLevel::AckOnly,
            3 => CommandLogLevel::All,
            _ => CommandLogLevel::AckOnlyWithoutFrequent,
        }
    }
}

/// Direction of a logged command
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Direction {
    Sent,
    Received,
}

static LEVEL: AtomicU8 = AtomicU8::new(CommandLogLevel::AckOnlyWithoutFrequent as u8);
static FREQUENT: OnceLock<HashSet<CommandId>> = OnceLock::new();

/// Set the process-wide level
pub fn set_level(level: CommandLogLevel) {
    LEVEL.store(level as u8, Ordering::Relaxed);
}

/// Current process-wide level
pub fn level() -> CommandLogLevel {
    CommandLogLevel::from_u8(LEVEL.load(Ordering::Relaxed))
}

/// Install the set of frequent commands
///
/// Returns `false` if a set was already installed; the first one is kept.
pub fn init_frequent_commands(ids: impl IntoIterator<Item = CommandId>) -> bool {
    FREQUENT.set(ids.into_iter().collect()).is_ok()
}

/// Whether `id` was installed as a frequent command
pub fn is_frequent(id: CommandId) -> bool {
    FREQUENT.get().is_some_and(|set| set.contains(&id))
}

/// Whether a command passes the filter at `level`
pub fn passes(level: CommandLogLevel, acknowledged: bool, frequent: bool) -> bool {
    match level {
        CommandLogLevel::None => false,
        CommandLogLevel::All => true,
        CommandLogLevel::AckOnly => acknowledged,
        CommandLogLevel::AckOnlyWithoutFrequent => acknowledged && !frequent,
    }
}

/// Whether `command` passes the process-wide filter
pub fn should_log(command: &Command) -> bool {
    passes(level(), command.is_acknowledged(), is_frequent(command.id))
}

/// Log a command if it passes the process-wide filter
pub fn log_command(direction: Direction, handle: DeviceHandle, command: &Command) {
    if !should_log(command) {
        return;
    }
    match direction {
        Direction::Sent => tracing::debug!(
            "{} << {} ({:?}, {} bytes)",
            handle,
            command.id,
            command.buffer,
            command.payload.len()
        ),
        Direction::Received => tracing::debug!(
            "{} >> {} ({:?}, {} bytes)",
            handle,
            command.id,
            command.buffer,
            command.payload.len()
        ),
    }
}
