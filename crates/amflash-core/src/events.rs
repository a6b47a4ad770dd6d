//! Event surface for UI decoupling.
//!
//! The dispatcher and the flashers report progress through an observer so
//! that CLI or GUI front-ends never reach into the protocol code.

use std::fmt;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Progress and outcome events emitted during a flash job.
#[derive(Debug, Clone)]
pub enum FlashEvent {
    /// Serial port open attempt.
    Opening { attempt: u32 },
    /// Write-ready handshake attempt.
    ReadyCheck { attempt: u32 },
    /// Reading the bootloader identity line.
    CheckingBootloader,
    /// Replacing an obsolete bootloader before the requested job.
    UpdatingBootloader { version: String },
    /// Asking the device to leave application mode.
    SwitchingMode,
    /// Erasing the user-data region.
    ClearingUserData,
    /// Payload transfer progress in protocol units (blocks or bytes).
    Flashing { current: usize, total: usize },
    /// Device reset issued; waiting up to `timeout_ms` for it to come back.
    Restarting { timeout_ms: u64 },
    /// Restart wait progress, 0..=100.
    Restart { percent: u8 },
    /// Free-form progress text.
    Log { level: LogLevel, message: String },
    /// Job finished; the device-reported image CRC when one was read.
    Completed { reported_crc: Option<String> },
    /// Job failed or was cancelled.
    Aborted { reason: String },
}

impl fmt::Display for FlashEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlashEvent::Opening { attempt } => write!(f, "Opening port (attempt {attempt})"),
            FlashEvent::ReadyCheck { attempt } => write!(f, "Ready check {attempt}"),
            FlashEvent::CheckingBootloader => write!(f, "Checking bootloader"),
            FlashEvent::UpdatingBootloader { version } => {
                write!(f, "Updating bootloader {version}")
            }
            FlashEvent::SwitchingMode => write!(f, "Switching to flash mode"),
            FlashEvent::ClearingUserData => write!(f, "Clearing user data"),
            FlashEvent::Flashing { current, total } => {
                write!(f, "Flashing {current}/{total}")
            }
            FlashEvent::Restarting { timeout_ms } => {
                write!(f, "Restarting (up to {timeout_ms} ms)")
            }
            FlashEvent::Restart { percent } => write!(f, "Restarting {percent}%"),
            FlashEvent::Log { message, .. } => write!(f, "{message}"),
            FlashEvent::Completed { reported_crc } => match reported_crc {
                Some(crc) => write!(f, "Completed, device CRC {crc}"),
                None => write!(f, "Completed"),
            },
            FlashEvent::Aborted { reason } => write!(f, "Aborted: {reason}"),
        }
    }
}

/// Observer trait for receiving flash events.
///
/// Implement this in the embedding UI to receive updates.
pub trait FlashObserver: Send + Sync {
    fn on_event(&self, event: &FlashEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl FlashObserver for NullObserver {
    fn on_event(&self, _event: &FlashEvent) {}
}

/// Observer that forwards events into tracing.
pub struct TracingObserver;

impl FlashObserver for TracingObserver {
    fn on_event(&self, event: &FlashEvent) {
        match event {
            FlashEvent::Flashing { current, total } => {
                let pct = if *total > 0 { current * 100 / total } else { 0 };
                tracing::debug!(
                    current = *current,
                    total = *total,
                    progress = %format!("{pct}%"),
                    "Flashing"
                );
            }
            FlashEvent::Log { level, message } => match level {
                LogLevel::Debug => tracing::debug!("{message}"),
                LogLevel::Info => tracing::info!("{message}"),
                LogLevel::Warn => tracing::warn!("{message}"),
                LogLevel::Error => tracing::error!("{message}"),
            },
            FlashEvent::Aborted { reason } => tracing::error!(%reason, "Flash aborted"),
            other => tracing::info!("{other}"),
        }
    }
}
