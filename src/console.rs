//! Console-style helpers for handler code.
//!
//! Each helper renders its argument to one line (strings verbatim, anything
//! else as JSON) and emits it as a `tracing` event tagged with the console
//! level, so it is both printed and, inside a capture scope, buffered.  A
//! value that cannot be serialised is still printed at its level (with the
//! serialisation error as the message) but produces no captured line.

use serde::Serialize;

use crate::capture::{LEVEL_FIELD, SKIP_FIELD};
use crate::model::ConsoleLevel;

pub fn log<T: Serialize + ?Sized>(value: &T) {
    emit(ConsoleLevel::Log, value)
}

pub fn info<T: Serialize + ?Sized>(value: &T) {
    emit(ConsoleLevel::Info, value)
}

pub fn warn<T: Serialize + ?Sized>(value: &T) {
    emit(ConsoleLevel::Warn, value)
}

pub fn error<T: Serialize + ?Sized>(value: &T) {
    emit(ConsoleLevel::Error, value)
}

pub fn emit<T: Serialize + ?Sized>(level: ConsoleLevel, value: &T) {
    let tag = level.as_str();
    let line = match render(value) {
        Ok(line) => line,
        Err(err) => {
            // still printed at the requested level, never buffered
            let note = format!("<unserialisable value: {}>", err);
            match level {
                ConsoleLevel::Log | ConsoleLevel::Info => {
                    tracing::info!(console_level = tag, console_skip = true, "{}", note)
                }
                ConsoleLevel::Warn => {
                    tracing::warn!(console_level = tag, console_skip = true, "{}", note)
                }
                ConsoleLevel::Error => {
                    tracing::error!(console_level = tag, console_skip = true, "{}", note)
                }
            }
            return;
        }
    };
    match level {
        ConsoleLevel::Log | ConsoleLevel::Info => tracing::info!(console_level = tag, "{}", line),
        ConsoleLevel::Warn => tracing::warn!(console_level = tag, "{}", line),
        ConsoleLevel::Error => tracing::error!(console_level = tag, "{}", line),
    }
}

/// Render a value the way it appears in a captured line.
pub fn render<T: Serialize + ?Sized>(value: &T) -> serde_json::Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}
