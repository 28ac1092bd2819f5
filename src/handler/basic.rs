//! Small line protocols used to exercise the multiplexer.

use super::{Outbox, ProtocolHandler};
use chrono::Utc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between 1900-01-01 and 1970-01-01 (RFC 868 epoch offset).
const EPOCH_1900_OFFSET: u64 = 2_208_988_800;

/// Echoes everything back until the client disconnects (RFC 862).
#[derive(Debug, Default)]
pub struct EchoHandler;

impl ProtocolHandler for EchoHandler {
    fn read(&mut self, data: &[u8], out: &mut Outbox<'_>) -> bool {
        out.append(data);
        true
    }

    fn write(&mut self, _out: &mut Outbox<'_>) -> bool {
        true
    }

    fn close(&mut self) {}
}

/// Writes a human readable date, then closes (RFC 867).
#[derive(Debug, Default)]
pub struct DaytimeHandler;

impl DaytimeHandler {
    /// E.g. `Tuesday, February 22, 1982 17:37:43-UTC`
    pub fn now() -> String {
        Utc::now().format("%A, %B %-d, %Y %-H:%M:%S-%Z").to_string()
    }
}

impl ProtocolHandler for DaytimeHandler {
    fn open(&mut self, out: &mut Outbox<'_>) -> bool {
        out.append(Self::now().as_bytes());
        out.append(b"\r\n");
        true
    }

    // Input is ignored.
    fn read(&mut self, _data: &[u8], _out: &mut Outbox<'_>) -> bool {
        true
    }

    fn write(&mut self, _out: &mut Outbox<'_>) -> bool {
        false
    }

    fn close(&mut self) {}
}

/// Writes seconds since 1900 as a big-endian u32, then closes (RFC 868).
#[derive(Debug, Default)]
pub struct TimeHandler;

impl TimeHandler {
    pub fn now() -> u32 {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        // The protocol wraps in 2036.
        (unix + EPOCH_1900_OFFSET) as u32
    }
}

impl ProtocolHandler for TimeHandler {
    fn open(&mut self, out: &mut Outbox<'_>) -> bool {
        out.append(&Self::now().to_be_bytes());
        true
    }

    fn read(&mut self, _data: &[u8], _out: &mut Outbox<'_>) -> bool {
        true
    }

    fn write(&mut self, _out: &mut Outbox<'_>) -> bool {
        false
    }

    fn close(&mut self) {}
}

/// Closes every connection without writing anything.
#[derive(Debug, Default)]
pub struct NullHandler;

impl ProtocolHandler for NullHandler {
    fn open(&mut self, _out: &mut Outbox<'_>) -> bool {
        false
    }

    fn read(&mut self, _data: &[u8], _out: &mut Outbox<'_>) -> bool {
        false
    }

    fn write(&mut self, _out: &mut Outbox<'_>) -> bool {
        false
    }

    fn close(&mut self) {}
}
