//! Liveness reports sent from workers to the supervisor.
//!
//! ## Wire Format
//!
//! ```text
//! ┌──────────┬──────┬───────────────┬──────────┐
//! │ worker   │ flag │ timestamp     │ open     │
//! │ u32 BE   │ u8   │ u64 BE        │ u32 BE   │
//! └──────────┴──────┴───────────────┴──────────┘
//!   flag 1: timestamp present, flag 0: shutdown sentinel
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::{SystemTime, UNIX_EPOCH};

/// Encoded size of one heartbeat.
pub const HEARTBEAT_SIZE: usize = 17;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat truncated: {0} bytes")]
    Truncated(usize),

    #[error("invalid heartbeat flag: {0}")]
    InvalidFlag(u8),
}

/// One report from a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub worker: u32,
    /// Unix seconds when sent; None marks the worker's last message
    pub timestamp: Option<u64>,
    /// Connections open in the worker
    pub open: u32,
}

impl Heartbeat {
    /// A regular report stamped with the current time.
    pub fn alive(worker: u32, open: u32) -> Self {
        Self {
            worker,
            timestamp: Some(unix_now()),
            open,
        }
    }

    /// The report a worker sends on its way out.
    pub fn sentinel(worker: u32, open: u32) -> Self {
        Self {
            worker,
            timestamp: None,
            open,
        }
    }

    pub fn is_sentinel(&self) -> bool {
        self.timestamp.is_none()
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEARTBEAT_SIZE);
        buf.put_u32(self.worker);
        match self.timestamp {
            Some(ts) => {
                buf.put_u8(1);
                buf.put_u64(ts);
            }
            None => {
                buf.put_u8(0);
                buf.put_u64(0);
            }
        }
        buf.put_u32(self.open);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, HeartbeatError> {
        if data.len() < HEARTBEAT_SIZE {
            return Err(HeartbeatError::Truncated(data.len()));
        }
        let worker = data.get_u32();
        let flag = data.get_u8();
        let ts = data.get_u64();
        let open = data.get_u32();
        let timestamp = match flag {
            0 => None,
            1 => Some(ts),
            other => return Err(HeartbeatError::InvalidFlag(other)),
        };
        Ok(Self {
            worker,
            timestamp,
            open,
        })
    }
}

/// Seconds since the Unix epoch.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
