//! Framework constants shared by both ends of a channel.

use std::time::Duration;

/// Frame sequence numbers count modulo this (4 hex digits on the wire).
pub const SEQ_MODULUS: u32 = 0x10000;

/// Minimum spacing between reset requests for the same type.
pub const RESET_THROTTLE: Duration = Duration::from_secs(180);

/// Default bound for per-type event queues and resetter buffers.
pub const DEFAULT_QUEUE_CAPACITY: usize = 200_000;

/// Default reset streaming rate, items per minute.
pub const DEFAULT_RESET_RATE: u32 = 30_000;

/// Unacknowledged lossless frames are retained no longer than this.
pub const LOSSLESS_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

/// Default resend sweep period for unacknowledged lossless frames.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Emit an empty keep-alive line after this much output silence.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Default ping cadence on the channel monitor.
pub const DEFAULT_PING_RATE: Duration = Duration::from_secs(60);

/// Re-issue the login if no answer arrives within this window.
pub const LOGIN_RETRY: Duration = Duration::from_secs(30);

/// Disconnect a peer that never completes the login handshake.
pub const LOGIN_OBSOLESCENCE: Duration = Duration::from_secs(300);

/// A type code carrying this suffix in a consume declaration subscribes
/// losslessly.
pub const LOSSLESS_SUFFIX: char = '+';

/// In-band byte that marks the switch to the gzip stream.
pub const COMPRESS_SENTINEL: u8 = 0x00;

/// Framework core version, exchanged in the login handshake.
pub const CORE_VERSION: &str = env!("CARGO_PKG_VERSION");
