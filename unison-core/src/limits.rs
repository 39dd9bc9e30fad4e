//! Protocol-wide limits and timing constants.
//!
//! Server and client must agree on these; they are part of the wire
//! contract, not tuning knobs.

use std::time::Duration;

/// Maximum serialized size of a single storage value, in bytes.
pub const MAX_VALUE_BYTES: usize = 50_000;

/// Maximum number of storage keys per room.
pub const MAX_KEYS_PER_ROOM: usize = 100;

/// Maximum participants in a client-created room.
pub const CLIENT_ROOM_MAX_SIZE: usize = 100;

/// Maximum participants in a server-created room.
pub const SERVER_ROOM_MAX_SIZE: usize = 500;

/// Length of minted client and room ids.
pub const ID_LEN: usize = 6;

/// Heartbeat interval; also the minimum age before an operation becomes
/// eligible for log compaction.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Transport-level ping cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

/// How long a dropped client may reclaim its id via `reconnect`.
pub const RECONNECT_GRACE: Duration = Duration::from_secs(5);

/// Client-side reconnection attempts before giving up.
pub const RECONNECT_ATTEMPTS: u32 = 9;

/// Delay between client-side reconnection attempts.
pub const RECONNECT_DELAY: Duration = Duration::from_millis(500);

/// Client-side timeout for a single request round trip.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Default rate-limit bucket capacity per connection.
pub const RATE_LIMIT_CAPACITY: u32 = 20;

/// Rate-limit buckets refill to capacity this often.
pub const RATE_LIMIT_REFILL: Duration = Duration::from_secs(1);

/// Token cost of a `create_room` frame; everything else costs 1.
pub const CREATE_ROOM_COST: u32 = 5;

/// Vector clocks are truncated once they exceed this many entries.
pub const MAX_CLOCK_ENTRIES: usize = 1_000;

/// Entries kept (newest by insertion) after a clock truncation.
pub const CLOCK_KEEP_ENTRIES: usize = 100;

/// A key's operation log is only considered for compaction at this length.
pub const GC_MIN_OPS: usize = 5;

/// Minimum interval between compaction passes on one engine.
pub const GC_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Attempts when minting a fresh id before giving up.
pub const ID_MINT_ATTEMPTS: usize = 50;
