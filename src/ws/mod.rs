pub mod client;
pub mod endpoint;
pub mod hub;
pub mod locks;
pub mod presence;

use std::time::Duration;

/// Deadline for a single websocket write
pub const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Read deadline, refreshed by inbound traffic
pub const PONG_WAIT: Duration = Duration::from_secs(60);

/// Protocol ping cadence, must be shorter than the read deadline
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// Cadence of the hub's stale-connection sweep
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Extra slack past the read deadline before a connection counts as stale
pub const STALE_GRACE: Duration = Duration::from_secs(10);

/// Timeout for enqueueing onto a client send buffer or the broadcast queue
pub const ENQUEUE_TIMEOUT: Duration = Duration::from_millis(100);

/// Outbound frames buffered per connection
pub const CLIENT_SEND_BUFFER: usize = 256;

/// Events buffered on each hub channel
pub const HUB_CHANNEL_BUFFER: usize = 100;

/// Broker channel every instance publishes to and subscribes on
pub const BROADCAST_CHANNEL: &str = "asset_updates";

/// Presentation color assigned when the client does not supply one
pub const DEFAULT_COLOR: &str = "#6b7280";
