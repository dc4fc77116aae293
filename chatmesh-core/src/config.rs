//! Node configuration.

use std::time::Duration;

use crate::registry::DEFAULT_PUSH_TIMEOUT;

/// Chat node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the listener binds to
    pub bind_addr: String,
    /// Address other nodes reach this node at (`ws://host:port`).
    /// Published in the presence directory; `None` derives it from the
    /// bound socket, or from the hostname when bound to a wildcard IP.
    pub advertise_addr: Option<String>,
    /// Messages buffered per connection before `push` waits
    pub outbound_capacity: usize,
    /// A client whose socket takes longer than this to accept a pushed
    /// message is disconnected
    pub push_timeout: Duration,
    /// Push unread messages to a user right after their handshake
    pub replay_backlog: bool,
    /// Remove the presence record when a user disconnects
    pub retract_on_disconnect: bool,
    /// Close identified connections that stay silent this long
    pub idle_timeout: Option<Duration>,
    /// Upper bound on opening a relay link
    pub relay_connect_timeout: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            advertise_addr: None,
            outbound_capacity: 64,
            push_timeout: DEFAULT_PUSH_TIMEOUT,
            replay_backlog: true,
            retract_on_disconnect: true,
            idle_timeout: None,
            relay_connect_timeout: Duration::from_secs(5),
        }
    }
}

impl NodeConfig {
    /// Loopback listener on an ephemeral port.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            outbound_capacity: 16,
            push_timeout: Duration::from_secs(1),
            relay_connect_timeout: Duration::from_secs(2),
            ..Self::default()
        }
    }
}
