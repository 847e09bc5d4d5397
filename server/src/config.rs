use shared::{Tick, CLIENT_RATE, MAX_PING_MS, SERVER_RATE};
use std::time::Duration;

/// Server tuning knobs
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_peers: usize,
    /// Silence after which a peer is dropped
    pub peer_timeout: Duration,
    /// Controls applied per second
    pub client_rate: u8,
    /// Snapshots sent per second
    pub server_rate: u8,
    /// Oldest perceived world state shots are judged against
    pub max_ping: Duration,
    pub bulk_port_first: u16,
    pub bulk_port_count: u16,
    /// How long a bulk channel waits for its peer to connect, then between writes
    pub bulk_timeout: Duration,
    /// Scripted players spawned at startup
    pub bots: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8890,
            max_peers: 50,
            peer_timeout: Duration::from_millis(5000),
            client_rate: CLIENT_RATE,
            server_rate: SERVER_RATE,
            max_ping: Duration::from_millis(MAX_PING_MS),
            bulk_port_first: 62000,
            bulk_port_count: 256,
            bulk_timeout: Duration::from_millis(5000),
            bots: 0,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn input_period(&self) -> Duration {
        Duration::from_secs(1) / self.client_rate.max(1) as u32
    }

    pub fn snapshot_period(&self) -> Duration {
        Duration::from_secs(1) / self.server_rate.max(1) as u32
    }

    /// Snapshot retention in input ticks, rounded up
    pub fn retention_ticks(&self) -> Tick {
        let period = self.input_period().as_nanos().max(1);
        let ticks = (self.max_ping.as_nanos() + period - 1) / period;
        ticks.min(Tick::MAX as u128) as Tick
    }
}
