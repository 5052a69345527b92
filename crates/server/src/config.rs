use std::time::Duration;

use netplay::{CongestionConfig, DEFAULT_SESSION_SIZE, DEFAULT_TICK_RATE, ScrambleSecrets};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Seats in the one managed session; the session auto-initializes when
    /// the last seat fills.
    pub session_size: u16,
    /// Frequency of the session clock thread in frames per second.
    pub tick_rate: u32,
    /// Upper bound on messages dispatched per wakeup so one chatty client
    /// cannot starve the connection sweep.
    pub max_messages_per_update: usize,
    /// How long the dispatch thread sleeps on the condition variable before
    /// running a liveness sweep anyway.
    pub sweep_interval: Duration,
    pub scramble_secrets: ScrambleSecrets,
    pub congestion: CongestionConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            session_size: DEFAULT_SESSION_SIZE,
            tick_rate: DEFAULT_TICK_RATE,
            max_messages_per_update: 64,
            sweep_interval: Duration::from_millis(250),
            scramble_secrets: ScrambleSecrets::default(),
            congestion: CongestionConfig::default(),
        }
    }
}
