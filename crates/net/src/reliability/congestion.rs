use log::warn;

const MIN_RESET_CONGESTED_TIME: f32 = 1.0;
const MAX_RESET_CONGESTED_TIME: f32 = 60.0;

#[derive(Debug, Clone, Copy)]
pub struct CongestionConfig {
    /// Average round trip (seconds) above which the connection counts as
    /// congested.
    pub congested_rtt_threshold: f32,
    /// Seconds of accumulated good time required before the congested flag
    /// clears again. Clamped to [1, 60].
    pub reset_congested_time: f32,
}

impl Default for CongestionConfig {
    fn default() -> Self {
        Self {
            congested_rtt_threshold: 250.0 / 1000.0,
            reset_congested_time: 10.0,
        }
    }
}

/// Hysteresis over the smoothed round trip: one bad sample sets the flag,
/// but only a sustained quiet period clears it. Detection only, no rate
/// shaping.
#[derive(Debug)]
pub struct CongestionContext {
    config: CongestionConfig,
    is_congested: bool,
    time_not_congested: f32,
}

impl Default for CongestionContext {
    fn default() -> Self {
        Self::new(CongestionConfig::default())
    }
}

impl CongestionContext {
    pub fn new(mut config: CongestionConfig) -> Self {
        config.reset_congested_time = config
            .reset_congested_time
            .clamp(MIN_RESET_CONGESTED_TIME, MAX_RESET_CONGESTED_TIME);
        Self {
            config,
            is_congested: false,
            time_not_congested: 0.0,
        }
    }

    /// Called every tick. Returns `Some(false)` when the flag clears.
    pub fn on_update(&mut self, delta_time: f32, average_round_trip: f32) -> Option<bool> {
        if average_round_trip < self.config.congested_rtt_threshold {
            self.time_not_congested += delta_time;
        }

        if self.is_congested && self.time_not_congested > self.config.reset_congested_time {
            warn!("connection is no longer congested");
            self.is_congested = false;
            return Some(false);
        }
        None
    }

    /// Called whenever the round-trip average changes. Returns `Some(true)`
    /// when the flag sets.
    pub fn on_round_trip_change(&mut self, average_round_trip: f32) -> Option<bool> {
        if average_round_trip > self.config.congested_rtt_threshold {
            self.time_not_congested = 0.0;

            if !self.is_congested {
                warn!("connection is now congested");
                self.is_congested = true;
                return Some(true);
            }
        }
        None
    }

    pub fn is_congested(&self) -> bool {
        self.is_congested
    }
}
