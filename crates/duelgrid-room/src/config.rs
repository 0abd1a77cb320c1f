//! Room layer tuning.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RoomConfig {
    /// Period of the expired-room janitor and the crash watch.
    pub cleanup_interval: Duration,
    /// How long an ended room lingers so clients can process the close
    /// event before state disappears.
    pub ended_linger: Duration,
    /// A room still waiting for players after this long is abandoned
    /// setup debris and gets reaped.
    pub waiting_max_age: Duration,
    /// An active room idle this long is presumed leaked.
    pub active_max_age: Duration,
}

impl Default for RoomConfig {
    fn default() -> Self {
        Self {
            cleanup_interval: Duration::from_secs(60),
            ended_linger: Duration::from_secs(10),
            waiting_max_age: Duration::from_secs(10 * 60),
            active_max_age: Duration::from_secs(4 * 60 * 60),
        }
    }
}
