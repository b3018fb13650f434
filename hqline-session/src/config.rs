use std::time::Duration;

use crate::settings::HqSettings;

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// SETTINGS we announce to the peer.
    pub egress_settings: HqSettings,
    /// Enable data-expired/data-rejected handling on request streams.
    pub partial_reliability: bool,
    /// Read events serviced per loop iteration; excess events are skipped
    /// and re-delivered by the level-triggered transport.
    pub max_reads_per_loop: u16,
    /// Connection idle timeout; fires only while no streams exist.
    pub idle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            egress_settings: HqSettings::default(),
            partial_reliability: false,
            max_reads_per_loop: 16,
            idle_timeout: Duration::from_secs(60),
        }
    }
}
