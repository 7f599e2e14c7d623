//! Advert duty cycle
//!
//! ```text
//! stopped -> starting -> started -> stopping -> stopped
//! ```
//!
//! A start brings up the GATT server and advertising with a freshly rotated
//! pseudo-address; a stop tears both down. The loop restarts after every
//! refresh period and stops immediately when the radio loses power or the
//! ability to transmit.

use crate::config::ProximityConfig;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvertLoopState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl fmt::Display for AdvertLoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdvertLoopState::Stopped => write!(f, "stopped"),
            AdvertLoopState::Starting => write!(f, "starting"),
            AdvertLoopState::Started => write!(f, "started"),
            AdvertLoopState::Stopping => write!(f, "stopping"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertCommand {
    Start,
    Stop,
}

#[derive(Debug, Clone)]
pub struct AdvertLoop {
    state: AdvertLoopState,
    entered_at: Instant,
    off_gap: Duration,
    refresh: Duration,
}

impl AdvertLoop {
    /// Starts in `stopped`; the first start waits out the off gap
    pub fn new(config: &ProximityConfig, now: Instant) -> Self {
        Self {
            state: AdvertLoopState::Stopped,
            entered_at: now,
            off_gap: Duration::from_millis(config.duty_cycle.advert_off_ms),
            refresh: Duration::from_secs(config.duty_cycle.advert_refresh_secs),
        }
    }

    pub fn state(&self) -> AdvertLoopState {
        self.state
    }

    pub fn apply_config(&mut self, config: &ProximityConfig) {
        self.off_gap = Duration::from_millis(config.duty_cycle.advert_off_ms);
        self.refresh = Duration::from_secs(config.duty_cycle.advert_refresh_secs);
    }

    fn enter(&mut self, state: AdvertLoopState, now: Instant) {
        debug!("Advert loop {} -> {}", self.state, state);
        self.state = state;
        self.entered_at = now;
    }

    /// Advance on the shared tick
    pub fn on_tick(
        &mut self,
        now: Instant,
        powered_on: bool,
        transmit_supported: bool,
    ) -> Option<AdvertCommand> {
        let elapsed = now.saturating_duration_since(self.entered_at);
        let can_advertise = powered_on && transmit_supported;

        match self.state {
            AdvertLoopState::Starting | AdvertLoopState::Started if !can_advertise => {
                info!("Advertising unavailable, stopping");
                self.enter(AdvertLoopState::Stopping, now);
                Some(AdvertCommand::Stop)
            }
            AdvertLoopState::Stopped if can_advertise && elapsed >= self.off_gap => {
                self.enter(AdvertLoopState::Starting, now);
                Some(AdvertCommand::Start)
            }
            AdvertLoopState::Started if elapsed >= self.refresh => {
                debug!("Advert refresh period reached");
                self.enter(AdvertLoopState::Stopping, now);
                Some(AdvertCommand::Stop)
            }
            _ => None,
        }
    }

    /// Start acknowledged. A failed start returns to `stopped` and waits
    /// for the next off gap.
    pub fn on_started(&mut self, success: bool, now: Instant) {
        if self.state != AdvertLoopState::Starting {
            debug!("Ignoring advert start ack in state {}", self.state);
            return;
        }
        if success {
            self.enter(AdvertLoopState::Started, now);
        } else {
            warn!("Advert start failed, retrying after off gap");
            self.enter(AdvertLoopState::Stopped, now);
        }
    }

    /// Stop acknowledged. A failed stop is still treated as stopped so the
    /// next start can recover the radio.
    pub fn on_stopped(&mut self, success: bool, now: Instant) {
        if self.state != AdvertLoopState::Stopping {
            debug!("Ignoring advert stop ack in state {}", self.state);
            return;
        }
        if !success {
            warn!("Advert stop failed");
        }
        self.enter(AdvertLoopState::Stopped, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(value: u64) -> Duration {
        Duration::from_secs(value)
    }

    #[test]
    fn test_advert_loop_cycle() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut advert = AdvertLoop::new(&config, start);

        assert_eq!(advert.on_tick(start + secs(3), true, true), None);
        assert_eq!(advert.on_tick(start + secs(4), true, true), Some(AdvertCommand::Start));
        assert_eq!(advert.state(), AdvertLoopState::Starting);
        assert_eq!(advert.on_tick(start + secs(5), true, true), None);

        advert.on_started(true, start + secs(5));
        assert_eq!(advert.state(), AdvertLoopState::Started);
        assert_eq!(advert.on_tick(start + secs(60), true, true), None);

        let refresh = start + secs(5) + secs(15 * 60);
        assert_eq!(advert.on_tick(refresh, true, true), Some(AdvertCommand::Stop));
        advert.on_stopped(true, refresh);
        assert_eq!(advert.state(), AdvertLoopState::Stopped);
        assert_eq!(advert.on_tick(refresh + secs(4), true, true), Some(AdvertCommand::Start));
    }

    #[test]
    fn test_power_loss_stops_immediately() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut advert = AdvertLoop::new(&config, start);

        advert.on_tick(start + secs(4), true, true);
        assert_eq!(advert.on_tick(start + secs(5), false, true), Some(AdvertCommand::Stop));
        advert.on_stopped(true, start + secs(5));

        // stays down while unpowered
        assert_eq!(advert.on_tick(start + secs(60), false, true), None);
    }

    #[test]
    fn test_transmit_unsupported_never_starts() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut advert = AdvertLoop::new(&config, start);
        assert_eq!(advert.on_tick(start + secs(60), true, false), None);

        advert.on_tick(start + secs(61), true, true);
        advert.on_started(true, start + secs(61));
        assert_eq!(advert.on_tick(start + secs(62), true, false), Some(AdvertCommand::Stop));
    }

    #[test]
    fn test_failed_start_waits_for_gap() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut advert = AdvertLoop::new(&config, start);

        advert.on_tick(start + secs(4), true, true);
        advert.on_started(false, start + secs(5));
        assert_eq!(advert.state(), AdvertLoopState::Stopped);
        assert_eq!(advert.on_tick(start + secs(8), true, true), None);
        assert_eq!(advert.on_tick(start + secs(9), true, true), Some(AdvertCommand::Start));
    }

    #[test]
    fn test_stray_acks_ignored() {
        let config = ProximityConfig::default();
        let start = Instant::now();
        let mut advert = AdvertLoop::new(&config, start);
        advert.on_started(true, start);
        advert.on_stopped(true, start);
        assert_eq!(advert.state(), AdvertLoopState::Stopped);
    }
}
