//! Flight command state machine.
//!
//! Turns coordinator directives and timer/proximity ticks into mode changes
//! and position setpoints on the vehicle link. Conceptually the vehicle is
//! `Idle`, `Holding` or `Navigating`; the fields of [`FlightCommandState`]
//! carry the detail.

use anyhow::Result;
use relay_fc::VehicleLink;
use relay_proto::command::{CommandType, Waypoint};
use relay_proto::telemetry::TelemetryState;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::geo::haversine_m;

/// Holding-capable modes, most preferred first.
pub const HOLD_MODES: &[&str] = &["LOITER", "HOLD", "POSHOLD", "BRAKE", "ALT_HOLD"];

/// Modes that accept external position setpoints, most preferred first.
pub const NAV_MODES: &[&str] = &["GUIDED", "OFFBOARD", "AUTO"];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Target {
    pub lat: f64,
    pub lon: f64,
    pub altitude_m: f64,
}

impl From<Waypoint> for Target {
    fn from(w: Waypoint) -> Self {
        Self { lat: w.lat, lon: w.lon, altitude_m: w.altitude_m }
    }
}

impl Target {
    fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && self.altitude_m.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Holding,
    Navigating,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FlightCommandState {
    /// Last mode reported by the vehicle.
    pub current_mode: Option<String>,
    /// Mode to restore after a hold; captured once per hold cycle.
    pub previous_mode: Option<String>,
    pub hold_until: Option<Instant>,
    pub active_target: Option<Target>,
    /// Waypoints still to visit after `active_target`.
    pub reroute_queue: VecDeque<Target>,
}

impl FlightCommandState {
    pub fn holding(&self) -> bool {
        self.hold_until.is_some()
    }

    pub fn phase(&self) -> Phase {
        if self.holding() {
            Phase::Holding
        } else if self.active_target.is_some() {
            Phase::Navigating
        } else {
            Phase::Idle
        }
    }
}

/// Result of applying one directive. Only `Handled` is acknowledged.
#[derive(Debug)]
pub enum DirectiveOutcome {
    Handled,
    NotHandled(String),
    Failed(anyhow::Error),
}

impl DirectiveOutcome {
    pub fn is_handled(&self) -> bool {
        matches!(self, DirectiveOutcome::Handled)
    }

    fn not_handled(reason: impl Into<String>) -> Self {
        DirectiveOutcome::NotHandled(reason.into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Proximity {
    /// Nothing to steer to (no target, holding, or no position).
    Idle,
    EnRoute { distance_m: f64 },
    /// Reached a waypoint and moved on to the next one.
    Advanced { distance_m: f64 },
    /// Reached the last waypoint.
    Arrived { distance_m: f64 },
}

pub struct FlightCommandMachine {
    state: FlightCommandState,
    arrival_threshold_m: f64,
}

impl FlightCommandMachine {
    pub fn new(arrival_threshold_m: f64) -> Self {
        Self { state: FlightCommandState::default(), arrival_threshold_m }
    }

    pub fn state(&self) -> &FlightCommandState {
        &self.state
    }

    /// Mirrors the mode reported by the vehicle heartbeat.
    pub fn set_current_mode(&mut self, mode: String) {
        if self.state.current_mode.as_deref() != Some(mode.as_str()) {
            info!("nav: vehicle mode {}", mode);
            self.state.current_mode = Some(mode);
        }
    }

    /// Applies a directive. Errors never escape; they come back as `Failed`.
    pub fn dispatch<L: VehicleLink>(
        &mut self,
        directive: &CommandType,
        telemetry: &TelemetryState,
        link: &mut L,
        now: Instant,
    ) -> DirectiveOutcome {
        let kind = directive.kind();
        let res = match directive {
            CommandType::Hold { duration_secs } => self.hold(*duration_secs, link, now),
            CommandType::Resume => self.resume(link),
            CommandType::AltitudeChange { target_altitude_m } => {
                self.altitude_change(*target_altitude_m, telemetry, link)
            }
            CommandType::Reroute { waypoints, reason } => {
                self.reroute(waypoints, reason.as_deref(), link)
            }
            CommandType::Unsupported => Ok(DirectiveOutcome::not_handled("unsupported directive")),
        };
        match res {
            Ok(DirectiveOutcome::NotHandled(reason)) => {
                warn!("nav: {} not handled: {}", kind, reason);
                DirectiveOutcome::NotHandled(reason)
            }
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("nav: {} failed: {:#}", kind, e);
                DirectiveOutcome::Failed(e)
            }
        }
    }

    fn hold<L: VehicleLink>(&mut self, duration_secs: f64, link: &mut L, now: Instant) -> Result<DirectiveOutcome> {
        let secs = if duration_secs.is_nan() { 0.0 } else { duration_secs.max(0.0) };
        let until = Duration::try_from_secs_f64(secs)
            .ok()
            .and_then(|d| now.checked_add(d))
            .ok_or_else(|| anyhow::anyhow!("hold duration out of range: {}", duration_secs))?;

        let pre_hold = self.state.current_mode.clone();
        let Some(mode) = link.set_mode(HOLD_MODES)? else {
            return Ok(DirectiveOutcome::not_handled("no holding mode in vehicle mode table"));
        };

        if !self.state.holding() && self.state.previous_mode.is_none() {
            self.state.previous_mode = pre_hold;
        }
        self.state.hold_until = Some(until);
        info!(
            "nav: HOLD {:.0}s in {} (restore {:?})",
            secs, mode, self.state.previous_mode
        );
        Ok(DirectiveOutcome::Handled)
    }

    fn resume<L: VehicleLink>(&mut self, link: &mut L) -> Result<DirectiveOutcome> {
        self.state.hold_until = None;
        if let Some(prev) = self.state.previous_mode.take() {
            match link.set_mode(&[prev.as_str()])? {
                Some(m) => info!("nav: RESUME -> {}", m),
                None => warn!("nav: RESUME: previous mode {} not available", prev),
            }
        } else if self.state.active_target.is_some() {
            if let Some(m) = link.set_mode(NAV_MODES)? {
                info!("nav: RESUME -> {} (navigation)", m);
            }
        } else {
            info!("nav: RESUME with nothing to restore");
        }
        Ok(DirectiveOutcome::Handled)
    }

    fn altitude_change<L: VehicleLink>(
        &mut self,
        target_altitude_m: f64,
        telemetry: &TelemetryState,
        link: &mut L,
    ) -> Result<DirectiveOutcome> {
        let Some((lat, lon, _)) = telemetry.position() else {
            return Ok(DirectiveOutcome::not_handled("telemetry not ready"));
        };
        let target = Target { lat, lon, altitude_m: target_altitude_m };
        if !target.is_valid() {
            return Ok(DirectiveOutcome::not_handled(format!("invalid altitude {}", target_altitude_m)));
        }
        if !self.engage_navigation(link)? {
            return Ok(DirectiveOutcome::not_handled("no navigation mode in vehicle mode table"));
        }
        self.state.active_target = Some(target);
        self.state.reroute_queue.clear();
        info!("nav: ALTITUDE_CHANGE -> {:.1}m in place", target_altitude_m);
        Ok(DirectiveOutcome::Handled)
    }

    fn reroute<L: VehicleLink>(
        &mut self,
        waypoints: &[Waypoint],
        reason: Option<&str>,
        link: &mut L,
    ) -> Result<DirectiveOutcome> {
        let mut queue: VecDeque<Target> = waypoints.iter().copied().map(Target::from).collect();
        if queue.iter().any(|t| !t.is_valid()) {
            return Ok(DirectiveOutcome::not_handled("invalid waypoint"));
        }
        let Some(first) = queue.pop_front() else {
            return Ok(DirectiveOutcome::not_handled("empty waypoint list"));
        };
        if !self.engage_navigation(link)? {
            return Ok(DirectiveOutcome::not_handled("no navigation mode in vehicle mode table"));
        }
        self.state.active_target = Some(first);
        self.state.reroute_queue = queue;
        info!(
            "nav: REROUTE {} waypoint(s){}",
            waypoints.len(),
            reason.map(|r| format!(" ({})", r)).unwrap_or_default()
        );
        Ok(DirectiveOutcome::Handled)
    }

    /// Commands a navigation mode unless a hold is active; the hold keeps
    /// precedence and expiry switches to navigation later.
    fn engage_navigation<L: VehicleLink>(&mut self, link: &mut L) -> Result<bool> {
        if self.state.holding() {
            info!("nav: hold active, navigation deferred");
            return Ok(true);
        }
        Ok(link.set_mode(NAV_MODES)?.is_some())
    }

    /// Ends an expired hold. Returns true if a hold ended on this tick.
    pub fn tick_hold_expiry<L: VehicleLink>(&mut self, link: &mut L, now: Instant) -> bool {
        match self.state.hold_until {
            Some(until) if now >= until => {}
            _ => return false,
        }
        self.state.hold_until = None;
        let prev = self.state.previous_mode.take();

        let res = if self.state.active_target.is_some() {
            link.set_mode(NAV_MODES)
        } else if let Some(p) = prev.as_deref() {
            link.set_mode(&[p])
        } else {
            Ok(None)
        };
        match res {
            Ok(Some(m)) => info!("nav: hold expired -> {}", m),
            Ok(None) => info!("nav: hold expired, no mode to restore"),
            Err(e) => warn!("nav: hold expired but mode change failed: {:#}", e),
        }
        true
    }

    /// Steers toward the active target and advances on arrival.
    pub fn tick_proximity<L: VehicleLink>(&mut self, telemetry: &TelemetryState, link: &mut L) -> Proximity {
        if self.state.holding() {
            return Proximity::Idle;
        }
        let (Some(target), Some((lat, lon, _))) = (self.state.active_target, telemetry.position()) else {
            return Proximity::Idle;
        };

        if let Err(e) = link.send_position_target(target.lat, target.lon, target.altitude_m) {
            warn!("nav: setpoint failed: {:#}", e);
        }

        let distance_m = haversine_m(lat, lon, target.lat, target.lon);
        if distance_m > self.arrival_threshold_m {
            return Proximity::EnRoute { distance_m };
        }

        match self.state.reroute_queue.pop_front() {
            Some(next) => {
                info!(
                    "nav: waypoint reached ({:.1}m), next {:.6},{:.6} ({} left)",
                    distance_m,
                    next.lat,
                    next.lon,
                    self.state.reroute_queue.len()
                );
                self.state.active_target = Some(next);
                Proximity::Advanced { distance_m }
            }
            None => {
                info!("nav: final waypoint reached ({:.1}m), navigation complete", distance_m);
                self.state.active_target = None;
                Proximity::Arrived { distance_m }
            }
        }
    }
}
