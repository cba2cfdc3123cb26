//! The main relay loop.
//!
//! One task owns the vehicle link, the coordinator client, the command
//! machine and the telemetry snapshot. Each iteration runs the same fixed
//! order: receive, hold expiry, poll/dispatch/ack, proximity, send.

use mavlink::common::MavMessage;
use mavlink::MavHeader;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use relay_fc::state::{self, TelemetryState};
use relay_fc::VehicleLink;
use relay_nav::machine::{DirectiveOutcome, FlightCommandMachine};
use relay_nav::NavConfig;
use relay_uplink::transport::HttpTransport;
use relay_uplink::CoordinatorClient;

use crate::config::TimingCfg;

/// Upper bound on one receive so timers keep being serviced.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(1);

pub struct Gateway<L, T> {
    link: L,
    client: CoordinatorClient<T>,
    machine: FlightCommandMachine,
    telemetry: TelemetryState,
    send_interval: Duration,
    poll_interval: Duration,
    cooldown: Duration,
    next_send: Instant,
    next_poll: Instant,
}

impl<L: VehicleLink, T: HttpTransport> Gateway<L, T> {
    pub fn new(link: L, client: CoordinatorClient<T>, nav: &NavConfig, timing: &TimingCfg) -> Self {
        let now = Instant::now();
        Self {
            link,
            client,
            machine: FlightCommandMachine::new(nav.arrival_threshold_m),
            telemetry: TelemetryState::default(),
            send_interval: timing.send_interval(),
            poll_interval: timing.poll_interval(),
            cooldown: timing.cooldown(),
            next_send: now,
            next_poll: now,
        }
    }

    /// Runs until the process is stopped.
    pub async fn run(&mut self) {
        info!(
            "gateway: running (send every {:?}, poll every {:?})",
            self.send_interval, self.poll_interval
        );
        loop {
            self.step().await;
        }
    }

    /// One loop iteration.
    pub async fn step(&mut self) {
        if let Some((hdr, msg)) = self.link.next_message(RECV_TIMEOUT).await {
            self.handle_message(&hdr, &msg);
        }
        self.service(Instant::now()).await;
    }

    /// Routes one inbound message into telemetry or mode mirroring.
    pub fn handle_message(&mut self, hdr: &MavHeader, msg: &MavMessage) {
        match msg {
            MavMessage::GLOBAL_POSITION_INT(m) => state::apply_global_position_int(&mut self.telemetry, m),
            MavMessage::VFR_HUD(m) => state::apply_vfr_hud(&mut self.telemetry, m),
            MavMessage::HEARTBEAT(hb) => {
                if let Some(mode) = self.link.observe_heartbeat(hdr, hb) {
                    self.machine.set_current_mode(mode);
                }
            }
            _ => {}
        }
    }

    /// Timer-driven half of the iteration, evaluated at `now`.
    pub async fn service(&mut self, now: Instant) {
        self.machine.tick_hold_expiry(&mut self.link, now);

        if now >= self.next_poll {
            self.next_poll = now + self.poll_interval;
            self.poll_and_dispatch(now).await;
        }

        if now < self.next_send {
            return;
        }
        self.next_send = now + self.send_interval;
        if !self.telemetry.ready() {
            debug!("gateway: telemetry not ready, skipping send");
            return;
        }

        self.machine.tick_proximity(&self.telemetry, &mut self.link);

        if let Err(e) = self.client.send_telemetry(&self.telemetry).await {
            warn!("gateway: telemetry send failed: {}", e);
            tokio::time::sleep(self.cooldown).await;
        }
    }

    async fn poll_and_dispatch(&mut self, now: Instant) {
        let cmd = match self.client.poll_next_command().await {
            Ok(Some(cmd)) => cmd,
            Ok(None) => return,
            Err(e) => {
                warn!("gateway: command poll failed: {}", e);
                return;
            }
        };

        let Some(id) = cmd.id().map(str::to_string) else {
            warn!("gateway: ignoring {} directive without command_id", cmd.raw_kind());
            return;
        };

        let outcome = match cmd.directive() {
            Ok(directive) => {
                debug!("gateway: dispatching {} ({})", cmd.raw_kind(), id);
                self.machine.dispatch(&directive, &self.telemetry, &mut self.link, now)
            }
            Err(e) => {
                warn!("gateway: malformed {} directive {}: {}", cmd.raw_kind(), id, e);
                DirectiveOutcome::Failed(e.into())
            }
        };

        if !outcome.is_handled() {
            debug!("gateway: not acknowledging {}", id);
            return;
        }
        match self.client.ack(&id).await {
            Ok(()) => info!(
                "gateway: acknowledged {} ({}), now {:?}",
                id,
                cmd.raw_kind(),
                self.machine.state().phase()
            ),
            Err(e) => warn!("gateway: ack {} failed: {}", id, e),
        }
    }
}
