use anyhow::{Context, Result};
use mavlink::{
    common::{
        MavAutopilot, MavCmd, MavFrame, MavMessage, MavModeFlag, MavType, PositionTargetTypemask,
        COMMAND_LONG_DATA, HEARTBEAT_DATA, SET_POSITION_TARGET_GLOBAL_INT_DATA,
    },
    error::MessageReadError,
    MavConnection, MavHeader,
};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, info, warn};

use crate::modes::{CustomMode, Firmware, ModeTable};
use crate::{FcConfig, VehicleLink};

type SharedConn = Arc<dyn MavConnection<MavMessage> + Send + Sync>;

const INBOUND_QUEUE: usize = 256;

/// Consecutive I/O errors before a stream link is considered dropped.
const RECONNECT_AFTER: u32 = 5;
const BACKOFF_START: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(10);

/// The live connection. The reader swaps it after a reconnect; senders
/// always pick up the current one.
#[derive(Clone)]
struct ConnSlot(Arc<RwLock<SharedConn>>);

impl ConnSlot {
    fn new(conn: SharedConn) -> Self {
        Self(Arc::new(RwLock::new(conn)))
    }

    fn get(&self) -> SharedConn {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn replace(&self, conn: SharedConn) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = conn;
    }
}

pub struct FcLink {
    slot: ConnSlot,
    rx: mpsc::Receiver<(MavHeader, MavMessage)>,
    hdr: MavHeader,
    target_sys: u8,
    target_comp: u8,
    vehicle_seen: bool,
    modes: ModeTable,
    opened: Instant,
}

impl FcLink {
    /// Opens the link and starts the reader thread.
    ///
    /// The reader is a detached OS thread: it can sit in a blocking `recv`
    /// forever, and the tokio runtime must still be able to shut down.
    /// Serial endpoints are checked with `tokio_serial`, which needs a runtime.
    pub fn open(cfg: &FcConfig) -> Result<Self> {
        let url = connection_url(&cfg.endpoint)?;

        if let Some((dev, baud)) = serial_parts(&url) {
            // quick validate device
            let _ = tokio_serial::new(dev, baud)
                .open_native_async()
                .with_context(|| format!("open fc serial device {}", dev))?;
        }

        let slot = ConnSlot::new(connect(&url)?);
        info!("fc: link open on {}", url);

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        let reader = slot.clone();
        std::thread::Builder::new()
            .name("fc-reader".into())
            .spawn(move || read_loop(url, reader, tx))
            .context("spawn fc reader")?;

        Ok(Self {
            slot,
            rx,
            hdr: MavHeader { system_id: cfg.sys_id, component_id: cfg.comp_id, sequence: 0 },
            target_sys: 1,
            target_comp: 1,
            vehicle_seen: false,
            modes: ModeTable::default(),
            opened: Instant::now(),
        })
    }

    /// First vehicle heartbeat within `timeout`. The caller feeds it to
    /// `observe_heartbeat` like any other message.
    pub async fn wait_heartbeat(&mut self, timeout: Duration) -> Option<(MavHeader, HEARTBEAT_DATA)> {
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                return None;
            }
            if let Some((hdr, MavMessage::HEARTBEAT(hb))) = self.next_message(left).await {
                if is_vehicle(&hb) {
                    return Some((hdr, hb));
                }
            }
        }
    }

    fn target(&self) -> (u8, u8) {
        (self.target_sys, self.target_comp)
    }

    fn send(&mut self, msg: MavMessage) -> Result<()> {
        self.hdr.sequence = self.hdr.sequence.wrapping_add(1);
        self.slot.get().send(&self.hdr, &msg).context("mavlink send")?;
        Ok(())
    }
}

impl VehicleLink for FcLink {
    async fn next_message(&mut self, timeout: Duration) -> Option<(MavHeader, MavMessage)> {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(m)) => Some(m),
            Ok(None) => {
                // reader gone: behave like a timeout so timers keep running
                tokio::time::sleep(timeout).await;
                None
            }
            Err(_elapsed) => None,
        }
    }

    fn observe_heartbeat(&mut self, hdr: &MavHeader, hb: &HEARTBEAT_DATA) -> Option<String> {
        if !is_vehicle(hb) {
            return None;
        }
        if !self.vehicle_seen {
            self.vehicle_seen = true;
            self.target_sys = hdr.system_id;
            self.target_comp = hdr.component_id;
            info!(
                "fc: vehicle sys={} comp={} autopilot={:?} type={:?}",
                hdr.system_id, hdr.component_id, hb.autopilot, hb.mavtype
            );
        } else if hdr.system_id != self.target_sys {
            return None;
        }

        let fw = Firmware::detect(hb.autopilot, hb.mavtype);
        if fw != self.modes.firmware() {
            debug!("fc: mode table -> {:?}", fw);
            self.modes = ModeTable::for_firmware(fw);
        }
        self.modes.name_of(hb.custom_mode).map(str::to_string)
    }

    fn set_mode(&mut self, candidates: &[&str]) -> Result<Option<String>> {
        let Some((name, cmd)) = set_mode_command(&self.modes, self.target(), candidates) else {
            return Ok(None);
        };
        info!("fc: set mode {}", name);
        self.send(MavMessage::COMMAND_LONG(cmd))?;
        Ok(Some(name))
    }

    fn send_position_target(&mut self, lat: f64, lon: f64, alt_m: f64) -> Result<()> {
        let boot_ms = self.opened.elapsed().as_millis() as u32;
        let sp = position_target(self.target(), boot_ms, lat, lon, alt_m);
        debug!("fc: setpoint lat={:.7} lon={:.7} alt={:.1}", lat, lon, alt_m);
        self.send(MavMessage::SET_POSITION_TARGET_GLOBAL_INT(sp))
    }
}

/// `DO_SET_MODE` for the first candidate in `modes`, or `None` if the
/// vehicle has none of them. ArduPilot takes the mode number in param2;
/// PX4 takes main/sub mode in param2/param3.
pub fn set_mode_command(
    modes: &ModeTable,
    (target_system, target_component): (u8, u8),
    candidates: &[&str],
) -> Option<(String, COMMAND_LONG_DATA)> {
    let (name, mode) = modes.resolve(candidates)?;
    let (param2, param3) = match mode {
        CustomMode::ArduPilot(n) => (n as f32, 0.0),
        CustomMode::Px4 { main, sub } => (f32::from(main), f32::from(sub)),
    };
    let cmd = COMMAND_LONG_DATA {
        target_system,
        target_component,
        command: MavCmd::MAV_CMD_DO_SET_MODE,
        confirmation: 0,
        param1: f32::from(MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED.bits()),
        param2,
        param3,
        param4: 0.0,
        param5: 0.0,
        param6: 0.0,
        param7: 0.0,
    };
    Some((name, cmd))
}

/// Position-only global setpoint (AMSL altitude).
pub fn position_target(
    (target_system, target_component): (u8, u8),
    time_boot_ms: u32,
    lat: f64,
    lon: f64,
    alt_m: f64,
) -> SET_POSITION_TARGET_GLOBAL_INT_DATA {
    let ignore = PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VX_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VY_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VZ_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AY_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AZ_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE
        | PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE;

    #[allow(deprecated)]
    SET_POSITION_TARGET_GLOBAL_INT_DATA {
        time_boot_ms,
        target_system,
        target_component,
        coordinate_frame: MavFrame::MAV_FRAME_GLOBAL_INT,
        type_mask: ignore,
        lat_int: (lat * 1e7).round() as i32,
        lon_int: (lon * 1e7).round() as i32,
        alt: alt_m as f32,
        vx: 0.0,
        vy: 0.0,
        vz: 0.0,
        afx: 0.0,
        afy: 0.0,
        afz: 0.0,
        yaw: 0.0,
        yaw_rate: 0.0,
    }
}

/// Heartbeats from ground stations and other companions are not the vehicle.
pub fn is_vehicle(hb: &HEARTBEAT_DATA) -> bool {
    !matches!(
        hb.mavtype,
        MavType::MAV_TYPE_GCS | MavType::MAV_TYPE_ONBOARD_CONTROLLER
    ) && hb.autopilot != MavAutopilot::MAV_AUTOPILOT_INVALID
}

fn connect(url: &str) -> Result<SharedConn> {
    let conn = mavlink::connect::<MavMessage>(url).with_context(|| format!("mavlink connect {}", url))?;
    Ok(Arc::from(conn))
}

/// Stream links (TCP, serial) die with their peer and must be reopened.
/// UDP sockets survive peer restarts, so I/O errors there are transient.
fn reconnectable(url: &str) -> bool {
    url.starts_with("tcp") || url.starts_with("serial:")
}

/// Tracks receive failures and the reconnect backoff.
#[derive(Debug)]
struct RecvHealth {
    io_errors: u32,
    backoff: Duration,
}

impl Default for RecvHealth {
    fn default() -> Self {
        Self { io_errors: 0, backoff: BACKOFF_START }
    }
}

impl RecvHealth {
    fn on_message(&mut self) {
        self.io_errors = 0;
        self.backoff = BACKOFF_START;
    }

    /// True once enough consecutive I/O errors piled up to call the link dropped.
    fn on_io_error(&mut self) -> bool {
        self.io_errors = self.io_errors.saturating_add(1);
        self.io_errors >= RECONNECT_AFTER
    }

    /// Wait before the next reconnect attempt. Doubles up to `BACKOFF_MAX`
    /// and only resets once a message gets through.
    fn next_backoff(&mut self) -> Duration {
        let wait = self.backoff;
        self.backoff = (wait * 2).min(BACKOFF_MAX);
        wait
    }

    fn on_reconnected(&mut self) {
        self.io_errors = 0;
    }
}

fn read_loop(url: String, slot: ConnSlot, tx: mpsc::Sender<(MavHeader, MavMessage)>) {
    let can_reconnect = reconnectable(&url);
    let mut health = RecvHealth::default();
    loop {
        let conn = slot.get();
        match conn.recv() {
            Ok(m) => {
                health.on_message();
                if tx.blocking_send(m).is_err() {
                    debug!("fc: reader stopping, receiver dropped");
                    return;
                }
            }
            Err(MessageReadError::Io(e)) => {
                if !health.on_io_error() {
                    debug!("fc: recv failed: {}", e);
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                if !can_reconnect {
                    if health.io_errors == RECONNECT_AFTER {
                        warn!("fc: repeated recv errors on {}: {}", url, e);
                    }
                    std::thread::sleep(Duration::from_millis(10));
                    continue;
                }
                warn!("fc: link lost ({}), reconnecting to {}", e, url);
                drop(conn);
                loop {
                    if tx.is_closed() {
                        return;
                    }
                    std::thread::sleep(health.next_backoff());
                    match connect(&url) {
                        Ok(c) => {
                            slot.replace(c);
                            health.on_reconnected();
                            info!("fc: link re-established on {}", url);
                            break;
                        }
                        Err(e) => warn!("fc: reconnect failed: {:#}", e),
                    }
                }
            }
            Err(e) => {
                // decode failures never leave the reader
                debug!("fc: dropped frame: {}", e);
            }
        }
    }
}

/// Maps a link descriptor onto a `mavlink::connect` address.
///
/// `udp:` listens and `tcp:` dials out; the explicit forms pass through.
pub fn connection_url(descriptor: &str) -> Result<String> {
    let d = descriptor.trim();
    let (scheme, rest) = d
        .split_once(':')
        .with_context(|| format!("invalid mavlink endpoint: {}", d))?;
    anyhow::ensure!(!rest.is_empty(), "invalid mavlink endpoint: {}", d);
    let scheme = match scheme.to_ascii_lowercase().as_str() {
        "udp" | "udpin" => "udpin",
        "udpout" => "udpout",
        "udpbcast" => "udpbcast",
        "tcp" | "tcpout" => "tcpout",
        "tcpin" => "tcpin",
        "serial" => {
            anyhow::ensure!(serial_parts(d).is_some(), "serial endpoint needs DEVICE:BAUD: {}", d);
            "serial"
        }
        other => anyhow::bail!("unsupported mavlink endpoint scheme: {}", other),
    };
    Ok(format!("{}:{}", scheme, rest))
}

fn serial_parts(url: &str) -> Option<(&str, u32)> {
    let rest = url.strip_prefix("serial:")?;
    let (dev, baud) = rest.rsplit_once(':')?;
    let baud = baud.parse().ok()?;
    (!dev.is_empty()).then_some((dev, baud))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavlink::common::MavState;

    fn hb(mavtype: MavType, autopilot: MavAutopilot) -> HEARTBEAT_DATA {
        HEARTBEAT_DATA {
            custom_mode: 0,
            mavtype,
            autopilot,
            base_mode: MavModeFlag::MAV_MODE_FLAG_CUSTOM_MODE_ENABLED,
            system_status: MavState::MAV_STATE_ACTIVE,
            mavlink_version: 3,
        }
    }

    #[test]
    fn endpoint_descriptors() {
        assert_eq!(connection_url("udp:0.0.0.0:14550").unwrap(), "udpin:0.0.0.0:14550");
        assert_eq!(connection_url("tcp:127.0.0.1:5760").unwrap(), "tcpout:127.0.0.1:5760");
        assert_eq!(connection_url("udpout:10.0.0.2:14550").unwrap(), "udpout:10.0.0.2:14550");
        assert_eq!(
            connection_url("serial:/dev/ttyACM0:57600").unwrap(),
            "serial:/dev/ttyACM0:57600"
        );
        assert!(connection_url("serial:/dev/ttyACM0").is_err());
        assert!(connection_url("ftp:host:21").is_err());
        assert!(connection_url("udp:").is_err());
        assert!(connection_url("nonsense").is_err());
    }

    #[test]
    fn serial_parts_split_on_last_colon() {
        assert_eq!(serial_parts("serial:/dev/ttyUSB0:115200"), Some(("/dev/ttyUSB0", 115200)));
        assert_eq!(serial_parts("serial:COM3:57600"), Some(("COM3", 57600)));
        assert_eq!(serial_parts("udpin:0.0.0.0:14550"), None);
    }

    #[test]
    fn set_mode_command_encodes_ardupilot_number() {
        let t = ModeTable::for_firmware(Firmware::ArduCopter);
        let (name, cmd) = set_mode_command(&t, (1, 1), &["HOLD", "loiter"]).unwrap();
        assert_eq!(name, "LOITER");
        assert_eq!(cmd.command, MavCmd::MAV_CMD_DO_SET_MODE);
        assert_eq!((cmd.target_system, cmd.target_component), (1, 1));
        assert_eq!(cmd.param1, 1.0);
        assert_eq!(cmd.param2, 5.0);
        assert_eq!(cmd.param3, 0.0);
    }

    #[test]
    fn set_mode_command_encodes_px4_main_and_sub() {
        let t = ModeTable::for_firmware(Firmware::Px4);
        let (name, cmd) = set_mode_command(&t, (7, 1), &["LOITER"]).unwrap();
        assert_eq!(name, "LOITER");
        assert_eq!(cmd.target_system, 7);
        assert_eq!((cmd.param2, cmd.param3), (4.0, 3.0));

        let (name, cmd) = set_mode_command(&t, (7, 1), &["GUIDED", "OFFBOARD"]).unwrap();
        assert_eq!(name, "OFFBOARD");
        assert_eq!((cmd.param2, cmd.param3), (6.0, 0.0));
    }

    #[test]
    fn set_mode_command_without_candidate_is_none() {
        let t = ModeTable::for_firmware(Firmware::ArduPlane);
        assert!(set_mode_command(&t, (1, 1), &["POSHOLD", "BRAKE"]).is_none());
    }

    #[test]
    fn position_target_is_position_only_global_int() {
        let sp = position_target((1, 1), 1234, 47.3977419, -122.1234567, 50.0);
        assert_eq!(sp.coordinate_frame, MavFrame::MAV_FRAME_GLOBAL_INT);
        assert_eq!(sp.lat_int, 473_977_419);
        assert_eq!(sp.lon_int, -1_221_234_567);
        assert_eq!(sp.alt, 50.0);
        assert_eq!(sp.time_boot_ms, 1234);

        let mask = sp.type_mask;
        for ignored in [
            PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VX_IGNORE,
            PositionTargetTypemask::POSITION_TARGET_TYPEMASK_VZ_IGNORE,
            PositionTargetTypemask::POSITION_TARGET_TYPEMASK_AX_IGNORE,
            PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_IGNORE,
            PositionTargetTypemask::POSITION_TARGET_TYPEMASK_YAW_RATE_IGNORE,
        ] {
            assert!(mask.contains(ignored));
        }
        assert!(!mask.contains(PositionTargetTypemask::POSITION_TARGET_TYPEMASK_X_IGNORE));
        assert!(!mask.contains(PositionTargetTypemask::POSITION_TARGET_TYPEMASK_Z_IGNORE));
    }

    #[test]
    fn only_stream_links_reconnect() {
        assert!(reconnectable("tcpout:127.0.0.1:5760"));
        assert!(reconnectable("tcpin:0.0.0.0:5760"));
        assert!(reconnectable("serial:/dev/ttyACM0:57600"));
        assert!(!reconnectable("udpin:0.0.0.0:14550"));
    }

    #[test]
    fn recv_health_backoff_doubles_and_resets_on_traffic() {
        let mut h = RecvHealth::default();
        for _ in 1..RECONNECT_AFTER {
            assert!(!h.on_io_error());
        }
        assert!(h.on_io_error());

        assert_eq!(h.next_backoff(), Duration::from_millis(500));
        assert_eq!(h.next_backoff(), Duration::from_secs(1));
        for _ in 0..10 {
            h.next_backoff();
        }
        assert_eq!(h.next_backoff(), BACKOFF_MAX);

        h.on_reconnected();
        assert!(!h.on_io_error());
        assert_eq!(h.next_backoff(), BACKOFF_MAX);

        h.on_message();
        assert_eq!(h.next_backoff(), BACKOFF_START);
    }

    #[test]
    fn runtime_shuts_down_after_heartbeat_timeout() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let cfg = FcConfig { endpoint: "udp:127.0.0.1:0".into(), ..Default::default() };
            let seen = rt.block_on(async {
                let mut link = FcLink::open(&cfg).unwrap();
                link.wait_heartbeat(Duration::from_millis(200)).await.is_some()
            });
            drop(rt);
            let _ = done_tx.send(seen);
        });
        let seen = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("runtime shutdown must not wait on the link reader");
        assert!(!seen);
    }

    #[test]
    fn reader_reconnects_after_tcp_peer_closes() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (accepted_tx, accepted_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                drop(stream);
                if accepted_tx.send(()).is_err() {
                    return;
                }
            }
        });

        let cfg = FcConfig { endpoint: format!("tcp:127.0.0.1:{}", port), ..Default::default() };
        let _link = FcLink::open(&cfg).unwrap();
        accepted_rx.recv_timeout(Duration::from_secs(2)).expect("initial connect");
        accepted_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("reconnect after the peer closed");
    }

    #[test]
    fn ground_stations_are_not_vehicles() {
        assert!(!is_vehicle(&hb(MavType::MAV_TYPE_GCS, MavAutopilot::MAV_AUTOPILOT_INVALID)));
        assert!(!is_vehicle(&hb(
            MavType::MAV_TYPE_ONBOARD_CONTROLLER,
            MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA
        )));
        assert!(is_vehicle(&hb(MavType::MAV_TYPE_QUADROTOR, MavAutopilot::MAV_AUTOPILOT_ARDUPILOTMEGA)));
    }
}
