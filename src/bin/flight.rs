use clap::{App, Arg};
use satcore::fault::ResetReason;
use satcore::storage::FileStorage;
use satcore::subsystems::{
    Board, Platform, ResetLine, SimImu, SimMagnetometer, SimulatedEps, SystemClock, UdpTransceiver,
    WatchdogLine,
};
use satcore::{fly, FlightConfig, Termination};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_STORAGE: &str = "satcore-state.json";
const DEFAULT_BIND: &str = "127.0.0.1:7300";
const DEFAULT_GROUND: &str = "127.0.0.1:7301";
const DEFAULT_ORBIT_PERIOD_S: &str = "5400";

/// Desktop stand-in for the flight computer: real time, a UDP link to the
/// ground binary, a JSON file for durable state and a simulated EPS.
struct DesktopPlatform;

impl Platform for DesktopPlatform {
    type Clock = SystemClock;
    type Radio = UdpTransceiver;
    type Storage = FileStorage;
    type Watchdog = SoftWatchdog;
    type Power = SimulatedEps<SystemClock>;
    type Imu = SimImu;
    type Magnetometer = SimMagnetometer;
    type Reset = SimulatedReset;
}

#[derive(Debug, Default)]
struct SoftWatchdog {
    kicks: u64,
}

impl WatchdogLine for SoftWatchdog {
    fn kick(&mut self) {
        self.kicks += 1;
        trace!(kicks = self.kicks, "Watchdog kicked");
    }
}

/// Logs the reset; `main` then boots a fresh board from durable state.
#[derive(Debug, Default)]
struct SimulatedReset {
    resets: u32,
}

impl ResetLine for SimulatedReset {
    fn reset(&mut self, reason: ResetReason) {
        self.resets += 1;
        warn!(%reason, resets = self.resets, "Hardware reset");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = App::new("satcore-flight")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Space Systems Engineering Team")
        .about("🛰️  Flight core running against simulated hardware")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Flight configuration (JSON); built-in defaults when omitted")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("storage")
                .short("s")
                .long("storage")
                .value_name("FILE")
                .help("File backing the durable counters")
                .takes_value(true)
                .default_value(DEFAULT_STORAGE),
        )
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Local UDP address of the simulated radio")
                .takes_value(true)
                .default_value(DEFAULT_BIND),
        )
        .arg(
            Arg::with_name("ground")
                .long("ground")
                .value_name("ADDR")
                .help("UDP address of the ground station")
                .takes_value(true)
                .default_value(DEFAULT_GROUND),
        )
        .arg(
            Arg::with_name("orbit-period")
                .long("orbit-period")
                .value_name("SECONDS")
                .help("Orbit period of the simulated EPS")
                .takes_value(true)
                .default_value(DEFAULT_ORBIT_PERIOD_S),
        )
        .arg(
            Arg::with_name("max-boots")
                .long("max-boots")
                .value_name("N")
                .help("Stop after this many boots instead of rebooting forever")
                .takes_value(true),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => FlightConfig::from_file(path)?,
        None => FlightConfig::default(),
    };
    let storage_path = matches.value_of("storage").unwrap_or(DEFAULT_STORAGE).to_string();
    let bind: SocketAddr = matches.value_of("bind").unwrap_or(DEFAULT_BIND).parse()?;
    let ground: SocketAddr = matches.value_of("ground").unwrap_or(DEFAULT_GROUND).parse()?;
    let orbit_period = Duration::from_secs(
        matches
            .value_of("orbit-period")
            .unwrap_or(DEFAULT_ORBIT_PERIOD_S)
            .parse()?,
    );
    let max_boots = matches.value_of("max-boots").map(str::parse::<u32>).transpose()?;

    println!("🛰️  {} flight core", config.cubesat_name);
    println!("================================");
    info!(%bind, %ground, storage = %storage_path, "Radio link and storage");

    let mut reset = SimulatedReset::default();
    let mut boots = 0u32;
    loop {
        boots += 1;
        let clock = SystemClock::new();
        let board = Board::<DesktopPlatform> {
            clock,
            radio: UdpTransceiver::bind(bind, ground)?,
            storage: FileStorage::open(&storage_path)?,
            watchdog: SoftWatchdog::default(),
            power: SimulatedEps::new(clock, orbit_period),
            imu: SimImu::new(),
            magnetometer: SimMagnetometer::new(),
        };

        match fly(config.clone(), board, &mut reset) {
            Termination::Reset(reason) => info!(%reason, boots, "Rebooting"),
            Termination::Halted => {
                error!("Flight software halted");
                break;
            }
        }
        if max_boots.map_or(false, |max| boots >= max) {
            break;
        }
    }

    println!("🚀 Flight core stopped after {} boot(s)", boots);
    Ok(())
}
