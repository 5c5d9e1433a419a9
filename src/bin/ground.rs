use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use satcore::protocol::{Frame, FrameKind, Response, ResponseStatus, MAX_ENCODED_FRAME};
use satcore::subsystems::Modulation;
use satcore::telemetry::{BeaconSnapshot, Field, HealthReport};
use satcore::Command;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};

const DEFAULT_BIND: &str = "127.0.0.1:7301";
const DEFAULT_SATELLITE: &str = "127.0.0.1:7300";
const DEFAULT_SECRET: &str = "change-me";
const DEFAULT_TIMEOUT_S: &str = "120";
const DEFAULT_RETRY_MS: &str = "2000";

struct Link {
    socket: UdpSocket,
    satellite: SocketAddr,
    secret: String,
    timeout: Duration,
    retry: Duration,
    format: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("satcore-ground")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Space Systems Engineering Team")
        .about("📡 Ground station for the satcore flight core")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("bind")
                .long("bind")
                .value_name("ADDR")
                .help("Local UDP address of the ground radio")
                .takes_value(true)
                .default_value(DEFAULT_BIND)
                .global(true),
        )
        .arg(
            Arg::with_name("satellite")
                .long("satellite")
                .value_name("ADDR")
                .help("UDP address of the flight core radio")
                .takes_value(true)
                .default_value(DEFAULT_SATELLITE)
                .global(true),
        )
        .arg(
            Arg::with_name("secret")
                .long("secret")
                .value_name("SECRET")
                .help("Shared uplink secret")
                .takes_value(true)
                .default_value(DEFAULT_SECRET)
                .global(true),
        )
        .arg(
            Arg::with_name("timeout")
                .short("t")
                .long("timeout")
                .value_name("SECONDS")
                .help("Give up when no response arrives within this time")
                .takes_value(true)
                .default_value(DEFAULT_TIMEOUT_S)
                .global(true),
        )
        .arg(
            Arg::with_name("retry")
                .long("retry")
                .value_name("MILLISECONDS")
                .help("Resend interval while waiting for a listen window")
                .takes_value(true)
                .default_value(DEFAULT_RETRY_MS)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json"])
                .default_value("table")
                .global(true),
        )
        .subcommand(SubCommand::with_name("listen").about("👂 Print every frame received from the satellite"))
        .subcommand(SubCommand::with_name("ping").about("🏓 Check the command link"))
        .subcommand(SubCommand::with_name("reset").about("🔄 Request a commanded reset"))
        .subcommand(
            SubCommand::with_name("modulation")
                .about("📻 Switch radio modulation")
                .arg(
                    Arg::with_name("scheme")
                        .help("Modulation scheme")
                        .required(true)
                        .possible_values(&["lora", "fsk"]),
                ),
        )
        .subcommand(SubCommand::with_name("joke").about("🃏 Ask for a joke"))
        .subcommand(SubCommand::with_name("health").about("🩺 Request a state of health report"))
        .subcommand(
            SubCommand::with_name("wake")
                .about("⏰ Set or clear the wake override flag")
                .arg(
                    Arg::with_name("state")
                        .help("Flag state")
                        .required(true)
                        .possible_values(&["on", "off"]),
                ),
        )
        .subcommand(SubCommand::with_name("clear-errors").about("🧹 Reset the durable error counter"))
        .get_matches();

    let bind: SocketAddr = matches.value_of("bind").unwrap_or(DEFAULT_BIND).parse()?;
    let link = Link {
        socket: UdpSocket::bind(bind).await?,
        satellite: matches.value_of("satellite").unwrap_or(DEFAULT_SATELLITE).parse()?,
        secret: matches.value_of("secret").unwrap_or(DEFAULT_SECRET).to_string(),
        timeout: Duration::from_secs(matches.value_of("timeout").unwrap_or(DEFAULT_TIMEOUT_S).parse()?),
        retry: Duration::from_millis(matches.value_of("retry").unwrap_or(DEFAULT_RETRY_MS).parse()?),
        format: matches.value_of("format").unwrap_or("table").to_string(),
    };

    let command = match matches.subcommand() {
        ("listen", _) => return listen(&link).await,
        ("ping", _) => Command::Ping,
        ("reset", _) => Command::Reset,
        ("modulation", Some(sub)) => Command::ChangeModulation(parse_modulation(sub)),
        ("joke", _) => Command::SendJoke,
        ("health", _) => Command::StateOfHealth,
        ("wake", Some(sub)) => Command::SetWakeOverride(sub.value_of("state") == Some("on")),
        ("clear-errors", _) => Command::ClearErrorCount,
        _ => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            return Ok(());
        }
    };

    println!(
        "{} {:?} {} {}",
        "Uplinking".dimmed(),
        command,
        "to".dimmed(),
        link.satellite.to_string().bright_white()
    );
    let response = send_command(&link, &command).await?;
    print_response(&command, &response, &link.format);
    Ok(())
}

fn parse_modulation(matches: &ArgMatches<'_>) -> Modulation {
    match matches.value_of("scheme") {
        Some("fsk") => Modulation::Fsk,
        _ => Modulation::LoRa,
    }
}

/// Resend until the satellite opens a listen window and answers, or the
/// timeout expires. Frames received meanwhile are printed.
async fn send_command(link: &Link, command: &Command) -> Result<Response, Box<dyn std::error::Error>> {
    let payload = command.to_uplink(link.secret.as_bytes())?;
    let opcode = command.opcode() as u8;
    let deadline = Instant::now() + link.timeout;
    let mut buf = [0u8; MAX_ENCODED_FRAME];
    let mut sequence: u16 = 0;

    while Instant::now() < deadline {
        let frame = Frame::new(FrameKind::Command, sequence, &payload)?;
        sequence = sequence.wrapping_add(1);
        link.socket.send_to(&frame.encode(), link.satellite).await?;

        let retry_at = (Instant::now() + link.retry).min(deadline);
        loop {
            let (len, _) = match timeout_at(retry_at, link.socket.recv_from(&mut buf)).await {
                Ok(received) => received?,
                Err(_) => break,
            };
            match Frame::decode(&buf[..len]) {
                Ok(frame) if frame.kind == FrameKind::Response => match Response::parse(frame.payload()) {
                    Some(response) if response.opcode == opcode => return Ok(response),
                    _ => print_frame(&frame, &link.format),
                },
                Ok(frame) => print_frame(&frame, &link.format),
                Err(e) => eprintln!("{} Undecodable frame: {}", "⚠️".yellow(), e),
            }
        }
    }

    eprintln!(
        "{} No response after {} seconds",
        "⏰".yellow(),
        link.timeout.as_secs()
    );
    eprintln!("{} The satellite only listens between beacons; is it in a listening mode?", "💡".yellow());
    Err("command timeout".into())
}

async fn listen(link: &Link) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", "📡 Listening for downlink (Press Ctrl+C to stop)...".bright_blue().bold());
    let mut buf = [0u8; MAX_ENCODED_FRAME];
    loop {
        let (len, from) = link.socket.recv_from(&mut buf).await?;
        match Frame::decode(&buf[..len]) {
            Ok(frame) => print_frame(&frame, &link.format),
            Err(e) => eprintln!("{} Undecodable frame from {}: {}", "⚠️".yellow(), from, e),
        }
    }
}

fn print_frame(frame: &Frame, format: &str) {
    let payload = frame.payload();
    if format == "json" {
        println!(
            "{{\"kind\":\"{:?}\",\"seq\":{},\"payload\":{}}}",
            frame.kind,
            frame.sequence,
            serde_json::to_string(&String::from_utf8_lossy(payload)).unwrap_or_default()
        );
        return;
    }

    let seq = format!("#{:<5}", frame.sequence).dimmed();
    match frame.kind {
        FrameKind::StationId => {
            println!("{} {} {}", seq, "ID".bright_magenta(), String::from_utf8_lossy(payload).bright_white());
        }
        FrameKind::Beacon => match BeaconSnapshot::from_json(payload) {
            Ok(beacon) => print_beacon(&seq, &beacon),
            Err(e) => println!("{} {} unparseable beacon: {}", seq, "BCN".yellow(), e),
        },
        FrameKind::Joke => {
            println!("{} {} {}", seq, "JOKE".bright_cyan(), String::from_utf8_lossy(payload));
        }
        FrameKind::Response => match Response::parse(payload) {
            Some(response) => println!(
                "{} {} opcode {:#04x} {}",
                seq,
                "RSP".bright_blue(),
                response.opcode,
                status_label(response.status)
            ),
            None => println!("{} {} malformed", seq, "RSP".yellow()),
        },
        FrameKind::Data | FrameKind::Command => {
            println!("{} {} {}", seq, format!("{:?}", frame.kind).white(), String::from_utf8_lossy(payload));
        }
    }
}

fn print_beacon(seq: &ColoredString, beacon: &BeaconSnapshot) {
    println!(
        "{} {} {} {:?} {:?} up {}s",
        seq,
        "BCN".bright_green(),
        beacon.name.bright_white().bold(),
        beacon.kind,
        beacon.power_mode,
        beacon.uptime_s
    );
    println!(
        "        boots {} errors {} msgs {} last reset {} radio {:?}",
        field(&beacon.boot_count),
        field(&beacon.error_count),
        field(&beacon.message_count),
        beacon.last_reset,
        beacon.modulation
    );
    println!(
        "        battery {} mV charge {} mA",
        field(&beacon.battery_mv),
        field(&beacon.charge_ma)
    );
    if beacon.acceleration_mm_s2.value().is_some() || beacon.gyro_mrad_s.value().is_some() {
        println!(
            "        acc {} mm/s² gyro {} mrad/s mag {} ×0.1µT",
            field(&beacon.acceleration_mm_s2),
            field(&beacon.gyro_mrad_s),
            field(&beacon.magnetic_field)
        );
    }
}

fn print_response(command: &Command, response: &Response, format: &str) {
    let detail = response.detail();
    if format == "json" {
        println!(
            "{{\"opcode\":{},\"status\":\"{:?}\",\"detail\":{}}}",
            response.opcode,
            response.status,
            serde_json::to_string(&String::from_utf8_lossy(detail)).unwrap_or_default()
        );
        return;
    }

    println!("{} {:?}: {}", "📨".bright_blue(), command, status_label(response.status));
    if detail.is_empty() {
        return;
    }
    match serde_json::from_slice::<HealthReport>(detail) {
        Ok(health) => print_health(&health),
        Err(_) => println!("   {}", String::from_utf8_lossy(detail)),
    }
}

fn print_health(health: &HealthReport) {
    println!("{}", "🩺 State of health".bright_blue().bold());
    println!("   {:<18} {}s", "Uptime:".bright_white(), health.uptime_s);
    println!("   {:<18} {}", "Boots:".bright_white(), field(&health.boot_count));
    println!("   {:<18} {}", "Errors:".bright_white(), field(&health.error_count));
    println!("   {:<18} {}", "Messages:".bright_white(), field(&health.message_count));
    println!("   {:<18} {}", "Last reset:".bright_white(), health.last_reset);
    println!(
        "   {:<18} {} sent, {} ids, {} failed",
        "Radio TX:".bright_white(),
        health.payloads_sent,
        health.station_ids_sent,
        health.send_failures
    );
    println!(
        "   {:<18} {} received, {} dropped",
        "Radio RX:".bright_white(),
        health.frames_received,
        health.frames_dropped
    );
    println!("   {:<18} {}", "Watchdog pets:".bright_white(), health.watchdog_pets);
    println!("   {:<18} {}", "Faults:".bright_white(), health.fault_total);
    if let Some(last) = &health.last_fault {
        println!("   {:<18} {}", "Last fault:".bright_white(), last.to_string().bright_red());
    }
    println!("   {:<18} {:?}", "Modulation:".bright_white(), health.modulation);
}

fn status_label(status: ResponseStatus) -> ColoredString {
    match status {
        ResponseStatus::Ok => "OK".bright_green(),
        ResponseStatus::Refused => "REFUSED".yellow(),
        other => format!("{:?}", other).bright_red(),
    }
}

fn field<T: fmt::Debug>(value: &Field<T>) -> String {
    match value.value() {
        Some(v) => format!("{:?}", v),
        None => "n/a".dimmed().to_string(),
    }
}
