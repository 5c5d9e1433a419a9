use satcore::config::MAX_NAME_LEN;
use satcore::fault::FaultClass;
use satcore::protocol::{Frame, FrameKind, MAX_PAYLOAD, MAX_RESPONSE_DETAIL};
use satcore::storage::MemoryStorage;
use satcore::subsystems::sim::{sim_board, SimHandles, SimPlatform};
use satcore::subsystems::*;
use satcore::telemetry::*;
use satcore::{FlightConfig, FlightContext, PowerMode, ResetReason};
use std::time::Duration;

fn setup() -> (FlightContext<SimPlatform>, BeaconBuilder<SimImu, SimMagnetometer>, SimHandles) {
    let config = FlightConfig::default();
    let power = ScriptedPower::steady(PowerTelemetry::new(4.1, 100.0));
    let (board, handles) = sim_board(MemoryStorage::new(), power);
    let ctx = FlightContext::<SimPlatform>::new(&config, board.clock, board.radio, board.storage, board.watchdog)
        .unwrap();
    let builder = BeaconBuilder::new(config.cubesat_name.clone(), board.imu, board.magnetometer);
    (ctx, builder, handles)
}

/// IMU readings far outside the sensor range, as during a hard tumble.
struct Tumbling;

impl Sensor for Tumbling {
    type Reading = ImuReading;

    fn read(&mut self) -> Result<ImuReading, HardwareError> {
        Ok(ImuReading {
            acceleration: [-40.0; 3],
            gyro: [-35.0; 3],
        })
    }
}

struct StrongField;

impl Sensor for StrongField {
    type Reading = Vector3;

    fn read(&mut self) -> Result<Vector3, HardwareError> {
        Ok([-650.0; 3])
    }
}

#[test]
fn test_full_beacon_fits_one_frame_at_extremes() {
    let (mut ctx, _builder, handles) = setup();
    let mut builder = BeaconBuilder::new("X".repeat(MAX_NAME_LEN), Tumbling, StrongField);
    for counter in [ctx.layout.boot_count, ctx.layout.error_count, ctx.layout.message_count] {
        ctx.store.set(counter, u32::MAX).unwrap();
    }
    handles.clock.advance(Duration::from_secs(31_536_000));
    let power = PowerTelemetry::new(4.999, -32_000.0);

    let sent = builder
        .build_and_send(&mut ctx, BeaconKind::Full, PowerMode::Maximum, Some(&power))
        .unwrap();

    let beacon = handles
        .radio
        .transmitted()
        .iter()
        .map(|bytes| Frame::decode(bytes).unwrap())
        .find(|frame| frame.kind == FrameKind::Beacon)
        .unwrap();
    assert!(beacon.payload().len() <= MAX_PAYLOAD);
    assert_eq!(BeaconSnapshot::from_json(beacon.payload()).unwrap(), sent);

    assert!(sent.magnetic_field.is_unavailable());
    assert_eq!(sent.gyro_mrad_s.value(), Some(&[i16::MIN; 3]));
    assert_eq!(sent.acceleration_mm_s2.value(), Some(&[i16::MIN; 3]));
    assert_eq!(sent.boot_count.value(), Some(&65_535));
    assert_eq!(sent.battery_mv.value(), Some(&4999));
    assert_eq!(sent.uptime_s, 31_536_000);
}

#[test]
fn test_beacon_round_trips_through_json() {
    let (mut ctx, mut builder, _handles) = setup();
    ctx.boot_reason = ResetReason::Scheduled;
    let power = PowerTelemetry::new(3.95, 12.4);

    let beacon = builder.build(&mut ctx, BeaconKind::Full, PowerMode::Minimum, Some(&power));
    let parsed = BeaconSnapshot::from_json(&beacon.to_json().unwrap()).unwrap();

    assert_eq!(parsed, beacon);
    assert_eq!(parsed.last_reset, ResetReason::Scheduled);
    assert_eq!(parsed.battery_mv.value(), Some(&3950));
    assert_eq!(parsed.charge_ma.value(), Some(&12));
}

#[test]
fn test_magnetometer_failure_isolated_to_its_field() {
    let (mut ctx, mut builder, handles) = setup();
    handles.magnetometer.inject(FaultType::Offline);

    let beacon = builder.build(&mut ctx, BeaconKind::Full, PowerMode::Normal, None);

    assert!(beacon.magnetic_field.is_unavailable());
    assert!(beacon.acceleration_mm_s2.value().is_some());
    assert!(beacon.battery_mv.is_unavailable());
    assert_eq!(ctx.faults.count(FaultClass::TransientIo), 1);

    let json = String::from_utf8(beacon.to_json().unwrap()).unwrap();
    assert!(json.contains(&format!("\"mag\":\"{}\"", SENSOR_SENTINEL)));
}

#[test]
fn test_unreadable_counter_becomes_sentinel() {
    let (mut ctx, mut builder, handles) = setup();
    handles.storage.fail_slot(Some(ctx.layout.error_count.index()));

    let beacon = builder.build(&mut ctx, BeaconKind::Short, PowerMode::Critical, None);

    assert!(beacon.error_count.is_unavailable());
    assert!(beacon.boot_count.value().is_some());
}

#[test]
fn test_degraded_sensor_still_reports() {
    let (mut ctx, mut builder, handles) = setup();
    handles.imu.inject(FaultType::Degraded);

    let beacon = builder.build(&mut ctx, BeaconKind::Full, PowerMode::Normal, None);

    assert!(beacon.gyro_mrad_s.value().is_some());
    assert_eq!(ctx.faults.total(), 0);
}

#[test]
fn test_build_and_send_downlinks_beacon_frame() {
    let (mut ctx, mut builder, handles) = setup();
    let power = PowerTelemetry::new(4.1, 100.0);

    let sent = builder
        .build_and_send(&mut ctx, BeaconKind::Full, PowerMode::Normal, Some(&power))
        .unwrap();

    let frame = Frame::decode(&handles.radio.transmitted()[0]).unwrap();
    assert_eq!(frame.kind, FrameKind::Beacon);
    assert_eq!(BeaconSnapshot::from_json(frame.payload()).unwrap(), sent);
}

#[test]
fn test_imu_report_is_a_data_frame() {
    let (mut ctx, mut builder, handles) = setup();

    let report = builder.send_imu_report(&mut ctx).unwrap();

    let frame = Frame::decode(&handles.radio.transmitted()[0]).unwrap();
    assert_eq!(frame.kind, FrameKind::Data);
    let parsed: ImuReport = serde_json::from_slice(frame.payload()).unwrap();
    assert_eq!(parsed, report);
}

#[test]
fn test_health_report_collects_counters_and_faults() {
    let (mut ctx, _builder, _handles) = setup();
    ctx.store.set(ctx.layout.boot_count, 3).unwrap();
    ctx.record_fault(FaultClass::Validation, "bad secret");

    let report = HealthReport::collect(&ctx);

    assert_eq!(report.boot_count.value(), Some(&3));
    assert_eq!(report.fault_total, 1);
    assert_eq!(report.last_fault.as_ref().map(|m| m.as_str()), Some("bad secret"));
    assert!(report.to_json(MAX_RESPONSE_DETAIL).unwrap().len() <= MAX_RESPONSE_DETAIL);
}

#[test]
fn test_health_report_drops_last_fault_when_too_large() {
    let (mut ctx, _builder, _handles) = setup();
    ctx.record_fault(FaultClass::TransientIo, "x".repeat(200));
    let report = HealthReport::collect(&ctx);

    let full = report.to_json(usize::MAX).unwrap();
    let trimmed = report.to_json(full.len() - 1).unwrap();

    assert!(trimmed.len() < full.len());
    assert!(!String::from_utf8(trimmed).unwrap().contains("\"last\""));
}
