use satcore::config::BootFailurePolicy;
use satcore::fault::FaultClass;
use satcore::protocol::{Frame, FrameKind, Response, ResponseStatus};
use satcore::storage::MemoryStorage;
use satcore::subsystems::sim::{sim_board, SimHandles, SimPlatform, SimResetLine};
use satcore::subsystems::*;
use satcore::supervisor::BootError;
use satcore::telemetry::{BeaconKind, BeaconSnapshot};
use satcore::*;
use std::time::Duration;

fn test_config() -> FlightConfig {
    let mut config = FlightConfig::default();
    config.sleep.boot_delay_s = 1;
    config
}

fn normal_power() -> ScriptedPower {
    ScriptedPower::steady(PowerTelemetry::new(4.1, 100.0))
}

fn boot(storage: &MemoryStorage, power: ScriptedPower) -> (PowerSupervisor<SimPlatform>, SimHandles) {
    boot_with(test_config(), storage, power)
}

fn boot_with(
    config: FlightConfig,
    storage: &MemoryStorage,
    power: ScriptedPower,
) -> (PowerSupervisor<SimPlatform>, SimHandles) {
    let (board, handles) = sim_board(storage.clone(), power);
    let supervisor = PowerSupervisor::boot(config, board).unwrap();
    (supervisor, handles)
}

fn frames(radio: &SimRadio) -> Vec<Frame> {
    radio
        .transmitted()
        .iter()
        .map(|bytes| Frame::decode(bytes).unwrap())
        .collect()
}

fn kinds(radio: &SimRadio) -> Vec<FrameKind> {
    frames(radio).iter().map(|f| f.kind).collect()
}

fn beacons(radio: &SimRadio) -> Vec<BeaconSnapshot> {
    frames(radio)
        .iter()
        .filter(|f| f.kind == FrameKind::Beacon)
        .map(|f| BeaconSnapshot::from_json(f.payload()).unwrap())
        .collect()
}

fn uplink(radio: &SimRadio, command: Command) {
    let payload = command.to_uplink(b"change-me").unwrap();
    radio.queue_rx(&Frame::new(FrameKind::Command, 0, &payload).unwrap().encode());
}

fn counter(supervisor: &PowerSupervisor<SimPlatform>, pick: fn(&satcore::storage::StoreLayout) -> satcore::storage::Counter) -> u32 {
    let ctx = supervisor.context();
    ctx.store.get(pick(&ctx.layout)).unwrap()
}

#[test]
fn test_boot_counts_and_sends_initial_beacon() {
    let storage = MemoryStorage::new();
    let (supervisor, handles) = boot(&storage, normal_power());

    assert_eq!(counter(&supervisor, |l| l.boot_count), 1);
    assert_eq!(counter(&supervisor, |l| l.message_count), 1);
    assert_eq!(supervisor.context().boot_reason, ResetReason::Uncontrolled);
    assert_eq!(kinds(&handles.radio), vec![FrameKind::Beacon, FrameKind::StationId]);

    let beacon = &beacons(&handles.radio)[0];
    assert_eq!(beacon.name, "satcore-1");
    assert_eq!(beacon.kind, BeaconKind::Full);
    assert_eq!(beacon.power_mode, PowerMode::Normal);
    assert_eq!(beacon.boot_count.value(), Some(&1));
    assert_eq!(beacon.battery_mv.value(), Some(&4100));
}

#[test]
fn test_boot_loiters_before_first_transmission() {
    let storage = MemoryStorage::new();
    let mut config = test_config();
    config.sleep.boot_delay_s = 5;
    let (_supervisor, handles) = boot_with(config, &storage, normal_power());

    let first_tx = handles.radio.transmit_times()[0];
    assert!(first_tx >= Duration::from_secs(5));
}

#[test]
fn test_normal_iteration_runs_profile() {
    let storage = MemoryStorage::new();
    let (mut supervisor, handles) = boot(&storage, normal_power());
    let before = handles.radio.transmitted().len();

    let report = supervisor.run_iteration().unwrap();

    assert_eq!(report.mode, Some(PowerMode::Normal));
    assert_eq!(report.tasks_run, 5);
    assert_eq!(report.reset, None);
    let slept = report.slept.unwrap();
    assert_eq!(slept.requested, Duration::from_secs(30));
    assert_eq!(slept.slept, Duration::from_secs(30));

    let new_kinds = kinds(&handles.radio)[before..].to_vec();
    assert_eq!(new_kinds, vec![FrameKind::StationId, FrameKind::Beacon, FrameKind::Data]);
    assert_eq!(counter(&supervisor, |l| l.message_count), 3);
}

#[test]
fn test_maximum_mode_adds_imu_report_and_joke() {
    let storage = MemoryStorage::new();
    let power = ScriptedPower::steady(PowerTelemetry::new(4.2, 600.0));
    let (mut supervisor, handles) = boot(&storage, power);
    let before = handles.radio.transmitted().len();

    let report = supervisor.run_iteration().unwrap();

    assert_eq!(report.mode, Some(PowerMode::Maximum));
    assert_eq!(report.tasks_run, 9);
    let new_kinds: Vec<FrameKind> = kinds(&handles.radio)[before..]
        .iter()
        .copied()
        .filter(|k| *k != FrameKind::StationId)
        .collect();
    assert_eq!(
        new_kinds,
        vec![FrameKind::Beacon, FrameKind::Data, FrameKind::Data, FrameKind::Joke]
    );
}

#[test]
fn test_critical_mode_short_beacon_and_long_hibernate() {
    let storage = MemoryStorage::new();
    let power = ScriptedPower::steady(PowerTelemetry::new(3.3, -50.0));
    let (mut supervisor, handles) = boot(&storage, power);
    let before = beacons(&handles.radio).len();

    let report = supervisor.run_iteration().unwrap();

    assert_eq!(report.mode, Some(PowerMode::Critical));
    assert_eq!(report.slept.unwrap().requested, Duration::from_secs(180));
    let beacon = beacons(&handles.radio).remove(before);
    assert_eq!(beacon.kind, BeaconKind::Short);
    assert!(beacon.acceleration_mm_s2.is_unavailable());
    assert!(beacon.magnetic_field.is_unavailable());
    assert_eq!(beacon.battery_mv.value(), Some(&3300));
}

#[test]
fn test_minimum_mode_short_hibernate() {
    let storage = MemoryStorage::new();
    let power = ScriptedPower::steady(PowerTelemetry::new(3.8, 0.0));
    let (mut supervisor, _handles) = boot(&storage, power);

    let report = supervisor.run_iteration().unwrap();

    assert_eq!(report.mode, Some(PowerMode::Minimum));
    assert_eq!(report.slept.unwrap().requested, Duration::from_secs(120));
}

#[test]
fn test_mode_follows_each_power_sample() {
    let storage = MemoryStorage::new();
    let power = normal_power();
    let (mut supervisor, _handles) = boot(&storage, power.clone());

    power.push(Ok(PowerTelemetry::new(3.3, 0.0)));
    assert_eq!(supervisor.run_iteration().unwrap().mode, Some(PowerMode::Critical));
    assert_eq!(supervisor.run_iteration().unwrap().mode, Some(PowerMode::Normal));
}

#[test]
fn test_unknown_power_listens_only() {
    let storage = MemoryStorage::new();
    let power = ScriptedPower::failing(HardwareError::NotResponding);
    let (mut supervisor, handles) = boot(&storage, power);

    // No beacon during boot either.
    assert!(handles.radio.transmitted().is_empty());

    let report = supervisor.run_iteration().unwrap();

    assert_eq!(report.mode, Some(PowerMode::Unknown));
    assert_eq!(report.tasks_run, 1);
    assert!(report.slept.is_none());
    assert!(handles.radio.transmitted().is_empty());
    assert!(supervisor.context().faults.count(FaultClass::TransientIo) >= 2);
}

#[test]
fn test_implausible_voltage_is_unknown() {
    let storage = MemoryStorage::new();
    let power = ScriptedPower::steady(PowerTelemetry::new(7.5, 0.0));
    let (mut supervisor, handles) = boot(&storage, power);

    let report = supervisor.run_iteration().unwrap();

    assert_eq!(report.mode, Some(PowerMode::Unknown));
    assert!(handles.radio.transmitted().is_empty());
}

#[test]
fn test_unknown_mode_refuses_modulation_change() {
    let storage = MemoryStorage::new();
    let power = ScriptedPower::failing(HardwareError::Bus);
    let (mut supervisor, handles) = boot(&storage, power);
    uplink(&handles.radio, Command::ChangeModulation(Modulation::Fsk));

    supervisor.run_iteration().unwrap();

    let response = frames(&handles.radio)
        .iter()
        .find(|f| f.kind == FrameKind::Response)
        .and_then(|f| Response::parse(f.payload()))
        .unwrap();
    assert_eq!(response.status, ResponseStatus::Refused);
    assert_eq!(handles.radio.modulation(), Modulation::LoRa);
}

#[test]
fn test_failing_sensor_reported_as_sentinel() {
    let storage = MemoryStorage::new();
    let (board, handles) = sim_board(storage, normal_power());
    handles.imu.inject(FaultType::Failed);

    let supervisor = PowerSupervisor::boot(test_config(), board).unwrap();

    let beacon = &beacons(&handles.radio)[0];
    assert!(beacon.acceleration_mm_s2.is_unavailable());
    assert!(beacon.gyro_mrad_s.is_unavailable());
    assert!(beacon.magnetic_field.value().is_some());
    assert_eq!(supervisor.context().faults.count(FaultClass::TransientIo), 1);
}

#[test]
fn test_transient_radio_failure_does_not_reset() {
    let storage = MemoryStorage::new();
    let (mut supervisor, handles) = boot(&storage, normal_power());
    handles.radio.inject_fault(FaultType::Failed);

    let report = supervisor.run_iteration().unwrap();

    assert_eq!(report.reset, None);
    assert!(report.slept.is_some());
    assert!(supervisor.context().faults.total() > 0);
    assert_eq!(counter(&supervisor, |l| l.error_count), 0);
}

#[test]
fn test_loop_fault_counts_error_and_resets() {
    let storage = MemoryStorage::new();
    let (mut supervisor, handles) = boot(&storage, normal_power());
    let message_slot = supervisor.context().layout.message_count.index();
    storage.fail_slot(Some(message_slot));
    let mut reset = SimResetLine::new();
    let fault_at = handles.clock.now();

    let reason = supervisor.run(&mut reset);

    assert_eq!(reason, ResetReason::LoopFault);
    assert_eq!(reset.resets(), vec![ResetReason::LoopFault]);
    assert_eq!(counter(&supervisor, |l| l.error_count), 1);
    assert_eq!(supervisor.context().faults.count(FaultClass::CriticalLoop), 1);
    // Cooldown happened before the reset.
    assert!(handles.clock.now() - fault_at >= Duration::from_secs(10));

    storage.fail_slot(None);
    let (rebooted, _handles) = boot(&storage, normal_power());
    assert_eq!(counter(&rebooted, |l| l.boot_count), 2);
    assert_eq!(counter(&rebooted, |l| l.error_count), 1);
    assert_eq!(rebooted.context().boot_reason, ResetReason::LoopFault);
    assert_eq!(counter(&rebooted, |l| l.last_reset), ResetReason::Uncontrolled.code());
}

#[test]
fn test_scheduled_reboot_after_uptime_limit() {
    let storage = MemoryStorage::new();
    let mut config = test_config();
    config.sleep.reboot_after_s = Some(60);
    let (mut supervisor, handles) = boot_with(config, &storage, normal_power());
    let mut reset = SimResetLine::new();

    let reason = supervisor.run(&mut reset);

    assert_eq!(reason, ResetReason::Scheduled);
    assert!(handles.clock.now() >= Duration::from_secs(60));
    assert_eq!(supervisor.iterations(), 2);

    let (rebooted, _handles) = boot(&storage, normal_power());
    assert_eq!(rebooted.context().boot_reason, ResetReason::Scheduled);
}

#[test]
fn test_commanded_reset_during_boot_listen() {
    let storage = MemoryStorage::new();
    let (board, handles) = sim_board(storage.clone(), normal_power());
    uplink(&handles.radio, Command::Reset);
    let mut reset = SimResetLine::new();

    let mut supervisor = PowerSupervisor::boot(test_config(), board).unwrap();
    let reason = supervisor.run(&mut reset);

    assert_eq!(reason, ResetReason::Commanded);
    assert_eq!(supervisor.iterations(), 1);
    assert!(kinds(&handles.radio).contains(&FrameKind::Response));

    let (rebooted, _handles) = boot(&storage, normal_power());
    assert_eq!(rebooted.context().boot_reason, ResetReason::Commanded);
}

#[test]
fn test_modulation_survives_reset() {
    let storage = MemoryStorage::new();
    let (board, handles) = sim_board(storage.clone(), normal_power());
    uplink(&handles.radio, Command::ChangeModulation(Modulation::Fsk));
    let _supervisor = PowerSupervisor::boot(test_config(), board).unwrap();
    assert_eq!(handles.radio.modulation(), Modulation::Fsk);

    let (rebooted, handles) = boot(&storage, normal_power());
    assert_eq!(handles.radio.modulation(), Modulation::Fsk);
    assert_eq!(rebooted.context().channel.modulation(), Modulation::Fsk);
}

#[test]
fn test_watchdog_never_starves_across_iterations() {
    let storage = MemoryStorage::new();
    let power = ScriptedPower::steady(PowerTelemetry::new(4.2, 600.0));
    let (mut supervisor, handles) = boot(&storage, power.clone());

    supervisor.run_iteration().unwrap();
    power.set_steady(Ok(PowerTelemetry::new(3.3, 0.0)));
    supervisor.run_iteration().unwrap();

    assert!(handles.watchdog.max_gap() < supervisor.context().watchdog.timeout());
    assert_eq!(supervisor.context().watchdog.stats().late_pets, 0);
    assert!(handles.clock.longest_sleep() <= supervisor.context().watchdog.pet_interval());
}

#[test]
fn test_boot_storage_failure_resets_with_boot_fault() {
    let storage = MemoryStorage::new();
    storage.fail_slot(Some(0));
    let (board, _handles) = sim_board(storage.clone(), normal_power());
    let mut reset = SimResetLine::new();

    let termination = fly(test_config(), board, &mut reset);

    assert_eq!(termination, Termination::Reset(ResetReason::BootFault));
    assert_eq!(reset.resets(), vec![ResetReason::BootFault]);

    storage.fail_slot(None);
    let (rebooted, _handles) = boot(&storage, normal_power());
    assert_eq!(rebooted.context().boot_reason, ResetReason::BootFault);
    assert_eq!(counter(&rebooted, |l| l.error_count), 1);
}

#[test]
fn test_boot_failure_can_halt() {
    let storage = MemoryStorage::new();
    storage.fail_slot(Some(0));
    let (board, _handles) = sim_board(storage, normal_power());
    let mut config = test_config();
    config.boot_failure_policy = BootFailurePolicy::Halt;
    let mut reset = SimResetLine::new();

    let termination = fly(config, board, &mut reset);

    assert_eq!(termination, Termination::Halted);
    assert!(reset.resets().is_empty());
}

#[test]
fn test_invalid_config_rejected_at_boot() {
    let (board, _handles) = sim_board(MemoryStorage::new(), normal_power());
    let mut config = test_config();
    config.watchdog.pet_interval_ms = config.watchdog.timeout_ms;

    let result = PowerSupervisor::boot(config, board);

    assert!(matches!(result, Err(BootError::Config(_))));
}

#[test]
fn test_rejected_config_leaves_durable_boot_fault() {
    let storage = MemoryStorage::new();
    let (board, _handles) = sim_board(storage.clone(), normal_power());
    let mut config = test_config();
    config.cubesat_name = String::new();
    let mut reset = SimResetLine::new();

    let termination = fly(config, board, &mut reset);

    assert_eq!(termination, Termination::Reset(ResetReason::BootFault));
    let (rebooted, _handles) = boot(&storage, normal_power());
    assert_eq!(rebooted.context().boot_reason, ResetReason::BootFault);
    assert_eq!(counter(&rebooted, |l| l.error_count), 1);
    assert_eq!(counter(&rebooted, |l| l.boot_count), 1);
}

#[test]
fn test_watchdog_expiry_reported_as_boot_reason() {
    let storage = MemoryStorage::new();
    let (board, handles) = sim_board(storage.clone(), normal_power());
    handles.watchdog.set_expired_before_boot(true);

    let supervisor = PowerSupervisor::boot(test_config(), board).unwrap();

    assert_eq!(supervisor.context().boot_reason, ResetReason::Watchdog);
    assert_eq!(beacons(&handles.radio)[0].last_reset, ResetReason::Watchdog);

    // The reason is reported, not stored.
    assert_eq!(
        counter(&supervisor, |l| l.last_reset),
        ResetReason::Uncontrolled.code()
    );
}
