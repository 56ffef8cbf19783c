use ltc_afe_lib::command::{start_open_wire, ProbeDirection, RDCV};
use ltc_afe_lib::config::{ChipFamily, MuxStep};
use ltc_afe_lib::diag::{Category, Outcome, RecordingReporter};
use ltc_afe_lib::measurement::RegisterGroup;
use ltc_afe_lib::simulator::SimulatedChain;
use ltc_afe_lib::store::MemoryStore;
use ltc_afe_lib::{
    AfeDriver, ChainConfig, RequestError, RequestKind, State, StateRequest, Substate,
    TriggerOutcome,
};

type Driver = AfeDriver<SimulatedChain, RecordingReporter, MemoryStore>;

const MAX_TRIGGERS: usize = 10_000;

fn driver(config: ChainConfig) -> Driver {
    let buses = (0..config.strings)
        .map(|_| SimulatedChain::new(&config))
        .collect();
    let store = MemoryStore::new(&config);
    AfeDriver::new(config, buses, RecordingReporter::new(), store).unwrap()
}

fn initialized(config: ChainConfig) -> Driver {
    let mut driver = driver(config);
    driver
        .set_state_request(StateRequest::new(RequestKind::Init, 0))
        .unwrap();
    assert!(driver.run_until(MAX_TRIGGERS, |d| d.is_first_cycle_finished()));
    driver
}

/// Triggers until one step ran.
fn step(driver: &mut Driver) {
    for _ in 0..MAX_TRIGGERS {
        if driver.trigger() == TriggerOutcome::Executed {
            return;
        }
    }
    panic!("no step executed");
}

fn serve(driver: &mut Driver, request: StateRequest) {
    driver.set_state_request(request).unwrap();
    let handle = driver.handle();
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        !handle.has_pending_request() && d.acquisition().request.is_none()
    }));
}

fn single_device() -> ChainConfig {
    ChainConfig {
        devices_per_string: 1,
        mux_sequence: vec![
            MuxStep {
                mux: 0,
                channel: Some(0),
                sensor: Some(0),
            },
            MuxStep {
                mux: 0,
                channel: None,
                sensor: None,
            },
        ],
        ..Default::default()
    }
}

#[test]
fn deterministic_path_to_first_cycle() {
    use State::*;
    use Substate::*;

    let mut driver = driver(single_device());
    step(&mut driver);
    assert_eq!(driver.state(), (Uninitialized, Entry));
    driver
        .set_state_request(StateRequest::new(RequestKind::Init, 0))
        .unwrap();

    let mut path = Vec::new();
    while driver.state().0 != MeasurementCycleFinished {
        step(&mut driver);
        path.push(driver.state());
        assert!(path.len() < 100, "no cycle end in {path:?}");
    }
    assert_eq!(
        path,
        vec![
            (Initialization, Entry),
            (Initialization, WakeUpSecond),
            (Initialization, WriteConfig),
            (Initialization, ReadConfig),
            (Initialization, CheckConfig),
            (Initialized, Entry),
            (StartMeasurement, Entry),
            (ReadVoltage, Entry),
            (ReadVoltage, VoltageGroup(1)),
            (ReadVoltage, VoltageGroup(2)),
            (ReadVoltage, VoltageGroup(3)),
            (ReadVoltage, VoltageGroup(4)),
            (MuxMeasurement, Entry),
            (MuxMeasurement, MuxClock),
            (MuxMeasurement, MuxReadAck),
            (MuxMeasurement, MuxCheckAck),
            (MuxMeasurement, MuxReadAux),
            (MuxMeasurement, MuxDecode),
            (MuxMeasurement, MuxSelect),
            (MuxMeasurement, MuxClock),
            (MuxMeasurement, MuxReadAck),
            (MuxMeasurement, MuxCheckAck),
            (MuxMeasurement, GpioStart),
            (MuxMeasurement, GpioGroup(0)),
            (MuxMeasurement, GpioGroup(1)),
            (MuxMeasurement, GpioGroup(2)),
            (MeasurementCycleFinished, Entry),
        ]
    );
    assert!(!driver.is_first_cycle_finished());
    step(&mut driver);
    assert!(driver.is_first_cycle_finished());
    assert_eq!(driver.state(), (BalanceControl, Entry));
    assert_eq!(driver.handle().state(), BalanceControl);
    assert_eq!(driver.diagnostics().failures().count(), 0);
}

#[test]
fn held_guard_rejects_trigger() {
    let mut driver = initialized(ChainConfig::default());
    let before = driver.state();
    let timer = driver.acquisition().timer;
    let handle = driver.handle();
    let guard = handle.try_enter().unwrap();
    assert_eq!(driver.trigger(), TriggerOutcome::Rejected);
    assert_eq!(driver.state(), before);
    assert_eq!(driver.acquisition().timer, timer);
    drop(guard);
    assert_ne!(driver.trigger(), TriggerOutcome::Rejected);
}

#[test]
fn transport_failure_restarts_cycle() {
    let mut driver = initialized(ChainConfig::default());
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.state() == (State::ReadVoltage, Substate::VoltageGroup(2))
    }));
    driver.diagnostics_mut().clear();
    driver.bus_mut(0).unwrap().fail_next_transfers(1);
    step(&mut driver);
    assert_eq!(driver.state(), (State::StartMeasurement, Substate::Entry));
    assert_eq!(
        driver.diagnostics().count(Category::Transport, Outcome::NotOk),
        1
    );
    // the next cycle completes normally
    let updates = driver.store().snapshot(0).unwrap().voltage_updates;
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.store().snapshot(0).unwrap().voltage_updates > updates
    }));
}

#[test]
fn wake_up_failure_retries_initialization() {
    let mut driver = driver(ChainConfig::default());
    driver.bus_mut(0).unwrap().fail_next_transfers(1);
    driver
        .set_state_request(StateRequest::new(RequestKind::Init, 0))
        .unwrap();
    step(&mut driver);
    step(&mut driver);
    assert_eq!(driver.state(), (State::Initialization, Substate::Entry));
    step(&mut driver);
    assert_eq!(driver.state(), (State::Initialization, Substate::Entry));
    step(&mut driver);
    assert_eq!(
        driver.state(),
        (State::Initialization, Substate::WakeUpSecond)
    );
    assert!(driver.run_until(MAX_TRIGGERS, |d| d.is_first_cycle_finished()));
}

#[test]
fn config_read_back_is_checked() {
    let mut driver = driver(single_device());
    driver
        .set_state_request(StateRequest::new(RequestKind::Init, 0))
        .unwrap();
    assert!(driver.run_until(MAX_TRIGGERS, |d| d.state().0 == State::Initialized));
    assert_eq!(
        driver
            .diagnostics()
            .count(Category::ConfigReadBack, Outcome::Ok),
        1
    );
    assert!(driver.error_table().pec_ok(0, 0, RegisterGroup::Config));
}

#[test]
fn corrupt_pec_is_scoped_to_one_device() {
    let mut driver = initialized(ChainConfig {
        devices_per_string: 3,
        ..Default::default()
    });
    driver.bus_mut(0).unwrap().set_corrupt_pec(2, true);
    let updates = driver.store().snapshot(0).unwrap().voltage_updates;
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.store().snapshot(0).unwrap().voltage_updates > updates
            && d.state().0 == State::MeasurementCycleFinished
    }));
    let snapshot = driver.store().snapshot(0).unwrap();
    assert!(snapshot.cell_voltages.device_valid(0));
    assert!(snapshot.cell_voltages.device_valid(1));
    assert!(!snapshot.cell_voltages.device_valid(2));
    assert_eq!(snapshot.cell_temperatures.get(2, 0), None);
    assert_eq!(snapshot.gpio_voltages.get(2, 4), None);
    assert_eq!(snapshot.gpio_voltages.get(1, 4), Some(1500));
    assert!(!driver.error_table().device_pec_ok(0, 2));

    driver.bus_mut(0).unwrap().set_corrupt_pec(2, false);
    let updates = snapshot.voltage_updates;
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.store().snapshot(0).unwrap().voltage_updates > updates
    }));
    let snapshot = driver.store().snapshot(0).unwrap();
    assert!(snapshot.cell_voltages.device_valid(2));
    for group in 0..4 {
        assert!(driver
            .error_table()
            .pec_ok(0, 2, RegisterGroup::Voltage(group)));
    }
}

#[test]
fn pec_failure_persists_until_its_group_reads_clean() {
    let mut driver = initialized(ChainConfig::default());
    driver
        .bus_mut(0)
        .unwrap()
        .set_corrupt_pec_on(1, RDCV[1].opcode(), true);
    let updates = driver.store().snapshot(0).unwrap().voltage_updates;
    // a full cycle, so the aux and COMM groups are read cleanly after group B failed
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.store().snapshot(0).unwrap().voltage_updates > updates
            && d.state().0 == State::MeasurementCycleFinished
    }));
    let errors = driver.error_table();
    assert!(!errors.pec_ok(0, 1, RegisterGroup::Voltage(1)));
    assert!(errors.pec_ok(0, 1, RegisterGroup::Voltage(0)));
    assert!(errors.pec_ok(0, 1, RegisterGroup::Voltage(2)));
    assert!(errors.pec_ok(0, 1, RegisterGroup::Comm));
    assert!(!errors.device_pec_ok(0, 1));
    assert!(errors.device_pec_ok(0, 0));
    let snapshot = driver.store().snapshot(0).unwrap();
    assert_eq!(snapshot.cell_voltages.cells.get(1, 3), None);
    assert_eq!(snapshot.cell_voltages.cells.get(1, 5), None);
    assert!(snapshot.cell_voltages.cells.get(1, 6).is_some());
    assert_eq!(snapshot.cell_voltages.valid_cells, 21);

    driver
        .bus_mut(0)
        .unwrap()
        .set_corrupt_pec_on(1, RDCV[1].opcode(), false);
    let updates = snapshot.voltage_updates;
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.store().snapshot(0).unwrap().voltage_updates > updates
    }));
    assert!(driver.error_table().device_pec_ok(0, 1));
    assert_eq!(
        driver.store().snapshot(0).unwrap().cell_voltages.valid_cells,
        24
    );
}

#[test]
fn pec_bypass_accepts_corrupt_frames() {
    let config = ChainConfig {
        pec_bypass: true,
        ..Default::default()
    };
    let mut driver = initialized(config);
    driver.bus_mut(0).unwrap().set_corrupt_pec(1, true);
    let updates = driver.store().snapshot(0).unwrap().voltage_updates;
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.store().snapshot(0).unwrap().voltage_updates > updates
    }));
    let snapshot = driver.store().snapshot(0).unwrap();
    assert!(snapshot.cell_voltages.device_valid(1));
    assert_eq!(driver.diagnostics().count(Category::Pec, Outcome::NotOk), 0);
}

#[test]
fn temperatures_follow_mux_inputs() {
    let mut driver = initialized(ChainConfig::default());
    let bus = driver.bus_mut(0).unwrap();
    bus.set_mux_input(0, 0, 3, 2301);
    bus.set_mux_input(1, 0, 7, 1384);
    bus.set_gpio_millivolts(0, 4, 2100);
    let updates = driver.store().snapshot(0).unwrap().voltage_updates;
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.store().snapshot(0).unwrap().voltage_updates > updates
            && d.state().0 == State::MeasurementCycleFinished
    }));
    let snapshot = driver.store().snapshot(0).unwrap();
    assert_eq!(snapshot.cell_temperatures.get(0, 3), Some(0));
    assert_eq!(snapshot.cell_temperatures.get(1, 7), Some(300));
    assert_eq!(snapshot.mux_voltages.get(1, 7), Some(1384));
    assert_eq!(snapshot.gpio_voltages.get(0, 4), Some(2100));
    // the sequence ends with every switch open
    assert_eq!(driver.bus(0).unwrap().mux_channel(0, 0), None);
}

#[test]
fn open_wire_check_end_to_end() {
    let mut driver = driver(ChainConfig::default());
    driver.bus_mut(0).unwrap().set_open_wire(1, 5, true);
    driver
        .set_state_request(StateRequest::new(RequestKind::Init, 0))
        .unwrap();
    assert!(driver.run_until(MAX_TRIGGERS, |d| d.is_first_cycle_finished()));

    serve(
        &mut driver,
        StateRequest::new(RequestKind::OpenWireCheck, 0),
    );
    let report = driver.store().snapshot(0).unwrap().open_wire.unwrap();
    assert_eq!(report.open_count, 1);
    assert_eq!(report.open[0].bits(), 0);
    assert_eq!(report.open[1].bits(), 1 << 5);
    assert!(report.delta[1][5] < -400);
    assert_eq!(driver.state().0, State::StartMeasurement);
}

#[test]
fn open_wire_pulls_each_direction_before_reading() {
    let config = ChainConfig {
        open_wire_probes: 3,
        ..Default::default()
    };
    let mode = config.adc_mode;
    let discharge = config.discharge_permitted;
    let groups = config.family.voltage_register_groups();
    let mut driver = initialized(config);
    driver.bus_mut(0).unwrap().clear_opcodes();
    serve(
        &mut driver,
        StateRequest::new(RequestKind::OpenWireCheck, 0),
    );

    let pull_up = start_open_wire(mode, ProbeDirection::PullUp, discharge).opcode();
    let pull_down = start_open_wire(mode, ProbeDirection::PullDown, discharge).opcode();
    assert_ne!(pull_up, pull_down);
    let opcodes = driver.bus(0).unwrap().opcodes();
    let first = opcodes.iter().position(|o| *o == pull_up).unwrap();

    let reads: Vec<u16> = RDCV[..groups].iter().map(|c| c.opcode()).collect();
    let mut expected = vec![pull_up; 3];
    expected.extend(&reads);
    expected.extend([pull_down; 3]);
    expected.extend(&reads);
    assert_eq!(&opcodes[first..], expected.as_slice());
}

#[test]
fn open_wire_boundary_on_full_scale_family() {
    let config = ChainConfig {
        family: ChipFamily::Ltc6813,
        voltage_inputs_used: vec![true; 18],
        ..Default::default()
    };
    let mut driver = initialized(config);
    driver.bus_mut(0).unwrap().set_open_wire(0, 0, true);
    driver.bus_mut(0).unwrap().set_open_wire(1, 18, true);
    serve(
        &mut driver,
        StateRequest::new(RequestKind::OpenWireCheck, 0),
    );
    let report = driver.store().snapshot(0).unwrap().open_wire.unwrap();
    assert_eq!(report.open[0].bits(), 1);
    assert_eq!(report.open[1].bits(), 1 << 18);
    assert_eq!(report.open_count, 2);
}

#[test]
fn balancing_requests_reach_every_device() {
    let mut used = vec![true; 12];
    used[2] = false;
    let config = ChainConfig {
        voltage_inputs_used: used,
        ..Default::default()
    };
    let mut driver = initialized(config);
    driver.store().set_balancing(0, 0, 2, true);
    driver.store().set_balancing(0, 1, 10, true);
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.bus(0).unwrap().discharge(1).register_a != 0
    }));
    let bus = driver.bus(0).unwrap();
    // cell block 2 sits on input 3 once input 2 is unused
    assert_eq!(bus.discharge(0).register_a, 1 << 3);
    assert_eq!(bus.discharge(1).register_a, 1 << 11);

    driver.store().set_balancing(0, 0, 2, false);
    driver.store().set_balancing(0, 1, 10, false);
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.bus(0).unwrap().discharge(1).register_a == 0
    }));
    assert_eq!(driver.bus(0).unwrap().discharge(0).register_a, 0);
}

#[test]
fn peripherals_behind_the_bridge() {
    let mut driver = initialized(ChainConfig::default());
    let bus = driver.bus_mut(0).unwrap();
    bus.set_io_expander_inputs(0, 0x5A);
    bus.set_io_expander_inputs(1, 0xA5);
    bus.set_board_temperature(1, -55);

    driver.store().set_io_expander_outputs(0, &[0x0F, 0xF0]);
    serve(&mut driver, StateRequest::new(RequestKind::IoExpanderWrite, 0));
    assert_eq!(driver.bus(0).unwrap().io_expander_outputs(0), 0x0F);
    assert_eq!(driver.bus(0).unwrap().io_expander_outputs(1), 0xF0);

    serve(&mut driver, StateRequest::new(RequestKind::IoExpanderRead, 0));
    let snapshot = driver.store().snapshot(0).unwrap();
    assert_eq!(snapshot.io_expander_inputs, vec![Some(0x5A), Some(0xA5)]);

    driver.store().set_eeprom_write_data(0, &[0x11, 0x22]);
    serve(
        &mut driver,
        StateRequest::new(RequestKind::EepromWrite { address: 0x42 }, 0),
    );
    assert_eq!(driver.bus(0).unwrap().eeprom(0, 0x42), 0x11);
    assert_eq!(driver.bus(0).unwrap().eeprom(1, 0x42), 0x22);

    serve(
        &mut driver,
        StateRequest::new(RequestKind::EepromRead { address: 0x42 }, 0),
    );
    let snapshot = driver.store().snapshot(0).unwrap();
    assert_eq!(
        snapshot.eeprom_data,
        Some((0x42, vec![Some(0x11), Some(0x22)]))
    );

    serve(
        &mut driver,
        StateRequest::new(RequestKind::TemperatureSensorRead, 0),
    );
    let snapshot = driver.store().snapshot(0).unwrap();
    assert_eq!(snapshot.board_temperatures, vec![Some(250), Some(-55)]);

    serve(&mut driver, StateRequest::new(RequestKind::BalancingFeedback, 0));
    let snapshot = driver.store().snapshot(0).unwrap();
    assert_eq!(snapshot.balancing_feedback.get(0, 0), Some(15000));
    assert_eq!(
        driver
            .diagnostics()
            .count(Category::PeripheralAck, Outcome::NotOk),
        0
    );
}

#[test]
fn nack_marks_only_that_device() {
    let mut driver = initialized(ChainConfig::default());
    driver.bus_mut(0).unwrap().set_io_expander_inputs(0, 0x33);
    driver.bus_mut(0).unwrap().set_i2c_nack(1, true);
    driver.diagnostics_mut().clear();
    serve(&mut driver, StateRequest::new(RequestKind::IoExpanderRead, 0));
    let snapshot = driver.store().snapshot(0).unwrap();
    assert_eq!(snapshot.io_expander_inputs, vec![Some(0x33), None]);
    assert_eq!(
        driver
            .diagnostics()
            .count(Category::PeripheralAck, Outcome::NotOk),
        1
    );

    // the multiplexer on that device does not answer either
    let updates = snapshot.voltage_updates;
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.store().snapshot(0).unwrap().voltage_updates > updates
            && d.state().0 == State::MeasurementCycleFinished
    }));
    assert!(driver.error_table().mux_ack_failed(0, 1, 0));
    assert!(!driver.error_table().mux_ack_failed(0, 0, 0));
    let snapshot = driver.store().snapshot(0).unwrap();
    assert_eq!(snapshot.cell_temperatures.get(1, 0), None);
    assert!(snapshot.cell_temperatures.get(0, 0).is_some());
}

#[test]
fn request_boundary() {
    let mut driver = driver(ChainConfig::default());
    assert_eq!(
        driver.set_state_request(StateRequest::new(RequestKind::OpenWireCheck, 0)),
        Err(RequestError::NotInitialized)
    );
    assert_eq!(
        driver.set_state_request(StateRequest::new(RequestKind::Init, 1)),
        Err(RequestError::IllegalString(1))
    );
    driver
        .set_state_request(StateRequest::new(RequestKind::Init, 0))
        .unwrap();
    assert!(driver.run_until(MAX_TRIGGERS, |d| d.is_first_cycle_finished()));
    assert_eq!(
        driver.set_state_request(StateRequest::new(RequestKind::Init, 0)),
        Err(RequestError::AlreadyInitialized)
    );
    driver
        .set_state_request(StateRequest::new(RequestKind::TemperatureSensorRead, 0))
        .unwrap();
    assert_eq!(
        driver.set_state_request(StateRequest::new(RequestKind::BalancingFeedback, 0)),
        Err(RequestError::Pending)
    );
}

#[test]
fn strings_are_served_in_turn() {
    let config = ChainConfig {
        strings: 2,
        ..Default::default()
    };
    let mut driver = driver(config);
    driver
        .set_state_request(StateRequest::new(RequestKind::Init, 0))
        .unwrap();
    assert!(driver.run_until(MAX_TRIGGERS, |d| {
        d.state().0 == State::MeasurementCycleFinished
    }));
    assert_eq!(driver.acquisition().current_string, 0);
    step(&mut driver);
    assert!(!driver.is_first_cycle_finished());
    assert!(driver.run_until(MAX_TRIGGERS, |d| d.is_first_cycle_finished()));
    assert_eq!(driver.acquisition().current_string, 1);
    for string in 0..2 {
        let snapshot = driver.store().snapshot(string).unwrap();
        assert_eq!(snapshot.voltage_updates, 1);
        assert_eq!(snapshot.cell_voltages.valid_cells, 24);
    }
    assert!(driver.bus(1).unwrap().is_awake());

    // side requests run on the requested string
    driver.bus_mut(1).unwrap().set_board_temperature(0, 123);
    serve(
        &mut driver,
        StateRequest::new(RequestKind::TemperatureSensorRead, 1),
    );
    let snapshot = driver.store().snapshot(1).unwrap();
    assert_eq!(snapshot.board_temperatures[0], Some(123));
    assert_eq!(
        driver.store().snapshot(0).unwrap().board_temperatures[0],
        None
    );
}
