//! The acquisition state machine.
//!
//! [`AfeDriver::trigger`] is called periodically. Every call either waits for
//! the settle timer of the last step or runs exactly one step: one bus
//! primitive plus the bookkeeping around it. Strings are served one after the
//! other:
//!
//! ```text
//! START_MEASUREMENT -> READ_VOLTAGE -> MUX_MEASUREMENT -> MEASUREMENT_CYCLE_FINISHED
//!        ^                                                    |          |
//!        |                                          pending request   none
//!        |                                                    v          v
//!        +------------------- side state <--------------------+   BALANCE_CONTROL
//!        +------------------------------- next string <-----------------+
//! ```

use crate::balancing::{pack_string, DischargeMask};
use crate::calibration::TemperatureCurve;
use crate::command::{
    start_cell_adc, start_gpio_adc, start_open_wire, Command, ProbeDirection, RDAUX, RDCFGA,
    RDCOMM, RDCV, WRCFGA, WRCFGB, WRCOMM,
};
use crate::config::{CellChannel, ChainConfig, GpioChannel};
use crate::diag::{Category, DiagnosticReporter, Outcome, Scope};
use crate::error::{BusError, ConfigError, Error, RequestError};
use crate::frame::{
    build_command_frame, build_read_frame, build_write_frame, check_frame_pec, device_payload,
    Payload,
};
use crate::i2c::{self, Transaction};
use crate::measurement::{
    BalancingFeedback, CellTemperatures, CellVoltages, ErrorTable, GpioVoltages, MuxVoltages,
    RegisterGroup,
};
use crate::open_wire::{detect, BoundaryRule};
use crate::registers::{
    code_to_millivolts, config_a, config_b, config_matches, decode_gpio_group,
    decode_voltage_group, gpio_code, gpio_location,
};
use crate::request::{AfeHandle, RequestKind, StateRequest};
use crate::state::{select_step, ReusageMode, State, Step, Substate, TriggerOutcome};
use crate::store::MeasurementStore;
use crate::timing::SettleTimes;
use crate::transport::BusTransport;

/// Mutable core record of the state machine.
#[derive(Debug, Clone)]
pub struct AcquisitionState {
    pub state: State,
    pub substate: Substate,
    pub previous_state: State,
    pub previous_substate: Substate,
    /// Triggers to wait before the next step runs.
    pub timer: u16,
    pub current_string: usize,
    /// Side request being served.
    pub request: Option<StateRequest>,
    pub cell_channel: CellChannel,
    pub mux_cursor: usize,
    pub probe_count: u8,
    pub reusage: ReusageMode,
    pub settle: SettleTimes,
    /// Strings that completed at least one measurement cycle.
    pub measured: Vec<bool>,
    discharge: Vec<DischargeMask>,
    bridge: Vec<Vec<Transaction>>,
    bridge_ok: Vec<bool>,
}

impl AcquisitionState {
    fn new(config: &ChainConfig) -> Self {
        Self {
            state: State::NeverRun,
            substate: Substate::Entry,
            previous_state: State::NeverRun,
            previous_substate: Substate::Entry,
            timer: 0,
            current_string: 0,
            request: None,
            cell_channel: CellChannel::All,
            mux_cursor: 0,
            probe_count: 0,
            reusage: ReusageMode::NotReused,
            settle: SettleTimes::new(config),
            measured: vec![false; config.strings],
            discharge: Vec::new(),
            bridge: Vec::new(),
            bridge_ok: Vec::new(),
        }
    }
}

/// Working buffers of one string.
#[derive(Debug, Clone)]
struct StringBuffers {
    voltages: CellVoltages,
    pull_up: CellVoltages,
    pull_down: CellVoltages,
    temperatures: CellTemperatures,
    gpio: GpioVoltages,
    mux: MuxVoltages,
    feedback: BalancingFeedback,
    /// Configuration register A as last written.
    config_a: Vec<Payload>,
}

impl StringBuffers {
    fn new(config: &ChainConfig) -> Self {
        let devices = config.devices_per_string;
        let cells = config.cell_blocks();
        Self {
            voltages: CellVoltages::new(devices, cells),
            pull_up: CellVoltages::new(devices, cells),
            pull_down: CellVoltages::new(devices, cells),
            temperatures: CellTemperatures::new(devices, config.temperature_sensors_per_device),
            gpio: GpioVoltages::new(devices, config.gpios()),
            mux: MuxVoltages::new(devices, config.mux_slots()),
            feedback: BalancingFeedback::new(devices, 1),
            config_a: vec![config_a(DischargeMask::default()); devices],
        }
    }
}

/// Driver of all strings of a battery.
///
/// `B` is the bus of one string, `D` receives diagnostics and `S` is the
/// measurement store results are committed to.
pub struct AfeDriver<B, D, S> {
    config: ChainConfig,
    curve: TemperatureCurve,
    input_to_cell: Vec<Option<usize>>,
    cell_to_input: Vec<usize>,
    buses: Vec<B>,
    reporter: D,
    store: S,
    handle: AfeHandle,
    acq: AcquisitionState,
    errors: ErrorTable,
    buffers: Vec<StringBuffers>,
    rx: Vec<u8>,
}

impl<B, D, S> AfeDriver<B, D, S>
where
    B: BusTransport,
    D: DiagnosticReporter,
    S: MeasurementStore,
{
    /// Creates a driver with one bus per configured string.
    pub fn new(config: ChainConfig, buses: Vec<B>, reporter: D, store: S) -> Result<Self, Error> {
        config.validate()?;
        if buses.len() != config.strings {
            return Err(ConfigError::Invalid(format!(
                "{} bus interfaces for {} strings",
                buses.len(),
                config.strings
            ))
            .into());
        }
        let curve = TemperatureCurve::new(config.temperature_curve.clone())?;
        log::info!(
            "AFE driver: {:?}, {} string(s) of {} device(s), {} cell blocks per device",
            config.family,
            config.strings,
            config.devices_per_string,
            config.cell_blocks()
        );
        Ok(Self {
            curve,
            input_to_cell: config.input_to_cell(),
            cell_to_input: config.cell_to_input(),
            handle: AfeHandle::new(config.strings),
            acq: AcquisitionState::new(&config),
            errors: ErrorTable::new(config.strings, config.devices_per_string),
            buffers: (0..config.strings)
                .map(|_| StringBuffers::new(&config))
                .collect(),
            rx: vec![0; config.frame_len()],
            buses,
            reporter,
            store,
            config,
        })
    }

    /// Runs at most one step.
    pub fn trigger(&mut self) -> TriggerOutcome {
        let handle = self.handle.clone();
        let Some(_guard) = handle.try_enter() else {
            log::debug!("Trigger rejected, driver busy");
            return TriggerOutcome::Rejected;
        };
        if self.acq.timer > 0 {
            self.acq.timer -= 1;
            if self.acq.timer > 0 {
                return TriggerOutcome::Waiting;
            }
        }
        if let Some(step) = self.run_step() {
            self.apply(step);
        }
        TriggerOutcome::Executed
    }

    /// Triggers until `done` holds, at most `max_triggers` times.
    pub fn run_until(&mut self, max_triggers: usize, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max_triggers {
            if done(self) {
                return true;
            }
            self.trigger();
        }
        done(self)
    }

    pub fn set_state_request(&self, request: StateRequest) -> Result<(), RequestError> {
        self.handle.set_state_request(request)
    }

    pub fn state(&self) -> (State, Substate) {
        (self.acq.state, self.acq.substate)
    }

    pub fn is_first_cycle_finished(&self) -> bool {
        self.handle.is_first_cycle_finished()
    }

    /// Handle for other tasks.
    pub fn handle(&self) -> AfeHandle {
        self.handle.clone()
    }

    pub fn acquisition(&self) -> &AcquisitionState {
        &self.acq
    }

    pub fn error_table(&self) -> &ErrorTable {
        &self.errors
    }

    pub fn config(&self) -> &ChainConfig {
        &self.config
    }

    pub fn diagnostics(&self) -> &D {
        &self.reporter
    }

    pub fn diagnostics_mut(&mut self) -> &mut D {
        &mut self.reporter
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn bus(&self, string: usize) -> Option<&B> {
        self.buses.get(string)
    }

    pub fn bus_mut(&mut self, string: usize) -> Option<&mut B> {
        self.buses.get_mut(string)
    }

    fn apply(&mut self, step: Step) {
        let substate = if step.state == self.acq.state {
            step.substate
        } else {
            Substate::Entry
        };
        log::debug!(
            "String {}: {:?}/{:?} -> {:?}/{:?} timer={}",
            self.acq.current_string,
            self.acq.state,
            self.acq.substate,
            step.state,
            substate,
            step.timer
        );
        self.acq.previous_state = self.acq.state;
        self.acq.previous_substate = self.acq.substate;
        self.acq.state = step.state;
        self.acq.substate = substate;
        self.acq.timer = step.timer.max(1);
        self.handle.publish(step.state, substate);
    }

    fn run_step(&mut self) -> Option<Step> {
        let step = match self.acq.state {
            State::NeverRun => Step::enter(State::Uninitialized, 1),
            State::Uninitialized => return self.uninitialized(),
            State::Initialization => self.initialization(),
            State::Initialized => Step::enter(State::StartMeasurement, 1),
            State::StartMeasurement => self.start_measurement(),
            State::ReadVoltage => self.read_voltage(),
            State::MuxMeasurement => self.mux_measurement(),
            State::MeasurementCycleFinished => self.cycle_finished(),
            State::BalanceControl => self.balance_control(),
            State::OpenWireCheck => self.open_wire_check(),
            State::IoExpander | State::Eeprom | State::TemperatureSensor => self.bridge(),
            State::BalancingFeedback => self.balancing_feedback(),
        };
        Some(step)
    }

    // ----- helpers -----

    fn devices(&self) -> usize {
        self.config.devices_per_string
    }

    fn device_index(&self, device: usize) -> usize {
        self.acq.current_string * self.devices() + device
    }

    fn restart(&self) -> Step {
        Step::enter(State::StartMeasurement, 1)
    }

    fn unexpected(&self) -> Step {
        log::error!(
            "Unexpected substate {:?} in {:?}",
            self.acq.substate,
            self.acq.state
        );
        self.restart()
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), BusError> {
        log::trace!("transmit {:02X?}", frame);
        self.buses[self.acq.current_string].transmit_command(frame)
    }

    fn send_command(&mut self, command: Command) -> Result<(), BusError> {
        self.send(&build_command_frame(command))
    }

    fn read(&mut self, command: Command) -> Result<(), BusError> {
        let frame = build_read_frame(command, self.devices());
        self.rx.resize(frame.len(), 0);
        let result = self.buses[self.acq.current_string].transmit_receive(&frame, &mut self.rx);
        if result.is_ok() {
            log::trace!("received {:02X?}", self.rx);
        }
        result
    }

    fn bridge_clock(&mut self) -> Result<(), BusError> {
        self.buses[self.acq.current_string].transmit_i2c_bridge_clock(&i2c::bridge_strobe())
    }

    /// Reports the bus result and picks the matching step.
    fn transition(&mut self, result: Result<(), BusError>, success: Step, failure: Step) -> Step {
        let string = self.acq.current_string;
        let step = select_step(&result, success, failure);
        if let Err(e) = &result {
            log::warn!(
                "Bus failure on string {} in {:?}/{:?}: {}",
                string,
                self.acq.state,
                self.acq.substate,
                e
            );
        }
        self.reporter.report(
            Category::Transport,
            Outcome::from(result.is_ok()),
            Scope::String,
            string,
        );
        step
    }

    /// Checks the PEC of every device slot in the receive buffer read from `group`.
    fn check_pec(&mut self, group: RegisterGroup) -> Vec<bool> {
        let string = self.acq.current_string;
        let valid = check_frame_pec(&self.rx, self.devices(), self.config.pec_bypass);
        for (device, ok) in valid.iter().enumerate() {
            self.errors.set_pec(string, device, group, *ok);
            let index = self.device_index(device);
            self.reporter
                .report(Category::Pec, Outcome::from(*ok), Scope::Device, index);
        }
        valid
    }

    fn advance_string(&mut self) {
        self.acq.current_string = (self.acq.current_string + 1) % self.config.strings;
    }

    // ----- states -----

    fn uninitialized(&mut self) -> Option<Step> {
        let request = self.handle.take_request_entering(|request| {
            matches!(request.kind, RequestKind::Init).then_some(State::Initialization)
        });
        match request {
            Some(StateRequest {
                kind: RequestKind::Init,
                ..
            }) => {
                log::info!("Initializing {} string(s)", self.config.strings);
                self.acq.current_string = 0;
                self.acq.measured.iter_mut().for_each(|m| *m = false);
                self.errors.reset();
                self.buffers = (0..self.config.strings)
                    .map(|_| StringBuffers::new(&self.config))
                    .collect();
                Some(Step::enter(State::Initialization, 1))
            }
            Some(request) => {
                log::warn!("Dropping {request:?} before initialization");
                None
            }
            None => None,
        }
    }

    fn initialization(&mut self) -> Step {
        let ticks = self.acq.settle;
        let retry = Step::within(State::Initialization, Substate::Entry, 1);
        let within = |substate, timer| Step::within(State::Initialization, substate, timer);
        match self.acq.substate {
            Substate::Entry => {
                let result = self.buses[self.acq.current_string].transmit_wake_up();
                self.transition(result, within(Substate::WakeUpSecond, ticks.wake_up), retry)
            }
            Substate::WakeUpSecond => {
                let result = self.buses[self.acq.current_string].transmit_wake_up();
                self.transition(result, within(Substate::WriteConfig, ticks.wake_up), retry)
            }
            Substate::WriteConfig => {
                let payloads = vec![config_a(DischargeMask::default()); self.devices()];
                self.buffers[self.acq.current_string].config_a = payloads.clone();
                let result = self.send(&build_write_frame(WRCFGA, &payloads));
                let next = if self.config.family.has_config_b() {
                    Substate::WriteConfigB
                } else {
                    Substate::ReadConfig
                };
                self.transition(result, within(next, ticks.transfer), retry)
            }
            Substate::WriteConfigB => {
                let payloads = vec![config_b(DischargeMask::default()); self.devices()];
                let result = self.send(&build_write_frame(WRCFGB, &payloads));
                self.transition(result, within(Substate::ReadConfig, ticks.transfer), retry)
            }
            Substate::ReadConfig => {
                let result = self.read(RDCFGA);
                self.transition(result, within(Substate::CheckConfig, ticks.transfer), retry)
            }
            Substate::CheckConfig => {
                let string = self.acq.current_string;
                let pec = self.check_pec(RegisterGroup::Config);
                for (device, ok) in pec.iter().enumerate() {
                    let written = &self.buffers[string].config_a[device];
                    let matches = *ok && config_matches(written, device_payload(&self.rx, device));
                    let index = self.device_index(device);
                    self.reporter.report(
                        Category::ConfigReadBack,
                        Outcome::from(matches),
                        Scope::Device,
                        index,
                    );
                }
                if string + 1 < self.config.strings {
                    self.acq.current_string += 1;
                    retry
                } else {
                    self.acq.current_string = 0;
                    Step::enter(State::Initialized, 1)
                }
            }
            _ => self.unexpected(),
        }
    }

    fn start_measurement(&mut self) -> Step {
        if let Some(request) = self.acq.request.take() {
            log::warn!("Abandoned {request:?}");
        }
        self.acq.reusage = ReusageMode::NotReused;
        self.acq.probe_count = 0;
        let channel = self.acq.cell_channel;
        let command = start_cell_adc(
            self.config.adc_mode,
            self.config.discharge_permitted,
            channel,
        );
        let ticks = if channel.is_single() {
            self.acq.settle.cell_single
        } else {
            self.acq.settle.cell_all
        };
        let result = self.send_command(command);
        let failure = self.restart();
        self.transition(result, Step::enter(State::ReadVoltage, ticks), failure)
    }

    fn read_voltage(&mut self) -> Step {
        let group = match self.acq.substate {
            Substate::Entry => 0,
            Substate::VoltageGroup(group) => usize::from(group),
            _ => return self.unexpected(),
        };
        let string = self.acq.current_string;
        if group > 0 {
            let pec = self.check_pec(RegisterGroup::Voltage(group - 1));
            let buffers = &mut self.buffers[string];
            let target = match self.acq.reusage {
                ReusageMode::NotReused => &mut buffers.voltages,
                ReusageMode::ReuseForPullUp => &mut buffers.pull_up,
                ReusageMode::ReuseForPullDown => &mut buffers.pull_down,
            };
            decode_voltage_group(&self.rx, group - 1, &pec, &self.input_to_cell, target);
        }

        if group < self.config.family.voltage_register_groups() {
            let result = self.read(RDCV[group]);
            let success = Step::within(
                State::ReadVoltage,
                Substate::VoltageGroup(group as u8 + 1),
                self.acq.settle.transfer,
            );
            let failure = self.restart();
            return self.transition(result, success, failure);
        }

        let buffers = &mut self.buffers[string];
        match self.acq.reusage {
            ReusageMode::NotReused => {
                buffers.voltages.finalize();
                log::debug!(
                    "String {}: pack {} mV, {} valid cells",
                    string,
                    buffers.voltages.pack_millivolts,
                    buffers.voltages.valid_cells
                );
                self.store.write_cell_voltages(string, &buffers.voltages);
                Step::enter(State::MuxMeasurement, 1)
            }
            ReusageMode::ReuseForPullUp => {
                buffers.pull_up.finalize();
                Step::enter(State::OpenWireCheck, 1)
            }
            ReusageMode::ReuseForPullDown => {
                buffers.pull_down.finalize();
                Step::enter(State::OpenWireCheck, 1)
            }
        }
    }

    fn mux_measurement(&mut self) -> Step {
        let ticks = self.acq.settle;
        let within = |substate, timer| Step::within(State::MuxMeasurement, substate, timer);
        let failure = self.restart();
        match self.acq.substate {
            Substate::Entry => {
                self.acq.mux_cursor = 0;
                if self.config.mux_sequence.is_empty() {
                    self.finish_mux()
                } else {
                    self.mux_select()
                }
            }
            Substate::MuxSelect => self.mux_select(),
            Substate::MuxClock => {
                let result = self.bridge_clock();
                self.transition(result, within(Substate::MuxReadAck, ticks.bridge_clock), failure)
            }
            Substate::MuxReadAck => {
                let result = self.read(RDCOMM);
                self.transition(result, within(Substate::MuxCheckAck, ticks.transfer), failure)
            }
            Substate::MuxCheckAck => {
                let string = self.acq.current_string;
                let step = self.config.mux_sequence[self.acq.mux_cursor];
                let transaction =
                    i2c::mux_select(self.config.peripherals.mux(step.mux), step.channel);
                let pec = self.check_pec(RegisterGroup::Comm);
                for (device, pec_ok) in pec.iter().enumerate() {
                    let ok = *pec_ok
                        && i2c::acknowledged(&transaction, device_payload(&self.rx, device));
                    self.errors.set_mux_ack_failed(string, device, step.mux, !ok);
                    let index = self.device_index(device);
                    self.reporter
                        .report(Category::MuxAck, Outcome::from(ok), Scope::Device, index);
                }
                if step.channel.is_none() {
                    return self.next_mux();
                }
                let command =
                    start_gpio_adc(self.config.adc_mode, GpioChannel::Gpio(self.config.mux_gpio));
                let result = self.send_command(command);
                self.transition(result, within(Substate::MuxReadAux, ticks.gpio_single), failure)
            }
            Substate::MuxReadAux => {
                let (group, _) = gpio_location(self.config.mux_gpio);
                let result = self.read(RDAUX[group]);
                self.transition(result, within(Substate::MuxDecode, ticks.transfer), failure)
            }
            Substate::MuxDecode => {
                self.decode_mux();
                self.next_mux()
            }
            Substate::GpioStart => {
                let command = start_gpio_adc(self.config.adc_mode, GpioChannel::All);
                let result = self.send_command(command);
                self.transition(result, within(Substate::GpioGroup(0), ticks.gpio_all), failure)
            }
            Substate::GpioGroup(group) => self.gpio_group(usize::from(group)),
            _ => self.unexpected(),
        }
    }

    fn mux_select(&mut self) -> Step {
        let step = self.config.mux_sequence[self.acq.mux_cursor];
        let transaction =
            i2c::mux_select(self.config.peripherals.mux(step.mux), step.channel);
        let payloads = vec![i2c::encode(&transaction); self.devices()];
        let result = self.send(&build_write_frame(WRCOMM, &payloads));
        let success = Step::within(
            State::MuxMeasurement,
            Substate::MuxClock,
            self.acq.settle.transfer,
        );
        let failure = self.restart();
        self.transition(result, success, failure)
    }

    fn decode_mux(&mut self) {
        let string = self.acq.current_string;
        let step = self.config.mux_sequence[self.acq.mux_cursor];
        let Some(channel) = step.channel else {
            return;
        };
        let (aux_group, _) = gpio_location(self.config.mux_gpio);
        let pec = self.check_pec(RegisterGroup::Aux(aux_group));
        let slot = usize::from(step.mux) * 8 + usize::from(channel);
        for (device, pec_ok) in pec.iter().enumerate() {
            let usable = *pec_ok && !self.errors.mux_ack_failed(string, device, step.mux);
            let buffers = &mut self.buffers[string];
            if !usable {
                buffers.mux.invalidate(device, slot);
                if let Some(sensor) = step.sensor {
                    buffers.temperatures.invalidate(device, sensor);
                }
                continue;
            }
            let millivolts = code_to_millivolts(gpio_code(&self.rx, device, self.config.mux_gpio));
            buffers.mux.set(device, slot, millivolts);
            if let Some(sensor) = step.sensor {
                let millivolts = i32::from(millivolts);
                let converted = i16::try_from(self.curve.deci_celsius(millivolts)).ok();
                match converted {
                    Some(deci_celsius) => buffers.temperatures.set(device, sensor, deci_celsius),
                    None => buffers.temperatures.invalidate(device, sensor),
                }
                let index = string * self.config.devices_per_string + device;
                self.reporter.report(
                    Category::Range,
                    Outcome::from(converted.is_some() && self.curve.covers(millivolts)),
                    Scope::Device,
                    index,
                );
            }
        }
    }

    fn next_mux(&mut self) -> Step {
        self.acq.mux_cursor += 1;
        if self.acq.mux_cursor < self.config.mux_sequence.len() {
            Step::within(State::MuxMeasurement, Substate::MuxSelect, 1)
        } else {
            self.finish_mux()
        }
    }

    fn finish_mux(&mut self) -> Step {
        let string = self.acq.current_string;
        let buffers = &self.buffers[string];
        self.store
            .write_cell_temperatures(string, &buffers.temperatures);
        self.store.write_mux_voltages(string, &buffers.mux);
        if self.config.measure_all_gpios {
            Step::within(State::MuxMeasurement, Substate::GpioStart, 1)
        } else {
            Step::enter(State::MeasurementCycleFinished, 1)
        }
    }

    fn gpio_group(&mut self, group: usize) -> Step {
        let string = self.acq.current_string;
        if group > 0 {
            let pec = self.check_pec(RegisterGroup::Aux(group - 1));
            decode_gpio_group(
                &self.rx,
                self.config.family,
                group - 1,
                &pec,
                &mut self.buffers[string].gpio,
            );
        }
        if group < self.config.family.aux_register_groups() {
            let result = self.read(RDAUX[group]);
            let success = Step::within(
                State::MuxMeasurement,
                Substate::GpioGroup(group as u8 + 1),
                self.acq.settle.transfer,
            );
            let failure = self.restart();
            return self.transition(result, success, failure);
        }
        self.store
            .write_gpio_voltages(string, &self.buffers[string].gpio);
        Step::enter(State::MeasurementCycleFinished, 1)
    }

    fn cycle_finished(&mut self) -> Step {
        let string = self.acq.current_string;
        self.acq.measured[string] = true;
        if self.acq.measured.iter().all(|measured| *measured)
            && self.handle.latch_first_cycle_finished()
        {
            log::info!("First measurement cycle finished");
        }
        match self.handle.take_request() {
            Some(request) => self.dispatch(request),
            None => Step::enter(State::BalanceControl, 1),
        }
    }

    fn dispatch(&mut self, request: StateRequest) -> Step {
        let state = match request.kind {
            RequestKind::IoExpanderWrite | RequestKind::IoExpanderRead => State::IoExpander,
            RequestKind::EepromRead { .. } | RequestKind::EepromWrite { .. } => State::Eeprom,
            RequestKind::TemperatureSensorRead => State::TemperatureSensor,
            RequestKind::BalancingFeedback => State::BalancingFeedback,
            RequestKind::OpenWireCheck => State::OpenWireCheck,
            RequestKind::Init => {
                log::warn!("Dropping init request, already initialized");
                return Step::enter(State::BalanceControl, 1);
            }
        };
        log::debug!("Serving {request:?}");
        self.acq.current_string = request.string;
        self.acq.request = Some(request);
        Step::enter(state, 1)
    }

    fn balance_control(&mut self) -> Step {
        let string = self.acq.current_string;
        let has_config_b = self.config.family.has_config_b();
        let transfer = self.acq.settle.transfer;
        let failure = self.restart();
        match self.acq.substate {
            Substate::Entry => {
                let control = self.store.read_balancing_control(string);
                log::debug!("String {}: {} cell block(s) balancing", string, control.active());
                let mut masks = pack_string(&control, &self.cell_to_input);
                masks.resize(self.devices(), DischargeMask::default());
                let payloads: Vec<Payload> = masks.iter().map(|mask| config_a(*mask)).collect();
                self.buffers[string].config_a = payloads.clone();
                self.acq.discharge = masks;
                let result = self.send(&build_write_frame(WRCFGA, &payloads));
                if has_config_b {
                    let success =
                        Step::within(State::BalanceControl, Substate::BalanceWriteB, transfer);
                    return self.transition(result, success, failure);
                }
                let ok = result.is_ok();
                let step =
                    self.transition(result, Step::enter(State::StartMeasurement, transfer), failure);
                if ok {
                    self.advance_string();
                }
                step
            }
            Substate::BalanceWriteB => {
                let payloads: Vec<Payload> =
                    self.acq.discharge.iter().map(|mask| config_b(*mask)).collect();
                let result = self.send(&build_write_frame(WRCFGB, &payloads));
                let ok = result.is_ok();
                let step =
                    self.transition(result, Step::enter(State::StartMeasurement, transfer), failure);
                if ok {
                    self.advance_string();
                }
                step
            }
            _ => self.unexpected(),
        }
    }

    fn open_wire_check(&mut self) -> Step {
        match (self.acq.substate, self.acq.reusage) {
            (Substate::Entry, ReusageMode::NotReused) => {
                let string = self.acq.current_string;
                let devices = self.devices();
                let cells = self.config.cell_blocks();
                self.buffers[string].pull_up = CellVoltages::new(devices, cells);
                self.buffers[string].pull_down = CellVoltages::new(devices, cells);
                self.acq.probe_count = 0;
                self.probe(ProbeDirection::PullUp)
            }
            (Substate::Entry, ReusageMode::ReuseForPullUp) => {
                self.acq.probe_count = 0;
                self.probe(ProbeDirection::PullDown)
            }
            (Substate::Entry, ReusageMode::ReuseForPullDown) => self.evaluate_open_wire(),
            (Substate::PullUpProbe, _) => self.probe(ProbeDirection::PullUp),
            (Substate::PullDownProbe, _) => self.probe(ProbeDirection::PullDown),
            _ => self.unexpected(),
        }
    }

    fn probe(&mut self, direction: ProbeDirection) -> Step {
        let command = start_open_wire(
            self.config.adc_mode,
            direction,
            self.config.discharge_permitted,
        );
        let result = self.send_command(command);
        let ticks = self.acq.settle.open_wire;
        self.acq.probe_count += 1;
        let success = if self.acq.probe_count < self.config.open_wire_probes {
            let substate = match direction {
                ProbeDirection::PullUp => Substate::PullUpProbe,
                ProbeDirection::PullDown => Substate::PullDownProbe,
            };
            Step::within(State::OpenWireCheck, substate, ticks)
        } else {
            if result.is_ok() {
                self.acq.reusage = match direction {
                    ProbeDirection::PullUp => ReusageMode::ReuseForPullUp,
                    ProbeDirection::PullDown => ReusageMode::ReuseForPullDown,
                };
            }
            Step::enter(State::ReadVoltage, ticks)
        };
        let failure = self.restart();
        self.transition(result, success, failure)
    }

    fn evaluate_open_wire(&mut self) -> Step {
        let string = self.acq.current_string;
        let buffers = &self.buffers[string];
        let report = detect(
            &buffers.pull_up,
            &buffers.pull_down,
            BoundaryRule::for_family(self.config.family),
            self.config.open_wire_threshold_mv,
        );
        if report.open_count > 0 {
            log::warn!(
                "String {}: {} open sense wire(s)",
                string,
                report.open_count
            );
        } else {
            log::info!("String {string}: no open sense wire");
        }
        self.store.write_open_wire(string, &report);
        self.acq.reusage = ReusageMode::NotReused;
        self.acq.request = None;
        Step::enter(State::StartMeasurement, 1)
    }

    /// Transactions of the running side request, per phase and device.
    fn bridge_phases(&self) -> Option<Vec<Vec<Transaction>>> {
        let request = self.acq.request?;
        let string = request.string;
        let devices = self.devices();
        let addresses = self.config.peripherals;
        let same = |transaction: Transaction| vec![transaction; devices];
        let phases = match request.kind {
            RequestKind::IoExpanderWrite => {
                let outputs = self.store.read_io_expander_outputs(string);
                vec![(0..devices)
                    .map(|device| {
                        let value = outputs.get(device).copied().unwrap_or_default();
                        i2c::io_expander_write(addresses.io_expander, value)
                    })
                    .collect()]
            }
            RequestKind::IoExpanderRead => vec![same(i2c::io_expander_read(addresses.io_expander))],
            RequestKind::EepromRead { address } => vec![
                same(i2c::eeprom_address_phase(addresses.eeprom, address)),
                same(i2c::eeprom_read_phase(addresses.eeprom)),
            ],
            RequestKind::EepromWrite { address } => {
                let data = self.store.read_eeprom_write_data(string);
                vec![
                    same(i2c::eeprom_address_phase(addresses.eeprom, address)),
                    (0..devices)
                        .map(|device| {
                            i2c::eeprom_write_phase(data.get(device).copied().unwrap_or_default())
                        })
                        .collect(),
                ]
            }
            RequestKind::TemperatureSensorRead => {
                vec![same(i2c::temperature_sensor_read(
                    addresses.temperature_sensor,
                ))]
            }
            _ => return None,
        };
        Some(phases)
    }

    fn bridge(&mut self) -> Step {
        let state = self.acq.state;
        let ticks = self.acq.settle;
        let failure = self.restart();
        match self.acq.substate {
            Substate::Entry => {
                let Some(phases) = self.bridge_phases() else {
                    log::error!("No peripheral request to serve in {state:?}");
                    return failure;
                };
                self.acq.bridge = phases;
                self.acq.bridge_ok = vec![true; self.devices()];
                self.bridge_send(0)
            }
            Substate::BridgeSend(phase) => self.bridge_send(phase),
            Substate::BridgeClock(phase) => {
                let result = self.bridge_clock();
                let success = Step::within(state, Substate::BridgeReadBack(phase), ticks.bridge_clock);
                self.transition(result, success, failure)
            }
            Substate::BridgeReadBack(phase) => {
                let result = self.read(RDCOMM);
                let success = Step::within(state, Substate::BridgeExtract(phase), ticks.transfer);
                self.transition(result, success, failure)
            }
            Substate::BridgeExtract(phase) => self.bridge_extract(phase),
            _ => self.unexpected(),
        }
    }

    fn bridge_send(&mut self, phase: u8) -> Step {
        let payloads: Vec<Payload> = self.acq.bridge[usize::from(phase)]
            .iter()
            .map(i2c::encode)
            .collect();
        let result = self.send(&build_write_frame(WRCOMM, &payloads));
        let success = Step::within(
            self.acq.state,
            Substate::BridgeClock(phase),
            self.acq.settle.transfer,
        );
        let failure = self.restart();
        self.transition(result, success, failure)
    }

    fn bridge_extract(&mut self, phase: u8) -> Step {
        let string = self.acq.current_string;
        let pec = self.check_pec(RegisterGroup::Comm);
        let transactions = &self.acq.bridge[usize::from(phase)];
        let results: Vec<Result<[u8; 3], Error>> = transactions
            .iter()
            .enumerate()
            .map(|(device, transaction)| {
                i2c::read_back(&self.rx, device, transaction, pec[device], string)
            })
            .collect();
        for (device, result) in results.iter().enumerate() {
            let index = self.device_index(device);
            match result {
                Ok(_) => self
                    .reporter
                    .report(Category::PeripheralAck, Outcome::Ok, Scope::Device, index),
                Err(Error::BridgeAck { .. }) => {
                    self.reporter
                        .report(Category::PeripheralAck, Outcome::NotOk, Scope::Device, index)
                }
                Err(_) => {}
            }
            if result.is_err() {
                self.acq.bridge_ok[device] = false;
            }
        }

        if usize::from(phase) + 1 < self.acq.bridge.len() {
            return Step::within(self.acq.state, Substate::BridgeSend(phase + 1), 1);
        }

        let data: Vec<Option<[u8; 3]>> = results
            .into_iter()
            .zip(&self.acq.bridge_ok)
            .map(|(result, ok)| result.ok().filter(|_| *ok))
            .collect();
        match self.acq.request.map(|request| request.kind) {
            Some(RequestKind::IoExpanderRead) => {
                let inputs: Vec<Option<u8>> = data.iter().map(|d| d.map(|b| b[1])).collect();
                self.store.write_io_expander_inputs(string, &inputs);
            }
            Some(RequestKind::EepromRead { address }) => {
                let bytes: Vec<Option<u8>> = data.iter().map(|d| d.map(|b| b[1])).collect();
                self.store.write_eeprom_data(string, address, &bytes);
            }
            Some(RequestKind::TemperatureSensorRead) => {
                let temperatures: Vec<Option<i16>> = data
                    .iter()
                    .map(|d| d.map(|b| i2c::temperature_from_bytes(b[1], b[2])))
                    .collect();
                self.store.write_board_temperatures(string, &temperatures);
            }
            kind => {
                let acknowledged = data.iter().filter(|d| d.is_some()).count();
                log::debug!("{kind:?}: {acknowledged} of {} device(s) acknowledged", data.len());
            }
        }
        self.acq.request = None;
        self.acq.bridge.clear();
        Step::enter(State::StartMeasurement, 1)
    }

    fn balancing_feedback(&mut self) -> Step {
        let gpio = self.config.balancing_feedback_gpio;
        let ticks = self.acq.settle;
        let failure = self.restart();
        match self.acq.substate {
            Substate::Entry => {
                let command = start_gpio_adc(self.config.adc_mode, GpioChannel::Gpio(gpio));
                let result = self.send_command(command);
                let success =
                    Step::within(State::BalancingFeedback, Substate::FeedbackRead, ticks.gpio_single);
                self.transition(result, success, failure)
            }
            Substate::FeedbackRead => {
                let (group, _) = gpio_location(gpio);
                let result = self.read(RDAUX[group]);
                let success =
                    Step::within(State::BalancingFeedback, Substate::FeedbackDecode, ticks.transfer);
                self.transition(result, success, failure)
            }
            Substate::FeedbackDecode => {
                let string = self.acq.current_string;
                let (aux_group, _) = gpio_location(gpio);
                let pec = self.check_pec(RegisterGroup::Aux(aux_group));
                let feedback = &mut self.buffers[string].feedback;
                for (device, ok) in pec.iter().enumerate() {
                    if *ok {
                        feedback.set(device, 0, gpio_code(&self.rx, device, gpio));
                    } else {
                        feedback.invalidate(device, 0);
                    }
                }
                self.store.write_balancing_feedback(string, feedback);
                self.acq.request = None;
                Step::enter(State::StartMeasurement, 1)
            }
            _ => self.unexpected(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ChipFamily;
    use crate::diag::RecordingReporter;
    use crate::simulator::SimulatedChain;
    use crate::store::MemoryStore;

    type SimDriver = AfeDriver<SimulatedChain, RecordingReporter, MemoryStore>;

    fn driver(config: ChainConfig) -> SimDriver {
        let buses = (0..config.strings)
            .map(|_| SimulatedChain::new(&config))
            .collect();
        let store = MemoryStore::new(&config);
        AfeDriver::new(config, buses, RecordingReporter::new(), store).unwrap()
    }

    fn initialized(config: ChainConfig) -> SimDriver {
        let mut driver = driver(config);
        driver
            .set_state_request(StateRequest::new(RequestKind::Init, 0))
            .unwrap();
        assert!(driver.run_until(10_000, |d| d.is_first_cycle_finished()));
        driver
    }

    #[test]
    fn rejects_bus_count_mismatch() {
        let config = ChainConfig {
            strings: 2,
            ..Default::default()
        };
        let buses = vec![SimulatedChain::new(&config)];
        let result = AfeDriver::new(config.clone(), buses, RecordingReporter::new(), MemoryStore::new(&config));
        assert!(matches!(result, Err(Error::Config(ConfigError::Invalid(_)))));
    }

    #[test]
    fn rejects_mux_addresses_beyond_seven_bits() {
        let mut config = ChainConfig::default();
        config.peripherals.mux_base = 0xFE;
        config.mux_sequence[0].mux = 3;
        let buses = vec![SimulatedChain::new(&config)];
        let store = MemoryStore::new(&config);
        let result = AfeDriver::new(config, buses, RecordingReporter::new(), store);
        assert!(matches!(result, Err(Error::Config(ConfigError::Invalid(_)))));
    }

    #[test]
    fn timer_gates_steps() {
        let mut driver = driver(ChainConfig::default());
        assert_eq!(driver.trigger(), TriggerOutcome::Executed);
        assert_eq!(driver.state(), (State::Uninitialized, Substate::Entry));
        // nothing requested, the driver stays put
        assert_eq!(driver.trigger(), TriggerOutcome::Executed);
        assert_eq!(driver.state(), (State::Uninitialized, Substate::Entry));

        driver
            .set_state_request(StateRequest::new(RequestKind::Init, 0))
            .unwrap();
        driver.run_until(100, |d| d.state().0 == State::StartMeasurement);
        assert_eq!(driver.trigger(), TriggerOutcome::Executed);
        assert_eq!(driver.state(), (State::ReadVoltage, Substate::Entry));
        // normal mode conversion takes three ticks of 1 ms
        assert_eq!(driver.acquisition().timer, 3);
        assert_eq!(driver.trigger(), TriggerOutcome::Waiting);
        assert_eq!(driver.trigger(), TriggerOutcome::Waiting);
        assert_eq!(driver.trigger(), TriggerOutcome::Executed);
        assert_eq!(
            driver.state(),
            (State::ReadVoltage, Substate::VoltageGroup(1))
        );
    }

    #[test]
    fn measures_cells_and_temperatures() {
        let mut driver = initialized(ChainConfig::default());
        let snapshot = driver.store().snapshot(0).unwrap();
        assert_eq!(snapshot.cell_voltages.cells.get(1, 11), Some(3600 + 110 + 1));
        assert_eq!(snapshot.cell_voltages.valid_cells, 24);
        // 1700 mV on every channel is 20.0 °C
        assert_eq!(snapshot.cell_temperatures.get(0, 7), Some(200));
        assert_eq!(snapshot.mux_voltages.get(0, 3), Some(1700));
        assert_eq!(snapshot.gpio_voltages.get(1, 4), Some(1500));
        assert_eq!(driver.diagnostics().failures().count(), 0);
        assert!(driver.error_table().device_pec_ok(0, 1));
        driver.diagnostics_mut().clear();
        assert!(driver.run_until(1000, |d| d.store().snapshot(0).unwrap().voltage_updates == 2));
    }

    #[test]
    fn pec_failure_invalidates_device() {
        let mut driver = initialized(ChainConfig::default());
        driver.bus_mut(0).unwrap().set_corrupt_pec(1, true);
        let updates = driver.store().snapshot(0).unwrap().voltage_updates;
        assert!(driver.run_until(1000, |d| {
            d.store().snapshot(0).unwrap().voltage_updates == updates + 1
        }));
        let snapshot = driver.store().snapshot(0).unwrap();
        assert!(snapshot.cell_voltages.device_valid(0));
        assert_eq!(snapshot.cell_voltages.cells.get(1, 0), None);
        assert_eq!(snapshot.cell_voltages.valid_cells, 12);
        assert!(!driver.error_table().device_pec_ok(0, 1));
        assert!(driver.diagnostics().count(Category::Pec, Outcome::NotOk) > 0);
    }

    #[test]
    fn balancing_reaches_config_registers() {
        let config = ChainConfig {
            family: ChipFamily::Ltc6813,
            voltage_inputs_used: vec![true; 18],
            ..Default::default()
        };
        let mut driver = initialized(config);
        let store = driver.store().clone();
        store.set_balancing(0, 0, 0, true);
        store.set_balancing(0, 0, 13, true);
        store.set_balancing(0, 1, 11, true);
        assert!(driver.run_until(1000, |d| d.bus(0).unwrap().discharge(1).register_a != 0));
        assert!(driver.run_until(1000, |d| d.state().0 == State::StartMeasurement));
        let bus = driver.bus(0).unwrap();
        assert_eq!(
            bus.discharge(0),
            DischargeMask {
                register_a: 0x0001,
                register_b: 0x02
            }
        );
        assert_eq!(bus.discharge(1).register_a, 1 << 11);
    }
}
