//! States of the acquisition state machine.

#[cfg(feature = "protocol_serde")]
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum State {
    NeverRun,
    Uninitialized,
    Initialization,
    Initialized,
    StartMeasurement,
    ReadVoltage,
    MuxMeasurement,
    MeasurementCycleFinished,
    BalanceControl,
    OpenWireCheck,
    IoExpander,
    Eeprom,
    TemperatureSensor,
    BalancingFeedback,
}

/// Position inside a state. Every state starts at [`Substate::Entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "protocol_serde", derive(Serialize))]
pub enum Substate {
    Entry,
    // initialization
    WakeUpSecond,
    WriteConfig,
    WriteConfigB,
    ReadConfig,
    CheckConfig,
    /// Decode the previous voltage group and read this one.
    VoltageGroup(u8),
    // multiplexer sequence
    MuxSelect,
    MuxClock,
    MuxReadAck,
    MuxCheckAck,
    MuxReadAux,
    MuxDecode,
    GpioStart,
    /// Decode the previous auxiliary group and read this one.
    GpioGroup(u8),
    BalanceWriteB,
    PullUpProbe,
    PullDownProbe,
    // I2C bridge phases
    BridgeSend(u8),
    BridgeClock(u8),
    BridgeReadBack(u8),
    BridgeExtract(u8),
    FeedbackRead,
    FeedbackDecode,
}

/// How the voltage read states are being used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReusageMode {
    #[default]
    NotReused,
    ReuseForPullUp,
    ReuseForPullDown,
}

/// Target of a transition: state, substate and the ticks to wait before it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub state: State,
    pub substate: Substate,
    pub timer: u16,
}

impl Step {
    /// Enters `state` at its entry substate.
    pub const fn enter(state: State, timer: u16) -> Self {
        Self {
            state,
            substate: Substate::Entry,
            timer,
        }
    }

    pub const fn within(state: State, substate: Substate, timer: u16) -> Self {
        Self {
            state,
            substate,
            timer,
        }
    }
}

/// Picks the success or the failure step of a conditional transition.
pub fn select_step<T, E>(result: &Result<T, E>, success: Step, failure: Step) -> Step {
    if result.is_ok() {
        success
    } else {
        failure
    }
}

/// Result of one trigger call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Another trigger is running.
    Rejected,
    /// The settle timer has not expired.
    Waiting,
    /// One step ran.
    Executed,
}
