#![cfg_attr(docsrs, feature(doc_cfg))]
//! # ltc_afe_lib
//!
//! This crate drives daisy chains of LTC68xx battery cell monitors.
//! It contains the PEC15 codec, the command catalog, the frame and register
//! codecs, the I2C bridge codec and the acquisition state machine that ties
//! them to a bus.
//!
//! The physical bus is not part of this crate. Implement [`transport::BusTransport`]
//! for your isoSPI interface, or use the register level [`simulator::SimulatedChain`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `ltc-afe` command-line tool.
//!
//! ### Utility Features
//! - `protocol_serde`: Enables `serde` serialization of the measurement types.
//! - `bin-dependencies`: Enables all features required by the `ltc-afe` binary executable.

pub mod pec;
pub mod command;
pub mod frame;
pub mod registers;
pub mod balancing;
pub mod open_wire;
pub mod i2c;
pub mod calibration;
pub mod config;
pub mod measurement;
pub mod timing;
pub mod state;
pub mod request;
/// Bus interface the driver talks through.
pub mod transport;
pub mod diag;
pub mod store;
pub mod driver;
pub mod simulator;
/// Contains error types for the library.
mod error;

pub use config::ChainConfig;
pub use driver::AfeDriver;
pub use error::{BusError, ConfigError, Error, RequestError};
pub use request::{AfeHandle, RequestKind, StateRequest};
pub use state::{State, Substate, TriggerOutcome};
