/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

#![warn(missing_docs)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::missing_errors_doc
)]

//! `utilitary` is the hub side of the UtilitaryRS serial protocol.
//!
//! A [`DeviceHub`] owns the table of known devices on the bus and
//! drives each of them through discovery, identification and steady
//! operation: queued commands, blob requests, scheduled telemetry,
//! health polling and chunked file delivery. The application observes
//! the bus through the [`HubObserver`] callbacks and feeds the hub
//! from its own loop: received bytes go into
//! [`DeviceHub::update`], and [`DeviceHub::process`] runs the timeout
//! and scheduling work, at least every ~50 ms.
//!
//! The wire level lives in [`utilitary-device`](utilitary_device),
//! re-exported here as [`device`].

pub mod hub;
pub mod observer;

pub use hub::{Clock, DeviceHub, DeviceState, HubConfig};
pub use observer::HubObserver;

pub use utilitary_device as device;

use thiserror::Error;

/// A specialized `Result` type for hub operations.
pub type HubResult<T> = std::result::Result<T, HubError>;

/// The error type for hub-side device manipulation.
#[derive(Debug, Error)]
pub enum HubError {
    /// No registered device carries this name.
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    /// The device exists but is not in the `Running` state.
    #[error("device is not running")]
    NotRunning,

    /// The device is not suspended.
    #[error("device is not suspended")]
    NotSuspended,

    /// A request to the device is already outstanding.
    #[error("a request to the device is already outstanding")]
    Busy,

    /// Chunk sizes must fit the one-byte wire length field.
    #[error("invalid chunk size: {0}")]
    InvalidChunkSize(usize),
}
