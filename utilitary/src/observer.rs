/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Application-side event interface of the hub.

use auto_impl::auto_impl;

use utilitary_device::protocol::{DeviceVersion, Health, MessageType, Status};

/// Receiver of hub events.
///
/// Callbacks run synchronously from [`DeviceHub::update`] and
/// [`DeviceHub::process`] and must not call back into the hub.
/// Devices are identified by name; the hub never hands out references
/// into its own table.
///
/// [`DeviceHub::update`]: crate::DeviceHub::update
/// [`DeviceHub::process`]: crate::DeviceHub::process
#[auto_impl(&mut, Box)]
pub trait HubObserver {
    /// A request to `name` went unacknowledged past the timeout.
    fn on_ack_not_received(&mut self, name: &str, msg_type: MessageType);

    /// An acknowledge matching the outstanding request arrived.
    fn on_ack_received(&mut self, name: &str, msg_type: MessageType, code: Status);

    /// A queued command was acknowledged with `code`.
    fn on_command_result(&mut self, name: &str, code: Status);

    /// A blob request was acknowledged with a failure code instead of
    /// an answer.
    fn on_request_error(&mut self, name: &str, code: Status);

    /// Data answer to a blob request. The returned code is
    /// acknowledged back to the device.
    fn on_blob_answer(&mut self, name: &str, request: u8, data: &[u8]) -> Status;

    /// A device completed discovery and identification.
    fn on_device_registered(&mut self, name: &str, version: DeviceVersion);

    /// A device exceeded the consecutive-timeout budget. The hub
    /// re-enters probing for it afterwards.
    fn on_device_lost(&mut self, name: &str);

    /// A file transfer finished; `code` is `Ok` only after a
    /// successful finalize acknowledge.
    fn on_file_write_result(&mut self, name: &str, code: Status);

    /// A health answer matching the outstanding health request arrived.
    fn on_device_health(&mut self, name: &str, health: Health, flags: u16);
}
