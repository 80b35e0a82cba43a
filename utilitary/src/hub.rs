/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The hub control loop.
//!
//! [`DeviceHub`] embeds a protocol [`Node`] whose application adapter
//! is the device table. Incoming frames mutate the table through the
//! node hooks; [`DeviceHub::process`] walks the table in UID order and
//! emits at most one frame per device per tick, so the half-duplex
//! link never collides with itself. Per device everything is strictly
//! stop-and-wait: a new send is gated on the single pending
//! transaction slot being empty.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use auto_impl::auto_impl;
use tracing::{debug, info, warn};

use utilitary_device::handler::{Node, NodeApp, NodeCore, Transport};
use utilitary_device::protocol::crc::crc64;
use utilitary_device::protocol::{DeviceVersion, Health, MessageType, Status, RESERVED_UID};

use crate::{HubError, HubObserver, HubResult};

/// Receive/send buffer budget of the hub node.
const HUB_PARSER_SIZE: usize = 256;

/// Monotonic time source of the hub.
///
/// Within a run the value only grows; wrap handling is up to the
/// caller.
#[auto_impl(&, Box, Rc, Arc)]
pub trait Clock {
    /// Milliseconds since an arbitrary epoch.
    fn now(&self) -> Duration;
}

/// Timing knobs of the control loop.
///
/// `Default` carries the protocol's nominal values; tests shrink them.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// How long a request may stay unacknowledged.
    pub ack_timeout: Duration,
    /// Consecutive timeouts before a device is declared lost.
    pub lost_threshold: u32,
    /// Revisit delay for a running device.
    pub idle_delay: Duration,
    /// Re-probe delay while a device is being discovered.
    pub probe_delay: Duration,
    /// Retry delay for the identification request.
    pub info_delay: Duration,
    /// Extra delay after a `Wait` chunk acknowledge.
    pub wait_delay: Duration,
    /// Delay around the file finalize exchange.
    pub finalize_delay: Duration,
    /// Health poll period per running device.
    pub health_period: Duration,
    /// Highest UID scanned by [`DeviceHub::probe_all`].
    pub max_probe_uid: u8,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_millis(200),
            lost_threshold: 20,
            idle_delay: Duration::from_millis(50),
            probe_delay: Duration::from_millis(1000),
            info_delay: Duration::from_millis(1000),
            wait_delay: Duration::from_millis(200),
            finalize_delay: Duration::from_millis(500),
            health_period: Duration::from_millis(1000),
            max_probe_uid: 32,
        }
    }
}

/// Lifecycle of a device as seen by the hub.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    /// Reachability is being established with probes.
    Probing,
    /// The device answers probes; its identity is being requested.
    InfoRequest,
    /// Registered and serving queued work.
    Running,
    /// A file transfer is in progress.
    FileTransfer,
    /// Externally parked; the loop performs no outbound work.
    Suspended,
    /// The consecutive-timeout budget was exceeded.
    Lost,
}

#[derive(Clone, Copy, Debug)]
struct PendingTransfer {
    number: u8,
    msg_type: MessageType,
    sent_at: Duration,
}

#[derive(Clone, Copy, Debug)]
struct TelemetryUnit {
    request: u8,
    size: u8,
    period: Duration,
    last_fired: Duration,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TransferState {
    Request,
    Sending,
    Finalize,
    Cancel,
}

#[derive(Clone, Debug)]
struct FileTransfer {
    file: u8,
    data: Vec<u8>,
    chunk_size: usize,
    sent_offset: usize,
    chunks_sent: u16,
    packet_ack: Option<Status>,
    first_packet: bool,
    state: TransferState,
}

struct Device {
    uid: u8,
    name: String,
    version: DeviceVersion,
    state: DeviceState,
    pending: Option<PendingTransfer>,
    next_call: Duration,
    last_ack: Duration,
    last_health_req: Duration,
    commands: VecDeque<(u8, u8)>,
    requests: VecDeque<(u8, u8)>,
    telemetry: Vec<TelemetryUnit>,
    timeout_counter: u32,
    transfer: Option<FileTransfer>,
}

impl Device {
    fn new(uid: u8) -> Self {
        Self {
            uid,
            name: String::new(),
            version: DeviceVersion::default(),
            state: DeviceState::Probing,
            pending: None,
            next_call: Duration::from_millis(0),
            last_ack: Duration::from_millis(0),
            last_health_req: Duration::from_millis(0),
            commands: VecDeque::new(),
            requests: VecDeque::new(),
            telemetry: Vec::new(),
            timeout_counter: 0,
            transfer: None,
        }
    }
}

/// Device table and scheduling state; the node application adapter of
/// the hub.
struct HubCore<C, O> {
    devices: BTreeMap<u8, Device>,
    name_to_uid: HashMap<String, u8>,
    observer: O,
    clock: C,
    config: HubConfig,
}

impl<C: Clock, O: HubObserver> HubCore<C, O> {
    fn device_by_name(&mut self, name: &str) -> HubResult<&mut Device> {
        let uid = *self
            .name_to_uid
            .get(name)
            .ok_or_else(|| HubError::UnknownDevice(name.to_string()))?;
        self.devices
            .get_mut(&uid)
            .ok_or_else(|| HubError::UnknownDevice(name.to_string()))
    }

    fn running_device(&mut self, name: &str) -> HubResult<&mut Device> {
        let dev = self.device_by_name(name)?;
        if dev.state != DeviceState::Running {
            return Err(HubError::NotRunning);
        }
        Ok(dev)
    }

    /// One scheduler tick: the timeout arm first, then at most one
    /// scheduled send per device.
    fn process<I: Transport>(&mut self, node: &mut NodeCore<I>, now: Duration) {
        for (_, dev) in self.devices.iter_mut() {
            if let Some(pending) = dev.pending {
                if now >= pending.sent_at + self.config.ack_timeout {
                    dev.timeout_counter += 1;
                    debug!(
                        uid = dev.uid,
                        counter = dev.timeout_counter,
                        "acknowledge timed out"
                    );
                    if dev.timeout_counter >= self.config.lost_threshold {
                        dev.timeout_counter = 0;
                        dev.state = DeviceState::Lost;
                    }
                    self.observer.on_ack_not_received(&dev.name, pending.msg_type);
                    if dev.state == DeviceState::FileTransfer {
                        if let Some(ctx) = dev.transfer.as_mut() {
                            ctx.state = TransferState::Cancel;
                        }
                    }
                    dev.pending = None;
                }
            }

            if now < dev.next_call || dev.pending.is_some() {
                continue;
            }

            let mut delay = self.config.idle_delay;
            match dev.state {
                DeviceState::Probing => {
                    let number = node.send_probe(dev.uid);
                    dev.pending = Some(PendingTransfer {
                        number,
                        msg_type: MessageType::Probe,
                        sent_at: now,
                    });
                    delay = self.config.probe_delay;
                }

                DeviceState::InfoRequest => {
                    let number = node.send_device_info_request(dev.uid);
                    dev.pending = Some(PendingTransfer {
                        number,
                        msg_type: MessageType::DeviceInfoReq,
                        sent_at: now,
                    });
                    delay = self.config.info_delay;
                }

                DeviceState::Running => {
                    if let Some((command, value)) = dev.commands.pop_front() {
                        let number = node.send_command(dev.uid, command, value);
                        dev.pending = Some(PendingTransfer {
                            number,
                            msg_type: MessageType::Command,
                            sent_at: now,
                        });
                    } else if let Some((request, size)) = dev.requests.pop_front() {
                        let number = node.send_blob_request(dev.uid, request, size);
                        dev.pending = Some(PendingTransfer {
                            number,
                            msg_type: MessageType::BlobRequest,
                            sent_at: now,
                        });
                    } else if let Some(slot) = dev
                        .telemetry
                        .iter_mut()
                        .find(|slot| now >= slot.last_fired + slot.period)
                    {
                        slot.last_fired = now;
                        let (request, size) = (slot.request, slot.size);
                        let number = node.send_blob_request(dev.uid, request, size);
                        dev.pending = Some(PendingTransfer {
                            number,
                            msg_type: MessageType::BlobRequest,
                            sent_at: now,
                        });
                    } else if now >= dev.last_health_req + self.config.health_period {
                        dev.last_health_req = now;
                        let number = node.send_health_request(dev.uid);
                        dev.pending = Some(PendingTransfer {
                            number,
                            msg_type: MessageType::HealthReq,
                            sent_at: now,
                        });
                    }
                }

                DeviceState::FileTransfer => {
                    delay =
                        Self::drive_transfer(dev, node, &mut self.observer, &self.config, now);
                }

                DeviceState::Suspended => {}

                DeviceState::Lost => {
                    warn!(name = %dev.name, uid = dev.uid, "device lost");
                    self.observer.on_device_lost(&dev.name);
                    dev.state = DeviceState::Probing;
                }
            }

            dev.next_call = now + delay;
        }
    }

    /// Drives the multi-phase file transfer of one device and returns
    /// the revisit delay.
    fn drive_transfer<I: Transport>(
        dev: &mut Device,
        node: &mut NodeCore<I>,
        observer: &mut O,
        config: &HubConfig,
        now: Duration,
    ) -> Duration {
        if dev.transfer.as_ref().map(|ctx| ctx.state) == Some(TransferState::Cancel) {
            let code = dev
                .transfer
                .take()
                .and_then(|ctx| ctx.packet_ack)
                .unwrap_or(Status::Error);
            dev.state = DeviceState::Running;
            warn!(name = %dev.name, %code, "file transfer aborted");
            observer.on_file_write_result(&dev.name, code);
            return config.idle_delay;
        }

        let ctx = match dev.transfer.as_mut() {
            Some(ctx) => ctx,
            None => {
                dev.state = DeviceState::Running;
                return config.idle_delay;
            }
        };

        match ctx.state {
            TransferState::Request => {
                let number = node.file_write_request(dev.uid, ctx.file, ctx.data.len() as u32);
                dev.pending = Some(PendingTransfer {
                    number,
                    msg_type: MessageType::FileWriteRequest,
                    sent_at: now,
                });
                config.idle_delay
            }

            TransferState::Sending => {
                if ctx.first_packet {
                    // The opening chunk goes out without consulting the
                    // per-chunk acknowledge slot.
                    ctx.first_packet = false;
                    let number = Self::send_current_chunk(node, dev.uid, ctx);
                    dev.pending = Some(PendingTransfer {
                        number,
                        msg_type: MessageType::FileWriteChunk,
                        sent_at: now,
                    });
                    return config.idle_delay;
                }

                match ctx.packet_ack.take() {
                    None => {
                        // The timeout arm consumed the transaction.
                        ctx.state = TransferState::Cancel;
                        config.idle_delay
                    }
                    Some(Status::Busy) => {
                        let number = Self::send_current_chunk(node, dev.uid, ctx);
                        dev.pending = Some(PendingTransfer {
                            number,
                            msg_type: MessageType::FileWriteChunk,
                            sent_at: now,
                        });
                        config.idle_delay
                    }
                    Some(Status::Wait) => {
                        // Back off, then retransmit the same chunk
                        // unconditionally on the next visit.
                        ctx.first_packet = true;
                        config.wait_delay
                    }
                    Some(Status::Ok) => {
                        let sent = ctx.chunk_size.min(ctx.data.len() - ctx.sent_offset);
                        ctx.sent_offset += sent;
                        ctx.chunks_sent += 1;
                        if ctx.sent_offset == ctx.data.len() {
                            ctx.state = TransferState::Finalize;
                            config.finalize_delay
                        } else {
                            let number = Self::send_current_chunk(node, dev.uid, ctx);
                            dev.pending = Some(PendingTransfer {
                                number,
                                msg_type: MessageType::FileWriteChunk,
                                sent_at: now,
                            });
                            config.idle_delay
                        }
                    }
                    Some(other) => {
                        ctx.packet_ack = Some(other);
                        ctx.state = TransferState::Cancel;
                        config.idle_delay
                    }
                }
            }

            TransferState::Finalize => {
                let crc = crc64(&ctx.data);
                let number = node.file_write_finalize(dev.uid, ctx.file, ctx.chunks_sent, crc);
                dev.pending = Some(PendingTransfer {
                    number,
                    msg_type: MessageType::FileWriteFinalize,
                    sent_at: now,
                });
                config.finalize_delay
            }

            // Handled before the state dispatch.
            TransferState::Cancel => config.idle_delay,
        }
    }

    fn send_current_chunk<I: Transport>(
        node: &mut NodeCore<I>,
        uid: u8,
        ctx: &FileTransfer,
    ) -> u8 {
        let len = ctx.chunk_size.min(ctx.data.len() - ctx.sent_offset);
        node.file_write_chunk(uid, ctx.file, &ctx.data[ctx.sent_offset..ctx.sent_offset + len])
    }
}

impl<I, C, O> NodeApp<I> for HubCore<C, O>
where
    I: Transport,
    C: Clock,
    O: HubObserver,
{
    fn handle_ack(&mut self, _node: &mut NodeCore<I>, transmitter: u8, number: u8, code: Status) {
        let now = self.clock.now();
        let dev = match self.devices.entry(transmitter) {
            Entry::Vacant(entry) => {
                // A node that answers a probe spontaneously is admitted
                // and driven through the regular discovery states.
                debug!(uid = transmitter, "acknowledge from unknown node, admitting");
                entry.insert(Device::new(transmitter));
                return;
            }
            Entry::Occupied(entry) => entry.into_mut(),
        };
        dev.last_ack = now;

        let pending = match dev.pending {
            Some(pending) if pending.number == number => pending,
            _ => return,
        };
        self.observer
            .on_ack_received(&dev.name, pending.msg_type, code);

        match dev.state {
            DeviceState::Probing => {
                if code.is_ok() {
                    dev.state = DeviceState::InfoRequest;
                }
            }

            DeviceState::Running => match pending.msg_type {
                MessageType::Command => self.observer.on_command_result(&dev.name, code),
                // Blob requests succeed with a data answer; an
                // acknowledge in their place is a failure report.
                MessageType::BlobRequest => self.observer.on_request_error(&dev.name, code),
                MessageType::Reboot => {}
                _ => {}
            },

            DeviceState::FileTransfer => match pending.msg_type {
                MessageType::FileWriteChunk => {
                    if let Some(ctx) = dev.transfer.as_mut() {
                        ctx.packet_ack = Some(code);
                    }
                }
                MessageType::FileWriteRequest => {
                    if let Some(ctx) = dev.transfer.as_mut() {
                        ctx.state = if code.is_ok() {
                            TransferState::Sending
                        } else {
                            TransferState::Cancel
                        };
                    }
                }
                MessageType::FileWriteFinalize => {
                    dev.state = DeviceState::Running;
                    dev.transfer = None;
                    info!(name = %dev.name, %code, "file transfer finished");
                    self.observer.on_file_write_result(&dev.name, code);
                }
                _ => {}
            },

            DeviceState::InfoRequest | DeviceState::Suspended | DeviceState::Lost => {}
        }

        dev.pending = None;
        dev.timeout_counter = 0;
    }

    fn handle_blob_answer(
        &mut self,
        _node: &mut NodeCore<I>,
        transmitter: u8,
        number: u8,
        request: u8,
        data: &[u8],
    ) -> Status {
        let dev = match self.devices.get_mut(&transmitter) {
            Some(dev) => dev,
            None => return Status::Error,
        };
        match dev.pending {
            Some(pending)
                if pending.number == number && pending.msg_type == MessageType::BlobRequest =>
            {
                dev.pending = None;
                dev.timeout_counter = 0;
                self.observer.on_blob_answer(&dev.name, request, data)
            }
            _ => Status::Error,
        }
    }

    fn handle_device_info_answer(
        &mut self,
        _node: &mut NodeCore<I>,
        transmitter: u8,
        _number: u8,
        version: DeviceVersion,
        name: &[u8],
    ) {
        let dev = match self.devices.get_mut(&transmitter) {
            Some(dev) => dev,
            None => return,
        };
        if dev.state != DeviceState::InfoRequest {
            return;
        }

        if let Some(pending) = dev.pending {
            if pending.msg_type == MessageType::DeviceInfoReq {
                dev.pending = None;
                dev.timeout_counter = 0;
            }
        }

        dev.name = String::from_utf8_lossy(name).into_owned();
        dev.version = version;
        dev.state = DeviceState::Running;

        if let Some(previous) = self.name_to_uid.insert(dev.name.clone(), transmitter) {
            if previous != transmitter {
                warn!(
                    name = %dev.name,
                    previous,
                    uid = transmitter,
                    "device name re-registered under a new uid"
                );
            }
        }

        info!(name = %dev.name, version = %dev.version, uid = transmitter, "device registered");
        self.observer.on_device_registered(&dev.name, version);
    }

    fn handle_device_health(
        &mut self,
        _node: &mut NodeCore<I>,
        transmitter: u8,
        number: u8,
        health: Health,
        flags: u16,
    ) {
        let dev = match self.devices.get_mut(&transmitter) {
            Some(dev) => dev,
            None => return,
        };
        match dev.pending {
            Some(pending)
                if pending.number == number && pending.msg_type == MessageType::HealthReq =>
            {
                dev.pending = None;
                dev.timeout_counter = 0;
                self.observer.on_device_health(&dev.name, health, flags);
            }
            _ => {}
        }
    }
}

/// Coordinator of a device bus.
///
/// Wraps a protocol [`Node`] whose adapter is the device table. The
/// application drives it with [`update`](Self::update) for received
/// bytes and [`process`](Self::process) for scheduled work.
pub struct DeviceHub<I, C, O> {
    node: Node<I, HubCore<C, O>>,
}

impl<I, C, O> DeviceHub<I, C, O>
where
    I: Transport,
    C: Clock,
    O: HubObserver,
{
    /// Creates a hub named `Master` on the reserved point-to-point
    /// UID, with the default configuration.
    pub fn new(version: DeviceVersion, interface: I, clock: C, observer: O) -> Self {
        Self::with_config(version, interface, clock, observer, HubConfig::default())
    }

    /// Creates a hub with explicit timing configuration.
    pub fn with_config(
        version: DeviceVersion,
        interface: I,
        clock: C,
        observer: O,
        config: HubConfig,
    ) -> Self {
        let core = NodeCore::new("Master", version, RESERVED_UID, interface, HUB_PARSER_SIZE);
        let app = HubCore {
            devices: BTreeMap::new(),
            name_to_uid: HashMap::new(),
            observer,
            clock,
            config,
        };
        Self {
            node: Node::new(core, app),
        }
    }

    /// Feeds received bytes into the hub; completed frames run the
    /// table updates and observer callbacks inline.
    pub fn update(&mut self, bytes: &[u8]) {
        self.node.update(bytes);
    }

    /// Runs one scheduler tick: timeout detection, queue draining,
    /// telemetry, health polling and the file-transfer driver. Call
    /// at least every ~50 ms.
    pub fn process(&mut self, now: Duration) {
        let core = &mut self.node.core;
        let app = &mut self.node.app;
        app.process(core, now);
    }

    /// Scans the bus with probes; devices are admitted when they
    /// answer. With `broadcast` a single probe goes to the reserved
    /// UID; only for links with arbitration or selective addressing.
    pub fn probe_all(&mut self, broadcast: bool) {
        if broadcast {
            self.node.core.send_probe(RESERVED_UID);
            return;
        }
        let max = self.node.app.config.max_probe_uid;
        for uid in 1..=max {
            self.node.core.send_probe(uid);
        }
    }

    /// Queues a command for a running device; it is emitted on a later
    /// tick, one per acknowledge round-trip, in FIFO order.
    pub fn send_cmd_to_device(&mut self, name: &str, command: u8, value: u8) -> HubResult<()> {
        let dev = self.node.app.running_device(name)?;
        dev.commands.push_back((command, value));
        Ok(())
    }

    /// Queues a one-shot blob request for a running device.
    pub fn send_blob_request_to_device(
        &mut self,
        name: &str,
        request: u8,
        size: u8,
    ) -> HubResult<()> {
        let dev = self.node.app.running_device(name)?;
        dev.requests.push_back((request, size));
        Ok(())
    }

    /// Adds a periodic telemetry request for a device.
    pub fn create_sched_request(
        &mut self,
        name: &str,
        request: u8,
        size: u8,
        period: Duration,
    ) -> HubResult<()> {
        let dev = self.node.app.device_by_name(name)?;
        dev.telemetry.push(TelemetryUnit {
            request,
            size,
            period,
            last_fired: Duration::from_millis(0),
        });
        Ok(())
    }

    /// Sends a reboot command directly, still honouring the
    /// stop-and-wait slot.
    pub fn send_reboot_to_device(&mut self, name: &str, magic: u64) -> HubResult<()> {
        let core = &mut self.node.core;
        let app = &mut self.node.app;
        let now = app.clock.now();
        let dev = app.running_device(name)?;
        if dev.pending.is_some() {
            return Err(HubError::Busy);
        }
        let number = core.send_reboot_cmd(dev.uid, magic);
        dev.pending = Some(PendingTransfer {
            number,
            msg_type: MessageType::Reboot,
            sent_at: now,
        });
        Ok(())
    }

    /// Starts a chunked file transfer to a running device. `data` is
    /// copied into the transfer context; progress and the final code
    /// surface through
    /// [`HubObserver::on_file_write_result`].
    #[tracing::instrument(skip(self, data), level = "info", fields(len = data.len()))]
    pub fn send_file(
        &mut self,
        name: &str,
        file: u8,
        data: &[u8],
        chunk_size: usize,
    ) -> HubResult<()> {
        if chunk_size == 0 || chunk_size > 0xFF {
            return Err(HubError::InvalidChunkSize(chunk_size));
        }
        let dev = self.node.app.running_device(name)?;
        dev.state = DeviceState::FileTransfer;
        dev.transfer = Some(FileTransfer {
            file,
            data: data.to_vec(),
            chunk_size,
            sent_offset: 0,
            chunks_sent: 0,
            packet_ack: None,
            first_packet: true,
            state: TransferState::Request,
        });
        Ok(())
    }

    /// Parks a running device; the loop stops touching it until
    /// [`resume_device`](Self::resume_device).
    pub fn suspend_device(&mut self, name: &str) -> HubResult<()> {
        let dev = self.node.app.running_device(name)?;
        dev.state = DeviceState::Suspended;
        Ok(())
    }

    /// Returns a suspended device to normal operation.
    pub fn resume_device(&mut self, name: &str) -> HubResult<()> {
        let dev = self.node.app.device_by_name(name)?;
        if dev.state != DeviceState::Suspended {
            return Err(HubError::NotSuspended);
        }
        dev.state = DeviceState::Running;
        Ok(())
    }

    /// Current lifecycle state of a registered device.
    pub fn device_state(&self, name: &str) -> Option<DeviceState> {
        let uid = self.node.app.name_to_uid.get(name)?;
        self.node.app.devices.get(uid).map(|dev| dev.state)
    }

    /// Number of queued, not yet emitted commands for a device.
    pub fn queued_commands(&self, name: &str) -> usize {
        self.node
            .app
            .name_to_uid
            .get(name)
            .and_then(|uid| self.node.app.devices.get(uid))
            .map_or(0, |dev| dev.commands.len())
    }

    /// Number of queued, not yet emitted blob requests for a device.
    pub fn queued_requests(&self, name: &str) -> usize {
        self.node
            .app
            .name_to_uid
            .get(name)
            .and_then(|uid| self.node.app.devices.get(uid))
            .map_or(0, |dev| dev.requests.len())
    }

    /// Time of the last acknowledge received from a device, if any
    /// arrived yet.
    pub fn last_seen(&self, name: &str) -> Option<Duration> {
        let uid = self.node.app.name_to_uid.get(name)?;
        let dev = self.node.app.devices.get(uid)?;
        if dev.last_ack > Duration::from_millis(0) {
            Some(dev.last_ack)
        } else {
            None
        }
    }

    /// Every known device as `(uid, state)`, in UID order. Devices
    /// still in discovery have no name yet and only show up here.
    pub fn known_devices(&self) -> Vec<(u8, DeviceState)> {
        self.node
            .app
            .devices
            .iter()
            .map(|(&uid, dev)| (uid, dev.state))
            .collect()
    }

    /// Timing configuration of this hub.
    pub fn config(&self) -> &HubConfig {
        &self.node.app.config
    }
}
