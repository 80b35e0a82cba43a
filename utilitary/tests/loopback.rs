/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! End-to-end scenarios over a simulated serial link: a hub and one
//! device node, each writing into its own mock channel, with the test
//! shuttling bytes between them and advancing a manual clock.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use utilitary::device::handler::{Node, NodeApp, NodeCore, Transport};
use utilitary::device::protocol::crc::crc64;
use utilitary::device::protocol::{DeviceVersion, Health, MessageType, Status};
use utilitary::device::{Message, Parser, ParserState, Payload};
use utilitary::{Clock, DeviceHub, DeviceState, HubError, HubObserver};

#[derive(Clone, Default)]
struct MockSerial {
    buf: Rc<RefCell<Vec<u8>>>,
}

impl MockSerial {
    fn take(&self) -> Vec<u8> {
        self.buf.borrow_mut().drain(..).collect()
    }
}

impl Transport for MockSerial {
    fn write(&mut self, bytes: &[u8]) {
        self.buf.borrow_mut().extend_from_slice(bytes);
    }
}

#[derive(Clone, Default)]
struct MockClock {
    millis: Rc<Cell<u64>>,
}

impl MockClock {
    fn advance(&self, ms: u64) {
        self.millis.set(self.millis.get() + ms);
    }

    fn at(&self) -> Duration {
        Duration::from_millis(self.millis.get())
    }
}

impl Clock for MockClock {
    fn now(&self) -> Duration {
        self.at()
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Event {
    AckMissed(String, MessageType),
    AckReceived(String, MessageType, Status),
    CommandResult(String, Status),
    RequestError(String, Status),
    BlobAnswer(String, u8, Vec<u8>),
    Registered(String, DeviceVersion),
    Lost(String),
    FileResult(String, Status),
    HealthReport(String, Health, u16),
}

#[derive(Clone, Default)]
struct Recorder {
    events: Rc<RefCell<Vec<Event>>>,
}

impl Recorder {
    fn all(&self) -> Vec<Event> {
        self.events.borrow().clone()
    }

    fn count(&self, matcher: impl Fn(&Event) -> bool) -> usize {
        self.events.borrow().iter().filter(|e| matcher(e)).count()
    }
}

impl HubObserver for Recorder {
    fn on_ack_not_received(&mut self, name: &str, msg_type: MessageType) {
        self.events
            .borrow_mut()
            .push(Event::AckMissed(name.to_string(), msg_type));
    }

    fn on_ack_received(&mut self, name: &str, msg_type: MessageType, code: Status) {
        self.events
            .borrow_mut()
            .push(Event::AckReceived(name.to_string(), msg_type, code));
    }

    fn on_command_result(&mut self, name: &str, code: Status) {
        self.events
            .borrow_mut()
            .push(Event::CommandResult(name.to_string(), code));
    }

    fn on_request_error(&mut self, name: &str, code: Status) {
        self.events
            .borrow_mut()
            .push(Event::RequestError(name.to_string(), code));
    }

    fn on_blob_answer(&mut self, name: &str, request: u8, data: &[u8]) -> Status {
        self.events
            .borrow_mut()
            .push(Event::BlobAnswer(name.to_string(), request, data.to_vec()));
        Status::Ok
    }

    fn on_device_registered(&mut self, name: &str, version: DeviceVersion) {
        self.events
            .borrow_mut()
            .push(Event::Registered(name.to_string(), version));
    }

    fn on_device_lost(&mut self, name: &str) {
        self.events.borrow_mut().push(Event::Lost(name.to_string()));
    }

    fn on_file_write_result(&mut self, name: &str, code: Status) {
        self.events
            .borrow_mut()
            .push(Event::FileResult(name.to_string(), code));
    }

    fn on_device_health(&mut self, name: &str, health: Health, flags: u16) {
        self.events
            .borrow_mut()
            .push(Event::HealthReport(name.to_string(), health, flags));
    }
}

#[derive(Default)]
struct TestDevice {
    commands: Vec<(u8, u8)>,
    chunks_received: usize,
    busy_on_chunk: Option<usize>,
    file: Vec<u8>,
    expected: usize,
    finalize: Option<(u16, bool)>,
}

impl<I: Transport> NodeApp<I> for TestDevice {
    fn handle_command(&mut self, _node: &mut NodeCore<I>, command: u8, value: u8) -> Status {
        self.commands.push((command, value));
        if command == 0x06 && value == 0x07 {
            Status::Ok
        } else {
            Status::InvalidArg
        }
    }

    fn process_blob_request(
        &mut self,
        node: &mut NodeCore<I>,
        transmitter: u8,
        number: u8,
        request: u8,
        requested_size: u8,
    ) -> Status {
        match (request, requested_size) {
            (2, 4) => {
                let data = 0xAABB_CCDDu32.to_le_bytes();
                if node.send_answer(transmitter, number, request, requested_size, &data) {
                    Status::Ok
                } else {
                    Status::Error
                }
            }
            (7, 2) => {
                let data = 0x1234u16.to_le_bytes();
                if node.send_answer(transmitter, number, request, requested_size, &data) {
                    Status::Ok
                } else {
                    Status::Error
                }
            }
            _ => Status::Unsupported,
        }
    }

    fn handle_reboot(&mut self, _node: &mut NodeCore<I>, magic: u64) -> Status {
        if magic == 0xAABB_CCDD {
            Status::Ok
        } else {
            Status::InvalidArg
        }
    }

    fn handle_file_write_request(
        &mut self,
        _node: &mut NodeCore<I>,
        _transmitter: u8,
        file: u8,
        size: u32,
    ) -> Status {
        if file == 0 {
            self.file.clear();
            self.expected = size as usize;
            Status::Ok
        } else {
            Status::Error
        }
    }

    fn handle_write_chunk(
        &mut self,
        _node: &mut NodeCore<I>,
        _transmitter: u8,
        _file: u8,
        data: &[u8],
    ) -> Status {
        self.chunks_received += 1;
        if self.busy_on_chunk == Some(self.chunks_received) {
            return Status::Busy;
        }
        self.file.extend_from_slice(data);
        Status::Ok
    }

    fn handle_write_chunk_finalize(
        &mut self,
        _node: &mut NodeCore<I>,
        _transmitter: u8,
        _file: u8,
        chunks: u16,
        crc: u64,
    ) -> Status {
        let ok = crc64(&self.file) == crc && self.file.len() == self.expected;
        self.finalize = Some((chunks, ok));
        if ok {
            Status::Ok
        } else {
            Status::Error
        }
    }
}

fn hub_version() -> DeviceVersion {
    DeviceVersion {
        hw_revision: 1,
        sw_major: 0,
        sw_minor: 1,
        sw_revision: 0x1234,
        hash: 0x1111,
    }
}

fn dev_version() -> DeviceVersion {
    DeviceVersion {
        hw_revision: 2,
        sw_major: 1,
        sw_minor: 5,
        sw_revision: 0x80,
        hash: 0xAABB_CCDD,
    }
}

struct Bus {
    hub: DeviceHub<MockSerial, MockClock, Recorder>,
    device: Node<MockSerial, TestDevice>,
    hub_tx: MockSerial,
    dev_tx: MockSerial,
    clock: MockClock,
    events: Recorder,
}

impl Bus {
    fn new() -> Self {
        let hub_tx = MockSerial::default();
        let dev_tx = MockSerial::default();
        let clock = MockClock::default();
        let events = Recorder::default();
        let hub = DeviceHub::new(hub_version(), hub_tx.clone(), clock.clone(), events.clone());
        let device = Node::new(
            NodeCore::new("dev1", dev_version(), 1, dev_tx.clone(), 256),
            TestDevice::default(),
        );
        Self {
            hub,
            device,
            hub_tx,
            dev_tx,
            clock,
            events,
        }
    }

    /// Shuttles bytes between the two ends until the link is quiet.
    fn pump(&mut self) {
        for _ in 0..8 {
            let m2d = self.hub_tx.take();
            let d2m = self.dev_tx.take();
            if m2d.is_empty() && d2m.is_empty() {
                break;
            }
            if !m2d.is_empty() {
                self.device.update(&m2d);
            }
            if !d2m.is_empty() {
                self.hub.update(&d2m);
            }
        }
    }

    fn tick(&mut self, advance_ms: u64) {
        self.clock.advance(advance_ms);
        self.hub.process(self.clock.at());
        self.pump();
    }

    /// A tick on a dead link: outbound bytes are returned instead of
    /// delivered, nothing comes back.
    fn silent_tick(&mut self, advance_ms: u64) -> Vec<u8> {
        self.clock.advance(advance_ms);
        self.hub.process(self.clock.at());
        self.hub_tx.take()
    }

    /// Drives discovery and identification to `Running`.
    fn register(&mut self) {
        self.hub.probe_all(false);
        self.pump();
        self.tick(0);
        self.tick(1000);
        assert_eq!(self.hub.device_state("dev1"), Some(DeviceState::Running));
    }
}

fn decode_frames(bytes: &[u8]) -> Vec<Vec<u8>> {
    let mut parser = Parser::new(256);
    let mut frames = vec![];
    let mut left = bytes;
    while !left.is_empty() {
        let parsed = parser.update(left);
        assert!(parsed > 0);
        left = &left[parsed..];
        if parser.state() == ParserState::Done {
            frames.push(parser.data().to_vec());
            parser.reset();
        }
    }
    frames
}

#[test]
fn test_probe_admits_unknown_device_without_registration() {
    let mut bus = Bus::new();
    bus.hub.probe_all(false);
    bus.pump();

    assert_eq!(bus.hub.known_devices(), vec![(1, DeviceState::Probing)]);
    assert_eq!(bus.events.count(|e| matches!(e, Event::Registered(..))), 0);
    assert_eq!(bus.hub.device_state("dev1"), None);
}

#[test]
fn test_registration_fires_exactly_once() {
    let mut bus = Bus::new();
    bus.register();

    assert_eq!(
        bus.events.count(|e| matches!(e, Event::Registered(..))),
        1
    );
    let registered = bus
        .all_registered()
        .pop()
        .expect("registration event missing");
    assert_eq!(registered, ("dev1".to_string(), dev_version()));

    // Steady operation never re-registers.
    for _ in 0..5 {
        bus.tick(1000);
    }
    assert_eq!(
        bus.events.count(|e| matches!(e, Event::Registered(..))),
        1
    );
}

impl Bus {
    fn all_registered(&self) -> Vec<(String, DeviceVersion)> {
        self.events
            .all()
            .into_iter()
            .filter_map(|e| match e {
                Event::Registered(name, version) => Some((name, version)),
                _ => None,
            })
            .collect()
    }
}

#[test]
fn test_commands_are_dispatched_fifo_one_per_round_trip() {
    let mut bus = Bus::new();
    bus.register();

    bus.hub.send_cmd_to_device("dev1", 0x06, 0x07).unwrap();
    bus.hub.send_cmd_to_device("dev1", 0x10, 0x00).unwrap();
    assert_eq!(bus.hub.queued_commands("dev1"), 2);

    bus.tick(1000);
    assert_eq!(bus.device.app.commands, vec![(0x06, 0x07)]);
    assert_eq!(bus.hub.queued_commands("dev1"), 1);
    assert_eq!(bus.hub.last_seen("dev1"), Some(Duration::from_millis(2000)));

    bus.tick(50);
    assert_eq!(bus.device.app.commands, vec![(0x06, 0x07), (0x10, 0x00)]);
    assert_eq!(bus.hub.queued_commands("dev1"), 0);

    let results: Vec<Event> = bus
        .events
        .all()
        .into_iter()
        .filter(|e| matches!(e, Event::CommandResult(..)))
        .collect();
    assert_eq!(
        results,
        vec![
            Event::CommandResult("dev1".to_string(), Status::Ok),
            Event::CommandResult("dev1".to_string(), Status::InvalidArg),
        ]
    );
}

#[test]
fn test_blob_request_answer_round_trip() {
    let mut bus = Bus::new();
    bus.register();

    bus.hub.send_blob_request_to_device("dev1", 2, 4).unwrap();
    assert_eq!(bus.hub.queued_requests("dev1"), 1);
    bus.tick(1000);

    let answers: Vec<Event> = bus
        .events
        .all()
        .into_iter()
        .filter(|e| matches!(e, Event::BlobAnswer(..)))
        .collect();
    assert_eq!(answers.len(), 1);
    match &answers[0] {
        Event::BlobAnswer(name, request, data) => {
            assert_eq!(name, "dev1");
            assert_eq!(*request, 2);
            let value = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
            assert_eq!(value, 0xAABB_CCDD);
        }
        _ => unreachable!(),
    }
}

#[test]
fn test_telemetry_schedule_fires_periodically() {
    let mut bus = Bus::new();
    bus.register();
    bus.hub
        .create_sched_request("dev1", 7, 2, Duration::from_millis(300))
        .unwrap();

    bus.tick(1000);
    assert_eq!(
        bus.events
            .count(|e| matches!(e, Event::BlobAnswer(_, 7, _))),
        1
    );

    // Not due again yet; the idle slot goes to the health poll.
    bus.tick(50);
    assert_eq!(
        bus.events
            .count(|e| matches!(e, Event::BlobAnswer(_, 7, _))),
        1
    );

    bus.tick(300);
    assert_eq!(
        bus.events
            .count(|e| matches!(e, Event::BlobAnswer(_, 7, _))),
        2
    );
}

#[test]
fn test_health_poll_reports_device_health() {
    let mut bus = Bus::new();
    bus.register();
    bus.device.core.set_health(Health::Healthy, 0x0001);

    bus.tick(1000);
    assert_eq!(
        bus.events
            .count(|e| *e == Event::HealthReport("dev1".to_string(), Health::Healthy, 0x0001)),
        1
    );
}

#[test]
fn test_reboot_magic_is_validated_by_device() {
    let mut bus = Bus::new();
    bus.register();

    bus.hub.send_reboot_to_device("dev1", 0xAABB_CCDD).unwrap();
    bus.pump();
    assert_eq!(
        bus.events.count(|e| {
            *e == Event::AckReceived("dev1".to_string(), MessageType::Reboot, Status::Ok)
        }),
        1
    );

    bus.hub.send_reboot_to_device("dev1", 0x1122_3344).unwrap();
    bus.pump();
    assert_eq!(
        bus.events.count(|e| {
            *e == Event::AckReceived("dev1".to_string(), MessageType::Reboot, Status::InvalidArg)
        }),
        1
    );
}

fn run_until_file_result(bus: &mut Bus, max_ticks: usize) {
    for _ in 0..max_ticks {
        bus.tick(600);
        if bus.events.count(|e| matches!(e, Event::FileResult(..))) > 0 {
            return;
        }
    }
    panic!("file transfer did not finish");
}

#[test]
fn test_file_transfer_delivers_in_order_and_finalizes() {
    let mut bus = Bus::new();
    bus.register();

    let data: Vec<u8> = (0..128).collect();
    bus.hub.send_file("dev1", 0, &data, 16).unwrap();
    assert_eq!(bus.hub.device_state("dev1"), Some(DeviceState::FileTransfer));

    run_until_file_result(&mut bus, 32);

    assert_eq!(bus.device.app.file, data);
    assert_eq!(bus.device.app.chunks_received, 8);
    assert_eq!(bus.device.app.finalize, Some((8, true)));
    assert_eq!(
        bus.events
            .count(|e| *e == Event::FileResult("dev1".to_string(), Status::Ok)),
        1
    );
    assert_eq!(bus.hub.device_state("dev1"), Some(DeviceState::Running));
}

#[test]
fn test_busy_chunk_ack_retransmits_same_chunk() {
    let mut bus = Bus::new();
    bus.register();
    bus.device.app.busy_on_chunk = Some(3);

    let data: Vec<u8> = (0..128).collect();
    bus.hub.send_file("dev1", 0, &data, 16).unwrap();
    run_until_file_result(&mut bus, 32);

    // One chunk was refused and repeated; the payload still arrives
    // whole and in order, and the finalize counts accepted chunks.
    assert_eq!(bus.device.app.chunks_received, 9);
    assert_eq!(bus.device.app.file, data);
    assert_eq!(bus.device.app.finalize, Some((8, true)));
    assert_eq!(
        bus.events
            .count(|e| *e == Event::FileResult("dev1".to_string(), Status::Ok)),
        1
    );
}

#[test]
fn test_timeouts_escalate_to_lost_and_reprobe() {
    let mut bus = Bus::new();
    bus.register();

    for _ in 0..25 {
        bus.hub.send_cmd_to_device("dev1", 0x06, 0x07).unwrap();
    }

    // The device goes silent: the first tick emits a command, then
    // every 200 ms tick books one miss and emits the next attempt.
    bus.silent_tick(1000);
    for _ in 0..19 {
        bus.silent_tick(200);
        assert_eq!(bus.events.count(|e| matches!(e, Event::Lost(_))), 0);
    }
    bus.silent_tick(200);

    assert_eq!(bus.events.count(|e| matches!(e, Event::AckMissed(..))), 20);
    assert_eq!(
        bus.events.count(|e| *e == Event::Lost("dev1".to_string())),
        1
    );
    assert_eq!(bus.hub.device_state("dev1"), Some(DeviceState::Probing));

    // The next tick starts probing again.
    let bytes = bus.silent_tick(200);
    let frames = decode_frames(&bytes);
    assert_eq!(frames.len(), 1);
    let probe = Message::parse(&frames[0]).unwrap();
    assert_eq!(probe.receiver_uid, 1);
    assert_eq!(probe.payload, Payload::Probe);
}

#[test]
fn test_suspended_device_gets_no_outbound_work() {
    let mut bus = Bus::new();
    bus.register();
    bus.hub.suspend_device("dev1").unwrap();

    for _ in 0..4 {
        let bytes = bus.silent_tick(1000);
        assert!(bytes.is_empty());
    }

    bus.hub.resume_device("dev1").unwrap();
    let bytes = bus.silent_tick(1000);
    assert!(!bytes.is_empty());
}

#[test]
fn test_api_rejects_unknown_and_unregistered_devices() {
    let mut bus = Bus::new();

    assert!(matches!(
        bus.hub.send_cmd_to_device("ghost", 1, 2),
        Err(HubError::UnknownDevice(_))
    ));
    assert!(matches!(
        bus.hub.send_file("ghost", 0, &[0x00], 16),
        Err(HubError::UnknownDevice(_))
    ));
    assert!(matches!(
        bus.hub.send_file("ghost", 0, &[0x00], 0),
        Err(HubError::InvalidChunkSize(0))
    ));

    bus.register();
    bus.hub.suspend_device("dev1").unwrap();
    assert!(matches!(
        bus.hub.send_cmd_to_device("dev1", 1, 2),
        Err(HubError::NotRunning)
    ));
}

#[test]
fn test_request_error_surfaces_failure_ack() {
    let mut bus = Bus::new();
    bus.register();

    // Request 9 is unsupported by the device, so the hub sees a
    // failure acknowledge instead of an answer.
    bus.hub.send_blob_request_to_device("dev1", 9, 4).unwrap();
    bus.tick(1000);

    assert_eq!(
        bus.events.count(|e| {
            *e == Event::RequestError("dev1".to_string(), Status::Unsupported)
        }),
        1
    );
    assert_eq!(
        bus.events
            .count(|e| matches!(e, Event::BlobAnswer(..))),
        0
    );
}
