/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Symmetric per-node protocol engine.
//!
//! A [`Node`] couples the protocol core ([`NodeCore`]: identity,
//! message-number counter, parser, send buffers, transport) with an
//! application adapter ([`NodeApp`]) supplying the behavioural hooks.
//! Both the hub and every device node embed one; the difference lives
//! entirely in the adapter.

use log::debug;

use crate::parser::{encode_frame, Parser, ParserState};
use crate::protocol::{DeviceVersion, Health, Message, MessageType, Payload, Status};

/// Outbound byte channel of a node.
///
/// The return value of the underlying channel is intentionally not
/// surfaced: an unreachable peer shows up as an acknowledge timeout at
/// the hub, not as a write error here.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, bytes: &[u8]) {
        (**self).write(bytes)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn write(&mut self, bytes: &[u8]) {
        (**self).write(bytes)
    }
}

/// Protocol core of one node: identity, health, the wrapping
/// message-number counter, one parser and one send buffer.
///
/// All buffers are sized at construction; steady-state operation does
/// not allocate.
pub struct NodeCore<I> {
    uid: u8,
    name: String,
    version: DeviceVersion,
    health: Health,
    health_flags: u16,
    number: u8,
    parser: Parser,
    scratch: Vec<u8>,
    frame: Vec<u8>,
    interface: I,
}

impl<I: Transport> NodeCore<I> {
    /// `parser_size` bounds both the receive buffer and every outbound
    /// frame; the hub side uses at least 256.
    pub fn new(
        name: impl Into<String>,
        version: DeviceVersion,
        uid: u8,
        interface: I,
        parser_size: usize,
    ) -> Self {
        Self {
            uid,
            name: name.into(),
            version,
            health: Health::WarmUp,
            health_flags: 0,
            number: 0,
            parser: Parser::new(parser_size),
            scratch: Vec::with_capacity(parser_size),
            frame: Vec::with_capacity(parser_size + 2),
            interface,
        }
    }

    pub fn uid(&self) -> u8 {
        self.uid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> DeviceVersion {
        self.version
    }

    /// Updates the health and flags reported in health answers.
    pub fn set_health(&mut self, health: Health, flags: u16) {
        self.health = health;
        self.health_flags = flags;
    }

    pub fn interface(&self) -> &I {
        &self.interface
    }

    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.interface
    }

    fn next_number(&mut self) -> u8 {
        self.number = self.number.wrapping_add(1);
        self.number
    }

    fn send(&mut self, message: &Message<'_>) {
        self.scratch.clear();
        message.serialize(&mut self.scratch);
        self.frame.clear();
        let len = encode_frame(&mut self.frame, &self.scratch);
        self.interface.write(&self.frame[..len]);
    }

    /// Emits a probe; the receiver answers with `Ack(Ok)` if present.
    pub fn send_probe(&mut self, receiver: u8) -> u8 {
        let number = self.next_number();
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::Probe,
        });
        number
    }

    pub fn send_command(&mut self, receiver: u8, command: u8, value: u8) -> u8 {
        let number = self.next_number();
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::Command { command, value },
        });
        number
    }

    pub fn send_blob_request(&mut self, receiver: u8, request: u8, answer_size: u8) -> u8 {
        let number = self.next_number();
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::BlobRequest {
                request,
                answer_size,
            },
        });
        number
    }

    pub fn send_device_info_request(&mut self, receiver: u8) -> u8 {
        let number = self.next_number();
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::DeviceInfoReq,
        });
        number
    }

    pub fn send_reboot_cmd(&mut self, receiver: u8, magic: u64) -> u8 {
        let number = self.next_number();
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::Reboot { magic },
        });
        number
    }

    pub fn file_write_request(&mut self, receiver: u8, file: u8, size: u32) -> u8 {
        let number = self.next_number();
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::FileWriteRequest { file, size },
        });
        number
    }

    /// `chunk` must fit the one-byte wire length field.
    pub fn file_write_chunk(&mut self, receiver: u8, file: u8, chunk: &[u8]) -> u8 {
        debug_assert!(chunk.len() <= 0xFF);
        let number = self.next_number();
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::FileWriteChunk { file, data: chunk },
        });
        number
    }

    pub fn file_write_finalize(&mut self, receiver: u8, file: u8, chunks: u16, crc: u64) -> u8 {
        let number = self.next_number();
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::FileWriteFinalize { file, chunks, crc },
        });
        number
    }

    pub fn send_health_request(&mut self, receiver: u8) -> u8 {
        let number = self.next_number();
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::HealthReq,
        });
        number
    }

    /// Answers a blob request from inside
    /// [`NodeApp::process_blob_request`]. The answer reuses the
    /// request's message number so the requester can correlate it.
    ///
    /// Returns `false` (and emits nothing) when `data` does not match
    /// the requested size or the frame would not fit the peer parser.
    pub fn send_answer(
        &mut self,
        receiver: u8,
        number: u8,
        request: u8,
        requested_size: u8,
        data: &[u8],
    ) -> bool {
        if data.len() != requested_size as usize {
            return false;
        }
        let base = match MessageType::BlobAnswer.base_len() {
            Some(base) => base,
            None => return false,
        };
        if base + data.len() + 2 > self.parser.capacity() {
            return false;
        }

        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::BlobAnswer { request, data },
        });
        true
    }

    fn send_ack(&mut self, receiver: u8, number: u8, code: Status) {
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::Ack { code },
        });
    }

    fn send_health_answer(&mut self, receiver: u8, number: u8) {
        let health = self.health;
        let flags = self.health_flags;
        self.send(&Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::HealthAnw { health, flags },
        });
    }

    fn send_device_info_answer(&mut self, receiver: u8, number: u8) {
        self.scratch.clear();
        let message = Message {
            receiver_uid: receiver,
            transmit_uid: self.uid,
            number,
            payload: Payload::DeviceInfoAnw {
                version: self.version,
                name: self.name.as_bytes(),
            },
        };
        message.serialize(&mut self.scratch);
        self.frame.clear();
        let len = encode_frame(&mut self.frame, &self.scratch);
        self.interface.write(&self.frame[..len]);
    }
}

/// Application adapter of a node: the hooks the protocol dispatches
/// into. Defaults answer `Unsupported` or do nothing, so an adapter
/// only implements what its node actually serves.
///
/// Every hook receives the node core, so a handler can reply through
/// the send primitives, most importantly
/// [`NodeCore::send_answer`] from
/// [`process_blob_request`](Self::process_blob_request).
pub trait NodeApp<I: Transport> {
    /// An acknowledge arrived for a message this node sent earlier.
    fn handle_ack(&mut self, node: &mut NodeCore<I>, transmitter: u8, number: u8, code: Status) {
        let _ = (node, transmitter, number, code);
    }

    /// The returned code is sent back as the acknowledge.
    fn handle_command(&mut self, node: &mut NodeCore<I>, command: u8, value: u8) -> Status {
        let _ = (node, command, value);
        Status::Unsupported
    }

    /// Serves a blob request. A handler that has answered through
    /// [`NodeCore::send_answer`] returns `Ok`, which suppresses the
    /// automatic acknowledge; any other code is acknowledged as a
    /// failure to the requester.
    fn process_blob_request(
        &mut self,
        node: &mut NodeCore<I>,
        transmitter: u8,
        number: u8,
        request: u8,
        requested_size: u8,
    ) -> Status {
        let _ = (node, transmitter, number, request, requested_size);
        Status::Unsupported
    }

    /// Data answer to a blob request this node issued earlier.
    fn handle_blob_answer(
        &mut self,
        node: &mut NodeCore<I>,
        transmitter: u8,
        number: u8,
        request: u8,
        data: &[u8],
    ) -> Status {
        let _ = (node, transmitter, number, request, data);
        Status::Unsupported
    }

    fn handle_reboot(&mut self, node: &mut NodeCore<I>, magic: u64) -> Status {
        let _ = (node, magic);
        Status::Unsupported
    }

    fn handle_file_write_request(
        &mut self,
        node: &mut NodeCore<I>,
        transmitter: u8,
        file: u8,
        size: u32,
    ) -> Status {
        let _ = (node, transmitter, file, size);
        Status::Unsupported
    }

    fn handle_write_chunk(
        &mut self,
        node: &mut NodeCore<I>,
        transmitter: u8,
        file: u8,
        data: &[u8],
    ) -> Status {
        let _ = (node, transmitter, file, data);
        Status::Unsupported
    }

    fn handle_write_chunk_finalize(
        &mut self,
        node: &mut NodeCore<I>,
        transmitter: u8,
        file: u8,
        chunks: u16,
        crc: u64,
    ) -> Status {
        let _ = (node, transmitter, file, chunks, crc);
        Status::Unsupported
    }

    fn handle_device_info_answer(
        &mut self,
        node: &mut NodeCore<I>,
        transmitter: u8,
        number: u8,
        version: DeviceVersion,
        name: &[u8],
    ) {
        let _ = (node, transmitter, number, version, name);
    }

    fn handle_device_health(
        &mut self,
        node: &mut NodeCore<I>,
        transmitter: u8,
        number: u8,
        health: Health,
        flags: u16,
    ) {
        let _ = (node, transmitter, number, health, flags);
    }
}

/// One protocol endpoint: core plus application adapter.
pub struct Node<I, A> {
    pub core: NodeCore<I>,
    pub app: A,
    frame_buf: Vec<u8>,
}

impl<I: Transport, A: NodeApp<I>> Node<I, A> {
    pub fn new(core: NodeCore<I>, app: A) -> Self {
        let capacity = core.parser.capacity();
        Self {
            core,
            app,
            frame_buf: Vec::with_capacity(capacity),
        }
    }

    /// Feeds received bytes through the parser and processes every
    /// completed frame in arrival order.
    pub fn update(&mut self, data: &[u8]) {
        let mut left = data.len();
        while left > 0 {
            let parsed = self.core.parser.update(&data[data.len() - left..]);
            if parsed == 0 {
                // A parser that accepts nothing would never make
                // progress; drop the rest of this input.
                self.core.parser.reset();
                break;
            }
            left -= parsed;

            if self.core.parser.state() == ParserState::Done {
                self.process_frame();
                self.core.parser.reset();
            }
        }
    }

    /// Dispatches the frame sitting in the parser and emits the
    /// acknowledge the message type calls for. Frames addressed to
    /// other nodes are discarded without a reply.
    fn process_frame(&mut self) {
        self.frame_buf.clear();
        self.frame_buf.extend_from_slice(self.core.parser.data());

        let message = match Message::parse(&self.frame_buf) {
            Ok(message) => message,
            Err(err) => {
                debug!("dropping unparsable frame: {}", err);
                return;
            }
        };

        if message.receiver_uid != self.core.uid {
            return;
        }

        let transmitter = message.transmit_uid;
        let number = message.number;
        // `None` suppresses the acknowledge: never ack an ack, and
        // data replies stand in for one.
        let ack = match message.payload {
            Payload::Ack { code } => {
                self.app
                    .handle_ack(&mut self.core, transmitter, number, code);
                None
            }
            Payload::Probe => Some(Status::Ok),
            Payload::Command { command, value } => {
                Some(self.app.handle_command(&mut self.core, command, value))
            }
            Payload::BlobRequest {
                request,
                answer_size,
            } => {
                let code = self.app.process_blob_request(
                    &mut self.core,
                    transmitter,
                    number,
                    request,
                    answer_size,
                );
                if code == Status::Ok {
                    None
                } else {
                    Some(code)
                }
            }
            Payload::BlobAnswer { request, data } => Some(self.app.handle_blob_answer(
                &mut self.core,
                transmitter,
                number,
                request,
                data,
            )),
            Payload::Reboot { magic } => Some(self.app.handle_reboot(&mut self.core, magic)),
            Payload::DeviceInfoReq => {
                self.core.send_device_info_answer(transmitter, number);
                None
            }
            Payload::DeviceInfoAnw { version, name } => {
                self.app.handle_device_info_answer(
                    &mut self.core,
                    transmitter,
                    number,
                    version,
                    name,
                );
                Some(Status::Ok)
            }
            Payload::FileWriteRequest { file, size } => Some(self.app.handle_file_write_request(
                &mut self.core,
                transmitter,
                file,
                size,
            )),
            Payload::FileWriteChunk { file, data } => Some(self.app.handle_write_chunk(
                &mut self.core,
                transmitter,
                file,
                data,
            )),
            Payload::FileWriteFinalize { file, chunks, crc } => {
                Some(self.app.handle_write_chunk_finalize(
                    &mut self.core,
                    transmitter,
                    file,
                    chunks,
                    crc,
                ))
            }
            Payload::HealthReq => {
                self.core.send_health_answer(transmitter, number);
                None
            }
            Payload::HealthAnw { health, flags } => {
                self.app
                    .handle_device_health(&mut self.core, transmitter, number, health, flags);
                Some(Status::Ok)
            }
        };

        if let Some(code) = ack {
            self.core.send_ack(transmitter, number, code);
        }
    }
}
