/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Incremental framing layer.
//!
//! [`Parser`] is a byte-at-a-time state machine that accepts
//! arbitrarily fragmented input, validates framing and CRC and exposes
//! one whole message at a time. Any framing error silently resets the
//! machine to `Idle`; the sender recovers through its own acknowledge
//! timeout, and the parser resynchronises on the next preamble byte.

use log::trace;

use crate::protocol::{crc::crc8, MessageType, HEADER_LEN, PREAMBLE};

/// Progress of the parser through a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParserState {
    Idle,
    Header,
    ConstPayload,
    VariablePayload,
    Crc,
    Done,
}

/// Streaming frame parser with a fixed-capacity buffer.
///
/// The buffer holds header + payload of the frame in flight (neither
/// the preamble nor the CRC byte are stored); its capacity is fixed at
/// construction and no allocation happens afterwards. A frame whose
/// accumulated size reaches the capacity is dropped.
pub struct Parser {
    buf: Vec<u8>,
    capacity: usize,
    state: ParserState,
    // Sizing of the frame in flight, valid from the header on.
    target_len: usize,
    base_len: usize,
    max_extra: usize,
}

impl Parser {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            capacity,
            state: ParserState::Idle,
            target_len: 0,
            base_len: 0,
            max_extra: 0,
        }
    }

    /// Feeds `input` into the state machine and returns the number of
    /// bytes accepted.
    ///
    /// Callers loop until the whole input is consumed, checking for
    /// [`ParserState::Done`] after every call; a `Done` parser consumes
    /// nothing further until [`reset`](Self::reset). On a framing
    /// error the machine resets and returns the index of the offending
    /// byte, so the caller re-feeds it and the parser can resynchronise
    /// on the next `0x52`.
    pub fn update(&mut self, input: &[u8]) -> usize {
        if self.state == ParserState::Done {
            self.reset();
        }

        for (i, &value) in input.iter().enumerate() {
            if self.state == ParserState::Done {
                return i;
            }

            match self.state {
                ParserState::Idle => {
                    if value == PREAMBLE {
                        self.state = ParserState::Header;
                    }
                }

                ParserState::Header => {
                    self.buf.push(value);
                    if self.buf.len() == HEADER_LEN {
                        let kind = match MessageType::from_u8(self.buf[2]) {
                            Some(kind) => kind,
                            None => {
                                trace!("unknown message type {:#04x}, resetting", self.buf[2]);
                                self.reset();
                                return i;
                            }
                        };
                        match kind.fixed_len() {
                            Some(len) => {
                                self.target_len = len;
                                self.state = ParserState::ConstPayload;
                            }
                            None => {
                                // Unwraps are avoided: every non-fixed
                                // type reports a base length.
                                self.base_len = kind.base_len().unwrap_or(HEADER_LEN);
                                self.max_extra = kind.max_extra();
                                self.target_len = self.base_len;
                                self.state = ParserState::VariablePayload;
                            }
                        }
                    }
                }

                ParserState::ConstPayload => {
                    self.buf.push(value);
                    if self.buf.len() == self.target_len {
                        self.state = ParserState::Crc;
                    }
                }

                ParserState::VariablePayload => {
                    self.buf.push(value);
                    if self.buf.len() == self.base_len {
                        // The last byte of the base carries the length
                        // of the trailing payload.
                        let extra = value as usize;
                        if extra > self.max_extra {
                            trace!("oversized variable payload ({} bytes), resetting", extra);
                            self.reset();
                            return i;
                        }
                        if extra == 0 {
                            self.state = ParserState::Crc;
                        } else {
                            self.target_len = self.base_len + extra;
                        }
                    } else if self.buf.len() == self.target_len {
                        self.state = ParserState::Crc;
                    }
                }

                ParserState::Crc => {
                    if crc8(&self.buf) == value {
                        self.state = ParserState::Done;
                    } else {
                        trace!("frame crc mismatch, resetting");
                        self.reset();
                    }
                }

                ParserState::Done => {}
            }

            if self.buf.len() >= self.capacity {
                trace!("parser buffer exhausted, resetting");
                self.reset();
                return i;
            }
        }
        input.len()
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Header + payload of the completed frame.
    pub fn data(&self) -> &[u8] {
        &self.buf
    }

    pub fn length(&self) -> usize {
        self.buf.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = ParserState::Idle;
        self.target_len = 0;
        self.base_len = 0;
        self.max_extra = 0;
    }
}

/// Wraps `body` (header + payload) into a wire frame appended to
/// `out`: preamble, body, CRC-8 over the body. Returns the number of
/// bytes appended, `body.len() + 2`. Stateless.
pub fn encode_frame(out: &mut Vec<u8>, body: &[u8]) -> usize {
    out.push(PREAMBLE);
    out.extend_from_slice(body);
    out.push(crc8(body));
    body.len() + 2
}
