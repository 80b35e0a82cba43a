/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! `utilitary-device` provides the wire level of the UtilitaryRS serial
//! protocol: the message codecs, the incremental frame parser and the
//! symmetric node handler that both the hub and the device nodes embed.
//!
//! The crate is transport agnostic. Bytes leave through the
//! [`Transport`](handler::Transport) seam and arrive via
//! [`Node::update`](handler::Node::update); no I/O is performed here.

#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation
)]

pub mod handler;
pub mod parser;
pub mod protocol;

pub use handler::{Node, NodeApp, NodeCore, Transport};
pub use parser::{encode_frame, Parser, ParserState};
pub use protocol::{
    DeviceVersion, Health, Message, MessageType, Payload, Status, HEADER_LEN, PREAMBLE,
    RESERVED_UID,
};

use std::borrow::Cow;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("packet is broken: {0}")]
    InvalidPacket(Cow<'static, str>),

    #[error("buffer io error: {0}")]
    BufferIo(#[from] std::io::Error),
}
