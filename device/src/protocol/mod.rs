/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Wire types of the UtilitaryRS protocol.
//!
//! A frame on the bus is `preamble(0x52) | header(4 B) | payload | crc8`,
//! the CRC covering header and payload but not the preamble. All
//! multi-byte integers are little-endian; all layouts are packed. For
//! every variable-length message the byte carrying the trailing payload
//! length is the last byte of the fixed base, so the parser can pick it
//! up at a known offset.

pub mod crc;

use std::fmt;
use std::io::Cursor;

use byteorder::{ReadBytesExt, LE};

use crate::{Error, Result};

/// First byte of every frame on the wire, `'R'`.
pub const PREAMBLE: u8 = 0x52;

/// Broadcast / "any node" address, also used as the "no device"
/// sentinel in lookups.
pub const RESERVED_UID: u8 = 0xFF;

/// Length of the packed message header.
pub const HEADER_LEN: usize = 4;

/// Kind tag of a message, the third header byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum MessageType {
    Probe = 0,
    Ack = 1,
    Command = 2,
    BlobRequest = 3,
    BlobAnswer = 4,
    DeviceInfoReq = 5,
    DeviceInfoAnw = 6,
    FileWriteRequest = 7,
    FileWriteChunk = 8,
    FileWriteFinalize = 9,
    HealthReq = 10,
    HealthAnw = 11,
    Reboot = 12,
}

impl MessageType {
    pub fn from_u8(id: u8) -> Option<Self> {
        use MessageType::*;
        let kind = match id {
            0 => Probe,
            1 => Ack,
            2 => Command,
            3 => BlobRequest,
            4 => BlobAnswer,
            5 => DeviceInfoReq,
            6 => DeviceInfoAnw,
            7 => FileWriteRequest,
            8 => FileWriteChunk,
            9 => FileWriteFinalize,
            10 => HealthReq,
            11 => HealthAnw,
            12 => Reboot,
            _ => return None,
        };
        Some(kind)
    }

    /// Total message length (header + payload) of a fixed-size type,
    /// `None` for the variable-length types.
    pub fn fixed_len(self) -> Option<usize> {
        use MessageType::*;
        match self {
            Probe | Ack | DeviceInfoReq | HealthReq => Some(HEADER_LEN + 1),
            BlobRequest => Some(HEADER_LEN + 2),
            Command => Some(HEADER_LEN + 3),
            HealthAnw => Some(HEADER_LEN + 4),
            FileWriteRequest => Some(HEADER_LEN + 5),
            Reboot => Some(HEADER_LEN + 8),
            FileWriteFinalize => Some(HEADER_LEN + 11),
            BlobAnswer | DeviceInfoAnw | FileWriteChunk => None,
        }
    }

    /// Fixed base length (header included) of a variable-length type.
    /// The trailing payload length is carried by the byte at
    /// `base_len - 1`.
    pub fn base_len(self) -> Option<usize> {
        use MessageType::*;
        match self {
            FileWriteChunk => Some(HEADER_LEN + 2),
            BlobAnswer => Some(HEADER_LEN + 3),
            DeviceInfoAnw => Some(HEADER_LEN + DeviceVersion::WIRE_LEN + 1),
            _ => None,
        }
    }

    /// Upper bound on the trailing payload of a variable-length type.
    pub fn max_extra(self) -> usize {
        use MessageType::*;
        match self {
            BlobAnswer | DeviceInfoAnw | FileWriteChunk => 0xFF,
            _ => 0,
        }
    }
}

/// Wire-visible result code, transmitted in acknowledge payloads and
/// returned by the node handler hooks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    Error = 1,
    Wait = 2,
    Busy = 3,
    InvalidArg = 4,
    Timeout = 5,
    Unsupported = 6,
    ChecksumFailed = 7,
}

impl Status {
    pub fn from_u8(code: u8) -> Option<Self> {
        use Status::*;
        let status = match code {
            0 => Ok,
            1 => Error,
            2 => Wait,
            3 => Busy,
            4 => InvalidArg,
            5 => Timeout,
            6 => Unsupported,
            7 => ChecksumFailed,
            _ => return None,
        };
        Some(status)
    }

    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Status::Ok => "success",
            Status::Error => "error",
            Status::Wait => "wait",
            Status::Busy => "busy",
            Status::InvalidArg => "invalid argument",
            Status::Timeout => "timeout",
            Status::Unsupported => "unsupported",
            Status::ChecksumFailed => "checksum failed",
        };
        f.write_str(text)
    }
}

/// Self-reported health of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Health {
    WarmUp = 0,
    Healthy = 1,
    Warning = 2,
    Error = 3,
    Critical = 4,
}

impl Health {
    pub fn from_u8(code: u8) -> Option<Self> {
        use Health::*;
        let health = match code {
            0 => WarmUp,
            1 => Healthy,
            2 => Warning,
            3 => Error,
            4 => Critical,
            _ => return None,
        };
        Some(health)
    }
}

/// Packed 16-byte version record exchanged in device-info answers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceVersion {
    pub hw_revision: u8,
    pub sw_major: u8,
    pub sw_minor: u8,
    pub sw_revision: u32,
    pub hash: u64,
}

impl DeviceVersion {
    /// On-wire length: reserved(1) + hw(1) + major(1) + minor(1) +
    /// revision(4) + hash(8).
    pub const WIRE_LEN: usize = 16;

    /// Software version as a semver triple (`major.minor.revision`).
    pub fn semver(&self) -> semver::Version {
        semver::Version::new(
            u64::from(self.sw_major),
            u64::from(self.sw_minor),
            u64::from(self.sw_revision),
        )
    }

    fn parse(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        let _reserved = cursor.read_u8()?;
        let hw_revision = cursor.read_u8()?;
        let sw_major = cursor.read_u8()?;
        let sw_minor = cursor.read_u8()?;
        let sw_revision = cursor.read_u32::<LE>()?;
        let hash = cursor.read_u64::<LE>()?;
        Ok(Self {
            hw_revision,
            sw_major,
            sw_minor,
            sw_revision,
            hash,
        })
    }

    fn serialize(&self, out: &mut Vec<u8>) {
        out.push(0);
        out.push(self.hw_revision);
        out.push(self.sw_major);
        out.push(self.sw_minor);
        out.extend_from_slice(&self.sw_revision.to_le_bytes());
        out.extend_from_slice(&self.hash.to_le_bytes());
    }
}

impl fmt::Display for DeviceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hw{} sw{}", self.hw_revision, self.semver())
    }
}

/// Payload of a message; variable-length payloads borrow their data
/// from the buffer the message was parsed from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Payload<'a> {
    Probe,
    Ack { code: Status },
    Command { command: u8, value: u8 },
    BlobRequest { request: u8, answer_size: u8 },
    BlobAnswer { request: u8, data: &'a [u8] },
    DeviceInfoReq,
    DeviceInfoAnw { version: DeviceVersion, name: &'a [u8] },
    FileWriteRequest { file: u8, size: u32 },
    FileWriteChunk { file: u8, data: &'a [u8] },
    FileWriteFinalize { file: u8, chunks: u16, crc: u64 },
    HealthReq,
    HealthAnw { health: Health, flags: u16 },
    Reboot { magic: u64 },
}

/// One whole protocol message: the header fields plus a typed payload.
///
/// `serialize` produces the header + payload image the frame CRC is
/// computed over; the preamble/CRC envelope is applied by
/// [`encode_frame`](crate::parser::encode_frame).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Message<'a> {
    pub receiver_uid: u8,
    pub transmit_uid: u8,
    pub number: u8,
    pub payload: Payload<'a>,
}

impl<'a> Message<'a> {
    pub fn message_type(&self) -> MessageType {
        match self.payload {
            Payload::Probe => MessageType::Probe,
            Payload::Ack { .. } => MessageType::Ack,
            Payload::Command { .. } => MessageType::Command,
            Payload::BlobRequest { .. } => MessageType::BlobRequest,
            Payload::BlobAnswer { .. } => MessageType::BlobAnswer,
            Payload::DeviceInfoReq => MessageType::DeviceInfoReq,
            Payload::DeviceInfoAnw { .. } => MessageType::DeviceInfoAnw,
            Payload::FileWriteRequest { .. } => MessageType::FileWriteRequest,
            Payload::FileWriteChunk { .. } => MessageType::FileWriteChunk,
            Payload::FileWriteFinalize { .. } => MessageType::FileWriteFinalize,
            Payload::HealthReq => MessageType::HealthReq,
            Payload::HealthAnw { .. } => MessageType::HealthAnw,
            Payload::Reboot { .. } => MessageType::Reboot,
        }
    }

    /// Appends the packed header + payload image to `out`.
    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.push(self.receiver_uid);
        out.push(self.transmit_uid);
        out.push(self.message_type() as u8);
        out.push(self.number);

        match self.payload {
            Payload::Probe => out.push(0xFF),
            Payload::Ack { code } => out.push(code as u8),
            Payload::Command { command, value } => {
                out.push(command);
                out.push(value);
                out.push(0);
            }
            Payload::BlobRequest {
                request,
                answer_size,
            } => {
                out.push(request);
                out.push(answer_size);
            }
            Payload::BlobAnswer { request, data } => {
                out.push(request);
                out.push(0);
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
            Payload::DeviceInfoReq => out.push(0),
            Payload::DeviceInfoAnw { version, name } => {
                version.serialize(out);
                out.push(name.len() as u8);
                out.extend_from_slice(name);
            }
            Payload::FileWriteRequest { file, size } => {
                out.push(file);
                out.extend_from_slice(&size.to_le_bytes());
            }
            Payload::FileWriteChunk { file, data } => {
                out.push(file);
                out.push(data.len() as u8);
                out.extend_from_slice(data);
            }
            Payload::FileWriteFinalize { file, chunks, crc } => {
                out.push(file);
                out.extend_from_slice(&chunks.to_le_bytes());
                out.extend_from_slice(&crc.to_le_bytes());
            }
            Payload::HealthReq => out.push(0),
            Payload::HealthAnw { health, flags } => {
                out.push(health as u8);
                out.push(0);
                out.extend_from_slice(&flags.to_le_bytes());
            }
            Payload::Reboot { magic } => out.extend_from_slice(&magic.to_le_bytes()),
        }
    }

    /// Parses a complete header + payload image, e.g. the buffer a
    /// [`Parser`](crate::parser::Parser) exposes in the `Done` state.
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::InvalidPacket("message shorter than header".into()));
        }

        let mut cursor = Cursor::new(buf);
        let receiver_uid = cursor.read_u8()?;
        let transmit_uid = cursor.read_u8()?;
        let type_id = cursor.read_u8()?;
        let number = cursor.read_u8()?;

        let message_type = MessageType::from_u8(type_id)
            .ok_or(Error::InvalidPacket("unknown message type".into()))?;
        match message_type.fixed_len() {
            Some(len) if buf.len() != len => {
                return Err(Error::InvalidPacket("message length mismatch".into()));
            }
            _ => {}
        }

        let payload = match message_type {
            MessageType::Probe => {
                let _reserved = cursor.read_u8()?;
                Payload::Probe
            }
            MessageType::Ack => {
                let code = Status::from_u8(cursor.read_u8()?)
                    .ok_or(Error::InvalidPacket("unknown result code".into()))?;
                Payload::Ack { code }
            }
            MessageType::Command => {
                let command = cursor.read_u8()?;
                let value = cursor.read_u8()?;
                let _reserved = cursor.read_u8()?;
                Payload::Command { command, value }
            }
            MessageType::BlobRequest => {
                let request = cursor.read_u8()?;
                let answer_size = cursor.read_u8()?;
                Payload::BlobRequest {
                    request,
                    answer_size,
                }
            }
            MessageType::BlobAnswer => {
                let request = cursor.read_u8()?;
                let _reserved = cursor.read_u8()?;
                let size = cursor.read_u8()?;
                let data = Self::read_trailing(&mut cursor, size as usize, buf.len())?;
                Payload::BlobAnswer { request, data }
            }
            MessageType::DeviceInfoReq => {
                let _reserved = cursor.read_u8()?;
                Payload::DeviceInfoReq
            }
            MessageType::DeviceInfoAnw => {
                let version = DeviceVersion::parse(&mut cursor)?;
                let name_len = cursor.read_u8()?;
                let name = Self::read_trailing(&mut cursor, name_len as usize, buf.len())?;
                Payload::DeviceInfoAnw { version, name }
            }
            MessageType::FileWriteRequest => {
                let file = cursor.read_u8()?;
                let size = cursor.read_u32::<LE>()?;
                Payload::FileWriteRequest { file, size }
            }
            MessageType::FileWriteChunk => {
                let file = cursor.read_u8()?;
                let chunk_size = cursor.read_u8()?;
                let data = Self::read_trailing(&mut cursor, chunk_size as usize, buf.len())?;
                Payload::FileWriteChunk { file, data }
            }
            MessageType::FileWriteFinalize => {
                let file = cursor.read_u8()?;
                let chunks = cursor.read_u16::<LE>()?;
                let crc = cursor.read_u64::<LE>()?;
                Payload::FileWriteFinalize { file, chunks, crc }
            }
            MessageType::HealthReq => {
                let _reserved = cursor.read_u8()?;
                Payload::HealthReq
            }
            MessageType::HealthAnw => {
                let health = Health::from_u8(cursor.read_u8()?)
                    .ok_or(Error::InvalidPacket("unknown health code".into()))?;
                let _reserved = cursor.read_u8()?;
                let flags = cursor.read_u16::<LE>()?;
                Payload::HealthAnw { health, flags }
            }
            MessageType::Reboot => {
                let magic = cursor.read_u64::<LE>()?;
                Payload::Reboot { magic }
            }
        };

        Ok(Self {
            receiver_uid,
            transmit_uid,
            number,
            payload,
        })
    }

    /// Reads the `len` trailing payload bytes of a variable-length
    /// message and checks the message ends exactly there.
    fn read_trailing(cursor: &mut Cursor<&'a [u8]>, len: usize, total: usize) -> Result<&'a [u8]> {
        let current = cursor.position() as usize;
        let buf = *cursor.get_ref();
        let end = current + len;
        if buf.len() < end {
            return Err(Error::InvalidPacket(
                "payload shorter than its length field".into(),
            ));
        }
        if total != end {
            return Err(Error::InvalidPacket("message length mismatch".into()));
        }
        cursor.set_position(end as u64);
        Ok(&buf[current..end])
    }
}
