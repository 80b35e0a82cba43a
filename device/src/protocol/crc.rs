/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Checksum primitives of the protocol: CRC-8 over frame bodies and
//! CRC-64 over whole file payloads. Both are stateless and match the
//! fixed parameters the peers on the bus agree on.

/// CRC-8, polynomial 0x07, init 0x00, MSB first, no reflection, no
/// final xor. Computed over header + payload of every frame.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc: u8 = 0;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

const CRC64_POLY: u64 = 0x42F0_E1EB_A9EA_3693;

/// CRC-64/ECMA-182, init 0, MSB first, no reflection, no final xor.
/// Guards a delivered file end to end across the chunked transfer.
pub fn crc64(data: &[u8]) -> u64 {
    let mut crc: u64 = 0;
    for &byte in data {
        crc ^= u64::from(byte) << 56;
        for _ in 0..8 {
            crc = if crc & (1 << 63) != 0 {
                (crc << 1) ^ CRC64_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}
