/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

pub fn read_u16_be(bs: &[u8]) -> u16 {
    assert!(bs.len() >= 2);
    u16::from_be_bytes([bs[0], bs[1]])
}

pub fn read_u32_be(bs: &[u8]) -> u32 {
    assert!(bs.len() >= 4);
    u32::from_be_bytes([bs[0], bs[1], bs[2], bs[3]])
}

pub fn read_u64_be(bs: &[u8]) -> u64 {
    assert!(bs.len() >= 8);
    let mut b = [0u8; 8];
    b.copy_from_slice(&bs[..8]);
    u64::from_be_bytes(b)
}

pub fn read_u128_be(bs: &[u8]) -> u128 {
    assert!(bs.len() >= 16);
    let mut b = [0u8; 16];
    b.copy_from_slice(&bs[..16]);
    u128::from_be_bytes(b)
}

// Reads an unsigned big-endian integer of arbitrary width. Counters wider than
// 8 bytes keep only their low 64 bits.
pub fn read_uint_be(bs: &[u8]) -> u64 {
    let bs = if bs.len() > 8 { &bs[bs.len() - 8..] } else { bs };
    bs.iter().fold(0, |acc, b| (acc << 8) | *b as u64)
}

// Length of `len` rounded up to the next multiple of `align`.
pub fn padded_len(len: usize, align: usize) -> usize {
    if align == 0 {
        return len;
    }
    (len + align - 1) / align * align
}
