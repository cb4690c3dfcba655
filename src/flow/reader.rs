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

use std::net::{Ipv4Addr, Ipv6Addr};

use public::bytes::{read_u128_be, read_u16_be, read_u32_be, read_u64_be};

use super::{ParseError, Result};

// Bounds-checked cursor over a datagram or one of its sets.
pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.offset..]
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(ParseError::Truncated {
                offset: self.offset,
                need: n,
            });
        }
        let bs = &self.buf[self.offset..self.offset + n];
        self.offset += n;
        Ok(bs)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(read_u16_be(self.take(2)?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(read_u32_be(self.take(4)?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(read_u64_be(self.take(8)?))
    }

    pub fn ipv4(&mut self) -> Result<Ipv4Addr> {
        Ok(Ipv4Addr::from(self.u32()?))
    }

    pub fn ipv6(&mut self) -> Result<Ipv6Addr> {
        Ok(Ipv6Addr::from(read_u128_be(self.take(16)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_in_order() {
        let bs = [0, 5, 0, 0, 0, 1, 10, 0, 0, 2, 0xff];
        let mut r = Reader::new(&bs);
        assert_eq!(r.u16().unwrap(), 5);
        assert_eq!(r.u32().unwrap(), 1);
        assert_eq!(r.ipv4().unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(r.remaining(), 1);
        assert_eq!(r.u8().unwrap(), 0xff);
        assert!(r.is_empty());
    }

    #[test]
    fn truncation_keeps_offset() {
        let bs = [0, 1, 2];
        let mut r = Reader::new(&bs);
        r.skip(1).unwrap();
        match r.u32() {
            Err(ParseError::Truncated { offset, need }) => {
                assert_eq!(offset, 1);
                assert_eq!(need, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(r.offset(), 1);
        assert_eq!(r.rest(), &[1, 2]);
    }
}
