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

use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::debug;
use public::enums::DataProtocol;

use super::reader::Reader;
use super::{FlowParserCounter, FlowParserInterface, ParseError, ParseParam, Result};
use crate::common::{FlowProtocol, TraceImportInfo};

const HEADER_LEN: usize = 24;
const RECORD_LEN: usize = 48;
// exporters cap a v5 datagram at 30 records
const MAX_RECORDS: usize = 30;

/// NetFlow v5 decoder, records have a fixed 48 byte layout.
#[derive(Clone, Default)]
pub struct NetFlow5Parser {
    counter: Arc<FlowParserCounter>,
}

impl NetFlow5Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> Arc<FlowParserCounter> {
        self.counter.clone()
    }
}

fn read_record(param: &ParseParam, record: &[u8]) -> Result<TraceImportInfo> {
    let mut reader = Reader::new(record);
    let mut info = TraceImportInfo::new(param.read_time, param.exporter, FlowProtocol::Netflow5);
    info.src_addr = IpAddr::V4(reader.ipv4()?);
    info.dst_addr = IpAddr::V4(reader.ipv4()?);
    // next hop, input and output interface
    reader.skip(8)?;
    info.packet_count = reader.u32()? as u64;
    info.byte_count = reader.u32()? as u64;
    // first and last switched
    reader.skip(8)?;
    info.src_port = reader.u16()?;
    info.dst_port = reader.u16()?;
    // pad, tcp flags
    reader.skip(2)?;
    info.protocol = DataProtocol::from(reader.u8()?);
    Ok(info)
}

impl FlowParserInterface for NetFlow5Parser {
    fn parse(&self, param: &ParseParam, payload: &[u8]) -> Result<Vec<TraceImportInfo>> {
        let mut reader = Reader::new(payload);
        let version = reader.u16()?;
        if version != FlowProtocol::NETFLOW5_VERSION {
            return Err(ParseError::UnexpectedVersion(version));
        }
        let count = reader.u16()? as usize;
        reader.skip(HEADER_LEN - 4)?;
        if count > MAX_RECORDS {
            return Err(ParseError::malformed(
                format!("record count {}", count),
                &payload[..HEADER_LEN],
            ));
        }
        self.counter.datagrams.fetch_add(1, Ordering::Relaxed);

        let mut traces = Vec::with_capacity(count);
        for i in 0..count {
            let Ok(record) = reader.take(RECORD_LEN) else {
                debug!(
                    "netflow5 datagram from {} holds {} of {} records",
                    param.exporter, i, count
                );
                break;
            };
            traces.push(read_record(param, record)?);
        }
        self.counter
            .records
            .fetch_add(traces.len() as u64, Ordering::Relaxed);
        Ok(traces)
    }

    fn protocol(&self) -> FlowProtocol {
        FlowProtocol::Netflow5
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::super::test_data::decode;
    use super::*;

    const PACKET: &str = "AAUAAQG+2TFl4ITBAAAAAAAAAAAAAAAACgAAAgoAAAMAAAAAAAMABQAAAAAAAAAAAb3u0QG+2TEQkgBQAAAGAQACAAMgHwAA";

    fn param() -> ParseParam {
        ParseParam::new("10.0.0.1".parse().unwrap(), Utc::now())
    }

    #[test]
    fn single_record() {
        let parser = NetFlow5Parser::new();
        let traces = parser.parse(&param(), &decode(PACKET)).unwrap();
        assert_eq!(traces.len(), 1);
        let t = &traces[0];
        assert_eq!(t.flow_protocol, FlowProtocol::Netflow5);
        assert_eq!(t.exporter, param().exporter);
        assert_eq!(t.src_addr, "10.0.0.2".parse::<IpAddr>().unwrap());
        assert_eq!(t.dst_addr, "10.0.0.3".parse::<IpAddr>().unwrap());
        assert_eq!(t.src_port, 4242);
        assert_eq!(t.dst_port, 80);
        assert_eq!(t.protocol, DataProtocol::Tcp);
        assert_eq!(t.packet_count, 0);
        assert_eq!(t.byte_count, 0);
        assert!(!t.duplicate);
        assert_eq!(parser.counter.records.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn partial_datagram_ends_early() {
        let mut packet = decode(PACKET);
        // claim three records while carrying one
        packet[3] = 3;
        let traces = NetFlow5Parser::new().parse(&param(), &packet).unwrap();
        assert_eq!(traces.len(), 1);

        packet.truncate(HEADER_LEN + 10);
        let traces = NetFlow5Parser::new().parse(&param(), &packet).unwrap();
        assert!(traces.is_empty());
    }

    #[test]
    fn header_errors() {
        let parser = NetFlow5Parser::new();
        assert!(matches!(
            parser.parse(&param(), &decode(PACKET)[..10]),
            Err(ParseError::Truncated { .. })
        ));
        let mut packet = decode(PACKET);
        packet[1] = 9;
        assert!(matches!(
            parser.parse(&param(), &packet),
            Err(ParseError::UnexpectedVersion(9))
        ));
        packet[1] = 5;
        packet[3] = 200;
        assert!(matches!(
            parser.parse(&param(), &packet),
            Err(ParseError::Malformed { .. })
        ));
    }
}
