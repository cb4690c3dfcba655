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

use log::{debug, warn};
use num_enum::TryFromPrimitive;
use pnet::packet::ethernet::EthernetPacket;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use pnet::packet::vlan::VlanPacket;
use public::enums::{DataProtocol, EthernetType};

use super::reader::Reader;
use super::{FlowParserCounter, FlowParserInterface, ParseError, ParseParam, Result};
use crate::common::{FlowProtocol, TraceImportInfo};

const SFLOW_VERSION: u32 = 5;
const AGENT_ADDRESS_IPV4: u32 = 1;
const AGENT_ADDRESS_IPV6: u32 = 2;
const RAW_PACKET_HEADER: u32 = 1;
const MAX_VLAN_TAGS: usize = 2;
const IPV4_MIN_HEADER_LEN: usize = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
enum SampleFormat {
    Flow = 1,
    Counter = 2,
    ExpandedFlow = 3,
    ExpandedCounter = 4,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive)]
#[repr(u32)]
enum HeaderProtocol {
    Ethernet = 1,
    Ipv4 = 11,
    Ipv6 = 12,
}

/// sFlow v5 decoder.
///
/// Only flow samples are decoded. Every raw packet header record inside them
/// stands for one sampled packet, its addresses and ports are read from the
/// captured frame. Counter samples carry interface statistics and are
/// dropped.
#[derive(Clone, Default)]
pub struct SflowParser {
    counter: Arc<FlowParserCounter>,
}

impl SflowParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> Arc<FlowParserCounter> {
        self.counter.clone()
    }

    fn read_flow_sample(
        &self,
        param: &ParseParam,
        body: &[u8],
        expanded: bool,
        traces: &mut Vec<TraceImportInfo>,
    ) -> Result<()> {
        let mut reader = Reader::new(body);
        // sequence number and source id
        reader.skip(if expanded { 12 } else { 8 })?;
        // sampling rate, sample pool, drops
        reader.skip(12)?;
        // input and output interface
        reader.skip(if expanded { 16 } else { 8 })?;
        let records = reader.u32()?;
        for _ in 0..records {
            let format = reader.u32()?;
            let length = reader.u32()? as usize;
            let record = reader.take(length)?;
            if format != RAW_PACKET_HEADER {
                continue;
            }
            match read_raw_packet_header(param, record) {
                Ok(info) => {
                    self.counter.records.fetch_add(1, Ordering::Relaxed);
                    traces.push(info);
                }
                Err(ParseError::Unsupported(what)) => {
                    self.counter.unsupported.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "sflow record from {} dropped: unsupported {}",
                        param.exporter, what
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

fn truncated(offset: usize, need: usize) -> ParseError {
    ParseError::Truncated { offset, need }
}

fn read_raw_packet_header(param: &ParseParam, record: &[u8]) -> Result<TraceImportInfo> {
    let mut reader = Reader::new(record);
    let header_protocol = reader.u32()?;
    // frame length and stripped bytes
    reader.skip(8)?;
    let header_length = reader.u32()? as usize;
    let header = reader.take(header_length)?;

    let mut info = TraceImportInfo::new(param.read_time, param.exporter, FlowProtocol::Sflow);
    info.packet_count = 1;
    match HeaderProtocol::try_from(header_protocol) {
        Ok(HeaderProtocol::Ethernet) => read_ethernet(header, &mut info)?,
        Ok(HeaderProtocol::Ipv4) => read_ipv4(header, &mut info)?,
        Ok(HeaderProtocol::Ipv6) => read_ipv6(header, &mut info)?,
        Err(_) => {
            return Err(ParseError::Unsupported(format!(
                "header protocol {}",
                header_protocol
            )))
        }
    }
    Ok(info)
}

fn read_ethernet(frame: &[u8], info: &mut TraceImportInfo) -> Result<()> {
    let eth = EthernetPacket::new(frame)
        .ok_or_else(|| truncated(0, EthernetPacket::minimum_packet_size()))?;
    let mut ether_type = EthernetType::from(eth.get_ethertype().0);
    let mut offset = EthernetPacket::minimum_packet_size();
    for _ in 0..MAX_VLAN_TAGS {
        if !matches!(ether_type, EthernetType::Dot1Q | EthernetType::QinQ) {
            break;
        }
        let vlan = VlanPacket::new(&frame[offset..])
            .ok_or_else(|| truncated(offset, VlanPacket::minimum_packet_size()))?;
        ether_type = EthernetType::from(vlan.get_ethertype().0);
        offset += VlanPacket::minimum_packet_size();
    }
    match ether_type {
        EthernetType::Ipv4 => read_ipv4(&frame[offset..], info),
        EthernetType::Ipv6 => read_ipv6(&frame[offset..], info),
        t => Err(ParseError::Unsupported(format!("ethernet type {}", t))),
    }
}

fn read_ipv4(packet: &[u8], info: &mut TraceImportInfo) -> Result<()> {
    let ip = Ipv4Packet::new(packet).ok_or_else(|| truncated(0, IPV4_MIN_HEADER_LEN))?;
    if ip.get_version() != 4 {
        return Err(ParseError::malformed(
            format!("ip version {} in ipv4 header", ip.get_version()),
            &packet[..IPV4_MIN_HEADER_LEN],
        ));
    }
    let header_len = ip.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER_LEN {
        return Err(ParseError::malformed(
            format!("ipv4 header length {}", header_len),
            &packet[..IPV4_MIN_HEADER_LEN],
        ));
    }
    info.src_addr = IpAddr::V4(ip.get_source());
    info.dst_addr = IpAddr::V4(ip.get_destination());
    info.byte_count = ip.get_total_length() as u64;
    info.protocol = DataProtocol::from(ip.get_next_level_protocol().0);
    // later fragments carry no transport header
    if ip.get_fragment_offset() == 0 {
        read_ports(packet.get(header_len..).unwrap_or_default(), info);
    }
    Ok(())
}

fn read_ipv6(packet: &[u8], info: &mut TraceImportInfo) -> Result<()> {
    let header_len = Ipv6Packet::minimum_packet_size();
    let ip = Ipv6Packet::new(packet).ok_or_else(|| truncated(0, header_len))?;
    info.src_addr = IpAddr::V6(ip.get_source());
    info.dst_addr = IpAddr::V6(ip.get_destination());
    info.byte_count = ip.get_payload_length() as u64 + header_len as u64;
    info.protocol = DataProtocol::from(ip.get_next_header().0);
    read_ports(packet.get(header_len..).unwrap_or_default(), info);
    Ok(())
}

// The sampled header may be cut inside the transport header, ports stay 0
// then.
fn read_ports(transport: &[u8], info: &mut TraceImportInfo) {
    match info.protocol {
        DataProtocol::Tcp => {
            if let Some(tcp) = TcpPacket::new(transport) {
                info.src_port = tcp.get_source();
                info.dst_port = tcp.get_destination();
            }
        }
        DataProtocol::Udp => {
            if let Some(udp) = UdpPacket::new(transport) {
                info.src_port = udp.get_source();
                info.dst_port = udp.get_destination();
            }
        }
        _ => (),
    }
}

impl FlowParserInterface for SflowParser {
    fn parse(&self, param: &ParseParam, payload: &[u8]) -> Result<Vec<TraceImportInfo>> {
        let mut reader = Reader::new(payload);
        let version = reader.u32()?;
        if version != SFLOW_VERSION {
            return Err(ParseError::UnexpectedVersion(
                u16::try_from(version).unwrap_or(u16::MAX),
            ));
        }
        let agent = match reader.u32()? {
            AGENT_ADDRESS_IPV4 => IpAddr::V4(reader.ipv4()?),
            AGENT_ADDRESS_IPV6 => IpAddr::V6(reader.ipv6()?),
            t => {
                return Err(ParseError::malformed(
                    format!("agent address type {}", t),
                    &payload[..reader.offset()],
                ))
            }
        };
        // sub agent id, sequence number, uptime
        reader.skip(12)?;
        let samples = reader.u32()?;
        self.counter.datagrams.fetch_add(1, Ordering::Relaxed);

        // records belong to the agent that sampled them, not to the relay
        // that forwarded the datagram
        let param = ParseParam::new(agent, param.read_time);
        let mut traces = vec![];
        for i in 0..samples {
            let (Ok(tag), Ok(length)) = (reader.u32(), reader.u32()) else {
                debug!(
                    "sflow datagram from {} holds {} of {} samples",
                    agent, i, samples
                );
                break;
            };
            let Ok(body) = reader.take(length as usize) else {
                debug!("sflow datagram from {} ends inside sample {}", agent, i);
                break;
            };
            let (enterprise, format) = (tag >> 12, tag & 0xfff);
            let result = match SampleFormat::try_from(format) {
                _ if enterprise != 0 => Err(ParseError::Unsupported(format!(
                    "sample format {}:{}",
                    enterprise, format
                ))),
                Ok(SampleFormat::Flow) => self.read_flow_sample(&param, body, false, &mut traces),
                Ok(SampleFormat::ExpandedFlow) => {
                    self.read_flow_sample(&param, body, true, &mut traces)
                }
                Ok(SampleFormat::Counter) | Ok(SampleFormat::ExpandedCounter) => Ok(()),
                Err(_) => Err(ParseError::Unsupported(format!("sample format {}", format))),
            };
            match result {
                Ok(_) => (),
                Err(ParseError::Unsupported(what)) => {
                    self.counter.unsupported.fetch_add(1, Ordering::Relaxed);
                    debug!("sflow sample from {} dropped: unsupported {}", agent, what);
                }
                Err(e @ ParseError::Truncated { .. }) => {
                    debug!("sflow sample from {} dropped: {}", agent, e)
                }
                Err(e) => {
                    self.counter.malformed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "sflow sample from {} dropped: {}, sample bytes: {}",
                        agent,
                        e,
                        hex::encode(body)
                    );
                }
            }
        }
        Ok(traces)
    }

    fn protocol(&self) -> FlowProtocol {
        FlowProtocol::Sflow
    }
}
