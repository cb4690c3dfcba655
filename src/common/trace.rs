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

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use chrono::{DateTime, Utc};
use public::enums::DataProtocol;
use serde::{Deserialize, Serialize};

/// Wire protocol a flow record was exported with.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum FlowProtocol {
    Netflow5,
    Netflow9,
    Ipfix,
    Sflow,
}

impl FlowProtocol {
    pub const NETFLOW5_VERSION: u16 = 5;
    pub const NETFLOW9_VERSION: u16 = 9;
    pub const IPFIX_VERSION: u16 = 10;

    pub fn from_version(version: u16) -> Option<Self> {
        match version {
            Self::NETFLOW5_VERSION => Some(Self::Netflow5),
            Self::NETFLOW9_VERSION => Some(Self::Netflow9),
            Self::IPFIX_VERSION => Some(Self::Ipfix),
            _ => None,
        }
    }
}

impl fmt::Display for FlowProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FlowProtocol::Netflow5 => write!(f, "netflow5"),
            FlowProtocol::Netflow9 => write!(f, "netflow9"),
            FlowProtocol::Ipfix => write!(f, "ipfix"),
            FlowProtocol::Sflow => write!(f, "sflow"),
        }
    }
}

/// One normalized observation decoded from an exporter datagram.
///
/// Only `duplicate` changes after decoding; it is set by the claim tracker
/// before the record is handed to the trace store.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceImportInfo {
    pub read_time: DateTime<Utc>,
    pub exporter: IpAddr,
    pub flow_protocol: FlowProtocol,

    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,

    pub packet_count: u64,
    pub byte_count: u64,
    pub protocol: DataProtocol,

    pub duplicate: bool,
}

impl TraceImportInfo {
    pub fn new(read_time: DateTime<Utc>, exporter: IpAddr, flow_protocol: FlowProtocol) -> Self {
        Self {
            read_time,
            exporter,
            flow_protocol,
            src_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            src_port: 0,
            dst_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dst_port: 0,
            packet_count: 0,
            byte_count: 0,
            protocol: DataProtocol::Unknown,
            duplicate: false,
        }
    }
}

impl fmt::Display for TraceImportInfo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{} {} packets={} bytes={} exporter={}{}",
            self.flow_protocol,
            self.src_addr,
            self.src_port,
            self.dst_addr,
            self.dst_port,
            self.protocol,
            self.packet_count,
            self.byte_count,
            self.exporter,
            if self.duplicate { " duplicate" } else { "" }
        )
    }
}
