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
use std::net::IpAddr;

use public::enums::DataProtocol;

/// Host address identifying a node.
///
/// Keys order IPv4 before IPv6 and byte-wise within a family.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceNodeKey(IpAddr);

impl TraceNodeKey {
    pub fn addr(&self) -> IpAddr {
        self.0
    }
}

impl From<IpAddr> for TraceNodeKey {
    fn from(addr: IpAddr) -> Self {
        Self(addr)
    }
}

impl fmt::Display for TraceNodeKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct TraceNode {
    pub key: TraceNodeKey,
    pub name: String,
    pub dns_name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub hex_color: Option<String>,
}

impl TraceNode {
    /// A node named after its address.
    pub fn new(addr: IpAddr) -> Self {
        Self {
            key: TraceNodeKey(addr),
            name: addr.to_string(),
            dns_name: None,
            tags: None,
            hex_color: None,
        }
    }

    pub fn addr(&self) -> IpAddr {
        self.key.0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TraceEdgeKey {
    pub source: TraceNodeKey,
    pub source_port: u16,
    pub target: TraceNodeKey,
    pub target_port: u16,
    pub protocol: DataProtocol,
}

impl fmt::Display for TraceEdgeKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.source, self.source_port, self.target, self.target_port
        )
    }
}

/// Aggregated flow from `source` to `target`. Reverse traffic is a separate
/// edge.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceEdge {
    pub source: TraceNodeKey,
    pub source_port: u16,
    pub target: TraceNodeKey,
    pub target_port: u16,
    pub protocol: DataProtocol,
    pub packet_count: u64,
    pub byte_count: u64,
    pub width: Option<f32>,
    pub hex_color: Option<String>,
}

impl TraceEdge {
    pub fn new(key: TraceEdgeKey, packet_count: u64, byte_count: u64) -> Self {
        Self {
            source: key.source,
            source_port: key.source_port,
            target: key.target,
            target_port: key.target_port,
            protocol: key.protocol,
            packet_count,
            byte_count,
            width: None,
            hex_color: None,
        }
    }

    pub fn key(&self) -> TraceEdgeKey {
        TraceEdgeKey {
            source: self.source,
            source_port: self.source_port,
            target: self.target,
            target_port: self.target_port,
            protocol: self.protocol,
        }
    }

    pub fn touches(&self, node: &TraceNodeKey) -> bool {
        self.source == *node || self.target == *node
    }

    pub(crate) fn absorb(&mut self, other: &TraceEdge) {
        self.packet_count = self.packet_count.saturating_add(other.packet_count);
        self.byte_count = self.byte_count.saturating_add(other.byte_count);
    }
}
