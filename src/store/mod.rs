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

//! Contracts of the persistence side and their in-memory implementations.

mod layout;
mod memory;

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use public::enums::DataProtocol;
use serde::{Deserialize, Serialize};

pub use layout::{GraphRequest, LayerSummary, Layout, LayoutStore, LayoutSummary, MemoryLayoutStore};
pub use memory::MemoryTraceStore;

use crate::common::{FlowProtocol, TraceImportInfo};
use crate::error::Result;

/// Row filter applied before aggregation. Empty lists accept everything.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct QueryConditions {
    pub allow_duplicates: bool,
    pub flow_protocols: Vec<FlowProtocol>,
    pub data_protocols: Vec<DataProtocol>,
    // either port listed is enough
    pub ports: Vec<u16>,
}

impl QueryConditions {
    pub fn matches(&self, trace: &TraceImportInfo) -> bool {
        if trace.duplicate && !self.allow_duplicates {
            return false;
        }
        if !self.flow_protocols.is_empty() && !self.flow_protocols.contains(&trace.flow_protocol) {
            return false;
        }
        if !self.data_protocols.is_empty() && !self.data_protocols.contains(&trace.protocol) {
            return false;
        }
        self.ports.is_empty()
            || self.ports.contains(&trace.src_port)
            || self.ports.contains(&trace.dst_port)
    }
}

/// Traces sharing (source, source port, destination, destination port,
/// protocol) summed over a time window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateTrace {
    pub src_addr: IpAddr,
    pub src_port: u16,
    pub dst_addr: IpAddr,
    pub dst_port: u16,
    pub protocol: DataProtocol,
    pub packet_count: u64,
    pub byte_count: u64,
    pub src_dns: Option<String>,
    pub dst_dns: Option<String>,
}

pub trait TraceStore: Send + Sync {
    fn write(&self, traces: Vec<TraceImportInfo>) -> Result<()>;

    /// Aggregates traces read in `[from, to)`.
    fn aggregate(
        &self,
        conditions: &QueryConditions,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AggregateTrace>>;

    /// Host addresses seen in traces that were never checked for a DNS name.
    fn missing_dns(&self, limit: usize) -> Result<Vec<IpAddr>>;

    /// Records the outcome of a reverse lookup, `None` if there was no name.
    fn set_dns(&self, addr: IpAddr, name: Option<String>) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(src_port: u16, dst_port: u16, protocol: DataProtocol) -> TraceImportInfo {
        let mut t = TraceImportInfo::new(Utc::now(), "10.0.0.1".parse().unwrap(), FlowProtocol::Netflow9);
        t.src_port = src_port;
        t.dst_port = dst_port;
        t.protocol = protocol;
        t
    }

    #[test]
    fn empty_conditions_accept_all_but_duplicates() {
        let conditions = QueryConditions::default();
        let mut t = trace(1, 2, DataProtocol::Tcp);
        assert!(conditions.matches(&t));
        t.duplicate = true;
        assert!(!conditions.matches(&t));
        let allow = QueryConditions {
            allow_duplicates: true,
            ..Default::default()
        };
        assert!(allow.matches(&t));
    }

    #[test]
    fn whitelists() {
        let conditions = QueryConditions {
            data_protocols: vec![DataProtocol::Udp],
            ports: vec![53],
            ..Default::default()
        };
        assert!(conditions.matches(&trace(53, 40000, DataProtocol::Udp)));
        assert!(conditions.matches(&trace(40000, 53, DataProtocol::Udp)));
        assert!(!conditions.matches(&trace(40000, 53, DataProtocol::Tcp)));
        assert!(!conditions.matches(&trace(40000, 443, DataProtocol::Udp)));

        let flows = QueryConditions {
            flow_protocols: vec![FlowProtocol::Sflow],
            ..Default::default()
        };
        assert!(!flows.matches(&trace(1, 2, DataProtocol::Tcp)));
    }

    #[test]
    fn yaml_shape() {
        let conditions: QueryConditions = serde_yaml::from_str(
            "allow-duplicates: true\nflow-protocols: [ipfix]\ndata-protocols: [tcp, udp]\nports: [443]\n",
        )
        .unwrap();
        assert!(conditions.allow_duplicates);
        assert_eq!(conditions.flow_protocols, vec![FlowProtocol::Ipfix]);
        assert_eq!(conditions.data_protocols, vec![DataProtocol::Tcp, DataProtocol::Udp]);
        assert_eq!(conditions.ports, vec![443]);
    }
}
