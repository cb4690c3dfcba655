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

use public::enums::DataProtocol;
use serde::{Deserialize, Serialize};

use super::{conditions_description, Subnet};
use crate::graph::{TraceEdge, TraceGraph};

/// Conjunction over the set fields; unset fields match anything.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FilterCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Subnet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<Subnet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<DataProtocol>,
    pub include: bool,
}

impl FilterCondition {
    pub fn matches(&self, edge: &TraceEdge) -> bool {
        self.source.map_or(true, |s| s.contains(edge.source.addr()))
            && self.destination.map_or(true, |s| s.contains(edge.target.addr()))
            && self.source_port.map_or(true, |p| p == edge.source_port)
            && self.destination_port.map_or(true, |p| p == edge.target_port)
            && self.protocol.map_or(true, |p| p == edge.protocol)
    }
}

/// Keeps or drops edges by the first matching condition, falling back to
/// `implicit_include`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FilterLayer {
    pub implicit_include: bool,
    pub conditions: Vec<FilterCondition>,
}

impl FilterLayer {
    pub fn includes(&self, edge: &TraceEdge) -> bool {
        self.conditions
            .iter()
            .find(|c| c.matches(edge))
            .map_or(self.implicit_include, |c| c.include)
    }

    pub fn execute(&self, graph: &mut TraceGraph) {
        graph.filter_edges(|e| self.includes(e));
    }

    pub fn description(&self) -> String {
        conditions_description(self.conditions.len(), self.implicit_include)
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::graph::{TraceEdgeKey, TraceNode};

    fn edge(src: &str, dst: &str, dport: u16, protocol: DataProtocol) -> TraceEdge {
        TraceEdge::new(
            TraceEdgeKey {
                source: src.parse::<IpAddr>().unwrap().into(),
                source_port: 50000,
                target: dst.parse::<IpAddr>().unwrap().into(),
                target_port: dport,
                protocol,
            },
            1,
            1,
        )
    }

    #[test]
    fn conjunction_of_set_fields() {
        let condition = FilterCondition {
            source: Some("1.1.1.0/24".parse().unwrap()),
            destination: Some("0.0.0.0/0".parse().unwrap()),
            ..Default::default()
        };
        assert!(condition.matches(&edge("1.1.1.5", "9.9.9.9", 80, DataProtocol::Tcp)));
        assert!(!condition.matches(&edge("1.1.2.5", "9.9.9.9", 80, DataProtocol::Tcp)));

        let narrow = FilterCondition {
            destination_port: Some(53),
            protocol: Some(DataProtocol::Udp),
            ..condition
        };
        assert!(narrow.matches(&edge("1.1.1.5", "9.9.9.9", 53, DataProtocol::Udp)));
        assert!(!narrow.matches(&edge("1.1.1.5", "9.9.9.9", 53, DataProtocol::Tcp)));
        assert!(!narrow.matches(&edge("1.1.1.5", "9.9.9.9", 80, DataProtocol::Udp)));
    }

    #[test]
    fn first_condition_decides() {
        let layer = FilterLayer {
            implicit_include: true,
            conditions: vec![
                FilterCondition {
                    source: Some("10.0.0.1/32".parse().unwrap()),
                    include: true,
                    ..Default::default()
                },
                FilterCondition {
                    source: Some("10.0.0.0/8".parse().unwrap()),
                    include: false,
                    ..Default::default()
                },
            ],
        };
        assert!(layer.includes(&edge("10.0.0.1", "8.8.8.8", 53, DataProtocol::Udp)));
        assert!(!layer.includes(&edge("10.0.0.2", "8.8.8.8", 53, DataProtocol::Udp)));
        assert!(layer.includes(&edge("192.168.0.1", "8.8.8.8", 53, DataProtocol::Udp)));
        assert_eq!(layer.description(), "2 Conditions, Implicit Include");
    }

    #[test]
    fn removed_edges_take_orphans_along() {
        let mut g = TraceGraph::new(true);
        for n in ["10.0.0.1", "10.0.0.2", "8.8.8.8"] {
            g.add_node(TraceNode::new(n.parse().unwrap()));
        }
        g.add_edge(edge("10.0.0.1", "8.8.8.8", 53, DataProtocol::Udp)).unwrap();
        g.add_edge(edge("10.0.0.2", "8.8.8.8", 443, DataProtocol::Tcp)).unwrap();
        let layer = FilterLayer {
            implicit_include: false,
            conditions: vec![FilterCondition {
                protocol: Some(DataProtocol::Tcp),
                include: true,
                ..Default::default()
            }],
        };
        layer.execute(&mut g);
        assert_eq!(g.edge_count(), 1);
        assert_eq!(g.node_count(), 2);
        assert!(!g.has_node(&"10.0.0.1".parse::<IpAddr>().unwrap().into()));
        assert_eq!(layer.description(), "1 Condition, Implicit Exclude");
    }
}
