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

use serde::{Deserialize, Serialize};

use super::{counted, first_match, IpAddressMatcher};
use crate::graph::TraceGraph;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamingAssigner {
    #[serde(flatten)]
    pub matcher: IpAddressMatcher,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Sets display names from DNS and from assigners. The first assigner
/// containing a node decides; an excluding assigner leaves the node alone.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NamingLayer {
    pub overwrite_with_dns: bool,
    pub matchers: Vec<NamingAssigner>,
}

impl NamingLayer {
    pub fn execute(&self, graph: &mut TraceGraph) {
        for node in graph.nodes_mut() {
            let assigner = first_match(&self.matchers, node.addr(), |a| &a.matcher);
            if matches!(assigner, Some(a) if !a.matcher.include) {
                continue;
            }
            if self.overwrite_with_dns {
                if let Some(dns) = node.dns_name.as_ref() {
                    node.name = dns.clone();
                }
            }
            if let Some(name) = assigner.and_then(|a| a.name.as_ref()) {
                node.name = name.clone();
            }
        }
    }

    pub fn description(&self) -> String {
        counted(self.matchers.len(), "Matcher")
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use public::enums::DataProtocol;

    use super::*;
    use crate::graph::{TraceEdge, TraceEdgeKey, TraceNode};

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn graph() -> TraceGraph {
        let mut g = TraceGraph::new(true);
        for (n, dns) in [
            ("10.0.0.1", Some("gw.lan")),
            ("10.0.0.2", Some("nas.lan")),
            ("10.0.1.1", None),
            ("10.0.2.1", Some("printer.lan")),
        ] {
            let mut node = TraceNode::new(addr(n));
            node.dns_name = dns.map(str::to_owned);
            g.add_node(node);
        }
        for n in ["10.0.0.2", "10.0.1.1", "10.0.2.1"] {
            let key = TraceEdgeKey {
                source: addr("10.0.0.1").into(),
                source_port: 1,
                target: addr(n).into(),
                target_port: 2,
                protocol: DataProtocol::Udp,
            };
            g.add_edge(TraceEdge::new(key, 1, 1)).unwrap();
        }
        g
    }

    fn name(g: &TraceGraph, a: &str) -> String {
        g.node(&addr(a).into()).unwrap().name.clone()
    }

    #[test]
    fn dns_then_assigned_names() {
        let layer: NamingLayer = serde_yaml::from_str(
            r#"
overwrite-with-dns: true
matchers:
  - {address: 10.0.0.1, mask: 255.255.255.255, include: true, name: gateway}
  - {address: 10.0.2.0, mask: 255.255.255.0, include: false, name: never}
  - {address: 10.0.0.0, mask: 255.255.0.0, include: true}
"#,
        )
        .unwrap();
        let mut g = graph();
        layer.execute(&mut g);
        assert_eq!(name(&g, "10.0.0.1"), "gateway");
        assert_eq!(name(&g, "10.0.0.2"), "nas.lan");
        assert_eq!(name(&g, "10.0.1.1"), "10.0.1.1");
        // excluded before the dns overwrite
        assert_eq!(name(&g, "10.0.2.1"), "10.0.2.1");
        assert_eq!(layer.description(), "3 Matchers");
    }

    #[test]
    fn without_dns_overwrite() {
        let layer = NamingLayer {
            overwrite_with_dns: false,
            matchers: vec![NamingAssigner {
                matcher: IpAddressMatcher::from_cidr("10.0.1.1/32", true).unwrap(),
                name: Some("camera".to_owned()),
            }],
        };
        let mut g = graph();
        layer.execute(&mut g);
        assert_eq!(name(&g, "10.0.0.2"), "10.0.0.2");
        assert_eq!(name(&g, "10.0.1.1"), "camera");
        assert_eq!(layer.description(), "1 Matcher");
    }
}
