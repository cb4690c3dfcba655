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
use crate::graph::{GraphError, TraceGraph, TraceNode};

/// Merges the nodes of a subnet into one node named after the masked
/// address. A node is grouped by the first matcher containing it, and only
/// when that matcher includes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationLayer {
    pub matchers: Vec<IpAddressMatcher>,
}

impl AggregationLayer {
    pub fn execute(&self, graph: &mut TraceGraph) -> Result<(), GraphError> {
        graph.group_nodes(
            |node| {
                first_match(&self.matchers, node.addr(), |m| m)
                    .filter(|m| m.include)
                    .and_then(|m| m.masked_address())
            },
            |masked, members| {
                let mut node = TraceNode::new(*masked);
                let mut tags: Vec<String> = vec![];
                for member in members {
                    for tag in member.tags.into_iter().flatten() {
                        if !tags.contains(&tag) {
                            tags.push(tag);
                        }
                    }
                }
                if !tags.is_empty() {
                    node.tags = Some(tags);
                }
                node
            },
        )
    }

    pub fn description(&self) -> String {
        counted(self.matchers.len(), "Matcher")
    }
}
