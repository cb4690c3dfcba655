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

use super::{GraphError, TraceEdge, TraceEdgeKey, TraceGraph};

/// Merges edges agreeing on source, target and protocol into one port-less
/// edge with summed counts. The merged edge keeps width and color of its
/// heaviest member by bytes.
pub fn collapse(graph: &mut TraceGraph) -> Result<(), GraphError> {
    graph.group_edges(
        |e| (e.source, e.target, e.protocol),
        |&(source, target, protocol), members| {
            let key = TraceEdgeKey {
                source,
                source_port: 0,
                target,
                target_port: 0,
                protocol,
            };
            let mut merged = TraceEdge::new(key, 0, 0);
            let mut heaviest: Option<&TraceEdge> = None;
            for member in members.iter() {
                merged.absorb(member);
                if heaviest.map_or(true, |h| member.byte_count > h.byte_count) {
                    heaviest = Some(member);
                }
            }
            if let Some(h) = heaviest {
                merged.width = h.width;
                merged.hex_color = h.hex_color.clone();
            }
            merged
        },
    )
}
