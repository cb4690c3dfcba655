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

use log::warn;
use serde::{Deserialize, Serialize};

use super::LayerContext;
use crate::graph::TraceGraph;

/// Appends the tags the tag cache holds for each node address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmwareTaggingLayer {}

impl VmwareTaggingLayer {
    pub fn execute(&self, graph: &mut TraceGraph, context: &LayerContext) {
        let Some(cache) = context.tags.as_ref() else {
            warn!("tags cache not configured, vmware tagging skipped");
            return;
        };
        for node in graph.nodes_mut() {
            if let Some(tags) = cache.tags_for(node.addr()) {
                node.tags.get_or_insert_with(Vec::new).extend(tags);
            }
        }
    }

    pub fn description(&self) -> String {
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::sync::Arc;
    use std::time::Duration;

    use public::enums::DataProtocol;

    use super::*;
    use crate::graph::{TraceEdge, TraceEdgeKey, TraceNode};
    use crate::lookup::{StaticTagsSource, TagsCacheService};

    fn graph() -> TraceGraph {
        let mut g = TraceGraph::new(true);
        let (a, b): (IpAddr, IpAddr) = ("10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap());
        let mut first = TraceNode::new(a);
        first.tags = Some(vec!["seen".to_owned()]);
        g.add_node(first);
        g.add_node(TraceNode::new(b));
        let key = TraceEdgeKey {
            source: a.into(),
            source_port: 1,
            target: b.into(),
            target_port: 2,
            protocol: DataProtocol::Tcp,
        };
        g.add_edge(TraceEdge::new(key, 1, 1)).unwrap();
        g
    }

    #[test]
    fn appends_cached_tags() {
        let mut tags = HashMap::new();
        tags.insert(
            "10.0.0.1".parse().unwrap(),
            vec!["vm".to_owned(), "prod".to_owned()],
        );
        let cache = Arc::new(TagsCacheService::new(
            Box::new(StaticTagsSource::new(tags)),
            Duration::from_secs(3600),
        ));
        cache.refresh().unwrap();

        let mut g = graph();
        VmwareTaggingLayer::default().execute(&mut g, &LayerContext::with_tags(cache));
        let tags: Vec<Option<Vec<String>>> = g.nodes().map(|n| n.tags.clone()).collect();
        assert_eq!(
            tags,
            vec![
                Some(vec!["seen".to_owned(), "vm".to_owned(), "prod".to_owned()]),
                None
            ]
        );
    }

    #[test]
    fn missing_cache_is_noop() {
        let mut g = graph();
        VmwareTaggingLayer::default().execute(&mut g, &LayerContext::default());
        assert_eq!(g.nodes().filter(|n| n.tags.is_some()).count(), 1);
    }
}
