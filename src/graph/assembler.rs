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

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use log::debug;
use public::enums::DataProtocol;
use serde::Serialize;

use super::{collapse, TraceEdge, TraceGraph, TraceNode};
use crate::error::{Error, Result};
use crate::layer::{LayerContext, LayerPipeline};
use crate::store::{AggregateTrace, GraphRequest, LayoutStore, QueryConditions, TraceStore};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GraphStatistics {
    pub total_host_count: u64,
    pub total_byte_count: u64,
    pub total_packet_count: u64,
    pub total_trace_count: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeDetails {
    pub id: String,
    pub name: String,
    pub dns_name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub hex_color: Option<String>,
}

impl From<&TraceNode> for NodeDetails {
    fn from(node: &TraceNode) -> Self {
        Self {
            id: node.key.to_string(),
            name: node.name.clone(),
            dns_name: node.dns_name.clone(),
            tags: node.tags.clone(),
            hex_color: node.hex_color.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EdgeDetails {
    pub id: String,
    pub source: String,
    pub target: String,
    pub protocol: DataProtocol,
    pub packet_count: u64,
    pub byte_count: u64,
    pub width: Option<f32>,
    pub hex_color: Option<String>,
}

impl From<&TraceEdge> for EdgeDetails {
    fn from(edge: &TraceEdge) -> Self {
        Self {
            id: format!("{}/{}-{}", edge.protocol, edge.source, edge.target),
            source: edge.source.to_string(),
            target: edge.target.to_string(),
            protocol: edge.protocol,
            packet_count: edge.packet_count,
            byte_count: edge.byte_count,
            width: edge.width,
            hex_color: edge.hex_color.clone(),
        }
    }
}

/// Response of one graph generation.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GraphDetails {
    pub statistics: GraphStatistics,
    pub nodes: Vec<NodeDetails>,
    pub edges: Vec<EdgeDetails>,
}

impl GraphDetails {
    // byte and packet totals describe the queried traffic, not what the
    // layers left of it
    pub fn new(graph: &TraceGraph, rows: &[AggregateTrace]) -> Self {
        let statistics = GraphStatistics {
            total_host_count: graph.node_count() as u64,
            total_byte_count: rows.iter().fold(0u64, |s, r| s.saturating_add(r.byte_count)),
            total_packet_count: rows.iter().fold(0u64, |s, r| s.saturating_add(r.packet_count)),
            total_trace_count: graph.edge_count() as u64,
        };
        Self {
            statistics,
            nodes: graph.nodes().map(NodeDetails::from).collect(),
            edges: graph.edges().map(EdgeDetails::from).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Turns stored traces into a styled topology: windowed query, graph
/// assembly, layer pipeline and the final collapse.
pub struct GraphAssembler {
    traces: Arc<dyn TraceStore>,
    layouts: Arc<dyn LayoutStore>,
    context: LayerContext,
}

impl GraphAssembler {
    pub fn new(traces: Arc<dyn TraceStore>, layouts: Arc<dyn LayoutStore>, context: LayerContext) -> Self {
        Self {
            traces,
            layouts,
            context,
        }
    }

    pub fn generate_graph(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        pipeline: &LayerPipeline,
        conditions: &QueryConditions,
        remove_disconnected_nodes: bool,
    ) -> Result<GraphDetails> {
        if from > to {
            return Err(Error::BadRequest(format!(
                "window start {} is after its end {}",
                from, to
            )));
        }
        let start = Instant::now();
        let rows = self.traces.aggregate(conditions, from, to)?;
        let mut graph = TraceGraph::from_traces(remove_disconnected_nodes, &rows);
        debug!(
            "graph assembled from {} rows: {} nodes {} edges",
            rows.len(),
            graph.node_count(),
            graph.edge_count()
        );
        pipeline.run(&mut graph, &self.context)?;
        collapse(&mut graph)?;
        let details = GraphDetails::new(&graph, &rows);
        debug!(
            "graph generated in {:?}: {} nodes {} edges",
            start.elapsed(),
            details.nodes.len(),
            details.edges.len()
        );
        Ok(details)
    }

    pub fn generate(&self, request: &GraphRequest) -> Result<GraphDetails> {
        let layout = self.layouts.get(&request.layout)?;
        let pipeline = LayerPipeline::new(layout.layers);
        self.generate_graph(
            request.from,
            request.to,
            &pipeline,
            &layout.query_conditions,
            request.remove_disconnected_nodes,
        )
    }
}
