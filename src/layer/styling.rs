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

use std::collections::BTreeMap;
use std::fmt;

use public::enums::DataProtocol;
use serde::{Deserialize, Serialize};

use super::{first_match, IpAddressMatcher, LayerError};
use crate::graph::{TraceEdge, TraceGraph};

const DEFAULT_START_COLOR: Rgb = Rgb(0xff, 0xff, 0xff);
const DEFAULT_END_COLOR: Rgb = Rgb(0, 0, 0);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoringMode {
    #[default]
    PacketCount,
    ByteCount,
    // packets times bytes
    Calculated,
}

impl ScoringMode {
    pub fn score(&self, edge: &TraceEdge) -> u64 {
        match self {
            ScoringMode::PacketCount => edge.packet_count,
            ScoringMode::ByteCount => edge.byte_count,
            ScoringMode::Calculated => edge.packet_count.saturating_mul(edge.byte_count),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Rgb(u8, u8, u8);

impl Rgb {
    fn parse(hex_color: &str) -> Result<Self, LayerError> {
        let invalid = || LayerError::InvalidColor(hex_color.to_owned());
        let digits = hex_color.strip_prefix('#').ok_or_else(invalid)?;
        let bytes = hex::decode(digits).map_err(|_| invalid())?;
        match bytes[..] {
            [r, g, b] => Ok(Rgb(r, g, b)),
            _ => Err(invalid()),
        }
    }

    // NaN selects the end color
    fn interpolate(&self, end: &Rgb, ratio: f32) -> Rgb {
        let ratio = if ratio.is_nan() {
            1.0
        } else {
            ratio.clamp(0.0, 1.0)
        };
        let channel = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * ratio) as u8;
        Rgb(
            channel(self.0, end.0),
            channel(self.1, end.1),
            channel(self.2, end.2),
        )
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.0, self.1, self.2)
    }
}

/// Pair of `#RRGGBB` colors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColorRange {
    pub start: String,
    pub end: String,
}

impl ColorRange {
    pub fn new<S: Into<String>>(start: S, end: S) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }

    fn parse(&self) -> Result<(Rgb, Rgb), LayerError> {
        Ok((Rgb::parse(&self.start)?, Rgb::parse(&self.end)?))
    }
}

/// Scales edge width and color by a score relative to the lowest and
/// highest score in the graph.
///
/// Colors come from the protocol's range when `use_protocol_colors` is set,
/// else from the range configured for `unknown`, else white to black.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EdgeStyler {
    pub set_width: bool,
    pub width_scoring_mode: ScoringMode,
    pub edge_min_width: f32,
    pub edge_max_width: f32,

    pub set_color: bool,
    pub color_scoring_mode: ScoringMode,
    pub interpolate_colors: bool,
    pub use_protocol_colors: bool,
    pub protocol_colors: BTreeMap<DataProtocol, ColorRange>,
}

impl EdgeStyler {
    pub fn style_edges(&self, graph: &mut TraceGraph) -> Result<(), LayerError> {
        let ranges = self.color_ranges()?;
        let Some((min_width_score, max_width_score)) = score_bounds(graph, self.width_scoring_mode) else {
            return Ok(());
        };
        let (min_color_score, max_color_score) =
            score_bounds(graph, self.color_scoring_mode).unwrap_or_default();

        for edge in graph.edges_mut() {
            if self.set_width {
                let score = self.width_scoring_mode.score(edge);
                edge.width = Some(self.width(score, min_width_score, max_width_score));
            }
            if !self.set_color {
                continue;
            }
            let score = self.color_scoring_mode.score(edge);
            let ratio = (score - min_color_score) as f32 / (max_color_score - min_color_score) as f32;
            let (start, end) = self.range_for(&ranges, edge.protocol);
            let color = if self.interpolate_colors {
                start.interpolate(&end, ratio)
            } else {
                end
            };
            edge.hex_color = Some(color.to_string());
        }
        Ok(())
    }

    fn width(&self, score: u64, min: u64, max: u64) -> f32 {
        if min == max {
            return self.edge_max_width;
        }
        let ratio = (score - min) as f32 / (max - min) as f32;
        ratio * (self.edge_max_width - self.edge_min_width) + self.edge_min_width
    }

    fn color_ranges(&self) -> Result<BTreeMap<DataProtocol, (Rgb, Rgb)>, LayerError> {
        if !self.set_color {
            return Ok(BTreeMap::new());
        }
        self.protocol_colors
            .iter()
            .map(|(p, range)| Ok((*p, range.parse()?)))
            .collect()
    }

    fn range_for(&self, ranges: &BTreeMap<DataProtocol, (Rgb, Rgb)>, protocol: DataProtocol) -> (Rgb, Rgb) {
        let protocol_range = if self.use_protocol_colors {
            ranges.get(&protocol)
        } else {
            None
        };
        protocol_range
            .or_else(|| ranges.get(&DataProtocol::Unknown))
            .copied()
            .unwrap_or((DEFAULT_START_COLOR, DEFAULT_END_COLOR))
    }
}

fn score_bounds(graph: &TraceGraph, mode: ScoringMode) -> Option<(u64, u64)> {
    graph.edges().map(|e| mode.score(e)).fold(None, |bounds, s| match bounds {
        None => Some((s, s)),
        Some((min, max)) => Some((min.min(s), max.max(s))),
    })
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeColorAssignment {
    pub matcher: IpAddressMatcher,
    #[serde(default)]
    pub hex_color: Option<String>,
}

/// Colors nodes by the first assignment containing them.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NodeStyler {
    pub set_color: bool,
    pub assignments: Vec<NodeColorAssignment>,
}

impl NodeStyler {
    pub fn style_nodes(&self, graph: &mut TraceGraph) -> Result<(), LayerError> {
        if !self.set_color {
            return Ok(());
        }
        // reject bad colors before touching the graph
        for a in self.assignments.iter() {
            if let Some(hex) = a.hex_color.as_deref() {
                Rgb::parse(hex)?;
            }
        }
        for node in graph.nodes_mut() {
            let assigned = self
                .assignment_for(node.addr())
                .and_then(|a| a.hex_color.as_deref());
            if let Some(hex) = assigned {
                node.hex_color = Some(Rgb::parse(hex)?.to_string());
            }
        }
        Ok(())
    }

    // first assignment containing `addr`, with or without a color
    fn assignment_for(&self, addr: std::net::IpAddr) -> Option<&NodeColorAssignment> {
        first_match(&self.assignments, addr, |a| &a.matcher)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StylingLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge: Option<EdgeStyler>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<NodeStyler>,
}

impl StylingLayer {
    pub fn execute(&self, graph: &mut TraceGraph) -> Result<(), LayerError> {
        if let Some(styler) = self.edge.as_ref() {
            styler.style_edges(graph)?;
        }
        if let Some(styler) = self.node.as_ref() {
            styler.style_nodes(graph)?;
        }
        Ok(())
    }

    pub fn description(&self) -> String {
        match (self.edge.is_some(), self.node.is_some()) {
            (true, true) => "Edges, Nodes".to_owned(),
            (true, false) => "Edges".to_owned(),
            (false, true) => "Nodes".to_owned(),
            (false, false) => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use super::*;
    use crate::graph::{TraceEdgeKey, TraceNode};

    fn graph(edges: &[(&str, DataProtocol, u64, u64)]) -> TraceGraph {
        let mut g = TraceGraph::new(true);
        let hub: IpAddr = "10.0.0.1".parse().unwrap();
        g.add_node(TraceNode::new(hub));
        for (peer, protocol, packets, bytes) in edges {
            let peer: IpAddr = peer.parse().unwrap();
            g.add_node(TraceNode::new(peer));
            let key = TraceEdgeKey {
                source: hub.into(),
                source_port: 1,
                target: peer.into(),
                target_port: 2,
                protocol: *protocol,
            };
            g.add_edge(TraceEdge::new(key, *packets, *bytes)).unwrap();
        }
        g
    }

    fn colors(g: &TraceGraph) -> Vec<Option<String>> {
        g.edges().map(|e| e.hex_color.clone()).collect()
    }

    #[test]
    fn single_edge_gets_end_color() {
        let mut g = graph(&[("10.0.0.2", DataProtocol::Tcp, 3, 300)]);
        let styler = EdgeStyler {
            set_width: true,
            edge_min_width: 1.0,
            edge_max_width: 8.0,
            set_color: true,
            interpolate_colors: true,
            ..Default::default()
        };
        styler.style_edges(&mut g).unwrap();
        let edge = g.edges().next().unwrap();
        assert_eq!(edge.hex_color.as_deref(), Some("#000000"));
        assert_eq!(edge.width, Some(8.0));
    }

    #[test]
    fn widths_and_colors_scale_linearly() {
        let mut g = graph(&[
            ("10.0.0.2", DataProtocol::Tcp, 0, 0),
            ("10.0.0.3", DataProtocol::Tcp, 5, 50),
            ("10.0.0.4", DataProtocol::Tcp, 10, 100),
        ]);
        let mut protocol_colors = BTreeMap::new();
        protocol_colors.insert(DataProtocol::Tcp, ColorRange::new("#000000", "#FF8000"));
        let styler = EdgeStyler {
            set_width: true,
            width_scoring_mode: ScoringMode::ByteCount,
            edge_min_width: 2.0,
            edge_max_width: 4.0,
            set_color: true,
            color_scoring_mode: ScoringMode::Calculated,
            interpolate_colors: true,
            use_protocol_colors: true,
            protocol_colors,
        };
        styler.style_edges(&mut g).unwrap();
        let widths: Vec<Option<f32>> = g.edges().map(|e| e.width).collect();
        assert_eq!(widths, vec![Some(2.0), Some(3.0), Some(4.0)]);
        // scores 0, 250, 1000
        assert_eq!(
            colors(&g),
            vec![
                Some("#000000".to_owned()),
                Some("#3F2000".to_owned()),
                Some("#FF8000".to_owned())
            ]
        );
    }

    #[test]
    fn color_range_fallbacks() {
        let mut protocol_colors = BTreeMap::new();
        protocol_colors.insert(DataProtocol::Udp, ColorRange::new("#00FF00", "#00ff00"));
        protocol_colors.insert(DataProtocol::Unknown, ColorRange::new("#0000FF", "#0000FF"));
        let mut styler = EdgeStyler {
            set_color: true,
            use_protocol_colors: true,
            protocol_colors,
            ..Default::default()
        };
        let mut g = graph(&[
            ("10.0.0.2", DataProtocol::Udp, 1, 1),
            ("10.0.0.3", DataProtocol::Icmp, 2, 2),
        ]);
        styler.style_edges(&mut g).unwrap();
        assert_eq!(
            colors(&g),
            vec![Some("#00FF00".to_owned()), Some("#0000FF".to_owned())]
        );

        // the unknown range still applies without protocol colors
        styler.use_protocol_colors = false;
        styler.style_edges(&mut g).unwrap();
        assert_eq!(
            colors(&g),
            vec![Some("#0000FF".to_owned()), Some("#0000FF".to_owned())]
        );
    }

    #[test]
    fn invalid_colors_rejected_before_styling() {
        let mut protocol_colors = BTreeMap::new();
        protocol_colors.insert(DataProtocol::Tcp, ColorRange::new("#FFFFFF", "black"));
        let styler = EdgeStyler {
            set_color: true,
            protocol_colors,
            ..Default::default()
        };
        let mut g = graph(&[("10.0.0.2", DataProtocol::Tcp, 1, 1)]);
        assert_eq!(
            styler.style_edges(&mut g),
            Err(LayerError::InvalidColor("black".to_owned()))
        );
        assert_eq!(colors(&g), vec![None]);
    }

    #[test]
    fn node_colors_from_first_assignment() {
        let mut g = graph(&[
            ("10.0.0.2", DataProtocol::Tcp, 1, 1),
            ("10.1.0.2", DataProtocol::Tcp, 1, 1),
        ]);
        let layer: StylingLayer = serde_yaml::from_str(
            r##"
node:
  set-color: true
  assignments:
    - matcher: {address: 10.0.0.1, mask: 255.255.255.255, include: true}
    - matcher: {address: 10.0.0.0, mask: 255.255.255.0, include: true}
      hex-color: "#ff0000"
"##,
        )
        .unwrap();
        layer.execute(&mut g).unwrap();
        let node_colors: Vec<Option<String>> = g.nodes().map(|n| n.hex_color.clone()).collect();
        assert_eq!(node_colors, vec![None, Some("#FF0000".to_owned()), None]);
        assert_eq!(layer.description(), "Nodes");
        assert!(layer
            .node
            .as_ref()
            .unwrap()
            .assignment_for("10.0.0.1".parse().unwrap())
            .unwrap()
            .hex_color
            .is_none());
    }

    #[test]
    fn unmatched_bad_node_color_still_rejected() {
        let mut g = graph(&[("10.0.0.2", DataProtocol::Tcp, 1, 1)]);
        let styler: NodeStyler = serde_yaml::from_str(
            r##"
set-color: true
assignments:
  - matcher: {address: 10.0.0.0, mask: 255.255.255.0, include: true}
    hex-color: "#00ff00"
  - matcher: {address: 192.168.0.0, mask: 255.255.255.0, include: true}
    hex-color: nope
"##,
        )
        .unwrap();
        assert_eq!(
            styler.style_nodes(&mut g),
            Err(LayerError::InvalidColor("nope".to_owned()))
        );
        assert!(g.nodes().all(|n| n.hex_color.is_none()));
    }
}
