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

mod aggregation;
mod filter;
mod matcher;
mod naming;
mod styling;
mod tag_filter;
mod tagging;

pub use aggregation::AggregationLayer;
pub use filter::{FilterCondition, FilterLayer};
pub use matcher::{first_match, mask_address, IpAddressMatcher, Subnet};
pub use naming::{NamingAssigner, NamingLayer};
pub use styling::{ColorRange, EdgeStyler, NodeColorAssignment, NodeStyler, ScoringMode, StylingLayer};
pub use tag_filter::{TagFilterCondition, TagFilterLayer, TagMatchKind};
pub use tagging::VmwareTaggingLayer;

use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::graph::{GraphError, TraceGraph};
use crate::lookup::TagCache;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayerError {
    #[error("invalid subnet {0}")]
    InvalidSubnet(String),
    #[error("invalid color {0}, expected #RRGGBB")]
    InvalidColor(String),
    #[error("invalid tag pattern {0}")]
    InvalidPattern(String),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Services a layer may consult while executing.
#[derive(Clone, Default)]
pub struct LayerContext {
    pub tags: Option<Arc<dyn TagCache>>,
}

impl LayerContext {
    pub fn with_tags(tags: Arc<dyn TagCache>) -> Self {
        Self { tags: Some(tags) }
    }
}

fn enabled_by_default() -> bool {
    true
}

/// One configured step of the pipeline.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Layer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: LayerKind,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LayerKind {
    Filter(FilterLayer),
    Aggregation(AggregationLayer),
    TagFilter(TagFilterLayer),
    Naming(NamingLayer),
    Styling(StylingLayer),
    VmwareTagging(VmwareTaggingLayer),
}

impl LayerKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            LayerKind::Filter(_) => "filter",
            LayerKind::Aggregation(_) => "aggregation",
            LayerKind::TagFilter(_) => "tag-filter",
            LayerKind::Naming(_) => "naming",
            LayerKind::Styling(_) => "styling",
            LayerKind::VmwareTagging(_) => "vmware-tagging",
        }
    }
}

impl Layer {
    pub fn new(kind: LayerKind) -> Self {
        Self {
            name: None,
            enabled: true,
            kind,
        }
    }

    pub fn named<S: Into<String>>(name: S, kind: LayerKind) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new(kind)
        }
    }

    pub fn from_json(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| Error::BadRequest(format!("invalid layer: {}", e)))
    }

    pub fn description(&self) -> String {
        match &self.kind {
            LayerKind::Filter(l) => l.description(),
            LayerKind::Aggregation(l) => l.description(),
            LayerKind::TagFilter(l) => l.description(),
            LayerKind::Naming(l) => l.description(),
            LayerKind::Styling(l) => l.description(),
            LayerKind::VmwareTagging(l) => l.description(),
        }
    }

    pub fn execute(&self, graph: &mut TraceGraph, context: &LayerContext) -> Result<(), LayerError> {
        match &self.kind {
            LayerKind::Filter(l) => l.execute(graph),
            LayerKind::Aggregation(l) => l.execute(graph)?,
            LayerKind::TagFilter(l) => l.execute(graph),
            LayerKind::Naming(l) => l.execute(graph),
            LayerKind::Styling(l) => l.execute(graph)?,
            LayerKind::VmwareTagging(l) => l.execute(graph, context),
        }
        Ok(())
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.kind.type_name())
    }
}

/// Enabled layers in configured order.
///
/// Layers run against a copy of the graph which replaces the caller's graph
/// only once every layer succeeded, a failing layer leaves the input as it
/// was.
#[derive(Clone, Debug, Default)]
pub struct LayerPipeline {
    layers: Vec<Layer>,
}

impl LayerPipeline {
    pub fn new(layers: Vec<Layer>) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn run(&self, graph: &mut TraceGraph, context: &LayerContext) -> Result<(), LayerError> {
        if !self.layers.iter().any(|l| l.enabled) {
            return Ok(());
        }
        let mut working = graph.clone();
        for (i, layer) in self.layers.iter().enumerate().filter(|(_, l)| l.enabled) {
            let start = Instant::now();
            if let Err(e) = layer.execute(&mut working, context) {
                warn!("layer #{} {} failed, pipeline aborted: {}", i, layer.label(), e);
                return Err(e);
            }
            debug!(
                "layer #{} {} done in {:?}, {} nodes {} edges left",
                i,
                layer.label(),
                start.elapsed(),
                working.node_count(),
                working.edge_count()
            );
        }
        *graph = working;
        Ok(())
    }
}

impl From<Vec<Layer>> for LayerPipeline {
    fn from(layers: Vec<Layer>) -> Self {
        Self::new(layers)
    }
}

fn counted(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("{} {}", n, noun)
    } else {
        format!("{} {}s", n, noun)
    }
}

fn conditions_description(conditions: usize, implicit_include: bool) -> String {
    format!(
        "{}, Implicit {}",
        counted(conditions, "Condition"),
        if implicit_include { "Include" } else { "Exclude" }
    )
}
