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

use chrono::{DateTime, Utc};
use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::QueryConditions;
use crate::error::{Error, Result};
use crate::layer::Layer;

/// A named query plus the layers shaping its graph.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Layout {
    pub name: String,
    #[serde(default)]
    pub query_conditions: QueryConditions,
    #[serde(default)]
    pub layers: Vec<Layer>,
}

impl Layout {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            query_conditions: QueryConditions::default(),
            layers: vec![],
        }
    }

    pub fn summary(&self) -> LayoutSummary {
        LayoutSummary {
            name: self.name.clone(),
            layers: self
                .layers
                .iter()
                .map(|l| LayerSummary {
                    kind: l.kind.type_name(),
                    name: l.name.clone(),
                    enabled: l.enabled,
                    description: l.description(),
                })
                .collect(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LayerSummary {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub name: Option<String>,
    pub enabled: bool,
    pub description: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct LayoutSummary {
    pub name: String,
    pub layers: Vec<LayerSummary>,
}

/// Input of one graph generation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GraphRequest {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub layout: String,
    pub remove_disconnected_nodes: bool,
}

impl GraphRequest {
    pub fn new<S: Into<String>>(from: DateTime<Utc>, to: DateTime<Utc>, layout: S) -> Self {
        Self {
            from,
            to,
            layout: layout.into(),
            remove_disconnected_nodes: true,
        }
    }
}

pub trait LayoutStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Layout>;
    /// Adds or replaces the layout with the same name.
    fn put(&self, layout: Layout) -> Result<()>;
    fn delete(&self, name: &str) -> Result<()>;
    fn list(&self) -> Result<Vec<LayoutSummary>>;
}

#[derive(Default)]
pub struct MemoryLayoutStore {
    layouts: RwLock<BTreeMap<String, Layout>>,
}

impl MemoryLayoutStore {
    pub fn new(layouts: Vec<Layout>) -> Self {
        Self {
            layouts: RwLock::new(layouts.into_iter().map(|l| (l.name.clone(), l)).collect()),
        }
    }
}

impl LayoutStore for MemoryLayoutStore {
    fn get(&self, name: &str) -> Result<Layout> {
        self.layouts
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("layout {}", name)))
    }

    fn put(&self, layout: Layout) -> Result<()> {
        info!("layout {} saved with {} layers", layout.name, layout.layers.len());
        self.layouts.write().insert(layout.name.clone(), layout);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        match self.layouts.write().remove(name) {
            Some(_) => {
                info!("layout {} deleted", name);
                Ok(())
            }
            None => Err(Error::NotFound(format!("layout {}", name))),
        }
    }

    fn list(&self) -> Result<Vec<LayoutSummary>> {
        Ok(self.layouts.read().values().map(Layout::summary).collect())
    }
}
