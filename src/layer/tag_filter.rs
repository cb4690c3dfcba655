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

use std::collections::BTreeSet;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::{conditions_description, LayerError};
use crate::graph::{TraceGraph, TraceNode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TagMatchKind {
    MatchesNone,
    MatchesAny,
    MatchesAll,
    MatchesExactly,
}

mod patterns {
    use regex::Regex;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(patterns: &[Regex], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(patterns.iter().map(Regex::as_str))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Regex>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|p| Regex::new(p).map_err(D::Error::custom))
            .collect()
    }
}

/// Predicate over the tag set of a node. Patterns are unanchored regular
/// expressions.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TagFilterCondition {
    #[serde(rename = "match")]
    pub kind: TagMatchKind,
    #[serde(default, with = "patterns")]
    pub patterns: Vec<Regex>,
    #[serde(default)]
    pub include: bool,
}

impl TagFilterCondition {
    pub fn new(kind: TagMatchKind, patterns: &[&str], include: bool) -> Result<Self, LayerError> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|_| LayerError::InvalidPattern(p.to_string())))
            .collect::<Result<_, _>>()?;
        Ok(Self {
            kind,
            patterns,
            include,
        })
    }

    pub fn matches(&self, tags: &[String]) -> bool {
        let hit = |re: &Regex| tags.iter().any(|t| re.is_match(t));
        match self.kind {
            TagMatchKind::MatchesNone => !self.patterns.iter().any(hit),
            TagMatchKind::MatchesAny => self.patterns.iter().any(hit),
            TagMatchKind::MatchesAll => !tags.is_empty() && self.patterns.iter().all(hit),
            TagMatchKind::MatchesExactly => {
                let distinct: BTreeSet<&str> = tags.iter().map(String::as_str).collect();
                distinct.len() == self.patterns.len()
                    && self.patterns.iter().all(hit)
                    && distinct
                        .iter()
                        .all(|t| self.patterns.iter().any(|re| re.is_match(t)))
            }
        }
    }

    pub fn matches_node(&self, node: &TraceNode) -> bool {
        self.matches(node.tags.as_deref().unwrap_or_default())
    }
}

/// Keeps or drops nodes by the first matching tag condition, falling back to
/// `implicit_include`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TagFilterLayer {
    pub implicit_include: bool,
    pub conditions: Vec<TagFilterCondition>,
}

impl TagFilterLayer {
    pub fn includes(&self, node: &TraceNode) -> bool {
        self.conditions
            .iter()
            .find(|c| c.matches_node(node))
            .map_or(self.implicit_include, |c| c.include)
    }

    pub fn execute(&self, graph: &mut TraceGraph) {
        graph.filter_nodes(|n| self.includes(n));
    }

    pub fn description(&self) -> String {
        conditions_description(self.conditions.len(), self.implicit_include)
    }
}
