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

mod arena;
mod assembler;
mod collapse;
mod model;

pub use arena::{EdgeId, NodeId, TraceGraph};
pub use assembler::{EdgeDetails, GraphAssembler, GraphDetails, GraphStatistics, NodeDetails};
pub use collapse::collapse;
pub use model::{TraceEdge, TraceEdgeKey, TraceNode, TraceNodeKey};

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("edge {edge} references missing node {node}")]
    MissingNode {
        edge: TraceEdgeKey,
        node: TraceNodeKey,
    },
}
