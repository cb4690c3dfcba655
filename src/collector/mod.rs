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

//! Import path: UDP listeners, duplicate flagging and hand-off to the trace
//! store.

mod dedup;
mod import;
mod metrics;
mod multiplexer;

pub use dedup::{Claim, DuplicateClaimTracker};
pub use import::{ImportCounter, TraceImporter};
pub use metrics::{EndpointStats, ImportMetrics, MetricSnapshot};
pub use multiplexer::{Multiplexer, MultiplexerCounter};
