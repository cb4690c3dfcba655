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

pub mod collector;
pub mod common;
pub mod config;
pub mod error;
pub mod flow;
pub mod graph;
pub mod layer;
pub mod lookup;
pub mod packrat;
pub mod store;
pub mod utils;

pub use error::{Error, Result};
pub use packrat::Packrat;
