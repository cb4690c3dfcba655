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

use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, warn};
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::dedup::DuplicateClaimTracker;
use super::metrics::ImportMetrics;
use crate::common::TraceImportInfo;
use crate::store::TraceStore;
use crate::utils::stats::AtomicTimeStats;

#[derive(Debug, Default)]
pub struct ImportCounter {
    pub batches: AtomicU64,
    pub records: AtomicU64,
    pub duplicates: AtomicU64,
    pub write_failures: AtomicU64,
}

impl RefCountable for ImportCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "batches",
                CounterType::Counted,
                CounterValue::Unsigned(self.batches.swap(0, Ordering::Relaxed)),
            ),
            (
                "records",
                CounterType::Counted,
                CounterValue::Unsigned(self.records.swap(0, Ordering::Relaxed)),
            ),
            (
                "duplicates",
                CounterType::Counted,
                CounterValue::Unsigned(self.duplicates.swap(0, Ordering::Relaxed)),
            ),
            (
                "write-failures",
                CounterType::Counted,
                CounterValue::Unsigned(self.write_failures.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/// Last step of the import path: flags duplicates, then hands the batch to
/// the trace store on the blocking pool so that receive loops never wait on
/// a write.
pub struct TraceImporter {
    store: Arc<dyn TraceStore>,
    claims: Arc<DuplicateClaimTracker>,
    metrics: Arc<ImportMetrics>,
    write_latency: Arc<AtomicTimeStats>,
    counter: Arc<ImportCounter>,
}

impl TraceImporter {
    pub fn new(
        store: Arc<dyn TraceStore>,
        claims: Arc<DuplicateClaimTracker>,
        metrics: Arc<ImportMetrics>,
    ) -> Self {
        Self {
            store,
            claims,
            metrics,
            write_latency: Default::default(),
            counter: Default::default(),
        }
    }

    pub fn metrics(&self) -> &Arc<ImportMetrics> {
        &self.metrics
    }

    pub fn claims(&self) -> &Arc<DuplicateClaimTracker> {
        &self.claims
    }

    pub fn counter(&self) -> Arc<ImportCounter> {
        self.counter.clone()
    }

    pub fn write_latency(&self) -> Arc<AtomicTimeStats> {
        self.write_latency.clone()
    }

    /// Returns the write task, `None` for an empty batch. Callers are not
    /// expected to await it.
    pub fn import(
        &self,
        runtime: &Handle,
        exporter: IpAddr,
        mut traces: Vec<TraceImportInfo>,
    ) -> Option<JoinHandle<()>> {
        self.metrics.record_parsed(exporter, &traces);
        if traces.is_empty() {
            return None;
        }
        let duplicates = self.claims.flag_batch(&mut traces);
        self.counter.batches.fetch_add(1, Ordering::Relaxed);
        self.counter
            .records
            .fetch_add(traces.len() as u64, Ordering::Relaxed);
        self.counter
            .duplicates
            .fetch_add(duplicates as u64, Ordering::Relaxed);

        let store = self.store.clone();
        let latency = self.write_latency.clone();
        let counter = self.counter.clone();
        Some(runtime.spawn_blocking(move || {
            let count = traces.len();
            let start = Instant::now();
            match store.write(traces) {
                Ok(_) => {
                    latency.update(start.elapsed());
                    debug!("stored {} traces from {}", count, exporter);
                }
                Err(e) => {
                    counter.write_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("store {} traces from {} failed: {}", count, exporter, e);
                }
            }
        }))
    }
}
