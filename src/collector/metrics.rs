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

use std::collections::{BTreeMap, VecDeque};
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::runtime::Handle;

use crate::common::TraceImportInfo;
use crate::utils::timer::PeriodicTask;

/// Lifetime totals of one exporter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct EndpointStats {
    pub received_datagrams: u64,
    pub received_bytes: u64,
    // sums of the decoded records
    pub transmitted_packets: u64,
    pub transmitted_bytes: u64,
    pub parse_successes: u64,
    pub parse_failures: u64,
}

/// Datagrams received per exporter during one summation period.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MetricSnapshot {
    pub timestamp: DateTime<Utc>,
    pub datagrams: BTreeMap<IpAddr, u64>,
}

pub struct ImportMetrics {
    endpoints: DashMap<IpAddr, EndpointStats>,
    period: DashMap<IpAddr, u64>,
    capacity: usize,
    history: Mutex<VecDeque<MetricSnapshot>>,
    summation: PeriodicTask,
}

impl ImportMetrics {
    /// Keeps `save_period / summation_period` snapshots, at least one.
    pub fn new(summation_period: Duration, save_period: Duration) -> Self {
        let summation_secs = summation_period.as_secs().max(1);
        let capacity = (save_period.as_secs() / summation_secs).max(1) as usize;
        Self {
            endpoints: DashMap::new(),
            period: DashMap::new(),
            capacity,
            history: Mutex::new(VecDeque::with_capacity(capacity)),
            summation: PeriodicTask::new("import-metrics", summation_period),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn record_datagram(&self, exporter: IpAddr, bytes: usize) {
        {
            let mut stats = self.endpoints.entry(exporter).or_default();
            stats.received_datagrams += 1;
            stats.received_bytes += bytes as u64;
        }
        *self.period.entry(exporter).or_default() += 1;
    }

    pub fn record_parsed(&self, exporter: IpAddr, traces: &[TraceImportInfo]) {
        let mut stats = self.endpoints.entry(exporter).or_default();
        stats.parse_successes += 1;
        for t in traces {
            stats.transmitted_packets = stats.transmitted_packets.saturating_add(t.packet_count);
            stats.transmitted_bytes = stats.transmitted_bytes.saturating_add(t.byte_count);
        }
    }

    pub fn record_failure(&self, exporter: IpAddr) {
        self.endpoints.entry(exporter).or_default().parse_failures += 1;
    }

    /// Closes the current period, dropping the oldest snapshot when full.
    pub fn summarize(&self, now: DateTime<Utc>) {
        let mut datagrams = BTreeMap::new();
        self.period.retain(|addr, count| {
            datagrams.insert(*addr, *count);
            false
        });
        let mut history = self.history.lock();
        while history.len() >= self.capacity {
            history.pop_front();
        }
        history.push_back(MetricSnapshot {
            timestamp: now,
            datagrams,
        });
    }

    /// Snapshots oldest first.
    pub fn series(&self) -> Vec<MetricSnapshot> {
        self.history.lock().iter().cloned().collect()
    }

    pub fn totals(&self) -> BTreeMap<IpAddr, EndpointStats> {
        self.endpoints.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    pub fn endpoint(&self, exporter: &IpAddr) -> Option<EndpointStats> {
        self.endpoints.get(exporter).map(|s| *s)
    }

    pub fn start(self: &Arc<Self>, runtime: &Handle) {
        let metrics = Arc::downgrade(self);
        self.summation.start(runtime, false, move || {
            if let Some(metrics) = Weak::upgrade(&metrics) {
                metrics.summarize(Utc::now());
            }
        });
    }

    pub fn stop(&self) {
        self.summation.stop();
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as TimeDelta;

    use super::*;
    use crate::common::FlowProtocol;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn ledger_per_endpoint() {
        let metrics = ImportMetrics::new(Duration::from_secs(10), Duration::from_secs(60));
        let exporter = addr("192.0.2.1");
        metrics.record_datagram(exporter, 120);
        metrics.record_datagram(exporter, 80);
        let mut t = TraceImportInfo::new(Utc::now(), exporter, FlowProtocol::Netflow5);
        t.packet_count = 3;
        t.byte_count = 400;
        metrics.record_parsed(exporter, &[t.clone(), t]);
        metrics.record_failure(exporter);

        assert_eq!(
            metrics.endpoint(&exporter),
            Some(EndpointStats {
                received_datagrams: 2,
                received_bytes: 200,
                transmitted_packets: 6,
                transmitted_bytes: 800,
                parse_successes: 1,
                parse_failures: 1,
            })
        );
        assert!(metrics.endpoint(&addr("192.0.2.9")).is_none());
        assert_eq!(metrics.totals().len(), 1);
    }

    #[test]
    fn ring_keeps_latest_periods() {
        let metrics = ImportMetrics::new(Duration::from_secs(10), Duration::from_secs(30));
        assert_eq!(metrics.capacity(), 3);
        let t0 = Utc::now();
        for i in 0..5u32 {
            for _ in 0..=i {
                metrics.record_datagram(addr("192.0.2.1"), 10);
            }
            metrics.summarize(t0 + TimeDelta::seconds(10 * i as i64));
        }
        let series = metrics.series();
        assert_eq!(series.len(), 3);
        assert_eq!(series[0].timestamp, t0 + TimeDelta::seconds(20));
        let counts: Vec<u64> = series
            .iter()
            .map(|s| s.datagrams[&addr("192.0.2.1")])
            .collect();
        assert_eq!(counts, vec![3, 4, 5]);

        metrics.summarize(t0 + TimeDelta::seconds(50));
        assert!(metrics.series()[2].datagrams.is_empty());
        assert_eq!(metrics.totals()[&addr("192.0.2.1")].received_datagrams, 15);
    }

    #[test]
    fn short_save_period_keeps_one() {
        let metrics = ImportMetrics::new(Duration::from_secs(60), Duration::from_secs(10));
        assert_eq!(metrics.capacity(), 1);
    }
}
