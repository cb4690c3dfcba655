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

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::RwLock;
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use public::enums::DataProtocol;
use tokio::runtime::Handle;

use super::{AggregateTrace, QueryConditions, TraceStore};
use crate::common::TraceImportInfo;
use crate::error::Result;
use crate::utils::timer::PeriodicTask;

type AggregateKey = (IpAddr, u16, IpAddr, u16, DataProtocol);

const DEFAULT_LIFESPAN: Duration = Duration::from_secs(7 * 86400);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Keeps written traces in memory for `lifespan`, measured from each
/// trace's read time. Nothing is persisted across restarts.
pub struct MemoryTraceStore {
    traces: RwLock<Vec<TraceImportInfo>>,
    // checked hosts, `None` when the lookup found no name
    hosts: RwLock<HashMap<IpAddr, Option<String>>>,
    lifespan: Duration,
    cleaner: PeriodicTask,

    pruned: AtomicU64,
}

impl Default for MemoryTraceStore {
    fn default() -> Self {
        Self::with_retention(DEFAULT_LIFESPAN, DEFAULT_CLEANUP_INTERVAL)
    }
}

impl MemoryTraceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retention(lifespan: Duration, cleanup_interval: Duration) -> Self {
        Self {
            traces: RwLock::new(vec![]),
            hosts: RwLock::new(HashMap::new()),
            lifespan,
            cleaner: PeriodicTask::new("trace-retention", cleanup_interval),
            pruned: AtomicU64::new(0),
        }
    }

    pub fn lifespan(&self) -> Duration {
        self.lifespan
    }

    pub fn len(&self) -> usize {
        self.traces.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.read().is_empty()
    }

    pub fn dns_name(&self, addr: &IpAddr) -> Option<String> {
        self.hosts.read().get(addr).cloned().flatten()
    }

    // Drops traces read before `now - lifespan`, returns how many went.
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = match chrono::Duration::from_std(self.lifespan)
            .ok()
            .and_then(|lifespan| now.checked_sub_signed(lifespan))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let mut traces = self.traces.write();
        let before = traces.len();
        traces.retain(|t| t.read_time >= cutoff);
        let pruned = before - traces.len();
        drop(traces);

        if pruned > 0 {
            self.pruned.fetch_add(pruned as u64, Ordering::Relaxed);
            debug!("{} traces older than {} pruned", pruned, cutoff);
        }
        pruned
    }

    pub fn start(self: &Arc<Self>, runtime: &Handle) {
        let store = Arc::downgrade(self);
        self.cleaner.start(runtime, false, move || {
            if let Some(store) = Weak::upgrade(&store) {
                store.prune(Utc::now());
            }
        });
    }

    pub fn stop(&self) {
        self.cleaner.stop();
    }
}

impl RefCountable for MemoryTraceStore {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rows",
                CounterType::Gauged,
                CounterValue::Unsigned(self.len() as u64),
            ),
            (
                "pruned",
                CounterType::Counted,
                CounterValue::Unsigned(self.pruned.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

impl TraceStore for MemoryTraceStore {
    fn write(&self, traces: Vec<TraceImportInfo>) -> Result<()> {
        self.traces.write().extend(traces);
        Ok(())
    }

    fn aggregate(
        &self,
        conditions: &QueryConditions,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<AggregateTrace>> {
        let mut rows: BTreeMap<AggregateKey, (u64, u64)> = BTreeMap::new();
        for t in self.traces.read().iter() {
            if t.read_time < from || t.read_time >= to || !conditions.matches(t) {
                continue;
            }
            let counts = rows
                .entry((t.src_addr, t.src_port, t.dst_addr, t.dst_port, t.protocol))
                .or_default();
            counts.0 = counts.0.saturating_add(t.packet_count);
            counts.1 = counts.1.saturating_add(t.byte_count);
        }

        let hosts = self.hosts.read();
        let dns = |addr: &IpAddr| hosts.get(addr).cloned().flatten();
        Ok(rows
            .into_iter()
            .map(
                |((src_addr, src_port, dst_addr, dst_port, protocol), (packet_count, byte_count))| {
                    AggregateTrace {
                        src_addr,
                        src_port,
                        dst_addr,
                        dst_port,
                        protocol,
                        packet_count,
                        byte_count,
                        src_dns: dns(&src_addr),
                        dst_dns: dns(&dst_addr),
                    }
                },
            )
            .collect())
    }

    fn missing_dns(&self, limit: usize) -> Result<Vec<IpAddr>> {
        let hosts = self.hosts.read();
        let mut missing = vec![];
        for t in self.traces.read().iter() {
            for addr in [t.src_addr, t.dst_addr] {
                if missing.len() >= limit {
                    return Ok(missing);
                }
                if !hosts.contains_key(&addr) && !missing.contains(&addr) {
                    missing.push(addr);
                }
            }
        }
        Ok(missing)
    }

    fn set_dns(&self, addr: IpAddr, name: Option<String>) -> Result<()> {
        self.hosts.write().insert(addr, name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::common::FlowProtocol;

    fn trace(at: DateTime<Utc>, src: &str, dst: &str, dst_port: u16, packets: u64) -> TraceImportInfo {
        let mut t = TraceImportInfo::new(at, "192.0.2.1".parse().unwrap(), FlowProtocol::Netflow5);
        t.src_addr = src.parse().unwrap();
        t.dst_addr = dst.parse().unwrap();
        t.dst_port = dst_port;
        t.protocol = DataProtocol::Tcp;
        t.packet_count = packets;
        t.byte_count = packets * 100;
        t
    }

    #[test]
    fn aggregate_sums_within_window() {
        let store = MemoryTraceStore::new();
        let t0 = Utc::now();
        store
            .write(vec![
                trace(t0, "10.0.0.1", "10.0.0.2", 80, 1),
                trace(t0 + Duration::seconds(1), "10.0.0.1", "10.0.0.2", 80, 2),
                trace(t0 + Duration::seconds(2), "10.0.0.1", "10.0.0.2", 443, 4),
                trace(t0 + Duration::seconds(10), "10.0.0.1", "10.0.0.2", 80, 8),
            ])
            .unwrap();
        let rows = store
            .aggregate(&QueryConditions::default(), t0, t0 + Duration::seconds(10))
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].dst_port, 80);
        assert_eq!(rows[0].packet_count, 3);
        assert_eq!(rows[0].byte_count, 300);
        assert_eq!(rows[1].dst_port, 443);
        assert_eq!(rows[1].packet_count, 4);
    }

    #[test]
    fn dns_back_fill() {
        let store = MemoryTraceStore::new();
        let t0 = Utc::now();
        store
            .write(vec![
                trace(t0, "10.0.0.1", "10.0.0.2", 80, 1),
                trace(t0, "10.0.0.2", "10.0.0.3", 80, 1),
            ])
            .unwrap();
        let missing = store.missing_dns(10).unwrap();
        assert_eq!(missing.len(), 3);
        assert_eq!(store.missing_dns(2).unwrap().len(), 2);

        store.set_dns(missing[0], Some("a.example".to_owned())).unwrap();
        store.set_dns(missing[1], None).unwrap();
        assert_eq!(store.missing_dns(10).unwrap(), vec![missing[2]]);

        let rows = store
            .aggregate(&QueryConditions::default(), t0, t0 + Duration::seconds(1))
            .unwrap();
        assert_eq!(rows[0].src_dns.as_deref(), Some("a.example"));
        assert_eq!(rows[0].dst_dns, None);
    }

    #[test]
    fn prune_drops_traces_past_lifespan() {
        let store = MemoryTraceStore::with_retention(
            std::time::Duration::from_secs(3600),
            std::time::Duration::from_secs(60),
        );
        let now = Utc::now();
        store
            .write(vec![
                trace(now - Duration::hours(3), "10.0.0.1", "10.0.0.2", 80, 1),
                trace(now - Duration::minutes(61), "10.0.0.1", "10.0.0.2", 80, 2),
                trace(now - Duration::minutes(59), "10.0.0.1", "10.0.0.2", 80, 4),
                trace(now, "10.0.0.1", "10.0.0.2", 443, 8),
            ])
            .unwrap();

        assert_eq!(store.prune(now), 2);
        assert_eq!(store.len(), 2);
        assert_eq!(store.prune(now), 0);

        let rows = store
            .aggregate(
                &QueryConditions::default(),
                now - Duration::hours(4),
                now + Duration::seconds(1),
            )
            .unwrap();
        assert_eq!(rows.iter().map(|r| r.packet_count).sum::<u64>(), 12);

        let counters = store.get_counters();
        assert_eq!(counters[0].2, CounterValue::Unsigned(2));
        assert_eq!(counters[1].2, CounterValue::Unsigned(2));
        // counted values reset on read
        assert_eq!(store.get_counters()[1].2, CounterValue::Unsigned(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn periodic_prune() {
        let store = Arc::new(MemoryTraceStore::with_retention(
            std::time::Duration::from_secs(60),
            std::time::Duration::from_millis(20),
        ));
        let now = Utc::now();
        store
            .write(vec![
                trace(now - Duration::minutes(5), "10.0.0.1", "10.0.0.2", 80, 1),
                trace(now + Duration::minutes(5), "10.0.0.1", "10.0.0.2", 80, 1),
            ])
            .unwrap();
        store.start(&Handle::current());
        tokio::time::sleep(std::time::Duration::from_millis(120)).await;
        store.stop();
        assert_eq!(store.len(), 1);
    }
}
