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

use std::fmt;
use std::net::{ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use cadence::{
    Counted, Gauged, Metric, MetricBuilder, MetricResult, StatsdClient, UdpMetricSink,
};
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

pub use public::counter::*;

const STATS_PREFIX: &str = "packrat";
const MIN_TICK_CYCLE: Duration = Duration::from_secs(1);

pub enum StatsOption {
    Tag(&'static str, String),
    Interval(Duration),
}

struct Source {
    module: &'static str,
    interval: Duration,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
    // countdown to next metrics collection
    skip: i64,
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        self.module == other.module && self.tags == other.tags
    }
}

impl Eq for Source {}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:?}", self.module, self.tags)
    }
}

/// Counters read from one source in one collection round.
#[derive(Debug)]
pub struct Batch {
    pub module: &'static str,
    pub tags: Vec<(&'static str, String)>,
    pub points: Vec<Counter>,
}

/// Polls registered counter sources every tick and ships them to statsd.
///
/// Sources register either shared state (`Countable::Ref`) that goes away
/// with its owner, or an owned reader (`Countable::Owned`). Closed sources
/// are dropped on the next round.
pub struct Collector {
    hostname: String,
    tick: Duration,

    sources: Arc<Mutex<Vec<Source>>>,
    client: Arc<Mutex<Option<StatsdClient>>>,

    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new<S: AsRef<str>>(hostname: S, tick: Duration) -> Self {
        Self {
            hostname: hostname.as_ref().to_owned(),
            tick: tick.max(MIN_TICK_CYCLE),
            sources: Arc::new(Mutex::new(vec![])),
            client: Arc::new(Mutex::new(None)),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    pub fn tick(&self) -> Duration {
        self.tick
    }

    pub fn set_statsd_address<A: ToSocketAddrs + fmt::Debug>(&self, addr: A) -> MetricResult<()> {
        info!("stats client connect to {:?}", &addr);
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        let sink = UdpMetricSink::from(addr, socket)?;
        *self.client.lock() = Some(StatsdClient::from_sink(STATS_PREFIX, sink));
        Ok(())
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            interval: self.tick,
            countable,
            tags: vec![],
            skip: 0,
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                StatsOption::Interval(interval) if interval >= self.tick => {
                    source.interval = self.tick * (interval.as_secs() / self.tick.as_secs()) as u32
                }
                _ => warn!(
                    "ignored duplicated tag or invalid interval for module {}",
                    source.module
                ),
            }
        }
        let mut sources = self.sources.lock();
        sources.retain(|s| {
            let closed = s.countable.closed();
            let equals = s == &source;
            if !closed && equals {
                warn!(
                    "Found duplicated counter source {}, please check if the old one is correctly closed.",
                    source
                );
            }
            !closed && !equals
        });
        sources.push(source);
    }

    /// Runs one collection round and returns what was read.
    pub fn collect(&self) -> Vec<Batch> {
        Self::collect_sources(&self.sources, self.tick)
    }

    fn collect_sources(sources: &Mutex<Vec<Source>>, tick: Duration) -> Vec<Batch> {
        let mut sources = sources.lock();
        sources.retain(|s| !s.countable.closed());
        let mut batches = vec![];
        for source in sources.iter_mut() {
            source.skip -= 1;
            if source.skip > 0 {
                continue;
            }
            source.skip = (source.interval.as_secs() / tick.as_secs()).max(1) as i64;
            let points = source.countable.get_counters();
            if !points.is_empty() {
                batches.push(Batch {
                    module: source.module,
                    tags: source.tags.clone(),
                    points,
                });
            }
        }
        batches
    }

    fn send_metrics<'a, T: Metric + From<String>>(
        mut b: MetricBuilder<'a, '_, T>,
        host: &'a str,
        tags: &'a [(&'static str, String)],
    ) {
        let mut has_host = false;
        for (k, v) in tags {
            if *k == "host" {
                has_host = true;
            }
            b = b.with_tag(k, v);
        }
        if !has_host {
            b = b.with_tag("host", host);
        }
        b.send();
    }

    fn send_batches(client: &StatsdClient, host: &str, batches: &[Batch]) {
        for batch in batches {
            for (name, kind, value) in batch.points.iter() {
                let key = format!("{}.{}", batch.module, name).replace('-', "_");
                match kind {
                    CounterType::Counted => {
                        Self::send_metrics(client.count_with_tags(&key, *value), host, &batch.tags)
                    }
                    CounterType::Gauged => {
                        Self::send_metrics(client.gauge_with_tags(&key, *value), host, &batch.tags)
                    }
                }
            }
        }
    }

    pub fn start(&self) {
        {
            let (started, _) = &*self.running;
            let mut started = started.lock();
            if *started {
                return;
            }
            *started = true;
        }

        let running = self.running.clone();
        let sources = self.sources.clone();
        let client = self.client.clone();
        let host = self.hostname.clone();
        let tick = self.tick;
        let spawned = thread::Builder::new()
            .name("stats-collector".to_owned())
            .spawn(move || loop {
                let batches = Self::collect_sources(&sources, tick);
                match client.lock().as_ref() {
                    Some(client) => Self::send_batches(client, &host, &batches),
                    None => debug!("{} stats batches collected without statsd sink", batches.len()),
                }

                let (running, timer) = &*running;
                let mut running = running.lock();
                if !*running {
                    break;
                }
                timer.wait_for(&mut running, tick);
                if !*running {
                    break;
                }
            });
        match spawned {
            Ok(handle) => *self.thread.lock() = Some(handle),
            Err(e) => {
                warn!("stats collector thread failed to start: {}", e);
                *self.running.0.lock() = false;
            }
        }
    }

    pub fn stop(&self) {
        {
            let (running, timer) = &*self.running;
            *running.lock() = false;
            timer.notify_all();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
            info!("stats collector stopped");
        }
    }
}

#[derive(Default)]
pub struct AtomicTimeStats {
    pub count: AtomicU32,
    pub sum_ns: AtomicU64,
    pub max_ns: AtomicU64,
}

impl AtomicTimeStats {
    pub fn update(&self, duration: Duration) {
        self.sum_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .max_ns
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |x| {
                let nanos = duration.as_nanos() as u64;
                if x < nanos {
                    Some(nanos)
                } else {
                    None
                }
            });
    }
}

impl RefCountable for AtomicTimeStats {
    fn get_counters(&self) -> Vec<Counter> {
        let count = self.count.swap(0, Ordering::Relaxed) as u64;
        let sum = self.sum_ns.swap(0, Ordering::Relaxed);
        let max = self.max_ns.swap(0, Ordering::Relaxed);
        vec![
            ("count", CounterType::Counted, CounterValue::Unsigned(count)),
            (
                "avg-ns",
                CounterType::Gauged,
                CounterValue::Unsigned(if count == 0 { 0 } else { sum / count }),
            ),
            ("max-ns", CounterType::Gauged, CounterValue::Unsigned(max)),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(u64);

    impl RefCountable for Fixed {
        fn get_counters(&self) -> Vec<Counter> {
            vec![("fixed", CounterType::Gauged, CounterValue::Unsigned(self.0))]
        }
    }

    #[test]
    fn closed_sources_are_dropped() {
        let collector = Collector::new("test", Duration::from_secs(10));
        let source: Arc<dyn RefCountable> = Arc::new(Fixed(7));
        collector.register_countable(
            "fixed",
            Countable::Ref(Arc::downgrade(&source)),
            vec![StatsOption::Tag("index", "0".to_owned())],
        );
        let batches = collector.collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].module, "fixed");
        assert_eq!(batches[0].points[0].2, CounterValue::Unsigned(7));

        drop(source);
        assert!(collector.collect().is_empty());
        assert!(collector.sources.lock().is_empty());
    }

    #[test]
    fn interval_skips_rounds() {
        let collector = Collector::new("test", Duration::from_secs(10));
        let source: Arc<dyn RefCountable> = Arc::new(Fixed(1));
        collector.register_countable(
            "slow",
            Countable::Ref(Arc::downgrade(&source)),
            vec![StatsOption::Interval(Duration::from_secs(30))],
        );
        let rounds: Vec<usize> = (0..6).map(|_| collector.collect().len()).collect();
        assert_eq!(rounds, vec![1, 0, 0, 1, 0, 0]);
    }

    #[test]
    fn duplicated_source_replaced() {
        let collector = Collector::new("test", Duration::from_secs(10));
        let a: Arc<dyn RefCountable> = Arc::new(Fixed(1));
        let b: Arc<dyn RefCountable> = Arc::new(Fixed(2));
        collector.register_countable("dup", Countable::Ref(Arc::downgrade(&a)), vec![]);
        collector.register_countable("dup", Countable::Ref(Arc::downgrade(&b)), vec![]);
        let batches = collector.collect();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].points[0].2, CounterValue::Unsigned(2));

        drop(b);
        assert!(collector.collect().is_empty());
    }

    #[test]
    fn stop_joins_collector_thread() {
        let collector = Collector::new("test", Duration::from_secs(10));
        collector.start();
        assert!(collector.thread.lock().is_some());
        collector.stop();
        assert!(collector.thread.lock().is_none());
        assert!(!*collector.running.0.lock());
        // second stop is a no-op
        collector.stop();
    }

    #[test]
    fn time_stats_average() {
        let stats = AtomicTimeStats::default();
        stats.update(Duration::from_nanos(100));
        stats.update(Duration::from_nanos(300));
        let counters = stats.get_counters();
        assert_eq!(counters[0].2, CounterValue::Unsigned(2));
        assert_eq!(counters[1].2, CounterValue::Unsigned(200));
        assert_eq!(counters[2].2, CounterValue::Unsigned(300));
        assert_eq!(stats.get_counters()[1].2, CounterValue::Unsigned(0));
    }
}
