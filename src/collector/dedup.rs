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
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{mapref::entry::Entry, DashMap};
use log::debug;
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use tokio::runtime::Handle;

use crate::common::TraceImportInfo;
use crate::utils::timer::PeriodicTask;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Claim {
    pub exporter: IpAddr,
    pub claimed_at: DateTime<Utc>,
}

/// Decides which exporter owns a (source, destination) pair so that traffic
/// seen by several exporters is counted once.
///
/// A claim only changes hands after it expired; sightings by the holder do
/// not extend it. Records from any other exporter while the claim is live
/// are flagged as duplicates. Time is taken from the record read time.
pub struct DuplicateClaimTracker {
    lifespan: Duration,
    claims: DashMap<(IpAddr, IpAddr), Claim>,
    sweeper: PeriodicTask,

    duplicates: AtomicU64,
    replaced: AtomicU64,
    evicted: AtomicU64,
}

impl DuplicateClaimTracker {
    pub fn new(lifespan: Duration, cleanup_interval: Duration) -> Self {
        Self {
            lifespan,
            claims: DashMap::new(),
            sweeper: PeriodicTask::new("claim-sweep", cleanup_interval),
            duplicates: AtomicU64::new(0),
            replaced: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    // a claim from the future is never expired
    fn expired(&self, claim: &Claim, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(claim.claimed_at)
            .to_std()
            .map_or(false, |age| age >= self.lifespan)
    }

    /// Sets `duplicate` on the record and returns it.
    pub fn flag(&self, trace: &mut TraceImportInfo) -> bool {
        let now = trace.read_time;
        let fresh = Claim {
            exporter: trace.exporter,
            claimed_at: now,
        };
        let duplicate = match self.claims.entry((trace.src_addr, trace.dst_addr)) {
            Entry::Occupied(mut e) => {
                if self.expired(e.get(), now) {
                    e.insert(fresh);
                    self.replaced.fetch_add(1, Ordering::Relaxed);
                    false
                } else {
                    e.get().exporter != trace.exporter
                }
            }
            Entry::Vacant(e) => {
                e.insert(fresh);
                false
            }
        };
        if duplicate {
            self.duplicates.fetch_add(1, Ordering::Relaxed);
        }
        trace.duplicate = duplicate;
        duplicate
    }

    /// Flags a decoded batch, returns the number of duplicates.
    pub fn flag_batch(&self, traces: &mut [TraceImportInfo]) -> usize {
        traces.iter_mut().map(|t| self.flag(t)).filter(|&d| d).count()
    }

    pub fn claim(&self, src: IpAddr, dst: IpAddr) -> Option<Claim> {
        self.claims.get(&(src, dst)).map(|c| *c)
    }

    pub fn len(&self) -> usize {
        self.claims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims.is_empty()
    }

    /// Removes the claims expired at `now`.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.claims.len();
        self.claims.retain(|_, c| !self.expired(c, now));
        let removed = before.saturating_sub(self.claims.len());
        self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
        debug!("claim sweep removed {} of {} claims", removed, before);
        removed
    }

    pub fn start(self: &Arc<Self>, runtime: &Handle) {
        let tracker = Arc::downgrade(self);
        self.sweeper.start(runtime, true, move || {
            if let Some(tracker) = Weak::upgrade(&tracker) {
                tracker.sweep(Utc::now());
            }
        });
    }

    pub fn stop(&self) {
        self.sweeper.stop();
    }
}

impl RefCountable for DuplicateClaimTracker {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "claims",
                CounterType::Gauged,
                CounterValue::Unsigned(self.claims.len() as u64),
            ),
            (
                "duplicates",
                CounterType::Counted,
                CounterValue::Unsigned(self.duplicates.swap(0, Ordering::Relaxed)),
            ),
            (
                "replaced",
                CounterType::Counted,
                CounterValue::Unsigned(self.replaced.swap(0, Ordering::Relaxed)),
            ),
            (
                "evicted",
                CounterType::Counted,
                CounterValue::Unsigned(self.evicted.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}
