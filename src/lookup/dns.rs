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
use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{debug, info, warn};
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use tokio::runtime::Handle;

use crate::error::Result;
use crate::store::TraceStore;
use crate::utils::timer::PeriodicTask;

// addresses resolved per store round trip of the back-fill
const DNS_CHECK_BATCH: usize = 256;

pub trait DnsResolver: Send + Sync {
    /// Reverse lookup, `None` when the address has no name.
    fn resolve(&self, addr: IpAddr) -> Option<String>;
}

/// Reverse lookups through the system resolver.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDnsResolver;

impl DnsResolver for SystemDnsResolver {
    fn resolve(&self, addr: IpAddr) -> Option<String> {
        match dns_lookup::lookup_addr(&addr) {
            // resolvers answer with the address itself when there is no PTR record
            Ok(name) if name.parse::<IpAddr>().is_ok() => None,
            Ok(name) => Some(name),
            Err(e) => {
                debug!("reverse lookup of {} failed: {}", addr, e);
                None
            }
        }
    }
}

struct CachedName {
    name: Option<String>,
    resolved_at: Instant,
}

/// TTL cache in front of another resolver. Failed lookups are cached too so
/// that unnamed hosts are not queried on every request.
pub struct CachedDnsResolver {
    inner: Box<dyn DnsResolver>,
    ttl: Duration,
    cache: DashMap<IpAddr, CachedName>,
    cleaner: PeriodicTask,

    hits: AtomicU64,
    misses: AtomicU64,
    evicted: AtomicU64,
}

impl CachedDnsResolver {
    pub fn new(inner: Box<dyn DnsResolver>, ttl: Duration, cleanup_interval: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: DashMap::new(),
            cleaner: PeriodicTask::new("dns-cache-cleanup", cleanup_interval),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Cached outcome if still fresh, without resolving.
    pub fn peek(&self, addr: IpAddr) -> Option<Option<String>> {
        self.cache
            .get(&addr)
            .filter(|e| e.resolved_at.elapsed() < self.ttl)
            .map(|e| e.name.clone())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drops entries older than the TTL.
    pub fn cleanup(&self) -> usize {
        let before = self.cache.len();
        self.cache.retain(|_, e| e.resolved_at.elapsed() < self.ttl);
        let removed = before.saturating_sub(self.cache.len());
        self.evicted.fetch_add(removed as u64, Ordering::Relaxed);
        debug!("dns cache cleanup removed {} entries", removed);
        removed
    }

    pub fn start(self: &Arc<Self>, runtime: &Handle) {
        let resolver = Arc::downgrade(self);
        self.cleaner.start(runtime, false, move || {
            if let Some(resolver) = Weak::upgrade(&resolver) {
                resolver.cleanup();
            }
        });
    }

    pub fn stop(&self) {
        self.cleaner.stop();
    }
}

impl DnsResolver for CachedDnsResolver {
    fn resolve(&self, addr: IpAddr) -> Option<String> {
        if let Some(name) = self.peek(addr) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return name;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let name = self.inner.resolve(addr);
        self.cache.insert(
            addr,
            CachedName {
                name: name.clone(),
                resolved_at: Instant::now(),
            },
        );
        name
    }
}

impl RefCountable for CachedDnsResolver {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "entries",
                CounterType::Gauged,
                CounterValue::Unsigned(self.cache.len() as u64),
            ),
            (
                "hits",
                CounterType::Counted,
                CounterValue::Unsigned(self.hits.swap(0, Ordering::Relaxed)),
            ),
            (
                "misses",
                CounterType::Counted,
                CounterValue::Unsigned(self.misses.swap(0, Ordering::Relaxed)),
            ),
            (
                "evicted",
                CounterType::Counted,
                CounterValue::Unsigned(self.evicted.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/// Periodically names the stored hosts that were never looked up.
pub struct DnsCheck {
    store: Arc<dyn TraceStore>,
    resolver: Arc<dyn DnsResolver>,
    task: PeriodicTask,
}

impl DnsCheck {
    pub fn new(store: Arc<dyn TraceStore>, resolver: Arc<dyn DnsResolver>, check_interval: Duration) -> Self {
        Self {
            store,
            resolver,
            task: PeriodicTask::new("dns-check", check_interval),
        }
    }

    /// Resolves every unchecked host, returns how many got a name.
    pub fn run_once(&self) -> Result<usize> {
        let (mut checked, mut named) = (0, 0);
        loop {
            let missing = self.store.missing_dns(DNS_CHECK_BATCH)?;
            if missing.is_empty() {
                break;
            }
            for addr in missing {
                let name = self.resolver.resolve(addr);
                if name.is_some() {
                    named += 1;
                }
                self.store.set_dns(addr, name)?;
                checked += 1;
            }
        }
        info!("dns check done, {} hosts checked, {} named", checked, named);
        Ok(named)
    }

    pub fn start(self: &Arc<Self>, runtime: &Handle) {
        let check = Arc::downgrade(self);
        self.task.start(runtime, true, move || {
            if let Some(check) = Weak::upgrade(&check) {
                if let Err(e) = check.run_once() {
                    warn!("dns check failed: {}", e);
                }
            }
        });
    }

    pub fn stop(&self) {
        self.task.stop();
    }
}
