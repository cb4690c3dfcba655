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

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use log::{info, warn};
use parking_lot::Mutex;
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use tokio::runtime::Handle;

use crate::error::Result;
use crate::utils::timer::PeriodicTask;

pub type HostTags = HashMap<IpAddr, Vec<String>>;

pub trait TagCache: Send + Sync {
    fn tags_for(&self, addr: IpAddr) -> Option<Vec<String>>;
}

/// Inventory the tag cache is filled from.
pub trait TagsSource: Send + Sync {
    fn fetch(&self) -> Result<HostTags>;
}

/// Fixed tags, usually from the configuration file.
#[derive(Clone, Debug, Default)]
pub struct StaticTagsSource {
    tags: HostTags,
}

impl StaticTagsSource {
    pub fn new(tags: HostTags) -> Self {
        Self { tags }
    }
}

impl TagsSource for StaticTagsSource {
    fn fetch(&self) -> Result<HostTags> {
        Ok(self.tags.clone())
    }
}

/// Snapshot of host tags replaced as a whole on every refresh; readers never
/// wait for a refresh in progress.
pub struct TagsCacheService {
    source: Box<dyn TagsSource>,
    tags: ArcSwap<HostTags>,
    last_refresh: Mutex<Option<DateTime<Utc>>>,
    refresher: PeriodicTask,
}

impl TagsCacheService {
    pub fn new(source: Box<dyn TagsSource>, refresh_period: Duration) -> Self {
        Self {
            source,
            tags: ArcSwap::from_pointee(HashMap::new()),
            last_refresh: Mutex::new(None),
            refresher: PeriodicTask::new("tags-refresh", refresh_period),
        }
    }

    /// Replaces the snapshot, a failed fetch keeps the previous one.
    pub fn refresh(&self) -> Result<usize> {
        let tags = self.source.fetch()?;
        let count = tags.len();
        self.tags.store(Arc::new(tags));
        *self.last_refresh.lock() = Some(Utc::now());
        info!("tags cache refreshed, {} hosts tagged", count);
        Ok(count)
    }

    pub fn count(&self) -> usize {
        self.tags.load().len()
    }

    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        *self.last_refresh.lock()
    }

    pub fn start(self: &Arc<Self>, runtime: &Handle) {
        let service = Arc::downgrade(self);
        self.refresher.start(runtime, true, move || {
            if let Some(service) = Weak::upgrade(&service) {
                if let Err(e) = service.refresh() {
                    warn!("tags cache refresh failed: {}", e);
                }
            }
        });
    }

    pub fn stop(&self) {
        self.refresher.stop();
    }
}

impl TagCache for TagsCacheService {
    fn tags_for(&self, addr: IpAddr) -> Option<Vec<String>> {
        self.tags.load().get(&addr).cloned()
    }
}

impl RefCountable for TagsCacheService {
    fn get_counters(&self) -> Vec<Counter> {
        vec![(
            "tagged-hosts",
            CounterType::Gauged,
            CounterValue::Unsigned(self.count() as u64),
        )]
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::error::Error;

    struct Flaky {
        fail: AtomicBool,
    }

    impl TagsSource for Flaky {
        fn fetch(&self) -> Result<HostTags> {
            if self.fail.load(Ordering::Relaxed) {
                return Err(Error::TagsSource("inventory unreachable".to_owned()));
            }
            let mut tags = HashMap::new();
            tags.insert("10.0.0.1".parse().unwrap(), vec!["esx".to_owned()]);
            Ok(tags)
        }
    }

    #[test]
    fn failed_refresh_keeps_snapshot() {
        let source = Arc::new(Flaky {
            fail: AtomicBool::new(false),
        });
        struct Shared(Arc<Flaky>);
        impl TagsSource for Shared {
            fn fetch(&self) -> Result<HostTags> {
                self.0.fetch()
            }
        }
        let cache = TagsCacheService::new(Box::new(Shared(source.clone())), Duration::from_secs(60));
        assert_eq!(cache.count(), 0);
        assert!(cache.last_refresh().is_none());

        assert_eq!(cache.refresh().unwrap(), 1);
        let refreshed = cache.last_refresh();
        assert!(refreshed.is_some());

        source.fail.store(true, Ordering::Relaxed);
        assert!(matches!(cache.refresh(), Err(Error::TagsSource(_))));
        assert_eq!(cache.last_refresh(), refreshed);
        assert_eq!(
            cache.tags_for("10.0.0.1".parse().unwrap()),
            Some(vec!["esx".to_owned()])
        );
        assert_eq!(cache.tags_for("10.0.0.2".parse().unwrap()), None);
    }
}
