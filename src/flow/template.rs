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
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use log::info;
use parking_lot::RwLock;
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use tokio::runtime::Handle;

use crate::common::FlowProtocol;
use crate::utils::timer::PeriodicTask;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldSpec {
    pub id: u16,
    pub length: u16,
    // IPFIX private elements carry an enterprise number
    pub enterprise: Option<u32>,
}

impl FieldSpec {
    pub const VARIABLE_LENGTH: u16 = 65535;

    pub fn new(id: u16, length: u16) -> Self {
        Self {
            id,
            length,
            enterprise: None,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.length == Self::VARIABLE_LENGTH
    }
}

/// Field layout announced by an exporter for one template id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Template {
    pub id: u16,
    pub fields: Vec<FieldSpec>,
}

impl Template {
    pub fn new(id: u16, fields: Vec<FieldSpec>) -> Self {
        Self { id, fields }
    }

    /// Record size in bytes, `None` when a field has variable length.
    pub fn fixed_len(&self) -> Option<usize> {
        self.fields.iter().try_fold(0usize, |acc, f| {
            if f.is_variable() {
                None
            } else {
                Some(acc + f.length as usize)
            }
        })
    }

    // Smallest possible record, a variable field takes at least its 1 byte
    // length prefix.
    pub fn min_len(&self) -> usize {
        self.fields
            .iter()
            .map(|f| if f.is_variable() { 1 } else { f.length as usize })
            .sum()
    }
}

/// Templates keyed by (exporter address, template id).
///
/// The whole store is dropped on a coarse interval instead of aging single
/// entries; exporters resend templates periodically so a cleared store fills
/// again within one refresh cycle.
pub struct TemplateStore {
    protocol: FlowProtocol,
    templates: RwLock<HashMap<(IpAddr, u16), Arc<Template>>>,
    cleaner: PeriodicTask,

    inserted: AtomicU64,
    withdrawn: AtomicU64,
    cleared: AtomicU64,
}

impl TemplateStore {
    pub fn new(protocol: FlowProtocol, cleanup_interval: Duration) -> Self {
        Self {
            protocol,
            templates: RwLock::new(HashMap::new()),
            cleaner: PeriodicTask::new("template-cleanup", cleanup_interval),
            inserted: AtomicU64::new(0),
            withdrawn: AtomicU64::new(0),
            cleared: AtomicU64::new(0),
        }
    }

    pub fn protocol(&self) -> FlowProtocol {
        self.protocol
    }

    pub fn get(&self, exporter: IpAddr, id: u16) -> Option<Arc<Template>> {
        self.templates.read().get(&(exporter, id)).cloned()
    }

    /// Adds or refreshes a template, returns true if it replaced an older one.
    pub fn insert(&self, exporter: IpAddr, template: Template) -> bool {
        self.inserted.fetch_add(1, Ordering::Relaxed);
        self.templates
            .write()
            .insert((exporter, template.id), Arc::new(template))
            .is_some()
    }

    pub fn remove(&self, exporter: IpAddr, id: u16) -> bool {
        let removed = self.templates.write().remove(&(exporter, id)).is_some();
        if removed {
            self.withdrawn.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.templates.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.read().is_empty()
    }

    pub fn clear(&self) -> usize {
        let dropped = {
            let mut templates = self.templates.write();
            let n = templates.len();
            templates.clear();
            n
        };
        self.cleared.fetch_add(dropped as u64, Ordering::Relaxed);
        info!("{} template store cleared, {} templates dropped", self.protocol, dropped);
        dropped
    }

    pub fn start(self: &Arc<Self>, runtime: &Handle) {
        let store = Arc::downgrade(self);
        self.cleaner.start(runtime, false, move || {
            if let Some(store) = Weak::upgrade(&store) {
                store.clear();
            }
        });
    }

    pub fn stop(&self) {
        self.cleaner.stop();
    }
}

impl RefCountable for TemplateStore {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "templates",
                CounterType::Gauged,
                CounterValue::Unsigned(self.len() as u64),
            ),
            (
                "inserted",
                CounterType::Counted,
                CounterValue::Unsigned(self.inserted.swap(0, Ordering::Relaxed)),
            ),
            (
                "withdrawn",
                CounterType::Counted,
                CounterValue::Unsigned(self.withdrawn.swap(0, Ordering::Relaxed)),
            ),
            (
                "cleared",
                CounterType::Counted,
                CounterValue::Unsigned(self.cleared.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exporter(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn keyed_by_exporter_and_id() {
        let store = TemplateStore::new(FlowProtocol::Netflow9, Duration::from_secs(60));
        let t = Template::new(256, vec![FieldSpec::new(8, 4), FieldSpec::new(12, 4)]);
        assert!(!store.insert(exporter("10.0.0.1"), t.clone()));
        assert!(store.get(exporter("10.0.0.1"), 256).is_some());
        assert!(store.get(exporter("10.0.0.2"), 256).is_none());
        assert!(store.get(exporter("10.0.0.1"), 257).is_none());

        let refreshed = Template::new(256, vec![FieldSpec::new(8, 4)]);
        assert!(store.insert(exporter("10.0.0.1"), refreshed.clone()));
        assert_eq!(*store.get(exporter("10.0.0.1"), 256).unwrap(), refreshed);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_drops_everything() {
        let store = TemplateStore::new(FlowProtocol::Ipfix, Duration::from_secs(60));
        store.insert(exporter("10.0.0.1"), Template::new(256, vec![]));
        store.insert(exporter("10.0.0.2"), Template::new(300, vec![]));
        assert_eq!(store.clear(), 2);
        assert!(store.is_empty());
        assert!(!store.remove(exporter("10.0.0.1"), 256));
    }

    #[test]
    fn record_lengths() {
        let fixed = Template::new(256, vec![FieldSpec::new(8, 4), FieldSpec::new(1, 8)]);
        assert_eq!(fixed.fixed_len(), Some(12));
        assert_eq!(fixed.min_len(), 12);

        let variable = Template::new(
            257,
            vec![FieldSpec::new(8, 4), FieldSpec::new(82, FieldSpec::VARIABLE_LENGTH)],
        );
        assert_eq!(variable.fixed_len(), None);
        assert_eq!(variable.min_len(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn periodic_clear() {
        let store = Arc::new(TemplateStore::new(
            FlowProtocol::Netflow9,
            Duration::from_millis(20),
        ));
        store.insert(exporter("10.0.0.1"), Template::new(256, vec![]));
        store.start(&Handle::current());
        tokio::time::sleep(Duration::from_millis(120)).await;
        store.stop();
        assert!(store.is_empty());
    }
}
