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

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::select;
use tokio::task::{self, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// A named background job run on a fixed interval until stopped.
///
/// The job itself runs on the blocking pool so that slow work such as DNS
/// lookups never stalls the runtime workers.
pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    token: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub fn new(name: &'static str, interval: Duration) -> Self {
        Self {
            name,
            interval: interval.max(MIN_INTERVAL),
            token: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().is_some()
    }

    // With `immediate` the job also runs right after start, otherwise the
    // first run happens one interval later.
    pub fn start<F>(&self, runtime: &Handle, immediate: bool, job: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let name = self.name;
        let interval = self.interval;
        let job = Arc::new(job);
        *handle = Some(runtime.spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !immediate {
                ticker.tick().await;
            }
            loop {
                select! {
                    _ = cancelled.cancelled() => break,
                    _ = ticker.tick() => {
                        let job = job.clone();
                        if let Err(e) = task::spawn_blocking(move || job()).await {
                            warn!("periodic task {} failed: {}", name, e);
                        }
                    }
                }
            }
            debug!("periodic task {} exited", name);
        }));
        *self.token.lock() = Some(token);
        info!("periodic task {} started, interval {:?}", name, interval);
    }

    pub fn stop(&self) {
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        if self.handle.lock().take().is_some() {
            info!("periodic task {} stopped", self.name);
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(token) = self.token.get_mut().take() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn runs_until_stopped() {
        let runs = Arc::new(AtomicU32::new(0));
        let task = PeriodicTask::new("test", Duration::from_millis(10));
        let counted = runs.clone();
        task.start(&Handle::current(), true, move || {
            counted.fetch_add(1, Ordering::Relaxed);
        });
        assert!(task.is_running());
        time::sleep(Duration::from_millis(100)).await;
        task.stop();
        assert!(!task.is_running());
        let seen = runs.load(Ordering::Relaxed);
        assert!(seen >= 2);
        time::sleep(Duration::from_millis(50)).await;
        assert!(runs.load(Ordering::Relaxed) <= seen + 1);
    }

    #[test]
    fn zero_interval_is_clamped() {
        let task = PeriodicTask::new("zero", Duration::ZERO);
        assert_eq!(task.interval(), MIN_INTERVAL);
    }
}
