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

use std::path::Path;
use std::sync::{Arc, Weak};

use flexi_logger::LoggerHandle;
use log::{info, warn};
use tokio::runtime::{Builder, Runtime};

use crate::collector::{DuplicateClaimTracker, ImportMetrics, Multiplexer, TraceImporter};
use crate::common::FlowProtocol;
use crate::config::Config;
use crate::error::Result;
use crate::flow::{FlowParsers, TemplateStore};
use crate::graph::{GraphAssembler, GraphDetails};
use crate::layer::LayerContext;
use crate::lookup::{
    CachedDnsResolver, DnsCheck, DnsResolver, StaticTagsSource, TagCache, TagsCacheService,
    SystemDnsResolver,
};
use crate::store::{GraphRequest, LayoutStore, MemoryLayoutStore, MemoryTraceStore, TraceStore};
use crate::utils::logger::start_logger;
use crate::utils::stats::{self, Countable, RefCountable, StatsOption};

/// Owns every running component of the collector.
pub struct Packrat {
    config: Config,
    runtime: Arc<Runtime>,
    stats: Arc<stats::Collector>,
    logger: Option<LoggerHandle>,

    netflow9_templates: Arc<TemplateStore>,
    ipfix_templates: Arc<TemplateStore>,
    claims: Arc<DuplicateClaimTracker>,
    metrics: Arc<ImportMetrics>,
    importer: Arc<TraceImporter>,
    multiplexers: Vec<Arc<Multiplexer>>,

    dns_cache: Option<Arc<CachedDnsResolver>>,
    dns_check: Option<Arc<DnsCheck>>,
    tags: Option<Arc<TagsCacheService>>,

    traces: Arc<MemoryTraceStore>,
    layouts: Arc<MemoryLayoutStore>,
    assembler: GraphAssembler,
}

fn weak<T: RefCountable + 'static>(c: &Arc<T>) -> Countable {
    Countable::Ref(Arc::downgrade(c) as Weak<dyn RefCountable>)
}

impl Packrat {
    /// Loads the configuration file, starts logging and then every service.
    pub fn start<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let config = Config::load_from_file(config_path.as_ref())?;
        let (logger, log_counter) =
            start_logger(&config.log_file, &config.log_level, config.log_retention)?;
        info!("packrat starting with {}", config_path.as_ref().display());

        let mut packrat = Self::with_config(config)?;
        packrat
            .stats
            .register_countable("log-counter", Countable::Owned(Box::new(log_counter)), vec![]);
        packrat.logger = Some(logger);
        Ok(packrat)
    }

    /// Starts every service of a validated configuration. Logging is left to
    /// the caller.
    pub fn with_config(config: Config) -> Result<Self> {
        let runtime = Arc::new(
            Builder::new_multi_thread()
                .enable_all()
                .thread_name("packrat-runtime")
                .build()?,
        );
        let handle = runtime.handle().clone();

        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();
        let stats = Arc::new(stats::Collector::new(&hostname, config.stats.interval));
        if let Some(addr) = config.stats.statsd_address {
            if let Err(e) = stats.set_statsd_address(addr) {
                warn!("statsd sink {} unavailable: {}", addr, e);
            }
        }

        let netflow9_templates = Arc::new(TemplateStore::new(
            FlowProtocol::Netflow9,
            config.template_cleanup.netflow9_cleanup_interval,
        ));
        let ipfix_templates = Arc::new(TemplateStore::new(
            FlowProtocol::Ipfix,
            config.template_cleanup.ipfix_cleanup_interval,
        ));
        let claims = Arc::new(DuplicateClaimTracker::new(
            config.duplicate_flagging.claim_expiration_lifespan,
            config.duplicate_flagging.cleanup_interval,
        ));
        let metrics = Arc::new(ImportMetrics::new(
            config.import_metrics.summation_period,
            config.import_metrics.save_period,
        ));
        let traces = Arc::new(MemoryTraceStore::with_retention(
            config.trace_retention.lifespan,
            config.trace_retention.cleanup_interval,
        ));
        let importer = Arc::new(TraceImporter::new(
            traces.clone(),
            claims.clone(),
            metrics.clone(),
        ));

        let parsers = FlowParsers::new(netflow9_templates.clone(), ipfix_templates.clone());
        let multiplexers: Vec<_> = config
            .multiplexers
            .iter()
            .map(|m| Arc::new(Multiplexer::new(m, parsers.clone(), importer.clone())))
            .collect();

        let (dns_cache, dns_check) = if config.dns.enabled {
            let cache = Arc::new(CachedDnsResolver::new(
                Box::new(SystemDnsResolver),
                config.dns.invalidation_duration,
                config.dns.cleanup_interval,
            ));
            let check = Arc::new(DnsCheck::new(
                traces.clone(),
                cache.clone() as Arc<dyn DnsResolver>,
                config.dns.check_interval,
            ));
            (Some(cache), Some(check))
        } else {
            (None, None)
        };

        let tags = config.tags.enabled.then(|| {
            Arc::new(TagsCacheService::new(
                Box::new(StaticTagsSource::new(config.tags.static_tags.clone())),
                config.tags.refresh_period,
            ))
        });
        let context = match tags.as_ref() {
            Some(t) => LayerContext::with_tags(t.clone() as Arc<dyn TagCache>),
            None => LayerContext::default(),
        };

        let layouts = Arc::new(MemoryLayoutStore::new(config.layouts.clone()));
        let assembler = GraphAssembler::new(traces.clone(), layouts.clone(), context);

        let packrat = Self {
            config,
            runtime,
            stats,
            logger: None,
            netflow9_templates,
            ipfix_templates,
            claims,
            metrics,
            importer,
            multiplexers,
            dns_cache,
            dns_check,
            tags,
            traces,
            layouts,
            assembler,
        };
        packrat.register_counters(&parsers);
        packrat.run(&handle)?;
        Ok(packrat)
    }

    fn register_counters(&self, parsers: &FlowParsers) {
        let stats = &self.stats;
        for (protocol, counter) in parsers.counters() {
            stats.register_countable(
                "flow-parser",
                weak(&counter),
                vec![StatsOption::Tag("protocol", protocol.to_string())],
            );
        }
        for m in self.multiplexers.iter() {
            stats.register_countable(
                "multiplexer",
                weak(&m.counter()),
                vec![StatsOption::Tag("name", m.name().to_owned())],
            );
        }
        for templates in [&self.netflow9_templates, &self.ipfix_templates] {
            stats.register_countable(
                "template-store",
                weak(templates),
                vec![StatsOption::Tag("protocol", templates.protocol().to_string())],
            );
        }
        stats.register_countable("trace-store", weak(&self.traces), vec![]);
        stats.register_countable("duplicate-claims", weak(&self.claims), vec![]);
        stats.register_countable("trace-import", weak(&self.importer.counter()), vec![]);
        stats.register_countable("trace-write-latency", weak(&self.importer.write_latency()), vec![]);
        if let Some(cache) = self.dns_cache.as_ref() {
            stats.register_countable("dns-cache", weak(cache), vec![]);
        }
        if let Some(tags) = self.tags.as_ref() {
            stats.register_countable("tags-cache", weak(tags), vec![]);
        }
    }

    fn run(&self, handle: &tokio::runtime::Handle) -> Result<()> {
        self.stats.start();
        self.netflow9_templates.start(handle);
        self.ipfix_templates.start(handle);
        self.traces.start(handle);
        self.claims.start(handle);
        self.metrics.start(handle);
        if let Some(cache) = self.dns_cache.as_ref() {
            cache.start(handle);
        }
        if let Some(check) = self.dns_check.as_ref() {
            check.start(handle);
        }
        if let Some(tags) = self.tags.as_ref() {
            tags.start(handle);
        }
        for m in self.multiplexers.iter() {
            if let Err(e) = m.start(handle) {
                self.stop();
                return Err(e);
            }
        }
        info!(
            "packrat started, {} multiplexers, {} layouts",
            self.multiplexers.len(),
            self.config.layouts.len()
        );
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn multiplexers(&self) -> &[Arc<Multiplexer>] {
        &self.multiplexers
    }

    pub fn import_metrics(&self) -> &Arc<ImportMetrics> {
        &self.metrics
    }

    pub fn traces(&self) -> Arc<dyn TraceStore> {
        self.traces.clone()
    }

    pub fn layouts(&self) -> Arc<dyn LayoutStore> {
        self.layouts.clone()
    }

    pub fn generate_graph(&self, request: &GraphRequest) -> Result<GraphDetails> {
        self.assembler.generate(request)
    }

    pub fn stop(&self) {
        info!("packrat stopping");
        for m in self.multiplexers.iter() {
            m.stop();
        }
        if let Some(tags) = self.tags.as_ref() {
            tags.stop();
        }
        if let Some(check) = self.dns_check.as_ref() {
            check.stop();
        }
        if let Some(cache) = self.dns_cache.as_ref() {
            cache.stop();
        }
        self.metrics.stop();
        self.claims.stop();
        self.traces.stop();
        self.ipfix_templates.stop();
        self.netflow9_templates.stop();
        self.stats.stop();
        info!("packrat stopped");
        if let Some(logger) = self.logger.as_ref() {
            logger.flush();
        }
    }

    pub fn runtime(&self) -> Arc<Runtime> {
        self.runtime.clone()
    }
}
