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

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::runtime::Handle;
use tokio::select;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::import::TraceImporter;
use crate::common::{FlowProtocol, TraceImportInfo};
use crate::config::MultiplexerConfig;
use crate::error::Result;
use crate::flow::{
    self, detect_protocol, log_parse_error, FlowParserInterface, FlowParsers, ParseParam,
};

const RECV_BUFFER_SIZE: usize = 4 << 20;
const MAX_DATAGRAM_SIZE: usize = 65535;

// statsd:"multiplexer"
#[derive(Debug, Default)]
pub struct MultiplexerCounter {
    pub rx: AtomicU64,
    pub rx_bytes: AtomicU64,
    pub parsed: AtomicU64,
    pub failed: AtomicU64,
    pub unknown_version: AtomicU64,
    pub not_enabled: AtomicU64,
}

impl RefCountable for MultiplexerCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.swap(0, Ordering::Relaxed)),
            ),
            (
                "rx-bytes",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx_bytes.swap(0, Ordering::Relaxed)),
            ),
            (
                "parsed",
                CounterType::Counted,
                CounterValue::Unsigned(self.parsed.swap(0, Ordering::Relaxed)),
            ),
            (
                "failed",
                CounterType::Counted,
                CounterValue::Unsigned(self.failed.swap(0, Ordering::Relaxed)),
            ),
            (
                "unknown-version",
                CounterType::Counted,
                CounterValue::Unsigned(self.unknown_version.swap(0, Ordering::Relaxed)),
            ),
            (
                "not-enabled",
                CounterType::Counted,
                CounterValue::Unsigned(self.not_enabled.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

/// One UDP listening port dispatching datagrams to the enabled decoders.
///
/// Version sniffing picks NetFlow v5, v9 or IPFIX. A port configured for
/// sFlow has no version field to sniff, every datagram goes to the sFlow
/// decoder.
pub struct Multiplexer {
    name: String,
    enabled: bool,
    port: u16,
    protocols: Vec<FlowProtocol>,
    sflow: bool,

    parsers: FlowParsers,
    importer: Arc<TraceImporter>,
    counter: Arc<MultiplexerCounter>,

    running: AtomicBool,
    token: Mutex<Option<CancellationToken>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Multiplexer {
    pub fn new(config: &MultiplexerConfig, parsers: FlowParsers, importer: Arc<TraceImporter>) -> Self {
        Self {
            name: config.name.clone(),
            enabled: config.enabled,
            port: config.port,
            protocols: config.parsers.clone(),
            sflow: config.parsers.contains(&FlowProtocol::Sflow),
            parsers,
            importer,
            counter: Default::default(),
            running: AtomicBool::new(false),
            token: Mutex::new(None),
            handle: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counter(&self) -> Arc<MultiplexerCounter> {
        self.counter.clone()
    }

    /// Bound address once started, useful when configured with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    fn bind(&self, runtime: &Handle) -> Result<UdpSocket> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), self.port);
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        if let Err(e) = socket.set_recv_buffer_size(RECV_BUFFER_SIZE) {
            warn!(
                "multiplexer {} set receive buffer to {} failed: {}",
                self.name, RECV_BUFFER_SIZE, e
            );
        }
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        let _guard = runtime.enter();
        Ok(UdpSocket::from_std(socket.into())?)
    }

    pub fn start(self: &Arc<Self>, runtime: &Handle) -> Result<()> {
        if !self.enabled {
            info!("multiplexer {} is disabled", self.name);
            return Ok(());
        }
        if self.running.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        let socket = match self.bind(runtime) {
            Ok(s) => s,
            Err(e) => {
                self.running.store(false, Ordering::Relaxed);
                return Err(e);
            }
        };
        let local_addr = socket.local_addr()?;
        *self.local_addr.lock() = Some(local_addr);

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let multiplexer = self.clone();
        let handle = runtime.clone();
        *self.handle.lock() = Some(runtime.spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
            loop {
                select! {
                    _ = cancelled.cancelled() => break,
                    received = socket.recv_from(&mut buf) => match received {
                        Ok((n, source)) => {
                            multiplexer.import_datagram(&handle, source, &buf[..n], Utc::now());
                        }
                        Err(e) => warn!("multiplexer {} receive failed: {}", multiplexer.name, e),
                    },
                }
            }
            debug!("multiplexer {} receive loop exited", multiplexer.name);
        }));
        *self.token.lock() = Some(token);
        info!(
            "multiplexer {} listening on {} for {:?}",
            self.name, local_addr, self.protocols
        );
        Ok(())
    }

    /// Decodes one datagram and hands the records to the importer. Nothing
    /// here fails the receive loop; problems are logged and counted.
    pub fn import_datagram(
        &self,
        runtime: &Handle,
        source: SocketAddr,
        payload: &[u8],
        read_time: DateTime<Utc>,
    ) -> Option<JoinHandle<()>> {
        self.counter.rx.fetch_add(1, Ordering::Relaxed);
        self.counter
            .rx_bytes
            .fetch_add(payload.len() as u64, Ordering::Relaxed);
        let exporter = source.ip();
        self.importer.metrics().record_datagram(exporter, payload.len());

        let protocol = if self.sflow {
            FlowProtocol::Sflow
        } else {
            match detect_protocol(payload) {
                Ok(p) => p,
                Err(e) => {
                    self.counter.unknown_version.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "multiplexer {} dropped datagram from {}: {}",
                        self.name, source, e
                    );
                    return None;
                }
            }
        };
        if !self.protocols.contains(&protocol) {
            self.counter.not_enabled.fetch_add(1, Ordering::Relaxed);
            warn!(
                "multiplexer {} dropped {} datagram from {}: parser not enabled",
                self.name, protocol, source
            );
            return None;
        }

        let parser = self.parsers.get(protocol);
        let param = ParseParam::new(exporter, read_time);
        self.import_parsed(runtime, source, protocol, || parser.parse(&param, payload))
    }

    // A panicking decoder counts as a parse failure, the receive loop keeps going.
    fn import_parsed<F>(
        &self,
        runtime: &Handle,
        source: SocketAddr,
        protocol: FlowProtocol,
        parse: F,
    ) -> Option<JoinHandle<()>>
    where
        F: FnOnce() -> flow::Result<Vec<TraceImportInfo>>,
    {
        let exporter = source.ip();
        match panic::catch_unwind(AssertUnwindSafe(parse)) {
            Ok(Ok(traces)) => {
                self.counter.parsed.fetch_add(1, Ordering::Relaxed);
                self.importer.import(runtime, exporter, traces)
            }
            Ok(Err(e)) => {
                self.counter.failed.fetch_add(1, Ordering::Relaxed);
                self.importer.metrics().record_failure(exporter);
                log_parse_error(protocol, &source, &e);
                None
            }
            Err(cause) => {
                self.counter.failed.fetch_add(1, Ordering::Relaxed);
                self.importer.metrics().record_failure(exporter);
                let message = cause
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| cause.downcast_ref::<String>().cloned())
                    .unwrap_or_default();
                error!(
                    "multiplexer {} {} parser panicked on datagram from {}: {}",
                    self.name, protocol, source, message
                );
                None
            }
        }
    }

    /// Stops receiving. A datagram being processed completes first.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        if let Some(token) = self.token.lock().take() {
            token.cancel();
        }
        self.handle.lock().take();
        *self.local_addr.lock() = None;
        info!("multiplexer {} stopped", self.name);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::dedup::DuplicateClaimTracker;
    use super::super::metrics::ImportMetrics;
    use super::*;
    use crate::flow::TemplateStore;
    use crate::store::{MemoryTraceStore, TraceStore};

    // one record, 10.0.0.2:4242 -> 10.0.0.3:80 tcp
    fn netflow5(packets: u32, bytes: u32) -> Vec<u8> {
        let mut packet = vec![0, 5, 0, 1];
        packet.resize(24, 0);
        packet.extend_from_slice(&[10, 0, 0, 2, 10, 0, 0, 3]);
        packet.resize(24 + 16, 0);
        packet.extend_from_slice(&packets.to_be_bytes());
        packet.extend_from_slice(&bytes.to_be_bytes());
        packet.resize(24 + 32, 0);
        packet.extend_from_slice(&4242u16.to_be_bytes());
        packet.extend_from_slice(&80u16.to_be_bytes());
        packet.extend_from_slice(&[0, 0, 6]);
        packet.resize(24 + 48, 0);
        packet
    }

    fn multiplexer(
        store: Arc<MemoryTraceStore>,
        parsers: Vec<FlowProtocol>,
    ) -> Arc<Multiplexer> {
        let config = MultiplexerConfig {
            name: "test".to_owned(),
            enabled: true,
            port: 0,
            parsers,
        };
        let templates = || {
            Arc::new(TemplateStore::new(
                FlowProtocol::Netflow9,
                Duration::from_secs(3600),
            ))
        };
        let importer = TraceImporter::new(
            store,
            Arc::new(DuplicateClaimTracker::new(
                Duration::from_secs(600),
                Duration::from_secs(3600),
            )),
            Arc::new(ImportMetrics::new(
                Duration::from_secs(10),
                Duration::from_secs(60),
            )),
        );
        Arc::new(Multiplexer::new(
            &config,
            FlowParsers::new(templates(), templates()),
            Arc::new(importer),
        ))
    }

    fn source() -> SocketAddr {
        "192.0.2.1:2055".parse().unwrap()
    }

    #[tokio::test]
    async fn datagrams_are_dispatched_by_version() {
        let store = Arc::new(MemoryTraceStore::new());
        let mux = multiplexer(store.clone(), vec![FlowProtocol::Netflow5]);
        let runtime = Handle::current();

        mux.import_datagram(&runtime, source(), &netflow5(2, 120), Utc::now())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(store.len(), 1);

        // netflow9 header but only netflow5 enabled
        assert!(mux
            .import_datagram(&runtime, source(), &[0, 9, 0, 0], Utc::now())
            .is_none());
        assert!(mux
            .import_datagram(&runtime, source(), &[0, 7, 0, 0], Utc::now())
            .is_none());
        assert!(mux
            .import_datagram(&runtime, source(), &[0], Utc::now())
            .is_none());

        let counters = mux.counter().get_counters();
        assert_eq!(counters[0].2, CounterValue::Unsigned(4));
        assert_eq!(counters[2].2, CounterValue::Unsigned(1));
        assert_eq!(counters[4].2, CounterValue::Unsigned(2));
        assert_eq!(counters[5].2, CounterValue::Unsigned(1));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn parse_failure_is_contained() {
        let store = Arc::new(MemoryTraceStore::new());
        let mux = multiplexer(store.clone(), vec![FlowProtocol::Netflow5]);
        let mut packet = netflow5(1, 60);
        // record count beyond the v5 limit
        packet[3] = 200;
        assert!(mux
            .import_datagram(&Handle::current(), source(), &packet, Utc::now())
            .is_none());
        assert_eq!(mux.counter().get_counters()[3].2, CounterValue::Unsigned(1));
        assert_eq!(
            mux.importer
                .metrics()
                .endpoint(&source().ip())
                .unwrap()
                .parse_failures,
            1
        );
    }

    #[tokio::test]
    async fn parser_panic_counts_as_failure() {
        let store = Arc::new(MemoryTraceStore::new());
        let mux = multiplexer(store.clone(), vec![FlowProtocol::Netflow5]);
        let runtime = Handle::current();
        assert!(mux
            .import_parsed(&runtime, source(), FlowProtocol::Netflow5, || {
                panic!("index out of range")
            })
            .is_none());
        assert_eq!(mux.counter().get_counters()[3].2, CounterValue::Unsigned(1));
        assert_eq!(
            mux.importer
                .metrics()
                .endpoint(&source().ip())
                .unwrap()
                .parse_failures,
            1
        );

        // the next datagram is still imported
        mux.import_datagram(&runtime, source(), &netflow5(2, 120), Utc::now())
            .unwrap()
            .await
            .unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(mux.counter().get_counters()[2].2, CounterValue::Unsigned(1));
    }

    #[tokio::test]
    async fn sflow_port_skips_version_sniff() {
        let store = Arc::new(MemoryTraceStore::new());
        let mux = multiplexer(store, vec![FlowProtocol::Sflow]);
        // a netflow5 datagram is not valid sflow
        assert!(mux
            .import_datagram(&Handle::current(), source(), &netflow5(1, 60), Utc::now())
            .is_none());
        let counters = mux.counter().get_counters();
        assert_eq!(counters[3].2, CounterValue::Unsigned(1));
        assert_eq!(counters[4].2, CounterValue::Unsigned(0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn receives_over_udp_until_stopped() {
        let store = Arc::new(MemoryTraceStore::new());
        let mux = multiplexer(store.clone(), vec![FlowProtocol::Netflow5]);
        mux.start(&Handle::current()).unwrap();
        assert!(mux.is_running());
        let port = mux.local_addr().unwrap().port();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(&netflow5(3, 180), ("127.0.0.1", port))
            .await
            .unwrap();
        for _ in 0..200 {
            if store.len() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.len(), 1);
        let rows = store
            .aggregate(
                &Default::default(),
                Utc::now() - chrono::Duration::minutes(1),
                Utc::now() + chrono::Duration::minutes(1),
            )
            .unwrap();
        assert_eq!(rows[0].packet_count, 3);
        assert_eq!(rows[0].byte_count, 180);

        mux.stop();
        assert!(!mux.is_running());
        assert!(mux.local_addr().is_none());
    }

    #[tokio::test]
    async fn disabled_multiplexer_does_not_bind() {
        let store = Arc::new(MemoryTraceStore::new());
        let config = MultiplexerConfig {
            name: "off".to_owned(),
            enabled: false,
            port: 0,
            parsers: vec![FlowProtocol::Netflow5],
        };
        let templates = Arc::new(TemplateStore::new(
            FlowProtocol::Ipfix,
            Duration::from_secs(3600),
        ));
        let importer = Arc::new(TraceImporter::new(
            store,
            Arc::new(DuplicateClaimTracker::new(
                Duration::from_secs(600),
                Duration::from_secs(3600),
            )),
            Arc::new(ImportMetrics::new(
                Duration::from_secs(10),
                Duration::from_secs(60),
            )),
        ));
        let mux = Arc::new(Multiplexer::new(
            &config,
            FlowParsers::new(templates.clone(), templates),
            importer,
        ));
        mux.start(&Handle::current()).unwrap();
        assert!(!mux.is_running());
        assert!(mux.local_addr().is_none());
    }
}
