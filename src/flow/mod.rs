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

//! Decoders turning exporter datagrams into [`TraceImportInfo`] records.
//!
//! NetFlow v5 is fixed-format, NetFlow v9 and IPFIX are template driven and
//! share a [`TemplateStore`] per protocol, sFlow v5 carries sampled frames that
//! are parsed down to the transport header.

mod field;
mod ipfix;
mod netflow5;
mod netflow9;
mod reader;
mod sflow;
mod template;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use enum_dispatch::enum_dispatch;
use log::{debug, error, warn};
use public::bytes::read_u16_be;
use public::counter::{Counter, CounterType, CounterValue, RefCountable};
use thiserror::Error;

pub use ipfix::IpfixParser;
pub use netflow5::NetFlow5Parser;
pub use netflow9::NetFlow9Parser;
pub use sflow::SflowParser;
pub use template::{FieldSpec, Template, TemplateStore};

use crate::common::{FlowProtocol, TraceImportInfo};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("truncated at offset {offset}, {need} more bytes needed")]
    Truncated { offset: usize, need: usize },
    #[error("no template {template_id} known for exporter {exporter}")]
    MissingTemplate { exporter: IpAddr, template_id: u16 },
    #[error("malformed {what}")]
    Malformed { what: String, bytes: Vec<u8> },
    #[error("unsupported {0}")]
    Unsupported(String),
    #[error("unexpected version {0}")]
    UnexpectedVersion(u16),
}

impl ParseError {
    pub(crate) fn malformed<S: Into<String>>(what: S, bytes: &[u8]) -> Self {
        ParseError::Malformed {
            what: what.into(),
            bytes: bytes.to_vec(),
        }
    }
}

pub type Result<T, E = ParseError> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ParseParam {
    // address of the device that sent the datagram
    pub exporter: IpAddr,
    pub read_time: DateTime<Utc>,
}

impl ParseParam {
    pub fn new(exporter: IpAddr, read_time: DateTime<Utc>) -> Self {
        Self {
            exporter,
            read_time,
        }
    }
}

#[enum_dispatch(FlowParser)]
pub trait FlowParserInterface {
    /// Decodes one datagram. Set and record level problems are logged and
    /// skipped; only datagram level failures come back as errors.
    fn parse(&self, param: &ParseParam, payload: &[u8]) -> Result<Vec<TraceImportInfo>>;
    fn protocol(&self) -> FlowProtocol;
}

#[enum_dispatch]
#[derive(Clone)]
pub enum FlowParser {
    NetFlow5Parser,
    NetFlow9Parser,
    IpfixParser,
    SflowParser,
}

/// One parser per protocol, shared by every multiplexer so that template
/// state and counters are per protocol rather than per port.
#[derive(Clone)]
pub struct FlowParsers {
    netflow5: NetFlow5Parser,
    netflow9: NetFlow9Parser,
    ipfix: IpfixParser,
    sflow: SflowParser,
}

impl FlowParsers {
    pub fn new(netflow9_templates: Arc<TemplateStore>, ipfix_templates: Arc<TemplateStore>) -> Self {
        Self {
            netflow5: NetFlow5Parser::new(),
            netflow9: NetFlow9Parser::new(netflow9_templates),
            ipfix: IpfixParser::new(ipfix_templates),
            sflow: SflowParser::new(),
        }
    }

    pub fn get(&self, protocol: FlowProtocol) -> FlowParser {
        match protocol {
            FlowProtocol::Netflow5 => self.netflow5.clone().into(),
            FlowProtocol::Netflow9 => self.netflow9.clone().into(),
            FlowProtocol::Ipfix => self.ipfix.clone().into(),
            FlowProtocol::Sflow => self.sflow.clone().into(),
        }
    }

    pub fn counters(&self) -> Vec<(FlowProtocol, Arc<FlowParserCounter>)> {
        vec![
            (FlowProtocol::Netflow5, self.netflow5.counter()),
            (FlowProtocol::Netflow9, self.netflow9.counter()),
            (FlowProtocol::Ipfix, self.ipfix.counter()),
            (FlowProtocol::Sflow, self.sflow.counter()),
        ]
    }
}

/// Reads the version field shared by NetFlow v5, NetFlow v9 and IPFIX.
pub fn detect_protocol(payload: &[u8]) -> Result<FlowProtocol> {
    if payload.len() < 2 {
        return Err(ParseError::Truncated {
            offset: 0,
            need: 2,
        });
    }
    let version = read_u16_be(payload);
    FlowProtocol::from_version(version).ok_or(ParseError::UnexpectedVersion(version))
}

// Severity follows the error class: expected losses are quiet, malformed
// input keeps the offending bytes, the rest is an error.
pub fn log_parse_error(protocol: FlowProtocol, source: &SocketAddr, e: &ParseError) {
    match e {
        ParseError::Truncated { .. } | ParseError::Unsupported(_) => {
            debug!("{} datagram from {} dropped: {}", protocol, source, e)
        }
        ParseError::MissingTemplate { .. } => {
            warn!("{} datagram from {} skipped: {}", protocol, source, e)
        }
        ParseError::Malformed { bytes, .. } => warn!(
            "{} datagram from {} dropped: {}, bytes: {}",
            protocol,
            source,
            e,
            hex::encode(bytes)
        ),
        ParseError::UnexpectedVersion(_) => {
            error!("{} datagram from {} dropped: {}", protocol, source, e)
        }
    }
}

// statsd:"flow_parser"
#[derive(Debug, Default)]
pub struct FlowParserCounter {
    pub datagrams: AtomicU64,
    pub records: AtomicU64,
    pub missing_template: AtomicU64,
    pub malformed: AtomicU64,
    pub unsupported: AtomicU64,
    pub templates: AtomicU64,
}

impl RefCountable for FlowParserCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "datagrams",
                CounterType::Counted,
                CounterValue::Unsigned(self.datagrams.swap(0, Ordering::Relaxed)),
            ),
            (
                "records",
                CounterType::Counted,
                CounterValue::Unsigned(self.records.swap(0, Ordering::Relaxed)),
            ),
            (
                "missing-template",
                CounterType::Counted,
                CounterValue::Unsigned(self.missing_template.swap(0, Ordering::Relaxed)),
            ),
            (
                "malformed",
                CounterType::Counted,
                CounterValue::Unsigned(self.malformed.swap(0, Ordering::Relaxed)),
            ),
            (
                "unsupported",
                CounterType::Counted,
                CounterValue::Unsigned(self.unsupported.swap(0, Ordering::Relaxed)),
            ),
            (
                "templates",
                CounterType::Counted,
                CounterValue::Unsigned(self.templates.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

#[cfg(test)]
pub(crate) mod test_data {
    use base64::{engine::general_purpose::STANDARD, Engine};

    pub fn decode(captured: &str) -> Vec<u8> {
        STANDARD.decode(captured).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_by_version() {
        assert_eq!(detect_protocol(&[0, 5, 1]).unwrap(), FlowProtocol::Netflow5);
        assert_eq!(detect_protocol(&[0, 9]).unwrap(), FlowProtocol::Netflow9);
        assert_eq!(detect_protocol(&[0, 10]).unwrap(), FlowProtocol::Ipfix);
        assert!(matches!(
            detect_protocol(&[0, 7]),
            Err(ParseError::UnexpectedVersion(7))
        ));
        assert!(matches!(
            detect_protocol(&[0]),
            Err(ParseError::Truncated { .. })
        ));
    }
}
