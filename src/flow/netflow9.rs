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
use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};

use super::field::read_data_set;
use super::reader::Reader;
use super::{
    FieldSpec, FlowParserCounter, FlowParserInterface, ParseError, ParseParam, Result, Template,
    TemplateStore,
};
use crate::common::{FlowProtocol, TraceImportInfo};

const HEADER_LEN: usize = 20;
const SET_HEADER_LEN: usize = 4;
const TEMPLATE_SET_ID: u16 = 0;
const OPTIONS_TEMPLATE_SET_ID: u16 = 1;
const MIN_DATA_SET_ID: u16 = 256;

/// NetFlow v9 (RFC 3954) decoder.
#[derive(Clone)]
pub struct NetFlow9Parser {
    templates: Arc<TemplateStore>,
    counter: Arc<FlowParserCounter>,
}

impl NetFlow9Parser {
    pub fn new(templates: Arc<TemplateStore>) -> Self {
        Self {
            templates,
            counter: Arc::new(FlowParserCounter::default()),
        }
    }

    pub fn counter(&self) -> Arc<FlowParserCounter> {
        self.counter.clone()
    }

    fn read_template_set(&self, exporter: IpAddr, body: &[u8]) -> Result<()> {
        let mut reader = Reader::new(body);
        while reader.remaining() >= SET_HEADER_LEN {
            let id = reader.u16()?;
            let field_count = reader.u16()?;
            if id < MIN_DATA_SET_ID {
                return Err(ParseError::malformed(
                    format!("template id {}", id),
                    body,
                ));
            }
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                fields.push(FieldSpec::new(reader.u16()?, reader.u16()?));
            }
            if self.templates.insert(exporter, Template::new(id, fields)) {
                debug!("netflow9 template {} from {} refreshed", id, exporter);
            } else {
                debug!("netflow9 template {} from {} added", id, exporter);
            }
            self.counter.templates.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn read_data(
        &self,
        param: &ParseParam,
        set_id: u16,
        body: &[u8],
        traces: &mut Vec<TraceImportInfo>,
    ) {
        match self.templates.get(param.exporter, set_id) {
            Some(template) => read_data_set(
                param,
                FlowProtocol::Netflow9,
                &template,
                body,
                &self.counter,
                traces,
            ),
            None => {
                self.counter.missing_template.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "netflow9 data set skipped: {}",
                    ParseError::MissingTemplate {
                        exporter: param.exporter,
                        template_id: set_id,
                    }
                );
            }
        }
    }
}

impl FlowParserInterface for NetFlow9Parser {
    fn parse(&self, param: &ParseParam, payload: &[u8]) -> Result<Vec<TraceImportInfo>> {
        let mut reader = Reader::new(payload);
        let version = reader.u16()?;
        if version != FlowProtocol::NETFLOW9_VERSION {
            return Err(ParseError::UnexpectedVersion(version));
        }
        // count, sys uptime, unix secs, sequence, source id
        reader.skip(HEADER_LEN - 2)?;
        self.counter.datagrams.fetch_add(1, Ordering::Relaxed);

        let mut traces = vec![];
        while reader.remaining() >= SET_HEADER_LEN {
            let set_id = reader.u16()?;
            let length = reader.u16()? as usize;
            if length < SET_HEADER_LEN {
                self.counter.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "netflow9 datagram from {} stops at set {} with length {}",
                    param.exporter, set_id, length
                );
                break;
            }
            let Ok(body) = reader.take(length - SET_HEADER_LEN) else {
                debug!(
                    "netflow9 datagram from {} ends inside set {}",
                    param.exporter, set_id
                );
                break;
            };
            match set_id {
                TEMPLATE_SET_ID => {
                    if let Err(e) = self.read_template_set(param.exporter, body) {
                        self.counter.malformed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "netflow9 template set from {} incomplete: {}, set bytes: {}",
                            param.exporter,
                            e,
                            hex::encode(body)
                        );
                    }
                }
                OPTIONS_TEMPLATE_SET_ID => {
                    debug!("netflow9 options template from {} ignored", param.exporter)
                }
                id if id < MIN_DATA_SET_ID => {
                    debug!("netflow9 reserved set {} from {} ignored", id, param.exporter)
                }
                id => self.read_data(param, id, body, &mut traces),
            }
        }
        Ok(traces)
    }

    fn protocol(&self) -> FlowProtocol {
        FlowProtocol::Netflow9
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use chrono::Utc;
    use public::enums::DataProtocol;

    use super::*;
    use crate::flow::test_data::decode;

    const TEMPLATE_PACKET: &str = "AAkAAgBaBI9k0SU7AAAAaAAAAAIBAwBRAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAzC8AxwKgAlgG71i0GAAAAAQBZiYAAWYmAAAApaQAAAAAAAABAAAAAAAAAAAEAAAA8AQMADQAbABAAHAAQAAgABAAMAAQABwACAAsAAgAEAAEAMAAEABYABAAVAAQACgAEAAEACAACAAg=";
    const DATA_PACKET: &str = "AAkAAwBZtm9k0SUnAAAAZwAAAAIBAwDrAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAACin4bqwKgAlgG70kIGAAAAAQBY7TMAWTtgAAApaQAAAAAAAAaoAAAAAAAAAAMAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAJJCmzbAqACWaYz32AYAAAABAFk7YABZO2AAAClpAAAAAAAAASYAAAAAAAAAAQAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAEkIae8CoAJYBu9ZgBgAAAAEAWTtgAFk7YAAAKWkAAAAAAAAAjAAAAAAAAAAC";

    fn parser() -> NetFlow9Parser {
        NetFlow9Parser::new(Arc::new(TemplateStore::new(
            FlowProtocol::Netflow9,
            Duration::from_secs(3600),
        )))
    }

    fn param(exporter: &str) -> ParseParam {
        ParseParam::new(exporter.parse().unwrap(), Utc::now())
    }

    #[test]
    fn template_is_learned() {
        let parser = parser();
        let traces = parser
            .parse(&param("127.0.0.1"), &decode(TEMPLATE_PACKET))
            .unwrap();
        // the data set precedes the template inside the datagram
        assert!(traces.is_empty());
        assert_eq!(parser.counter.missing_template.load(Ordering::Relaxed), 1);

        let template = parser
            .templates
            .get("127.0.0.1".parse().unwrap(), 0x0103)
            .unwrap();
        assert_eq!(template.fields.len(), 13);
        assert_eq!(template.fixed_len(), Some(77));
        assert_eq!(template.fields[0], FieldSpec::new(27, 16));
        assert_eq!(template.fields[12], FieldSpec::new(2, 8));
    }

    #[test]
    fn data_needs_template() {
        let parser = parser();
        let traces = parser
            .parse(&param("127.0.0.1"), &decode(DATA_PACKET))
            .unwrap();
        assert!(traces.is_empty());
    }

    #[test]
    fn data_after_template() {
        let parser = parser();
        parser
            .parse(&param("127.0.0.1"), &decode(TEMPLATE_PACKET))
            .unwrap();
        let traces = parser
            .parse(&param("127.0.0.1"), &decode(DATA_PACKET))
            .unwrap();
        assert_eq!(traces.len(), 3);

        let first = &traces[0];
        assert_eq!(first.flow_protocol, FlowProtocol::Netflow9);
        assert_eq!(first.src_addr, IpAddr::V4(Ipv4Addr::new(162, 159, 134, 234)));
        assert_eq!(first.dst_addr, IpAddr::V4(Ipv4Addr::new(192, 168, 0, 150)));
        assert_eq!(first.src_port, 443);
        assert_eq!(first.dst_port, 53826);
        assert_eq!(first.protocol, DataProtocol::Tcp);
        assert_eq!(first.byte_count, 1704);
        assert_eq!(first.packet_count, 3);

        assert_eq!(traces[1].src_addr, IpAddr::V4(Ipv4Addr::new(146, 66, 155, 54)));
        assert_eq!(traces[1].src_port, 27020);
        assert_eq!(traces[1].dst_port, 63448);
        assert_eq!(traces[1].byte_count, 294);
        assert_eq!(traces[1].packet_count, 1);

        assert_eq!(traces[2].src_addr, IpAddr::V4(Ipv4Addr::new(18, 66, 26, 123)));
        assert_eq!(traces[2].dst_port, 54880);
        assert_eq!(traces[2].byte_count, 140);
        assert_eq!(traces[2].packet_count, 2);
    }

    #[test]
    fn templates_are_per_exporter() {
        let parser = parser();
        parser
            .parse(&param("127.0.0.1"), &decode(TEMPLATE_PACKET))
            .unwrap();
        let traces = parser
            .parse(&param("127.0.0.2"), &decode(DATA_PACKET))
            .unwrap();
        assert!(traces.is_empty());
    }

    #[test]
    fn template_refresh_decodes_leading_data_set() {
        let parser = parser();
        parser
            .parse(&param("127.0.0.1"), &decode(TEMPLATE_PACKET))
            .unwrap();
        let traces = parser
            .parse(&param("127.0.0.1"), &decode(TEMPLATE_PACKET))
            .unwrap();
        assert_eq!(traces.len(), 1);
        assert_eq!(traces[0].src_addr, IpAddr::V4(Ipv4Addr::new(51, 11, 192, 49)));
    }

    #[test]
    fn truncated_set_ends_datagram() {
        let parser = parser();
        parser
            .parse(&param("127.0.0.1"), &decode(TEMPLATE_PACKET))
            .unwrap();
        let data = decode(DATA_PACKET);
        let traces = parser
            .parse(&param("127.0.0.1"), &data[..data.len() - 10])
            .unwrap();
        assert!(traces.is_empty());
    }

    #[test]
    fn short_header_is_error() {
        let parser = parser();
        let r = parser.parse(&param("127.0.0.1"), &[0, 9, 0, 1]);
        assert!(matches!(r, Err(ParseError::Truncated { .. })));
        let r = parser.parse(&param("127.0.0.1"), &[0, 5, 0, 1]);
        assert!(matches!(r, Err(ParseError::UnexpectedVersion(5))));
    }
}
