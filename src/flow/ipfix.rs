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

const HEADER_LEN: usize = 16;
const SET_HEADER_LEN: usize = 4;
const TEMPLATE_SET_ID: u16 = 2;
const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
const MIN_DATA_SET_ID: u16 = 256;
const ENTERPRISE_BIT: u16 = 0x8000;

/// IPFIX (RFC 7011) decoder.
#[derive(Clone)]
pub struct IpfixParser {
    templates: Arc<TemplateStore>,
    counter: Arc<FlowParserCounter>,
}

impl IpfixParser {
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
                // padding at the end of the set
                break;
            }
            if field_count == 0 {
                if self.templates.remove(exporter, id) {
                    debug!("ipfix template {} from {} withdrawn", id, exporter);
                }
                continue;
            }
            let mut fields = Vec::with_capacity(field_count as usize);
            for _ in 0..field_count {
                let element = reader.u16()?;
                let length = reader.u16()?;
                let enterprise = if element & ENTERPRISE_BIT != 0 {
                    Some(reader.u32()?)
                } else {
                    None
                };
                fields.push(FieldSpec {
                    id: element & !ENTERPRISE_BIT,
                    length,
                    enterprise,
                });
            }
            if self.templates.insert(exporter, Template::new(id, fields)) {
                debug!("ipfix template {} from {} refreshed", id, exporter);
            } else {
                debug!("ipfix template {} from {} added", id, exporter);
            }
            self.counter.templates.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl FlowParserInterface for IpfixParser {
    fn parse(&self, param: &ParseParam, payload: &[u8]) -> Result<Vec<TraceImportInfo>> {
        let mut reader = Reader::new(payload);
        let version = reader.u16()?;
        if version != FlowProtocol::IPFIX_VERSION {
            return Err(ParseError::UnexpectedVersion(version));
        }
        let length = reader.u16()? as usize;
        // export time, sequence, observation domain
        reader.skip(HEADER_LEN - 4)?;
        if length < HEADER_LEN {
            return Err(ParseError::malformed(
                format!("message length {}", length),
                &payload[..HEADER_LEN],
            ));
        }
        self.counter.datagrams.fetch_add(1, Ordering::Relaxed);

        // the message may be followed by padding or cut short by the network
        let message = &payload[..length.min(payload.len())];
        let mut reader = Reader::new(&message[HEADER_LEN..]);
        let mut traces = vec![];
        while reader.remaining() >= SET_HEADER_LEN {
            let set_id = reader.u16()?;
            let length = reader.u16()? as usize;
            if length < SET_HEADER_LEN {
                self.counter.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "ipfix message from {} stops at set {} with length {}",
                    param.exporter, set_id, length
                );
                break;
            }
            let Ok(body) = reader.take(length - SET_HEADER_LEN) else {
                debug!(
                    "ipfix message from {} ends inside set {}",
                    param.exporter, set_id
                );
                break;
            };
            match set_id {
                TEMPLATE_SET_ID => {
                    if let Err(e) = self.read_template_set(param.exporter, body) {
                        self.counter.malformed.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "ipfix template set from {} incomplete: {}, set bytes: {}",
                            param.exporter,
                            e,
                            hex::encode(body)
                        );
                    }
                }
                OPTIONS_TEMPLATE_SET_ID => {
                    debug!("ipfix options template from {} ignored", param.exporter)
                }
                id if id < MIN_DATA_SET_ID => {
                    debug!("ipfix reserved set {} from {} ignored", id, param.exporter)
                }
                id => match self.templates.get(param.exporter, id) {
                    Some(template) => read_data_set(
                        param,
                        FlowProtocol::Ipfix,
                        &template,
                        body,
                        &self.counter,
                        &mut traces,
                    ),
                    None => {
                        self.counter.missing_template.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            "ipfix data set skipped: {}",
                            ParseError::MissingTemplate {
                                exporter: param.exporter,
                                template_id: id,
                            }
                        );
                    }
                },
            }
        }
        Ok(traces)
    }

    fn protocol(&self) -> FlowProtocol {
        FlowProtocol::Ipfix
    }
}
