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

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::Ordering;

use log::warn;
use public::bytes::{read_u128_be, read_u32_be, read_uint_be};
use public::enums::DataProtocol;

use super::reader::Reader;
use super::{FieldSpec, FlowParserCounter, ParseError, ParseParam, Result, Template};
use crate::common::{FlowProtocol, TraceImportInfo};

// Information element ids shared by NetFlow v9 and IPFIX.
pub(crate) const IN_BYTES: u16 = 1;
pub(crate) const IN_PKTS: u16 = 2;
pub(crate) const PROTOCOL: u16 = 4;
pub(crate) const L4_SRC_PORT: u16 = 7;
pub(crate) const IPV4_SRC_ADDR: u16 = 8;
pub(crate) const L4_DST_PORT: u16 = 11;
pub(crate) const IPV4_DST_ADDR: u16 = 12;
pub(crate) const IPV6_SRC_ADDR: u16 = 27;
pub(crate) const IPV6_DST_ADDR: u16 = 28;

// Collects the fields a record carries; anything the template lacks keeps
// the default set by `TraceImportInfo::new`.
pub(crate) struct RecordBuilder {
    info: TraceImportInfo,
    src_v4: Option<Ipv4Addr>,
    dst_v4: Option<Ipv4Addr>,
    src_v6: Option<Ipv6Addr>,
    dst_v6: Option<Ipv6Addr>,
}

impl RecordBuilder {
    pub fn new(param: &ParseParam, protocol: FlowProtocol) -> Self {
        Self {
            info: TraceImportInfo::new(param.read_time, param.exporter, protocol),
            src_v4: None,
            dst_v4: None,
            src_v6: None,
            dst_v6: None,
        }
    }

    pub fn set(&mut self, field: &FieldSpec, value: &[u8]) -> Result<()> {
        if field.enterprise.is_some() {
            return Ok(());
        }
        match field.id {
            IN_BYTES => self.info.byte_count = counter(field, value)?,
            IN_PKTS => self.info.packet_count = counter(field, value)?,
            PROTOCOL => match value {
                [p] => self.info.protocol = DataProtocol::from(*p),
                _ => return Err(malformed_field(field, value)),
            },
            L4_SRC_PORT => self.info.src_port = port(field, value)?,
            L4_DST_PORT => self.info.dst_port = port(field, value)?,
            IPV4_SRC_ADDR => self.src_v4 = Some(ipv4(field, value)?),
            IPV4_DST_ADDR => self.dst_v4 = Some(ipv4(field, value)?),
            IPV6_SRC_ADDR => self.src_v6 = Some(ipv6(field, value)?),
            IPV6_DST_ADDR => self.dst_v6 = Some(ipv6(field, value)?),
            _ => (),
        }
        Ok(())
    }

    pub fn build(mut self) -> TraceImportInfo {
        if let Some(addr) = pick_address(self.src_v4, self.src_v6) {
            self.info.src_addr = addr;
        }
        if let Some(addr) = pick_address(self.dst_v4, self.dst_v6) {
            self.info.dst_addr = addr;
        }
        self.info
    }
}

// Templates covering both families send zeros for the unused one, IPv4 wins
// unless it is unspecified and IPv6 is not.
fn pick_address(v4: Option<Ipv4Addr>, v6: Option<Ipv6Addr>) -> Option<IpAddr> {
    match (v4, v6) {
        (Some(a), Some(b)) if a.is_unspecified() && !b.is_unspecified() => Some(IpAddr::V6(b)),
        (Some(a), _) => Some(IpAddr::V4(a)),
        (None, Some(b)) => Some(IpAddr::V6(b)),
        (None, None) => None,
    }
}

fn malformed_field(field: &FieldSpec, value: &[u8]) -> ParseError {
    ParseError::malformed(
        format!("field {} with length {}", field.id, value.len()),
        value,
    )
}

fn counter(field: &FieldSpec, value: &[u8]) -> Result<u64> {
    if value.is_empty() {
        return Err(malformed_field(field, value));
    }
    Ok(read_uint_be(value))
}

fn port(field: &FieldSpec, value: &[u8]) -> Result<u16> {
    match value.len() {
        1 | 2 => Ok(read_uint_be(value) as u16),
        _ => Err(malformed_field(field, value)),
    }
}

fn ipv4(field: &FieldSpec, value: &[u8]) -> Result<Ipv4Addr> {
    if value.len() != 4 {
        return Err(malformed_field(field, value));
    }
    Ok(Ipv4Addr::from(read_u32_be(value)))
}

fn ipv6(field: &FieldSpec, value: &[u8]) -> Result<Ipv6Addr> {
    if value.len() != 16 {
        return Err(malformed_field(field, value));
    }
    Ok(Ipv6Addr::from(read_u128_be(value)))
}

// Reads one record. All declared fields are consumed even if one of them is
// malformed so the next record starts at the right offset.
fn read_record(
    reader: &mut Reader,
    template: &Template,
    mut builder: RecordBuilder,
) -> Result<TraceImportInfo> {
    let mut first_error = None;
    for field in template.fields.iter() {
        let length = if field.is_variable() {
            match reader.u8()? {
                255 => reader.u16()? as usize,
                n => n as usize,
            }
        } else {
            field.length as usize
        };
        let value = reader.take(length)?;
        if let Err(e) = builder.set(field, value) {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(builder.build()),
    }
}

/// Decodes every record of a data set. Trailing bytes shorter than the
/// smallest record are set padding.
pub(crate) fn read_data_set(
    param: &ParseParam,
    protocol: FlowProtocol,
    template: &Template,
    body: &[u8],
    counter: &FlowParserCounter,
    traces: &mut Vec<TraceImportInfo>,
) {
    let min_len = template.min_len();
    if min_len == 0 {
        return;
    }
    let mut reader = Reader::new(body);
    while reader.remaining() >= min_len {
        let start = reader.offset();
        match read_record(&mut reader, template, RecordBuilder::new(param, protocol)) {
            Ok(info) => {
                counter.records.fetch_add(1, Ordering::Relaxed);
                traces.push(info);
            }
            Err(ParseError::Truncated { .. }) => break,
            Err(e) => {
                counter.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{} record of template {} from {} skipped: {}, record bytes: {}",
                    protocol,
                    template.id,
                    param.exporter,
                    e,
                    hex::encode(&body[start..reader.offset()])
                );
            }
        }
    }
}
