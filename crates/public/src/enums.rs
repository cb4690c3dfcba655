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

use std::fmt;

use serde::{Deserialize, Serialize};

/// EthernetType is the subset of ethernet type values seen inside sampled
/// frames.
#[derive(Serialize, Debug, PartialEq, Eq, Clone, Copy, PartialOrd, Ord)]
pub enum EthernetType {
    Ipv4,
    Ipv6,
    Dot1Q,
    QinQ,
    Unknown(u16),
}

impl EthernetType {
    const IPV4: u16 = 0x0800;
    const IPV6: u16 = 0x86DD;
    const DOT1Q: u16 = 0x8100;
    const QINQ: u16 = 0x88a8;
}

impl From<u16> for EthernetType {
    fn from(t: u16) -> Self {
        match t {
            EthernetType::IPV4 => Self::Ipv4,
            EthernetType::IPV6 => Self::Ipv6,
            EthernetType::DOT1Q => Self::Dot1Q,
            EthernetType::QINQ => Self::QinQ,
            _ => Self::Unknown(t),
        }
    }
}

impl From<EthernetType> for u16 {
    fn from(t: EthernetType) -> Self {
        match t {
            EthernetType::Ipv4 => EthernetType::IPV4,
            EthernetType::Ipv6 => EthernetType::IPV6,
            EthernetType::Dot1Q => EthernetType::DOT1Q,
            EthernetType::QinQ => EthernetType::QINQ,
            EthernetType::Unknown(t) => t,
        }
    }
}

impl fmt::Display for EthernetType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#06x}", u16::from(*self))
    }
}

/// Transport protocol of a flow record.
///
/// Protocol numbers outside ICMP, TCP and UDP collapse into `Unknown`, which
/// keeps the IANA experimental value 253 on the wire side.
#[derive(
    Serialize, Deserialize, Debug, Default, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum DataProtocol {
    Icmp,
    Tcp,
    Udp,
    #[default]
    Unknown,
}

impl DataProtocol {
    const ICMP: u8 = 1;
    const TCP: u8 = 6;
    const UDP: u8 = 17;
    const UNKNOWN: u8 = 253;
}

impl From<u8> for DataProtocol {
    fn from(t: u8) -> Self {
        match t {
            DataProtocol::ICMP => Self::Icmp,
            DataProtocol::TCP => Self::Tcp,
            DataProtocol::UDP => Self::Udp,
            _ => Self::Unknown,
        }
    }
}

impl From<DataProtocol> for u8 {
    fn from(t: DataProtocol) -> Self {
        match t {
            DataProtocol::Icmp => DataProtocol::ICMP,
            DataProtocol::Tcp => DataProtocol::TCP,
            DataProtocol::Udp => DataProtocol::UDP,
            DataProtocol::Unknown => DataProtocol::UNKNOWN,
        }
    }
}

impl fmt::Display for DataProtocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DataProtocol::Icmp => write!(f, "Icmp"),
            DataProtocol::Tcp => write!(f, "Tcp"),
            DataProtocol::Udp => write!(f, "Udp"),
            DataProtocol::Unknown => write!(f, "Unknown"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ethernet_type() {
        assert_eq!(EthernetType::from(0x0800), EthernetType::Ipv4);
        assert_eq!(EthernetType::from(0x8100), EthernetType::Dot1Q);
        assert_eq!(EthernetType::from(0x0806), EthernetType::Unknown(0x0806));
        assert_eq!(u16::from(EthernetType::Ipv6), 0x86DD);
    }

    #[test]
    fn data_protocol() {
        assert_eq!(DataProtocol::from(6), DataProtocol::Tcp);
        assert_eq!(DataProtocol::from(58), DataProtocol::Unknown);
        assert_eq!(u8::from(DataProtocol::Unknown), 253);
        assert_eq!(DataProtocol::Udp.to_string(), "Udp");
    }
}
