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
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use super::LayerError;

/// Bitwise AND of an address with a mask of the same family.
pub fn mask_address(addr: IpAddr, mask: IpAddr) -> Option<IpAddr> {
    match (addr, mask) {
        (IpAddr::V4(a), IpAddr::V4(m)) => Some(IpAddr::V4((u32::from(a) & u32::from(m)).into())),
        (IpAddr::V6(a), IpAddr::V6(m)) => Some(IpAddr::V6((u128::from(a) & u128::from(m)).into())),
        _ => None,
    }
}

/// Address plus mask. Addresses of the other family never match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subnet {
    pub address: IpAddr,
    pub mask: IpAddr,
}

impl Subnet {
    pub fn new(address: IpAddr, mask: IpAddr) -> Self {
        Self { address, mask }
    }

    pub fn masked_address(&self) -> Option<IpAddr> {
        mask_address(self.address, self.mask)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        match (mask_address(addr, self.mask), self.masked_address()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl std::str::FromStr for Subnet {
    type Err = LayerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let net: IpNet = s
            .parse()
            .map_err(|_| LayerError::InvalidSubnet(s.to_owned()))?;
        Ok(Self::new(net.network(), net.netmask()))
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.mask)
    }
}

/// Subnet membership test carrying the include decision of the layer
/// using it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddressMatcher {
    pub address: IpAddr,
    pub mask: IpAddr,
    #[serde(default)]
    pub include: bool,
}

impl IpAddressMatcher {
    pub fn new(address: IpAddr, mask: IpAddr, include: bool) -> Self {
        Self {
            address,
            mask,
            include,
        }
    }

    pub fn from_cidr(cidr: &str, include: bool) -> Result<Self, LayerError> {
        let subnet: Subnet = cidr.parse()?;
        Ok(Self::new(subnet.address, subnet.mask, include))
    }

    pub fn subnet(&self) -> Subnet {
        Subnet::new(self.address, self.mask)
    }

    pub fn masked_address(&self) -> Option<IpAddr> {
        self.subnet().masked_address()
    }

    pub fn matches(&self, addr: IpAddr) -> bool {
        self.subnet().contains(addr)
    }
}

/// First matcher containing `addr`, later matchers are never consulted.
pub fn first_match<'a, M, F>(matchers: &'a [M], addr: IpAddr, matcher: F) -> Option<&'a M>
where
    F: Fn(&M) -> &IpAddressMatcher,
{
    matchers.iter().find(|m| matcher(m).matches(addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn masks_by_family() {
        let m = IpAddressMatcher::from_cidr("10.1.0.0/16", true).unwrap();
        assert_eq!(m.mask, addr("255.255.0.0"));
        assert!(m.matches(addr("10.1.200.3")));
        assert!(!m.matches(addr("10.2.0.1")));
        assert!(!m.matches(addr("::ffff:10.1.0.1")));

        let v6 = IpAddressMatcher::from_cidr("2001:db8::/32", true).unwrap();
        assert!(v6.matches(addr("2001:db8:ffff::1")));
        assert!(!v6.matches(addr("2001:db9::1")));
        assert_eq!(v6.masked_address(), Some(addr("2001:db8::")));
    }

    #[test]
    fn first_match_wins() {
        let matchers = vec![
            IpAddressMatcher::from_cidr("1.1.1.0/24", true).unwrap(),
            IpAddressMatcher::from_cidr("1.1.0.0/16", false).unwrap(),
        ];
        let found = first_match(&matchers, addr("1.1.1.9"), |m| m).unwrap();
        assert_eq!(found.masked_address(), Some(addr("1.1.1.0")));
        let found = first_match(&matchers, addr("1.1.7.9"), |m| m).unwrap();
        assert!(!found.include);
        assert!(first_match(&matchers, addr("8.8.8.8"), |m| m).is_none());
    }

    #[test]
    fn bad_cidr() {
        assert!(matches!(
            IpAddressMatcher::from_cidr("10.0.0.0/33", true),
            Err(LayerError::InvalidSubnet(_))
        ));
    }
}
