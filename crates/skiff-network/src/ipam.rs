//! IPv4 address management for the container bridge.

use std::collections::BTreeSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};
use thiserror::Error;

/// Why a subnet string failed to parse.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubnetParseError {
    /// Missing `/prefix`.
    #[error("missing prefix length in '{0}'")]
    MissingPrefix(String),
    /// Address part is not IPv4.
    #[error("invalid network address in '{0}'")]
    BadAddress(String),
    /// Prefix is not in 1..=30.
    #[error("prefix length must be between 1 and 30 in '{0}'")]
    BadPrefix(String),
}

/// An IPv4 subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Build a subnet; host bits of `addr` are masked off.
    ///
    /// # Errors
    ///
    /// Fails when `prefix` leaves no room for a gateway plus one host.
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Result<Self, SubnetParseError> {
        if !(1..=30).contains(&prefix) {
            return Err(SubnetParseError::BadPrefix(format!("{addr}/{prefix}")));
        }
        let mask = u32::MAX << (32 - prefix);
        Ok(Self {
            network: Ipv4Addr::from(u32::from(addr) & mask),
            prefix,
        })
    }

    /// Network address.
    #[must_use]
    pub const fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    #[must_use]
    pub const fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Gateway address, always the first host (`.1` for a /24).
    #[must_use]
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// Broadcast address.
    #[must_use]
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | (u32::MAX >> self.prefix))
    }

    /// Whether `addr` is an assignable host address (neither network nor broadcast).
    #[must_use]
    pub fn contains_host(&self, addr: Ipv4Addr) -> bool {
        let a = u32::from(addr);
        a > u32::from(self.network) && a < u32::from(self.broadcast())
    }

    /// `addr/prefix` string as used by `ip addr add`.
    #[must_use]
    pub fn cidr_for(&self, addr: Ipv4Addr) -> String {
        format!("{addr}/{}", self.prefix)
    }
}

impl fmt::Display for Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl FromStr for Subnet {
    type Err = SubnetParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| SubnetParseError::MissingPrefix(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| SubnetParseError::BadAddress(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| SubnetParseError::BadPrefix(s.to_string()))?;
        Self::new(addr, prefix)
    }
}

impl TryFrom<String> for Subnet {
    type Error = SubnetParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Subnet> for String {
    fn from(value: Subnet) -> Self {
        value.to_string()
    }
}

impl Default for Subnet {
    fn default() -> Self {
        Self {
            network: Ipv4Addr::new(10, 88, 0, 0),
            prefix: 24,
        }
    }
}

/// Process-wide table of container addresses in one subnet.
///
/// The gateway is never handed out. Every reservation and release goes
/// through a single lock.
#[derive(Debug)]
pub struct AddressPool {
    subnet: Subnet,
    in_use: Mutex<BTreeSet<Ipv4Addr>>,
}

impl AddressPool {
    /// Create an empty pool for `subnet`.
    #[must_use]
    pub fn new(subnet: Subnet) -> Self {
        Self {
            subnet,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// The managed subnet.
    #[must_use]
    pub const fn subnet(&self) -> Subnet {
        self.subnet
    }

    /// Reserve `requested`, or the lowest free host address when `None`.
    ///
    /// # Errors
    ///
    /// - [`SkiffError::AddressOutOfRange`] if `requested` is not a host address of the subnet
    /// - [`SkiffError::AddressInUse`] if `requested` is the gateway or already held
    /// - [`SkiffError::AddressExhausted`] if no address is free
    pub fn reserve(&self, requested: Option<Ipv4Addr>) -> SkiffResult<Ipv4Addr> {
        let mut in_use = self.in_use.lock();
        let gateway = self.subnet.gateway();

        let address = match requested {
            Some(address) => {
                if !self.subnet.contains_host(address) {
                    return Err(SkiffError::AddressOutOfRange {
                        address,
                        subnet: self.subnet.to_string(),
                    });
                }
                if address == gateway || in_use.contains(&address) {
                    return Err(SkiffError::AddressInUse { address });
                }
                address
            }
            None => (u32::from(gateway) + 1..u32::from(self.subnet.broadcast()))
                .map(Ipv4Addr::from)
                .find(|a| !in_use.contains(a))
                .ok_or_else(|| SkiffError::AddressExhausted {
                    subnet: self.subnet.to_string(),
                })?,
        };

        in_use.insert(address);
        tracing::debug!(%address, subnet = %self.subnet, "Address reserved");
        Ok(address)
    }

    /// Return `address` to the pool. Releasing a free address is a no-op.
    pub fn release(&self, address: Ipv4Addr) {
        if self.in_use.lock().remove(&address) {
            tracing::debug!(%address, "Address released");
        }
    }

    /// Number of addresses currently held.
    #[must_use]
    pub fn in_use(&self) -> usize {
        self.in_use.lock().len()
    }
}

impl Default for AddressPool {
    fn default() -> Self {
        Self::new(Subnet::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use skiff_common::ErrorKind;

    fn pool(cidr: &str) -> AddressPool {
        AddressPool::new(cidr.parse().unwrap())
    }

    #[test]
    fn subnet_parsing() {
        let s: Subnet = "10.88.0.0/24".parse().unwrap();
        assert_eq!(s.gateway(), Ipv4Addr::new(10, 88, 0, 1));
        assert_eq!(s.broadcast(), Ipv4Addr::new(10, 88, 0, 255));
        assert_eq!(s.cidr_for(Ipv4Addr::new(10, 88, 0, 2)), "10.88.0.2/24");

        let masked: Subnet = "192.168.5.77/16".parse().unwrap();
        assert_eq!(masked.to_string(), "192.168.0.0/16");

        assert!("10.88.0.0".parse::<Subnet>().is_err());
        assert!("10.88.0.0/31".parse::<Subnet>().is_err());
        assert!("nope/24".parse::<Subnet>().is_err());
    }

    #[test]
    fn auto_assigns_lowest_free() {
        let pool = pool("10.88.0.0/24");
        assert_eq!(pool.reserve(None).unwrap(), Ipv4Addr::new(10, 88, 0, 2));
        assert_eq!(pool.reserve(None).unwrap(), Ipv4Addr::new(10, 88, 0, 3));
        pool.release(Ipv4Addr::new(10, 88, 0, 2));
        assert_eq!(pool.reserve(None).unwrap(), Ipv4Addr::new(10, 88, 0, 2));
    }

    #[test]
    fn requested_address_rules() {
        let pool = pool("10.88.0.0/24");
        let addr = Ipv4Addr::new(10, 88, 0, 50);
        assert_eq!(pool.reserve(Some(addr)).unwrap(), addr);

        let again = pool.reserve(Some(addr)).unwrap_err();
        assert_eq!(again.kind(), ErrorKind::AddressInUse);

        let gw = pool.reserve(Some(Ipv4Addr::new(10, 88, 0, 1))).unwrap_err();
        assert_eq!(gw.kind(), ErrorKind::AddressInUse);

        let outside = pool.reserve(Some(Ipv4Addr::new(10, 89, 0, 5))).unwrap_err();
        assert_eq!(outside.kind(), ErrorKind::AddressOutOfRange);

        let bcast = pool.reserve(Some(Ipv4Addr::new(10, 88, 0, 255))).unwrap_err();
        assert_eq!(bcast.kind(), ErrorKind::AddressOutOfRange);
    }

    #[test]
    fn exhaustion() {
        // /30: network .0, gateway .1, one host .2, broadcast .3
        let pool = pool("10.0.0.0/30");
        assert_eq!(pool.reserve(None).unwrap(), Ipv4Addr::new(10, 0, 0, 2));
        let err = pool.reserve(None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddressExhausted);
        assert_eq!(pool.in_use(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_are_distinct() {
        let pool = std::sync::Arc::new(pool("10.88.0.0/24"));
        let tasks = (0..32).map(|_| {
            let pool = std::sync::Arc::clone(&pool);
            tokio::spawn(async move { pool.reserve(None) })
        });

        let addrs: BTreeSet<Ipv4Addr> = futures::future::join_all(tasks)
            .await
            .into_iter()
            .map(|r| r.unwrap().unwrap())
            .collect();
        assert_eq!(addrs.len(), 32);
        assert_eq!(pool.in_use(), 32);
    }

    proptest! {
        #[test]
        fn reservations_are_distinct_hosts(n in 1usize..200) {
            let pool = pool("10.88.0.0/24");
            let mut seen = BTreeSet::new();
            for _ in 0..n {
                let a = pool.reserve(None).unwrap();
                prop_assert!(pool.subnet().contains_host(a));
                prop_assert_ne!(a, pool.subnet().gateway());
                prop_assert!(seen.insert(a));
            }
            prop_assert_eq!(pool.in_use(), n);
        }
    }
}
