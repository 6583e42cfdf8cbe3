use std::{
    fmt::{self, Display},
    net::{IpAddr, Ipv4Addr, Ipv6Addr},
    str::FromStr,
};

/// A network in CIDR notation (`10.0.0.0/8`, `::1/128`), a bare address
/// matches only itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpMask {
    V4 { addr: Ipv4Addr, mask: u32 },
    V6 { addr: Ipv6Addr, mask: u128 },
}

impl IpMask {
    /// Returns whether `remote` belongs to the network, IPv4 clients seen
    /// through IPv4-mapped IPv6 addresses are matched against IPv4 networks.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use mailshield_utils::IpMask;
    ///
    /// let mask: IpMask = "192.168.0.0/16".parse().unwrap();
    /// assert!(mask.matches(&"192.168.10.1".parse().unwrap()));
    /// assert!(mask.matches(&"::ffff:192.168.10.1".parse().unwrap()));
    /// assert!(!mask.matches(&"10.0.0.1".parse().unwrap()));
    /// ```
    pub fn matches(&self, remote: &IpAddr) -> bool {
        match self {
            IpMask::V4 { addr, mask } => {
                let remote = match remote {
                    IpAddr::V4(remote) => *remote,
                    IpAddr::V6(remote) => match remote.to_ipv4_mapped() {
                        Some(remote) => remote,
                        None => return false,
                    },
                };
                u32::from(remote) & mask == u32::from(*addr) & mask
            }
            IpMask::V6 { addr, mask } => {
                let remote = match remote {
                    IpAddr::V6(remote) => *remote,
                    IpAddr::V4(remote) => remote.to_ipv6_mapped(),
                };
                u128::from(remote) & mask == u128::from(*addr) & mask
            }
        }
    }

    fn prefix_len(&self) -> u32 {
        match self {
            IpMask::V4 { mask, .. } => mask.count_ones(),
            IpMask::V6 { mask, .. } => mask.count_ones(),
        }
    }
}

impl FromStr for IpMask {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let invalid = || format!("invalid network {value:?}");
        let (addr, bits) = match value.trim().split_once('/') {
            Some((addr, bits)) => (addr, Some(bits.trim().parse::<u32>().map_err(|_| invalid())?)),
            None => (value.trim(), None),
        };
        match addr.trim().parse::<IpAddr>().map_err(|_| invalid())? {
            IpAddr::V4(addr) => {
                let bits = bits.unwrap_or(32);
                if bits > 32 {
                    return Err(invalid());
                }
                Ok(IpMask::V4 {
                    addr,
                    mask: u32::MAX.checked_shl(32 - bits).unwrap_or(0),
                })
            }
            IpAddr::V6(addr) => {
                let bits = bits.unwrap_or(128);
                if bits > 128 {
                    return Err(invalid());
                }
                Ok(IpMask::V6 {
                    addr,
                    mask: u128::MAX.checked_shl(128 - bits).unwrap_or(0),
                })
            }
        }
    }
}

impl Display for IpMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpMask::V4 { addr, .. } => write!(f, "{addr}/{}", self.prefix_len()),
            IpMask::V6 { addr, .. } => write!(f, "{addr}/{}", self.prefix_len()),
        }
    }
}

/// An empty list allows every client.
pub fn is_ip_allowed(nets: &[IpMask], remote: &IpAddr) -> bool {
    nets.is_empty() || nets.iter().any(|net| net.matches(remote))
}
