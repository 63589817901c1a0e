//! IP address classification.
//!
//! Classification uses fixed prefixes: `127.0.0.0/8` and `::1/128` are
//! loopback; `169.254.0.0/16` and `fe80::/10` are link-local; `10.0.0.0/8`,
//! `172.16.0.0/12`, `192.168.0.0/16`, and `fc00::/7` are private; everything
//! else (including carrier-grade NAT `100.64.0.0/10`) is public.

use std::net::IpAddr;

use ipnet::IpNet;

/// Where an address sits relative to the local network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressClass {
    Loopback,
    LinkLocal,
    Private,
    Public,
}

impl AddressClass {
    /// Private and loopback count as "internal" for outbound policy.
    pub fn is_internal(self) -> bool {
        matches!(self, Self::Private | Self::Loopback)
    }
}

/// Unwrap IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to their IPv4 form
/// so the IPv4 prefix tables apply.
fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Classify an address as loopback, link-local, private, or public.
pub fn classify(ip: IpAddr) -> AddressClass {
    match normalize(ip) {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                AddressClass::Loopback
            } else if v4.is_link_local() {
                AddressClass::LinkLocal
            } else if v4.is_private() {
                AddressClass::Private
            } else {
                AddressClass::Public
            }
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            if v6.is_loopback() {
                AddressClass::Loopback
            } else if segments[0] & 0xffc0 == 0xfe80 {
                // Link-local (fe80::/10)
                AddressClass::LinkLocal
            } else if segments[0] & 0xfe00 == 0xfc00 {
                // Unique local (fc00::/7)
                AddressClass::Private
            } else {
                AddressClass::Public
            }
        }
    }
}

/// Whether `ip` falls inside any network of `set`.
///
/// IPv4-mapped IPv6 addresses match IPv4 networks.
pub fn in_cidr_set(ip: IpAddr, set: &[IpNet]) -> bool {
    let ip = normalize(ip);
    set.iter().any(|net| net.contains(&ip))
}
