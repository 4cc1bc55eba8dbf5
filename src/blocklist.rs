//! Blocklists for hostnames and IP addresses.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::{Ipv4Net, Ipv6Net};

/// Hostnames that are always blocked (checked before DNS resolution).
const BLOCKED_HOSTNAMES: &[&str] = &[
    "localhost",
    "metadata.google.internal",
    "metadata.goog",
    "metadata.azure.internal",
    "instance-data", // AWS alternate (EC2-Classic)
];

/// IPv4 ranges refused under [`Policy::PublicOnly`](crate::Policy::PublicOnly).
const BLOCKED_V4: &[(Ipv4Addr, u8, &str)] = &[
    (Ipv4Addr::new(0, 0, 0, 0), 8, "unspecified address (0.0.0.0/8)"),
    (Ipv4Addr::new(127, 0, 0, 0), 8, "loopback address (127.0.0.0/8)"),
    (Ipv4Addr::new(169, 254, 0, 0), 16, "link-local address (169.254.0.0/16)"),
    (Ipv4Addr::new(10, 0, 0, 0), 8, "private address (10.0.0.0/8)"),
    (Ipv4Addr::new(172, 16, 0, 0), 12, "private address (172.16.0.0/12)"),
    (Ipv4Addr::new(192, 168, 0, 0), 16, "private address (192.168.0.0/16)"),
    (Ipv4Addr::new(100, 100, 100, 200), 32, "cloud metadata endpoint"),
];

/// IPv6 ranges refused under [`Policy::PublicOnly`](crate::Policy::PublicOnly).
const BLOCKED_V6: &[(Ipv6Addr, u8, &str)] = &[
    (Ipv6Addr::UNSPECIFIED, 128, "unspecified address (::)"),
    (Ipv6Addr::LOCALHOST, 128, "loopback address (::1)"),
    (Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 0), 10, "link-local address (fe80::/10)"),
    (Ipv6Addr::new(0xfd00, 0x0ec2, 0, 0, 0, 0, 0, 0x0254), 128, "cloud metadata endpoint"),
    (Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0), 7, "private address (fc00::/7)"),
];

/// Check if a hostname is blocked.
///
/// Matches the name itself and any subdomain of it, so `foo.localhost`
/// is refused as well.
pub fn is_hostname_blocked(host: &str) -> Option<&'static str> {
    let host_lower = host.trim_end_matches('.').to_ascii_lowercase();
    for &blocked in BLOCKED_HOSTNAMES {
        if host_lower == blocked || host_lower.ends_with(&format!(".{}", blocked)) {
            return Some(blocked);
        }
    }
    None
}

/// Check if an IP address is in a blocked range.
pub fn is_ip_blocked(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(ipv4) => is_ipv4_blocked(ipv4),
        IpAddr::V6(ipv6) => is_ipv6_blocked(ipv6),
    }
}

fn is_ipv4_blocked(ip: Ipv4Addr) -> Option<&'static str> {
    BLOCKED_V4.iter().find_map(|&(addr, prefix, reason)| {
        Ipv4Net::new(addr, prefix)
            .ok()
            .filter(|net| net.contains(&ip))
            .map(|_| reason)
    })
}

fn is_ipv6_blocked(ip: Ipv6Addr) -> Option<&'static str> {
    // Loopback FIRST (::1) before any IPv4 embedding checks
    if ip.is_loopback() {
        return Some("loopback address (::1)");
    }

    // IPv4-mapped IPv6 (::ffff:x.x.x.x)
    if let Some(ipv4) = ip.to_ipv4_mapped() {
        return is_ipv4_blocked(ipv4);
    }

    // IPv4-compatible IPv6 (::x.x.x.x), deprecated but still routable on some stacks
    let segments = ip.segments();
    if segments[0..6] == [0, 0, 0, 0, 0, 0] && (segments[6] != 0 || segments[7] > 1) {
        let ipv4 = Ipv4Addr::new(
            (segments[6] >> 8) as u8,
            segments[6] as u8,
            (segments[7] >> 8) as u8,
            segments[7] as u8,
        );
        return is_ipv4_blocked(ipv4);
    }

    BLOCKED_V6.iter().find_map(|&(addr, prefix, reason)| {
        Ipv6Net::new(addr, prefix)
            .ok()
            .filter(|net| net.contains(&ip))
            .map(|_| reason)
    })
}
