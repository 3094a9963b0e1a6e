//! Address validation for connection info reported by transports.
//!
//! Accepts IPv4 dotted quads, IPv6 (with `::` compression, embedded IPv4 and
//! `%zone` suffixes) and DNS / mDNS host names such as `phone.local`.

use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    Ipv4,
    Ipv6,
    Hostname,
}

const MAX_HOSTNAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;

/// Classify an address string, `None` when it is not a usable host.
pub fn classify_address(input: &str) -> Option<AddressKind> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    // Bracketed form as found in URLs: [fe80::1]
    let unbracketed = input
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .unwrap_or(input);

    if unbracketed.contains(':') {
        let without_zone = match unbracketed.split_once('%') {
            Some((addr, zone)) if !zone.is_empty() => addr,
            Some(_) => return None,
            None => unbracketed,
        };
        return without_zone.parse::<Ipv6Addr>().ok().map(|_| AddressKind::Ipv6);
    }

    if looks_numeric(unbracketed) {
        return unbracketed.parse::<Ipv4Addr>().ok().map(|_| AddressKind::Ipv4);
    }

    is_valid_hostname(unbracketed).then_some(AddressKind::Hostname)
}

pub fn is_valid_address(input: &str) -> bool {
    classify_address(input).is_some()
}

pub fn is_valid_port(port: u32) -> bool {
    (1..=65_535).contains(&port)
}

/// A dotted string whose last label is all digits can only be meant as IPv4;
/// treating it as a host name would accept `256.1.1.1`.
fn looks_numeric(input: &str) -> bool {
    input
        .rsplit('.')
        .next()
        .map(|last| !last.is_empty() && last.bytes().all(|b| b.is_ascii_digit()))
        .unwrap_or(false)
}

fn is_valid_hostname(input: &str) -> bool {
    let name = input.strip_suffix('.').unwrap_or(input);
    if name.is_empty() || name.len() > MAX_HOSTNAME_LEN {
        return false;
    }
    name.split('.').all(is_valid_label)
}

fn is_valid_label(label: &str) -> bool {
    if label.is_empty() || label.len() > MAX_LABEL_LEN {
        return false;
    }
    let bytes = label.as_bytes();
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_accepts_common_forms() {
        assert_eq!(classify_address("192.168.49.1"), Some(AddressKind::Ipv4));
        assert_eq!(classify_address("fe80::1%wlan0"), Some(AddressKind::Ipv6));
        assert_eq!(classify_address("[::1]"), Some(AddressKind::Ipv6));
        assert_eq!(classify_address("::ffff:10.0.0.1"), Some(AddressKind::Ipv6));
        assert_eq!(classify_address("pixel-7.local"), Some(AddressKind::Hostname));
        assert_eq!(classify_address("localhost"), Some(AddressKind::Hostname));
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "256.1.1.1",
            "1.2.3",
            "1.2.3.4.5",
            "1..2.3",
            "fe80:::1",
            "1:2:3:4:5:6:7:8:9",
            "fe80::1%",
            "-phone.local",
            "phone-.local",
            "pho ne.local",
            "a..local",
        ] {
            assert!(!is_valid_address(bad), "accepted {:?}", bad);
        }
    }

    #[test]
    fn test_port_bounds() {
        assert!(!is_valid_port(0));
        assert!(is_valid_port(1));
        assert!(is_valid_port(65_535));
        assert!(!is_valid_port(65_536));
    }

    proptest! {
        #[test]
        fn prop_any_ipv4_accepted(a in 0u8..=255, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255) {
            let addr = format!("{}.{}.{}.{}", a, b, c, d);
            prop_assert_eq!(classify_address(&addr), Some(AddressKind::Ipv4));
        }

        #[test]
        fn prop_any_ipv6_accepted(segments in proptest::array::uniform8(any::<u16>())) {
            let addr = Ipv6Addr::new(
                segments[0], segments[1], segments[2], segments[3],
                segments[4], segments[5], segments[6], segments[7],
            );
            prop_assert_eq!(classify_address(&addr.to_string()), Some(AddressKind::Ipv6));
        }

        #[test]
        fn prop_mdns_hostnames_accepted(label in "[a-z][a-z0-9-]{0,20}[a-z0-9]") {
            let host = format!("{}.local", label);
            prop_assert_eq!(classify_address(&host), Some(AddressKind::Hostname));
        }

        #[test]
        fn prop_out_of_range_octet_rejected(bad in 256u32..10_000, b in 0u8..=255, c in 0u8..=255, d in 0u8..=255) {
            let addr = format!("{}.{}.{}.{}", bad, b, c, d);
            prop_assert!(!is_valid_address(&addr));
        }

        #[test]
        fn prop_wrong_segment_count_rejected(parts in proptest::collection::vec(0u8..=255, 1..8usize)) {
            prop_assume!(parts.len() != 4);
            let addr = parts.iter().map(|p| p.to_string()).collect::<Vec<_>>().join(".");
            prop_assert!(!is_valid_address(&addr));
        }
    }
}
