//! Client identity resolution.
//!
//! The identity is a coarse network address used for rate limiting and the
//! same-user heuristic. Forwarding headers are consulted in the order given
//! by the caller; the first entry that parses as a public, non-reserved
//! address wins. When nothing qualifies the direct peer address is used as
//! is, and [`UNKNOWN_CLIENT`] when even that is absent.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Default header precedence, most specific first.
pub const DEFAULT_FORWARDED_HEADERS: [&str; 2] = ["client-ip", "x-forwarded-for"];

pub const UNKNOWN_CLIENT: &str = "0.0.0.0";

/// Resolves the client identity from header values and the peer address.
///
/// `header` looks a header up by lowercase name. Comma-separated header
/// values are scanned left to right.
pub fn resolve_client_identity<'a, S, F>(
    precedence: &[S],
    header: F,
    direct: Option<IpAddr>,
) -> String
where
    S: AsRef<str>,
    F: Fn(&str) -> Option<&'a str>,
{
    let forwarded = precedence
        .iter()
        .filter_map(|name| header(name.as_ref()))
        .flat_map(|value| value.split(','))
        .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
        .find(is_public_address);

    if let Some(address) = forwarded {
        return address.to_string();
    }

    direct.map_or_else(|| UNKNOWN_CLIENT.to_string(), |address| address.to_string())
}

/// True for routable addresses outside private and reserved ranges.
#[must_use]
pub fn is_public_address(address: &IpAddr) -> bool {
    match address {
        IpAddr::V4(v4) => is_public_v4(*v4),
        IpAddr::V6(v6) => v6
            .to_ipv4_mapped()
            .map_or_else(|| is_public_v6(v6), |_| false),
    }
}

fn is_public_v4(address: Ipv4Addr) -> bool {
    let [first, second, ..] = address.octets();
    !(address.is_private()
        || address.is_loopback()
        || address.is_link_local()
        || address.is_unspecified()
        || address.is_broadcast()
        || first == 0
        || first >= 240
        // shared address space 100.64.0.0/10
        || (first == 100 && (second & 0xc0) == 64))
}

fn is_public_v6(address: &Ipv6Addr) -> bool {
    let head = address.segments()[0];
    !(address.is_loopback()
        || address.is_unspecified()
        || (head & 0xfe00) == 0xfc00
        || (head & 0xffc0) == 0xfe80)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HashMap<&'static str, &'static str> {
        pairs.iter().copied().collect()
    }

    fn addr(raw: &str) -> IpAddr {
        match raw.parse() {
            Ok(value) => value,
            Err(err) => panic!("invalid fixture address {raw}: {err}"),
        }
    }

    fn peer(raw: &str) -> Option<IpAddr> {
        Some(addr(raw))
    }

    #[test]
    fn forwarded_public_address_wins_over_peer() {
        let map = headers(&[("x-forwarded-for", "203.0.113.9, 10.0.0.1")]);
        let identity = resolve_client_identity(
            &DEFAULT_FORWARDED_HEADERS,
            |name| map.get(name).copied(),
            peer("198.51.100.20"),
        );
        assert_eq!(identity, "203.0.113.9");
    }

    #[test]
    fn precedence_order_is_respected() {
        let map = headers(&[
            ("client-ip", "198.51.100.7"),
            ("x-forwarded-for", "203.0.113.9"),
        ]);
        let identity = resolve_client_identity(
            &DEFAULT_FORWARDED_HEADERS,
            |name| map.get(name).copied(),
            None,
        );
        assert_eq!(identity, "198.51.100.7");

        let reversed = ["x-forwarded-for", "client-ip"];
        let identity = resolve_client_identity(&reversed, |name| map.get(name).copied(), None);
        assert_eq!(identity, "203.0.113.9");
    }

    #[test]
    fn private_and_garbage_entries_are_skipped() {
        let map = headers(&[
            ("client-ip", "not-an-ip"),
            ("x-forwarded-for", "192.168.1.4, 127.0.0.1, fe80::1, 8.8.4.4"),
        ]);
        let identity = resolve_client_identity(
            &DEFAULT_FORWARDED_HEADERS,
            |name| map.get(name).copied(),
            peer("10.1.1.1"),
        );
        assert_eq!(identity, "8.8.4.4");
    }

    #[test]
    fn falls_back_to_peer_even_when_private() {
        let map = headers(&[("x-forwarded-for", "10.0.0.3")]);
        let identity = resolve_client_identity(
            &DEFAULT_FORWARDED_HEADERS,
            |name| map.get(name).copied(),
            peer("127.0.0.1"),
        );
        assert_eq!(identity, "127.0.0.1");
    }

    #[test]
    fn unknown_client_without_any_source() {
        let identity = resolve_client_identity(&DEFAULT_FORWARDED_HEADERS, |_| None, None);
        assert_eq!(identity, UNKNOWN_CLIENT);
    }

    #[test]
    fn public_address_classification() {
        for public in ["8.8.8.8", "203.0.113.9", "2606:4700::1111"] {
            assert!(is_public_address(&addr(public)), "{public}");
        }
        for reserved in [
            "10.0.0.1",
            "172.16.5.5",
            "192.168.0.1",
            "127.0.0.1",
            "169.254.1.1",
            "0.1.2.3",
            "240.0.0.1",
            "255.255.255.255",
            "100.64.0.1",
            "::1",
            "::",
            "fd00::1",
            "fe80::1",
            "::ffff:8.8.8.8",
        ] {
            assert!(!is_public_address(&addr(reserved)), "{reserved}");
        }
    }
}
