//! Source address selection for multi-homed associations.

use crate::error::{SctpError, SctpResult};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::trace;

/// Reach of an address, narrowest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum AddressScope {
    Loopback,
    Private,
    Global,
}

pub fn scope_of(ip: &IpAddr) -> AddressScope {
    match ip {
        IpAddr::V4(v4) => {
            if v4.is_loopback() {
                AddressScope::Loopback
            } else if v4.is_private() || v4.is_link_local() {
                AddressScope::Private
            } else {
                AddressScope::Global
            }
        }
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            if v6.is_loopback() {
                AddressScope::Loopback
            } else if first & 0xfe00 == 0xfc00 || first & 0xffc0 == 0xfe80 {
                AddressScope::Private
            } else {
                AddressScope::Global
            }
        }
    }
}

/// Answers which interface the routing table would use for a destination.
pub trait RouteLookup: fmt::Debug + Send + Sync {
    fn outgoing_interface(&self, dest: IpAddr) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddress {
    pub ip: IpAddr,
    pub interface: String,
    /// Higher is preferred among addresses of equal standing.
    pub priority: i32,
}

impl LocalAddress {
    pub fn new(ip: IpAddr, interface: impl Into<String>) -> Self {
        Self {
            ip,
            interface: interface.into(),
            priority: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Binding {
    /// Bound to the wildcard: every interface address is a candidate.
    All(Vec<LocalAddress>),
    /// Bound to an explicit address list.
    Specific(Vec<IpAddr>),
}

#[derive(Debug, Clone)]
pub struct SourceSelector {
    binding: Binding,
    route: Option<Arc<dyn RouteLookup>>,
    nat_friendly: bool,
}

impl SourceSelector {
    pub fn new(binding: Binding, nat_friendly: bool) -> Self {
        Self {
            binding,
            route: None,
            nat_friendly,
        }
    }

    pub fn with_route(mut self, route: Arc<dyn RouteLookup>) -> Self {
        self.route = Some(route);
        self
    }

    fn candidates(&self, dest: &IpAddr) -> Vec<LocalAddress> {
        let mut list: Vec<LocalAddress> = match &self.binding {
            Binding::All(addrs) => addrs.clone(),
            Binding::Specific(ips) => ips.iter().map(|ip| LocalAddress::new(*ip, "")).collect(),
        };
        list.retain(|a| a.ip.is_ipv4() == dest.is_ipv4());
        list.sort_by(|a, b| b.priority.cmp(&a.priority));
        list
    }

    /// Local address to send to `dest` from. Never narrower in scope than the
    /// destination, except private sources behind NAT when allowed.
    pub fn choose_source(&self, dest: IpAddr) -> SctpResult<IpAddr> {
        let want = scope_of(&dest);
        let candidates = self.candidates(&dest);
        let same = |a: &LocalAddress| scope_of(&a.ip) == want;
        let broader = |a: &LocalAddress| scope_of(&a.ip) > want;
        let nat = |a: &LocalAddress| {
            self.nat_friendly
                && want == AddressScope::Global
                && scope_of(&a.ip) == AddressScope::Private
        };

        let routed = match (&self.binding, &self.route) {
            (Binding::All(_), Some(route)) => route.outgoing_interface(dest),
            _ => None,
        };
        if let Some(ifname) = routed {
            let on_route = || candidates.iter().filter(|a| a.interface == ifname);
            let pick = on_route()
                .find(|a| same(a))
                .or_else(|| on_route().find(|a| broader(a)))
                .or_else(|| on_route().find(|a| nat(a)));
            if let Some(a) = pick {
                trace!("source {} on routed interface {} for {}", a.ip, ifname, dest);
                return Ok(a.ip);
            }
        }

        let pick = candidates
            .iter()
            .find(|a| same(a))
            .or_else(|| candidates.iter().find(|a| broader(a)))
            .or_else(|| candidates.iter().find(|a| nat(a)));
        match pick {
            Some(a) => {
                trace!("source {} ({:?}) for {} ({:?})", a.ip, scope_of(&a.ip), dest, want);
                Ok(a.ip)
            }
            None => Err(SctpError::NoSourceAddress(dest)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedRoute(&'static str);

    impl RouteLookup for FixedRoute {
        fn outgoing_interface(&self, _dest: IpAddr) -> Option<String> {
            Some(self.0.to_string())
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn all() -> Vec<LocalAddress> {
        vec![
            LocalAddress::new(ip("127.0.0.1"), "lo"),
            LocalAddress::new(ip("192.168.1.10"), "eth0"),
            LocalAddress::new(ip("203.0.113.5"), "eth1"),
            LocalAddress::new(ip("10.8.0.2"), "utun0"),
        ]
    }

    #[test]
    fn test_scope_classification() {
        assert_eq!(scope_of(&ip("127.0.0.1")), AddressScope::Loopback);
        assert_eq!(scope_of(&ip("172.20.1.1")), AddressScope::Private);
        assert_eq!(scope_of(&ip("169.254.3.3")), AddressScope::Private);
        assert_eq!(scope_of(&ip("8.8.8.8")), AddressScope::Global);
        assert_eq!(scope_of(&ip("::1")), AddressScope::Loopback);
        assert_eq!(scope_of(&ip("fd00::1")), AddressScope::Private);
        assert_eq!(scope_of(&ip("2001:db8::1")), AddressScope::Global);
    }

    #[test]
    fn test_matching_scope_preferred() {
        let sel = SourceSelector::new(Binding::All(all()), true);
        assert_eq!(sel.choose_source(ip("8.8.8.8")).unwrap(), ip("203.0.113.5"));
        assert_eq!(sel.choose_source(ip("192.168.1.1")).unwrap(), ip("192.168.1.10"));
        assert_eq!(sel.choose_source(ip("127.0.0.1")).unwrap(), ip("127.0.0.1"));
    }

    #[test]
    fn test_routed_interface_wins() {
        let sel = SourceSelector::new(Binding::All(all()), true)
            .with_route(Arc::new(FixedRoute("utun0")));
        // private source on the routed interface, acceptable behind NAT
        assert_eq!(sel.choose_source(ip("8.8.8.8")).unwrap(), ip("10.8.0.2"));

        let eth = SourceSelector::new(Binding::All(all()), false)
            .with_route(Arc::new(FixedRoute("eth0")));
        assert_eq!(eth.choose_source(ip("192.168.1.1")).unwrap(), ip("192.168.1.10"));
    }

    #[test]
    fn test_unusable_routed_interface_falls_back() {
        // loopback on the routed interface is too narrow for a global peer
        let sel = SourceSelector::new(Binding::All(all()), false)
            .with_route(Arc::new(FixedRoute("lo")));
        assert_eq!(sel.choose_source(ip("8.8.8.8")).unwrap(), ip("203.0.113.5"));

        // routing is ignored for specific bindings
        let specific = SourceSelector::new(
            Binding::Specific(vec![ip("203.0.113.5"), ip("10.8.0.2")]),
            true,
        )
        .with_route(Arc::new(FixedRoute("utun0")));
        assert_eq!(specific.choose_source(ip("8.8.8.8")).unwrap(), ip("203.0.113.5"));
    }

    #[test]
    fn test_never_narrower_scope() {
        let sel = SourceSelector::new(Binding::Specific(vec![ip("127.0.0.1")]), true);
        assert_eq!(
            sel.choose_source(ip("8.8.8.8")),
            Err(SctpError::NoSourceAddress(ip("8.8.8.8")))
        );

        let strict = SourceSelector::new(Binding::Specific(vec![ip("192.168.1.10")]), false);
        assert!(strict.choose_source(ip("8.8.8.8")).is_err());
        let nat = SourceSelector::new(Binding::Specific(vec![ip("192.168.1.10")]), true);
        assert_eq!(nat.choose_source(ip("8.8.8.8")).unwrap(), ip("192.168.1.10"));
        // no IPv6 candidates at all
        assert!(nat.choose_source(ip("2001:db8::1")).is_err());
    }
}
