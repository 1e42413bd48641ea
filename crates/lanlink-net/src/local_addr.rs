//! Local address selection for listeners bound without an explicit endpoint.

use std::net::{IpAddr, UdpSocket};

use crate::config::AddressFamily;

/// Chooses the local IP a server binds to when no endpoint is given.
#[cfg_attr(test, mockall::automock)]
pub trait LocalAddressResolver: Send + Sync {
    fn local_address(&self, family: AddressFamily) -> Option<IpAddr>;
}

/// Picks the address of the interface the OS would route external traffic
/// through.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel choose a
/// source address.  Loopback and unspecified results count as "not found".
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutedAddressResolver;

impl LocalAddressResolver for RoutedAddressResolver {
    fn local_address(&self, family: AddressFamily) -> Option<IpAddr> {
        let (bind, probe) = match family {
            AddressFamily::Ipv4 => ("0.0.0.0:0", "192.0.2.1:9"),
            AddressFamily::Ipv6 => ("[::]:0", "[2001:db8::1]:9"),
        };
        let socket = UdpSocket::bind(bind).ok()?;
        socket.connect(probe).ok()?;
        let ip = socket.local_addr().ok()?.ip();
        (!ip.is_loopback() && !ip.is_unspecified()).then_some(ip)
    }
}

/// Always answers with the same address; useful for tests and for hosts
/// where the routed address is the wrong choice.
#[derive(Debug, Clone, Copy)]
pub struct FixedAddressResolver(pub Option<IpAddr>);

impl LocalAddressResolver for FixedAddressResolver {
    fn local_address(&self, family: AddressFamily) -> Option<IpAddr> {
        self.0.filter(|ip| AddressFamily::of(ip) == family)
    }
}
