//! Kernel link, address and route operations.
//!
//! [`Netlink`] is the seam between the reconciler and the kernel. The
//! production implementation talks rtnetlink; tests use an in-memory kernel.

use crate::error::{AgentError, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use ipnetwork::{IpNetwork, Ipv4Network};
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{LinkAttribute, LinkFlag, LinkMessage};
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteScope,
};
use rtnetlink::{new_connection, Handle, IpVersion};
use std::net::IpAddr;
use tracing::{debug, info};

/// A live kernel link.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    /// Lowercase colon-separated MAC, empty if the link has none.
    pub hw_addr: String,
    pub mtu: u32,
    pub up: bool,
}

/// Parameters for a new virtual link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLink {
    pub name: String,
    pub mtu: u32,
    pub hw_addr: Vec<u8>,
}

/// A route in the kernel's main table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KernelRoute {
    /// `None` is the default route.
    pub destination: Option<IpNetwork>,
    pub gateway: Option<IpAddr>,
    pub source: Option<IpAddr>,
    pub scope: u8,
    pub link_index: u32,
}

impl KernelRoute {
    fn is_ipv6(&self) -> Result<bool> {
        let families = [
            self.destination.map(|d| d.is_ipv6()),
            self.gateway.map(|g| g.is_ipv6()),
            self.source.map(|s| s.is_ipv6()),
        ];
        let mut known = families.into_iter().flatten();
        let first = known.next().unwrap_or(false);
        if known.any(|v6| v6 != first) {
            return Err(AgentError::invalid(format!(
                "route mixes address families: {self:?}"
            )));
        }
        Ok(first)
    }
}

/// Kernel networking operations used by the reconciler.
#[async_trait]
pub trait Netlink: Send + Sync {
    async fn link_list(&self) -> Result<Vec<Link>>;
    async fn link_add(&self, link: &NewLink) -> Result<()>;
    async fn link_set_up(&self, index: u32) -> Result<()>;
    async fn link_set_down(&self, index: u32) -> Result<()>;
    async fn link_set_name(&self, index: u32, name: &str) -> Result<()>;
    async fn link_set_mtu(&self, index: u32, mtu: u32) -> Result<()>;
    async fn link_del(&self, index: u32) -> Result<()>;

    /// IPv4 addresses assigned to the link.
    async fn addr_list(&self, index: u32) -> Result<Vec<IpNetwork>>;
    async fn addr_add(&self, index: u32, addr: IpNetwork) -> Result<()>;
    async fn addr_del(&self, index: u32, addr: IpNetwork) -> Result<()>;

    /// Main-table routes of both families.
    async fn route_list(&self) -> Result<Vec<KernelRoute>>;
    async fn route_add(&self, route: &KernelRoute) -> Result<()>;
    async fn route_del(&self, route: &KernelRoute) -> Result<()>;

    async fn link_by_name(&self, name: &str) -> Result<Link> {
        self.link_list()
            .await?
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| AgentError::not_found(format!("link {name}")))
    }

    async fn link_by_index(&self, index: u32) -> Result<Link> {
        self.link_list()
            .await?
            .into_iter()
            .find(|l| l.index == index)
            .ok_or_else(|| AgentError::not_found(format!("link with index {index}")))
    }

    async fn link_by_hw_addr(&self, hw_addr: &str) -> Result<Link> {
        let wanted = hw_addr.to_ascii_lowercase();
        self.link_list()
            .await?
            .into_iter()
            .find(|l| l.hw_addr == wanted)
            .ok_or_else(|| {
                AgentError::not_found(format!(
                    "could not find the link corresponding to HwAddr {hw_addr:?}"
                ))
            })
    }
}

/// Parse a 6-octet MAC written with `:` or `-` separators.
pub fn parse_hw_addr(hw_addr: &str) -> Result<Vec<u8>> {
    let invalid = || AgentError::invalid(format!("invalid MAC address {hw_addr:?}"));
    let octets = hw_addr
        .split([':', '-'])
        .map(|part| {
            if part.len() != 2 {
                return Err(invalid());
            }
            u8::from_str_radix(part, 16).map_err(|_| invalid())
        })
        .collect::<Result<Vec<u8>>>()?;

    if octets.len() != 6 {
        return Err(invalid());
    }
    Ok(octets)
}

/// Lowercase colon-separated form of a MAC.
pub fn format_hw_addr(octets: &[u8]) -> String {
    octets
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn kernel_err(op: &str, e: rtnetlink::Error) -> AgentError {
    AgentError::internal(format!("{op}: {e}"))
}

/// rtnetlink-backed [`Netlink`].
pub struct RtNetlink {
    handle: Handle,
}

impl RtNetlink {
    /// Open a route netlink socket and spawn its connection task.
    ///
    /// Must run inside a tokio runtime.
    pub fn connect() -> Result<Self> {
        let (connection, handle, _) = new_connection()?;
        tokio::spawn(connection);
        info!("netlink connection established");
        Ok(Self { handle })
    }

    async fn addr_messages(&self, index: u32) -> Result<Vec<AddressMessage>> {
        self.handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute()
            .try_collect()
            .await
            .map_err(|e| kernel_err("list addresses", e))
    }

    async fn route_messages(&self) -> Result<Vec<RouteMessage>> {
        let mut messages = Vec::new();
        for version in [IpVersion::V4, IpVersion::V6] {
            let mut routes = self.handle.route().get(version).execute();
            while let Some(msg) = routes
                .try_next()
                .await
                .map_err(|e| kernel_err("list routes", e))?
            {
                if msg.header.table == RouteHeader::RT_TABLE_MAIN {
                    messages.push(msg);
                }
            }
        }
        Ok(messages)
    }
}

fn link_from_message(msg: &LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        up: msg.header.flags.contains(&LinkFlag::Up),
        ..Default::default()
    };
    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name.clone(),
            LinkAttribute::Mtu(mtu) => link.mtu = *mtu,
            LinkAttribute::Address(addr) => link.hw_addr = format_hw_addr(addr),
            _ => {}
        }
    }
    link
}

fn ipv4_of(msg: &AddressMessage) -> Option<IpNetwork> {
    msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(IpAddr::V4(ip)) => Ipv4Network::new(*ip, msg.header.prefix_len)
            .ok()
            .map(IpNetwork::V4),
        _ => None,
    })
}

fn route_ip(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(v4) => Some(IpAddr::V4(*v4)),
        RouteAddress::Inet6(v6) => Some(IpAddr::V6(*v6)),
        _ => None,
    }
}

fn route_from_message(msg: &RouteMessage) -> KernelRoute {
    let mut route = KernelRoute {
        scope: u8::from(msg.header.scope),
        ..Default::default()
    };
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) => {
                route.destination = route_ip(addr)
                    .and_then(|ip| IpNetwork::new(ip, msg.header.destination_prefix_length).ok());
            }
            RouteAttribute::Gateway(addr) => route.gateway = route_ip(addr),
            RouteAttribute::PrefSource(addr) => route.source = route_ip(addr),
            RouteAttribute::Oif(index) => route.link_index = *index,
            _ => {}
        }
    }
    route
}

#[async_trait]
impl Netlink for RtNetlink {
    async fn link_list(&self) -> Result<Vec<Link>> {
        let messages: Vec<LinkMessage> = self
            .handle
            .link()
            .get()
            .execute()
            .try_collect()
            .await
            .map_err(|e| kernel_err("list links", e))?;
        Ok(messages.iter().map(link_from_message).collect())
    }

    async fn link_add(&self, link: &NewLink) -> Result<()> {
        debug!(name = %link.name, mtu = link.mtu, "adding link");
        let mut request = self.handle.link().add().dummy(link.name.clone());
        let attributes = &mut request.message_mut().attributes;
        attributes.push(LinkAttribute::Mtu(link.mtu));
        if !link.hw_addr.is_empty() {
            attributes.push(LinkAttribute::Address(link.hw_addr.clone()));
        }
        request
            .execute()
            .await
            .map_err(|e| kernel_err("add link", e))
    }

    async fn link_set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| kernel_err("set link up", e))
    }

    async fn link_set_down(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(|e| kernel_err("set link down", e))
    }

    async fn link_set_name(&self, index: u32, name: &str) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .name(name.to_string())
            .execute()
            .await
            .map_err(|e| kernel_err("set link name", e))
    }

    async fn link_set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(|e| kernel_err("set link mtu", e))
    }

    async fn link_del(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| kernel_err("delete link", e))
    }

    async fn addr_list(&self, index: u32) -> Result<Vec<IpNetwork>> {
        Ok(self
            .addr_messages(index)
            .await?
            .iter()
            .filter_map(ipv4_of)
            .collect())
    }

    async fn addr_add(&self, index: u32, addr: IpNetwork) -> Result<()> {
        self.handle
            .address()
            .add(index, addr.ip(), addr.prefix())
            .execute()
            .await
            .map_err(|e| kernel_err("add address", e))
    }

    async fn addr_del(&self, index: u32, addr: IpNetwork) -> Result<()> {
        let msg = self
            .addr_messages(index)
            .await?
            .into_iter()
            .find(|m| ipv4_of(m) == Some(addr))
            .ok_or_else(|| AgentError::not_found(format!("address {addr} on link {index}")))?;
        self.handle
            .address()
            .del(msg)
            .execute()
            .await
            .map_err(|e| kernel_err("delete address", e))
    }

    async fn route_list(&self) -> Result<Vec<KernelRoute>> {
        Ok(self
            .route_messages()
            .await?
            .iter()
            .map(route_from_message)
            .collect())
    }

    async fn route_add(&self, route: &KernelRoute) -> Result<()> {
        let scope = RouteScope::from(route.scope);
        let request = self.handle.route().add();

        let result = if route.is_ipv6()? {
            let mut request = request
                .v6()
                .output_interface(route.link_index)
                .scope(scope);
            if let Some(IpNetwork::V6(dst)) = route.destination {
                request = request.destination_prefix(dst.ip(), dst.prefix());
            }
            if let Some(IpAddr::V6(gw)) = route.gateway {
                request = request.gateway(gw);
            }
            if let Some(IpAddr::V6(src)) = route.source {
                request = request.pref_source(src);
            }
            request.execute().await
        } else {
            let mut request = request
                .v4()
                .output_interface(route.link_index)
                .scope(scope);
            if let Some(IpNetwork::V4(dst)) = route.destination {
                request = request.destination_prefix(dst.ip(), dst.prefix());
            }
            if let Some(IpAddr::V4(gw)) = route.gateway {
                request = request.gateway(gw);
            }
            if let Some(IpAddr::V4(src)) = route.source {
                request = request.pref_source(src);
            }
            request.execute().await
        };

        result.map_err(|e| kernel_err("add route", e))
    }

    async fn route_del(&self, route: &KernelRoute) -> Result<()> {
        let msg = self
            .route_messages()
            .await?
            .into_iter()
            .find(|m| route_from_message(m) == *route)
            .ok_or_else(|| AgentError::not_found(format!("route {route:?}")))?;
        self.handle
            .route()
            .del(msg)
            .execute()
            .await
            .map_err(|e| kernel_err("delete route", e))
    }
}

/// In-memory kernel for reconciler tests.
#[cfg(any(test, feature = "fake-netlink"))]
pub mod fake {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        links: Vec<Link>,
        addrs: HashMap<u32, Vec<IpNetwork>>,
        routes: Vec<KernelRoute>,
        next_index: u32,
        calls: usize,
        failing: HashSet<&'static str>,
        failing_after: HashMap<&'static str, usize>,
    }

    /// Starts with `lo` (index 1, up) and its `127.0.0.0/8` route.
    pub struct FakeNetlink {
        state: Mutex<State>,
    }

    impl FakeNetlink {
        pub fn new() -> Self {
            let state = State {
                links: vec![Link {
                    index: 1,
                    name: "lo".into(),
                    hw_addr: String::new(),
                    mtu: 65536,
                    up: true,
                }],
                routes: vec![KernelRoute {
                    destination: Some("127.0.0.0/8".parse().unwrap()),
                    scope: 254,
                    link_index: 1,
                    ..Default::default()
                }],
                next_index: 2,
                ..Default::default()
            };
            Self {
                state: Mutex::new(state),
            }
        }

        /// Add a pre-existing link, as if hotplugged by the host.
        pub fn with_link(self, name: &str, hw_addr: &str, mtu: u32) -> Self {
            {
                let mut state = self.state.lock().unwrap();
                let index = state.next_index;
                state.next_index += 1;
                state.links.push(Link {
                    index,
                    name: name.into(),
                    hw_addr: hw_addr.into(),
                    mtu,
                    up: false,
                });
            }
            self
        }

        /// Make every later call of `op` fail.
        pub fn fail(&self, op: &'static str) {
            self.state.lock().unwrap().failing.insert(op);
        }

        /// Let `op` succeed `successes` more times, then fail.
        pub fn fail_after(&self, op: &'static str, successes: usize) {
            self.state
                .lock()
                .unwrap()
                .failing_after
                .insert(op, successes);
        }

        pub fn heal(&self, op: &'static str) {
            let mut state = self.state.lock().unwrap();
            state.failing.remove(op);
            state.failing_after.remove(op);
        }

        pub fn calls(&self) -> usize {
            self.state.lock().unwrap().calls
        }

        pub fn links(&self) -> Vec<Link> {
            self.state.lock().unwrap().links.clone()
        }

        pub fn routes(&self) -> Vec<KernelRoute> {
            self.state.lock().unwrap().routes.clone()
        }

        pub fn addrs(&self, index: u32) -> Vec<IpNetwork> {
            self.state
                .lock()
                .unwrap()
                .addrs
                .get(&index)
                .cloned()
                .unwrap_or_default()
        }

        pub fn insert_route(&self, route: KernelRoute) {
            self.state.lock().unwrap().routes.push(route);
        }

        fn enter(&self, op: &'static str) -> Result<std::sync::MutexGuard<'_, State>> {
            let mut state = self.state.lock().unwrap();
            state.calls += 1;
            if state.failing.contains(op) {
                return Err(AgentError::internal(format!("{op}: injected failure")));
            }
            if let Some(left) = state.failing_after.get_mut(op) {
                if *left == 0 {
                    return Err(AgentError::internal(format!("{op}: injected failure")));
                }
                *left -= 1;
            }
            Ok(state)
        }
    }

    impl State {
        fn link_mut(&mut self, index: u32) -> Result<&mut Link> {
            self.links
                .iter_mut()
                .find(|l| l.index == index)
                .ok_or_else(|| AgentError::internal(format!("no such device {index}")))
        }
    }

    #[async_trait]
    impl Netlink for FakeNetlink {
        async fn link_list(&self) -> Result<Vec<Link>> {
            Ok(self.enter("link_list")?.links.clone())
        }

        async fn link_add(&self, link: &NewLink) -> Result<()> {
            let mut state = self.enter("link_add")?;
            if state.links.iter().any(|l| l.name == link.name) {
                return Err(AgentError::internal("file exists"));
            }
            let index = state.next_index;
            state.next_index += 1;
            state.links.push(Link {
                index,
                name: link.name.clone(),
                hw_addr: format_hw_addr(&link.hw_addr),
                mtu: link.mtu,
                up: false,
            });
            Ok(())
        }

        async fn link_set_up(&self, index: u32) -> Result<()> {
            self.enter("link_set_up")?.link_mut(index)?.up = true;
            Ok(())
        }

        async fn link_set_down(&self, index: u32) -> Result<()> {
            self.enter("link_set_down")?.link_mut(index)?.up = false;
            Ok(())
        }

        async fn link_set_name(&self, index: u32, name: &str) -> Result<()> {
            let mut state = self.enter("link_set_name")?;
            let link = state.link_mut(index)?;
            if link.up {
                return Err(AgentError::internal("device or resource busy"));
            }
            link.name = name.to_string();
            Ok(())
        }

        async fn link_set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
            self.enter("link_set_mtu")?.link_mut(index)?.mtu = mtu;
            Ok(())
        }

        async fn link_del(&self, index: u32) -> Result<()> {
            let mut state = self.enter("link_del")?;
            state.link_mut(index)?;
            state.links.retain(|l| l.index != index);
            state.addrs.remove(&index);
            state.routes.retain(|r| r.link_index != index);
            Ok(())
        }

        async fn addr_list(&self, index: u32) -> Result<Vec<IpNetwork>> {
            let state = self.enter("addr_list")?;
            Ok(state.addrs.get(&index).cloned().unwrap_or_default())
        }

        async fn addr_add(&self, index: u32, addr: IpNetwork) -> Result<()> {
            let mut state = self.enter("addr_add")?;
            state.link_mut(index)?;
            state.addrs.entry(index).or_default().push(addr);
            Ok(())
        }

        async fn addr_del(&self, index: u32, addr: IpNetwork) -> Result<()> {
            let mut state = self.enter("addr_del")?;
            let addrs = state.addrs.entry(index).or_default();
            let before = addrs.len();
            addrs.retain(|a| *a != addr);
            if addrs.len() == before {
                return Err(AgentError::internal("cannot assign requested address"));
            }
            Ok(())
        }

        async fn route_list(&self) -> Result<Vec<KernelRoute>> {
            Ok(self.enter("route_list")?.routes.clone())
        }

        async fn route_add(&self, route: &KernelRoute) -> Result<()> {
            let mut state = self.enter("route_add")?;
            route.is_ipv6()?;
            state.link_mut(route.link_index)?;
            if let Some(gw) = route.gateway {
                let reachable = state.routes.iter().any(|r| {
                    r.link_index == route.link_index
                        && r.gateway.is_none()
                        && r.destination.is_some_and(|d| d.contains(gw))
                });
                if !reachable {
                    return Err(AgentError::internal("network is unreachable"));
                }
            }
            if state.routes.contains(route) {
                return Err(AgentError::internal("file exists"));
            }
            state.routes.push(route.clone());
            Ok(())
        }

        async fn route_del(&self, route: &KernelRoute) -> Result<()> {
            let mut state = self.enter("route_del")?;
            let position = state
                .routes
                .iter()
                .position(|r| r == route)
                .ok_or_else(|| AgentError::internal("no such process"))?;
            state.routes.remove(position);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeNetlink;
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_parse_hw_addr() {
        assert_eq!(
            parse_hw_addr("02:42:AC:11:00:02").unwrap(),
            vec![0x02, 0x42, 0xac, 0x11, 0x00, 0x02]
        );
        assert_eq!(parse_hw_addr("02-42-ac-11-00-02").unwrap().len(), 6);

        for bad in ["", "02:42:ac:11:00", "02:42:ac:11:00:02:03", "zz:42:ac:11:00:02", "2:42:ac:11:00:02"] {
            let err = parse_hw_addr(bad).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument, "{bad:?}");
        }
    }

    #[test]
    fn test_format_hw_addr() {
        assert_eq!(
            format_hw_addr(&[0x02, 0x42, 0xac, 0x11, 0x00, 0x02]),
            "02:42:ac:11:00:02"
        );
    }

    #[test]
    fn test_route_family_mismatch() {
        let route = KernelRoute {
            destination: Some("10.0.0.0/24".parse().unwrap()),
            gateway: Some("fe80::1".parse().unwrap()),
            ..Default::default()
        };
        assert!(route.is_ipv6().is_err());

        let route = KernelRoute {
            gateway: Some("fe80::1".parse().unwrap()),
            ..Default::default()
        };
        assert!(route.is_ipv6().unwrap());
        assert!(!KernelRoute::default().is_ipv6().unwrap());
    }

    #[tokio::test]
    async fn test_lookup_by_hw_addr_is_case_insensitive() {
        let netlink = FakeNetlink::new().with_link("eth0", "02:42:ac:11:00:02", 1500);
        let link = netlink.link_by_hw_addr("02:42:AC:11:00:02").await.unwrap();
        assert_eq!(link.name, "eth0");

        let err = netlink.link_by_hw_addr("02:00:00:00:00:01").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_fake_rejects_unreachable_gateway() {
        let netlink = FakeNetlink::new().with_link("eth0", "02:42:ac:11:00:02", 1500);
        let eth0 = netlink.link_by_name("eth0").await.unwrap();
        let via = KernelRoute {
            gateway: Some("10.0.0.1".parse().unwrap()),
            link_index: eth0.index,
            ..Default::default()
        };
        assert!(netlink.route_add(&via).await.is_err());

        netlink
            .route_add(&KernelRoute {
                destination: Some("10.0.0.0/24".parse().unwrap()),
                scope: 253,
                link_index: eth0.index,
                ..Default::default()
            })
            .await
            .unwrap();
        netlink.route_add(&via).await.unwrap();
        assert_eq!(netlink.routes().len(), 3);
    }

    #[tokio::test]
    #[ignore = "requires CAP_NET_ADMIN inside a guest kernel"]
    async fn test_rtnetlink_lists_loopback() {
        let netlink = RtNetlink::connect().unwrap();
        let lo = netlink.link_by_name("lo").await.unwrap();
        assert!(lo.index > 0);
        assert!(!netlink.route_list().await.unwrap().is_empty());
    }
}
