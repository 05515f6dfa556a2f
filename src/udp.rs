use std::{
    future::Future,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::Arc,
};

use anyhow::Context;
use socket2::{Domain, Protocol, Type};
use tokio::net::UdpSocket;

use crate::ssdp::SSDP_IP_ADDR;

/// Largest datagram accepted in one receive. SSDP frames are far smaller;
/// the cap only guards against hostile peers.
pub const MAX_DATAGRAM_LEN: usize = 8 * 1024;

/// Boundary to the UDP layer. Sends are async, receives are non-blocking so
/// the cooperative loop never stalls on an idle socket.
pub trait UdpTransport {
    fn send_to(
        &self,
        buf: &[u8],
        peer: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;
    /// One datagram, or `None` when nothing is pending.
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>>;
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl<T: UdpTransport> UdpTransport for &T {
    fn send_to(
        &self,
        buf: &[u8],
        peer: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send {
        (*self).send_to(buf, peer)
    }
    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        (*self).try_recv_from(buf)
    }
    fn local_addr(&self) -> io::Result<SocketAddr> {
        (*self).local_addr()
    }
}

impl UdpTransport for Arc<UdpSocket> {
    async fn send_to(&self, buf: &[u8], peer: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, peer).await
    }

    fn try_recv_from(&self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        match UdpSocket::try_recv_from(self, buf) {
            Ok((read, peer)) => Ok(Some((read, peer))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Bind the SSDP multicast socket on ANY:`port` (1900 by convention) with
/// address reuse and group membership. `interfaces` narrows the membership
/// to specific local addresses; joining keeps going when an individual
/// interface refuses.
pub fn bind_ssdp_socket(
    port: u16,
    ttl: u32,
    interfaces: &[Ipv4Addr],
) -> anyhow::Result<Arc<UdpSocket>> {
    let local_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    let socket = socket2::Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_multicast_ttl_v4(ttl)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_loop_v4(true)?;
    if interfaces.is_empty() {
        socket.join_multicast_v4(&SSDP_IP_ADDR, &Ipv4Addr::UNSPECIFIED)?;
    } else {
        let mut joined = 0;
        for interface in interfaces {
            match socket.join_multicast_v4(&SSDP_IP_ADDR, interface) {
                Ok(()) => joined += 1,
                Err(e) => {
                    tracing::warn!("Skipping multicast membership on {interface}: {e}");
                }
            }
        }
        anyhow::ensure!(joined > 0, "no interface accepted multicast membership");
    }
    socket.bind(&SocketAddr::V4(local_addr).into())?;
    let socket = UdpSocket::from_std(socket.into()).context("register ssdp socket")?;
    Ok(Arc::new(socket))
}

/// Pick the interface outgoing multicast leaves from. Optional; the OS
/// routing default applies otherwise.
pub fn set_multicast_interface(socket: &UdpSocket, interface: Ipv4Addr) -> io::Result<()> {
    socket2::SockRef::from(socket).set_multicast_if_v4(&interface)
}

/// Bind an ephemeral-port socket used by the control point to send searches
/// and collect unicast replies.
pub async fn bind_search_socket() -> anyhow::Result<Arc<UdpSocket>> {
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        .await
        .context("bind search socket")?;
    Ok(Arc::new(socket))
}

/// Figure out which local address outbound traffic leaves from. Used to
/// rewrite `localhost` base urls and to compose GENA callback urls.
pub async fn resolve_local_addr() -> anyhow::Result<IpAddr> {
    let socket =
        UdpSocket::bind(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))).await?;
    socket
        .connect(SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(8, 8, 8, 8),
            53,
        )))
        .await?;
    let addr = socket.local_addr().context("get local addr")?;
    Ok(addr.ip())
}
