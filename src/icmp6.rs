//! Raw ICMPv6 transport for router discovery.
//!
//! One raw socket per Automatic service, kernel-filtered so that only Router
//! Advertisements are delivered, with the received hop limit reported as
//! ancillary data. Readable packets are pushed into the daemon's event loop;
//! Router Solicitations are written to the all-routers multicast address.

use std::io;
use std::net::{Ipv6Addr, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use nix::libc;
use nix::sys::socket::{MsgFlags, SockaddrIn6, sendto};
use tokio::io::unix::AsyncFd;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::daemon::{Event, EventSender};
use crate::interface::Interface;
use crate::service::ServiceKey;

/// All-routers link-scope multicast address (ff02::2).
pub const ALL_ROUTERS: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 2);

/// ICMPv6 Router Advertisement message type.
const ND_ROUTER_ADVERT: u32 = 134;

const ICMP6_FILTER: libc::c_int = 1;

/// One datagram received on a router-discovery socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvPacket {
    pub data: Vec<u8>,
    pub source: Ipv6Addr,
    pub hop_limit: u8,
    pub ifindex: u32,
}

struct OpenSocket {
    fd: Arc<AsyncFd<OwnedFd>>,
    ifindex: u32,
    reader: JoinHandle<()>,
}

impl Drop for OpenSocket {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Production router-discovery transport. Sockets deliver into the daemon's
/// event channel from reader tasks on the single-threaded runtime.
pub struct RaSocketSet {
    events: EventSender,
    sockets: std::collections::HashMap<ServiceKey, OpenSocket>,
}

impl RaSocketSet {
    pub fn new(events: EventSender) -> Self {
        RaSocketSet {
            events,
            sockets: std::collections::HashMap::new(),
        }
    }

    /// Open a raw ICMPv6 socket on `interface`, filtered to Router
    /// Advertisements, and start delivering inbound packets.
    pub fn open(&mut self, key: &ServiceKey, interface: &Interface) -> io::Result<()> {
        let fd = open_ra_socket(interface)?;
        let fd = Arc::new(AsyncFd::new(fd)?);

        let events = self.events.clone();
        let reader_fd = Arc::clone(&fd);
        let reader_key = key.clone();
        let ifindex = interface.index;
        let reader = tokio::task::spawn_local(async move {
            loop {
                let mut guard = match reader_fd.readable().await {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                loop {
                    match recv_packet(reader_fd.get_ref(), ifindex) {
                        Ok(Some(packet)) => {
                            if events
                                .send(Event::RaPacket {
                                    key: reader_key.clone(),
                                    packet,
                                })
                                .is_err()
                            {
                                return;
                            }
                        }
                        Ok(None) => {
                            guard.clear_ready();
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "router-discovery socket read failed");
                            guard.clear_ready();
                            break;
                        }
                    }
                }
            }
        });

        debug!(service = %key, interface = interface.name, "router-discovery socket opened");
        self.sockets.insert(
            key.clone(),
            OpenSocket {
                fd,
                ifindex,
                reader,
            },
        );
        Ok(())
    }

    /// Send a Router Solicitation message to ff02::2 on the service's
    /// interface.
    pub fn send_solicitation(&mut self, key: &ServiceKey, message: &[u8]) -> io::Result<()> {
        let sock = self.sockets.get(key).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotConnected, "no router-discovery socket")
        })?;
        let dest = SocketAddrV6::new(ALL_ROUTERS, 0, 0, sock.ifindex);
        sendto(
            sock.fd.get_ref().as_raw_fd(),
            message,
            &SockaddrIn6::from(dest),
            MsgFlags::empty(),
        )
        .map_err(io::Error::from)?;
        Ok(())
    }

    /// Release the service's socket and its read registration.
    pub fn close(&mut self, key: &ServiceKey) {
        if self.sockets.remove(key).is_some() {
            debug!(service = %key, "router-discovery socket closed");
        }
    }
}

fn open_ra_socket(interface: &Interface) -> io::Result<OwnedFd> {
    let raw = unsafe {
        libc::socket(
            libc::AF_INET6,
            libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_ICMPV6,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    // Accept only Router Advertisements: block everything, clear one bit.
    let mut filter = [0xffff_ffffu32; 8];
    filter[(ND_ROUTER_ADVERT >> 5) as usize] &= !(1 << (ND_ROUTER_ADVERT & 31));
    set_opt(
        &fd,
        libc::IPPROTO_ICMPV6,
        ICMP6_FILTER,
        &filter as *const _ as *const libc::c_void,
        std::mem::size_of_val(&filter) as libc::socklen_t,
    )?;

    let on: libc::c_int = 1;
    set_opt(
        &fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_RECVHOPLIMIT,
        &on as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    )?;

    let hops: libc::c_int = 255;
    set_opt(
        &fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_MULTICAST_HOPS,
        &hops as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    )?;

    let ifindex = interface.index as libc::c_int;
    set_opt(
        &fd,
        libc::IPPROTO_IPV6,
        libc::IPV6_MULTICAST_IF,
        &ifindex as *const _ as *const libc::c_void,
        std::mem::size_of::<libc::c_int>() as libc::socklen_t,
    )?;

    // Scope reception to the interface as well.
    set_opt(
        &fd,
        libc::SOL_SOCKET,
        libc::SO_BINDTODEVICE,
        interface.name.as_ptr() as *const libc::c_void,
        interface.name.len() as libc::socklen_t,
    )?;

    Ok(fd)
}

fn set_opt(
    fd: &OwnedFd,
    level: libc::c_int,
    name: libc::c_int,
    value: *const libc::c_void,
    len: libc::socklen_t,
) -> io::Result<()> {
    let rc = unsafe { libc::setsockopt(fd.as_raw_fd(), level, name, value, len) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recv_packet(fd: &OwnedFd, ifindex: u32) -> io::Result<Option<RecvPacket>> {
    let mut buf = [0u8; 1500];
    let mut cmsg_buf = [0u8; 64];
    let mut src: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };

    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_name = &mut src as *mut _ as *mut libc::c_void;
    msg.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len();

    let received = unsafe { libc::recvmsg(fd.as_raw_fd(), &mut msg, libc::MSG_DONTWAIT) };
    if received < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err);
    }

    // The received hop limit arrives as ancillary data (IPV6_RECVHOPLIMIT).
    let mut hop_limit = 0u8;
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
    while !cmsg.is_null() {
        let hdr = unsafe { &*cmsg };
        if hdr.cmsg_level == libc::IPPROTO_IPV6 && hdr.cmsg_type == libc::IPV6_HOPLIMIT {
            let mut value: libc::c_int = 0;
            unsafe {
                std::ptr::copy_nonoverlapping(
                    libc::CMSG_DATA(cmsg),
                    &mut value as *mut libc::c_int as *mut u8,
                    std::mem::size_of::<libc::c_int>(),
                );
            }
            hop_limit = value as u8;
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
    }

    Ok(Some(RecvPacket {
        data: buf[..received as usize].to_vec(),
        source: Ipv6Addr::from(src.sin6_addr.s6_addr),
        hop_limit,
        ifindex,
    }))
}
