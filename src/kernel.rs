//! Kernel Address Manager seam.
//!
//! Everything the engine asks of the kernel goes through [`AddressManager`]:
//! address add/remove, IPv6 protocol attach/detach, link-local
//! auto-generation, acceptance of unsolicited router advertisements,
//! prefix/route flush, and link-media status. The production implementation
//! talks to Linux through `/proc/sys/net/ipv6` sysctls, `/proc/net/if_inet6`
//! and `in6_ifreq` ioctls; tests use a recording fake (see `test_util`).
//!
//! The prefix/route flush operations are process-global and affect all
//! interfaces; callers must treat them as cross-service side effects.

use std::fs;
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::libc;
use nix::net::if_::if_nametoindex;
use nix::sys::socket::{AddressFamily, SockFlag, SockType, socket};
use tracing::{debug, warn};

/// Per-address flag: derived by stateless autoconfiguration.
pub const ADDR_FLAG_AUTOCONF: u32 = 0x1;
/// Per-address flag: duplicate address detection still running.
pub const ADDR_FLAG_TENTATIVE: u32 = 0x2;
/// Per-address flag: duplicate address detection failed.
pub const ADDR_FLAG_DUPLICATED: u32 = 0x4;
/// Per-address flag: address is deprecated.
pub const ADDR_FLAG_DEPRECATED: u32 = 0x8;

/// One IPv6 address as reported by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelAddress {
    pub addr: Ipv6Addr,
    pub prefix_len: u8,
    pub flags: u32,
}

impl KernelAddress {
    pub fn is_autoconf(&self) -> bool {
        self.flags & ADDR_FLAG_AUTOCONF != 0
    }

    pub fn is_tentative(&self) -> bool {
        self.flags & ADDR_FLAG_TENTATIVE != 0
    }

    pub fn is_duplicated(&self) -> bool {
        self.flags & ADDR_FLAG_DUPLICATED != 0
    }

    pub fn is_link_local(&self) -> bool {
        self.addr.is_unicast_link_local()
    }
}

/// Cached link-media status of one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkStatus {
    /// Whether the kernel reported a status at all.
    pub valid: bool,
    /// Whether the link is up and carrying traffic.
    pub active: bool,
}

impl LinkStatus {
    pub fn unknown() -> Self {
        LinkStatus {
            valid: false,
            active: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.valid && self.active
    }

    pub fn is_inactive(&self) -> bool {
        self.valid && !self.active
    }
}

/// Operations the engine needs from the kernel.
pub trait AddressManager {
    /// Add `addr/prefix_len` to the interface.
    fn add_address(&mut self, ifname: &str, addr: Ipv6Addr, prefix_len: u8) -> io::Result<()>;

    /// Remove a specific address from the interface.
    fn remove_address(&mut self, ifname: &str, addr: Ipv6Addr) -> io::Result<()>;

    /// Current IPv6 address list of the interface, with per-address flags.
    fn interface_addresses(&mut self, ifname: &str) -> io::Result<Vec<KernelAddress>>;

    /// Attach the IPv6 protocol to the interface.
    fn attach_protocol(&mut self, ifname: &str) -> io::Result<()>;

    /// Detach the IPv6 protocol from the interface.
    fn detach_protocol(&mut self, ifname: &str) -> io::Result<()>;

    /// Start kernel link-local address auto-generation.
    fn start_link_local(&mut self, ifname: &str) -> io::Result<()>;

    /// Stop kernel link-local address auto-generation.
    fn stop_link_local(&mut self, ifname: &str) -> io::Result<()>;

    /// Whether the interface's link-local address exists and has passed
    /// duplicate address detection.
    fn link_local_ready(&mut self, ifname: &str) -> io::Result<bool>;

    /// Toggle acceptance of unsolicited router advertisements.
    fn set_accept_router_advertisements(&mut self, ifname: &str, accept: bool) -> io::Result<()>;

    /// Whether the host forwards IPv6 packets (router mode).
    fn forwarding_enabled(&mut self) -> io::Result<bool>;

    /// Flush discovered on-link prefixes. Global effect: all interfaces.
    fn flush_prefixes(&mut self) -> io::Result<()>;

    /// Flush discovered routes. Global effect: all interfaces.
    fn flush_routes(&mut self) -> io::Result<()>;

    /// Flush neighbor-discovery-derived routes for one interface.
    fn flush_interface_routes(&mut self, ifname: &str) -> io::Result<()>;

    /// Link-media validity/activity for the interface.
    fn link_status(&mut self, ifname: &str) -> io::Result<LinkStatus>;
}

// Linux IFA_F_* bits as reported in /proc/net/if_inet6.
const IFA_F_DADFAILED: u32 = 0x08;
const IFA_F_DEPRECATED: u32 = 0x20;
const IFA_F_TENTATIVE: u32 = 0x40;
const IFA_F_PERMANENT: u32 = 0x80;

// IPv6 address ioctls, taken on an AF_INET6 datagram socket.
const SIOCSIFADDR: libc::c_ulong = 0x8916;
const SIOCDIFADDR: libc::c_ulong = 0x8936;

#[repr(C)]
struct In6Ifreq {
    ifr6_addr: libc::in6_addr,
    ifr6_prefixlen: u32,
    ifr6_ifindex: libc::c_int,
}

/// Production [`AddressManager`] backed by procfs, sysctls and ioctls.
pub struct SysAddressManager {
    ctl: OwnedFd,
}

impl SysAddressManager {
    pub fn new() -> io::Result<Self> {
        let ctl = socket(
            AddressFamily::Inet6,
            SockType::Datagram,
            SockFlag::empty(),
            None,
        )
        .map_err(io::Error::from)?;
        Ok(SysAddressManager { ctl })
    }

    fn write_conf(&self, ifname: &str, key: &str, value: &str) -> io::Result<()> {
        let path = format!("/proc/sys/net/ipv6/conf/{ifname}/{key}");
        fs::write(&path, value)?;
        debug!(path, value, "sysctl written");
        Ok(())
    }

    fn read_conf(&self, ifname: &str, key: &str) -> io::Result<String> {
        let path = format!("/proc/sys/net/ipv6/conf/{ifname}/{key}");
        Ok(fs::read_to_string(path)?.trim().to_string())
    }

    fn addr_ioctl(&self, req: libc::c_ulong, ifname: &str, addr: Ipv6Addr, prefix_len: u8) -> io::Result<()> {
        let ifindex = if_nametoindex(ifname).map_err(io::Error::from)?;
        let ifreq = In6Ifreq {
            ifr6_addr: libc::in6_addr {
                s6_addr: addr.octets(),
            },
            ifr6_prefixlen: prefix_len as u32,
            ifr6_ifindex: ifindex as libc::c_int,
        };
        let rc = unsafe { libc::ioctl(self.ctl.as_raw_fd(), req, &ifreq) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn proc_addresses(&self, ifname: &str) -> io::Result<Vec<KernelAddress>> {
        let table = fs::read_to_string("/proc/net/if_inet6")?;
        let mut out = Vec::new();
        for line in table.lines() {
            // addr ifindex prefixlen scope flags name
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 || fields[5] != ifname {
                continue;
            }
            let Ok(raw) = u128::from_str_radix(fields[0], 16) else {
                continue;
            };
            let Ok(prefix_len) = u8::from_str_radix(fields[2], 16) else {
                continue;
            };
            let Ok(ifa_flags) = u32::from_str_radix(fields[4], 16) else {
                continue;
            };

            let mut flags = 0u32;
            if ifa_flags & IFA_F_PERMANENT == 0 {
                flags |= ADDR_FLAG_AUTOCONF;
            }
            if ifa_flags & IFA_F_TENTATIVE != 0 {
                flags |= ADDR_FLAG_TENTATIVE;
            }
            if ifa_flags & IFA_F_DADFAILED != 0 {
                flags |= ADDR_FLAG_DUPLICATED;
            }
            if ifa_flags & IFA_F_DEPRECATED != 0 {
                flags |= ADDR_FLAG_DEPRECATED;
            }

            out.push(KernelAddress {
                addr: Ipv6Addr::from(raw),
                prefix_len,
                flags,
            });
        }
        Ok(out)
    }
}

impl AddressManager for SysAddressManager {
    fn add_address(&mut self, ifname: &str, addr: Ipv6Addr, prefix_len: u8) -> io::Result<()> {
        debug!(interface = ifname, address = %addr, prefix_len, "adding address");
        self.addr_ioctl(SIOCSIFADDR, ifname, addr, prefix_len)
    }

    fn remove_address(&mut self, ifname: &str, addr: Ipv6Addr) -> io::Result<()> {
        // The delete ioctl matches on address and prefix length.
        let prefix_len = self
            .proc_addresses(ifname)?
            .iter()
            .find(|a| a.addr == addr)
            .map(|a| a.prefix_len)
            .unwrap_or(64);
        debug!(interface = ifname, address = %addr, "removing address");
        self.addr_ioctl(SIOCDIFADDR, ifname, addr, prefix_len)
    }

    fn interface_addresses(&mut self, ifname: &str) -> io::Result<Vec<KernelAddress>> {
        self.proc_addresses(ifname)
    }

    fn attach_protocol(&mut self, ifname: &str) -> io::Result<()> {
        self.write_conf(ifname, "disable_ipv6", "0")
    }

    fn detach_protocol(&mut self, ifname: &str) -> io::Result<()> {
        self.write_conf(ifname, "disable_ipv6", "1")
    }

    fn start_link_local(&mut self, ifname: &str) -> io::Result<()> {
        self.write_conf(ifname, "addr_gen_mode", "0")
    }

    fn stop_link_local(&mut self, ifname: &str) -> io::Result<()> {
        self.write_conf(ifname, "addr_gen_mode", "1")
    }

    fn link_local_ready(&mut self, ifname: &str) -> io::Result<bool> {
        let ready = self.proc_addresses(ifname)?.iter().any(|a| {
            a.is_link_local() && !a.is_tentative() && !a.is_duplicated()
        });
        Ok(ready)
    }

    fn set_accept_router_advertisements(&mut self, ifname: &str, accept: bool) -> io::Result<()> {
        self.write_conf(ifname, "accept_ra", if accept { "1" } else { "0" })
    }

    fn forwarding_enabled(&mut self) -> io::Result<bool> {
        Ok(self.read_conf("all", "forwarding")? != "0")
    }

    fn flush_prefixes(&mut self) -> io::Result<()> {
        // Linux has no per-prefix flush primitive; the route-cache flush is
        // the closest global equivalent. See DESIGN.md.
        warn!("flushing discovered prefixes (global)");
        fs::write("/proc/sys/net/ipv6/route/flush", "1")
    }

    fn flush_routes(&mut self) -> io::Result<()> {
        warn!("flushing discovered routes (global)");
        fs::write("/proc/sys/net/ipv6/route/flush", "1")
    }

    fn flush_interface_routes(&mut self, ifname: &str) -> io::Result<()> {
        // No interface-scoped flush primitive exists here; see DESIGN.md.
        debug!(interface = ifname, "interface route flush requested");
        Ok(())
    }

    fn link_status(&mut self, ifname: &str) -> io::Result<LinkStatus> {
        let mut req: libc::ifreq = unsafe { std::mem::zeroed() };
        let name = ifname.as_bytes();
        if name.len() >= req.ifr_name.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }
        for (dst, src) in req.ifr_name.iter_mut().zip(name) {
            *dst = *src as libc::c_char;
        }
        let rc = unsafe { libc::ioctl(self.ctl.as_raw_fd(), libc::SIOCGIFFLAGS, &mut req) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = unsafe { req.ifr_ifru.ifru_flags } as libc::c_int;
        Ok(LinkStatus {
            valid: flags & libc::IFF_UP != 0,
            active: flags & libc::IFF_RUNNING != 0,
        })
    }
}
