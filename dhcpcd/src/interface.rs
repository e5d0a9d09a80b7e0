//! Interfaces and their IPv4 addresses.

use crate::error::Error;
use nix::{
    ifaddrs::getifaddrs,
    net::if_::{if_nametoindex, InterfaceFlags},
};
use std::{
    collections::BTreeMap,
    fmt::Write,
    net::{Ipv4Addr, SocketAddrV4},
};

/// Hardware type of Ethernet interfaces.
pub const ARPHRD_ETHER: u16 = 1;

/// An IPv4 address assigned to an interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IfAddr {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
    pub flags: u32,
}

impl IfAddr {
    /// The address was just added and not yet announced.
    pub const NEW: u32 = 0x01;

    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            addr,
            prefix_len,
            flags: 0,
        }
    }

    pub fn is_new(&self) -> bool {
        self.flags & Self::NEW != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: u32,
    pub hwtype: u16,
    pub hwaddr: Vec<u8>,
    pub addrs: Vec<IfAddr>,
}

impl Interface {
    pub fn new(name: &str, index: u32, hwaddr: &[u8]) -> Self {
        Self {
            name: name.to_string(),
            index,
            hwtype: ARPHRD_ETHER,
            hwaddr: hwaddr.to_vec(),
            addrs: vec![],
        }
    }

    pub fn find_addr(&self, addr: Ipv4Addr) -> Option<&IfAddr> {
        self.addrs.iter().find(|ia| ia.addr == addr)
    }

    pub fn find_addr_mut(&mut self, addr: Ipv4Addr) -> Option<&mut IfAddr> {
        self.addrs.iter_mut().find(|ia| ia.addr == addr)
    }
}

/// Interface table keyed by index.
#[derive(Debug, Default)]
pub struct Interfaces(BTreeMap<u32, Interface>);

impl Interfaces {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the interfaces with a hardware address from the system.
    ///
    /// Only the named interfaces are returned unless `names` is empty.
    pub fn discover(names: &[String]) -> Result<Self, Error> {
        let mut interfaces = Self::new();
        let mut addrs = vec![];

        for ifa in getifaddrs()? {
            if ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
                || (!names.is_empty() && !names.contains(&ifa.interface_name))
            {
                continue;
            }
            let address = match ifa.address {
                Some(address) => address,
                None => continue,
            };

            if let Some(hwaddr) = address.as_link_addr().and_then(|link| link.addr()) {
                if hwaddr == [0u8; 6] {
                    continue;
                }
                let index = if_nametoindex(ifa.interface_name.as_str())?;
                interfaces.insert(Interface::new(&ifa.interface_name, index, &hwaddr));
            } else if let Some(sin) = address.as_sockaddr_in() {
                let prefix_len = ifa
                    .netmask
                    .as_ref()
                    .and_then(|mask| mask.as_sockaddr_in())
                    .map(|mask| u32::from(*SocketAddrV4::from(*mask).ip()).count_ones() as u8)
                    .unwrap_or(32);
                let addr = *SocketAddrV4::from(*sin).ip();
                addrs.push((ifa.interface_name.clone(), IfAddr::new(addr, prefix_len)));
            }
        }

        for (name, addr) in addrs {
            if let Some(iface) = interfaces.0.values_mut().find(|iface| iface.name == name) {
                iface.addrs.push(addr);
            }
        }

        Ok(interfaces)
    }

    pub fn insert(&mut self, iface: Interface) -> Option<Interface> {
        self.0.insert(iface.index, iface)
    }

    pub fn remove(&mut self, index: u32) -> Option<Interface> {
        self.0.remove(&index)
    }

    pub fn get(&self, index: u32) -> Option<&Interface> {
        self.0.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Interface> {
        self.0.get_mut(&index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Interface> {
        self.0.values().find(|iface| iface.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interface> {
        self.0.values()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if any interface owns the hardware address.
    pub fn is_local_hwaddr(&self, hwaddr: &[u8]) -> bool {
        self.0.values().any(|iface| iface.hwaddr == hwaddr)
    }

    /// Find the interface that has the address assigned.
    pub fn find_addr(&self, addr: Ipv4Addr) -> Option<&Interface> {
        self.0
            .values()
            .find(|iface| iface.find_addr(addr).is_some())
    }
}

/// Format a hardware address as colon separated hex bytes.
pub fn hwaddr_ntoa(hwaddr: &[u8]) -> String {
    let mut s = String::with_capacity(hwaddr.len() * 3);
    for (i, byte) in hwaddr.iter().enumerate() {
        if i > 0 {
            s.push(':');
        }
        let _ = write!(s, "{:02x}", byte);
    }
    s
}
