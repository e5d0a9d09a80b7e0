//! IPv4 Address Conflict Detection (RFC 5227).
//!
//! An [`Arp`] tracks one state per interface and address.  Probing
//! checks that an address is unused before it is assigned;
//! announcing claims an assigned address with gratuitous ARPs and
//! leaves the state resident to defend it against later conflicts.
//!
//! All timers live on the caller's [`Eloop`] in the [`ARP_QUEUE`]
//! queue, keyed by the state's [`ArpKey`].

mod link;
mod packet;

pub use link::{LinkFactory, LinkIo, PacketLink, PrivsepLink};
pub use packet::{ArpMsg, ARPOP_REPLY, ARPOP_REQUEST};

use crate::{
    eloop::{Eloop, Events, NSEC_PER_SEC},
    error::Error,
    interface::{hwaddr_ntoa, IfAddr, Interfaces},
};
use log::{debug, error, info, warn};
use rand::Rng;
use std::{
    cell::RefCell,
    collections::BTreeMap,
    fmt,
    net::Ipv4Addr,
    os::unix::io::RawFd,
    rc::Rc,
    time::{Duration, Instant},
};

pub const PROBE_NUM: u32 = 3;
pub const PROBE_MIN: u64 = 1;
pub const PROBE_MAX: u64 = 2;
pub const ANNOUNCE_WAIT: u64 = 2;
pub const ANNOUNCE_NUM: u32 = 2;
pub const DEFEND_INTERVAL: u64 = 10;

/// Timeout queue of the ARP timers.
pub const ARP_QUEUE: u32 = 4;

/// Largest frame read from a link.
const FRAME_LENGTH: usize = 1536;

/// Identity of an ARP state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ArpKey {
    pub ifindex: u32,
    pub addr: Ipv4Addr,
}

impl ArpKey {
    pub fn new(ifindex: u32, addr: Ipv4Addr) -> Self {
        Self { ifindex, addr }
    }

    /// Timeout argument.
    fn arg(&self) -> u64 {
        u64::from(self.ifindex) << 32 | u64::from(u32::from(self.addr))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Probing,
    ProbeDone,
    Announcing,
    Announced,
}

impl Default for Phase {
    fn default() -> Self {
        Self::Idle
    }
}

/// Invoked with the state's key and the conflicting message, if any.
pub type ArpCallback = Rc<dyn Fn(&mut Eloop, &Arp, ArpKey, Option<&ArpMsg>)>;

#[derive(Clone, Default)]
pub struct ArpCallbacks {
    /// Conflict with an address that is not assigned.
    pub found: Option<ArpCallback>,
    /// Probing completed without a conflict.
    pub not_found: Option<ArpCallback>,
    /// The address could not be defended.
    pub defend_failed: Option<ArpCallback>,
    /// Announcing completed or was cancelled.
    pub announced: Option<ArpCallback>,
}

impl fmt::Debug for ArpCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArpCallbacks")
            .field("found", &self.found.is_some())
            .field("not_found", &self.not_found.is_some())
            .field("defend_failed", &self.defend_failed.is_some())
            .field("announced", &self.announced.is_some())
            .finish()
    }
}

#[derive(Debug, Default)]
struct ArpState {
    phase: Phase,
    pcount: u32,
    claims: u32,
    defend: Option<Instant>,
    callbacks: ArpCallbacks,
}

/// Snapshot of a state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpStatus {
    pub phase: Phase,
    pub pcount: u32,
    pub claims: u32,
    pub defended: bool,
}

struct ArpIface {
    link: Box<dyn LinkIo>,
    fd: Option<RawFd>,
    states: BTreeMap<Ipv4Addr, ArpState>,
}

struct Inner {
    interfaces: Rc<RefCell<Interfaces>>,
    links: LinkFactory,
    ifaces: BTreeMap<u32, ArpIface>,
    kernel_announces: bool,
}

/// Shared handle to the ARP states of all interfaces.
#[derive(Clone)]
pub struct Arp(Rc<RefCell<Inner>>);

impl fmt::Debug for Arp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.keys()).finish()
    }
}

impl Arp {
    pub fn new(interfaces: Rc<RefCell<Interfaces>>, links: LinkFactory) -> Self {
        Self(Rc::new(RefCell::new(Inner {
            interfaces,
            links,
            ifaces: BTreeMap::new(),
            // Linux never announces new addresses by itself.
            kernel_announces: !cfg!(any(target_os = "linux", target_os = "android")),
        })))
    }

    pub fn interfaces(&self) -> Rc<RefCell<Interfaces>> {
        self.0.borrow().interfaces.clone()
    }

    /// Set if the kernel sends a gratuitous ARP for new addresses.
    pub fn set_kernel_announces(&self, enable: bool) {
        self.0.borrow_mut().kernel_announces = enable;
    }

    /// Returns the state of the address, creating it if needed.
    ///
    /// The interface's link is opened with its first state.
    pub fn new_state(&self, eloop: &mut Eloop, ifindex: u32, addr: Ipv4Addr) -> Result<ArpKey, Error> {
        let key = ArpKey::new(ifindex, addr);

        let fd = {
            let mut inner = self.0.borrow_mut();
            if let Some(arp_iface) = inner.ifaces.get_mut(&ifindex) {
                arp_iface.states.entry(addr).or_default();
                return Ok(key);
            }

            let iface = inner
                .interfaces
                .borrow()
                .get(ifindex)
                .cloned()
                .ok_or(Error::NotFound)?;
            let mut link = (inner.links)(&iface);
            let fd = link.open(&iface)?;
            debug!("{}: ARP link opened", iface.name);

            let mut states = BTreeMap::new();
            states.insert(addr, ArpState::default());
            inner.ifaces.insert(ifindex, ArpIface { link, fd, states });
            fd
        };

        if let Some(fd) = fd {
            let arp = self.clone();
            if let Err(err) = eloop.add_fd(fd, Events::READ, move |eloop, _| {
                arp.read_link(eloop, ifindex)
            }) {
                self.drop_interface(eloop, ifindex);
                return Err(err);
            }
        }

        Ok(key)
    }

    pub fn set_callbacks(&self, key: ArpKey, callbacks: ArpCallbacks) -> Result<(), Error> {
        self.with_state(key, |state| state.callbacks = callbacks)
    }

    pub fn status(&self, key: ArpKey) -> Option<ArpStatus> {
        self.with_state(key, |state| ArpStatus {
            phase: state.phase,
            pcount: state.pcount,
            claims: state.claims,
            defended: state.defend.is_some(),
        })
        .ok()
    }

    pub fn keys(&self) -> Vec<ArpKey> {
        self.0
            .borrow()
            .ifaces
            .iter()
            .flat_map(|(ifindex, arp_iface)| {
                arp_iface
                    .states
                    .keys()
                    .map(move |addr| ArpKey::new(*ifindex, *addr))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0
            .borrow()
            .ifaces
            .values()
            .map(|arp_iface| arp_iface.states.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().ifaces.is_empty()
    }

    /// Probe if the address is in use.
    pub fn probe(&self, eloop: &mut Eloop, key: ArpKey) -> Result<(), Error> {
        self.with_state(key, |state| {
            state.pcount = 0;
            state.phase = Phase::Probing;
        })?;
        self.probe1(eloop, key);
        Ok(())
    }

    fn probe1(&self, eloop: &mut Eloop, key: ArpKey) {
        let pcount = match self.with_state(key, |state| {
            state.pcount += 1;
            state.pcount
        }) {
            Ok(pcount) => pcount,
            Err(_) => return,
        };
        let ifname = self.ifname(key.ifindex);
        let arp = self.clone();

        let result = if pcount < PROBE_NUM {
            let nsecs = rand::thread_rng().gen_range(0..(PROBE_MAX - PROBE_MIN) as u32 * NSEC_PER_SEC);
            debug!(
                "{}: ARP probing {} ({} of {}), next in {:.1} seconds",
                ifname,
                key.addr,
                pcount,
                PROBE_NUM,
                PROBE_MIN as f64 + f64::from(nsecs) / f64::from(NSEC_PER_SEC)
            );
            eloop.add_timeout(ARP_QUEUE, PROBE_MIN, nsecs, "arp_probe1", key.arg(), move |eloop| {
                arp.probe1(eloop, key)
            })
        } else {
            debug!("{}: ARP probing {} ({} of {})", ifname, key.addr, pcount, PROBE_NUM);
            eloop.add_timeout(ARP_QUEUE, ANNOUNCE_WAIT, 0, "arp_probed", key.arg(), move |eloop| {
                arp.probed(eloop, key)
            })
        };
        if let Err(err) = result {
            error!("{}: ARP probe timeout: {}", ifname, err);
        }

        if let Err(err) = self.request(key, Ipv4Addr::UNSPECIFIED, key.addr) {
            error!("{}: ARP probe: {}", ifname, err);
            self.free(eloop, key);
        }
    }

    fn probed(&self, eloop: &mut Eloop, key: ArpKey) {
        let callback = match self.with_state(key, |state| {
            state.phase = Phase::ProbeDone;
            state.callbacks.not_found.clone()
        }) {
            Ok(callback) => callback,
            Err(_) => return,
        };
        debug!("{}: ARP probing {} complete", self.ifname(key.ifindex), key.addr);

        if let Some(callback) = callback {
            callback(eloop, self, key, None);
        }
    }

    /// Announce the address with gratuitous ARPs.
    ///
    /// Other announcements of the same address on any interface are
    /// cancelled first.
    pub fn announce(&self, eloop: &mut Eloop, key: ArpKey) -> Result<(), Error> {
        self.with_state(key, |_| ())?;

        let others = self
            .0
            .borrow()
            .ifaces
            .iter()
            .filter(|(ifindex, _)| **ifindex != key.ifindex)
            .filter_map(|(ifindex, arp_iface)| {
                arp_iface
                    .states
                    .get(&key.addr)
                    .map(|state| (ArpKey::new(*ifindex, key.addr), state.phase))
            })
            .collect::<Vec<_>>();

        for (other, phase) in others {
            let callback = if phase == Phase::Announcing {
                Some("arp_announce1")
            } else {
                None
            };
            if eloop.delete_timeout(ARP_QUEUE, callback, other.arg()) > 0 {
                debug!(
                    "{}: ARP announcement of {} cancelled",
                    self.ifname(other.ifindex),
                    other.addr
                );
                self.announced(eloop, other);
            }
        }

        self.with_state(key, |state| {
            state.claims = 0;
            state.phase = Phase::Announcing;
        })?;
        self.announce1(eloop, key);

        Ok(())
    }

    /// Announce an address on the interface that has it assigned.
    pub fn announce_addr(&self, eloop: &mut Eloop, addr: Ipv4Addr) -> Result<ArpKey, Error> {
        let ifindex = self
            .0
            .borrow()
            .interfaces
            .borrow()
            .find_addr(addr)
            .map(|iface| iface.index)
            .ok_or(Error::NotFound)?;
        let key = self.new_state(eloop, ifindex, addr)?;
        self.announce(eloop, key)?;
        Ok(key)
    }

    fn announce1(&self, eloop: &mut Eloop, key: ArpKey) {
        let claims = match self.with_state(key, |state| {
            state.claims += 1;
            state.claims
        }) {
            Ok(claims) => claims,
            Err(_) => return,
        };
        let ifname = self.ifname(key.ifindex);

        if claims < ANNOUNCE_NUM {
            debug!(
                "{}: ARP announcing {} ({} of {}), next in {}.0 seconds",
                ifname, key.addr, claims, ANNOUNCE_NUM, ANNOUNCE_WAIT
            );
        } else {
            debug!(
                "{}: ARP announcing {} ({} of {})",
                ifname, key.addr, claims, ANNOUNCE_NUM
            );
        }

        // The kernel already sent the first announcement of a new address.
        let skip = {
            let inner = self.0.borrow();
            let mut interfaces = inner.interfaces.borrow_mut();
            match interfaces
                .get_mut(key.ifindex)
                .and_then(|iface| iface.find_addr_mut(key.addr))
            {
                Some(ia) if claims == 1 && ia.is_new() => {
                    ia.flags &= !IfAddr::NEW;
                    inner.kernel_announces
                }
                _ => false,
            }
        };

        if !skip {
            if let Err(err) = self.request(key, key.addr, key.addr) {
                error!("{}: ARP announce: {}", ifname, err);
                self.free(eloop, key);
                return;
            }
        }

        if claims < ANNOUNCE_NUM {
            let arp = self.clone();
            if let Err(err) = eloop.add_timeout(
                ARP_QUEUE,
                ANNOUNCE_WAIT,
                0,
                "arp_announce1",
                key.arg(),
                move |eloop| arp.announce1(eloop, key),
            ) {
                error!("{}: ARP announce timeout: {}", ifname, err);
            }
        } else {
            self.announced(eloop, key);
        }
    }

    fn announced(&self, eloop: &mut Eloop, key: ArpKey) {
        let callback = match self.with_state(key, |state| {
            state.phase = Phase::Announced;
            state.callbacks.announced.clone()
        }) {
            Ok(callback) => callback,
            Err(_) => return,
        };

        // Without a callback the state stays to defend the address.
        if let Some(callback) = callback {
            callback(eloop, self, key, None);
        }
    }

    /// Process a received ARP frame.
    pub fn handle_packet(&self, eloop: &mut Eloop, ifindex: u32, frame: &[u8]) {
        let (msg, addrs) = {
            let inner = self.0.borrow();
            let interfaces = inner.interfaces.borrow();
            let iface = match interfaces.get(ifindex) {
                Some(iface) => iface,
                None => return,
            };
            let msg = match ArpMsg::from_frame(frame, iface.hwtype, iface.hwaddr.len()) {
                Ok(msg) => msg,
                Err(_) => return,
            };

            // Ignore messages from ourself.
            if interfaces.is_local_hwaddr(&msg.sha) {
                return;
            }

            // Unicast polls are ignored, RFC 1122.
            let addrs = match inner.ifaces.get(&ifindex) {
                Some(arp_iface) => arp_iface
                    .states
                    .keys()
                    .filter(|addr| {
                        msg.sip == **addr
                            || (msg.sip.is_unspecified() && msg.tip == **addr && msg.broadcast)
                    })
                    .copied()
                    .collect::<Vec<_>>(),
                None => return,
            };
            (msg, addrs)
        };

        for addr in addrs {
            self.found(eloop, ArpKey::new(ifindex, addr), &msg);
        }
    }

    fn found(&self, eloop: &mut Eloop, key: ArpKey, msg: &ArpMsg) {
        let assigned = {
            let inner = self.0.borrow();
            let interfaces = inner.interfaces.borrow();
            interfaces
                .get(key.ifindex)
                .and_then(|iface| iface.find_addr(key.addr))
                .is_some()
        };
        let callback = match self.with_state(key, |state| state.callbacks.found.clone()) {
            Ok(callback) => callback,
            Err(_) => return,
        };

        warn!(
            "{}: hardware address {} claims {}",
            self.ifname(key.ifindex),
            hwaddr_ntoa(&msg.sha),
            key.addr
        );

        if !assigned {
            if let Some(callback) = callback {
                callback(eloop, self, key, Some(msg));
            }
            return;
        }

        self.defend(eloop, key);
    }

    /// Defend an assigned address, at most once per `DEFEND_INTERVAL`.
    fn defend(&self, eloop: &mut Eloop, key: ArpKey) {
        let now = eloop.now();
        let (recent, callback) = match self.with_state(key, |state| {
            let recent = state.defend.map_or(false, |defend| {
                now.saturating_duration_since(defend) < Duration::from_secs(DEFEND_INTERVAL)
            });
            (recent, state.callbacks.defend_failed.clone())
        }) {
            Ok(result) => result,
            Err(_) => return,
        };
        let ifname = self.ifname(key.ifindex);

        if recent {
            warn!(
                "{}: {} second defence failed for {}",
                ifname, DEFEND_INTERVAL, key.addr
            );
        } else {
            match self.request(key, key.addr, key.addr) {
                Ok(()) => {
                    let _ = self.with_state(key, |state| state.defend = Some(now));
                    info!("{}: defended address {}", ifname, key.addr);
                    return;
                }
                Err(err) => error!("{}: ARP defend: {}", ifname, err),
            }
        }

        if let Some(callback) = callback {
            callback(eloop, self, key, None);
        }
    }

    /// Stop and remove a state; the link closes with the last one.
    pub fn free(&self, eloop: &mut Eloop, key: ArpKey) {
        eloop.delete_timeout(ARP_QUEUE, None, key.arg());

        let closed = {
            let mut inner = self.0.borrow_mut();
            match inner.ifaces.get_mut(&key.ifindex) {
                Some(arp_iface) => {
                    if arp_iface.states.remove(&key.addr).is_none() || !arp_iface.states.is_empty()
                    {
                        return;
                    }
                }
                None => return,
            }
            inner.ifaces.remove(&key.ifindex)
        };

        if let Some(arp_iface) = closed {
            self.close_link(eloop, key.ifindex, arp_iface);
        }
    }

    /// Remove all states of an interface.
    pub fn drop_interface(&self, eloop: &mut Eloop, ifindex: u32) {
        let arp_iface = self.0.borrow_mut().ifaces.remove(&ifindex);
        if let Some(arp_iface) = arp_iface {
            for addr in arp_iface.states.keys() {
                eloop.delete_timeout(ARP_QUEUE, None, ArpKey::new(ifindex, *addr).arg());
            }
            self.close_link(eloop, ifindex, arp_iface);
        }
    }

    fn close_link(&self, eloop: &mut Eloop, ifindex: u32, mut arp_iface: ArpIface) {
        if let Some(fd) = arp_iface.fd {
            let _ = eloop.delete_fd(fd);
        }
        arp_iface.link.close();
        debug!("{}: ARP link closed", self.ifname(ifindex));
    }

    fn read_link(&self, eloop: &mut Eloop, ifindex: u32) {
        let mut buf = [0u8; FRAME_LENGTH];
        loop {
            let result = match self.0.borrow_mut().ifaces.get_mut(&ifindex) {
                Some(arp_iface) => arp_iface.link.recv(&mut buf),
                None => return,
            };
            match result {
                Ok(Some(length)) => self.handle_packet(eloop, ifindex, &buf[..length]),
                Ok(None) => return,
                Err(err) => {
                    error!("{}: ARP read: {}", self.ifname(ifindex), err);
                    self.drop_interface(eloop, ifindex);
                    return;
                }
            }
        }
    }

    /// Broadcast a request on the state's interface.
    fn request(&self, key: ArpKey, sip: Ipv4Addr, tip: Ipv4Addr) -> Result<(), Error> {
        let mut inner = self.0.borrow_mut();
        let frame = {
            let interfaces = inner.interfaces.borrow();
            let iface = interfaces.get(key.ifindex).ok_or(Error::NotFound)?;
            ArpMsg::request(&iface.hwaddr, sip, tip).to_frame(iface.hwtype)?
        };
        inner
            .ifaces
            .get_mut(&key.ifindex)
            .ok_or(Error::NotFound)?
            .link
            .send(&frame)
    }

    fn with_state<T>(&self, key: ArpKey, f: impl FnOnce(&mut ArpState) -> T) -> Result<T, Error> {
        self.0
            .borrow_mut()
            .ifaces
            .get_mut(&key.ifindex)
            .and_then(|arp_iface| arp_iface.states.get_mut(&key.addr))
            .map(f)
            .ok_or(Error::NotFound)
    }

    fn ifname(&self, ifindex: u32) -> String {
        self.0
            .borrow()
            .interfaces
            .borrow()
            .get(ifindex)
            .map(|iface| iface.name.clone())
            .unwrap_or_else(|| ifindex.to_string())
    }
}
