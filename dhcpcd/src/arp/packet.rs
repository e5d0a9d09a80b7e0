//! Ethernet ARP frames.

use crate::error::Error;
use std::net::Ipv4Addr;
use zerocopy::{
    byteorder::{NetworkEndian, U16},
    AsBytes, FromBytes, Unaligned,
};

pub const ETHERTYPE_IP: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ARPOP_REQUEST: u16 = 1;
pub const ARPOP_REPLY: u16 = 2;
pub const ETHER_ADDR_LEN: usize = 6;

const ETHER_BROADCAST: [u8; ETHER_ADDR_LEN] = [0xff; ETHER_ADDR_LEN];

#[derive(Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct EtherHeader {
    dst: [u8; ETHER_ADDR_LEN],
    src: [u8; ETHER_ADDR_LEN],
    ether_type: U16<NetworkEndian>,
}

#[derive(Debug, AsBytes, FromBytes, Unaligned)]
#[repr(C)]
struct ArpHeader {
    hrd: U16<NetworkEndian>,
    pro: U16<NetworkEndian>,
    hln: u8,
    pln: u8,
    op: U16<NetworkEndian>,
}

const ETHER_HDR_LEN: usize = std::mem::size_of::<EtherHeader>();
const ARP_HDR_LEN: usize = std::mem::size_of::<ArpHeader>();

/// Decoded ARP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpMsg {
    pub op: u16,
    pub sha: Vec<u8>,
    pub sip: Ipv4Addr,
    pub tha: Vec<u8>,
    pub tip: Ipv4Addr,
    /// Sent to the Ethernet broadcast address.
    pub broadcast: bool,
}

impl ArpMsg {
    /// Broadcast request; an unspecified `sip` makes it a probe.
    pub fn request(sha: &[u8], sip: Ipv4Addr, tip: Ipv4Addr) -> Self {
        Self {
            op: ARPOP_REQUEST,
            sha: sha.to_vec(),
            sip,
            tha: vec![0; sha.len()],
            tip,
            broadcast: true,
        }
    }

    /// Decode a frame and check it against the interface's hardware.
    pub fn from_frame(frame: &[u8], hwtype: u16, hwlen: usize) -> Result<Self, Error> {
        let ether = EtherHeader::read_from_prefix(frame).ok_or(Error::Protocol("short frame"))?;
        if ether.ether_type.get() != ETHERTYPE_ARP {
            return Err(Error::Protocol("not an ARP frame"));
        }
        let body = &frame[ETHER_HDR_LEN..];
        let arp = ArpHeader::read_from_prefix(body).ok_or(Error::Protocol("short ARP header"))?;

        if arp.hrd.get() != hwtype
            || arp.pro.get() != ETHERTYPE_IP
            || usize::from(arp.hln) != hwlen
            || arp.pln != 4
        {
            return Err(Error::Protocol("ARP address format"));
        }
        let op = arp.op.get();
        if op != ARPOP_REQUEST && op != ARPOP_REPLY {
            return Err(Error::Protocol("ARP opcode"));
        }

        let addrs = &body[ARP_HDR_LEN..];
        if addrs.len() < 2 * (hwlen + 4) {
            return Err(Error::Protocol("truncated ARP message"));
        }
        let ip = |offset: usize| {
            Ipv4Addr::new(
                addrs[offset],
                addrs[offset + 1],
                addrs[offset + 2],
                addrs[offset + 3],
            )
        };

        Ok(Self {
            op,
            sha: addrs[..hwlen].to_vec(),
            sip: ip(hwlen),
            tha: addrs[hwlen + 4..2 * hwlen + 4].to_vec(),
            tip: ip(2 * hwlen + 4),
            broadcast: ether.dst == ETHER_BROADCAST,
        })
    }

    /// Encode as an Ethernet frame.
    pub fn to_frame(&self, hwtype: u16) -> Result<Vec<u8>, Error> {
        if self.sha.len() != ETHER_ADDR_LEN || self.tha.len() != ETHER_ADDR_LEN {
            return Err(Error::InvalidArgument("hardware address length"));
        }
        let mut dst = ETHER_BROADCAST;
        if !self.broadcast {
            dst.copy_from_slice(&self.tha);
        }
        let mut src = [0u8; ETHER_ADDR_LEN];
        src.copy_from_slice(&self.sha);

        let ether = EtherHeader {
            dst,
            src,
            ether_type: U16::new(ETHERTYPE_ARP),
        };
        let arp = ArpHeader {
            hrd: U16::new(hwtype),
            pro: U16::new(ETHERTYPE_IP),
            hln: ETHER_ADDR_LEN as u8,
            pln: 4,
            op: U16::new(self.op),
        };

        let mut frame = Vec::with_capacity(ETHER_HDR_LEN + ARP_HDR_LEN + 2 * (ETHER_ADDR_LEN + 4));
        frame.extend_from_slice(ether.as_bytes());
        frame.extend_from_slice(arp.as_bytes());
        frame.extend_from_slice(&self.sha);
        frame.extend_from_slice(&self.sip.octets());
        frame.extend_from_slice(&self.tha);
        frame.extend_from_slice(&self.tip.octets());
        Ok(frame)
    }
}
