//! Connection-tracking access over a raw netfilter netlink socket.
//!
//! The expirer needs one full dump per cycle and the batcher deletes entries
//! for destinations it just rerouted; neither needs more of ctnetlink than a
//! dump request and a delete by original tuple, so the messages are packed
//! by hand against a `libc` socket instead of pulling in a whole netfilter
//! stack.
//!
//! Every worker owns its own [`NetfilterConntrack`]; the handle is not
//! shared.

use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

use super::Error;

/// One tracked flow, reduced to the original-direction tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flow {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub proto: u8,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Conntrack enumeration and deletion.
///
/// Synchronous: a dump is one socket round-trip and both callers run it
/// without holding async resources.
pub trait ConntrackOps: Send {
    fn dump_flows(&mut self) -> Result<Vec<Flow>, Error>;
    fn delete_flow(&mut self, flow: &Flow) -> Result<(), Error>;
}

// Netlink message framing
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;
const NLM_F_REQUEST: u16 = 0x1;
const NLM_F_ACK: u16 = 0x4;
const NLM_F_DUMP: u16 = 0x300;
const NLMSG_HDRLEN: usize = 16;
const NFGENMSG_LEN: usize = 4;

// ctnetlink subsystem
const NFNL_SUBSYS_CTNETLINK: u16 = 1;
const IPCTNL_MSG_CT_GET: u16 = 1;
const IPCTNL_MSG_CT_DELETE: u16 = 2;
const NFNETLINK_V0: u8 = 0;

// conntrack attributes (linux/netfilter/nfnetlink_conntrack.h)
const CTA_TUPLE_ORIG: u16 = 1;
const CTA_TUPLE_IP: u16 = 1;
const CTA_IP_V4_SRC: u16 = 1;
const CTA_IP_V4_DST: u16 = 2;
const CTA_TUPLE_PROTO: u16 = 2;
const CTA_PROTO_NUM: u16 = 1;
const CTA_PROTO_SRC_PORT: u16 = 2;
const CTA_PROTO_DST_PORT: u16 = 3;

const NLA_F_NESTED: u16 = 0x8000;
const NLA_TYPE_MASK: u16 = 0x3fff;

const RECV_BUF_LEN: usize = 64 * 1024;

/// Production [`ConntrackOps`] over `NETLINK_NETFILTER`.
pub struct NetfilterConntrack {
    fd: OwnedFd,
    seq: u32,
}

impl NetfilterConntrack {
    pub fn open() -> Result<Self, Error> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_NETFILTER,
            )
        };
        if fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(Self { fd, seq: 1 })
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&self, buf: &[u8]) -> Result<(), Error> {
        let rc = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let rc = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(rc as usize)
    }
}

impl ConntrackOps for NetfilterConntrack {
    fn dump_flows(&mut self) -> Result<Vec<Flow>, Error> {
        let seq = self.next_seq();
        let mut req = Vec::with_capacity(NLMSG_HDRLEN + NFGENMSG_LEN);
        begin_request(
            &mut req,
            (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET,
            NLM_F_REQUEST | NLM_F_DUMP,
            seq,
        );
        finish_request(&mut req);
        self.send(&req)?;

        let mut flows = Vec::new();
        let mut buf = vec![0u8; RECV_BUF_LEN];
        'dump: loop {
            let received = self.recv(&mut buf)?;
            let mut offset = 0;
            while offset + NLMSG_HDRLEN <= received {
                let msg_len =
                    u32::from_ne_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
                        as usize;
                if msg_len < NLMSG_HDRLEN || offset + msg_len > received {
                    break;
                }
                let msg_type = u16::from_ne_bytes([buf[offset + 4], buf[offset + 5]]);
                match msg_type {
                    NLMSG_DONE => break 'dump,
                    NLMSG_ERROR => {
                        let errno = i32::from_ne_bytes([
                            buf[offset + 16],
                            buf[offset + 17],
                            buf[offset + 18],
                            buf[offset + 19],
                        ]);
                        if errno != 0 {
                            return Err(Error::Conntrack(
                                std::io::Error::from_raw_os_error(-errno).to_string(),
                            ));
                        }
                        break 'dump;
                    }
                    _ => {
                        let attrs =
                            &buf[offset + NLMSG_HDRLEN + NFGENMSG_LEN..offset + msg_len];
                        if let Some(flow) = parse_flow(attrs) {
                            flows.push(flow);
                        }
                    }
                }
                offset += (msg_len + 3) & !3;
            }
        }
        Ok(flows)
    }

    fn delete_flow(&mut self, flow: &Flow) -> Result<(), Error> {
        let seq = self.next_seq();
        let mut req = Vec::with_capacity(96);
        begin_request(
            &mut req,
            (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_DELETE,
            NLM_F_REQUEST | NLM_F_ACK,
            seq,
        );
        put_orig_tuple(&mut req, flow);
        finish_request(&mut req);
        self.send(&req)?;

        let mut buf = vec![0u8; 4096];
        let received = self.recv(&mut buf)?;
        if received >= NLMSG_HDRLEN + 4 {
            let msg_type = u16::from_ne_bytes([buf[4], buf[5]]);
            if msg_type == NLMSG_ERROR {
                let errno = i32::from_ne_bytes([buf[16], buf[17], buf[18], buf[19]]);
                if errno != 0 && errno != -libc::ENOENT {
                    return Err(Error::Conntrack(
                        std::io::Error::from_raw_os_error(-errno).to_string(),
                    ));
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Message packing
// ============================================================================

/// Netlink header (length patched by [`finish_request`]) plus the nfgenmsg.
fn begin_request(buf: &mut Vec<u8>, msg_type: u16, flags: u16, seq: u32) {
    buf.extend_from_slice(&0u32.to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(&flags.to_ne_bytes());
    buf.extend_from_slice(&seq.to_ne_bytes());
    buf.extend_from_slice(&0u32.to_ne_bytes()); // port id, kernel fills it in
    buf.push(libc::AF_INET as u8);
    buf.push(NFNETLINK_V0);
    buf.extend_from_slice(&0u16.to_ne_bytes()); // res_id
}

fn finish_request(buf: &mut [u8]) {
    let len = buf.len() as u32;
    buf[0..4].copy_from_slice(&len.to_ne_bytes());
}

fn put_attr(buf: &mut Vec<u8>, kind: u16, payload: &[u8]) {
    let len = (4 + payload.len()) as u16;
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(&kind.to_ne_bytes());
    buf.extend_from_slice(payload);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn begin_nested(buf: &mut Vec<u8>, kind: u16) -> usize {
    let at = buf.len();
    buf.extend_from_slice(&0u16.to_ne_bytes());
    buf.extend_from_slice(&(kind | NLA_F_NESTED).to_ne_bytes());
    at
}

fn end_nested(buf: &mut [u8], at: usize) {
    let len = (buf.len() - at) as u16;
    buf[at..at + 2].copy_from_slice(&len.to_ne_bytes());
}

fn put_orig_tuple(buf: &mut Vec<u8>, flow: &Flow) {
    let tuple = begin_nested(buf, CTA_TUPLE_ORIG);
    let ip = begin_nested(buf, CTA_TUPLE_IP);
    put_attr(buf, CTA_IP_V4_SRC, &flow.src.octets());
    put_attr(buf, CTA_IP_V4_DST, &flow.dst.octets());
    end_nested(buf, ip);
    let proto = begin_nested(buf, CTA_TUPLE_PROTO);
    put_attr(buf, CTA_PROTO_NUM, &[flow.proto]);
    if flow.proto == libc::IPPROTO_TCP as u8 || flow.proto == libc::IPPROTO_UDP as u8 {
        put_attr(buf, CTA_PROTO_SRC_PORT, &flow.src_port.to_be_bytes());
        put_attr(buf, CTA_PROTO_DST_PORT, &flow.dst_port.to_be_bytes());
    }
    end_nested(buf, proto);
    end_nested(buf, tuple);
}

// ============================================================================
// Message parsing
// ============================================================================

struct AttrIter<'a> {
    data: &'a [u8],
}

impl<'a> AttrIter<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.len() < 4 {
            return None;
        }
        let len = u16::from_ne_bytes([self.data[0], self.data[1]]) as usize;
        let kind = u16::from_ne_bytes([self.data[2], self.data[3]]) & NLA_TYPE_MASK;
        if len < 4 || len > self.data.len() {
            return None;
        }
        let payload = &self.data[4..len];
        let advance = (len + 3) & !3;
        self.data = if advance >= self.data.len() {
            &[]
        } else {
            &self.data[advance..]
        };
        Some((kind, payload))
    }
}

fn parse_flow(attrs: &[u8]) -> Option<Flow> {
    let mut src = None;
    let mut dst = None;
    let mut proto = 0u8;
    let mut src_port = 0u16;
    let mut dst_port = 0u16;

    for (kind, tuple) in AttrIter::new(attrs) {
        if kind != CTA_TUPLE_ORIG {
            continue;
        }
        for (part, payload) in AttrIter::new(tuple) {
            match part {
                CTA_TUPLE_IP => {
                    for (ip_kind, ip) in AttrIter::new(payload) {
                        match ip_kind {
                            CTA_IP_V4_SRC if ip.len() == 4 => {
                                src = Some(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]));
                            }
                            CTA_IP_V4_DST if ip.len() == 4 => {
                                dst = Some(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]));
                            }
                            _ => {}
                        }
                    }
                }
                CTA_TUPLE_PROTO => {
                    for (proto_kind, value) in AttrIter::new(payload) {
                        match proto_kind {
                            CTA_PROTO_NUM if !value.is_empty() => proto = value[0],
                            CTA_PROTO_SRC_PORT if value.len() == 2 => {
                                src_port = u16::from_be_bytes([value[0], value[1]]);
                            }
                            CTA_PROTO_DST_PORT if value.len() == 2 => {
                                dst_port = u16::from_be_bytes([value[0], value[1]]);
                            }
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Some(Flow {
        src: src?,
        dst: dst?,
        proto,
        src_port,
        dst_port,
    })
}
