//! A reliable-datagram provider over UDP.
//!
//! Stands in for a native fabric when there is no RDMA hardware around, and keeps the property the
//! rendezvous has to cope with: nothing moves unless the application reads the CQ. Datagrams are
//! only picked up, acknowledged and matched inside [`Endpoint::cq_read`], and with
//! delivery-complete semantics a send completes only after the peer has read its own CQ and
//! acknowledged the data.

use super::{
    Completion, CompletionFlags, Endpoint, EndpointAddr, FabricAddr, FabricConfig, MemoryRegion,
    MrAccess,
};
use crate::error::{errno, FabricError};
use crate::progress::{Clock, MonotonicClock};
use slab::Slab;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;
use tracing::{debug, info, trace, warn};
use zerocopy::byteorder::{BigEndian, U16, U32};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const PROVIDER_NAME: &str = "udp";

/// Largest payload of a single send.
pub const MAX_MSG_SIZE: usize = 8192;

// Sequence numbers remembered per peer to drop retransmitted duplicates.
const DEDUP_WINDOW: usize = 256;

const KIND_DATA: u8 = 1;
const KIND_ACK: u8 = 2;

const FAMILY_V4: u8 = 4;
const FAMILY_V6: u8 = 6;

#[derive(FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct Header {
    kind: u8,
    _reserved: [u8; 3],
    seq: U32<BigEndian>,
}

const HEADER_LEN: usize = std::mem::size_of::<Header>();

impl Header {
    fn new(kind: u8, seq: u32) -> Header {
        Header {
            kind,
            _reserved: [0; 3],
            seq: U32::new(seq),
        }
    }
}

/// Endpoint name layout: family, big-endian port, then the raw IP octets.
fn encode_name(addr: SocketAddr, buf: &mut [u8]) -> Result<usize, FabricError> {
    let mut name = [0u8; 3 + 16];
    let len = match addr.ip() {
        IpAddr::V4(ip) => {
            name[0] = FAMILY_V4;
            name[3..7].copy_from_slice(&ip.octets());
            7
        }
        IpAddr::V6(ip) => {
            name[0] = FAMILY_V6;
            name[3..19].copy_from_slice(&ip.octets());
            19
        }
    };
    name[1..3].copy_from_slice(&U16::<BigEndian>::new(addr.port()).to_bytes());
    if buf.len() < len {
        return Err(FabricError::TooSmall { required: len });
    }
    buf[..len].copy_from_slice(&name[..len]);
    Ok(len)
}

fn decode_name(addr: &EndpointAddr) -> Result<SocketAddr, FabricError> {
    let b = addr.as_bytes();
    let port = U16::<BigEndian>::from_bytes([b[1], b[2]]).get();
    let (ip, len) = match b[0] {
        FAMILY_V4 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&b[3..7]);
            (IpAddr::V4(Ipv4Addr::from(octets)), 7)
        }
        FAMILY_V6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&b[3..19]);
            (IpAddr::V6(Ipv6Addr::from(octets)), 19)
        }
        _ => return Err(FabricError::InvalidAddress),
    };
    if port == 0 || ip.is_unspecified() || b[len..].iter().any(|&x| x != 0) {
        return Err(FabricError::InvalidAddress);
    }
    Ok(SocketAddr::new(ip, port))
}

struct Region {
    buf: Box<[u8]>,
    access: MrAccess,
    bound: bool,
    enabled: bool,
    busy: bool,
}

#[derive(Clone, Copy)]
enum CqEntry {
    Done(Completion),
    Failed { context: u64, errno: i32 },
}

struct PendingSend {
    seq: u32,
    dest: SocketAddr,
    context: u64,
    region: usize,
    len: usize,
    datagram: Vec<u8>,
    sent_at: Duration,
    retransmits: u32,
}

struct PostedRecv {
    region: usize,
    src: Option<SocketAddr>,
    context: u64,
}

struct Unexpected {
    src: SocketAddr,
    payload: Vec<u8>,
}

pub struct UdpEndpoint {
    socket: UdpSocket,
    config: FabricConfig,
    clock: MonotonicClock,
    enabled: bool,
    closed: bool,
    av: Slab<SocketAddr>,
    regions: Slab<Region>,
    sends: VecDeque<PendingSend>,
    recvs: VecDeque<PostedRecv>,
    unexpected: VecDeque<Unexpected>,
    cq: VecDeque<CqEntry>,
    seen: HashMap<SocketAddr, VecDeque<u32>>,
    next_seq: u32,
    scratch: Box<[u8]>,
}

impl UdpEndpoint {
    pub fn open(config: FabricConfig, local_ip: IpAddr) -> Result<UdpEndpoint, FabricError> {
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))?;
        socket.set_nonblocking(true)?;
        info!(addr = %socket.local_addr()?, "udp endpoint opened");
        Ok(UdpEndpoint {
            socket,
            clock: MonotonicClock::default(),
            enabled: false,
            closed: false,
            av: Slab::with_capacity(config.av_count),
            regions: Slab::new(),
            sends: VecDeque::with_capacity(config.tx_depth),
            recvs: VecDeque::with_capacity(config.rx_depth),
            unexpected: VecDeque::new(),
            cq: VecDeque::with_capacity(config.cq_size),
            seen: HashMap::new(),
            next_seq: 0,
            scratch: vec![0u8; HEADER_LEN + MAX_MSG_SIZE].into_boxed_slice(),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, FabricError> {
        Ok(self.socket.local_addr()?)
    }

    fn check_enabled(&self) -> Result<(), FabricError> {
        if self.enabled && !self.closed {
            Ok(())
        } else {
            Err(FabricError::NotEnabled)
        }
    }

    fn region(&self, mr: &MemoryRegion) -> Result<&Region, FabricError> {
        self.regions.get(mr.index()).ok_or(FabricError::BadHandle)
    }

    fn region_mut(&mut self, mr: &MemoryRegion) -> Result<&mut Region, FabricError> {
        self.regions.get_mut(mr.index()).ok_or(FabricError::BadHandle)
    }

    /// The region behind `mr`, if it may take a new operation needing `access`.
    fn usable_region(
        &mut self,
        mr: &MemoryRegion,
        access: MrAccess,
    ) -> Result<&mut Region, FabricError> {
        let region = self.region_mut(mr)?;
        if !region.enabled {
            return Err(FabricError::NotEnabled);
        }
        if !region.access.contains(access) {
            return Err(FabricError::PermissionDenied);
        }
        if region.busy {
            return Err(FabricError::Busy);
        }
        Ok(region)
    }

    fn lookup(&self, addr: FabricAddr) -> Result<SocketAddr, FabricError> {
        usize::try_from(addr.0)
            .ok()
            .and_then(|key| self.av.get(key))
            .copied()
            .ok_or(FabricError::BadHandle)
    }

    fn release(&mut self, region: usize) {
        if let Some(region) = self.regions.get_mut(region) {
            region.busy = false;
        }
    }

    fn progress(&mut self) -> Result<(), FabricError> {
        if !self.enabled {
            return Ok(());
        }
        self.drain_socket()?;
        self.retransmit();
        Ok(())
    }

    fn drain_socket(&mut self) -> Result<(), FabricError> {
        // A full CQ stops intake; unacknowledged data is resent by the peer later.
        while self.cq.len() < self.config.cq_size {
            let (n, src) = match self.socket.recv_from(&mut self.scratch) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                // ICMP port unreachable from an earlier send surfaces here on Linux.
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted
                            | io::ErrorKind::ConnectionRefused
                            | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(e.into()),
            };
            let (header, payload) = match Header::read_from_prefix(&self.scratch[..n]) {
                Ok((header, rest)) => (header, rest.to_vec()),
                Err(_) => {
                    warn!(%src, len = n, "dropping runt datagram");
                    continue;
                }
            };
            let seq = header.seq.get();
            match header.kind {
                KIND_DATA => self.on_data(src, seq, payload),
                KIND_ACK => self.on_ack(src, seq),
                kind => warn!(%src, kind, "dropping datagram of unknown kind"),
            }
        }
        Ok(())
    }

    fn on_data(&mut self, src: SocketAddr, seq: u32, payload: Vec<u8>) {
        let duplicate = self
            .seen
            .get(&src)
            .is_some_and(|window| window.contains(&seq));
        if duplicate {
            trace!(%src, seq, "duplicate datagram");
        } else {
            let posted = self
                .recvs
                .iter()
                .position(|r| r.src.map_or(true, |s| s == src))
                .and_then(|pos| self.recvs.remove(pos));
            if let Some(posted) = posted {
                self.complete_recv(posted, &payload);
            } else if self.unexpected.len() < self.config.rx_depth {
                trace!(%src, seq, len = payload.len(), "queued unexpected message");
                self.unexpected.push_back(Unexpected { src, payload });
            } else {
                debug!(%src, seq, "no receive buffer, dropping datagram");
                return;
            }
            let window = self.seen.entry(src).or_default();
            window.push_back(seq);
            if window.len() > DEDUP_WINDOW {
                window.pop_front();
            }
        }
        self.send_ack(src, seq);
    }

    fn complete_recv(&mut self, posted: PostedRecv, payload: &[u8]) {
        let Some(region) = self.regions.get_mut(posted.region) else {
            warn!(context = posted.context, "receive buffer vanished, dropping message");
            return;
        };
        let len = payload.len().min(region.buf.len());
        region.buf[..len].copy_from_slice(&payload[..len]);
        region.busy = false;
        if len < payload.len() {
            debug!(sent = payload.len(), kept = len, "message truncated");
        }
        self.cq.push_back(CqEntry::Done(Completion {
            context: posted.context,
            flags: CompletionFlags::RECV | CompletionFlags::MSG,
            len,
        }));
    }

    fn send_ack(&self, dest: SocketAddr, seq: u32) {
        let header = Header::new(KIND_ACK, seq);
        match self.socket.send_to(header.as_bytes(), dest) {
            Ok(_) => {}
            // The peer resends and we ack again.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => trace!(%dest, seq, "ack deferred"),
            Err(e) => warn!(%dest, seq, error = %e, "failed to send ack"),
        }
    }

    fn on_ack(&mut self, src: SocketAddr, seq: u32) {
        let acked = self
            .sends
            .iter()
            .position(|s| s.seq == seq && s.dest == src)
            .and_then(|pos| self.sends.remove(pos));
        let Some(send) = acked else {
            trace!(%src, seq, "stale ack");
            return;
        };
        self.release(send.region);
        self.cq.push_back(CqEntry::Done(Completion {
            context: send.context,
            flags: CompletionFlags::SEND | CompletionFlags::MSG,
            len: send.len,
        }));
    }

    fn retransmit(&mut self) {
        let now = self.clock.now();
        let mut i = 0;
        while i < self.sends.len() {
            let send = &mut self.sends[i];
            if now.saturating_sub(send.sent_at) < self.config.retransmit_after {
                i += 1;
                continue;
            }
            if send.retransmits >= self.config.max_retransmits {
                if let Some(send) = self.sends.remove(i) {
                    warn!(dest = %send.dest, seq = send.seq, "peer never acknowledged, giving up");
                    self.release(send.region);
                    self.cq.push_back(CqEntry::Failed {
                        context: send.context,
                        errno: errno::ETIMEDOUT,
                    });
                }
                continue;
            }
            send.retransmits += 1;
            send.sent_at = now;
            match self.socket.send_to(&send.datagram, send.dest) {
                Ok(_) => trace!(dest = %send.dest, seq = send.seq, "retransmitted"),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => warn!(dest = %send.dest, error = %e, "retransmit failed"),
            }
            i += 1;
        }
    }
}

impl Endpoint for UdpEndpoint {
    fn provider(&self) -> &str {
        PROVIDER_NAME
    }

    fn enable(&mut self) -> Result<(), FabricError> {
        if self.closed {
            return Err(FabricError::NotEnabled);
        }
        self.enabled = true;
        debug!("udp endpoint enabled");
        Ok(())
    }

    fn name(&self, buf: &mut [u8]) -> Result<usize, FabricError> {
        encode_name(self.socket.local_addr()?, buf)
    }

    fn av_insert(&mut self, addr: &EndpointAddr) -> Result<FabricAddr, FabricError> {
        let peer = decode_name(addr)?;
        if self.av.len() >= self.config.av_count {
            return Err(FabricError::NoSpace("address vector"));
        }
        let key = self.av.insert(peer);
        debug!(%peer, key, "address vector insert");
        Ok(FabricAddr(key as u64))
    }

    fn av_len(&self) -> usize {
        self.av.len()
    }

    fn mr_reg(
        &mut self,
        len: usize,
        access: MrAccess,
        key: u64,
    ) -> Result<MemoryRegion, FabricError> {
        let index = self.regions.insert(Region {
            buf: vec![0u8; len].into_boxed_slice(),
            access,
            bound: false,
            enabled: !self.config.mr_endpoint,
            busy: false,
        });
        debug!(index, len, key = format_args!("{key:#x}"), ?access, "memory registered");
        Ok(MemoryRegion::new(index, key, len))
    }

    fn mr_requires_bind(&self) -> bool {
        self.config.mr_endpoint
    }

    fn mr_bind(&mut self, mr: &MemoryRegion) -> Result<(), FabricError> {
        self.region_mut(mr)?.bound = true;
        Ok(())
    }

    fn mr_enable(&mut self, mr: &MemoryRegion) -> Result<(), FabricError> {
        let mr_endpoint = self.config.mr_endpoint;
        let region = self.region_mut(mr)?;
        if mr_endpoint && !region.bound {
            return Err(FabricError::NotEnabled);
        }
        region.enabled = true;
        Ok(())
    }

    fn mr_bytes(&self, mr: &MemoryRegion) -> Result<&[u8], FabricError> {
        let region = self.region(mr)?;
        if region.busy {
            return Err(FabricError::Busy);
        }
        Ok(&region.buf)
    }

    fn mr_bytes_mut(&mut self, mr: &MemoryRegion) -> Result<&mut [u8], FabricError> {
        let region = self.region_mut(mr)?;
        if region.busy {
            return Err(FabricError::Busy);
        }
        Ok(&mut region.buf)
    }

    fn mr_close(&mut self, mr: MemoryRegion) -> Result<(), FabricError> {
        if self.region(&mr)?.busy {
            return Err(FabricError::Busy);
        }
        self.regions.remove(mr.index());
        Ok(())
    }

    fn send(
        &mut self,
        mr: &MemoryRegion,
        len: usize,
        dest: FabricAddr,
        context: u64,
    ) -> Result<(), FabricError> {
        self.check_enabled()?;
        if len > MAX_MSG_SIZE {
            return Err(FabricError::MessageTooLong {
                len,
                max: MAX_MSG_SIZE,
            });
        }
        let dest = self.lookup(dest)?;
        if self.sends.len() >= self.config.tx_depth {
            return Err(FabricError::Again);
        }
        let seq = self.next_seq;
        let region = self.usable_region(mr, MrAccess::SEND)?;
        if len > region.buf.len() {
            return Err(FabricError::MessageTooLong {
                len,
                max: region.buf.len(),
            });
        }
        let mut datagram = Vec::with_capacity(HEADER_LEN + len);
        datagram.extend_from_slice(Header::new(KIND_DATA, seq).as_bytes());
        datagram.extend_from_slice(&region.buf[..len]);

        match self.socket.send_to(&datagram, dest) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Err(FabricError::Again),
            Err(e) => return Err(e.into()),
        }
        self.next_seq = seq.wrapping_add(1);
        trace!(%dest, seq, len, "send posted");

        if self.config.delivery_complete {
            self.region_mut(mr)?.busy = true;
            self.sends.push_back(PendingSend {
                seq,
                dest,
                context,
                region: mr.index(),
                len,
                datagram,
                sent_at: self.clock.now(),
                retransmits: 0,
            });
        } else {
            self.cq.push_back(CqEntry::Done(Completion {
                context,
                flags: CompletionFlags::SEND | CompletionFlags::MSG,
                len,
            }));
        }
        Ok(())
    }

    fn recv(
        &mut self,
        mr: &MemoryRegion,
        src: FabricAddr,
        context: u64,
    ) -> Result<(), FabricError> {
        self.check_enabled()?;
        let src = if src == FabricAddr::UNSPEC {
            None
        } else {
            Some(self.lookup(src)?)
        };
        if self.recvs.len() >= self.config.rx_depth {
            return Err(FabricError::Again);
        }
        self.usable_region(mr, MrAccess::RECV)?.busy = true;
        let posted = PostedRecv {
            region: mr.index(),
            src,
            context,
        };

        let early = self
            .unexpected
            .iter()
            .position(|u| src.map_or(true, |s| s == u.src))
            .and_then(|pos| self.unexpected.remove(pos));
        match early {
            Some(msg) => self.complete_recv(posted, &msg.payload),
            None => self.recvs.push_back(posted),
        }
        Ok(())
    }

    fn cq_read(&mut self, entries: &mut [Completion]) -> Result<usize, FabricError> {
        if self.closed {
            return Err(FabricError::NotEnabled);
        }
        self.progress()?;
        match self.cq.front().copied() {
            None => Err(FabricError::Again),
            Some(CqEntry::Failed { context, errno }) => {
                self.cq.pop_front();
                Err(FabricError::Completion { context, errno })
            }
            Some(CqEntry::Done(_)) => {
                let mut n = 0;
                while n < entries.len() {
                    match self.cq.front().copied() {
                        Some(CqEntry::Done(c)) => {
                            entries[n] = c;
                            self.cq.pop_front();
                            n += 1;
                        }
                        _ => break,
                    }
                }
                Ok(n)
            }
        }
    }

    fn close(&mut self) -> Result<(), FabricError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.enabled = false;
        let dropped = self.sends.len() + self.recvs.len();
        if dropped > 0 {
            debug!(dropped, "closing with operations outstanding");
        }
        self.sends.clear();
        self.recvs.clear();
        self.unexpected.clear();
        self.cq.clear();
        self.av.clear();
        if !self.regions.is_empty() {
            warn!(regions = self.regions.len(), "closing with memory still registered");
            self.regions.clear();
            return Err(FabricError::Busy);
        }
        Ok(())
    }
}
