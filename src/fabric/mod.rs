//! The fabric transport as seen by the rendezvous code.
//!
//! The rendezvous only needs a handful of operations from the transport: query the local endpoint
//! name, insert a peer name into the address vector, post sends and receives against a registered
//! buffer, and read the completion queue. [`Endpoint`] is that surface. Providers implement it;
//! [`open`] picks one by name.

use crate::error::FabricError;
use std::fmt;
use std::net::IpAddr;
use std::ops::BitOr;
use std::time::Duration;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub mod udp;

pub use udp::UdpEndpoint;

/// Size of the address blob exchanged over the bootstrap channel.
pub const ADDR_LEN: usize = 64;

/// An opaque endpoint name, zero-padded to [`ADDR_LEN`].
///
/// Only the provider that produced it knows what the bytes mean.
#[derive(Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(transparent)]
pub struct EndpointAddr([u8; ADDR_LEN]);

impl EndpointAddr {
    pub const LEN: usize = ADDR_LEN;

    pub const fn zeroed() -> EndpointAddr {
        EndpointAddr([0; ADDR_LEN])
    }

    /// Copies `name` into a zero-padded blob.
    pub fn from_name(name: &[u8]) -> Result<EndpointAddr, FabricError> {
        if name.len() > ADDR_LEN {
            return Err(FabricError::TooSmall {
                required: name.len(),
            });
        }
        let mut addr = EndpointAddr::zeroed();
        addr.0[..name.len()].copy_from_slice(name);
        Ok(addr)
    }

    /// Queries `ep` for its name.
    pub fn local<E: Endpoint + ?Sized>(ep: &E) -> Result<EndpointAddr, FabricError> {
        let mut addr = EndpointAddr::zeroed();
        ep.name(&mut addr.0)?;
        Ok(addr)
    }

    pub fn from_wire(bytes: &[u8]) -> Option<EndpointAddr> {
        EndpointAddr::read_from_bytes(bytes).ok()
    }
}

impl fmt::Debug for EndpointAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let used = self.0.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        f.write_str("EndpointAddr(")?;
        for b in &self.0[..used] {
            write!(f, "{b:02x}")?;
        }
        f.write_str(")")
    }
}

/// Handle of an address vector entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FabricAddr(pub u64);

impl FabricAddr {
    /// Matches any source when used on a receive.
    pub const UNSPEC: FabricAddr = FabricAddr(u64::MAX);
}

macro_rules! define_flags {
    ($(#[$meta:meta])* $name:ident($repr:ty) { $($flag:ident = $value:expr,)+ }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name(pub $repr);

        impl $name {
            $(pub const $flag: $name = $name($value);)+

            #[inline]
            pub fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let mut set = f.debug_set();
                $(if self.contains($name::$flag) {
                    set.entry(&stringify!($flag));
                })+
                set.finish()
            }
        }
    };
}

define_flags! {
    /// Access rights of a registered memory region.
    MrAccess(u32) {
        SEND = 1 << 0,
        RECV = 1 << 1,
        READ = 1 << 2,
        WRITE = 1 << 3,
        REMOTE_READ = 1 << 4,
        REMOTE_WRITE = 1 << 5,
    }
}

define_flags! {
    /// What a completion entry reports.
    CompletionFlags(u64) {
        MSG = 1 << 1,
        SEND = 1 << 8,
        RECV = 1 << 9,
    }
}

/// A successful completion queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Completion {
    /// The context passed when the operation was posted.
    pub context: u64,
    pub flags: CompletionFlags,
    /// Bytes transferred.
    pub len: usize,
}

/// A registered buffer. The bytes live in the endpoint and are reached through
/// [`Endpoint::mr_bytes`] and [`Endpoint::mr_bytes_mut`].
#[derive(Debug, PartialEq, Eq)]
pub struct MemoryRegion {
    index: usize,
    key: u64,
    len: usize,
}

impl MemoryRegion {
    /// For providers: `index` identifies the region inside the endpoint that registered it.
    pub fn new(index: usize, key: u64, len: usize) -> MemoryRegion {
        MemoryRegion { index, key, len }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn key(&self) -> u64 {
        self.key
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// A reliable-datagram endpoint together with its completion queue and address vector.
pub trait Endpoint {
    fn provider(&self) -> &str;

    /// Makes the endpoint ready for data transfer. Posting before this fails with
    /// [`FabricError::NotEnabled`].
    fn enable(&mut self) -> Result<(), FabricError>;

    /// Writes the local endpoint name into `buf` and returns its length.
    fn name(&self, buf: &mut [u8]) -> Result<usize, FabricError>;

    /// Resolves a peer name into a handle usable as a send destination or receive source.
    fn av_insert(&mut self, addr: &EndpointAddr) -> Result<FabricAddr, FabricError>;

    /// Number of entries in the address vector.
    fn av_len(&self) -> usize;

    fn mr_reg(&mut self, len: usize, access: MrAccess, key: u64)
        -> Result<MemoryRegion, FabricError>;

    /// Whether registered regions must be bound to the endpoint and enabled before use.
    fn mr_requires_bind(&self) -> bool {
        false
    }

    fn mr_bind(&mut self, _mr: &MemoryRegion) -> Result<(), FabricError> {
        Ok(())
    }

    fn mr_enable(&mut self, _mr: &MemoryRegion) -> Result<(), FabricError> {
        Ok(())
    }

    /// Contents of `mr`. Fails with [`FabricError::Busy`] while an operation is posted on it.
    fn mr_bytes(&self, mr: &MemoryRegion) -> Result<&[u8], FabricError>;

    fn mr_bytes_mut(&mut self, mr: &MemoryRegion) -> Result<&mut [u8], FabricError>;

    fn mr_close(&mut self, mr: MemoryRegion) -> Result<(), FabricError>;

    /// Posts a send of the first `len` bytes of `mr` to `dest`.
    ///
    /// [`FabricError::Again`] means the send queue is full; reading the CQ frees it up.
    fn send(
        &mut self,
        mr: &MemoryRegion,
        len: usize,
        dest: FabricAddr,
        context: u64,
    ) -> Result<(), FabricError>;

    /// Posts `mr` as a receive buffer for a message from `src`, or from anyone with
    /// [`FabricAddr::UNSPEC`].
    fn recv(&mut self, mr: &MemoryRegion, src: FabricAddr, context: u64)
        -> Result<(), FabricError>;

    /// Drives the provider and moves up to `entries.len()` completions into `entries`.
    ///
    /// Returns [`FabricError::Again`] when nothing is queued. A failed operation surfaces as
    /// [`FabricError::Completion`]. A zero-length read is valid and only makes progress.
    fn cq_read(&mut self, entries: &mut [Completion]) -> Result<usize, FabricError>;

    fn close(&mut self) -> Result<(), FabricError>;
}

/// Endpoint attributes requested at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FabricConfig {
    pub provider: String,
    pub cq_size: usize,
    pub av_count: usize,
    pub tx_depth: usize,
    pub rx_depth: usize,
    /// Report a send only once the peer has the data.
    pub delivery_complete: bool,
    /// Require memory regions to be bound to the endpoint.
    pub mr_endpoint: bool,
    pub retransmit_after: Duration,
    pub max_retransmits: u32,
}

impl Default for FabricConfig {
    fn default() -> Self {
        FabricConfig {
            provider: udp::PROVIDER_NAME.to_owned(),
            cq_size: 128,
            av_count: 1,
            tx_depth: 16,
            rx_depth: 16,
            delivery_complete: true,
            mr_endpoint: true,
            retransmit_after: Duration::from_millis(200),
            max_retransmits: 25,
        }
    }
}

/// Opens an endpoint of the configured provider, reachable on `local_ip`.
pub fn open(config: &FabricConfig, local_ip: IpAddr) -> Result<Box<dyn Endpoint>, FabricError> {
    match config.provider.as_str() {
        udp::PROVIDER_NAME => Ok(Box::new(UdpEndpoint::open(config.clone(), local_ip)?)),
        other => Err(FabricError::NoProvider(other.to_owned())),
    }
}
