//! Swapping endpoint names over the bootstrap channel.

use crate::barrier::Rendezvous;
use crate::error::{Error, Result};
use crate::fabric::{Endpoint, EndpointAddr, FabricAddr};
use crate::oob::{ControlStream, OobChannel};
use crate::progress::Clock;
use tracing::info;
use zerocopy::IntoBytes;

/// What both sides know about each other once the exchange is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    /// The name this side published.
    pub local: EndpointAddr,
    /// The name the peer published, byte for byte.
    pub remote: EndpointAddr,
    /// Address vector handle for `remote`.
    pub handle: FabricAddr,
}

/// Publishes the local endpoint name, learns the peer's, inserts it into the address vector and
/// waits at the barrier.
///
/// Both roles run the same steps. The full fixed-size blob goes on the wire whatever the actual
/// name length is. A blob the provider rejects is fatal.
pub fn exchange_addresses<S, E, C>(
    rendezvous: &Rendezvous<C>,
    chan: &mut OobChannel<S>,
    ep: &mut E,
) -> Result<PeerAddress>
where
    S: ControlStream,
    E: Endpoint + ?Sized,
    C: Clock,
{
    let local = EndpointAddr::local(&*ep).map_err(Error::NameQuery)?;
    info!(addr = ?local, "local endpoint address");

    chan.send_exact(local.as_bytes())?;
    let mut remote = EndpointAddr::zeroed();
    chan.recv_exact_into(remote.as_mut_bytes())?;
    info!(addr = ?remote, "peer endpoint address");

    let handle = ep.av_insert(&remote).map_err(Error::AddressInsert)?;
    rendezvous.barrier(chan, ep)?;
    Ok(PeerAddress {
        local,
        remote,
        handle,
    })
}
