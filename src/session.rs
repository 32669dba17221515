//! Everything one peer owns for the length of a run.

use crate::barrier::Rendezvous;
use crate::config::Config;
use crate::error::{Error, FabricError, Result};
use crate::exchange::{exchange_addresses, PeerAddress};
use crate::fabric::{self, Endpoint, MemoryRegion, MrAccess};
use crate::message::{self, Direction, GREETING, MR_KEY, MSG_BUF_SIZE};
use crate::oob::{self, ControlStream, OobChannel, Role};
use crate::progress::{Clock, MonotonicClock};
use std::net::{IpAddr, TcpStream};
use tracing::{info, warn};

/// What this side saw of the message exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The connector's send was delivered.
    Sent { len: usize },
    /// The listener's buffer was filled. `text` is the buffer up to its first NUL.
    Received { len: usize, text: String },
}

/// A peer's bootstrap channel, fabric endpoint and message buffer.
///
/// Resources are released by [`Session::shutdown`], which attempts every close even when an
/// earlier one fails.
pub struct Session<S: ControlStream = TcpStream, C = MonotonicClock> {
    chan: OobChannel<S>,
    ep: Box<dyn Endpoint>,
    mr: Option<MemoryRegion>,
    peer: Option<PeerAddress>,
    rendezvous: Rendezvous<C>,
}

impl Session {
    /// Sets up the bootstrap channel for the configured role and opens an endpoint reachable at
    /// the channel's local address.
    pub fn establish(config: &Config) -> Result<Session> {
        let chan = match config.dst_addr.as_deref() {
            Some(dst) => oob::connect(dst, config.port, config.settle_delay)?,
            None => oob::listen_and_accept(config.src_addr.as_deref(), config.port)?,
        };
        let local_ip = match config.src_addr.as_deref().map(str::parse::<IpAddr>) {
            Some(Ok(ip)) if !ip.is_unspecified() => ip,
            _ => chan.get_ref().local_addr()?.ip(),
        };
        let ep = fabric::open(&config.fabric, local_ip).map_err(Error::transport("fi_endpoint"))?;
        info!(provider = ep.provider(), %local_ip, "endpoint opened");
        Ok(Session::from_parts(
            chan,
            ep,
            Rendezvous::new(config.role(), config.poll),
        ))
    }
}

impl<S: ControlStream, C: Clock> Session<S, C> {
    pub fn from_parts(
        chan: OobChannel<S>,
        ep: Box<dyn Endpoint>,
        rendezvous: Rendezvous<C>,
    ) -> Self {
        Session {
            chan,
            ep,
            mr: None,
            peer: None,
            rendezvous,
        }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.rendezvous.role()
    }

    #[inline]
    pub fn peer(&self) -> Option<&PeerAddress> {
        self.peer.as_ref()
    }

    pub fn endpoint(&self) -> &dyn Endpoint {
        &*self.ep
    }

    /// Enables the endpoint, registers the message buffer and exchanges addresses with the peer.
    pub fn initialize(&mut self) -> Result<PeerAddress> {
        self.ep.enable().map_err(Error::transport("fi_enable"))?;

        let access = MrAccess::SEND
            | MrAccess::RECV
            | MrAccess::READ
            | MrAccess::WRITE
            | MrAccess::REMOTE_READ
            | MrAccess::REMOTE_WRITE;
        let mr = self
            .ep
            .mr_reg(MSG_BUF_SIZE, access, MR_KEY)
            .map_err(Error::transport("fi_mr_reg"))?;
        let mr = self.mr.insert(mr);
        if self.ep.mr_requires_bind() {
            self.ep.mr_bind(mr).map_err(Error::transport("fi_mr_bind"))?;
            self.ep.mr_enable(mr).map_err(Error::transport("fi_mr_enable"))?;
        }

        let peer = exchange_addresses(&self.rendezvous, &mut self.chan, &mut *self.ep)?;
        self.peer = Some(peer);
        Ok(peer)
    }

    /// Runs the message exchange for this side's role, then meets the peer at the barrier once
    /// more.
    ///
    /// The outcome is read off the completion's flags. A completion whose direction is not the
    /// one this side posted fails the run before the final barrier.
    pub fn run(&mut self) -> Result<Outcome> {
        let (Some(peer), Some(mr)) = (self.peer, self.mr.as_ref()) else {
            return Err(Error::transport("run")(FabricError::NotEnabled));
        };
        let waiter = self.rendezvous.waiter();
        let ep = &mut *self.ep;

        let posted = match self.rendezvous.role() {
            Role::Connector => {
                let len = message::write_message(ep, mr, GREETING)
                    .map_err(Error::transport("fi_send"))?;
                message::post_send(ep, waiter, mr, len, peer.handle)?;
                Direction::Send
            }
            Role::Listener => {
                message::post_recv(ep, waiter, mr, peer.handle)?;
                Direction::Recv
            }
        };
        let completion = message::wait_completion(ep, waiter)?;
        let direction =
            message::completion_direction(&completion).map_err(Error::transport("fi_cq_read"))?;
        if direction != posted {
            return Err(Error::transport("fi_cq_read")(
                FabricError::UnexpectedCompletion {
                    context: completion.context,
                    flags: completion.flags,
                },
            ));
        }

        let outcome = match direction {
            Direction::Send => {
                info!(len = completion.len, "message delivered");
                Outcome::Sent {
                    len: completion.len,
                }
            }
            Direction::Recv => {
                let buf = ep.mr_bytes(mr).map_err(Error::transport("fi_recv"))?;
                Outcome::Received {
                    len: completion.len,
                    text: message::received_text(buf),
                }
            }
        };

        self.rendezvous.barrier(&mut self.chan, ep)?;
        Ok(outcome)
    }

    /// Closes the memory region, the endpoint and the bootstrap channel, in that order.
    ///
    /// Every step runs. Failures are logged and returned together as [`Error::Teardown`].
    pub fn shutdown(mut self) -> Result<()> {
        let mut errors = Vec::new();
        if let Some(mr) = self.mr.take() {
            if let Err(e) = self.ep.mr_close(mr) {
                warn!(error = %e, "error closing memory region");
                errors.push(Error::transport("fi_close(mr)")(e));
            }
        }
        if let Err(e) = self.ep.close() {
            warn!(error = %e, "error closing endpoint");
            errors.push(Error::transport("fi_close(ep)")(e));
        }
        if let Err(e) = self.chan.close() {
            warn!(error = %e, "error closing bootstrap connection");
            errors.push(e);
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(errors))
        }
    }
}

/// Runs one complete exchange: bootstrap, initialize, message round, teardown.
///
/// An error from the run wins over teardown errors, which are then only logged.
pub fn run_demo(config: &Config) -> Result<Outcome> {
    let mut session = Session::establish(config)?;
    let result = session.initialize().and_then(|_| session.run());
    let teardown = session.shutdown();
    match (result, teardown) {
        (Ok(outcome), Ok(())) => Ok(outcome),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Err(teardown)) => {
            warn!(error = %teardown, "teardown after a failed run");
            Err(e)
        }
        (Err(e), Ok(())) => Err(e),
    }
}
