//! The completion-draining barrier.
//!
//! Some fabrics only make progress while somebody reads the CQ, including for operations nobody
//! is waiting on yet. A barrier that simply blocked on the bootstrap socket could stall the peer's
//! pending sends forever, so the wait for the peer's token pumps the CQ between non-blocking
//! reads.
//!
//! Both sides run the same loop. They differ only in when they send their own token: the
//! connector sends before waiting, the listener after. If both waited first, neither would ever
//! send.

use crate::error::{Error, Result};
use crate::fabric::Endpoint;
use crate::oob::{ControlStream, OobChannel, Role, Token};
use crate::progress::{Clock, MonotonicClock, PollPolicy, Waiter};
use tracing::debug;

/// Reads the CQ with no room for entries, only to let the provider move.
pub fn drain<E: Endpoint + ?Sized>(ep: &mut E) -> Result<()> {
    match ep.cq_read(&mut []) {
        Ok(_) => Ok(()),
        Err(e) if e.is_again() => Ok(()),
        Err(e) => Err(Error::transport("fi_cq_read")(e)),
    }
}

/// One side of the two-party rendezvous.
pub struct Rendezvous<C = MonotonicClock> {
    role: Role,
    waiter: Waiter<C>,
}

impl Rendezvous<MonotonicClock> {
    pub fn new(role: Role, policy: PollPolicy) -> Self {
        Rendezvous::with_waiter(role, Waiter::new(policy))
    }
}

impl<C: Clock> Rendezvous<C> {
    pub fn with_waiter(role: Role, waiter: Waiter<C>) -> Self {
        Rendezvous { role, waiter }
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn waiter(&self) -> &Waiter<C> {
        &self.waiter
    }

    /// Returns once the peer has reached its matching barrier call.
    ///
    /// Fails with [`Error::BarrierProtocol`] if a token cannot be written in one piece, and with
    /// any fatal error the CQ reports while waiting.
    pub fn barrier<S, E>(&self, chan: &mut OobChannel<S>, ep: &mut E) -> Result<()>
    where
        S: ControlStream,
        E: Endpoint + ?Sized,
    {
        debug!(role = ?self.role, "entering barrier");
        if self.role.signals_first() {
            chan.send_token(Token::READY)?;
        }

        let mut rounds: u64 = 0;
        let token = self.waiter.poll_until(
            "barrier",
            &mut (&mut *chan, &mut *ep, &mut rounds),
            |(chan, _, _)| chan.try_recv_token(),
            |(_, ep, rounds)| {
                **rounds += 1;
                drain(&mut **ep)
            },
        )?;

        if !self.role.signals_first() {
            chan.send_token(Token::READY)?;
        }
        debug!(role = ?self.role, ?token, drains = rounds, "left barrier");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FabricError;
    use crate::fabric::{Completion, EndpointAddr, FabricAddr, MemoryRegion, MrAccess};
    use std::io::{self, Read, Write};

    /// Stream with a scripted inbound side and a recorded outbound side.
    #[derive(Default)]
    struct Script {
        inbound: Vec<u8>,
        // Non-blocking reads that report nothing before data shows up.
        stalls: usize,
        outbound: Vec<u8>,
        max_write: Option<usize>,
    }

    impl Read for Script {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.stalls > 0 {
                self.stalls -= 1;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            if self.inbound.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.inbound.len());
            buf[..n].copy_from_slice(&self.inbound[..n]);
            self.inbound.drain(..n);
            Ok(n)
        }
    }

    impl Write for Script {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.max_write.map_or(buf.len(), |m| m.min(buf.len()));
            self.outbound.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl ControlStream for Script {
        fn set_nonblocking(&self, _: bool) -> io::Result<()> {
            Ok(())
        }

        fn close(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Endpoint whose CQ only ever reports `Again`, or a fatal error once `fail_after` reads.
    #[derive(Default)]
    struct IdleCq {
        reads: usize,
        fail_after: Option<usize>,
    }

    impl Endpoint for IdleCq {
        fn provider(&self) -> &str {
            "idle"
        }
        fn enable(&mut self) -> Result<(), FabricError> {
            Ok(())
        }
        fn name(&self, _: &mut [u8]) -> Result<usize, FabricError> {
            Ok(0)
        }
        fn av_insert(&mut self, _: &EndpointAddr) -> Result<FabricAddr, FabricError> {
            Ok(FabricAddr(0))
        }
        fn av_len(&self) -> usize {
            0
        }
        fn mr_reg(
            &mut self,
            len: usize,
            _: MrAccess,
            key: u64,
        ) -> Result<MemoryRegion, FabricError> {
            Ok(MemoryRegion::new(0, key, len))
        }
        fn mr_bytes(&self, _: &MemoryRegion) -> Result<&[u8], FabricError> {
            Ok(&[])
        }
        fn mr_bytes_mut(&mut self, _: &MemoryRegion) -> Result<&mut [u8], FabricError> {
            Err(FabricError::BadHandle)
        }
        fn mr_close(&mut self, _: MemoryRegion) -> Result<(), FabricError> {
            Ok(())
        }
        fn send(
            &mut self,
            _: &MemoryRegion,
            _: usize,
            _: FabricAddr,
            _: u64,
        ) -> Result<(), FabricError> {
            Ok(())
        }
        fn recv(&mut self, _: &MemoryRegion, _: FabricAddr, _: u64) -> Result<(), FabricError> {
            Ok(())
        }
        fn cq_read(&mut self, _: &mut [Completion]) -> Result<usize, FabricError> {
            self.reads += 1;
            match self.fail_after {
                Some(n) if self.reads > n => Err(FabricError::Completion {
                    context: 0,
                    errno: 5,
                }),
                _ => Err(FabricError::Again),
            }
        }
        fn close(&mut self) -> Result<(), FabricError> {
            Ok(())
        }
    }

    fn channel(script: Script) -> OobChannel<Script> {
        OobChannel::new(script)
    }

    #[test]
    #[tracing_test::traced_test]
    fn connector_signals_then_waits() {
        let mut chan = channel(Script {
            inbound: Token::READY.to_wire().to_vec(),
            stalls: 3,
            ..Script::default()
        });
        let mut ep = IdleCq::default();
        let rdv = Rendezvous::new(Role::Connector, PollPolicy::default());
        rdv.barrier(&mut chan, &mut ep).unwrap();
        assert_eq!(chan.get_ref().outbound, Token::READY.to_wire());
        assert_eq!(ep.reads, 3);
        assert!(logs_contain("left barrier"));
        assert!(logs_contain("drains=3"));
    }

    #[test]
    fn listener_answers_after_peer_token() {
        let mut chan = channel(Script {
            inbound: Token::READY.to_wire().to_vec(),
            ..Script::default()
        });
        let mut ep = IdleCq::default();
        let rdv = Rendezvous::new(Role::Listener, PollPolicy::default());
        rdv.barrier(&mut chan, &mut ep).unwrap();
        assert_eq!(chan.get_ref().outbound, Token::READY.to_wire());
        assert_eq!(ep.reads, 0, "token was already there, no drain needed");
    }

    #[test]
    fn short_token_write_is_a_protocol_error() {
        let mut chan = channel(Script {
            max_write: Some(2),
            ..Script::default()
        });
        let mut ep = IdleCq::default();
        let rdv = Rendezvous::new(Role::Connector, PollPolicy::default());
        let err = rdv.barrier(&mut chan, &mut ep).unwrap_err();
        assert!(matches!(
            err,
            Error::BarrierProtocol {
                sent: 2,
                expected: 4
            }
        ));
    }

    #[test]
    fn fatal_cq_error_ends_the_wait() {
        let mut chan = channel(Script::default());
        let mut ep = IdleCq {
            fail_after: Some(2),
            ..IdleCq::default()
        };
        let rdv = Rendezvous::new(Role::Listener, PollPolicy::default());
        let err = rdv.barrier(&mut chan, &mut ep).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport {
                op: "fi_cq_read",
                source: FabricError::Completion { .. }
            }
        ));
        assert_eq!(ep.reads, 3);
        assert!(chan.get_ref().outbound.is_empty(), "listener never answered");
    }
}
