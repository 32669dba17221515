//! The single send/receive round over the fabric.

use crate::barrier::drain;
use crate::error::{Error, FabricError, Result};
use crate::fabric::{Completion, CompletionFlags, Endpoint, FabricAddr, MemoryRegion};
use crate::progress::{Clock, Waiter};
use tracing::{debug, info};

/// Size of the registered message buffer.
pub const MSG_BUF_SIZE: usize = 64;

/// Requested key of the message buffer registration.
pub const MR_KEY: u64 = 0xC0DE;

/// What the connector sends.
pub const GREETING: &str = "Hello, server! I am the client you've been waiting for!";

pub const SEND_CONTEXT: u64 = 1;
pub const RECV_CONTEXT: u64 = 2;

/// Copies `text` into `mr` as a NUL-terminated string and zero-fills the rest.
///
/// Text that does not fit is cut so that the terminator still does. Returns the number of text
/// bytes written, which is the length to send.
pub fn write_message<E: Endpoint + ?Sized>(
    ep: &mut E,
    mr: &MemoryRegion,
    text: &str,
) -> Result<usize, FabricError> {
    let buf = ep.mr_bytes_mut(mr)?;
    let len = text.len().min(buf.len().saturating_sub(1));
    buf[..len].copy_from_slice(&text.as_bytes()[..len]);
    buf[len..].fill(0);
    Ok(len)
}

/// Which kind of operation a completion finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

/// Reads the direction off a completion's flags. Exactly one of `SEND` and `RECV` must be set.
pub fn completion_direction(completion: &Completion) -> Result<Direction, FabricError> {
    let flags = completion.flags;
    match (
        flags.contains(CompletionFlags::SEND),
        flags.contains(CompletionFlags::RECV),
    ) {
        (true, false) => Ok(Direction::Send),
        (false, true) => Ok(Direction::Recv),
        _ => Err(FabricError::UnexpectedCompletion {
            context: completion.context,
            flags,
        }),
    }
}

/// Decodes a received buffer up to its first NUL.
pub fn received_text(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Outcome of one post attempt: `None` asks the waiter to drain and try again.
fn retry_on_again(op: &'static str, res: Result<(), FabricError>) -> Result<Option<()>> {
    match res {
        Ok(()) => Ok(Some(())),
        Err(e) if e.is_again() => {
            debug!(op, "provider busy, draining before retry");
            Ok(None)
        }
        Err(e) => Err(Error::transport(op)(e)),
    }
}

/// Posts a send of the first `len` bytes of `mr` to `dest`, draining the CQ whenever the
/// provider asks for a retry.
pub fn post_send<E, C>(
    ep: &mut E,
    waiter: &Waiter<C>,
    mr: &MemoryRegion,
    len: usize,
    dest: FabricAddr,
) -> Result<()>
where
    E: Endpoint + ?Sized,
    C: Clock,
{
    waiter.poll_until(
        "fi_send",
        ep,
        |ep| retry_on_again("fi_send", ep.send(mr, len, dest, SEND_CONTEXT)),
        |ep| drain(ep),
    )
}

/// Posts `mr` as the receive buffer for a message from `src`, with the same retry policy as
/// [`post_send`].
pub fn post_recv<E, C>(
    ep: &mut E,
    waiter: &Waiter<C>,
    mr: &MemoryRegion,
    src: FabricAddr,
) -> Result<()>
where
    E: Endpoint + ?Sized,
    C: Clock,
{
    waiter.poll_until(
        "fi_recv",
        ep,
        |ep| retry_on_again("fi_recv", ep.recv(mr, src, RECV_CONTEXT)),
        |ep| drain(ep),
    )
}

/// Polls the CQ until exactly one completion shows up. An error entry aborts the wait.
pub fn wait_completion<E, C>(ep: &mut E, waiter: &Waiter<C>) -> Result<Completion>
where
    E: Endpoint + ?Sized,
    C: Clock,
{
    let completion = waiter.poll_until(
        "fi_cq_read",
        ep,
        |ep| {
            let mut entry = [Completion::default()];
            match ep.cq_read(&mut entry) {
                Ok(1) => Ok(Some(entry[0])),
                Ok(_) => Ok(None),
                Err(e) if e.is_again() => Ok(None),
                Err(e) => Err(Error::transport("fi_cq_read")(e)),
            }
        },
        // reading the CQ is the progress step
        |_| Ok(()),
    )?;
    info!(
        context = completion.context,
        flags = ?completion.flags,
        len = completion.len,
        "completion"
    );
    Ok(completion)
}
