#![allow(dead_code)]

use oobfabric::fabric::{Completion, CompletionFlags, MemoryRegion, MrAccess};
use oobfabric::oob::ControlStream;
use oobfabric::{Endpoint, EndpointAddr, FabricAddr, FabricError, OobChannel};
use std::cell::Cell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// One write as seen by the shared log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteEvent {
    pub side: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Default)]
struct Wire {
    bytes: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory duplex byte stream.
///
/// Writes and reads move at most the next chunk size from the end's script, cycling through it,
/// so every transfer arrives in pieces.
pub struct PipeEnd {
    side: &'static str,
    inbox: Arc<Mutex<Wire>>,
    outbox: Arc<Mutex<Wire>>,
    write_chunks: Vec<usize>,
    read_chunks: Vec<usize>,
    writes: usize,
    reads: usize,
    nonblocking: Cell<bool>,
    log: Arc<Mutex<Vec<WriteEvent>>>,
}

/// A connected pair of pipe ends sharing one write log.
pub fn pipe(a: &'static str, b: &'static str) -> (PipeEnd, PipeEnd, Arc<Mutex<Vec<WriteEvent>>>) {
    let ab = Arc::new(Mutex::new(Wire::default()));
    let ba = Arc::new(Mutex::new(Wire::default()));
    let log = Arc::new(Mutex::new(Vec::new()));
    let end = |side, inbox: &Arc<Mutex<Wire>>, outbox: &Arc<Mutex<Wire>>| PipeEnd {
        side,
        inbox: inbox.clone(),
        outbox: outbox.clone(),
        write_chunks: Vec::new(),
        read_chunks: Vec::new(),
        writes: 0,
        reads: 0,
        nonblocking: Cell::new(false),
        log: log.clone(),
    };
    (end(a, &ba, &ab), end(b, &ab, &ba), log)
}

fn next_chunk(script: &[usize], n: &mut usize, want: usize) -> usize {
    if script.is_empty() {
        return want;
    }
    let chunk = script[*n % script.len()];
    *n += 1;
    chunk.clamp(1, want.max(1))
}

impl PipeEnd {
    pub fn with_write_chunks(mut self, chunks: &[usize]) -> Self {
        self.write_chunks = chunks.to_vec();
        self
    }

    pub fn with_read_chunks(mut self, chunks: &[usize]) -> Self {
        self.read_chunks = chunks.to_vec();
        self
    }

    pub fn writes(&self) -> usize {
        self.writes
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl Read for PipeEnd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut wire = self.inbox.lock().unwrap();
                if !wire.bytes.is_empty() {
                    let n = next_chunk(&self.read_chunks, &mut self.reads, buf.len())
                        .min(wire.bytes.len());
                    for (dst, src) in buf.iter_mut().zip(wire.bytes.drain(..n)) {
                        *dst = src;
                    }
                    return Ok(n);
                }
                if wire.closed {
                    return Ok(0);
                }
            }
            if self.nonblocking.get() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            std::thread::yield_now();
        }
    }
}

impl Write for PipeEnd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut wire = self.outbox.lock().unwrap();
        if wire.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let n = next_chunk(&self.write_chunks, &mut self.writes, buf.len()).min(buf.len());
        wire.bytes.extend(&buf[..n]);
        self.log.lock().unwrap().push(WriteEvent {
            side: self.side,
            bytes: buf[..n].to_vec(),
        });
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ControlStream for PipeEnd {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        self.nonblocking.set(nonblocking);
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        self.outbox.lock().unwrap().closed = true;
        Ok(())
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        if let Ok(mut wire) = self.outbox.lock() {
            wire.closed = true;
        }
    }
}

/// A fake endpoint whose behavior is scripted up front.
///
/// Every `cq_read` bumps `polls`, which another thread can watch to find out whether this side
/// is pumping its CQ.
pub struct ScriptedEndpoint {
    pub name: Vec<u8>,
    pub inserted: Vec<EndpointAddr>,
    /// `Again` answers to give before a post succeeds.
    pub post_again: usize,
    pub post_attempts: usize,
    pub polls: Arc<AtomicUsize>,
    /// Completions handed out once the CQ has been read this many times.
    pub complete_after: usize,
    pub buf: Vec<u8>,
    /// Makes both `mr_close` and `close` fail.
    pub fail_close: bool,
    /// Replaces the flags of every completion handed out.
    pub force_flags: Option<CompletionFlags>,
    pending: VecDeque<Completion>,
}

impl ScriptedEndpoint {
    pub fn new(name: &[u8]) -> Self {
        ScriptedEndpoint {
            name: name.to_vec(),
            inserted: Vec::new(),
            post_again: 0,
            post_attempts: 0,
            polls: Arc::new(AtomicUsize::new(0)),
            complete_after: 0,
            buf: Vec::new(),
            fail_close: false,
            force_flags: None,
            pending: VecDeque::new(),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    fn post(
        &mut self,
        context: u64,
        flags: CompletionFlags,
        len: usize,
    ) -> Result<(), FabricError> {
        self.post_attempts += 1;
        if self.post_again > 0 {
            self.post_again -= 1;
            return Err(FabricError::Again);
        }
        self.pending.push_back(Completion {
            context,
            flags: flags | CompletionFlags::MSG,
            len,
        });
        Ok(())
    }
}

impl Endpoint for ScriptedEndpoint {
    fn provider(&self) -> &str {
        "scripted"
    }

    fn enable(&mut self) -> Result<(), FabricError> {
        Ok(())
    }

    fn name(&self, buf: &mut [u8]) -> Result<usize, FabricError> {
        if buf.len() < self.name.len() {
            return Err(FabricError::TooSmall {
                required: self.name.len(),
            });
        }
        buf[..self.name.len()].copy_from_slice(&self.name);
        Ok(self.name.len())
    }

    fn av_insert(&mut self, addr: &EndpointAddr) -> Result<FabricAddr, FabricError> {
        if addr == &EndpointAddr::zeroed() {
            return Err(FabricError::InvalidAddress);
        }
        self.inserted.push(*addr);
        Ok(FabricAddr(self.inserted.len() as u64 - 1))
    }

    fn av_len(&self) -> usize {
        self.inserted.len()
    }

    fn mr_reg(&mut self, len: usize, _: MrAccess, key: u64) -> Result<MemoryRegion, FabricError> {
        self.buf = vec![0; len];
        Ok(MemoryRegion::new(0, key, len))
    }

    fn mr_bytes(&self, _: &MemoryRegion) -> Result<&[u8], FabricError> {
        Ok(&self.buf)
    }

    fn mr_bytes_mut(&mut self, _: &MemoryRegion) -> Result<&mut [u8], FabricError> {
        Ok(&mut self.buf)
    }

    fn mr_close(&mut self, _: MemoryRegion) -> Result<(), FabricError> {
        if self.fail_close {
            return Err(FabricError::Busy);
        }
        Ok(())
    }

    fn send(
        &mut self,
        _: &MemoryRegion,
        len: usize,
        _: FabricAddr,
        context: u64,
    ) -> Result<(), FabricError> {
        self.post(context, CompletionFlags::SEND, len)
    }

    fn recv(&mut self, mr: &MemoryRegion, _: FabricAddr, context: u64) -> Result<(), FabricError> {
        self.post(context, CompletionFlags::RECV, mr.len())
    }

    fn cq_read(&mut self, entries: &mut [Completion]) -> Result<usize, FabricError> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if polls <= self.complete_after || self.pending.is_empty() {
            return Err(FabricError::Again);
        }
        let mut n = 0;
        while n < entries.len() {
            match self.pending.pop_front() {
                Some(mut c) => {
                    if let Some(flags) = self.force_flags {
                        c.flags = flags;
                    }
                    entries[n] = c;
                }
                None => break,
            }
            n += 1;
        }
        Ok(n)
    }

    fn close(&mut self) -> Result<(), FabricError> {
        if self.fail_close {
            return Err(io::Error::from_raw_os_error(5).into());
        }
        Ok(())
    }
}

/// Wraps a pipe end the way the library wraps a TCP stream.
pub fn channel(end: PipeEnd) -> OobChannel<PipeEnd> {
    OobChannel::new(end)
}
