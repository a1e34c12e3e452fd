//! TLS-terminating byte channel.
//!
//! Wraps a raw duplex byte stream and a [`rustls::Connection`] record
//! engine, exposing plaintext [`read`](TlsChannel::read) /
//! [`write`](TlsChannel::write) over four explicit staging buffers:
//! incoming ciphertext, incoming plaintext, outgoing plaintext, and
//! outgoing ciphertext. The handshake is driven opportunistically from
//! both the read and write paths; a peer that stalls mid-handshake leaves
//! the driving loop within [`HANDSHAKE_STALL_LIMIT`] no-progress
//! iterations, and the channel then simply waits on the transport instead
//! of spinning.
//!
//! TLS protocol faults are surfaced as `io::Error`, so callers see them
//! the same way as any other transport failure.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio_rustls::rustls;

/// Consecutive no-progress handshake iterations tolerated before the
/// driving loop yields back to the caller. Tunable; the value carries no
/// protocol meaning.
pub const HANDSHAKE_STALL_LIMIT: u32 = 5;

/// Transport read chunk size.
const READ_CHUNK: usize = 4096;
/// Cap on staged incoming ciphertext: one full TLS record plus framing.
const NET_BUFFER: usize = 16 * 1024 + 512;
/// Cap on staged plaintext in either direction.
const APP_BUFFER: usize = 16 * 1024;

/// An encrypted byte channel over an arbitrary duplex transport.
///
/// Not internally synchronized: one caller at a time per direction. The
/// session task owns the whole channel, which makes that structural.
pub struct TlsChannel<S> {
    transport: S,
    engine: rustls::Connection,
    /// Ciphertext pulled from the transport, awaiting the engine.
    in_net: Vec<u8>,
    /// Plaintext decoded by the engine, awaiting the caller.
    in_app: Vec<u8>,
    /// Caller plaintext awaiting the engine.
    out_app: Vec<u8>,
    /// Ciphertext produced by the engine, awaiting the transport.
    out_net: Vec<u8>,
    scratch: Box<[u8; READ_CHUNK]>,
    open: bool,
    transport_eof: bool,
    engine_closed: bool,
}

fn tls_error(e: rustls::Error) -> io::Error {
    io::Error::other(format!("tls: {e}"))
}

impl<S> TlsChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(transport: S, engine: impl Into<rustls::Connection>) -> Self {
        Self {
            transport,
            engine: engine.into(),
            in_net: Vec::with_capacity(NET_BUFFER),
            in_app: Vec::with_capacity(APP_BUFFER),
            out_app: Vec::with_capacity(APP_BUFFER),
            out_net: Vec::with_capacity(NET_BUFFER),
            scratch: Box::new([0u8; READ_CHUNK]),
            open: true,
            transport_eof: false,
            engine_closed: false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Read decrypted bytes into `dst`.
    ///
    /// Waits until at least one plaintext byte is available. Returns
    /// `Ok(0)` only at end-of-stream (peer closed, TLS session ended, or
    /// the channel was closed locally).
    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.in_app.is_empty() {
                let n = dst.len().min(self.in_app.len());
                dst[..n].copy_from_slice(&self.in_app[..n]);
                self.in_app.drain(..n);
                return Ok(n);
            }
            if !self.open {
                return Ok(0);
            }
            // Work off anything already staged before touching the
            // transport; earlier passes may have stopped at a buffer cap.
            self.advance().await?;
            if !self.in_app.is_empty() || !self.open {
                continue;
            }
            if self.transport_eof {
                // The peer went away mid-unwrap; shut the channel down
                // rather than retrying a dead transport.
                self.close().await.ok();
                continue;
            }
            self.fill_ciphertext().await?;
        }
    }

    /// Buffer `src` for encrypted transmission and flush as far as the
    /// engine and transport allow.
    ///
    /// Returns the number of bytes accepted, which may be less than
    /// `src.len()`; callers retry the remainder. Returns `Ok(0)` once the
    /// channel is closed.
    pub async fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        loop {
            if !self.open {
                return Ok(0);
            }
            let free = APP_BUFFER.saturating_sub(self.out_app.len());
            let n = src.len().min(free);
            self.out_app.extend_from_slice(&src[..n]);

            // Wrap until a full cycle moves nothing.
            loop {
                let app_before = self.out_app.len();
                let mut produced = self.wrap_cycle().await?;
                produced += self.drive_handshake().await?;
                let consumed = app_before - self.out_app.len();
                if !self.open || (consumed == 0 && produced == 0) {
                    break;
                }
            }
            if n > 0 || src.is_empty() {
                return Ok(n);
            }
            // Nothing accepted: the plaintext buffer is full behind an
            // unfinished handshake, which needs peer input to complete.
            if self.transport_eof {
                self.close().await.ok();
                return Ok(0);
            }
            self.fill_ciphertext().await?;
            self.advance().await?;
        }
    }

    /// Cleanly end the TLS session and close the transport. Idempotent.
    pub async fn close(&mut self) -> io::Result<()> {
        if !self.open {
            return Ok(());
        }
        // Flag first: the channel counts as closed even if the final
        // flush or shutdown fails.
        self.open = false;
        self.engine.send_close_notify();
        let flush = self.wrap_cycle().await.map(|_| ());
        let shutdown = self.transport.shutdown().await;
        flush.and(shutdown)
    }

    /// Pull ciphertext from the transport into `in_net`: one awaited read
    /// (the suspension point on an idle peer), then whatever else is
    /// immediately ready.
    async fn fill_ciphertext(&mut self) -> io::Result<()> {
        let n = self.transport.read(&mut self.scratch[..]).await?;
        if n == 0 {
            self.transport_eof = true;
            return Ok(());
        }
        self.in_net.extend_from_slice(&self.scratch[..n]);
        while self.in_net.len() < NET_BUFFER {
            match try_read_now(&mut self.transport, &mut self.scratch[..]).await? {
                Some(0) => {
                    self.transport_eof = true;
                    break;
                }
                Some(n) => self.in_net.extend_from_slice(&self.scratch[..n]),
                None => break,
            }
        }
        Ok(())
    }

    /// Run one full engine pass: unwrap buffered ciphertext, drive any
    /// handshake, flush engine output, drain decrypted plaintext, and
    /// react to an engine-reported close.
    async fn advance(&mut self) -> io::Result<()> {
        self.unwrap_buffered()?;
        self.drive_handshake().await?;
        self.wrap_cycle().await?;
        self.drain_plaintext()?;
        if self.engine_closed && self.open {
            // Engine says the TLS session is over: the transport goes too.
            self.open = false;
            let _ = self.transport.shutdown().await;
        }
        Ok(())
    }

    /// Hand staged ciphertext to the engine and decode it. Returns the
    /// number of ciphertext bytes the engine accepted.
    fn unwrap_buffered(&mut self) -> io::Result<usize> {
        let mut consumed = 0;
        while !self.in_net.is_empty() {
            let mut cursor = io::Cursor::new(&self.in_net[..]);
            let n = self.engine.read_tls(&mut cursor)?;
            if n == 0 {
                break;
            }
            self.in_net.drain(..n);
            consumed += n;
            let state = self.engine.process_new_packets().map_err(tls_error)?;
            if state.peer_has_closed() {
                self.engine_closed = true;
            }
        }
        Ok(consumed)
    }

    /// Drive the handshake using only already-staged input. Never awaits
    /// more ciphertext; when the peer has gone quiet this exits within
    /// [`HANDSHAKE_STALL_LIMIT`] iterations and progress resumes on a
    /// later read or write. Returns ciphertext bytes produced.
    async fn drive_handshake(&mut self) -> io::Result<usize> {
        let mut produced = 0;
        let mut stalls = 0u32;
        while self.engine.is_handshaking() && !self.engine_closed {
            let mut progress = 0;
            if self.engine.wants_write() {
                progress += self.wrap_cycle().await?;
            } else if self.engine.wants_read() {
                progress += self.unwrap_buffered()?;
            }
            produced += progress;
            if progress == 0 {
                stalls += 1;
                if stalls >= HANDSHAKE_STALL_LIMIT {
                    break;
                }
            } else {
                stalls = 0;
            }
        }
        Ok(produced)
    }

    /// One wrap cycle: move pending plaintext into the engine, collect
    /// the ciphertext it produces, and push that to the transport.
    /// Returns ciphertext bytes produced.
    async fn wrap_cycle(&mut self) -> io::Result<usize> {
        use std::io::Write;

        if !self.out_app.is_empty() && !self.engine.is_handshaking() {
            let n = self.engine.writer().write(&self.out_app)?;
            self.out_app.drain(..n);
        }
        let mut produced = 0;
        while self.engine.wants_write() {
            let n = self.engine.write_tls(&mut self.out_net)?;
            if n == 0 {
                break;
            }
            produced += n;
        }
        while !self.out_net.is_empty() {
            let n = self.transport.write(&self.out_net).await?;
            if n == 0 {
                return Err(io::ErrorKind::WriteZero.into());
            }
            self.out_net.drain(..n);
        }
        if produced > 0 {
            self.transport.flush().await?;
        }
        Ok(produced)
    }

    /// Drain decrypted plaintext out of the engine into `in_app`.
    fn drain_plaintext(&mut self) -> io::Result<()> {
        use std::io::Read;

        let mut chunk = [0u8; 4096];
        while self.in_app.len() < APP_BUFFER {
            match self.engine.reader().read(&mut chunk) {
                Ok(0) => {
                    self.engine_closed = true;
                    break;
                }
                Ok(n) => self.in_app.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// Poll the transport for data exactly once; `None` means nothing is
/// ready right now.
async fn try_read_now<S>(transport: &mut S, buf: &mut [u8]) -> io::Result<Option<usize>>
where
    S: AsyncRead + Unpin,
{
    std::future::poll_fn(|cx| {
        let mut read_buf = ReadBuf::new(&mut *buf);
        match std::pin::Pin::new(&mut *transport).poll_read(cx, &mut read_buf) {
            std::task::Poll::Ready(Ok(())) => std::task::Poll::Ready(Ok(Some(read_buf.filled().len()))),
            std::task::Poll::Ready(Err(e)) => std::task::Poll::Ready(Err(e)),
            std::task::Poll::Pending => std::task::Poll::Ready(Ok(None)),
        }
    })
    .await
}
