//! Client-facing byte channels.
//!
//! A session reads and writes through a [`ClientChannel`], which is either
//! a bare transport or a [`TlsChannel`] wrapped around one. Both expose
//! the same contract: `read` (Ok(0) = end-of-stream), partial-write
//! `write`, idempotent `close`, and `is_open`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::tls::TlsChannel;

/// An unencrypted channel over a duplex transport.
pub struct PlainChannel<S> {
    transport: S,
    open: bool,
}

impl<S> PlainChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(transport: S) -> Self {
        Self {
            transport,
            open: true,
        }
    }

    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if !self.open {
            return Ok(0);
        }
        let n = self.transport.read(dst).await?;
        if n == 0 {
            self.open = false;
        }
        Ok(n)
    }

    pub async fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if !self.open {
            return Ok(0);
        }
        let n = self.transport.write(src).await?;
        self.transport.flush().await?;
        Ok(n)
    }

    pub async fn close(&mut self) -> io::Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.transport.shutdown().await
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

/// Either side of the TLS decision, behind one call surface.
pub enum ClientChannel<S> {
    Plain(PlainChannel<S>),
    Tls(Box<TlsChannel<S>>),
}

impl<S> ClientChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn plain(transport: S) -> Self {
        Self::Plain(PlainChannel::new(transport))
    }

    pub fn tls(channel: TlsChannel<S>) -> Self {
        Self::Tls(Box::new(channel))
    }

    pub async fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(ch) => ch.read(dst).await,
            Self::Tls(ch) => ch.read(dst).await,
        }
    }

    pub async fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        match self {
            Self::Plain(ch) => ch.write(src).await,
            Self::Tls(ch) => ch.write(src).await,
        }
    }

    /// Write the whole buffer, retrying partial writes.
    pub async fn write_all(&mut self, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            if !self.is_open() {
                return Err(io::ErrorKind::BrokenPipe.into());
            }
            let n = self.write(src).await?;
            src = &src[n..];
        }
        Ok(())
    }

    pub async fn close(&mut self) -> io::Result<()> {
        match self {
            Self::Plain(ch) => ch.close().await,
            Self::Tls(ch) => ch.close().await,
        }
    }

    pub fn is_open(&self) -> bool {
        match self {
            Self::Plain(ch) => ch.is_open(),
            Self::Tls(ch) => ch.is_open(),
        }
    }
}
