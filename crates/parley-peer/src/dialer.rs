//! Dialer capability.
//!
//! The reconnect loop only needs "give me a byte stream to host:port within
//! this timeout". Keeping that behind a trait lets the retry policy run
//! against scripted dialers in tests.

use parley_core::session::{BoxedReader, BoxedWriter};
use parley_core::{Error, Result};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;

/// An established byte stream, split into halves
pub struct Connection {
    /// Read half
    pub reader: BoxedReader,
    /// Write half
    pub writer: BoxedWriter,
    /// Remote endpoint
    pub remote: SocketAddr,
}

/// Opens connections to relay candidates
pub trait Dialer: Send + Sync + 'static {
    /// Connect to `host:port`, failing with
    /// [`Error::ConnectFailure`] after `timeout`.
    fn dial(
        &self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> impl Future<Output = Result<Connection>> + Send;
}

/// Plain TCP dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

impl Dialer for TcpDialer {
    async fn dial(&self, host: &str, port: u16, timeout: Duration) -> Result<Connection> {
        let addr = format!("{host}:{port}");

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(Error::ConnectFailure { addr, source }),
            Err(_) => {
                return Err(Error::ConnectFailure {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                });
            }
        };

        let remote = stream
            .peer_addr()
            .map_err(|source| Error::ConnectFailure {
                addr: addr.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        Ok(Connection {
            reader: Box::new(reader),
            writer: Box::new(writer),
            remote,
        })
    }
}
