//! Liveness probe.

use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;

/// Checks whether a relay port is reachable
pub trait Prober: Send + Sync + 'static {
    /// Returns true if `host:port` accepted a connection within `timeout`
    fn probe(&self, host: &str, port: u16, timeout: Duration) -> impl Future<Output = bool> + Send;
}

/// Timed TCP connect probe.
///
/// The connection is closed right away without a handshake; relays do not
/// register or announce such connections.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl Prober for TcpProbe {
    async fn probe(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(e)) => {
                tracing::debug!(port, "Probe failed: {}", e);
                false
            }
            Err(_) => {
                tracing::debug!(port, "Probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_probe_open_and_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let timeout = Duration::from_secs(1);

        assert!(TcpProbe.probe("127.0.0.1", port, timeout).await);
        drop(listener);
        assert!(!TcpProbe.probe("127.0.0.1", port, timeout).await);
    }
}
