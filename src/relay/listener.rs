//! Response Listener
//!
//! TCP server that accepts worker connections, reads framed response
//! envelopes and resolves them in the correlation table. A malformed frame
//! closes only its own connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::codec::read_frame;
use super::correlation::CorrelationTable;
use crate::error::{RelayError, Result};
use crate::metrics;

/// Pause after the first failed accept
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);

/// Longest pause between accepts while they keep failing
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Pause before the next accept after `failures` consecutive errors
fn accept_backoff(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1 << exponent)
        .min(ACCEPT_BACKOFF_MAX)
}

/// Response listener bound to a local address
#[derive(Debug)]
pub struct ResponseListener {
    listener: TcpListener,
    table: Arc<CorrelationTable>,
    max_frame_size: usize,
}

impl ResponseListener {
    /// Bind to `addr`
    pub async fn bind(
        addr: &str,
        table: Arc<CorrelationTable>,
        max_frame_size: usize,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| RelayError::Network(format!("failed to bind {}: {}", addr, e)))?;
        Ok(Self {
            listener,
            table,
            max_frame_size,
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.local_addr()?;
        info!("Response listener accepting on {}", addr);

        let mut connections = JoinSet::new();
        let mut accept_failures = 0u32;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        accept_failures = 0;
                        trace!("Accepted response connection from {}", peer);
                        let table = self.table.clone();
                        let max_frame_size = self.max_frame_size;
                        let cancel = cancel.clone();
                        connections.spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                _ = handle_connection(stream, peer, table, max_frame_size) => {}
                            }
                        });
                    }
                    Err(e) => {
                        // Descriptor exhaustion persists until connections close
                        accept_failures = accept_failures.saturating_add(1);
                        let pause = accept_backoff(accept_failures);
                        error!(
                            "Failed to accept response connection ({} in a row), pausing {:?}: {}",
                            accept_failures, pause, e
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(pause) => {}
                        }
                    }
                },
                // Reap finished connection tasks
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        connections.shutdown().await;
        info!("Response listener on {} stopped", addr);
        Ok(())
    }
}

/// Read frames from one worker connection until EOF or a bad frame
///
/// Returns the number of envelopes dispatched.
pub async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    table: Arc<CorrelationTable>,
    max_frame_size: usize,
) -> usize {
    let mut dispatched = 0;
    loop {
        match read_frame(&mut stream, max_frame_size).await {
            Ok(Some(envelope)) => {
                metrics::RESPONSES_RECEIVED_TOTAL.inc();
                let id = envelope.correlation_id;
                let outcome = table.resolve(id, envelope);
                trace!("Response {} from {}: {:?}", id, peer, outcome);
                dispatched += 1;
            }
            Ok(None) => {
                debug!("Worker {} closed connection after {} responses", peer, dispatched);
                break;
            }
            Err(RelayError::Frame(reason)) => {
                warn!("Malformed frame from {}, closing connection: {}", peer, reason);
                metrics::MALFORMED_FRAMES_TOTAL.inc();
                break;
            }
            Err(e) => {
                warn!("Response connection from {} failed: {}", peer, e);
                break;
            }
        }
    }
    dispatched
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::codec::{encode_frame, DEFAULT_MAX_FRAME_SIZE};
    use crate::relay::correlation::Settlement;
    use crate::relay::envelope::{new_correlation_id, ResponseEnvelope};
    use tokio::io::AsyncWriteExt;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_listener_resolves_frames() {
        let table = Arc::new(CorrelationTable::new());
        let listener = ResponseListener::bind("127.0.0.1:0", table.clone(), DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(listener.run(cancel.clone()));

        let id = new_correlation_id();
        let mut pending = table
            .register(id, Instant::now() + Duration::from_secs(5))
            .unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let response = ResponseEnvelope::success(id, 200, b"ok".to_vec());
        stream.write_all(&encode_frame(&response).unwrap()).await.unwrap();
        stream.shutdown().await.unwrap();

        let settlement = tokio::time::timeout(Duration::from_secs(2), pending.settled())
            .await
            .expect("response was not delivered");
        assert_eq!(settlement, Settlement::Completed(response));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bad_frame_closes_only_that_connection() {
        let table = Arc::new(CorrelationTable::new());
        let listener = ResponseListener::bind("127.0.0.1:0", table.clone(), 512)
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(listener.run(cancel.clone()));

        // Length prefix of 1024 against a 512 byte cap
        let mut bad = TcpStream::connect(addr).await.unwrap();
        bad.write_all(&[0, 0, 4, 0]).await.unwrap();

        let id = new_correlation_id();
        let mut pending = table
            .register(id, Instant::now() + Duration::from_secs(5))
            .unwrap();
        let mut good = TcpStream::connect(addr).await.unwrap();
        let response = ResponseEnvelope::success(id, 204, Vec::new());
        let frame = encode_frame(&response).unwrap();
        assert!(frame.len() < 512);
        good.write_all(&frame).await.unwrap();

        let settlement = tokio::time::timeout(Duration::from_secs(2), pending.settled())
            .await
            .expect("good connection was not served");
        assert_eq!(settlement, Settlement::Completed(response));

        cancel.cancel();
        server.await.unwrap().unwrap();
    }

    #[test]
    fn test_accept_backoff_grows_to_cap() {
        assert_eq!(accept_backoff(1), Duration::from_millis(10));
        assert_eq!(accept_backoff(2), Duration::from_millis(20));
        assert_eq!(accept_backoff(4), Duration::from_millis(80));
        assert_eq!(accept_backoff(8), ACCEPT_BACKOFF_MAX);
        assert_eq!(accept_backoff(u32::MAX), ACCEPT_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn test_bind_failure() {
        let table = Arc::new(CorrelationTable::new());
        let err = ResponseListener::bind("256.0.0.1:0", table, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Network(_)));
    }
}
