use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use crate::config::{Limits, Timeouts};
use crate::error::Error;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Handles one inbound connection, which carries exactly one exchange.
#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    const ROLE: &'static str;

    async fn handle(&self, stream: &mut TcpStream) -> Result<(), Error>;
}

/// A running accept loop.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Server {
    pub async fn bind<S: Service>(
        addr: &str,
        service: S,
        timeouts: Timeouts,
        limits: Limits,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!(role = S::ROLE, %local_addr, "listening");

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve(
            listener,
            Arc::new(service),
            timeouts.connection,
            limits.max_connections,
            shutdown.clone(),
        ));

        Ok(Self {
            local_addr,
            shutdown,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for in-flight connections to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            tracing::error!(%err, "accept loop panicked");
        }
    }
}

/// Accepts connections until `shutdown` fires, handling each one in its own
/// task. Neither accept errors nor failed connections end the loop.
pub async fn serve<S: Service>(
    listener: TcpListener,
    service: Arc<S>,
    connection_timeout: Duration,
    max_connections: usize,
    shutdown: CancellationToken,
) {
    let tracker = TaskTracker::new();
    let permits = Arc::new(Semaphore::new(max_connections.max(1)));

    loop {
        let permit = tokio::select! {
            _ = shutdown.cancelled() => break,
            permit = Arc::clone(&permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let (mut stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(%err, "accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(%err, "could not disable nagle");
        }

        let service = Arc::clone(&service);
        let span = tracing::info_span!("conn", role = S::ROLE, %peer);
        tracker.spawn(
            async move {
                match tokio::time::timeout(connection_timeout, service.handle(&mut stream)).await {
                    Ok(Ok(())) => tracing::debug!("exchange complete"),
                    Ok(Err(err)) => tracing::warn!(%err, "exchange failed"),
                    Err(_) => tracing::warn!(?connection_timeout, "connection deadline expired"),
                }
                drop(permit);
            }
            .instrument(span),
        );
    }

    tracker.close();
    tracing::info!(
        role = S::ROLE,
        in_flight = tracker.len(),
        "draining connections"
    );
    tracker.wait().await;
}

pub(crate) async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, Error> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(source)) => {
            return Err(Error::Unreachable {
                addr: addr.into(),
                source,
            })
        }
        Err(_) => return Err(Error::Timeout(timeout)),
    };
    if let Err(err) = stream.set_nodelay(true) {
        tracing::debug!(%err, "could not disable nagle");
    }
    Ok(stream)
}

/// Runs `exchange`, turning expiry of `timeout` into [`Error::Timeout`].
pub(crate) async fn deadline<T>(
    timeout: Duration,
    exchange: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| Error::Timeout(timeout))?
}
