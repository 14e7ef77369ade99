use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::blobstore::{BlobStore, FsBlobStore, MemBlobStore};
use crate::config::{Limits, StorageBackend, StorageNodeConfig};
use crate::error::Error;
use crate::net::{Server, Service};
use crate::protocol::{self, Frame};

/// Serves `store` and `fetch` requests out of a [`BlobStore`].
#[derive(Debug)]
pub struct StorageNode<S> {
    store: S,
    limits: Limits,
}

impl<S: BlobStore> StorageNode<S> {
    pub fn new(store: S, limits: Limits) -> Self {
        Self { store, limits }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn handle<T>(&self, stream: &mut T) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let frame = match Frame::read(stream, self.limits.max_payload).await {
            Ok(frame) => frame,
            Err(err) => {
                protocol::reject(stream, &err, None).await;
                return Err(err);
            }
        };

        match frame {
            Frame::Store { name, len } => self.handle_store(stream, &name, len).await,
            Frame::Fetch { name } => self.handle_fetch(stream, &name).await,
        }
    }

    async fn handle_store<T>(&self, stream: &mut T, name: &str, len: u64) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut payload = (&mut *stream).take(len);
        let stored = self.store.store_blob(name, len, &mut payload).await;

        if let Err(err) = stored {
            // the peer only reads the reply once its payload is fully written
            if let Err(drain_err) = tokio::io::copy(&mut payload, &mut tokio::io::sink()).await {
                tracing::debug!(%drain_err, "could not drain payload");
            }
            report(stream, &err).await;
            return Err(err);
        }

        protocol::write_ok(stream).await?;
        tracing::debug!(%name, len, "stored");
        Ok(())
    }

    async fn handle_fetch<T>(&self, stream: &mut T, name: &str) -> Result<(), Error>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let (len, mut blob) = match self.store.fetch_blob(name).await {
            Ok(found) => found,
            Err(Error::NotFound(name)) => {
                tracing::debug!(%name, "not found");
                protocol::write_error(stream, &Error::NotFound(name)).await?;
                return Ok(());
            }
            Err(err) => {
                report(stream, &err).await;
                return Err(err);
            }
        };

        // once the header is out, failures can only be signalled by hanging up
        protocol::write_payload_header(stream, len).await?;
        protocol::copy_exact(&mut blob, stream, len).await?;
        stream.flush().await?;
        tracing::debug!(%name, len, "fetched");
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: BlobStore> Service for StorageNode<S> {
    const ROLE: &'static str = "storage-node";

    async fn handle(&self, stream: &mut TcpStream) -> Result<(), Error> {
        StorageNode::handle(self, stream).await
    }
}

/// Opens the configured blob store and starts serving it.
pub async fn spawn(config: StorageNodeConfig) -> Result<Server, Error> {
    match &config.storage {
        StorageBackend::Disk(root) => {
            let store = FsBlobStore::open(root).await?;
            tracing::info!(root = %store.root().display(), "opened blob store");
            let node = StorageNode::new(store, config.limits);
            Server::bind(&config.listen, node, config.timeouts, config.limits).await
        }
        StorageBackend::Memory => {
            let node = StorageNode::new(MemBlobStore::new(), config.limits);
            Server::bind(&config.listen, node, config.timeouts, config.limits).await
        }
    }
}

/// Best-effort failure reply, the connection may already be gone.
async fn report<T: AsyncWrite + Unpin>(stream: &mut T, err: &Error) {
    if let Err(write_err) = protocol::write_error(stream, err).await {
        tracing::debug!(%write_err, "could not report failure to peer");
    }
}
