use core::fmt;
use std::num::NonZeroUsize;

use bytes::Bytes;

use crate::chunker::{shard_name, ShardKey};
use crate::config::{Limits, Timeouts, Topology};
use crate::error::Error;
use crate::net;
use crate::protocol::{self, Frame};

/// One shard of a file, on its way to or from a storage node.
pub struct Chunk {
    pub file_name: String,
    pub shard: ShardKey,
    pub data: Bytes,
}

impl Chunk {
    /// The name the chunk is stored under on its storage node.
    pub fn name(&self) -> String {
        shard_name(self.shard, &self.file_name)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.data.len().min(64);
        let printed = String::from_utf8_lossy(&self.data[..len]);

        write!(
            f,
            "Chunk({}, {printed:?}{})",
            self.name(),
            if len < self.data.len() { "…" } else { "" }
        )
    }
}

/// Where the coordinator sends shards and fetches them back from.
#[async_trait::async_trait]
pub trait Backend: Send + Sync + 'static {
    fn shard_count(&self) -> NonZeroUsize;

    async fn store_chunk(&self, chunk: Chunk) -> Result<(), Error>;

    async fn fetch_chunk(&self, shard: ShardKey, file_name: &str) -> Result<Bytes, Error>;
}

/// Talks to one remote storage node per shard, one connection per exchange.
#[derive(Debug, Clone)]
pub struct TcpBackend {
    topology: Topology,
    timeouts: Timeouts,
    limits: Limits,
}

impl TcpBackend {
    pub fn new(topology: Topology, timeouts: Timeouts, limits: Limits) -> Self {
        Self {
            topology,
            timeouts,
            limits,
        }
    }

    fn endpoint(&self, shard: ShardKey) -> Result<&str, Error> {
        self.topology
            .endpoint(shard)
            .ok_or_else(|| Error::NotFound(format!("storage node for shard {shard}")))
    }
}

#[async_trait::async_trait]
impl Backend for TcpBackend {
    fn shard_count(&self) -> NonZeroUsize {
        self.topology.shard_count()
    }

    async fn store_chunk(&self, chunk: Chunk) -> Result<(), Error> {
        let addr = self.endpoint(chunk.shard)?;
        let name = chunk.name();

        let mut stream = net::connect(addr, self.timeouts.connect).await?;
        net::deadline(self.timeouts.io, async {
            protocol::write_store(&mut stream, &name, &chunk.data).await?;
            protocol::read_ack(&mut stream, &name).await
        })
        .await?;

        tracing::debug!(%addr, %name, len = chunk.data.len(), "stored chunk");
        Ok(())
    }

    async fn fetch_chunk(&self, shard: ShardKey, file_name: &str) -> Result<Bytes, Error> {
        let addr = self.endpoint(shard)?;
        let name = shard_name(shard, file_name);

        let mut stream = net::connect(addr, self.timeouts.connect).await?;
        let data = net::deadline(self.timeouts.io, async {
            Frame::Fetch { name: name.clone() }.write(&mut stream).await?;
            protocol::read_payload(&mut stream, &name, self.limits.max_payload).await
        })
        .await?;

        tracing::debug!(%addr, %name, len = data.len(), "fetched chunk");
        Ok(data)
    }
}
