use bytes::Bytes;
use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::backend::{Backend, TcpBackend};
use crate::chunker::{self, ShardKey};
use crate::config::{CoordinatorConfig, Limits};
use crate::error::{Error, FanoutError};
use crate::net::{Server, Service};
use crate::protocol::{self, validate_name, Frame, Kind};

/// Splits uploaded files into one shard per storage node, and reassembles
/// them on download.
///
/// The coordinator keeps no state of its own. A request only succeeds once
/// every shard operation it fanned out to has succeeded.
#[derive(Debug)]
pub struct Coordinator<B> {
    backend: B,
    limits: Limits,
}

impl<B: Backend> Coordinator<B> {
    pub fn new(backend: B, limits: Limits) -> Self {
        Self { backend, limits }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Stores one shard of `contents` on every storage node.
    ///
    /// A failed upload is not rolled back. The shards that did get stored
    /// replace the previous version's, so until an upload of the same name
    /// succeeds, a download may fail or, if both versions have the same size,
    /// return a mix of old and new shards. Retry a failed upload before
    /// reading the file again.
    pub async fn upload(&self, file_name: &str, contents: Bytes) -> Result<(), Error> {
        validate_name(file_name)?;
        let len = contents.len();
        let chunks = chunker::split(file_name, contents, self.backend.shard_count());

        let stores = chunks.into_iter().map(|chunk| async move {
            let shard = chunk.shard;
            (shard, self.backend.store_chunk(chunk).await)
        });
        gather(Kind::Store, file_name, join_all(stores).await)?;

        tracing::info!(%file_name, len, "upload complete");
        Ok(())
    }

    pub async fn download(&self, file_name: &str) -> Result<Bytes, Error> {
        validate_name(file_name)?;

        // `join_all` keeps shard order no matter which fetch finishes first
        let fetches = ShardKey::all(self.backend.shard_count()).map(|shard| async move {
            (shard, self.backend.fetch_chunk(shard, file_name).await)
        });
        let parts = gather(Kind::Fetch, file_name, join_all(fetches).await)?;
        let contents = chunker::assemble(parts)?;

        tracing::info!(%file_name, len = contents.len(), "download complete");
        Ok(contents)
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
        // before buffering a payload that would only be thrown away
        if let Err(err) = validate_name(frame.name()) {
            let err = Error::from(err);
            protocol::reject(stream, &err, Some(frame.payload_len())).await;
            return Err(err);
        }

        let result = match frame {
            Frame::Store { name, len } => match protocol::read_exact_payload(stream, len).await {
                Ok(contents) => self.upload(&name, contents).await,
                Err(err) => Err(err),
            },
            Frame::Fetch { name } => match self.download(&name).await {
                Ok(contents) => return protocol::write_payload(stream, &contents).await,
                Err(err) => Err(err),
            },
        };

        match result {
            Ok(()) => protocol::write_ok(stream).await,
            Err(err) => {
                report(stream, &err).await;
                Err(err)
            }
        }
    }
}

#[async_trait::async_trait]
impl<B: Backend> Service for Coordinator<B> {
    const ROLE: &'static str = "coordinator";

    async fn handle(&self, stream: &mut TcpStream) -> Result<(), Error> {
        Coordinator::handle(self, stream).await
    }
}

/// Starts a coordinator talking to the storage nodes of `config.topology`.
pub async fn spawn(config: CoordinatorConfig) -> Result<Server, Error> {
    tracing::info!(nodes = ?config.topology.endpoints(), "using storage nodes");
    let backend = TcpBackend::new(config.topology, config.timeouts, config.limits);
    let coordinator = Coordinator::new(backend, config.limits);
    Server::bind(&config.listen, coordinator, config.timeouts, config.limits).await
}

/// Splits per-shard results, in shard order, into the successful values or a
/// [`FanoutError`] listing every failed shard.
fn gather<T>(
    op: Kind,
    file_name: &str,
    results: Vec<(ShardKey, Result<T, Error>)>,
) -> Result<Vec<T>, Error> {
    let total = results.len();
    let mut values = Vec::with_capacity(total);
    let mut failures = vec![];
    for (shard, result) in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) => failures.push((shard, err)),
        }
    }

    if failures.is_empty() {
        return Ok(values);
    }
    Err(FanoutError {
        op,
        file_name: file_name.into(),
        total,
        failures,
    }
    .into())
}

async fn report<T: AsyncWrite + Unpin>(stream: &mut T, err: &Error) {
    if let Err(write_err) = protocol::write_error(stream, err).await {
        tracing::debug!(%write_err, "could not report failure to peer");
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::num::NonZeroUsize;
    use std::sync::Arc;
    use std::time::Duration;

    use parking_lot::Mutex;

    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::backend::Chunk;
    use crate::blobstore::MemBlobStore;
    use crate::chunker::shard_name;
    use crate::config::{Timeouts, Topology};
    use crate::protocol::Status;
    use crate::storage_node::StorageNode;

    /// Storage nodes as in-memory maps, with knobs for unreachable nodes and
    /// per-shard latency.
    #[derive(Default)]
    struct FakeBackend {
        nodes: Vec<Mutex<HashMap<String, Bytes>>>,
        down: Mutex<HashSet<u32>>,
        delays: HashMap<u32, Duration>,
        completed: Mutex<Vec<u32>>,
    }

    impl FakeBackend {
        fn new(shard_count: usize) -> Self {
            Self {
                nodes: (0..shard_count).map(|_| Default::default()).collect(),
                ..Default::default()
            }
        }

        fn with_delays(mut self, delays: &[(u32, u64)]) -> Self {
            self.delays = delays
                .iter()
                .map(|&(shard, millis)| (shard, Duration::from_millis(millis)))
                .collect();
            self
        }

        fn set_down(&self, shard: u32, down: bool) {
            let mut nodes = self.down.lock();
            if down {
                nodes.insert(shard);
            } else {
                nodes.remove(&shard);
            }
        }

        fn chunk(&self, shard: u32, name: &str) -> Option<Bytes> {
            self.nodes[shard as usize - 1].lock().get(name).cloned()
        }

        async fn reach(&self, shard: ShardKey) -> Result<(), Error> {
            if let Some(delay) = self.delays.get(&shard.get()) {
                tokio::time::sleep(*delay).await;
            }
            if self.down.lock().contains(&shard.get()) {
                return Err(Error::Unreachable {
                    addr: format!("node-{shard}"),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                });
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl Backend for FakeBackend {
        fn shard_count(&self) -> NonZeroUsize {
            NonZeroUsize::new(self.nodes.len()).unwrap()
        }

        async fn store_chunk(&self, chunk: Chunk) -> Result<(), Error> {
            self.reach(chunk.shard).await?;
            self.nodes[chunk.shard.index()]
                .lock()
                .insert(chunk.name(), chunk.data);
            self.completed.lock().push(chunk.shard.get());
            Ok(())
        }

        async fn fetch_chunk(&self, shard: ShardKey, file_name: &str) -> Result<Bytes, Error> {
            self.reach(shard).await?;
            let name = shard_name(shard, file_name);
            let data = self.nodes[shard.index()]
                .lock()
                .get(&name)
                .cloned()
                .ok_or(Error::NotFound(name))?;
            self.completed.lock().push(shard.get());
            Ok(data)
        }
    }

    fn coordinator(backend: FakeBackend) -> Coordinator<FakeBackend> {
        Coordinator::new(backend, Limits::default())
    }

    #[tokio::test]
    async fn test_demo_upload_and_download() {
        let coordinator = coordinator(FakeBackend::new(4));
        coordinator
            .upload("demo.txt", Bytes::from_static(b"ABCDEFGHIJ"))
            .await
            .unwrap();

        let backend = coordinator.backend();
        assert_eq!(backend.chunk(1, "ch1-demo.txt").unwrap(), &b"AB"[..]);
        assert_eq!(backend.chunk(2, "ch2-demo.txt").unwrap(), &b"CD"[..]);
        assert_eq!(backend.chunk(3, "ch3-demo.txt").unwrap(), &b"EF"[..]);
        assert_eq!(backend.chunk(4, "ch4-demo.txt").unwrap(), &b"GHIJ"[..]);

        let contents = coordinator.download("demo.txt").await.unwrap();
        assert_eq!(&contents[..], b"ABCDEFGHIJ");
    }

    #[tokio::test]
    async fn test_empty_file() {
        let coordinator = coordinator(FakeBackend::new(4));
        coordinator.upload("empty", Bytes::new()).await.unwrap();

        for shard in 1..=4 {
            let name = format!("ch{shard}-empty");
            assert!(coordinator.backend().chunk(shard, &name).unwrap().is_empty());
        }
        assert!(coordinator.download("empty").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_assembly_ignores_completion_order() {
        let backend = FakeBackend::new(4).with_delays(&[(1, 40), (2, 30), (3, 20), (4, 10)]);
        let coordinator = coordinator(backend);
        coordinator
            .upload("demo.txt", Bytes::from_static(b"ABCDEFGHIJ"))
            .await
            .unwrap();
        assert_eq!(*coordinator.backend().completed.lock(), [4, 3, 2, 1]);
        coordinator.backend().completed.lock().clear();

        let contents = coordinator.download("demo.txt").await.unwrap();
        assert_eq!(*coordinator.backend().completed.lock(), [4, 3, 2, 1]);
        assert_eq!(&contents[..], b"ABCDEFGHIJ");
    }

    #[tokio::test]
    async fn test_one_unreachable_node_fails_the_upload() {
        let coordinator = coordinator(FakeBackend::new(4));
        coordinator.backend().set_down(3, true);

        let err = coordinator
            .upload("demo.txt", Bytes::from_static(b"ABCDEFGHIJ"))
            .await
            .unwrap_err();
        let Error::Fanout(fanout) = &err else {
            panic!("unexpected error {err:?}");
        };
        assert!(fanout.is_partial());
        assert_eq!(fanout.failures.len(), 1);
        assert_eq!(fanout.failures[0].0.get(), 3);
        assert_eq!(err.status(), Status::Incomplete);

        // the other shards did go out, so the file must not be downloadable
        coordinator.backend().set_down(3, false);
        let err = coordinator.download("demo.txt").await.unwrap_err();
        assert_eq!(err.status(), Status::Incomplete);
    }

    #[tokio::test]
    async fn test_download_of_unknown_file_is_not_found() {
        let coordinator = coordinator(FakeBackend::new(4));
        let err = coordinator.download("missing.txt").await.unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
    }

    #[tokio::test]
    async fn test_download_fails_if_any_node_is_down() {
        let coordinator = coordinator(FakeBackend::new(4));
        coordinator
            .upload("demo.txt", Bytes::from_static(b"ABCDEFGHIJ"))
            .await
            .unwrap();

        coordinator.backend().set_down(1, true);
        let err = coordinator.download("demo.txt").await.unwrap_err();
        assert_eq!(err.status(), Status::Incomplete);
        assert!(err.to_string().contains("shard 1"));
    }

    #[tokio::test]
    async fn test_overwrite() {
        let coordinator = coordinator(FakeBackend::new(4));
        coordinator
            .upload("demo.txt", Bytes::from_static(b"ABCDEFGHIJ"))
            .await
            .unwrap();
        coordinator
            .upload("demo.txt", Bytes::from_static(b"0123456789abcdef"))
            .await
            .unwrap();

        let contents = coordinator.download("demo.txt").await.unwrap();
        assert_eq!(&contents[..], b"0123456789abcdef");
    }

    #[tokio::test]
    async fn test_files_sharing_a_prefix_stay_apart() {
        let coordinator = coordinator(FakeBackend::new(4));
        coordinator
            .upload("x", Bytes::from_static(b"plain file"))
            .await
            .unwrap();
        coordinator
            .upload("ch2-x", Bytes::from_static(b"file named like a shard"))
            .await
            .unwrap();
        coordinator
            .upload("1-x", Bytes::from_static(b"another one"))
            .await
            .unwrap();

        assert_eq!(&coordinator.download("x").await.unwrap()[..], b"plain file");
        assert_eq!(
            &coordinator.download("ch2-x").await.unwrap()[..],
            b"file named like a shard"
        );
        assert_eq!(&coordinator.download("1-x").await.unwrap()[..], b"another one");
    }

    #[tokio::test]
    async fn test_invalid_file_names_are_rejected() {
        let coordinator = coordinator(FakeBackend::new(4));
        let err = coordinator
            .upload("../etc/passwd", Bytes::from_static(b"x"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::Protocol);
        assert!(coordinator.backend().completed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_handle_reports_over_the_connection() {
        let coordinator = Arc::new(coordinator(FakeBackend::new(4)));
        let (mut client, mut server) = tokio::io::duplex(1024);

        let handler = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.handle(&mut server).await })
        };
        protocol::write_store(&mut client, "demo.txt", b"ABCDEFGHIJ")
            .await
            .unwrap();
        protocol::read_ack(&mut client, "demo.txt").await.unwrap();
        handler.await.unwrap().unwrap();

        let (mut client, mut server) = tokio::io::duplex(1024);
        let handler = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.handle(&mut server).await })
        };
        Frame::Fetch {
            name: "nope.txt".into(),
        }
        .write(&mut client)
        .await
        .unwrap();
        let err = protocol::read_payload(&mut client, "nope.txt", u64::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(name) if name == "nope.txt"));
        assert!(handler.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_invalid_name_is_rejected_before_buffering() {
        let coordinator = Arc::new(coordinator(FakeBackend::new(4)));
        let (mut client, mut server) = tokio::io::duplex(1024);
        let handler = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move { coordinator.handle(&mut server).await })
        };

        protocol::write_store(&mut client, "../escape", &[7; 64 * 1024])
            .await
            .unwrap();
        let err = protocol::read_ack(&mut client, "../escape")
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::Protocol);
        assert!(handler.await.unwrap().is_err());
        assert!(coordinator.backend().completed.lock().is_empty());
    }

    /// A storage node that accepts connections and never answers.
    async fn silent_node() -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let task = tokio::spawn(async move {
            let mut held = vec![];
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        (addr, task)
    }

    fn short_timeouts() -> Timeouts {
        Timeouts {
            connect: Duration::from_secs(5),
            io: Duration::from_millis(200),
            connection: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn test_hanging_nodes_time_out() {
        let mut addrs = vec![];
        let mut silent = vec![];
        for _ in 0..4 {
            let (addr, task) = silent_node().await;
            addrs.push(addr);
            silent.push(task);
        }
        let backend = TcpBackend::new(
            Topology::new(addrs).unwrap(),
            short_timeouts(),
            Limits::default(),
        );
        let coordinator = Coordinator::new(backend, Limits::default());

        let err = coordinator
            .upload("demo.txt", Bytes::from_static(b"ABCDEFGHIJ"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::Timeout);

        let err = coordinator.download("demo.txt").await.unwrap_err();
        assert_eq!(err.status(), Status::Timeout);

        for task in silent {
            task.abort();
        }
    }

    #[tokio::test]
    async fn test_one_hanging_node_is_incomplete() {
        let mut nodes = vec![];
        let mut addrs = vec![];
        for _ in 0..3 {
            let node = StorageNode::new(MemBlobStore::new(), Limits::default());
            let server = Server::bind("127.0.0.1:0", node, short_timeouts(), Limits::default())
                .await
                .unwrap();
            addrs.push(server.local_addr().to_string());
            nodes.push(server);
        }
        let (silent_addr, silent) = silent_node().await;
        addrs.insert(1, silent_addr);

        let backend = TcpBackend::new(
            Topology::new(addrs).unwrap(),
            short_timeouts(),
            Limits::default(),
        );
        let coordinator = Coordinator::new(backend, Limits::default());

        let err = coordinator
            .upload("demo.txt", Bytes::from_static(b"ABCDEFGHIJ"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Status::Incomplete);
        let Error::Fanout(fanout) = &err else {
            panic!("unexpected error {err:?}");
        };
        assert!(matches!(
            fanout.failures.as_slice(),
            [(shard, Error::Timeout(_))] if shard.get() == 2
        ));

        silent.abort();
        for node in nodes {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_other_shard_counts() {
        let coordinator = coordinator(FakeBackend::new(3));
        coordinator
            .upload("demo.txt", Bytes::from_static(b"ABCDEFGHIJ"))
            .await
            .unwrap();
        assert_eq!(
            coordinator.backend().chunk(3, "ch3-demo.txt").unwrap(),
            &b"GHIJ"[..]
        );
        assert_eq!(
            &coordinator.download("demo.txt").await.unwrap()[..],
            b"ABCDEFGHIJ"
        );
    }
}
