use core::fmt;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::AsyncRead;

use super::BlobStore;
use crate::error::Error;
use crate::protocol::{self, validate_name};

/// Blobs in a shared in-memory map. Clones share the same blobs.
#[derive(Clone, Default)]
pub struct MemBlobStore {
    blobs: Arc<RwLock<HashMap<String, Bytes>>>,
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Bytes> {
        self.blobs.read().get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.blobs.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for MemBlobStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let blobs = self.blobs.read();
        let mut names: Vec<_> = blobs.iter().map(|(name, blob)| (name, blob.len())).collect();
        names.sort();
        f.debug_map().entries(names).finish()
    }
}

#[async_trait::async_trait]
impl BlobStore for MemBlobStore {
    type FetchRead = Cursor<Bytes>;

    async fn store_blob(
        &self,
        name: &str,
        len: u64,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), Error> {
        validate_name(name)?;
        let blob = protocol::read_exact_payload(reader, len).await?;
        self.blobs.write().insert(name.into(), blob);
        Ok(())
    }

    async fn fetch_blob(&self, name: &str) -> Result<(u64, Cursor<Bytes>), Error> {
        let blob = self.get(name).ok_or_else(|| Error::NotFound(name.into()))?;
        Ok((blob.len() as u64, Cursor::new(blob)))
    }
}
