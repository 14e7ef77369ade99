use tokio::io::AsyncRead;

use crate::error::Error;

pub mod fs_impl;
pub mod mem_impl;

pub use fs_impl::FsBlobStore;
pub use mem_impl::MemBlobStore;

/// A store of named blobs, shared by every connection of a storage node.
///
/// A blob only becomes visible once it was stored completely, and a later
/// completed store of the same name replaces it.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + 'static {
    type FetchRead: AsyncRead + Unpin + Send;

    /// Stores exactly `len` bytes read from `reader` under `name`.
    ///
    /// Fails without changing the stored blob if `reader` ends early.
    async fn store_blob(
        &self,
        name: &str,
        len: u64,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), Error>;

    /// Opens the blob stored under `name`, returning its length and contents.
    async fn fetch_blob(&self, name: &str) -> Result<(u64, Self::FetchRead), Error>;
}
