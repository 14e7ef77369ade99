use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};

use super::BlobStore;
use crate::error::Error;
use crate::protocol::{self, validate_name};

const INCOMING_DIR: &str = ".incoming";

/// Blobs as files in a single directory.
///
/// Incoming blobs are written to a temporary file next to the store and
/// renamed into place once complete, so readers only ever open complete
/// files, and the last rename wins.
#[derive(Debug)]
pub struct FsBlobStore {
    root: PathBuf,
    incoming: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = root.into();
        let incoming = root.join(INCOMING_DIR);
        tokio::fs::create_dir_all(&incoming).await?;
        Ok(Self { root, incoming })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, name: &str) -> Result<PathBuf, Error> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait::async_trait]
impl BlobStore for FsBlobStore {
    type FetchRead = File;

    async fn store_blob(
        &self,
        name: &str,
        len: u64,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<(), Error> {
        let path = self.blob_path(name)?;

        // removed on drop unless persisted
        let incoming = self.incoming.clone();
        let (temp, std_file) = tokio::task::spawn_blocking(move || -> io::Result<_> {
            let temp = tempfile::Builder::new()
                .prefix("blob-")
                .tempfile_in(incoming)?;
            let file = temp.as_file().try_clone()?;
            Ok((temp, file))
        })
        .await
        .map_err(io::Error::from)??;
        let mut file = File::from_std(std_file);

        protocol::copy_exact(reader, &mut file, len).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        tokio::task::spawn_blocking(move || temp.persist(path))
            .await
            .map_err(io::Error::from)?
            .map_err(io::Error::from)?;
        tracing::debug!(%name, len, "blob stored");
        Ok(())
    }

    async fn fetch_blob(&self, name: &str) -> Result<(u64, File), Error> {
        let path = self.blob_path(name)?;
        let file = match File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(Error::NotFound(name.into()))
            }
            Err(err) => return Err(err.into()),
        };
        let metadata = file.metadata().await?;
        if !metadata.is_file() {
            return Err(Error::NotFound(name.into()));
        }
        Ok((metadata.len(), file))
    }
}
