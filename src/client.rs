use std::io;
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::config::Timeouts;
use crate::error::Error;
use crate::net;
use crate::protocol::{self, validate_name, Frame, ProtocolError};

/// Uploads and downloads whole files through a coordinator, one connection
/// per request.
#[derive(Debug, Clone)]
pub struct Client {
    addr: String,
    timeouts: Timeouts,
}

impl Client {
    pub fn new(addr: impl Into<String>, timeouts: Timeouts) -> Self {
        Self {
            addr: addr.into(),
            timeouts,
        }
    }

    /// Uploads the file at `path` under its file name, returning its size.
    pub async fn upload(&self, path: impl AsRef<Path>) -> Result<u64, Error> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| ProtocolError::InvalidName(path.display().to_string()))?;

        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        self.upload_from(name, len, file).await?;
        Ok(len)
    }

    /// Uploads exactly `len` bytes from `reader` as `name`. Only returns once
    /// the coordinator confirmed every shard was stored.
    pub async fn upload_from<R>(&self, name: &str, len: u64, mut reader: R) -> Result<(), Error>
    where
        R: AsyncRead + Unpin + Send,
    {
        validate_name(name)?;
        protocol::wire_len(len)?;
        let mut stream = net::connect(&self.addr, self.timeouts.connect).await?;
        net::deadline(self.timeouts.io, async {
            let sent = async {
                Frame::Store {
                    name: name.into(),
                    len,
                }
                .write(&mut stream)
                .await?;
                protocol::copy_exact(&mut reader, &mut stream, len).await?;
                stream.flush().await?;
                Ok::<_, Error>(())
            }
            .await;

            if let Err(err) = sent {
                // the coordinator may have refused the upload and hung up, its
                // reason says more than the failed write
                let hung_up = matches!(
                    &err,
                    Error::Io(io_err) if matches!(
                        io_err.kind(),
                        io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
                    )
                );
                if hung_up {
                    if let Err(refused @ Error::Remote { .. }) =
                        protocol::read_ack(&mut stream, name).await
                    {
                        return Err(refused);
                    }
                }
                return Err(err);
            }
            protocol::read_ack(&mut stream, name).await
        })
        .await?;

        tracing::debug!(%name, len, "uploaded");
        Ok(())
    }

    /// Downloads `name` into a file at `dest`, returning its size.
    ///
    /// The contents go to a temporary file next to `dest` first, so a failed
    /// download never leaves a partial file behind.
    pub async fn download(&self, name: &str, dest: impl AsRef<Path>) -> Result<u64, Error> {
        let dest = dest.as_ref();
        let dir = match dest.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };

        let dir = dir.to_owned();
        let (temp, std_file) = tokio::task::spawn_blocking(move || -> io::Result<_> {
            let temp = tempfile::Builder::new()
                .prefix(".shardfs-")
                .tempfile_in(dir)?;
            let file = temp.as_file().try_clone()?;
            Ok((temp, file))
        })
        .await
        .map_err(io::Error::from)??;

        let mut file = File::from_std(std_file);
        let len = self.download_to(name, &mut file).await?;
        file.sync_all().await?;
        drop(file);

        let dest = dest.to_owned();
        tokio::task::spawn_blocking(move || temp.persist(dest))
            .await
            .map_err(io::Error::from)?
            .map_err(io::Error::from)?;
        Ok(len)
    }

    /// Streams the contents of `name` into `writer`, returning their size.
    pub async fn download_to<W>(&self, name: &str, writer: &mut W) -> Result<u64, Error>
    where
        W: AsyncWrite + Unpin + Send,
    {
        validate_name(name)?;
        let mut stream = net::connect(&self.addr, self.timeouts.connect).await?;
        let len = net::deadline(self.timeouts.io, async {
            Frame::Fetch { name: name.into() }.write(&mut stream).await?;
            let len = protocol::read_payload_len(&mut stream, name, u64::MAX).await?;
            protocol::copy_exact(&mut stream, &mut *writer, len).await?;
            writer.flush().await?;
            Ok(len)
        })
        .await?;

        tracing::debug!(%name, len, "downloaded");
        Ok(len)
    }
}
