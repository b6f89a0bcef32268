use crate::config::BodyFileMode;
use crate::error::ProxyError;
use bytes::{Bytes, BytesMut};
use std::path::PathBuf;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// A fully read client request body: small bodies stay in memory, larger
/// ones live in a spill file under the configured temp directory.
#[derive(Debug)]
pub enum ClientBody {
    Memory(Bytes),
    File { path: PathBuf, len: u64 },
}

impl ClientBody {
    pub fn len(&self) -> u64 {
        match self {
            ClientBody::Memory(b) => b.len() as u64,
            ClientBody::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load the body bytes for forwarding. Spilled bodies are re-read from
    /// disk on every upstream attempt so retries replay the same content.
    pub async fn to_bytes(&self) -> std::io::Result<Bytes> {
        match self {
            ClientBody::Memory(b) => Ok(b.clone()),
            ClientBody::File { path, .. } => {
                Ok(Bytes::from(tokio::fs::read(path).await?))
            }
        }
    }
}

/// Read options derived from the governing location.
pub struct BodyReadOptions {
    pub content_length: u64,
    pub max_body_size: u64,
    pub buffer_size: usize,
    pub file_mode: BodyFileMode,
    pub temp_dir: PathBuf,
}

/// Read `content_length` body bytes, spilling to a temp file once the
/// in-memory ceiling is crossed (or immediately when `file_mode` forces it).
///
/// `prefix` holds body bytes that arrived with the request head.
pub async fn read_client_body<R: AsyncRead + Unpin>(
    reader: &mut R,
    prefix: &mut BytesMut,
    opts: &BodyReadOptions,
) -> Result<ClientBody, ProxyError> {
    if opts.max_body_size > 0 && opts.content_length > opts.max_body_size {
        return Err(ProxyError::ClientTooLarge);
    }

    let spill_everything = opts.file_mode != BodyFileMode::Off;
    let total = opts.content_length as usize;

    if !spill_everything && total <= opts.buffer_size {
        let mut buf = BytesMut::with_capacity(total);
        let take = prefix.len().min(total);
        buf.extend_from_slice(&prefix.split_to(take));
        while buf.len() < total {
            let n = reader
                .read_buf(&mut buf)
                .await
                .map_err(|_| ProxyError::ClientGone)?;
            if n == 0 {
                return Err(ProxyError::ClientBad("truncated request body".into()));
            }
        }
        return Ok(ClientBody::Memory(buf.freeze()));
    }

    // Spill path.
    tokio::fs::create_dir_all(&opts.temp_dir)
        .await
        .map_err(ProxyError::CacheIo)?;
    let path = opts.temp_dir.join(format!(
        "body-{:08x}{:08x}",
        rand::random::<u32>(),
        rand::random::<u32>()
    ));
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(ProxyError::CacheIo)?;

    let mut written = 0usize;
    let take = prefix.len().min(total);
    if take > 0 {
        let chunk = prefix.split_to(take);
        file.write_all(&chunk).await.map_err(ProxyError::CacheIo)?;
        written += take;
    }
    let mut buf = BytesMut::with_capacity(opts.buffer_size.max(4096));
    while written < total {
        buf.clear();
        let n = reader
            .read_buf(&mut buf)
            .await
            .map_err(|_| ProxyError::ClientGone)?;
        if n == 0 {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(ProxyError::ClientBad("truncated request body".into()));
        }
        let want = (total - written).min(n);
        file.write_all(&buf[..want])
            .await
            .map_err(ProxyError::CacheIo)?;
        written += want;
    }
    file.flush().await.map_err(ProxyError::CacheIo)?;

    Ok(ClientBody::File {
        path,
        len: total as u64,
    })
}
