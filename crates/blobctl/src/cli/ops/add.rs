use std::path::{Path, PathBuf};

use blob_store::{BlobStoreError, Digest, DigestAlgorithm, DigestParseError, Sha256Prefix};
use clap::Args;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

#[derive(Args, Debug, Clone)]
pub struct Add {
    /// File to store
    pub file: PathBuf,

    /// Declared digest as 32 hex characters (defaults to the first 16 bytes
    /// of the file's SHA-256)
    #[arg(long)]
    pub digest: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AddError {
    #[error("Blob store error: {0}")]
    Store(#[from] BlobStoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Digest(#[from] DigestParseError),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Add {
    type Error = AddError;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let digest = match &self.digest {
            Some(hex) => hex.parse::<Digest>()?,
            None => sha256_prefix(&self.file).await?,
        };

        let file = tokio::fs::File::open(&self.file).await?;
        let length = file.metadata().await?.len();

        let known: Vec<_> = ctx
            .manager
            .snapshot()
            .folders
            .into_iter()
            .flat_map(|folder| folder.blobs)
            .map(|blob| blob.id)
            .collect();

        let cancel = CancellationToken::new();
        let on_interrupt = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            }
        });
        let result = ctx.manager.add_blob(file, length, digest, &cancel).await;
        on_interrupt.abort();
        let id = result?;

        if known.contains(&id) {
            Ok(format!("{} (deduplicated)", id))
        } else {
            Ok(format!("{}", id))
        }
    }
}

async fn sha256_prefix(path: &Path) -> Result<Digest, AddError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256Prefix.start();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finish())
}
