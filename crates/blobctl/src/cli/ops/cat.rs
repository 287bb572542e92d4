use blob_store::BlobStoreError;
use clap::Args;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Args, Debug, Clone)]
pub struct Cat {
    /// Blob identifier, as printed by `add`
    pub id: Uuid,
}

#[derive(Debug, thiserror::Error)]
pub enum CatError {
    #[error("Blob store error: {0}")]
    Store(#[from] BlobStoreError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Cat {
    type Error = CatError;
    /// Content goes straight to stdout
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let lock = ctx.manager.lock(self.id).await?;
        let content = lock.read_content().await?;
        drop(lock);

        let mut stdout = tokio::io::stdout();
        stdout.write_all(&content).await?;
        stdout.flush().await?;
        Ok(String::new())
    }
}
