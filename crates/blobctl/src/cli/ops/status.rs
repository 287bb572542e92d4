use std::convert::Infallible;

use clap::Args;

#[derive(Args, Debug, Clone)]
pub struct Status;

#[async_trait::async_trait]
impl crate::cli::op::Op for Status {
    type Error = Infallible;
    type Output = String;

    async fn execute(&self, ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let folders = ctx.manager.folder_status();
        if folders.is_empty() {
            return Ok("No storage folders configured".to_string());
        }

        let mut output = format!(
            "{:<40} {:>14} {:>14} {:>14} {:>14}",
            "PATH", "SIZE", "ZOMBIES", "MAXIMUM", "FREE"
        );
        for folder in folders {
            output.push_str(&format!(
                "\n{:<40} {:>14} {:>14} {:>14} {:>14}",
                folder.path.display(),
                folder.current_size,
                folder.zombies_size,
                folder.maximum_size,
                folder.maximum_size.saturating_sub(folder.current_size),
            ));
        }
        Ok(output)
    }
}
