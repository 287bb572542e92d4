mod cli;
mod state;

use clap::{Parser, Subcommand};
use cli::{args::Args, op::Op, Add, Cat, Status};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::state::ServiceConfig;

command_enum! {
    (Add, Add),
    (Cat, Cat),
    (Status, Status),
}

/// Log to stderr so stdout only carries command output.
fn init_logging(config: &ServiceConfig) -> Result<(), state::StateError> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(config.log_level()?.into())
        .from_env_lossy();

    let stderr_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    tracing_subscriber::registry().with(stderr_layer).init();
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match ServiceConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    let ctx = match cli::op::OpContext::open(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Error: Failed to open blob store: {}", e);
            std::process::exit(1);
        }
    };

    let result = args.command.execute(&ctx).await;
    let closed = ctx.close().await;

    match result {
        Ok(output) => {
            let output = output.to_string();
            if !output.is_empty() {
                println!("{}", output);
            }
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
    if let Err(e) = closed {
        eprintln!("Error: Failed to save blob store state: {}", e);
        std::process::exit(1);
    }
}
