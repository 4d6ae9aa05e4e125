//! candictl
//!
//! Bootstrap, converge and destroy Deckhouse clusters.

use clap::Parser;
use tracing::error;

use candictl_cli::{Cli, Error, Result};
use candictl_common::logging::{init_logging, LogConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(&LogConfig::from_env(cli.global.logger_type))
        .map_err(|e| Error::command_failed(e.to_string()))?;

    cli.run().await.inspect_err(|e| error!("{}", e))
}
