//! meridian-mcp entry point.

use anyhow::Result;
use clap::Parser;
use meridian_logging::{init_logging, LogConfig};
use meridian_mcp::{Config, McpServer, ServerContext};

#[derive(Parser, Debug)]
#[command(name = "meridian-mcp", version, about = "Meridian MCP server suite")]
struct Cli {
    /// Log level (error|warn|info|debug); RUST_LOG wins when set.
    #[arg(long, env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Disable the rolling log file under the Meridian home directory.
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(LogConfig {
        app_name: "meridian-mcp",
        level: cli.log_level.as_deref(),
        file: !cli.no_log_file,
    })?;

    let config = Config::from_env();
    let ctx = ServerContext::new(config).await?;

    // Registry construction is where duplicate tool names fail startup.
    let server = McpServer::new(ctx)?;
    server.run().await
}
