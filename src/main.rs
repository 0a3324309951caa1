//! JollyKV - An In-Memory Key-Value Server
//!
//! This is the main entry point for the JollyKV server.
//! It parses the configuration, sets up logging, and runs the server until Ctrl+C.

use clap::Parser;
use jollykv::{Config, Server};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

fn print_banner(config: &Config) {
    println!(
        r#"
JollyKV v{} - In-Memory Key-Value Server
──────────────────────────────────────────────────────────────
Server started on {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        jollykv::VERSION,
        config.bind_address()
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let server = Server::bind(config.clone()).await?;
    print_banner(&config);

    let summary = server.run_until_ctrl_c().await?;
    info!(
        peers_closed = summary.peers_closed,
        frames_dispatched = summary.frames_dispatched,
        "Goodbye"
    );

    Ok(())
}
