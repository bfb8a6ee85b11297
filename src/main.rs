//! NZBGet completion checker extension
//!
//! NZBGet launches this binary as a scan, queue, scheduler or button
//! extension and reads its stdout; diagnostics therefore go to stderr via
//! `tracing` so stdout stays clean for the host protocol.

use nzbget_completion::{Config, HostClient, Result, router};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            println!("[ERROR] {e}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    let config = Config::from_env()?;
    let client = HostClient::new(&config.host)?;
    router::run(&config, &client).await
}
