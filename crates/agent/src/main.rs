#![forbid(unsafe_code)]

mod cli;
mod startup;

use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::parse();

    if cli.version {
        println!("flowgate-agent {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    startup::run(&cli).await
}
