use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = signal_ledger_cli::Cli::parse();
    signal_ledger_cli::app_init().await?;
    signal_ledger_cli::run(cli).await
}
