use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use kestrel_dns::{setup_logging, Args, DnsServer, ModuleEnv};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    setup_logging()?;

    let cfg = args.into_config();
    let env = Arc::new(ModuleEnv::new(cfg).context("failed to build the resolver environment")?);

    let server = DnsServer::new_with_workers(env)
        .await
        .context("failed to instantiate the DNS server")?;

    server.block_until_completion().await
}
