use clap::Parser;
use eyre::Result as EyreResult;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use butterfly_relayer::{router, RelayerState};

#[derive(Debug, Parser)]
#[command(name = "butterfly-relayer", about = "Encrypted envelope relay for paired devices")]
struct Args {
    /// Address to listen on.
    #[arg(long, env = "BUTTERFLY_RELAYER_LISTEN", default_value = "127.0.0.1:8787")]
    listen: String,
}

#[tokio::main]
async fn main() -> EyreResult<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let listener = TcpListener::bind(&args.listen).await?;
    info!(listen = %args.listen, "relayer listening");

    axum::serve(listener, router(RelayerState::new())).await?;

    Ok(())
}
