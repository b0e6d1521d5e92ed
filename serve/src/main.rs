//! botweave server binary: load config, build the runtime, serve HTTP.

use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "botweave-serve")]
#[command(about = "botweave — multi-tenant chat-bot runtime")]
struct Args {
    /// Listen address (overrides LISTEN_ADDR)
    #[arg(short, long, value_name = "ADDR")]
    addr: Option<String>,

    /// Directory to read .env from (default: current directory)
    #[arg(long, value_name = "DIR")]
    env_dir: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    config::load_and_apply("botweave", args.env_dir.as_deref())?;
    let settings = config::Settings::from_env()?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let addr = args
        .addr
        .clone()
        .unwrap_or_else(|| settings.listen_addr.clone());
    let runtime = botweave::Runtime::connect(settings).await?;

    serve::run_serve(runtime, Some(&addr))
        .await
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(())
}
