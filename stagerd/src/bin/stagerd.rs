use anyhow::Context;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "stagerd",
    version,
    about = "Unattended batch file staging daemon",
    long_about = "`stagerd` moves batches of files from local stream directories to remote \
sites over rsync, ftp or gridftp, with a durable control/receipt/thank-you handshake for \
delivery confirmation, integrity verification and retry, plus a disk-pressure governor that \
throttles or evicts low-priority work when a filesystem runs short of space.

Configuration lives in a directory holding `global.json` and one `<stream>.json` per stream."
)]
struct Args {
    /// Directory holding `global.json` and one `<stream>.json` per stream
    #[arg(short = 'c', long, value_name = "DIR")]
    config_dir: std::path::PathBuf,

    /// Process every stream once, then exit
    #[arg(long)]
    oneoff: bool,

    /// Verbose level: -v INFO / -vv DEBUG / -vvv TRACE (default: WARN)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode, only report errors
    #[arg(short = 'q', long = "quiet", conflicts_with = "verbose")]
    quiet: bool,
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    let supervisor = stagerd::supervisor::Supervisor::new(&args.config_dir, args.oneoff)
        .with_context(|| format!("failed loading configuration from {:?}", args.config_dir))?;
    supervisor.run().await
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed building the async runtime")?;
    runtime.block_on(async_main(args))
}
