//! Entrypoint of the tsinsert binary

use dotenvy::dotenv;
use tracing::info;

mod commands {
    pub(crate) mod generate;
    pub(crate) mod sink;
}

enum ReturnCode {
    Failure = 1,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "tsinsert",
    version = env!("CARGO_PKG_VERSION"),
    about = "Time series insert router and storage node emulator",
    long_about = r#"Time series insert router and storage node emulator

Examples:
    # Emulate a storage node on the default insert port
    tsinsert sink --bind 127.0.0.1:8400

    # Push one million synthetic rows to two replicated storage nodes
    tsinsert generate --storage-node 127.0.0.1:8400,127.0.0.1:8401 --replication-factor 2

    # Spread rows over two groups of nodes with debug logging
    LOG_FILTER=debug tsinsert generate --storage-node az1/10.0.0.1,az1/10.0.0.2,az2/10.0.1.1
"#
)]
struct Config {
    #[clap(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, clap::Parser)]
#[allow(clippy::large_enum_variant)]
enum Command {
    /// Route synthetic rows to storage nodes
    Generate(commands::generate::Config),

    /// Accept rows like a storage node and count them
    Sink(commands::sink::Config),
}

fn main() -> Result<(), std::io::Error> {
    // load all environment variables from .env before doing anything
    load_dotenv();

    let config: Config = clap::Parser::parse();

    // The router runs on its own threads; the runtime only waits for signals
    // and timers.
    let tokio_runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    tokio_runtime.block_on(async move {
        fn handle_init_logs(r: Result<(), trogging::Error>) {
            if let Err(e) = r {
                eprintln!("Initializing logs failed: {e}");
                std::process::exit(ReturnCode::Failure as _);
            }
        }

        match config.command {
            None => println!("command required, -h/--help for help"),
            Some(Command::Generate(config)) => {
                handle_init_logs(init_logs(&config.logging_config));
                if let Err(e) = commands::generate::command(config).await {
                    eprintln!("Generate command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
            Some(Command::Sink(config)) => {
                handle_init_logs(init_logs(&config.logging_config));
                if let Err(e) = commands::sink::command(config).await {
                    eprintln!("Sink command failed: {e:#}");
                    std::process::exit(ReturnCode::Failure as _)
                }
            }
        }
    });

    Ok(())
}

/// Source the .env file before initialising the Config struct - this sets
/// any envs in the file, which the Config struct then uses.
///
/// Precedence is given to existing env variables.
fn load_dotenv() {
    match dotenv() {
        Ok(_) => {}
        Err(dotenvy::Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            // Ignore this - a missing env file is not an error, defaults will
            // be applied when initialising the Config struct.
        }
        Err(e) => {
            eprintln!("FATAL Error loading config from: {e}");
            eprintln!("Aborting");
            std::process::exit(1);
        }
    };
}

fn init_logs(config: &trogging::cli::LoggingConfig) -> Result<(), trogging::Error> {
    use trogging::cli::LoggingConfigBuilderExt;

    trogging::Builder::new()
        .with_default_log_filter("info")
        .with_logging_config(config)
        .install_global()
}

/// Wait for a `SIGTERM` or `SIGINT` to stop the process on UNIX systems
#[cfg(unix)]
pub(crate) async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut int = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = term.recv() => info!("Received SIGTERM"),
        _ = int.recv() => info!("Received SIGINT"),
    }
    Ok(())
}

/// Wait for a `ctrl+c` to stop the process on Windows systems
#[cfg(windows)]
pub(crate) async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("Received SIGINT");
    Ok(())
}
