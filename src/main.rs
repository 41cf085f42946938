use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

use gridgate::{
    AcceptorConfig, AppError, AppResult, Connection, ConnectionListener, MessageBuffer,
    TcpAcceptor,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    PrintConfig,
}

/// Writes every inbound message straight back to its sender. Stands in
/// for a real grid-side dispatcher.
struct EchoListener;

impl ConnectionListener for EchoListener {
    fn on_message(&self, connection: &Arc<Connection>, message: MessageBuffer) {
        if let Err(e) = connection.send_bytes(&message.to_vec()) {
            tracing::warn!("dropping an echo on {}: {}", connection, e);
        }
    }
}

fn main() -> AppResult<()> {
    let commandline: CommandLine = CommandLine::parse();

    //setup tracing, RUST_LOG overrides the -v flags
    let level = match commandline.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let timer = ChronoLocal::new("%Y-%m-%d %H:%M:%S%.6f".to_string());
    let subscriber = tracing_subscriber::fmt()
        .with_timer(timer)
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::IllegalStateError(e.to_string()))?;

    //setup config
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("conf");
            path.push("gridgate.toml");
            path
        },
        PathBuf::from,
    );
    let config = if config_path.exists() {
        AcceptorConfig::from_file(&config_path)?
    } else {
        AcceptorConfig::default()
    };

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let mut acceptor = TcpAcceptor::new(config, Arc::new(EchoListener))?;
    acceptor.start()?;
    acceptor.wait()
}
