//! instanced: main-instance coordination daemon and CLI.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use instanced::client::{Client, ClientError};
use instanced::config;
use instanced::server::{Server, ServerError};

#[derive(Parser)]
#[command(name = "instanced", about = "Per-session main-instance coordination daemon")]
struct Cli {
    /// Socket path of the coordination server.
    #[arg(long, global = true, env = config::SOCKET_ENV)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordination server.
    Serve,
    /// Print the number of instances in a session.
    Count {
        #[arg(long)]
        session: String,
    },
    /// Send a payload to every other client in a session.
    Broadcast {
        #[arg(long)]
        session: String,
        payload: String,
    },
    /// Forward a payload to the main instance of a session.
    Execute {
        #[arg(long)]
        session: String,
        payload: String,
    },
}

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("failed to install signal handler: {0}")]
    Signal(std::io::Error),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    config::init_logging();

    let socket = cli.socket.unwrap_or_else(config::default_socket_path);
    let result = match cli.command {
        Command::Serve => serve(&socket).await,
        Command::Count { session } => count(&socket, &session).await,
        Command::Broadcast { session, payload } => broadcast(&socket, &session, &payload).await,
        Command::Execute { session, payload } => execute(&socket, &session, &payload).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "instanced failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(socket: &Path) -> Result<(), CliError> {
    let server = Server::bind(socket)?;
    let shutdown = CancellationToken::new();

    let mut terminate = signal(SignalKind::terminate()).map_err(CliError::Signal)?;
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
            _ = terminate.recv() => tracing::info!("received SIGTERM"),
        }
        trigger.cancel();
    });

    server.run(shutdown).await;
    Ok(())
}

async fn connect(socket: &Path, session: &str) -> Result<Client, CliError> {
    // Callbacks are not interesting to a one-shot command; dropping the
    // event stream declines any SetMain offer.
    let (client, _events) = Client::connect(socket).await?;
    client.subscribe(session).await?;
    Ok(client)
}

async fn count(socket: &Path, session: &str) -> Result<(), CliError> {
    let client = connect(socket, session).await?;
    println!("{}", client.total_instance_count().await?);
    Ok(())
}

async fn broadcast(socket: &Path, session: &str, payload: &str) -> Result<(), CliError> {
    let client = connect(socket, session).await?;
    client.broadcast(payload.as_bytes()).await?;
    Ok(())
}

async fn execute(socket: &Path, session: &str, payload: &str) -> Result<(), CliError> {
    let client = connect(socket, session).await?;
    if client.execute_on_main_process(payload.as_bytes()).await? {
        // A fresh connection owns no instances, so this only happens if
        // the server considers it main.
        println!("this client is main in session {session}, nothing forwarded");
    } else {
        println!("sent to the main instance of session {session}, if there is one");
    }
    Ok(())
}
