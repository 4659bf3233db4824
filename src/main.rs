//! vsock-exec: one-shot remote command execution
//!
//! The server listens on a vsock (or TCP) endpoint and, for each
//! connection, runs a single shell command line and replies with its
//! standard output followed by an `EXIT_CODE: <n>` trailer.
//!
//! Features:
//! - Strictly sequential serving by default, optional concurrent sessions
//! - Bounded output capture with silent truncation
//! - `run` subcommand acting as the host-side client
//! - Configuration via CLI arguments or TOML file
//!
//! There is no authentication: anyone who can reach the endpoint can run
//! commands with the server's privileges.

mod client;
mod config;
mod endpoint;
mod executor;
mod protocol;
mod server;
mod session;
mod transport;

use client::Client;
use config::{Action, Config};
use server::Server;
use std::io::Write;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match config.action.clone() {
        Action::Serve => run_server(config),
        Action::Run { command } => run_client(&config, &command),
    }
}

/// Run the command server until interrupted.
fn run_server(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        endpoint = %config.listen,
        shell = %config.shell.display(),
        max_sessions = config.max_sessions,
        request_buffer = config.request_buffer,
        output_capacity = config.output_capacity,
        "Starting vsock-exec server"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let server = Server::new(&config);
    if let Err(e) = runtime.block_on(server.run()) {
        error!(endpoint = %config.listen, error = %e, "Failed to set up listener");
        return Err(e.into());
    }

    Ok(())
}

/// Run one command remotely and exit with its exit code.
fn run_client(config: &Config, command: &str) -> Result<(), Box<dyn std::error::Error>> {
    let client = Client::new(&config.client);

    let code = match client.run(command) {
        Ok(reply) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&reply.output)?;
            stdout.flush()?;
            reply.exit_code
        }
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    };

    std::process::exit(code);
}
