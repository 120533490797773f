// ABOUTME: Server binary: parses CLI flags into a ServerConfig, installs
// ABOUTME: tracing, and runs the multiplexor's accept loop until it errors

use argh::FromArgs;
use rexec::{Multiplexor, ServerConfig};
use tracing_subscriber::EnvFilter;

/// Host child processes for networked clients over a framed TCP protocol.
#[derive(FromArgs)]
struct CliArgs {
    /// address to listen on (default: 0.0.0.0)
    #[argh(option, default = "String::from(\"0.0.0.0\")")]
    host: String,

    /// port to listen on (default: 5424)
    #[argh(option, short = 'p', default = "rexec::config::DEFAULT_PORT")]
    port: u16,

    /// maximum concurrent sessions (default: 16)
    #[argh(option, default = "rexec::config::DEFAULT_MAX_CONNECTIONS")]
    max_connections: usize,

    /// per-session receive buffer capacity in bytes
    #[argh(option, default = "rexec::config::DEFAULT_RECV_CAPACITY")]
    recv_capacity: usize,

    /// per-session send buffer capacity in bytes
    #[argh(option, default = "rexec::config::DEFAULT_SEND_CAPACITY")]
    send_capacity: usize,

    /// maximum bytes read from a child's stdout/stderr per operation
    #[argh(option, default = "rexec::config::DEFAULT_MAX_PIPE_READ")]
    max_pipe_read: usize,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let args: CliArgs = argh::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig {
        listen_addr: format!("{}:{}", args.host, args.port),
        max_connections: args.max_connections,
        recv_capacity: args.recv_capacity,
        send_capacity: args.send_capacity,
        max_pipe_read: args.max_pipe_read,
    };

    let multiplexor = match Multiplexor::bind(config).await {
        Ok(m) => m,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind listener");
            return std::process::ExitCode::FAILURE;
        }
    };

    if let Err(err) = multiplexor.run().await {
        tracing::error!(error = %err, "accept loop ended");
        return std::process::ExitCode::FAILURE;
    }

    std::process::ExitCode::SUCCESS
}
