// ABOUTME: Client binary: parses the CLI surface from §6.3, connects, and
// ABOUTME: exits with the remote child's exit code (or a sysexits-style code)

use argh::FromArgs;
use rexec::client::{self, ClientError, ExecuteRequest};
use rexec::config::DEFAULT_PORT;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const EX_USAGE: u8 = 64;
const EX_DATAERR: u8 = 65;
#[allow(dead_code)] // reserved for an internal-bug disposition; none raises it yet
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

/// Run a command on a remote rexecd server and stream its stdio back.
///
/// `rexec <host> [-p <port>] <executable> [<arg>...]`
/// `rexec <host> [-p <port>] <executable> -e <verbatim-command-line>`
#[derive(FromArgs)]
struct CliArgs {
    /// port to connect to (default: 5424)
    #[argh(option, short = 'p', default = "DEFAULT_PORT")]
    port: u16,

    /// working directory for the child process on the server
    #[argh(option, short = 'w')]
    working_directory: Option<String>,

    /// a verbatim, already-quoted command line; mutually exclusive with
    /// trailing positional arguments
    #[argh(option, short = 'e')]
    command_line: Option<String>,

    /// the server to connect to
    #[argh(positional)]
    host: String,

    /// the executable to run
    #[argh(positional)]
    executable: String,

    /// arguments passed to the executable
    #[argh(positional)]
    args: Vec<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args: CliArgs = argh::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    if args.command_line.is_some() && !args.args.is_empty() {
        eprintln!("rexec: -e is mutually exclusive with trailing arguments");
        return ExitCode::from(EX_USAGE);
    }

    let command_line = match args.command_line {
        Some(verbatim) => verbatim,
        None => {
            let mut argv = vec![args.executable.clone()];
            argv.extend(args.args.iter().cloned());
            client::quote::quote_argv(&argv)
        }
    };

    let request = ExecuteRequest {
        application_path: args.executable,
        command_line,
        working_directory: args.working_directory,
    };

    let addr = format!("{}:{}", args.host, args.port);

    match client::run(&addr, request).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("rexec: {err}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

fn exit_code_for(err: &ClientError) -> u8 {
    match err {
        ClientError::Connect(..) | ClientError::Io(_) | ClientError::NoExitFrame => EX_IOERR,
        ClientError::Encode(_) | ClientError::MalformedExitFrame => EX_DATAERR,
    }
}
