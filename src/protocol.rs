// ABOUTME: Interprets inbound frames to drive the Session state machine and
// ABOUTME: turns pipe/process events into outbound frames (§4.2)

use std::process::Stdio;

use bytes::Bytes;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cmdline::split_command_line;
use crate::command::{InboundCommand, OutboundCommand};
use crate::error::SessionError;
use crate::pathsearch::resolve_application_path;
use crate::session::{Session, SessionState};

/// Dispatches one fully-parsed inbound frame. Returns `Ok(true)` if the
/// frame was fully handled and consumed, `Ok(false)` if it must be
/// re-examined later (the stdin stall, §4.2) and should be pushed back
/// onto the head of the receive buffer by the caller.
pub async fn handle_inbound_frame(
    session: &mut Session,
    command: u8,
    payload: Bytes,
) -> Result<bool, SessionError> {
    let Some(cmd) = InboundCommand::from_byte(command) else {
        return Err(SessionError::ProtocolViolation(format!(
            "unrecognised command byte {command:#04x}"
        )));
    };

    match (cmd, session.state) {
        (InboundCommand::SetApplicationPath, SessionState::Setup) => {
            session.application_path = Some(decode_string(&payload)?);
            Ok(true)
        }
        (InboundCommand::SetCommandLine, SessionState::Setup) => {
            session.command_line = Some(decode_string(&payload)?);
            Ok(true)
        }
        (InboundCommand::SetWorkingDirectory, SessionState::Setup) => {
            session.working_directory = Some(decode_string(&payload)?);
            Ok(true)
        }
        (InboundCommand::Execute, SessionState::Setup) => {
            execute(session).await?;
            Ok(true)
        }
        (InboundCommand::StdinWrite, SessionState::Running) => handle_stdin_frame(session, payload),
        (cmd, state) => Err(SessionError::ProtocolViolation(format!(
            "{cmd} is not valid in state {state:?}"
        ))),
    }
}

fn decode_string(payload: &Bytes) -> Result<String, SessionError> {
    String::from_utf8(payload.to_vec())
        .map_err(|_| SessionError::ProtocolViolation("setup payload is not valid UTF-8".into()))
}

/// What to do with an `I` frame, independent of how the pipe handles are
/// actually represented — kept separate from [`handle_stdin_frame`] so the
/// decision table can be unit tested without a real child process.
#[derive(Debug, PartialEq, Eq)]
enum StdinAction {
    CloseStdin,
    Drop,
    Stall,
    Initiate,
}

fn stdin_action(payload_is_empty: bool, stdin_open: bool, write_in_flight: bool) -> StdinAction {
    // A write already in flight must finish — and `stdin_pending` must
    // clear — before this frame (close or otherwise) is acted on;
    // otherwise a close could null out `stdin` while a write still
    // references it (§4.2 invariant 5: one outstanding op at a time).
    if write_in_flight {
        StdinAction::Stall
    } else if payload_is_empty {
        StdinAction::CloseStdin
    } else if !stdin_open {
        StdinAction::Drop
    } else {
        StdinAction::Initiate
    }
}

/// `I` — queue a write to the child's stdin, or close it on an empty
/// payload. Returns `Ok(false)` to signal a stall (§4.2) when a write is
/// already in flight.
fn handle_stdin_frame(session: &mut Session, payload: Bytes) -> Result<bool, SessionError> {
    let action = stdin_action(
        payload.is_empty(),
        session.stdin.is_some(),
        session.stdin_pending.is_some(),
    );

    match action {
        StdinAction::CloseStdin => {
            session.stdin = None;
            Ok(true)
        }
        StdinAction::Drop => Ok(true),
        StdinAction::Stall => Ok(false),
        StdinAction::Initiate => {
            session.stdin_pending = Some((payload, 0));
            Ok(true)
        }
    }
}

/// `E` — create the three pipe pairs, spawn the child, and transition to
/// `Running` (§4.2).
async fn execute(session: &mut Session) -> Result<(), SessionError> {
    let application_path = session
        .application_path
        .clone()
        .ok_or_else(|| SessionError::ProtocolViolation("E received with no application_path set".into()))?;
    let command_line = session.command_line.clone().unwrap_or_default();

    let resolved_path = resolve_application_path(&application_path, session.working_directory.as_deref());
    info!(session_id = session.id, path = %resolved_path.display(), "resolving application path");

    let args = split_command_line(&command_line);
    let args = args.get(1..).unwrap_or(&[]);

    let mut command = Command::new(&resolved_path);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &session.working_directory {
        command.current_dir(dir);
    }

    detach(&mut command);

    let mut child = command.spawn().map_err(SessionError::Spawn)?;

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    session.child = Some(child);
    session.stdin = stdin;
    session.stdout = stdout;
    session.stderr = stderr;
    session.state = SessionState::Running;

    debug!(session_id = session.id, "child spawned, now running");

    Ok(())
}

#[cfg(unix)]
fn detach(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    // Put the child in its own session so it isn't killed by signals sent
    // to the server's controlling terminal, mirroring the original's
    // detached console.
    unsafe {
        command.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::from)?;
            Ok(())
        });
    }
}

#[cfg(windows)]
fn detach(command: &mut Command) {
    use std::os::windows::process::CommandExt;
    const DETACHED_PROCESS: u32 = 0x0000_0008;
    command.creation_flags(DETACHED_PROCESS);
}

/// One stdout/stderr read completed with `n` bytes (or `n == 0` for EOF).
/// Forwards non-empty reads verbatim, reports EOF with an empty frame
/// exactly once, and never re-arms a pipe once it has reported EOF.
pub fn handle_output_chunk(
    session: &mut Session,
    which: OutboundCommand,
    chunk: Option<Bytes>,
) -> Result<(), SessionError> {
    match chunk {
        Some(bytes) if !bytes.is_empty() => {
            session.enqueue(which.as_byte(), &bytes)?;
        }
        Some(_) => {
            // A zero-length read that isn't EOF: the source stream
            // produced an empty write. Discard and keep the pipe armed.
        }
        None => {
            session.enqueue(which.as_byte(), &[])?;
            match which {
                OutboundCommand::Stdout => session.stdout = None,
                OutboundCommand::Stderr => session.stderr = None,
                OutboundCommand::Exit => unreachable!("exit never reaches handle_output_chunk"),
            }
        }
    }

    Ok(())
}

/// The write in flight on `stdin` advanced by `written` bytes. If that
/// finished the frame's payload, the stall (if any) clears.
pub fn handle_stdin_write_progress(session: &mut Session, written: usize) {
    let Some((buf, offset)) = session.stdin_pending.take() else {
        return;
    };

    let new_offset = offset + written;
    if new_offset >= buf.len() {
        // Fully drained; the next `I` frame (if stalled) can proceed.
    } else {
        session.stdin_pending = Some((buf, new_offset));
    }
}

/// The child exited. This is only ever invoked once both output pipes have
/// reported EOF (§4.2); it sends the final `X` frame and begins `Closing`.
pub fn handle_child_exit(session: &mut Session, exit_code: i32) -> Result<(), SessionError> {
    session.child = None;
    session.state = SessionState::Closing;

    warn!(session_id = session.id, exit_code, "child exited");

    session.enqueue(OutboundCommand::Exit.as_byte(), &exit_code.to_le_bytes())
        .map_err(SessionError::from)
}
