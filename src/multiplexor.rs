// ABOUTME: The per-session event loop (backpressure-gated select! over one
// ABOUTME: connection's resources) and the process-wide accept loop (§4.3, §4.4)

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Buf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::command::OutboundCommand;
use crate::config::ServerConfig;
use crate::error::SessionError;
use crate::frame::FrameCodec;
use crate::protocol;
use crate::session::{Session, SessionState};

/// Owns the listening socket and the connection-ceiling permit pool. One
/// `Multiplexor` runs for the lifetime of the process; it spawns one
/// per-session task per accepted connection (§4.3, §4.4).
pub struct Multiplexor {
    listener: TcpListener,
    config: ServerConfig,
    permits: Arc<Semaphore>,
    next_id: AtomicU64,
}

impl Multiplexor {
    pub async fn bind(config: ServerConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let permits = Arc::new(Semaphore::new(config.max_connections));
        Ok(Self {
            listener,
            config,
            permits,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections forever, rejecting with an immediate close once
    /// [`ServerConfig::max_connections`] sessions are already live.
    pub async fn run(self) -> std::io::Result<()> {
        info!(addr = %self.config.listen_addr, "listening");

        loop {
            let (socket, peer) = self.listener.accept().await?;

            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                warn!(%peer, "too many open connections, dropping connection");
                drop(socket);
                continue;
            };

            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            let config = self.config.clone();

            info!(session_id = id, %peer, "new connection established");

            tokio::spawn(async move {
                let _permit = permit;
                let (reader, writer) = socket.into_split();
                let session = Session::new(id, reader, writer, &config);
                run_session(session).await;
            });
        }
    }
}

/// Drives one session's state machine until it is destroyed.
async fn run_session(mut session: Session) {
    let id = session.id;

    loop {
        match run_one_iteration(&mut session).await {
            Ok(true) => continue,
            Ok(false) => break,
            Err(err) => {
                if err.is_operational_failure() {
                    error!(session_id = id, error = %err, "session ending");
                } else {
                    warn!(session_id = id, error = %err, "session ending");
                }
                break;
            }
        }
    }

    info!(session_id = id, "connection closed");
    // Dropping `session` here drops `session.child` (if still present),
    // which was spawned with `kill_on_drop(true)`: that forcibly
    // terminates the child. Any still-open pipe handles are simply
    // dropped too — see §REDESIGN's note on handle abandonment.
}

/// One pass of the backpressure-gated wait set (§4.3). Returns `Ok(true)`
/// to keep looping, `Ok(false)` once the session has cleanly drained to
/// completion, or `Err` to tear the session down immediately.
async fn run_one_iteration(session: &mut Session) -> Result<bool, SessionError> {
    tokio::select! {
        biased;

        result = read_bounded(&mut session.reader, session.recv_spare()), if session.recv_spare() > 0 => {
            let chunk = result.map_err(SessionError::SocketIo)?;
            if chunk.is_empty() {
                return Err(SessionError::PeerClosed);
            }
            session.recv_buf.extend_from_slice(&chunk);
            drain_inbound_frames(session).await?;
            Ok(true)
        }

        result = session.writer.write(&session.send_buf), if !session.send_buf.is_empty() => {
            let n = result.map_err(SessionError::SocketIo)?;
            session.send_buf.advance(n);
            if session.send_buf.is_empty() && session.state == SessionState::Closing {
                return Ok(false);
            }
            Ok(true)
        }

        result = read_pipe(session.stdout.as_mut(), session.max_pipe_read),
            if session.stdout.is_some() && session.can_poll_output_reads() =>
        {
            dispatch_output(session, OutboundCommand::Stdout, result)?;
            Ok(true)
        }

        result = read_pipe(session.stderr.as_mut(), session.max_pipe_read),
            if session.stderr.is_some() && session.can_poll_output_reads() =>
        {
            dispatch_output(session, OutboundCommand::Stderr, result)?;
            Ok(true)
        }

        result = session.stdin.as_mut().unwrap().write(
            &session.stdin_pending.as_ref().unwrap().0[session.stdin_pending.as_ref().unwrap().1..]
        ), if session.stdin_pending.is_some() =>
        {
            match result {
                Ok(n) => protocol::handle_stdin_write_progress(session, n),
                Err(err) => return Err(SessionError::PipeIo(err)),
            }
            if session.stdin_pending.is_none() {
                // The write finished: an `I` frame stalled at the head of
                // recv_buf (§4.2) is only re-examined when new socket bytes
                // arrive or here, on the precondition it was waiting for.
                drain_inbound_frames(session).await?;
            }
            Ok(true)
        }

        result = session.child.as_mut().unwrap().wait(), if session.can_poll_exit() => {
            let status = result.map_err(SessionError::PipeIo)?;
            let code = status.code().unwrap_or(-1);
            protocol::handle_child_exit(session, code)?;
            Ok(true)
        }
    }
}

/// Drains and dispatches every complete frame currently at the head of the
/// receive buffer, stopping (stalling) if a frame can't yet be consumed.
async fn drain_inbound_frames(session: &mut Session) -> Result<(), SessionError> {
    loop {
        if session.recv_buffer_is_stuck() {
            // Full buffer with no frame ready to peel off: a frame larger
            // than the buffer itself, or a client that isn't sending
            // valid frames at all.
            return Err(SessionError::RecvBufferOverflow);
        }

        // Peek without consuming: FrameCodec::try_parse only drains on a
        // complete frame, so a stall just means we stop here and retry on
        // the next call once preconditions change.
        let mut probe = session.recv_buf.clone();
        let Some(frame) = FrameCodec::try_parse(&mut probe)? else {
            return Ok(());
        };

        let consumed = session.recv_buf.len() - probe.len();
        match protocol::handle_inbound_frame(session, frame.command, frame.payload.clone()).await {
            Ok(true) => {
                session.recv_buf.advance(consumed);
            }
            Ok(false) => {
                // Stall: leave the frame at the head of the buffer.
                return Ok(());
            }
            Err(err) => return Err(err),
        }
    }
}

fn dispatch_output(
    session: &mut Session,
    which: OutboundCommand,
    result: std::io::Result<Option<Vec<u8>>>,
) -> Result<(), SessionError> {
    let chunk = match result {
        Ok(None) => None,
        Ok(Some(bytes)) => Some(bytes::Bytes::from(bytes)),
        Err(err) => return Err(SessionError::PipeIo(err)),
    };
    protocol::handle_output_chunk(session, which, chunk).map_err(SessionError::from)
}

/// Reads at most `limit` bytes from the socket in one poll. Bounding the
/// read (rather than handing `read_buf` the whole, unbounded-growth
/// `BytesMut`) is what makes `recv_capacity` an actual ceiling.
async fn read_bounded(
    reader: &mut tokio::net::tcp::OwnedReadHalf,
    limit: usize,
) -> std::io::Result<Vec<u8>> {
    let mut buf = vec![0u8; limit];
    let n = reader.read(&mut buf).await?;
    buf.truncate(n);
    Ok(buf)
}

/// Reads one chunk from `pipe`. `Ok(None)` means EOF (a zero-byte read,
/// which under tokio's `AsyncRead` contract always means the writer has
/// closed — there is no "empty, not-yet-EOF" read to special-case here).
async fn read_pipe<P>(pipe: Option<&mut P>, max_pipe_read: usize) -> std::io::Result<Option<Vec<u8>>>
where
    P: tokio::io::AsyncRead + Unpin,
{
    let pipe = pipe.expect("guarded by `if session.stdout.is_some()` / `stderr.is_some()`");
    let mut buf = vec![0u8; max_pipe_read];
    let n = pipe.read(&mut buf).await?;
    if n == 0 {
        return Ok(None);
    }
    buf.truncate(n);
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{FrameCodec, HEADER_LEN};
    use bytes::{Bytes, BytesMut};
    use tokio::net::TcpStream;
    use tokio::time::{Duration, timeout};

    async fn spawn_test_server() -> std::net::SocketAddr {
        let config = ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        };
        let multiplexor = Multiplexor::bind(config).await.unwrap();
        let addr = multiplexor.local_addr().unwrap();
        tokio::spawn(async move { multiplexor.run().await });
        addr
    }

    async fn send_setup(stream: &mut TcpStream, application_path: &str, command_line: &str) {
        let mut buf = BytesMut::new();
        FrameCodec::encode(b'A', application_path.as_bytes(), &mut buf, usize::MAX).unwrap();
        FrameCodec::encode(b'C', command_line.as_bytes(), &mut buf, usize::MAX).unwrap();
        FrameCodec::encode(b'E', &[], &mut buf, usize::MAX).unwrap();
        stream.write_all(&buf).await.unwrap();
    }

    fn shell_command_line(script: &str) -> String {
        crate::client::quote::quote_argv(&[
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ])
    }

    async fn read_frame(stream: &mut TcpStream, recv_buf: &mut BytesMut) -> (u8, Bytes) {
        loop {
            if let Some(frame) = FrameCodec::try_parse(recv_buf).unwrap() {
                return (frame.command, frame.payload);
            }
            let mut chunk = [0u8; 4096];
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-frame");
            recv_buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn echo_scenario() {
        let addr = spawn_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_setup(&mut stream, "sh", &shell_command_line("echo hello")).await;

        let mut recv_buf = BytesMut::new();
        let (cmd, payload) = read_frame(&mut stream, &mut recv_buf).await;
        assert_eq!(cmd, b'O');
        assert_eq!(&payload[..], b"hello\n");

        let (cmd, payload) = read_frame(&mut stream, &mut recv_buf).await;
        assert_eq!(cmd, b'O');
        assert!(payload.is_empty());

        let (cmd, payload) = read_frame(&mut stream, &mut recv_buf).await;
        assert_eq!(cmd, b'E');
        assert!(payload.is_empty());

        let (cmd, payload) = read_frame(&mut stream, &mut recv_buf).await;
        assert_eq!(cmd, b'X');
        assert_eq!(i32::from_le_bytes(payload[..].try_into().unwrap()), 0);
    }

    #[tokio::test]
    async fn stdin_passthrough_scenario() {
        let addr = spawn_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_setup(&mut stream, "sort", "sort").await;

        let mut buf = BytesMut::new();
        FrameCodec::encode(b'I', b"b\na\n", &mut buf, usize::MAX).unwrap();
        FrameCodec::encode(b'I', b"", &mut buf, usize::MAX).unwrap();
        stream.write_all(&buf).await.unwrap();

        let mut recv_buf = BytesMut::new();
        let (cmd, payload) = read_frame(&mut stream, &mut recv_buf).await;
        assert_eq!(cmd, b'O');
        assert_eq!(&payload[..], b"a\nb\n");

        let (cmd, _) = read_frame(&mut stream, &mut recv_buf).await;
        assert_eq!(cmd, b'O');
        let (cmd, _) = read_frame(&mut stream, &mut recv_buf).await;
        assert_eq!(cmd, b'E');
        let (cmd, payload) = read_frame(&mut stream, &mut recv_buf).await;
        assert_eq!(cmd, b'X');
        assert_eq!(i32::from_le_bytes(payload[..].try_into().unwrap()), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_scenario() {
        let addr = spawn_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_setup(&mut stream, "sh", &shell_command_line("exit 7")).await;

        let mut recv_buf = BytesMut::new();
        loop {
            let (cmd, payload) = read_frame(&mut stream, &mut recv_buf).await;
            if cmd == b'X' {
                assert_eq!(i32::from_le_bytes(payload[..].try_into().unwrap()), 7);
                break;
            }
        }
    }

    #[tokio::test]
    async fn large_stdin_split_across_two_frames() {
        let addr = spawn_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        // `cat` echoes stdin to stdout verbatim, then EOFs when stdin closes.
        send_setup(&mut stream, "cat", "cat").await;

        let first_payload = vec![b'a'; 65_535];
        let second_payload = vec![b'b'; 1024];

        let mut buf = BytesMut::new();
        FrameCodec::encode(b'I', &first_payload, &mut buf, usize::MAX).unwrap();
        FrameCodec::encode(b'I', &second_payload, &mut buf, usize::MAX).unwrap();
        FrameCodec::encode(b'I', &[], &mut buf, usize::MAX).unwrap();
        stream.write_all(&buf).await.unwrap();

        let mut recv_buf = BytesMut::new();
        let mut stdout = Vec::new();
        loop {
            let (cmd, payload) = timeout(Duration::from_secs(10), read_frame(&mut stream, &mut recv_buf))
                .await
                .expect("timed out waiting for a frame");
            match cmd {
                b'O' if !payload.is_empty() => stdout.extend_from_slice(&payload),
                b'X' => break,
                _ => {}
            }
        }

        let mut expected = first_payload;
        expected.extend_from_slice(&second_payload);
        assert_eq!(stdout, expected);
    }

    #[tokio::test]
    async fn unknown_executable_closes_without_an_exit_frame() {
        let addr = spawn_test_server().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        send_setup(&mut stream, "definitely-not-a-real-binary-xyz", "").await;

        let mut chunk = [0u8; HEADER_LEN];
        let n = stream.read(&mut chunk).await.unwrap();
        assert_eq!(n, 0, "expected end-of-stream with no frames at all");
    }
}
