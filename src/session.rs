// ABOUTME: Per-connection state: buffers, setup parameters, child handle,
// ABOUTME: and the three pipe handles, plus the backpressure-gate predicates

use bytes::{Bytes, BytesMut};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout};

use crate::config::ServerConfig;
use crate::frame::{CodecError, FrameCodec, HEADER_LEN};

/// Where a session sits in its lifecycle (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Setup,
    Running,
    Closing,
}

/// The complete state of one client connection.
pub struct Session {
    pub id: u64,
    pub state: SessionState,

    pub reader: OwnedReadHalf,
    pub writer: OwnedWriteHalf,

    pub recv_buf: BytesMut,
    pub send_buf: BytesMut,
    recv_capacity: usize,
    send_capacity: usize,
    pub max_pipe_read: usize,

    pub application_path: Option<String>,
    pub command_line: Option<String>,
    pub working_directory: Option<String>,

    pub child: Option<Child>,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
    pub stderr: Option<ChildStderr>,

    /// Bytes of the current `I` frame not yet handed to the child, and how
    /// many of them have already been written. `Some` means a write is
    /// in flight on `stdin` (invariant 5: at most one outstanding op).
    pub stdin_pending: Option<(Bytes, usize)>,
}

impl Session {
    pub fn new(
        id: u64,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        config: &ServerConfig,
    ) -> Self {
        Self {
            id,
            state: SessionState::Setup,
            reader,
            writer,
            recv_buf: BytesMut::with_capacity(config.recv_capacity),
            send_buf: BytesMut::with_capacity(config.send_capacity),
            recv_capacity: config.recv_capacity,
            send_capacity: config.send_capacity,
            max_pipe_read: config.max_pipe_read,
            application_path: None,
            command_line: None,
            working_directory: None,
            child: None,
            stdin: None,
            stdout: None,
            stderr: None,
            stdin_pending: None,
        }
    }

    pub fn recv_spare(&self) -> usize {
        self.recv_capacity - self.recv_buf.len()
    }

    pub fn send_spare(&self) -> usize {
        self.send_capacity - self.send_buf.len()
    }

    /// True once the receive buffer is full and still doesn't hold a
    /// complete frame — the one way inbound traffic can overflow it.
    pub fn recv_buffer_is_stuck(&self) -> bool {
        self.recv_buf.len() == self.recv_capacity
    }

    /// Appends one outbound frame. Only fails if a caller bypassed a
    /// backpressure gate (§4.3); every call site holds the corresponding
    /// gate open before producing the bytes it encodes here.
    pub fn enqueue(&mut self, command: u8, payload: &[u8]) -> Result<(), CodecError> {
        FrameCodec::encode(command, payload, &mut self.send_buf, self.send_capacity)
    }

    /// Gate: wait for stdout/stderr read completions only with guaranteed
    /// room to forward the largest possible read.
    pub fn can_poll_output_reads(&self) -> bool {
        self.send_spare() >= HEADER_LEN + self.max_pipe_read
    }

    /// Gate: wait for the child's exit only once both output pipes are
    /// drained to EOF and there's room for the exit frame.
    pub fn can_poll_exit(&self) -> bool {
        self.stdout.is_none()
            && self.stderr.is_none()
            && self.child.is_some()
            && self.send_spare() >= HEADER_LEN + 4
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn test_session(config: ServerConfig) -> Session {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (server, _client) = tokio::join!(
            async { listener.accept().await.unwrap().0 },
            TcpStream::connect(addr),
        );
        let (reader, writer) = server.into_split();
        Session::new(1, reader, writer, &config)
    }

    #[tokio::test]
    async fn recv_spare_shrinks_as_the_buffer_fills() {
        let mut session = test_session(ServerConfig {
            recv_capacity: 16,
            ..ServerConfig::default()
        })
        .await;
        assert_eq!(session.recv_spare(), 16);
        session.recv_buf.extend_from_slice(&[0u8; 10]);
        assert_eq!(session.recv_spare(), 6);
        assert!(!session.recv_buffer_is_stuck());
        session.recv_buf.extend_from_slice(&[0u8; 6]);
        assert_eq!(session.recv_spare(), 0);
        assert!(session.recv_buffer_is_stuck());
    }

    #[tokio::test]
    async fn output_reads_gate_on_worst_case_send_capacity() {
        let mut session = test_session(ServerConfig {
            send_capacity: HEADER_LEN + 100,
            max_pipe_read: 100,
            ..ServerConfig::default()
        })
        .await;
        assert!(session.can_poll_output_reads());
        session.send_buf.extend_from_slice(&[0u8; 1]);
        assert!(!session.can_poll_output_reads());
    }

    #[tokio::test]
    async fn exit_gate_requires_both_pipes_drained_and_a_child() {
        let mut session = test_session(ServerConfig::default()).await;
        assert!(!session.can_poll_exit(), "no child yet");

        // Simulate both pipes already reporting EOF, but no child handle:
        // still not pollable.
        session.stdout = None;
        session.stderr = None;
        assert!(!session.can_poll_exit());
    }

    #[tokio::test]
    async fn enqueue_respects_send_capacity() {
        let mut session = test_session(ServerConfig {
            send_capacity: HEADER_LEN + 2,
            ..ServerConfig::default()
        })
        .await;
        session.enqueue(b'O', b"ab").unwrap();
        assert!(session.enqueue(b'O', b"c").is_err());
    }
}
