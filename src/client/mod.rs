// ABOUTME: The client half: connects, sends the setup/execute frames, then
// ABOUTME: copies between the local process's stdio and the connection (§6.3)

pub mod quote;

use std::process::ExitCode;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{self, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::frame::{CodecError, FrameCodec};

/// What to run, and how, once connected.
pub struct ExecuteRequest {
    pub application_path: String,
    pub command_line: String,
    pub working_directory: Option<String>,
}

/// Everything that can go wrong driving one remote execution from the
/// client side. Distinct from [`crate::error::SessionError`]: that type
/// describes how a *server* session can fail, this describes the client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("could not connect to {0}: {1}")]
    Connect(String, #[source] io::Error),

    #[error("connection I/O error: {0}")]
    Io(#[source] io::Error),

    #[error("frame encoding error: {0}")]
    Encode(#[from] CodecError),

    #[error("server sent a malformed exit frame")]
    MalformedExitFrame,

    #[error("server closed the connection before sending an exit frame")]
    NoExitFrame,
}

const STDIN_CHUNK: usize = 32 * 1024;
const SOCKET_CHUNK: usize = 64 * 1024;

/// Connects to `addr`, runs `request`, copies the remote process's stdio
/// to this process's own, and returns the remote exit code translated to
/// an [`ExitCode`] (§6.3's "exit status is the child's exit code").
pub async fn run(addr: &str, request: ExecuteRequest) -> Result<ExitCode, ClientError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ClientError::Connect(addr.to_string(), e))?;
    let (mut reader, mut writer) = stream.into_split();

    let mut send_buf = BytesMut::new();
    FrameCodec::encode(b'A', request.application_path.as_bytes(), &mut send_buf, usize::MAX)?;
    FrameCodec::encode(b'C', request.command_line.as_bytes(), &mut send_buf, usize::MAX)?;
    if let Some(dir) = &request.working_directory {
        FrameCodec::encode(b'W', dir.as_bytes(), &mut send_buf, usize::MAX)?;
    }
    FrameCodec::encode(b'E', &[], &mut send_buf, usize::MAX)?;
    writer.write_all(&send_buf).await.map_err(ClientError::Io)?;

    debug!(addr, "sent setup frames, entering copy loop");

    let mut recv_buf = BytesMut::new();
    let mut socket_chunk = vec![0u8; SOCKET_CHUNK];
    let mut stdin_chunk = vec![0u8; STDIN_CHUNK];
    let mut stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    // Once our own stdin hits EOF we've already sent the closing empty
    // `I` frame; stop arming that branch so the loop only waits on `X`.
    let mut stdin_open = true;

    loop {
        tokio::select! {
            biased;

            result = reader.read(&mut socket_chunk) => {
                let n = result.map_err(ClientError::Io)?;
                if n == 0 {
                    return Err(ClientError::NoExitFrame);
                }
                recv_buf.extend_from_slice(&socket_chunk[..n]);

                while let Some(frame) = FrameCodec::try_parse(&mut recv_buf)? {
                    match frame.command {
                        b'O' => stdout.write_all(&frame.payload).await.map_err(ClientError::Io)?,
                        b'E' => stderr.write_all(&frame.payload).await.map_err(ClientError::Io)?,
                        b'X' => return Ok(exit_code_from(parse_exit_payload(&frame.payload)?)),
                        other => warn!(command = other, "ignoring unrecognised outbound command"),
                    }
                }
            }

            result = stdin.read(&mut stdin_chunk), if stdin_open => {
                let n = result.map_err(ClientError::Io)?;

                let mut frame = BytesMut::new();
                FrameCodec::encode(b'I', &stdin_chunk[..n], &mut frame, usize::MAX)?;
                writer.write_all(&frame).await.map_err(ClientError::Io)?;

                if n == 0 {
                    stdin_open = false;
                }
            }
        }
    }
}

fn parse_exit_payload(payload: &Bytes) -> Result<i32, ClientError> {
    let bytes: [u8; 4] = payload
        .as_ref()
        .try_into()
        .map_err(|_| ClientError::MalformedExitFrame)?;
    Ok(i32::from_le_bytes(bytes))
}

fn exit_code_from(code: i32) -> ExitCode {
    ExitCode::from((code & 0xff) as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_truncates_to_a_byte() {
        assert_eq!(exit_code_from(0), ExitCode::from(0));
        assert_eq!(exit_code_from(256), ExitCode::from(0));
        assert_eq!(exit_code_from(-1), ExitCode::from(255));
    }

    #[test]
    fn parse_exit_payload_rejects_wrong_length() {
        let payload = Bytes::from_static(b"xx");
        assert!(parse_exit_payload(&payload).is_err());
    }
}
