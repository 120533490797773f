// ABOUTME: Tunable constants and the server's runtime configuration, with
// ABOUTME: defaults matching the original design's fixed sizes

/// Default TCP port the server listens on.
pub const DEFAULT_PORT: u16 = 5424;

/// Default maximum number of concurrent sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

/// Default receive buffer capacity per session.
pub const DEFAULT_RECV_CAPACITY: usize = 72 * 1024;

/// Default send buffer capacity per session.
pub const DEFAULT_SEND_CAPACITY: usize = 128 * 1024;

/// Default maximum bytes read from a child's stdout/stderr in one operation.
pub const DEFAULT_MAX_PIPE_READ: usize = 32 * 1024;

/// Server-wide tunables, assembled once at startup from CLI flags.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub max_connections: usize,
    pub recv_capacity: usize,
    pub send_capacity: usize,
    pub max_pipe_read: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("0.0.0.0:{DEFAULT_PORT}"),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            recv_capacity: DEFAULT_RECV_CAPACITY,
            send_capacity: DEFAULT_SEND_CAPACITY,
            max_pipe_read: DEFAULT_MAX_PIPE_READ,
        }
    }
}
