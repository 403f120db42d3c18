//! Client side of the rexec protocol over a single TCP connection.
//!
//! The protocol has no framing, so a reply is everything that arrives
//! within the first-reply timeout plus whatever follows before the line
//! goes quiet for the idle window.

use rexec_core::protocol::{ACCESS_GRANTED, ACCESS_PROMPT, COMMAND_READ_LIMIT, EXIT_TOKEN, SERVER_BUSY};
use rexec_core::{decode_lossy, RexecError, RexecResult};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Quiet period that ends a multi-chunk reply.
pub const DRAIN_IDLE: Duration = Duration::from_millis(200);

/// One reply from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub text: String,
    /// The server closed the connection while or after sending this.
    pub closed: bool,
}

impl Reply {
    /// The server ended the session on its own (admin kick or shutdown).
    pub fn is_server_exit(&self) -> bool {
        self.closed && self.text.trim_end().ends_with(EXIT_TOKEN)
    }
}

/// An authenticated connection to a rexec server.
pub struct RemoteSession {
    stream: TcpStream,
    timeout: Duration,
    idle: Duration,
    allowed: Option<Vec<String>>,
}

impl RemoteSession {
    /// Connect and authenticate with `code`.
    pub async fn open(host: &str, port: u16, code: &str, timeout: Duration) -> RexecResult<Self> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| RexecError::Timeout(timeout))?
            .map_err(|e| RexecError::Transport(format!("connect to {host}:{port} failed: {e}")))?;
        debug!(host, port, "connected");

        let mut session = Self {
            stream,
            timeout,
            idle: DRAIN_IDLE,
            allowed: None,
        };
        session.authenticate(code).await?;
        Ok(session)
    }

    async fn authenticate(&mut self, code: &str) -> RexecResult<()> {
        let prompt = self.read_reply().await?;
        if prompt.text.starts_with(SERVER_BUSY) {
            return Err(RexecError::Transport(SERVER_BUSY.to_string()));
        }
        if !prompt.text.starts_with(ACCESS_PROMPT) {
            return Err(RexecError::Transport(format!(
                "unexpected greeting: {:?}",
                prompt.text
            )));
        }

        self.write(code.trim().as_bytes()).await?;
        let reply = self.read_reply().await?;
        let Some(listing) = reply.text.strip_prefix(ACCESS_GRANTED) else {
            return Err(RexecError::AuthFailed(reply.text.trim().to_string()));
        };

        let tokens: Vec<String> = listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect();
        self.allowed = (!tokens.is_empty()).then_some(tokens);
        debug!(allowed = ?self.allowed, "access granted");
        Ok(())
    }

    /// Commands advertised by an allow-listing server.
    pub fn allowed_commands(&self) -> Option<&[String]> {
        self.allowed.as_deref()
    }

    /// Send one command and collect its reply.
    pub async fn send_command(&mut self, command: &str) -> RexecResult<Reply> {
        let command = command.trim();
        if command.is_empty() {
            return Err(RexecError::Other("empty command".into()));
        }
        self.write(command.as_bytes()).await?;
        self.read_reply().await
    }

    /// Send `exit` and close the connection.
    pub async fn close(mut self) {
        if let Err(e) = self.write(EXIT_TOKEN.as_bytes()).await {
            debug!(error = %e, "could not send exit");
        }
        let _ = self.stream.shutdown().await;
    }

    async fn write(&mut self, data: &[u8]) -> RexecResult<()> {
        self.stream
            .write_all(data)
            .await
            .map_err(|e| RexecError::Transport(format!("send failed: {e}")))
    }

    async fn read_reply(&mut self) -> RexecResult<Reply> {
        let mut buf = vec![0u8; COMMAND_READ_LIMIT];
        let mut collected = Vec::new();

        let n = tokio::time::timeout(self.timeout, self.stream.read(&mut buf))
            .await
            .map_err(|_| RexecError::Timeout(self.timeout))?
            .map_err(|e| RexecError::Transport(format!("receive failed: {e}")))?;
        if n == 0 {
            return Ok(Reply {
                text: String::new(),
                closed: true,
            });
        }
        collected.extend_from_slice(&buf[..n]);

        let mut closed = false;
        loop {
            match tokio::time::timeout(self.idle, self.stream.read(&mut buf)).await {
                Err(_) => break,
                Ok(Ok(0)) => {
                    closed = true;
                    break;
                }
                Ok(Ok(n)) => collected.extend_from_slice(&buf[..n]),
                Ok(Err(e)) => {
                    debug!(error = %e, "read failed while draining");
                    closed = true;
                    break;
                }
            }
        }

        Ok(Reply {
            text: decode_lossy(&collected),
            closed,
        })
    }
}
