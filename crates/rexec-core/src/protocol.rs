//! Plain-text wire protocol.
//!
//! There is no framing: each side writes raw UTF-8 chunks and the peer reads
//! whatever arrives in a single bounded read.
//!
//! 1. Server sends [`ACCESS_PROMPT`]
//! 2. Client sends the access code
//! 3. Server sends [`WRONG_CODE`] and closes, or [`ACCESS_GRANTED`]
//! 4. Client sends one command per write, server replies with its output
//! 5. Client sends `exit` or `quit` to end the session

/// Default TCP port for both server and client.
pub const DEFAULT_PORT: u16 = 1957;

/// First bytes the server writes on every accepted connection.
pub const ACCESS_PROMPT: &str = "Enter access code: ";

/// Sent before closing a connection that presented the wrong code.
pub const WRONG_CODE: &str = "Wrong code. Disconnecting.";

/// Sent once the access code matched.
pub const ACCESS_GRANTED: &str = "Access granted. Ready.\n";

/// Sent when the connection ceiling is reached.
pub const SERVER_BUSY: &str = "Server busy. Try again later.";

/// Token the server writes to a session it disconnects on its own.
pub const EXIT_TOKEN: &str = "exit";

/// Max bytes read for the access code.
pub const CODE_READ_LIMIT: usize = 1024;

/// Max bytes read per command.
pub const COMMAND_READ_LIMIT: usize = 4096;

/// Placeholder for a successful allow-listed shell command with no output.
pub const EMPTY_ALLOWED_OUTPUT: &str = "[OK]";

/// Placeholder for a successful unrestricted command with no output.
pub const EMPTY_UNRESTRICTED_OUTPUT: &str = "[Command executed]";

/// Decode bytes as UTF-8, replacing malformed sequences.
pub fn decode_lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Whether a received command ends the session (`exit`/`quit`, any case).
pub fn is_exit_token(input: &str) -> bool {
    let token = input.trim();
    token.eq_ignore_ascii_case("exit") || token.eq_ignore_ascii_case("quit")
}

/// Text sent when an allow-listed lookup misses.
pub fn not_allowed(token: &str) -> String {
    format!("Command '{token}' not allowed.")
}

/// Text sent when executing a command failed.
pub fn error_result(message: impl std::fmt::Display) -> String {
    format!("[Error] {message}")
}

/// Greeting sent after authentication, with the allow-list appended when
/// one is in force.
pub fn granted_banner(allowed: Option<&[String]>) -> String {
    match allowed {
        Some(tokens) if !tokens.is_empty() => {
            format!("{ACCESS_GRANTED}{}\n", tokens.join("\n"))
        }
        _ => ACCESS_GRANTED.to_string(),
    }
}
