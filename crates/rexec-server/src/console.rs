//! Line-oriented admin console on stdin.
//!
//! Lets the operator of a headless server list and kick sessions, view,
//! clear or export the log, and stop the server.

use crate::registry::ConnectionId;
use crate::server::RexecServer;
use rexec_core::{RexecError, RexecResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use tracing::debug;

const HELP: &str = "\
commands:
  status          show run state and counts
  list            show connected clients
  kick <id>       disconnect a client
  log             print the server log
  follow on|off   stream new log lines as they arrive
  clear           empty the server log
  export <path>   write the server log as JSON
  stop            stop the server
  help            show this text
";

/// A parsed console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Status,
    List,
    Kick(ConnectionId),
    Log,
    Follow(bool),
    Clear,
    Export(PathBuf),
    Stop,
    Help,
}

impl ConsoleCommand {
    /// Parse one input line. Blank lines yield `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "" => return Ok(None),
            "status" => Self::Status,
            "list" | "ls" => Self::List,
            "kick" => {
                let id = rest
                    .parse::<ConnectionId>()
                    .map_err(|_| format!("usage: kick <id> (got {rest:?})"))?;
                Self::Kick(id)
            }
            "log" => Self::Log,
            "follow" => match rest.to_ascii_lowercase().as_str() {
                "" | "on" => Self::Follow(true),
                "off" => Self::Follow(false),
                _ => return Err("usage: follow on|off".into()),
            },
            "clear" => Self::Clear,
            "export" => {
                if rest.is_empty() {
                    return Err("usage: export <path>".into());
                }
                Self::Export(PathBuf::from(rest))
            }
            "stop" => Self::Stop,
            "help" | "?" => Self::Help,
            other => return Err(format!("unknown command '{other}', try 'help'")),
        };
        Ok(Some(command))
    }
}

/// Read commands until input ends, `stop` is entered, or the server stops.
pub async fn run_console<R, W>(server: Arc<RexecServer>, input: R, mut output: W) -> RexecResult<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut live = server.log().subscribe();
    let mut following = false;
    write_out(&mut output, "admin console ready, type 'help'\n").await?;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            entry = live.recv(), if following => {
                match entry {
                    Ok(entry) => write_out(&mut output, &format!("{entry}\n")).await?,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        write_out(&mut output, &format!("[{skipped} log lines skipped]\n")).await?
                    }
                    Err(broadcast::error::RecvError::Closed) => following = false,
                }
                continue;
            }
            _ = server.stopping() => break,
        };
        let Some(line) = line else {
            debug!("console input closed");
            break;
        };

        match ConsoleCommand::parse(&line) {
            Ok(None) => {}
            Ok(Some(ConsoleCommand::Follow(on))) => {
                if on && !following {
                    // Only lines appended from here on.
                    live = live.resubscribe();
                }
                following = on;
                let reply = if on { "following log\n" } else { "stopped following log\n" };
                write_out(&mut output, reply).await?;
            }
            Ok(Some(command)) => {
                let stop = command == ConsoleCommand::Stop;
                let reply = execute(&server, command).await;
                write_out(&mut output, &reply).await?;
                if stop {
                    break;
                }
            }
            Err(message) => write_out(&mut output, &format!("{message}\n")).await?,
        }
    }
    Ok(())
}

async fn execute(server: &RexecServer, command: ConsoleCommand) -> String {
    match command {
        ConsoleCommand::Status => {
            let log = server.log();
            format!(
                "state: {:?}\nclients: {}\nlog: {}/{} entries\n",
                server.run_state(),
                server.session_count().await,
                log.len(),
                log.capacity()
            )
        }
        ConsoleCommand::List => {
            let sessions = server.list_sessions().await;
            if sessions.is_empty() {
                return "no clients connected\n".into();
            }
            let mut out = format!("{:<6} {:<24} {}\n", "ID", "ADDRESS", "CONNECTED");
            for s in sessions {
                out.push_str(&format!(
                    "{:<6} {:<24} {}\n",
                    s.id,
                    s.address,
                    s.connected_at.format("%Y-%m-%d %H:%M:%S")
                ));
            }
            out
        }
        ConsoleCommand::Kick(id) => {
            if server.disconnect_session(id).await {
                format!("disconnected client {id}\n")
            } else {
                format!("no client with id {id}\n")
            }
        }
        ConsoleCommand::Log => {
            let log = server.log();
            if log.is_empty() {
                "log is empty\n".into()
            } else {
                format!("{}\n", log.render())
            }
        }
        ConsoleCommand::Clear => {
            let removed = server.log().clear();
            format!("cleared {removed} log entries\n")
        }
        ConsoleCommand::Export(path) => match export_log(server, &path) {
            Ok(count) => format!("wrote {count} entries to {}\n", path.display()),
            Err(e) => format!("export failed: {e}\n"),
        },
        ConsoleCommand::Stop => {
            if server.request_shutdown() {
                "stopping server\n".into()
            } else {
                "server is not running\n".into()
            }
        }
        ConsoleCommand::Follow(_) => String::new(),
        ConsoleCommand::Help => HELP.to_string(),
    }
}

/// Write the current log snapshot to `path` as a JSON array.
pub fn export_log(server: &RexecServer, path: &Path) -> RexecResult<usize> {
    let entries = server.log().snapshot();
    let json = serde_json::to_string_pretty(&entries)
        .map_err(|e| RexecError::Other(format!("log serialize error: {e}")))?;
    std::fs::write(path, json)?;
    Ok(entries.len())
}

async fn write_out<W: AsyncWrite + Unpin>(output: &mut W, text: &str) -> RexecResult<()> {
    output.write_all(text.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;

    #[test]
    fn parse_commands() {
        assert_eq!(ConsoleCommand::parse("list"), Ok(Some(ConsoleCommand::List)));
        assert_eq!(ConsoleCommand::parse("  LS  "), Ok(Some(ConsoleCommand::List)));
        assert_eq!(ConsoleCommand::parse("kick 7"), Ok(Some(ConsoleCommand::Kick(7))));
        assert_eq!(
            ConsoleCommand::parse("export /tmp/rexec log.json"),
            Ok(Some(ConsoleCommand::Export(PathBuf::from("/tmp/rexec log.json"))))
        );
        assert_eq!(ConsoleCommand::parse("stop"), Ok(Some(ConsoleCommand::Stop)));
        assert_eq!(ConsoleCommand::parse("Clear"), Ok(Some(ConsoleCommand::Clear)));
        assert_eq!(ConsoleCommand::parse("?"), Ok(Some(ConsoleCommand::Help)));
        assert_eq!(ConsoleCommand::parse("follow"), Ok(Some(ConsoleCommand::Follow(true))));
        assert_eq!(ConsoleCommand::parse("follow OFF"), Ok(Some(ConsoleCommand::Follow(false))));
        assert_eq!(ConsoleCommand::parse("   "), Ok(None));
    }

    #[test]
    fn parse_errors() {
        assert!(ConsoleCommand::parse("kick").is_err());
        assert!(ConsoleCommand::parse("kick abc").is_err());
        assert!(ConsoleCommand::parse("export").is_err());
        assert!(ConsoleCommand::parse("follow maybe").is_err());
        assert!(ConsoleCommand::parse("reboot").unwrap_err().contains("unknown command"));
    }

    fn server() -> Arc<RexecServer> {
        let config = ServerConfig {
            bind_address: "127.0.0.1".into(),
            stop_flag_enabled: false,
            ..ServerConfig::default()
        };
        Arc::new(RexecServer::new(config).unwrap())
    }

    #[tokio::test]
    async fn script_runs_until_input_ends() {
        let server = server();
        let input: &[u8] = b"status\nlist\nkick 3\nbogus\nhelp\n";
        let mut output = Vec::new();
        run_console(server, input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("state: Idle\nclients: 0\nlog: 0/200 entries"));
        assert!(text.contains("no clients connected"));
        assert!(text.contains("no client with id 3"));
        assert!(text.contains("unknown command 'bogus'"));
        assert!(text.contains("kick <id>"));
    }

    #[tokio::test]
    async fn clear_empties_the_log() {
        let server = server();
        server.log().append("[Connected] 10.0.0.9:5000");
        server.log().append("[Disconnected] 10.0.0.9:5000");

        let input: &[u8] = b"clear\nlog\n";
        let mut output = Vec::new();
        run_console(server.clone(), input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("cleared 2 log entries"));
        assert!(text.contains("log is empty"));
        assert!(server.log().is_empty());
    }

    #[tokio::test]
    async fn export_writes_json_array() {
        let server = server();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.json");

        let input = format!("log\nexport {}\n", path.display());
        let mut output = Vec::new();
        run_console(server.clone(), input.as_bytes(), &mut output)
            .await
            .unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("log is empty"));
        assert!(text.contains("wrote 0 entries"));
        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed, serde_json::json!([]));
    }

    #[tokio::test]
    async fn follow_streams_new_entries() {
        use tokio::io::AsyncReadExt;

        let server = server();
        let (mut input_tx, input_rx) = tokio::io::duplex(1024);
        let (output_tx, mut output_rx) = tokio::io::duplex(4096);
        let console = tokio::spawn(run_console(
            server.clone(),
            tokio::io::BufReader::new(input_rx),
            output_tx,
        ));

        async fn read_until(rx: &mut tokio::io::DuplexStream, needle: &str) -> String {
            let mut seen = String::new();
            let mut buf = [0u8; 512];
            while !seen.contains(needle) {
                let n = rx.read(&mut buf).await.unwrap();
                assert!(n > 0, "console output closed before {needle:?}");
                seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            }
            seen
        }

        input_tx.write_all(b"follow on\n").await.unwrap();
        read_until(&mut output_rx, "following log").await;

        server.log().append("[Connected] 10.0.0.9:5000");
        let seen = read_until(&mut output_rx, "[Connected] 10.0.0.9:5000").await;
        assert!(seen.contains("  [Connected] 10.0.0.9:5000\n"));

        drop(input_tx);
        tokio::time::timeout(std::time::Duration::from_secs(5), console)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
