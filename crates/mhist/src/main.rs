//! mhist keeps shell sessions and their scrollback alive across
//! disconnects. A detached session process owns the PTY; `new`/`attach`
//! front-ends connect to it over a Unix socket and relay the terminal.

mod buffer;
mod client;
mod mouse;
mod protocol;
mod session;
mod terminal;

use std::env;
use std::fs;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{self, Command, Stdio};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::protocol::Message;
use crate::session::{socket_dir, Session, SessionInfo};

const USAGE: &str = "\
Usage: mhist [command] [options]

Commands:
  new [-n name]       Create a new session
  attach [name|id]    Attach to an existing session
  ls                  List sessions
  kill [name|id]      Kill a session

Options:
  --help              Show this help message

With no arguments, attaches to the most recent session or creates a new one.

Prefix key: Ctrl+a
  Ctrl+a d            Detach from session
  Ctrl+a [            Browse scrollback history
  Ctrl+a Ctrl+a       Send literal Ctrl+a";

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    // --session-id=X switches the binary into session-runtime mode
    if let Some(id) = args.iter().find_map(|a| a.strip_prefix("--session-id=")) {
        let name = args
            .iter()
            .find_map(|a| a.strip_prefix("--name="))
            .unwrap_or("");
        run_session(id, name).await;
        return;
    }

    match args.first().map(String::as_str) {
        None => cmd_default().await,
        Some("new") => {
            let mut name = String::new();
            let mut i = 1;
            while i < args.len() {
                if args[i] == "-n" && i + 1 < args.len() {
                    name = args[i + 1].clone();
                    i += 1;
                }
                i += 1;
            }
            cmd_new(&name).await;
        }
        Some("attach") => cmd_attach(args.get(1).map(String::as_str).unwrap_or("")).await,
        Some("ls") => cmd_list(),
        Some("kill") => match args.get(1) {
            Some(target) => cmd_kill(target).await,
            None => {
                eprintln!("Usage: mhist kill [name|id]");
                process::exit(1);
            }
        },
        Some("--help" | "-h" | "help") => println!("{USAGE}"),
        Some(other) => {
            eprintln!("Unknown command: {other}");
            eprintln!("{USAGE}");
            process::exit(1);
        }
    }
}

/// Session-process entry. The dispatcher redirected stdout/stderr into
/// the session's log file, so the subscriber writes plain text there.
async fn run_session(id: &str, name: &str) {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_writer(io::stderr)
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    info!("session starting: id={id} name={name}");
    let session = match Session::start(id, name, None) {
        Ok(session) => session,
        Err(err) => {
            error!("failed to create session: {err}");
            process::exit(1);
        }
    };
    session.run().await;
}

// ── Commands ────────────────────────────────────────────────────────

async fn cmd_new(name: &str) {
    let id = generate_id();
    let name = if name.is_empty() {
        id[..8].to_string()
    } else {
        name.to_string()
    };

    let socket_path = match launch_session_process(&id, &name).await {
        Ok(path) => path,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };

    attach_and_report(&socket_path, &name).await;
}

async fn cmd_attach(target: &str) {
    let sessions = list_sessions();
    match find_session(&sessions, target) {
        Ok(info) => attach_and_report(&info.socket, &info.name).await,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    }
}

async fn cmd_default() {
    let sessions = list_sessions();
    if let Some(info) = sessions.last() {
        attach_and_report(&info.socket, &info.name).await;
    } else {
        cmd_new("").await;
    }
}

fn cmd_list() {
    println!(
        "{:<8}  {:<15}  {:<20}  {}",
        "ID", "NAME", "CREATED", "STATUS"
    );
    for info in list_sessions() {
        let short_id = if info.id.len() > 8 {
            &info.id[..8]
        } else {
            &info.id
        };
        let status = if process_alive(info.pid) {
            "alive"
        } else {
            "dead"
        };
        println!(
            "{:<8}  {:<15}  {:<20}  {}",
            short_id, info.name, info.created, status
        );
    }
}

async fn cmd_kill(target: &str) {
    let sessions = list_sessions();
    let info = match find_session(&sessions, target) {
        Ok(info) => info,
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    };

    // Ask the session to tear itself down
    if let Ok(mut stream) = tokio::net::UnixStream::connect(&info.socket).await {
        if protocol::write_message(&mut stream, &Message::kill())
            .await
            .is_ok()
        {
            let _ = stream.shutdown().await;
            println!("killed session {}", info.name);
            return;
        }
    }

    // Fall back to signalling the recorded pid
    unsafe {
        libc::kill(info.pid, libc::SIGKILL);
    }
    println!("killed session {} (via signal)", info.name);

    // Clean up whatever the process left behind
    let _ = fs::remove_file(&info.socket);
    let _ = fs::remove_file(socket_dir().join(format!("{}.json", info.id)));
}

async fn attach_and_report(socket_path: &Path, name: &str) {
    match client::attach(socket_path).await {
        Ok(true) => eprintln!("detached from session {name}"),
        Ok(false) => eprintln!("session ended"),
        Err(err) => {
            eprintln!("Error: {err}");
            process::exit(1);
        }
    }
}

// ── Session discovery / spawning ────────────────────────────────────

/// Spawn the detached session process (this same binary in session mode,
/// stdout/stderr into the log file, its own session group) and wait for
/// its socket to appear.
async fn launch_session_process(id: &str, name: &str) -> io::Result<PathBuf> {
    let self_exe = env::current_exe()?;
    let dir = socket_dir();
    session::create_private_dir(&dir)?;

    let log_path = dir.join(format!("{id}.log"));
    let log = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(&log_path)?;
    let log_err = log.try_clone()?;

    let mut cmd = Command::new(self_exe);
    cmd.arg(format!("--session-id={id}"))
        .arg(format!("--name={name}"))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    unsafe {
        cmd.pre_exec(|| {
            // Own session group, so hangups on this terminal don't reach it
            libc::setsid();
            Ok(())
        });
    }
    cmd.spawn()?;

    let socket_path = dir.join(format!("{id}.sock"));
    for _ in 0..50 {
        if socket_path.exists() {
            return Ok(socket_path);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    Err(io::Error::new(
        io::ErrorKind::TimedOut,
        "session socket did not appear within 5 seconds",
    ))
}

/// Scan the endpoint directory for session info files, deleting entries
/// whose process is gone. Sorted oldest-first, so the last element is
/// the most recent session.
fn list_sessions() -> Vec<SessionInfo> {
    let dir = socket_dir();
    let Ok(entries) = fs::read_dir(&dir) else {
        return Vec::new();
    };

    let mut sessions = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let Ok(data) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(info) = serde_json::from_str::<SessionInfo>(&data) else {
            continue;
        };

        if !process_alive(info.pid) {
            // Stale leftovers from a crashed session
            let _ = fs::remove_file(&info.socket);
            let _ = fs::remove_file(&path);
            continue;
        }
        sessions.push(info);
    }

    sessions.sort_by(|a, b| a.created.cmp(&b.created));
    sessions
}

fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Find a session by exact name, then by id prefix. An empty target
/// picks the most recent session.
fn find_session<'a>(
    sessions: &'a [SessionInfo],
    target: &str,
) -> Result<&'a SessionInfo, String> {
    if target.is_empty() {
        return sessions
            .last()
            .ok_or_else(|| "no sessions found".to_string());
    }
    if let Some(info) = sessions.iter().find(|s| s.name == target) {
        return Ok(info);
    }
    if let Some(info) = sessions.iter().find(|s| s.id.starts_with(target)) {
        return Ok(info);
    }
    Err(format!("session not found: {target}"))
}

/// 128-bit random identifier, hex-grouped like a UUID.
fn generate_id() -> String {
    let bytes: [u8; 16] = rand::random();
    let hex = |range: std::ops::Range<usize>| -> String {
        bytes[range].iter().map(|b| format!("{b:02x}")).collect()
    };
    format!(
        "{}-{}-{}-{}-{}",
        hex(0..4),
        hex(4..6),
        hex(6..8),
        hex(8..10),
        hex(10..16)
    )
}

// ── Unit tests ──────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, name: &str, created: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            name: name.to_string(),
            pid: 1,
            created: created.to_string(),
            socket: PathBuf::from(format!("/tmp/{id}.sock")),
        }
    }

    #[test]
    fn find_session_by_exact_name() {
        let sessions = vec![
            info("aabbccdd-0000", "work", "2026-01-01T00:00:00Z"),
            info("11223344-0000", "mail", "2026-01-02T00:00:00Z"),
        ];
        let found = find_session(&sessions, "mail").unwrap();
        assert_eq!(found.id, "11223344-0000");
    }

    #[test]
    fn find_session_by_id_prefix() {
        let sessions = vec![
            info("aabbccdd-0000", "work", "2026-01-01T00:00:00Z"),
            info("11223344-0000", "mail", "2026-01-02T00:00:00Z"),
        ];
        let found = find_session(&sessions, "aabb").unwrap();
        assert_eq!(found.name, "work");
    }

    #[test]
    fn find_session_name_beats_id_prefix() {
        // A name that also happens to prefix another session's id
        let sessions = vec![
            info("abc11111-0000", "x", "2026-01-01T00:00:00Z"),
            info("99999999-0000", "abc", "2026-01-02T00:00:00Z"),
        ];
        let found = find_session(&sessions, "abc").unwrap();
        assert_eq!(found.id, "99999999-0000");
    }

    #[test]
    fn find_session_empty_target_picks_last() {
        let sessions = vec![
            info("aaaa", "old", "2026-01-01T00:00:00Z"),
            info("bbbb", "new", "2026-01-02T00:00:00Z"),
        ];
        let found = find_session(&sessions, "").unwrap();
        assert_eq!(found.name, "new");
    }

    #[test]
    fn find_session_errors() {
        assert_eq!(
            find_session(&[], "").unwrap_err(),
            "no sessions found"
        );
        let sessions = vec![info("aaaa", "x", "2026-01-01T00:00:00Z")];
        assert_eq!(
            find_session(&sessions, "zzz").unwrap_err(),
            "session not found: zzz"
        );
    }

    #[test]
    fn generated_id_shape() {
        let id = generate_id();
        assert_eq!(id.len(), 36);
        for (i, c) in id.char_indices() {
            if matches!(i, 8 | 13 | 18 | 23) {
                assert_eq!(c, '-');
            } else {
                assert!(c.is_ascii_hexdigit() && !c.is_ascii_uppercase());
            }
        }
    }

    #[test]
    fn generated_ids_differ() {
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn default_name_is_id_head() {
        let id = generate_id();
        let name = &id[..8];
        assert_eq!(name.len(), 8);
        assert!(name.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
