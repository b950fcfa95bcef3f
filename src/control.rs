//! The named-pipe control channel: `reload`, `snapshot`, `dump`, `check`,
//! `drop <id>`, `register <id> <addr>`, `message <to> <body>`, `stop`,
//! `restart`, per spec.md §6.
//!
//! Grounded on `process::receive`/`process::reply` in
//! `original_source/common/process.cpp`: a line may be prefixed with a
//! reply target — a bare PID (reply by `SIGUSR1`/`SIGUSR2`) or a
//! `/tmp/.reply.*` path (reply by publishing a result file) — followed by
//! a whitespace-separated command. A reply-target path containing `..`,
//! or one that isn't a bare PID or a literal `/tmp/.reply.` prefix, is
//! rejected before it ever reaches dispatch (spec.md §9's path-traversal
//! Open Question, decided in DESIGN.md).

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, warn};

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;

/// Where to send the success/failure reply for one control command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyTarget {
    Pid(i32),
    Publish(String),
}

#[derive(Debug, Clone)]
pub struct ControlCommand {
    pub reply_to: Option<ReplyTarget>,
    pub verb: String,
    pub args: Vec<String>,
}

/// Parse one control-channel line into a command, applying the original's
/// path-traversal defense to any `/`-prefixed reply target. Returns
/// `None` for a blank line or a rejected reply target (the original's
/// `goto retry`).
pub fn parse_line(line: &str) -> Option<ControlCommand> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let mut tokens = trimmed.split_whitespace();
    let first = tokens.next()?;

    let (reply_to, verb) = if first.starts_with('/') {
        if first.contains("..") || !first.starts_with("/tmp/.reply.") {
            warn!(target = first, "control: rejected malformed reply target");
            return None;
        }
        (Some(ReplyTarget::Publish(first.to_string())), tokens.next()?)
    } else if first.chars().all(|c| c.is_ascii_digit()) {
        let pid: i32 = first.parse().ok()?;
        (Some(ReplyTarget::Pid(pid)), tokens.next()?)
    } else {
        (None, first)
    };

    Some(ControlCommand {
        reply_to,
        verb: verb.to_lowercase(),
        args: tokens.map(str::to_string).collect(),
    })
}

/// `process::reply` — deliver the dispatch outcome to whichever target
/// the command line named, or do nothing if it named none.
pub fn send_reply(target: &ReplyTarget, ok: bool, message: &str) {
    match target {
        ReplyTarget::Pid(pid) => send_signal_reply(*pid, ok),
        ReplyTarget::Publish(path) => {
            let body = format!("{} {}\n", if ok { "ok" } else { "failed" }, message);
            if let Err(e) = std::fs::write(path, body) {
                warn!("control: failed to publish reply to {path}: {e}");
            }
        }
    }
}

#[cfg(unix)]
fn send_signal_reply(pid: i32, ok: bool) {
    let signal = if ok { Signal::SIGUSR1 } else { Signal::SIGUSR2 };
    if let Err(e) = kill(Pid::from_raw(pid), signal) {
        warn!("control: failed to signal pid {pid}: {e}");
    }
}

#[cfg(not(unix))]
fn send_signal_reply(_pid: i32, _ok: bool) {}

/// Owns the control fifo's lifecycle: create it at startup, run a
/// blocking read loop on a dedicated thread (the original used blocking
/// `fgets`; `tokio::net` has no portable named-pipe type, so this keeps
/// the same blocking-thread shape rather than faking async I/O on it),
/// and remove it on shutdown.
pub struct ControlChannel {
    path: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl ControlChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Create the named pipe, replacing any stale one left from a
    /// previous run.
    #[cfg(unix)]
    pub fn create_fifo(&self) -> crate::Result<()> {
        use nix::sys::stat::Mode;
        use nix::unistd::mkfifo;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _ = std::fs::remove_file(&self.path);
        mkfifo(&self.path, Mode::S_IRUSR | Mode::S_IWUSR | Mode::S_IRGRP | Mode::S_IWGRP)
            .map_err(|e| crate::Error::fatal(format!("mkfifo {} failed: {e}", self.path.display())))?;
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn create_fifo(&self) -> crate::Result<()> {
        Err(crate::Error::fatal("control channel requires a unix host"))
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Spawn the blocking read loop. `handler` runs once per parsed
    /// command and returns `(ok, message)`, which is delivered to the
    /// command's reply target, if any.
    pub fn spawn(
        self: Arc<Self>,
        handler: impl Fn(ControlCommand) -> (bool, String) + Send + Sync + 'static,
    ) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }
            let file = match OpenOptions::new().read(true).open(&self.path) {
                Ok(f) => f,
                Err(e) => {
                    error!("control: failed to open fifo {}: {e}", self.path.display());
                    return;
                }
            };
            let reader = BufReader::new(file);
            for line in reader.lines() {
                if self.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                let Ok(line) = line else { break };
                let Some(command) = parse_line(&line) else { continue };
                let reply_to = command.reply_to.clone();
                let (ok, message) = handler(command);
                if let Some(target) = reply_to {
                    send_reply(&target, ok, &message);
                }
            }
            // EOF on a fifo means the last writer closed; reopen and keep
            // serving, matching the original's retry-on-`fgets` loop.
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_command_with_no_reply_target() {
        let cmd = parse_line("snapshot").unwrap();
        assert!(cmd.reply_to.is_none());
        assert_eq!(cmd.verb, "snapshot");
        assert!(cmd.args.is_empty());
    }

    #[test]
    fn parses_pid_reply_target() {
        let cmd = parse_line("4321 drop 101").unwrap();
        assert_eq!(cmd.reply_to, Some(ReplyTarget::Pid(4321)));
        assert_eq!(cmd.verb, "drop");
        assert_eq!(cmd.args, vec!["101".to_string()]);
    }

    #[test]
    fn parses_publish_reply_target() {
        let cmd = parse_line("/tmp/.reply.abc123 check").unwrap();
        assert_eq!(cmd.reply_to, Some(ReplyTarget::Publish("/tmp/.reply.abc123".to_string())));
        assert_eq!(cmd.verb, "check");
    }

    #[test]
    fn rejects_path_traversal_in_reply_target() {
        assert!(parse_line("/tmp/.reply.foo/../../etc/passwd snapshot").is_none());
    }

    #[test]
    fn rejects_reply_target_outside_allowed_prefix() {
        assert!(parse_line("/etc/passwd snapshot").is_none());
    }

    #[test]
    fn blank_line_parses_to_none() {
        assert!(parse_line("   ").is_none());
    }

    #[test]
    fn register_command_keeps_remaining_args_in_order() {
        let cmd = parse_line("register 101 10.0.0.5:5060").unwrap();
        assert_eq!(cmd.verb, "register");
        assert_eq!(cmd.args, vec!["101".to_string(), "10.0.0.5:5060".to_string()]);
    }
}
