//! `pbxctl` — control-channel client. Writes one line to the running
//! engine's fifo and waits for the reply (a published `/tmp/.reply.*`
//! file), talking to a named-pipe control channel instead of an HTTP
//! management port.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "pbxctl")]
#[command(about = "sipwitch-pbx control-channel client")]
#[command(version = sipwitch_pbx::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the running engine's control fifo
    #[arg(short, long, default_value = "/tmp/sipwitch-pbx/control")]
    socket: PathBuf,

    /// How long to wait for a reply before giving up
    #[arg(long, default_value = "2000")]
    timeout_ms: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Reload configuration (runtime no-op; see `check`)
    Reload,
    /// Print the live call/session/registry snapshot
    Snapshot,
    /// Print the snapshot plus provisioned-but-unregistered profiles
    Dump,
    /// Liveness check
    Check,
    /// Drop a registry entry's binding
    Drop { id: String },
    /// Inject a registration without a real REGISTER
    Register { id: String, addr: String },
    /// Queue an offline message for a user
    Message { to: String, body: Vec<String> },
    /// Stop the running engine
    Stop,
    /// Stop the running engine and request a restart
    Restart,
}

fn main() {
    let cli = Cli::parse();
    let line = render_command(&cli.command);

    match send_and_wait(&cli.socket, &line, Duration::from_millis(cli.timeout_ms)) {
        Ok(reply) => {
            println!("{reply}");
        }
        Err(e) => {
            eprintln!("pbxctl: {e}");
            std::process::exit(1);
        }
    }
}

fn render_command(command: &Commands) -> String {
    match command {
        Commands::Reload => "reload".to_string(),
        Commands::Snapshot => "snapshot".to_string(),
        Commands::Dump => "dump".to_string(),
        Commands::Check => "check".to_string(),
        Commands::Drop { id } => format!("drop {id}"),
        Commands::Register { id, addr } => format!("register {id} {addr}"),
        Commands::Message { to, body } => format!("message {to} {}", body.join(" ")),
        Commands::Stop => "stop".to_string(),
        Commands::Restart => "restart".to_string(),
    }
}

/// Write `command`, prefixed with a `/tmp/.reply.<pid>` reply-target
/// token the engine's control channel recognizes, then poll for the
/// reply file it publishes.
fn send_and_wait(socket: &PathBuf, command: &str, timeout: Duration) -> std::io::Result<String> {
    use std::io::Write;

    let reply_path = format!("/tmp/.reply.pbxctl.{}", std::process::id());
    let _ = std::fs::remove_file(&reply_path);

    {
        let mut fifo = std::fs::OpenOptions::new().write(true).open(socket)?;
        writeln!(fifo, "{reply_path} {command}")?;
    }

    let deadline = std::time::Instant::now() + timeout;
    loop {
        if let Ok(body) = std::fs::read_to_string(&reply_path) {
            let _ = std::fs::remove_file(&reply_path);
            return Ok(body.trim().to_string());
        }
        if std::time::Instant::now() >= deadline {
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no reply from control channel",
            ));
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_drop_command() {
        assert_eq!(render_command(&Commands::Drop { id: "101".to_string() }), "drop 101");
    }

    #[test]
    fn render_message_command_joins_body_words() {
        let cmd = Commands::Message {
            to: "101".to_string(),
            body: vec!["hello".to_string(), "there".to_string()],
        };
        assert_eq!(render_command(&cmd), "message 101 hello there");
    }

    #[test]
    fn render_register_command() {
        let cmd = Commands::Register {
            id: "101".to_string(),
            addr: "10.0.0.5:5060".to_string(),
        };
        assert_eq!(render_command(&cmd), "register 101 10.0.0.5:5060");
    }
}
