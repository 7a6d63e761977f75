// CLI entry point: host a lifesim session or join one, with a line console.
//
// Usage:
//   lifesim [--config <FILE>] [--log-level <LEVEL>] host [--bind <ADDR>] [--port <PORT>]
//           [--lock <FILE>] [--name <NAME>] [--attrs <JSON>]
//   lifesim [--config <FILE>] [--log-level <LEVEL>] join --name <NAME> [--host <ADDR>]
//           [--port <PORT>] [--attrs <JSON>]
//
// Console commands (stdin):
//   /start [text]    start the game (host) or ask the host to (peer)
//   /players         print the registry
//   /update <JSON>   merge attributes into your own participant
//   /quit            leave the session
//   anything else    chat
//
// Incoming traffic is printed as it arrives. `RUST_LOG` overrides
// `--log-level`.

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use lifesim_protocol::{AttributeBag, Message};
use lifesim_session::{
    GameClock, PreconditionError, RegistrySnapshot, Session, SessionError, SessionFileConfig,
    UpsertMode,
};
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const CONSOLE_TICK: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "lifesim")]
#[command(about = "Host or join a lifesim multiplayer session")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML config file with [host] and [peer] tables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Command {
    /// Host a session on this machine
    Host {
        /// Address to listen on
        #[arg(long)]
        bind: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Single-host lock file
        #[arg(long)]
        lock: Option<PathBuf>,
        /// Join as a participant too
        #[arg(short, long)]
        name: Option<String>,
        /// Initial attributes as a JSON object
        #[arg(long, default_value = "{}")]
        attrs: String,
    },
    /// Join a session hosted elsewhere
    Join {
        #[arg(short, long)]
        name: String,
        #[arg(long)]
        host: Option<String>,
        #[arg(short, long)]
        port: Option<u16>,
        /// Initial attributes as a JSON object
        #[arg(long, default_value = "{}")]
        attrs: String,
    },
}

/// Why the CLI gave up.
#[derive(Debug, Error)]
enum CliError {
    #[error("--attrs must be a JSON object: {0}")]
    Attrs(#[from] serde_json::Error),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Precondition(#[from] PreconditionError),
}

fn init_logging(level: &str) {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with(tracing_subscriber::fmt::layer().with_target(false).compact())
        .init();
}

fn parse_attrs(json: &str) -> Result<AttributeBag, CliError> {
    Ok(serde_json::from_str(json)?)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let file = match &cli.config {
        Some(path) => SessionFileConfig::load(path)?,
        None => SessionFileConfig::default(),
    };
    let clock = GameClock::default();
    let mut session = Session::new();

    match cli.command {
        Command::Host {
            bind,
            port,
            lock,
            name,
            attrs,
        } => {
            let mut config = file.host;
            if let Some(bind) = bind {
                config.bind_address = bind;
            }
            if let Some(port) = port {
                config.port = port;
            }
            if let Some(lock) = lock {
                config.lock_path = lock;
            }
            let attributes = parse_attrs(&attrs)?;
            session.host(&config, clock)?;
            if let Some(host) = session.as_host() {
                println!("Hosting on {}", host.local_addr());
                if let Some(name) = name {
                    host.join_local(&name, attributes)?;
                }
            }
        }
        Command::Join {
            name,
            host,
            port,
            attrs,
        } => {
            let mut config = file.peer;
            if let Some(host) = host {
                config.host = host;
            }
            if let Some(port) = port {
                config.port = port;
            }
            let attributes = parse_attrs(&attrs)?;
            session.join(&config, clock)?;
            if let Some(peer) = session.as_peer_mut() {
                println!("Connected to {}", config.host_addr());
                peer.join(&name, attributes)?;
            }
        }
    }

    console(&mut session);
    session.disconnect();
    info!("bye");
    Ok(())
}

enum Input {
    Start(String),
    Players,
    Update(String),
    Quit,
    Chat(String),
}

fn parse_input(line: &str) -> Option<Input> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
    Some(match cmd {
        "/start" => Input::Start(rest.trim().to_owned()),
        "/players" => Input::Players,
        "/update" => Input::Update(rest.trim().to_owned()),
        "/quit" => Input::Quit,
        _ => Input::Chat(line.to_owned()),
    })
}

fn console(session: &mut Session) {
    let (tx, lines) = mpsc::channel();
    thread::spawn(move || {
        for line in std::io::stdin().lock().lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    loop {
        for msg in incoming(session) {
            print_message(&msg);
        }
        if session.phase() == lifesim_session::Phase::Terminated {
            println!("Session ended.");
            return;
        }
        let line = match lines.recv_timeout(CONSOLE_TICK) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => return,
        };
        let Some(input) = parse_input(&line) else {
            continue;
        };
        let outcome = match input {
            Input::Quit => return,
            Input::Players => {
                print_players(&session.snapshot());
                Ok(())
            }
            Input::Start(text) => start(session, &text),
            Input::Update(json) => match parse_attrs(&json) {
                Ok(attrs) => update(session, attrs),
                Err(e) => {
                    println!("{e}");
                    Ok(())
                }
            },
            Input::Chat(text) => chat(session, &text),
        };
        if let Err(e) = outcome {
            warn!("{e}");
        }
    }
}

fn incoming(session: &Session) -> Vec<Message> {
    match session {
        Session::Host(host) => host.poll(),
        Session::Peer(peer) => peer.poll(),
        Session::Idle => Vec::new(),
    }
}

fn start(session: &mut Session, text: &str) -> Result<(), SessionError> {
    match session {
        Session::Host(host) => Ok(host.start_game(text)?),
        Session::Peer(peer) => peer.request_start(text),
        Session::Idle => Ok(()),
    }
}

fn update(session: &mut Session, attrs: AttributeBag) -> Result<(), SessionError> {
    match session {
        Session::Host(host) => Ok(host.publish_update(attrs, UpsertMode::Merge)?),
        Session::Peer(peer) => peer.publish_update(attrs, UpsertMode::Merge),
        Session::Idle => Ok(()),
    }
}

fn chat(session: &mut Session, text: &str) -> Result<(), SessionError> {
    match session {
        Session::Host(host) => Ok(host.send_chat(text)?),
        Session::Peer(peer) => peer.send_chat(text),
        Session::Idle => Ok(()),
    }
}

fn print_players(snapshot: &RegistrySnapshot) {
    println!("{} participant(s):", snapshot.len());
    for state in snapshot.values() {
        let attrs = serde_json::to_string(&state.attributes).unwrap_or_default();
        println!(
            "  {} [{}] {} (updated {})",
            state.name,
            state.archetype().as_str(),
            attrs,
            state.updated_at
        );
    }
}

fn print_message(msg: &Message) {
    match msg {
        Message::Roster { participants } => println!("* {} in the lobby", participants.len()),
        Message::Joined { name, .. } => println!("* {name} joined"),
        Message::Left { name } => println!("* {name} left"),
        Message::Chat { sender, text, .. } => println!("<{sender}> {text}"),
        Message::GameStart { host, message } => println!("* {host} started the game: {message}"),
        Message::SocialInteraction { from, to, kind, text } => {
            println!("* {from} → {to} ({kind}): {text}");
        }
        Message::Death { name, reason, at } => println!("* {name} died at {at}: {reason}"),
        Message::Update { .. } | Message::Join { .. } => {}
    }
}
