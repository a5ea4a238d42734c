//! Rendezchat interactive client.
//!
//! Logs in to the directory server, then runs a small line shell:
//! `g` lists users, `p <user>` starts a chat and `q` quits. Incoming
//! session requests interrupt the shell with a prompt. While chatting,
//! every line goes to the peer and an empty line ends the chat.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use rendezchat::{
    ChatConfig, ChatEvent, ChatHandle, ClientSession, DEFAULT_HOST, DEFAULT_SERVER_PORT,
    DirKeyStore, Error, KeyStore, RendezvousRequest,
};

const SERVER_KEY_NAME: &str = "server";

const HELP: &str = "Commands:
    g: get list of clients
    p <user>: connect to a client
    q: quit";

#[derive(Parser)]
#[command(name = "rendezchat-client")]
#[command(about = "Client for end-to-end encrypted peer chat")]
struct Cli {
    /// Location of the server
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port the server is running on
    #[arg(short, long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Directory holding the hex-encoded key files
    #[arg(short, long, default_value = "key_pairs")]
    keys: PathBuf,

    /// Local address to accept peers on, instead of the one the server
    /// connection uses
    #[arg(long)]
    bind: Option<IpAddr>,

    /// Name of the user logging in
    user: String,
}

/// What the next line of input means.
enum Mode {
    Shell,
    /// Waiting for the name after a bare `p`.
    Target,
    /// Waiting for a yes/no on an incoming request.
    Prompt(RendezvousRequest),
    Chat(ChatHandle),
}

impl Mode {
    /// Only a bare shell stops to ask about an incoming request. Anywhere
    /// else the next line already has a meaning.
    fn takes_requests(&self) -> bool {
        matches!(self, Mode::Shell)
    }
}

/// The next event of the running chat, if there is one.
async fn chat_event(mode: &mut Mode) -> Option<ChatEvent> {
    match mode {
        Mode::Chat(chat) => chat.next_event().await,
        _ => std::future::pending().await,
    }
}

struct Shell {
    session: ClientSession,
    mode: Mode,
}

impl Shell {
    /// Handles one input line. Returns `false` when the user quits.
    async fn line(&mut self, line: String) -> bool {
        match std::mem::replace(&mut self.mode, Mode::Shell) {
            Mode::Shell => return self.command(line.trim()).await,
            Mode::Target => self.connect(line.trim()).await,
            Mode::Prompt(request) => self.answer(request, line.trim() == "y").await,
            Mode::Chat(chat) => {
                if chat.send(line.as_str()).is_err() || line.is_empty() {
                    println!("Left chat with {}", chat.peer());
                } else {
                    self.mode = Mode::Chat(chat);
                }
            }
        }
        true
    }

    async fn command(&mut self, line: &str) -> bool {
        let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
        match command {
            "" => {}
            "g" => match self.session.get_clients().await {
                Ok(names) if names.is_empty() => println!("No other users online"),
                Ok(names) => names.iter().for_each(|name| println!("  {name}")),
                Err(err) => println!("{err}"),
            },
            "p" if argument.trim().is_empty() => {
                println!("What user would you like to connect to?");
                self.mode = Mode::Target;
            }
            "p" => self.connect(argument.trim()).await,
            "q" => return false,
            _ => {
                println!("Unknown command");
                println!("{HELP}");
            }
        }
        true
    }

    async fn connect(&mut self, user: &str) {
        match self.session.request_session(user).await {
            Ok(link) => {
                println!("You are connected to user {user}");
                self.mode = Mode::Chat(self.session.start_chat(link));
            }
            Err(err) => println!("{err}"),
        }
    }

    async fn answer(&mut self, request: RendezvousRequest, accept: bool) {
        let user = request.requester().to_string();
        if !accept {
            if let Err(err) = request.decline().await {
                println!("{err}");
            }
            return;
        }

        match self.session.accept(request).await {
            Ok(link) => {
                println!("You are connected to user {user}");
                self.mode = Mode::Chat(self.session.start_chat(link));
            }
            Err(err) => println!("{err}"),
        }
    }

    async fn request(&mut self, request: RendezvousRequest) {
        if self.mode.takes_requests() {
            println!("Chat with {}? (y/n)", request.requester());
            self.mode = Mode::Prompt(request);
        } else if let Err(err) = request.decline().await {
            tracing::debug!(error = %err, "could not decline request");
        }
    }

    fn event(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Message { from, text } => println!("{from}: {text}"),
            ChatEvent::Disconnected { peer } => {
                println!("Disconnected from {peer}");
                if let Mode::Chat(chat) = std::mem::replace(&mut self.mode, Mode::Shell) {
                    let _ = chat.close();
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let keys = DirKeyStore::new(&cli.keys);
    let identity = keys
        .identity(&cli.user)
        .with_context(|| format!("Failed to load keys for {}", cli.user))?;
    let server = keys
        .public_info(SERVER_KEY_NAME)
        .context("Failed to load the server's public keys")?;

    let (session, mut requests) = match ClientSession::login(
        (cli.host.as_str(), cli.port),
        identity,
        &server,
        ChatConfig {
            bind_ip: cli.bind,
            ..ChatConfig::default()
        },
    )
    .await
    {
        Ok(login) => login,
        Err(Error::Io(err)) => return Err(err).context("Failed to connect to server"),
        Err(err) => return Err(err.into()),
    };

    let mut shell = Shell {
        session,
        mode: Mode::Shell,
    };
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    println!("{HELP}");
    loop {
        tokio::select! {
            line = stdin.next_line() => match line? {
                Some(line) => {
                    if !shell.line(line).await {
                        break;
                    }
                }
                None => break,
            },
            Some(request) = requests.recv() => shell.request(request).await,
            Some(event) = chat_event(&mut shell.mode) => shell.event(event),
        }
    }

    // Pending requests are declined by dropping them before the listener
    // is told to stop.
    let Shell { session, mode } = shell;
    if let Mode::Chat(chat) = &mode {
        let _ = chat.close();
    }
    drop(mode);
    drop(requests);
    session.logout().await?;
    Ok(())
}
