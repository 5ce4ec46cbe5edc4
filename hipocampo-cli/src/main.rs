//! hipocampo: terminal client for the Hipocampo memory agent.
//!
//! # Subcommands
//! - `chat` (default): interactive session with sign-in, chat and voice notes
//! - `login --phone <n>` / `register --name <n> --phone <n>`: sign in once
//! - `logout`, `whoami`: manage the stored user
//! - `send <text>`: one message on the stored session, prints the reply
//! - `clear`: forget the agent session

mod render;
mod repl;

use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use hipocampo_core::config::AudioConfig;
use hipocampo_core::models::{MessageKind, Sender};
use hipocampo_core::phone::format_phone;
use hipocampo_core::{
    ApiClient, App, AudioRecorder, HipocampoConfig, JsonFileStore, KeyValueStore, MediaDevices,
    PlaybackSink,
};
use tracing_subscriber::{fmt, EnvFilter};

use crate::render::render_message;
use crate::repl::Repl;

// ============================================================================
// CLI Definition
// ============================================================================

#[derive(Debug, Parser)]
#[command(
    name = "hipocampo",
    version,
    about = "Hipocampo: converse com seu agente de memória pelo terminal"
)]
struct Cli {
    /// Config file (defaults to ./hipocampo.toml when present)
    #[arg(short, long)]
    config: Option<String>,

    /// Agent API base URL (overrides HIPOCAMPO_API_URL env var)
    #[arg(long, env = "HIPOCAMPO_API_URL")]
    api_url: Option<String>,

    /// Agent API key (overrides HIPOCAMPO_API_KEY env var)
    #[arg(long, env = "HIPOCAMPO_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Interactive chat (default)
    Chat,

    /// Sign in with an existing phone number
    Login {
        #[arg(long)]
        phone: String,
    },

    /// Create an account and sign in
    Register {
        #[arg(long)]
        name: String,

        #[arg(long)]
        phone: String,
    },

    /// Forget the stored user and agent session
    Logout,

    /// Show the stored user
    Whoami,

    /// Send one message and print the reply
    Send {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },

    /// Forget the agent session; the next message starts a new one
    Clear,
}

// ============================================================================
// Setup
// ============================================================================

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // stderr keeps the transcript on stdout clean
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<HipocampoConfig> {
    let source = cli.config.as_deref().unwrap_or("hipocampo.toml");
    let mut config = HipocampoConfig::load(cli.config.as_deref())
        .with_context(|| format!("failed to load config from {source}"))?;
    if let Some(url) = &cli.api_url {
        config.api.base_url = url.clone();
    }
    if let Some(key) = &cli.api_key {
        config.api.api_key = key.clone();
    }
    Ok(config)
}

#[cfg(feature = "microphone")]
fn audio_backend(config: &AudioConfig) -> (Arc<dyn MediaDevices>, Box<dyn PlaybackSink>) {
    use hipocampo_core::{CpalDevices, CpalPlayback};
    (
        Arc::new(CpalDevices::new(config)),
        Box::new(CpalPlayback::new()),
    )
}

#[cfg(not(feature = "microphone"))]
fn audio_backend(_config: &AudioConfig) -> (Arc<dyn MediaDevices>, Box<dyn PlaybackSink>) {
    use hipocampo_core::{SilentPlayback, UnavailableDevices};
    (Arc::new(UnavailableDevices), Box::new(SilentPlayback))
}

// ============================================================================
// One-shot commands
// ============================================================================

async fn run(cli: Cli, config: HipocampoConfig) -> anyhow::Result<()> {
    let api = Arc::new(ApiClient::new(&config.api).context("cannot create API client")?);
    let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(&config.storage.path));
    tracing::debug!(
        base_url = %api.base_url(),
        store = %config.storage.path.display(),
        "Starting"
    );
    let mut app = App::open(api, store);

    match cli.command.unwrap_or(Commands::Chat) {
        Commands::Chat => {
            let (devices, playback) = audio_backend(&config.audio);
            let recorder = AudioRecorder::new(devices, playback, &config.audio)
                .with_object_urls(app.object_urls().clone());
            Repl::new(&mut app, recorder).run().await?;
        }
        Commands::Login { phone } => {
            let user = app.login(&phone).await?;
            println!("Olá, {}!", user.name);
        }
        Commands::Register { name, phone } => {
            let user = app.register(&name, &phone).await?;
            println!("Conta criada. Olá, {}!", user.name);
        }
        Commands::Logout => {
            app.logout();
            println!("Sessão encerrada.");
        }
        Commands::Whoami => match app.current_user() {
            Some(user) => {
                println!("Nome:     {}", user.name);
                println!("Telefone: {}", format_phone(&user.phone_number));
                println!("ID:       {}", user.id);
                if let Some(session) = app.chat().and_then(|c| c.session_id()) {
                    println!("Sessão:   {session}");
                }
            }
            None => println!("Nenhum usuário conectado."),
        },
        Commands::Send { text } => {
            let chat = app.chat().ok_or_else(not_signed_in)?;
            let outcome = chat.send_text(&text.join(" ")).await;
            for message in chat.messages() {
                if message.sender == Sender::User && message.kind == MessageKind::Text {
                    continue;
                }
                println!("{}", render_message(&message));
            }
            if !outcome.is_replied() {
                return Err(anyhow!(chat
                    .error()
                    .unwrap_or_else(|| "nada foi enviado".to_string())));
            }
        }
        Commands::Clear => {
            let chat = app.chat().ok_or_else(not_signed_in)?;
            chat.clear();
            println!("Conversa limpa.");
        }
    }
    Ok(())
}

fn not_signed_in() -> anyhow::Error {
    anyhow!("Nenhum usuário conectado. Use `hipocampo login --phone <número>`.")
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() {
    // .env is a dev convenience; real env vars win
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("hipocampo: {e:#}");
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.level);

    if let Err(e) = run(cli, config).await {
        eprintln!("hipocampo: {e:#}");
        std::process::exit(1);
    }
}

// ============================================================================
// Tests
// ============================================================================
