//! Headless host for SAM: drives the turn orchestrator from stdin.
//!
//! Commands: `/mic` toggles listening, `/stop` stops listening and any reply
//! being generated, `/talk` toggles hands-free mode, `/quit` exits. The
//! profile is edited with `/name <name>`, `/traits <first> <second>` and
//! `/voice <female|male> <uk|us>`. Any other line is sent as a typed message.

use anyhow::Context;
use clap::Parser;
use sam::config::CompanionConfig;
use sam::models::{ModelAssetManager, NativeEngines};
use sam::permissions::PermissionGate;
use sam::pipeline::TurnOrchestrator;
use sam::profile::UserProfile;
use sam::progress::ProgressEvent;
use sam::runtime::RuntimeEvent;
use sam::session::SessionContext;
use sam::startup::{self, SharedProgress};
use sam::store::ConversationStore;
use sam::voice::capture::CpalCapture;
use sam::voice::{KokoroSynthesizer, VoiceSession};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// SAM: offline voice and text companion.
#[derive(Parser)]
#[command(name = "sam-host", version, about)]
struct Cli {
    /// Path to TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Download missing or corrupted model artifacts before starting.
    #[arg(long)]
    download: bool,

    /// Print flag changes as JSON lines.
    #[arg(long)]
    json_flags: bool,

    /// List audio input devices and exit.
    #[arg(long)]
    list_devices: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = sam::logging::init(&sam::app_dirs::logs_dir())?;

    if cli.list_devices {
        for name in CpalCapture::list_input_devices()? {
            println!("{name}");
        }
        return Ok(());
    }

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(CompanionConfig::default_config_path);
    let config = CompanionConfig::load_or_default(&config_path)
        .with_context(|| format!("reading {}", config_path.display()))?;
    info!(path = %config_path.display(), "configuration loaded");

    let store = Arc::new(
        ConversationStore::open(&config.store.database_path).context("opening conversation store")?,
    );
    let stored = store.profile()?;
    let first_run = stored.is_none();
    let profile = stored.unwrap_or_default();
    let ctx = Arc::new(SessionContext::new(config.clone(), profile));

    let factory = Arc::new(NativeEngines::new(&config.llm, &config.stt));
    let assets = Arc::new(ModelAssetManager::new(
        &config.models,
        ctx.voice().id(),
        factory,
    )?);

    let progress: SharedProgress = Arc::new(print_progress);
    let mut report = startup::prepare(&assets, Some(&progress)).await;
    for line in report.messages() {
        println!("{line}");
    }
    if cli.download && !report.needs_download().is_empty() {
        report = startup::download_missing(&assets, &report, Some(&progress)).await?;
    }
    if !report.is_ready() {
        println!("Not every model is ready; run with --download to fetch them.");
    }

    let synthesizer = Arc::new(KokoroSynthesizer::new(&config.tts));
    let voice = Arc::new(VoiceSession::new(
        synthesizer,
        PermissionGate::default(),
        &config.tts,
    ));
    let orchestrator = TurnOrchestrator::new(ctx, store, assets, voice)?;

    let printer = tokio::spawn(print_events(orchestrator.subscribe(), cli.json_flags));
    println!(
        "{} is listening. Type a message, or /mic, /stop, /talk, /name, /traits, /voice, /quit.",
        config.conversation.assistant_name
    );
    if first_run {
        println!("No profile yet. Introduce yourself with /name <your name>.");
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let orch = Arc::clone(&orchestrator);
        let line = line.trim();
        if let Some(edit) = ProfileEdit::parse(line) {
            match edit {
                Ok(edit) => {
                    let profile = edit.apply(&orch.context().profile());
                    tokio::spawn(async move {
                        if let Err(e) = orch.update_profile(profile).await {
                            warn!(error = %e, "profile update failed");
                        }
                    });
                }
                Err(usage) => println!("usage: {usage}"),
            }
            continue;
        }
        match line {
            "" => {}
            "/quit" => break,
            "/mic" => {
                tokio::spawn(async move {
                    if let Err(e) = orch.press_mic().await {
                        warn!(error = %e, "microphone toggle failed");
                    }
                });
            }
            "/stop" => {
                orch.cancel_generation();
                tokio::spawn(async move {
                    let _ = orch.stop_listening().await;
                });
            }
            "/talk" => {
                tokio::spawn(async move {
                    let on = orch.toggle_talking_mode().await;
                    println!("talking mode {}", if on { "on" } else { "off" });
                });
            }
            text => {
                let text = text.to_owned();
                tokio::spawn(async move {
                    orch.send_text(&text).await;
                });
            }
        }
    }

    orchestrator.cancel_generation();
    let _ = orchestrator.stop_listening().await;
    printer.abort();
    info!("host exiting");
    Ok(())
}

/// A stdin command that changes the stored profile.
#[derive(Debug, PartialEq, Eq)]
enum ProfileEdit {
    Name(String),
    Traits(String, String),
    Voice { character: String, accent: String },
}

impl ProfileEdit {
    /// `None` when `line` is not a profile command, `Err(usage)` when it is
    /// one but its arguments are malformed.
    fn parse(line: &str) -> Option<Result<Self, &'static str>> {
        let (command, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let args: Vec<&str> = rest.split_whitespace().collect();
        let edit = match command {
            "/name" => match rest.trim() {
                "" => Err("/name <name>"),
                name => Ok(Self::Name(name.to_owned())),
            },
            "/traits" => match args.as_slice() {
                [first, second] => Ok(Self::Traits((*first).to_owned(), (*second).to_owned())),
                _ => Err("/traits <first> <second>"),
            },
            "/voice" => match args.as_slice() {
                [character, accent]
                    if matches!(*character, "female" | "male") && matches!(*accent, "uk" | "us") =>
                {
                    Ok(Self::Voice {
                        character: (*character).to_owned(),
                        accent: (*accent).to_owned(),
                    })
                }
                _ => Err("/voice <female|male> <uk|us>"),
            },
            _ => return None,
        };
        Some(edit)
    }

    fn apply(self, current: &UserProfile) -> UserProfile {
        let mut profile = current.clone();
        match self {
            Self::Name(name) => profile.name = name,
            Self::Traits(first, second) => {
                profile.trait1 = first;
                profile.trait2 = second;
            }
            Self::Voice { character, accent } => {
                profile.character = character;
                profile.accent = accent;
            }
        }
        profile
    }
}

fn print_progress(event: ProgressEvent) {
    match event {
        ProgressEvent::DownloadStarted { artifact } => println!("Downloading the {artifact}..."),
        ProgressEvent::Extracting { artifact } => println!("Unpacking the {artifact}..."),
        ProgressEvent::DownloadComplete { artifact } => println!("The {artifact} is downloaded."),
        ProgressEvent::LoadComplete {
            artifact,
            duration_secs,
        } => println!("Loaded the {artifact} in {duration_secs:.1}s."),
        ProgressEvent::Error { artifact, message } => {
            eprintln!("Problem with the {artifact}: {message}");
        }
        ProgressEvent::DownloadProgress { .. } | ProgressEvent::LoadStarted { .. } => {}
    }
}

async fn print_events(mut events: tokio::sync::broadcast::Receiver<RuntimeEvent>, json_flags: bool) {
    loop {
        match events.recv().await {
            Ok(RuntimeEvent::MessageUpserted { message, .. }) if !message.is_draft => {
                println!("{}: {}", message.role, message.content);
            }
            Ok(RuntimeEvent::Notice {
                presentation,
                message,
            }) => eprintln!("[{presentation:?}] {message}"),
            Ok(RuntimeEvent::Flags(flags)) if json_flags => {
                if let Ok(line) = serde_json::to_string(&flags) {
                    println!("{line}");
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event printer fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
