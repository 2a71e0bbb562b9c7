//! Main Entrypoint for the Little Talkers terminal tutor
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Initializing logging on stderr, keeping stdout for the transcript.
//! 3. Connecting the conversation agent to the configured chat provider.
//! 4. Running the session controller, fed by stdin and rendered to stdout.
//! 5. Shutting down on `/quit`, end of input or `Ctrl+C`.

use anyhow::Context;
use async_openai::config::OpenAIConfig;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use talkers_core::{
    agent::{ConversationAgent, LearningMode},
    controller::{SessionController, UiInput},
    llm_client::OpenAICompatibleClient,
    retry::RetryPolicy,
    speech::VoiceProfile,
};
use talkers_tutor::{
    config::{Config, Provider},
    console_speech::ConsoleSpeech,
    terminal::{self, Command, HELP},
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(version, about = "A patient English tutor for young children")]
struct Cli {
    /// Start straight away on this topic.
    #[arg(long)]
    topic: Option<String>,

    /// Practice to start with once a topic is chosen.
    #[arg(long, value_enum, default_value_t = ModeArg::Chat)]
    mode: ModeArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Chat,
    Words,
}

impl From<ModeArg> for LearningMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Chat => LearningMode::Conversation,
            ModeArg::Words => LearningMode::Vocabulary,
        }
    }
}

/// Listens for the `Ctrl+C` signal to shut down gracefully.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal. Shutting down gracefully...");
}

/// Forwards typed lines to the controller until `/quit` or end of input.
async fn read_stdin(inputs: mpsc::Sender<UiInput>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match terminal::parse_line(&line) {
            Some(Command::Input(input)) => {
                if inputs.send(input).await.is_err() {
                    break;
                }
            }
            Some(Command::Help) => println!("{HELP}"),
            Some(Command::Quit) => break,
            None => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // --- 1. Load Configuration ---
    let cli = Cli::parse();
    let config = Config::from_env().context("Failed to load configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!("Configuration loaded. Initializing tutor...");

    // --- 3. Initialize Chat Provider ---
    let openai_config = match &config.provider {
        Provider::OpenAI => {
            info!("Using OpenAI provider.");
            let api_key = config
                .openai_api_key
                .as_deref()
                .context("OPENAI_API_KEY is not set")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://api.openai.com/v1/")
        }
        Provider::Gemini => {
            info!("Using Gemini provider.");
            let api_key = config
                .gemini_api_key
                .as_deref()
                .context("GEMINI_API_KEY is not set")?;
            OpenAIConfig::new()
                .with_api_key(api_key)
                .with_api_base("https://generativelanguage.googleapis.com/v1beta/openai")
        }
    };
    let transport = Arc::new(OpenAICompatibleClient::new(
        openai_config,
        config.chat_model.clone(),
    ));
    let agent = Arc::new(ConversationAgent::new(transport, RetryPolicy::default()));

    // --- 4. Build Session Controller ---
    let speech = Arc::new(ConsoleSpeech::new(VoiceProfile::CHILD_FRIENDLY));
    let (updates_tx, mut updates_rx) = mpsc::unbounded_channel();
    let controller =
        SessionController::new(agent, speech, config.inactivity_timeout).with_updates(updates_tx);

    tokio::spawn(async move {
        while let Some(update) = updates_rx.recv().await {
            if let Some(line) = terminal::render(&update) {
                println!("{line}");
            }
        }
    });

    let (inputs_tx, inputs_rx) = mpsc::channel(32);
    println!("Welcome to Little Talkers! Type /help for commands.");
    match cli.topic {
        Some(topic) => {
            inputs_tx.send(UiInput::SelectTopic(topic)).await?;
            inputs_tx
                .send(UiInput::SelectMode(cli.mode.into()))
                .await?;
        }
        None => inputs_tx.send(UiInput::OpenTopics).await?,
    }
    tokio::spawn(async move {
        if let Err(e) = read_stdin(inputs_tx).await {
            error!(error = ?e, "Failed to read from stdin");
        }
    });

    // --- 5. Run Until Shutdown ---
    info!(
        provider = ?config.provider,
        model = %config.chat_model,
        inactivity_timeout_ms = config.inactivity_timeout.as_millis() as u64,
        "Tutor configured. Starting session controller..."
    );
    tokio::select! {
        _ = controller.run(inputs_rx) => {}
        _ = shutdown_signal() => {}
    }

    info!("Tutor has shut down.");
    Ok(())
}
