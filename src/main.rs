//! lingolive - live speech translator for travelers
//!
//! Streams microphone audio to the Gemini Live API and plays the model's
//! spoken replies while logging a turn-by-turn transcript. Also exposes
//! one-shot text translation and read-aloud over the REST surface.

#![forbid(unsafe_code)]

use anyhow::Context;
use clap::{Parser, Subcommand};
use lingolive::transcript::Speaker;
use lingolive::{InputMode, LiveTranslator, TranslatorConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "lingolive", about = "Live speech translator for travelers", version)]
struct Cli {
    /// Target language for text translation
    #[arg(long, global = true)]
    target_language: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a live voice session; Ctrl-C ends it
    Voice,
    /// Translate a line of text and print the result
    Translate {
        /// Text to translate
        text: String,
    },
    /// Synthesize speech for the given text and play it
    Speak {
        /// Text to read aloud
        text: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let api_key = std::env::var("GEMINI_API_KEY")
        .context("GEMINI_API_KEY environment variable is not set")?;

    let mut config = TranslatorConfig::new(api_key);
    if let Some(language) = cli.target_language {
        config.target_language = language;
    }
    let mut translator = LiveTranslator::new(config);

    match cli.command {
        Command::Voice => run_voice(&mut translator).await,
        Command::Translate { text } => {
            translator.set_mode(InputMode::Text);
            let translation = translator.translate_text(&text).await?;
            println!("{}", translation);
            Ok(())
        }
        Command::Speak { text } => translator.read_aloud(&text).await,
    }
}

async fn run_voice(translator: &mut LiveTranslator) -> anyhow::Result<()> {
    translator.start().await?;
    println!("Listening. Press Ctrl-C to stop.");

    tokio::select! {
        _ = translator.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
    }
    translator.stop();

    for turn in translator.conversation().turns() {
        let label = match turn.speaker {
            Speaker::User => "You",
            Speaker::Model => "Interpreter",
        };
        println!("{}: {}", label, turn.text);
    }
    if let Some(message) = translator.last_error() {
        eprintln!("{}", message);
    }
    Ok(())
}
