//! Parley terminal front-end
//!
//! One key to talk, one command to start over. Enter toggles listening; with typed
//! capture, lines entered while listening are taken as what was said.

mod render;

use anyhow::Context;
use parley_voice::{ProviderSet, VoiceConfig};
use render::Transcript;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley] .env not loaded: {} (using system environment)", e);
    }

    // Logs go to stderr; stdout is the transcript.
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = VoiceConfig::load().context("loading voice configuration")?;
    let providers = ProviderSet::from_config(&config).context("selecting voice providers")?;

    if !providers.generator.is_available().await {
        tracing::warn!(
            base_url = %config.generation.base_url,
            "⚠️ Generation backend unreachable; replies will fail until it is up"
        );
    }

    let typed = providers.typed.clone();
    let (orchestrator, handle) = providers.into_orchestrator(&config);
    let running = orchestrator.spawn();

    let mut views = handle.subscribe();
    let renderer = tokio::spawn(async move {
        let mut transcript = Transcript::default();
        loop {
            let view = views.borrow_and_update().clone();
            if let Err(e) = transcript.render(&view, &mut std::io::stdout()) {
                tracing::warn!(error = %e, "transcript write failed");
            }
            if views.changed().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                match line.trim() {
                    "" => handle.toggle(),
                    "/new" => handle.new_conversation(),
                    "/quit" => break,
                    text => match &typed {
                        Some(typed) if typed.feed(text) => {}
                        Some(_) => println!("(press Enter to start listening first)"),
                        None => println!("(capture is from the microphone; press Enter to toggle)"),
                    },
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("CTRL-C received; shutting down");
                break;
            }
        }
    }

    handle.shutdown();
    running.await.context("orchestrator task")?;
    renderer.abort();
    Ok(())
}
