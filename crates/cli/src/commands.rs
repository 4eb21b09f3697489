use crate::input;
use anyhow::{Context as AnyhowContext, Result};
use sentinel_engine::state::CommunityStore;
use sentinel_engine::{CorpusWatcher, EngineConfig, ModerationEngine, VerdictEvent};
use sentinel_filters::word_permutations;
use sentinel_vision::corpus;
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

const VERDICT_BUFFER: usize = 256;

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer(&mut stdout, value)?;
    writeln!(stdout)?;
    stdout.flush()?;
    Ok(())
}

pub fn permutations(phrase: &str) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    for permutation in word_permutations(phrase) {
        writeln!(stdout, "{permutation}")?;
    }
    Ok(())
}

/// Feed messages from `path` (or stdin) through the engine, printing verdicts as they arrive.
///
/// With `watch`, messages are analyzed concurrently and the corpus directory is watched until
/// input ends or Ctrl-C.
pub async fn check(config: EngineConfig, path: Option<&Path>, watch: bool) -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<VerdictEvent>(VERDICT_BUFFER);
    let printer = tokio::spawn(async move {
        let mut printed = 0usize;
        while let Some(event) = rx.recv().await {
            if let Err(err) = print_json(&event) {
                log::error!("Failed to write verdict: {err:#}");
            }
            printed += 1;
        }
        printed
    });

    let engine = Arc::new(
        ModerationEngine::builder(config)
            .verdicts(tx)
            .build()
            .await
            .context("Failed to start engine")?,
    );
    let watcher = if watch {
        Some(CorpusWatcher::start(
            engine.scanners().to_vec(),
            &engine.config().corpus_dir,
            &engine.config().watcher,
        )?)
    } else {
        None
    };

    let mut lines = input::open(path).await?;
    let mut tasks = JoinSet::new();
    let mut line_no = 0usize;
    loop {
        let next = if watch {
            tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Interrupted, finishing pending work");
                    None
                }
            }
        } else {
            lines.next_line().await?
        };
        let Some(line) = next else {
            break;
        };
        line_no += 1;
        let Some(message) = input::parse_line(line_no, &line) else {
            continue;
        };
        if watch {
            while let Some(done) = tasks.try_join_next() {
                if let Err(err) = done {
                    log::warn!("Message task failed: {err}");
                }
            }
            let engine = Arc::clone(&engine);
            tasks.spawn(async move {
                if let Err(err) = engine.analyze(&message).await {
                    log::warn!("Message {} not processed: {err}", message.id);
                }
            });
        } else if let Err(err) = engine.analyze(&message).await {
            log::warn!("Message {} not processed: {err}", message.id);
        }
    }
    while tasks.join_next().await.is_some() {}

    engine.drain().await;
    drop(watcher);
    drop(engine);
    let printed = printer.await.context("Verdict printer failed")?;
    log::info!("Processed {line_no} lines, {printed} verdicts");
    Ok(())
}

pub async fn scan_image(config: EngineConfig, path: &Path) -> Result<()> {
    let image = corpus::decode_file(path)
        .with_context(|| format!("Failed to decode {}", path.display()))?;
    let engine = ModerationEngine::builder(config)
        .ephemeral()
        .build()
        .await
        .context("Failed to start engine")?;
    let found = engine.scan_image(image).await?;
    print_json(&json!({
        "path": path,
        "matched": found.is_some(),
        "match": found,
    }))?;
    engine.drain().await;
    Ok(())
}

pub async fn add_scam(config: &EngineConfig, path: &Path) -> Result<()> {
    let stored = corpus::register_image(&config.corpus_dir, path)
        .await
        .with_context(|| format!("Failed to register {}", path.display()))?;
    print_json(&json!({ "stored": stored }))
}

pub async fn set_community(
    config: &EngineConfig,
    community: &str,
    log_channel: Option<String>,
    events_channel: Option<String>,
    nsfw: Option<bool>,
) -> Result<()> {
    let store = CommunityStore::open(config.community_path()).await;
    let clear_empty = |value: String| (!value.trim().is_empty()).then_some(value);
    let updated = store
        .update(community, |cfg| {
            if let Some(channel) = log_channel {
                cfg.log_channel = clear_empty(channel);
            }
            if let Some(channel) = events_channel {
                cfg.events_channel = clear_empty(channel);
            }
            if let Some(enabled) = nsfw {
                cfg.nsfw_detection = enabled;
            }
        })
        .await
        .context("Failed to save community settings")?;
    print_json(&json!({ "community": community, "config": updated }))
}
