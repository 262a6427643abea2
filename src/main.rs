use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

use imgdex::config::{self, Config};
use imgdex::lock::IndexLock;
use imgdex::semantic::{
    scanner, watch, BuildKind, BuildOutcome, ClipEmbedder, ControllerError, EmbeddingProvider,
    IndexController, IndexEvent, IndexLocation, IndexStore, LoadState, SearchHit,
};

mod cli;

use cli::Command;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = cli::Args::parse();
    let config = Config::load_with(&config::base_path()?)?;

    if let Command::Locate { root } = &args.command {
        let location = IndexLocation::resolve(config.base_path(), root)?;
        println!("{}", location.dir().display());
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(async move {
        match args.command {
            Command::Index { root, rebuild } => index(&config, root, rebuild).await,
            Command::Search {
                query,
                k,
                threshold,
                root,
            } => search(config, root, &query, k, threshold).await,
            Command::Watch { root } => watch_root(&config, root).await,
            Command::Status { root } => status(&config, root),
            Command::Locate { .. } => Ok(()),
        }
    })
}

fn resolve_root(config: &Config, root: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let root = root
        .or_else(|| config.root_dir.clone())
        .context("no root directory: pass --root or set root_dir in config.yaml")?;
    if !root.is_dir() {
        bail!("not a directory: {}", root.display());
    }
    Ok(root)
}

fn open_controller(
    config: &Config,
    root: &Path,
) -> anyhow::Result<(IndexController, UnboundedReceiver<IndexEvent>)> {
    let embedder = Arc::new(ClipEmbedder::new(&config.model.name, config.models_dir())?);
    let (controller, events) = IndexController::new(
        tokio::runtime::Handle::current(),
        config.base_path(),
        root,
        embedder,
        config.controller_settings(),
    )?;
    Ok((controller, events))
}

fn lock_index(controller: &IndexController) -> anyhow::Result<IndexLock> {
    let dir = controller.store().location().dir().to_path_buf();
    IndexLock::try_acquire(&dir).with_context(|| format!("cannot lock {}", dir.display()))
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{bar:30.cyan/dim}] {percent:>3}% ({pos}/{len}) {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar
}

/// Drain events until the running build reaches a terminal state.
async fn wait_for_build(
    controller: &IndexController,
    events: &mut UnboundedReceiver<IndexEvent>,
) -> anyhow::Result<IndexEvent> {
    let bar = progress_bar();
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    bail!("controller stopped before the build finished");
                };
                match event {
                    IndexEvent::Progress { progress, .. } => {
                        bar.set_length(progress.total as u64);
                        bar.set_position(progress.done as u64);
                    }
                    IndexEvent::Status(message) => bar.set_message(message),
                    event if event.is_terminal() => {
                        bar.finish_and_clear();
                        return Ok(event);
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                bar.set_message("cancelling...");
                controller.cancel();
            }
        }
    }
}

fn describe(event: &IndexEvent) -> String {
    match event {
        IndexEvent::Completed { outcome, .. } => match outcome {
            BuildOutcome::Loaded(count) => format!("index up to date ({count} images)"),
            BuildOutcome::Indexed(report) => format!(
                "indexed {} new images ({} skipped)",
                report.added, report.skipped
            ),
            BuildOutcome::Empty(_) => "no indexable images found".to_string(),
            BuildOutcome::Cancelled(report) => format!("cancelled after {} images", report.added),
        },
        IndexEvent::Cancelled { .. } => "indexing cancelled".to_string(),
        IndexEvent::Failed { reason, .. } => format!("indexing failed: {reason}"),
        IndexEvent::Status(message) => message.clone(),
        IndexEvent::SearchTimedOut => "search timed out".to_string(),
        IndexEvent::Progress { progress, .. } => {
            format!("{:.0}% ({}/{})", progress.percent, progress.done, progress.total)
        }
    }
}

async fn index(config: &Config, root: Option<PathBuf>, rebuild: bool) -> anyhow::Result<()> {
    let root = resolve_root(config, root)?;
    let (controller, mut events) = open_controller(config, &root)?;
    let _lock = lock_index(&controller)?;

    if !scanner::has_images(&root) {
        log::warn!("no images found under {}", root.display());
    }

    let kind = if rebuild {
        controller.store().reset()?;
        BuildKind::Full
    } else {
        BuildKind::Incremental
    };
    if !controller.start(kind) {
        bail!("another build is already running");
    }

    let terminal = wait_for_build(&controller, &mut events).await?;
    println!("{}", describe(&terminal));
    match terminal {
        IndexEvent::Failed { reason, .. } => bail!(reason),
        _ => Ok(()),
    }
}

fn print_hits(hits: &[SearchHit], root: &Path) {
    if hits.is_empty() {
        println!("no matches");
    }
    for hit in hits {
        println!("{:.3}  {}", hit.score, root.join(&hit.id).display());
    }
}

async fn search(
    mut config: Config,
    root: Option<PathBuf>,
    query: &str,
    k: Option<usize>,
    threshold: Option<f32>,
) -> anyhow::Result<()> {
    let root = resolve_root(&config, root)?;
    if let Some(threshold) = threshold {
        if !(-1.0..=1.0).contains(&threshold) {
            bail!("threshold must be between -1.0 and 1.0, got {threshold}");
        }
        config.index.similarity_threshold = threshold;
    }

    let (controller, _events) = open_controller(&config, &root)?;
    match controller.store().load() {
        Ok(LoadState::Loaded(_)) => {}
        Ok(LoadState::NotFound) => bail!(
            "{} is not indexed yet, run `imgdex index --root {}` first",
            root.display(),
            root.display()
        ),
        Err(e) => return Err(e).context("run `imgdex index --rebuild` to rebuild the index"),
    }

    let hits = controller
        .search(query, k.unwrap_or(config.index.top_k))
        .await?;
    print_hits(&hits, &root);
    Ok(())
}

async fn watch_root(config: &Config, root: Option<PathBuf>) -> anyhow::Result<()> {
    let root = resolve_root(config, root)?;
    let (controller, mut events) = open_controller(config, &root)?;
    let _lock = lock_index(&controller)?;
    let _watcher = watch(&root, controller.clone())?;

    controller.start_full_build();
    eprintln!("type a query to search, :reindex to rescan, :status, or :quit");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match line.trim() {
                    "" => {}
                    ":quit" => break,
                    ":reindex" => {
                        if !controller.manual_index() {
                            eprintln!("indexing is blocked right now");
                        }
                    }
                    ":status" => eprintln!("{:?}", controller.status()),
                    query => match controller.search(query, config.index.top_k).await {
                        Ok(hits) => print_hits(&hits, &root),
                        Err(e @ (ControllerError::SearchBusy | ControllerError::NotReady)) => {
                            eprintln!("{e}, try again shortly")
                        }
                        Err(e) => eprintln!("search failed: {e}"),
                    },
                }
            }
            event = events.recv() => {
                match event {
                    Some(IndexEvent::Progress { kind, progress }) => {
                        log::debug!("{kind:?} build at {:.0}%", progress.percent);
                    }
                    Some(event) => eprintln!("{}", describe(&event)),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    controller.cancel();
    Ok(())
}

fn status(config: &Config, root: Option<PathBuf>) -> anyhow::Result<()> {
    let root = resolve_root(config, root)?;
    let location = IndexLocation::resolve(config.base_path(), &root)?;

    let embedder = ClipEmbedder::new(&config.model.name, config.models_dir())?;
    let store = IndexStore::open(location, embedder.model_id());

    println!("root:      {}", store.location().root().display());
    println!("index dir: {}", store.location().dir().display());
    match store.load() {
        Ok(LoadState::Loaded(count)) => {
            let pending = scanner::diff(&scanner::scan(&root)?, &store.identifiers()).len();
            println!("indexed:   {count} images ({pending} not indexed yet)");
        }
        Ok(LoadState::NotFound) => println!("indexed:   nothing yet"),
        Err(e) => println!("indexed:   unusable ({e})"),
    }
    Ok(())
}
