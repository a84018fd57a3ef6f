//! CLI command implementations

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use clap::{Args, Subcommand};
use piecewise_core::config::PiecewiseConfig;
use piecewise_core::pieces::{ByteSpan, PieceIndex, PieceStore};
use piecewise_core::scheduler::{
    DownloadScheduler, PriorityChannel, PriorityCommand, RecordingPrioritySink,
};
use piecewise_core::streaming::MemoryContent;
use piecewise_core::{EngineEventSender, spawn_session};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::mpsc;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Download a synthetic file through a fake engine while a reader plays it
    Simulate {
        #[command(flatten)]
        layout: LayoutArgs,
        /// Seed for the order in which the fake engine completes pieces
        #[arg(long, default_value = "42")]
        seed: u64,
        /// Byte offset the reader jumps to before reading to the end
        #[arg(long)]
        seek: Option<u64>,
        /// Delay between fake piece completions, in milliseconds
        #[arg(long, default_value = "1")]
        step_ms: u64,
    },
    /// Print the metadata and sequential plan for a layout
    Plan {
        #[command(flatten)]
        layout: LayoutArgs,
        /// Start of the file inside the torrent content
        #[arg(long, default_value = "0")]
        file_offset: u64,
        /// Length of the file (defaults to the rest of the content)
        #[arg(long)]
        file_length: Option<u64>,
    },
}

/// Torrent layout and scheduler overrides shared by all commands
#[derive(Args, Debug, Clone)]
pub struct LayoutArgs {
    /// Number of pieces
    #[arg(long, default_value = "64")]
    pieces: u32,
    /// Nominal piece size in bytes
    #[arg(long, default_value = "16384")]
    piece_size: u64,
    /// Bytes trimmed from the last piece
    #[arg(long, default_value = "0")]
    tail_trim: u64,
    /// Header bytes to fetch first (defaults to configuration)
    #[arg(long)]
    header_size: Option<u64>,
    /// Footer bytes to fetch first (defaults to configuration)
    #[arg(long)]
    footer_size: Option<u64>,
    /// Fixed window size in pieces (defaults to configuration)
    #[arg(long)]
    window: Option<u32>,
}

impl LayoutArgs {
    fn total_length(&self) -> anyhow::Result<u64> {
        let full = u64::from(self.pieces)
            .checked_mul(self.piece_size)
            .context("layout too large")?;
        if self.tail_trim >= self.piece_size {
            anyhow::bail!(
                "tail trim {} must be smaller than the piece size {}",
                self.tail_trim,
                self.piece_size
            );
        }
        Ok(full - self.tail_trim)
    }

    fn store(&self) -> anyhow::Result<PieceStore> {
        Ok(PieceStore::from_total_length(self.total_length()?, self.piece_size)?)
    }

    fn config(&self) -> PiecewiseConfig {
        let mut config = PiecewiseConfig::from_env();
        if let Some(bytes) = self.header_size {
            config.scheduler.header_size = bytes;
        }
        if let Some(bytes) = self.footer_size {
            config.scheduler.footer_size = bytes;
        }
        if self.window.is_some() {
            config.scheduler.window_size = self.window;
        }
        config
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of whichever command fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Simulate {
            layout,
            seed,
            seek,
            step_ms,
        } => run_simulation(layout, seed, seek, Duration::from_millis(step_ms)).await,
        Commands::Plan {
            layout,
            file_offset,
            file_length,
        } => show_plan(layout, file_offset, file_length),
    }
}

/// Prints which pieces the scheduler requests first and how the sequential
/// window will sweep the rest.
///
/// # Errors
/// - Layout or file span is invalid
pub fn show_plan(
    layout: LayoutArgs,
    file_offset: u64,
    file_length: Option<u64>,
) -> anyhow::Result<()> {
    let config = layout.config();
    let store = Arc::new(layout.store()?);
    let length = file_length.unwrap_or(store.total_length().saturating_sub(file_offset));
    let span = ByteSpan::new(file_offset, length);

    let sink = Arc::new(RecordingPrioritySink::new());
    let scheduler =
        DownloadScheduler::for_span(Arc::clone(&store), span, sink, &config.scheduler)?;
    let range = scheduler.piece_range();

    println!("Download Plan");
    println!("{:-<60}", "");
    println!(
        "Content: {} bytes in {} pieces of {} bytes",
        store.total_length(),
        store.len(),
        store.nominal_piece_size()
    );
    println!(
        "File: bytes {}..{} (pieces {}..={})",
        span.offset,
        span.end(),
        range.start(),
        range.end()
    );
    println!(
        "Header/footer: {} / {} bytes",
        config.scheduler.header_size, config.scheduler.footer_size
    );
    println!("Metadata pieces: {}", format_pieces(&scheduler.downloading()));

    match scheduler.plan() {
        Some(plan) => {
            println!(
                "Sequential: pieces {}..={} with a window of {}",
                plan.start_index, plan.last_index, plan.window_size
            );
        }
        None => println!("Sequential: nothing between header and footer"),
    }
    Ok(())
}

/// Runs a fake engine that completes prioritized pieces in random order
/// while a reader consumes the file.
///
/// # Errors
/// - Layout is invalid
/// - The session or reader fails
pub async fn run_simulation(
    layout: LayoutArgs,
    seed: u64,
    seek: Option<u64>,
    step: Duration,
) -> anyhow::Result<()> {
    let config = layout.config();
    let store = Arc::new(layout.store()?);
    let total = store.total_length();
    let data = synthetic_content(total);
    let content = Arc::new(MemoryContent::new(data.clone()));

    let (channel, priorities) = PriorityChannel::new();
    let session = spawn_session(Arc::clone(&store), content, Arc::new(channel), config);
    let file = session
        .open_file("simulated.mkv", ByteSpan::new(0, total))
        .await?;

    println!(
        "Simulating {} pieces of {} bytes (seed {})",
        store.len(),
        store.nominal_piece_size(),
        seed
    );
    let started = Instant::now();

    let engine = tokio::spawn(run_fake_engine(
        priorities,
        session.events(),
        Arc::clone(&store),
        seed,
        step,
    ));

    let mut source = file.open_source()?;
    let start = seek.unwrap_or(0);
    if start > 0 {
        source.seek(start).await?;
    }
    let read = source.read_to_end().await?;
    let verified = read.as_slice() == &data[start as usize..];
    println!(
        "Reader finished {} bytes from offset {} after {:?} (content {})",
        read.len(),
        start,
        started.elapsed(),
        if verified { "verified" } else { "MISMATCH" }
    );

    let commands = engine.await.context("fake engine panicked")??;
    let stats = session.stats().await?;
    println!(
        "Engine finished after {} priority updates, scheduler {}",
        commands,
        file.scheduler().snapshot().phase()
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);

    session.shutdown().await?;
    if !verified {
        anyhow::bail!("reader returned bytes that differ from the source content");
    }
    Ok(())
}

/// Completes pieces from the latest priority set, one per `step`, in an
/// order chosen by a seeded RNG. Returns the number of priority updates seen.
async fn run_fake_engine(
    mut priorities: mpsc::UnboundedReceiver<PriorityCommand>,
    events: EngineEventSender,
    store: Arc<PieceStore>,
    seed: u64,
    step: Duration,
) -> anyhow::Result<u64> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut wanted: Vec<PieceIndex> = Vec::new();
    let mut sent = BTreeSet::new();
    let mut downloaded = 0u64;
    let mut updates = 0u64;

    while store.finished_count() < store.len() {
        tokio::select! {
            command = priorities.recv() => match command {
                Some(PriorityCommand::DownloadOnly(pieces)) => {
                    updates += 1;
                    wanted = pieces.into_iter().filter(|index| !sent.contains(index)).collect();
                    tracing::trace!("Fake engine now wants {:?}", wanted);
                }
                None => break,
            },
            _ = tokio::time::sleep(step), if !wanted.is_empty() => {
                let index = wanted.swap_remove(rng.random_range(0..wanted.len()));
                sent.insert(index);
                events.piece_downloading(index)?;
                events.piece_downloaded(index)?;
                downloaded += store.get(index)?.size;
                events.counters(downloaded, downloaded / 4)?;
            }
        }
    }
    Ok(updates)
}

fn synthetic_content(len: u64) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

fn format_pieces(pieces: &[PieceIndex]) -> String {
    if pieces.is_empty() {
        return "none".to_string();
    }
    pieces
        .iter()
        .map(PieceIndex::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
