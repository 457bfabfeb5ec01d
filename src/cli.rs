//! Command-line flag surface for driving the MPT storage engine (§6.4).
//!
//! This crate ships no binary; callers embed [`CliOptions::parse_from`]
//! (via `clap::Parser`) and [`run`] in their own `main`. Keeping the
//! surface as a library lets tests drive every flag combination without
//! spawning a subprocess.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use crate::mpt::archive::{archive, restore};
use crate::mpt::chunk::ChunkType;
use crate::mpt::device::FileDevice;
use crate::mpt::engine::{StateMachine, UpdateAux};
use crate::mpt::pool::{open_file_pool, OpenFlags, OpenMode, Pool};

/// Default chunk capacity, `log2(bytes)` (§6.4).
const DEFAULT_CHUNK_CAPACITY_LOG2: u8 = 28;

/// Default zstd compression level used by `--archive` (§6.4).
const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Default bounded version history length, absent an explicit reset.
const DEFAULT_HISTORY_LENGTH: u32 = 256;

/// Parsed command-line options for the MPT storage CLI (§6.4).
#[derive(Debug, Parser)]
#[command(name = "monad-mpt", about = "Inspect and maintain an MPT storage pool")]
pub struct CliOptions {
    /// Storage device path; repeat once per chunk-type device.
    #[arg(long = "storage", required = true)]
    pub storage: Vec<PathBuf>,

    /// Create the pool if it doesn't exist.
    #[arg(long, conflicts_with_all = ["create_empty", "truncate"])]
    pub create: bool,

    /// Create the pool, failing if one already exists with data.
    #[arg(long = "create-empty", conflicts_with_all = ["create", "truncate"])]
    pub create_empty: bool,

    /// Discard any existing pool and start fresh.
    #[arg(long, conflicts_with_all = ["create", "create_empty"])]
    pub truncate: bool,

    /// Chunk capacity as `log2(bytes)`; max 31.
    #[arg(long = "chunk-capacity", default_value_t = DEFAULT_CHUNK_CAPACITY_LOG2)]
    pub chunk_capacity: u8,

    /// Number of chunks to provision per device when creating a pool.
    #[arg(long = "chunk-count", default_value_t = 1024)]
    pub chunk_count: u32,

    /// Archive the pool to this file and exit.
    #[arg(long)]
    pub archive: Option<PathBuf>,

    /// Restore the pool from this archive file and exit.
    #[arg(long)]
    pub restore: Option<PathBuf>,

    /// Rewind the version history to this version.
    #[arg(long = "rewind-to")]
    pub rewind_to: Option<u64>,

    /// Reset the retained history length to this many versions.
    #[arg(long = "reset-history-length")]
    pub reset_history_length: Option<u32>,

    /// zstd compression level used by `--archive`.
    #[arg(long = "compression-level", default_value_t = DEFAULT_COMPRESSION_LEVEL)]
    pub compression_level: i32,

    /// Proceed best-effort if both metadata copies fail validation,
    /// instead of refusing to open.
    #[arg(long = "allow-dirty")]
    pub allow_dirty: bool,

    /// Skip confirmation prompts for destructive operations.
    #[arg(long)]
    pub yes: bool,

    /// Emit verbose tracing output.
    #[arg(long)]
    pub debug: bool,
}

/// Something went wrong running a CLI invocation; carries enough context
/// to print a useful message before returning exit code 1 (§6.4, §7).
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("pool error: {0}")]
    Pool(#[from] crate::mpt::pool::PoolError),
    #[error("archive error: {0}")]
    Archive(#[from] crate::mpt::archive::ArchiveError),
    #[error("--archive and --restore cannot both be given")]
    ConflictingArchiveRestore,
    #[error("destructive operation requires --yes or an interactive confirmation")]
    ConfirmationRequired,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn open_mode(options: &CliOptions) -> OpenMode {
    if options.truncate {
        OpenMode::Truncate
    } else if options.create || options.create_empty {
        OpenMode::CreateIfNeeded
    } else {
        OpenMode::OpenExisting
    }
}

fn open_pool(options: &CliOptions) -> Result<Pool<FileDevice>, CliError> {
    let sources: Vec<(ChunkType, PathBuf, u32)> = options
        .storage
        .iter()
        .map(|path| (ChunkType::Conventional, path.clone(), options.chunk_count))
        .collect();
    let flags = OpenFlags {
        open_read_only_allow_dirty: options.allow_dirty,
    };
    Ok(open_file_pool(&sources, open_mode(options), options.chunk_capacity, flags)?)
}

/// Run one CLI invocation to completion, returning the process exit code
/// (§6.4: 0 on success, 1 on any fatal error).
pub fn run(options: CliOptions) -> ExitCode {
    if options.debug {
        let _ = tracing_subscriber::fmt().with_env_filter("debug").try_init();
    }
    match run_inner(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "monad-mpt: fatal error");
            ExitCode::FAILURE
        }
    }
}

fn run_inner(options: CliOptions) -> Result<(), CliError> {
    if options.archive.is_some() && options.restore.is_some() {
        return Err(CliError::ConflictingArchiveRestore);
    }
    if options.truncate && !options.yes {
        return Err(CliError::ConfirmationRequired);
    }

    let pool = open_pool(&options)?;

    if let Some(restore_path) = &options.restore {
        let file = std::fs::File::open(restore_path)?;
        let available = available_memory_bytes();
        restore(&pool, file, available)?;
        tracing::info!(path = %restore_path.display(), "restored pool from archive");
        return Ok(());
    }

    if let Some(archive_path) = &options.archive {
        let file = std::fs::File::create(archive_path)?;
        archive(&pool, file, options.compression_level)?;
        tracing::info!(path = %archive_path.display(), "archived pool");
        return Ok(());
    }

    if options.rewind_to.is_some() || options.reset_history_length.is_some() {
        let pool = Arc::new(pool);
        let aux = UpdateAux::new(pool, StateMachine::default(), DEFAULT_HISTORY_LENGTH);
        if let Some(n) = options.reset_history_length {
            aux.reset_history_length(n);
        }
        if let Some(v) = options.rewind_to {
            aux.rewind_to_version(v);
        }
    }

    Ok(())
}

fn available_memory_bytes() -> u64 {
    // Conservative fallback; platforms without a cheap way to query free
    // memory fall back to the "slow" decompression path rather than the
    // mmap-backed fast one (§4.3 `choose_decompression_mode`).
    1 << 30
}
