//! Operator tools for inspecting and verifying Carmen archives.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Parser;

use carmen_archive::{Archive, KvArchive, SqliteArchive};

#[derive(Parser)]
#[clap(name = "carmen")]
#[clap(about = "Carmen archive tools", version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Parser)]
enum Commands {
    /// Print summary information of an archive
    Stats {
        /// Archive directory
        path: PathBuf,
    },

    /// Verify the integrity of an archive
    Verify {
        /// Archive directory
        path: PathBuf,
    },
}

/// Opens the archive in the given directory, picking the backend from the
/// files present.
fn open_archive(path: &PathBuf) -> Result<Box<dyn Archive>> {
    if !path.exists() {
        bail!("no archive found at {}", path.display());
    }
    if path.join("archive.sqlite").exists() {
        let archive = SqliteArchive::open(path)
            .with_context(|| format!("opening SQLite archive at {}", path.display()))?;
        return Ok(Box::new(archive));
    }
    let archive = KvArchive::open(path)
        .with_context(|| format!("opening archive at {}", path.display()))?;
    Ok(Box::new(archive))
}

fn stats(path: PathBuf) -> Result<()> {
    println!("Opening {} ...", path.display());
    let archive = open_archive(&path)?;
    let height = archive.get_latest_block()?;
    println!("  Block height: {height}");
    let hash = archive.get_hash(height)?;
    println!("  Archive hash: 0x{}", hex::encode(hash));
    Ok(())
}

fn verify(path: PathBuf) -> Result<()> {
    println!("Opening {} ...", path.display());
    let archive = open_archive(&path)?;
    let height = archive.get_latest_block()?;
    println!("  Block height: {height}");
    let hash = archive.get_hash(height)?;
    println!("  Archive hash: 0x{}", hex::encode(hash));
    println!("  Running verification ...");

    let start = Instant::now();
    let mut verified = 0u64;
    let result = archive.verify(height, &hash, &mut |account| {
        verified += 1;
        if verified % 1000 == 0 {
            println!("    ... {verified} accounts verified, at {account}");
        }
    });
    let elapsed = start.elapsed();

    match result {
        Ok(()) => {
            println!(
                "  Verification: successful, {} accounts (took {}:{:02})",
                verified,
                elapsed.as_secs() / 60,
                elapsed.as_secs() % 60
            );
            Ok(())
        }
        Err(error) => bail!("verification failed: {error}"),
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Stats { path } => stats(path),
        Commands::Verify { path } => verify(path),
    }
}
