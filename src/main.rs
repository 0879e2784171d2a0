use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use siteback::api::{ApiResponse, BackupApi};
use siteback::checksum::{CachedChecksumService, ChecksumProvider, HttpChecksumService};
use siteback::config::{BackupPaths, Settings};
use siteback::store::{FileKvStore, KvStore};
use siteback::workflow::{ExportSource, JobContext, PhaseOrchestrator};
use siteback::{BackupError, BackupResult};

#[derive(Parser)]
#[command(
    name = "siteback",
    version,
    about = "Resource-budgeted site backup pipeline",
    long_about = "siteback archives a site's filesystem tree into a zip artifact, \
                  validates it for safety and integrity, and uploads it to the \
                  configured remote storage backend in independently-invoked steps."
)]
struct Cli {
    /// Root of the site tree to back up
    #[arg(short, long, env = "SITEBACK_SOURCE")]
    source: PathBuf,

    /// Platform version used to fetch a checksum manifest
    #[arg(long)]
    platform_version: Option<String>,

    /// Locale variant for the checksum manifest
    #[arg(long, default_value = "en_US")]
    locale: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the whole workflow: housekeeping, build, export, upload
    Run {
        /// File appended to the archive as the export payload
        #[arg(long)]
        export_file: Option<PathBuf>,
    },

    /// Run a single workflow step
    Step {
        /// Step number (0 = housekeeping, 1 = build, 2 = export, 3 = upload)
        number: u8,
        /// File appended to the archive during step 2
        #[arg(long)]
        export_file: Option<PathBuf>,
    },

    /// Build (or reuse) an artifact and write it to a local file
    Download {
        /// Output path; defaults to the artifact name in the current directory
        output: Option<PathBuf>,
    },

    /// Show the backup history
    History {
        /// Clear the history instead of listing it
        #[arg(long)]
        clear: bool,
    },

    /// Delete aged temp artifacts
    Cleanup,
}

/// Export payload taken from a file the caller prepared
struct FileExport(PathBuf);

impl ExportSource for FileExport {
    fn produce(&self, work_dir: &Path) -> BackupResult<PathBuf> {
        let name = self
            .0
            .file_name()
            .ok_or_else(|| BackupError::Io("Export file has no name".into()))?;
        let dest = work_dir.join(name);
        std::fs::copy(&self.0, &dest)?;
        Ok(dest)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    let paths = BackupPaths::new();
    paths.ensure_directories()?;
    let settings = Settings::load_or_create(&paths)?;
    // Tickets and history must survive separate `step` invocations.
    let store: Arc<FileKvStore> = Arc::new(FileKvStore::new(paths.state_file()));
    let mut context = JobContext::from_settings(&settings, paths, cli.source.clone())?;
    if let (Some(url), Some(version)) = (&settings.checksum_service_url, &cli.platform_version) {
        let service = CachedChecksumService::new(
            HttpChecksumService::new(url.clone()),
            Arc::clone(&store) as Arc<dyn KvStore>,
        );
        if let Some(manifest) = service.fetch(version, &cli.locale)? {
            context = context.with_manifest(manifest);
        }
    }

    let api = BackupApi::new(PhaseOrchestrator::new(context, store));

    match cli.command {
        Commands::Run { export_file } => {
            expect_success("step 0", api.step0())?;
            expect_success("step 1", api.step1())?;
            if let Some(path) = export_file {
                expect_success("step 2", api.step2(&FileExport(path)))?;
            }
            expect_success("step 3", api.step3())?;
        }
        Commands::Step {
            number,
            export_file,
        } => {
            let response = match number {
                0 => api.step0(),
                1 => api.step1(),
                2 => {
                    let path =
                        export_file.context("step 2 requires --export-file <path>")?;
                    api.step2(&FileExport(path))
                }
                3 => api.step3(),
                other => bail!("unknown step {}; expected 0-3", other),
            };
            expect_success(&format!("step {}", number), response)?;
        }
        Commands::Download { output } => {
            let stream = api.download_artifact()?;
            let path = output.unwrap_or_else(|| PathBuf::from(&stream.filename));
            let total = stream.content_length;
            let mut file = File::create(&path)
                .with_context(|| format!("failed to create {}", path.display()))?;
            for chunk in stream.chunks() {
                file.write_all(&chunk?)?;
            }
            println!("wrote {} ({} bytes)", path.display(), total);
        }
        Commands::History { clear } => {
            if clear {
                expect_success("history", api.clear_history())?;
            } else {
                let history = api.orchestrator().history();
                let entries = history.list()?;
                if entries.is_empty() {
                    println!("no backups recorded");
                }
                for entry in entries {
                    println!(
                        "{}  {}",
                        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                        entry.message
                    );
                }
                if let Some(when) = history.last_backup_time() {
                    println!("last successful backup: {}", when.format("%Y-%m-%d %H:%M:%S"));
                }
            }
        }
        Commands::Cleanup => {
            expect_success("cleanup", api.step0())?;
        }
    }

    Ok(())
}

fn expect_success(step: &str, response: ApiResponse) -> Result<()> {
    let message = response.data["message"]
        .as_str()
        .unwrap_or_default()
        .to_string();
    if response.success {
        println!("{}: {}", step, message);
        Ok(())
    } else {
        bail!("{} failed: {}", step, message);
    }
}
