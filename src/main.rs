//! vidrelay CLI
//!
//! Fetch a video through the relay backend and route it to storage and the
//! sharing platform.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vidrelay::backend::{PlatformUploadDraft, VideoMetadata};
use vidrelay::workflow::{
    CliPrompt, FixedPrompt, PrintNavigator, ProgressSnapshot, ProgressStage, ReauthPrompt,
    TimerState,
};
use vidrelay::{Config, Error, HttpBackend, Result, StageSequencer};

#[derive(Parser)]
#[command(name = "vidrelay")]
#[command(author, version, about = "Fetch a video and relay it to storage and sharing backends")]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "VIDRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Backend base URL (overrides the config file)
    #[arg(long, global = true, env = "VIDRELAY_BACKEND")]
    backend: Option<String>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show metadata for a video
    Info {
        /// Video URL or ID
        reference: String,
    },

    /// List storage destination folders
    Folders,

    /// Run the pipeline: metadata, acquisition, storage, platform
    Run {
        /// Video URL or ID
        reference: String,

        /// Storage folder ID to upload into
        #[arg(long, short)]
        folder: Option<String>,

        /// Also publish to the sharing platform
        #[arg(long)]
        platform: bool,

        /// Platform title (defaults to the video title)
        #[arg(long)]
        title: Option<String>,

        /// Platform description
        #[arg(long)]
        description: Option<String>,

        /// Comma-separated platform tags
        #[arg(long)]
        tags: Option<String>,

        /// Platform privacy level (private, unlisted, public)
        #[arg(long)]
        privacy: Option<String>,

        /// Also save the file into this directory
        #[arg(long)]
        save: Option<PathBuf>,

        /// Answer yes to the reauthorization prompt
        #[arg(long, short)]
        yes: bool,
    },

    /// Acquire a video and save it locally
    Fetch {
        /// Video URL or ID
        reference: String,

        /// Output directory (default: download_dir from config)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Start authorization with the storage and platform providers
    Login,

    /// End the current authorization
    Logout,

    /// Initialize .vidrelay directory
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Config,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Load config
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(url) = cli.backend {
        config.backend.base_url = url;
    }

    match cli.command {
        Commands::Init { force } => {
            let path = vidrelay::config::init(force)?;
            info!("Initialized {}", path.display());
        }

        Commands::Config => match toml::to_string_pretty(&config) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to serialize config: {}", e),
        },

        command => {
            let assume_yes = matches!(command, Commands::Run { yes: true, .. });
            let seq = build_sequencer(&config, assume_yes)?;
            if let Err(e) = drive(&seq, &config, command).await {
                // Published failures carry the wording of the stage that failed
                if let Some(message) = seq.errors().message() {
                    eprintln!("{}", message);
                    std::process::exit(1);
                }
                return Err(e);
            }
        }
    }

    Ok(())
}

/// Run a command that talks to the backend
async fn drive(seq: &StageSequencer, config: &Config, command: Commands) -> Result<()> {
    match command {
        Commands::Info { reference } => {
            let metadata = seq.request_metadata(&reference).await?;
            print_metadata(&metadata);
        }

        Commands::Folders => {
            let folders = seq.list_destination_folders().await?;
            if folders.is_empty() {
                println!("No folders found");
            }
            for folder in folders {
                println!("{}\t{}", folder.folder_id, folder.folder_name);
            }
        }

        Commands::Run {
            reference,
            folder,
            platform,
            title,
            description,
            tags,
            privacy,
            save,
            yes: _,
        } => {
            let metadata = seq.request_metadata(&reference).await?;
            print_metadata(&metadata);

            let acquisition = {
                let display = follow_progress(seq, ProgressStage::Acquisition);
                let result = seq.initiate_acquisition(&reference).await;
                finish_display(display).await;
                result?
            };
            println!("Acquired: {}", acquisition.file_handle);

            // Folder listing follows every acquisition
            let folders = seq.list_destination_folders().await?;

            match folder {
                Some(folder_id) => {
                    let display = follow_progress(seq, ProgressStage::StorageUpload);
                    let result = seq.upload_to_storage(&folder_id).await;
                    finish_display(display).await;
                    result?;
                    if let Some(link) = seq.storage_link() {
                        println!("Stored: {}", link);
                    }
                }
                None => {
                    println!("No --folder given, skipping storage. Available folders:");
                    for f in &folders {
                        println!("  {}\t{}", f.folder_id, f.folder_name);
                    }
                }
            }

            if let Some(dir) = save {
                let path = seq.save_to_device(&dir).await?;
                println!("Saved: {}", path.display());
            }

            if platform {
                let prefilled = seq.open_platform_form()?;
                let draft = PlatformUploadDraft {
                    title: title.or(prefilled.title),
                    description: description.or(prefilled.description),
                    tags: tags.or(prefilled.tags),
                    privacy_level: privacy.or(prefilled.privacy_level),
                };

                let display = follow_progress(seq, ProgressStage::PlatformUpload);
                let result = seq.upload_to_platform(draft).await;
                finish_display(display).await;
                match result {
                    Ok(_) => {
                        if let Some(link) = seq.platform_link() {
                            println!("Published: {}", link);
                        }
                    }
                    Err(e @ Error::AuthorizationExpired { .. }) if seq.is_signed_out() => {
                        println!("Signed out. Run `vidrelay login` and try again.");
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            }

            info!("Run finished at stage: {}", seq.stage());
            println!("\n{}", seq.session().summary());
        }

        Commands::Fetch { reference, output } => {
            seq.request_metadata(&reference).await?;

            let display = follow_progress(seq, ProgressStage::Acquisition);
            let result = seq.initiate_acquisition(&reference).await;
            finish_display(display).await;
            result?;

            let dir = output.unwrap_or_else(|| config.download_dir());
            let path = seq.save_to_device(&dir).await?;
            println!("Saved: {}", path.display());
        }

        Commands::Login => {
            seq.begin_authorization().await?;
        }

        Commands::Logout => {
            seq.end_session().await?;
        }

        // Answered without a backend in `run`
        Commands::Init { .. } | Commands::Config => {}
    }

    Ok(())
}

fn build_sequencer(config: &Config, assume_yes: bool) -> Result<StageSequencer> {
    let backend = Arc::new(HttpBackend::new(config)?);
    let prompt: Arc<dyn ReauthPrompt> = if assume_yes {
        Arc::new(FixedPrompt(true))
    } else {
        Arc::new(CliPrompt)
    };
    Ok(StageSequencer::new(
        config.clone(),
        backend,
        prompt,
        Arc::new(PrintNavigator),
    ))
}

fn print_metadata(metadata: &VideoMetadata) {
    println!("Title:    {}", metadata.title);
    println!("Duration: {}", metadata.formatted_duration());
    println!("Uploader: {}", metadata.uploader_name);
    if !metadata.thumbnail_url.is_empty() {
        println!("Thumb:    {}", metadata.thumbnail_url);
    }
}

/// Print status changes of one stage until it stops running
fn follow_progress(seq: &StageSequencer, stage: ProgressStage) -> Option<JoinHandle<()>> {
    let rx = seq.progress().subscribe(stage)?;
    Some(tokio::spawn(render_progress(rx)))
}

async fn render_progress(mut rx: watch::Receiver<ProgressSnapshot>) {
    let mut last_status = "";
    while rx.changed().await.is_ok() {
        let snap = rx.borrow_and_update().clone();
        if snap.status != last_status && snap.state != TimerState::Stopped {
            eprintln!("[{:>3}%] {}", snap.rounded(), snap.status);
            last_status = snap.status;
        }
        if matches!(snap.state, TimerState::Completed) {
            break;
        }
    }
}

async fn finish_display(display: Option<JoinHandle<()>>) {
    if let Some(handle) = display {
        // Give the final snapshot a chance to print
        tokio::task::yield_now().await;
        handle.abort();
        if let Err(e) = handle.await {
            if !e.is_cancelled() {
                warn!("Progress display failed: {}", e);
            }
        }
    }
}
