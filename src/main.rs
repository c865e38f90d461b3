//! # Ramble - Main Application Entry Point
//!
//! A self-hosted Whisper transcription service. The same binary runs the HTTP
//! server, warms the model cache and acts as a command line client.
//!
//! ## Commands:
//! - `ramble serve` (default): Start the HTTP server
//! - `ramble download-models`: Fetch every model size into the cache
//! - `ramble models`: Print the model catalogue
//! - `ramble transcribe <file>`: Upload a file to a running server
//! - `ramble show-config`: Print the effective configuration as TOML
//!
//! ## Application Architecture:
//! - **config**: Application configuration (TOML files + environment variables)
//! - **state**: Shared application state and metrics
//! - **audio**: Upload decoding (WAV fast path, ffmpeg for everything else)
//! - **transcription**: Whisper models, engine, registry and response shaping
//! - **health**: Health and metrics endpoints
//! - **middleware**: Request logging and metrics collection
//! - **handlers**: HTTP request handlers for the API endpoints
//! - **client**: The `transcribe` command's HTTP client
//! - **error**: Error types and HTTP error responses

mod audio;
mod client;
mod config;
mod device;
mod error;
mod handlers;
mod health;
mod middleware;
mod protocol;
mod state;
mod transcription;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use clap::{Parser, Subcommand};
use config::AppConfig;
use state::AppState;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{ModelSize, SpeechEngine, WhisperEngine};

/// Global shutdown signal, set by the signal handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

/// Self-hosted Whisper transcription service
#[derive(Parser)]
#[command(name = "ramble")]
#[command(version)]
#[command(about = "Self-hosted Whisper transcription service")]
#[command(
    after_help = "CONFIGURATION:\n    Config file:   ./config.toml (optional)\n    Environment:   APP_<SECTION>__<KEY>, e.g. APP_MODELS__DEFAULT_MODEL=small\n    Client:        RAMBLE_ENDPOINT overrides client.endpoint"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server (default)
    Serve,
    /// Download every model size into the cache
    DownloadModels {
        /// Cache directory (defaults to models.cache_dir, then the HuggingFace cache)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
    /// Print the model catalogue
    Models,
    /// Transcribe a file with a running Ramble server
    Transcribe {
        /// Path to the audio file
        file: PathBuf,
        /// Language code (e.g., en, es); detected when omitted
        #[arg(short, long)]
        language: Option<String>,
        /// Server URL
        #[arg(short, long)]
        endpoint: Option<String>,
        /// Show segment details
        #[arg(short, long)]
        segments: bool,
        /// Save the text to a file
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Model size (tiny, base, small, medium, large)
        #[arg(short, long)]
        model: Option<String>,
        /// Translate to English
        #[arg(long)]
        translate: bool,
        /// Disable pause-based speaker labels
        #[arg(long)]
        no_speakers: bool,
    },
    /// Print the effective configuration as TOML
    ShowConfig,
}

/// The application entry point.
///
/// ## What this function does:
/// 1. **Loads `.env`** so environment overrides can live in a file
/// 2. **Parses the command line** and picks a command (serve by default)
/// 3. **Sets up logging**: verbose for the server, quiet for the client
/// 4. **Loads and validates configuration** before doing any work
#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            init_tracing("ramble=debug,actix_web=info")?;
            let config = load_config()?;
            serve(config).await
        }
        Commands::DownloadModels { cache_dir } => {
            init_tracing("ramble=info")?;
            let config = load_config()?;
            download_models(&config, cache_dir).await
        }
        Commands::Models => {
            print_models();
            Ok(())
        }
        Commands::Transcribe {
            file,
            language,
            endpoint,
            segments,
            output,
            model,
            translate,
            no_speakers,
        } => {
            init_tracing("ramble=warn")?;
            let config = load_config()?;
            let env_endpoint = std::env::var(client::ENDPOINT_ENV).ok();
            let options = client::ClientOptions {
                endpoint: client::resolve_endpoint(
                    endpoint.as_deref(),
                    env_endpoint.as_deref(),
                    &config.client.endpoint,
                ),
                language,
                model,
                translate,
                speaker_detection: if no_speakers { Some(false) } else { None },
                timeout: Duration::from_secs(config.client.timeout_secs),
            };
            run_client(&file, &options, segments, output.as_deref()).await
        }
        Commands::ShowConfig => {
            let config = load_config()?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config() -> Result<AppConfig> {
    let config = AppConfig::load()?;
    config.validate()?;
    Ok(config)
}

/// Run the HTTP server until SIGINT/SIGTERM.
async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting ramble v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let preference = config
        .models
        .device
        .parse::<device::DevicePreference>()
        .map_err(|e| anyhow::anyhow!(e))?;
    let device = device::select_device(preference);
    let cache_dir = transcription::model::resolve_cache_dir(config.models.cache_dir.as_deref());
    let engine: Arc<dyn SpeechEngine> = Arc::new(WhisperEngine::new(
        device,
        cache_dir,
        config.models.max_loaded_models,
        config.models.max_model_memory_mb,
    ));

    let default_model = config.default_model()?;
    if config.models.preload {
        info!("Preloading whisper-{}", default_model);
        if let Err(e) = engine.ensure_loaded(default_model).await {
            warn!("Preloading whisper-{} failed, it will load on first use: {:#}", default_model, e);
        }
    }

    let app_state = AppState::new(config.clone(), engine);
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {} (default model whisper-{})", bind_addr, default_model);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            // Middleware runs in reverse order of registration for requests
            .wrap(cors)
            .wrap(TracingLogger::default())
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/", web::get().to(handlers::service_info))
            .route("/health", web::get().to(health::health_check))
            .route("/metrics", web::get().to(health::detailed_metrics))
            .route("/models", web::get().to(handlers::list_models))
            .route("/transcribe", web::post().to(handlers::transcribe))
            .route("/translate", web::post().to(handlers::translate))
            .default_service(web::to(handlers::not_found))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    info!("Server stopped gracefully");
    Ok(())
}

/// Fetch every model size; exits non-zero when any size failed.
async fn download_models(config: &AppConfig, cache_dir: Option<PathBuf>) -> Result<()> {
    let cache_dir = transcription::model::resolve_cache_dir(
        cache_dir.as_deref().or(config.models.cache_dir.as_deref()),
    );
    println!("Downloading Whisper models to {}", cache_dir.display());

    let report = transcription::downloader::download_models(&cache_dir).await;
    for line in report.lines() {
        println!("  {}", line);
    }

    if report.is_success() {
        println!("\nAll models ready!");
        Ok(())
    } else {
        Err(anyhow::anyhow!("{} model(s) failed to download", report.failures()))
    }
}

fn print_models() {
    println!(
        "{:<8} {:<8} {:<8} {:<6} {:>8}  {}",
        "MODEL", "SPEED", "ACCURACY", "VRAM", "PARAMS", "REPOSITORY"
    );
    for size in ModelSize::ALL {
        let default = if size == ModelSize::default() { " (default)" } else { "" };
        println!(
            "{:<8} {:<8} {:<8} {:<6} {:>7}M  {}{}",
            size.to_string(),
            size.speed(),
            size.accuracy(),
            size.vram(),
            size.size_mb(),
            size.repo_name(),
            default
        );
    }
}

async fn run_client(
    file: &std::path::Path,
    options: &client::ClientOptions,
    show_segments: bool,
    output: Option<&std::path::Path>,
) -> Result<()> {
    eprintln!("Uploading {}...", file.display());
    eprintln!("Endpoint: {}", options.endpoint);

    let result = client::transcribe_file(file, options).await?;
    client::print_transcription(&result, show_segments);

    if let Some(output) = output {
        tokio::fs::write(output, &result.text).await?;
        println!("\nSaved to: {}", output.display());
    }

    println!("\nRaw text (for copying):\n{}", result.text);
    Ok(())
}

/// Initialize the tracing (logging) system.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies.
fn init_tracing(default_filter: &str) -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}

/// Set up signal handlers for graceful shutdown.
///
/// Either SIGTERM or SIGINT sets the global shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let (mut sigterm, mut sigint) =
                match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                    (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                    (Err(e), _) | (_, Err(e)) => {
                        error!("Failed to install signal handlers: {}", e);
                        return;
                    }
                };

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT");
                }
            }
        }

        #[cfg(not(unix))]
        {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
                return;
            }
            info!("Received Ctrl+C");
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

/// Wait for the shutdown signal to be set.
async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_serve() {
        let cli = Cli::try_parse_from(["ramble"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_transcribe_arguments() {
        let cli = Cli::try_parse_from([
            "ramble", "transcribe", "audio.ogg", "-l", "en", "-s", "-m", "small", "--no-speakers",
        ])
        .unwrap();
        match cli.command {
            Some(Commands::Transcribe {
                file,
                language,
                segments,
                model,
                no_speakers,
                translate,
                ..
            }) => {
                assert_eq!(file, PathBuf::from("audio.ogg"));
                assert_eq!(language.as_deref(), Some("en"));
                assert!(segments);
                assert_eq!(model.as_deref(), Some("small"));
                assert!(no_speakers);
                assert!(!translate);
            }
            _ => panic!("expected transcribe"),
        }
    }

    #[test]
    fn test_download_models_arguments() {
        let cli = Cli::try_parse_from(["ramble", "download-models", "--cache-dir", "/models"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::DownloadModels { cache_dir: Some(ref dir) }) if dir == &PathBuf::from("/models")
        ));
    }
}
