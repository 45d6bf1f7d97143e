use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use trapcam::{
    run_sequential, EventBus, FrameSource, ImageDirSource, MotionDetector, MotionOutcome,
    Pipeline, PreRollBuffer, RawVideoOpener, RecorderController, RetentionPolicy, StatvfsProbe,
    TagApi, TrapcamConfig,
};

#[derive(Parser, Debug)]
#[command(name = "trapcam")]
#[command(about = "Motion-gated video recording pipeline")]
#[command(version)]
#[command(long_about = "Analyzes a frame stream for motion and records gated video \
sessions: a pre-roll of footage leading into the trigger, the motion event itself \
bounded by minimum and maximum lengths, and a background snapshot for scene context. \
Old recordings are pruned when disk usage exceeds its budget.")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "trapcam.toml", help = "Path to TOML configuration file")]
    config: String,

    /// Directory of input frames, read in filename order
    #[arg(short, long, value_name = "DIR", help = "Directory of input frame images")]
    frames: Option<String>,

    /// Override the output directory for recorded videos
    #[arg(short, long, value_name = "DIR", help = "Override recording.video_dir")]
    output: Option<String>,

    /// Run the queued producer/consumer pipeline instead of sequential processing
    #[arg(long, help = "Decode and analyze on separate workers behind a bounded queue")]
    queued: bool,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, help = "Enable verbose info level logging")]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration file and exit without processing")]
    validate_config: bool,

    /// Print default configuration and exit
    #[arg(long, help = "Print default configuration in TOML format and exit")]
    print_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, value_name = "FORMAT", help = "Log output format: json, pretty, or compact")]
    log_format: Option<String>,

    /// Base URL of the tagging API
    #[arg(long, value_name = "URL", help = "Tag the processed recording via this API")]
    api_url: Option<String>,

    /// Tagging API username
    #[arg(long, value_name = "USER", requires = "api_url")]
    api_user: Option<String>,

    /// Tagging API password
    #[arg(long, value_name = "PASSWORD", requires = "api_user")]
    api_password: Option<String>,

    /// Upstream recording id to tag with the motion outcome
    #[arg(long, value_name = "ID", requires = "api_url")]
    recording_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Handle special modes that don't require full initialization
    if args.print_config {
        print_default_config()?;
        return Ok(());
    }

    // Initialize logging
    init_logging(&args)?;

    info!("Starting trapcam v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    // Load and validate configuration
    let mut config = match TrapcamConfig::load_from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if args.validate_config {
        match config.validate() {
            Ok(()) => {
                info!("Configuration validation successful");
                println!("✓ Configuration is valid");
                return Ok(());
            }
            Err(e) => {
                error!("Configuration validation failed: {}", e);
                eprintln!("✗ Configuration validation failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    if let Some(output) = args.output.as_ref() {
        config.recording.video_dir = output.clone();
    }
    config.validate()?;

    let frames_dir = match args.frames.as_ref() {
        Some(dir) => PathBuf::from(dir),
        None => {
            eprintln!("✗ No input: pass --frames <DIR>");
            std::process::exit(2);
        }
    };

    // Assemble the pipeline
    let mut source = ImageDirSource::open(&frames_dir)?;
    let detector = MotionDetector::new(
        config.detector_settings(),
        config.reference_mode(),
        config.update_policy(),
    )?;
    let preroll = Arc::new(PreRollBuffer::new(config.preroll_capacity())?);
    let recorder_settings = config.recorder_settings();
    let retention = if config.storage.prune_old {
        Some(RetentionPolicy::new(
            recorder_settings.video_dir.clone(),
            &recorder_settings.device_id,
            "rawv",
            config.storage.max_disk_usage_percent,
            Box::new(StatvfsProbe),
        ))
    } else {
        None
    };
    if let Some(policy) = retention.as_ref() {
        std::fs::create_dir_all(&recorder_settings.video_dir)?;
        // Prime the storage budget before the first session
        if let Err(e) = policy.ensure_space() {
            warn!("Initial pruning pass failed: {}", e);
        }
    }

    let events = EventBus::new(config.pipeline.event_bus_capacity);
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            let rendered = serde_json::to_string(&event)
                .unwrap_or_else(|_| event.event_type().to_string());
            info!("Pipeline event: {}", rendered);
        }
    });

    let mut controller = RecorderController::new(
        recorder_settings,
        detector,
        Arc::clone(&preroll),
        Box::new(RawVideoOpener),
        retention,
        events,
    );

    // Process the stream
    let controller = if args.queued {
        let (sender, handle) = Pipeline::spawn(controller, config.pipeline.queue_capacity)?;
        let producer = tokio::task::spawn_blocking(move || -> trapcam::Result<u64> {
            let mut fed = 0u64;
            while let Some(frame) = source.next_frame()? {
                sender.blocking_send(frame)?;
                fed += 1;
            }
            sender.blocking_end()?;
            Ok(fed)
        });
        let fed = producer.await??;
        info!("Producer fed {} frames", fed);
        handle.await??
    } else {
        tokio::task::spawn_blocking(move || -> trapcam::Result<RecorderController> {
            run_sequential(&mut source, &mut controller)?;
            Ok(controller)
        })
        .await??
    };

    let stats = controller.stats();
    info!(
        "Done: {} frames processed, {} session(s) recorded, {} failed",
        stats.frames_processed, stats.sessions_closed, stats.sessions_failed
    );
    for record in controller.records() {
        info!(
            "  {} ({} frames, trigger {}..{})",
            record.path.display(),
            record.frame_count,
            record.first_seq,
            record.last_seq
        );
    }

    // Report the outcome upstream when asked to
    if let (Some(api_url), Some(recording_id)) = (args.api_url, args.recording_id) {
        let user = args.api_user.unwrap_or_default();
        let password = args.api_password.unwrap_or_default();
        let outcome = MotionOutcome::from_sessions(controller.records());
        tokio::task::spawn_blocking(move || -> trapcam::Result<()> {
            let mut api = TagApi::new(&api_url);
            api.authenticate(&user, &password)?;
            api.tag_recording(&recording_id, &outcome)
        })
        .await?
        .map_err(|e| {
            error!("Tagging failed: {}", e);
            e
        })?;
    }

    Ok(())
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    // Determine log level based on flags
    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("trapcam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .boxed(),
        Some("pretty") | None => fmt::layer()
            .pretty()
            .with_target(true)
            .with_thread_ids(args.debug)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer()
                .with_target(true)
                .with_thread_ids(args.debug)
                .with_file(args.debug)
                .with_line_number(args.debug)
                .boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}

/// Print default configuration in TOML format
fn print_default_config() -> Result<()> {
    println!("# Trapcam configuration file");
    println!("# Defaults for every available option");
    println!();
    println!("{}", toml::to_string_pretty(&TrapcamConfig::default())?);
    Ok(())
}
