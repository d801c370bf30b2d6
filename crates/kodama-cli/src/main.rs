//! kodama CLI — cached text-to-speech against a local engine.
//!
//! ```text
//! kodama "こんにちは。今日はいい天気ですね。"
//! kodama --speaker 3 --speed 1.2 "ゆっくりしていってね" -o out.mp3
//! kodama speakers / devices [--full] [--json]
//! kodama --init / --clear / --benchmark / --test
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use kodama_core::request::{DEFAULT_PITCH, DEFAULT_SPEED, DEFAULT_VOLUME};
use kodama_core::{AppError, VoiceRequest};
use kodama_lib::cache::CacheManager;
use kodama_lib::channel::EngineSynthesizer;
use kodama_lib::config::AppConfig;
use kodama_lib::devices::list_output_devices;
use kodama_lib::engine::{EngineClient, DEFAULT_READY_TIMEOUT};
use kodama_lib::filler::FillerStore;
use kodama_lib::retry::RetryPolicy;
use kodama_lib::speak::{run_tts, TtsOptions, TtsReport};

const TEST_UTTERANCE: &str = "これはテストです。聞こえていますか？";
const BENCHMARK_UTTERANCE: &str = "これはベンチマーク用のテキストです。二文目も含みます。";

/// kodama — cached text-to-speech runner for a local VOICEVOX-style engine
#[derive(Parser)]
#[command(name = "kodama", version, about)]
struct Cli {
    /// Text to speak
    text: Option<String>,

    /// Speaker style id (defaults to the configured speaker)
    #[arg(short = 's', long)]
    speaker: Option<u32>,

    /// Speed scale
    #[arg(long)]
    speed: Option<f64>,

    /// Pitch offset
    #[arg(long)]
    pitch: Option<f64>,

    /// Volume scale
    #[arg(long)]
    volume: Option<f64>,

    /// Bypass segmentation and the cache entirely
    #[arg(long)]
    no_cache: bool,

    /// Fail instead of synthesizing when a segment is not cached
    #[arg(long)]
    cache_only: bool,

    /// Export the synthesized audio to this path (.wav or .mp3)
    #[arg(short = 'o', long)]
    out: Option<PathBuf>,

    /// Do not play audio (still warms the cache)
    #[arg(long)]
    no_play: bool,

    /// Verbose output (implies --log-level debug)
    #[arg(short, long)]
    verbose: bool,

    /// Log filter (trace|debug|info|warn|error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log format (pretty|json)
    #[arg(long, default_value = "pretty")]
    log_format: String,

    /// Initialize the speaker on the engine and pre-synthesize fillers
    #[arg(long)]
    init: bool,

    /// Wipe the audio cache
    #[arg(long)]
    clear: bool,

    /// With --clear, also delete filler clips
    #[arg(long)]
    fillers: bool,

    /// Time a cold synthesis against a warm cached replay
    #[arg(long)]
    benchmark: bool,

    /// Speak a short canned utterance to verify the audio path
    #[arg(long)]
    test: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// List engine speakers and styles
    Speakers,
    /// List audio output devices
    Devices {
        /// Include sample rate and channel details
        #[arg(long)]
        full: bool,
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(&cli);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!();
                cancel.cancel();
            }
        });
    }

    let code = match dispatch(&cli, cancel).await {
        Ok(()) => 0,
        Err(AppError::OperationCancelled) => {
            println!("{}", AppError::OperationCancelled.user_message());
            0
        }
        Err(e) => {
            eprintln!("エラー: {}", e.user_message());
            eprintln!("ヒント: {}", e.suggestion());
            if cli.verbose {
                eprintln!("詳細 [{}]: {e}", e.code());
            }
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn init_tracing(cli: &Cli) {
    let level = if cli.verbose { "debug" } else { cli.log_level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if cli.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(cli: &Cli, cancel: CancellationToken) -> Result<(), AppError> {
    let config = AppConfig::load(None)?;

    match &cli.command {
        Some(Command::Speakers) => return cmd_speakers(&config).await,
        Some(Command::Devices { full, json }) => return cmd_devices(*full, *json),
        None => {}
    }

    if cli.init {
        return cmd_init(&config, &cancel).await;
    }
    if cli.clear {
        return cmd_clear(&config, cli.fillers, &cancel).await;
    }
    if cli.benchmark {
        let request = build_request(cli, &config, BENCHMARK_UTTERANCE.to_string());
        return cmd_benchmark(&config, request, &cancel).await;
    }

    let text = if cli.test {
        TEST_UTTERANCE.to_string()
    } else {
        match &cli.text {
            Some(text) if !text.trim().is_empty() => text.clone(),
            _ => {
                return Err(AppError::InvalidArguments {
                    message: "no text given".into(),
                });
            }
        }
    };

    let request = build_request(cli, &config, text);
    let options = TtsOptions {
        no_cache: cli.no_cache,
        cache_only: cli.cache_only,
        out_path: cli.out.clone(),
        no_play: cli.no_play,
    };

    let report = run_tts(&config, request, options, cancel).await?;
    if cli.verbose {
        print_report(&report);
    }
    Ok(())
}

fn build_request(cli: &Cli, config: &AppConfig, text: String) -> VoiceRequest {
    VoiceRequest::new(text, cli.speaker.unwrap_or(config.voicevox.default_speaker)).with_prosody(
        cli.speed.unwrap_or(DEFAULT_SPEED),
        cli.pitch.unwrap_or(DEFAULT_PITCH),
        cli.volume.unwrap_or(DEFAULT_VOLUME),
    )
}

fn print_report(report: &TtsReport) {
    println!(
        "segments: {} ({} cached)",
        report.segment_count, report.cached_segments
    );
    println!("elapsed: {:.2?}", report.elapsed);
    if let Some(stats) = &report.cache_stats {
        println!(
            "cache: {} entries / {:.1} MiB on disk, hit rate {:.0}%",
            stats.disk_entries,
            stats.disk_bytes as f64 / (1024.0 * 1024.0),
            stats.hit_rate * 100.0
        );
        println!(
            "memory: {} items / {:.1} MiB, hit rate {:.0}%",
            stats.memory.items,
            stats.memory.current_bytes as f64 / (1024.0 * 1024.0),
            stats.memory.hit_rate * 100.0
        );
    }
}

async fn cmd_speakers(config: &AppConfig) -> Result<(), AppError> {
    let engine = engine_client(config)?;
    engine.ensure_ready(DEFAULT_READY_TIMEOUT).await?;

    for speaker in engine.list_speakers().await? {
        match &speaker.version {
            Some(version) => println!("{} (v{version})", speaker.name),
            None => println!("{}", speaker.name),
        }
        for style in &speaker.styles {
            println!("  {:>4}  {}", style.id, style.name);
        }
    }
    Ok(())
}

fn cmd_devices(full: bool, json: bool) -> Result<(), AppError> {
    let devices = list_output_devices()?;
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&devices).map_err(|e| AppError::UnknownError {
                message: e.to_string()
            })?
        );
        return Ok(());
    }

    for device in &devices {
        let marker = if device.is_default { "*" } else { " " };
        if full {
            let rate = device
                .sample_rate
                .map(|r| format!("{r} Hz"))
                .unwrap_or_else(|| "?".into());
            let channels = device
                .channels
                .map(|c| c.to_string())
                .unwrap_or_else(|| "?".into());
            println!("{marker} {:>3}  {}  ({rate}, {channels}ch)", device.index, device.name);
        } else {
            println!("{marker} {:>3}  {}", device.index, device.name);
        }
    }
    Ok(())
}

async fn cmd_init(config: &AppConfig, cancel: &CancellationToken) -> Result<(), AppError> {
    let engine = engine_client(config)?;
    engine.ensure_ready(DEFAULT_READY_TIMEOUT).await?;
    engine
        .initialize_speaker(config.voicevox.default_speaker)
        .await?;
    println!("スピーカー {} を初期化しました", config.voicevox.default_speaker);

    let synth = EngineSynthesizer::new(engine, RetryPolicy::default());
    let filler = FillerStore::new(
        &config.filler,
        config.cache.use_executable_base_directory,
        config.voicevox.default_speaker,
    );
    let synthesized = filler.initialize(&synth, cancel).await?;
    println!("フィラー音声を {synthesized} 件生成しました");
    Ok(())
}

async fn cmd_clear(
    config: &AppConfig,
    include_fillers: bool,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    let cache = CacheManager::new(&config.cache, cancel.child_token())?;
    let removed = cache.clear().await?;
    println!("キャッシュを {removed} 件削除しました");

    if include_fillers {
        let filler = FillerStore::new(
            &config.filler,
            config.cache.use_executable_base_directory,
            config.voicevox.default_speaker,
        );
        let removed = filler.clear().await;
        println!("フィラー音声を {removed} 件削除しました");
    }
    Ok(())
}

/// Cold engine round-trip vs. warm cached replay, no playback.
async fn cmd_benchmark(
    config: &AppConfig,
    request: VoiceRequest,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    let cold_opts = TtsOptions {
        no_cache: true,
        no_play: true,
        ..TtsOptions::default()
    };
    let cold = run_tts(config, request.clone(), cold_opts, cancel.clone()).await?;

    let warm_opts = TtsOptions {
        no_play: true,
        ..TtsOptions::default()
    };
    // First pass fills the cache, second pass measures the replay.
    run_tts(config, request.clone(), warm_opts.clone(), cancel.clone()).await?;
    let warm = run_tts(config, request, warm_opts, cancel.clone()).await?;
    debug!(cached = warm.cached_segments, "benchmark warm pass");

    println!("コールド合成: {:.2?}", cold.elapsed);
    println!("キャッシュ再生成: {:.2?}", warm.elapsed);
    Ok(())
}

fn engine_client(config: &AppConfig) -> Result<EngineClient, AppError> {
    EngineClient::new(
        &config.voicevox.base_url,
        Duration::from_secs(config.voicevox.connection_timeout_secs),
    )
}
