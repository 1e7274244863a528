//! PCM Mixer - 实时多源混音器
//!
//! 把多个音频文件（和可选的测试音）混成一路 44100 Hz / 16-bit 立体声输出

use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use pcm_mixer::audio::output::list_output_devices;
use pcm_mixer::engine::{EngineConfig, MixEngine, ThreadPriority};
use pcm_mixer::source::{ClipSource, Source, ToneSource};

/// PCM Mixer - Real-time multi-source audio mixer
#[derive(Parser)]
#[command(name = "pcm-mixer")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Show verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show audio output devices
    Info,

    /// Mix audio files and play until they finish
    Play(PlayArgs),
}

#[derive(clap::Args)]
struct PlayArgs {
    /// Audio files to mix (44100 Hz, mono or stereo)
    #[arg(value_name = "FILES")]
    files: Vec<PathBuf>,

    /// Add a sine tone at this frequency in Hz
    #[arg(long, value_name = "HZ")]
    tone: Option<f64>,

    /// Loop every file until Ctrl+C
    #[arg(short, long = "loop")]
    looping: bool,

    /// Frames mixed per tick
    #[arg(short, long, default_value = "2048")]
    buffer_frames: usize,

    /// Select output device by name (use 'info' command to list devices)
    #[arg(short, long)]
    device: Option<String>,

    /// Linear gain applied to every source
    #[arg(short, long, default_value = "1.0")]
    gain: f32,

    /// Playback thread priority: normal, elevated or highest
    #[arg(long, default_value = "highest")]
    priority: ThreadPriority,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 初始化日志
    let level = if cli.verbose { "info" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Info => show_device_info(),
        Commands::Play(ref args) => play(args),
    }
}

/// 显示设备信息
fn show_device_info() -> anyhow::Result<()> {
    println!("=== Audio Output Devices ===\n");

    let devices = list_output_devices()?;
    if devices.is_empty() {
        println!("No output devices found.");
        return Ok(());
    }

    for (i, device) in devices.iter().enumerate() {
        let default_mark = if device.is_default { " *" } else { "" };
        println!("[{:>3}] {}{}", i, device.name, default_mark);
    }

    println!();
    println!("* = system default");
    println!("Select device: pcm-mixer play -d <NAME> <files>");

    Ok(())
}

/// 根据命令行参数创建引擎配置
fn create_engine_config(args: &PlayArgs) -> EngineConfig {
    let mut config = EngineConfig::new()
        .buffer_frames(args.buffer_frames)
        .thread_priority(args.priority);
    if let Some(ref name) = args.device {
        config = config.device(name.clone());
    }
    config
}

fn play(args: &PlayArgs) -> anyhow::Result<()> {
    if args.files.is_empty() && args.tone.is_none() {
        anyhow::bail!("nothing to play: pass audio files or --tone <HZ>");
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let engine = MixEngine::with_default_output(create_engine_config(args));

    // 先全部解码，避免开始播放后才发现坏文件
    let mut clips = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let clip = ClipSource::open(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        clip.set_looping(args.looping);
        clip.set_gain(args.gain);
        clips.push(Arc::new(clip));
    }

    for clip in &clips {
        engine.add_source(clip.clone());
    }
    if let Some(freq) = args.tone {
        engine.add_source(Arc::new(ToneSource::new(freq, args.gain)));
    }

    println!("PCM Mixer");
    println!("Sources: {} file(s){}", clips.len(), if args.tone.is_some() { " + tone" } else { "" });
    let frames = engine.config().buffer_frames;
    println!(
        "Buffer: {} frames ({:.1} ms)",
        frames,
        pcm_mixer::AudioFormat::STREAM.frames_to_ns(frames) as f64 / 1_000_000.0
    );
    println!("Press Ctrl+C to stop.\n");

    engine.start()?;

    let started = Instant::now();
    let mut last_status = Instant::now();
    // 只有测试音时一直播放到 Ctrl+C
    let forever = clips.is_empty() || args.looping;

    while running.load(Ordering::SeqCst) {
        if !engine.is_playing() {
            eprintln!("\nOutput device stopped unexpectedly.");
            break;
        }
        if !forever && clips.iter().all(|c| !c.is_playing()) {
            break;
        }

        if last_status.elapsed() >= Duration::from_millis(500) {
            let stats = engine.stats();
            print!(
                "\r  {:>6.1}s | peak {:>5.1}% | load {:>5.1}% | underruns {}   ",
                started.elapsed().as_secs_f64(),
                stats.peak * 100.0,
                stats.worst_load() * 100.0,
                stats.underruns
            );
            io::stdout().flush().ok();
            last_status = Instant::now();
        }

        std::thread::sleep(Duration::from_millis(20));
    }

    engine.close();
    println!("\n");
    println!("{}", engine.stats());

    Ok(())
}
