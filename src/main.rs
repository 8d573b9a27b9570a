use anyhow::Context;
use audioscope::audio::{AudioBackend, CpalBackend, OfflineBackend};
use audioscope::ui::run_tui;
use audioscope::{SourceOption, TerminalChartSurface, Visualizer, VisualizerConfig};
use clap::Parser;
use log::{debug, info, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Offline pacing period
const OFFLINE_TICK: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "audioscope", version, about = "Real-time audio visualizer")]
struct Args {
    /// Source to start with: mic, truck, tone-sweep, symphony, or a URL/path
    #[arg(short, long)]
    source: Option<SourceOption>,

    /// Settings file, defaults to the user config directory
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unmute the output so the source is audible
    #[arg(short, long)]
    listen: bool,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Run without audio devices, rendering the graph on a timer
    #[arg(long)]
    offline: bool,
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<VisualizerConfig> {
    match path.or_else(VisualizerConfig::default_path) {
        Some(path) => VisualizerConfig::load(&path)
            .with_context(|| format!("Failed to load settings from {}", path.display())),
        None => Ok(VisualizerConfig::default()),
    }
}

/// Drives an offline backend at roughly real time.
fn spawn_offline_pacer(backend: Arc<OfflineBackend>) {
    let frames = (backend.sample_rate() as u128 * OFFLINE_TICK.as_millis() / 1000) as usize;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(OFFLINE_TICK);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut started = false;
        loop {
            interval.tick().await;
            // Output closes with the visualizer
            if started && !backend.has_output() {
                break;
            }
            started |= backend.has_output();
            backend.render(frames);
        }
        debug!("Offline pacer stopped");
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new()
        .filter_level(default_level)
        .parse_default_env()
        .init();

    let config = load_config(args.config)?;

    let backend: Arc<dyn AudioBackend> = if args.offline {
        let offline = Arc::new(OfflineBackend::new(48_000, 2));
        offline.enable_microphone(48_000);
        spawn_offline_pacer(Arc::clone(&offline));
        offline
    } else {
        Arc::new(CpalBackend::new().context("Failed to open the audio output")?)
    };

    let surface =
        TerminalChartSurface::new(config.history_seconds, config.spectrogram_columns);
    let visualizer = Arc::new(
        Visualizer::new(config, backend, surface).context("Failed to start the visualizer")?,
    );
    if args.listen {
        visualizer.set_gain(1.0)?;
    }
    info!("Audio context at {} Hz", visualizer.sample_rate());

    let result = run_tui(Arc::clone(&visualizer), args.source).await;
    visualizer.close();
    result.context("Terminal UI failed")
}
