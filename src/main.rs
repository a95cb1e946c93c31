use std::{
    io::{self, BufRead},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context as _};
use clap::{Args, Parser, Subcommand};
use image::{ImageBuffer, Rgb};
use tilebrot::{ConfigEvent, Engine, EngineConfig, Strategy, TileScatter};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tilebrot", version, about)]
struct Cli {
    /// JSON engine configuration. Flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log more; repeat for trace output.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the compute backends found on this machine.
    Backends,
    /// Compute one frame and save it as a PNG.
    Render(RenderArgs),
    /// Run the timing loop and append the results to the timing logs.
    Bench(BenchArgs),
    /// Read configuration events from stdin, one frame per line.
    Session(Overrides),
}

#[derive(Args, Debug)]
struct Overrides {
    #[arg(long, value_enum)]
    strategy: Option<Strategy>,

    /// Backend number as listed by `backends` (starting at 1).
    #[arg(long)]
    backend: Option<usize>,

    #[arg(long)]
    max_iterations: Option<u32>,

    #[arg(long)]
    tile_edge: Option<usize>,

    /// Square grid edge.
    #[arg(long)]
    size: Option<usize>,

    #[arg(long, value_enum)]
    tile_scatter: Option<TileScatter>,
}

impl Overrides {
    fn apply(&self, config: &mut EngineConfig) -> anyhow::Result<()> {
        if let Some(strategy) = self.strategy {
            config.strategy = strategy;
        }
        if let Some(backend) = self.backend {
            if backend == 0 {
                bail!("backends are numbered from 1");
            }
            config.backend = backend - 1;
        }
        if let Some(max_iterations) = self.max_iterations {
            config.max_iterations = max_iterations;
        }
        if let Some(tile_edge) = self.tile_edge {
            config.tile_edge = tile_edge;
        }
        if let Some(size) = self.size {
            config.width = size;
            config.height = size;
        }
        if let Some(tile_scatter) = self.tile_scatter {
            config.tile_scatter = tile_scatter;
        }
        Ok(())
    }
}

#[derive(Args, Debug)]
struct RenderArgs {
    #[command(flatten)]
    overrides: Overrides,

    /// Output PNG path.
    #[arg(long)]
    out: PathBuf,

    /// Append the elapsed time to the timing log.
    #[arg(long)]
    timed: bool,
}

#[derive(Args, Debug)]
struct BenchArgs {
    #[command(flatten)]
    overrides: Overrides,

    /// Invocations to measure.
    #[arg(long)]
    shots: Option<u32>,

    /// Directory for the timing logs.
    #[arg(long)]
    timing_dir: Option<PathBuf>,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("load config '{}'", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

fn start_engine(config: EngineConfig) -> anyhow::Result<Engine> {
    Engine::with_defaults(config).context("start engine")
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let config = load_config(cli.config.as_deref())?;
    match cli.cmd {
        Command::Backends => cmd_backends(config),
        Command::Render(args) => cmd_render(config, args),
        Command::Bench(args) => cmd_bench(config, args),
        Command::Session(overrides) => cmd_session(config, overrides),
    }
}

fn cmd_backends(config: EngineConfig) -> anyhow::Result<()> {
    let engine = start_engine(config)?;
    let listing = serde_json::to_string_pretty(engine.registry().descriptors())
        .context("serialise backend list")?;
    println!("{listing}");
    Ok(())
}

/// Saves a B,G,R texture as an RGB PNG.
fn save_texture(bgr: &[u8], width: usize, height: usize, path: &Path) -> anyhow::Result<()> {
    let image = ImageBuffer::<Rgb<u8>, Vec<u8>>::from_fn(width as u32, height as u32, |x, y| {
        let i = (y as usize * width + x as usize) * 3;
        Rgb([bgr[i + 2], bgr[i + 1], bgr[i]])
    });
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create output dir '{}'", parent.display()))?;
    }
    image
        .save(path)
        .with_context(|| format!("save image '{}'", path.display()))
}

fn cmd_render(mut config: EngineConfig, args: RenderArgs) -> anyhow::Result<()> {
    args.overrides.apply(&mut config)?;
    let (width, height) = (config.width, config.height);
    let mut engine = start_engine(config)?;

    let event = if args.timed {
        ConfigEvent::TimeOnce
    } else {
        ConfigEvent::ComputeOnce
    };
    match engine.update([event]).computed {
        Some(Ok(report)) => info!(
            strategy = %report.strategy,
            backend = %report.backend,
            "computed in {} ms",
            report.elapsed.as_millis()
        ),
        Some(Err(e)) => return Err(e).context("compute frame"),
        None => bail!("no compute backend available"),
    }

    save_texture(engine.texture(), width, height, &args.out)?;
    info!(path = %args.out.display(), "saved");
    Ok(())
}

fn cmd_bench(mut config: EngineConfig, args: BenchArgs) -> anyhow::Result<()> {
    args.overrides.apply(&mut config)?;
    if let Some(shots) = args.shots {
        config.timing_shots = shots;
    }
    if let Some(dir) = args.timing_dir {
        config.timing_dir = dir;
    }
    let mut engine = start_engine(config)?;
    if engine.registry().is_empty() {
        bail!("no compute backend available");
    }

    let mut failures = 0usize;
    let mut report = engine.update([ConfigEvent::StartTimingLoop]);
    loop {
        if let Some(Err(_)) = report.computed {
            failures += 1;
        }
        if !engine.state().timing.is_active() {
            break;
        }
        report = engine.update(Vec::<ConfigEvent>::new());
    }
    if failures > 0 {
        warn!(failures, "some measured invocations failed");
    }
    Ok(())
}

fn cmd_session(mut config: EngineConfig, overrides: Overrides) -> anyhow::Result<()> {
    overrides.apply(&mut config)?;
    let mut engine = start_engine(config)?;
    info!("reading events from stdin, one frame per line");
    for line in io::stdin().lock().lines() {
        let line = line.context("read stdin")?;
        let events: Vec<ConfigEvent> = line
            .split_whitespace()
            .filter_map(|name| match name.parse() {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("{e}");
                    None
                }
            })
            .collect();
        engine.update(events);
    }
    Ok(())
}
