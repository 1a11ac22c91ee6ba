// =============================================================================
// CANVAS BRIDGE - one 2D canvas, three presentation backends
// =============================================================================
//
// A tiny-skia canvas is drawn every frame and handed to whichever backend
// owns the screen:
//
// ┌─────────────────────────────────────────────────────────────────┐
// │  PresentationLoop (acquire -> draw -> submit -> present)        │
// │    └── RenderBackend                                            │
// │          ├── cpu     : raster pixmap, snapshot to PNG           │
// │          ├── gl      : context swap, texture blit               │
// │          └── vulkan  : swapchain + N frames in flight           │
// └─────────────────────────────────────────────────────────────────┘
//
// EXIT STATUS:
//   0        clean shutdown
//   2..=8    initialization failures (config, window, surface, ...)
//   9        fatal frame error
//   10       device lost
//   11       snapshot could not be written
//
// =============================================================================

mod app;
mod backend;
mod bridge;
mod config;
mod error;
mod present_loop;
mod scene;
mod snapshot;
mod surface;
mod text;

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use winit::event_loop::EventLoop;

use app::App;
use backend::{BackendKind, PresentMode, RenderBackend, WindowingHandle};
use config::{Config, DebugConfig};
use error::{AppError, InitError};
use present_loop::{PresentationLoop, StepOutcome};

#[derive(Debug, Parser)]
#[command(version, about = "Present a 2D canvas through a CPU, GL or Vulkan backend")]
struct Cli {
    /// Configuration file. Missing means defaults.
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// cpu, gl or vulkan
    #[arg(short, long)]
    backend: Option<BackendKind>,

    /// Stop after this many presented frames (0 runs until the window closes)
    #[arg(short, long)]
    frames: Option<u64>,

    /// Write the last CPU frame to this PNG
    #[arg(short, long)]
    output: Option<PathBuf>,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// immediate, mailbox, fifo or fifo_relaxed
    #[arg(long)]
    present_mode: Option<PresentMode>,
}

impl Cli {
    fn apply(&self, config: &mut Config) {
        if let Some(backend) = self.backend {
            config.graphics.backend = backend;
        }
        if let Some(frames) = self.frames {
            config.output.frames = frames;
        }
        if let Some(output) = &self.output {
            config.output.snapshot_path = Some(output.clone());
        }
        if let Some(width) = self.width {
            config.window.width = width;
        }
        if let Some(height) = self.height {
            config.window.height = height;
        }
        if let Some(mode) = self.present_mode {
            config.graphics.present_mode = mode.to_string();
        }
    }
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(&cli) {
        Ok(()) => {
            log::info!("Shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("fatal [{}]: {}", e.category(), e);
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: &Cli) -> Result<(), AppError> {
    // ─────────────────────────────────────────────────────────────────────────
    // STEP 1: Configuration
    // ─────────────────────────────────────────────────────────────────────────
    let loaded = Config::load_from_path(&cli.config);
    init_logging(loaded.as_ref().ok().map(|c| &c.debug));

    let mut config = loaded.map_err(|e| InitError::Config(format!("{e:#}")))?;
    cli.apply(&mut config);
    config.validate()?;

    log::info!("Starting canvas bridge");
    log::info!(
        "Backend: {}, window {}x{} ({})",
        config.graphics.backend,
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.present_mode());

    // ─────────────────────────────────────────────────────────────────────────
    // STEP 2: Run the selected backend
    // ─────────────────────────────────────────────────────────────────────────
    match config.graphics.backend {
        BackendKind::Cpu => run_headless(&config),
        _ => run_windowed(config),
    }
}

/// Initialize logging. `RUST_LOG` overrides the default `info` level.
fn init_logging(debug: Option<&DebugConfig>) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info).parse_default_env();

    let mut file_error = None;
    if let Some(debug) = debug.filter(|d| d.log_to_file) {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Canvas Bridge Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => file_error = Some((debug.log_file.clone(), e)),
        }
    }

    builder.init();

    if let Some((path, e)) = file_error {
        log::warn!("Could not open log file {}: {}, logging to stderr", path, e);
    }
}

// =============================================================================
// HEADLESS (CPU)
// =============================================================================

fn run_headless(config: &Config) -> Result<(), AppError> {
    let init = backend::initialize(
        BackendKind::Cpu,
        WindowingHandle::Headless,
        &config.backend_settings(),
    )?;
    let mut presenter = PresentationLoop::new(init.backend);
    let clear = config.clear_color();

    let frames = config.output.frames.max(1);
    for _ in 0..frames {
        if presenter.step(|canvas| scene::draw_demo(canvas, clear))? == StepOutcome::Terminated {
            break;
        }
    }
    log::info!("Rendered {} frame(s) on the CPU", presenter.stats().frames_presented);

    if let Some(path) = &config.output.snapshot_path {
        let snapshot = presenter
            .backend()
            .and_then(|b| b.snapshot())
            .ok_or_else(|| AppError::Output("no frame available".into()))?;
        snapshot::write_png(&snapshot, path).map_err(|e| AppError::Output(format!("{e:#}")))?;
        log::info!("Wrote {}", path.display());
    }

    presenter.shutdown();
    Ok(())
}

// =============================================================================
// WINDOWED (GL / VULKAN)
// =============================================================================

fn run_windowed(config: Config) -> Result<(), AppError> {
    let event_loop = EventLoop::new().map_err(|e| InitError::Window(e.to_string()))?;
    let mut app = App::new(config);
    event_loop
        .run_app(&mut app)
        .map_err(|e| InitError::Window(e.to_string()))?;
    app.finish()
}
