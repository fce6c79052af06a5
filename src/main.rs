// =============================================================================
// QUAD RENDERER - Vulkan presentation loop
// =============================================================================
//
// FRAME FLOW (see frame.rs):
// 1. Pump window events (non-blocking)
// 2. Wait for the frame slot's fence
// 3. Acquire swapchain image, reset fence
// 4. Record + submit the slot's command buffer
// 5. Present; rebuild the swapchain if it went stale or the window resized
//
// =============================================================================

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Instant;

use quad_renderer::assets::{QuadMesh, SpirvFiles};
use quad_renderer::backend::VulkanRenderer;
use quad_renderer::config::Config;
use quad_renderer::frame::{FrameLoop, FrameOutcome};
use quad_renderer::window::{WindowSystem, WinitWindow};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));
    let config = Config::load_from_path(&config_path)?;

    init_logging(&config)?;
    log::info!("Starting quad renderer");
    config.log_source();
    log::info!(
        "Window: {}x{}, {} frame(s) in flight",
        config.window.width,
        config.window.height,
        config.graphics.max_frames_in_flight
    );

    run(&config)?;

    log::info!("Clean exit");
    Ok(())
}

/// Level comes from RUST_LOG when set, otherwise from the config file
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Env, Target};

    let mut builder =
        Builder::from_env(Env::default().default_filter_or(config.debug.log_level.as_str()));

    if let Some(path) = &config.debug.log_file {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {:?}", path))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.try_init().context("Failed to initialize logger")
}

fn run(config: &Config) -> Result<()> {
    // Declared before the renderer so it is dropped after it
    let mut window = WinitWindow::new(&config.window)?;

    let drawable = window
        .wait_for_drawable_size()
        .context("Window closed before it became visible")?;

    let mut renderer = VulkanRenderer::new(
        config,
        window.window(),
        drawable,
        Box::new(SpirvFiles::new(&config.shaders)),
        &QuadMesh,
    )
    .context("Failed to initialize Vulkan")?;

    let chain = renderer
        .chain_summary()
        .context("Renderer started without a swapchain")?;
    let mut frames = FrameLoop::new(renderer.frames_in_flight(), chain);
    let mut fps = FpsCounter::new(config.window.title.clone(), config.debug.show_fps);

    while !window.should_close() {
        window.pump_events();
        if window.should_close() {
            break;
        }

        let outcome = frames
            .draw_frame(&mut renderer, &mut window)
            .with_context(|| format!("Frame {} failed", frames.frame()))?;

        match outcome {
            FrameOutcome::Presented { .. } => fps.tick(&window),
            FrameOutcome::Skipped => {}
            FrameOutcome::Closed => break,
        }
    }

    log::info!(
        "Rendered {} frames, swapchain rebuilt {} time(s)",
        frames.frame(),
        frames.generation()
    );
    drop(renderer);
    Ok(())
}

// =============================================================================
// FPS TRACKING
// =============================================================================

struct FpsCounter {
    title: String,
    enabled: bool,
    frame_count: u32,
    last_frame_time: Instant,
    last_update: Instant,
}

impl FpsCounter {
    fn new(title: String, enabled: bool) -> Self {
        let now = Instant::now();
        Self {
            title,
            enabled,
            frame_count: 0,
            last_frame_time: now,
            last_update: now,
        }
    }

    fn tick(&mut self, window: &WinitWindow) {
        if !self.enabled {
            return;
        }

        let now = Instant::now();
        let frame_time = now.duration_since(self.last_frame_time).as_secs_f32();
        self.last_frame_time = now;
        self.frame_count += 1;

        // Update title every second
        let elapsed = now.duration_since(self.last_update).as_secs_f32();
        if elapsed >= 1.0 {
            let fps = self.frame_count as f32 / elapsed;
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms)",
                self.title,
                fps,
                frame_time * 1000.0
            ));
            self.frame_count = 0;
            self.last_update = now;
        }
    }
}
