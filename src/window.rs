// Windowing collaborator
//
// The render core only needs four things from the window: its drawable size,
// a non-blocking event pump, a blocking event wait (used while minimized) and
// a close query. `WinitWindow` provides them on top of winit's pump API so
// the frame loop, not the event loop, owns the control thread.

use anyhow::{Context, Result};
use ash::vk;
use std::time::Duration;
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    error::OsError,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    platform::pump_events::{EventLoopExtPumpEvents, PumpStatus},
    window::{Fullscreen, Window, WindowAttributes, WindowId},
};

use crate::config::WindowConfig;

pub trait WindowSystem {
    /// Current drawable size in pixels. Zero in either dimension while minimized.
    fn drawable_size(&self) -> vk::Extent2D;

    /// Process pending events without blocking.
    fn pump_events(&mut self);

    /// Block until at least one event arrives, then process it.
    fn wait_events(&mut self);

    fn should_close(&self) -> bool;

    /// Returns true once per resize notification.
    fn take_resized(&mut self) -> bool;

    /// Block until the drawable size is non-zero in both dimensions.
    ///
    /// Returns `None` if the window was closed while waiting.
    fn wait_for_drawable_size(&mut self) -> Option<vk::Extent2D> {
        loop {
            let size = self.drawable_size();
            if size.width > 0 && size.height > 0 {
                return Some(size);
            }
            if self.should_close() {
                return None;
            }
            log::debug!("Drawable size is {}x{}, waiting", size.width, size.height);
            self.wait_events();
        }
    }
}

/// winit-backed window driven through `pump_app_events`.
///
/// Field order matters for Drop: the window must go before its event loop.
pub struct WinitWindow {
    window: Window,
    handler: Handler,
    event_loop: EventLoop<()>,
}

#[derive(Default)]
struct Handler {
    attributes: Option<WindowAttributes>,
    created: Option<Window>,
    create_error: Option<OsError>,
    close_requested: bool,
    resized: bool,
    toggle_fullscreen: bool,
}

impl WinitWindow {
    pub fn new(config: &WindowConfig) -> Result<Self> {
        let mut event_loop = EventLoop::new().context("Failed to create event loop")?;

        let attributes = WindowAttributes::default()
            .with_title(&config.title)
            .with_resizable(config.resizable)
            .with_inner_size(PhysicalSize::new(config.width, config.height));

        let mut handler = Handler {
            attributes: Some(attributes),
            ..Default::default()
        };

        // The window can only be created from inside `resumed`.
        let window = loop {
            let status = event_loop.pump_app_events(Some(Duration::from_millis(16)), &mut handler);
            if let Some(err) = handler.create_error.take() {
                return Err(err).context("Failed to create window");
            }
            if let Some(window) = handler.created.take() {
                break window;
            }
            if let PumpStatus::Exit(code) = status {
                anyhow::bail!("Event loop exited with code {} before the window opened", code);
            }
        };

        log::info!("Window created: {}x{}", config.width, config.height);

        Ok(Self {
            window,
            handler,
            event_loop,
        })
    }

    /// The native window, used for surface creation.
    pub fn window(&self) -> &Window {
        &self.window
    }

    pub fn set_title(&self, title: &str) {
        self.window.set_title(title);
    }

    fn pump(&mut self, timeout: Option<Duration>) {
        let status = self.event_loop.pump_app_events(timeout, &mut self.handler);
        if let PumpStatus::Exit(code) = status {
            log::info!("Event loop exited with code {}", code);
            self.handler.close_requested = true;
        }

        if std::mem::take(&mut self.handler.toggle_fullscreen) {
            if self.window.fullscreen().is_some() {
                self.window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            } else {
                self.window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            }
        }
    }
}

impl WindowSystem for WinitWindow {
    fn drawable_size(&self) -> vk::Extent2D {
        let size = self.window.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }

    fn pump_events(&mut self) {
        self.pump(Some(Duration::ZERO));
    }

    fn wait_events(&mut self) {
        self.pump(None);
    }

    fn should_close(&self) -> bool {
        self.handler.close_requested
    }

    fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.handler.resized)
    }
}

impl ApplicationHandler for Handler {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let Some(attributes) = self.attributes.take() else {
            return;
        };
        match event_loop.create_window(attributes) {
            Ok(window) => self.created = Some(window),
            Err(err) => self.create_error = Some(err),
        }
    }

    fn window_event(&mut self, _event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.close_requested = true;
            }
            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);
                self.resized = true;
            }
            WindowEvent::KeyboardInput { event, .. } if event.state.is_pressed() => {
                match event.physical_key {
                    PhysicalKey::Code(KeyCode::Escape) => {
                        log::info!("ESC pressed, exiting...");
                        self.close_requested = true;
                    }
                    PhysicalKey::Code(KeyCode::F11) => self.toggle_fullscreen = true,
                    _ => {}
                }
            }
            _ => {}
        }
    }
}
