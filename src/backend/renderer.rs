// Vulkan renderer - owns every GPU object and runs the per-frame commands
//
// Construction order: context -> surface -> device -> swapchain -> targets
// -> pipeline -> mesh -> frame slots. Teardown is the reverse, enforced by
// field order below plus the Arc parent links inside each wrapper.

use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::sync::Arc;

use super::buffer::MeshBuffers;
use super::context::{GraphicsContext, SurfaceHandle};
use super::pipeline::GraphicsPipeline;
use super::swapchain::{Acquired, Presented, SwapchainPreferences};
use super::sync::FrameSlots;
use super::targets::FrameTargets;
use super::{Swapchain, VulkanDevice};
use crate::assets::{MeshSource, ShaderSource};
use crate::config::Config;
use crate::error::{RenderError, Result, VkResultExt};
use crate::frame::{ChainSummary, FrameBackend};

pub struct VulkanRenderer {
    // Field order is drop order
    slots: FrameSlots,
    targets: Option<FrameTargets>,
    swapchain: Option<Swapchain>,
    pipeline: GraphicsPipeline,
    mesh: MeshBuffers,
    shaders: Box<dyn ShaderSource>,
    preferences: SwapchainPreferences,
    clear_color: [f32; 4],
    device: Arc<VulkanDevice>,
}

impl VulkanRenderer {
    /// Build every GPU object for `window`.
    ///
    /// The window must outlive the renderer.
    pub fn new(
        config: &Config,
        window: &(impl HasDisplayHandle + HasWindowHandle),
        drawable: vk::Extent2D,
        shaders: Box<dyn ShaderSource>,
        mesh: &dyn MeshSource,
    ) -> Result<Self> {
        // Configs built in code never went through the loader's validation
        let invalid = |e: anyhow::Error| RenderError::InvalidConfig(format!("{:#}", e));
        config.validate().map_err(invalid)?;
        let extensions = config.graphics.extension_names().map_err(invalid)?;

        let context = GraphicsContext::new(&config.window.title, &config.debug, window)?;
        let surface = SurfaceHandle::new(context, window)?;
        let device = VulkanDevice::new(surface, &extensions)?;

        let preferences = SwapchainPreferences::from_config(&config.graphics);
        let swapchain = Swapchain::new(device.clone(), drawable, preferences)?;
        let targets = FrameTargets::new(device.clone(), &swapchain)?;
        let pipeline = GraphicsPipeline::new(
            device.clone(),
            targets.render_pass,
            targets.format,
            shaders.as_ref(),
        )?;
        let mesh = MeshBuffers::upload(device.clone(), mesh)?;
        let slots = FrameSlots::new(device.clone(), config.graphics.max_frames_in_flight)?;

        log::info!("Renderer initialized");

        Ok(Self {
            slots,
            targets: Some(targets),
            swapchain: Some(swapchain),
            pipeline,
            mesh,
            shaders,
            preferences,
            clear_color: config.graphics.clear_color,
            device,
        })
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    /// Summary of the live chain, `None` between destroy and rebuild
    pub fn chain_summary(&self) -> Option<ChainSummary> {
        let swapchain = self.swapchain.as_ref()?;
        Some(ChainSummary {
            extent: swapchain.extent,
            image_count: swapchain.image_count(),
            format: swapchain.format.format,
        })
    }

    fn live_chain(&self, op: &'static str) -> Result<(&Swapchain, &FrameTargets)> {
        live_chain(&self.swapchain, &self.targets, op)
    }
}

/// Only empty between `destroy_chain` and a `build_chain` that failed, which is fatal
fn live_chain<'a>(
    swapchain: &'a Option<Swapchain>,
    targets: &'a Option<FrameTargets>,
    op: &'static str,
) -> Result<(&'a Swapchain, &'a FrameTargets)> {
    match (swapchain, targets) {
        (Some(swapchain), Some(targets)) => Ok((swapchain, targets)),
        _ => Err(RenderError::NoSwapchain(op)),
    }
}

impl FrameBackend for VulkanRenderer {
    fn wait_for_slot(&mut self, slot: usize) -> Result<()> {
        let fences = [self.slots.get(slot).in_flight_fence];
        unsafe { self.device.device.wait_for_fences(&fences, true, u64::MAX) }
            .op("vkWaitForFences")
    }

    fn acquire_image(&mut self, slot: usize) -> Result<Acquired> {
        let Some(swapchain) = &self.swapchain else {
            return Ok(Acquired::OutOfDate);
        };
        swapchain.acquire_next_image(u64::MAX, self.slots.get(slot).image_available)
    }

    fn reset_slot(&mut self, slot: usize) -> Result<()> {
        let fences = [self.slots.get(slot).in_flight_fence];
        unsafe { self.device.device.reset_fences(&fences) }.op("vkResetFences")
    }

    fn record(&mut self, slot: usize, image_index: u32) -> Result<()> {
        let (swapchain, targets) = self.live_chain("record")?;
        let device = &self.device.device;
        let cmd = self.slots.get(slot).command_buffer;
        let extent = swapchain.extent;

        unsafe {
            device
                .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
                .op("vkResetCommandBuffer")?;

            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            device
                .begin_command_buffer(cmd, &begin_info)
                .op("vkBeginCommandBuffer")?;

            let clear_values = [vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            }];
            let render_area = vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            };
            let render_pass_info = vk::RenderPassBeginInfo::default()
                .render_pass(targets.render_pass)
                .framebuffer(targets.framebuffer(image_index))
                .render_area(render_area)
                .clear_values(&clear_values);

            device.cmd_begin_render_pass(cmd, &render_pass_info, vk::SubpassContents::INLINE);
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline.pipeline);

            let viewport = vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            };
            device.cmd_set_viewport(cmd, 0, &[viewport]);
            device.cmd_set_scissor(cmd, 0, &[render_area]);

            device.cmd_bind_vertex_buffers(cmd, 0, &[self.mesh.vertex.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.mesh.index.buffer, 0, vk::IndexType::UINT16);
            device.cmd_draw_indexed(cmd, self.mesh.index_count, 1, 0, 0, 0);

            device.cmd_end_render_pass(cmd);
            device.end_command_buffer(cmd).op("vkEndCommandBuffer")?;
        }

        log::trace!("Recorded slot {} for image {}", slot, image_index);
        Ok(())
    }

    fn submit(&mut self, slot: usize) -> Result<()> {
        let frame = self.slots.get(slot);
        let wait_semaphores = [frame.image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let command_buffers = [frame.command_buffer];
        let signal_semaphores = [frame.render_finished];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit_info],
                frame.in_flight_fence,
            )
        }
        .op("vkQueueSubmit")
    }

    fn present(&mut self, slot: usize, image_index: u32) -> Result<Presented> {
        let (swapchain, _) = self.live_chain("present")?;
        let wait = [self.slots.get(slot).render_finished];
        swapchain.present(self.device.present_queue, image_index, &wait)
    }

    fn wait_idle(&mut self) -> Result<()> {
        self.device.wait_idle()
    }

    fn destroy_chain(&mut self) {
        // Targets reference the views, so they go first
        self.targets = None;
        self.swapchain = None;
    }

    fn build_chain(&mut self, drawable: vk::Extent2D) -> Result<ChainSummary> {
        let swapchain = Swapchain::new(self.device.clone(), drawable, self.preferences)?;
        let targets = FrameTargets::new(self.device.clone(), &swapchain)?;

        if targets.format != self.pipeline.format {
            log::info!(
                "Surface format changed {:?} -> {:?}, rebuilding pipeline",
                self.pipeline.format,
                targets.format
            );
            self.pipeline = GraphicsPipeline::new(
                self.device.clone(),
                targets.render_pass,
                targets.format,
                self.shaders.as_ref(),
            )?;
        }

        let summary = ChainSummary {
            extent: swapchain.extent,
            image_count: swapchain.image_count(),
            format: swapchain.format.format,
        };
        log::debug!("Present mode after rebuild: {:?}", swapchain.present_mode);
        self.swapchain = Some(swapchain);
        self.targets = Some(targets);
        Ok(summary)
    }
}

impl Drop for VulkanRenderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer...");
        if let Err(e) = self.device.wait_idle() {
            log::error!("Failed to wait for device idle: {}", e);
        }
        // Fields drop next: slots, targets, swapchain, pipeline, mesh, device
    }
}
