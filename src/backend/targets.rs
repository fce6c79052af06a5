// Render targets - render pass + one framebuffer per swapchain view
//
// Built and destroyed together with every swapchain generation.

use ash::vk;
use std::sync::Arc;

use super::{Swapchain, VulkanDevice};
use crate::error::{RenderError, Result, VkResultExt};

pub struct FrameTargets {
    pub render_pass: vk::RenderPass,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    device: Arc<VulkanDevice>,
}

impl FrameTargets {
    pub fn new(device: Arc<VulkanDevice>, swapchain: &Swapchain) -> Result<Self> {
        let format = swapchain.format.format;
        let render_pass = create_render_pass(&device.device, format)?;
        let render_pass = scopeguard::guard(render_pass, |pass| unsafe {
            device.device.destroy_render_pass(pass, None);
        });

        let mut framebuffers = scopeguard::guard(
            Vec::with_capacity(swapchain.image_views.len()),
            |framebuffers| {
                for framebuffer in framebuffers {
                    unsafe { device.device.destroy_framebuffer(framebuffer, None) };
                }
            },
        );
        for &view in &swapchain.image_views {
            let attachments = [view];
            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(*render_pass)
                .attachments(&attachments)
                .width(swapchain.extent.width)
                .height(swapchain.extent.height)
                .layers(1);

            let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }
                .map_err(RenderError::SwapchainCreation)?;
            framebuffers.push(framebuffer);
        }

        let framebuffers = scopeguard::ScopeGuard::into_inner(framebuffers);
        let render_pass = scopeguard::ScopeGuard::into_inner(render_pass);
        log::debug!("Created {} framebuffers", framebuffers.len());

        Ok(Self {
            render_pass,
            framebuffers,
            format,
            device,
        })
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }
}

impl Drop for FrameTargets {
    fn drop(&mut self) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                self.device.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.device.destroy_render_pass(self.render_pass, None);
        }
    }
}

/// Single color attachment, cleared on load and handed to the presentation engine
fn create_render_pass(device: &ash::Device, format: vk::Format) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::default()
        .format(format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);

    let color_attachment_ref = vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);

    let color_attachments = [color_attachment_ref];
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments);

    // Wait for the acquire semaphore before writing the attachment
    let dependency = vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .src_access_mask(vk::AccessFlags::empty())
        .dst_stage_mask(vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)
        .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE);

    let attachments = [color_attachment];
    let subpasses = [subpass];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }.op("vkCreateRenderPass")
}
