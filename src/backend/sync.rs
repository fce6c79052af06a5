// Synchronization primitives
//
// Fences, semaphores and command buffers for frames in flight.
// Slots are allocated once for the renderer's lifetime and never recreated.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::{Result, VkResultExt};

/// Everything one frame in flight needs - one per slot
#[derive(Debug, Clone, Copy)]
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

pub struct FrameSlots {
    pub command_pool: vk::CommandPool,
    slots: Vec<FrameSlot>,
    device: Arc<VulkanDevice>,
}

impl FrameSlots {
    pub fn new(device: Arc<VulkanDevice>, count: usize) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(device.queue_families.graphics);
        let command_pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .op("vkCreateCommandPool")?;

        // Destroying the pool frees its command buffers too
        let mut this = Self {
            command_pool,
            slots: Vec::with_capacity(count),
            device,
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);
        let command_buffers = unsafe { this.device.device.allocate_command_buffers(&alloc_info) }
            .op("vkAllocateCommandBuffers")?;

        let semaphore_info = vk::SemaphoreCreateInfo::default();
        // Start signaled so the first wait on each slot returns immediately
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);

        for command_buffer in command_buffers {
            let device = &this.device.device;
            // Partially built slots are cleaned up by Drop on early return
            let image_available = unsafe { device.create_semaphore(&semaphore_info, None) }
                .op("vkCreateSemaphore")?;
            let render_finished = unsafe { device.create_semaphore(&semaphore_info, None) }
                .op("vkCreateSemaphore")
                .inspect_err(|_| unsafe { device.destroy_semaphore(image_available, None) })?;
            let in_flight_fence = unsafe { device.create_fence(&fence_info, None) }
                .op("vkCreateFence")
                .inspect_err(|_| unsafe {
                    device.destroy_semaphore(image_available, None);
                    device.destroy_semaphore(render_finished, None);
                })?;

            this.slots.push(FrameSlot {
                command_buffer,
                image_available,
                render_finished,
                in_flight_fence,
            });
        }

        log::info!("Created {} frame slots", this.slots.len());
        Ok(this)
    }

    pub fn get(&self, slot: usize) -> &FrameSlot {
        &self.slots[slot]
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl Drop for FrameSlots {
    fn drop(&mut self) {
        unsafe {
            for slot in &self.slots {
                self.device.device.destroy_semaphore(slot.image_available, None);
                self.device.device.destroy_semaphore(slot.render_finished, None);
                self.device.device.destroy_fence(slot.in_flight_fence, None);
            }
            self.device.device.destroy_command_pool(self.command_pool, None);
        }
    }
}

/// Monotonic frame number; the active slot is `frame mod frames_in_flight`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCounter {
    frame: u64,
    frames_in_flight: usize,
}

impl FrameCounter {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            frame: 0,
            frames_in_flight: frames_in_flight.max(1),
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn slot(&self) -> usize {
        (self.frame % self.frames_in_flight as u64) as usize
    }

    pub fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    pub fn advance(&mut self) {
        self.frame += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_cycles_with_period_n() {
        for n in 1..=8 {
            let mut counter = FrameCounter::new(n);
            let slots: Vec<_> = (0..3 * n)
                .map(|_| {
                    let slot = counter.slot();
                    counter.advance();
                    slot
                })
                .collect();

            for (frame, &slot) in slots.iter().enumerate() {
                assert_eq!(slot, frame % n);
                assert!(slot < n);
            }
            // Slot k comes back exactly n frames later, not before
            for k in 0..n {
                let next = slots[k + 1..].iter().position(|&s| s == slots[k]).map(|p| p + 1);
                assert_eq!(next, Some(n));
            }
            assert_eq!(counter.frame(), 3 * n as u64);
        }
    }

    #[test]
    fn zero_frames_in_flight_is_clamped_to_one() {
        let mut counter = FrameCounter::new(0);
        assert_eq!(counter.frames_in_flight(), 1);
        counter.advance();
        assert_eq!(counter.slot(), 0);
    }
}
