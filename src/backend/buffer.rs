// Buffer utilities for vertex and index data
//
// Memory comes from gpu-allocator. Mesh data is written once into a
// host-visible staging buffer and copied into device-local memory, which is
// what the draw call reads from.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::VulkanDevice;
use crate::assets::MeshSource;
use crate::error::{RenderError, Result, VkResultExt};

/// Usage + memory location of one buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    pub usage: vk::BufferUsageFlags,
    pub location: MemoryLocation,
}

/// Staging source and device-local destination for data with `usage`
pub fn upload_plan(usage: vk::BufferUsageFlags) -> [BufferDesc; 2] {
    [
        BufferDesc {
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
        },
        BufferDesc {
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
        },
    ]
}

/// A buffer plus the allocation backing it
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub size: vk::DeviceSize,
    name: &'static str,
    allocation: Option<Allocation>,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Create a buffer and bind fresh memory to it
    ///
    /// # Arguments
    /// * `name` - Debug name, also used in error messages
    /// * `size` - Size in bytes
    /// * `desc` - Vulkan usage flags and where the memory lives
    pub fn new(
        device: Arc<VulkanDevice>,
        name: &'static str,
        size: vk::DeviceSize,
        desc: BufferDesc,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(|e| RenderError::BufferCreation(name, e))?;
        let buffer = scopeguard::guard(buffer, |buffer| unsafe {
            device.device.destroy_buffer(buffer, None);
        });

        let requirements = unsafe { device.device.get_buffer_memory_requirements(*buffer) };

        let allocation = device.allocator().lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: desc.location,
            linear: true,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        let bound = unsafe {
            device
                .device
                .bind_buffer_memory(*buffer, allocation.memory(), allocation.offset())
        };
        if let Err(e) = bound {
            if let Err(free_err) = device.allocator().lock().free(allocation) {
                log::warn!("Failed to free {} allocation: {}", name, free_err);
            }
            return Err(RenderError::BufferCreation(name, e));
        }

        let buffer = scopeguard::ScopeGuard::into_inner(buffer);
        log::debug!("Created {} buffer ({} bytes, {:?})", name, size, desc.location);

        Ok(Self {
            buffer,
            size,
            name,
            allocation: Some(allocation),
            device,
        })
    }

    /// Copy `data` into a host-visible buffer
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let name = self.name;
        let mapped = self
            .allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut())
            .ok_or(RenderError::BufferCreation(
                name,
                vk::Result::ERROR_MEMORY_MAP_FAILED,
            ))?;
        let dst = mapped
            .get_mut(..data.len())
            .ok_or(RenderError::BufferCreation(
                name,
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
            ))?;
        dst.copy_from_slice(data);
        Ok(())
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_buffer(self.buffer, None) };
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = self.device.allocator().lock().free(allocation) {
                log::warn!("Failed to free {} allocation: {}", self.name, e);
            }
        }
    }
}

/// Stage `data` and copy it into a new device-local buffer
fn upload_device_local(
    device: &Arc<VulkanDevice>,
    name: &'static str,
    usage: vk::BufferUsageFlags,
    data: &[u8],
) -> Result<GpuBuffer> {
    let [staging_desc, target_desc] = upload_plan(usage);
    let size = data.len() as vk::DeviceSize;

    let mut staging = GpuBuffer::new(device.clone(), name, size, staging_desc)?;
    staging.write(data)?;
    let target = GpuBuffer::new(device.clone(), name, size, target_desc)?;

    one_time_submit(device, |cmd| unsafe {
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: staging.size,
        };
        device
            .device
            .cmd_copy_buffer(cmd, staging.buffer, target.buffer, &[region]);
    })?;

    // Staging buffer is released here, after the copy has completed
    Ok(target)
}

/// Record and submit a throwaway command buffer, then wait for it
fn one_time_submit(device: &VulkanDevice, record: impl FnOnce(vk::CommandBuffer)) -> Result<()> {
    let pool_info = vk::CommandPoolCreateInfo::default()
        .flags(vk::CommandPoolCreateFlags::TRANSIENT)
        .queue_family_index(device.queue_families.graphics);
    let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
        .op("vkCreateCommandPool")?;
    // Destroying the pool frees the command buffer as well
    let pool = scopeguard::guard(pool, |pool| unsafe {
        device.device.destroy_command_pool(pool, None);
    });

    let alloc_info = vk::CommandBufferAllocateInfo::default()
        .command_pool(*pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let command_buffers = unsafe { device.device.allocate_command_buffers(&alloc_info) }
        .op("vkAllocateCommandBuffers")?;
    let cmd = command_buffers[0];

    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
    unsafe { device.device.begin_command_buffer(cmd, &begin_info) }
        .op("vkBeginCommandBuffer")?;
    record(cmd);
    unsafe { device.device.end_command_buffer(cmd) }.op("vkEndCommandBuffer")?;

    let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
    unsafe {
        device
            .device
            .queue_submit(device.graphics_queue, &[submit_info], vk::Fence::null())
            .op("vkQueueSubmit")?;
        device
            .device
            .queue_wait_idle(device.graphics_queue)
            .op("vkQueueWaitIdle")
    }
}

/// Vertex + u16 index buffer for one mesh
pub struct MeshBuffers {
    pub vertex: GpuBuffer,
    pub index: GpuBuffer,
    pub index_count: u32,
}

impl MeshBuffers {
    pub fn upload(device: Arc<VulkanDevice>, mesh: &dyn MeshSource) -> Result<Self> {
        let vertex = upload_device_local(
            &device,
            "vertex",
            vk::BufferUsageFlags::VERTEX_BUFFER,
            bytemuck::cast_slice(mesh.vertices()),
        )?;
        let index = upload_device_local(
            &device,
            "index",
            vk::BufferUsageFlags::INDEX_BUFFER,
            bytemuck::cast_slice(mesh.indices()),
        )?;

        Ok(Self {
            vertex,
            index,
            index_count: mesh.indices().len() as u32,
        })
    }
}
