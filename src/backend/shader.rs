// Shader module loading
//
// Vulkan consumes SPIR-V words. Modules only need to live until the pipeline
// that uses them is created, so the wrapper destroys them on drop.

use ash::vk;

use crate::assets::{ShaderSource, ShaderStage};
use crate::error::{RenderError, Result};

pub struct ShaderModule<'a> {
    pub module: vk::ShaderModule,
    pub stage: ShaderStage,
    device: &'a ash::Device,
}

impl<'a> ShaderModule<'a> {
    pub fn load(
        device: &'a ash::Device,
        source: &dyn ShaderSource,
        stage: ShaderStage,
    ) -> Result<Self> {
        let code = source.spirv(stage)?;
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        let module = unsafe { device.create_shader_module(&create_info, None) }
            .map_err(RenderError::PipelineCreation)?;

        Ok(Self {
            module,
            stage,
            device,
        })
    }

    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo<'static> {
        vk::PipelineShaderStageCreateInfo::default()
            .stage(self.stage.flags())
            .module(self.module)
            .name(c"main")
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}
