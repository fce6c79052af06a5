// Shader and mesh collaborators
//
// The renderer does not care where SPIR-V or geometry come from; it only asks
// these traits for bytes. The default implementations read compiled shaders
// from disk and hand out a fixed two-quad mesh.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use std::fs::File;
use std::path::PathBuf;

use crate::config::ShaderConfig;
use crate::error::{RenderError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex,
    Fragment,
}

impl ShaderStage {
    pub fn name(self) -> &'static str {
        match self {
            ShaderStage::Vertex => "vertex",
            ShaderStage::Fragment => "fragment",
        }
    }

    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }
}

/// Provides compiled SPIR-V for the two pipeline stages.
pub trait ShaderSource {
    fn spirv(&self, stage: ShaderStage) -> Result<Vec<u32>>;
}

/// Reads `.spv` files from the paths in `[shaders]`.
#[derive(Debug, Clone)]
pub struct SpirvFiles {
    vertex: PathBuf,
    fragment: PathBuf,
}

impl SpirvFiles {
    pub fn new(config: &ShaderConfig) -> Self {
        Self {
            vertex: config.vertex.clone(),
            fragment: config.fragment.clone(),
        }
    }
}

impl ShaderSource for SpirvFiles {
    fn spirv(&self, stage: ShaderStage) -> Result<Vec<u32>> {
        let path = match stage {
            ShaderStage::Vertex => &self.vertex,
            ShaderStage::Fragment => &self.fragment,
        };
        let load_error = |source| RenderError::ShaderLoad {
            stage: stage.name(),
            path: path.clone(),
            source,
        };

        // read_spv checks the magic number and handles unaligned input.
        let mut file = File::open(path).map_err(load_error)?;
        let words = ash::util::read_spv(&mut file).map_err(load_error)?;
        log::debug!("Loaded {} shader {:?} ({} words)", stage.name(), path, words.len());
        Ok(words)
    }
}

/// Interleaved vertex: 2D position + RGB color.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(pos: [f32; 2], color: [f32; 3]) -> Self {
        Self {
            pos: Vec2::from_array(pos),
            color: Vec3::from_array(color),
        }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: std::mem::size_of::<Vertex>() as u32,
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, pos) as u32,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: std::mem::offset_of!(Vertex, color) as u32,
            },
        ]
    }
}

/// Provides the single vertex/index buffer pair drawn every frame.
pub trait MeshSource {
    fn vertices(&self) -> &[Vertex];
    fn indices(&self) -> &[u16];
}

/// Two stacked quads: a grey one on top of a white one.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuadMesh;

const QUAD_VERTICES: [Vertex; 8] = [
    Vertex::new([-0.5, -0.5], [0.5, 0.5, 0.5]),
    Vertex::new([0.5, -0.5], [0.5, 0.5, 0.5]),
    Vertex::new([0.5, 0.0], [0.5, 0.5, 0.5]),
    Vertex::new([-0.5, 0.0], [0.5, 0.5, 0.5]),
    Vertex::new([-0.5, 0.0], [1.0, 1.0, 1.0]),
    Vertex::new([0.5, 0.0], [1.0, 1.0, 1.0]),
    Vertex::new([0.5, 0.5], [1.0, 1.0, 1.0]),
    Vertex::new([-0.5, 0.5], [1.0, 1.0, 1.0]),
];

const QUAD_INDICES: [u16; 12] = [0, 1, 2, 2, 3, 0, 4, 5, 6, 6, 7, 4];

impl MeshSource for QuadMesh {
    fn vertices(&self) -> &[Vertex] {
        &QUAD_VERTICES
    }

    fn indices(&self) -> &[u16] {
        &QUAD_INDICES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
        let binding = Vertex::binding_description();
        let [pos, color] = Vertex::attribute_descriptions();
        assert_eq!(binding.stride, 20);
        assert_eq!(pos.offset, 0);
        assert_eq!(color.offset, 8);
    }

    #[test]
    fn quad_indices_stay_in_range() {
        let mesh = QuadMesh;
        assert_eq!(mesh.indices().len() % 3, 0);
        assert!(mesh
            .indices()
            .iter()
            .all(|&i| (i as usize) < mesh.vertices().len()));
    }

    #[test]
    fn missing_shader_file_reports_stage_and_path() {
        let shaders = SpirvFiles::new(&ShaderConfig {
            vertex: PathBuf::from("no/such/vert.spv"),
            fragment: PathBuf::from("no/such/frag.spv"),
        });
        let err = shaders.spirv(ShaderStage::Fragment).unwrap_err();
        match err {
            RenderError::ShaderLoad { stage, path, .. } => {
                assert_eq!(stage, "fragment");
                assert_eq!(path, PathBuf::from("no/such/frag.spv"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
