// Model viewer - textured, mipmapped OBJ model spinning around Z
//
// One uniform buffer and descriptor set per frame slot; vertex/index
// buffers and the texture are shared by all slots.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::time::Duration;

use super::Animated;
use crate::backend::descriptor::{
    layout_binding, write_buffer_bindings, write_combined_image_sampler, BufferBinding,
    DescriptorPool, DescriptorSetLayout,
};
use crate::backend::image::Texture;
use crate::backend::pipeline::{GraphicsPipelineDesc, Pipeline};
use crate::backend::shader::load_spirv;
use crate::backend::Buffer;
use crate::config::Config;
use crate::mesh::{Mesh, Vertex};
use crate::renderer::{Renderer, Scene};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ModelUniforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl ModelUniforms {
    /// Model turns 90 degrees per second around Z; camera sits at (2,2,2)
    pub fn at(elapsed_secs: f32, extent: vk::Extent2D) -> Self {
        let aspect = extent.width as f32 / extent.height.max(1) as f32;

        let model = Mat4::from_rotation_z(elapsed_secs * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);
        let mut proj = Mat4::perspective_rh(45f32.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

/// Slot `slot` sees only its own uniform buffer; the texture is shared
pub fn model_buffer_bindings(slot: usize) -> [BufferBinding; 1] {
    [BufferBinding::uniform(0, slot)]
}

pub struct ModelScene {
    pipeline: Pipeline,
    descriptor_sets: Vec<vk::DescriptorSet>,
    _descriptor_pool: DescriptorPool,
    _set_layout: DescriptorSetLayout,
    uniform_buffers: Vec<Buffer>,
    _texture: Texture,
    vertex_buffer: Buffer,
    index_buffer: Buffer,
    index_count: u32,
    elapsed: Duration,
}

impl ModelScene {
    pub fn new(renderer: &Renderer, config: &Config) -> Result<Self> {
        let device = renderer.device();
        let transfer = renderer.transfer();
        let frames = renderer.frames_in_flight();

        let mesh = Mesh::load_obj(&config.assets.model)?;
        let texture = Texture::load(transfer, &config.assets.texture)?;

        let vertex_buffer = Buffer::device_local_with_data(
            transfer,
            vk::BufferUsageFlags::VERTEX_BUFFER,
            &mesh.vertices,
        )?;
        let index_buffer = Buffer::device_local_with_data(
            transfer,
            vk::BufferUsageFlags::INDEX_BUFFER,
            &mesh.indices,
        )?;

        let uniform_size = std::mem::size_of::<ModelUniforms>() as vk::DeviceSize;
        let uniform_buffers = (0..frames)
            .map(|_| Buffer::mapped(device, uniform_size, vk::BufferUsageFlags::UNIFORM_BUFFER))
            .collect::<Result<Vec<_>>>()?;

        let set_layout = DescriptorSetLayout::new(
            device,
            &[
                layout_binding(
                    0,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    vk::ShaderStageFlags::VERTEX,
                ),
                layout_binding(
                    1,
                    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    vk::ShaderStageFlags::FRAGMENT,
                ),
            ],
        )?;

        let descriptor_pool = DescriptorPool::new(
            device,
            &[
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: frames as u32,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: frames as u32,
                },
            ],
            frames as u32,
        )?;

        let descriptor_sets = descriptor_pool.allocate(&set_layout, frames)?;
        for (slot, &set) in descriptor_sets.iter().enumerate() {
            write_buffer_bindings(
                &device.device,
                set,
                &model_buffer_bindings(slot),
                &uniform_buffers,
                &[],
            )?;
            write_combined_image_sampler(
                &device.device,
                set,
                1,
                texture.image.view,
                texture.sampler.sampler,
            );
        }

        let vertex_shader = load_spirv(&config.assets.shader("model.vert"))?;
        let fragment_shader = load_spirv(&config.assets.shader("model.frag"))?;
        let bindings = [Vertex::binding_description()];
        let attributes = Vertex::attribute_descriptions();
        let set_layouts = [set_layout.layout];

        let pipeline = Pipeline::graphics(
            device,
            renderer.render_pass(),
            &GraphicsPipelineDesc {
                vertex_shader: &vertex_shader,
                fragment_shader: &fragment_shader,
                vertex_bindings: &bindings,
                vertex_attributes: &attributes,
                topology: vk::PrimitiveTopology::TRIANGLE_LIST,
                cull_mode: vk::CullModeFlags::BACK,
                depth_test: true,
                set_layouts: &set_layouts,
            },
        )?;

        Ok(Self {
            pipeline,
            descriptor_sets,
            _descriptor_pool: descriptor_pool,
            _set_layout: set_layout,
            uniform_buffers,
            _texture: texture,
            vertex_buffer,
            index_buffer,
            index_count: mesh.indices.len() as u32,
            elapsed: Duration::ZERO,
        })
    }
}

impl Animated for ModelScene {
    fn advance(&mut self, delta: Duration) {
        self.elapsed += delta;
    }
}

impl Scene for ModelScene {
    fn graphics_pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    fn update_uniforms(&mut self, slot: usize, extent: vk::Extent2D) -> Result<()> {
        let uniforms = ModelUniforms::at(self.elapsed.as_secs_f32(), extent);
        self.uniform_buffers[slot].write(&[uniforms])
    }

    fn draw(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: usize) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.vertex_buffer.buffer], &[0]);
            device.cmd_bind_index_buffer(cmd, self.index_buffer.buffer, 0, vk::IndexType::UINT32);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                self.pipeline.layout,
                0,
                &[self.descriptor_sets[slot]],
                &[],
            );
            device.cmd_draw_indexed(cmd, self.index_count, 1, 0, 0, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::descriptor::BufferSource;
    use glam::Vec4;
    use rstest::rstest;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 1600,
        height: 900,
    };

    fn approx(a: Vec4, b: Vec4) -> bool {
        (a - b).abs().max_element() < 1e-5
    }

    #[test]
    fn model_starts_unrotated() {
        let uniforms = ModelUniforms::at(0.0, EXTENT);
        assert!(uniforms.model.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn model_turns_a_quarter_per_second() {
        let uniforms = ModelUniforms::at(1.0, EXTENT);
        let rotated = uniforms.model * Vec4::new(1.0, 0.0, 0.0, 1.0);

        assert!(approx(rotated, Vec4::new(0.0, 1.0, 0.0, 1.0)));
    }

    #[test]
    fn camera_looks_at_origin() {
        let uniforms = ModelUniforms::at(0.0, EXTENT);
        let eye = uniforms.view * Vec4::new(2.0, 2.0, 2.0, 1.0);
        let origin = uniforms.view * Vec4::new(0.0, 0.0, 0.0, 1.0);

        assert!(approx(eye, Vec4::new(0.0, 0.0, 0.0, 1.0)));
        // Right-handed view space looks down -Z
        assert!(origin.x.abs() < 1e-5 && origin.y.abs() < 1e-5 && origin.z < 0.0);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let uniforms = ModelUniforms::at(0.0, EXTENT);
        assert!(uniforms.proj.y_axis.y < 0.0);
        assert!(uniforms.proj.x_axis.x > 0.0);
    }

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(std::mem::size_of::<ModelUniforms>(), 3 * 64);
    }

    #[rstest]
    #[case(0)]
    #[case(1)]
    #[case(2)]
    fn each_set_binds_its_own_uniform_buffer(#[case] slot: usize) {
        let [uniform] = model_buffer_bindings(slot);

        assert_eq!(uniform.binding, 0);
        assert_eq!(uniform.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(uniform.source, BufferSource::Uniform(slot));
    }
}
