// Particle simulation - compute-driven point cloud
//
// Each frame slot owns a storage buffer. The compute pass of slot i reads
// the particles written by slot i-1 and writes slot i's buffer, which the
// graphics pass then draws as a point list.

use anyhow::Result;
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f32::consts::TAU;
use std::mem::{offset_of, size_of};
use std::time::Duration;

use super::Animated;
use crate::backend::command::workgroup_count;
use crate::backend::descriptor::{
    layout_binding, write_buffer_bindings, BufferBinding, DescriptorPool, DescriptorSetLayout,
    ParticleBindings,
};
use crate::backend::pipeline::{GraphicsPipelineDesc, Pipeline};
use crate::backend::shader::load_spirv;
use crate::backend::Buffer;
use crate::config::Config;
use crate::renderer::{Renderer, Scene};

/// Must match `local_size_x` in particles.comp
pub const LOCAL_SIZE: u32 = 256;

const SPAWN_RADIUS: f32 = 0.25;
const SPEED: f32 = 0.00025;

/// std430 layout: vec2 position, vec2 velocity, vec4 color
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Particle {
    pub position: [f32; 2],
    pub velocity: [f32; 2],
    pub color: [f32; 4],
}

impl Particle {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Particle>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Particle, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32A32_SFLOAT,
                offset: offset_of!(Particle, color) as u32,
            },
        ]
    }
}

/// Uniform block read by the compute shader
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ParticleUniforms {
    /// Milliseconds since the previous frame
    pub delta_time: f32,
    pub particle_count: u32,
}

/// Particles on a disc around the origin, drifting outwards.
///
/// `aspect` is height / width so the disc stays round on screen.
pub fn seed_particles(count: u32, aspect: f32, rng: &mut impl Rng) -> Vec<Particle> {
    (0..count)
        .map(|_| {
            let r = SPAWN_RADIUS * rng.gen::<f32>().sqrt();
            let theta = rng.gen::<f32>() * TAU;
            let position = Vec2::new(r * theta.cos() * aspect, r * theta.sin());
            let velocity = position.normalize_or_zero() * SPEED;

            Particle {
                position: position.to_array(),
                velocity: velocity.to_array(),
                color: [rng.gen(), rng.gen(), rng.gen(), 1.0],
            }
        })
        .collect()
}

/// Slot `slot` reads last frame's particles and writes its own copy
pub fn particle_buffer_bindings(slot: usize, frames_in_flight: usize) -> [BufferBinding; 3] {
    let ring = ParticleBindings::for_slot(slot, frames_in_flight);
    [
        BufferBinding::uniform(0, slot),
        BufferBinding::storage(1, ring.previous),
        BufferBinding::storage(2, ring.current),
    ]
}

pub struct ParticleScene {
    graphics_pipeline: Pipeline,
    compute_pipeline: Pipeline,
    descriptor_sets: Vec<vk::DescriptorSet>,
    _descriptor_pool: DescriptorPool,
    _set_layout: DescriptorSetLayout,
    uniform_buffers: Vec<Buffer>,
    storage_buffers: Vec<Buffer>,
    particle_count: u32,
    last_frame: Duration,
}

impl ParticleScene {
    pub fn new(renderer: &Renderer, config: &Config) -> Result<Self> {
        let device = renderer.device();
        let transfer = renderer.transfer();
        let frames = renderer.frames_in_flight();
        let particle_count = config.particles.count;

        let extent = renderer.extent();
        let aspect = extent.height as f32 / extent.width.max(1) as f32;
        let particles = seed_particles(particle_count, aspect, &mut StdRng::from_entropy());

        log::info!("Seeded {} particles", particles.len());

        // Every slot starts from the same initial state
        let storage_buffers = (0..frames)
            .map(|_| {
                Buffer::device_local_with_data(
                    transfer,
                    vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::VERTEX_BUFFER,
                    &particles,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let uniform_size = size_of::<ParticleUniforms>() as vk::DeviceSize;
        let uniform_buffers = (0..frames)
            .map(|_| Buffer::mapped(device, uniform_size, vk::BufferUsageFlags::UNIFORM_BUFFER))
            .collect::<Result<Vec<_>>>()?;

        let set_layout = DescriptorSetLayout::new(
            device,
            &[
                layout_binding(
                    0,
                    vk::DescriptorType::UNIFORM_BUFFER,
                    vk::ShaderStageFlags::COMPUTE,
                ),
                layout_binding(
                    1,
                    vk::DescriptorType::STORAGE_BUFFER,
                    vk::ShaderStageFlags::COMPUTE,
                ),
                layout_binding(
                    2,
                    vk::DescriptorType::STORAGE_BUFFER,
                    vk::ShaderStageFlags::COMPUTE,
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
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    descriptor_count: 2 * frames as u32,
                },
            ],
            frames as u32,
        )?;

        let descriptor_sets = descriptor_pool.allocate(&set_layout, frames)?;
        for (slot, &set) in descriptor_sets.iter().enumerate() {
            write_buffer_bindings(
                &device.device,
                set,
                &particle_buffer_bindings(slot, frames),
                &uniform_buffers,
                &storage_buffers,
            )?;
        }

        let compute_shader = load_spirv(&config.assets.shader("particles.comp"))?;
        let set_layouts = [set_layout.layout];
        let compute_pipeline = Pipeline::compute(device, &compute_shader, &set_layouts)?;

        let vertex_shader = load_spirv(&config.assets.shader("particles.vert"))?;
        let fragment_shader = load_spirv(&config.assets.shader("particles.frag"))?;
        let vertex_bindings = [Particle::binding_description()];
        let vertex_attributes = Particle::attribute_descriptions();

        let graphics_pipeline = Pipeline::graphics(
            device,
            renderer.render_pass(),
            &GraphicsPipelineDesc {
                vertex_shader: &vertex_shader,
                fragment_shader: &fragment_shader,
                vertex_bindings: &vertex_bindings,
                vertex_attributes: &vertex_attributes,
                topology: vk::PrimitiveTopology::POINT_LIST,
                cull_mode: vk::CullModeFlags::NONE,
                depth_test: false,
                set_layouts: &[],
            },
        )?;

        Ok(Self {
            graphics_pipeline,
            compute_pipeline,
            descriptor_sets,
            _descriptor_pool: descriptor_pool,
            _set_layout: set_layout,
            uniform_buffers,
            storage_buffers,
            particle_count,
            last_frame: Duration::ZERO,
        })
    }
}

impl Animated for ParticleScene {
    fn advance(&mut self, delta: Duration) {
        self.last_frame = delta;
    }
}

impl Scene for ParticleScene {
    fn graphics_pipeline(&self) -> &Pipeline {
        &self.graphics_pipeline
    }

    fn update_uniforms(&mut self, slot: usize, _extent: vk::Extent2D) -> Result<()> {
        let uniforms = ParticleUniforms {
            delta_time: self.last_frame.as_secs_f32() * 1000.0,
            particle_count: self.particle_count,
        };
        self.uniform_buffers[slot].write(&[uniforms])
    }

    fn draw(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: usize) {
        unsafe {
            device.cmd_bind_vertex_buffers(cmd, 0, &[self.storage_buffers[slot].buffer], &[0]);
            device.cmd_draw(cmd, self.particle_count, 1, 0, 0);
        }
    }

    fn uses_compute(&self) -> bool {
        true
    }

    fn record_compute(&self, device: &ash::Device, cmd: vk::CommandBuffer, slot: usize) {
        unsafe {
            device.cmd_bind_pipeline(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.compute_pipeline.pipeline,
            );
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.compute_pipeline.layout,
                0,
                &[self.descriptor_sets[slot]],
                &[],
            );
            device.cmd_dispatch(cmd, workgroup_count(self.particle_count, LOCAL_SIZE), 1, 1);
        }
    }
}
