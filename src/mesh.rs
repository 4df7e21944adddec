// Mesh data - vertex layout, deduplication and OBJ loading

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::mem::{offset_of, size_of};
use std::path::Path;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub uv: [f32; 2],
}

impl Vertex {
    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, position) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 1,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: offset_of!(Vertex, color) as u32,
            },
            vk::VertexInputAttributeDescription {
                binding: 0,
                location: 2,
                format: vk::Format::R32G32_SFLOAT,
                offset: offset_of!(Vertex, uv) as u32,
            },
        ]
    }

    fn bits(&self) -> [u32; 8] {
        [
            self.position[0].to_bits(),
            self.position[1].to_bits(),
            self.position[2].to_bits(),
            self.color[0].to_bits(),
            self.color[1].to_bits(),
            self.color[2].to_bits(),
            self.uv[0].to_bits(),
            self.uv[1].to_bits(),
        ]
    }
}

// Exact bitwise equality, so vertices can key a HashMap
impl PartialEq for Vertex {
    fn eq(&self, other: &Self) -> bool {
        self.bits() == other.bits()
    }
}

impl Eq for Vertex {}

impl Hash for Vertex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits().hash(state);
    }
}

/// Collapse identical vertices, keeping first-seen order
pub fn dedup_vertices(vertices: impl IntoIterator<Item = Vertex>) -> (Vec<Vertex>, Vec<u32>) {
    let mut unique = Vec::new();
    let mut indices = Vec::new();
    let mut seen: HashMap<Vertex, u32> = HashMap::new();

    for vertex in vertices {
        let index = *seen.entry(vertex).or_insert_with(|| {
            unique.push(vertex);
            (unique.len() - 1) as u32
        });
        indices.push(index);
    }

    (unique, indices)
}

pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    /// Load every model in an OBJ file as one indexed, white mesh.
    /// Texture V is flipped for Vulkan's top-left origin.
    pub fn load_obj(path: &Path) -> Result<Self> {
        let (models, _materials) = tobj::load_obj(
            path,
            &tobj::LoadOptions {
                single_index: true,
                triangulate: true,
                ..Default::default()
            },
        )
        .with_context(|| format!("Failed to load model {}", path.display()))?;

        let mut expanded = Vec::new();
        for model in &models {
            let mesh = &model.mesh;
            for &index in &mesh.indices {
                let i = index as usize;
                let uv = if mesh.texcoords.len() >= 2 * i + 2 {
                    [mesh.texcoords[2 * i], 1.0 - mesh.texcoords[2 * i + 1]]
                } else {
                    [0.0, 0.0]
                };

                expanded.push(Vertex {
                    position: [
                        mesh.positions[3 * i],
                        mesh.positions[3 * i + 1],
                        mesh.positions[3 * i + 2],
                    ],
                    color: [1.0, 1.0, 1.0],
                    uv,
                });
            }
        }

        let (vertices, indices) = dedup_vertices(expanded);

        log::info!(
            "Loaded model {}: {} vertices, {} indices",
            path.display(),
            vertices.len(),
            indices.len()
        );

        Ok(Self { vertices, indices })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vertex(x: f32, u: f32) -> Vertex {
        Vertex {
            position: [x, 0.0, 0.0],
            color: [1.0, 1.0, 1.0],
            uv: [u, 0.0],
        }
    }

    #[test]
    fn identical_vertices_share_an_index() {
        let quad = [
            vertex(0.0, 0.0),
            vertex(1.0, 1.0),
            vertex(2.0, 0.5),
            vertex(2.0, 0.5),
            vertex(3.0, 0.0),
            vertex(0.0, 0.0),
        ];

        let (vertices, indices) = dedup_vertices(quad);

        assert_eq!(vertices.len(), 4);
        assert_eq!(indices, vec![0, 1, 2, 2, 3, 0]);
    }

    #[test]
    fn differing_uv_keeps_vertices_apart() {
        let (vertices, indices) = dedup_vertices([vertex(0.0, 0.0), vertex(0.0, 1.0)]);

        assert_eq!(vertices.len(), 2);
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn vertex_layout_matches_attributes() {
        let attributes = Vertex::attribute_descriptions();

        assert_eq!(Vertex::binding_description().stride, 32);
        assert_eq!(attributes[1].offset, 12);
        assert_eq!(attributes[2].offset, 24);
    }

    #[test]
    fn loads_and_indexes_obj_quad() {
        let dir = std::env::temp_dir().join(format!("vk-frames-mesh-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("quad.obj");
        std::fs::write(
            &path,
            "v 0 0 0\nv 1 0 0\nv 1 1 0\nv 0 1 0\n\
             vt 0 0\nvt 1 0\nvt 1 1\nvt 0 1\n\
             f 1/1 2/2 3/3 4/4\n",
        )
        .unwrap();

        let mesh = Mesh::load_obj(&path).unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        assert_eq!(mesh.vertices.len(), 4);
        assert_eq!(mesh.indices.len(), 6);
        // v flipped: vt 0 0 -> uv (0, 1)
        assert!(mesh
            .vertices
            .iter()
            .any(|v| v.position == [0.0, 0.0, 0.0] && v.uv == [0.0, 1.0]));
    }
}
