//! Triangle mesh data shared by the rasterizer and the ray tracer.
//!
//! Meshes are flat vertex/index arrays uploaded once at startup. A mesh is
//! split into named subsets (contiguous triangle ranges) that the ray tracer
//! can sample one at a time.

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

/// Size in bytes of one [`Vertex`].
pub const VERTEX_STRIDE: usize = std::mem::size_of::<Vertex>();

/// Byte offset of the color attribute inside a [`Vertex`].
pub const COLOR_OFFSET: usize = 16;

/// Vertex layout: position and color, both four floats.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 4],
    pub color: [f32; 4],
}

impl Vertex {
    pub const fn new(position: [f32; 3], color: [f32; 3]) -> Self {
        Self {
            position: [position[0], position[1], position[2], 1.0],
            color: [color[0], color[1], color[2], 1.0],
        }
    }
}

/// Contiguous range of triangles belonging to one logical part of a mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshSubset {
    pub name: String,
    pub first_triangle: u32,
    pub triangle_count: u32,
}

impl MeshSubset {
    /// Encode the subset for the shaders: first triangle in the low 32 bits,
    /// triangle count in the high 32 bits.
    pub fn selector(&self) -> u64 {
        (u64::from(self.triangle_count) << 32) | u64::from(self.first_triangle)
    }

    /// Triangle range covered by this subset.
    pub fn triangles(&self) -> std::ops::Range<u32> {
        self.first_triangle..self.first_triangle + self.triangle_count
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("index count {0} is not a multiple of 3")]
    RaggedIndices(usize),

    #[error("index {index} at position {position} is out of range for {vertex_count} vertices")]
    IndexOutOfRange { position: usize, index: u32, vertex_count: usize },

    #[error("subset '{name}' covers triangles {first}..{end} but the mesh has {triangle_count}")]
    SubsetOutOfRange { name: String, first: u32, end: u32, triangle_count: u32 },
}

/// Static triangle mesh.
#[derive(Debug, Clone)]
pub struct Mesh {
    vertices: Vec<Vertex>,
    indices: Vec<u32>,
    subsets: Vec<MeshSubset>,
}

impl Mesh {
    /// Build a mesh, validating indices and subset ranges.
    ///
    /// When `subsets` is empty the whole mesh becomes a single subset named
    /// `"mesh"`.
    pub fn new(
        vertices: Vec<Vertex>,
        indices: Vec<u32>,
        mut subsets: Vec<MeshSubset>,
    ) -> Result<Self, MeshError> {
        if indices.len() % 3 != 0 {
            return Err(MeshError::RaggedIndices(indices.len()));
        }

        if let Some((position, &index)) = indices
            .iter()
            .enumerate()
            .find(|(_, &i)| i as usize >= vertices.len())
        {
            return Err(MeshError::IndexOutOfRange {
                position,
                index,
                vertex_count: vertices.len(),
            });
        }

        let triangle_count = (indices.len() / 3) as u32;

        if subsets.is_empty() {
            subsets.push(MeshSubset {
                name: "mesh".to_string(),
                first_triangle: 0,
                triangle_count,
            });
        }

        for subset in &subsets {
            let end = subset.first_triangle.saturating_add(subset.triangle_count);
            if end > triangle_count {
                return Err(MeshError::SubsetOutOfRange {
                    name: subset.name.clone(),
                    first: subset.first_triangle,
                    end,
                    triangle_count,
                });
            }
        }

        Ok(Self { vertices, indices, subsets })
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn subsets(&self) -> &[MeshSubset] {
        &self.subsets
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertices.len() as u32
    }

    pub fn triangle_count(&self) -> u32 {
        (self.indices.len() / 3) as u32
    }

    /// Index of the subset containing `triangle`, if any.
    pub fn subset_of_triangle(&self, triangle: u32) -> Option<usize> {
        self.subsets.iter().position(|s| s.triangles().contains(&triangle))
    }

    /// Unit quad in the z = 0 plane, split into two triangles.
    pub fn unit_quad() -> Self {
        let vertices = vec![
            Vertex::new([-0.5, -0.5, 0.0], [1.0, 0.0, 0.0]),
            Vertex::new([0.5, -0.5, 0.0], [0.0, 1.0, 0.0]),
            Vertex::new([0.5, 0.5, 0.0], [0.0, 0.0, 1.0]),
            Vertex::new([-0.5, 0.5, 0.0], [1.0, 1.0, 0.0]),
        ];
        let indices = vec![0, 1, 2, 2, 3, 0];
        let subsets = vec![
            MeshSubset { name: "lower".to_string(), first_triangle: 0, triangle_count: 1 },
            MeshSubset { name: "upper".to_string(), first_triangle: 1, triangle_count: 1 },
        ];

        // Indices and subsets are static and in range.
        Self { vertices, indices, subsets }
    }

    /// Cube spanning [-1, 1] on every axis with one flat color per face.
    /// Every face is its own subset.
    pub fn colored_cube() -> Self {
        const FACES: [(&str, [f32; 3], [[f32; 3]; 4]); 6] = [
            ("front", [1.0, 0.0, 0.0], [[-1.0, -1.0, 1.0], [-1.0, 1.0, 1.0], [1.0, -1.0, 1.0], [1.0, 1.0, 1.0]]),
            ("back", [0.0, 1.0, 0.0], [[-1.0, -1.0, -1.0], [1.0, -1.0, -1.0], [-1.0, 1.0, -1.0], [1.0, 1.0, -1.0]]),
            ("left", [0.0, 0.0, 1.0], [[-1.0, 1.0, 1.0], [-1.0, -1.0, 1.0], [-1.0, 1.0, -1.0], [-1.0, -1.0, -1.0]]),
            ("right", [1.0, 1.0, 0.0], [[1.0, 1.0, 1.0], [1.0, 1.0, -1.0], [1.0, -1.0, 1.0], [1.0, -1.0, -1.0]]),
            ("top", [1.0, 0.0, 1.0], [[1.0, 1.0, 1.0], [-1.0, 1.0, 1.0], [1.0, 1.0, -1.0], [-1.0, 1.0, -1.0]]),
            ("bottom", [0.0, 1.0, 1.0], [[1.0, -1.0, 1.0], [1.0, -1.0, -1.0], [-1.0, -1.0, 1.0], [-1.0, -1.0, -1.0]]),
        ];

        let mut vertices = Vec::with_capacity(36);
        let mut subsets = Vec::with_capacity(6);

        for (face, (name, color, corners)) in FACES.iter().enumerate() {
            // Two triangles per face: (0, 1, 2) and (2, 1, 3).
            for corner in [0, 1, 2, 2, 1, 3] {
                vertices.push(Vertex::new(corners[corner], *color));
            }
            subsets.push(MeshSubset {
                name: name.to_string(),
                first_triangle: face as u32 * 2,
                triangle_count: 2,
            });
        }

        let indices = (0..vertices.len() as u32).collect();
        Self { vertices, indices, subsets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ============================================================
    // Layout
    // ============================================================

    #[test]
    fn test_vertex_is_32_bytes() {
        assert_eq!(VERTEX_STRIDE, 32);
        assert_eq!(std::mem::offset_of!(Vertex, color), COLOR_OFFSET);
    }

    #[test]
    fn test_vertex_new_sets_w_to_one() {
        let v = Vertex::new([1.0, 2.0, 3.0], [0.5, 0.5, 0.5]);
        assert_eq!(v.position, [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(v.color[3], 1.0);
    }

    // ============================================================
    // Built-in meshes
    // ============================================================

    #[test]
    fn test_unit_quad_has_two_triangles() {
        let quad = Mesh::unit_quad();
        assert_eq!(quad.indices().len(), 6);
        assert_eq!(quad.triangle_count(), 2);
        assert_eq!(quad.vertex_count(), 4);
        assert!(quad.indices().iter().all(|&i| i < 4));
    }

    #[test]
    fn test_colored_cube_faces() {
        let cube = Mesh::colored_cube();
        assert_eq!(cube.triangle_count(), 12);
        assert_eq!(cube.subsets().len(), 6);
        for (i, subset) in cube.subsets().iter().enumerate() {
            assert_eq!(subset.first_triangle, i as u32 * 2);
            assert_eq!(subset.triangle_count, 2);
        }
    }

    #[test]
    fn test_colored_cube_face_is_single_color() {
        let cube = Mesh::colored_cube();
        for face in cube.vertices().chunks(6) {
            assert!(face.iter().all(|v| v.color == face[0].color));
        }
    }

    // ============================================================
    // Validation
    // ============================================================

    #[test]
    fn test_new_rejects_ragged_indices() {
        let quad = Mesh::unit_quad();
        let err = Mesh::new(quad.vertices().to_vec(), vec![0, 1], vec![]).unwrap_err();
        assert_eq!(err, MeshError::RaggedIndices(2));
    }

    #[test]
    fn test_new_rejects_out_of_range_index() {
        let quad = Mesh::unit_quad();
        let err = Mesh::new(quad.vertices().to_vec(), vec![0, 1, 4], vec![]).unwrap_err();
        assert!(matches!(err, MeshError::IndexOutOfRange { position: 2, index: 4, .. }));
    }

    #[test]
    fn test_new_rejects_subset_past_end() {
        let quad = Mesh::unit_quad();
        let subsets = vec![MeshSubset { name: "x".into(), first_triangle: 1, triangle_count: 2 }];
        let err = Mesh::new(quad.vertices().to_vec(), quad.indices().to_vec(), subsets).unwrap_err();
        assert!(matches!(err, MeshError::SubsetOutOfRange { end: 3, triangle_count: 2, .. }));
    }

    #[test]
    fn test_new_defaults_to_single_subset() {
        let quad = Mesh::unit_quad();
        let mesh = Mesh::new(quad.vertices().to_vec(), quad.indices().to_vec(), vec![]).unwrap();
        assert_eq!(mesh.subsets().len(), 1);
        assert_eq!(mesh.subsets()[0].triangle_count, 2);
    }

    #[test]
    fn test_empty_mesh_is_valid_data() {
        // Zero triangles is valid mesh data; the acceleration structure
        // builder is what refuses it.
        let mesh = Mesh::new(vec![], vec![], vec![]).unwrap();
        assert_eq!(mesh.triangle_count(), 0);
    }

    // ============================================================
    // Subsets
    // ============================================================

    #[test]
    fn test_selector_packs_first_and_count() {
        let subset = MeshSubset { name: "s".into(), first_triangle: 6, triangle_count: 2 };
        assert_eq!(subset.selector() & 0xFFFF_FFFF, 6);
        assert_eq!(subset.selector() >> 32, 2);
    }

    #[test]
    fn test_subset_of_triangle() {
        let cube = Mesh::colored_cube();
        assert_eq!(cube.subset_of_triangle(0), Some(0));
        assert_eq!(cube.subset_of_triangle(5), Some(2));
        assert_eq!(cube.subset_of_triangle(11), Some(5));
        assert_eq!(cube.subset_of_triangle(12), None);
    }
}
