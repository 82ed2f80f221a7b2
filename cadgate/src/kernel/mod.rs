//! Geometry kernel seam.
//!
//! Parsing, tessellation and topology traversal are delegated to a CAD kernel behind the
//! [`GeometryKernel`] trait. The gateway only ever calls these operations, all of them
//! synchronous and potentially CPU heavy; callers run them on the blocking pool.
//!
//! [`TruckKernel`] is the production implementation. Tests substitute their own.

mod truck;

use std::collections::HashMap;
use std::path::Path;

use stl_io::IndexedMesh;
use thiserror::Error as ThisError;
use truck_meshalgo::prelude::PolygonMesh;
use truck_stepio::r#in::Table;

pub use self::truck::TruckKernel;

/// Failure reported by a kernel operation.
#[derive(ThisError, Debug)]
pub enum KernelError {
    /// The input is not valid for the reader's format
    #[error("{0}")]
    Read(String),
    /// Meshing or traversal failed on an otherwise readable shape
    #[error("{0}")]
    Processing(String),
}

/// In-memory geometry produced by a kernel reader.
///
/// Owned by a single conversion and never shared; mutated in place by
/// [`GeometryKernel::mesh`].
pub struct Shape {
    repr: Repr,
}

enum Repr {
    /// Boundary representation decoded from a STEP exchange file, not yet tessellated.
    Exchange(Box<Table>),
    /// One entry per topological face, holding its triangulation when the tessellator produced
    /// one.
    Tessellated(Vec<Option<PolygonMesh>>),
    /// Compound of facets read from a mesh file, where every triangle is a face.
    Facets(IndexedMesh),
}

impl Shape {
    pub(crate) fn exchange(table: Table) -> Self {
        Self {
            repr: Repr::Exchange(Box::new(table)),
        }
    }

    /// A compound whose faces are the triangles of `mesh`.
    pub fn from_facets(mesh: IndexedMesh) -> Self {
        Self { repr: Repr::Facets(mesh) }
    }

    /// Whether every face carries a triangulation.
    #[cfg(test)]
    pub(crate) fn is_meshed(&self) -> bool {
        match &self.repr {
            Repr::Exchange(_) => false,
            Repr::Tessellated(faces) => faces.iter().all(Option::is_some),
            Repr::Facets(_) => true,
        }
    }
}

impl std::fmt::Debug for Shape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.repr {
            Repr::Exchange(table) => f.debug_struct("Shape::Exchange").field("shells", &table.shell.len()).finish(),
            Repr::Tessellated(faces) => f.debug_struct("Shape::Tessellated").field("faces", &faces.len()).finish(),
            Repr::Facets(mesh) => f.debug_struct("Shape::Facets").field("faces", &mesh.faces.len()).finish(),
        }
    }
}

/// Triangles over a shared vertex list.
///
/// Vertices with identical coordinates are stored once, so `faces` indexes into `vertices`
/// across face boundaries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriangleMesh {
    pub vertices: Vec<[f64; 3]>,
    pub faces: Vec<[usize; 3]>,
}

/// Builds a [`TriangleMesh`], merging coincident vertices.
#[derive(Debug, Default)]
pub(crate) struct MeshBuilder {
    mesh: TriangleMesh,
    index: HashMap<[u64; 3], usize>,
}

impl MeshBuilder {
    /// Index of `point`, added if no vertex has the same coordinates.
    pub(crate) fn vertex(&mut self, point: [f64; 3]) -> usize {
        // Folds -0.0 into 0.0 so both hash alike.
        let point = point.map(|c| c + 0.0);
        let vertices = &mut self.mesh.vertices;
        *self.index.entry(point.map(f64::to_bits)).or_insert_with(|| {
            vertices.push(point);
            vertices.len() - 1
        })
    }

    pub(crate) fn triangle(&mut self, corners: [usize; 3]) {
        self.mesh.faces.push(corners);
    }

    pub(crate) fn finish(self) -> TriangleMesh {
        self.mesh
    }
}

/// The narrow contract the gateway needs from a CAD kernel.
pub trait GeometryKernel: Send + Sync {
    /// Parse a STEP file.
    fn read_step(&self, path: &Path) -> Result<Shape, KernelError>;

    /// Parse an STL file into a compound of facets.
    fn read_stl(&self, path: &Path) -> Result<Shape, KernelError>;

    /// Tessellate `shape` in place with the given linear deflection.
    fn mesh(&self, shape: &mut Shape, linear_deflection: f64) -> Result<(), KernelError>;

    /// Number of topological faces in `shape`.
    fn count_faces(&self, shape: &Shape) -> Result<usize, KernelError>;

    /// Triangles of a meshed `shape` with coincident vertices merged.
    ///
    /// Faces the tessellator could not triangulate are left out.
    fn export_mesh(&self, shape: &Shape) -> Result<TriangleMesh, KernelError>;
}
