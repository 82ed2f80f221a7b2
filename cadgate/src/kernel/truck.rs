//! [`GeometryKernel`] backed by the truck CAD kernel for STEP and `stl_io` for STL.

use std::fs::File;
use std::path::Path;

use truck_meshalgo::tessellation::RobustMeshableShape;
use truck_stepio::r#in::Table;

use super::{GeometryKernel, KernelError, MeshBuilder, Repr, Shape, TriangleMesh};

/// Stateless; one instance is shared by every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruckKernel;

impl TruckKernel {
    pub fn new() -> Self {
        Self
    }

    fn shell_faces(table: &Table) -> Result<usize, KernelError> {
        let mut count = 0;
        for step_shell in table.shell.values() {
            let shell = table
                .to_compressed_shell(step_shell)
                .map_err(|e| KernelError::Processing(format!("Failed to convert STEP shell: {e:?}")))?;
            count += shell.faces.len();
        }
        Ok(count)
    }
}

impl GeometryKernel for TruckKernel {
    fn read_step(&self, path: &Path) -> Result<Shape, KernelError> {
        let text = std::fs::read_to_string(path).map_err(|e| KernelError::Read(format!("Failed to read STEP file: {e}")))?;
        let table = Table::from_step(&text).ok_or_else(|| KernelError::Read("Failed to read STEP file".to_string()))?;

        if table.shell.is_empty() {
            return Err(KernelError::Read("STEP file contains no shells".to_string()));
        }

        tracing::debug!(shells = table.shell.len(), "Parsed STEP exchange");
        Ok(Shape::exchange(table))
    }

    fn read_stl(&self, path: &Path) -> Result<Shape, KernelError> {
        let mut file = File::open(path).map_err(|e| KernelError::Read(format!("Failed to read STL file: {e}")))?;
        let mesh = stl_io::read_stl(&mut file).map_err(|e| KernelError::Read(format!("Failed to read STL file: {e}")))?;

        tracing::debug!(facets = mesh.faces.len(), vertices = mesh.vertices.len(), "Parsed STL facets");
        Ok(Shape::from_facets(mesh))
    }

    fn mesh(&self, shape: &mut Shape, linear_deflection: f64) -> Result<(), KernelError> {
        let table = match &shape.repr {
            Repr::Exchange(table) => table,
            // Facets are triangles already; a tessellated shape is not refined again.
            Repr::Tessellated(_) | Repr::Facets(_) => return Ok(()),
        };

        let mut faces = Vec::new();
        for step_shell in table.shell.values() {
            let shell = table
                .to_compressed_shell(step_shell)
                .map_err(|e| KernelError::Processing(format!("Failed to convert STEP shell: {e:?}")))?;
            let meshed = shell.robust_triangulation(linear_deflection);
            faces.extend(meshed.faces.into_iter().map(|face| face.surface));
        }

        let untriangulated = faces.iter().filter(|face| face.is_none()).count();
        tracing::debug!(faces = faces.len(), untriangulated, linear_deflection, "Tessellated shape");

        shape.repr = Repr::Tessellated(faces);
        Ok(())
    }

    fn count_faces(&self, shape: &Shape) -> Result<usize, KernelError> {
        match &shape.repr {
            Repr::Exchange(table) => Self::shell_faces(table),
            Repr::Tessellated(faces) => Ok(faces.len()),
            Repr::Facets(mesh) => Ok(mesh.faces.len()),
        }
    }

    fn export_mesh(&self, shape: &Shape) -> Result<TriangleMesh, KernelError> {
        let mut builder = MeshBuilder::default();

        match &shape.repr {
            Repr::Exchange(_) => {
                return Err(KernelError::Processing("Shape has not been tessellated".to_string()));
            }
            Repr::Tessellated(faces) => {
                for mesh in faces.iter().flatten() {
                    let corners: Vec<usize> = mesh.positions().iter().map(|p| builder.vertex([p.x, p.y, p.z])).collect();
                    for [a, b, c] in mesh.faces().triangle_iter() {
                        builder.triangle([corners[a.pos], corners[b.pos], corners[c.pos]]);
                    }
                }
            }
            Repr::Facets(mesh) => {
                let corners: Vec<usize> = mesh
                    .vertices
                    .iter()
                    .map(|v| builder.vertex([f64::from(v[0]), f64::from(v[1]), f64::from(v[2])]))
                    .collect();
                for facet in &mesh.faces {
                    builder.triangle(facet.vertices.map(|i| corners[i]));
                }
            }
        }

        let mesh = builder.finish();
        tracing::debug!(vertices = mesh.vertices.len(), triangles = mesh.faces.len(), "Exported mesh");
        Ok(mesh)
    }
}
