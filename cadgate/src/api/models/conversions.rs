use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::kernel::TriangleMesh;

/// Always `ok`; failures use the error body instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConversionStatus {
    Ok,
}

/// Result of a successful conversion.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ConversionResponse {
    #[schema(example = "ok")]
    pub status: ConversionStatus,
    /// Number of topological faces in the tessellated shape
    #[schema(example = 6)]
    pub faces: usize,
}

impl ConversionResponse {
    pub fn ok(faces: usize) -> Self {
        Self {
            status: ConversionStatus::Ok,
            faces,
        }
    }
}

/// Tessellation of an upload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct MeshResponse {
    /// Distinct vertex positions as `[x, y, z]`, in model units
    #[schema(example = json!([[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]))]
    pub vertices: Vec<[f64; 3]>,
    /// Triangles as three indices into `vertices`
    #[schema(example = json!([[0, 1, 2]]))]
    pub faces: Vec<[usize; 3]>,
}

impl From<TriangleMesh> for MeshResponse {
    fn from(mesh: TriangleMesh) -> Self {
        Self {
            vertices: mesh.vertices,
            faces: mesh.faces,
        }
    }
}
