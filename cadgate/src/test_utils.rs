//! Test fixtures: configs, app state, a scriptable kernel and generated STEP and STL data.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum_test::TestServer;
use stl_io::{Normal, Triangle, Vertex};
use tempfile::TempDir;

use crate::config::Config;
use crate::kernel::{GeometryKernel, KernelError, Shape, TriangleMesh, TruckKernel};
use crate::{AppState, build_router};

pub fn create_test_config() -> Config {
    Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..Default::default()
    }
}

/// App state whose uploads land in a fresh directory, returned so tests can inspect it.
pub fn create_test_state(mut config: Config, kernel: impl GeometryKernel + 'static) -> (AppState, TempDir) {
    let dir = tempfile::tempdir().expect("Failed to create upload directory");
    config.uploads.temp_dir = Some(dir.path().to_path_buf());

    let state = AppState::new(config, Arc::new(kernel));

    (state, dir)
}

pub fn test_server(state: &AppState) -> TestServer {
    let router = build_router(state).expect("Failed to build router");
    TestServer::new(router).expect("Failed to create test server")
}

pub fn create_test_server_with(config: Config, kernel: impl GeometryKernel + 'static) -> (TestServer, TempDir) {
    let (state, dir) = create_test_state(config, kernel);
    (test_server(&state), dir)
}

/// Binary STL with `triangles` distinct facets.
pub fn binary_stl(triangles: usize) -> Vec<u8> {
    let mesh: Vec<Triangle> = (0..triangles)
        .map(|i| {
            let x = i as f32;
            Triangle {
                normal: Normal::new([0.0, 0.0, 1.0]),
                vertices: [
                    Vertex::new([x, 0.0, 0.0]),
                    Vertex::new([x + 1.0, 0.0, 0.0]),
                    Vertex::new([x, 1.0, 0.0]),
                ],
            }
        })
        .collect();

    let mut out = Vec::new();
    stl_io::write_stl(&mut out, mesh.iter()).expect("Failed to encode STL");
    out
}

/// STEP exchange text for a unit cube at the origin: one closed shell of six planar faces.
pub fn step_cube() -> String {
    use truck_modeling::{Point3, Solid, Vector3, builder};
    use truck_stepio::out::{CompleteStepDisplay, StepHeaderDescriptor, StepModel};

    let vertex = builder::vertex(Point3::new(0.0, 0.0, 0.0));
    let edge = builder::tsweep(&vertex, Vector3::unit_x());
    let face = builder::tsweep(&edge, Vector3::unit_y());
    let cube: Solid = builder::tsweep(&face, Vector3::unit_z());

    CompleteStepDisplay::new(StepModel::from(&cube.compress()), StepHeaderDescriptor::default()).to_string()
}

/// Kernel driven by the uploaded bytes instead of real geometry.
///
/// - `FACES=<n>` on the first line reads as a shape with `n` faces
/// - `PANIC` panics inside the reader
/// - anything else is a read error
///
/// Clones share their counters.
#[derive(Debug, Clone, Default)]
pub struct FakeKernel {
    step_reads: Arc<AtomicUsize>,
    stl_reads: Arc<AtomicUsize>,
    last_deflection: Arc<Mutex<Option<f64>>>,
}

impl FakeKernel {
    pub fn step_reads(&self) -> usize {
        self.step_reads.load(Ordering::SeqCst)
    }

    pub fn stl_reads(&self) -> usize {
        self.stl_reads.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.step_reads() + self.stl_reads()
    }

    pub fn last_deflection(&self) -> Option<f64> {
        *self.last_deflection.lock().unwrap()
    }

    fn read_scripted(path: &Path, format: &str) -> Result<Shape, KernelError> {
        let content = std::fs::read_to_string(path).map_err(|e| KernelError::Read(format!("Failed to read {format} file: {e}")))?;

        if content.starts_with("PANIC") {
            panic!("scripted kernel panic");
        }

        let faces = content
            .lines()
            .next()
            .and_then(|line| line.strip_prefix("FACES="))
            .and_then(|n| n.trim().parse::<usize>().ok())
            .ok_or_else(|| KernelError::Read(format!("Failed to read {format} file")))?;

        let mesh = stl_io::read_stl(&mut Cursor::new(binary_stl(faces))).map_err(|e| KernelError::Read(e.to_string()))?;
        Ok(Shape::from_facets(mesh))
    }
}

impl GeometryKernel for FakeKernel {
    fn read_step(&self, path: &Path) -> Result<Shape, KernelError> {
        self.step_reads.fetch_add(1, Ordering::SeqCst);
        Self::read_scripted(path, "STEP")
    }

    fn read_stl(&self, path: &Path) -> Result<Shape, KernelError> {
        self.stl_reads.fetch_add(1, Ordering::SeqCst);
        Self::read_scripted(path, "STL")
    }

    fn mesh(&self, shape: &mut Shape, linear_deflection: f64) -> Result<(), KernelError> {
        *self.last_deflection.lock().unwrap() = Some(linear_deflection);
        TruckKernel::new().mesh(shape, linear_deflection)
    }

    fn count_faces(&self, shape: &Shape) -> Result<usize, KernelError> {
        TruckKernel::new().count_faces(shape)
    }

    fn export_mesh(&self, shape: &Shape) -> Result<TriangleMesh, KernelError> {
        TruckKernel::new().export_mesh(shape)
    }
}
