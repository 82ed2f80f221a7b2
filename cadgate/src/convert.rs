//! Format dispatch and the read -> mesh -> count (or export) pipeline.
//!
//! Everything here is synchronous and runs on the blocking pool; see
//! [`crate::api::handlers::conversions`] for the async side.

use std::path::Path;

use crate::errors::{Error, Result};
use crate::format::Format;
use crate::kernel::{GeometryKernel, Shape, TriangleMesh};

/// How an endpoint maps uploads to kernel readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Every upload is handed to the STEP reader, whatever its suffix.
    StepOnly,
    /// STEP and STL by suffix, OBJ recognized but unimplemented, anything else rejected.
    MultiFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reader {
    Step,
    Stl,
}

impl Dispatch {
    fn reader(self, format: &Format) -> Result<Reader> {
        match self {
            Dispatch::StepOnly => Ok(Reader::Step),
            Dispatch::MultiFormat => match format {
                Format::Step => Ok(Reader::Step),
                Format::Stl => Ok(Reader::Stl),
                Format::Obj => Err(Error::UnimplementedFormat { format: "OBJ" }),
                Format::Unknown(extension) if extension.is_empty() => Err(Error::UnsupportedFormat {
                    extension: "(no extension)".to_string(),
                }),
                Format::Unknown(extension) => Err(Error::UnsupportedFormat {
                    extension: extension.clone(),
                }),
            },
        }
    }
}

fn read_and_mesh(kernel: &dyn GeometryKernel, dispatch: Dispatch, format: &Format, path: &Path, linear_deflection: f64) -> Result<Shape> {
    let mut shape = match dispatch.reader(format)? {
        Reader::Step => kernel.read_step(path)?,
        Reader::Stl => kernel.read_stl(path)?,
    };
    kernel.mesh(&mut shape, linear_deflection)?;
    Ok(shape)
}

/// Read the file at `path`, tessellate it and return its topological face count.
pub fn convert(kernel: &dyn GeometryKernel, dispatch: Dispatch, format: &Format, path: &Path, linear_deflection: f64) -> Result<usize> {
    let shape = read_and_mesh(kernel, dispatch, format, path, linear_deflection)?;
    Ok(kernel.count_faces(&shape)?)
}

/// Read the file at `path`, tessellate it and return the triangles.
pub fn export(
    kernel: &dyn GeometryKernel,
    dispatch: Dispatch,
    format: &Format,
    path: &Path,
    linear_deflection: f64,
) -> Result<TriangleMesh> {
    let shape = read_and_mesh(kernel, dispatch, format, path, linear_deflection)?;
    Ok(kernel.export_mesh(&shape)?)
}
