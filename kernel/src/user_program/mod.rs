//! User processes: their executables and the exception path that pages their
//! memory in and out.

pub mod image;
pub mod process;

pub use image::{Executable, ExecutableImage, ImageError, Section, SectionInfo};
pub use process::{RunningProcess, VmProcess};
