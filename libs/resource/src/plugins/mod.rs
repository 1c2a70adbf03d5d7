//! Built-in resource plugins.

mod cpumem;
mod volume;

pub use cpumem::CpuMemPlugin;
pub use volume::VolumePlugin;
