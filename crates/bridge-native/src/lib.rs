// Native implementations of the worker facades

pub mod memfs;
pub mod runtime;
pub mod store;

pub use memfs::MemFs;
pub use runtime::ProcessRuntime;
