// Facade traits shared by the worker core and its platform implementations

pub mod environment;
pub mod filesystem;
pub mod runtime;
