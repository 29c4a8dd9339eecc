pub mod config;
pub mod context;
pub mod dispatcher;
pub mod messenger;
pub mod protocol;
pub mod transport;
