pub mod collaborators;
pub mod config;
pub mod error;
pub mod server;
pub mod shutdown;
pub mod workflow;
