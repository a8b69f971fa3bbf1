//! Codepod - ephemeral editor sessions for git repositories.
//!
//! Each session clones a repository, starts an editor-server container with
//! the workspace mounted and publishes it on a host port.

pub mod api;
pub mod config;
pub mod container;
pub mod ports;
pub mod session;
pub mod workspace;
