//! infergridd library half: assembly of the control plane subsystems.
//!
//! The binary in `main.rs` parses the CLI and calls [`control_plane::run`];
//! integration tests build the same graph with [`ControlPlane::assemble`]
//! over an in-memory store.

pub mod control_plane;

pub use control_plane::{ControlPlane, provisioner_from_settings};
