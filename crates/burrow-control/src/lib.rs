//! Hub-side control plane: the tunnel session registry.

pub mod registry;

pub use registry::{RegistryError, SessionRegistry};
