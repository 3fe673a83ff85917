//! Batch coordination through a shared manifest directory

pub mod barrier;
pub mod coordinator;
pub mod manifest;
pub mod worker;

pub use barrier::{Communicator, communicator};
pub use coordinator::{Coordinator, DispatchConfig};
pub use manifest::{LocalManifestStorage, ManifestStorage};
pub use worker::ShotRunner;
