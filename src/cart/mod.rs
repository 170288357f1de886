//! Cartridges: the manifest on the card, and the payload processes the
//! daemon runs from it.
pub mod manifest;
pub mod registry;
pub mod session;
pub mod supervisor;

pub use manifest::CartFile;
pub use registry::CartRegistry;
pub use session::ProcSessionEnv;
pub use supervisor::{Identity, KillReport, RunningCart, Supervisor};
