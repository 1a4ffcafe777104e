//! Hub control plane state
//!
//! The endpoint registry, the service catalog derived from it, the hub's
//! operational log, and the certificate signer collaborator.

pub mod catalog;
pub mod hub_log;
pub mod registry;
pub mod signer;
pub mod task_tracker;

pub use catalog::ServiceCatalog;
pub use hub_log::HubLog;
pub use registry::{
    BindOutcome, EndpointQuery, EndpointRegistry, EndpointSnapshot, Origin, RegistryError,
    ServiceDiff,
};
pub use signer::{CertificateSigner, RemoteCaSigner, SignerError};
pub use task_tracker::TaskTracker;
