//! Capability Registry
//!
//! デバイスケイパビリティの名前空間付きカタログとライブヘルススコア

mod registry;
mod types;

pub use registry::{CapabilityCatalog, CapabilityRegistry, NAMESPACE_SEPARATOR};
pub use types::{CapabilityRegistration, CapabilitySpec, HealthBucket, HealthTransition};
