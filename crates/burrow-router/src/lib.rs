//! Subdomain routing for the relay
//!
//! Owns the mapping from public routing label ("subdomain") to the live tunnel
//! session holding it, plus the generator that proposes new labels and the
//! helper that pulls a label out of an inbound `Host` header.

pub mod generator;
pub mod host;
pub mod registry;

pub use generator::{
    validate_subdomain, RandomSubdomainGenerator, SubdomainGenerator, DEFAULT_SUBDOMAIN_LENGTH,
    SUBDOMAIN_ALPHABET,
};
pub use host::{extract_subdomain, normalize_host};
pub use registry::{RegistryError, TunnelRegistry};
