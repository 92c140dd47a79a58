//! Subdomain candidate generation
//!
//! A generator only proposes labels. Uniqueness is the registry's job: it
//! atomically claims a candidate and asks for another one on collision.

use crate::registry::RegistryError;
use rand::Rng;

/// Alphabet of generated labels: lowercase ASCII letters and digits (36 symbols)
pub const SUBDOMAIN_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Default length of generated labels
pub const DEFAULT_SUBDOMAIN_LENGTH: usize = 8;

/// Trait for proposing subdomain candidates
///
/// # Example
/// ```ignore
/// struct PrefixedGenerator(RandomSubdomainGenerator);
///
/// impl SubdomainGenerator for PrefixedGenerator {
///     fn generate(&self) -> String {
///         format!("dev-{}", self.0.generate())
///     }
/// }
/// ```
pub trait SubdomainGenerator: Send + Sync {
    /// Produce one candidate label. Candidates may repeat.
    fn generate(&self) -> String;
}

/// Fixed-length random labels drawn from [`SUBDOMAIN_ALPHABET`]
#[derive(Debug, Clone)]
pub struct RandomSubdomainGenerator {
    length: usize,
}

impl RandomSubdomainGenerator {
    pub fn new() -> Self {
        Self::with_length(DEFAULT_SUBDOMAIN_LENGTH)
    }

    /// Labels shorter than 3 characters are not valid DNS-style subdomains,
    /// so the length is clamped to `3..=63`.
    pub fn with_length(length: usize) -> Self {
        Self {
            length: length.clamp(3, 63),
        }
    }

    pub fn length(&self) -> usize {
        self.length
    }
}

impl Default for RandomSubdomainGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl SubdomainGenerator for RandomSubdomainGenerator {
    fn generate(&self) -> String {
        let mut rng = rand::thread_rng();
        (0..self.length)
            .map(|_| SUBDOMAIN_ALPHABET[rng.gen_range(0..SUBDOMAIN_ALPHABET.len())] as char)
            .collect()
    }
}

/// Validate a client-requested subdomain
///
/// Checks:
/// - Between 3-63 characters (DNS label requirements)
/// - Lowercase alphanumeric and hyphens only
/// - Doesn't start or end with hyphen
pub fn validate_subdomain(subdomain: &str) -> Result<(), RegistryError> {
    if subdomain.len() < 3 {
        return Err(RegistryError::InvalidSubdomain(format!(
            "'{}' is too short (minimum 3 characters)",
            subdomain
        )));
    }

    if subdomain.len() > 63 {
        return Err(RegistryError::InvalidSubdomain(format!(
            "too long (max 63 characters): {}",
            subdomain.len()
        )));
    }

    if subdomain.starts_with('-') || subdomain.ends_with('-') {
        return Err(RegistryError::InvalidSubdomain(format!(
            "'{}' cannot start or end with hyphen",
            subdomain
        )));
    }

    if let Some(ch) = subdomain
        .chars()
        .find(|ch| !(ch.is_ascii_lowercase() || ch.is_ascii_digit() || *ch == '-'))
    {
        return Err(RegistryError::InvalidSubdomain(format!(
            "'{}' contains invalid character '{}' (only lowercase alphanumerics and hyphens allowed)",
            subdomain, ch
        )));
    }

    Ok(())
}
