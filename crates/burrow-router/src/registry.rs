//! Tunnel registry: subdomain → live session
//!
//! Reservation is a single check-and-insert on the map entry, so two
//! concurrent handshakes can never end up holding the same subdomain.
//! A reserved entry is invisible to lookups until the session registers.

use crate::generator::{validate_subdomain, RandomSubdomainGenerator, SubdomainGenerator};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Default number of candidates tried before giving up on a reservation
pub const DEFAULT_MAX_ATTEMPTS: usize = 16;

/// Registry errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("No free subdomain found after {attempts} attempts")]
    Exhausted { attempts: usize },

    #[error("Subdomain is already in use: {0}")]
    AlreadyExists(String),

    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),

    #[error("Subdomain was not reserved: {0}")]
    NotReserved(String),

    #[error("Maximum number of tunnels reached ({0})")]
    CapacityReached(usize),
}

#[derive(Debug, Clone)]
enum RouteEntry<S> {
    /// Claimed by a handshake in progress
    Reserved,
    /// Routed to a live session
    Active(S),
}

/// Registry of tunnel sessions keyed by subdomain
///
/// Generic over the session handle so routing stays independent of the
/// control plane; the relay stores `Arc<Session>` here.
pub struct TunnelRegistry<S> {
    routes: DashMap<String, RouteEntry<S>>,
    generator: Arc<dyn SubdomainGenerator>,
    max_attempts: usize,
    max_sessions: Option<usize>,
    /// Reserved + active entries; kept separately so the capacity check never
    /// has to walk every shard of the map
    occupied: AtomicUsize,
}

impl<S: Clone> TunnelRegistry<S> {
    pub fn new() -> Self {
        Self {
            routes: DashMap::new(),
            generator: Arc::new(RandomSubdomainGenerator::new()),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_sessions: None,
            occupied: AtomicUsize::new(0),
        }
    }

    pub fn with_generator(mut self, generator: Arc<dyn SubdomainGenerator>) -> Self {
        self.generator = generator;
        self
    }

    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: Option<usize>) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Reserve a freshly generated subdomain
    ///
    /// Collisions are retried with a new candidate, up to `max_attempts`.
    pub fn reserve(&self) -> Result<String, RegistryError> {
        self.claim_slot()?;

        for attempt in 1..=self.max_attempts {
            let candidate = self.generator.generate();

            if let Err(e) = validate_subdomain(&candidate) {
                warn!("Generator produced an unusable subdomain: {}", e);
                continue;
            }

            match self.routes.entry(candidate) {
                Entry::Occupied(slot) => {
                    debug!(
                        "Subdomain collision on '{}' (attempt {}/{})",
                        slot.key(),
                        attempt,
                        self.max_attempts
                    );
                }
                Entry::Vacant(slot) => {
                    let subdomain = slot.key().clone();
                    slot.insert(RouteEntry::Reserved);
                    trace!("Reserved subdomain {}", subdomain);
                    return Ok(subdomain);
                }
            }
        }

        self.release_slot();
        Err(RegistryError::Exhausted {
            attempts: self.max_attempts,
        })
    }

    /// Reserve a specific, client-requested subdomain
    pub fn reserve_named(&self, subdomain: &str) -> Result<String, RegistryError> {
        validate_subdomain(subdomain)?;
        self.claim_slot()?;

        match self.routes.entry(subdomain.to_string()) {
            Entry::Occupied(_) => {
                self.release_slot();
                Err(RegistryError::AlreadyExists(subdomain.to_string()))
            }
            Entry::Vacant(slot) => {
                slot.insert(RouteEntry::Reserved);
                trace!("Reserved requested subdomain {}", subdomain);
                Ok(subdomain.to_string())
            }
        }
    }

    /// Route a reserved subdomain to its session
    pub fn register(&self, subdomain: &str, session: S) -> Result<(), RegistryError> {
        let Some(mut entry) = self.routes.get_mut(subdomain) else {
            return Err(RegistryError::NotReserved(subdomain.to_string()));
        };

        match *entry {
            RouteEntry::Reserved => {
                *entry = RouteEntry::Active(session);
                debug!("Registered tunnel route for {}", subdomain);
                Ok(())
            }
            RouteEntry::Active(_) => Err(RegistryError::AlreadyExists(subdomain.to_string())),
        }
    }

    /// Drop a reservation that never became active (failed handshake)
    pub fn release(&self, subdomain: &str) -> bool {
        let removed = self
            .routes
            .remove_if(subdomain, |_, entry| matches!(entry, RouteEntry::Reserved))
            .is_some();

        if removed {
            self.release_slot();
            trace!("Released reservation for {}", subdomain);
        }
        removed
    }

    /// Remove a subdomain, whatever state it is in
    ///
    /// Idempotent: removing an absent subdomain is a no-op returning `None`.
    pub fn unregister(&self, subdomain: &str) -> Option<S> {
        let (_, entry) = self.routes.remove(subdomain)?;
        self.release_slot();
        debug!("Unregistered tunnel route for {}", subdomain);

        match entry {
            RouteEntry::Active(session) => Some(session),
            RouteEntry::Reserved => None,
        }
    }

    /// Remove a subdomain only if it is active and routed to a session
    /// matching `predicate`
    ///
    /// A closing session uses this so it never removes a successor that has
    /// since taken over the same subdomain.
    pub fn unregister_if<F>(&self, subdomain: &str, predicate: F) -> bool
    where
        F: FnOnce(&S) -> bool,
    {
        let removed = self
            .routes
            .remove_if(subdomain, |_, entry| match entry {
                RouteEntry::Active(session) => predicate(session),
                RouteEntry::Reserved => false,
            })
            .is_some();

        if removed {
            self.release_slot();
            debug!("Unregistered tunnel route for {}", subdomain);
        }
        removed
    }

    /// Lookup the active session for a subdomain
    pub fn lookup(&self, subdomain: &str) -> Option<S> {
        let entry = self.routes.get(subdomain)?;
        match entry.value() {
            RouteEntry::Active(session) => Some(session.clone()),
            RouteEntry::Reserved => None,
        }
    }

    /// Check if a subdomain is taken (reserved or active)
    pub fn is_taken(&self, subdomain: &str) -> bool {
        self.routes.contains_key(subdomain)
    }

    /// Number of active (routable) sessions
    pub fn active_count(&self) -> usize {
        self.routes
            .iter()
            .filter(|entry| matches!(entry.value(), RouteEntry::Active(_)))
            .count()
    }

    /// All active subdomains
    pub fn subdomains(&self) -> Vec<String> {
        self.routes
            .iter()
            .filter(|entry| matches!(entry.value(), RouteEntry::Active(_)))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// All active sessions
    pub fn sessions(&self) -> Vec<S> {
        self.routes
            .iter()
            .filter_map(|entry| match entry.value() {
                RouteEntry::Active(session) => Some(session.clone()),
                RouteEntry::Reserved => None,
            })
            .collect()
    }

    fn claim_slot(&self) -> Result<(), RegistryError> {
        match self.max_sessions {
            None => {
                self.occupied.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            Some(max) => self
                .occupied
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                    (n < max).then_some(n + 1)
                })
                .map(|_| ())
                .map_err(|_| RegistryError::CapacityReached(max)),
        }
    }

    fn release_slot(&self) {
        self.occupied.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<S: Clone> Default for TunnelRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
