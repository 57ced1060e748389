use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::error::BridgeError;
use crate::events::{ListenerHandle, Listeners};

/// Lease lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    Active,
    Expired,
    Revoked,
}

/// A tenant's exclusive claim on one worker for a bounded interval.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub tenant_id: String,
    pub worker_id: String,
    pub controller_id: String,
    pub acquired_at: Instant,
    pub expires_at: Instant,
    pub status: LeaseStatus,
}

impl Lease {
    /// Active means status is active *and* unexpired.
    #[must_use]
    pub fn is_active(&self, now: Instant) -> bool {
        self.status == LeaseStatus::Active && now < self.expires_at
    }
}

/// Lease lifecycle notifications.
#[derive(Debug, Clone)]
pub enum LeaseEvent {
    Acquired {
        tenant_id: String,
        controller_id: String,
    },
    Released {
        tenant_id: String,
    },
    Refreshed {
        tenant_id: String,
    },
    Revoked {
        tenant_id: String,
        reason: String,
    },
    Expired {
        tenant_id: String,
    },
}

/// The sole authority on tenant exclusivity.
///
/// Invariant: for each tenant, at most one active lease exists at any
/// instant. A lease held by the same controller extends in place; a
/// different controller is refused while the lease is unexpired.
pub struct LeaseManager {
    leases: HashMap<String, Lease>,
    default_ttl: Duration,
    listeners: Listeners<LeaseEvent>,
}

impl LeaseManager {
    #[must_use]
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            leases: HashMap::new(),
            default_ttl,
            listeners: Listeners::new(),
        }
    }

    /// Register a lease-event listener.
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle<LeaseEvent>
    where
        F: Fn(&LeaseEvent) + Send + Sync + 'static,
    {
        self.listeners.subscribe(listener)
    }

    /// Acquire or extend the tenant's lease.
    ///
    /// # Errors
    ///
    /// Returns `LeaseAlreadyHeld` when a different controller holds an
    /// unexpired lease.
    pub fn acquire(
        &mut self,
        tenant_id: &str,
        controller_id: &str,
        worker_id: &str,
        ttl: Option<Duration>,
    ) -> Result<Lease, BridgeError> {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);

        if let Some(existing) = self.leases.get(tenant_id) {
            if existing.is_active(now) && existing.controller_id != controller_id {
                return Err(BridgeError::LeaseAlreadyHeld {
                    tenant_id: tenant_id.to_owned(),
                    holder: existing.controller_id.clone(),
                });
            }
        }

        let lease = Lease {
            lease_id: format!("ls-{}", uuid::Uuid::new_v4().simple()),
            tenant_id: tenant_id.to_owned(),
            worker_id: worker_id.to_owned(),
            controller_id: controller_id.to_owned(),
            acquired_at: now,
            expires_at: now + ttl,
            status: LeaseStatus::Active,
        };
        self.leases.insert(tenant_id.to_owned(), lease.clone());
        self.listeners.emit(&LeaseEvent::Acquired {
            tenant_id: tenant_id.to_owned(),
            controller_id: controller_id.to_owned(),
        });
        Ok(lease)
    }

    /// Whether the tenant's lease is currently held by `controller_id`.
    #[must_use]
    pub fn is_held_by(&self, tenant_id: &str, controller_id: &str) -> bool {
        self.leases.get(tenant_id).is_some_and(|lease| {
            lease.is_active(Instant::now()) && lease.controller_id == controller_id
        })
    }

    /// The tenant's lease record, active or not.
    #[must_use]
    pub fn get(&self, tenant_id: &str) -> Option<&Lease> {
        self.leases.get(tenant_id)
    }

    /// Whether any active lease exists for the tenant.
    #[must_use]
    pub fn has_active(&self, tenant_id: &str) -> bool {
        self.leases
            .get(tenant_id)
            .is_some_and(|lease| lease.is_active(Instant::now()))
    }

    /// Drop the tenant's lease.
    ///
    /// # Errors
    ///
    /// `LeaseNotFound` when no lease exists; `LeaseAlreadyHeld` when a
    /// controller is given and does not match the holder.
    pub fn release(
        &mut self,
        tenant_id: &str,
        controller_id: Option<&str>,
    ) -> Result<(), BridgeError> {
        let lease = self
            .leases
            .get(tenant_id)
            .ok_or_else(|| BridgeError::LeaseNotFound {
                tenant_id: tenant_id.to_owned(),
            })?;
        if let Some(controller) = controller_id {
            if lease.controller_id != controller {
                return Err(BridgeError::LeaseAlreadyHeld {
                    tenant_id: tenant_id.to_owned(),
                    holder: lease.controller_id.clone(),
                });
            }
        }
        self.leases.remove(tenant_id);
        self.listeners.emit(&LeaseEvent::Released {
            tenant_id: tenant_id.to_owned(),
        });
        Ok(())
    }

    /// Extend the tenant's lease by `ttl` from now.
    ///
    /// # Errors
    ///
    /// `LeaseNotFound` when no lease exists, `LeaseExpired` when the lease
    /// is past its expiry or no longer active.
    pub fn refresh(&mut self, tenant_id: &str, ttl: Option<Duration>) -> Result<(), BridgeError> {
        let now = Instant::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let lease = self
            .leases
            .get_mut(tenant_id)
            .ok_or_else(|| BridgeError::LeaseNotFound {
                tenant_id: tenant_id.to_owned(),
            })?;
        if !lease.is_active(now) {
            return Err(BridgeError::LeaseExpired {
                tenant_id: tenant_id.to_owned(),
            });
        }
        lease.expires_at = now + ttl;
        self.listeners.emit(&LeaseEvent::Refreshed {
            tenant_id: tenant_id.to_owned(),
        });
        Ok(())
    }

    /// Drop the tenant's lease and notify revocation subscribers. Returns
    /// the removed lease, if any.
    pub fn revoke(&mut self, tenant_id: &str, reason: &str) -> Option<Lease> {
        let mut lease = self.leases.remove(tenant_id)?;
        lease.status = LeaseStatus::Revoked;
        debug!(tenant_id, reason, "lease revoked");
        self.listeners.emit(&LeaseEvent::Revoked {
            tenant_id: tenant_id.to_owned(),
            reason: reason.to_owned(),
        });
        Some(lease)
    }

    /// Remove expired leases and notify expiration subscribers. Returns the
    /// affected tenants.
    pub fn cleanup_expired(&mut self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .leases
            .iter()
            .filter(|(_, lease)| !lease.is_active(now))
            .map(|(tenant, _)| tenant.clone())
            .collect();
        for tenant_id in &expired {
            self.leases.remove(tenant_id);
            self.listeners.emit(&LeaseEvent::Expired {
                tenant_id: tenant_id.clone(),
            });
        }
        expired
    }

    /// Number of lease records (active or not).
    #[must_use]
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
