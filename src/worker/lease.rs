use std::time::Duration;

use tracing::{debug, warn};

use crate::domain::repository::LeaseRepository;

/// Unique id for one loop instance: pid plus 64 random bits.
pub fn new_owner_id() -> String {
    format!("{}-{:016x}", std::process::id(), rand::random::<u64>())
}

/// One named lease. Storage errors are logged and reported as "not held"; none of
/// these calls fail.
#[derive(Clone, Debug)]
pub struct LeaseCoordinator<LR>
where
    LR: LeaseRepository,
{
    repo: LR,
    name: String,
}

impl<LR> LeaseCoordinator<LR>
where
    LR: LeaseRepository,
{
    pub fn new(repo: LR, name: impl Into<String>) -> Self {
        Self {
            repo,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn try_acquire(&self, owner: &str, ttl: Duration) -> bool {
        match self.repo.try_acquire(&self.name, owner, ttl).await {
            Ok(acquired) => acquired,
            Err(e) => {
                warn!(lease = %self.name, owner, "Lease acquire failed: {:#}", e);
                false
            }
        }
    }

    pub async fn renew(&self, owner: &str, ttl: Duration) -> bool {
        match self.repo.renew(&self.name, owner, ttl).await {
            Ok(renewed) => renewed,
            Err(e) => {
                warn!(lease = %self.name, owner, "Lease renew failed: {:#}", e);
                false
            }
        }
    }

    pub async fn release(&self, owner: &str) {
        match self.repo.release(&self.name, owner).await {
            Ok(()) => debug!(lease = %self.name, owner, "Lease released"),
            Err(e) => warn!(lease = %self.name, owner, "Lease release failed: {:#}", e),
        }
    }
}
