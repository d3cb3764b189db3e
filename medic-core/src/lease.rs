use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = HashMap<String, Arc<AsyncMutex<()>>>;

/// Exclusive per-resource leases. Two incidents against the same function
/// serialize their Execute phases; different functions proceed in parallel.
#[derive(Clone, Default)]
pub struct ResourceLeases {
    slots: Arc<Mutex<Slots>>,
}

/// Held for as long as the lease is needed; released on drop.
pub struct ResourceLease {
    resource_id: String,
    slots: Arc<Mutex<Slots>>,
    guard: OwnedMutexGuard<()>,
}

impl ResourceLease {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        let mut slots = lock(&self.slots);
        let held = OwnedMutexGuard::mutex(&self.guard);
        // Only the map and this guard reference the slot: nobody is waiting.
        let idle = slots
            .get(&self.resource_id)
            .is_some_and(|slot| Arc::ptr_eq(slot, held) && Arc::strong_count(slot) == 2);
        if idle {
            slots.remove(&self.resource_id);
        }
    }
}

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ResourceLeases {
    pub async fn acquire(&self, resource_id: &str) -> ResourceLease {
        let slot = {
            let mut slots = lock(&self.slots);
            // Slots left behind by waiters that gave up before acquiring.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots
                .entry(resource_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        tracing::debug!(resource_id, "waiting for resource lease");
        let guard = slot.lock_owned().await;
        ResourceLease {
            resource_id: resource_id.to_string(),
            slots: self.slots.clone(),
            guard,
        }
    }

    /// Leases currently held or awaited.
    pub fn contended(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| Arc::strong_count(slot) > 1)
            .count()
    }

    /// Resources with a slot in the lease table.
    pub fn tracked(&self) -> usize {
        lock(&self.slots).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_resource_is_exclusive() {
        let leases = ResourceLeases::default();
        let first = leases.acquire("fn-a").await;
        assert_eq!(first.resource_id(), "fn-a");

        let contender = leases.clone();
        let waiter = tokio::spawn(async move { contender.acquire("fn-a").await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("lease released")
            .expect("join");
        assert_eq!(second.resource_id(), "fn-a");
    }

    #[tokio::test]
    async fn different_resources_do_not_block() {
        let leases = ResourceLeases::default();
        let _a = leases.acquire("fn-a").await;
        let b = tokio::time::timeout(Duration::from_secs(1), leases.acquire("fn-b")).await;
        assert!(b.is_ok());
        assert_eq!(leases.contended(), 2);
    }

    #[tokio::test]
    async fn released_leases_leave_no_slots_behind() {
        let leases = ResourceLeases::default();
        for n in 0..50 {
            let lease = leases.acquire(&format!("fn-{n}")).await;
            assert_eq!(leases.tracked(), 1);
            drop(lease);
        }
        assert_eq!(leases.tracked(), 0);

        let first = leases.acquire("fn-a").await;
        let contender = leases.clone();
        let waiter = tokio::spawn(async move { contender.acquire("fn-a").await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A waiter keeps the slot alive past the first release.
        drop(first);
        assert_eq!(leases.tracked(), 1);
        let second = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("lease released")
            .expect("join");
        drop(second);
        assert_eq!(leases.tracked(), 0);
        assert_eq!(leases.contended(), 0);
    }
}
