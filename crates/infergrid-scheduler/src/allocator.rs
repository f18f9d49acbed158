//! Capacity allocator: per-tenant reserved throughput and admission.
//!
//! All reads and writes of the reservation map go through one
//! `parking_lot::Mutex`; every critical section is a constant-time map
//! operation. Persistence to the store happens after the map lock is
//! dropped, under a separate persist lock that always writes the newest
//! in-memory value, so concurrent upserts for one tenant resolve
//! last-writer-wins in both places.

use std::collections::HashMap;
use std::sync::Arc;

use infergrid_state::{CapacityReservation, Clock, InferenceRequest, StateStore, TenantId};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{SchedulerError, SchedulerResult};

pub struct CapacityAllocator {
    reservations: Mutex<HashMap<TenantId, CapacityReservation>>,
    persist: Mutex<()>,
    store: Option<StateStore>,
    clock: Arc<dyn Clock>,
}

impl CapacityAllocator {
    /// An allocator with no backing store.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            reservations: Mutex::new(HashMap::new()),
            persist: Mutex::new(()),
            store: None,
            clock,
        }
    }

    /// An allocator that persists reservations and starts from what the
    /// store already holds.
    pub fn with_store(store: StateStore, clock: Arc<dyn Clock>) -> SchedulerResult<Self> {
        let existing = store.list_reservations()?;
        let map = existing
            .into_iter()
            .map(|r| (r.tenant_id.clone(), r))
            .collect::<HashMap<_, _>>();
        debug!(count = map.len(), "capacity reservations restored");
        Ok(Self {
            reservations: Mutex::new(map),
            persist: Mutex::new(()),
            store: Some(store),
            clock,
        })
    }

    /// Upsert a tenant's reservation. Calling twice with the same value
    /// leaves a single reservation holding that value.
    pub fn reserve_capacity(
        &self,
        tenant_id: &str,
        tokens_per_second: u64,
    ) -> SchedulerResult<CapacityReservation> {
        if tenant_id.trim().is_empty() {
            return Err(SchedulerError::InvalidReservation(
                "tenant id must not be empty".to_string(),
            ));
        }
        let reservation = CapacityReservation {
            tenant_id: tenant_id.to_string(),
            tokens_per_second,
            updated_at: self.clock.now(),
        };
        self.reservations
            .lock()
            .insert(reservation.tenant_id.clone(), reservation.clone());

        if let Some(store) = &self.store {
            let _guard = self.persist.lock();
            let latest = self.reservations.lock().get(tenant_id).cloned();
            if let Some(latest) = latest {
                store.put_reservation(&latest)?;
            }
        }
        info!(tenant = %tenant_id, tokens_per_second, "capacity reserved");
        Ok(reservation)
    }

    /// Whether the request fits the tenant's reserved budget.
    ///
    /// Tenants without a reservation are admitted.
    pub fn evaluate_fit(&self, request: &InferenceRequest) -> bool {
        let budget = self
            .reservations
            .lock()
            .get(&request.tenant_id)
            .map(|r| r.tokens_per_second);
        match budget {
            None => true,
            Some(tokens_per_second) => request.prompt_tokens <= tokens_per_second,
        }
    }

    pub fn get(&self, tenant_id: &str) -> Option<CapacityReservation> {
        self.reservations.lock().get(tenant_id).cloned()
    }

    /// Consistent snapshot of every reservation, ordered by tenant.
    pub fn list(&self) -> Vec<CapacityReservation> {
        let mut all: Vec<_> = self.reservations.lock().values().cloned().collect();
        all.sort_by(|a, b| a.tenant_id.cmp(&b.tenant_id));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use infergrid_state::ManualClock;

    fn allocator() -> (CapacityAllocator, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(100));
        (CapacityAllocator::new(clock.clone()), clock)
    }

    fn request(tenant: &str, prompt_tokens: u64) -> InferenceRequest {
        InferenceRequest {
            tenant_id: tenant.to_string(),
            model: "m".to_string(),
            region: None,
            prompt_tokens,
        }
    }

    #[test]
    fn reserve_is_idempotent() {
        let (alloc, _) = allocator();
        alloc.reserve_capacity("t1", 50).unwrap();
        alloc.reserve_capacity("t1", 50).unwrap();

        let all = alloc.list();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].tokens_per_second, 50);
    }

    #[test]
    fn last_writer_wins_with_timestamp() {
        let (alloc, clock) = allocator();
        alloc.reserve_capacity("t1", 50).unwrap();
        clock.set(200);
        alloc.reserve_capacity("t1", 80).unwrap();

        let r = alloc.get("t1").unwrap();
        assert_eq!(r.tokens_per_second, 80);
        assert_eq!(r.updated_at, 200);
    }

    #[test]
    fn over_budget_request_is_denied() {
        let (alloc, _) = allocator();
        alloc.reserve_capacity("t1", 5).unwrap();
        assert!(!alloc.evaluate_fit(&request("t1", 6)));
        assert!(alloc.evaluate_fit(&request("t1", 5)));
    }

    #[test]
    fn tenant_without_reservation_is_admitted() {
        let (alloc, _) = allocator();
        assert!(alloc.evaluate_fit(&request("tenant-x", 1_000_000)));
    }

    #[test]
    fn empty_tenant_is_rejected() {
        let (alloc, _) = allocator();
        assert!(matches!(
            alloc.reserve_capacity(" ", 5),
            Err(SchedulerError::InvalidReservation(_))
        ));
    }

    #[test]
    fn reservations_survive_through_store() {
        let store = StateStore::open_in_memory().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1));
        let alloc = CapacityAllocator::with_store(store.clone(), clock.clone()).unwrap();
        alloc.reserve_capacity("t1", 10).unwrap();
        alloc.reserve_capacity("t2", 20).unwrap();

        let restored = CapacityAllocator::with_store(store, clock).unwrap();
        let tenants: Vec<_> = restored.list().into_iter().map(|r| r.tenant_id).collect();
        assert_eq!(tenants, vec!["t1", "t2"]);
    }

    #[test]
    fn concurrent_reservations_keep_one_row_per_tenant() {
        use std::thread;

        let (alloc, _) = allocator();
        let alloc = Arc::new(alloc);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let alloc = alloc.clone();
                thread::spawn(move || {
                    for _ in 0..100 {
                        alloc.reserve_capacity("shared", i).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(alloc.list().len(), 1);
    }
}
