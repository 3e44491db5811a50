//! Delivery ledger abstraction.
//!
//! Every dispatch path inserts a pending row before its first network call
//! and patches it once per attempt. The trait keeps the delivery logic
//! independent of PostgreSQL; [`mock::MockDeliveryLedger`] holds rows in
//! memory and records every operation for ordering assertions.

use std::{future::Future, pin::Pin, sync::Arc};

use hookline_core::{
    error::Result,
    models::{DeliveryId, DeliveryPatch, DeliveryRecord},
    storage::Storage,
};

/// Write contract of the delivery ledger.
///
/// Implementations must reject a second insert of the same delivery ID and
/// must enforce the record state machine on update: `attempts` never
/// decreases and terminal rows only accept their own status again.
pub trait DeliveryLedger: Send + Sync + 'static {
    /// Inserts a new pending row.
    fn insert(&self, record: DeliveryRecord) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Patches an existing row.
    fn update(
        &self,
        id: DeliveryId,
        patch: DeliveryPatch,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Ledger stored in the `deliveries` table.
pub struct PostgresDeliveryLedger {
    storage: Arc<Storage>,
}

impl PostgresDeliveryLedger {
    /// Creates a new PostgreSQL ledger adapter.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl DeliveryLedger for PostgresDeliveryLedger {
    fn insert(&self, record: DeliveryRecord) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.insert(&record).await })
    }

    fn update(
        &self,
        id: DeliveryId,
        patch: DeliveryPatch,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.deliveries.update(id, &patch).await })
    }
}

pub mod mock {
    //! In-memory ledger for tests and embedded use.
    //!
    //! Applies the same state machine as the PostgreSQL ledger, keeps an
    //! ordered log of every write, and can be told to fail the next inserts
    //! or updates.

    use std::{
        collections::HashMap,
        future::Future,
        pin::Pin,
        sync::{Arc, Mutex, MutexGuard, PoisonError},
    };

    use hookline_core::{
        error::{CoreError, Result},
        models::{DeliveryId, DeliveryPatch, DeliveryRecord},
    };

    use super::DeliveryLedger;

    /// A write observed by the mock ledger, in call order.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum LedgerOp {
        /// `insert` of a row.
        Insert(DeliveryId),
        /// `update` of a row.
        Update(DeliveryId, DeliveryPatch),
    }

    #[derive(Debug, Default)]
    struct State {
        records: HashMap<DeliveryId, DeliveryRecord>,
        ops: Vec<LedgerOp>,
        insert_errors: Vec<String>,
        update_errors: Vec<String>,
    }

    /// Mock ledger keeping rows in memory.
    #[derive(Debug, Clone, Default)]
    pub struct MockDeliveryLedger {
        state: Arc<Mutex<State>>,
    }

    impl MockDeliveryLedger {
        /// Creates an empty ledger.
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, State> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Makes the next insert fail with a database error.
        pub fn fail_next_insert(&self, message: impl Into<String>) {
            self.state().insert_errors.push(message.into());
        }

        /// Makes the next update fail with a database error.
        pub fn fail_next_update(&self, message: impl Into<String>) {
            self.state().update_errors.push(message.into());
        }

        /// Returns the row for a delivery, if inserted.
        pub fn record(&self, id: DeliveryId) -> Option<DeliveryRecord> {
            self.state().records.get(&id).cloned()
        }

        /// Returns all rows, oldest first.
        pub fn records(&self) -> Vec<DeliveryRecord> {
            let mut records: Vec<_> = self.state().records.values().cloned().collect();
            records.sort_by_key(|record| record.created_at);
            records
        }

        /// Returns every write in call order.
        pub fn operations(&self) -> Vec<LedgerOp> {
            self.state().ops.clone()
        }

        /// Number of successful inserts so far.
        pub fn insert_count(&self) -> usize {
            self.state().ops.iter().filter(|op| matches!(op, LedgerOp::Insert(_))).count()
        }

        /// Patches applied to a delivery, in order.
        pub fn updates_for(&self, id: DeliveryId) -> Vec<DeliveryPatch> {
            self.state()
                .ops
                .iter()
                .filter_map(|op| match op {
                    LedgerOp::Update(op_id, patch) if *op_id == id => Some(patch.clone()),
                    _ => None,
                })
                .collect()
        }
    }

    impl DeliveryLedger for MockDeliveryLedger {
        fn insert(
            &self,
            record: DeliveryRecord,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state();
                if !state.insert_errors.is_empty() {
                    return Err(CoreError::Database(state.insert_errors.remove(0)));
                }
                if state.records.contains_key(&record.id) {
                    return Err(CoreError::ConstraintViolation(format!(
                        "delivery {} already recorded",
                        record.id
                    )));
                }
                state.ops.push(LedgerOp::Insert(record.id));
                state.records.insert(record.id, record);
                Ok(())
            })
        }

        fn update(
            &self,
            id: DeliveryId,
            patch: DeliveryPatch,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state();
                if !state.update_errors.is_empty() {
                    return Err(CoreError::Database(state.update_errors.remove(0)));
                }
                let record = state
                    .records
                    .get_mut(&id)
                    .ok_or_else(|| CoreError::NotFound(format!("delivery {id}")))?;
                record.apply(&patch)?;
                state.ops.push(LedgerOp::Update(id, patch));
                Ok(())
            })
        }
    }
}
