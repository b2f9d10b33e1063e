//! Persistent payment and subscription store
//!
//! Uses redb. Records are JSON values keyed by id, with a secondary index
//! from provider reference to id for callback lookup. Finalization is a
//! compare-and-set inside a single write transaction: a record only leaves
//! `pending` once, so duplicate callback deliveries are no-ops.

use anyhow::Result;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::payments::errors::PaymentError;
use crate::payments::types::{PaymentRecord, PaymentStatus, SubscriptionRecord};

/// Key: payment id. Value: serialized PaymentRecord JSON.
const PAYMENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("payments");

/// Key: provider reference. Value: payment id.
const PAYMENTS_BY_REFERENCE_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("payments_by_reference");

/// Key: user id. Value: serialized SubscriptionRecord JSON.
const SUBSCRIPTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("subscriptions");

/// Outcome of a conditional finalization.
#[derive(Debug, Clone)]
pub enum Finalize {
    /// This call transitioned the record out of `pending`.
    Applied(PaymentRecord),
    /// The record was already terminal; nothing was written.
    AlreadyFinal(PaymentRecord),
}

#[derive(Clone)]
pub struct PaymentStore {
    db: Arc<Database>,
}

fn persistence(e: impl std::fmt::Display) -> PaymentError {
    PaymentError::Persistence(e.to_string())
}

impl PaymentStore {
    /// Create a new database instance or open an existing one.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _payments = write_txn.open_table(PAYMENTS_TABLE)?;
            let _refs = write_txn.open_table(PAYMENTS_BY_REFERENCE_TABLE)?;
            let _subscriptions = write_txn.open_table(SUBSCRIPTIONS_TABLE)?;
        }
        write_txn.commit()?;

        tracing::info!("Payment store initialized");

        Ok(Self { db: Arc::new(db) })
    }

    /// Insert a new payment record and its reference index entry.
    pub fn insert_payment(&self, record: &PaymentRecord) -> Result<(), PaymentError> {
        let value = serde_json::to_vec(record).map_err(persistence)?;

        let write_txn = self.db.begin_write().map_err(persistence)?;
        {
            let mut payments = write_txn.open_table(PAYMENTS_TABLE).map_err(persistence)?;
            payments
                .insert(record.id.as_str(), value.as_slice())
                .map_err(persistence)?;

            let mut refs = write_txn
                .open_table(PAYMENTS_BY_REFERENCE_TABLE)
                .map_err(persistence)?;
            refs.insert(record.provider_reference.as_str(), record.id.as_str())
                .map_err(persistence)?;
        }
        write_txn.commit().map_err(persistence)?;

        debug!(
            payment_id = %record.id,
            provider_reference = %record.provider_reference,
            status = record.status.as_str(),
            "Inserted payment record"
        );
        Ok(())
    }

    pub fn get_payment(&self, id: &str) -> Result<Option<PaymentRecord>, PaymentError> {
        let read_txn = self.db.begin_read().map_err(persistence)?;
        let payments = read_txn.open_table(PAYMENTS_TABLE).map_err(persistence)?;

        match payments.get(id).map_err(persistence)? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value()).map_err(persistence)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn get_payment_by_reference(
        &self,
        reference: &str,
    ) -> Result<Option<PaymentRecord>, PaymentError> {
        let read_txn = self.db.begin_read().map_err(persistence)?;
        let refs = read_txn
            .open_table(PAYMENTS_BY_REFERENCE_TABLE)
            .map_err(persistence)?;

        let id = match refs.get(reference).map_err(persistence)? {
            Some(guard) => guard.value().to_string(),
            None => return Ok(None),
        };
        drop(refs);

        let payments = read_txn.open_table(PAYMENTS_TABLE).map_err(persistence)?;
        match payments.get(id.as_str()).map_err(persistence)? {
            Some(guard) => {
                let record = serde_json::from_slice(guard.value()).map_err(persistence)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Conditionally transition the record for `reference` out of `pending`.
    ///
    /// Returns `None` for an unknown reference. A record that is already
    /// terminal comes back as `Finalize::AlreadyFinal` with nothing written,
    /// which is what makes duplicate provider deliveries safe.
    pub fn finalize_by_reference(
        &self,
        reference: &str,
        status: PaymentStatus,
        receipt: Option<String>,
        finalized_at: DateTime<Utc>,
    ) -> Result<Option<Finalize>, PaymentError> {
        debug_assert!(status.is_terminal());

        let write_txn = self.db.begin_write().map_err(persistence)?;
        let outcome = {
            let refs = write_txn
                .open_table(PAYMENTS_BY_REFERENCE_TABLE)
                .map_err(persistence)?;
            let id = refs
                .get(reference)
                .map_err(persistence)?
                .map(|guard| guard.value().to_string());
            drop(refs);

            match id {
                None => None,
                Some(id) => {
                    let mut payments =
                        write_txn.open_table(PAYMENTS_TABLE).map_err(persistence)?;
                    let existing = match payments.get(id.as_str()).map_err(persistence)? {
                        Some(guard) => Some(
                            serde_json::from_slice::<PaymentRecord>(guard.value())
                                .map_err(persistence)?,
                        ),
                        None => None,
                    };

                    match existing {
                        // Index entry without a record; treat as unknown.
                        None => None,
                        Some(record) if record.status.is_terminal() => {
                            Some(Finalize::AlreadyFinal(record))
                        }
                        Some(mut record) => {
                            record.status = status;
                            if receipt.is_some() {
                                record.receipt = receipt;
                            }
                            record.finalized_at = Some(finalized_at);

                            let value = serde_json::to_vec(&record).map_err(persistence)?;
                            payments
                                .insert(id.as_str(), value.as_slice())
                                .map_err(persistence)?;
                            Some(Finalize::Applied(record))
                        }
                    }
                }
            }
        };
        write_txn.commit().map_err(persistence)?;

        if let Some(Finalize::Applied(record)) = &outcome {
            debug!(
                payment_id = %record.id,
                provider_reference = %record.provider_reference,
                status = record.status.as_str(),
                "Finalized payment record"
            );
        }
        Ok(outcome)
    }

    /// Insert-or-replace the subscription row for `sub.user_id`.
    pub fn upsert_subscription(&self, sub: &SubscriptionRecord) -> Result<(), PaymentError> {
        let value = serde_json::to_vec(sub).map_err(persistence)?;

        let write_txn = self.db.begin_write().map_err(persistence)?;
        {
            let mut subscriptions = write_txn
                .open_table(SUBSCRIPTIONS_TABLE)
                .map_err(persistence)?;
            subscriptions
                .insert(sub.user_id.as_str(), value.as_slice())
                .map_err(persistence)?;
        }
        write_txn.commit().map_err(persistence)?;

        debug!(
            user_id = %sub.user_id,
            tier = %sub.tier,
            period_end = %sub.period_end,
            "Upserted subscription"
        );
        Ok(())
    }

    pub fn get_subscription(
        &self,
        user_id: &str,
    ) -> Result<Option<SubscriptionRecord>, PaymentError> {
        let read_txn = self.db.begin_read().map_err(persistence)?;
        let subscriptions = read_txn
            .open_table(SUBSCRIPTIONS_TABLE)
            .map_err(persistence)?;

        match subscriptions.get(user_id).map_err(persistence)? {
            Some(guard) => {
                let sub = serde_json::from_slice(guard.value()).map_err(persistence)?;
                Ok(Some(sub))
            }
            None => Ok(None),
        }
    }

    #[cfg(test)]
    pub(crate) fn count_payments(&self) -> usize {
        let read_txn = self.db.begin_read().unwrap();
        let payments = read_txn.open_table(PAYMENTS_TABLE).unwrap();
        payments.iter().unwrap().count()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Store backed by a throwaway file under the system temp dir.
    pub(crate) fn temp_store() -> PaymentStore {
        let path = std::env::temp_dir().join(format!(
            "afya-payments-test-{}.redb",
            uuid::Uuid::new_v4().simple()
        ));
        PaymentStore::open(path).unwrap()
    }

    pub(crate) fn sample_record(reference: &str) -> PaymentRecord {
        PaymentRecord {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: "u1".to_string(),
            amount_minor_units: 799,
            currency: "KES".to_string(),
            method: crate::payments::types::PaymentMethod::Mpesa,
            status: PaymentStatus::Pending,
            provider: "mpesa".to_string(),
            provider_reference: reference.to_string(),
            subscription_tier: "Premium".to_string(),
            receipt: None,
            created_at: Utc::now(),
            finalized_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{sample_record, temp_store};
    use super::*;

    #[test]
    fn test_insert_and_lookup() {
        let store = temp_store();
        let record = sample_record("ws_CO_1");
        store.insert_payment(&record).unwrap();

        let by_id = store.get_payment(&record.id).unwrap().unwrap();
        assert_eq!(by_id.provider_reference, "ws_CO_1");

        let by_ref = store.get_payment_by_reference("ws_CO_1").unwrap().unwrap();
        assert_eq!(by_ref.id, record.id);
        assert_eq!(by_ref.status, PaymentStatus::Pending);

        assert!(store.get_payment_by_reference("ws_CO_other").unwrap().is_none());
    }

    #[test]
    fn test_finalize_applies_once() {
        let store = temp_store();
        let record = sample_record("ws_CO_2");
        store.insert_payment(&record).unwrap();

        let first = store
            .finalize_by_reference(
                "ws_CO_2",
                PaymentStatus::Completed,
                Some("NLJ7RT61SV".to_string()),
                Utc::now(),
            )
            .unwrap();
        let finalized = match first {
            Some(Finalize::Applied(r)) => r,
            other => panic!("expected Applied, got {:?}", other),
        };
        assert_eq!(finalized.status, PaymentStatus::Completed);
        assert_eq!(finalized.receipt.as_deref(), Some("NLJ7RT61SV"));
        assert!(finalized.finalized_at.is_some());

        // Second delivery, even with a contradictory status, changes nothing.
        let second = store
            .finalize_by_reference("ws_CO_2", PaymentStatus::Failed, None, Utc::now())
            .unwrap();
        let unchanged = match second {
            Some(Finalize::AlreadyFinal(r)) => r,
            other => panic!("expected AlreadyFinal, got {:?}", other),
        };
        assert_eq!(unchanged.status, PaymentStatus::Completed);
        assert_eq!(unchanged.receipt.as_deref(), Some("NLJ7RT61SV"));
    }

    #[test]
    fn test_finalize_unknown_reference() {
        let store = temp_store();
        let outcome = store
            .finalize_by_reference("ws_CO_missing", PaymentStatus::Completed, None, Utc::now())
            .unwrap();
        assert!(outcome.is_none());
    }

    #[test]
    fn test_subscription_upsert_replaces_row() {
        let store = temp_store();
        let first = SubscriptionRecord {
            user_id: "u1".to_string(),
            email: Some("u1@example.com".to_string()),
            tier: "Premium".to_string(),
            active: true,
            period_end: Utc::now(),
        };
        store.upsert_subscription(&first).unwrap();

        let later = first.period_end + chrono::Duration::days(40);
        let second = SubscriptionRecord {
            tier: "Family".to_string(),
            period_end: later,
            ..first.clone()
        };
        store.upsert_subscription(&second).unwrap();

        let stored = store.get_subscription("u1").unwrap().unwrap();
        assert_eq!(stored.tier, "Family");
        assert_eq!(stored.period_end, later);
        assert!(store.get_subscription("u2").unwrap().is_none());
    }
}
