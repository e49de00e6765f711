//! Entitlement Store
//!
//! Durable record of what each buyer owns. The store, not the caller,
//! enforces one entitlement per (buyer, item, payment reference).

use std::collections::HashMap;
use std::sync::RwLock;

use crate::entitlement::{Entitlement, EntitlementId, EntitlementKey};
use crate::error::{FulfillmentError, Result};

/// Result of an insert attempt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another row already holds this (buyer, item, payment) key
    Duplicate(EntitlementId),
}

/// Entitlement storage trait
pub trait EntitlementStore: Send + Sync {
    /// Insert a new entitlement, atomically with the uniqueness check
    fn insert(&self, entitlement: &Entitlement) -> Result<InsertOutcome>;

    /// Get entitlement by id
    fn get(&self, id: &EntitlementId) -> Result<Option<Entitlement>>;

    /// Overwrite an existing entitlement
    fn update(&self, entitlement: &Entitlement) -> Result<()>;

    /// Whether any entitlement came from this payment
    fn has_payment(&self, payment_reference: &str) -> Result<bool>;

    /// All entitlements created by one payment
    fn list_for_payment(&self, payment_reference: &str) -> Result<Vec<Entitlement>>;

    /// All entitlements owned by one buyer, oldest first
    fn list_for_buyer(&self, buyer_id: &str) -> Result<Vec<Entitlement>>;
}

#[derive(Default)]
struct Tables {
    rows: HashMap<EntitlementId, Entitlement>,
    by_key: HashMap<EntitlementKey, EntitlementId>,
}

/// In-memory entitlement store
#[derive(Default)]
pub struct MemoryEntitlementStore {
    tables: RwLock<Tables>,
}

impl MemoryEntitlementStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| FulfillmentError::Storage("entitlement table lock poisoned".into()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| FulfillmentError::Storage("entitlement table lock poisoned".into()))
    }

    fn collect<F>(&self, filter: F) -> Result<Vec<Entitlement>>
    where
        F: Fn(&Entitlement) -> bool,
    {
        let tables = self.read()?;
        let mut rows: Vec<Entitlement> =
            tables.rows.values().filter(|e| filter(e)).cloned().collect();
        rows.sort_by_key(|e| e.created_at);
        Ok(rows)
    }
}

impl EntitlementStore for MemoryEntitlementStore {
    fn insert(&self, entitlement: &Entitlement) -> Result<InsertOutcome> {
        let mut tables = self.write()?;
        let key = entitlement.key();

        if let Some(existing) = tables.by_key.get(&key) {
            return Ok(InsertOutcome::Duplicate(*existing));
        }

        tables.by_key.insert(key, entitlement.id);
        tables.rows.insert(entitlement.id, entitlement.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn get(&self, id: &EntitlementId) -> Result<Option<Entitlement>> {
        Ok(self.read()?.rows.get(id).cloned())
    }

    fn update(&self, entitlement: &Entitlement) -> Result<()> {
        let mut tables = self.write()?;
        match tables.rows.get_mut(&entitlement.id) {
            Some(row) => {
                *row = entitlement.clone();
                Ok(())
            }
            None => Err(FulfillmentError::NotFound(entitlement.id.to_string())),
        }
    }

    fn has_payment(&self, payment_reference: &str) -> Result<bool> {
        Ok(self
            .read()?
            .by_key
            .keys()
            .any(|k| k.payment_reference == payment_reference))
    }

    fn list_for_payment(&self, payment_reference: &str) -> Result<Vec<Entitlement>> {
        self.collect(|e| e.payment_reference == payment_reference)
    }

    fn list_for_buyer(&self, buyer_id: &str) -> Result<Vec<Entitlement>> {
        self.collect(|e| e.buyer_id == buyer_id)
    }
}

/// Buyer profile lookups: which source-control identity belongs to whom
pub trait BuyerDirectory: Send + Sync {
    fn identity(&self, buyer_id: &str) -> Result<Option<String>>;

    /// Link the buyer's external identity.
    ///
    /// Linking the same identity again is a no-op (logins compare
    /// case-insensitively); a different one is a `Conflict`.
    fn link_identity(&self, buyer_id: &str, username: &str) -> Result<()>;
}

/// In-memory buyer directory
#[derive(Default)]
pub struct MemoryBuyerDirectory {
    identities: RwLock<HashMap<String, String>>,
}

impl MemoryBuyerDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BuyerDirectory for MemoryBuyerDirectory {
    fn identity(&self, buyer_id: &str) -> Result<Option<String>> {
        let identities = self
            .identities
            .read()
            .map_err(|_| FulfillmentError::Storage("buyer directory lock poisoned".into()))?;
        Ok(identities.get(buyer_id).cloned())
    }

    fn link_identity(&self, buyer_id: &str, username: &str) -> Result<()> {
        let mut identities = self
            .identities
            .write()
            .map_err(|_| FulfillmentError::Storage("buyer directory lock poisoned".into()))?;
        match identities.get(buyer_id) {
            Some(linked) if linked.eq_ignore_ascii_case(username) => Ok(()),
            Some(linked) => Err(FulfillmentError::Conflict(format!(
                "buyer {buyer_id} is already linked to {linked}"
            ))),
            None => {
                identities.insert(buyer_id.to_string(), username.to_string());
                Ok(())
            }
        }
    }
}
