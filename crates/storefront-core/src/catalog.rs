//! Catalog Lookup
//!
//! Read-only item metadata consulted during fulfillment.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FulfillmentError, Result};

/// Published item metadata
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub id: String,
    pub name: String,

    /// List price, in minor units
    pub price_cents: i64,

    #[serde(default = "default_currency")]
    pub currency: String,

    /// Private repository the buyer gets read access to, if any
    #[serde(default)]
    pub repository: Option<String>,
}

fn default_currency() -> String {
    "usd".into()
}

impl CatalogItem {
    pub fn requires_grant(&self) -> bool {
        self.repository.is_some()
    }
}

/// Item metadata source
pub trait Catalog: Send + Sync {
    fn item(&self, id: &str) -> Option<CatalogItem>;
}

/// Catalog held in memory
#[derive(Clone, Debug, Default)]
pub struct StaticCatalog {
    items: HashMap<String, CatalogItem>,
}

impl StaticCatalog {
    pub fn new(items: impl IntoIterator<Item = CatalogItem>) -> Self {
        Self {
            items: items.into_iter().map(|i| (i.id.clone(), i)).collect(),
        }
    }

    /// Load from a JSON array of items
    pub fn from_json(json: &str) -> Result<Self> {
        let items: Vec<CatalogItem> = serde_json::from_str(json)?;
        Ok(Self::new(items))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            FulfillmentError::Config(format!("cannot read catalog {}: {e}", path.display()))
        })?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl Catalog for StaticCatalog {
    fn item(&self, id: &str) -> Option<CatalogItem> {
        self.items.get(id).cloned()
    }
}
