//! Static description of the Olist extracts: which file feeds which table, which columns are
//! timestamps, which table is deduplicated, and which tables reference which.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::db::schema::{MAX_IDENTIFIER_LEN, is_valid_identifier};
use crate::error::{LoadError, LoadResult};
use crate::normalize::normalize_column;

/// One known source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub file_name: String,
    /// Table used by the fixed-schema protocol
    pub table: String,
    #[serde(default)]
    pub timestamp_columns: Vec<String>,
    #[serde(default)]
    pub dedup_key: Option<String>,
    /// Tables (by `table` name) that must be loaded before this one
    #[serde(default)]
    pub depends_on: Vec<String>,
}

/// Everything the loader needs to know about one file it is about to load
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDescriptor {
    pub source_file_name: String,
    pub destination_table: String,
    pub timestamp_columns: Vec<String>,
    pub dedup_key: Option<String>,
}

impl FileDescriptor {
    /// Descriptor for a CSV the catalog does not know: plain text columns, table from the stem
    pub fn discovered(path: &Path) -> Option<Self> {
        Some(Self {
            source_file_name: path.file_name()?.to_str()?.to_string(),
            destination_table: table_name_from_stem(path)?,
            timestamp_columns: Vec::new(),
            dedup_key: None,
        })
    }
}

/// `olist_orders_dataset.csv` -> `olist_orders_dataset`
///
/// Any non-empty normalized stem Postgres would not truncate is accepted; table names are always
/// quoted, so leading digits and non-ASCII letters are fine.
pub fn table_name_from_stem(path: &Path) -> Option<String> {
    let stem = path.file_stem()?.to_str()?;
    let table = normalize_column(stem);
    (!table.is_empty() && table.len() <= MAX_IDENTIFIER_LEN).then_some(table)
}

/// Validated set of catalog entries
#[derive(Debug, Clone)]
pub struct FileCatalog {
    entries: Vec<CatalogEntry>,
    /// Entry indices, every referenced table before its referrers
    dependency_order: Vec<usize>,
}

impl FileCatalog {
    /// Validate entries: unique files and tables, valid identifiers, known dependencies, no
    /// cycles. Timestamp columns and dedup keys are stored normalized.
    pub fn new(entries: Vec<CatalogEntry>) -> LoadResult<Self> {
        let mut entries = entries;
        for entry in &mut entries {
            entry.timestamp_columns = entry
                .timestamp_columns
                .iter()
                .map(|c| normalize_column(c))
                .collect();
            entry.dedup_key = entry.dedup_key.as_deref().map(normalize_column);
        }

        let mut by_table: HashMap<&str, usize> = HashMap::new();
        let mut file_names = BTreeSet::new();
        for (idx, entry) in entries.iter().enumerate() {
            if !is_valid_identifier(&entry.table) {
                return Err(LoadError::Catalog(format!(
                    "'{}' is not a valid table name",
                    entry.table
                )));
            }
            if !file_names.insert(entry.file_name.as_str()) {
                return Err(LoadError::Catalog(format!(
                    "file '{}' is listed twice",
                    entry.file_name
                )));
            }
            if by_table.insert(entry.table.as_str(), idx).is_some() {
                return Err(LoadError::Catalog(format!(
                    "table '{}' is fed by more than one file",
                    entry.table
                )));
            }
        }

        let mut dependencies = Vec::with_capacity(entries.len());
        for entry in &entries {
            let mut deps = Vec::with_capacity(entry.depends_on.len());
            for dep in &entry.depends_on {
                let dep_idx = *by_table.get(dep.as_str()).ok_or_else(|| {
                    LoadError::Catalog(format!(
                        "table '{}' depends on unknown table '{}'",
                        entry.table, dep
                    ))
                })?;
                deps.push(dep_idx);
            }
            dependencies.push(deps);
        }

        let dependency_order = topological_order(&entries, &dependencies)?;

        Ok(Self {
            entries,
            dependency_order,
        })
    }

    /// The Olist e-commerce extracts
    pub fn olist() -> LoadResult<Self> {
        Self::new(olist_entries())
    }

    /// Load and validate a catalog from a JSON array of entries
    pub async fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read catalog file {}", path.display()))?;
        let entries: Vec<CatalogEntry> =
            serde_json::from_str(&content).context("Failed to parse catalog JSON")?;
        Ok(Self::new(entries)?)
    }

    /// Entries in declaration order
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// Entries with every referenced table ahead of the tables referencing it
    pub fn dependency_ordered(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.dependency_order.iter().map(|&idx| &self.entries[idx])
    }

    pub fn entry_for_table(&self, table: &str) -> Option<&CatalogEntry> {
        self.entries.iter().find(|e| e.table == table)
    }
}

/// Kahn's algorithm; among ready entries the earliest declared goes first so the order is stable
fn topological_order(entries: &[CatalogEntry], dependencies: &[Vec<usize>]) -> LoadResult<Vec<usize>> {
    let mut remaining: Vec<usize> = dependencies.iter().map(|d| d.len()).collect();
    let mut ready: BTreeSet<usize> = (0..entries.len()).filter(|&i| remaining[i] == 0).collect();
    let mut order = Vec::with_capacity(entries.len());

    while let Some(idx) = ready.pop_first() {
        order.push(idx);
        for (dependent, deps) in dependencies.iter().enumerate() {
            let edges = deps.iter().filter(|&&d| d == idx).count();
            if edges > 0 {
                remaining[dependent] -= edges;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() != entries.len() {
        let stuck: Vec<&str> = (0..entries.len())
            .filter(|i| !order.contains(i))
            .map(|i| entries[i].table.as_str())
            .collect();
        return Err(LoadError::Catalog(format!(
            "dependency cycle among tables: {}",
            stuck.join(", ")
        )));
    }

    Ok(order)
}

fn entry(
    file_name: &str,
    table: &str,
    timestamp_columns: &[&str],
    dedup_key: Option<&str>,
    depends_on: &[&str],
) -> CatalogEntry {
    CatalogEntry {
        file_name: file_name.to_string(),
        table: table.to_string(),
        timestamp_columns: timestamp_columns.iter().map(|s| s.to_string()).collect(),
        dedup_key: dedup_key.map(String::from),
        depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
    }
}

fn olist_entries() -> Vec<CatalogEntry> {
    vec![
        entry("olist_customers_dataset.csv", "customers", &[], None, &[]),
        entry("olist_geolocation_dataset.csv", "geolocation", &[], None, &[]),
        entry(
            "olist_orders_dataset.csv",
            "orders",
            &[
                "order_purchase_timestamp",
                "order_approved_at",
                "order_delivered_carrier_date",
                "order_delivered_customer_date",
                "order_estimated_delivery_date",
            ],
            None,
            &["customers"],
        ),
        entry(
            "olist_order_items_dataset.csv",
            "order_items",
            &[],
            None,
            &["orders", "products", "sellers"],
        ),
        entry(
            "olist_order_payments_dataset.csv",
            "order_payments",
            &[],
            None,
            &["orders"],
        ),
        entry(
            "olist_order_reviews_dataset.csv",
            "order_reviews",
            &["review_creation_date", "review_answer_timestamp"],
            Some("review_id"),
            &["orders"],
        ),
        entry("olist_products_dataset.csv", "products", &[], None, &[]),
        entry("olist_sellers_dataset.csv", "sellers", &[], None, &[]),
        entry(
            "product_category_name_translation.csv",
            "product_category_name_translation",
            &[],
            None,
            &[],
        ),
    ]
}
