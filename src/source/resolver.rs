use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use super::catalog::{CatalogEntry, FileCatalog, FileDescriptor};
use crate::config::LoadMode;

const CSV_EXTENSION: &str = "csv";

/// A file the coordinator will load
#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub path: PathBuf,
    pub descriptor: FileDescriptor,
    /// Plan positions that must settle before this file starts
    pub depends_on: Vec<usize>,
}

/// A file that resolution decided not to load, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedFile {
    pub file_name: String,
    pub reason: String,
}

/// Ordered, duplicate-free list of files to load
#[derive(Debug, Clone, Default)]
pub struct LoadPlan {
    pub files: Vec<PlannedFile>,
    pub skipped: Vec<SkippedFile>,
}

impl LoadPlan {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Resolve the plan matching a load mode
pub fn resolve(dir: &Path, catalog: &FileCatalog, mode: LoadMode) -> LoadPlan {
    match mode {
        LoadMode::AutoCreate => resolve_auto_discovery(dir, catalog),
        LoadMode::FixedSchema => resolve_dependency_ordered(dir, catalog),
    }
}

/// Catalog files that exist, in declaration order, then every other `*.csv` in name order
///
/// Tables are named after the file stem. A missing or empty directory gives an empty plan.
pub fn resolve_auto_discovery(dir: &Path, catalog: &FileCatalog) -> LoadPlan {
    let mut plan = LoadPlan::default();
    let mut seen_files: HashSet<PathBuf> = HashSet::new();
    let mut seen_tables: HashSet<String> = HashSet::new();

    for entry in catalog.entries() {
        let path = dir.join(&entry.file_name);
        if path.is_file() {
            let descriptor = FileDescriptor::discovered(&path).map(|d| with_catalog_rules(d, entry));
            admit(&mut plan, &mut seen_tables, &mut seen_files, path, descriptor);
        }
    }

    for path in list_csv_files(dir) {
        if seen_files.contains(&path) {
            continue;
        }
        let descriptor = FileDescriptor::discovered(&path);
        admit(&mut plan, &mut seen_tables, &mut seen_files, path, descriptor);
    }

    debug!(
        files = plan.files.len(),
        skipped = plan.skipped.len(),
        "resolved auto-discovery plan"
    );
    plan
}

/// Catalog files only, referenced tables before referencing ones
///
/// Tables are the catalog's table names. Files absent from disk are recorded as skipped and
/// their dependency edges dropped.
pub fn resolve_dependency_ordered(dir: &Path, catalog: &FileCatalog) -> LoadPlan {
    let mut plan = LoadPlan::default();
    let mut position_of_table: HashMap<&str, usize> = HashMap::new();

    for entry in catalog.dependency_ordered() {
        let path = dir.join(&entry.file_name);
        if !path.is_file() {
            warn!(file = %entry.file_name, "catalog file not found, skipping");
            plan.skipped.push(SkippedFile {
                file_name: entry.file_name.clone(),
                reason: format!("not found in {}", dir.display()),
            });
            continue;
        }

        let depends_on = entry
            .depends_on
            .iter()
            .filter_map(|table| position_of_table.get(table.as_str()).copied())
            .collect();

        position_of_table.insert(entry.table.as_str(), plan.files.len());
        plan.files.push(PlannedFile {
            path,
            descriptor: FileDescriptor {
                source_file_name: entry.file_name.clone(),
                destination_table: entry.table.clone(),
                timestamp_columns: entry.timestamp_columns.clone(),
                dedup_key: entry.dedup_key.clone(),
            },
            depends_on,
        });
    }

    plan
}

fn admit(
    plan: &mut LoadPlan,
    seen_tables: &mut HashSet<String>,
    seen_files: &mut HashSet<PathBuf>,
    path: PathBuf,
    descriptor: Option<FileDescriptor>,
) {
    let file_name = display_name(&path);
    let Some(descriptor) = descriptor else {
        plan.skipped.push(SkippedFile {
            file_name,
            reason: "file stem is not usable as a table name".to_string(),
        });
        return;
    };
    if !seen_tables.insert(descriptor.destination_table.clone()) {
        plan.skipped.push(SkippedFile {
            file_name,
            reason: format!(
                "table '{}' is already loaded from another file",
                descriptor.destination_table
            ),
        });
        return;
    }
    seen_files.insert(path.clone());
    plan.files.push(PlannedFile {
        path,
        descriptor,
        depends_on: Vec::new(),
    });
}

fn with_catalog_rules(descriptor: FileDescriptor, entry: &CatalogEntry) -> FileDescriptor {
    FileDescriptor {
        timestamp_columns: entry.timestamp_columns.clone(),
        dedup_key: entry.dedup_key.clone(),
        ..descriptor
    }
}

/// Regular `*.csv` files directly inside `dir`, sorted by name
fn list_csv_files(dir: &Path) -> Vec<PathBuf> {
    let Ok(read_dir) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    let mut paths: Vec<PathBuf> = read_dir
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == CSV_EXTENSION))
        .collect();
    paths.sort();
    paths
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &TempDir, name: &str) {
        std::fs::write(dir.path().join(name), "id\n1\n").unwrap();
    }

    fn names(plan: &LoadPlan) -> Vec<&str> {
        plan.files
            .iter()
            .map(|f| f.descriptor.source_file_name.as_str())
            .collect()
    }

    #[test]
    fn test_auto_discovery_catalog_first_then_sorted_extras() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "zeta_extra.csv");
        touch(&dir, "olist_products_dataset.csv");
        touch(&dir, "alpha_extra.csv");
        touch(&dir, "olist_customers_dataset.csv");
        touch(&dir, "notes.txt");
        std::fs::create_dir(dir.path().join("nested.csv")).unwrap();

        let catalog = FileCatalog::olist().unwrap();
        let plan = resolve_auto_discovery(dir.path(), &catalog);

        assert_eq!(
            names(&plan),
            vec![
                "olist_customers_dataset.csv",
                "olist_products_dataset.csv",
                "alpha_extra.csv",
                "zeta_extra.csv",
            ]
        );
        assert_eq!(
            plan.files[0].descriptor.destination_table,
            "olist_customers_dataset"
        );
        assert!(plan.files.iter().all(|f| f.depends_on.is_empty()));
    }

    #[test]
    fn test_auto_discovery_keeps_catalog_rules() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "olist_orders_dataset.csv");
        let catalog = FileCatalog::olist().unwrap();
        let plan = resolve_auto_discovery(dir.path(), &catalog);

        let orders = &plan.files[0].descriptor;
        assert_eq!(orders.destination_table, "olist_orders_dataset");
        assert_eq!(orders.timestamp_columns.len(), 5);
    }

    #[test]
    fn test_auto_discovery_skips_blank_stems_and_table_clashes() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "  .csv");
        touch(&dir, "Sales.csv");
        touch(&dir, "sales.csv");
        let catalog = FileCatalog::olist().unwrap();
        let plan = resolve_auto_discovery(dir.path(), &catalog);

        assert_eq!(names(&plan), vec!["Sales.csv"]);
        assert_eq!(plan.skipped.len(), 2);
    }

    #[test]
    fn test_auto_discovery_admits_digit_leading_and_non_ascii_stems() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "2018_sales.csv");
        touch(&dir, "vendas_região.csv");
        let catalog = FileCatalog::olist().unwrap();
        let plan = resolve_auto_discovery(dir.path(), &catalog);

        let tables: Vec<&str> = plan
            .files
            .iter()
            .map(|f| f.descriptor.destination_table.as_str())
            .collect();
        assert_eq!(tables, vec!["2018_sales", "vendas_região"]);
        assert!(plan.skipped.is_empty());
    }

    #[test]
    fn test_missing_or_empty_directory_gives_empty_plan() {
        let catalog = FileCatalog::olist().unwrap();
        let missing = resolve_auto_discovery(Path::new("/definitely/not/here"), &catalog);
        assert!(missing.is_empty());

        let dir = TempDir::new().unwrap();
        let empty = resolve(dir.path(), &catalog, LoadMode::FixedSchema);
        assert!(empty.is_empty());
        assert_eq!(empty.skipped.len(), 9);
    }

    #[test]
    fn test_dependency_order_and_edges() {
        let dir = TempDir::new().unwrap();
        for entry in FileCatalog::olist().unwrap().entries() {
            touch(&dir, &entry.file_name);
        }
        touch(&dir, "extra.csv");

        let catalog = FileCatalog::olist().unwrap();
        let plan = resolve_dependency_ordered(dir.path(), &catalog);
        let tables: Vec<&str> = plan
            .files
            .iter()
            .map(|f| f.descriptor.destination_table.as_str())
            .collect();

        // Only catalog files, under catalog table names
        assert_eq!(tables.len(), 9);
        assert!(!tables.contains(&"extra"));

        let pos = |t: &str| tables.iter().position(|x| *x == t).unwrap();
        assert!(pos("customers") < pos("orders"));
        assert!(pos("orders") < pos("order_items"));
        assert!(pos("products") < pos("order_items"));
        assert!(pos("sellers") < pos("order_items"));
        assert!(pos("orders") < pos("order_reviews"));

        let items = &plan.files[pos("order_items")];
        let mut deps: Vec<&str> = items
            .depends_on
            .iter()
            .map(|&i| tables[i])
            .collect();
        deps.sort();
        assert_eq!(deps, vec!["orders", "products", "sellers"]);

        for (idx, file) in plan.files.iter().enumerate() {
            assert!(file.depends_on.iter().all(|&d| d < idx));
        }
    }

    #[test]
    fn test_dependency_order_records_missing_files() {
        let dir = TempDir::new().unwrap();
        touch(&dir, "olist_orders_dataset.csv");
        touch(&dir, "olist_order_reviews_dataset.csv");

        let catalog = FileCatalog::olist().unwrap();
        let plan = resolve_dependency_ordered(dir.path(), &catalog);

        assert_eq!(
            names(&plan),
            vec!["olist_orders_dataset.csv", "olist_order_reviews_dataset.csv"]
        );
        // customers is missing, so orders has no edge left; reviews still waits for orders
        assert!(plan.files[0].depends_on.is_empty());
        assert_eq!(plan.files[1].depends_on, vec![0]);
        assert_eq!(plan.files[1].descriptor.dedup_key.as_deref(), Some("review_id"));
        assert_eq!(plan.skipped.len(), 7);
        assert!(plan.skipped.iter().any(|s| s.file_name == "olist_customers_dataset.csv"));
    }
}
