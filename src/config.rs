//! Configuration for the loader
//!
//! Tunable constants live at the top; [`LoadJobConfig`] is the per-invocation, read-only
//! configuration handed to the coordinator.

use std::path::PathBuf;
use std::time::Duration;

use derive_builder::Builder;
use encoding_rs::Encoding;

use crate::db::schema::is_valid_identifier;

// ============================================================================
// Connection Pool Configuration
// ============================================================================

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(45);

pub const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);

/// Attempts to obtain a connection before a file's load is given up
pub const MAX_ACQUIRE_RETRIES: u32 = 5;

// ============================================================================
// Load Configuration
// ============================================================================

/// Rows per chunk read from a source file
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// Rows per INSERT statement inside one chunk write
pub const DEFAULT_INSERT_BATCH_ROWS: usize = 2000;

/// Postgres refuses statements with more bind parameters than this
pub const MAX_BIND_PARAMS: usize = 65_535;

/// Timeout for individual store operations
///
/// Set to 3 minutes because a 100k-row chunk append or a whole-file COPY can take a while on a
/// busy server; anything longer is treated as a hung connection.
pub const STATEMENT_TIMEOUT: Duration = Duration::from_secs(180);

/// Chunks buffered between the reader task and the writer
///
/// One chunk in flight while the previous one is being written keeps memory at roughly two
/// chunks per file regardless of file size.
pub const PIPELINE_DEPTH: usize = 1;

/// Buffer used when streaming raw file bytes into COPY
pub const COPY_BUFFER_SIZE: usize = 256 * 1024; // 256 KB

/// Row issues kept verbatim per file; the rest are only counted
pub const MAX_RECORDED_ISSUES: usize = 20;

/// Rows shown per file by `--preview` when no count is given
pub const DEFAULT_PREVIEW_ROWS: usize = 5;

pub const DEFAULT_SCHEMA: &str = "olist_raw";

/// Which write protocol (and matching resolution strategy) a batch uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadMode {
    /// Discover files, recreate each table from its first chunk, append the rest
    #[default]
    AutoCreate,
    /// Catalog files only, dependency ordered, COPY into pre-provisioned tables
    FixedSchema,
}

impl LoadMode {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "auto-create" | "auto" => Ok(LoadMode::AutoCreate),
            "fixed-schema" | "fixed" => Ok(LoadMode::FixedSchema),
            _ => Err(anyhow::anyhow!(
                "Unsupported load mode: {}. Supported modes: auto-create, fixed-schema",
                s
            )),
        }
    }
}

/// Resolve a user supplied encoding label ("utf-8", "latin1", "cp1252", ...)
///
/// Only ASCII-compatible encodings (UTF-8 and the single-byte code pages) are accepted: the CSV
/// parser splits on raw `,`, `"` and newline bytes.
pub fn encoding_from_label(label: &str) -> anyhow::Result<&'static Encoding> {
    let encoding = Encoding::for_label(label.trim().as_bytes())
        .ok_or_else(|| anyhow::anyhow!("Unknown text encoding: {}", label))?;
    if !encoding.is_ascii_compatible() {
        anyhow::bail!(
            "Unsupported text encoding: {} ({}). Use UTF-8 or a single-byte encoding such as latin1",
            label,
            encoding.name()
        );
    }
    Ok(encoding)
}

/// Read-only configuration for one load batch
#[derive(Debug, Clone, Builder)]
#[builder(build_fn(validate = "Self::validate"))]
pub struct LoadJobConfig {
    #[builder(setter(into))]
    pub source_directory: PathBuf,
    #[builder(setter(into), default = "DEFAULT_SCHEMA.to_string()")]
    pub schema: String,
    #[builder(default = "DEFAULT_CHUNK_SIZE")]
    pub chunk_size: usize,
    #[builder(default = "encoding_rs::UTF_8")]
    pub encoding: &'static Encoding,
    #[builder(default)]
    pub mode: LoadMode,
    #[builder(default = "1")]
    pub worker_count: usize,
    #[builder(default = "DEFAULT_INSERT_BATCH_ROWS")]
    pub insert_batch_rows: usize,
    #[builder(default = "STATEMENT_TIMEOUT")]
    pub statement_timeout: Duration,
    #[builder(default)]
    pub quiet: bool,
}

impl LoadJobConfigBuilder {
    fn validate(&self) -> Result<(), String> {
        if self.chunk_size == Some(0) {
            return Err("chunk_size must be positive".to_string());
        }
        if self.worker_count == Some(0) {
            return Err("worker_count must be positive".to_string());
        }
        if self.insert_batch_rows == Some(0) {
            return Err("insert_batch_rows must be positive".to_string());
        }
        if let Some(encoding) = self.encoding
            && !encoding.is_ascii_compatible()
        {
            return Err(format!("{} is not an ASCII-compatible encoding", encoding.name()));
        }
        if let Some(schema) = &self.schema
            && !is_valid_identifier(schema)
        {
            return Err(format!("'{}' is not a valid schema name", schema));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = LoadJobConfigBuilder::default()
            .source_directory("/data/olist")
            .build()
            .unwrap();

        assert_eq!(config.schema, "olist_raw");
        assert_eq!(config.chunk_size, 100_000);
        assert_eq!(config.encoding, encoding_rs::UTF_8);
        assert_eq!(config.mode, LoadMode::AutoCreate);
        assert_eq!(config.worker_count, 1);
        assert!(!config.quiet);
    }

    #[test]
    fn test_builder_rejects_zero_chunk_size() {
        let result = LoadJobConfigBuilder::default()
            .source_directory("/data")
            .chunk_size(0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_builder_rejects_bad_schema() {
        let result = LoadJobConfigBuilder::default()
            .source_directory("/data")
            .schema("raw; DROP TABLE x")
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_encoding_labels() {
        assert_eq!(encoding_from_label("utf-8").unwrap(), encoding_rs::UTF_8);
        assert_eq!(
            encoding_from_label("latin1").unwrap(),
            encoding_rs::WINDOWS_1252
        );
        assert!(encoding_from_label("klingon").is_err());
    }

    #[test]
    fn test_two_byte_encodings_rejected() {
        for label in ["utf-16le", "utf-16be", "UTF-16"] {
            let err = encoding_from_label(label).unwrap_err();
            assert!(
                err.to_string().contains("Unsupported text encoding"),
                "{}: {}",
                label,
                err
            );
        }
        assert!(encoding_from_label("iso-8859-2").is_ok());

        let result = LoadJobConfigBuilder::default()
            .source_directory("/data")
            .encoding(encoding_rs::UTF_16LE)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_load_mode_parse() {
        assert_eq!(LoadMode::parse("auto-create").unwrap(), LoadMode::AutoCreate);
        assert_eq!(LoadMode::parse("FIXED_SCHEMA").unwrap(), LoadMode::FixedSchema);
        assert!(LoadMode::parse("merge").is_err());
    }
}
