//! Source side of a load: the file catalog, plan resolution, and chunked CSV reading

pub mod catalog;
pub mod reader;
pub mod resolver;

pub use catalog::{CatalogEntry, FileCatalog, FileDescriptor};
pub use reader::{Cell, Chunk, ChunkReader, ReadOptions, Row, RowIssue};
pub use resolver::{LoadPlan, PlannedFile, SkippedFile, resolve};
