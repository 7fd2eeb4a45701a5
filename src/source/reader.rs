use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use encoding_rs::Encoding;
use serde::Serialize;
use tokio::sync::mpsc;

use crate::config::{MAX_RECORDED_ISSUES, PIPELINE_DEPTH};
use crate::error::{LoadError, LoadResult};
use crate::normalize::normalize_header;

/// One cell of a source row
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// Raw text, an empty cell stays an empty string
    Text(String),
    /// A value from a declared timestamp column
    Timestamp(NaiveDateTime),
    /// Empty or unparseable timestamp cell
    Absent,
}

impl std::fmt::Display for Cell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cell::Text(value) => f.write_str(value),
            Cell::Timestamp(ts) => write!(f, "{}", ts),
            Cell::Absent => f.write_str("NULL"),
        }
    }
}

pub type Row = Vec<Cell>;

/// A timestamp cell that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowIssue {
    pub line: u64,
    pub column: String,
    pub value: String,
}

/// A bounded slice of rows from one source file
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    /// Normalized header, shared by every chunk of the file
    pub header: Arc<Vec<String>>,
    pub rows: Vec<Row>,
    /// First few timestamp parse failures in this chunk
    pub issues: Vec<RowIssue>,
    pub issue_count: u64,
}

/// Configuration for delimited file reading
#[derive(Debug, Clone, Copy)]
pub struct DelimitedConfig {
    pub delimiter: u8,
    pub quote: u8,
}

impl Default for DelimitedConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            quote: b'"',
        }
    }
}

impl DelimitedConfig {
    pub fn csv() -> Self {
        Self::default()
    }

    pub(crate) fn reader_builder(&self) -> csv::ReaderBuilder {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .delimiter(self.delimiter)
            .quote(self.quote)
            // Header is read as the first record so it can be decoded like any other row
            .has_headers(false);
        builder
    }
}

/// How one file is read into chunks
#[derive(Debug, Clone)]
pub struct ReadOptions {
    pub chunk_size: usize,
    pub encoding: &'static Encoding,
    /// Normalized names of columns parsed as timestamps
    pub timestamp_columns: Vec<String>,
    pub delimited: DelimitedConfig,
}

/// Lazily reads a CSV source as fixed-size chunks of decoded rows
pub struct ChunkReader<R: Read> {
    records: csv::Reader<R>,
    options: ReadOptions,
    raw_header: Vec<String>,
    header: Arc<Vec<String>>,
    timestamp_indices: Vec<usize>,
    next_index: usize,
    finished: bool,
}

impl ChunkReader<File> {
    pub fn open(path: &Path, options: ReadOptions) -> LoadResult<Self> {
        let file = File::open(path).map_err(|e| LoadError::io(path, e))?;
        Self::new(file, options)
    }
}

impl<R: Read> ChunkReader<R> {
    /// Read and validate the header row
    pub fn new(source: R, options: ReadOptions) -> LoadResult<Self> {
        let mut records = options.delimited.reader_builder().from_reader(source);

        let mut header_record = csv::ByteRecord::new();
        if !records.read_byte_record(&mut header_record)? {
            return Err(LoadError::EmptyFile);
        }

        let mut raw_header = decode_record(&header_record, options.encoding)?;
        if let Some(first) = raw_header.first_mut()
            && let Some(stripped) = first.strip_prefix('\u{feff}')
        {
            *first = stripped.to_string();
        }

        let header = normalize_header(&raw_header);
        let timestamp_indices = options
            .timestamp_columns
            .iter()
            .map(|column| {
                header
                    .iter()
                    .position(|h| h == column)
                    .ok_or_else(|| LoadError::MissingColumn {
                        column: column.clone(),
                    })
            })
            .collect::<LoadResult<Vec<_>>>()?;

        Ok(Self {
            records,
            options,
            raw_header,
            header: Arc::new(header),
            timestamp_indices,
            next_index: 0,
            finished: false,
        })
    }

    pub fn header(&self) -> &Arc<Vec<String>> {
        &self.header
    }

    /// Header exactly as it appears in the file (decoded, BOM removed)
    pub fn raw_header(&self) -> &[String] {
        &self.raw_header
    }

    /// Read the next chunk; a header-only file yields a single empty chunk
    pub fn next_chunk(&mut self) -> LoadResult<Option<Chunk>> {
        if self.finished {
            return Ok(None);
        }

        let mut chunk = Chunk {
            index: self.next_index,
            header: Arc::clone(&self.header),
            rows: Vec::with_capacity(self.options.chunk_size.min(8192)),
            issues: Vec::new(),
            issue_count: 0,
        };

        let mut record = csv::ByteRecord::new();
        while chunk.rows.len() < self.options.chunk_size {
            if !self.records.read_byte_record(&mut record)? {
                self.finished = true;
                break;
            }
            let row = self.decode_row(&record, &mut chunk)?;
            chunk.rows.push(row);
        }

        if chunk.rows.is_empty() && self.next_index > 0 {
            return Ok(None);
        }

        self.next_index += 1;
        Ok(Some(chunk))
    }

    fn decode_row(&self, record: &csv::ByteRecord, chunk: &mut Chunk) -> LoadResult<Row> {
        let line = record.position().map(|p| p.line()).unwrap_or(0);
        let mut row = Vec::with_capacity(record.len());

        for (idx, bytes) in record.iter().enumerate() {
            let text = decode_field(bytes, self.options.encoding, line)?;

            if !self.timestamp_indices.contains(&idx) {
                row.push(Cell::Text(text));
                continue;
            }

            let trimmed = text.trim();
            if trimmed.is_empty() {
                row.push(Cell::Absent);
            } else if let Some(ts) = parse_timestamp(trimmed) {
                row.push(Cell::Timestamp(ts));
            } else {
                chunk.issue_count += 1;
                if chunk.issues.len() < MAX_RECORDED_ISSUES {
                    chunk.issues.push(RowIssue {
                        line,
                        column: self.header[idx].clone(),
                        value: text.clone(),
                    });
                }
                row.push(Cell::Absent);
            }
        }

        Ok(row)
    }
}

impl<R: Read> Iterator for ChunkReader<R> {
    type Item = LoadResult<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Read a file on a blocking thread, handing chunks to the async writer as they fill
///
/// The channel holds at most [`PIPELINE_DEPTH`] chunks, so the reader runs at most one chunk
/// ahead of the writer. Dropping the receiver stops the reader at the next chunk.
pub fn spawn_chunk_reader(
    path: PathBuf,
    options: ReadOptions,
) -> mpsc::Receiver<LoadResult<Chunk>> {
    let (tx, rx) = mpsc::channel(PIPELINE_DEPTH);

    tokio::task::spawn_blocking(move || {
        let reader = match ChunkReader::open(&path, options) {
            Ok(reader) => reader,
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        };

        for item in reader {
            if tx.blocking_send(item).is_err() {
                tracing::debug!(file = %path.display(), "chunk consumer went away, stopping reader");
                return;
            }
        }
    });

    rx
}

/// Parse a timestamp cell, accepting datetime and bare date forms
pub fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    const DATETIME_FORMATS: [&str; 6] = [
        "%Y-%m-%d %H:%M:%S",    // 2017-10-02 10:56:33
        "%Y-%m-%dT%H:%M:%S",    // ISO 8601
        "%Y-%m-%d %H:%M:%S%.f", // With fractional seconds
        "%Y-%m-%dT%H:%M:%S%.f", // ISO 8601 with fractional seconds
        "%Y-%m-%d %H:%M",       // Without seconds
        "%Y-%m-%dT%H:%M",       // ISO 8601 without seconds
    ];

    for format in &DATETIME_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(value, format) {
            return Some(ts);
        }
    }

    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn decode_field(bytes: &[u8], encoding: &'static Encoding, line: u64) -> LoadResult<String> {
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|s| s.into_owned())
        .ok_or(LoadError::Encoding {
            line,
            encoding: encoding.name(),
        })
}

pub(crate) fn decode_record(
    record: &csv::ByteRecord,
    encoding: &'static Encoding,
) -> LoadResult<Vec<String>> {
    let line = record.position().map(|p| p.line()).unwrap_or(0);
    record
        .iter()
        .map(|bytes| decode_field(bytes, encoding, line))
        .collect()
}
