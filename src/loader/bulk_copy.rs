//! Pre-provisioned-table protocol: stream the file into an existing table with one server-side
//! bulk copy.
//!
//! Files with a dedup key, or in an encoding the server cannot name, are decoded and re-encoded
//! as UTF-8 CSV before the copy.

use std::path::Path;
use std::time::Instant;

use encoding_rs::Encoding;
use tokio::io::BufReader;
use tracing::{debug, info};

use super::{Deduplicator, FileStats, LoadContext};
use crate::config::COPY_BUFFER_SIZE;
use crate::db::StoreTransaction;
use crate::db::schema::{CopyOptions, postgres_encoding_name};
use crate::error::{LoadError, LoadResult};
use crate::source::reader::{Cell, ChunkReader, DelimitedConfig};
use crate::source::{PlannedFile, ReadOptions};

/// Rows per read while re-encoding; the whole payload is held in memory regardless
const REWRITE_READ_ROWS: usize = 50_000;

pub(super) async fn write_file(
    ctx: &LoadContext,
    file: &PlannedFile,
    tx: &mut dyn StoreTransaction,
) -> LoadResult<FileStats> {
    let descriptor = &file.descriptor;
    let table = ctx.table_for(descriptor);
    let server_encoding = postgres_encoding_name(ctx.config.encoding);

    if ctx.cancel.is_cancelled() {
        return Err(LoadError::Cancelled);
    }

    let mut options = CopyOptions {
        header: true,
        encoding: server_encoding,
        force_not_null: tx.text_columns(&table).await?,
    };
    let started = Instant::now();
    let mut stats = FileStats::default();

    let copied = if descriptor.dedup_key.is_some() || server_encoding.is_none() {
        let path = file.path.clone();
        let encoding = ctx.config.encoding;
        let key = descriptor.dedup_key.clone();
        let rewritten =
            tokio::task::spawn_blocking(move || rewrite_as_utf8(&path, encoding, key.as_deref()))
                .await
                .map_err(|e| LoadError::Panicked(e.to_string()))??;

        stats.duplicates_dropped = rewritten.duplicates_dropped;
        options.encoding = None;
        let mut payload: &[u8] = &rewritten.payload;
        tx.copy_from(&table, &options, &file.path, &mut payload).await?
    } else {
        let source = tokio::fs::File::open(&file.path)
            .await
            .map_err(|e| LoadError::io(&file.path, e))?;
        let mut source = BufReader::with_capacity(COPY_BUFFER_SIZE, source);
        tx.copy_from(&table, &options, &file.path, &mut source).await?
    };

    stats.rows_loaded = copied;
    stats.chunks_written = 1;
    ctx.chunk_written(copied, started);
    info!(
        table = %table,
        rows = copied,
        duplicates_dropped = stats.duplicates_dropped,
        "bulk copy finished"
    );
    Ok(stats)
}

struct Rewritten {
    payload: Vec<u8>,
    duplicates_dropped: u64,
}

/// Decode the file, keep the first row per key, and write it back out as UTF-8 CSV
fn rewrite_as_utf8(
    path: &Path,
    encoding: &'static Encoding,
    dedup_key: Option<&str>,
) -> LoadResult<Rewritten> {
    let options = ReadOptions {
        chunk_size: REWRITE_READ_ROWS,
        encoding,
        timestamp_columns: Vec::new(),
        delimited: DelimitedConfig::csv(),
    };
    let mut reader = ChunkReader::open(path, options)?;
    let mut dedup = Deduplicator::for_header(dedup_key, reader.header())?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(reader.raw_header())?;

    let mut rows = 0u64;
    while let Some(chunk) = reader.next_chunk()? {
        for row in dedup.retain(chunk.rows) {
            writer.write_record(row.iter().map(|cell| match cell {
                Cell::Text(value) => value.as_str(),
                _ => "",
            }))?;
            rows += 1;
        }
    }

    let payload = writer
        .into_inner()
        .map_err(|e| LoadError::io(path, e.into_error()))?;
    debug!(file = %path.display(), rows, bytes = payload.len(), "re-encoded file for copy");

    Ok(Rewritten {
        payload,
        duplicates_dropped: dedup.dropped(),
    })
}
