//! Derived-table protocol: replace the table from the file's header, then append it chunk by
//! chunk. Reading the next chunk overlaps with writing the current one.

use std::time::Instant;

use tracing::{debug, info};

use super::{Deduplicator, FileStats, LoadContext};
use crate::db::{StoreTransaction, TableName, TableSchema};
use crate::error::{LoadError, LoadResult};
use crate::source::reader::{DelimitedConfig, spawn_chunk_reader};
use crate::source::{Chunk, PlannedFile, ReadOptions};

pub(super) async fn write_file(
    ctx: &LoadContext,
    file: &PlannedFile,
    tx: &mut dyn StoreTransaction,
) -> LoadResult<FileStats> {
    let descriptor = &file.descriptor;
    let table = ctx.table_for(descriptor);
    let options = ReadOptions {
        chunk_size: ctx.config.chunk_size,
        encoding: ctx.config.encoding,
        timestamp_columns: descriptor.timestamp_columns.clone(),
        delimited: DelimitedConfig::csv(),
    };

    let mut chunks = spawn_chunk_reader(file.path.clone(), options);
    let mut stats = FileStats::default();

    // The reader yields at least one chunk for any file with a header
    let Some(first) = chunks.recv().await else {
        return Ok(stats);
    };
    let first = first?;

    let schema = TableSchema::from_header(&first.header, &descriptor.timestamp_columns);
    let mut dedup = Deduplicator::for_header(descriptor.dedup_key.as_deref(), &first.header)?;

    check_cancelled(ctx)?;
    tx.replace_table(&table, &schema).await?;
    info!(table = %table, columns = schema.columns.len(), "replaced destination table");

    write_chunk(ctx, tx, &table, &schema, &mut dedup, first, &mut stats).await?;

    while let Some(chunk) = chunks.recv().await {
        let chunk = chunk?;
        if !schema.matches_header(&chunk.header) {
            return Err(LoadError::HeaderMismatch {
                chunk: chunk.index,
                expected: schema.column_names().map(String::from).collect(),
                found: chunk.header.to_vec(),
            });
        }
        check_cancelled(ctx)?;
        write_chunk(ctx, tx, &table, &schema, &mut dedup, chunk, &mut stats).await?;
    }

    stats.duplicates_dropped = dedup.dropped();
    Ok(stats)
}

async fn write_chunk(
    ctx: &LoadContext,
    tx: &mut dyn StoreTransaction,
    table: &TableName,
    schema: &TableSchema,
    dedup: &mut Deduplicator,
    chunk: Chunk,
    stats: &mut FileStats,
) -> LoadResult<()> {
    let started = Instant::now();
    stats.record_issues(&chunk.issues, chunk.issue_count);

    let rows = dedup.retain(chunk.rows);
    if rows.is_empty() {
        return Ok(());
    }

    let written = tx.append_rows(table, schema, &rows).await?;
    stats.rows_loaded += written;
    stats.chunks_written += 1;
    debug!(table = %table, chunk = chunk.index, rows = written, "chunk appended");
    ctx.chunk_written(written, started);
    Ok(())
}

fn check_cancelled(ctx: &LoadContext) -> LoadResult<()> {
    if ctx.cancel.is_cancelled() {
        Err(LoadError::Cancelled)
    } else {
        Ok(())
    }
}
