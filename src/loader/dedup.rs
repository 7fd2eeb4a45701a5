use std::collections::HashSet;

use crate::error::{LoadError, LoadResult};
use crate::source::{Cell, Row};

/// Keeps the first row seen for each key value, across every chunk of a file
#[derive(Debug, Default)]
pub struct Deduplicator {
    key_index: Option<usize>,
    seen: HashSet<String>,
    dropped: u64,
}

impl Deduplicator {
    /// A filter on `key` (a normalized column name), or a pass-through when `key` is `None`
    pub fn for_header(key: Option<&str>, header: &[String]) -> LoadResult<Self> {
        let key_index = match key {
            Some(key) => Some(header.iter().position(|h| h == key).ok_or_else(|| {
                LoadError::MissingColumn {
                    column: key.to_string(),
                }
            })?),
            None => None,
        };
        Ok(Self {
            key_index,
            ..Self::default()
        })
    }

    /// True the first time `key` is offered
    pub fn first_occurrence(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            self.dropped += 1;
            false
        } else {
            self.seen.insert(key.to_string());
            true
        }
    }

    /// Drop rows whose key was already seen, keeping the order of the rest
    pub fn retain(&mut self, rows: Vec<Row>) -> Vec<Row> {
        let Some(idx) = self.key_index else {
            return rows;
        };
        rows.into_iter()
            .filter(|row| {
                let key = row.get(idx).map(key_text).unwrap_or_default();
                self.first_occurrence(&key)
            })
            .collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

fn key_text(cell: &Cell) -> String {
    match cell {
        Cell::Text(value) => value.clone(),
        Cell::Timestamp(ts) => ts.to_string(),
        Cell::Absent => String::new(),
    }
}
