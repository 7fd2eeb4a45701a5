//! Destination table shapes and the SQL text generated from them.

use serde::{Deserialize, Serialize};

/// Postgres truncates identifiers longer than this
/// Longest identifier Postgres keeps without truncating, in bytes
pub const MAX_IDENTIFIER_LEN: usize = 63;

/// SQL data type of a destination column
///
/// Cells are either raw text or a parsed timestamp, so those are the only two shapes a
/// derived table can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Text,
    Timestamp,
}

impl SqlType {
    /// Returns the Postgres type name
    pub fn to_postgres(self) -> &'static str {
        match self {
            SqlType::Text => "TEXT",
            SqlType::Timestamp => "TIMESTAMP",
        }
    }
}

/// A column in a destination table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub sql_type: SqlType,
}

/// Shape of a destination table, derived once from a file's first chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<Column>,
}

impl TableSchema {
    /// Build from a normalized header; columns named in `timestamp_columns` become TIMESTAMP
    pub fn from_header(header: &[String], timestamp_columns: &[String]) -> Self {
        let columns = header
            .iter()
            .map(|name| Column {
                name: name.clone(),
                sql_type: if timestamp_columns.contains(name) {
                    SqlType::Timestamp
                } else {
                    SqlType::Text
                },
            })
            .collect();
        Self { columns }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// True when `header` names exactly these columns in this order
    pub fn matches_header(&self, header: &[String]) -> bool {
        self.columns.len() == header.len() && self.column_names().eq(header.iter().map(String::as_str))
    }
}

/// Schema-qualified table name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// `"schema"."table"`, safe to splice into SQL
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }
}

impl std::fmt::Display for TableName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Lowercase identifier Postgres accepts unquoted: `[a-z_][a-z0-9_]*`, at most 63 bytes
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Double-quote an identifier, escaping embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn create_schema_sql(schema: &str) -> String {
    format!("CREATE SCHEMA IF NOT EXISTS {}", quote_ident(schema))
}

pub fn drop_table_sql(table: &TableName) -> String {
    format!("DROP TABLE IF EXISTS {}", table.qualified())
}

/// Generate DDL statement for creating a table
pub fn create_table_sql(table: &TableName, schema: &TableSchema) -> String {
    let mut ddl = format!("CREATE TABLE {} (\n", table.qualified());

    let column_defs: Vec<String> = schema
        .columns
        .iter()
        .map(|col| format!("  {} {}", quote_ident(&col.name), col.sql_type.to_postgres()))
        .collect();

    ddl.push_str(&column_defs.join(",\n"));
    ddl.push_str("\n)");

    ddl
}

/// Multi-row INSERT: `INSERT INTO t ("a", "b") VALUES ($1, $2), ($3, $4), ...`
pub fn insert_sql(table: &TableName, schema: &TableSchema, row_count: usize) -> String {
    let num_columns = schema.columns.len();
    let column_list: Vec<String> = schema.column_names().map(quote_ident).collect();

    let mut param_idx = 1;
    let mut value_groups = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let placeholders: Vec<String> = (0..num_columns)
            .map(|_| {
                let placeholder = format!("${}", param_idx);
                param_idx += 1;
                placeholder
            })
            .collect();
        value_groups.push(format!("({})", placeholders.join(", ")));
    }

    format!(
        "INSERT INTO {} ({}) VALUES {}",
        table.qualified(),
        column_list.join(", "),
        value_groups.join(", ")
    )
}

/// Options for `COPY ... FROM STDIN`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyOptions {
    pub header: bool,
    /// Server-side encoding name of the payload; `None` means the client encoding (UTF8)
    pub encoding: Option<&'static str>,
    /// Columns whose empty cells load as empty strings instead of NULL
    pub force_not_null: Vec<String>,
}

pub fn copy_from_stdin_sql(table: &TableName, options: &CopyOptions) -> String {
    let mut sql = format!(
        "COPY {} FROM STDIN WITH (FORMAT csv, HEADER {}",
        table.qualified(),
        options.header
    );
    if let Some(encoding) = options.encoding {
        sql.push_str(&format!(", ENCODING '{}'", encoding));
    }
    if !options.force_not_null.is_empty() {
        let columns: Vec<String> = options.force_not_null.iter().map(|c| quote_ident(c)).collect();
        sql.push_str(&format!(", FORCE_NOT_NULL ({})", columns.join(", ")));
    }
    sql.push(')');
    sql
}

/// Postgres name for a decoder's encoding, when the server knows it
pub fn postgres_encoding_name(encoding: &'static encoding_rs::Encoding) -> Option<&'static str> {
    match encoding.name() {
        "UTF-8" => Some("UTF8"),
        "windows-1250" => Some("WIN1250"),
        "windows-1251" => Some("WIN1251"),
        "windows-1252" => Some("WIN1252"),
        "windows-1253" => Some("WIN1253"),
        "windows-1254" => Some("WIN1254"),
        "windows-1255" => Some("WIN1255"),
        "windows-1256" => Some("WIN1256"),
        "windows-1257" => Some("WIN1257"),
        "windows-1258" => Some("WIN1258"),
        "ISO-8859-2" => Some("LATIN2"),
        "ISO-8859-3" => Some("LATIN3"),
        "ISO-8859-4" => Some("LATIN4"),
        "ISO-8859-5" => Some("ISO_8859_5"),
        "ISO-8859-6" => Some("ISO_8859_6"),
        "ISO-8859-7" => Some("ISO_8859_7"),
        "ISO-8859-8" => Some("ISO_8859_8"),
        "ISO-8859-10" => Some("LATIN6"),
        "ISO-8859-13" => Some("LATIN7"),
        "ISO-8859-14" => Some("LATIN8"),
        "ISO-8859-15" => Some("LATIN9"),
        "ISO-8859-16" => Some("LATIN10"),
        "KOI8-R" => Some("KOI8R"),
        "KOI8-U" => Some("KOI8U"),
        _ => None,
    }
}
