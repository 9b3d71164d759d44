//! Materialized query results.
//!
//! A [`QueryResult`] owns everything it needs: column metadata, row data and
//! the command tag. It stays valid after the connection that produced it is
//! closed.

use std::ops::Range;

use crate::conversion::{FromWireValue, decode_value, utf8};
use crate::error::{Error, Result};
use crate::protocol::backend::{DataRow, FieldDescription, RowDescription, query::rows_affected};
use crate::protocol::types::{FormatCode, Oid};
use crate::row::{FromRow, Row};

/// Column metadata, owned copy of a RowDescription field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    /// Column name
    pub name: String,
    /// Table OID (0 if not a table column)
    pub table_oid: Oid,
    /// Column attribute number (0 if not a table column)
    pub column_id: i16,
    /// Data type OID
    pub type_oid: Oid,
    /// Type size (-1 for variable, -2 for null-terminated)
    pub type_size: i16,
    /// Type modifier
    pub type_modifier: i32,
    /// Format of the values in this column
    pub format: FormatCode,
}

impl From<&FieldDescription<'_>> for Field {
    fn from(field: &FieldDescription<'_>) -> Self {
        Self {
            name: field.name.to_string(),
            table_oid: field.table_oid,
            column_id: field.column_id,
            type_oid: field.type_oid,
            type_size: field.type_size,
            type_modifier: field.type_modifier,
            format: field.format,
        }
    }
}

/// What kind of statement produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The statement returned rows (possibly zero).
    TuplesOk,
    /// The statement completed without a row description.
    CommandOk,
    /// The query string was empty.
    EmptyQuery,
}

/// One completed statement result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryResult {
    status: ResultStatus,
    fields: Vec<Field>,
    data: Vec<u8>,
    // Row-major; `None` is SQL NULL.
    cells: Vec<Option<Range<usize>>>,
    ntuples: usize,
    command_tag: Option<String>,
}

impl QueryResult {
    /// Start a result for a statement that returns rows.
    pub fn with_fields(description: &RowDescription<'_>) -> Self {
        Self {
            status: ResultStatus::TuplesOk,
            fields: description.fields().iter().map(Field::from).collect(),
            data: Vec::new(),
            cells: Vec::new(),
            ntuples: 0,
            command_tag: None,
        }
    }

    /// A result for a statement that produced no row description.
    pub fn command(tag: &str) -> Self {
        Self {
            status: ResultStatus::CommandOk,
            fields: Vec::new(),
            data: Vec::new(),
            cells: Vec::new(),
            ntuples: 0,
            command_tag: Some(tag.to_string()),
        }
    }

    /// The result of an empty query string.
    pub fn empty_query() -> Self {
        Self {
            status: ResultStatus::EmptyQuery,
            fields: Vec::new(),
            data: Vec::new(),
            cells: Vec::new(),
            ntuples: 0,
            command_tag: None,
        }
    }

    /// Append a row. Its width must match the row description.
    pub fn push_row(&mut self, row: &DataRow<'_>) -> Result<()> {
        if row.len() != self.fields.len() {
            return Err(Error::Decode(format!(
                "row has {} columns, row description has {}",
                row.len(),
                self.fields.len()
            )));
        }
        self.cells.reserve(row.len());
        for value in row.iter() {
            let cell = value.map(|bytes| {
                let start = self.data.len();
                self.data.extend_from_slice(bytes);
                start..self.data.len()
            });
            self.cells.push(cell);
        }
        self.ntuples += 1;
        Ok(())
    }

    /// Record the CommandComplete tag.
    pub fn set_command_tag(&mut self, tag: &str) {
        self.command_tag = Some(tag.to_string());
    }

    /// Result status.
    pub fn status(&self) -> ResultStatus {
        self.status
    }

    /// Number of rows.
    pub fn ntuples(&self) -> usize {
        self.ntuples
    }

    /// Number of columns.
    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    /// All column descriptors.
    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Column descriptor at `column`.
    pub fn field(&self, column: usize) -> Option<&Field> {
        self.fields.get(column)
    }

    /// Column name at `column`.
    pub fn field_name(&self, column: usize) -> Option<&str> {
        self.fields.get(column).map(|f| f.name.as_str())
    }

    /// Find a column by name, folding it like an SQL identifier.
    ///
    /// Unquoted parts are lower-cased; double-quoted parts match literally,
    /// with `""` standing for one quote. `"Foo"` finds a column named `Foo`
    /// while `Foo` finds `foo`.
    pub fn column_number(&self, name: &str) -> Option<usize> {
        let folded = fold_identifier(name);
        self.fields.iter().position(|f| f.name == folded)
    }

    fn cell(&self, row: usize, column: usize) -> Option<&Option<Range<usize>>> {
        if row >= self.ntuples || column >= self.fields.len() {
            return None;
        }
        self.cells.get(row * self.fields.len() + column)
    }

    /// Whether the value is NULL. Out-of-range positions count as NULL.
    pub fn is_null(&self, row: usize, column: usize) -> bool {
        !matches!(self.cell(row, column), Some(Some(_)))
    }

    /// Raw value bytes, `None` for NULL or an out-of-range position.
    pub fn value(&self, row: usize, column: usize) -> Option<&[u8]> {
        match self.cell(row, column) {
            Some(Some(range)) => self.data.get(range.clone()),
            _ => None,
        }
    }

    /// Value as UTF-8 text, `Ok(None)` for NULL.
    pub fn get_str(&self, row: usize, column: usize) -> Result<Option<&str>> {
        self.check_position(row, column)?;
        self.value(row, column).map(utf8).transpose()
    }

    /// Typed value.
    ///
    /// ```ignore
    /// let n: i64 = result.get(0, 0)?;
    /// let s: Option<String> = result.get(0, 1)?;
    /// ```
    pub fn get<'a, T: FromWireValue<'a>>(&'a self, row: usize, column: usize) -> Result<T> {
        self.check_position(row, column)?;
        let field = &self.fields[column];
        decode_value(field.type_oid, field.format, self.value(row, column))
    }

    /// Typed value looked up by column name.
    pub fn get_by_name<'a, T: FromWireValue<'a>>(&'a self, row: usize, name: &str) -> Result<T> {
        let column = self
            .column_number(name)
            .ok_or_else(|| Error::InvalidUsage(format!("no column named {name:?}")))?;
        self.get(row, column)
    }

    fn check_position(&self, row: usize, column: usize) -> Result<()> {
        if row >= self.ntuples {
            return Err(Error::InvalidUsage(format!(
                "row {row} out of range ({} rows)",
                self.ntuples
            )));
        }
        if column >= self.fields.len() {
            return Err(Error::InvalidUsage(format!(
                "column {column} out of range ({} columns)",
                self.fields.len()
            )));
        }
        Ok(())
    }

    /// Command tag from CommandComplete, e.g. `INSERT 0 3`.
    pub fn command_tag(&self) -> Option<&str> {
        self.command_tag.as_deref()
    }

    /// Rows affected or returned, parsed from the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        self.command_tag.as_deref().and_then(rows_affected)
    }

    /// Row view at `index`.
    pub fn row(&self, index: usize) -> Option<Row<'_>> {
        (index < self.ntuples).then(|| Row::new(self, index))
    }

    /// Iterate over rows.
    pub fn rows(&self) -> impl ExactSizeIterator<Item = Row<'_>> + '_ {
        (0..self.ntuples).map(move |index| Row::new(self, index))
    }

    /// Convert every row.
    pub fn collect<'a, T: FromRow<'a>>(&'a self) -> Result<Vec<T>> {
        self.rows().map(T::from_row).collect()
    }
}

/// Fold a column reference the way the server folds identifiers.
fn fold_identifier(name: &str) -> String {
    if !name.contains('"') {
        return name.to_ascii_lowercase();
    }

    let mut folded = String::with_capacity(name.len());
    let mut in_quotes = false;
    let mut chars = name.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if in_quotes && chars.peek() == Some(&'"') {
                folded.push('"');
                chars.next();
            } else {
                in_quotes = !in_quotes;
            }
        } else if in_quotes {
            folded.push(c);
        } else {
            folded.push(c.to_ascii_lowercase());
        }
    }
    folded
}
