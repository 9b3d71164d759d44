//! Row views and typed row conversion.

use crate::conversion::FromWireValue;
use crate::error::{Error, Result};
use crate::result::{Field, QueryResult};

/// A borrowed view of one row of a [`QueryResult`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'a> {
    result: &'a QueryResult,
    index: usize,
}

impl<'a> Row<'a> {
    pub(crate) fn new(result: &'a QueryResult, index: usize) -> Self {
        Self { result, index }
    }

    /// Position of this row in its result.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.result.nfields()
    }

    /// Whether the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Column descriptors.
    pub fn fields(&self) -> &'a [Field] {
        self.result.fields()
    }

    pub fn is_null(&self, column: usize) -> bool {
        self.result.is_null(self.index, column)
    }

    /// Raw value bytes, `None` for NULL.
    pub fn value(&self, column: usize) -> Option<&'a [u8]> {
        self.result.value(self.index, column)
    }

    /// Typed value at `column`.
    pub fn get<T: FromWireValue<'a>>(&self, column: usize) -> Result<T> {
        self.result.get(self.index, column)
    }

    /// Typed value by column name.
    pub fn get_by_name<T: FromWireValue<'a>>(&self, name: &str) -> Result<T> {
        self.result.get_by_name(self.index, name)
    }
}

/// Build a Rust value from a whole row.
///
/// Tuples of up to eight [`FromWireValue`] types are supported; the column
/// count must match the tuple arity exactly.
pub trait FromRow<'a>: Sized {
    fn from_row(row: Row<'a>) -> Result<Self>;
}

macro_rules! impl_from_row {
    ($count:expr, $($idx:tt: $T:ident),+) => {
        impl<'a, $($T: FromWireValue<'a>),+> FromRow<'a> for ($($T,)+) {
            fn from_row(row: Row<'a>) -> Result<Self> {
                if row.len() != $count {
                    return Err(Error::Decode(format!(
                        "expected {} columns, row has {}",
                        $count,
                        row.len()
                    )));
                }
                Ok(($(row.get::<$T>($idx)?,)+))
            }
        }
    };
}

impl_from_row!(1, 0: T0);
impl_from_row!(2, 0: T0, 1: T1);
impl_from_row!(3, 0: T0, 1: T1, 2: T2);
impl_from_row!(4, 0: T0, 1: T1, 2: T2, 3: T3);
impl_from_row!(5, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4);
impl_from_row!(6, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5);
impl_from_row!(7, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6);
impl_from_row!(8, 0: T0, 1: T1, 2: T2, 3: T3, 4: T4, 5: T5, 6: T6, 7: T7);
