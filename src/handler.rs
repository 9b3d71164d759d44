//! Result and notice handlers.

use std::collections::VecDeque;

use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::query::{CommandComplete, DataRow, RowDescription};
use crate::result::QueryResult;

/// Receives statement results as the query state machines decode them.
///
/// Callback patterns by statement type:
/// - SELECT with rows: `result_start` → `row*` → `result_end`
/// - SELECT with 0 rows: `result_start` → `result_end`
/// - INSERT/UPDATE/DELETE: `result_end` only (with affected row count)
/// - empty query string: `empty_query`
///
/// For multi-statement queries like `"SELECT 1; UPDATE foo SET x=1"`:
/// ```text
/// result_start → row* → result_end   // SELECT 1
/// result_end                          // UPDATE
/// ```
///
/// Rows reach `row` only after their width was checked against `cols`.
pub trait ResultHandler {
    /// Called when a result set begins.
    fn result_start(&mut self, cols: RowDescription<'_>) -> Result<()> {
        let _ = cols;
        Ok(())
    }

    /// Called for each data row.
    fn row(&mut self, cols: RowDescription<'_>, row: DataRow<'_>) -> Result<()>;

    /// Called when a statement completes.
    fn result_end(&mut self, complete: CommandComplete<'_>) -> Result<()> {
        let _ = complete;
        Ok(())
    }

    /// Called for an empty query string.
    fn empty_query(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called when the current statement failed; partial state should go.
    fn abort(&mut self) {}
}

/// A handler that discards all results.
#[derive(Debug, Default)]
pub struct DropHandler;

impl ResultHandler for DropHandler {
    fn row(&mut self, _cols: RowDescription<'_>, _row: DataRow<'_>) -> Result<()> {
        Ok(())
    }
}

/// Materializes every statement into a [`QueryResult`], in order.
#[derive(Debug, Default)]
pub struct ResultQueue {
    current: Option<QueryResult>,
    ready: VecDeque<Result<QueryResult>>,
}

impl ResultQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next completed result, oldest first.
    pub fn pop(&mut self) -> Option<Result<QueryResult>> {
        self.ready.pop_front()
    }

    /// Queue an error after the results completed so far.
    pub fn push_error(&mut self, error: Error) {
        self.current = None;
        self.ready.push_back(Err(error));
    }

    /// Number of completed results waiting to be taken.
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }
}

impl ResultHandler for ResultQueue {
    fn result_start(&mut self, cols: RowDescription<'_>) -> Result<()> {
        self.current = Some(QueryResult::with_fields(&cols));
        Ok(())
    }

    fn row(&mut self, _cols: RowDescription<'_>, row: DataRow<'_>) -> Result<()> {
        self.current
            .as_mut()
            .ok_or_else(|| Error::Protocol("DataRow without RowDescription".into()))?
            .push_row(&row)
    }

    fn result_end(&mut self, complete: CommandComplete<'_>) -> Result<()> {
        let result = match self.current.take() {
            Some(mut result) => {
                result.set_command_tag(complete.tag);
                result
            }
            None => QueryResult::command(complete.tag),
        };
        self.ready.push_back(Ok(result));
        Ok(())
    }

    fn empty_query(&mut self) -> Result<()> {
        self.ready.push_back(Ok(QueryResult::empty_query()));
        Ok(())
    }

    fn abort(&mut self) {
        self.current = None;
    }
}

/// A LISTEN/NOTIFY notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// PID of the notifying backend process
    pub pid: u32,
    /// Channel name
    pub channel: String,
    /// Notification payload
    pub payload: String,
}

/// Receives NoticeResponse messages. Notices never fail a query.
pub trait NoticeHandler: Send {
    fn notice(&mut self, notice: &ErrorFields);
}

/// Default notice sink: forwards notices to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotices;

impl NoticeHandler for LogNotices {
    fn notice(&mut self, notice: &ErrorFields) {
        match notice.severity() {
            Some("WARNING") => tracing::warn!(%notice, "server notice"),
            _ => tracing::info!(%notice, "server notice"),
        }
    }
}

impl<F: FnMut(&ErrorFields) + Send> NoticeHandler for F {
    fn notice(&mut self, notice: &ErrorFields) {
        self(notice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::backend::FieldDescription;
    use crate::protocol::types::{FormatCode, oid};
    use crate::result::ResultStatus;

    fn cols() -> RowDescription<'static> {
        RowDescription::new(vec![FieldDescription {
            name: "x",
            table_oid: 0,
            column_id: 0,
            type_oid: oid::INT4,
            type_size: 4,
            type_modifier: -1,
            format: FormatCode::Text,
        }])
    }

    #[test]
    fn queue_orders_results() {
        let mut queue = ResultQueue::new();
        queue.result_start(cols()).unwrap();
        queue
            .row(cols(), DataRow::parse(&[0, 1, 0, 0, 0, 1, b'7']).unwrap())
            .unwrap();
        queue.result_end(CommandComplete { tag: "SELECT 1" }).unwrap();
        queue.result_end(CommandComplete { tag: "UPDATE 2" }).unwrap();
        queue.push_error(Error::Decode("boom".into()));

        assert_eq!(queue.len(), 3);
        let select = queue.pop().unwrap().unwrap();
        assert_eq!(select.status(), ResultStatus::TuplesOk);
        assert_eq!(select.get::<i32>(0, 0).unwrap(), 7);
        let update = queue.pop().unwrap().unwrap();
        assert_eq!(update.status(), ResultStatus::CommandOk);
        assert_eq!(update.rows_affected(), Some(2));
        assert!(queue.pop().unwrap().is_err());
        assert!(queue.pop().is_none());
    }

    #[test]
    fn abort_discards_partial_result() {
        let mut queue = ResultQueue::new();
        queue.result_start(cols()).unwrap();
        queue.abort();
        queue.result_end(CommandComplete { tag: "DELETE 0" }).unwrap();
        let result = queue.pop().unwrap().unwrap();
        assert_eq!(result.status(), ResultStatus::CommandOk);
    }

    #[test]
    fn closure_notice_handler() {
        let mut seen = Vec::new();
        {
            let mut handler = |n: &ErrorFields| seen.push(n.message.clone());
            handler.notice(&ErrorFields {
                message: Some("hi".into()),
                ..Default::default()
            });
        }
        assert_eq!(seen, vec![Some("hi".to_string())]);
    }
}
