//! List models.
//!
//! A [`ListModel`] publishes rows to the consuming side through signals
//! instead of properties, so large lists can be fetched in windows. The
//! consumer drives paging with `requestRows` and `setBatchSize`; the
//! application reports its own edits through the `*_rows` methods.

use crate::error::MethodError;
use crate::object::{Args, BackendObject, Emitter};
use crate::value::Value;
use objsync_protocol::{TypeDescriptor, ValueKind};

/// A list of rows with named roles.
pub struct ListModel<R> {
    roles: Vec<String>,
    rows: Vec<R>,
    batch_size: usize,
    emitter: Option<Emitter>,
}

impl<R> ListModel<R>
where
    R: Clone + Into<Value> + Send + 'static,
{
    /// Creates an empty model with the given role names.
    pub fn new<S: Into<String>>(roles: impl IntoIterator<Item = S>) -> Self {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
            batch_size: 0,
            emitter: None,
        }
    }

    /// Creates a model holding a single `modelData` role.
    pub fn single_role() -> Self {
        Self::new(["modelData"])
    }

    pub fn role_names(&self) -> &[String] {
        &self.roles
    }

    pub fn rows(&self) -> &[R] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows sent per notification; zero sends everything.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Replaces every row.
    pub fn reset_rows(&mut self, rows: Vec<R>) {
        self.rows = rows;
        self.notify_reset();
    }

    /// Inserts rows before `start`, clamped to the end of the list.
    pub fn insert_rows(&mut self, start: usize, rows: Vec<R>) {
        let start = start.min(self.rows.len());
        let count = rows.len();
        if count == 0 {
            return;
        }
        self.rows.splice(start..start, rows);
        let (data, more) = self.window(start, Some(count), self.batch_size);
        self.emit("modelInsert", vec![start.into(), data.into(), more.into()]);
    }

    /// Removes up to `count` rows starting at `start`.
    pub fn remove_rows(&mut self, start: usize, count: usize) {
        let start = start.min(self.rows.len());
        let end = start.saturating_add(count).min(self.rows.len());
        if start == end {
            return;
        }
        self.rows.drain(start..end);
        self.emit("modelRemove", vec![start.into(), (end - 1).into()]);
    }

    /// Moves `count` rows starting at `start` so they sit before row
    /// `destination`, indexed before the move.
    pub fn move_rows(&mut self, start: usize, count: usize, destination: usize) -> bool {
        let len = self.rows.len();
        let end = start.saturating_add(count);
        if count == 0 || end > len || destination > len || (start..=end).contains(&destination) {
            return false;
        }
        let moved: Vec<R> = self.rows.drain(start..end).collect();
        let at = if destination > start {
            destination - count
        } else {
            destination
        };
        self.rows.splice(at..at, moved);
        self.emit(
            "modelMove",
            vec![start.into(), (end - 1).into(), destination.into()],
        );
        true
    }

    /// Replaces one row.
    pub fn update_row(&mut self, row: usize, value: R) -> bool {
        let Some(slot) = self.rows.get_mut(row) else {
            return false;
        };
        *slot = value.clone();
        self.emit("modelUpdate", vec![row.into(), value.into()]);
        true
    }

    fn notify_reset(&self) {
        let (data, more) = self.window(0, None, self.batch_size);
        self.emit("modelReset", vec![data.into(), more.into()]);
    }

    /// Rows from `start`, at most `count` of them (all remaining when
    /// `None`), cut to `batch` when non-zero. Also returns how many rows
    /// were left out by the batch limit.
    fn window(&self, start: usize, count: Option<usize>, batch: usize) -> (Vec<Value>, usize) {
        let start = start.min(self.rows.len());
        let available = self.rows.len() - start;
        let mut count = count.unwrap_or(available).min(available);
        let mut more = 0;
        if batch > 0 && count > batch {
            more = count - batch;
            count = batch;
        }
        let data = self.rows[start..start + count]
            .iter()
            .cloned()
            .map(Into::into)
            .collect();
        (data, more)
    }

    fn emit(&self, signal: &str, args: Vec<Value>) {
        if let Some(emitter) = &self.emitter {
            if let Err(e) = emitter.emit(signal, args) {
                tracing::warn!("List model failed to emit {}: {}", signal, e);
            }
        }
    }
}

impl<R> BackendObject for ListModel<R>
where
    R: Clone + Into<Value> + Send + 'static,
{
    fn describe() -> TypeDescriptor {
        TypeDescriptor::builder("ListModel")
            .property("roleNames", ValueKind::Array)
            .writable_property("batchSize", ValueKind::Int)
            .method("reset", &[])
            .method("requestRows", &[ValueKind::Int, ValueKind::Int])
            .signal(
                "modelReset",
                &[("rowData", ValueKind::Array), ("moreRows", ValueKind::Int)],
            )
            .signal(
                "modelInsert",
                &[
                    ("start", ValueKind::Int),
                    ("rowData", ValueKind::Array),
                    ("moreRows", ValueKind::Int),
                ],
            )
            .signal("modelRemove", &[("start", ValueKind::Int), ("end", ValueKind::Int)])
            .signal(
                "modelMove",
                &[
                    ("start", ValueKind::Int),
                    ("end", ValueKind::Int),
                    ("destination", ValueKind::Int),
                ],
            )
            .signal("modelUpdate", &[("row", ValueKind::Int), ("data", ValueKind::Var)])
            .signal(
                "modelRowData",
                &[("start", ValueKind::Int), ("rowData", ValueKind::Array)],
            )
            .build()
    }

    fn read_property(&self, name: &str) -> Option<Value> {
        match name {
            "roleNames" => Some(self.roles.clone().into()),
            "batchSize" => Some(self.batch_size.into()),
            _ => None,
        }
    }

    fn invoke(&mut self, method: &str, args: Args) -> Result<Vec<Value>, MethodError> {
        match method {
            "reset" => {
                self.notify_reset();
                Ok(vec![])
            }
            "requestRows" => {
                // Negative start means the beginning, negative count the rest.
                let start = usize::try_from(args.get::<i64>(0)?).unwrap_or(0);
                let count = usize::try_from(args.get::<i64>(1)?).ok();
                // Explicit requests ignore the batch size.
                let (data, _) = self.window(start, count, 0);
                let start = start.min(self.rows.len());
                self.emit("modelRowData", vec![start.into(), data.into()]);
                Ok(vec![])
            }
            "setBatchSize" => {
                self.batch_size = usize::try_from(args.get::<i64>(0)?).unwrap_or(0);
                if let Some(emitter) = &self.emitter {
                    emitter.changed("batchSize");
                }
                Ok(vec![])
            }
            _ => Err(MethodError::NotImplemented(method.to_string())),
        }
    }

    fn activated(&mut self, emitter: Emitter) {
        self.emitter = Some(emitter);
    }

    fn deactivated(&mut self) {
        self.emitter = None;
    }
}
