//! Demo object graph published by the `objsync` binary.

use objsync_backend::{
    Args, BackendError, BackendObject, Connection, Emitter, ListModel, MethodError, Object, Value,
};
use objsync_protocol::{TypeDescriptor, ValueKind};

/// Root singleton: a counter with a history of its changes.
pub struct Root {
    count: i64,
    title: String,
    history: Object<ListModel<String>>,
    emitter: Option<Emitter>,
}

impl Root {
    pub fn new() -> Self {
        Self {
            count: 0,
            title: "objsync demo".to_string(),
            history: Object::new(ListModel::single_role()),
            emitter: None,
        }
    }

    fn record(&self, entry: String) {
        let mut history = self.history.lock();
        let end = history.len();
        history.insert_rows(end, vec![entry]);
    }
}

impl Default for Root {
    fn default() -> Self {
        Self::new()
    }
}

impl BackendObject for Root {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::builder("Root")
            .property("count", ValueKind::Int)
            .writable_property("title", ValueKind::String)
            .property("history", ValueKind::Object)
            .method("addOne", &[])
            .method("makeNote", &[ValueKind::String])
            .signal("counted", &[("count", ValueKind::Int)])
            .build()
    }

    fn read_property(&self, name: &str) -> Option<Value> {
        match name {
            "count" => Some(self.count.into()),
            "title" => Some(self.title.clone().into()),
            "history" => Some((&self.history).into()),
            _ => None,
        }
    }

    fn invoke(&mut self, method: &str, args: Args) -> Result<Vec<Value>, MethodError> {
        match method {
            "addOne" => {
                self.count += 1;
                self.record(format!("count={}", self.count));
                if let Some(emitter) = &self.emitter {
                    emitter.changed("count");
                    if let Err(e) = emitter.emit("counted", vec![self.count.into()]) {
                        tracing::warn!("Failed to emit counted: {}", e);
                    }
                }
                Ok(vec![self.count.into()])
            }
            "setTitle" => {
                self.title = args.get(0)?;
                self.record(format!("title={}", self.title));
                if let Some(emitter) = &self.emitter {
                    emitter.changed("title");
                }
                Ok(vec![])
            }
            "makeNote" => {
                let label: String = args.get(0)?;
                let note = Object::new(Note { label });
                Ok(vec![(&note).into()])
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

/// A labelled note. Also constructible by the frontend.
#[derive(Default)]
pub struct Note {
    label: String,
}

impl BackendObject for Note {
    fn describe() -> TypeDescriptor {
        TypeDescriptor::builder("Note")
            .writable_property("label", ValueKind::String)
            .build()
    }

    fn read_property(&self, name: &str) -> Option<Value> {
        match name {
            "label" => Some(self.label.clone().into()),
            _ => None,
        }
    }

    fn invoke(&mut self, method: &str, args: Args) -> Result<Vec<Value>, MethodError> {
        match method {
            "setLabel" => {
                self.label = args.get(0)?;
                Ok(vec![])
            }
            _ => Err(MethodError::NotImplemented(method.to_string())),
        }
    }
}

/// Publishes a fresh demo graph on `conn`.
pub fn setup(conn: &mut Connection) -> Result<(), BackendError> {
    conn.register_type::<Note>()?;
    conn.register_singleton("Root", Object::new(Root::new()))?;
    Ok(())
}
