//! # objsync-frontend
//!
//! Consuming side of the objsync protocol.
//!
//! This crate provides:
//! - Connection handshake and ready gating with ordered message queueing
//! - Proxies with cached property snapshots and signal handlers
//! - Reference release driven by proxy lifetimes
//! - Blocking property reads and method calls with correlated results

pub mod connection;
pub mod error;
pub mod invoke;
pub mod proxy;
pub mod state;
pub mod stream;
pub mod types;
pub mod value;

pub use connection::{Connection, ConnectionConfig};
pub use error::{FrontendError, InvokeError};
pub use invoke::Invocation;
pub use proxy::{HandlerId, Proxy};
pub use state::ConnectionState;
pub use stream::SplitStream;
pub use types::TypeCache;
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_backend::{
        Args, BackendError, BackendObject, ConnectionOptions, Emitter, ListModel, MethodError,
        Object, Server, ServerConfig, SyncConfig, TypeDescriptor, ValueKind,
    };
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Counter {
        count: i64,
        emitter: Option<Emitter>,
    }

    impl BackendObject for Counter {
        fn describe() -> TypeDescriptor {
            TypeDescriptor::builder("Counter")
                .property("count", ValueKind::Int)
                .method("addOne", &[])
                .build()
        }

        fn read_property(&self, name: &str) -> Option<objsync_backend::Value> {
            match name {
                "count" => Some(self.count.into()),
                _ => None,
            }
        }

        fn invoke(
            &mut self,
            method: &str,
            _args: Args,
        ) -> Result<Vec<objsync_backend::Value>, MethodError> {
            match method {
                "addOne" => {
                    self.count += 1;
                    if let Some(emitter) = &self.emitter {
                        emitter.changed("count");
                    }
                    Ok(vec![self.count.into()])
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

    static DISPOSED: AtomicUsize = AtomicUsize::new(0);

    #[derive(Default)]
    struct Disposable;

    impl Drop for Disposable {
        fn drop(&mut self) {
            DISPOSED.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl BackendObject for Disposable {
        fn describe() -> TypeDescriptor {
            TypeDescriptor::builder("Disposable").build()
        }

        fn read_property(&self, _name: &str) -> Option<objsync_backend::Value> {
            None
        }
    }

    fn fast_reclaim() -> ConnectionOptions {
        ConnectionOptions::default().with_sync(SyncConfig {
            object_threshold: 200,
            grace_period_ms: 0,
            sync_interval_ms: 10,
        })
    }

    /// Drives `conn` until `done` holds.
    async fn pump_until<S>(conn: &mut Connection<S>, mut done: impl FnMut() -> bool)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            if let Ok(result) =
                tokio::time::timeout(Duration::from_millis(20), conn.process_next()).await
            {
                result.unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_against_tcp_server() {
        let roots: Arc<Mutex<Vec<Object<Counter>>>> = Arc::default();
        let created = roots.clone();
        let mut config = ServerConfig::new("127.0.0.1:0".parse().unwrap());
        config.options = fast_reclaim();
        let server = Arc::new(Server::new(config, move |conn| {
            let root = Object::new(Counter::default());
            created.lock().unwrap().push(root.clone());
            conn.register_type::<Counter>()?;
            conn.register_type::<Disposable>()?;
            conn.register_singleton("Root", &root)?;
            Ok::<(), BackendError>(())
        }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        let handle = tokio::spawn(async move { serving.serve(listener).await });

        let mut conn = Connection::connect(addr).await.unwrap();
        conn.handshake().await.unwrap();
        assert_eq!(conn.instantiable_types(), ["Counter", "Disposable"]);

        let root = conn.singleton("Root").await.unwrap();
        assert_eq!(conn.property(&root, "count").await.unwrap(), Value::Int(0));

        let changes = Rc::new(Cell::new(0));
        let seen = changes.clone();
        root.connect("countChanged", move |_| seen.set(seen.get() + 1))
            .unwrap();

        assert_eq!(conn.call(&root, "addOne", vec![]).await.unwrap(), Value::Int(1));
        pump_until(&mut conn, || changes.get() == 1).await;
        assert_eq!(conn.property(&root, "count").await.unwrap(), Value::Int(1));

        // A change made by the application reaches the proxy too.
        {
            let roots = roots.lock().unwrap();
            roots[0].lock().count = 5;
            roots[0].changed("count");
        }
        pump_until(&mut conn, || changes.get() == 2).await;
        assert_eq!(conn.property(&root, "count").await.unwrap(), Value::Int(5));

        assert!(matches!(
            conn.call(&root, "subtractOne", vec![]).await,
            Err(FrontendError::UnknownMethod { .. })
        ));

        let counter = conn.create("Counter").await.unwrap();
        assert_eq!(conn.call(&counter, "addOne", vec![]).await.unwrap(), Value::Int(1));

        // Releasing the last proxy lets the backend reclaim the object.
        let disposable = conn.create("Disposable").await.unwrap();
        let before = DISPOSED.load(Ordering::SeqCst);
        drop(disposable);
        pump_until(&mut conn, || DISPOSED.load(Ordering::SeqCst) > before).await;

        // Singletons survive their proxies being dropped.
        drop(root);
        let root = conn.singleton("Root").await.unwrap();
        assert_eq!(conn.property(&root, "count").await.unwrap(), Value::Int(5));

        server.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_list_model_over_duplex() {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let mut model = ListModel::single_role();
        model.reset_rows(vec!["a".to_string(), "b".to_string(), "c".to_string()]);

        let mut backend = objsync_backend::Connection::new(theirs);
        backend.register_singleton("Names", Object::new(model)).unwrap();
        let backend = tokio::spawn(async move { backend.run().await });

        let mut conn = Connection::new(ours);
        conn.handshake().await.unwrap();
        let names = conn.singleton("Names").await.unwrap();
        assert_eq!(
            conn.property(&names, "roleNames").await.unwrap(),
            Value::from(vec!["modelData"])
        );

        let rows = Rc::new(RefCell::new(Vec::new()));
        let sink = rows.clone();
        names
            .connect("modelRowData", move |args| sink.borrow_mut().push(args.to_vec()))
            .unwrap();

        let returned = conn
            .call(&names, "requestRows", vec![Value::Int(1), Value::Int(-1)])
            .await
            .unwrap();
        assert!(returned.is_null());
        pump_until(&mut conn, || !rows.borrow().is_empty()).await;
        assert_eq!(
            rows.borrow()[0],
            vec![Value::Int(1), Value::from(vec!["b", "c"])]
        );

        drop(conn);
        backend.await.unwrap().unwrap();
    }
}
