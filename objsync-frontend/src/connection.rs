//! Consuming end of an objsync connection.
//!
//! The connection is driven by its owner: every operation reads, handles
//! and writes on the calling task. Handling is single-threaded with
//! respect to the proxy table, and outgoing messages are written in the
//! order they were produced.

use crate::error::{FrontendError, InvokeError};
use crate::invoke::{unwrap_return, Invocation, InvocationRouter};
use crate::proxy::{Proxy, ProxyTable};
use crate::state::{Admission, ConnectionState, StateMachine};
use crate::stream::SplitStream;
use crate::types::TypeCache;
use crate::value::Value;
use bytes::BytesMut;
use objsync_protocol::{
    setter_name, Decoder, Direction, Encoder, Message, ObjectRef, TypeDescriptor, TypeRef,
    PROTOCOL_VERSION,
};
use serde_json::Value as Json;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Minimum read buffer size (1 KiB).
pub const MIN_READ_BUFFER_SIZE: usize = 1024;

/// Maximum read buffer size (1 MiB).
pub const MAX_READ_BUFFER_SIZE: usize = 1024 * 1024;

/// Default bound of a synchronous wait.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long a synchronous wait may go without its message. Expiry is
    /// fatal.
    pub sync_timeout: Duration,
    /// Read buffer size for stream reads.
    pub read_buffer_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self {
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.clamp(MIN_READ_BUFFER_SIZE, MAX_READ_BUFFER_SIZE);
        self
    }
}

/// Frontend end of a connection.
pub struct Connection<S> {
    id: u64,
    config: ConnectionConfig,
    stream: S,
    decoder: Decoder,
    read_buf: Vec<u8>,
    machine: StateMachine,
    version: Option<u32>,
    types: TypeCache,
    instantiable: Vec<String>,
    singleton_refs: BTreeMap<String, ObjectRef>,
    singletons: HashMap<String, Proxy>,
    proxies: ProxyTable,
    router: InvocationRouter,
    outbox: Vec<Message>,
    closed: bool,
    failure: Option<String>,
}

impl Connection<TcpStream> {
    /// Connects to a backend listening on `addr`.
    pub async fn connect(addr: SocketAddr) -> Result<Self, FrontendError> {
        tracing::debug!("Connecting to {}...", addr);
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true).ok();
        Ok(Self::new(stream))
    }
}

impl<R, W> Connection<SplitStream<R, W>>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a connection over separate read and write halves, e.g. a
    /// child process's stdout and stdin.
    pub fn new_split(reader: R, writer: W) -> Self {
        Self::new(SplitStream::new(reader, writer))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        let config = ConnectionConfig::default();
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            read_buf: vec![0u8; config.read_buffer_size],
            config,
            stream,
            decoder: Decoder::new(),
            machine: StateMachine::new(),
            version: None,
            types: TypeCache::new(),
            instantiable: Vec::new(),
            singleton_refs: BTreeMap::new(),
            singletons: HashMap::new(),
            proxies: ProxyTable::new(),
            router: InvocationRouter::new(),
            outbox: Vec::new(),
            closed: false,
            failure: None,
        }
    }

    pub fn with_config(mut self, config: ConnectionConfig) -> Self {
        self.read_buf = vec![0u8; config.read_buffer_size];
        self.config = config;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_ready(&self) -> bool {
        self.machine.is_ready()
    }

    /// Protocol version announced by the backend.
    pub fn version(&self) -> Option<u32> {
        self.version
    }

    /// Reason of the fatal error that ended the connection, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Names of the types this side may construct with [`Connection::create`].
    pub fn instantiable_types(&self) -> &[String] {
        &self.instantiable
    }

    pub fn singleton_names(&self) -> impl Iterator<Item = &str> {
        self.singleton_refs.keys().map(String::as_str)
    }

    pub fn types(&self) -> &TypeCache {
        &self.types
    }

    /// Looks up the live proxy of an object.
    pub fn object(&self, identifier: &str) -> Option<Proxy> {
        self.proxies.live(identifier)
    }

    /// Number of messages queued for later handling.
    pub fn pending_messages(&self) -> usize {
        self.machine.pending_len()
    }

    pub fn pending_invocations(&self) -> usize {
        self.router.len()
    }

    /// Waits for VERSION.
    pub async fn ensure_version(&mut self) -> Result<u32, FrontendError> {
        if let Some(version) = self.version {
            return Ok(version);
        }
        self.wait_for_message("version", |m| matches!(m, Message::Version { .. }))
            .await?;
        self.version
            .ok_or_else(|| FrontendError::ConnectionFailed("no version received".to_string()))
    }

    /// Waits for VERSION and then REGISTER.
    pub async fn ensure_registered(&mut self) -> Result<(), FrontendError> {
        self.ensure_version().await?;
        if self.machine.state() == ConnectionState::AwaitRegistration {
            self.wait_for_message("register", |m| matches!(m, Message::Register { .. }))
                .await?;
        }
        Ok(())
    }

    /// Lets the connection handle ordinary traffic. Requested before
    /// REGISTER, it takes effect as soon as registration completes.
    pub async fn mark_ready(&mut self) -> Result<(), FrontendError> {
        self.check_usable()?;
        self.machine.mark_ready();
        if self.machine.is_ready() {
            tracing::debug!("[conn {}] Entered ready state, flushing pending", self.id);
            let result = self.replay_pending().map(|_| ());
            self.settle(result).await?;
        }
        self.send_pending().await
    }

    /// Completes the handshake and marks the connection ready.
    pub async fn handshake(&mut self) -> Result<(), FrontendError> {
        self.ensure_registered().await?;
        self.mark_ready().await
    }

    /// Blocks until a message matching `predicate` has been handled and
    /// returns it. Everything else received meanwhile is queued for
    /// ordinary handling afterwards.
    ///
    /// A wait borrows the connection mutably and signal handlers never see
    /// the connection, so on one connection waits run one at a time: a
    /// handler that needs more data has to ask for it after the current
    /// operation returns. The state machine keeps its waits on a stack all
    /// the same, so the queueing rules hold at any depth.
    pub async fn wait_for_message<P>(
        &mut self,
        wait_type: &'static str,
        predicate: P,
    ) -> Result<Message, FrontendError>
    where
        P: Fn(&Message) -> bool + 'static,
    {
        self.check_usable()?;
        self.machine.push_wait(wait_type, Box::new(predicate));
        let outcome = self.drive_wait(wait_type).await;
        let found = self.machine.pop_wait();
        let outcome = outcome.and_then(|()| found.ok_or(FrontendError::Timeout(wait_type)));
        self.settle(outcome).await
    }

    async fn drive_wait(&mut self, wait_type: &'static str) -> Result<(), FrontendError> {
        // A queued message may already satisfy the wait.
        self.replay_pending()?;
        self.flush().await?;
        while !self.machine.wait_satisfied() {
            match tokio::time::timeout(self.config.sync_timeout, self.read_some()).await {
                Ok(result) => result?,
                Err(_) => return Err(FrontendError::Timeout(wait_type)),
            }
            self.flush().await?;
        }
        Ok(())
    }

    /// Handles queued messages, or waits for and handles the next batch of
    /// incoming data when nothing queued could be handled.
    pub async fn process_next(&mut self) -> Result<(), FrontendError> {
        self.check_usable()?;
        let result = self.process_inner().await;
        self.settle(result).await
    }

    async fn process_inner(&mut self) -> Result<(), FrontendError> {
        let delivered = self.replay_pending()?;
        self.flush().await?;
        if delivered > 0 {
            return Ok(());
        }
        self.read_some().await?;
        self.flush().await
    }

    /// Serves the connection until the backend disconnects or a fatal
    /// error occurs.
    pub async fn run(&mut self) -> Result<(), FrontendError> {
        loop {
            match self.process_next().await {
                Ok(()) => {}
                Err(FrontendError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns the proxy of a singleton. Singletons live as long as the
    /// connection.
    pub async fn singleton(&mut self, name: &str) -> Result<Proxy, FrontendError> {
        self.check_ready()?;
        if let Some(proxy) = self.singletons.get(name) {
            return Ok(proxy.clone());
        }
        let reference = self
            .singleton_refs
            .get(name)
            .cloned()
            .ok_or_else(|| FrontendError::UnknownSingleton(name.to_string()))?;
        let proxy = self.ensure_proxy(&reference);
        self.singletons.insert(name.to_string(), proxy.clone());
        self.send_pending().await?;
        Ok(proxy)
    }

    /// Constructs an instantiable type on the backend.
    pub async fn create(&mut self, type_name: &str) -> Result<Proxy, FrontendError> {
        self.check_ready()?;
        if !self.instantiable.iter().any(|t| t == type_name) {
            return Err(FrontendError::UnknownType(type_name.to_string()));
        }
        let descriptor = self
            .types
            .get(type_name)
            .unwrap_or_else(|| Arc::new(TypeDescriptor::empty(type_name)));
        let identifier = Uuid::new_v4().to_string();
        let proxy = self.proxies.insert(&identifier, descriptor, true);
        tracing::debug!("[conn {}] Creating {} as {}", self.id, type_name, identifier);
        self.outbox.push(Message::ObjectCreate {
            identifier,
            type_name: type_name.to_string(),
        });
        self.send_pending().await?;
        Ok(proxy)
    }

    /// Reads a property, blocking for a snapshot if none was received yet.
    pub async fn property(&mut self, proxy: &Proxy, name: &str) -> Result<Value, FrontendError> {
        self.check_ready()?;
        if proxy.descriptor().property(name).is_none() {
            return Err(FrontendError::UnknownProperty {
                type_name: proxy.type_name().to_string(),
                property: name.to_string(),
            });
        }
        if !proxy.has_data() {
            tracing::debug!(
                "[conn {}] Blocking to load data for {} from read of {}",
                self.id,
                proxy.identifier(),
                name
            );
            // Nothing could have read the old values, so no change
            // notifications for this snapshot.
            proxy.set_waiting_for_data(true);
            let result = self.query(proxy).await;
            proxy.set_waiting_for_data(false);
            result?;
        }
        let json = proxy.cached_property(name).unwrap_or(Json::Null);
        let value = self.to_value(&json);
        self.send_pending().await?;
        Ok(value)
    }

    /// Forces a fresh property snapshot and waits for it.
    pub async fn refresh(&mut self, proxy: &Proxy) -> Result<(), FrontendError> {
        self.check_ready()?;
        self.query(proxy).await
    }

    async fn query(&mut self, proxy: &Proxy) -> Result<(), FrontendError> {
        let identifier = proxy.identifier().to_string();
        self.outbox.push(Message::ObjectQuery {
            identifier: identifier.clone(),
        });
        self.wait_for_message("object_reset", move |m| {
            matches!(m, Message::ObjectReset { identifier: id, .. } if *id == identifier)
        })
        .await
        .map(|_| ())
    }

    /// Writes a property through its `set<Name>` method.
    pub async fn set_property(
        &mut self,
        proxy: &Proxy,
        name: &str,
        value: impl Into<Value>,
    ) -> Result<(), FrontendError> {
        let property = proxy.descriptor().property(name).ok_or_else(|| {
            FrontendError::UnknownProperty {
                type_name: proxy.type_name().to_string(),
                property: name.to_string(),
            }
        })?;
        if !property.writable {
            return Err(FrontendError::ReadOnlyProperty {
                type_name: proxy.type_name().to_string(),
                property: name.to_string(),
            });
        }
        self.invoke(proxy, &setter_name(name), vec![value.into()])
            .await
    }

    /// Calls a method without waiting for or wanting its result.
    pub async fn invoke(
        &mut self,
        proxy: &Proxy,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), FrontendError> {
        self.check_ready()?;
        check_call(proxy, method, args.len())?;
        tracing::debug!("[conn {}] Invoking {}.{}", self.id, proxy.identifier(), method);
        self.outbox.push(Message::Invoke {
            identifier: proxy.identifier().to_string(),
            method: method.to_string(),
            parameters: args.iter().map(Value::to_json).collect(),
            return_id: None,
        });
        self.send_pending().await
    }

    /// Calls a method and returns a handle to its eventual result.
    pub async fn invoke_with_return(
        &mut self,
        proxy: &Proxy,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Invocation, FrontendError> {
        self.check_ready()?;
        check_call(proxy, method, args.len())?;
        let invocation = self.router.register();
        tracing::debug!(
            "[conn {}] Invoking returnable call {} on {}.{}",
            self.id,
            invocation.id(),
            proxy.identifier(),
            method
        );
        self.outbox.push(Message::Invoke {
            identifier: proxy.identifier().to_string(),
            method: method.to_string(),
            parameters: args.iter().map(Value::to_json).collect(),
            return_id: Some(invocation.id().to_string()),
        });
        self.send_pending().await?;
        Ok(invocation)
    }

    /// Calls a method and blocks for its result.
    pub async fn call(
        &mut self,
        proxy: &Proxy,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, FrontendError> {
        let mut invocation = self.invoke_with_return(proxy, method, args).await?;
        let id = invocation.id().to_string();
        self.wait_for_message("invoke_return", move |m| {
            matches!(m, Message::InvokeReturn { return_id, .. } if *return_id == id)
        })
        .await?;
        match invocation.try_result() {
            Some(result) => result.map_err(FrontendError::from),
            None => Err(InvokeError::Cancelled("no result delivered".to_string()).into()),
        }
    }

    /// Sends pending releases and closes the stream.
    pub async fn close(&mut self) -> Result<(), FrontendError> {
        self.check_usable()?;
        let result = self.flush().await;
        self.settle(result).await?;
        self.failure = Some("closed by application".to_string());
        self.router.fail_all("connection closed");
        self.closed = true;
        self.stream.shutdown().await?;
        Ok(())
    }

    fn check_usable(&self) -> Result<(), FrontendError> {
        match &self.failure {
            Some(reason) => Err(FrontendError::ConnectionFailed(reason.clone())),
            None => Ok(()),
        }
    }

    fn check_ready(&self) -> Result<(), FrontendError> {
        self.check_usable()?;
        if !self.machine.is_ready() {
            return Err(FrontendError::NotReady);
        }
        Ok(())
    }

    async fn send_pending(&mut self) -> Result<(), FrontendError> {
        let result = self.flush().await;
        self.settle(result).await
    }

    /// Reads once and handles every complete message.
    async fn read_some(&mut self) -> Result<(), FrontendError> {
        let n = self.stream.read(&mut self.read_buf).await?;
        if n == 0 {
            self.decoder.finish()?;
            return Err(FrontendError::ConnectionClosed);
        }
        tracing::trace!("[conn {}] Received {} bytes", self.id, n);
        self.decoder.extend(&self.read_buf[..n]);
        while let Some(message) = self.decoder.decode_message()? {
            self.dispatch(message)?;
        }
        Ok(())
    }

    /// Handles `message` now or queues it. Returns whether it was handled.
    fn dispatch(&mut self, message: Message) -> Result<bool, FrontendError> {
        if message.direction() != Direction::ToConsumer {
            return Err(FrontendError::UnexpectedCommand(message.command()));
        }
        match self.machine.admit(&message) {
            Admission::Queue => {
                self.machine.queue(message);
                Ok(false)
            }
            Admission::Deliver => {
                self.machine.delivered(&message);
                self.handle_message(message)?;
                Ok(true)
            }
        }
    }

    /// Replays queued messages in arrival order. Returns how many were
    /// handled; the rest are queued again.
    fn replay_pending(&mut self) -> Result<usize, FrontendError> {
        let pending = self.machine.take_pending();
        if pending.is_empty() {
            return Ok(0);
        }
        tracing::debug!("[conn {}] Handling {} queued messages", self.id, pending.len());
        let mut delivered = 0;
        for message in pending {
            if self.dispatch(message)? {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    fn handle_message(&mut self, message: Message) -> Result<(), FrontendError> {
        tracing::debug!("[conn {}] Handling {}", self.id, message.command());
        match message {
            Message::Version { version } => {
                if version != PROTOCOL_VERSION {
                    return Err(FrontendError::UnsupportedVersion(version));
                }
                tracing::info!("[conn {}] Connected to backend version {}", self.id, version);
                self.version = Some(version);
                self.machine.version_received();
                self.replay_pending()?;
            }
            Message::Register { types, singletons } => {
                self.instantiable = types.iter().map(|t| t.name.clone()).collect();
                for descriptor in types {
                    self.types.insert(descriptor);
                }
                for reference in singletons.values() {
                    if let Some(TypeRef::Full(descriptor)) = &reference.type_ref {
                        self.types.insert(descriptor.clone());
                    }
                }
                tracing::info!(
                    "[conn {}] Registered {} types and {} singletons",
                    self.id,
                    self.instantiable.len(),
                    singletons.len()
                );
                self.singleton_refs = singletons;
                self.machine.registered();
                self.replay_pending()?;
            }
            Message::Sync { serial } => {
                if self.machine.has_pending() {
                    // Acknowledge only once everything received before it
                    // has been handled.
                    self.machine.queue(Message::Sync { serial });
                } else {
                    self.collect_releases();
                    self.outbox.push(Message::SyncAck { serial });
                }
            }
            Message::ObjectReset { identifier, data } => match self.proxies.live(&identifier) {
                Some(proxy) => {
                    for property in proxy.reset_data(data) {
                        proxy.deliver(&format!("{}Changed", property), &[]);
                    }
                }
                None => {
                    tracing::debug!("[conn {}] Ignoring reset of unknown object {}", self.id, identifier);
                }
            },
            Message::Emit {
                identifier,
                method,
                parameters,
            } => {
                let Some(proxy) = self.proxies.live(&identifier) else {
                    tracing::debug!("[conn {}] Ignoring {} on unknown object {}", self.id, method, identifier);
                    return Ok(());
                };
                let expected = match proxy.descriptor().signal(&method) {
                    Some(signal) => signal.params.len(),
                    None => {
                        tracing::warn!("Signal {} does not exist on {}", method, proxy.type_name());
                        return Ok(());
                    }
                };
                if expected != parameters.len() {
                    tracing::warn!(
                        "Signal {} emitted with {} parameters, expected {}",
                        method,
                        parameters.len(),
                        expected
                    );
                    return Ok(());
                }
                let args: Vec<Value> = parameters.iter().map(|p| self.to_value(p)).collect();
                proxy.deliver(&method, &args);
            }
            Message::InvokeReturn {
                identifier,
                return_id,
                value,
                error,
            } => {
                if !self.router.is_pending(&return_id) {
                    tracing::debug!(
                        "[conn {}] No pending invocation {} on {}",
                        self.id,
                        return_id,
                        identifier
                    );
                    return Ok(());
                }
                let result = match error {
                    Some(error) => {
                        tracing::debug!("[conn {}] Call {} returned error: {}", self.id, return_id, error);
                        Err(InvokeError::Remote(error))
                    }
                    None => {
                        let values = value.unwrap_or_default();
                        Ok(unwrap_return(values.iter().map(|v| self.to_value(v)).collect()))
                    }
                };
                self.router.resolve(&return_id, result);
            }
            other => return Err(FrontendError::UnexpectedCommand(other.command())),
        }
        Ok(())
    }

    fn to_value(&mut self, json: &Json) -> Value {
        let Self {
            proxies,
            types,
            outbox,
            ..
        } = self;
        Value::from_json(json, &mut |reference: &ObjectRef| {
            Some(ensure_proxy(proxies, types, outbox, reference))
        })
    }

    fn ensure_proxy(&mut self, reference: &ObjectRef) -> Proxy {
        ensure_proxy(&mut self.proxies, &mut self.types, &mut self.outbox, reference)
    }

    fn collect_releases(&mut self) {
        for identifier in self.proxies.take_releases() {
            tracing::debug!("[conn {}] Releasing {}", self.id, identifier);
            self.outbox.push(Message::ObjectDeref { identifier });
        }
    }

    /// Writes queued messages, releases last.
    async fn flush(&mut self) -> Result<(), FrontendError> {
        self.collect_releases();
        if self.outbox.is_empty() {
            return Ok(());
        }
        let mut buf = BytesMut::new();
        for message in self.outbox.drain(..) {
            tracing::debug!("[conn {}] Sending {}", self.id, message.command());
            buf.extend_from_slice(&Encoder::encode_message(&message)?);
        }
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn settle<T>(&mut self, result: Result<T, FrontendError>) -> Result<T, FrontendError> {
        match result {
            Err(e) if e.is_fatal() => Err(self.fail(e).await),
            other => other,
        }
    }

    /// Ends the connection: stores the reason, rejects pending invocations
    /// and closes the stream.
    async fn fail(&mut self, error: FrontendError) -> FrontendError {
        if matches!(error, FrontendError::ConnectionFailed(_)) {
            return error;
        }
        match &error {
            FrontendError::ConnectionClosed => {
                tracing::info!("[conn {}] Connection closed by backend", self.id)
            }
            e => tracing::error!("[conn {}] Connection failed: {}", self.id, e),
        }
        let reason = error.to_string();
        if self.failure.is_none() {
            self.failure = Some(reason.clone());
        }
        self.router.fail_all(&reason);
        self.outbox.clear();
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown().await;
        }
        error
    }
}

fn ensure_proxy(
    proxies: &mut ProxyTable,
    types: &mut TypeCache,
    outbox: &mut Vec<Message>,
    reference: &ObjectRef,
) -> Proxy {
    if let Some(proxy) = proxies.live(&reference.identifier) {
        return proxy;
    }
    let descriptor = types.resolve(reference.type_ref.as_ref());
    let proxy = proxies.insert(&reference.identifier, descriptor, false);
    outbox.push(Message::ObjectRef {
        identifier: reference.identifier.clone(),
    });
    proxy
}

fn check_call(proxy: &Proxy, method: &str, argc: usize) -> Result<(), FrontendError> {
    let declared = proxy
        .descriptor()
        .method(method)
        .ok_or_else(|| FrontendError::UnknownMethod {
            type_name: proxy.type_name().to_string(),
            method: method.to_string(),
        })?;
    if declared.params.len() != argc {
        return Err(FrontendError::ArgumentCount {
            method: method.to_string(),
            expected: declared.params.len(),
            actual: argc,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use objsync_protocol::ValueKind;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;
    use tokio::io::DuplexStream;

    fn frame(message: &Message) -> Vec<u8> {
        Encoder::encode_message(message).unwrap().to_vec()
    }

    fn root_type() -> TypeDescriptor {
        TypeDescriptor::builder("Root")
            .property("count", ValueKind::Int)
            .property("child", ValueKind::Object)
            .writable_property("title", ValueKind::String)
            .method("add", &[ValueKind::Int])
            .signal("died", &[("why", ValueKind::String)])
            .build()
    }

    fn leaf_type() -> TypeDescriptor {
        TypeDescriptor::builder("Leaf")
            .property("label", ValueKind::String)
            .build()
    }

    fn register() -> Message {
        let mut singletons = BTreeMap::new();
        singletons.insert(
            "Root".to_string(),
            ObjectRef::new("Root", Some(TypeRef::Full(root_type()))),
        );
        Message::Register {
            types: vec![leaf_type()],
            singletons,
        }
    }

    fn data(value: Json) -> serde_json::Map<String, Json> {
        match value {
            Json::Object(map) => map,
            _ => unreachable!(),
        }
    }

    /// Scripted backend on the other end of a duplex pipe.
    struct Peer {
        stream: DuplexStream,
        decoder: Decoder,
    }

    impl Peer {
        async fn send(&mut self, message: Message) {
            self.stream.write_all(&frame(&message)).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            let mut buf = [0u8; 4096];
            loop {
                if let Some(message) = self.decoder.decode_message().unwrap() {
                    return message;
                }
                let n = tokio::time::timeout(Duration::from_secs(2), self.stream.read(&mut buf))
                    .await
                    .expect("timed out waiting for the frontend")
                    .unwrap();
                assert!(n > 0, "frontend closed the stream");
                self.decoder.extend(&buf[..n]);
            }
        }

        async fn handshake(&mut self) {
            self.send(Message::Version {
                version: PROTOCOL_VERSION,
            })
            .await;
            self.send(register()).await;
        }
    }

    fn pair() -> (Connection<DuplexStream>, Peer) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let peer = Peer {
            stream: theirs,
            decoder: Decoder::new(),
        };
        (Connection::new(ours), peer)
    }

    async fn ready_pair() -> (Connection<DuplexStream>, Peer) {
        let (mut conn, mut peer) = pair();
        peer.handshake().await;
        conn.handshake().await.unwrap();
        (conn, peer)
    }

    #[test]
    fn test_config_defaults() {
        let config = ConnectionConfig::new();
        assert_eq!(config.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        assert_eq!(config.sync_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_config_buffer_clamping() {
        let config = ConnectionConfig::new().with_read_buffer_size(100);
        assert_eq!(config.read_buffer_size, MIN_READ_BUFFER_SIZE);

        let config = ConnectionConfig::new().with_read_buffer_size(10 * 1024 * 1024);
        assert_eq!(config.read_buffer_size, MAX_READ_BUFFER_SIZE);
    }

    #[tokio::test]
    async fn test_handshake_from_script() {
        let mock = tokio_test::io::Builder::new()
            .read(&frame(&Message::Version {
                version: PROTOCOL_VERSION,
            }))
            .read(&frame(&register()))
            .write(&frame(&Message::ObjectRef {
                identifier: "Root".into(),
            }))
            .build();
        let mut conn = Connection::new(mock);

        assert_eq!(conn.state(), ConnectionState::AwaitVersion);
        conn.handshake().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::Ready);
        assert_eq!(conn.version(), Some(PROTOCOL_VERSION));
        assert_eq!(conn.instantiable_types(), ["Leaf".to_string()]);
        assert_eq!(conn.singleton_names().collect::<Vec<_>>(), vec!["Root"]);

        let root = conn.singleton("Root").await.unwrap();
        assert_eq!(root.type_name(), "Root");
        // Singletons are kept alive; asking again sends nothing.
        assert!(conn.singleton("Root").await.unwrap().ptr_eq(&root));
        assert!(matches!(
            conn.singleton("Nope").await,
            Err(FrontendError::UnknownSingleton(_))
        ));
    }

    #[tokio::test]
    async fn test_early_messages_are_queued_until_ready() {
        let (mut conn, mut peer) = pair();
        peer.handshake().await;
        peer.send(Message::Emit {
            identifier: "Root".into(),
            method: "died".into(),
            parameters: vec![json!("early")],
        })
        .await;
        peer.send(Message::Sync { serial: 1 }).await;

        conn.ensure_registered().await.unwrap();
        assert_eq!(conn.state(), ConnectionState::AwaitReady);
        assert!(matches!(conn.singleton("Root").await, Err(FrontendError::NotReady)));

        // Both arrive while registration is awaited, then wait for ready.
        while conn.pending_messages() < 2 {
            conn.process_next().await.unwrap();
        }

        conn.mark_ready().await.unwrap();
        assert_eq!(conn.pending_messages(), 0);
        assert_eq!(peer.recv().await, Message::SyncAck { serial: 1 });
    }

    #[tokio::test]
    async fn test_property_blocks_for_first_snapshot() {
        let (mut conn, mut peer) = ready_pair().await;
        let root = conn.singleton("Root").await.unwrap();
        assert_eq!(peer.recv().await, Message::ObjectRef { identifier: "Root".into() });

        let changes = Rc::new(Cell::new(0));
        let seen = changes.clone();
        root.connect("countChanged", move |_| seen.set(seen.get() + 1))
            .unwrap();

        let child = json!({"tag": "object", "identifier": "c1", "type": {"name": "Leaf", "omitted": true}});
        let (count, _) = tokio::join!(conn.property(&root, "count"), async {
            assert_eq!(peer.recv().await, Message::ObjectQuery { identifier: "Root".into() });
            peer.send(Message::ObjectReset {
                identifier: "Root".into(),
                data: data(json!({"count": 0, "child": child, "title": "t"})),
            })
            .await;
        });
        assert_eq!(count.unwrap(), Value::Int(0));
        // The answer to our own query is not a change.
        assert_eq!(changes.get(), 0);

        // Reading an object property acquires it.
        let leaf = conn
            .property(&root, "child")
            .await
            .unwrap()
            .as_proxy()
            .unwrap()
            .clone();
        assert_eq!(leaf.type_name(), "Leaf");
        assert_eq!(peer.recv().await, Message::ObjectRef { identifier: "c1".into() });

        // A spontaneous reset notifies.
        peer.send(Message::ObjectReset {
            identifier: "Root".into(),
            data: data(json!({"count": 1, "child": child, "title": "t"})),
        })
        .await;
        conn.process_next().await.unwrap();
        assert_eq!(changes.get(), 1);
        assert_eq!(conn.property(&root, "count").await.unwrap(), Value::Int(1));

        // Dropping the last handle releases exactly once.
        drop(leaf);
        conn.invoke(&root, "add", vec![Value::Int(2)]).await.unwrap();
        assert!(matches!(peer.recv().await, Message::Invoke { .. }));
        assert_eq!(peer.recv().await, Message::ObjectDeref { identifier: "c1".into() });
    }

    #[tokio::test]
    async fn test_wait_holds_back_other_traffic() {
        let (mut conn, mut peer) = ready_pair().await;
        let root = conn.singleton("Root").await.unwrap();
        assert_eq!(peer.recv().await, Message::ObjectRef { identifier: "Root".into() });

        let deaths = Rc::new(Cell::new(0));
        let seen = deaths.clone();
        root.connect("died", move |_| seen.set(seen.get() + 1)).unwrap();

        let (count, _) = tokio::join!(conn.property(&root, "count"), async {
            assert_eq!(peer.recv().await, Message::ObjectQuery { identifier: "Root".into() });
            peer.send(Message::Emit {
                identifier: "Root".into(),
                method: "died".into(),
                parameters: vec![json!("meanwhile")],
            })
            .await;
            peer.send(Message::Sync { serial: 3 }).await;
            peer.send(Message::ObjectReset {
                identifier: "Root".into(),
                data: data(json!({"count": 7, "child": null, "title": "t"})),
            })
            .await;
        });
        assert_eq!(count.unwrap(), Value::Int(7));
        assert!(!conn.machine.is_waiting());
        assert_eq!(conn.pending_messages(), 2);
        assert_eq!(deaths.get(), 0);

        conn.process_next().await.unwrap();
        assert_eq!(deaths.get(), 1);
        assert_eq!(conn.pending_messages(), 0);
        assert_eq!(peer.recv().await, Message::SyncAck { serial: 3 });
    }

    #[tokio::test]
    async fn test_sync_is_acked_after_pending_and_releases() {
        let (mut conn, mut peer) = ready_pair().await;
        let root = conn.singleton("Root").await.unwrap();
        assert_eq!(peer.recv().await, Message::ObjectRef { identifier: "Root".into() });

        let (result, _) = tokio::join!(conn.property(&root, "child"), async {
            peer.recv().await;
            // Queued behind the wait, so the ack must wait too.
            peer.send(Message::Sync { serial: 7 }).await;
            peer.send(Message::ObjectReset {
                identifier: "Root".into(),
                data: data(json!({"child": {"tag": "object", "identifier": "c1", "type": leaf_type()}})),
            })
            .await;
        });
        let child = result.unwrap();
        assert_eq!(peer.recv().await, Message::ObjectRef { identifier: "c1".into() });
        assert_eq!(conn.pending_messages(), 1);
        assert_eq!(conn.types().get("Leaf").unwrap().name, "Leaf");

        drop(child);
        conn.process_next().await.unwrap();
        assert_eq!(peer.recv().await, Message::ObjectDeref { identifier: "c1".into() });
        assert_eq!(peer.recv().await, Message::SyncAck { serial: 7 });
    }

    #[tokio::test]
    async fn test_dying_proxy_is_replaced_not_released() {
        let (mut conn, mut peer) = ready_pair().await;
        let root = conn.singleton("Root").await.unwrap();
        peer.recv().await;
        peer.send(Message::ObjectReset {
            identifier: "Root".into(),
            data: data(json!({"child": {"tag": "object", "identifier": "c1", "type": leaf_type()}})),
        })
        .await;
        conn.process_next().await.unwrap();

        let first = conn.property(&root, "child").await.unwrap();
        assert_eq!(peer.recv().await, Message::ObjectRef { identifier: "c1".into() });
        drop(first);
        let second = conn.property(&root, "child").await.unwrap();
        assert_eq!(peer.recv().await, Message::ObjectRef { identifier: "c1".into() });

        // The first instance's release is dropped; the second's is sent.
        drop(second);
        conn.invoke(&root, "add", vec![Value::Int(1)]).await.unwrap();
        assert!(matches!(peer.recv().await, Message::Invoke { .. }));
        assert_eq!(peer.recv().await, Message::ObjectDeref { identifier: "c1".into() });
    }

    #[tokio::test]
    async fn test_signals_and_returns() {
        let (mut conn, mut peer) = ready_pair().await;
        let root = conn.singleton("Root").await.unwrap();
        peer.recv().await;

        let why = Rc::new(std::cell::RefCell::new(String::new()));
        let seen = why.clone();
        root.connect("died", move |args| {
            *seen.borrow_mut() = args[0].as_str().unwrap_or_default().to_string();
        })
        .unwrap();

        peer.send(Message::Emit {
            identifier: "Root".into(),
            method: "died".into(),
            parameters: vec![json!("old age")],
        })
        .await;
        // Wrong arity is dropped with a warning.
        peer.send(Message::Emit {
            identifier: "Root".into(),
            method: "died".into(),
            parameters: vec![],
        })
        .await;
        conn.process_next().await.unwrap();
        assert_eq!(*why.borrow(), "old age");

        let (result, _) = tokio::join!(conn.call(&root, "add", vec![Value::Int(2)]), async {
            let Message::Invoke { return_id, parameters, .. } = peer.recv().await else {
                panic!("expected INVOKE");
            };
            assert_eq!(parameters, vec![json!(2)]);
            peer.send(Message::InvokeReturn {
                identifier: "Root".into(),
                return_id: return_id.unwrap(),
                value: Some(vec![json!(3)]),
                error: None,
            })
            .await;
        });
        assert_eq!(result.unwrap(), Value::Int(3));

        let (result, _) = tokio::join!(conn.call(&root, "add", vec![Value::Int(2)]), async {
            let Message::Invoke { return_id, .. } = peer.recv().await else {
                panic!("expected INVOKE");
            };
            peer.send(Message::InvokeReturn {
                identifier: "Root".into(),
                return_id: return_id.unwrap(),
                value: None,
                error: Some("overflow".into()),
            })
            .await;
        });
        let err = result.unwrap_err();
        assert!(!err.is_fatal());
        assert!(matches!(err, FrontendError::Invoke(InvokeError::Remote(ref e)) if e == "overflow"));
        assert!(conn.failure().is_none());
    }

    #[tokio::test]
    async fn test_local_checks_keep_connection_usable() {
        let (mut conn, mut peer) = ready_pair().await;
        let root = conn.singleton("Root").await.unwrap();
        peer.recv().await;

        assert!(matches!(
            conn.invoke(&root, "nope", vec![]).await,
            Err(FrontendError::UnknownMethod { .. })
        ));
        assert!(matches!(
            conn.invoke(&root, "add", vec![]).await,
            Err(FrontendError::ArgumentCount { expected: 1, actual: 0, .. })
        ));
        assert!(matches!(
            conn.property(&root, "nope").await,
            Err(FrontendError::UnknownProperty { .. })
        ));
        assert!(matches!(
            conn.set_property(&root, "count", 3).await,
            Err(FrontendError::ReadOnlyProperty { .. })
        ));
        assert!(matches!(
            conn.create("Root").await,
            Err(FrontendError::UnknownType(_))
        ));
        assert!(conn.failure().is_none());

        conn.set_property(&root, "title", "hello").await.unwrap();
        assert_eq!(
            peer.recv().await,
            Message::Invoke {
                identifier: "Root".into(),
                method: "setTitle".into(),
                parameters: vec![json!("hello")],
                return_id: None,
            }
        );

        let leaf = conn.create("Leaf").await.unwrap();
        assert!(leaf.is_instantiated());
        assert_eq!(
            peer.recv().await,
            Message::ObjectCreate {
                identifier: leaf.identifier().to_string(),
                type_name: "Leaf".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_timeout_is_fatal_and_rejects_pending() {
        let (conn, mut peer) = pair();
        let mut conn = conn.with_config(ConnectionConfig::new().with_sync_timeout(Duration::from_millis(50)));
        peer.handshake().await;
        conn.handshake().await.unwrap();
        let root = conn.singleton("Root").await.unwrap();

        let pending = conn.invoke_with_return(&root, "add", vec![Value::Int(1)]).await.unwrap();
        assert_eq!(conn.pending_invocations(), 1);

        let err = conn.property(&root, "count").await.unwrap_err();
        assert!(matches!(err, FrontendError::Timeout("object_reset")));
        assert!(conn.failure().is_some());
        assert_eq!(conn.pending_invocations(), 0);
        assert!(matches!(pending.result().await, Err(InvokeError::Cancelled(_))));
        assert!(matches!(
            conn.process_next().await,
            Err(FrontendError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_fatal_peer_behaviour() {
        let (mut conn, mut peer) = pair();
        peer.send(Message::Version { version: 99 }).await;
        assert!(matches!(
            conn.ensure_version().await,
            Err(FrontendError::UnsupportedVersion(99))
        ));

        let (mut conn, mut peer) = ready_pair().await;
        peer.send(Message::ObjectQuery { identifier: "Root".into() }).await;
        assert!(matches!(
            conn.process_next().await,
            Err(FrontendError::UnexpectedCommand("OBJECT_QUERY"))
        ));

        let (mut conn, mut peer) = ready_pair().await;
        peer.stream.write_all(b"x {}\n").await.unwrap();
        assert!(matches!(conn.process_next().await, Err(FrontendError::Protocol(_))));

        let (mut conn, peer) = ready_pair().await;
        drop(peer);
        conn.run().await.unwrap();
        assert!(conn.failure().is_some());
    }
}
