//! Owning side of one objsync connection.
//!
//! A dedicated reader task frames incoming bytes and queues complete
//! payloads. Objects are only touched while the application drives the
//! connection, either with [`Connection::readable`] and
//! [`Connection::process`] or with the blocking [`Connection::run`] loop.

use crate::config::{Config, LimitsConfig, SyncConfig};
use crate::error::{BackendError, MethodError};
use crate::object::{Args, BackendObject, LocalEvent, Object, ObjectHandle};
use crate::registry::Registry;
use crate::sync::SyncState;
use crate::types::descriptor_of;
use crate::value::{Value, VisitObjects};
use bytes::Bytes;
use objsync_protocol::{
    Decoder, Encoder, Message, ObjectId, ObjectRef, ProtocolError, TypeDescriptor, TypeRef,
    PROTOCOL_VERSION,
};
use serde_json::{Map, Value as Json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Read buffer size of the reader task (8 KiB).
pub const READ_BUFFER_SIZE: usize = 8 * 1024;

/// Capacity of the queue between the reader task and the connection.
pub const INBOUND_QUEUE_CAPACITY: usize = 128;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type InboundFrame = Result<Bytes, ProtocolError>;
type Factory = Box<dyn Fn() -> ObjectHandle + Send>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection tuning.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    pub sync: SyncConfig,
    pub limits: LimitsConfig,
}

impl ConnectionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            sync: config.sync.clone(),
            limits: config.limits.clone(),
        }
    }

    pub fn with_sync(mut self, sync: SyncConfig) -> Self {
        self.sync = sync;
        self
    }

    pub fn with_max_types(mut self, max_types: usize) -> Self {
        self.limits.max_types = max_types;
        self
    }
}

struct InstantiableType {
    descriptor: Arc<TypeDescriptor>,
    factory: Factory,
}

enum Step {
    Frame(InboundFrame),
    Event(LocalEvent),
    Tick,
}

/// Backend end of a connection.
pub struct Connection {
    id: u64,
    options: ConnectionOptions,
    reader: Option<BoxedReader>,
    writer: Option<BoxedWriter>,
    reader_task: Option<JoinHandle<()>>,
    inbound: Option<mpsc::Receiver<InboundFrame>>,
    frames: VecDeque<InboundFrame>,
    events_tx: mpsc::UnboundedSender<LocalEvent>,
    events_rx: mpsc::UnboundedReceiver<LocalEvent>,
    deferred: VecDeque<LocalEvent>,
    registry: Registry,
    sync: SyncState,
    types: Vec<InstantiableType>,
    singletons: Vec<(String, ObjectHandle)>,
    started: bool,
    failure: Option<String>,
}

impl Connection {
    /// Creates a connection over a duplex stream.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self::new_split(reader, writer)
    }

    /// Creates a connection over separate read and write halves, e.g.
    /// stdin and stdout.
    pub fn new_split<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let options = ConnectionOptions::default();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id,
            registry: Registry::new(id, events_tx.clone(), options.sync.grace_period()),
            sync: SyncState::new(Instant::now()),
            options,
            reader: Some(Box::new(reader)),
            writer: Some(Box::new(writer)),
            reader_task: None,
            inbound: None,
            frames: VecDeque::new(),
            events_tx,
            events_rx,
            deferred: VecDeque::new(),
            types: Vec::new(),
            singletons: Vec::new(),
            started: false,
            failure: None,
        }
    }

    /// Applies tuning. Only meaningful before [`Connection::start`].
    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        if !self.started {
            self.registry = Registry::new(
                self.id,
                self.events_tx.clone(),
                options.sync.grace_period(),
            );
        }
        self.options = options;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Reason of the fatal error that ended the connection, if any.
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Looks up an active object.
    pub fn object(&self, id: &str) -> Option<ObjectHandle> {
        self.registry.get(id).cloned()
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.registry.contains(id)
    }

    /// Registers an instantiable type, constructed with `Default`.
    pub fn register_type<T: BackendObject + Default>(&mut self) -> Result<(), BackendError> {
        let descriptor = descriptor_of::<T>();
        let published = descriptor.clone();
        self.add_type(
            descriptor,
            Box::new(move || Object::with_descriptor(T::default(), published.clone()).handle()),
        )
    }

    /// Registers an instantiable type under `name`, constructed by `factory`.
    pub fn register_type_with<T, F>(&mut self, name: &str, factory: F) -> Result<(), BackendError>
    where
        T: BackendObject,
        F: Fn() -> T + Send + 'static,
    {
        let base = descriptor_of::<T>();
        let descriptor = if base.name == name {
            base
        } else {
            Arc::new(base.renamed(name))
        };
        let published = descriptor.clone();
        self.add_type(
            descriptor,
            Box::new(move || Object::with_descriptor(factory(), published.clone()).handle()),
        )
    }

    fn add_type(&mut self, descriptor: Arc<TypeDescriptor>, factory: Factory) -> Result<(), BackendError> {
        let name = descriptor.name.clone();
        if self.started {
            return Err(BackendError::AlreadyStarted(name));
        }
        if self.types.iter().any(|t| t.descriptor.name == name) {
            return Err(BackendError::DuplicateType(name));
        }
        if self.types.len() >= self.options.limits.max_types {
            return Err(BackendError::TooManyTypes {
                name,
                max: self.options.limits.max_types,
            });
        }
        tracing::debug!("[conn {}] Registered type {}", self.id, name);
        self.types.push(InstantiableType { descriptor, factory });
        Ok(())
    }

    /// Registers a singleton root, published under `name` as its identifier.
    pub fn register_singleton(
        &mut self,
        name: &str,
        object: impl Into<ObjectHandle>,
    ) -> Result<(), BackendError> {
        if self.started {
            return Err(BackendError::AlreadyStarted(name.to_string()));
        }
        if !name.chars().next().is_some_and(char::is_uppercase) {
            return Err(BackendError::InvalidSingletonName(name.to_string()));
        }
        if self.singletons.iter().any(|(n, _)| n == name) {
            return Err(BackendError::DuplicateSingleton(name.to_string()));
        }
        self.singletons.push((name.to_string(), object.into()));
        Ok(())
    }

    /// Starts the reader task and sends the handshake: VERSION, then REGISTER.
    pub async fn start(&mut self) -> Result<(), BackendError> {
        self.check_usable()?;
        if self.started {
            return Ok(());
        }
        self.started = true;
        self.spawn_reader();

        match self.send_handshake().await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e).await),
        }
    }

    fn spawn_reader(&mut self) {
        let Some(reader) = self.reader.take() else {
            return;
        };
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        self.inbound = Some(rx);
        self.reader_task = Some(tokio::spawn(read_frames(self.id, reader, tx)));
    }

    async fn send_handshake(&mut self) -> Result<(), BackendError> {
        let now = Instant::now();
        let mut singletons = BTreeMap::new();
        for (name, handle) in self.singletons.clone() {
            self.registry.activate_as(&handle, &name, now)?;
            self.registry.mark_singleton(&name);
            let type_ref = TypeRef::Full(handle.descriptor().as_ref().clone());
            singletons.insert(name.clone(), ObjectRef::new(name, Some(type_ref)));
        }
        let types: Vec<TypeDescriptor> = self
            .types
            .iter()
            .map(|t| t.descriptor.as_ref().clone())
            .collect();

        self.send(&Message::Version {
            version: PROTOCOL_VERSION,
        })
        .await?;
        self.send(&Message::Register {
            types: types.clone(),
            singletons: singletons.clone(),
        })
        .await?;

        // REGISTER carried these in full.
        for descriptor in &types {
            self.registry.acknowledge_type(&descriptor.name);
        }
        for reference in singletons.values() {
            if let Some(type_ref) = &reference.type_ref {
                self.registry.acknowledge_type(type_ref.name());
            }
        }

        tracing::info!(
            "[conn {}] Started with {} types and {} singletons",
            self.id,
            types.len(),
            singletons.len()
        );
        Ok(())
    }

    /// Waits until there is something for [`Connection::process`] to do.
    pub async fn readable(&mut self) -> Result<(), BackendError> {
        self.check_usable()?;
        if !self.started {
            return Err(BackendError::NotStarted);
        }
        if !self.frames.is_empty() || !self.deferred.is_empty() {
            return Ok(());
        }
        match self.next_step().await {
            Step::Frame(frame) => self.frames.push_back(frame),
            Step::Event(event) => self.deferred.push_back(event),
            Step::Tick => {}
        }
        Ok(())
    }

    /// Handles every queued message and notification, then starts a sync
    /// epoch if one is due. Never waits for the peer.
    pub async fn process(&mut self) -> Result<(), BackendError> {
        self.check_usable()?;
        if !self.started {
            return Err(BackendError::NotStarted);
        }

        if let Some(inbound) = self.inbound.as_mut() {
            while let Ok(frame) = inbound.try_recv() {
                self.frames.push_back(frame);
            }
        }

        loop {
            while let Ok(event) = self.events_rx.try_recv() {
                self.deferred.push_back(event);
            }
            let result = if let Some(event) = self.deferred.pop_front() {
                self.handle_event(event).await
            } else if let Some(frame) = self.frames.pop_front() {
                self.handle_frame(frame).await
            } else {
                break;
            };
            self.settle(result).await?;
        }

        let result = self.maybe_sync().await;
        self.settle(result).await
    }

    /// Starts the connection if needed and serves it until the peer
    /// disconnects or a fatal error occurs.
    pub async fn run(&mut self) -> Result<(), BackendError> {
        self.start().await?;
        loop {
            let result = match self.next_step().await {
                Step::Frame(frame) => self.handle_frame(frame).await,
                Step::Event(event) => self.handle_event(event).await,
                Step::Tick => Ok(()),
            };
            let result = match result {
                Ok(()) => self.maybe_sync().await,
                Err(e) => Err(e),
            };
            match self.settle(result).await {
                Ok(()) => {}
                Err(BackendError::ConnectionClosed) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Starts a sync epoch now. Returns false if one is already in flight.
    pub async fn sync(&mut self) -> Result<bool, BackendError> {
        self.check_usable()?;
        if !self.started {
            return Err(BackendError::NotStarted);
        }
        let result = self.start_epoch().await;
        match result {
            Ok(started) => Ok(started),
            Err(e) => Err(self.fail(e).await),
        }
    }

    async fn next_step(&mut self) -> Step {
        let deadline = if self.sync.in_flight().is_none() && self.registry.has_pending_release() {
            Some(self.sync.interval_deadline(&self.options.sync))
        } else {
            None
        };

        tokio::select! {
            frame = recv_frame(&mut self.inbound) => match frame {
                Some(frame) => Step::Frame(frame),
                None => Step::Frame(Err(ProtocolError::ConnectionClosed)),
            },
            event = self.events_rx.recv() => match event {
                Some(event) => Step::Event(event),
                None => Step::Tick,
            },
            _ = sleep_until(deadline) => Step::Tick,
        }
    }

    async fn handle_frame(&mut self, frame: InboundFrame) -> Result<(), BackendError> {
        let payload = frame?;
        let message = Message::from_slice(&payload)?;
        self.handle_message(message).await
    }

    async fn handle_message(&mut self, message: Message) -> Result<(), BackendError> {
        tracing::debug!(
            "[conn {}] <- {} {}",
            self.id,
            message.command(),
            message.identifier().unwrap_or("")
        );
        let now = Instant::now();

        match message {
            Message::ObjectRef { identifier } => {
                match self.registry.get(&identifier).map(|h| h.type_name().to_string()) {
                    Some(type_name) => {
                        self.registry.set_client_ref(&identifier, true, now);
                        self.registry.acknowledge_type(&type_name);
                    }
                    None => {
                        tracing::warn!("[conn {}] OBJECT_REF for unknown object {}", self.id, identifier)
                    }
                }
                Ok(())
            }
            Message::ObjectDeref { identifier } => {
                if !self.registry.set_client_ref(&identifier, false, now) {
                    tracing::warn!("[conn {}] OBJECT_DEREF for unknown object {}", self.id, identifier);
                }
                Ok(())
            }
            Message::ObjectQuery { identifier } => {
                if !self.registry.contains(&identifier) {
                    return Err(BackendError::UnknownObject {
                        command: "OBJECT_QUERY",
                        identifier,
                    });
                }
                let reset = self.reset_message(&identifier, now)?;
                self.send(&reset).await
            }
            Message::ObjectCreate {
                identifier,
                type_name,
            } => self.create_object(identifier, type_name, now),
            Message::Invoke {
                identifier,
                method,
                parameters,
                return_id,
            } => {
                self.invoke(identifier, method, parameters, return_id, now)
                    .await
            }
            Message::SyncAck { serial } => {
                let removed = self.sync.complete(&mut self.registry, serial, now)?;
                tracing::debug!(
                    "[conn {}] Epoch {} complete, removed {} objects",
                    self.id,
                    serial,
                    removed.len()
                );
                Ok(())
            }
            other => Err(BackendError::UnexpectedCommand(other.command())),
        }
    }

    fn create_object(
        &mut self,
        identifier: ObjectId,
        type_name: String,
        now: Instant,
    ) -> Result<(), BackendError> {
        if self.registry.contains(&identifier) {
            return Err(BackendError::DuplicateIdentifier { identifier });
        }
        let instantiable = self
            .types
            .iter()
            .find(|t| t.descriptor.name == type_name)
            .ok_or_else(|| BackendError::UnknownType(type_name.clone()))?;
        let handle = (instantiable.factory)();
        self.registry.activate_as(&handle, &identifier, now)?;
        self.registry.set_client_ref(&identifier, true, now);
        self.registry.acknowledge_type(&type_name);
        tracing::debug!("[conn {}] Created {} as {}", self.id, type_name, identifier);
        Ok(())
    }

    async fn invoke(
        &mut self,
        identifier: ObjectId,
        method: String,
        parameters: Vec<Json>,
        return_id: Option<String>,
        now: Instant,
    ) -> Result<(), BackendError> {
        let handle = self
            .registry
            .get(&identifier)
            .cloned()
            .ok_or_else(|| BackendError::UnknownObject {
                command: "INVOKE",
                identifier: identifier.clone(),
            })?;
        let expected = handle
            .descriptor()
            .method(&method)
            .map(|m| m.params.len())
            .ok_or_else(|| BackendError::UnknownMethod {
                type_name: handle.type_name().to_string(),
                method: method.clone(),
            })?;

        let result = if expected != parameters.len() {
            Err(MethodError::WrongArgumentCount {
                method: method.clone(),
                expected,
                actual: parameters.len(),
            })
        } else {
            let registry = &self.registry;
            let values = parameters
                .iter()
                .map(|p| Value::from_json(p, &mut |r: &ObjectRef| registry.get(&r.identifier).cloned()))
                .collect();
            handle.invoke(&method, Args::new(method.clone(), values))
        };

        let Some(return_id) = return_id else {
            if let Err(e) = result {
                tracing::warn!("[conn {}] {}.{} failed: {}", self.id, identifier, method, e);
            }
            return Ok(());
        };

        let reply = match result {
            Ok(values) => {
                let encoded = values
                    .iter()
                    .map(|v| self.encode_value(v, now))
                    .collect::<Result<Vec<_>, _>>()?;
                Message::InvokeReturn {
                    identifier,
                    return_id,
                    value: (!encoded.is_empty()).then_some(encoded),
                    error: None,
                }
            }
            Err(e) => Message::InvokeReturn {
                identifier,
                return_id,
                value: None,
                error: Some(e.to_string()),
            },
        };
        self.send(&reply).await
    }

    async fn handle_event(&mut self, event: LocalEvent) -> Result<(), BackendError> {
        let now = Instant::now();
        match event {
            LocalEvent::Reset { identifier } => {
                // Objects the consumer does not hold are re-read on their next query.
                if !self.registry.record(&identifier).is_some_and(|r| r.client_ref) {
                    return Ok(());
                }
                let reset = self.reset_message(&identifier, now)?;
                self.send(&reset).await
            }
            LocalEvent::Emit {
                identifier,
                signal,
                args,
            } => {
                if !self.registry.record(&identifier).is_some_and(|r| r.client_ref) {
                    tracing::debug!(
                        "[conn {}] Suppressed {} on unreferenced {}",
                        self.id,
                        signal,
                        identifier
                    );
                    return Ok(());
                }
                let parameters = args
                    .iter()
                    .map(|a| self.encode_value(a, now))
                    .collect::<Result<Vec<_>, _>>()?;
                self.send(&Message::Emit {
                    identifier,
                    method: signal,
                    parameters,
                })
                .await
            }
        }
    }

    /// Serializes every property of an object and records the objects they
    /// embed as its structural children.
    fn reset_message(&mut self, identifier: &str, now: Instant) -> Result<Message, BackendError> {
        let handle = self
            .registry
            .get(identifier)
            .cloned()
            .ok_or_else(|| BackendError::UnknownObject {
                command: "OBJECT_RESET",
                identifier: identifier.to_string(),
            })?;
        let properties = handle.read_properties();

        let mut children = Vec::new();
        for (_, value) in &properties {
            for child in value.embedded_objects() {
                match self.registry.activate(&child, now) {
                    Ok(id) => children.push(id),
                    Err(e) if !e.is_fatal() => {
                        tracing::warn!("[conn {}] Skipping child of {}: {}", self.id, identifier, e)
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.registry.update_children(identifier, &children, now);

        let mut data = Map::with_capacity(properties.len());
        for (name, value) in properties {
            data.insert(name, self.encode_value(&value, now)?);
        }
        Ok(Message::ObjectReset {
            identifier: identifier.to_string(),
            data,
        })
    }

    fn encode_value(&mut self, value: &Value, now: Instant) -> Result<Json, BackendError> {
        let id = self.id;
        let registry = &mut self.registry;
        value.try_to_json(&mut |handle: &ObjectHandle| match registry.reference(handle, now) {
            Ok(reference) => Ok(reference.to_json()),
            Err(BackendError::ForeignObject(object)) => {
                tracing::warn!("[conn {}] Object {} belongs to another connection", id, object);
                Ok(Json::Null)
            }
            Err(e) => Err(e),
        })
    }

    async fn maybe_sync(&mut self) -> Result<(), BackendError> {
        if self
            .sync
            .is_due(&self.registry, &self.options.sync, Instant::now())
        {
            self.start_epoch().await?;
        }
        Ok(())
    }

    async fn start_epoch(&mut self) -> Result<bool, BackendError> {
        match self.sync.begin(&mut self.registry) {
            Some(serial) => {
                tracing::debug!(
                    "[conn {}] Starting epoch {} with {} objects",
                    self.id,
                    serial,
                    self.registry.len()
                );
                self.send(&Message::Sync { serial }).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn send(&mut self, message: &Message) -> Result<(), BackendError> {
        let writer = self.writer.as_mut().ok_or(BackendError::ConnectionClosed)?;
        let frame = Encoder::encode_message(message)?;
        writer.write_all(&frame).await?;
        writer.flush().await?;
        tracing::debug!(
            "[conn {}] -> {} ({} bytes)",
            self.id,
            message.command(),
            frame.len()
        );
        Ok(())
    }

    fn check_usable(&self) -> Result<(), BackendError> {
        match &self.failure {
            Some(reason) => Err(BackendError::ConnectionFailed(reason.clone())),
            None => Ok(()),
        }
    }

    async fn settle(&mut self, result: Result<(), BackendError>) -> Result<(), BackendError> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal() => Err(self.fail(e).await),
            Err(e) => {
                tracing::warn!("[conn {}] {}", self.id, e);
                Ok(())
            }
        }
    }

    /// Ends the connection after a fatal error. Only the first error is kept.
    async fn fail(&mut self, error: BackendError) -> BackendError {
        let error = match error {
            BackendError::Protocol(ProtocolError::ConnectionClosed) => BackendError::ConnectionClosed,
            other => other,
        };
        if self.failure.is_none() {
            if matches!(error, BackendError::ConnectionClosed) {
                tracing::info!("[conn {}] Connection closed by peer", self.id);
            } else {
                tracing::error!("[conn {}] Connection failed: {}", self.id, error);
            }
            self.failure = Some(error.to_string());
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.inbound = None;
        self.frames.clear();
        self.deferred.clear();
        self.registry.clear();
        error
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(task) = self.reader_task.take() {
            task.abort();
        }
        self.registry.clear();
    }
}

/// Reader task: frames bytes and queues payloads until EOF or an error.
async fn read_frames(id: u64, mut reader: BoxedReader, tx: mpsc::Sender<InboundFrame>) {
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        if n == 0 {
            tracing::debug!("[conn {}] Reader reached EOF", id);
            let end = match decoder.finish() {
                Ok(()) => ProtocolError::ConnectionClosed,
                Err(e) => e,
            };
            let _ = tx.send(Err(end)).await;
            return;
        }

        decoder.extend(&buf[..n]);
        loop {
            match decoder.decode_frame() {
                Ok(Some(frame)) => {
                    if tx.send(Ok(frame.payload)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }
    }
}

async fn recv_frame(inbound: &mut Option<mpsc::Receiver<InboundFrame>>) -> Option<InboundFrame> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}
