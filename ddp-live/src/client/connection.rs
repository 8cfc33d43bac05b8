//! Async connection handle.
//!
//! ```text
//!  Connection (clone) ──cmd──►┐
//!                             │  connection task
//!  ConnectionStream ──event──►├─► LiveDataClient ──outbox──► ConnectionStream
//!                             │        │
//!  timers (heartbeat, flush) ►┘        └──events──► mpsc::UnboundedReceiver<ClientEvent>
//! ```
//!
//! All replica access happens on the connection task. Callers reach it
//! through commands, so the handle is `Clone + Send`.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{ClientError, ClientEvent, LiveDataClient, StreamDirective};
use crate::config::ClientConfig;
use crate::ejson::Value;
use crate::methods::{CallOptions, MethodResult, MethodStub};
use crate::replica::{ObserverId, Replica, ReplicaObserver, ReplicaSnapshot};
use crate::stream::{sleep_until_opt, ConnectionStream, StatusSnapshot, StreamEvent};
use crate::subscriptions::SubscriptionHandle;

type Inspect = Box<dyn FnOnce(&Replica) + Send>;

enum Command {
    Call {
        name: String,
        params: Vec<Value>,
        options: CallOptions,
        reply: oneshot::Sender<MethodResult>,
    },
    Subscribe {
        name: String,
        params: Vec<Value>,
        reply: oneshot::Sender<SubscriptionHandle>,
    },
    Unsubscribe(String),
    RegisterStub {
        name: String,
        stub: Box<dyn MethodStub>,
    },
    Observe {
        collection: String,
        observer: Box<dyn ReplicaObserver>,
        reply: oneshot::Sender<ObserverId>,
    },
    Unobserve {
        collection: String,
        id: ObserverId,
    },
    Inspect(Inspect),
    Disconnect,
}

/// Handle to a live data connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    stream: ConnectionStream,
}

impl Connection {
    /// Start connecting to `config.url`. Must be called within a Tokio
    /// runtime. Events arrive on the returned receiver; none are dropped,
    /// so a caller that keeps the receiver should also drain it.
    pub fn connect(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let capacity = config.event_capacity.max(1);
        let (stream, stream_events) = ConnectionStream::connect(&config.url, config.stream.clone(), capacity);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let core = LiveDataClient::new(config);
        tokio::spawn(run_connection(core, stream.clone(), stream_events, cmd_rx, event_tx));

        (Self { cmd_tx, stream }, event_rx)
    }

    fn send(&self, cmd: Command) -> Result<(), ClientError> {
        self.cmd_tx.send(cmd).map_err(|_| ClientError::Closed)
    }

    /// Call a method and wait for its result.
    pub async fn call(&self, name: &str, params: Vec<Value>) -> Result<Value, ClientError> {
        self.call_with(name, params, CallOptions::default()).await
    }

    pub async fn call_with(&self, name: &str, params: Vec<Value>, options: CallOptions) -> Result<Value, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Call {
            name: name.to_string(),
            params,
            options,
            reply,
        })?;
        let result = rx.await.map_err(|_| ClientError::Closed)?;
        Ok(result?)
    }

    pub async fn subscribe(&self, name: &str, params: Vec<Value>) -> Result<SubscriptionHandle, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Subscribe {
            name: name.to_string(),
            params,
            reply,
        })?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub fn unsubscribe(&self, id: &str) -> Result<(), ClientError> {
        self.send(Command::Unsubscribe(id.to_string()))
    }

    /// Install a stub that simulates `name` against the local replica.
    pub fn register_stub(&self, name: &str, stub: impl MethodStub + 'static) -> Result<(), ClientError> {
        self.send(Command::RegisterStub {
            name: name.to_string(),
            stub: Box::new(stub),
        })
    }

    pub async fn observe(
        &self,
        collection: &str,
        observer: impl ReplicaObserver + 'static,
    ) -> Result<ObserverId, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Observe {
            collection: collection.to_string(),
            observer: Box::new(observer),
            reply,
        })?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    pub fn unobserve(&self, collection: &str, id: ObserverId) -> Result<(), ClientError> {
        self.send(Command::Unobserve {
            collection: collection.to_string(),
            id,
        })
    }

    /// Run `f` against the replica on the connection task.
    pub async fn with_replica<R, F>(&self, f: F) -> Result<R, ClientError>
    where
        F: FnOnce(&Replica) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Inspect(Box::new(move |replica| {
            let _ = reply.send(f(replica));
        })))?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    /// Current contents of one collection, in order.
    pub async fn snapshot(&self, collection: &str) -> Result<ReplicaSnapshot, ClientError> {
        let collection = collection.to_string();
        self.with_replica(move |replica| {
            replica
                .collection(&collection)
                .map(|store| store.snapshot())
                .unwrap_or_default()
        })
        .await
    }

    pub fn status(&self) -> StatusSnapshot {
        self.stream.status()
    }

    pub fn status_receiver(&self) -> watch::Receiver<StatusSnapshot> {
        self.stream.status_receiver()
    }

    /// Reconnect now. A connected stream only drops its transport when
    /// `force` is set.
    pub fn reconnect(&self, force: bool) {
        self.stream.reconnect(force);
    }

    /// The host regained network access; retry immediately if offline.
    pub fn network_online(&self) {
        self.stream.network_online();
    }

    /// Close for good. Outstanding calls fail with `disconnected`.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Disconnect);
    }
}

async fn run_connection(
    mut core: LiveDataClient,
    stream: ConnectionStream,
    mut stream_events: mpsc::Receiver<StreamEvent>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let mut commands_open = true;

    loop {
        let deadline = core.next_deadline();
        tokio::select! {
            event = stream_events.recv() => match event {
                Some(StreamEvent::Status(status)) => forward(&events, ClientEvent::Status(status)),
                Some(StreamEvent::Reset) => {
                    // Frames queued from here on belong to the new transport.
                    stream.reset_handled();
                    core.on_reset();
                }
                Some(StreamEvent::Message(text)) => {
                    log::trace!("recv {text}");
                    core.on_message(&text, Instant::now());
                }
                Some(StreamEvent::Disconnected(error)) => core.on_disconnect(error.as_ref()),
                None => {
                    core.close();
                    drain(&mut core, &stream, &events);
                    break;
                }
            },
            cmd = cmd_rx.recv(), if commands_open => match cmd {
                Some(Command::Disconnect) | None => {
                    commands_open = false;
                    core.close();
                    stream.disconnect();
                }
                Some(cmd) => handle_command(&mut core, cmd),
            },
            _ = sleep_until_opt(deadline) => core.on_timer(Instant::now()),
        }
        drain(&mut core, &stream, &events);
    }
    log::debug!("Connection task finished");
}

fn handle_command(core: &mut LiveDataClient, cmd: Command) {
    if core.is_closed() {
        // Dropping the reply senders fails the callers with `Closed`.
        return;
    }
    match cmd {
        Command::Call {
            name,
            params,
            options,
            reply,
        } => {
            core.call(&name, params, options, reply);
        }
        Command::Subscribe { name, params, reply } => {
            let _ = reply.send(core.subscribe(&name, params));
        }
        Command::Unsubscribe(id) => {
            core.unsubscribe(&id);
        }
        Command::RegisterStub { name, stub } => core.register_stub(name, stub),
        Command::Observe {
            collection,
            observer,
            reply,
        } => {
            let _ = reply.send(core.observe(&collection, observer));
        }
        Command::Unobserve { collection, id } => {
            core.unobserve(&collection, id);
        }
        Command::Inspect(f) => f(core.replica()),
        Command::Disconnect => {}
    }
}

/// Push the core's output to the stream and the application.
fn drain(core: &mut LiveDataClient, stream: &ConnectionStream, events: &mpsc::UnboundedSender<ClientEvent>) {
    for msg in core.take_outbox() {
        match msg.encode() {
            Ok(text) => {
                log::trace!("send {text}");
                stream.send(text);
            }
            Err(e) => log::error!("Failed to encode {} message: {e}", msg.kind()),
        }
    }
    for directive in core.take_directives() {
        match directive {
            StreamDirective::Reconnect => stream.reconnect(true),
            StreamDirective::Lost(error) => stream.report_lost(error),
            StreamDirective::Fail(reason) => stream.fail(reason),
        }
    }
    for event in core.take_events() {
        forward(events, event);
    }
}

fn forward(events: &mpsc::UnboundedSender<ClientEvent>, event: ClientEvent) {
    if let Err(e) = events.send(event) {
        log::trace!("No event receiver, dropping {:?}", e.0);
    }
}
