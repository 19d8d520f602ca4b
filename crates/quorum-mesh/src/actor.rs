//! One tokio task per node.
//!
//! Each node runs in its own task and owns its state outright. Messages
//! travel over unbounded mpsc channels, so deliveries from different
//! proposers genuinely interleave. The runtime tracks how many messages are
//! in flight; [`ActorMesh::settle`] waits until that count drops to zero,
//! which is the only synchronization point callers get.
//!
//! A message counts as in flight from the moment it is sent until its
//! recipient has handled it *and* sent any replies. Replies are counted
//! before the incoming message is released, so the count cannot touch zero
//! while work is still pending.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use quorum_consensus::{Envelope, Message, Node, NodeId, NodeSnapshot, Outbox, StateValue};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::events::{EventLog, MeshEvent};
use crate::registry::Registry;

enum Command<S> {
    Propose {
        state: S,
        reply: oneshot::Sender<bool>,
    },
    Receive {
        message: Message<S>,
        reply: oneshot::Sender<bool>,
    },
    Deliver(Message<S>),
    Partition {
        excluded: Vec<NodeId>,
        reply: oneshot::Sender<()>,
    },
    Fail {
        reply: oneshot::Sender<()>,
    },
    Snapshot {
        reply: oneshot::Sender<NodeSnapshot<S>>,
    },
    Shutdown,
}

type Peers<S> = Arc<BTreeMap<NodeId, mpsc::UnboundedSender<Command<S>>>>;
type SharedEvents<S> = Arc<Mutex<EventLog<S>>>;

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    fn begin(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn done(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// A running mesh of node tasks.
pub struct ActorMesh<S> {
    peers: Peers<S>,
    tasks: Vec<(NodeId, JoinHandle<Node<S>>)>,
    in_flight: Arc<InFlight>,
    events: SharedEvents<S>,
}

impl<S> ActorMesh<S>
where
    S: StateValue + Send + 'static,
{
    /// Move every node of `registry` into its own task.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime, as `tokio::spawn` does.
    pub fn spawn(registry: Registry<S>) -> Self {
        let (nodes, events) = registry.into_parts();
        let events = Arc::new(Mutex::new(events));
        let in_flight = Arc::new(InFlight::default());

        let mut senders = BTreeMap::new();
        let mut receivers = Vec::with_capacity(nodes.len());
        for (id, node) in nodes {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(id, tx);
            receivers.push((id, node, rx));
        }
        let peers: Peers<S> = Arc::new(senders);

        let tasks = receivers
            .into_iter()
            .map(|(id, node, rx)| {
                let worker = NodeTask {
                    node,
                    peers: peers.clone(),
                    in_flight: in_flight.clone(),
                    events: events.clone(),
                };
                (id, tokio::spawn(worker.run(rx)))
            })
            .collect();

        debug!(nodes = peers.len(), "Actor mesh started");

        Self {
            peers,
            tasks,
            in_flight,
            events,
        }
    }

    /// `node` proposes `state`. Resolves once the broadcast has been sent,
    /// not once it has been handled; use [`settle`](Self::settle) for that.
    pub async fn propose(&self, node: NodeId, state: S) -> Result<bool> {
        self.request(node, |reply| Command::Propose { state, reply })
            .await
    }

    /// Hand `message` to `node` as if a neighbor had sent it.
    pub async fn receive(&self, node: NodeId, message: Message<S>) -> Result<bool> {
        self.request(node, |reply| Command::Receive { message, reply })
            .await
    }

    /// Drop `excluded` from `node`'s view.
    pub async fn simulate_partition(&self, node: NodeId, excluded: &[NodeId]) -> Result<()> {
        let excluded = excluded.to_vec();
        self.request(node, |reply| Command::Partition { excluded, reply })
            .await
    }

    /// Permanently deactivate `node`.
    pub async fn simulate_failure(&self, node: NodeId) -> Result<()> {
        self.request(node, |reply| Command::Fail { reply }).await
    }

    /// Current observable state of `node`.
    pub async fn snapshot(&self, node: NodeId) -> Result<NodeSnapshot<S>> {
        self.request(node, |reply| Command::Snapshot { reply })
            .await
    }

    /// Wait until no message is in flight.
    pub async fn settle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            if self.in_flight.current() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Messages sent but not yet fully handled.
    pub fn in_flight(&self) -> usize {
        self.in_flight.current()
    }

    /// Stop every task and reassemble the registry, events included.
    ///
    /// Messages still in flight are discarded.
    pub async fn shutdown(mut self) -> Result<Registry<S>> {
        self.stop();

        let mut nodes = BTreeMap::new();
        for (id, handle) in std::mem::take(&mut self.tasks) {
            let node = handle.await.map_err(|e| {
                warn!(node = %id, error = %e, "Node task ended abnormally");
                Error::RuntimeClosed
            })?;
            nodes.insert(id, node);
        }

        let events = self
            .events
            .lock()
            .map(|mut log| std::mem::replace(&mut *log, EventLog::new(false)))
            .map_err(|_| Error::RuntimeClosed)?;

        Ok(Registry::from_parts(nodes, events))
    }

    async fn request<T, F>(&self, node: NodeId, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> Command<S>,
    {
        let tx = self.peers.get(&node).ok_or(Error::UnknownNode(node))?;
        let (reply, rx) = oneshot::channel();
        tx.send(build(reply)).map_err(|_| Error::RuntimeClosed)?;
        rx.await.map_err(|_| Error::RuntimeClosed)
    }
}

impl<S> ActorMesh<S> {
    fn stop(&self) {
        for tx in self.peers.values() {
            // A task that already exited has nothing left to stop
            let _ = tx.send(Command::Shutdown);
        }
    }
}

// Every task holds a sender to its own inbox, so inboxes never close on
// their own.
impl<S> Drop for ActorMesh<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

struct NodeTask<S> {
    node: Node<S>,
    peers: Peers<S>,
    in_flight: Arc<InFlight>,
    events: SharedEvents<S>,
}

impl<S> NodeTask<S>
where
    S: StateValue + Send + 'static,
{
    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Command<S>>) -> Node<S> {
        while let Some(command) = inbox.recv().await {
            let mut outbox = Outbox::new();
            match command {
                Command::Propose { state, reply } => {
                    let accepted = self.node.propose(state.clone(), &mut outbox);
                    let node = self.node.id();
                    self.record(|seq| MeshEvent::Proposed {
                        node,
                        state,
                        accepted,
                        seq,
                    });
                    self.route(outbox);
                    let _ = reply.send(accepted);
                }
                Command::Receive { message, reply } => {
                    let accepted = self.handle(message, &mut outbox);
                    self.route(outbox);
                    let _ = reply.send(accepted);
                }
                Command::Deliver(message) => {
                    self.handle(message, &mut outbox);
                    self.route(outbox);
                    self.in_flight.done();
                }
                Command::Partition { excluded, reply } => {
                    self.node.simulate_partition(&excluded);
                    let node = self.node.id();
                    let remaining = self.node.neighbors().len();
                    let threshold = self.node.quorum_threshold();
                    self.record(|seq| MeshEvent::Partitioned {
                        node,
                        excluded,
                        remaining,
                        threshold,
                        seq,
                    });
                    let _ = reply.send(());
                }
                Command::Fail { reply } => {
                    self.node.simulate_failure();
                    let node = self.node.id();
                    self.record(|seq| MeshEvent::Failed { node, seq });
                    let _ = reply.send(());
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.node.snapshot());
                }
                Command::Shutdown => break,
            }
        }

        // Anything still queued will never be handled
        while let Ok(command) = inbox.try_recv() {
            if let Command::Deliver(_) = command {
                self.in_flight.done();
            }
        }

        self.node
    }

    fn handle(&mut self, message: Message<S>, outbox: &mut Outbox<S>) -> bool {
        let to = self.node.id();
        let had_consensus = self.node.consensus_reached();
        let accepted = self.node.receive(message.clone(), outbox);

        self.record(|seq| MeshEvent::Delivered {
            to,
            message,
            accepted,
            seq,
        });

        if !had_consensus && self.node.consensus_reached() {
            if let Some(state) = self.node.consensus_state().cloned() {
                self.record(|seq| MeshEvent::ConsensusReached { node: to, state, seq });
            }
        }

        accepted
    }

    fn route(&self, outbox: Outbox<S>) {
        for Envelope { to, message } in outbox {
            let Some(tx) = self.peers.get(&to) else {
                warn!(to = %to, kind = message.kind(), "No recipient for message");
                self.record(|seq| MeshEvent::Undeliverable { to, message, seq });
                continue;
            };

            self.in_flight.begin();
            if let Err(mpsc::error::SendError(command)) = tx.send(Command::Deliver(message)) {
                self.in_flight.done();
                if let Command::Deliver(message) = command {
                    warn!(to = %to, "Recipient task has stopped");
                    self.record(|seq| MeshEvent::Undeliverable { to, message, seq });
                }
            }
        }
    }

    fn record<F>(&self, build: F)
    where
        F: FnOnce(u64) -> MeshEvent<S>,
    {
        if let Ok(mut log) = self.events.lock() {
            log.record(build);
        }
    }
}
