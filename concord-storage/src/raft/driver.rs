use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use concord_common::error::{ConcordError, Result};
use concord_common::types::{ClusterConfig, LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::node::{Applied, NodeStatus, RaftNode};
use super::rpc::{
    AppendEntriesRequest, AppendEntriesResponse, AppendSummary, InstallSnapshotRequest,
    InstallSnapshotResponse, Outbound, Request, RequestVoteRequest, RequestVoteResponse,
    SnapshotSummary,
};
use super::state_machine::StateMachine;
use super::timer::ElectionTimer;
use super::transport::Transport;

const EVENT_QUEUE_DEPTH: usize = 1024;

/// Everything a node reacts to, funnelled through one queue.
#[derive(Debug)]
pub enum Event {
    RequestVote {
        req: RequestVoteRequest,
        reply: oneshot::Sender<Result<RequestVoteResponse>>,
    },
    AppendEntries {
        req: AppendEntriesRequest,
        reply: oneshot::Sender<Result<AppendEntriesResponse>>,
    },
    InstallSnapshot {
        req: InstallSnapshotRequest,
        reply: oneshot::Sender<Result<InstallSnapshotResponse>>,
    },
    VoteReply {
        from: NodeId,
        term: Term,
        result: Result<RequestVoteResponse>,
    },
    AppendReply {
        from: NodeId,
        summary: AppendSummary,
        result: Result<AppendEntriesResponse>,
    },
    SnapshotReply {
        from: NodeId,
        summary: SnapshotSummary,
        result: Result<InstallSnapshotResponse>,
    },
    ElectionTimeout {
        generation: u64,
    },
    HeartbeatTick,
    Submit {
        command: Vec<u8>,
        reply: oneshot::Sender<Result<SubmitResponse>>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Shutdown,
}

/// Outcome of a committed client command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub index: LogIndex,
    /// Whatever the state machine returned for the command
    pub result: Vec<u8>,
}

/// Cheap, cloneable entry point to a running node.
#[derive(Debug, Clone)]
pub struct NodeHandle {
    id: NodeId,
    events: mpsc::Sender<Event>,
    submit_timeout: Duration,
}

impl NodeHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub async fn request_vote(&self, req: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.call(|reply| Event::RequestVote { req, reply }).await
    }

    pub async fn append_entries(&self, req: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        self.call(|reply| Event::AppendEntries { req, reply }).await
    }

    pub async fn install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.call(|reply| Event::InstallSnapshot { req, reply }).await
    }

    /// Proposes `command` and waits until it is applied.
    ///
    /// Fails with `NotLeader` (carrying a hint) on a non-leader, or if the
    /// entry was replaced after a leadership change, and with `Timeout` if
    /// it did not commit within the configured submit timeout. A timed out
    /// command may still commit later.
    pub async fn submit(&self, command: Vec<u8>) -> Result<SubmitResponse> {
        let call = self.call(|reply| Event::Submit { command, reply });
        match tokio::time::timeout(self.submit_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(ConcordError::Timeout(format!(
                "command not committed within {:?}",
                self.submit_timeout
            ))),
        }
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Status { reply })
            .await
            .map_err(|_| ConcordError::Shutdown)?;
        rx.await.map_err(|_| ConcordError::Shutdown)
    }

    pub async fn shutdown(&self) {
        let _ = self.events.send(Event::Shutdown).await;
    }

    async fn call<T>(&self, event: impl FnOnce(oneshot::Sender<Result<T>>) -> Event) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(event(reply))
            .await
            .map_err(|_| ConcordError::Shutdown)?;
        rx.await.map_err(|_| ConcordError::Shutdown)?
    }
}

struct PendingSubmit {
    term: Term,
    reply: oneshot::Sender<Result<SubmitResponse>>,
}

/// Owns a [`RaftNode`] and runs it against a transport and the clock.
struct NodeDriver<S: StateMachine, T: Transport> {
    node: RaftNode<S>,
    transport: Arc<T>,
    events: mpsc::Sender<Event>,
    inbox: mpsc::Receiver<Event>,
    timer: ElectionTimer,
    heartbeat_interval: Duration,
    rpc_timeout: Duration,
    pending: BTreeMap<LogIndex, PendingSubmit>,
}

/// Starts driving `node` on the current tokio runtime.
///
/// The returned task finishes after [`NodeHandle::shutdown`], with
/// `Err(Halted)` if the node had halted on a persistence failure.
pub fn spawn_node<S: StateMachine, T: Transport>(
    node: RaftNode<S>,
    transport: Arc<T>,
    config: &ClusterConfig,
) -> (NodeHandle, JoinHandle<Result<()>>) {
    let (events, inbox) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let (min, max) = config.election_timeout_range();

    let handle = NodeHandle {
        id: node.id().clone(),
        events: events.clone(),
        submit_timeout: config.submit_timeout(),
    };
    let driver = NodeDriver {
        node,
        transport,
        timer: ElectionTimer::new(min, max, events.clone()),
        events,
        inbox,
        heartbeat_interval: config.heartbeat_interval(),
        rpc_timeout: config.rpc_timeout(),
        pending: BTreeMap::new(),
    };
    (handle, tokio::spawn(driver.run()))
}

impl<S: StateMachine, T: Transport> NodeDriver<S, T> {
    async fn run(mut self) -> Result<()> {
        info!(node = %self.node.id(), "driver started");
        self.timer.reset();
        let mut heartbeat = tokio::time::interval(self.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                event = self.inbox.recv() => event,
                _ = heartbeat.tick() => Some(Event::HeartbeatTick),
            };
            let event = match event {
                None | Some(Event::Shutdown) => break,
                Some(event) => event,
            };
            self.handle(event);
            self.flush();
        }

        self.timer.cancel();
        self.fail_pending(|| ConcordError::Shutdown);
        info!(node = %self.node.id(), "driver stopped");
        if self.node.is_halted() {
            return Err(ConcordError::Halted);
        }
        Ok(())
    }

    fn handle(&mut self, event: Event) {
        match event {
            Event::RequestVote { req, reply } => {
                let _ = reply.send(self.node.handle_request_vote(req));
            }
            Event::AppendEntries { req, reply } => {
                let _ = reply.send(self.node.handle_append_entries(req));
            }
            Event::InstallSnapshot { req, reply } => {
                let _ = reply.send(self.node.handle_install_snapshot(req));
            }
            Event::VoteReply { from, term, result } => match result {
                Ok(resp) => {
                    let result = self.node.handle_vote_response(&from, term, resp);
                    self.report(result);
                }
                // lost votes are not retried; the next election asks again
                Err(e) => debug!(node = %self.node.id(), peer = %from, error = %e, "vote request failed"),
            },
            Event::AppendReply {
                from,
                summary,
                result,
            } => match result {
                Ok(resp) => {
                    let result = self.node.handle_append_entries_response(&from, summary, resp);
                    self.report(result);
                }
                Err(e) => {
                    debug!(node = %self.node.id(), peer = %from, error = %e, "append entries failed");
                    self.node.handle_replication_failure(&from, summary.term);
                }
            },
            Event::SnapshotReply {
                from,
                summary,
                result,
            } => match result {
                Ok(resp) => {
                    let result = self.node.handle_install_snapshot_response(&from, summary, resp);
                    self.report(result);
                }
                Err(e) => {
                    debug!(node = %self.node.id(), peer = %from, error = %e, "install snapshot failed");
                    self.node.handle_replication_failure(&from, summary.term);
                }
            },
            Event::ElectionTimeout { generation } => {
                if self.timer.fire(generation) {
                    let result = self.node.start_election();
                    self.report(result);
                }
            }
            Event::HeartbeatTick => {
                let result = self.node.broadcast_heartbeat();
                self.report(result);
                // callers that gave up waiting
                self.pending.retain(|_, p| !p.reply.is_closed());
            }
            Event::Submit { command, reply } => match self.node.propose(command) {
                Ok(index) => self.track(index, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Event::Status { reply } => {
                let _ = reply.send(self.node.status());
            }
            Event::Shutdown => {}
        }
    }

    /// Sends queued requests, answers applied submissions, re-arms the
    /// election timer.
    fn flush(&mut self) {
        let ready = self.node.take_ready();
        for outbound in ready.messages {
            self.dispatch(outbound);
        }
        for applied in ready.applied {
            self.resolve(applied);
        }

        // anything still waiting at or below last_applied was covered by a
        // snapshot from another leader
        let last_applied = self.node.last_applied();
        while let Some(entry) = self.pending.first_entry() {
            if *entry.key() > last_applied {
                break;
            }
            let pending = entry.remove();
            let _ = pending.reply.send(Err(ConcordError::NotLeader {
                leader_hint: self.node.leader_hint(),
            }));
        }

        if self.node.is_halted() {
            self.timer.cancel();
            self.fail_pending(|| ConcordError::Halted);
            return;
        }
        if self.node.is_leader() {
            self.timer.cancel();
        } else if ready.reset_election_timer || !self.timer.is_armed() {
            self.timer.reset();
        }
    }

    /// Waits for `index` to apply on behalf of a caller. A slot left over
    /// from an earlier term was overwritten, so its caller lost.
    fn track(&mut self, index: LogIndex, reply: oneshot::Sender<Result<SubmitResponse>>) {
        let term = self.node.current_term();
        if let Some(displaced) = self.pending.insert(index, PendingSubmit { term, reply }) {
            debug!(node = %self.node.id(), index, term = displaced.term, "submission displaced");
            let _ = displaced.reply.send(Err(ConcordError::NotLeader {
                leader_hint: self.node.leader_hint(),
            }));
        }
    }

    fn resolve(&mut self, applied: Applied) {
        let Some(pending) = self.pending.remove(&applied.index) else {
            return;
        };
        let result = if pending.term == applied.term {
            Ok(SubmitResponse {
                index: applied.index,
                result: applied.result,
            })
        } else {
            // another leader's entry took this slot
            Err(ConcordError::NotLeader {
                leader_hint: self.node.leader_hint(),
            })
        };
        let _ = pending.reply.send(result);
    }

    fn report(&self, result: Result<()>) {
        if let Err(e) = result {
            if !e.is_fatal() {
                warn!(node = %self.node.id(), error = %e, "event handling failed");
            }
        }
    }

    fn fail_pending(&mut self, error: impl Fn() -> ConcordError) {
        for (_, pending) in std::mem::take(&mut self.pending) {
            let _ = pending.reply.send(Err(error()));
        }
    }

    fn dispatch(&self, outbound: Outbound) {
        let transport = self.transport.clone();
        let events = self.events.clone();
        let limit = self.rpc_timeout;
        let to = outbound.to;

        match outbound.request {
            Request::RequestVote(req) => {
                let term = req.term;
                tokio::spawn(async move {
                    let result = within(limit, transport.request_vote(&to, req)).await;
                    let _ = events
                        .send(Event::VoteReply {
                            from: to,
                            term,
                            result,
                        })
                        .await;
                });
            }
            Request::AppendEntries(req) => {
                let summary = req.summary();
                tokio::spawn(async move {
                    let result = within(limit, transport.append_entries(&to, req)).await;
                    let _ = events
                        .send(Event::AppendReply {
                            from: to,
                            summary,
                            result,
                        })
                        .await;
                });
            }
            Request::InstallSnapshot(req) => {
                let summary = req.summary();
                tokio::spawn(async move {
                    let result = within(limit, transport.install_snapshot(&to, req)).await;
                    let _ = events
                        .send(Event::SnapshotReply {
                            from: to,
                            summary,
                            result,
                        })
                        .await;
                });
            }
        }
    }
}

async fn within<T>(limit: Duration, call: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(ConcordError::Timeout(format!("no reply within {limit:?}"))),
    }
}
