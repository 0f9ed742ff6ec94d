//! Interactive conflict resolution as an actor.
//!
//! Resolvers send `(candidates, id, response channel)` requests; the operator
//! answers the head of the queue with [`ConflictQueueHandle::handle_select`] or
//! drains everything with [`ConflictQueueHandle::handle_bulk_select`]. Once a
//! bulk mode is set every later request is answered immediately until
//! [`ConflictQueueHandle::clear_bulk_mode`] is called.
//!
//! A caller waiting on a request that the actor drops (shutdown, or every
//! handle gone) gets [`ConflictError::QueueClosed`]. There is no timeout: an
//! unanswered conflict blocks its caller until one of those happens. A caller
//! that stops waiting (a cancelled pass) has its conflict removed from the
//! queue.

use crate::error::{ConflictError, ReconcileError};
use crate::resolver::{pick_latest, pick_own_or_first, ConflictResolver};
use fieldsync_core::model::{BulkMode, Record, RecordId, UserId};
use serde::Serialize;
use std::collections::VecDeque;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingConflict {
    pub ticket: Uuid,
    pub id: RecordId,
    pub candidates: Vec<Record>,
}

/// Read-only view for rendering the resolution dialog.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictState {
    pub queue: Vec<PendingConflict>,
    pub bulk_mode: Option<BulkMode>,
    pub visible: bool,
}

impl ConflictState {
    /// The conflict the dialog should show.
    pub fn current(&self) -> Option<&PendingConflict> {
        self.queue.first()
    }
}

/// Record chosen for `candidates` under a bulk rule.
pub fn bulk_pick(mode: BulkMode, candidates: &[Record], own_user_id: &str) -> Option<Record> {
    let picked = match mode {
        BulkMode::SelfOwned => pick_own_or_first(candidates, own_user_id),
        BulkMode::Latest => pick_latest(candidates),
    };
    picked.cloned()
}

enum Command {
    Resolve {
        id: RecordId,
        candidates: Vec<Record>,
        respond_to: oneshot::Sender<Record>,
    },
    Select {
        ticket: Option<Uuid>,
        record: Record,
        respond_to: oneshot::Sender<Result<(), ConflictError>>,
    },
    BulkSelect {
        mode: BulkMode,
        respond_to: oneshot::Sender<usize>,
    },
    ClearBulk {
        respond_to: oneshot::Sender<()>,
    },
    Shutdown,
}

struct Queued {
    pending: PendingConflict,
    respond_to: oneshot::Sender<Record>,
}

struct ConflictActor {
    own_user_id: UserId,
    queue: VecDeque<Queued>,
    bulk_mode: Option<BulkMode>,
    visible: bool,
    state: watch::Sender<ConflictState>,
}

impl ConflictActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            let event = tokio::select! {
                command = commands.recv() => Event::Command(command),
                () = head_abandoned(&mut self.queue) => Event::Abandoned,
            };
            match event {
                Event::Command(None | Some(Command::Shutdown)) => break,
                Event::Command(Some(command)) => self.handle(command),
                Event::Abandoned => {
                    self.drop_abandoned();
                    self.publish();
                }
            }
        }

        if !self.queue.is_empty() {
            tracing::warn!(
                pending = self.queue.len(),
                "Conflict queue stopped with unanswered conflicts"
            );
        }
        self.queue.clear();
        self.visible = false;
        self.publish();
    }

    /// Each command is one state transition; the new state is published
    /// before the requester is answered.
    fn handle(&mut self, command: Command) {
        match command {
            Command::Resolve {
                id,
                candidates,
                respond_to,
            } => {
                self.enqueue(id, candidates, respond_to);
                self.publish();
            }
            Command::Select {
                ticket,
                record,
                respond_to,
            } => {
                let result = self.select(ticket, record);
                self.publish();
                let _ = respond_to.send(result);
            }
            Command::BulkSelect { mode, respond_to } => {
                let drained = self.bulk_select(mode);
                self.publish();
                let _ = respond_to.send(drained);
            }
            Command::ClearBulk { respond_to } => {
                tracing::info!("Bulk conflict mode cleared");
                self.bulk_mode = None;
                self.publish();
                let _ = respond_to.send(());
            }
            Command::Shutdown => {}
        }
    }

    fn enqueue(&mut self, id: RecordId, candidates: Vec<Record>, respond_to: oneshot::Sender<Record>) {
        if let Some(mode) = self.bulk_mode {
            if let Some(record) = bulk_pick(mode, &candidates, &self.own_user_id) {
                tracing::debug!(record_id = %id, mode = %mode, "Conflict auto-resolved");
                answer(respond_to, record);
                return;
            }
        }

        let pending = PendingConflict {
            ticket: Uuid::new_v4(),
            id,
            candidates,
        };
        tracing::info!(
            record_id = %pending.id,
            candidates = pending.candidates.len(),
            queued = self.queue.len() + 1,
            "Conflict awaiting decision"
        );
        self.queue.push_back(Queued {
            pending,
            respond_to,
        });
        self.visible = true;
    }

    fn select(&mut self, ticket: Option<Uuid>, record: Record) -> Result<(), ConflictError> {
        let head = match self.queue.front() {
            Some(head) => &head.pending,
            None => return Err(ConflictError::NoPendingConflict),
        };
        if let Some(ticket) = ticket {
            if ticket != head.ticket {
                return Err(ConflictError::StaleTicket(ticket));
            }
        }
        if record.id != head.id || !head.candidates.contains(&record) {
            return Err(ConflictError::SelectionMismatch {
                pending: head.id.clone(),
                selected: record.id,
            });
        }

        if let Some(queued) = self.queue.pop_front() {
            tracing::info!(record_id = %queued.pending.id, owner = %record.owner_id, "Conflict resolved");
            answer(queued.respond_to, record);
        }
        self.visible = !self.queue.is_empty();
        Ok(())
    }

    fn bulk_select(&mut self, mode: BulkMode) -> usize {
        let drained = self.queue.len();
        for queued in self.queue.drain(..) {
            if let Some(record) = bulk_pick(mode, &queued.pending.candidates, &self.own_user_id) {
                answer(queued.respond_to, record);
            }
        }
        self.bulk_mode = Some(mode);
        self.visible = false;
        tracing::info!(mode = %mode, drained, "Bulk conflict mode set");
        drained
    }

    fn drop_abandoned(&mut self) {
        let before = self.queue.len();
        self.queue.retain(|queued| {
            let closed = queued.respond_to.is_closed();
            if closed {
                tracing::info!(record_id = %queued.pending.id, "Conflict withdrawn by its caller");
            }
            !closed
        });
        if self.queue.len() != before {
            self.visible = !self.queue.is_empty();
        }
    }

    fn publish(&self) {
        self.state.send_replace(ConflictState {
            queue: self.queue.iter().map(|q| q.pending.clone()).collect(),
            bulk_mode: self.bulk_mode,
            visible: self.visible,
        });
    }
}

enum Event {
    Command(Option<Command>),
    Abandoned,
}

/// Completes once the caller behind the head conflict has stopped waiting.
async fn head_abandoned(queue: &mut VecDeque<Queued>) {
    match queue.front_mut() {
        Some(head) => head.respond_to.closed().await,
        None => std::future::pending().await,
    }
}

fn answer(respond_to: oneshot::Sender<Record>, record: Record) {
    if let Err(record) = respond_to.send(record) {
        tracing::warn!(record_id = %record.id, "Conflict answered after its caller went away");
    }
}

/// Spawns the conflict actor.
pub struct ConflictQueue;

impl ConflictQueue {
    /// Start the actor on the current tokio runtime. `capacity` bounds the
    /// request channel, not the number of queued conflicts.
    pub fn spawn(own_user_id: impl Into<UserId>, capacity: usize) -> ConflictQueueHandle {
        let (commands, rx) = mpsc::channel(capacity.max(1));
        let (state, state_rx) = watch::channel(ConflictState::default());
        let actor = ConflictActor {
            own_user_id: own_user_id.into(),
            queue: VecDeque::new(),
            bulk_mode: None,
            visible: false,
            state,
        };
        tokio::spawn(actor.run(rx));
        ConflictQueueHandle {
            commands,
            state: state_rx,
        }
    }
}

#[derive(Clone)]
pub struct ConflictQueueHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<ConflictState>,
}

impl ConflictQueueHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ConflictError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ConflictError::QueueClosed)?;
        rx.await.map_err(|_| ConflictError::QueueClosed)
    }

    /// Suspend until the conflict for `id` is answered, or answer it at once
    /// when a bulk mode is active.
    pub async fn resolve_conflict(
        &self,
        candidates: Vec<Record>,
        id: &str,
    ) -> Result<Record, ConflictError> {
        if candidates.is_empty() {
            return Err(ConflictError::NoCandidates(id.to_string()));
        }
        let id = id.to_string();
        self.request(|respond_to| Command::Resolve {
            id,
            candidates,
            respond_to,
        })
        .await
    }

    /// Answer the head-of-queue conflict with `record`.
    pub async fn handle_select(&self, record: Record) -> Result<(), ConflictError> {
        self.request(|respond_to| Command::Select {
            ticket: None,
            record,
            respond_to,
        })
        .await?
    }

    /// Like [`handle_select`](Self::handle_select), but rejects the answer if
    /// the head conflict is no longer the one identified by `ticket`.
    pub async fn handle_select_ticket(
        &self,
        ticket: Uuid,
        record: Record,
    ) -> Result<(), ConflictError> {
        self.request(|respond_to| Command::Select {
            ticket: Some(ticket),
            record,
            respond_to,
        })
        .await?
    }

    /// Resolve every queued conflict with `mode` and keep auto-resolving new
    /// ones. Returns how many queued conflicts were drained.
    pub async fn handle_bulk_select(&self, mode: BulkMode) -> Result<usize, ConflictError> {
        self.request(|respond_to| Command::BulkSelect { mode, respond_to })
            .await
    }

    pub async fn clear_bulk_mode(&self) -> Result<(), ConflictError> {
        self.request(|respond_to| Command::ClearBulk { respond_to })
            .await
    }

    /// Stop the actor. Callers still waiting get `QueueClosed`.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn state(&self) -> ConflictState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConflictState> {
        self.state.clone()
    }

    /// Wait until a conflict is at the head of the queue. `None` once the
    /// actor has stopped.
    pub async fn next_pending(&self) -> Option<PendingConflict> {
        let mut rx = self.state.clone();
        loop {
            if let Some(pending) = rx.borrow_and_update().current().cloned() {
                return Some(pending);
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }
}

#[async_trait::async_trait]
impl ConflictResolver for ConflictQueueHandle {
    async fn resolve_conflict(
        &self,
        candidates: Vec<Record>,
        id: &str,
    ) -> Result<Record, ReconcileError> {
        Ok(ConflictQueueHandle::resolve_conflict(self, candidates, id).await?)
    }
}
