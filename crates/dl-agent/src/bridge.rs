use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dl_config::WorkspacePaths;
use dl_error::{DevloopError, Result};
use dl_runtime::RuntimeSupervisor;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::{EventStream, ModelRef, PromptPart, PromptRequest, RuntimeClient};
use crate::frames::{parse_client_frame, ClientFrame, ServerFrame};
use crate::specialist::{Specialist, SpecialistCatalog};
use crate::sse::{decode_event, extract_session_id, RuntimeEvent, SseAccumulator};
use crate::store::{AgentMetadata, AgentStore, ConversationLog};

pub type ConnectionId = u64;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CreateAgentRequest {
    pub label: String,
    pub model: Option<String>,
    pub specialist_id: Option<String>,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnPhase {
    Idle,
    /// Prompt sent, no assistant message seen yet.
    AwaitingStart,
    Streaming,
}

#[derive(Debug, Default)]
struct Part {
    kind: String,
    text: String,
}

struct CompletedTurn {
    user_text: String,
    assistant_text: String,
}

struct AgentState {
    metadata: AgentMetadata,
    phase: TurnPhase,
    message_id: Option<String>,
    part_order: Vec<String>,
    parts: HashMap<String, Part>,
    pending_user_text: Option<String>,
    connections: HashMap<ConnectionId, mpsc::UnboundedSender<ServerFrame>>,
    /// Bumped whenever the subscription is replaced or closed; a reader
    /// whose generation no longer matches stops without emitting.
    generation: u64,
    subscription: Option<JoinHandle<()>>,
}

impl AgentState {
    fn new(metadata: AgentMetadata) -> Self {
        Self {
            metadata,
            phase: TurnPhase::Idle,
            message_id: None,
            part_order: Vec::new(),
            parts: HashMap::new(),
            pending_user_text: None,
            connections: HashMap::new(),
            generation: 0,
            subscription: None,
        }
    }

    fn broadcast(&mut self, frame: ServerFrame) {
        self.connections
            .retain(|_, tx| tx.send(frame.clone()).is_ok());
    }

    fn reset_turn(&mut self) {
        self.phase = TurnPhase::Idle;
        self.message_id = None;
        self.part_order.clear();
        self.parts.clear();
        self.pending_user_text = None;
    }

    /// Called by the reader itself once its turn is done; the task is left
    /// to finish writing the log.
    fn finish_subscription(&mut self) {
        self.generation += 1;
        self.subscription = None;
    }

    fn cancel_subscription(&mut self) {
        self.generation += 1;
        if let Some(task) = self.subscription.take() {
            task.abort();
        }
    }

    fn accepts_part(&self, message_id: Option<&str>) -> bool {
        self.phase == TurnPhase::Streaming
            && message_id.map_or(true, |id| self.message_id.as_deref() == Some(id))
    }

    fn part_mut(&mut self, part_id: &str) -> &mut Part {
        if !self.parts.contains_key(part_id) {
            self.part_order.push(part_id.to_string());
        }
        self.parts.entry(part_id.to_string()).or_insert_with(|| Part {
            kind: "text".to_string(),
            text: String::new(),
        })
    }

    fn assistant_text(&self) -> String {
        self.part_order
            .iter()
            .filter_map(|id| self.parts.get(id))
            .map(|part| part.text.as_str())
            .collect()
    }

    fn apply(&mut self, event: RuntimeEvent) -> Option<CompletedTurn> {
        match event {
            RuntimeEvent::MessageUpdated {
                message_id,
                role,
                completed,
                tokens,
                cost,
            } => {
                if role != "assistant" || self.phase == TurnPhase::Idle {
                    return None;
                }
                match self.message_id.clone() {
                    None => {
                        self.message_id = Some(message_id.clone());
                        self.phase = TurnPhase::Streaming;
                        self.broadcast(ServerFrame::MessageStart {
                            message_id: message_id.clone(),
                        });
                    }
                    Some(current) if current != message_id => return None,
                    Some(_) => {}
                }
                if !completed {
                    return None;
                }
                self.broadcast(ServerFrame::MessageComplete {
                    message_id,
                    tokens,
                    cost,
                });
                let turn = CompletedTurn {
                    user_text: self.pending_user_text.take().unwrap_or_default(),
                    assistant_text: self.assistant_text(),
                };
                self.reset_turn();
                Some(turn)
            }
            RuntimeEvent::PartDelta {
                message_id,
                part_id,
                delta,
            } => {
                if self.accepts_part(message_id.as_deref()) {
                    self.part_mut(&part_id).text.push_str(&delta);
                    self.broadcast(ServerFrame::Delta { part_id, delta });
                }
                None
            }
            RuntimeEvent::PartUpdated {
                message_id,
                part_id,
                part_type,
                text,
                delta,
            } => {
                if !self.accepts_part(message_id.as_deref()) {
                    return None;
                }
                let part = self.part_mut(&part_id);
                part.kind = part_type;
                match delta {
                    Some(delta) => {
                        match text {
                            Some(full) => part.text = full,
                            None => part.text.push_str(&delta),
                        }
                        self.broadcast(ServerFrame::Delta { part_id, delta });
                    }
                    None => {
                        if let Some(full) = text {
                            part.text = full;
                        }
                        let (part_type, text) = (part.kind.clone(), part.text.clone());
                        self.broadcast(ServerFrame::PartUpdated {
                            part_id,
                            part_type,
                            text,
                        });
                    }
                }
                None
            }
            RuntimeEvent::Idle => {
                self.broadcast(ServerFrame::Idle);
                None
            }
            RuntimeEvent::Other(_) => None,
        }
    }
}

/// Agent CRUD plus the per-agent streaming bridge between WebSocket clients
/// and the backing runtime.
pub struct AgentBridge {
    workspace: PathBuf,
    store: AgentStore,
    client: Arc<dyn RuntimeClient>,
    supervisor: Arc<dyn RuntimeSupervisor>,
    specialists: Arc<dyn SpecialistCatalog>,
    agents: Mutex<HashMap<String, Arc<Mutex<AgentState>>>>,
    next_connection: AtomicU64,
}

impl AgentBridge {
    pub fn new(
        workspace: impl Into<PathBuf>,
        client: Arc<dyn RuntimeClient>,
        supervisor: Arc<dyn RuntimeSupervisor>,
        specialists: Arc<dyn SpecialistCatalog>,
    ) -> Self {
        let workspace = workspace.into();
        Self {
            store: AgentStore::new(WorkspacePaths::new(workspace.clone())),
            workspace,
            client,
            supervisor,
            specialists,
            agents: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }

    pub fn specialists(&self) -> Vec<Specialist> {
        self.specialists.list()
    }

    pub async fn create_agent(&self, request: CreateAgentRequest) -> Result<AgentMetadata> {
        let label = request.label.trim();
        if label.is_empty() {
            return Err(DevloopError::invalid_input("label is required"));
        }
        let specialist = match request.specialist_id.as_deref() {
            Some(id) => Some(self.specialists.get(id).ok_or_else(|| {
                DevloopError::invalid_input(format!("Unknown specialist: {id}"))
            })?),
            None => None,
        };
        let system_prompt = request
            .system_prompt
            .filter(|prompt| !prompt.trim().is_empty())
            .or_else(|| specialist.map(|s| s.prompt));

        let runtime = self.supervisor.get_or_start(&self.workspace).await?;
        let session_id = self.client.create_session(&runtime.url, label).await?;

        let metadata = AgentMetadata {
            agent_id: Uuid::new_v4().to_string(),
            session_id,
            label: label.to_string(),
            model: request.model,
            specialist_id: request.specialist_id,
            system_prompt,
            created_at: Utc::now(),
        };
        self.store.save_metadata(&metadata).await?;
        tracing::info!(
            agent_id = %metadata.agent_id,
            session_id = %metadata.session_id,
            label = %metadata.label,
            "agent created"
        );
        Ok(metadata)
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentMetadata>> {
        self.store.list_metadata().await
    }

    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentMetadata> {
        self.store.require_metadata(agent_id).await
    }

    pub async fn conversation(&self, agent_id: &str) -> Result<ConversationLog> {
        self.store.load_conversation(agent_id).await
    }

    /// Removes the agent's files and drops its live state. Attached sockets
    /// see their frame channel close.
    pub async fn delete_agent(&self, agent_id: &str) -> Result<()> {
        self.store.require_metadata(agent_id).await?;
        let removed = self.agents.lock().await.remove(agent_id);
        if let Some(state) = removed {
            let mut state = state.lock().await;
            state.cancel_subscription();
            state.reset_turn();
            state.connections.clear();
        }
        self.store.delete(agent_id).await?;
        tracing::info!(agent_id, "agent deleted");
        Ok(())
    }

    /// Attaches a client. The first frame on the returned channel is
    /// `connected`.
    pub async fn connect(
        &self,
        agent_id: &str,
    ) -> Result<(ConnectionId, mpsc::UnboundedReceiver<ServerFrame>)> {
        let state = self.state_for(agent_id).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_connection.fetch_add(1, Ordering::Relaxed);
        let _ = tx.send(ServerFrame::Connected {
            agent_id: agent_id.to_string(),
        });
        state.lock().await.connections.insert(id, tx);
        tracing::debug!(agent_id, connection = id, "client attached");
        Ok((id, rx))
    }

    pub async fn disconnect(&self, agent_id: &str, connection: ConnectionId) {
        let state = self.agents.lock().await.get(agent_id).cloned();
        if let Some(state) = state {
            state.lock().await.connections.remove(&connection);
            tracing::debug!(agent_id, connection, "client detached");
        }
    }

    /// Dispatches one text frame from a client. Protocol and request errors
    /// go back to that client only.
    pub async fn handle_client_text(&self, agent_id: &str, connection: ConnectionId, text: &str) {
        let result = match parse_client_frame(text) {
            Ok(ClientFrame::Message { text }) => self
                .send_message(agent_id, &text)
                .await
                .map_err(|e| e.to_string()),
            Ok(ClientFrame::Cancel) => self.cancel(agent_id).await.map_err(|e| e.to_string()),
            Err(message) => Err(message),
        };
        if let Err(message) = result {
            self.send_to(agent_id, connection, ServerFrame::error(message))
                .await;
        }
    }

    /// Starts a turn. The prompt POST runs detached; its outcome surfaces
    /// through the event stream.
    pub async fn send_message(&self, agent_id: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DevloopError::invalid_input("Message text is required"));
        }
        let state = self.state_for(agent_id).await?;
        let runtime = self.supervisor.get_or_start(&self.workspace).await?;

        let mut guard = state.lock().await;
        guard.reset_turn();
        guard.phase = TurnPhase::AwaitingStart;
        guard.pending_user_text = Some(text.to_string());

        // Subscribe before prompting so no early event is missed.
        if guard.subscription.is_none() {
            let stream = match self.client.subscribe_events(&runtime.url).await {
                Ok(stream) => stream,
                Err(err) => {
                    guard.reset_turn();
                    return Err(err);
                }
            };
            guard.generation += 1;
            let task = tokio::spawn(run_subscription(
                state.clone(),
                guard.generation,
                stream,
                self.store.clone(),
            ));
            guard.subscription = Some(task);
        }

        let request = PromptRequest {
            parts: prompt_parts(&guard.metadata, text),
            model: guard.metadata.model.as_deref().map(ModelRef::parse),
        };
        let session_id = guard.metadata.session_id.clone();
        drop(guard);

        let client = self.client.clone();
        let agent_id = agent_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = client.send_prompt(&runtime.url, &session_id, &request).await {
                tracing::warn!(agent_id = %agent_id, session_id = %session_id, "prompt request failed: {}", err);
            }
        });
        Ok(())
    }

    /// Drops the in-flight turn. Nothing more is emitted for it.
    pub async fn cancel(&self, agent_id: &str) -> Result<()> {
        let state = self.state_for(agent_id).await?;
        let mut state = state.lock().await;
        state.cancel_subscription();
        state.reset_turn();
        tracing::info!(agent_id, "turn cancelled");
        Ok(())
    }

    pub async fn phase(&self, agent_id: &str) -> Option<TurnPhase> {
        let state = self.agents.lock().await.get(agent_id).cloned()?;
        let phase = state.lock().await.phase;
        Some(phase)
    }

    pub async fn shutdown(&self) {
        let agents: Vec<_> = self.agents.lock().await.drain().collect();
        for (agent_id, state) in agents {
            let mut state = state.lock().await;
            state.cancel_subscription();
            state.reset_turn();
            state.connections.clear();
            tracing::debug!(agent_id = %agent_id, "agent state released");
        }
    }

    async fn state_for(&self, agent_id: &str) -> Result<Arc<Mutex<AgentState>>> {
        if let Some(state) = self.agents.lock().await.get(agent_id) {
            return Ok(state.clone());
        }
        let metadata = self.store.require_metadata(agent_id).await?;
        let mut agents = self.agents.lock().await;
        Ok(agents
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(AgentState::new(metadata))))
            .clone())
    }

    async fn send_to(&self, agent_id: &str, connection: ConnectionId, frame: ServerFrame) {
        let state = self.agents.lock().await.get(agent_id).cloned();
        if let Some(state) = state {
            if let Some(tx) = state.lock().await.connections.get(&connection) {
                let _ = tx.send(frame);
            }
        }
    }
}

fn prompt_parts(metadata: &AgentMetadata, text: &str) -> Vec<PromptPart> {
    let mut parts = Vec::with_capacity(2);
    if let Some(prompt) = metadata
        .system_prompt
        .as_deref()
        .filter(|p| !p.trim().is_empty())
    {
        parts.push(PromptPart::synthetic(prompt));
    }
    parts.push(PromptPart::text(text));
    parts
}

async fn run_subscription(
    state: Arc<Mutex<AgentState>>,
    generation: u64,
    mut stream: EventStream,
    store: AgentStore,
) {
    let mut sse = SseAccumulator::new();
    while let Some(chunk) = stream.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(err) => {
                end_subscription(&state, generation, format!("Event stream failed: {err}")).await;
                return;
            }
        };

        for data in sse.push(&chunk) {
            let mut guard = state.lock().await;
            if guard.generation != generation {
                return;
            }
            let payload: Value = match serde_json::from_str(&data) {
                Ok(payload) => payload,
                Err(err) => {
                    guard.broadcast(ServerFrame::error(format!(
                        "Malformed event from agent runtime: {err}"
                    )));
                    continue;
                }
            };
            if extract_session_id(&payload).as_deref() != Some(guard.metadata.session_id.as_str()) {
                continue;
            }
            let Some(turn) = guard.apply(decode_event(&payload)) else {
                continue;
            };

            guard.finish_subscription();
            let metadata = guard.metadata.clone();
            drop(guard);
            if let Err(err) = store
                .append_turn(&metadata, &turn.user_text, &turn.assistant_text)
                .await
            {
                tracing::error!(agent_id = %metadata.agent_id, "failed to append conversation: {}", err);
            }
            return;
        }
    }
    end_subscription(
        &state,
        generation,
        "Event stream closed before the turn completed".to_string(),
    )
    .await;
}

async fn end_subscription(state: &Mutex<AgentState>, generation: u64, message: String) {
    let mut state = state.lock().await;
    if state.generation != generation {
        return;
    }
    tracing::warn!(agent_id = %state.metadata.agent_id, "{}", message);
    state.broadcast(ServerFrame::error(message));
    state.reset_turn();
    state.finish_subscription();
}
