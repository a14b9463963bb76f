//! SessionManager: the session catalog and the API the dashboard talks to.

use std::collections::HashMap;
use std::sync::Arc;

use devmux_terminal::{ClearMode, Row, TerminalSize};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{SessionError, SessionResult};
use crate::process::ProcessSpawner;
use crate::pump::{run_pump, spawn_reader_thread};
use crate::session::{RemoteSession, SessionEvent, SessionId, SessionInfo, SessionStatus, SharedBuffer};
use crate::subscription::{BufferChangeHandler, Subscribers, SubscriptionId};

const EVENT_CHANNEL_SIZE: usize = 1024;

pub struct SessionManager {
    config: Arc<EngineConfig>,
    spawner: Arc<dyn ProcessSpawner>,
    sessions: RwLock<HashMap<SessionId, Arc<RemoteSession>>>,
    subscribers: Arc<Subscribers>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    pub fn new(config: EngineConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            config: Arc::new(config.normalized()),
            spawner,
            sessions: RwLock::new(HashMap::new()),
            subscribers: Arc::new(Subscribers::default()),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn session(&self, id: SessionId) -> SessionResult<Arc<RemoteSession>> {
        self.sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    /// Spawn a remote shell for `target_id` and start pumping its output.
    ///
    /// On failure the session ends in `Error` (observable through
    /// [`subscribe_events`](Self::subscribe_events)), nothing stays open, and
    /// the session never enters the catalog.
    pub async fn connect_to_target(
        &self,
        owner_id: &str,
        target_id: &str,
        size: Option<TerminalSize>,
    ) -> SessionResult<SessionInfo> {
        let size = size.unwrap_or_else(|| self.config.default_size.into());
        let session = Arc::new(RemoteSession::new(
            owner_id,
            target_id,
            size,
            &self.config,
            self.events.clone(),
        ));
        let session_id = session.id();
        let request = session.spawn_request(&self.config);

        info!(
            "[session:{}] Connecting owner {} to target {} ({} {:?})",
            session_id, owner_id, target_id, request.program, request.args
        );

        let spawner = self.spawner.clone();
        let mut spawn_task = tokio::task::spawn_blocking(move || spawner.spawn(&request));
        let timeout = self.config.connect_timeout();

        let failure = match tokio::time::timeout(timeout, &mut spawn_task).await {
            Ok(Ok(Ok(spawned))) => {
                let output = session.attach(spawned, &self.config);
                self.start_pump(&session, output);
                self.sessions.write().insert(session_id, session.clone());
                return Ok(session.info());
            }
            Ok(Ok(Err(e))) => e.to_string(),
            Ok(Err(e)) => format!("spawn task failed: {}", e),
            Err(_) => {
                // The spawn may still succeed later; make sure it does not leak
                tokio::spawn(async move {
                    if let Ok(Ok(mut late)) = spawn_task.await {
                        let _ = tokio::task::spawn_blocking(move || late.handle.terminate()).await;
                    }
                });
                format!("timed out after {} ms", timeout.as_millis())
            }
        };

        session.fail(failure.clone());
        session.teardown();
        Err(SessionError::Connection {
            target_id: target_id.to_string(),
            reason: failure,
        })
    }

    fn start_pump(&self, session: &Arc<RemoteSession>, output: Box<dyn std::io::Read + Send>) {
        let (output_tx, output_rx) = mpsc::channel(self.config.output_channel_capacity);
        spawn_reader_thread(session.id(), output, output_tx, self.config.read_buffer_size);
        let pump = tokio::spawn(run_pump(
            session.clone(),
            output_rx,
            self.subscribers.clone(),
            self.config.output_mode,
        ));
        session.set_pump(pump);
    }

    pub fn send_keystroke(&self, id: SessionId, data: impl AsRef<[u8]>) -> SessionResult<()> {
        self.session(id)?.send_keystroke(data.as_ref())
    }

    pub fn resize_terminal(&self, id: SessionId, cols: u16, rows: u16) -> SessionResult<()> {
        self.session(id)?.resize(TerminalSize::new(cols, rows))
    }

    /// Register `handler` for buffer changes of session `id`.
    pub fn subscribe_to_buffer_changes(
        &self,
        id: SessionId,
        handler: BufferChangeHandler,
    ) -> SessionResult<SubscriptionId> {
        self.session(id)?;
        Ok(self.subscribers.subscribe(id, handler))
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(subscription)
    }

    pub fn subscription_count(&self, id: SessionId) -> usize {
        self.subscribers.count_for(id)
    }

    /// Status, output and removal events for every session.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Bottom-anchored visible lines; `viewport_rows` defaults to the
    /// session's row count.
    pub fn get_visible_lines(&self, id: SessionId, viewport_rows: Option<usize>) -> SessionResult<Vec<String>> {
        let session = self.session(id)?;
        let buffer = session.buffer().read();
        let rows = viewport_rows.unwrap_or(buffer.size().rows as usize);
        Ok(buffer.get_visible_lines(rows))
    }

    /// Styled counterpart of [`get_visible_lines`](Self::get_visible_lines).
    pub fn get_visible_rows(&self, id: SessionId, viewport_rows: Option<usize>) -> SessionResult<Vec<Row>> {
        let session = self.session(id)?;
        let buffer = session.buffer().read();
        let rows = viewport_rows.unwrap_or(buffer.size().rows as usize);
        Ok(buffer.visible_rows(rows))
    }

    pub fn buffer(&self, id: SessionId) -> SessionResult<SharedBuffer> {
        Ok(self.session(id)?.buffer().clone())
    }

    pub fn clear_buffer(&self, id: SessionId, mode: ClearMode) -> SessionResult<()> {
        let session = self.session(id)?;
        session.buffer().write().clear(mode);
        self.subscribers.notify(id, session.buffer());
        Ok(())
    }

    /// Close the session and drop it from the catalog. Unknown or already
    /// removed ids are a no-op.
    pub async fn disconnect_session(&self, id: SessionId) -> SessionResult<()> {
        let Some(session) = self.sessions.write().remove(&id) else {
            debug!("[session:{}] Disconnect on unknown session ignored", id);
            return Ok(());
        };

        let closing = session.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || closing.disconnect()).await {
            warn!("[session:{}] Teardown task failed: {}", id, e);
        }
        if let Some(pump) = session.take_pump() {
            match pump.await {
                Ok(exit) => debug!("[session:{}] Pump exited: {:?}", id, exit),
                Err(e) => warn!("[session:{}] Pump task failed: {}", id, e),
            }
        }

        let removed = self.subscribers.remove_session(id);
        let _ = self.events.send(SessionEvent::Removed { id });
        info!(
            "[session:{}] Removed ({} subscriptions dropped)",
            id, removed
        );
        Ok(())
    }

    pub fn get_session_status(&self, id: SessionId) -> Option<SessionStatus> {
        self.sessions.read().get(&id).map(|s| s.status())
    }

    pub fn get_session_info(&self, id: SessionId) -> Option<SessionInfo> {
        self.sessions.read().get(&id).map(|s| s.info())
    }

    /// Every catalogued session, oldest first.
    pub fn list_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().values().map(|s| s.info()).collect();
        sessions.sort_by_key(|info| info.created_at);
        sessions
    }

    /// Sessions in `Connecting` or `Connected`, oldest first.
    pub fn get_active_sessions(&self) -> Vec<SessionInfo> {
        self.list_sessions()
            .into_iter()
            .filter(|info| info.status.is_active())
            .collect()
    }

    /// Disconnect every session.
    pub async fn shutdown(&self) {
        let ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        info!("Shutting down {} sessions", ids.len());
        for id in ids {
            let _ = self.disconnect_session(id).await;
        }
    }
}
