use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::context::AppContext;
use crate::device::PermissionProbe;
use crate::emergency::RaiseError;
use crate::ipc::{DaemonStatus, IpcCall, IpcRequest, IpcResponse};
use crate::session_controller::SessionController;
use crate::sync_engine::{
    spawn_push_listener, CommandDeduper, ControllerMessage, SyncEngine, SyncRequest, SyncStatus,
};

/// Poll the permission probe and publish changes. A probe error keeps the
/// last known value.
#[must_use]
pub fn spawn_permission_watch(
    probe: Arc<dyn PermissionProbe>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> (watch::Receiver<bool>, JoinHandle<()>) {
    let (tx, rx) = watch::channel(true);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {}
            }
            match probe.granted().await {
                Ok(granted) => {
                    tx.send_if_modified(|current| {
                        let changed = *current != granted;
                        *current = granted;
                        changed
                    });
                }
                Err(e) => log::debug!("Permission probe failed: {e:#}"),
            }
        }
    });
    (rx, task)
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Owns the context, the session controller and every background task.
/// All controller mutations happen on the daemon loop.
pub struct Daemon {
    ctx: AppContext,
    controller: SessionController,
    messages: mpsc::Receiver<ControllerMessage>,
    messages_tx: mpsc::Sender<ControllerMessage>,
    /// Held here only while no sync engine serves it
    sync_requests: Option<mpsc::Receiver<SyncRequest>>,
    sync_status: Option<watch::Receiver<SyncStatus>>,
    permission: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Restore the controller and start the background tasks
    ///
    /// # Errors
    ///
    /// Returns an error if the command ledger cannot be read
    pub async fn start(mut ctx: AppContext) -> Result<Self> {
        let (messages_tx, messages) = mpsc::channel(256);
        let (requests_tx, requests) = mpsc::channel(16);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut controller = SessionController::new(
            &ctx.config,
            Arc::clone(&ctx.buffer),
            ctx.devices.clone(),
            Arc::clone(&ctx.emergency),
            requests_tx,
        );
        if let Err(e) = controller.restore().await {
            ctx.status.degrade(format!("session state not restored: {e}"));
        }

        let (permission, permission_task) = spawn_permission_watch(
            Arc::clone(&ctx.devices.permissions),
            Duration::from_millis(ctx.config.enforcement.permission_poll_ms.max(10)),
            shutdown_rx.clone(),
        );

        let mut daemon = Self {
            ctx,
            controller,
            messages,
            messages_tx,
            sync_requests: Some(requests),
            sync_status: None,
            permission,
            shutdown,
            tasks: vec![permission_task],
        };
        daemon.start_sync(&shutdown_rx)?;
        Ok(daemon)
    }

    fn start_sync(&mut self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let (online, connectivity) = watch::channel(true);

        if let Some(source) = &self.ctx.clients.push {
            let deduper = CommandDeduper::new(
                Arc::clone(&self.ctx.db),
                self.ctx.config.sync.command_dedup_capacity,
            )?;
            self.tasks.push(spawn_push_listener(
                Arc::clone(source),
                deduper,
                self.messages_tx.clone(),
                online,
                &self.ctx.config.sync,
                shutdown.clone(),
            ));
        }

        let Some(backend) = &self.ctx.clients.backend else {
            log::warn!("No backend configured, sync engine not started");
            return Ok(());
        };
        let engine = SyncEngine::new(
            self.ctx.config.device.device_id.clone(),
            Arc::clone(&self.ctx.buffer),
            Arc::clone(backend),
            self.ctx.config.sync.clone(),
            self.messages_tx.clone(),
            connectivity,
        );
        self.sync_status = Some(engine.status());
        if let Some(requests) = self.sync_requests.take() {
            self.tasks
                .push(tokio::spawn(engine.run(requests, shutdown.clone())));
        }
        Ok(())
    }

    /// Handle one controller message
    async fn dispatch(&mut self, message: ControllerMessage) {
        if let Err(e) = self.controller.handle(message).await {
            log::warn!("Controller rejected message: {e}");
        }
    }

    /// Without a sync engine a finalize completes locally, unconfirmed
    async fn finalize_offline(&mut self, request: SyncRequest) {
        let SyncRequest::Finalize { session_id } = request;
        log::warn!("Finalizing {session_id} without a backend");
        self.dispatch(ControllerMessage::FinalizeOutcome {
            session_id,
            confirmed: false,
        })
        .await;
    }

    async fn on_permission_change(&mut self) {
        let granted = *self.permission.borrow_and_update();
        if granted {
            log::info!("Platform permissions granted");
            return;
        }
        if let Err(e) = self.controller.on_permission_revoked().await {
            log::error!("Teardown after permission loss failed: {e}");
        }
    }

    /// # Errors
    ///
    /// Returns an error if the outbox counters cannot be read
    pub async fn status(&self) -> Result<DaemonStatus> {
        Ok(DaemonStatus {
            pid: std::process::id(),
            system: self.ctx.status.clone(),
            session: self.controller.status().await,
            sync: self.sync_status.as_ref().map(|s| s.borrow().clone()),
            outbox: self.ctx.buffer.stats()?,
            dropped: self.ctx.buffer.drop_count()?,
            pending_help: self.ctx.emergency.pending_count(),
        })
    }

    fn raise_help(&self, reason: &str) -> IpcResponse {
        match self.ctx.emergency.raise(self.controller.session_id(), reason) {
            Ok(handle) => IpcResponse::HelpRaised {
                request_id: handle.request_id(),
            },
            Err(RaiseError::Denied {
                original,
                retry_after,
            }) => IpcResponse::HelpDenied {
                request_id: original.request_id(),
                retry_after_secs: retry_after.as_secs(),
            },
            Err(RaiseError::Core(e)) => IpcResponse::Error(e.to_string()),
        }
    }

    /// Answer an IPC call. Returns `true` for a shutdown request.
    async fn answer(&self, call: IpcCall) -> bool {
        let (response, stop) = match call.request {
            IpcRequest::Status => match self.status().await {
                Ok(status) => (IpcResponse::Status(Box::new(status)), false),
                Err(e) => (IpcResponse::Error(format!("{e:#}")), false),
            },
            IpcRequest::RaiseHelp { reason } => (self.raise_help(&reason), false),
            IpcRequest::Shutdown => (IpcResponse::Shutdown, true),
        };
        if call.reply.send(response).is_err() {
            log::debug!("IPC client went away before the answer");
        }
        stop
    }

    /// Serve until a shutdown request or Ctrl-C, then stop every task
    pub async fn run(mut self, mut ipc: mpsc::Receiver<IpcCall>) {
        log::info!("Daemon running ({})", self.ctx.status);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Received Ctrl-C, shutting down...");
                    break;
                }
                Some(message) = self.messages.recv() => self.dispatch(message).await,
                Some(request) = recv_or_pending(&mut self.sync_requests) => {
                    self.finalize_offline(request).await;
                }
                Ok(()) = self.permission.changed() => self.on_permission_change().await,
                Some(call) = ipc.recv() => {
                    if self.answer(call).await {
                        log::info!("Shutdown requested over IPC");
                        break;
                    }
                }
            }
        }

        self.stop().await;
    }

    async fn stop(mut self) {
        self.shutdown.send_replace(true);
        self.controller.shutdown().await;
        for task in self.tasks.drain(..) {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                log::warn!("Background task did not stop in time");
            }
        }
        log::info!("Daemon shut down gracefully.");
    }
}
