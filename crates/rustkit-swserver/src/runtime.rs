//! Tokio driver for a [`SwServer`].
//!
//! The core is synchronous. [`spawn`] moves it onto one task that imports the
//! registration store, then applies [`ServerCommand`]s one at a time and
//! fires idle timers when their deadline passes. Callers talk to it through a
//! cloneable [`SwServerHandle`].

use crate::connection::ClientTransport;
use crate::error::ServiceWorkerError;
use crate::logging::server_span;
use crate::server::{ClientRequest, ContextEvent, SwServer};
use crate::types::{ClientData, ClientQueryOptions, ConnectionId, SecurityOriginData, WorkerId};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, Instrument};

/// Commands applied to the coordinator task.
pub enum ServerCommand {
    Connect {
        transport: Box<dyn ClientTransport>,
        reply: oneshot::Sender<ConnectionId>,
    },
    Disconnect(ConnectionId),
    Client {
        connection: ConnectionId,
        request: ClientRequest,
    },
    Context(ContextEvent),
    /// The engine connection was lost.
    ContextLost,
    Claim {
        worker: WorkerId,
        reply: oneshot::Sender<Result<(), ServiceWorkerError>>,
    },
    MatchAll {
        worker: WorkerId,
        options: ClientQueryOptions,
        reply: oneshot::Sender<Vec<ClientData>>,
    },
    RunServiceWorker {
        worker: WorkerId,
        reply: oneshot::Sender<bool>,
    },
    ClearOrigin {
        origin: SecurityOriginData,
        reply: oneshot::Sender<()>,
    },
    ClearAll {
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle to a spawned coordinator.
#[derive(Debug, Clone)]
pub struct SwServerHandle {
    tx: mpsc::UnboundedSender<ServerCommand>,
}

impl SwServerHandle {
    fn send(&self, command: ServerCommand) -> Result<(), ServiceWorkerError> {
        self.tx
            .send(command)
            .map_err(|_| ServiceWorkerError::ConnectionClosed)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> ServerCommand,
    ) -> Result<T, ServiceWorkerError> {
        let (reply, rx) = oneshot::channel();
        self.send(command(reply))?;
        rx.await.map_err(|_| ServiceWorkerError::ConnectionClosed)
    }

    /// Register a client process.
    pub async fn connect(
        &self,
        transport: impl ClientTransport + 'static,
    ) -> Result<ConnectionId, ServiceWorkerError> {
        let transport: Box<dyn ClientTransport> = Box::new(transport);
        self.request(|reply| ServerCommand::Connect { transport, reply })
            .await
    }

    pub fn disconnect(&self, connection: ConnectionId) -> Result<(), ServiceWorkerError> {
        self.send(ServerCommand::Disconnect(connection))
    }

    /// Deliver a message from a client process.
    pub fn client_request(
        &self,
        connection: ConnectionId,
        request: ClientRequest,
    ) -> Result<(), ServiceWorkerError> {
        self.send(ServerCommand::Client {
            connection,
            request,
        })
    }

    /// Deliver an event from the execution engine.
    pub fn context_event(&self, event: ContextEvent) -> Result<(), ServiceWorkerError> {
        self.send(ServerCommand::Context(event))
    }

    pub fn context_lost(&self) -> Result<(), ServiceWorkerError> {
        self.send(ServerCommand::ContextLost)
    }

    pub async fn claim(&self, worker: WorkerId) -> Result<(), ServiceWorkerError> {
        self.request(|reply| ServerCommand::Claim { worker, reply })
            .await?
    }

    pub async fn match_all(
        &self,
        worker: WorkerId,
        options: ClientQueryOptions,
    ) -> Result<Vec<ClientData>, ServiceWorkerError> {
        self.request(|reply| ServerCommand::MatchAll {
            worker,
            options,
            reply,
        })
        .await
    }

    /// Start the worker if needed; resolves to whether it is running.
    pub async fn run_service_worker(&self, worker: WorkerId) -> Result<bool, ServiceWorkerError> {
        self.request(|reply| ServerCommand::RunServiceWorker { worker, reply })
            .await
    }

    pub async fn clear_origin(&self, origin: SecurityOriginData) -> Result<(), ServiceWorkerError> {
        self.request(|reply| ServerCommand::ClearOrigin { origin, reply })
            .await
    }

    pub async fn clear_all(&self) -> Result<(), ServiceWorkerError> {
        self.request(|reply| ServerCommand::ClearAll { reply }).await
    }

    /// Stop the task. The join handle yields the coordinator back.
    pub fn shutdown(&self) -> Result<(), ServiceWorkerError> {
        self.send(ServerCommand::Shutdown)
    }
}

/// Run a coordinator on its own task.
pub fn spawn(server: SwServer) -> (SwServerHandle, JoinHandle<SwServer>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let span = server_span(server.session());
    let task = tokio::spawn(run(server, rx).instrument(span));
    (SwServerHandle { tx }, task)
}

async fn run(mut server: SwServer, mut rx: mpsc::UnboundedReceiver<ServerCommand>) -> SwServer {
    server.import_registrations();
    info!(session = %server.session(), "Service worker server running");

    loop {
        let deadline = server.next_idle_deadline();
        let command = tokio::select! {
            command = rx.recv() => command,
            _ = sleep_until(deadline), if deadline.is_some() => {
                server.fire_due_idle_timers(Instant::now());
                continue;
            }
        };

        match command {
            Some(ServerCommand::Shutdown) | None => break,
            Some(command) => apply(&mut server, command),
        }
    }

    info!(session = %server.session(), "Service worker server stopped");
    server
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        time::sleep_until(time::Instant::from_std(deadline)).await;
    }
}

fn apply(server: &mut SwServer, command: ServerCommand) {
    match command {
        ServerCommand::Connect { transport, reply } => {
            let connection = server.register_connection(transport);
            if reply.send(connection).is_err() {
                debug!(%connection, "Connect caller went away");
                server.unregister_connection(connection);
            }
        }
        ServerCommand::Disconnect(connection) => server.unregister_connection(connection),
        ServerCommand::Client {
            connection,
            request,
        } => server.handle_client_request(connection, request),
        ServerCommand::Context(event) => server.handle_context_event(event),
        ServerCommand::ContextLost => server.mark_all_workers_as_terminated(),
        ServerCommand::Claim { worker, reply } => {
            let _ = reply.send(server.claim(worker));
        }
        ServerCommand::MatchAll {
            worker,
            options,
            reply,
        } => {
            let _ = reply.send(server.match_all(worker, options));
        }
        ServerCommand::RunServiceWorker { worker, reply } => {
            server.run_service_worker_if_necessary(
                worker,
                Box::new(move |running| {
                    let _ = reply.send(running);
                }),
            );
        }
        ServerCommand::ClearOrigin { origin, reply } => {
            server.clear_origin(&origin);
            let _ = reply.send(());
        }
        ServerCommand::ClearAll { reply } => {
            server.clear_all();
            let _ = reply.send(());
        }
        ServerCommand::Shutdown => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwServerConfig;
    use crate::connection::{ChannelConnection, ChannelContext};
    use crate::store::MemoryStore;
    use crate::types::SessionId;

    fn server() -> SwServer {
        let (context, _rx) = ChannelContext::new();
        let (server, _notices) = SwServer::new(
            SessionId::new(),
            SwServerConfig::default(),
            Box::new(context),
            Box::new(MemoryStore::new()),
        );
        server
    }

    #[tokio::test]
    async fn test_spawn_imports_and_connects() {
        let (handle, task) = spawn(server());
        let (transport, _messages) = ChannelConnection::new();
        handle.connect(transport).await.unwrap();

        handle.shutdown().unwrap();
        let server = task.await.unwrap();
        assert!(server.is_import_completed());
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_worker_does_not_run() {
        let (handle, task) = spawn(server());
        assert!(!handle.run_service_worker(WorkerId::new()).await.unwrap());
        assert!(matches!(
            handle.claim(WorkerId::new()).await,
            Err(ServiceWorkerError::NotFound(_))
        ));
        handle.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_handle_fails_after_shutdown() {
        let (handle, task) = spawn(server());
        handle.shutdown().unwrap();
        task.await.unwrap();
        assert_eq!(
            handle.clear_all().await,
            Err(ServiceWorkerError::ConnectionClosed)
        );
    }
}
