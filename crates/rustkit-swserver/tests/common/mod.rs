//! Shared harness: a coordinator wired to in-process channel transports.

#![allow(dead_code)]

use rustkit_swserver::{
    ChannelConnection, ChannelContext, ClientData, ClientId, ClientMessage, ClientRequest,
    ClientType, ConnectionId, ContextCommand, ContextData, ContextEvent, FetchResult, FrameType,
    JobData, JobId, MemoryStore, RegistrationData, RegistrationKey, RegistrationStore,
    SecurityOriginData, ServerNotice, SessionId, SwServer, SwServerConfig, WorkerId,
};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;

pub const ORIGIN: &str = "https://example.com";

pub fn url(path: &str) -> Url {
    Url::parse(&format!("{}{}", ORIGIN, path)).unwrap()
}

pub fn origin() -> SecurityOriginData {
    SecurityOriginData::from_url(&url("/"))
}

pub fn key(scope: &str) -> RegistrationKey {
    RegistrationKey::new(origin(), url(scope))
}

pub fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// A client process: its connection id and the messages it received.
pub struct Client {
    pub id: ConnectionId,
    pub rx: UnboundedReceiver<ClientMessage>,
    next_job: u64,
    next_context: u64,
}

impl Client {
    pub fn messages(&mut self) -> Vec<ClientMessage> {
        drain(&mut self.rx)
    }

    pub fn job_id(&mut self) -> JobId {
        self.next_job += 1;
        JobId::new(self.id, self.next_job)
    }

    pub fn client_id(&mut self) -> ClientId {
        self.next_context += 1;
        ClientId::new(self.id, self.next_context)
    }
}

pub struct Harness {
    pub server: SwServer,
    pub notices: UnboundedReceiver<ServerNotice>,
    pub engine: UnboundedReceiver<ContextCommand>,
}

impl Harness {
    /// A coordinator over an empty memory store, already imported.
    pub fn new() -> Self {
        let mut harness = Self::unimported(SwServerConfig::default(), Box::new(MemoryStore::new()));
        harness.server.import_registrations();
        harness
    }

    pub fn with_config(config: SwServerConfig) -> Self {
        let mut harness = Self::unimported(config, Box::new(MemoryStore::new()));
        harness.server.import_registrations();
        harness
    }

    pub fn unimported(config: SwServerConfig, store: Box<dyn RegistrationStore>) -> Self {
        let (context, engine) = ChannelContext::new();
        let (server, notices) = SwServer::new(SessionId::new(), config, Box::new(context), store);
        Self {
            server,
            notices,
            engine,
        }
    }

    pub fn connect(&mut self) -> Client {
        let (transport, rx) = ChannelConnection::new();
        let id = self.server.register_connection(Box::new(transport));
        Client {
            id,
            rx,
            next_job: 0,
            next_context: 0,
        }
    }

    pub fn commands(&mut self) -> Vec<ContextCommand> {
        drain(&mut self.engine)
    }

    pub fn request(&mut self, client: &Client, request: ClientRequest) {
        self.server.handle_client_request(client.id, request);
    }

    pub fn event(&mut self, event: ContextEvent) {
        self.server.handle_context_event(event);
    }

    // ==================== Jobs ====================

    pub fn register(&mut self, client: &mut Client, scope: &str, script: &str) -> JobData {
        let job = JobData::register(client.job_id(), origin(), url("/index.html"), url(script), url(scope));
        self.request(client, ClientRequest::ScheduleJob(job.clone()));
        job
    }

    pub fn update(&mut self, client: &mut Client, scope: &str, script: &str) -> JobData {
        let job = JobData::update(client.job_id(), origin(), url("/index.html"), url(script), url(scope));
        self.request(client, ClientRequest::ScheduleJob(job.clone()));
        job
    }

    pub fn unregister(&mut self, client: &mut Client, scope: &str) -> JobData {
        let job = JobData::unregister(client.job_id(), origin(), url("/index.html"), url(scope));
        self.request(client, ClientRequest::ScheduleJob(job.clone()));
        job
    }

    pub fn fetch(&mut self, client: &Client, job: &JobData, script: &str) {
        let result = FetchResult::success(job.id, job.registration_key(), script);
        self.request(client, ClientRequest::FinishFetchingScript(result));
    }

    pub fn fetch_fails(&mut self, client: &Client, job: &JobData, error: &str) {
        let result = FetchResult::failure(job.id, job.registration_key(), error);
        self.request(client, ClientRequest::FinishFetchingScript(result));
    }

    /// The context the engine was asked to start.
    pub fn expect_install_context(&mut self) -> ContextData {
        self.commands()
            .into_iter()
            .find_map(|command| match command {
                ContextCommand::InstallContext(data) => Some(data),
                _ => None,
            })
            .expect("engine was not asked to start a worker")
    }

    pub fn started(&mut self, data: &ContextData) {
        self.event(ContextEvent::ScriptContextStarted {
            job_id: data.job_id,
            worker_id: data.worker_id,
        });
    }

    /// The engine reports that `data`'s context stopped.
    pub fn terminated(&mut self, data: &ContextData) {
        self.event(ContextEvent::WorkerTerminated {
            worker_id: data.worker_id,
            generation: data.generation,
        });
    }

    /// As [`Self::terminated`], for the worker's current context.
    pub fn worker_terminated(&mut self, worker: WorkerId) {
        let generation = self
            .server
            .worker(worker)
            .map_or(0, |w| w.context_generation());
        self.event(ContextEvent::WorkerTerminated {
            worker_id: worker,
            generation,
        });
    }

    pub fn installed(&mut self, job: &JobData, worker: WorkerId, success: bool) {
        self.event(ContextEvent::DidFinishInstall {
            job_id: Some(job.id),
            worker_id: worker,
            success,
        });
    }

    /// Drive a register job through fetch, start, promise resolution and
    /// install. Returns the new worker and the registration it resolved with.
    pub fn register_and_install(
        &mut self,
        client: &mut Client,
        scope: &str,
        script: &str,
    ) -> (WorkerId, RegistrationData) {
        let job = self.register(client, scope, script);
        self.fetch(client, &job, &format!("// {}", script));
        let data = self.expect_install_context();
        self.started(&data);

        let registration = client
            .messages()
            .into_iter()
            .find_map(|message| match message {
                ClientMessage::ResolveRegistrationJob { registration, .. } => Some(registration),
                _ => None,
            })
            .expect("registration job was not resolved");
        self.request(client, ClientRequest::AddRegistrationInterest(registration.id));
        self.request(
            client,
            ClientRequest::DidResolveRegistrationPromise(job.registration_key()),
        );
        self.installed(&job, data.worker_id, true);
        (data.worker_id, registration)
    }

    /// As [`Self::register_and_install`], then finish activation.
    pub fn register_and_activate(
        &mut self,
        client: &mut Client,
        scope: &str,
        script: &str,
    ) -> (WorkerId, RegistrationData) {
        let (worker, registration) = self.register_and_install(client, scope, script);
        self.event(ContextEvent::DidFinishActivation(worker));
        (worker, registration)
    }

    // ==================== Clients ====================

    pub fn add_client(&mut self, client: &mut Client, path: &str, controller: Option<WorkerId>) -> ClientId {
        let id = client.client_id();
        let data = ClientData {
            id,
            url: url(path),
            client_type: ClientType::Window,
            frame_type: FrameType::TopLevel,
        };
        self.request(
            client,
            ClientRequest::RegisterClient {
                top_origin: origin(),
                client: data,
                controller,
            },
        );
        id
    }
}

pub fn rejection(messages: &[ClientMessage], job: &JobData) -> Option<rustkit_swserver::ServiceWorkerError> {
    messages.iter().find_map(|message| match message {
        ClientMessage::RejectJob { job_id, error } if *job_id == job.id => Some(error.clone()),
        _ => None,
    })
}

pub fn resolution(messages: &[ClientMessage], job: &JobData) -> Option<(RegistrationData, bool)> {
    messages.iter().find_map(|message| match message {
        ClientMessage::ResolveRegistrationJob {
            job_id,
            registration,
            notify_when_resolved,
        } if *job_id == job.id => Some((registration.clone(), *notify_when_resolved)),
        _ => None,
    })
}

pub fn fetch_requested(messages: &[ClientMessage], job: &JobData) -> bool {
    messages.iter().any(|message| {
        matches!(message, ClientMessage::StartScriptFetch { job_id, .. } if *job_id == job.id)
    })
}
