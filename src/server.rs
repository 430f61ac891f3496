use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tonic::{Request, Response, Status};

use crate::auth;
use crate::cgroup::CgroupController;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::job::{Job, JobStatus};
use crate::limits::Limits;
use crate::pb;
use crate::pb::job_worker_server::{JobWorker, JobWorkerServer};
use crate::registry::Registry;

/// A streaming RPC closes when no data has flowed for this long, even if
/// the client stays connected.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

impl From<JobStatus> for pb::JobStatus {
    fn from(status: JobStatus) -> Self {
        match status {
            JobStatus::Starting => pb::JobStatus::Starting,
            JobStatus::Alive => pb::JobStatus::Alive,
            JobStatus::Finished => pb::JobStatus::Finished,
            JobStatus::Stopped => pb::JobStatus::Stopped,
        }
    }
}

/// The four-operation RPC surface over the job engine.
pub struct JobWorkerService {
    registry: Registry,
    cgroup: Option<Arc<CgroupController>>,
    exec_path: Option<PathBuf>,
    cgroup_root: Option<PathBuf>,
}

impl JobWorkerService {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            cgroup: None,
            exec_path: None,
            cgroup_root: None,
        }
    }

    /// Wire in the controller that releases job cgroups on termination.
    pub fn with_cgroup(mut self, controller: Arc<CgroupController>) -> Self {
        self.cgroup = Some(controller);
        self
    }

    /// Override the wrapper executable on every job this service creates.
    pub fn with_exec_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.exec_path = Some(path.into());
        self
    }

    /// Redirect the cgroup hierarchy on every job this service creates.
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = Some(root.into());
        self
    }
}

fn non_negative(field: &'static str, value: i32) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::InvalidLimit {
        field,
        reason: format!("{value} is negative"),
    })
}

#[tonic::async_trait]
impl JobWorker for JobWorkerService {
    async fn start(
        &self,
        request: Request<pb::StartRequest>,
    ) -> std::result::Result<Response<pb::StartResponse>, Status> {
        let user = auth::caller(&request)?;
        let req = request.into_inner();

        if req.command.is_empty() {
            return Err(Status::invalid_argument("command must not be empty"));
        }
        let limits = Limits {
            memory_mb: non_negative("memoryLimitMB", req.memory_limit_mb)?,
            cpu_weight: non_negative("cpuWeight", req.cpu_weight)?,
            io_weight: non_negative("ioWeight", req.io_weight)?,
        };
        limits.validate()?;

        let mut builder = Job::builder(req.command, req.args)
            .limits(limits)
            .owner(user.name);
        if let Some(cgroup) = &self.cgroup {
            builder = builder.cgroup(Arc::clone(cgroup));
        }
        if let Some(path) = &self.exec_path {
            builder = builder.exec_path(path);
        }
        if let Some(root) = &self.cgroup_root {
            builder = builder.cgroup_root(root);
        }

        let job = Arc::new(builder.build());
        job.start()?;
        self.registry.put(Arc::clone(&job))?;

        tracing::info!(id = %job.id, command = %job.command, "job accepted");
        Ok(Response::new(pb::StartResponse {
            job_id: job.id.to_string(),
        }))
    }

    async fn stop(
        &self,
        request: Request<pb::StopRequest>,
    ) -> std::result::Result<Response<pb::StopResponse>, Status> {
        let user = auth::caller(&request)?;
        let job = self.registry.get(&request.get_ref().job_id)?;

        if let Some(owner) = job.owner() {
            if owner != user.name {
                return Err(Error::AccessDenied.into());
            }
        }

        job.stop().await?;
        Ok(Response::new(pb::StopResponse {}))
    }

    async fn status(
        &self,
        request: Request<pb::StatusRequest>,
    ) -> std::result::Result<Response<pb::StatusResponse>, Status> {
        auth::caller(&request)?;
        let job = self.registry.get(&request.get_ref().job_id)?;
        let state = job.status();

        Ok(Response::new(pb::StatusResponse {
            status: pb::JobStatus::from(state.status) as i32,
            memory_limit_mb: state.limits.memory_mb as i32,
            cpu_limit_percentage: state.limits.cpu_weight as i32,
            io_limit_percentage: state.limits.io_weight as i32,
            exit_code: state.exit_code,
        }))
    }

    type StreamStream = ReceiverStream<std::result::Result<pb::StreamResponse, Status>>;

    async fn stream(
        &self,
        request: Request<pb::StreamRequest>,
    ) -> std::result::Result<Response<Self::StreamStream>, Status> {
        auth::caller(&request)?;
        let req = request.get_ref();
        let job = self.registry.get(&req.job_id)?;

        let cancel = CancellationToken::new();
        let mut source = if req.stream_errors {
            job.stream_stderr(cancel.clone())?
        } else {
            job.stream_stdout(cancel.clone())?
        };

        let (tx, rx) = mpsc::channel(1);
        tokio::spawn(async move {
            // Holding the job here keeps the registry sweeper from evicting
            // it mid-stream.
            let _job = job;
            loop {
                match tokio::time::timeout(STREAM_IDLE_TIMEOUT, source.recv()).await {
                    Ok(Some(chunk)) => {
                        let resp = pb::StreamResponse { out_stream: chunk };
                        if tx.send(Ok(resp)).await.is_err() {
                            // Client went away.
                            break;
                        }
                    }
                    // Pipeline closed: end of stream.
                    Ok(None) => break,
                    // Idle too long.
                    Err(_) => break,
                }
            }
            cancel.cancel();
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

/// Run the server: verify cgroup support, sweep orphans from a previous
/// run, and listen with mutual TLS until the process is killed.
pub async fn serve(config: ServerConfig) -> Result<()> {
    let cgroup = Arc::new(CgroupController::init()?);
    let sweeper = Arc::clone(&cgroup);
    tokio::spawn(async move {
        let removed = sweeper.sweep_orphans().await;
        if removed > 0 {
            tracing::info!(removed, "swept orphan cgroups from a previous run");
        }
    });

    let registry = Registry::with_ttl(config.job_ttl());
    let service = JobWorkerService::new(registry).with_cgroup(cgroup);

    let identity = Identity::from_pem(
        std::fs::read_to_string(&config.cert)?,
        std::fs::read_to_string(&config.key)?,
    );
    let client_ca = Certificate::from_pem(std::fs::read_to_string(&config.ca)?);
    let tls = ServerTlsConfig::new()
        .identity(identity)
        .client_ca_root(client_ca);

    let addr = config
        .listen_addr
        .parse()
        .map_err(|_| Error::InvalidAddr(config.listen_addr.clone()))?;

    tracing::info!(%addr, "jobworker listening");
    Server::builder()
        .tls_config(tls)?
        .add_service(JobWorkerServer::new(service))
        .serve(addr)
        .await?;

    Ok(())
}
