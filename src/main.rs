use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args, Parser, Subcommand};
use tokio::io::AsyncWriteExt;

use jobworker::client::{self, ClientConfig};
use jobworker::config::ServerConfig;
use jobworker::pb;
use jobworker::{reexec, server};

#[derive(Parser)]
#[command(
    name = "jobworker",
    about = "Remote job runner",
    long_about = "Launch arbitrary commands on a Linux host under cgroup limits and tail\n\
                  their output remotely over mutually-authenticated gRPC.",
    version
)]
struct Cli {
    /// Enable verbose (debug-level) logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server.
    Serve {
        /// Path to a TOML config file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address to listen on (overrides the config file)
        #[arg(long)]
        addr: Option<String>,

        /// Server certificate (PEM)
        #[arg(long)]
        cert: Option<PathBuf>,

        /// Server private key (PEM)
        #[arg(long)]
        key: Option<PathBuf>,

        /// CA certificate clients must be signed by (PEM)
        #[arg(long)]
        ca: Option<PathBuf>,

        /// Seconds to retain terminated jobs
        #[arg(long)]
        job_ttl: Option<u64>,
    },

    /// Start a job on the server; prints the job id.
    Start {
        #[command(flatten)]
        conn: ConnFlags,

        /// CPU weight percentage (1-100, 0 = unlimited)
        #[arg(long, default_value_t = 0)]
        cpu: i32,

        /// Memory limit in megabytes (0 = unlimited)
        #[arg(long, default_value_t = 0)]
        mem: i32,

        /// Block-I/O weight percentage (1-100, 0 = unlimited)
        #[arg(long, default_value_t = 0)]
        io: i32,

        /// The command to run and its arguments (prefix with -- if the
        /// command takes flags of its own)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Stop a job you started.
    Stop {
        #[command(flatten)]
        conn: ConnFlags,

        job_id: String,
    },

    /// Show a job's state.
    Status {
        #[command(flatten)]
        conn: ConnFlags,

        job_id: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Tail a job's output to stdout.
    Stream {
        #[command(flatten)]
        conn: ConnFlags,

        job_id: String,

        /// Tail stderr instead of stdout
        #[arg(long)]
        stderr: bool,
    },
}

/// Connection flags shared by every client subcommand.
#[derive(Args)]
struct ConnFlags {
    /// Server address, host:port
    #[arg(long, default_value = "localhost:50051")]
    addr: String,

    /// Client certificate (PEM)
    #[arg(long, default_value = "certs/client.pem")]
    cert: PathBuf,

    /// Client private key (PEM)
    #[arg(long, default_value = "certs/client.key")]
    key: PathBuf,

    /// CA certificate the server is signed by (PEM)
    #[arg(long, default_value = "certs/ca.pem")]
    ca: PathBuf,

    /// Hostname on the server certificate (SNI)
    #[arg(long, default_value = "localhost")]
    domain: String,
}

impl ConnFlags {
    fn into_config(self) -> ClientConfig {
        ClientConfig {
            addr: self.addr,
            cert: self.cert,
            key: self.key,
            ca: self.ca,
            domain: self.domain,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // A re-exec never reaches the normal CLI: it enrols itself into the
    // job's cgroup and execs the user command in place.
    if reexec::is_reexec() {
        reexec::run().await;
        return ExitCode::FAILURE;
    }

    let cli = Cli::parse();

    // RUST_LOG takes precedence, then --verbose, then warnings only.
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Serve {
            config,
            addr,
            cert,
            key,
            ca,
            job_ttl,
        } => run_serve(config, addr, cert, key, ca, job_ttl).await,
        Commands::Start {
            conn,
            cpu,
            mem,
            io,
            command,
        } => run_start(conn.into_config(), cpu, mem, io, command).await,
        Commands::Stop { conn, job_id } => run_stop(conn.into_config(), job_id).await,
        Commands::Status { conn, job_id, json } => {
            run_status(conn.into_config(), job_id, json).await
        }
        Commands::Stream {
            conn,
            job_id,
            stderr,
        } => run_stream(conn.into_config(), job_id, stderr).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_serve(
    config: Option<PathBuf>,
    addr: Option<String>,
    cert: Option<PathBuf>,
    key: Option<PathBuf>,
    ca: Option<PathBuf>,
    job_ttl: Option<u64>,
) -> jobworker::Result<()> {
    let mut cfg = match config {
        Some(path) => ServerConfig::load(&path)?,
        None => ServerConfig::default(),
    };
    if let Some(addr) = addr {
        cfg.listen_addr = addr;
    }
    if let Some(cert) = cert {
        cfg.cert = cert;
    }
    if let Some(key) = key {
        cfg.key = key;
    }
    if let Some(ca) = ca {
        cfg.ca = ca;
    }
    if let Some(ttl) = job_ttl {
        cfg.job_ttl_secs = ttl;
    }

    server::serve(cfg).await
}

async fn run_start(
    config: ClientConfig,
    cpu: i32,
    mem: i32,
    io: i32,
    mut command: Vec<String>,
) -> jobworker::Result<()> {
    let cmd = command.remove(0);
    let mut client = client::connect(&config).await?;

    let resp = client
        .start(pb::StartRequest {
            command: cmd,
            args: command,
            cpu_weight: cpu,
            io_weight: io,
            memory_limit_mb: mem,
        })
        .await?
        .into_inner();

    println!("{}", resp.job_id);
    Ok(())
}

async fn run_stop(config: ClientConfig, job_id: String) -> jobworker::Result<()> {
    let mut client = client::connect(&config).await?;
    client.stop(pb::StopRequest { job_id }).await?;
    println!("stopped");
    Ok(())
}

async fn run_status(config: ClientConfig, job_id: String, json: bool) -> jobworker::Result<()> {
    let mut client = client::connect(&config).await?;
    let resp = client.status(pb::StatusRequest { job_id }).await?.into_inner();

    let status = pb::JobStatus::try_from(resp.status)
        .map(|s| s.as_str_name().to_string())
        .unwrap_or_else(|_| format!("UNKNOWN({})", resp.status));

    if json {
        let out = serde_json::json!({
            "status": status,
            "exitCode": resp.exit_code,
            "memoryLimitMB": resp.memory_limit_mb,
            "cpuLimitPercentage": resp.cpu_limit_percentage,
            "ioLimitPercentage": resp.io_limit_percentage,
        });
        println!("{out}");
    } else if resp.status == pb::JobStatus::Finished as i32
        || resp.status == pb::JobStatus::Stopped as i32
    {
        println!("{status} (exit code {})", resp.exit_code);
    } else {
        println!("{status}");
    }
    Ok(())
}

async fn run_stream(config: ClientConfig, job_id: String, stderr: bool) -> jobworker::Result<()> {
    let mut client = client::connect(&config).await?;
    let mut stream = client
        .stream(pb::StreamRequest {
            job_id,
            stream_errors: stderr,
        })
        .await?
        .into_inner();

    let mut stdout = tokio::io::stdout();
    while let Some(msg) = stream.message().await? {
        stdout.write_all(&msg.out_stream).await?;
        stdout.flush().await?;
    }
    Ok(())
}
