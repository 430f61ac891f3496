use std::path::PathBuf;

use tonic::transport::{Certificate, Channel, ClientTlsConfig, Identity};

use crate::error::{Error, Result};
use crate::pb::job_worker_client::JobWorkerClient;

/// Everything needed to reach a server: where it is and which identity to
/// present. The server only admits certificates signed by its CA, and the
/// certificate's Common Name becomes the caller identity on every request.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// `host:port` of the server.
    pub addr: String,
    /// Client certificate (PEM).
    pub cert: PathBuf,
    /// Client private key (PEM).
    pub key: PathBuf,
    /// CA certificate the server's certificate is signed by (PEM).
    pub ca: PathBuf,
    /// Hostname the server certificate is issued for (SNI).
    pub domain: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addr: "localhost:50051".to_string(),
            cert: PathBuf::from("certs/client.pem"),
            key: PathBuf::from("certs/client.key"),
            ca: PathBuf::from("certs/ca.pem"),
            domain: "localhost".to_string(),
        }
    }
}

/// Open a mutually-authenticated channel to the server.
pub async fn connect(config: &ClientConfig) -> Result<JobWorkerClient<Channel>> {
    let identity = Identity::from_pem(
        std::fs::read_to_string(&config.cert)?,
        std::fs::read_to_string(&config.key)?,
    );
    let ca = Certificate::from_pem(std::fs::read_to_string(&config.ca)?);
    let tls = ClientTlsConfig::new()
        .ca_certificate(ca)
        .identity(identity)
        .domain_name(&config.domain);

    let endpoint = Channel::from_shared(format!("https://{}", config.addr))
        .map_err(|_| Error::InvalidAddr(config.addr.clone()))?;
    let channel = endpoint.tls_config(tls)?.connect().await?;

    Ok(JobWorkerClient::new(channel))
}
