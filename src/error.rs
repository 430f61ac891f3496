use std::path::PathBuf;

use crate::job::JobStatus;

/// All errors that can occur in the worker.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cgroup parameter {0} is not supported by this kernel")]
    NotSupported(String),

    #[error("cgroup controller initialization failed")]
    CgroupInit(#[source] std::io::Error),

    #[error("failed to create cgroup {group} under {subsystem}")]
    CgroupCreate {
        group: String,
        subsystem: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write cgroup file {path}")]
    CgroupWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove cgroup {group} under {subsystem}")]
    CgroupRemove {
        group: String,
        subsystem: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("job {0} was not found")]
    NotFound(String),

    #[error("job {0} is already registered")]
    AlreadyExists(String),

    #[error("no client identity on the request")]
    Unauthorized,

    #[error("client is not the owner of this job")]
    AccessDenied,

    #[error("cannot {op} a job that is {from}")]
    BadState { from: JobStatus, op: &'static str },

    #[error("invalid {field}: {reason}")]
    InvalidLimit {
        field: &'static str,
        reason: String,
    },

    #[error("failed to start the job process")]
    StartFailed(#[source] std::io::Error),

    #[error("failed to stop the job: {0}")]
    StopFailed(String),

    #[error("timed out waiting for the job to terminate")]
    StopTimeout,

    #[error("the log hub is stopped")]
    HubStopped,

    #[error("invalid server address: {0}")]
    InvalidAddr(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),
}

/// Fix the RPC surface once: every internal error kind has exactly one
/// gRPC status code.
impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        use tonic::Status;

        let msg = err.to_string();
        match err {
            Error::NotFound(_) => Status::not_found(msg),
            Error::AlreadyExists(_) => Status::already_exists(msg),
            Error::Unauthorized => Status::unauthenticated(msg),
            Error::AccessDenied => Status::permission_denied(msg),
            Error::BadState { .. } => Status::failed_precondition(msg),
            Error::InvalidLimit { .. } => Status::invalid_argument(msg),
            Error::StopTimeout => Status::deadline_exceeded(msg),
            Error::Rpc(status) => status,
            _ => Status::internal(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        let cases: Vec<(Error, tonic::Code)> = vec![
            (Error::NotFound("x".into()), tonic::Code::NotFound),
            (Error::AlreadyExists("x".into()), tonic::Code::AlreadyExists),
            (Error::Unauthorized, tonic::Code::Unauthenticated),
            (Error::AccessDenied, tonic::Code::PermissionDenied),
            (
                Error::BadState {
                    from: JobStatus::Finished,
                    op: "stop",
                },
                tonic::Code::FailedPrecondition,
            ),
            (
                Error::InvalidLimit {
                    field: "cpuWeight",
                    reason: "must be at most 100".into(),
                },
                tonic::Code::InvalidArgument,
            ),
            (Error::StopTimeout, tonic::Code::DeadlineExceeded),
            (Error::StopFailed("gone".into()), tonic::Code::Internal),
        ];

        for (err, code) in cases {
            let status = tonic::Status::from(err);
            assert_eq!(status.code(), code, "wrong code for {}", status.message());
        }
    }

    #[test]
    fn bad_state_message_names_state_and_operation() {
        let err = Error::BadState {
            from: JobStatus::Finished,
            op: "stop",
        };
        let msg = err.to_string();
        assert!(msg.contains("stop"), "{msg}");
        assert!(msg.contains("FINISHED"), "{msg}");
    }
}
