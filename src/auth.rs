use tonic::Request;
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::error::{Error, Result};

/// The authenticated caller of a request. The name is the Common Name of
/// the client certificate, which is also what jobs record as their owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
}

/// Resolve the caller of a request.
///
/// A `User` placed in the request extensions wins, which is how in-process
/// callers and tests supply an identity without a TLS session. Otherwise
/// the identity is read from the first peer certificate of the mTLS
/// handshake; a request with neither is unauthenticated.
pub fn caller<T>(req: &Request<T>) -> Result<User> {
    if let Some(user) = req.extensions().get::<User>() {
        return Ok(user.clone());
    }

    let certs = req.peer_certs().ok_or(Error::Unauthorized)?;
    let der = certs.first().ok_or(Error::Unauthorized)?;
    let name = common_name(der.as_ref())?;
    Ok(User { name })
}

/// Extract the subject Common Name from a DER-encoded certificate.
pub fn common_name(der: &[u8]) -> Result<String> {
    let (_, cert) = X509Certificate::from_der(der).map_err(|_| Error::Unauthorized)?;
    let result = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string)
        .ok_or(Error::Unauthorized);
    result
}
