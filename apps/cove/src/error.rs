use thiserror::Error;

/// Failures talking to one host, classified by required recovery.
#[derive(Debug, Error)]
pub enum HostError {
    /// Network trouble or a 5xx. Retry after the cooldown; keep the
    /// token and all pending state.
    #[error("transient host failure: {0}")]
    Transient(String),
    /// 401. The token is wrong or missing.
    #[error("host rejected credentials")]
    Unauthorized,
    /// 403. The host actively locked this client out; stored credentials
    /// must not be reused.
    #[error("host locked this client out")]
    Locked,
    /// An access gateway answered instead of the host. The host token is
    /// fine; the user has to complete the gateway login at `login_url`.
    #[error("access gateway interposed: {login_url}")]
    GatewayRedirect { login_url: String },
    /// The host answered but with something that does not parse.
    #[error("malformed host response: {0}")]
    Protocol(String),
}
