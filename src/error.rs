//
use std::fmt;
use std::io;

use time::OffsetDateTime;

use crate::acme::api::ApiProblem;
use crate::orchestrator::Stage;

/// acme-dns01 result.
pub type Result<T> = ::std::result::Result<T, Error>;

/// acme-dns01 errors.
#[derive(Debug)]
pub enum Error {
    /// The ACME API answered with a problem document.
    Api(ApiProblem),
    /// An OpenSSL operation failed.
    Crypto(openssl::error::ErrorStack),
    /// JSON serialization/deserialization error.
    Json(serde_json::Error),
    /// YAML serialization/deserialization error.
    Yaml(serde_yaml::Error),
    /// std::io error.
    Io(io::Error),
    /// Invalid configuration or input file.
    Config(String),
    /// The state file does not exist.
    StateNotFound(String),
    /// The state file could not be parsed.
    StateParse { path: String, source: serde_yaml::Error },
    /// A requested domain has no exactly matching zone.
    UnmatchedDomain(String),
    /// Some domains carry a challenge record id and some do not.
    MixedState {
        with_record: Vec<String>,
        without_record: Vec<String>,
    },
    /// DNS already holds a challenge value we do not recognize.
    StaleRecord { domain: String, found: Vec<String> },
    /// The challenge records never became visible.
    NotPropagated { domains: Vec<String> },
    /// A challenge expired before it was accepted.
    ChallengeExpired {
        domain: String,
        expires: OffsetDateTime,
    },
    /// The authorization offers no dns-01 challenge.
    NoDnsChallenge(String),
    /// The order holds no authorization for a requested domain.
    NoAuthorization(String),
    /// The CA marked the challenge invalid.
    ChallengeRejected { domain: String, problem: String },
    /// The CA marked the order invalid.
    OrderInvalid { url: String, problem: String },
    /// Polling the order ran out of attempts.
    PollTimeout { url: String, status: String },
    /// The DNS provider API failed.
    Provider(String),
    /// The DNS provider has no record with this id.
    RecordNotFound { record_id: String },
    /// A DNS lookup failed for a reason other than a missing record.
    Lookup { name: String, reason: String },
    /// Wraps an error with the orchestration stage it happened in.
    Stage {
        stage: Stage,
        domain: Option<String>,
        source: Box<Error>,
    },
    /// Some other error. Notice that `Error` is
    /// `From<String>` and `From<&str>` and it becomes `Other`.
    Other(String),
}

/// Coarse classification used for exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    NotPropagated,
    Provider,
    Certificate,
    Io,
}

impl Error {
    /// Label the error with the stage (and domain) it happened in. An already
    /// labelled error keeps its original label.
    pub fn at(self, stage: Stage, domain: Option<&str>) -> Error {
        match self {
            e @ Error::Stage { .. } => e,
            e => Error::Stage {
                stage,
                domain: domain.map(|d| d.to_string()),
                source: Box::new(e),
            },
        }
    }

    /// The error beneath any stage label.
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            e => e,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Error::Config(_)
            | Error::StateNotFound(_)
            | Error::StateParse { .. }
            | Error::UnmatchedDomain(_)
            | Error::MixedState { .. }
            | Error::StaleRecord { .. } => ErrorKind::Configuration,
            Error::NotPropagated { .. } => ErrorKind::NotPropagated,
            Error::Provider(_) | Error::RecordNotFound { .. } | Error::Lookup { .. } => {
                ErrorKind::Provider
            }
            Error::Io(_) | Error::Yaml(_) => ErrorKind::Io,
            _ => ErrorKind::Certificate,
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Stage { source, .. } => Some(source.as_ref()),
            Error::StateParse { source, .. } => Some(source),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Api(p) => write!(f, "ACME API: {}", p),
            Error::Crypto(e) => write!(f, "{}", e),
            Error::Json(e) => write!(f, "{}", e),
            Error::Yaml(e) => write!(f, "{}", e),
            Error::Io(e) => write!(f, "{}", e),
            Error::Config(s) => write!(f, "configuration: {}", s),
            Error::StateNotFound(p) => write!(f, "state file not found: {}", p),
            Error::StateParse { path, source } => {
                write!(f, "state file {} is not valid: {}", path, source)
            }
            Error::UnmatchedDomain(d) => write!(f, "no zone matches domain {}", d),
            Error::MixedState {
                with_record,
                without_record,
            } => write!(
                f,
                "inconsistent state: challenge records exist for [{}] but not for [{}], run clean first",
                with_record.join(", "),
                without_record.join(", ")
            ),
            Error::StaleRecord { domain, found } => write!(
                f,
                "unexpected challenge record for {}: {}",
                domain,
                found.join(", ")
            ),
            Error::NotPropagated { domains } => write!(
                f,
                "challenge records not visible in DNS: {}",
                domains.join(", ")
            ),
            Error::ChallengeExpired { domain, expires } => {
                write!(f, "challenge for {} expired at {}", domain, expires)
            }
            Error::NoDnsChallenge(d) => write!(f, "no dns-01 challenge offered for {}", d),
            Error::NoAuthorization(d) => write!(f, "order has no authorization for {}", d),
            Error::ChallengeRejected { domain, problem } => {
                write!(f, "challenge for {} rejected: {}", domain, problem)
            }
            Error::OrderInvalid { url, problem } => {
                write!(f, "order {} is invalid: {}", url, problem)
            }
            Error::PollTimeout { url, status } => {
                write!(f, "order {} still {} after polling", url, status)
            }
            Error::Provider(s) => write!(f, "DNS provider: {}", s),
            Error::RecordNotFound { record_id } => write!(f, "DNS record {} not found", record_id),
            Error::Lookup { name, reason } => write!(f, "lookup of {} failed: {}", name, reason),
            Error::Stage {
                stage,
                domain: Some(domain),
                source,
            } => write!(f, "[{}] {}: {}", stage, domain, source),
            Error::Stage {
                stage,
                domain: None,
                source,
            } => write!(f, "[{}] {}", stage, source),
            Error::Other(s) => write!(f, "{}", s),
        }
    }
}

impl From<ApiProblem> for Error {
    fn from(p: ApiProblem) -> Self {
        Error::Api(p)
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Crypto(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(e)
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Yaml(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}
