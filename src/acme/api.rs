//! Low level ACME JSON objects (RFC 8555).
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Serializes to `""`, the payload of a POST-as-GET.
pub struct ApiEmptyString;
impl Serialize for ApiEmptyString {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("")
    }
}

/// Serializes to `{}`, the payload that tells the CA to check a challenge.
pub struct ApiEmptyObject;
impl Serialize for ApiEmptyObject {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_map(Some(0))?.end()
    }
}

/// Status of accounts, orders, authorizations and challenges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Status::Pending => "pending",
            Status::Ready => "ready",
            Status::Processing => "processing",
            Status::Valid => "valid",
            Status::Invalid => "invalid",
            Status::Deactivated => "deactivated",
            Status::Expired => "expired",
            Status::Revoked => "revoked",
            Status::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// `application/problem+json` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiProblem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subproblems: Option<Vec<ApiSubproblem>>,
}

impl ApiProblem {
    /// `urn:ietf:params:acme:error:badNonce`
    pub fn is_bad_nonce(&self) -> bool {
        self.kind.ends_with(":badNonce") || self.kind == "badNonce"
    }
}

impl fmt::Display for ApiProblem {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{}: {}", self.kind, detail)?,
            None => write!(f, "{}", self.kind)?,
        }
        for sub in self.subproblems.iter().flatten() {
            let on = sub.identifier.as_ref().map(|i| i.value.as_str()).unwrap_or("-");
            let detail = sub.detail.as_deref().unwrap_or("");
            write!(f, "; {} ({}): {}", sub.kind, on, detail)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiSubproblem {
    #[serde(rename = "type")]
    pub kind: String,
    pub detail: Option<String>,
    pub identifier: Option<ApiIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiDirectory {
    pub new_nonce: String,
    pub new_account: String,
    pub new_order: String,
    #[serde(default)]
    pub revoke_cert: String,
    #[serde(default)]
    pub key_change: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ApiDirectoryMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiDirectoryMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
}

/// Request and response body of `newAccount`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ApiAccount {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms_of_service_agreed: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,
}

impl ApiAccount {
    pub fn status(&self) -> Status {
        self.status.unwrap_or(Status::Unknown)
    }
}

/// An order. The same object is sent to `newOrder` with only the
/// identifiers filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ApiOrder {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    pub identifiers: Vec<ApiIdentifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiProblem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authorizations: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub finalize: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
}

impl ApiOrder {
    pub fn status(&self) -> Status {
        self.status.unwrap_or(Status::Unknown)
    }
    /// Authorizations are outstanding.
    pub fn is_status_pending(&self) -> bool {
        self.status() == Status::Pending
    }
    /// Waiting for the CSR.
    pub fn is_status_ready(&self) -> bool {
        self.status() == Status::Ready
    }
    /// The CA is signing.
    pub fn is_status_processing(&self) -> bool {
        self.status() == Status::Processing
    }
    /// The certificate can be downloaded.
    pub fn is_status_valid(&self) -> bool {
        self.status() == Status::Valid
    }
    pub fn is_status_invalid(&self) -> bool {
        self.status() == Status::Invalid
    }
    /// The problem the CA reported, or the bare status.
    pub fn problem(&self) -> String {
        match &self.error {
            Some(p) => p.to_string(),
            None => format!("order status {}", self.status()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiIdentifier {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: String,
}

impl ApiIdentifier {
    pub fn dns(value: &str) -> Self {
        ApiIdentifier {
            kind: "dns".into(),
            value: value.into(),
        }
    }
}

/// Authorization of one identifier. Wildcard names arrive without the `*.`
/// and with `wildcard` set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiAuth {
    pub identifier: ApiIdentifier,
    pub status: Option<Status>,
    pub expires: Option<String>,
    pub challenges: Vec<ApiChallenge>,
    pub wildcard: Option<bool>,
}

impl ApiAuth {
    /// The requested name, with the `*.` put back for wildcard
    /// authorizations.
    pub fn domain(&self) -> String {
        if self.wildcard.unwrap_or(false) {
            format!("*.{}", self.identifier.value)
        } else {
            self.identifier.value.clone()
        }
    }
    pub fn dns_challenge(&self) -> Option<&ApiChallenge> {
        self.challenges.iter().find(|c| c.kind == "dns-01")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiChallenge {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub status: Status,
    #[serde(default)]
    pub token: String,
    pub error: Option<ApiProblem>,
}

impl ApiChallenge {
    pub fn is_status_pending(&self) -> bool {
        self.status == Status::Pending
    }
    pub fn is_status_valid(&self) -> bool {
        self.status == Status::Valid
    }
    pub fn is_status_invalid(&self) -> bool {
        self.status == Status::Invalid
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiFinalize {
    pub csr: String,
}
