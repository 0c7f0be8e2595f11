//! Cloudflare v4 API client.
//!
//! Only the handful of calls needed for challenge records: listing zones and
//! records, creating TXT records and deleting records. Authentication is a
//! scoped API token with `Zone:Read` and `DNS:Edit`.
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dns::{DnsProvider, DnsRecord, CHALLENGE_TTL};
use crate::req::agent;
use crate::zone::ZoneRecord;
use crate::{Error, Result};

const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

const PER_PAGE: u32 = 100;

// Cloudflare error code for an unknown record id.
const RECORD_DOES_NOT_EXIST: i64 = 81044;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct ApiMessage {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    page: u32,
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct ApiZone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(default)]
    content: String,
}

#[derive(Debug, Serialize)]
struct NewRecord<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
}

/// Cloudflare DNS provider.
#[derive(Clone)]
pub struct Cloudflare {
    agent: ureq::Agent,
    base_url: String,
    token: String,
}

impl std::fmt::Debug for Cloudflare {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Cloudflare")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl Cloudflare {
    pub fn new(token: &str) -> Self {
        Self::with_base_url(CLOUDFLARE_API, token)
    }

    /// Talk to another API endpoint, such as a test server.
    pub fn with_base_url(base_url: &str, token: &str) -> Self {
        Cloudflare {
            agent: agent(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    fn auth(&self) -> String {
        format!("Bearer {}", self.token)
    }

    fn get<T: DeserializeOwned>(&self, path: &str, page: u32) -> Result<Envelope<T>> {
        let url = format!("{}{}", self.base_url, path);
        debug!("GET {} page {}", url, page);
        let res = self
            .agent
            .get(&url)
            .set("Authorization", &self.auth())
            .query("page", &page.to_string())
            .query("per_page", &PER_PAGE.to_string())
            .call();
        read_envelope(res)
    }

    /// Follow the pagination until all items are read.
    fn get_all<T: DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut items = vec![];
        let mut page = 1;
        loop {
            let env: Envelope<Vec<T>> = self.get(path, page)?;
            items.extend(env.result.unwrap_or_default());
            match env.result_info {
                Some(info) if info.page < info.total_pages => page = info.page + 1,
                _ => break,
            }
        }
        Ok(items)
    }
}

fn read_envelope<T: DeserializeOwned>(
    res: std::result::Result<ureq::Response, ureq::Error>,
) -> Result<Envelope<T>> {
    let (status, env) = parse_envelope(res)?;
    if !env.success || status >= 400 {
        return Err(failure(status, &env.errors));
    }
    Ok(env)
}

/// The status and envelope of any response, successful or not.
fn parse_envelope<T: DeserializeOwned>(
    res: std::result::Result<ureq::Response, ureq::Error>,
) -> Result<(u16, Envelope<T>)> {
    let (status, body) = match res {
        Ok(res) => (res.status(), res.into_string()?),
        Err(ureq::Error::Status(status, res)) => (status, res.into_string().unwrap_or_default()),
        Err(ureq::Error::Transport(t)) => return Err(Error::Provider(t.to_string())),
    };
    trace!("{} {}", status, body);
    let env = serde_json::from_str(&body)
        .map_err(|e| Error::Provider(format!("HTTP {}: unreadable response ({}): {}", status, e, body)))?;
    Ok((status, env))
}

fn failure(status: u16, errors: &[ApiMessage]) -> Error {
    Error::Provider(format!("HTTP {}: {}", status, describe(errors)))
}

fn describe(errors: &[ApiMessage]) -> String {
    if errors.is_empty() {
        return "request failed".into();
    }
    errors
        .iter()
        .map(|e| format!("{} {}", e.code, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl DnsProvider for Cloudflare {
    fn list_zones(&self) -> Result<Vec<ZoneRecord>> {
        let zones: Vec<ApiZone> = self.get_all("/zones")?;
        debug!("Listed {} zones", zones.len());
        Ok(zones
            .into_iter()
            .map(|z| ZoneRecord {
                name: z.name,
                id: z.id,
            })
            .collect())
    }

    fn list_records(&self, zone_id: &str) -> Result<Vec<DnsRecord>> {
        let records: Vec<ApiRecord> = self.get_all(&format!("/zones/{}/dns_records", zone_id))?;
        Ok(records
            .into_iter()
            .map(|r| DnsRecord {
                id: r.id,
                name: r.name,
                record_type: r.kind,
                content: r.content.trim_matches('"').to_string(),
            })
            .collect())
    }

    fn create_txt_record(&self, zone_id: &str, name: &str, value: &str) -> Result<String> {
        let url = format!("{}/zones/{}/dns_records", self.base_url, zone_id);
        let body = NewRecord {
            kind: "TXT",
            name,
            content: value,
            ttl: CHALLENGE_TTL,
        };
        debug!("POST {} {}", url, name);
        let res = self
            .agent
            .post(&url)
            .set("Authorization", &self.auth())
            .send_json(&body);
        let env: Envelope<ApiRecord> = read_envelope(res)?;
        env.result
            .map(|r| r.id)
            .ok_or_else(|| Error::Provider(format!("no record returned for {}", name)))
    }

    fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        let url = format!(
            "{}/zones/{}/dns_records/{}",
            self.base_url, zone_id, record_id
        );
        debug!("DELETE {}", url);
        let res = self
            .agent
            .delete(&url)
            .set("Authorization", &self.auth())
            .call();
        let (status, env) = parse_envelope::<serde_json::Value>(res)?;
        if env.success && status < 400 {
            return Ok(());
        }
        // a bare 404 can also mean an unknown zone, only the code is trusted
        if env.errors.iter().any(|e| e.code == RECORD_DOES_NOT_EXIST) {
            return Err(Error::RecordNotFound {
                record_id: record_id.to_string(),
            });
        }
        Err(failure(status, &env.errors))
    }
}
