//! Test doubles: a wiremock backed ACME server and in-memory DNS, resolver
//! and CA implementations.
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::ec::EcKey;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::x509::{X509NameBuilder, X509};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::runtime::Runtime;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use crate::acme::api::{ApiAuth, ApiChallenge, ApiIdentifier, ApiOrder, ApiProblem, Status};
use crate::acme::{AcmeProvider, OrderRef};
use crate::cert::EC_GROUP_P256;
use crate::dns::propagation::{TxtAnswer, TxtResolver};
use crate::dns::{DnsProvider, DnsRecord};
use crate::zone::ZoneRecord;
use crate::{Error, Result};

const NONCE: &str = "8_uBBV3N2DBRJczhoiB46ugJKUkUHxGzVe6xIMpjHFM";

/// Self signed certificate as DER.
pub fn self_signed_der(cn: &str, days: u32) -> Result<Vec<u8>> {
    let pkey = PKey::from_ec_key(EcKey::generate(&*EC_GROUP_P256)?)?;
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", cn)?;
    let name = name.build();

    let mut bld = X509::builder()?;
    bld.set_version(2)?;
    bld.set_serial_number(&*BigNum::from_u32(1)?.to_asn1_integer()?)?;
    bld.set_subject_name(&name)?;
    bld.set_issuer_name(&name)?;
    bld.set_pubkey(&pkey)?;
    bld.set_not_before(&*Asn1Time::days_from_now(0)?)?;
    bld.set_not_after(&*Asn1Time::days_from_now(days)?)?;
    bld.sign(&pkey, MessageDigest::sha256())?;
    Ok(bld.build().to_der()?)
}

/// Mock HTTP server. The tokio runtime only drives setup, requests are
/// served on wiremock's own thread so blocking clients can talk to it.
pub struct TestServer {
    pub dir_url: String,
    server: MockServer,
    ca: Arc<CaState>,
    rt: Runtime,
}

impl TestServer {
    pub fn start() -> TestServer {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .expect("tokio runtime");
        let server = rt.block_on(MockServer::start());
        TestServer {
            dir_url: format!("{}/directory", server.uri()),
            server,
            ca: Arc::new(CaState::default()),
            rt,
        }
    }

    pub fn uri(&self) -> String {
        self.server.uri()
    }

    pub fn mount(&self, mock: Mock) {
        self.rt.block_on(mock.mount(&self.server));
    }

    /// Keep the order pending no matter what.
    pub fn stall_order(&self) {
        self.ca.stalled.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct CaState {
    accepted: AtomicBool,
    finalized: AtomicBool,
    stalled: AtomicBool,
}

impl CaState {
    fn order_status(&self) -> &'static str {
        if self.stalled.load(Ordering::SeqCst) {
            "pending"
        } else if self.finalized.load(Ordering::SeqCst) {
            "valid"
        } else if self.accepted.load(Ordering::SeqCst) {
            "ready"
        } else {
            "pending"
        }
    }
}

fn with_nonce(t: ResponseTemplate) -> ResponseTemplate {
    t.insert_header("Replay-Nonce", NONCE)
}

fn order_json(url: &str, status: &str) -> Value {
    json!({
        "status": status,
        "expires": "2019-01-09T08:26:43.570360537Z",
        "identifiers": [{ "type": "dns", "value": "acmetest.example.com" }],
        "authorizations": [format!("{}/acme/authz/YTqpYUthlVfwBncUufE8IRWLMSRqcSs", url)],
        "finalize": format!("{}/acme/finalize/7738992/18234324", url),
        "certificate": format!("{}/acme/cert/fae41c070f967713109028", url),
    })
}

struct OrderResponder {
    url: String,
    ca: Arc<CaState>,
}

impl Respond for OrderResponder {
    fn respond(&self, _: &Request) -> ResponseTemplate {
        let status = self.ca.order_status();
        with_nonce(ResponseTemplate::new(200).set_body_json(order_json(&self.url, status)))
    }
}

struct ChallengeResponder {
    url: String,
    ca: Arc<CaState>,
}

impl Respond for ChallengeResponder {
    fn respond(&self, _: &Request) -> ResponseTemplate {
        self.ca.accepted.store(true, Ordering::SeqCst);
        with_nonce(ResponseTemplate::new(200).set_body_json(json!({
            "type": "dns-01",
            "status": "pending",
            "url": format!("{}/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789599", self.url),
            "token": "RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8"
        })))
    }
}

struct FinalizeResponder {
    url: String,
    ca: Arc<CaState>,
}

impl Respond for FinalizeResponder {
    fn respond(&self, _: &Request) -> ResponseTemplate {
        self.ca.finalized.store(true, Ordering::SeqCst);
        with_nonce(ResponseTemplate::new(200).set_body_json(order_json(&self.url, "processing")))
    }
}

/// A CA serving a directory, one account and one order for
/// `acmetest.example.com`.
pub fn with_directory_server() -> TestServer {
    let server = TestServer::start();
    let url = server.uri();

    server.mount(
        Mock::given(method("GET"))
            .and(path("/directory"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "keyChange": format!("{}/acme/key-change", url),
                "newAccount": format!("{}/acme/new-acct", url),
                "newNonce": format!("{}/acme/new-nonce", url),
                "newOrder": format!("{}/acme/new-order", url),
                "revokeCert": format!("{}/acme/revoke-cert", url),
                "meta": { "caaIdentities": ["testdir.org"] }
            }))),
    );
    server.mount(
        Mock::given(method("HEAD"))
            .and(path("/acme/new-nonce"))
            .respond_with(with_nonce(ResponseTemplate::new(204))),
    );
    server.mount(
        Mock::given(method("POST"))
            .and(path("/acme/new-acct"))
            .respond_with(with_nonce(
                ResponseTemplate::new(201)
                    .insert_header("Location", format!("{}/acme/acct/7728515", url).as_str())
                    .set_body_json(json!({
                        "id": 7728515,
                        "contact": ["mailto:foo@bar.com"],
                        "initialIp": "90.171.37.12",
                        "createdAt": "2018-12-31T17:15:40.399104457Z",
                        "status": "valid"
                    })),
            )),
    );
    server.mount(
        Mock::given(method("POST"))
            .and(path("/acme/new-order"))
            .respond_with(with_nonce(
                ResponseTemplate::new(201)
                    .insert_header(
                        "Location",
                        format!("{}/acme/order/YTqpYUthlVfwBncUufE8", url).as_str(),
                    )
                    .set_body_json(order_json(&url, "pending")),
            )),
    );
    server.mount(
        Mock::given(method("POST"))
            .and(path("/acme/order/YTqpYUthlVfwBncUufE8"))
            .respond_with(OrderResponder {
                url: url.clone(),
                ca: server.ca.clone(),
            }),
    );
    server.mount(
        Mock::given(method("POST"))
            .and(path("/acme/authz/YTqpYUthlVfwBncUufE8IRWLMSRqcSs"))
            .respond_with(with_nonce(ResponseTemplate::new(200).set_body_json(json!({
                "identifier": { "type": "dns", "value": "acmetest.example.com" },
                "status": "pending",
                "expires": "2019-01-09T08:26:43Z",
                "challenges": [
                    {
                        "type": "http-01",
                        "status": "pending",
                        "url": format!("{}/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789597", url),
                        "token": "MUi-gqeOJdRkSb_YR2eaMxQBqf6al8dgt_dOttSWb0w"
                    },
                    {
                        "type": "dns-01",
                        "status": "pending",
                        "url": format!("{}/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789599", url),
                        "token": "RRo2ZcXAEqxKvMH8RGcATjSK1KknLEUmauwfQ5i3gG8"
                    }
                ]
            })))),
    );
    server.mount(
        Mock::given(method("POST"))
            .and(path(
                "/acme/challenge/YTqpYUthlVfwBncUufE8IRWLMSRqcSs/216789599",
            ))
            .respond_with(ChallengeResponder {
                url: url.clone(),
                ca: server.ca.clone(),
            }),
    );
    server.mount(
        Mock::given(method("POST"))
            .and(path("/acme/finalize/7738992/18234324"))
            .respond_with(FinalizeResponder {
                url: url.clone(),
                ca: server.ca.clone(),
            }),
    );

    let der = self_signed_der("acmetest.example.com", 90).expect("certificate");
    let pem = X509::from_der(&der)
        .and_then(|c| c.to_pem())
        .expect("pem");
    server.mount(
        Mock::given(method("POST"))
            .and(path("/acme/cert/fae41c070f967713109028"))
            .respond_with(with_nonce(
                ResponseTemplate::new(200)
                    .set_body_raw(pem, "application/pem-certificate-chain"),
            )),
    );

    server
}

#[test]
pub fn test_make_directory() {
    let server = with_directory_server();
    let res = ureq::get(&server.dir_url).call();
    assert!(res.is_ok());
}

#[derive(Default)]
struct DnsState {
    zones: Vec<ZoneRecord>,
    records: Vec<(String, DnsRecord)>,
    next_id: u32,
    created: usize,
    deleted: usize,
    calls: usize,
    fail_deletes: bool,
}

/// In-memory DNS provider.
#[derive(Clone, Default)]
pub struct MockDns {
    state: Arc<Mutex<DnsState>>,
}

impl MockDns {
    pub fn with_zones(zones: &[(&str, &str)]) -> MockDns {
        let dns = MockDns::default();
        dns.state.lock().unwrap().zones = zones
            .iter()
            .map(|(name, id)| ZoneRecord {
                name: name.to_string(),
                id: id.to_string(),
            })
            .collect();
        dns
    }

    pub fn zones(&self) -> Vec<ZoneRecord> {
        self.state.lock().unwrap().zones.clone()
    }

    /// Put a record in place without counting it as created.
    pub fn add_record(&self, zone_id: &str, name: &str, record_type: &str, content: &str) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("rec{}", state.next_id);
        state.records.push((
            zone_id.to_string(),
            DnsRecord {
                id: id.clone(),
                name: name.to_string(),
                record_type: record_type.to_string(),
                content: content.to_string(),
            },
        ));
        id
    }

    pub fn records(&self, zone_id: &str) -> Vec<DnsRecord> {
        let state = self.state.lock().unwrap();
        state
            .records
            .iter()
            .filter(|(z, _)| z == zone_id)
            .map(|(_, r)| r.clone())
            .collect()
    }

    /// TXT values at a name across all zones.
    pub fn txt_values(&self, name: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .records
            .iter()
            .filter(|(_, r)| r.record_type == "TXT" && r.name == name)
            .map(|(_, r)| r.content.clone())
            .collect()
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn deleted(&self) -> usize {
        self.state.lock().unwrap().deleted
    }

    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.state.lock().unwrap().fail_deletes = fail;
    }
}

impl DnsProvider for MockDns {
    fn list_zones(&self) -> Result<Vec<ZoneRecord>> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        Ok(state.zones.clone())
    }

    fn list_records(&self, zone_id: &str) -> Result<Vec<DnsRecord>> {
        self.state.lock().unwrap().calls += 1;
        Ok(self.records(zone_id))
    }

    fn create_txt_record(&self, zone_id: &str, name: &str, value: &str) -> Result<String> {
        let id = self.add_record(zone_id, name, "TXT", value);
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state.created += 1;
        Ok(id)
    }

    fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        if state.fail_deletes {
            return Err(Error::Provider("HTTP 500: delete failed".into()));
        }
        let before = state.records.len();
        state
            .records
            .retain(|(z, r)| !(z == zone_id && r.id == record_id));
        if state.records.len() == before {
            return Err(Error::RecordNotFound {
                record_id: record_id.to_string(),
            });
        }
        state.deleted += 1;
        Ok(())
    }
}

#[derive(Default)]
struct ResolverState {
    answers: HashMap<String, Vec<(u32, String)>>,
    lookups: HashMap<String, u32>,
    hidden: Vec<String>,
    failing: Vec<String>,
}

/// Scripted TXT resolver, optionally answering from a [`MockDns`].
#[derive(Clone, Default)]
pub struct MockResolver {
    state: Arc<Mutex<ResolverState>>,
    dns: Option<MockDns>,
}

impl MockResolver {
    pub fn new() -> MockResolver {
        MockResolver::default()
    }

    /// Answer with the TXT records currently held by `dns`.
    pub fn backed_by(dns: &MockDns) -> MockResolver {
        MockResolver {
            state: Default::default(),
            dns: Some(dns.clone()),
        }
    }

    /// `value` shows up from the `n`th lookup of `name` on.
    pub fn answer_after(&self, name: &str, n: u32, value: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .answers
            .entry(name.to_string())
            .or_default()
            .push((n, value.to_string()));
    }

    /// Answer NXDOMAIN for `name` regardless of what exists.
    pub fn hide(&self, name: &str) {
        self.state.lock().unwrap().hidden.push(name.to_string());
    }

    pub fn show(&self, name: &str) {
        self.state.lock().unwrap().hidden.retain(|n| n != name);
    }

    /// Fail every lookup of `name` with a resolver error.
    pub fn fail(&self, name: &str) {
        self.state.lock().unwrap().failing.push(name.to_string());
    }

    pub fn lookups(&self, name: &str) -> u32 {
        let state = self.state.lock().unwrap();
        state.lookups.get(name).copied().unwrap_or(0)
    }

    pub fn total_lookups(&self) -> u32 {
        self.state.lock().unwrap().lookups.values().sum()
    }
}

impl TxtResolver for MockResolver {
    fn lookup_txt(&self, name: &str) -> Result<TxtAnswer> {
        let mut values = vec![];
        {
            let mut state = self.state.lock().unwrap();
            let count = {
                let c = state.lookups.entry(name.to_string()).or_insert(0);
                *c += 1;
                *c
            };
            if state.failing.iter().any(|n| n == name) {
                return Err(Error::Lookup {
                    name: name.to_string(),
                    reason: "SERVFAIL".into(),
                });
            }
            if state.hidden.iter().any(|n| n == name) {
                return Ok(TxtAnswer::NoRecord);
            }
            for (after, value) in state.answers.get(name).into_iter().flatten() {
                if count >= *after {
                    values.push(value.clone());
                }
            }
        }
        if let Some(dns) = &self.dns {
            values.extend(dns.txt_values(name));
        }
        if values.is_empty() {
            Ok(TxtAnswer::NoRecord)
        } else {
            Ok(TxtAnswer::Records(values))
        }
    }
}

struct MockOrder {
    domains: Vec<String>,
    finalized: bool,
}

#[derive(Default)]
struct AcmeState {
    orders: Vec<MockOrder>,
    accepted: Vec<String>,
    calls: usize,
    expire: bool,
    reject: Option<String>,
    invalid: Option<ApiProblem>,
}

/// In-memory CA. Orders become ready once all their challenges are
/// accepted.
#[derive(Clone, Default)]
pub struct MockAcme {
    state: Arc<Mutex<AcmeState>>,
}

impl MockAcme {
    pub fn new() -> MockAcme {
        MockAcme::default()
    }

    /// Hand out authorizations that expired long ago.
    pub fn expire_authorizations(&self) {
        self.state.lock().unwrap().expire = true;
    }

    /// Mark every accepted challenge invalid with the problem type.
    pub fn reject_challenges(&self, problem_type: &str) {
        self.state.lock().unwrap().reject = Some(problem_type.to_string());
    }

    /// Mark every order invalid.
    pub fn invalidate_orders(&self, problem_type: &str, detail: &str) {
        self.state.lock().unwrap().invalid = Some(ApiProblem {
            kind: problem_type.to_string(),
            detail: Some(detail.to_string()),
            subproblems: None,
        });
    }

    /// Challenge urls accepted so far.
    pub fn accepted(&self) -> Vec<String> {
        self.state.lock().unwrap().accepted.clone()
    }

    pub fn orders_created(&self) -> usize {
        self.state.lock().unwrap().orders.len()
    }

    /// Every call through the provider trait.
    pub fn calls(&self) -> usize {
        self.state.lock().unwrap().calls
    }

    fn call(&self) -> MutexGuard<'_, AcmeState> {
        let mut state = self.state.lock().unwrap();
        state.calls += 1;
        state
    }

    fn order_index(url: &str) -> usize {
        url.rsplit('/')
            .next()
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0)
            .saturating_sub(1)
    }

    fn api_order(state: &AcmeState, idx: usize) -> ApiOrder {
        let n = idx + 1;
        let order = &state.orders[idx];
        let authz: Vec<String> = (0..order.domains.len())
            .map(|i| format!("https://ca.test/authz/{}/{}", n, i))
            .collect();
        let all_accepted = (0..order.domains.len()).all(|i| {
            let chall = format!("https://ca.test/chall/{}/{}", n, i);
            state.accepted.contains(&chall)
        });
        let (status, error) = match &state.invalid {
            Some(p) => (Status::Invalid, Some(p.clone())),
            None if order.finalized => (Status::Valid, None),
            None if all_accepted => (Status::Ready, None),
            None => (Status::Pending, None),
        };
        ApiOrder {
            status: Some(status),
            identifiers: order.domains.iter().map(|d| ApiIdentifier::dns(d)).collect(),
            error,
            authorizations: Some(authz),
            finalize: format!("https://ca.test/finalize/{}", n),
            certificate: if order.finalized {
                Some(format!("https://ca.test/cert/{}", n))
            } else {
                None
            },
            ..Default::default()
        }
    }
}

impl AcmeProvider for MockAcme {
    fn new_order(&self, domains: &[&str]) -> Result<OrderRef> {
        let mut state = self.call();
        let url = format!("https://ca.test/order/{}", state.orders.len() + 1);
        state.orders.push(MockOrder {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            finalized: false,
        });
        let order = MockAcme::api_order(&state, state.orders.len() - 1);
        Ok(OrderRef { url, order })
    }

    fn authorization(&self, url: &str) -> Result<ApiAuth> {
        let state = self.call();
        let mut parts = url.rsplit('/');
        let i: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let n: usize = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
        let domain = state.orders[n - 1].domains[i].clone();
        let expires = if state.expire {
            "2019-01-09T08:26:43Z".to_string()
        } else {
            (OffsetDateTime::now_utc() + time::Duration::days(7))
                .format(&Rfc3339)
                .unwrap()
        };
        let challenge = |kind: &str, url: String| ApiChallenge {
            url,
            kind: kind.into(),
            status: Status::Pending,
            token: format!("token-{}-{}", n, i),
            error: None,
        };
        Ok(ApiAuth {
            identifier: ApiIdentifier::dns(domain.trim_start_matches("*.")),
            status: Some(Status::Pending),
            expires: Some(expires),
            challenges: vec![
                challenge("http-01", format!("https://ca.test/http/{}/{}", n, i)),
                challenge("dns-01", format!("https://ca.test/chall/{}/{}", n, i)),
            ],
            wildcard: if domain.starts_with("*.") { Some(true) } else { None },
        })
    }

    fn dns_proof(&self, token: &str) -> Result<String> {
        drop(self.call());
        Ok(format!("proof-{}", token))
    }

    fn accept_challenge(&self, url: &str) -> Result<ApiChallenge> {
        let mut state = self.call();
        state.accepted.push(url.to_string());
        let (status, error) = match &state.reject {
            Some(t) => (
                Status::Invalid,
                Some(ApiProblem {
                    kind: t.clone(),
                    detail: Some("Incorrect TXT record".into()),
                    subproblems: None,
                }),
            ),
            None => (Status::Pending, None),
        };
        Ok(ApiChallenge {
            url: url.to_string(),
            kind: "dns-01".into(),
            status,
            token: String::new(),
            error,
        })
    }

    fn order(&self, url: &str) -> Result<ApiOrder> {
        let state = self.call();
        Ok(MockAcme::api_order(&state, MockAcme::order_index(url)))
    }

    fn wait_order(&self, url: &str) -> Result<ApiOrder> {
        let state = self.call();
        let order = MockAcme::api_order(&state, MockAcme::order_index(url));
        if order.is_status_pending() {
            return Err(Error::PollTimeout {
                url: url.to_string(),
                status: "pending".into(),
            });
        }
        Ok(order)
    }

    fn finalize_order(&self, order_url: &str, _finalize_url: &str, csr_der: &[u8]) -> Result<ApiOrder> {
        let mut state = self.call();
        assert!(!csr_der.is_empty());
        let idx = MockAcme::order_index(order_url);
        state.orders[idx].finalized = true;
        Ok(MockAcme::api_order(&state, idx))
    }

    fn certificate(&self, url: &str) -> Result<Vec<Vec<u8>>> {
        let cn = {
            let state = self.call();
            let idx = MockAcme::order_index(url);
            state.orders[idx].domains[0].clone()
        };
        Ok(vec![self_signed_der(&cn, 90)?])
    }
}

#[test]
fn test_mock_acme_order_flow() -> Result<()> {
    let acme = MockAcme::new();
    let ord = acme.new_order(&["example.com"])?;
    assert_eq!(ord.url, "https://ca.test/order/1");
    let authz = ord.order.authorizations.clone().unwrap_or_default();
    let auth = acme.authorization(&authz[0])?;
    let chall = auth.dns_challenge().cloned().expect("dns-01");
    assert!(acme.wait_order(&ord.url).is_err());
    acme.accept_challenge(&chall.url)?;
    assert!(acme.wait_order(&ord.url)?.is_status_ready());
    let order = acme.finalize_order(&ord.url, "", b"csr")?;
    assert_eq!(order.certificate.as_deref(), Some("https://ca.test/cert/1"));
    assert_eq!(acme.certificate("https://ca.test/cert/1")?.len(), 1);
    Ok(())
}
