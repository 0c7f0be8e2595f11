//! The dns-01 order state machine.
//!
//! A run moves through the [`Stage`]s in order:
//!
//! ```text
//! Fresh -> Authorizing -> ChallengesPublished -> PropagationConfirmed
//!       -> ChallengesAccepted -> OrderFinalizing -> CertificateIssued -> CleanedUp
//! ```
//!
//! The [`RunState`] is saved after every step that changes it. Where a run
//! starts is decided from the saved state alone ([`ResumePoint`]): a state
//! with published records continues with the propagation wait, one that
//! already has its certificates continues with the cleanup.
//!
//! Only the DNS wait retries. Every refusal by the CA ends the run, labelled
//! with the stage and domain it happened at.
//!
//! [`Stage`]: enum.Stage.html
//! [`RunState`]: ../state/struct.RunState.html
//! [`ResumePoint`]: ../state/enum.ResumePoint.html
use std::fmt;
use time::OffsetDateTime;

use crate::acme::{AcmeProvider, OrderRef};
use crate::cert::CertificateMaterializer;
use crate::config::Config;
use crate::dns::propagation::{Propagation, PropagationChecker, Staleness, TxtResolver};
use crate::dns::record::ChallengeRecordManager;
use crate::dns::DnsProvider;
use crate::persist::Persist;
use crate::state::{CsrStateStore, ResumePoint, RunState};
use crate::util::parse_timestamp;
use crate::zone::{self, binding_of, ZoneBinding, ZoneRecord};
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Fresh,
    Authorizing,
    ChallengesPublished,
    PropagationConfirmed,
    ChallengesAccepted,
    OrderFinalizing,
    CertificateIssued,
    CleanedUp,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            Stage::Fresh => "fresh",
            Stage::Authorizing => "authorizing",
            Stage::ChallengesPublished => "challenges-published",
            Stage::PropagationConfirmed => "propagation-confirmed",
            Stage::ChallengesAccepted => "challenges-accepted",
            Stage::OrderFinalizing => "order-finalizing",
            Stage::CertificateIssued => "certificate-issued",
            Stage::CleanedUp => "cleaned-up",
        };
        write!(f, "{}", s)
    }
}

/// A certificate written during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedCertificate {
    pub primary: String,
    pub domains: Vec<String>,
    pub cert_url: String,
    pub days_left: Option<i64>,
}

/// What a run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub resumed_from: ResumePoint,
    pub records_created: usize,
    pub records_deleted: usize,
    pub certificates: Vec<IssuedCertificate>,
}

impl RunReport {
    fn new(resumed_from: ResumePoint) -> Self {
        RunReport {
            resumed_from,
            records_created: 0,
            records_deleted: 0,
            certificates: vec![],
        }
    }
}

/// Drives one run of the state machine.
pub struct OrderOrchestrator<A, D, R, P>
where
    A: AcmeProvider,
    D: DnsProvider,
    R: TxtResolver,
    P: Persist,
{
    config: Config,
    acme: A,
    records: ChallengeRecordManager<D>,
    checker: PropagationChecker<R>,
    materializer: CertificateMaterializer<P>,
    store: CsrStateStore,
    stage: Stage,
}

impl<A, D, R, P> OrderOrchestrator<A, D, R, P>
where
    A: AcmeProvider,
    D: DnsProvider,
    R: TxtResolver,
    P: Persist,
{
    pub fn new(config: Config, acme: A, dns: D, resolver: R, persist: P) -> Self {
        let checker = PropagationChecker::new(resolver, config.propagation.clone());
        let store = CsrStateStore::new(&config.state_file);
        OrderOrchestrator {
            config,
            acme,
            records: ChallengeRecordManager::new(dns),
            checker,
            materializer: CertificateMaterializer::new(persist),
            store,
            stage: Stage::Fresh,
        }
    }

    /// The stage reached so far.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Run from wherever the persisted state left off up to a cleaned up
    /// state with certificates on disk.
    pub fn run(&mut self, state: &mut RunState, zones: &[ZoneRecord]) -> Result<RunReport> {
        self.stage = Stage::Fresh;
        if state.domains.is_empty() {
            return Err(Error::Config("the state file lists no domains".into()));
        }

        // Both checks are local and come before any network call.
        let resume = ResumePoint::of(state).map_err(|e| e.at(Stage::Fresh, None))?;
        let bindings =
            zone::resolve(&state.domain_names(), zones).map_err(|e| e.at(Stage::Fresh, None))?;
        info!(
            "Run for {} domain(s), starting from {:?}",
            state.domains.len(),
            resume
        );

        let mut report = RunReport::new(resume);

        let all_visible = if self.config.skip_propagation_check {
            debug!("Skip DNS scan, trusting persisted state");
            true
        } else {
            self.scan_records(state)?
        };

        match resume {
            ResumePoint::Fresh => {
                let orders = self.authorize(state)?;
                report.records_created = self.publish(state, &bindings, &orders)?;
                self.confirm_propagation(state)?;
            }
            ResumePoint::Published => {
                self.stage = Stage::ChallengesPublished;
                if all_visible {
                    info!("All challenge records already visible");
                    self.stage = Stage::PropagationConfirmed;
                } else {
                    self.confirm_propagation(state)?;
                }
            }
            ResumePoint::Issued => {
                info!("Certificates already issued, only cleanup remains");
                self.stage = Stage::CertificateIssued;
            }
        }

        if resume != ResumePoint::Issued {
            self.accept_challenges(state)?;
            self.finalize_orders(state, &mut report)?;
        }

        report.records_deleted = self.cleanup(state, &bindings)?;
        Ok(report)
    }

    /// Look for challenge records that do not belong to the persisted state.
    /// Returns whether every persisted record is already visible.
    fn scan_records(&self, state: &RunState) -> Result<bool> {
        let mut all_visible = true;
        for d in &state.domains {
            let known = &d.challenge.token_value;
            match self
                .checker
                .detect_stale_record(&d.domain, known)
                .map_err(|e| e.at(Stage::Fresh, Some(&d.domain)))?
            {
                Staleness::Clean { observed } => all_visible &= observed,
                Staleness::Stale { found } => {
                    return Err(Error::StaleRecord {
                        domain: d.domain.clone(),
                        found,
                    }
                    .at(Stage::Fresh, Some(&d.domain)))
                }
            }
        }
        Ok(all_visible)
    }

    /// Create the order(s), store their urls and forget earlier certificates.
    fn authorize(&mut self, state: &mut RunState) -> Result<Vec<OrderRef>> {
        self.stage = Stage::Authorizing;
        let names = state.domain_names();

        let orders = if self.config.batch_mode {
            let domains: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            let order = self
                .acme
                .new_order(&domains)
                .map_err(|e| e.at(Stage::Authorizing, None))?;
            vec![order]
        } else {
            names
                .iter()
                .map(|d| {
                    self.acme
                        .new_order(&[d.as_str()])
                        .map_err(|e| e.at(Stage::Authorizing, Some(d)))
                })
                .collect::<Result<Vec<_>>>()?
        };

        state.order_url = orders[0].url.clone();
        state.cert_url.clear();
        for (idx, d) in state.domains.iter_mut().enumerate() {
            let order = if self.config.batch_mode {
                &orders[0]
            } else {
                &orders[idx]
            };
            d.challenge.order_url = order.url.clone();
            d.cert_url.clear();
        }
        self.save(state)?;
        Ok(orders)
    }

    /// Fetch every authorization and publish its dns-01 record. Returns the
    /// number of records created.
    fn publish(
        &mut self,
        state: &mut RunState,
        bindings: &[ZoneBinding],
        orders: &[OrderRef],
    ) -> Result<usize> {
        let mut created = 0;
        for order in orders {
            for authz_url in order.order.authorizations.iter().flatten() {
                let auth = self
                    .acme
                    .authorization(authz_url)
                    .map_err(|e| e.at(Stage::Authorizing, None))?;
                let domain = auth.domain();

                let idx = match state.domains.iter().position(|d| {
                    d.domain.eq_ignore_ascii_case(&domain) && d.challenge.order_url == order.url
                }) {
                    Some(idx) => idx,
                    None => {
                        warn!("Ignore authorization for unrequested {}", domain);
                        continue;
                    }
                };
                if state.domains[idx].challenge.has_record() {
                    debug!("Record for {} already published", domain);
                    continue;
                }

                let chall = auth
                    .dns_challenge()
                    .ok_or_else(|| Error::NoDnsChallenge(domain.clone()))
                    .map_err(|e| e.at(Stage::Authorizing, Some(&domain)))?;
                let value = self
                    .acme
                    .dns_proof(&chall.token)
                    .map_err(|e| e.at(Stage::Authorizing, Some(&domain)))?;
                let record_id = binding_of(bindings, &state.domains[idx].domain)
                    .and_then(|b| self.records.create_challenge_record(b, &value))
                    .map_err(|e| e.at(Stage::Authorizing, Some(&domain)))?;
                created += 1;

                let c = &mut state.domains[idx].challenge;
                c.record_id = record_id;
                c.token = chall.token.clone();
                c.token_value = value;
                c.token_url = chall.url.clone();
                c.issued = Some(OffsetDateTime::now_utc());
                c.expires = parse_timestamp(auth.expires.as_deref());
                self.save(state)?;
            }
        }

        if let Some(missing) = state.domains.iter().find(|d| !d.challenge.has_record()) {
            let domain = missing.domain.clone();
            return Err(Error::NoAuthorization(domain.clone()).at(Stage::Authorizing, Some(&domain)));
        }
        self.stage = Stage::ChallengesPublished;
        Ok(created)
    }

    /// Wait for every record to be visible. No challenge is accepted unless
    /// all of them are.
    fn confirm_propagation(&mut self, state: &RunState) -> Result<()> {
        self.stage = Stage::ChallengesPublished;
        let mut missing = vec![];
        for d in &state.domains {
            let outcome = self
                .checker
                .await_propagation(&d.domain, &d.challenge.token_value)
                .map_err(|e| e.at(Stage::ChallengesPublished, Some(&d.domain)))?;
            match outcome {
                Propagation::Observed { attempts, .. } => {
                    info!("{} visible after {} lookup(s)", d.domain, attempts)
                }
                Propagation::TimedOut { attempts } => {
                    warn!("{} not visible after {} lookup(s)", d.domain, attempts);
                    missing.push(d.domain.clone());
                }
            }
        }
        if !missing.is_empty() {
            return Err(Error::NotPropagated { domains: missing }.at(Stage::ChallengesPublished, None));
        }
        self.stage = Stage::PropagationConfirmed;
        Ok(())
    }

    /// Tell the CA to check every challenge whose order has no certificate
    /// yet. Expiry is checked for all of them before the first one is sent.
    fn accept_challenges(&mut self, state: &RunState) -> Result<()> {
        let pending: Vec<usize> = (0..state.domains.len())
            .filter(|i| state.domains[*i].cert_url.is_empty())
            .collect();

        let now = OffsetDateTime::now_utc();
        for i in &pending {
            let d = &state.domains[*i];
            if let Some(expires) = d.challenge.expires {
                if expires <= now {
                    return Err(Error::ChallengeExpired {
                        domain: d.domain.clone(),
                        expires,
                    }
                    .at(Stage::PropagationConfirmed, Some(&d.domain)));
                }
            }
        }

        for i in &pending {
            let d = &state.domains[*i];
            let chall = self
                .acme
                .accept_challenge(&d.challenge.token_url)
                .map_err(|e| e.at(Stage::PropagationConfirmed, Some(&d.domain)))?;
            if chall.is_status_invalid() {
                let problem = chall
                    .error
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "challenge invalid".into());
                return Err(Error::ChallengeRejected {
                    domain: d.domain.clone(),
                    problem,
                }
                .at(Stage::PropagationConfirmed, Some(&d.domain)));
            }
            debug!("Accepted challenge for {}", d.domain);
        }
        self.stage = Stage::ChallengesAccepted;
        Ok(())
    }

    /// Wait for each order, submit a fresh request and store the result.
    fn finalize_orders(&mut self, state: &mut RunState, report: &mut RunReport) -> Result<()> {
        for (order_url, idxs) in state.order_groups() {
            if idxs.iter().all(|i| !state.domains[*i].cert_url.is_empty()) {
                debug!("Order {} already has its certificate", order_url);
                continue;
            }
            let names: Vec<String> = idxs.iter().map(|i| state.domains[*i].domain.clone()).collect();
            let primary = names[0].clone();
            let at = |stage: Stage| {
                let primary = primary.clone();
                move |e: Error| e.at(stage, Some(&primary))
            };

            self.stage = Stage::ChallengesAccepted;
            let order = self.acme.wait_order(&order_url).map_err(at(Stage::ChallengesAccepted))?;
            if order.is_status_invalid() {
                return Err(Error::OrderInvalid {
                    url: order_url.clone(),
                    problem: order.problem(),
                }
                .at(Stage::ChallengesAccepted, Some(&primary)));
            }
            if !order.is_status_ready() {
                return Err(Error::Other(format!(
                    "order {} is {}, expected ready",
                    order_url,
                    order.status()
                ))
                .at(Stage::ChallengesAccepted, Some(&primary)));
            }

            self.stage = Stage::OrderFinalizing;
            let domains: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
            let subject = state.domains[idxs[0]].subject.clone();
            let (key_pem, csr_der) = self
                .materializer
                .issue(&domains, &subject, self.config.key_algorithm)
                .map_err(at(Stage::OrderFinalizing))?;
            let order = self
                .acme
                .finalize_order(&order_url, &order.finalize, &csr_der)
                .map_err(at(Stage::OrderFinalizing))?;
            let cert_url = order
                .certificate
                .clone()
                .ok_or_else(|| Error::Other(format!("order {} has no certificate url", order_url)))
                .map_err(at(Stage::OrderFinalizing))?;
            let chain = self
                .acme
                .certificate(&cert_url)
                .map_err(at(Stage::OrderFinalizing))?;
            let cert = self
                .materializer
                .save(&primary, &key_pem, &chain)
                .map_err(at(Stage::OrderFinalizing))?;

            for i in &idxs {
                state.domains[*i].cert_url = cert_url.clone();
            }
            state.cert_url = cert_url.clone();
            self.save(state)?;

            info!("Issued certificate for {}", names.join(", "));
            report.certificates.push(IssuedCertificate {
                primary,
                domains: names,
                cert_url,
                days_left: cert.valid_days_left().ok(),
            });
        }
        self.stage = Stage::CertificateIssued;
        Ok(())
    }

    /// Delete every challenge record, then clear the transient state. A
    /// record that is already gone counts as deleted. Any other provider
    /// failure stops here with every record id still in the state, so the
    /// next run resumes at the cleanup.
    fn cleanup(&mut self, state: &mut RunState, bindings: &[ZoneBinding]) -> Result<usize> {
        let deleted = delete_records(&self.records, state, bindings, |e, domain| {
            e.at(Stage::CertificateIssued, Some(domain))
        })?;
        *state = self
            .store
            .clear(std::mem::take(state))
            .map_err(|e| e.at(Stage::CertificateIssued, None))?;
        self.stage = Stage::CleanedUp;
        info!("Removed {} challenge record(s)", deleted);
        Ok(deleted)
    }

    fn save(&self, state: &mut RunState) -> Result<()> {
        let stage = self.stage;
        self.store.save(state).map_err(|e| e.at(stage, None))
    }
}

fn delete_records<D, F>(
    records: &ChallengeRecordManager<D>,
    state: &RunState,
    bindings: &[ZoneBinding],
    label: F,
) -> Result<usize>
where
    D: DnsProvider,
    F: Fn(Error, &str) -> Error,
{
    let mut deleted = 0;
    for d in state.domains.iter().filter(|d| d.challenge.has_record()) {
        binding_of(bindings, &d.domain)
            .and_then(|b| records.delete_challenge_record(&b.zone_id, &d.challenge.record_id))
            .map_err(|e| {
                warn!(
                    "Could not delete record {} for {}: {}",
                    d.challenge.record_id, d.domain, e
                );
                label(e, &d.domain)
            })?;
        deleted += 1;
    }
    Ok(deleted)
}

/// Remove stored and leftover challenge records for every domain in the
/// state, then clear it. Recovery for interrupted runs, without talking to
/// the CA.
pub fn clean<D: DnsProvider>(
    dns: D,
    store: &CsrStateStore,
    state: &mut RunState,
    zones: &[ZoneRecord],
) -> Result<usize> {
    let records = ChallengeRecordManager::new(dns);
    let bindings = zone::resolve(&state.domain_names(), zones)?;
    let mut deleted = delete_records(&records, state, &bindings, |e, domain| {
        Error::Provider(format!("{}: {}", domain, e))
    })?;

    let mut zone_ids: Vec<&str> = bindings.iter().map(|b| b.zone_id.as_str()).collect();
    zone_ids.sort_unstable();
    zone_ids.dedup();
    for zone_id in zone_ids {
        deleted += records.purge_challenge_records(zone_id)?;
    }

    *state = store.clear(std::mem::take(state))?;
    Ok(deleted)
}

/// Download the chains at the stored certificate urls again and rewrite
/// the certificate files. Returns the primary domains written.
pub fn refetch<A: AcmeProvider, P: Persist>(
    acme: &A,
    materializer: &CertificateMaterializer<P>,
    state: &RunState,
) -> Result<Vec<String>> {
    let mut written = vec![];
    let mut seen: Vec<&str> = vec![];
    for d in &state.domains {
        let url = d.cert_url.as_str();
        if url.is_empty() || seen.contains(&url) {
            continue;
        }
        seen.push(url);
        let chain = acme.certificate(url)?;
        materializer.save_chain(&d.domain, &chain)?;
        written.push(d.domain.clone());
    }
    if written.is_empty() {
        return Err(Error::Config("no certificate url in the state file".into()));
    }
    Ok(written)
}
