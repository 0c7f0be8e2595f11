//! Certificate keys, requests and the issued files.
use lazy_static::lazy_static;
use openssl::asn1::Asn1Time;
use openssl::ec::{Asn1Flag, EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{self, PKey};
use openssl::rsa::Rsa;
use openssl::stack::Stack;
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509Req, X509ReqBuilder, X509};
use std::str::FromStr;

use crate::persist::{sanitize, Persist, PersistKey, PersistKind};
use crate::state::Subject;
use crate::{Error, Result};

lazy_static! {
    pub(crate) static ref EC_GROUP_P256: EcGroup = ec_group(Nid::X9_62_PRIME256V1);
    pub(crate) static ref EC_GROUP_P384: EcGroup = ec_group(Nid::SECP384R1);
}

fn ec_group(nid: Nid) -> EcGroup {
    let mut g = EcGroup::from_curve_name(nid).expect("EcGroup");
    // this is required for openssl 1.0.x (but not 1.1.x)
    g.set_asn1_flag(Asn1Flag::NAMED_CURVE);
    g
}

/// Algorithm of the certificate key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    EcdsaP256,
    EcdsaP384,
    Rsa2048,
}

impl Default for KeyAlgorithm {
    fn default() -> Self {
        KeyAlgorithm::EcdsaP256
    }
}

impl FromStr for KeyAlgorithm {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "p256" | "ecdsa-p256" => Ok(KeyAlgorithm::EcdsaP256),
            "p384" | "ecdsa-p384" => Ok(KeyAlgorithm::EcdsaP384),
            "rsa2048" | "rsa" => Ok(KeyAlgorithm::Rsa2048),
            _ => Err(Error::Config(format!("unknown key algorithm {}", s))),
        }
    }
}

/// Make a fresh private key.
pub fn create_key(alg: KeyAlgorithm) -> Result<PKey<pkey::Private>> {
    Ok(match alg {
        KeyAlgorithm::EcdsaP256 => PKey::from_ec_key(EcKey::generate(&*EC_GROUP_P256)?)?,
        KeyAlgorithm::EcdsaP384 => PKey::from_ec_key(EcKey::generate(&*EC_GROUP_P384)?)?,
        KeyAlgorithm::Rsa2048 => PKey::from_rsa(Rsa::generate(2048)?)?,
    })
}

/// Certificate request for `domains` with `subject`. Empty subject fields are
/// left out; the common name defaults to the first domain.
pub(crate) fn create_csr(
    pkey: &PKey<pkey::Private>,
    domains: &[&str],
    subject: &Subject,
) -> Result<X509Req> {
    let primary = domains
        .first()
        .ok_or_else(|| Error::Config("no domains for certificate request".into()))?;

    let mut name = X509NameBuilder::new()?;
    let cn = if subject.common_name.is_empty() {
        *primary
    } else {
        subject.common_name.as_str()
    };
    let entries = [
        (Nid::COMMONNAME, cn),
        (Nid::COUNTRYNAME, subject.country.as_str()),
        (Nid::STATEORPROVINCENAME, subject.province.as_str()),
        (Nid::LOCALITYNAME, subject.locality.as_str()),
        (Nid::ORGANIZATIONNAME, subject.organisation.as_str()),
        (Nid::ORGANIZATIONALUNITNAME, subject.organisation_unit.as_str()),
    ];
    for (nid, value) in entries.iter() {
        if !value.is_empty() {
            name.append_entry_by_nid(*nid, value)?;
        }
    }
    let name = name.build();

    let mut req_bld = X509ReqBuilder::new()?;
    req_bld.set_subject_name(&name)?;
    req_bld.set_pubkey(pkey)?;

    // set all domains as alt names
    let mut stack = Stack::new()?;
    let ctx = req_bld.x509v3_context(None);
    let mut an = SubjectAlternativeName::new();
    for d in domains {
        an.dns(d);
    }
    let ext = an.build(&ctx)?;
    stack.push(ext)?;
    req_bld.add_extensions(&stack)?;

    req_bld.sign(pkey, MessageDigest::sha256())?;

    Ok(req_bld.build())
}

/// File name stem for the certificate of `domain`: `example.com` becomes
/// `example_com`, `*.example.com` becomes `STAR_example_com`.
pub fn cert_name(domain: &str) -> Result<String> {
    let domain = domain.trim_end_matches('.');
    if !domain.contains('.') {
        return Err(Error::Config(format!(
            "{:?} is not a fully qualified domain name",
            domain
        )));
    }
    Ok(sanitize(domain))
}

/// Encapsulated certificate and private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    private_key: String,
    certificate: String,
}

impl Certificate {
    /// Create Certificate from PEM encoded key and certificate chain.
    pub fn new(private_key: impl Into<String>, certificate: impl Into<String>) -> Self {
        Self {
            private_key: private_key.into(),
            certificate: certificate.into(),
        }
    }

    /// The PEM encoded private key.
    pub fn private_key(&self) -> &str {
        &self.private_key
    }

    /// The PEM encoded certificate chain, leaf first.
    pub fn certificate(&self) -> &str {
        &self.certificate
    }

    /// Inspect the leaf certificate to count the number of (whole) valid days
    /// left. Negative for an expired certificate.
    pub fn valid_days_left(&self) -> Result<i64> {
        let x509 = X509::from_pem(self.certificate.as_bytes())?;
        let now = Asn1Time::days_from_now(0)?;
        let diff = now.diff(x509.not_after())?;
        Ok(i64::from(diff.days))
    }
}

fn chain_to_pem(der_chain: &[Vec<u8>]) -> Result<String> {
    let mut pem = String::new();
    for der in der_chain {
        let x509 = X509::from_der(der)?;
        pem.push_str(&String::from_utf8_lossy(&x509.to_pem()?));
    }
    Ok(pem)
}

/// Generates certificate keys and requests, and stores what the CA issued.
pub struct CertificateMaterializer<P: Persist> {
    persist: P,
}

impl<P: Persist> CertificateMaterializer<P> {
    pub fn new(persist: P) -> Self {
        CertificateMaterializer { persist }
    }

    /// A fresh key (PEM) and a CSR (DER) naming every domain. The first
    /// domain is the primary one.
    pub fn issue(
        &self,
        domains: &[&str],
        subject: &Subject,
        alg: KeyAlgorithm,
    ) -> Result<(String, Vec<u8>)> {
        let pkey = create_key(alg)?;
        let csr = create_csr(&pkey, domains, subject)?;
        let key_pem = String::from_utf8_lossy(&pkey.private_key_to_pem_pkcs8()?).into_owned();
        debug!("Created {:?} key and request for {}", alg, domains.join(", "));
        Ok((key_pem, csr.to_der()?))
    }

    /// Write `<name>.key` and `<name>.crt` for the primary domain.
    pub fn save(&self, primary: &str, key_pem: &str, der_chain: &[Vec<u8>]) -> Result<Certificate> {
        let name = cert_name(primary)?;
        let pem = chain_to_pem(der_chain)?;

        let pk_key = PersistKey::new(PersistKind::PrivateKey, &name);
        debug!("Save private key: {}", pk_key);
        self.persist.put(&pk_key, key_pem.as_bytes())?;

        let pk_crt = PersistKey::new(PersistKind::Certificate, &name);
        debug!("Save certificate: {}", pk_crt);
        self.persist.put(&pk_crt, pem.as_bytes())?;

        info!("Wrote {} and {}", pk_key, pk_crt);
        Ok(Certificate::new(key_pem, pem))
    }

    /// Replace only the certificate file, keeping the key.
    pub fn save_chain(&self, primary: &str, der_chain: &[Vec<u8>]) -> Result<()> {
        let name = cert_name(primary)?;
        let pk_crt = PersistKey::new(PersistKind::Certificate, &name);
        self.persist.put(&pk_crt, chain_to_pem(der_chain)?.as_bytes())?;
        info!("Wrote {}", pk_crt);
        Ok(())
    }

    /// Read back the key and certificate of a primary domain.
    pub fn certificate(&self, primary: &str) -> Result<Option<Certificate>> {
        let name = cert_name(primary)?;
        let read = |kind| -> Result<Option<String>> {
            Ok(self
                .persist
                .get(&PersistKey::new(kind, &name))?
                .and_then(|s| String::from_utf8(s).ok()))
        };
        Ok(
            match (read(PersistKind::PrivateKey)?, read(PersistKind::Certificate)?) {
                (Some(k), Some(c)) => Some(Certificate::new(k, c)),
                _ => None,
            },
        )
    }
}
