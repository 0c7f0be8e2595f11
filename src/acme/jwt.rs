use openssl::bn::{BigNum, BigNumContext};
use openssl::ecdsa::EcdsaSig;
use openssl::sha::sha256;
use serde::{Deserialize, Serialize};

use crate::acme::key::AcmeKey;
use crate::cert::EC_GROUP_P256;
use crate::util::base64url;
use crate::{Error, Result};

// P-256 coordinates and signature halves are always 32 bytes.
const P256_LEN: i32 = 32;

#[derive(Debug, Serialize, Deserialize, Default)]
pub(crate) struct JwsProtected {
    alg: String,
    url: String,
    nonce: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl JwsProtected {
    pub(crate) fn new_jwk(jwk: Jwk, url: &str, nonce: String) -> Self {
        JwsProtected {
            alg: "ES256".into(),
            url: url.into(),
            nonce,
            jwk: Some(jwk),
            ..Default::default()
        }
    }
    pub(crate) fn new_kid(kid: &str, url: &str, nonce: String) -> Self {
        JwsProtected {
            alg: "ES256".into(),
            url: url.into(),
            nonce,
            kid: Some(kid.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub(crate) struct Jwk {
    alg: String,
    crv: String,
    kty: String,
    #[serde(rename = "use")]
    _use: String,
    x: String,
    y: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
// LEXICAL ORDER OF FIELDS MATTER!
pub(crate) struct JwkThumb {
    crv: String,
    kty: String,
    x: String,
    y: String,
}

impl Jwk {
    pub(crate) fn of(key: &AcmeKey) -> Result<Jwk> {
        let mut ctx = BigNumContext::new()?;
        let mut x = BigNum::new()?;
        let mut y = BigNum::new()?;
        key.private_key().public_key().affine_coordinates_gfp(
            &*EC_GROUP_P256,
            &mut x,
            &mut y,
            &mut ctx,
        )?;
        Ok(Jwk {
            alg: "ES256".into(),
            kty: "EC".into(),
            crv: "P-256".into(),
            _use: "sig".into(),
            x: base64url(&x.to_vec_padded(P256_LEN)?),
            y: base64url(&y.to_vec_padded(P256_LEN)?),
        })
    }
}

impl From<&Jwk> for JwkThumb {
    fn from(a: &Jwk) -> Self {
        JwkThumb {
            crv: a.crv.clone(),
            kty: a.kty.clone(),
            x: a.x.clone(),
            y: a.y.clone(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Jws {
    protected: String,
    payload: String,
    signature: String,
}

impl Jws {
    pub(crate) fn new(protected: String, payload: String, signature: String) -> Self {
        Jws {
            protected,
            payload,
            signature,
        }
    }
}

/// ES256 signature over `protected.payload`, as the raw `r || s` pair.
pub(crate) fn sign(key: &AcmeKey, protected: &str, payload: &str) -> Result<String> {
    let to_sign = format!("{}.{}", protected, payload);
    let digest = sha256(to_sign.as_bytes());
    let sig = EcdsaSig::sign(&digest, key.private_key())?;
    let mut v = sig.r().to_vec_padded(P256_LEN)?;
    v.extend_from_slice(&sig.s().to_vec_padded(P256_LEN)?);
    Ok(base64url(&v))
}

/// The key authorization of a challenge token. For dns-01 the TXT value is
/// the base64url SHA-256 of it (`extra_sha256`).
pub(crate) fn key_authorization(token: &str, key: &AcmeKey, extra_sha256: bool) -> Result<String> {
    let jwk = Jwk::of(key)?;
    let jwk_thumb: JwkThumb = (&jwk).into();
    let jwk_json = serde_json::to_string(&jwk_thumb).map_err(Error::from)?;
    let digest = base64url(&sha256(jwk_json.as_bytes()));
    let key_auth = format!("{}.{}", token, digest);
    if extra_sha256 {
        Ok(base64url(&sha256(key_auth.as_bytes())))
    } else {
        Ok(key_auth)
    }
}
