//! JSON Web Signature as ACME uses it (RFC 8555 §6.2): flattened JSON serialization,
//! ES256 only, with either a `jwk` or a `kid` in the protected header.

use log::trace;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::crypt::{base64, base64_decode, base64_hmac256, KeyPair};
use crate::AcmeError;

pub const ALG_ES256: &str = "ES256";
pub const ALG_HS256: &str = "HS256";

/// Public EC key, restricted to the members RFC 7638 requires.
/// Field order is lexicographic: serializing this struct IS the thumbprint input.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Jwk {
    pub crv: String,
    pub kty: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    pub fn from_key(key: &KeyPair) -> Result<Self, AcmeError> {
        let (x, y) = key.coordinates()?;
        Ok(Jwk {
            crv: "P-256".to_string(),
            kty: "EC".to_string(),
            x,
            y,
        })
    }

    pub fn thumbprint(&self) -> Result<String, AcmeError> {
        Ok(crate::crypt::base64_sha256(&serde_json::to_string(self)?))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Protected {
    #[serde(skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
    url: String,
    alg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    jwk: Option<Jwk>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<String>,
}

impl Protected {
    fn from_jwk(url: &str, nonce: Option<String>, alg: &str, jwk: Jwk) -> Self {
        Protected {
            nonce,
            url: url.to_string(),
            alg: alg.to_string(),
            jwk: Some(jwk),
            kid: None,
        }
    }

    fn from_kid(url: &str, nonce: Option<String>, alg: &str, kid: &str) -> Self {
        Protected {
            nonce,
            url: url.to_string(),
            alg: alg.to_string(),
            jwk: None,
            kid: Some(kid.to_string()),
        }
    }

    pub fn nonce(&self) -> Option<&str> {
        self.nonce.as_deref()
    }
    pub fn url(&self) -> &str {
        &self.url
    }
    pub fn alg(&self) -> &str {
        &self.alg
    }
    pub fn jwk(&self) -> Option<&Jwk> {
        self.jwk.as_ref()
    }
    pub fn kid(&self) -> Option<&str> {
        self.kid.as_deref()
    }
}

/// The message half of a JWS. `PostAsGet` is the empty payload, which is
/// not the same thing as `{}` or `""` serialized as JSON.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    PostAsGet,
    Json(Value),
}

impl Payload {
    pub fn json<T: Serialize>(msg: &T) -> Result<Self, AcmeError> {
        Ok(Payload::Json(serde_json::to_value(msg)?))
    }

    pub fn is_post_as_get(&self) -> bool {
        matches!(self, Payload::PostAsGet)
    }

    fn payload64(&self) -> Result<String, AcmeError> {
        match self {
            Payload::PostAsGet => Ok("".to_string()),
            Payload::Json(v) => {
                let payload_json = serde_json::to_string(v)?;
                trace!("payload: {}", payload_json);
                Ok(base64(payload_json.as_bytes()))
            }
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SignedEnvelope {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

impl SignedEnvelope {
    pub fn to_json(&self) -> Result<String, AcmeError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn decode_protected(&self) -> Result<Value, AcmeError> {
        Ok(serde_json::from_slice(&base64_decode(&self.protected)?)?)
    }

    /// `None` for POST-as-GET.
    pub fn decode_payload(&self) -> Result<Option<Value>, AcmeError> {
        if self.payload.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&base64_decode(&self.payload)?)?))
    }
}

/// Builds the protected header. `kid == None` embeds the public key as `jwk`
/// (newAccount, certificate-key revokeCert); otherwise the account URL goes in `kid`.
pub fn protect(key: &KeyPair, kid: Option<&str>, nonce: &str, url: &str) -> Result<Protected, AcmeError> {
    Ok(match kid {
        None => Protected::from_jwk(url, Some(nonce.to_string()), ALG_ES256, Jwk::from_key(key)?),
        Some(kid) => Protected::from_kid(url, Some(nonce.to_string()), ALG_ES256, kid),
    })
}

pub fn sign(key: &KeyPair, header: &Protected, payload: &Payload) -> Result<SignedEnvelope, AcmeError> {
    let protected_json = serde_json::to_string(header)?;
    sign_serialized(key, &protected_json, payload.payload64()?)
}

/// Signs an already serialized protected header, for headers edited by hand.
pub fn sign_serialized(key: &KeyPair, protected_json: &str, payload64: String) -> Result<SignedEnvelope, AcmeError> {
    let protected64 = base64(protected_json.as_bytes());
    let plain = format!("{}.{}", protected64, payload64);
    trace!("protected:{}\nsigning input:{}", protected_json, plain);

    let signature = base64(&key.sign(plain.as_bytes())?);
    Ok(SignedEnvelope {
        protected: protected64,
        payload: payload64,
        signature,
    })
}

pub fn thumbprint(key: &KeyPair) -> Result<String, AcmeError> {
    Jwk::from_key(key)?.thumbprint()
}

pub fn key_authorization(token: &str, thumbprint: &str) -> String {
    format!("{}.{}", token, thumbprint)
}

/// externalAccountBinding for newAccount (RFC 8555 §7.3.4): the account JWK,
/// MAC'd with the CA-issued HMAC key. Carries no nonce.
pub fn external_account_binding(
    account_key: &KeyPair,
    url: &str,
    eab_kid: &str,
    eab_hmac_key: &str,
) -> Result<SignedEnvelope, AcmeError> {
    let protected = Protected::from_kid(url, None, ALG_HS256, eab_kid);
    let protected64 = base64(serde_json::to_string(&protected)?.as_bytes());
    let payload64 = base64(serde_json::to_string(&Jwk::from_key(account_key)?)?.as_bytes());
    let signature = base64_hmac256(eab_hmac_key, &format!("{}.{}", protected64, payload64))?;
    Ok(SignedEnvelope {
        protected: protected64,
        payload: payload64,
        signature,
    })
}

/// Inner JWS of a keyChange request (RFC 8555 §7.3.5), signed by the new key.
pub fn key_change_inner(
    old_key: &KeyPair,
    new_key: &KeyPair,
    account_url: &str,
    key_change_url: &str,
) -> Result<SignedEnvelope, AcmeError> {
    let protected = Protected::from_jwk(key_change_url, None, ALG_ES256, Jwk::from_key(new_key)?);
    let payload = Payload::Json(serde_json::json!({
        "account": account_url,
        "oldKey": Jwk::from_key(old_key)?,
    }));
    sign(new_key, &protected, &payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::hmac256;
    use p256::ecdsa::{signature::Verifier, Signature, VerifyingKey};
    use serde_json::json;

    fn verify(key: &KeyPair, env: &SignedEnvelope) {
        let vk = VerifyingKey::from(&key.public_key());
        let sig = Signature::from_slice(&base64_decode(&env.signature).unwrap()).unwrap();
        let input = format!("{}.{}", env.protected, env.payload);
        vk.verify(input.as_bytes(), &sig).unwrap();
    }

    #[test]
    fn exactly_one_of_jwk_or_kid() {
        let key = KeyPair::generate().unwrap();
        for kid in [None, Some("https://ca/acct/1")] {
            let p = protect(&key, kid, "n", "https://ca/x").unwrap();
            assert!(p.jwk().is_some() ^ p.kid().is_some());
            let v = serde_json::to_value(&p).unwrap();
            assert!(v.get("jwk").is_some() ^ v.get("kid").is_some());
        }
    }

    #[test]
    fn new_account_header_embeds_bare_jwk() {
        let key = KeyPair::generate().unwrap();
        let p = protect(&key, None, "nonceAAA", "https://ca/acct").unwrap();
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v["alg"], "ES256");
        assert_eq!(v["nonce"], "nonceAAA");
        assert_eq!(v["url"], "https://ca/acct");
        assert_eq!(v["jwk"]["kty"], "EC");
        assert_eq!(v["jwk"]["crv"], "P-256");
        assert_eq!(v["jwk"].as_object().unwrap().len(), 4);
        assert!(v.get("kid").is_none());
    }

    #[test]
    fn protected_round_trips_through_envelope() {
        let key = KeyPair::generate().unwrap();
        let p = protect(&key, Some("https://ca/acct/1"), "n1", "https://ca/order").unwrap();
        let env = sign(&key, &p, &Payload::Json(json!({"a": 1}))).unwrap();
        let decoded: Protected = serde_json::from_value(env.decode_protected().unwrap()).unwrap();
        assert_eq!(decoded, p);
        verify(&key, &env);
    }

    #[test]
    fn post_as_get_is_the_only_empty_payload() {
        let key = KeyPair::generate().unwrap();
        let p = protect(&key, Some("k"), "n", "u").unwrap();

        let env = sign(&key, &p, &Payload::PostAsGet).unwrap();
        assert_eq!(env.payload, "");
        assert_eq!(env.decode_payload().unwrap(), None);
        verify(&key, &env);

        for v in [json!({}), json!("")] {
            let env = sign(&key, &p, &Payload::Json(v.clone())).unwrap();
            assert!(!env.payload.is_empty());
            assert_eq!(env.decode_payload().unwrap(), Some(v));
        }
    }

    #[test]
    fn thumbprint_is_stable_and_key_bound() {
        let key = KeyPair::generate().unwrap();
        assert_eq!(thumbprint(&key).unwrap(), thumbprint(&key).unwrap());

        let jwk = Jwk::from_key(&key).unwrap();
        let mut other = jwk.clone();
        other.x = jwk.y.clone();
        assert_ne!(jwk.thumbprint().unwrap(), other.thumbprint().unwrap());
        let mut other = jwk.clone();
        other.crv = "P-384".to_string();
        assert_ne!(jwk.thumbprint().unwrap(), other.thumbprint().unwrap());
        let mut other = jwk.clone();
        other.kty = "OKP".to_string();
        assert_ne!(jwk.thumbprint().unwrap(), other.thumbprint().unwrap());
        let mut other = jwk.clone();
        other.y = jwk.x.clone();
        assert_ne!(jwk.thumbprint().unwrap(), other.thumbprint().unwrap());

        let rotated = Jwk::from_key(&KeyPair::generate().unwrap()).unwrap();
        assert_ne!(jwk.thumbprint().unwrap(), rotated.thumbprint().unwrap());
    }

    #[test]
    fn thumbprint_rfc7638_member_order() {
        let jwk = Jwk {
            crv: "P-256".to_string(),
            kty: "EC".to_string(),
            x: "MysViqQWRtiId88Tr5-PkZzLQ64WagPZF_WFPJk_LIE".to_string(),
            y: "WByhhlb7q50I-uXme6YSG042gMslQuiy1st36FUn3MQ".to_string(),
        };
        let input = serde_json::to_string(&jwk).unwrap();
        assert_eq!(
            input,
            r#"{"crv":"P-256","kty":"EC","x":"MysViqQWRtiId88Tr5-PkZzLQ64WagPZF_WFPJk_LIE","y":"WByhhlb7q50I-uXme6YSG042gMslQuiy1st36FUn3MQ"}"#
        );
        assert_eq!(jwk.thumbprint().unwrap(), crate::crypt::base64_sha256(&input));
    }

    #[test]
    fn key_authorization_joins_with_dot() {
        assert_eq!(key_authorization("abc123", "T1"), "abc123.T1");
    }

    #[test]
    fn eab_is_hmac_over_account_jwk() {
        let key = KeyPair::generate().unwrap();
        let hmac_key = base64(b"secret-hmac-key");
        let env = external_account_binding(&key, "https://ca/new-acct", "eab-kid", &hmac_key).unwrap();

        let header = env.decode_protected().unwrap();
        assert_eq!(header, json!({"url": "https://ca/new-acct", "alg": "HS256", "kid": "eab-kid"}));
        let payload: Jwk = serde_json::from_value(env.decode_payload().unwrap().unwrap()).unwrap();
        assert_eq!(payload, Jwk::from_key(&key).unwrap());

        let expected = hmac256(b"secret-hmac-key", &format!("{}.{}", env.protected, env.payload)).unwrap();
        assert_eq!(env.signature, base64(&expected));
    }

    #[test]
    fn key_change_inner_signed_by_new_key() {
        let (old, new) = (KeyPair::generate().unwrap(), KeyPair::generate().unwrap());
        let env = key_change_inner(&old, &new, "https://ca/acct/1", "https://ca/key-change").unwrap();
        verify(&new, &env);

        let header: Protected = serde_json::from_value(env.decode_protected().unwrap()).unwrap();
        assert_eq!(header.nonce(), None);
        assert_eq!(header.jwk(), Some(&Jwk::from_key(&new).unwrap()));
        let payload = env.decode_payload().unwrap().unwrap();
        assert_eq!(payload["account"], "https://ca/acct/1");
        assert_eq!(payload["oldKey"], serde_json::to_value(Jwk::from_key(&old).unwrap()).unwrap());
    }
}
