use serde_json::Value;
use std::fmt;

use crate::crypt::{base64_sha256, sha256};
use crate::jws::key_authorization;
use crate::store::{ResourceStore, ResourceType};

const DIR_CHALLENGE: &str = "/.well-known/acme-challenge/";
const DNS_CHALLENGE_PREFIX: &str = "_acme-challenge.";
const DNS_PERSIST_PREFIX: &str = "_validation-persist.";
const OID_ACME_IDENTIFIER: &str = "1.3.6.1.5.5.7.1.31";

const UNKNOWN_DOMAIN: &str = "<domain>";
const UNKNOWN_ACCOUNT: &str = "<account-uri>";
const UNKNOWN_CAA_DOMAIN: &str = "<ca-caa-domain>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
    Dns01,
    DnsAccount01,
    TlsAlpn01,
    DnsPersist01,
    Other(String),
}

impl ChallengeKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "http-01" => ChallengeKind::Http01,
            "dns-01" => ChallengeKind::Dns01,
            "dns-account-01" => ChallengeKind::DnsAccount01,
            "tls-alpn-01" => ChallengeKind::TlsAlpn01,
            "dns-persist-01" => ChallengeKind::DnsPersist01,
            other => ChallengeKind::Other(other.to_string()),
        }
    }

    /// dns-persist-01 is bound to the account URI, not to the account key.
    pub fn uses_key_authorization(&self) -> bool {
        !matches!(self, ChallengeKind::DnsPersist01)
    }
}

/// Everything about a challenge that lives outside the challenge object itself.
#[derive(Debug, Clone)]
pub struct ChallengeContext {
    pub kind: ChallengeKind,
    pub token: Option<String>,
    pub domain: String,
    pub account_uri: String,
    pub caa_domain: String,
    pub key: Option<String>,
}

impl ChallengeContext {
    pub fn new(kind: ChallengeKind, token: Option<&str>, domain: &str) -> Self {
        ChallengeContext {
            kind,
            token: token.map(|t| t.to_string()),
            domain: domain.to_string(),
            account_uri: UNKNOWN_ACCOUNT.to_string(),
            caa_domain: UNKNOWN_CAA_DOMAIN.to_string(),
            key: None,
        }
    }

    /// Gathers the context of a stored, fetched challenge from its ancestors.
    pub fn from_store(store: &ResourceStore, challenge_url: &str) -> Option<Self> {
        let ch = store.get(challenge_url)?;
        let body = ch.resource.as_ref()?;
        let kind = ChallengeKind::parse(body.get("type")?.as_str()?);
        let token = body.get("token").and_then(Value::as_str);

        let domain = store
            .find_ancestor_of_type(challenge_url, ResourceType::Authorization)
            .and_then(|a| a.resource.as_ref())
            .and_then(|r| r.pointer("/identifier/value"))
            .and_then(Value::as_str)
            .unwrap_or(UNKNOWN_DOMAIN);

        let mut ctx = ChallengeContext::new(kind, token, domain);
        // the key authorization follows the account's current key
        if let Some(acct) = store.find_ancestor_of_type(challenge_url, ResourceType::Account) {
            ctx.account_uri = acct.url.clone();
            ctx.key = acct.key.clone();
        }
        if let Some(caa) = store
            .find_ancestor_of_type(challenge_url, ResourceType::Directory)
            .and_then(|d| d.resource.as_ref())
            .and_then(|r| r.pointer("/meta/caaIdentities/0"))
            .and_then(Value::as_str)
        {
            ctx.caa_domain = caa.to_string();
        }
        Some(ctx)
    }

    /// `thumbprint` is the account key thumbprint; without it only
    /// dns-persist-01 can be answered.
    pub fn instructions(&self, thumbprint: Option<&str>) -> Option<Instructions> {
        if self.kind == ChallengeKind::DnsPersist01 {
            return Some(Instructions::DnsPersist {
                name: format!("{}{}", DNS_PERSIST_PREFIX, self.domain),
                value: format!("{}; accounturi={}", self.caa_domain, self.account_uri),
            });
        }

        let token = self.token.as_deref()?;
        let key_authz = key_authorization(token, thumbprint?);
        Some(match self.kind {
            ChallengeKind::Http01 => Instructions::Http {
                url: format!("http://{}{}{}", self.domain, DIR_CHALLENGE, token),
                content: key_authz,
            },
            ChallengeKind::Dns01 | ChallengeKind::DnsAccount01 => Instructions::DnsTxt {
                name: format!("{}{}", DNS_CHALLENGE_PREFIX, self.domain),
                value: base64_sha256(&key_authz),
            },
            ChallengeKind::TlsAlpn01 => Instructions::TlsAlpn {
                san: self.domain.clone(),
                digest_hex: sha256(&key_authz),
            },
            _ => Instructions::KeyAuthorization(key_authz),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instructions {
    Http { url: String, content: String },
    DnsTxt { name: String, value: String },
    TlsAlpn { san: String, digest_hex: String },
    DnsPersist { name: String, value: String },
    KeyAuthorization(String),
}

impl fmt::Display for Instructions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instructions::Http { url, content } => {
                write!(f, "Serve the following at:\n\t{}\nContent:\n\t{}", url, content)
            }
            Instructions::DnsTxt { name, value } => {
                write!(f, "Create a TXT record:\n\t{}\nValue:\n\t{}", name, value)
            }
            Instructions::TlsAlpn { san, digest_hex } => write!(
                f,
                "Serve a TLS connection on port 443 with ALPN protocol \"acme-tls/1\". The certificate must have:\n\
                 Subject Alternative Name (dNSName):\n\t{}\n\
                 A critical ACME extension (OID {}) containing an ASN.1 DER-encoded OctetString of the SHA-256 digest of the key authorization:\n\t{}",
                san, OID_ACME_IDENTIFIER, digest_hex
            ),
            Instructions::DnsPersist { name, value } => write!(
                f,
                "Create a persistent TXT record (does not need to change between renewals):\n\t{}\nValue:\n\t{}",
                name, value
            ),
            Instructions::KeyAuthorization(ka) => write!(f, "Key Authorization:\n\t{}", ka),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http01_serves_key_authorization_verbatim() {
        let ctx = ChallengeContext::new(ChallengeKind::Http01, Some("abc123"), "example.com");
        assert_eq!(
            ctx.instructions(Some("T1")),
            Some(Instructions::Http {
                url: "http://example.com/.well-known/acme-challenge/abc123".to_string(),
                content: "abc123.T1".to_string(),
            })
        );
    }

    #[test]
    fn dns01_and_dns_account01_publish_digest() {
        for kind in [ChallengeKind::Dns01, ChallengeKind::DnsAccount01] {
            let ctx = ChallengeContext::new(kind, Some("abc123"), "example.com");
            assert_eq!(
                ctx.instructions(Some("T1")),
                Some(Instructions::DnsTxt {
                    name: "_acme-challenge.example.com".to_string(),
                    value: base64_sha256("abc123.T1"),
                })
            );
        }
    }

    #[test]
    fn tls_alpn01_hex_digest() {
        let ctx = ChallengeContext::new(ChallengeKind::TlsAlpn01, Some("abc123"), "example.com");
        match ctx.instructions(Some("T1")).unwrap() {
            Instructions::TlsAlpn { san, digest_hex } => {
                assert_eq!(san, "example.com");
                assert_eq!(digest_hex.len(), 64);
                assert_eq!(digest_hex, sha256("abc123.T1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn unknown_type_gets_raw_key_authorization() {
        let ctx = ChallengeContext::new(ChallengeKind::parse("email-reply-00"), Some("t"), "example.com");
        assert_eq!(ctx.instructions(Some("T")), Some(Instructions::KeyAuthorization("t.T".to_string())));
        assert_eq!(ctx.instructions(None), None);
    }

    #[test]
    fn dns_persist01_from_store_without_key() {
        let mut s = ResourceStore::in_memory();
        s.put("https://ca/dir", "", ResourceType::Directory, "", Some(json!({"meta": {"caaIdentities": ["ca.example"]}})), None)
            .unwrap();
        s.put("https://ca/acct/7", "", ResourceType::Account, "https://ca/dir", Some(json!({})), None).unwrap();
        s.put("https://ca/order/1", "", ResourceType::Order, "https://ca/acct/7", Some(json!({})), None).unwrap();
        s.put(
            "https://ca/authz/1",
            "",
            ResourceType::Authorization,
            "https://ca/order/1",
            Some(json!({"identifier": {"type": "dns", "value": "example.com"}})),
            None,
        )
        .unwrap();
        s.put(
            "https://ca/chall/1",
            "",
            ResourceType::Challenge,
            "https://ca/authz/1",
            Some(json!({"type": "dns-persist-01", "url": "https://ca/chall/1"})),
            None,
        )
        .unwrap();

        let ctx = ChallengeContext::from_store(&s, "https://ca/chall/1").unwrap();
        assert!(!ctx.kind.uses_key_authorization());
        assert_eq!(
            ctx.instructions(None),
            Some(Instructions::DnsPersist {
                name: "_validation-persist.example.com".to_string(),
                value: "ca.example; accounturi=https://ca/acct/7".to_string(),
            })
        );
    }

    #[test]
    fn placeholders_when_ancestry_unknown() {
        let mut s = ResourceStore::in_memory();
        s.put("c", "", ResourceType::Challenge, "missing", Some(json!({"type": "dns-persist-01"})), None).unwrap();
        let ctx = ChallengeContext::from_store(&s, "c").unwrap();
        assert_eq!(
            ctx.instructions(None).unwrap(),
            Instructions::DnsPersist {
                name: "_validation-persist.<domain>".to_string(),
                value: "<ca-caa-domain>; accounturi=<account-uri>".to_string(),
            }
        );
    }

    #[test]
    fn key_follows_account_not_challenge_record() {
        let mut s = ResourceStore::in_memory();
        s.put("https://ca/acct/1", "", ResourceType::Account, "", Some(json!({})), Some("rolled")).unwrap();
        s.put(
            "https://ca/chall/1",
            "",
            ResourceType::Challenge,
            "https://ca/acct/1",
            Some(json!({"type": "http-01", "token": "t"})),
            Some("original"),
        )
        .unwrap();
        let ctx = ChallengeContext::from_store(&s, "https://ca/chall/1").unwrap();
        assert_eq!(ctx.key.as_deref(), Some("rolled"));
    }
}
