use async_trait::async_trait;
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::crypt::pem_to_base64;
use crate::jws::{self, Payload, Protected, SignedEnvelope};
use crate::keystore::KeyStore;
use crate::nonce::{pool_url, NoncePool};
use crate::store::{Resource, ResourceStore, ResourceType};
use crate::{http_request, AcmeError, HttpResponse, Method, HEADER_LOCATION, HEADER_REPLAY_NONCE};

const STATUS_INVALID: &str = "invalid";
const TIP_NO_DIRECTORY: &str = "No directory found above this resource. Add the directory first.";

/// The network side of an exchange. Timeouts are the transport's business and
/// come back as `AcmeError::Transport`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &str) -> Result<HttpResponse, AcmeError>;
    async fn head(&self, url: &str) -> Result<HttpResponse, AcmeError>;
    async fn post_jose(&self, url: &str, body: String) -> Result<HttpResponse, AcmeError>;
}

pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new(insecure: bool) -> Result<Self, AcmeError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(ReqwestTransport { client })
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpResponse, AcmeError> {
        http_request(&self.client, url, None, Method::GET).await
    }
    async fn head(&self, url: &str) -> Result<HttpResponse, AcmeError> {
        http_request(&self.client, url, None, Method::HEAD).await
    }
    async fn post_jose(&self, url: &str, body: String) -> Result<HttpResponse, AcmeError> {
        http_request(&self.client, url, Some(body), Method::POST).await
    }
}

/// Directory methods (RFC 8555 §7.1.1) plus ARI's renewalInfo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcmeMethod {
    NewNonce,
    NewAccount,
    NewOrder,
    NewAuthz,
    RevokeCert,
    KeyChange,
    RenewalInfo,
}

impl AcmeMethod {
    pub const ALL: [AcmeMethod; 7] = [
        AcmeMethod::NewNonce,
        AcmeMethod::NewAccount,
        AcmeMethod::NewOrder,
        AcmeMethod::NewAuthz,
        AcmeMethod::RevokeCert,
        AcmeMethod::KeyChange,
        AcmeMethod::RenewalInfo,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AcmeMethod::NewNonce => "newNonce",
            AcmeMethod::NewAccount => "newAccount",
            AcmeMethod::NewOrder => "newOrder",
            AcmeMethod::NewAuthz => "newAuthz",
            AcmeMethod::RevokeCert => "revokeCert",
            AcmeMethod::KeyChange => "keyChange",
            AcmeMethod::RenewalInfo => "renewalInfo",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Directory {
    pub new_nonce: Option<String>,
    pub new_account: Option<String>,
    pub new_order: Option<String>,
    pub new_authz: Option<String>,
    pub revoke_cert: Option<String>,
    pub key_change: Option<String>,
    pub renewal_info: Option<String>,
    #[serde(default)]
    pub meta: DirectoryMeta,
    #[serde(flatten)]
    pub unknown: Map<String, Value>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryMeta {
    pub terms_of_service: Option<String>,
    pub website: Option<String>,
    #[serde(default)]
    pub caa_identities: Vec<String>,
    pub external_account_required: Option<bool>,
    pub profiles: Option<Map<String, Value>>,
}

impl Directory {
    /// A method is only usable if the directory advertises its URL.
    pub fn endpoint(&self, method: AcmeMethod) -> Option<&str> {
        match method {
            AcmeMethod::NewNonce => self.new_nonce.as_deref(),
            AcmeMethod::NewAccount => self.new_account.as_deref(),
            AcmeMethod::NewOrder => self.new_order.as_deref(),
            AcmeMethod::NewAuthz => self.new_authz.as_deref(),
            AcmeMethod::RevokeCert => self.revoke_cert.as_deref(),
            AcmeMethod::KeyChange => self.key_change.as_deref(),
            AcmeMethod::RenewalInfo => self.renewal_info.as_deref(),
        }
    }

    pub fn supports(&self, method: AcmeMethod) -> bool {
        self.endpoint(method).is_some()
    }

    pub fn methods(&self) -> Vec<AcmeMethod> {
        AcmeMethod::ALL.into_iter().filter(|m| self.supports(*m)).collect()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub _type: String,
    pub value: String,
}
impl Identifier {
    pub fn dns(value: &str) -> Self {
        Identifier {
            _type: "dns".to_string(),
            value: value.to_string(),
        }
    }
    pub fn ip(value: &str) -> Self {
        Identifier {
            _type: "ip".to_string(),
            value: value.to_string(),
        }
    }
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    pub terms_of_service_agreed: bool,
    pub contact: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub only_return_existing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_account_binding: Option<SignedEnvelope>,
}

#[derive(Serialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub identifiers: Vec<Identifier>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<String>,
}

#[derive(Serialize, Debug)]
pub struct NewAuthz {
    pub identifier: Identifier,
}

#[derive(Serialize, Debug)]
pub struct Finalize {
    pub csr: String,
}

#[derive(Serialize, Debug)]
pub struct RevokeCert {
    pub certificate: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<u8>,
}

/// What the caller wants sent: target, message, and where the result belongs.
#[derive(Debug, Clone)]
pub struct Exchange {
    pub url: String,
    pub payload: Payload,
    /// `None` when the response is not a resource worth keeping (revokeCert).
    pub kind: Option<ResourceType>,
    pub parent: String,
    pub key: String,
    /// `None` signs with `jwk`, only right for newAccount and certificate-key revokeCert.
    pub kid: Option<String>,
    /// Where the result lives when the server sends no Location. Defaults to `url`.
    pub resolve_as: Option<String>,
    /// Key name recorded on the stored result when it differs from the signing key.
    pub record_key: Option<String>,
}

impl Exchange {
    pub fn new(url: &str, payload: Payload, kind: Option<ResourceType>, parent: &str, key: &str, kid: Option<&str>) -> Self {
        Exchange {
            url: url.to_string(),
            payload,
            kind,
            parent: parent.to_string(),
            key: key.to_string(),
            kid: kid.map(|k| k.to_string()),
            resolve_as: None,
            record_key: None,
        }
    }
}

/// An exchange that has been protected and signed but not sent yet.
#[derive(Debug, Clone)]
pub struct Prepared {
    pub exchange: Exchange,
    pub directory_url: String,
    pub protected: Protected,
    pub envelope: SignedEnvelope,
}

#[derive(Debug, Clone)]
pub struct ExchangeReport {
    pub envelope: SignedEnvelope,
    pub status: u16,
    pub body: String,
    pub location: String,
    pub stored: bool,
    pub children: Vec<(String, ResourceType)>,
}

type FollowUp = fn(&Value) -> Vec<(String, ResourceType)>;

const FOLLOW_UPS: &[(ResourceType, FollowUp)] = &[
    (ResourceType::Order, order_children),
    (ResourceType::Authorization, authorization_children),
];

fn follow_up(kind: ResourceType) -> Option<FollowUp> {
    FOLLOW_UPS.iter().find(|(k, _)| *k == kind).map(|(_, f)| *f)
}

fn order_children(order: &Value) -> Vec<(String, ResourceType)> {
    let mut list: Vec<(String, ResourceType)> = order
        .get("authorizations")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(|u| (u.to_string(), ResourceType::Authorization))
        .collect();
    if let Some(cert) = order.get("certificate").and_then(Value::as_str) {
        list.push((cert.to_string(), ResourceType::Certificate));
    }
    list
}

fn authorization_children(authz: &Value) -> Vec<(String, ResourceType)> {
    authz
        .get("challenges")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|c| c.get("url").and_then(Value::as_str))
        .map(|u| (u.to_string(), ResourceType::Challenge))
        .collect()
}

/// Drives single ACME exchanges: protect, sign, send, then file the result.
pub struct ProtocolDriver<T: Transport> {
    transport: T,
    pub keys: KeyStore,
    pub nonces: NoncePool,
    pub store: ResourceStore,
}

impl<T: Transport> ProtocolDriver<T> {
    pub fn new(transport: T, keys: KeyStore, store: ResourceStore) -> Self {
        let nonces = NoncePool::restore(&store);
        ProtocolDriver {
            transport,
            keys,
            nonces,
            store,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn directory(&self, directory_url: &str) -> Result<Directory, AcmeError> {
        let r = self
            .store
            .get(directory_url)
            .filter(|r| r.kind == ResourceType::Directory)
            .ok_or_else(|| AcmeError::Tip(format!("Unknown directory: {}", directory_url)))?;
        match &r.resource {
            Some(v) => Ok(serde_json::from_value(v.clone())?),
            None => AcmeError::tip(&format!("Directory not fetched yet: {}", directory_url)),
        }
    }

    /// The directory owning `url`, i.e. whose nonces an exchange about `url` spends.
    pub fn directory_url_of(&self, url: &str) -> Option<String> {
        self.store
            .find_ancestor_of_type(url, ResourceType::Directory)
            .map(|r| r.url.clone())
    }

    /// The account URL to use as `kid` for requests about `url`.
    pub fn account_of(&self, url: &str) -> Option<&Resource> {
        self.store.find_ancestor_of_type(url, ResourceType::Account)
    }

    pub fn endpoint(&self, directory_url: &str, method: AcmeMethod) -> Result<String, AcmeError> {
        match self.directory(directory_url)?.endpoint(method) {
            Some(u) => Ok(u.to_string()),
            None => AcmeError::tip(&format!("The directory does not advertise {}", method.as_str())),
        }
    }

    /// GET the directory and file it as a root resource.
    pub async fn fetch_directory(&mut self, url: &str, name: &str) -> Result<Directory, AcmeError> {
        info!("GET directory {}", url);
        let res = self.transport.get(url).await?;
        if !res.is_success() {
            // a nonce pool only hangs off a directory that is already stored
            if self.store.get(url).map(|r| r.kind) == Some(ResourceType::Directory) {
                self.harvest_nonce(url, &res)?;
            }
            return Err(AcmeError::Protocol {
                status: res.status,
                body: res.body,
            });
        }
        let value: Value = serde_json::from_str(&res.body)?;
        let dir: Directory = serde_json::from_value(value.clone())?;
        let name = match name {
            "" => self.stored_name(url),
            n => n.to_string(),
        };
        self.store.put(url, &name, ResourceType::Directory, "", Some(value), None)?;
        self.harvest_nonce(url, &res)?;
        debug!("Directory supports {:?}", dir.methods());
        Ok(dir)
    }

    pub async fn new_nonce(&mut self, directory_url: &str) -> Result<String, AcmeError> {
        let url = self.endpoint(directory_url, AcmeMethod::NewNonce)?;
        info!("HEAD newNonce {}", url);
        let res = self.transport.head(&url).await?;
        match self.harvest_nonce(directory_url, &res)? {
            Some(n) => Ok(n),
            None => AcmeError::tip("No nonce returned in headers"),
        }
    }

    /// Protect and Sign. The nonce is spent here even if the result is never sent.
    pub fn prepare(&mut self, exchange: Exchange) -> Result<Prepared, AcmeError> {
        let directory_url = self
            .directory_url_of(&exchange.parent)
            .or_else(|| self.directory_url_of(&exchange.url))
            .ok_or_else(|| AcmeError::Tip(TIP_NO_DIRECTORY.to_string()))?;

        let nonce = match self.nonces.acquire(&directory_url) {
            Some(n) => n,
            None => {
                warn!("Nonce pool for {} is empty", directory_url);
                return Err(AcmeError::NonceExhausted(directory_url));
            }
        };
        self.sync_pool(&directory_url)?;

        let key = self.keys.get_or_create(&exchange.key)?;
        let protected = jws::protect(&key, exchange.kid.as_deref(), &nonce, &exchange.url)?;
        info!("Protect: {}", serde_json::to_string(&protected)?);
        let envelope = jws::sign(&key, &protected, &exchange.payload)?;
        trace!("Signed: {:?}", envelope);

        Ok(Prepared {
            exchange,
            directory_url,
            protected,
            envelope,
        })
    }

    /// Transmit and Resolve.
    pub async fn submit(&mut self, prepared: Prepared) -> Result<ExchangeReport, AcmeError> {
        let Prepared {
            exchange,
            directory_url,
            envelope,
            ..
        } = prepared;

        info!("POST {}", exchange.url);
        let res = self.transport.post_jose(&exchange.url, serde_json::to_string(&envelope)?).await?;
        self.harvest_nonce(&directory_url, &res)?;

        let location = res
            .header(HEADER_LOCATION)
            .map(|s| s.to_string())
            .or_else(|| exchange.resolve_as.clone())
            .unwrap_or_else(|| exchange.url.clone());
        let value = parse_body(&res.body);

        if !res.is_success() {
            // a failed object is still worth showing, e.g. an invalid order with its error
            if let (Some(kind), Some(v)) = (exchange.kind, &value) {
                if is_meaningful_failure(kind, v) {
                    self.store_result(&exchange, kind, &location, v.clone())?;
                }
            }
            return Err(AcmeError::Protocol {
                status: res.status,
                body: res.body,
            });
        }

        let mut report = ExchangeReport {
            envelope,
            status: res.status,
            body: res.body.clone(),
            location: location.clone(),
            stored: false,
            children: Vec::new(),
        };

        if let Some(kind) = exchange.kind {
            let v = match value {
                Some(v) => v,
                // empty bodies (keyChange on some CAs) keep what we had
                None => self
                    .store
                    .get(&location)
                    .and_then(|r| r.resource.clone())
                    .unwrap_or(Value::Null),
            };
            report.children = self.store_result(&exchange, kind, &location, v)?;
            report.stored = true;
        }
        info!("Resolved {} ({} children)", report.location, report.children.len());
        Ok(report)
    }

    /// Re-signs `prepared` over a hand-edited protected header, sent byte for byte.
    /// The header must still parse, but nothing else about it is checked.
    pub fn reprotect(&mut self, prepared: Prepared, protected_json: &str) -> Result<Prepared, AcmeError> {
        let protected_json = protected_json.trim();
        let protected: Protected = serde_json::from_str(protected_json)
            .map_err(|e| AcmeError::Tip(format!("Edited protected header does not parse: {}", e)))?;
        let key = self.keys.get_or_create(&prepared.exchange.key)?;
        let envelope = jws::sign_serialized(&key, protected_json, prepared.envelope.payload.clone())?;
        info!("Protect (edited): {}", protected_json);
        Ok(Prepared {
            protected,
            envelope,
            ..prepared
        })
    }

    pub async fn exchange(&mut self, exchange: Exchange) -> Result<ExchangeReport, AcmeError> {
        let prepared = self.prepare(exchange)?;
        self.submit(prepared).await
    }

    fn store_result(
        &mut self,
        exchange: &Exchange,
        kind: ResourceType,
        location: &str,
        value: Value,
    ) -> Result<Vec<(String, ResourceType)>, AcmeError> {
        let key = exchange.record_key.as_deref().unwrap_or(&exchange.key);
        let children = follow_up(kind).map(|f| f(&value)).unwrap_or_default();
        let name = self.stored_name(location);
        self.store.put(location, &name, kind, &exchange.parent, Some(value), Some(key))?;

        let mut registered = Vec::new();
        for (url, child_kind) in children {
            if self.store.register(&url, child_kind, location, Some(key))? {
                debug!("Registered {} {}", child_kind, url);
                registered.push((url, child_kind));
            }
        }
        Ok(registered)
    }

    /// Display names are set by the operator and survive refetches.
    fn stored_name(&self, url: &str) -> String {
        self.store.get(url).map(|r| r.name.clone()).unwrap_or_default()
    }

    fn harvest_nonce(&mut self, directory_url: &str, res: &HttpResponse) -> Result<Option<String>, AcmeError> {
        match res.header(HEADER_REPLAY_NONCE) {
            Some(n) => {
                let n = n.to_string();
                if self.nonces.deposit(directory_url, &n) {
                    self.sync_pool(directory_url)?;
                }
                Ok(Some(n))
            }
            None => {
                warn!("No {} header from server", HEADER_REPLAY_NONCE);
                Ok(None)
            }
        }
    }

    fn sync_pool(&mut self, directory_url: &str) -> Result<(), AcmeError> {
        let pool = self.nonces.available(directory_url);
        self.store.put(
            &pool_url(directory_url),
            &format!("Nonce Pool ({})", pool.len()),
            ResourceType::Nonces,
            directory_url,
            Some(json!({ "nonces": pool })),
            None,
        )
    }

    pub fn clear(&mut self) -> Result<(), AcmeError> {
        self.nonces.clear();
        self.store.clear()
    }

    // ---- composing exchanges ----

    pub fn compose_new_account(
        &mut self,
        directory_url: &str,
        key_name: &str,
        mut msg: NewAccount,
        eab: Option<(&str, &str)>,
    ) -> Result<Exchange, AcmeError> {
        let dir = self.directory(directory_url)?;
        let url = self.endpoint(directory_url, AcmeMethod::NewAccount)?;
        if let Some((eab_kid, eab_key)) = eab {
            let key = self.keys.get_or_create(key_name)?;
            msg.external_account_binding = Some(jws::external_account_binding(&key, &url, eab_kid, eab_key)?);
        } else if dir.meta.external_account_required.unwrap_or(false) {
            warn!("External Account Binding is required by this directory");
        }
        Ok(Exchange::new(
            &url,
            Payload::json(&msg)?,
            Some(ResourceType::Account),
            directory_url,
            key_name,
            None,
        ))
    }

    pub fn compose_new_order(&self, account_url: &str, msg: &NewOrder) -> Result<Exchange, AcmeError> {
        let (directory_url, key) = self.account_context(account_url)?;
        let url = self.endpoint(&directory_url, AcmeMethod::NewOrder)?;
        Ok(Exchange::new(&url, Payload::json(msg)?, Some(ResourceType::Order), account_url, &key, Some(account_url)))
    }

    pub fn compose_new_authz(&self, account_url: &str, msg: &NewAuthz) -> Result<Exchange, AcmeError> {
        let (directory_url, key) = self.account_context(account_url)?;
        let url = self.endpoint(&directory_url, AcmeMethod::NewAuthz)?;
        Ok(Exchange::new(
            &url,
            Payload::json(msg)?,
            Some(ResourceType::Authorization),
            account_url,
            &key,
            Some(account_url),
        ))
    }

    /// POST-as-GET of a stored resource.
    pub fn compose_reload(&self, url: &str) -> Result<Exchange, AcmeError> {
        let r = self.known(url)?;
        if matches!(r.kind, ResourceType::Directory | ResourceType::Nonces) {
            return AcmeError::tip("Directories are fetched with a plain GET, not POST-as-GET");
        }
        let (kid, key) = self.signer_of(url)?;
        Ok(Exchange::new(url, Payload::PostAsGet, Some(r.kind), &r.parent, &key, Some(&kid)))
    }

    /// Tells the server the challenge is ready: an empty JSON object, not POST-as-GET.
    pub fn compose_respond(&self, challenge_url: &str) -> Result<Exchange, AcmeError> {
        let r = self.known(challenge_url)?;
        let (kid, key) = self.signer_of(challenge_url)?;
        Ok(Exchange::new(
            challenge_url,
            Payload::Json(json!({})),
            Some(ResourceType::Challenge),
            &r.parent,
            &key,
            Some(&kid),
        ))
    }

    pub fn compose_finalize(&self, order_url: &str, csr: &str) -> Result<Exchange, AcmeError> {
        let r = self.known(order_url)?;
        let finalize = r
            .resource
            .as_ref()
            .and_then(|v| v.get("finalize"))
            .and_then(Value::as_str)
            .ok_or_else(|| AcmeError::Tip(format!("Order has no finalize URL, reload it first: {}", order_url)))?;
        let (kid, key) = self.signer_of(order_url)?;
        let msg = Finalize {
            csr: pem_to_base64(csr)?,
        };
        let mut ex = Exchange::new(finalize, Payload::json(&msg)?, Some(ResourceType::Order), &r.parent, &key, Some(&kid));
        ex.resolve_as = Some(order_url.to_string());
        Ok(ex)
    }

    /// `kid == None` revokes with the certificate's own key, named `key_name`.
    pub fn compose_revoke(
        &self,
        directory_url: &str,
        cert_pem: &str,
        reason: Option<u8>,
        key_name: &str,
        kid: Option<&str>,
    ) -> Result<Exchange, AcmeError> {
        let url = self.endpoint(directory_url, AcmeMethod::RevokeCert)?;
        let msg = RevokeCert {
            certificate: pem_to_base64(cert_pem)?,
            reason,
        };
        let parent = kid.unwrap_or(directory_url);
        Ok(Exchange::new(&url, Payload::json(&msg)?, None, parent, key_name, kid))
    }

    /// Rolls the account over to `new_key_name`; on success the account is recorded with the new key.
    pub fn compose_key_change(&mut self, account_url: &str, new_key_name: &str) -> Result<Exchange, AcmeError> {
        let (directory_url, key) = self.account_context(account_url)?;
        if key == new_key_name {
            return AcmeError::tip("The new key must differ from the current account key");
        }
        let url = self.endpoint(&directory_url, AcmeMethod::KeyChange)?;
        let old = self.keys.get_or_create(&key)?;
        let new = self.keys.get_or_create(new_key_name)?;
        let inner = jws::key_change_inner(&old, &new, account_url, &url)?;

        let parent = self.known(account_url)?.parent.clone();
        let mut ex = Exchange::new(&url, Payload::json(&inner)?, Some(ResourceType::Account), &parent, &key, Some(account_url));
        ex.resolve_as = Some(account_url.to_string());
        ex.record_key = Some(new_key_name.to_string());
        Ok(ex)
    }

    fn known(&self, url: &str) -> Result<&Resource, AcmeError> {
        self.store
            .get(url)
            .ok_or_else(|| AcmeError::Tip(format!("Unknown resource: {}", url)))
    }

    /// (directory url, key name) of an account.
    fn account_context(&self, account_url: &str) -> Result<(String, String), AcmeError> {
        let acct = self.known(account_url)?;
        if acct.kind != ResourceType::Account {
            return AcmeError::tip(&format!("Not an account: {}", account_url));
        }
        let directory_url = self
            .directory_url_of(account_url)
            .ok_or_else(|| AcmeError::Tip(TIP_NO_DIRECTORY.to_string()))?;
        let key = acct
            .key
            .clone()
            .ok_or_else(|| AcmeError::Tip(format!("No key recorded for account {}", account_url)))?;
        Ok((directory_url, key))
    }

    /// (kid, key name) for authenticated requests about `url`. The account's
    /// current key signs, whatever key its children were created under.
    fn signer_of(&self, url: &str) -> Result<(String, String), AcmeError> {
        self.known(url)?;
        let acct = self
            .account_of(url)
            .ok_or_else(|| AcmeError::Tip(format!("No account found above {}", url)))?;
        let key = acct
            .key
            .clone()
            .ok_or_else(|| AcmeError::Tip(format!("No key recorded for account {}", acct.url)))?;
        Ok((acct.url.clone(), key))
    }
}

fn parse_body(body: &str) -> Option<Value> {
    if body.trim().is_empty() {
        return None;
    }
    // certificates come back as PEM text
    Some(serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string())))
}

fn is_meaningful_failure(kind: ResourceType, v: &Value) -> bool {
    matches!(kind, ResourceType::Order | ResourceType::Authorization | ResourceType::Challenge)
        && v.get("status").and_then(Value::as_str) == Some(STATUS_INVALID)
}
