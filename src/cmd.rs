use log::{info, warn};
use serde_json::Value;
use std::{fmt::Write as _, fs};

use crate::acme::{
    AcmeMethod, Exchange, ExchangeReport, Identifier, NewAccount, NewAuthz, NewOrder, ProtocolDriver, ReqwestTransport,
    Transport,
};
use crate::challenge::ChallengeContext;
use crate::jws::{thumbprint, Payload};
use crate::keystore::KeyStore;
use crate::store::{ResourceStore, ResourceType, TreeNode};
use crate::{AcmeCa, AcmeCfg, AcmeError, DEFAULT_KEY};

const MAILTO: &str = "mailto:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Directory,
    Nonce,
    Account,
    Order,
    Authz,
    Reload,
    Respond,
    Finalize,
    Revoke,
    KeyChange,
    Show,
    Tree,
    Keys,
    Clear,
}

impl Command {
    pub fn parse(s: &str) -> Result<Self, AcmeError> {
        Ok(match s {
            "directory" | "dir" => Command::Directory,
            "nonce" => Command::Nonce,
            "account" => Command::Account,
            "order" => Command::Order,
            "authz" => Command::Authz,
            "reload" => Command::Reload,
            "respond" => Command::Respond,
            "finalize" => Command::Finalize,
            "revoke" => Command::Revoke,
            "key-change" => Command::KeyChange,
            "show" => Command::Show,
            "tree" => Command::Tree,
            "keys" => Command::Keys,
            "clear" => Command::Clear,
            other => return AcmeError::tip(&format!("Unknown cmd: {}", other)),
        })
    }
}

pub async fn run(cfg: &AcmeCfg) -> Result<(), AcmeError> {
    let keys = KeyStore::open(&cfg.keys_path())?;
    let store = ResourceStore::open(&cfg.resources_path())?;
    let mut driver = ProtocolDriver::new(ReqwestTransport::new(cfg.insecure)?, keys, store);

    match cfg.cmd() {
        Command::Directory => {
            let (url, name) = directory_target(cfg)?;
            let dir = driver.fetch_directory(&url, &name).await?;
            let methods: Vec<&str> = dir.methods().iter().map(|m| m.as_str()).collect();
            println!("{}\nSupports: {}", url, methods.join(", "));
            if let Some(tos) = &dir.meta.terms_of_service {
                println!("Terms of service: {}", tos);
            }
            if let Some(website) = &dir.meta.website {
                println!("Website: {}", website);
            }
            if !dir.meta.caa_identities.is_empty() {
                println!("CAA identities: {}", dir.meta.caa_identities.join(", "));
            }
            for (k, v) in &dir.unknown {
                println!("Unknown entry {}: {}", k, v);
            }
            if dir.meta.external_account_required == Some(true) {
                println!("External account binding required");
            }
            if let Some(profiles) = &dir.meta.profiles {
                let names: Vec<&str> = profiles.keys().map(|k| k.as_str()).collect();
                println!("Profiles: {}", names.join(", "));
            }
        }
        Command::Nonce => {
            let (url, _) = directory_target(cfg)?;
            let nonce = driver.new_nonce(&url).await?;
            println!("{} ({} in pool)", nonce, driver.nonces.len(&url));
        }
        Command::Account => {
            let (url, _) = directory_target(cfg)?;
            let key = cfg.param("key").unwrap_or(DEFAULT_KEY);
            let msg = NewAccount {
                terms_of_service_agreed: cfg.flag("tos"),
                contact: cfg.list("contact").iter().map(|c| mailto(c)).collect(),
                only_return_existing: cfg.flag("only_existing").then_some(true),
                external_account_binding: None,
            };
            let eab = match (cfg.param("eab_kid"), cfg.param("eab_key")) {
                (Some(kid), Some(hmac)) => Some((kid, hmac)),
                (None, None) => None,
                _ => return AcmeError::tip("eab_kid and eab_key go together"),
            };
            let ex = driver.compose_new_account(&url, key, msg, eab)?;
            perform(cfg, &mut driver, ex).await?;
        }
        Command::Order => {
            let account = cfg.required("url")?;
            let msg = NewOrder {
                identifiers: identifiers(cfg),
                profile: cfg.param("profile").map(|s| s.to_string()),
                not_before: cfg.param("not_before").map(|s| s.to_string()),
                not_after: cfg.param("not_after").map(|s| s.to_string()),
            };
            if msg.identifiers.is_empty() {
                return AcmeError::tip("Missing parameter 'dns' or 'ip'");
            }
            let ex = driver.compose_new_order(account, &msg)?;
            perform(cfg, &mut driver, ex).await?;
        }
        Command::Authz => {
            let account = cfg.required("url")?;
            let identifier = identifiers(cfg)
                .into_iter()
                .next()
                .ok_or_else(|| AcmeError::Tip("Missing parameter 'dns' or 'ip'".to_string()))?;
            let ex = driver.compose_new_authz(account, &NewAuthz { identifier })?;
            perform(cfg, &mut driver, ex).await?;
        }
        Command::Reload => {
            let url = cfg.required("url")?;
            let is_directory = driver.store.get(url).map(|r| r.kind) == Some(ResourceType::Directory);
            if is_directory {
                driver.fetch_directory(url, "").await?;
                info!("Reloaded directory {}", url);
            } else {
                let ex = driver.compose_reload(url)?;
                perform(cfg, &mut driver, ex).await?;
            }
        }
        Command::Respond => {
            let ex = driver.compose_respond(cfg.required("url")?)?;
            perform(cfg, &mut driver, ex).await?;
        }
        Command::Finalize => {
            let csr = fs::read_to_string(cfg.required("csr")?)?;
            let ex = driver.compose_finalize(cfg.required("url")?, &csr)?;
            perform(cfg, &mut driver, ex).await?;
        }
        Command::Revoke => {
            let url = cfg.required("url")?;
            let cert = certificate_text(&driver.store, cfg.required("cert")?)?;
            let reason = match cfg.param("reason") {
                Some(r) => Some(r.parse::<u8>().map_err(|_| AcmeError::Tip(format!("Invalid reason code: {}", r)))?),
                None => None,
            };
            let ex = match driver.account_of(url).map(|a| (a.url.clone(), a.key.clone())) {
                // signed by the account
                Some((acct, Some(key))) => {
                    let dir = directory_of(&driver, &acct)?;
                    driver.compose_revoke(&dir, &cert, reason, &key, Some(&acct))?
                }
                // signed by the certificate key
                _ => {
                    let dir = directory_of(&driver, url)?;
                    driver.compose_revoke(&dir, &cert, reason, cfg.required("key")?, None)?
                }
            };
            perform(cfg, &mut driver, ex).await?;
        }
        Command::KeyChange => {
            let ex = driver.compose_key_change(cfg.required("url")?, cfg.required("new_key")?)?;
            perform(cfg, &mut driver, ex).await?;
        }
        Command::Show => show(&driver, cfg.required("url")?)?,
        Command::Tree => print!("{}", render_tree(&driver.store)),
        Command::Keys => {
            for name in driver.keys.names() {
                if let Some(key) = driver.keys.get(name)? {
                    println!("{}\t{}", name, thumbprint(&key)?);
                }
            }
        }
        Command::Clear => {
            driver.clear()?;
            info!("Cleared all resources and nonces. Keys are kept in {:?}", cfg.keys_path());
        }
    }
    Ok(())
}

/// Sends `ex`, or with `dry=1` only shows what would be sent. `payload=<file>`
/// swaps in a hand-written message body, `kid=` a hand-picked key id and
/// `protected=<file>` a hand-written protected header. An empty nonce pool is
/// an error here; `cmd=nonce` refills it.
async fn perform<T: Transport>(cfg: &AcmeCfg, driver: &mut ProtocolDriver<T>, mut ex: Exchange) -> Result<(), AcmeError> {
    if let Some(path) = cfg.param("payload") {
        let text = fs::read_to_string(path)?;
        ex.payload = if text.trim().is_empty() {
            Payload::PostAsGet
        } else {
            Payload::Json(serde_json::from_str(&text)?)
        };
        info!("Payload replaced from {}", path);
    }
    if let Some(kid) = cfg.param("kid") {
        ex.kid = Some(kid.to_string());
        info!("kid replaced with {}", kid);
    }

    let mut prepared = driver.prepare(ex)?;
    if let Some(path) = cfg.param("protected") {
        prepared = driver.reprotect(prepared, &fs::read_to_string(path)?)?;
        info!("Protected header replaced from {}", path);
    }

    println!("POST {}\n{}", prepared.exchange.url, serde_json::to_string_pretty(&prepared.protected)?);
    if cfg.dry {
        println!("{}", prepared.envelope.to_json()?);
        info!("Dry run, nothing sent. The nonce is spent.");
        return Ok(());
    }

    let report = driver.submit(prepared).await?;
    print_report(&report);
    Ok(())
}

fn print_report(report: &ExchangeReport) {
    println!("<== {} {}", report.status, report.location);
    let body = serde_json::from_str::<Value>(&report.body)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| report.body.clone());
    println!("{}", body);
    for (url, kind) in &report.children {
        println!("  + {} {}", kind, url);
    }
}

fn show<T: Transport>(driver: &ProtocolDriver<T>, url: &str) -> Result<(), AcmeError> {
    let r = driver
        .store
        .get(url)
        .ok_or_else(|| AcmeError::Tip(format!("Unknown resource: {}", url)))?;
    println!("{} [{}] parent={} key={}", r.label(), r.kind, r.parent, r.key.as_deref().unwrap_or("-"));
    match &r.resource {
        Some(Value::String(text)) => println!("{}", text),
        Some(v) => println!("{}", serde_json::to_string_pretty(v)?),
        None => println!("(not fetched, run cmd=reload url={})", url),
    }

    if r.kind == ResourceType::Challenge {
        if let Some(ctx) = ChallengeContext::from_store(&driver.store, url) {
            let thumb = match ctx.key.as_deref().map(|k| driver.keys.get(k)).transpose()?.flatten() {
                Some(key) => Some(thumbprint(&key)?),
                None => None,
            };
            match ctx.instructions(thumb.as_deref()) {
                Some(i) => println!("\n{}", i),
                None => warn!("No key or token recorded for {}, cannot compute the key authorization", url),
            }
        }
    }
    Ok(())
}

/// The stored resources as an indented outline.
pub fn render_tree(store: &ResourceStore) -> String {
    fn walk(out: &mut String, node: &TreeNode, depth: usize) {
        let r = node.resource;
        let status = r
            .resource
            .as_ref()
            .and_then(|v| v.get("status"))
            .and_then(Value::as_str)
            .unwrap_or(if r.resource.is_none() { "?" } else { "" });
        let _ = writeln!(out, "{}{} [{}] {}", "  ".repeat(depth), r.label(), r.kind, status);
        for c in &node.children {
            walk(out, c, depth + 1);
        }
    }
    let mut out = String::new();
    for node in store.tree() {
        walk(&mut out, &node, 0);
    }
    out
}

/// `url=` or a `ca=` preset, with a display name.
fn directory_target(cfg: &AcmeCfg) -> Result<(String, String), AcmeError> {
    if let Some(url) = cfg.param("url") {
        return Ok((url.to_string(), cfg.param("name").unwrap_or("").to_string()));
    }
    let preset = cfg.param("ca").unwrap_or("le");
    match AcmeCa::new(preset) {
        Some(ca) => Ok((
            ca.directory_url().to_string(),
            cfg.param("name").unwrap_or(ca.name()).to_string(),
        )),
        None => AcmeError::tip(&format!("Unknown ca: {}. Try le, le-staging, zero, gts, pebble or url=", preset)),
    }
}

fn directory_of<T: Transport>(driver: &ProtocolDriver<T>, url: &str) -> Result<String, AcmeError> {
    let dir = driver
        .directory_url_of(url)
        .ok_or_else(|| AcmeError::Tip(format!("No directory found for {}", url)))?;
    if !driver.directory(&dir)?.supports(AcmeMethod::RevokeCert) {
        return AcmeError::tip("The directory does not advertise revokeCert");
    }
    Ok(dir)
}

/// A stored certificate URL or a PEM file path.
fn certificate_text(store: &ResourceStore, cert: &str) -> Result<String, AcmeError> {
    if let Some(Value::String(pem)) = store.get(cert).and_then(|r| r.resource.as_ref()) {
        return Ok(pem.clone());
    }
    Ok(fs::read_to_string(cert)?)
}

fn identifiers(cfg: &AcmeCfg) -> Vec<Identifier> {
    let dns = cfg.list("dns").into_iter().map(|d| Identifier::dns(&d));
    let ip = cfg.list("ip").into_iter().map(|i| Identifier::ip(&i));
    dns.chain(ip).collect()
}

fn mailto(contact: &str) -> String {
    if contact.contains(':') {
        contact.to_string()
    } else {
        format!("{}{}", MAILTO, contact)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypt::base64_decode;
    use crate::HttpResponse;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Answers every request with an empty 200 and keeps the POST bodies.
    #[derive(Default)]
    struct Recorder {
        posts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Transport for Recorder {
        async fn get(&self, _url: &str) -> Result<HttpResponse, AcmeError> {
            Ok(HttpResponse { status: 200, headers: Vec::new(), body: String::new() })
        }
        async fn head(&self, url: &str) -> Result<HttpResponse, AcmeError> {
            self.get(url).await
        }
        async fn post_jose(&self, _url: &str, body: String) -> Result<HttpResponse, AcmeError> {
            self.posts.lock().unwrap().push(body);
            Ok(HttpResponse { status: 200, headers: Vec::new(), body: String::new() })
        }
    }

    fn account_driver() -> ProtocolDriver<Recorder> {
        let mut s = ResourceStore::in_memory();
        s.put("https://ca/dir", "CA", ResourceType::Directory, "", Some(json!({"newNonce": "https://ca/nonce"})), None)
            .unwrap();
        s.put("https://ca/acct/1", "", ResourceType::Account, "https://ca/dir", Some(json!({})), Some("key1"))
            .unwrap();
        ProtocolDriver::new(Recorder::default(), KeyStore::in_memory(), s)
    }

    fn cfg(list: &[&str]) -> AcmeCfg {
        let args: Vec<String> = list.iter().map(|s| s.to_string()).collect();
        AcmeCfg::new(&args).unwrap()
    }

    #[test]
    fn parse_all_commands() {
        for (s, c) in [("key-change", Command::KeyChange), ("dir", Command::Directory), ("tree", Command::Tree)] {
            assert_eq!(Command::parse(s).unwrap(), c);
        }
        assert!(Command::parse("renew").is_err());
    }

    #[test]
    fn contacts_get_mailto() {
        assert_eq!(mailto("a@b.c"), "mailto:a@b.c");
        assert_eq!(mailto("mailto:a@b.c"), "mailto:a@b.c");
    }

    #[test]
    fn dns_and_ip_identifiers() {
        let c = cfg(&["cmd=order", "dir=/tmp/x", "dns=a.com,b.com", "ip=10.0.0.1"]);
        let ids = identifiers(&c);
        assert_eq!(ids.len(), 3);
        assert_eq!(ids[2], Identifier::ip("10.0.0.1"));
        assert_eq!(serde_json::to_value(&ids[0]).unwrap(), json!({"type": "dns", "value": "a.com"}));
    }

    #[test]
    fn directory_target_prefers_url() {
        let c = cfg(&["cmd=directory", "dir=/tmp/x", "ca=pebble"]);
        assert_eq!(
            directory_target(&c).unwrap(),
            ("https://localhost:14000/dir".to_string(), "Pebble".to_string())
        );
        let c = cfg(&["cmd=directory", "dir=/tmp/x", "url=https://ca/dir", "name=Mine"]);
        assert_eq!(directory_target(&c).unwrap(), ("https://ca/dir".to_string(), "Mine".to_string()));
        let c = cfg(&["cmd=directory", "dir=/tmp/x", "ca=nope"]);
        assert!(directory_target(&c).is_err());
    }

    #[test]
    fn tree_outline() {
        let mut s = ResourceStore::in_memory();
        s.put("https://ca/dir", "CA", ResourceType::Directory, "", Some(json!({})), None).unwrap();
        s.put("https://ca/acct/1", "", ResourceType::Account, "https://ca/dir", Some(json!({"status": "valid"})), None)
            .unwrap();
        s.put("https://ca/authz/1", "", ResourceType::Authorization, "https://ca/acct/1", None, None).unwrap();
        assert_eq!(
            render_tree(&s),
            "CA [directory] \n  https://ca/acct/1 [account] valid\n    https://ca/authz/1 [authorization] ?\n"
        );
    }

    #[test]
    fn certificate_from_store_or_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.pem");
        fs::write(&path, "PEMFILE").unwrap();
        let mut s = ResourceStore::in_memory();
        s.put("https://ca/cert/1", "", ResourceType::Certificate, "", Some(json!("PEMSTORE")), None).unwrap();
        assert_eq!(certificate_text(&s, "https://ca/cert/1").unwrap(), "PEMSTORE");
        assert_eq!(certificate_text(&s, path.to_str().unwrap()).unwrap(), "PEMFILE");
    }

    #[tokio::test]
    async fn empty_pool_fails_without_sending() {
        let mut d = account_driver();
        let ex = d.compose_reload("https://ca/acct/1").unwrap();
        let c = cfg(&["cmd=reload", "dir=/tmp/x"]);
        assert!(matches!(perform(&c, &mut d, ex).await, Err(AcmeError::NonceExhausted(_))));
        assert!(d.transport().posts.lock().unwrap().is_empty());
        assert_eq!(d.nonces.len("https://ca/dir"), 0);
    }

    #[tokio::test]
    async fn protected_file_is_sent_verbatim() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("protected.json");
        let header = r#"{"alg":"ES256","kid":"https://ca/acct/1","nonce":"forged","url":"https://ca/elsewhere"}"#;
        fs::write(&path, format!("{}\n", header)).unwrap();

        let mut d = account_driver();
        d.nonces.deposit("https://ca/dir", "n1");
        let ex = d.compose_reload("https://ca/acct/1").unwrap();
        let c = cfg(&["cmd=reload", "dir=/tmp/x", &format!("protected={}", path.display())]);
        perform(&c, &mut d, ex).await.unwrap();

        let posts = d.transport().posts.lock().unwrap();
        assert_eq!(posts.len(), 1);
        let sent: Value = serde_json::from_str(&posts[0]).unwrap();
        let protected = base64_decode(sent["protected"].as_str().unwrap()).unwrap();
        assert_eq!(protected, header.as_bytes());
    }
}
