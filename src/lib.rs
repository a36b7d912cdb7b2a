pub mod acme;
pub mod challenge;
mod cmd;
pub mod crypt;
pub mod jws;
pub mod keystore;
pub mod nonce;
pub mod store;

use chrono::Local;
use fs2::FileExt;
use log::{debug, info, Level, LevelFilter, Log, Record};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

pub use cmd::Command;

const URL_LE: &str = "https://acme-v02.api.letsencrypt.org/directory";
const URL_LE_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";
const URL_ZERO: &str = "https://acme.zerossl.com/v2/DV90";
const URL_GOOGLE_TRUST: &str = "https://dv.acme-v02.api.pki.goog/directory";
const URL_PEBBLE: &str = "https://localhost:14000/dir";

const DIR_DATA_DEFAULT: &str = "/.acme-poke";
const PATH_KEYS: &str = "keys.json";
const PATH_RESOURCES: &str = "resources.json";
const PATH_LOCK: &str = ".lock";

pub const DEFAULT_KEY: &str = "key1";
pub const HEADER_REPLAY_NONCE: &str = "replay-nonce";
pub const HEADER_LOCATION: &str = "location";

const PEM_REGEX: &str = r"-----BEGIN [A-Z ]+-----([\s\S]*?)-----END [A-Z ]+-----";

const LOG_LEVEL_DEAULT: LevelFilter = LevelFilter::Info;
const CONTENT_TYPE_JSON: &str = "application/jose+json";
const USER_AGENT: HeaderValue = HeaderValue::from_static("acme-poke");
const TIMEOUT_SEC_30: Duration = Duration::from_secs(30);

const FMT_LOCAL_TIME: &str = "%m/%d %H:%M:%S%.3f"; // 07/08 09:53:37.520

const TIP_MISSING_CMD: &str = "Missing parameter 'cmd'";
const TIP_MISSING_HOME: &str = "Missing parameter 'dir' and $HOME is not set";
const TIP_REGEX_FAILED: &str = "Match Regex Failed.";

pub async fn run(cfg: &AcmeCfg) -> Result<(), AcmeError> {
    log::set_max_level(cfg.log_level);
    create_dir(&cfg.data_dir)?;
    let _lock = DataLock::acquire(&cfg.data_dir)?;
    cmd::run(cfg).await
}

/// Exclusive lock on the data directory, held from loading the stores until
/// the last write. Released on drop.
pub struct DataLock {
    file: fs::File,
}

impl DataLock {
    pub fn acquire(data_dir: &Path) -> Result<Self, AcmeError> {
        let file = open_lock(data_dir)?;
        if file.try_lock_exclusive().is_err() {
            info!("Another acme-poke is using {:?}, waiting", data_dir);
            file.lock_exclusive()?;
        }
        Ok(DataLock { file })
    }

    /// `None` while another process holds the lock.
    pub fn try_acquire(data_dir: &Path) -> Result<Option<Self>, AcmeError> {
        let file = open_lock(data_dir)?;
        Ok(file.try_lock_exclusive().ok().map(|_| DataLock { file }))
    }
}

fn open_lock(data_dir: &Path) -> Result<fs::File, AcmeError> {
    Ok(fs::OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(data_dir.join(PATH_LOCK))?)
}

impl Drop for DataLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

pub struct AcmeLogger;
impl Log for AcmeLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= Level::Trace
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        // connection chatter from the http stack
        if ["hyper", "reqwest", "rustls", "h2"].iter().any(|t| record.target().starts_with(t)) {
            return;
        }
        let f = record
            .file()
            .map(|f| Path::new(f).file_name().and_then(|s| s.to_str()).unwrap_or(""))
            .unwrap_or("unknown file");
        let now_local = Local::now().format(FMT_LOCAL_TIME);
        // stdout carries command output
        eprintln!(
            "{} {:5} [{}:{}] - {}",
            now_local,
            record.level(),
            f,
            record.line().unwrap_or(0),
            record.args()
        );
    }

    fn flush(&self) {}
}

/// Arguments come as `key=value`, e.g. `cmd=order url=https://ca/acct/1 dns=a.com,b.com`.
#[derive(Debug)]
pub struct AcmeCfg {
    cmd: Command,
    data_dir: PathBuf,
    log_level: LevelFilter,
    insecure: bool,
    dry: bool,
    params: HashMap<String, String>,
}

impl AcmeCfg {
    pub fn new(args: &[String]) -> Result<Self, AcmeError> {
        let map: HashMap<String, String> = args
            .iter()
            .filter_map(|arg| arg.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let cmd = Command::parse(map.get("cmd").ok_or_else(|| AcmeError::Tip(TIP_MISSING_CMD.to_string()))?)?;

        let data_dir = match map.get("dir") {
            Some(d) => PathBuf::from(d),
            None => {
                let home = std::env::var("HOME").map_err(|_| AcmeError::Tip(TIP_MISSING_HOME.to_string()))?;
                PathBuf::from(format!("{}{}", home, DIR_DATA_DEFAULT))
            }
        };

        let log_level = match map.get("log") {
            Some(level) => match level.to_lowercase().as_str() {
                "warn" => LevelFilter::Warn,
                "info" => LevelFilter::Info,
                "debug" => LevelFilter::Debug,
                "trace" => LevelFilter::Trace,
                _ => LOG_LEVEL_DEAULT,
            },
            _ => LOG_LEVEL_DEAULT,
        };

        Ok(AcmeCfg {
            cmd,
            data_dir,
            log_level,
            insecure: is_set(map.get("insecure")),
            dry: is_set(map.get("dry")),
            params: map,
        })
    }

    pub fn cmd(&self) -> Command {
        self.cmd
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn keys_path(&self) -> PathBuf {
        self.data_dir.join(PATH_KEYS)
    }

    pub fn resources_path(&self) -> PathBuf {
        self.data_dir.join(PATH_RESOURCES)
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(|s| s.as_str()).filter(|s| !s.is_empty())
    }

    pub fn required(&self, key: &str) -> Result<&str, AcmeError> {
        self.param(key)
            .ok_or_else(|| AcmeError::Tip(format!("Missing parameter '{}'", key)))
    }

    pub fn flag(&self, key: &str) -> bool {
        is_set(self.params.get(key))
    }

    /// Comma separated list, empty items dropped.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.param(key)
            .map(|s| s.split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
            .unwrap_or_default()
    }
}

fn is_set(v: Option<&String>) -> bool {
    matches!(v.map(|s| s.as_str()), Some("1" | "true" | "yes"))
}

#[derive(Debug)]
pub enum AcmeError {
    KeyGeneration(String),
    Signing(String),
    NonceExhausted(String),
    Transport(reqwest::Error),
    Protocol { status: u16, body: String },
    IoError(std::io::Error),
    SerdeJsonError(serde_json::Error),
    RegexError(regex::Error),
    Tip(String),
}

impl From<reqwest::Error> for AcmeError {
    fn from(error: reqwest::Error) -> Self {
        AcmeError::Transport(error)
    }
}
impl From<std::io::Error> for AcmeError {
    fn from(error: std::io::Error) -> Self {
        AcmeError::IoError(error)
    }
}
impl From<serde_json::Error> for AcmeError {
    fn from(error: serde_json::Error) -> Self {
        AcmeError::SerdeJsonError(error)
    }
}
impl From<regex::Error> for AcmeError {
    fn from(error: regex::Error) -> Self {
        AcmeError::RegexError(error)
    }
}

impl fmt::Display for AcmeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcmeError::KeyGeneration(e) => write!(f, "Key generation failed: {}", e),
            AcmeError::Signing(e) => write!(f, "Signing failed: {}", e),
            AcmeError::NonceExhausted(dir) => {
                write!(f, "No nonce left for {}. Run cmd=nonce url={} first", dir, dir)
            }
            AcmeError::Transport(e) => write!(f, "Transport: {}", e),
            AcmeError::Protocol { status, body } => write!(f, "Server replied {}:\n{}", status, body),
            AcmeError::IoError(e) => e.fmt(f),
            AcmeError::SerdeJsonError(e) => e.fmt(f),
            AcmeError::RegexError(e) => e.fmt(f),
            AcmeError::Tip(e) => f.write_str(e),
        }
    }
}

impl std::error::Error for AcmeError {}

impl AcmeError {
    fn tip<T>(s: &str) -> Result<T, AcmeError> {
        Err(AcmeError::Tip(s.to_string()))
    }
}

/// Directory presets selectable with `ca=`.
trait CA {
    fn name(&self) -> &'static str;
    fn directory_url(&self) -> &'static str;
}
struct LetsEncrypt;
struct LetsEncryptStaging;
struct ZeroSSL;
struct GoogleTrustServices;
struct Pebble;

impl CA for LetsEncrypt {
    fn name(&self) -> &'static str {
        "Let's Encrypt"
    }
    fn directory_url(&self) -> &'static str {
        URL_LE
    }
}
impl CA for LetsEncryptStaging {
    fn name(&self) -> &'static str {
        "Let's Encrypt (Staging)"
    }
    fn directory_url(&self) -> &'static str {
        URL_LE_STAGING
    }
}
impl CA for ZeroSSL {
    fn name(&self) -> &'static str {
        "ZeroSSL"
    }
    fn directory_url(&self) -> &'static str {
        URL_ZERO
    }
}
impl CA for GoogleTrustServices {
    fn name(&self) -> &'static str {
        "Google Trust Services"
    }
    fn directory_url(&self) -> &'static str {
        URL_GOOGLE_TRUST
    }
}
impl CA for Pebble {
    fn name(&self) -> &'static str {
        "Pebble"
    }
    fn directory_url(&self) -> &'static str {
        URL_PEBBLE
    }
}

enum AcmeCa {
    LetsEncrypt(Box<dyn CA>),
    LetsEncryptStaging(Box<dyn CA>),
    ZeroSSL(Box<dyn CA>),
    GoogleTrustServices(Box<dyn CA>),
    Pebble(Box<dyn CA>),
}

impl fmt::Debug for AcmeCa {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AcmeCa({})", self.name())
    }
}

impl AcmeCa {
    fn new(ca_type: &str) -> Option<Self> {
        Some(match ca_type {
            "le" => AcmeCa::LetsEncrypt(Box::new(LetsEncrypt)),
            "le-staging" | "staging" => AcmeCa::LetsEncryptStaging(Box::new(LetsEncryptStaging)),
            "z" | "zero" => AcmeCa::ZeroSSL(Box::new(ZeroSSL)),
            "g" | "gts" => AcmeCa::GoogleTrustServices(Box::new(GoogleTrustServices)),
            "pebble" => AcmeCa::Pebble(Box::new(Pebble)),
            _ => return None,
        })
    }
    fn name(&self) -> &'static str {
        self.ca().name()
    }
    fn directory_url(&self) -> &'static str {
        self.ca().directory_url()
    }
    fn ca(&self) -> &dyn CA {
        match self {
            AcmeCa::LetsEncrypt(ca) => ca.as_ref(),
            AcmeCa::LetsEncryptStaging(ca) => ca.as_ref(),
            AcmeCa::ZeroSSL(ca) => ca.as_ref(),
            AcmeCa::GoogleTrustServices(ca) => ca.as_ref(),
            AcmeCa::Pebble(ca) => ca.as_ref(),
        }
    }
}

fn create_dir(dir_path: &Path) -> Result<(), AcmeError> {
    if !dir_path.exists() {
        debug!("Created path: {:?}", dir_path);
        fs::create_dir_all(dir_path)?;
    }
    Ok(())
}

/// Replaces the file in one step: a crash leaves either the old or the new content.
fn write_file(path: &Path, s: &[u8]) -> Result<(), AcmeError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        create_dir(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, s).map_err(|e| AcmeError::Tip(format!("Write failed: {:?}. {}", tmp, e)))?;
    fs::rename(&tmp, path)?;
    debug!("Write to {:?}", path);
    Ok(())
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug)]
enum Method {
    POST,
    GET,
    HEAD,
}

async fn http_request(
    client: &reqwest::Client,
    url: &str,
    body: Option<String>,
    method: Method,
) -> Result<HttpResponse, AcmeError> {
    let start = Instant::now();
    debug!("==> HTTP {:?}: {}\nbody: {:?}", &method, url, &body);

    let mut header_map = HeaderMap::new();
    header_map.append("User-Agent", USER_AGENT);
    let cb = match method {
        Method::GET => client.get(url),
        Method::HEAD => client.head(url),
        Method::POST => {
            header_map.append(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
            client.post(url).body(body.unwrap_or_default())
        }
    };
    let response = cb.headers(header_map).timeout(TIMEOUT_SEC_30).send().await?;

    let status = response.status().as_u16();
    let headers: Vec<(String, String)> = response
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    debug!(
        "<== Response: {}, duration: {:.1}s. Header: {:?}",
        status,
        start.elapsed().as_secs_f32(),
        headers
    );

    let body = response.text().await?;
    debug!("<== Response: {}", body);
    Ok(HttpResponse { status, headers, body })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn cfg_parses_key_values() {
        let cfg = AcmeCfg::new(&args(&["cmd=order", "dir=/tmp/poke", "dns=a.com, b.com,", "dry=1", "log=debug"])).unwrap();
        assert_eq!(cfg.cmd(), Command::Order);
        assert_eq!(cfg.keys_path(), PathBuf::from("/tmp/poke/keys.json"));
        assert_eq!(cfg.list("dns"), vec!["a.com", "b.com"]);
        assert!(cfg.dry);
        assert!(!cfg.insecure);
        assert_eq!(cfg.log_level(), LevelFilter::Debug);
        assert!(matches!(cfg.required("url"), Err(AcmeError::Tip(_))));
    }

    #[test]
    fn cfg_requires_known_cmd() {
        assert!(matches!(AcmeCfg::new(&args(&["dir=/tmp"])), Err(AcmeError::Tip(_))));
        assert!(matches!(AcmeCfg::new(&args(&["cmd=issue", "dir=/tmp"])), Err(AcmeError::Tip(_))));
    }

    #[test]
    fn ca_presets() {
        assert_eq!(AcmeCa::new("le").unwrap().directory_url(), URL_LE);
        assert_eq!(AcmeCa::new("pebble").unwrap().directory_url(), URL_PEBBLE);
        assert_eq!(AcmeCa::new("zero").unwrap().name(), "ZeroSSL");
        assert!(AcmeCa::new("nope").is_none());
    }

    #[test]
    fn header_lookup_ignores_case() {
        let res = HttpResponse {
            status: 201,
            headers: vec![("Replay-Nonce".to_string(), "abc".to_string())],
            body: String::new(),
        };
        assert_eq!(res.header(HEADER_REPLAY_NONCE), Some("abc"));
        assert_eq!(res.header(HEADER_LOCATION), None);
        assert!(res.is_success());
    }

    #[test]
    fn write_file_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("f.json");
        write_file(&path, b"one").unwrap();
        write_file(&path, b"two").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "two");
        assert!(!dir.path().join("nested").join("f.json.tmp").exists());
    }

    #[test]
    fn data_lock_is_exclusive_until_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let held = DataLock::acquire(dir.path()).unwrap();
        assert!(dir.path().join(PATH_LOCK).exists());
        assert!(DataLock::try_acquire(dir.path()).unwrap().is_none());
        drop(held);
        assert!(DataLock::try_acquire(dir.path()).unwrap().is_some());
    }
}
