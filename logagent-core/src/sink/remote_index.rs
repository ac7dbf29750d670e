//! Remote log index sink: groups records by label set into
//! streams, serializes to the `{streams: [...]}` wire format, compresses,
//! and POSTs with retry on 429/5xx. Built on the same `reqwest` client
//! style used for the other outbound HTTP calls in this crate, generalized
//! from a GET-oriented client into an authenticated batch push.

use std::collections::BTreeMap;
use std::io::{BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Identity};
use rustls::ClientConfig;
use rustls_pki_types::CertificateDer;
use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::record::Record;

use super::Sink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    None,
    Gzip,
    Snappy,
    Zstd,
}

impl CompressionKind {
    fn content_encoding(&self) -> Option<&'static str> {
        match self {
            CompressionKind::None => None,
            CompressionKind::Gzip => Some("gzip"),
            CompressionKind::Snappy => Some("snappy"),
            CompressionKind::Zstd => Some("zstd"),
        }
    }

    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        match self {
            CompressionKind::None => Ok(bytes.to_vec()),
            CompressionKind::Gzip => {
                let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(bytes)?;
                encoder.finish().map_err(AgentError::Io)
            }
            CompressionKind::Snappy => {
                let mut encoder = snap::write::FrameEncoder::new(Vec::new());
                encoder.write_all(bytes)?;
                encoder
                    .into_inner()
                    .map_err(|e| AgentError::Internal(format!("snappy encode: {e}")))
            }
            CompressionKind::Zstd => {
                zstd::stream::encode_all(bytes, 0).map_err(AgentError::Io)
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIndexConfig {
    pub endpoint: String,
    #[serde(default)]
    pub auth_bearer_token: Option<String>,
    #[serde(default = "default_compression")]
    pub compression: CompressionKind,
    /// Switch to the heavier compressor once a batch's uncompressed size
    /// crosses this threshold.
    #[serde(default = "default_large_batch_bytes")]
    pub large_batch_bytes: usize,
    #[serde(default = "default_large_batch_compression")]
    pub large_batch_compression: CompressionKind,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(with = "humantime_serde", default = "default_backoff_base")]
    pub backoff_base: Duration,
    /// Client certificate for mTLS. Requires `client_key_path`.
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    #[serde(default)]
    pub client_key_path: Option<PathBuf>,
    /// Private CA used to verify the remote index's server certificate;
    /// when unset, the endpoint is expected to present a publicly-trusted
    /// certificate and the client falls back to `reqwest`'s default roots.
    #[serde(default)]
    pub ca_cert_path: Option<PathBuf>,
}

fn default_compression() -> CompressionKind {
    CompressionKind::Gzip
}

fn default_large_batch_bytes() -> usize {
    1_048_576
}

fn default_large_batch_compression() -> CompressionKind {
    CompressionKind::Zstd
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(200)
}

#[derive(Serialize)]
struct PushPayload {
    streams: Vec<StreamEntry>,
}

#[derive(Serialize)]
struct StreamEntry {
    stream: BTreeMap<String, String>,
    values: Vec<[String; 2]>,
}

#[derive(Debug)]
pub struct RemoteIndexSink {
    name: String,
    config: RemoteIndexConfig,
    client: Client,
}

impl RemoteIndexSink {
    pub fn new(name: impl Into<String>, config: RemoteIndexConfig, client: Client) -> Self {
        RemoteIndexSink { name: name.into(), config, client }
    }

    /// Builds the `reqwest::Client` a [`RemoteIndexSink`] should use,
    /// applying mTLS when `config` names a client cert/key. A custom
    /// `ca_cert_path` also pins server verification to a private root
    /// instead of `reqwest`'s built-in trust store, via a hand-built
    /// `rustls::ClientConfig` (`reqwest`'s own `Identity`/`Certificate`
    /// knobs can't express "trust only this CA" on their own).
    pub fn build_client(config: &RemoteIndexConfig) -> Result<Client> {
        let builder = Client::builder();

        let builder = match (&config.ca_cert_path, &config.client_cert_path, &config.client_key_path) {
            (None, None, None) => builder,
            (None, Some(cert_path), Some(key_path)) => {
                let identity = Self::load_identity(cert_path, key_path)?;
                builder.identity(identity)
            }
            (Some(ca_path), client_cert, client_key) => {
                let tls_config = Self::build_rustls_config(ca_path, client_cert.as_deref(), client_key.as_deref())?;
                builder.use_preconfigured_tls(tls_config)
            }
            (None, _, _) => {
                return Err(AgentError::Internal("remote_index mTLS requires both client_cert_path and client_key_path".into()));
            }
        };

        builder.build().map_err(|e| AgentError::Internal(format!("failed to build remote_index client: {e}")))
    }

    fn load_identity(cert_path: &std::path::Path, key_path: &std::path::Path) -> Result<Identity> {
        let mut pem = std::fs::read(cert_path)?;
        pem.extend_from_slice(&std::fs::read(key_path)?);
        Identity::from_pem(&pem).map_err(|e| AgentError::Internal(format!("invalid client identity for remote_index: {e}")))
    }

    fn load_root_store(ca_path: &std::path::Path) -> Result<rustls::RootCertStore> {
        let mut reader = BufReader::new(std::fs::File::open(ca_path)?);
        let certs: std::result::Result<Vec<CertificateDer<'static>>, _> = rustls_pemfile::certs(&mut reader).collect();
        let certs = certs.map_err(|e| AgentError::Internal(format!("invalid CA bundle at {}: {e}", ca_path.display())))?;
        let mut store = rustls::RootCertStore::empty();
        for cert in certs {
            store.add(cert).map_err(|e| AgentError::Internal(format!("invalid CA certificate: {e}")))?;
        }
        Ok(store)
    }

    fn load_client_auth_cert(cert_path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
        let mut reader = BufReader::new(std::fs::File::open(cert_path)?);
        rustls_pemfile::certs(&mut reader)
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| AgentError::Internal(format!("invalid client certificate at {}: {e}", cert_path.display())))
    }

    fn load_client_auth_key(key_path: &std::path::Path) -> Result<rustls_pki_types::PrivateKeyDer<'static>> {
        let mut reader = BufReader::new(std::fs::File::open(key_path)?);
        rustls_pemfile::private_key(&mut reader)
            .map_err(|e| AgentError::Internal(format!("invalid client key at {}: {e}", key_path.display())))?
            .ok_or_else(|| AgentError::Internal(format!("no private key found at {}", key_path.display())))
    }

    fn build_rustls_config(
        ca_path: &std::path::Path,
        client_cert: Option<&std::path::Path>,
        client_key: Option<&std::path::Path>,
    ) -> Result<ClientConfig> {
        let roots = Self::load_root_store(ca_path)?;
        let builder = ClientConfig::builder().with_root_certificates(roots);

        let config = match (client_cert, client_key) {
            (Some(cert_path), Some(key_path)) => {
                let certs = Self::load_client_auth_cert(cert_path)?;
                let key = Self::load_client_auth_key(key_path)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| AgentError::Internal(format!("invalid client auth cert/key: {e}")))?
            }
            _ => builder.with_no_client_auth(),
        };
        Ok(config)
    }

    fn group_by_labels(records: &[Arc<Record>]) -> Vec<StreamEntry> {
        let mut groups: BTreeMap<Vec<(String, String)>, Vec<[String; 2]>> = BTreeMap::new();
        for record in records {
            let mut labels: Vec<(String, String)> =
                record.labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
            labels.sort();
            let ts_ns = record.timestamp.timestamp_nanos_opt().unwrap_or(0).to_string();
            groups.entry(labels).or_default().push([ts_ns, record.payload.as_str().to_string()]);
        }
        groups
            .into_iter()
            .map(|(labels, values)| StreamEntry { stream: labels.into_iter().collect(), values })
            .collect()
    }

    fn choose_compression(&self, uncompressed_len: usize) -> CompressionKind {
        if uncompressed_len >= self.config.large_batch_bytes {
            self.config.large_batch_compression
        } else {
            self.config.compression
        }
    }

    fn classify_status(status: reqwest::StatusCode) -> Option<AgentError> {
        if status.is_success() {
            None
        } else if status.as_u16() == 429 || status.is_server_error() {
            Some(AgentError::SinkTransient { sink: "remote_index".into(), message: status.to_string() })
        } else {
            Some(AgentError::SinkPermanent { sink: "remote_index".into(), message: status.to_string() })
        }
    }
}

#[async_trait]
impl Sink for RemoteIndexSink {
    async fn send(&self, records: &[Arc<Record>]) -> Result<()> {
        let payload = PushPayload { streams: Self::group_by_labels(records) };
        let body = serde_json::to_vec(&payload)?;
        let compression = self.choose_compression(body.len());
        let compressed = compression.compress(&body)?;

        let mut attempt = 0u32;
        loop {
            let mut req = self.client.post(&self.config.endpoint).body(compressed.clone());
            if let Some(encoding) = compression.content_encoding() {
                req = req.header("content-encoding", encoding);
            }
            if let Some(token) = &self.config.auth_bearer_token {
                req = req.bearer_auth(token);
            }

            let result = req.send().await;
            match result {
                Ok(resp) => {
                    if let Some(err) = Self::classify_status(resp.status()) {
                        if err.is_retryable() && attempt < self.config.max_retries {
                            tokio::time::sleep(self.config.backoff_base * 2u32.pow(attempt)).await;
                            attempt += 1;
                            continue;
                        }
                        return Err(err);
                    }
                    return Ok(());
                }
                Err(e) => {
                    if attempt < self.config.max_retries {
                        tokio::time::sleep(self.config.backoff_base * 2u32.pow(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(AgentError::SinkTransient { sink: "remote_index".into(), message: e.to_string() });
                }
            }
        }
    }

    fn is_healthy(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{Cursor, SourceType};

    #[test]
    fn groups_records_by_identical_label_set() {
        let mut a = Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 0 }, b"one", chrono::Utc::now());
        a.labels.set("app", "web");
        let mut b = Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 4 }, b"two", chrono::Utc::now());
        b.labels.set("app", "web");
        let mut c = Record::new(SourceType::File, "a.log", Cursor::File { inode: 1, byte_offset: 8 }, b"three", chrono::Utc::now());
        c.labels.set("app", "db");

        let records = vec![Arc::new(a), Arc::new(b), Arc::new(c)];
        let streams = RemoteIndexSink::group_by_labels(&records);
        assert_eq!(streams.len(), 2);
        let web_stream = streams.iter().find(|s| s.stream.get("app").map(String::as_str) == Some("web")).unwrap();
        assert_eq!(web_stream.values.len(), 2);
    }

    #[test]
    fn large_batch_switches_compressor() {
        let config = RemoteIndexConfig {
            endpoint: "http://localhost".into(),
            auth_bearer_token: None,
            compression: CompressionKind::Gzip,
            large_batch_bytes: 10,
            large_batch_compression: CompressionKind::Zstd,
            max_retries: 0,
            backoff_base: Duration::from_millis(1),
            client_cert_path: None,
            client_key_path: None,
            ca_cert_path: None,
        };
        let sink = RemoteIndexSink::new("remote", config, Client::new());
        assert_eq!(sink.choose_compression(5), CompressionKind::Gzip);
        assert_eq!(sink.choose_compression(50), CompressionKind::Zstd);
    }

    // A fixed self-signed cert/key pair for `localhost`, used only to
    // exercise the TLS config plumbing; never presented over the network.
    const TEST_CERT_PEM: &str = include_str!("test_fixtures/remote_index_client.crt");
    const TEST_KEY_PEM: &str = include_str!("test_fixtures/remote_index_client.key");

    fn write_self_signed_pair(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf) {
        let cert_path = dir.join("client.crt");
        let key_path = dir.join("client.key");
        std::fs::write(&cert_path, TEST_CERT_PEM).unwrap();
        std::fs::write(&key_path, TEST_KEY_PEM).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn build_client_with_ca_and_client_cert_produces_a_preconfigured_tls_client() {
        let dir = tempfile::tempdir().unwrap();
        let (cert_path, key_path) = write_self_signed_pair(dir.path());
        // A self-signed cert doubles as its own "CA" bundle for this check.
        let ca_path = cert_path.clone();

        let config = RemoteIndexConfig {
            endpoint: "https://localhost".into(),
            auth_bearer_token: None,
            compression: CompressionKind::None,
            large_batch_bytes: default_large_batch_bytes(),
            large_batch_compression: CompressionKind::None,
            max_retries: 0,
            backoff_base: Duration::from_millis(1),
            client_cert_path: Some(cert_path),
            client_key_path: Some(key_path),
            ca_cert_path: Some(ca_path),
        };

        RemoteIndexSink::build_client(&config).expect("mTLS-configured client should build");
    }

    #[test]
    fn build_client_without_tls_fields_falls_back_to_defaults() {
        let config = RemoteIndexConfig {
            endpoint: "https://localhost".into(),
            auth_bearer_token: None,
            compression: CompressionKind::None,
            large_batch_bytes: default_large_batch_bytes(),
            large_batch_compression: CompressionKind::None,
            max_retries: 0,
            backoff_base: Duration::from_millis(1),
            client_cert_path: None,
            client_key_path: None,
            ca_cert_path: None,
        };

        RemoteIndexSink::build_client(&config).expect("plain client should build");
    }
}
