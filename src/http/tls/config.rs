//! TLS configuration
//!
//! Client and server builders collect settings and only touch OpenSSL in
//! `build()`, so every failure surfaces there as a [`TlsError`].

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::ex_data::Index;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::ssl::{AlpnError, Ssl, SslContext, SslContextBuilder, SslMethod, SslVerifyMode, SslVersion};
use openssl::x509::extension::SubjectAlternativeName;
use openssl::x509::{X509NameBuilder, X509};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

/// TLS protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub fn to_openssl_version(&self) -> SslVersion {
        match self {
            TlsVersion::Tls10 => SslVersion::TLS1,
            TlsVersion::Tls11 => SslVersion::TLS1_1,
            TlsVersion::Tls12 => SslVersion::TLS1_2,
            TlsVersion::Tls13 => SslVersion::TLS1_3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::Tls10 => "TLSv1",
            TlsVersion::Tls11 => "TLSv1.1",
            TlsVersion::Tls12 => "TLSv1.2",
            TlsVersion::Tls13 => "TLSv1.3",
        }
    }
}

impl FromStr for TlsVersion {
    type Err = TlsError;

    /// Case-insensitive, with or without the `v`
    fn from_str(s: &str) -> Result<Self, TlsError> {
        match s.to_uppercase().as_str() {
            "TLSV1.0" | "TLS1.0" | "TLSV1" | "TLS1" => Ok(TlsVersion::Tls10),
            "TLSV1.1" | "TLS1.1" => Ok(TlsVersion::Tls11),
            "TLSV1.2" | "TLS1.2" => Ok(TlsVersion::Tls12),
            "TLSV1.3" | "TLS1.3" => Ok(TlsVersion::Tls13),
            _ => Err(TlsError::InvalidVersion(s.to_string())),
        }
    }
}

/// Client certificate verification mode (server side)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientVerify {
    #[default]
    None,
    /// Request a certificate but accept clients without one
    Optional,
    Required,
}

/// TLS errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum TlsError {
    #[error("OpenSSL error: {0}")]
    OpenSsl(#[from] openssl::error::ErrorStack),

    #[error("I/O error: {0}")]
    Io(#[source] Arc<io::Error>),

    #[error("Invalid TLS version: {0}")]
    InvalidVersion(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Session rejected: {0}")]
    Rejected(String),
}

impl From<io::Error> for TlsError {
    fn from(err: io::Error) -> Self {
        TlsError::Io(Arc::new(err))
    }
}

/// Immutable TLS context shared by every session that uses it
#[derive(Clone)]
pub struct TlsConfig {
    ctx: SslContext,
    is_server: bool,
    servername: Option<String>,
    verify_peer: bool,
    alpn: Vec<String>,
    alpn_index: Option<Index<Ssl, Vec<String>>>,
}

impl TlsConfig {
    pub fn client() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn server() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// Default SNI name for client sessions
    pub fn servername(&self) -> Option<&str> {
        self.servername.as_deref()
    }

    /// ALPN protocols configured on the builder
    pub fn alpn_protocols(&self) -> &[String] {
        &self.alpn
    }

    /// Create the SSL object for one session.
    ///
    /// `sni` overrides the configured servername. A non-empty `alpn` replaces
    /// the configured protocol list: offered by clients, accepted by servers.
    pub(crate) fn new_ssl(&self, sni: Option<&str>, alpn: &[&str]) -> Result<Ssl, TlsError> {
        let mut ssl = Ssl::new(&self.ctx)?;
        if self.is_server {
            if let (Some(index), false) = (self.alpn_index, alpn.is_empty()) {
                ssl.set_ex_data(index, alpn.iter().map(|p| p.to_string()).collect());
            }
            return Ok(ssl);
        }

        if let Some(host) = sni.or(self.servername.as_deref()) {
            ssl.set_hostname(host)?;
            if self.verify_peer {
                ssl.param_mut().set_host(host)?;
            }
        }
        let protocols: Vec<&str> = if alpn.is_empty() {
            self.alpn.iter().map(String::as_str).collect()
        } else {
            alpn.to_vec()
        };
        if !protocols.is_empty() {
            ssl.set_alpn_protos(&encode_alpn(&protocols)?)?;
        }
        Ok(ssl)
    }
}

/// Length-prefixed ALPN wire list
fn encode_alpn(protocols: &[&str]) -> Result<Vec<u8>, TlsError> {
    let mut wire = Vec::new();
    for protocol in protocols {
        let len = u8::try_from(protocol.len())
            .ok()
            .filter(|len| *len > 0)
            .ok_or_else(|| TlsError::InvalidConfig(format!("invalid ALPN protocol {:?}", protocol)))?;
        wire.push(len);
        wire.extend_from_slice(protocol.as_bytes());
    }
    Ok(wire)
}

/// First protocol of `preferred` the client offered in `client_protos`
fn select_alpn<'a>(preferred: &[String], client_protos: &'a [u8]) -> Option<&'a [u8]> {
    let mut offered = Vec::new();
    let mut pos = 0;
    while pos < client_protos.len() {
        let len = client_protos[pos] as usize;
        let end = pos + 1 + len;
        if end > client_protos.len() {
            break;
        }
        offered.push(&client_protos[pos + 1..end]);
        pos = end;
    }
    preferred
        .iter()
        .find_map(|p| offered.iter().find(|o| **o == p.as_bytes()).copied())
}

/// Settings shared by both builders
#[derive(Debug, Default, Clone)]
struct CommonSettings {
    min_version: Option<TlsVersion>,
    max_version: Option<TlsVersion>,
    cipher_list: Option<String>,
    ciphersuites: Option<String>,
    alpn: Vec<String>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    ca_file: Option<PathBuf>,
}

impl CommonSettings {
    fn apply(&self, ctx: &mut SslContextBuilder) -> Result<bool, TlsError> {
        ctx.set_min_proto_version(self.min_version.map(|v| v.to_openssl_version()))?;
        ctx.set_max_proto_version(self.max_version.map(|v| v.to_openssl_version()))?;
        if let Some(ciphers) = &self.cipher_list {
            ctx.set_cipher_list(ciphers)?;
        }
        if let Some(suites) = &self.ciphersuites {
            ctx.set_ciphersuites(suites)?;
        }
        if let Some(ca) = &self.ca_file {
            ctx.set_ca_file(ca)?;
        }
        match &self.cert_file {
            Some(cert) => {
                let (cert, key) = load_identity(cert, self.key_file.as_deref())?;
                ctx.set_certificate(&cert)?;
                ctx.set_private_key(&key)?;
                ctx.check_private_key()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Load a certificate and its key; without `key_file` both come from `cert_file`
fn load_identity(cert_file: &Path, key_file: Option<&Path>) -> Result<(X509, PKey<Private>), TlsError> {
    let cert_pem = fs::read(cert_file)?;
    let cert = X509::from_pem(&cert_pem)
        .map_err(|e| TlsError::Certificate(format!("{}: {}", cert_file.display(), e)))?;
    let key_pem = match key_file {
        Some(path) => fs::read(path)?,
        None => cert_pem,
    };
    let key = PKey::private_key_from_pem(&key_pem)
        .map_err(|e| TlsError::Certificate(format!("private key: {}", e)))?;
    Ok((cert, key))
}

/// Ephemeral self-signed P-256 certificate for `localhost`
pub fn self_signed_identity() -> Result<(X509, PKey<Private>), TlsError> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = PKey::from_ec_key(EcKey::generate(&group)?)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, "localhost")?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let serial = serial.to_asn1_integer()?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&serial)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    let not_before = Asn1Time::days_from_now(0)?;
    let not_after = Asn1Time::days_from_now(365)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;
    let san = SubjectAlternativeName::new()
        .dns("localhost")
        .ip("127.0.0.1")
        .build(&builder.x509v3_context(None, None))?;
    builder.append_extension(san)?;
    builder.sign(&key, MessageDigest::sha256())?;
    Ok((builder.build(), key))
}

/// Client configuration builder
#[derive(Debug, Default, Clone)]
pub struct ClientConfigBuilder {
    common: CommonSettings,
    servername: Option<String>,
    verify_peer: bool,
}

impl ClientConfigBuilder {
    /// Pin the protocol to one version
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.common.min_version = Some(min);
        self.common.max_version = Some(max);
        self
    }

    /// Cipher list for TLS 1.2 and below
    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.common.cipher_list = Some(ciphers.into());
        self
    }

    /// Cipher suites for TLS 1.3
    pub fn ciphersuites(mut self, suites: impl Into<String>) -> Self {
        self.common.ciphersuites = Some(suites.into());
        self
    }

    /// Protocols offered through ALPN unless a session overrides them
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.common.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn servername(mut self, name: impl Into<String>) -> Self {
        self.servername = Some(name.into());
        self
    }

    /// Verify the server certificate chain and host name
    pub fn verify_peer(mut self, verify: bool) -> Self {
        self.verify_peer = verify;
        self
    }

    pub fn ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.ca_file = Some(path.into());
        self
    }

    /// Client certificate; the PEM file may also hold the key
    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.cert_file = Some(path.into());
        self
    }

    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.key_file = Some(path.into());
        self
    }

    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_client())?;
        self.common.apply(&mut ctx)?;
        if self.verify_peer {
            if self.common.ca_file.is_none() {
                ctx.set_default_verify_paths()?;
            }
            ctx.set_verify(SslVerifyMode::PEER);
        } else {
            ctx.set_verify(SslVerifyMode::NONE);
        }
        encode_alpn(&self.common.alpn.iter().map(String::as_str).collect::<Vec<_>>())?;

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: false,
            servername: self.servername,
            verify_peer: self.verify_peer,
            alpn: self.common.alpn,
            alpn_index: None,
        })
    }
}

/// Server configuration builder
#[derive(Debug, Default, Clone)]
pub struct ServerConfigBuilder {
    common: CommonSettings,
    client_verify: ClientVerify,
}

impl ServerConfigBuilder {
    /// Pin the protocol to one version
    pub fn version(self, version: TlsVersion) -> Self {
        self.version_range(version, version)
    }

    pub fn version_range(mut self, min: TlsVersion, max: TlsVersion) -> Self {
        self.common.min_version = Some(min);
        self.common.max_version = Some(max);
        self
    }

    pub fn cipher_list(mut self, ciphers: impl Into<String>) -> Self {
        self.common.cipher_list = Some(ciphers.into());
        self
    }

    pub fn ciphersuites(mut self, suites: impl Into<String>) -> Self {
        self.common.ciphersuites = Some(suites.into());
        self
    }

    /// Protocols accepted through ALPN, in order of preference
    pub fn alpn(mut self, protocols: &[&str]) -> Self {
        self.common.alpn = protocols.iter().map(|p| p.to_string()).collect();
        self
    }

    /// Server certificate; the PEM file may also hold the key.
    ///
    /// Without one, `build()` generates a self-signed certificate.
    pub fn cert_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.cert_file = Some(path.into());
        self
    }

    pub fn key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.key_file = Some(path.into());
        self
    }

    pub fn client_verify(mut self, mode: ClientVerify) -> Self {
        self.client_verify = mode;
        self
    }

    /// CA bundle used to verify client certificates
    pub fn client_verify_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.common.ca_file = Some(path.into());
        self
    }

    pub fn build(self) -> Result<TlsConfig, TlsError> {
        let mut ctx = SslContextBuilder::new(SslMethod::tls_server())?;
        if !self.common.apply(&mut ctx)? {
            let (cert, key) = self_signed_identity()?;
            ctx.set_certificate(&cert)?;
            ctx.set_private_key(&key)?;
        }
        ctx.set_verify(match self.client_verify {
            ClientVerify::None => SslVerifyMode::NONE,
            ClientVerify::Optional => SslVerifyMode::PEER,
            ClientVerify::Required => SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT,
        });

        let index = Ssl::new_ex_index::<Vec<String>>()?;
        let configured = self.common.alpn.clone();
        ctx.set_alpn_select_callback(move |ssl, client_protos| {
            let selected = match ssl.ex_data(index) {
                Some(protocols) => select_alpn(protocols, client_protos),
                None => select_alpn(&configured, client_protos),
            };
            selected.ok_or(AlpnError::NOACK)
        });

        Ok(TlsConfig {
            ctx: ctx.build(),
            is_server: true,
            servername: None,
            verify_peer: self.client_verify != ClientVerify::None,
            alpn: self.common.alpn,
            alpn_index: Some(index),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_tls_version_parsing() {
        assert_eq!("TLSv1.2".parse::<TlsVersion>().unwrap(), TlsVersion::Tls12);
        assert_eq!("tlsv1.3".parse::<TlsVersion>().unwrap(), TlsVersion::Tls13);
        assert_eq!("TLS1.0".parse::<TlsVersion>().unwrap(), TlsVersion::Tls10);
        assert!("SSLv3".parse::<TlsVersion>().is_err());
    }

    #[test]
    fn test_client_config_builder() {
        let config = TlsConfig::client()
            .version(TlsVersion::Tls13)
            .servername("example.com")
            .alpn(&["h2", "http/1.1"])
            .build()
            .unwrap();

        assert!(!config.is_server());
        assert_eq!(config.servername(), Some("example.com"));
        assert_eq!(config.alpn_protocols(), ["h2", "http/1.1"]);
        assert!(config.new_ssl(None, &[]).is_ok());
        assert!(config.new_ssl(Some("other.example"), &["h2"]).is_ok());
    }

    #[test]
    fn test_invalid_alpn_rejected() {
        let long = "x".repeat(300);
        assert!(TlsConfig::client().alpn(&[long.as_str()]).build().is_err());
        assert!(TlsConfig::client().alpn(&[""]).build().is_err());
    }

    #[test]
    fn test_server_config_with_generated_cert() {
        let config = TlsConfig::server()
            .version_range(TlsVersion::Tls12, TlsVersion::Tls13)
            .client_verify(ClientVerify::Optional)
            .build()
            .unwrap();
        assert!(config.is_server());
        assert!(config.new_ssl(None, &["h2"]).is_ok());
    }

    #[test]
    fn test_server_config_from_pem_file() {
        let (cert, key) = self_signed_identity().unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&cert.to_pem().unwrap()).unwrap();
        file.write_all(&key.private_key_to_pem_pkcs8().unwrap()).unwrap();
        file.flush().unwrap();

        let config = TlsConfig::server().cert_file(file.path()).build();
        assert!(config.is_ok());

        let missing = TlsConfig::server().cert_file("/nonexistent/cert.pem").build();
        assert!(matches!(missing, Err(TlsError::Io(_))));
    }

    #[test]
    fn test_select_alpn_prefers_server_order() {
        let client = b"\x08http/1.1\x02h2";
        let preferred = vec!["h2".to_string(), "http/1.1".to_string()];
        assert_eq!(select_alpn(&preferred, client), Some(&b"h2"[..]));
        assert_eq!(select_alpn(&["h3".to_string()], client), None);
        assert_eq!(select_alpn(&preferred, b"\x05h2"), None);
    }
}
