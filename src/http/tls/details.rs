//! Negotiated TLS session parameters
//!
//! Captured once the handshake completes and exposed through
//! `IoSession::tls_details`, mainly for the ALPN protocol the negotiator acts
//! on and for session verifiers.

use openssl::nid::Nid;
use openssl::ssl::{NameType, SslRef};
use openssl::x509::{X509NameRef, X509Ref};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Summary of one certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Subject common name
    pub subject: String,
    /// Issuer common name
    pub issuer: String,
    /// `DNS:` and `IP:` subject alternative names
    pub subject_alt_names: Vec<String>,
}

impl CertInfo {
    pub fn from_x509(cert: &X509Ref) -> Self {
        CertInfo {
            subject: common_name(cert.subject_name()),
            issuer: common_name(cert.issuer_name()),
            subject_alt_names: alt_names(cert),
        }
    }
}

fn common_name(name: &X509NameRef) -> String {
    name.entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().to_string().ok())
        .unwrap_or_default()
}

fn alt_names(cert: &X509Ref) -> Vec<String> {
    let Some(names) = cert.subject_alt_names() else {
        return Vec::new();
    };
    names
        .iter()
        .filter_map(|name| {
            if let Some(dns) = name.dnsname() {
                return Some(format!("DNS:{}", dns));
            }
            let ip = name.ipaddress()?;
            let addr = match ip.len() {
                4 => IpAddr::V4(Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3])),
                16 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(ip);
                    IpAddr::V6(Ipv6Addr::from(octets))
                }
                _ => return None,
            };
            Some(format!("IP:{}", addr))
        })
        .collect()
}

/// Parameters of an established TLS session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsDetails {
    /// Protocol version, e.g. `TLSv1.3`
    pub version: String,
    pub cipher: String,
    /// SNI name sent by the client
    pub servername: Option<String>,
    /// ALPN protocol selected during the handshake
    pub alpn: Option<String>,
    pub session_reused: bool,
    /// Peer certificate followed by its chain
    pub peer_certificates: Vec<CertInfo>,
}

impl TlsDetails {
    pub fn from_ssl(ssl: &SslRef) -> Self {
        let mut peer_certificates = Vec::new();
        if let Some(cert) = ssl.peer_certificate() {
            peer_certificates.push(CertInfo::from_x509(&cert));
        }
        if let Some(chain) = ssl.peer_cert_chain() {
            for cert in chain {
                let info = CertInfo::from_x509(cert);
                if peer_certificates.first() != Some(&info) {
                    peer_certificates.push(info);
                }
            }
        }

        TlsDetails {
            version: ssl.version_str().to_string(),
            cipher: ssl
                .current_cipher()
                .map(|c| c.name().to_string())
                .unwrap_or_default(),
            servername: ssl.servername(NameType::HOST_NAME).map(str::to_string),
            alpn: ssl
                .selected_alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
            session_reused: ssl.session_reused(),
            peer_certificates,
        }
    }

    /// Subject of the peer certificate, if the peer sent one
    pub fn peer_subject(&self) -> Option<&str> {
        self.peer_certificates.first().map(|c| c.subject.as_str())
    }
}
