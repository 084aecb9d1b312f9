//! Certificate format conversion.
//!
//! nginx/apache bundles are PEM passthrough with a sample server snippet;
//! PKCS#12 and JKS containers are produced by shelling out to the
//! `openssl` and `keytool` binaries, which are runtime dependencies of
//! these formats only.

use std::path::Path;
use std::str::FromStr;

use crate::error::{FleetError, Result};

/// Password protecting generated PKCS#12/JKS containers
const EXPORT_PASSWORD: &str = "changeit";

/// Supported output formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertFormat {
    Nginx,
    Apache,
    Pkcs12,
    Jks,
    Iis,
}

impl FromStr for CertFormat {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nginx" => Ok(CertFormat::Nginx),
            "apache" => Ok(CertFormat::Apache),
            "pkcs12" => Ok(CertFormat::Pkcs12),
            "jks" => Ok(CertFormat::Jks),
            "iis" => Ok(CertFormat::Iis),
            other => Err(FleetError::configuration(format!(
                "unsupported certificate format {other:?}"
            ))),
        }
    }
}

/// One file of a converted bundle
#[derive(Debug, Clone)]
pub struct ConvertedFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// A format-specific certificate bundle
#[derive(Debug, Clone)]
pub struct ConvertedCertificate {
    pub format: CertFormat,
    pub files: Vec<ConvertedFile>,
}

/// Produce a bundle for the requested format
pub async fn convert(
    format: CertFormat,
    domain: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<ConvertedCertificate> {
    let files = match format {
        CertFormat::Nginx => vec![
            text_file("fullchain.pem", cert_pem),
            text_file("privkey.pem", key_pem),
            text_file("nginx.conf.sample", &nginx_sample(domain)),
        ],
        CertFormat::Apache => vec![
            text_file("cert.pem", cert_pem),
            text_file("key.pem", key_pem),
            text_file("apache.conf.sample", &apache_sample(domain)),
        ],
        CertFormat::Pkcs12 | CertFormat::Iis => {
            let bundle = pkcs12_bundle(domain, cert_pem, key_pem).await?;
            vec![ConvertedFile {
                name: format!("{domain}.pfx"),
                contents: bundle,
            }]
        }
        CertFormat::Jks => {
            let bundle = jks_bundle(domain, cert_pem, key_pem).await?;
            vec![ConvertedFile {
                name: format!("{domain}.jks"),
                contents: bundle,
            }]
        }
    };
    Ok(ConvertedCertificate { format, files })
}

fn text_file(name: &str, contents: &str) -> ConvertedFile {
    ConvertedFile {
        name: name.to_string(),
        contents: contents.as_bytes().to_vec(),
    }
}

fn nginx_sample(domain: &str) -> String {
    format!(
        "server {{\n    listen 443 ssl;\n    server_name {domain};\n\n    ssl_certificate     /etc/nginx/ssl/fullchain.pem;\n    ssl_certificate_key /etc/nginx/ssl/privkey.pem;\n}}\n"
    )
}

fn apache_sample(domain: &str) -> String {
    format!(
        "<VirtualHost *:443>\n    ServerName {domain}\n    SSLEngine on\n    SSLCertificateFile    /etc/httpd/ssl/cert.pem\n    SSLCertificateKeyFile /etc/httpd/ssl/key.pem\n</VirtualHost>\n"
    )
}

async fn pkcs12_bundle(domain: &str, cert_pem: &str, key_pem: &str) -> Result<Vec<u8>> {
    let workspace = tempfile::tempdir()?;
    let cert_file = workspace.path().join("cert.pem");
    let key_file = workspace.path().join("key.pem");
    let out_file = workspace.path().join("bundle.p12");
    tokio::fs::write(&cert_file, cert_pem).await?;
    tokio::fs::write(&key_file, key_pem).await?;

    run_tool(
        "openssl",
        &[
            "pkcs12",
            "-export",
            "-out",
            path_str(&out_file)?,
            "-inkey",
            path_str(&key_file)?,
            "-in",
            path_str(&cert_file)?,
            "-name",
            domain,
            "-passout",
            &format!("pass:{EXPORT_PASSWORD}"),
        ],
    )
    .await?;

    Ok(tokio::fs::read(&out_file).await?)
}

async fn jks_bundle(domain: &str, cert_pem: &str, key_pem: &str) -> Result<Vec<u8>> {
    let p12 = pkcs12_bundle(domain, cert_pem, key_pem).await?;
    let workspace = tempfile::tempdir()?;
    let p12_file = workspace.path().join("bundle.p12");
    let jks_file = workspace.path().join("bundle.jks");
    tokio::fs::write(&p12_file, &p12).await?;

    run_tool(
        "keytool",
        &[
            "-importkeystore",
            "-srckeystore",
            path_str(&p12_file)?,
            "-srcstoretype",
            "PKCS12",
            "-srcstorepass",
            EXPORT_PASSWORD,
            "-destkeystore",
            path_str(&jks_file)?,
            "-deststoretype",
            "JKS",
            "-deststorepass",
            EXPORT_PASSWORD,
            "-noprompt",
        ],
    )
    .await?;

    Ok(tokio::fs::read(&jks_file).await?)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| FleetError::certificate("non-UTF8 temp path".to_string()))
}

async fn run_tool(tool: &str, args: &[&str]) -> Result<()> {
    let output = tokio::process::Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|e| FleetError::certificate(format!("cannot invoke {tool}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(FleetError::certificate(format!(
            "{tool} failed ({}): {}",
            output.status,
            stderr.trim()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!(CertFormat::from_str("nginx").unwrap(), CertFormat::Nginx);
        assert_eq!(CertFormat::from_str("PKCS12").unwrap(), CertFormat::Pkcs12);
        assert_eq!(CertFormat::from_str("iis").unwrap(), CertFormat::Iis);
        assert!(CertFormat::from_str("der").is_err());
    }

    #[tokio::test]
    async fn test_nginx_bundle_is_pem_passthrough() {
        let bundle = convert(CertFormat::Nginx, "example.com", "CERT-PEM", "KEY-PEM")
            .await
            .unwrap();
        assert_eq!(bundle.files.len(), 3);
        assert_eq!(bundle.files[0].contents, b"CERT-PEM");
        assert_eq!(bundle.files[1].contents, b"KEY-PEM");
        let sample = String::from_utf8(bundle.files[2].contents.clone()).unwrap();
        assert!(sample.contains("server_name example.com"));
    }

    #[tokio::test]
    async fn test_apache_bundle_carries_sample_config() {
        let bundle = convert(CertFormat::Apache, "example.com", "CERT", "KEY")
            .await
            .unwrap();
        let sample = String::from_utf8(bundle.files[2].contents.clone()).unwrap();
        assert!(sample.contains("ServerName example.com"));
    }
}
