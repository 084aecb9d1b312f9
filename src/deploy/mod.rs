//! Deployment of issued certificates to downstream consumers.
//!
//! A [`DeployConfig`](crate::types::DeployConfig) resolves to one of three
//! backends: local filesystem, remote host over SSH, or a cloud vendor's
//! SSL platform. Post-deploy commands run under an invoking shell with a
//! standard PATH prepended, profile scripts sourced best-effort, and
//! well-known sysadmin binaries resolved to absolute paths.

pub mod cloud;
pub mod local;
pub mod remote;

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use crate::error::{FleetError, Result};
use crate::types::{DeployConfig, DeployKind, DomainCert};

pub use cloud::{
    CloudApiFactory, CloudJobStatus, CloudResource, CloudSslApi, MockCloudApi, SSL_RESOURCE_TAGS,
};

const STANDARD_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

const PROFILE_SCRIPTS: &[&str] = &[
    "/etc/profile",
    "$HOME/.bash_profile",
    "$HOME/.bashrc",
    "$HOME/.profile",
];

const WELL_KNOWN_BINARIES: &[&str] = &[
    "nginx",
    "httpd",
    "apachectl",
    "openresty",
    "caddy",
    "haproxy",
    "systemctl",
    "service",
    "docker",
];

/// Dispatches deploy configs to their backend
#[derive(Default)]
pub struct Deployer {
    cloud_factories: RwLock<HashMap<String, CloudApiFactory>>,
}

impl Deployer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the adapter factory for a cloud provider tag. Vendor SDKs
    /// stay outside the core; without a registered factory, cloud deploys
    /// for that tag fail with a configuration error.
    pub fn register_cloud_api(&self, provider_tag: &str, factory: CloudApiFactory) {
        self.cloud_factories
            .write()
            .expect("cloud factories")
            .insert(provider_tag.to_string(), factory);
    }

    /// Run one deploy attempt. The caller records the outcome on the
    /// config's `last_deploy_*` fields.
    pub async fn deploy(&self, config: &DeployConfig, cert: &DomainCert) -> Result<()> {
        match config.kind {
            DeployKind::Local => {
                let payload = config.local.as_ref().ok_or_else(|| {
                    FleetError::configuration("local deploy config missing local payload")
                })?;
                local::deploy(payload, cert).await
            }
            DeployKind::Remote => {
                let payload = config.remote.as_ref().ok_or_else(|| {
                    FleetError::configuration("remote deploy config missing remote payload")
                })?;
                remote::deploy(payload, cert).await
            }
            DeployKind::Cloud => {
                let payload = config.cloud.as_ref().ok_or_else(|| {
                    FleetError::configuration("cloud deploy config missing cloud payload")
                })?;
                let api = self.cloud_api(payload)?;
                cloud::deploy(api.as_ref(), payload, cert).await
            }
        }
    }

    /// Non-mutating pre-flight check of a deploy target
    pub async fn probe(&self, config: &DeployConfig) -> Result<()> {
        match config.kind {
            DeployKind::Local => {
                let payload = config.local.as_ref().ok_or_else(|| {
                    FleetError::configuration("local deploy config missing local payload")
                })?;
                local::probe(payload).await
            }
            DeployKind::Remote => {
                let payload = config.remote.as_ref().ok_or_else(|| {
                    FleetError::configuration("remote deploy config missing remote payload")
                })?;
                remote::probe(payload).await
            }
            DeployKind::Cloud => {
                let payload = config.cloud.as_ref().ok_or_else(|| {
                    FleetError::configuration("cloud deploy config missing cloud payload")
                })?;
                self.cloud_api(payload)?.probe().await
            }
        }
    }

    fn cloud_api(
        &self,
        payload: &crate::types::CloudDeployConfig,
    ) -> Result<std::sync::Arc<dyn CloudSslApi>> {
        let factories = self.cloud_factories.read().expect("cloud factories");
        let factory = factories.get(&payload.provider).ok_or_else(|| {
            FleetError::configuration(format!(
                "no cloud SSL adapter registered for provider {:?}",
                payload.provider
            ))
        })?;
        factory(payload)
    }
}

/// Prefer the in-record PEM content; fall back to the referenced paths
pub(crate) async fn certificate_material(cert: &DomainCert) -> Result<(Vec<u8>, Vec<u8>)> {
    let cert_bytes = if cert.cert_pem.is_empty() {
        tokio::fs::read(&cert.cert_path).await?
    } else {
        cert.cert_pem.clone().into_bytes()
    };
    let key_bytes = if cert.key_pem.is_empty() {
        tokio::fs::read(&cert.key_path).await?
    } else {
        cert.key_pem.clone().into_bytes()
    };
    Ok((cert_bytes, key_bytes))
}

/// PATH export plus best-effort profile sourcing, prepended to every
/// post-deploy command
pub(crate) fn shell_prelude() -> String {
    let mut lines = vec![format!("export PATH={STANDARD_PATH}:$PATH")];
    for script in PROFILE_SCRIPTS {
        lines.push(format!("[ -f {script} ] && . {script} >/dev/null 2>&1 || true"));
    }
    lines.join("; ")
}

/// Resolve the command's leading token to an absolute path when it names a
/// well-known sysadmin binary found on the standard PATH
pub(crate) fn resolve_well_known(command: &str) -> String {
    let Some(first) = command.split_whitespace().next() else {
        return command.to_string();
    };
    if !WELL_KNOWN_BINARIES.contains(&first) {
        return command.to_string();
    }
    let search: Vec<String> = STANDARD_PATH
        .split(':')
        .map(str::to_string)
        .chain(
            std::env::var("PATH")
                .unwrap_or_default()
                .split(':')
                .map(str::to_string)
                .collect::<Vec<_>>(),
        )
        .collect();
    for dir in search {
        if dir.is_empty() {
            continue;
        }
        let candidate = Path::new(&dir).join(first);
        if candidate.is_file() {
            return command.replacen(first, &candidate.display().to_string(), 1);
        }
    }
    command.to_string()
}

/// Full shell line for a post-deploy command
pub(crate) fn compose_shell_command(command: &str) -> String {
    format!("{}; {}", shell_prelude(), resolve_well_known(command))
}

/// Quote a path for safe interpolation into a remote shell line
pub(crate) fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prelude_exports_standard_path() {
        let prelude = shell_prelude();
        assert!(prelude.starts_with("export PATH=/usr/local/sbin:"));
        assert!(prelude.contains("/etc/profile"));
    }

    #[test]
    fn test_unknown_commands_pass_through() {
        assert_eq!(resolve_well_known("true"), "true");
        assert_eq!(
            resolve_well_known("my-custom-reload --now"),
            "my-custom-reload --now"
        );
    }

    #[test]
    fn test_compose_keeps_command_last() {
        let composed = compose_shell_command("echo done");
        assert!(composed.ends_with("echo done"));
    }

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("/etc/ssl/a.crt"), "'/etc/ssl/a.crt'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
