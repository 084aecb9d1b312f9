//! Remote deployment over SSH.
//!
//! One session per deploy: ensure the remote directory, stream the
//! certificate then the key through `cat`, and run each post-deploy
//! command in a fresh channel with the injected PATH and best-effort
//! profile sourcing. Host keys are accepted by default; strict mode pins
//! the presented key's SHA-256 fingerprint.

use std::path::Path;
use std::sync::Arc;

use russh::client::{self, AuthResult, Handler};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey, decode_secret_key};
use russh::{ChannelMsg, Disconnect};

use crate::deploy::{certificate_material, shell_prelude, shell_quote};
use crate::error::{FleetError, Result};
use crate::types::{DomainCert, RemoteDeployConfig};

struct HostKeyPolicy {
    strict: bool,
    pinned: Option<String>,
}

impl Handler for HostKeyPolicy {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        if !self.strict {
            return Ok(true);
        }
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256).to_string();
        match &self.pinned {
            Some(pinned) if *pinned == fingerprint => Ok(true),
            _ => {
                tracing::error!(
                    presented = %fingerprint,
                    "remote host key does not match the pinned fingerprint"
                );
                Ok(false)
            }
        }
    }
}

/// Upload the certificate pair and run the post-deploy commands
pub async fn deploy(config: &RemoteDeployConfig, cert: &DomainCert) -> Result<()> {
    let (cert_bytes, key_bytes) = certificate_material(cert).await?;

    let handle = connect(config).await?;
    upload(&handle, &config.cert_path, &cert_bytes, "644").await?;
    upload(&handle, &config.key_path, &key_bytes, "600").await?;
    tracing::info!(
        domain = %cert.domain,
        host = %config.host,
        cert = %config.cert_path,
        "certificate deployed over SSH"
    );

    for command in &config.post_commands {
        let line = format!("{}; {}", shell_prelude(), command);
        let (code, _stdout, stderr) = exec(&handle, &line, None).await?;
        if code != 0 {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "", "en")
                .await;
            return Err(FleetError::deploy(format!(
                "remote post-deploy command {command:?} failed (exit status: {code}): {}",
                stderr.trim()
            )));
        }
    }

    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await;
    Ok(())
}

/// Pre-flight: connect, authenticate, and run a harmless echo
pub async fn probe(config: &RemoteDeployConfig) -> Result<()> {
    let handle = connect(config).await?;
    let (code, stdout, _stderr) = exec(&handle, "echo certfleet-probe", None).await?;
    let _ = handle
        .disconnect(Disconnect::ByApplication, "", "en")
        .await;
    if code != 0 || !stdout.contains("certfleet-probe") {
        return Err(FleetError::deploy(format!(
            "ssh probe on {} failed (exit status: {code})",
            config.host
        )));
    }
    Ok(())
}

async fn connect(config: &RemoteDeployConfig) -> Result<client::Handle<HostKeyPolicy>> {
    let ssh_config = Arc::new(client::Config::default());
    let handler = HostKeyPolicy {
        strict: config.strict_host_key,
        pinned: config.host_fingerprint.clone(),
    };
    let mut handle = client::connect(ssh_config, (config.host.as_str(), config.port), handler)
        .await
        .map_err(|e| {
            FleetError::deploy(format!(
                "ssh connect {}:{} failed: {e}",
                config.host, config.port
            ))
        })?;

    let result = if let Some(password) = &config.password {
        handle
            .authenticate_password(&config.username, password)
            .await
            .map_err(|e| FleetError::deploy(format!("ssh password auth: {e}")))?
    } else if let Some(pem) = &config.private_key {
        let key = decode_secret_key(pem, None)
            .map_err(|e| FleetError::deploy(format!("ssh private key: {e}")))?;
        handle
            .authenticate_publickey(
                &config.username,
                PrivateKeyWithHashAlg::new(Arc::new(key), None),
            )
            .await
            .map_err(|e| FleetError::deploy(format!("ssh public key auth: {e}")))?
    } else {
        return Err(FleetError::configuration(
            "remote deploy config requires a password or a private key",
        ));
    };

    if !matches!(result, AuthResult::Success) {
        return Err(FleetError::deploy(format!(
            "ssh authentication rejected for {}@{}",
            config.username, config.host
        )));
    }
    Ok(handle)
}

async fn upload(
    handle: &client::Handle<HostKeyPolicy>,
    path: &str,
    contents: &[u8],
    mode: &str,
) -> Result<()> {
    let quoted = shell_quote(path);
    let dir = Path::new(path)
        .parent()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "/".to_string());
    let command = format!(
        "mkdir -p {} && cat > {quoted} && chmod {mode} {quoted}",
        shell_quote(&dir)
    );
    let (code, _stdout, stderr) = exec(handle, &command, Some(contents)).await?;
    if code != 0 {
        return Err(FleetError::deploy(format!(
            "upload of {path} failed (exit status: {code}): {}",
            stderr.trim()
        )));
    }
    Ok(())
}

async fn exec(
    handle: &client::Handle<HostKeyPolicy>,
    command: &str,
    stdin: Option<&[u8]>,
) -> Result<(u32, String, String)> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| FleetError::deploy(format!("ssh channel open: {e}")))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| FleetError::deploy(format!("ssh exec: {e}")))?;
    if let Some(data) = stdin {
        channel
            .data(data)
            .await
            .map_err(|e| FleetError::deploy(format!("ssh data stream: {e}")))?;
        channel
            .eof()
            .await
            .map_err(|e| FleetError::deploy(format!("ssh eof: {e}")))?;
    }

    let mut code = None;
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => {
                stderr.extend_from_slice(data)
            }
            ChannelMsg::ExitStatus { exit_status } => code = Some(exit_status),
            _ => {}
        }
    }
    // A channel that closes without reporting a status (dropped
    // connection, command killed by signal) must not read as success.
    let code = code.ok_or_else(|| {
        FleetError::deploy(format!(
            "ssh channel closed without an exit status for {command:?}: {}",
            String::from_utf8_lossy(&stderr).trim()
        ))
    })?;
    Ok((
        code,
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}
