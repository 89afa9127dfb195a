//! SSH port forwards for schedulers that are only reachable through a
//! gateway host.
//!
//! A [`TunnelPool`] hands out one [`TunnelGuard`] at a time. With SSH
//! settings the guard owns an `ssh -N -L` child process that is killed when
//! the guard drops; without them the guard only holds the permit, so calls
//! to a directly reachable scheduler are serialized the same way.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::process::{Child, Command};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::{FacilityError, FacilityResult};
use crate::config::TunnelSettings;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct TunnelPool {
    permits: Arc<Semaphore>,
    settings: Option<TunnelSettings>,
}

/// An open tunnel. Dropping it closes the tunnel and frees the pool.
pub struct TunnelGuard {
    child: Option<Child>,
    _permit: OwnedSemaphorePermit,
}

impl TunnelPool {
    /// Pool for a scheduler reachable without a tunnel.
    pub fn direct() -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            settings: None,
        }
    }

    pub fn ssh(settings: TunnelSettings) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(1)),
            settings: Some(settings),
        }
    }

    pub fn from_settings(settings: Option<TunnelSettings>) -> Self {
        settings.map_or_else(Self::direct, Self::ssh)
    }

    pub fn is_direct(&self) -> bool {
        self.settings.is_none()
    }

    /// Wait for the pool, then open the tunnel.
    pub async fn acquire(&self) -> FacilityResult<TunnelGuard> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| FacilityError::Tunnel(e.to_string()))?;

        let child = match &self.settings {
            None => None,
            Some(settings) => Some(open(settings).await?),
        };
        Ok(TunnelGuard {
            child,
            _permit: permit,
        })
    }
}

fn ssh_command(settings: &TunnelSettings) -> Command {
    let mut cmd = Command::new("ssh");
    cmd.arg("-N")
        .arg("-o")
        .arg("ExitOnForwardFailure=yes")
        .arg("-o")
        .arg("BatchMode=yes")
        .arg("-p")
        .arg(settings.ssh_port.to_string())
        .arg("-L")
        .arg(format!(
            "{}:{}:{}",
            settings.local_port, settings.remote_host, settings.remote_port
        ));
    if let Some(identity) = &settings.identity_file {
        cmd.arg("-i").arg(identity);
    }
    cmd.arg(format!("{}@{}", settings.ssh_user, settings.ssh_host))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    cmd
}

/// Fails when something already listens on `port`, since the readiness
/// probe below could not tell that listener from the forward.
async fn ensure_port_free(port: u16) -> FacilityResult<()> {
    TcpListener::bind(("127.0.0.1", port))
        .await
        .map(drop)
        .map_err(|e| FacilityError::Tunnel(format!("local port {port} is already in use: {e}")))
}

fn exited(child: &mut Child) -> Option<FacilityError> {
    match child.try_wait() {
        Ok(Some(status)) => Some(FacilityError::Tunnel(format!("ssh exited with {status}"))),
        Ok(None) => None,
        Err(e) => Some(FacilityError::Tunnel(format!("cannot poll ssh: {e}"))),
    }
}

async fn open(settings: &TunnelSettings) -> FacilityResult<Child> {
    ensure_port_free(settings.local_port).await?;
    let mut child = ssh_command(settings)
        .spawn()
        .map_err(|e| FacilityError::Tunnel(format!("failed to start ssh: {e}")))?;
    log::debug!(
        "Opening tunnel localhost:{} -> {}:{} via {}",
        settings.local_port,
        settings.remote_host,
        settings.remote_port,
        settings.ssh_host
    );

    let deadline = Instant::now() + Duration::from_secs(settings.startup_timeout_secs);
    loop {
        if let Some(err) = exited(&mut child) {
            return Err(err);
        }
        if TcpStream::connect(("127.0.0.1", settings.local_port)).await.is_ok() {
            // The forward answered; make sure it is still ours.
            match exited(&mut child) {
                Some(err) => return Err(err),
                None => return Ok(child),
            }
        }
        if Instant::now() >= deadline {
            let _ = child.start_kill();
            return Err(FacilityError::Tunnel(format!(
                "port {} not forwarded after {}s",
                settings.local_port, settings.startup_timeout_secs
            )));
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if let Err(e) = child.start_kill() {
                log::warn!("Failed to close ssh tunnel: {}", e);
            }
        }
    }
}
