use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use appforge_common::{AppStatus, ContainerPhase};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::actor::{LifecycleDeps, LifecycleHandle};
use super::machine::{ContainerEvent, is_serving};
use crate::errors::ContainerError;

/// How long restart waits for the dev processes to come down.
const RESTART_STOP_TIMEOUT: Duration = Duration::from_secs(30);
/// How long shutdown waits for each container to be removed.
const SHUTDOWN_DESTROY_TIMEOUT: Duration = Duration::from_secs(15);

/// One session's machine. `app_requested` is set once the user asked for
/// the app to run; such a container outlives the generation that made it.
struct Slot {
    handle: LifecycleHandle,
    app_requested: bool,
}

/// Registry of lifecycle machines, at most one per session, capped globally.
pub struct ContainerRegistry {
    deps: Arc<LifecycleDeps>,
    sandbox_root: PathBuf,
    max_containers: usize,
    machines: Mutex<HashMap<Uuid, Slot>>,
}

impl ContainerRegistry {
    pub fn new(deps: Arc<LifecycleDeps>, sandbox_root: PathBuf, max_containers: usize) -> Self {
        Self {
            deps,
            sandbox_root,
            max_containers,
            machines: Mutex::new(HashMap::new()),
        }
    }

    pub fn sandbox_dir(&self, session_id: Uuid) -> PathBuf {
        self.sandbox_root.join(session_id.to_string())
    }

    /// Handle of the session's live machine, if any.
    pub async fn get(&self, session_id: Uuid) -> Option<LifecycleHandle> {
        let machines = self.machines.lock().await;
        machines
            .get(&session_id)
            .map(|slot| &slot.handle)
            .filter(|h| !h.phase().is_terminal())
            .cloned()
    }

    pub async fn status(&self, session_id: Uuid) -> Option<AppStatus> {
        self.machines
            .lock()
            .await
            .get(&session_id)
            .map(|slot| slot.handle.status())
    }

    /// Number of machines not yet stopped or failed.
    pub async fn active_count(&self) -> usize {
        let mut machines = self.machines.lock().await;
        prune(&mut machines);
        machines.len()
    }

    /// Get the session's machine, creating and provisioning one when there is
    /// none. Creation only happens under the registry lock, so two callers
    /// can never both create a container for the same session.
    pub async fn ensure(&self, session_id: Uuid) -> Result<LifecycleHandle, ContainerError> {
        let mut machines = self.machines.lock().await;
        prune(&mut machines);
        if let Some(slot) = machines.get(&session_id) {
            return Ok(slot.handle.clone());
        }
        if machines.len() >= self.max_containers {
            return Err(ContainerError::CapacityReached {
                limit: self.max_containers,
            });
        }

        let handle = LifecycleHandle::spawn(
            session_id,
            self.sandbox_dir(session_id),
            self.deps.clone(),
        );
        handle.send(ContainerEvent::Create { auto_install: false })?;
        machines.insert(
            session_id,
            Slot {
                handle: handle.clone(),
                app_requested: false,
            },
        );
        info!(session_id = %session_id, active = machines.len(), "container machine registered");
        Ok(handle)
    }

    /// Bring the session's app up: create the container when missing, then
    /// install and start the dev servers.
    pub async fn start_app(&self, session_id: Uuid) -> Result<AppStatus, ContainerError> {
        let mut machines = self.machines.lock().await;
        prune(&mut machines);

        if let Some(slot) = machines.get_mut(&session_id) {
            slot.app_requested = true;
            let handle = &slot.handle;
            match handle.phase() {
                ContainerPhase::Ready => handle.send(ContainerEvent::InstallDeps)?,
                phase => info!(session_id = %session_id, state = phase.as_str(), "app already starting or running"),
            }
            return Ok(handle.status());
        }

        if machines.len() >= self.max_containers {
            return Err(ContainerError::CapacityReached {
                limit: self.max_containers,
            });
        }
        let handle = LifecycleHandle::spawn(
            session_id,
            self.sandbox_dir(session_id),
            self.deps.clone(),
        );
        handle.send(ContainerEvent::Create { auto_install: true })?;
        machines.insert(
            session_id,
            Slot {
                handle: handle.clone(),
                app_requested: true,
            },
        );
        info!(session_id = %session_id, active = machines.len(), "container machine registered");
        Ok(handle.status())
    }

    /// Stop the dev servers but keep the container.
    pub async fn stop_app(&self, session_id: Uuid) -> Result<AppStatus, ContainerError> {
        let handle = self
            .get(session_id)
            .await
            .ok_or(ContainerError::NotFound(session_id))?;
        if is_serving(handle.phase()) || handle.phase() == ContainerPhase::Installing {
            handle.send(ContainerEvent::StopServer)?;
        }
        Ok(handle.status())
    }

    /// Stop the dev servers and run install and start again.
    pub async fn restart_app(&self, session_id: Uuid) -> Result<AppStatus, ContainerError> {
        let Some(handle) = self.get(session_id).await else {
            return self.start_app(session_id).await;
        };
        let phase = handle.phase();
        if is_serving(phase) || phase == ContainerPhase::Installing {
            handle.send(ContainerEvent::StopServer)?;
        }
        handle
            .wait_for(|p| p == ContainerPhase::Ready || p.is_terminal(), RESTART_STOP_TIMEOUT)
            .await?;
        if handle.phase() == ContainerPhase::Ready {
            handle.send(ContainerEvent::InstallDeps)?;
            return Ok(handle.status());
        }
        // The machine failed while stopping; start from scratch.
        self.start_app(session_id).await
    }

    /// Destroy the session's container and forget its machine.
    pub async fn destroy(&self, session_id: Uuid) -> Result<(), ContainerError> {
        let slot = self.machines.lock().await.remove(&session_id);
        match slot {
            Some(slot) => teardown(slot.handle).await,
            None => Ok(()),
        }
    }

    /// Called when a generation ends. Destroys the session's container
    /// unless the user asked for the app to run. The slot is freed before
    /// the container is gone.
    pub async fn release(&self, session_id: Uuid) -> Result<(), ContainerError> {
        let slot = {
            let mut machines = self.machines.lock().await;
            let generation_only = machines.get(&session_id).is_some_and(|slot| !slot.app_requested);
            if generation_only {
                machines.remove(&session_id)
            } else {
                None
            }
        };
        let Some(slot) = slot else {
            return Ok(());
        };
        info!(session_id = %session_id, "releasing generation container");
        teardown(slot.handle).await
    }

    /// Destroy every container. Used on process shutdown.
    pub async fn shutdown(&self) {
        let handles: Vec<LifecycleHandle> = self.machines.lock().await.drain().map(|(_, slot)| slot.handle).collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "destroying containers");
        let waits = handles.into_iter().map(|handle| async move {
            if handle.send(ContainerEvent::Destroy).is_err() {
                return;
            }
            if let Err(e) = handle
                .wait_for(|p| p == ContainerPhase::Stopped, SHUTDOWN_DESTROY_TIMEOUT)
                .await
            {
                warn!(session_id = %handle.session_id(), error = %e, "container did not stop cleanly");
            }
        });
        futures::future::join_all(waits).await;
    }
}

/// Drop machines that reached a terminal state. Their containers are already
/// gone and their ports released.
fn prune(machines: &mut HashMap<Uuid, Slot>) {
    machines.retain(|_, slot| !slot.handle.phase().is_terminal());
}

async fn teardown(handle: LifecycleHandle) -> Result<(), ContainerError> {
    if handle.phase().is_terminal() {
        return Ok(());
    }
    handle.send(ContainerEvent::Destroy)?;
    handle
        .wait_for(|p| p == ContainerPhase::Stopped, SHUTDOWN_DESTROY_TIMEOUT)
        .await?;
    Ok(())
}
