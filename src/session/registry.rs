use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::errors::SessionError;
use crate::orchestrator::Orchestrator;

/// In-process map of sessions that currently have a running orchestrator.
/// At most one orchestrator per session id.
#[derive(Default)]
pub struct ActiveSessions {
    inner: Mutex<HashMap<Uuid, Arc<Orchestrator>>>,
}

impl ActiveSessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Orchestrator>>> {
        // The map holds no invariants a panicking holder could break.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register an orchestrator, failing when one is already running for the
    /// session or `limit` runs are active.
    pub fn register(&self, orchestrator: Arc<Orchestrator>, limit: usize) -> Result<(), SessionError> {
        let mut map = self.lock();
        let id = orchestrator.session_id();
        if map.contains_key(&id) {
            return Err(SessionError::AlreadyActive(id));
        }
        if map.len() >= limit {
            return Err(SessionError::CapacityReached { limit });
        }
        map.insert(id, orchestrator);
        Ok(())
    }

    pub fn lookup(&self, session_id: Uuid) -> Option<Arc<Orchestrator>> {
        self.lock().get(&session_id).cloned()
    }

    pub fn unregister(&self, session_id: Uuid) -> Option<Arc<Orchestrator>> {
        self.lock().remove(&session_id)
    }

    /// Visit every registered orchestrator. The callback runs under the lock
    /// and must not call back into the registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(Uuid, &Orchestrator),
    {
        for (id, orchestrator) in self.lock().iter() {
            f(*id, orchestrator);
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use appforge_common::CapabilityConfig;

    use super::*;
    use crate::capability::CapabilityEnv;
    use crate::llm::{NullSink, ScriptedModel};
    use crate::orchestrator::Capabilities;
    use crate::sandbox::LocalExecutor;

    fn orchestrator(id: Uuid) -> Arc<Orchestrator> {
        let env = CapabilityEnv {
            model: Arc::new(ScriptedModel::new(vec![])),
            runner: Arc::new(LocalExecutor::new(std::env::temp_dir())),
            sink: Arc::new(NullSink),
            lifecycle: None,
        };
        Arc::new(Orchestrator::new(
            id,
            CapabilityConfig::default(),
            Capabilities::standard("m", std::path::Path::new("templates")),
            env,
        ))
    }

    #[test]
    fn test_register_rejects_duplicate() {
        let active = ActiveSessions::new();
        let id = Uuid::new_v4();
        active.register(orchestrator(id), 10).unwrap();
        let err = active.register(orchestrator(id), 10).unwrap_err();
        assert!(matches!(err, SessionError::AlreadyActive(got) if got == id));
        assert_eq!(active.len(), 1);
    }

    #[test]
    fn test_register_respects_limit() {
        let active = ActiveSessions::new();
        active.register(orchestrator(Uuid::new_v4()), 1).unwrap();
        let err = active.register(orchestrator(Uuid::new_v4()), 1).unwrap_err();
        assert!(matches!(err, SessionError::CapacityReached { limit: 1 }));
    }

    #[test]
    fn test_unregister_and_for_each() {
        let active = ActiveSessions::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        active.register(orchestrator(a), 10).unwrap();
        active.register(orchestrator(b), 10).unwrap();

        active.for_each(|_, o| o.abort());
        assert!(active.lookup(a).unwrap().is_aborted());
        assert!(active.lookup(b).unwrap().is_aborted());

        assert!(active.unregister(a).is_some());
        assert!(active.unregister(a).is_none());
        assert!(active.lookup(a).is_none());
        assert_eq!(active.len(), 1);
    }
}
