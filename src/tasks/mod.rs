//! Task orchestration.
//!
//! A task runs a named multi-stage procedure against one target entity:
//!
//! - [`TaskRecord`] is the persisted program counter
//! - [`TaskProcedure`] declares the stages and runs them
//! - [`TaskEngine`] schedules stages on a worker pool and resumes them
//!   when remote operations or child tasks complete
//! - [`recover_stale`] deals with tasks abandoned by a restart

mod builtin;
mod context;
mod engine;
mod procedure;
mod recovery;
mod types;

pub use builtin::{
    CONTAINER_SYNC_TASK, CREATE_TASK, ContainerSyncTask, DELETE_TASK, EntityCreateTask,
    EntityDeleteTask, EntitySyncStatusTask, SYNC_STATUS_TASK,
};
pub use context::{StageContext, TaskServices};
pub use engine::{
    DEFAULT_REMOTE_DEADLINE_SECS, DEFAULT_STALE_TASK_SECS, DEFAULT_WORKERS, EngineSettings,
    TaskEngine, TaskHandle,
};
pub use procedure::{StageInput, TaskProcedure, TaskRegistry};
pub use recovery::{RecoveryReport, recover_stale};
pub use types::{
    AwaitKind, Awaiting, StageTransition, TaskOutcome, TaskRecord, TaskTarget, UserContext,
};

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::Arc;
    use std::time::Duration;

    use super::{EngineSettings, TaskEngine, TaskRegistry, TaskServices, TaskTarget};
    use crate::audit::AuditLog;
    use crate::driver::DriverRegistry;
    use crate::provider::{ExternalObservation, InMemoryProvider, ProviderRegistry};
    use crate::reconciler::ReconciliationEngine;
    use crate::state::{Entity, EntityStatus, MemoryStore, ProviderKind, ResourceKind, ResourceStore, ScopeRef};

    /// Upper bound for waiting on a task in tests.
    pub const WAIT: Duration = Duration::from_secs(5);

    /// An engine over an in-memory store and provider, with one bound VM
    /// (`i-1`) as the default target.
    pub struct Fixture {
        pub store: Arc<MemoryStore>,
        pub provider: Arc<InMemoryProvider>,
        pub engine: TaskEngine,
        pub scope: ScopeRef,
        pub target: TaskTarget,
    }

    impl Fixture {
        pub async fn builtin() -> Self {
            Self::build(TaskRegistry::with_builtins(), EngineSettings::default()).await
        }

        pub async fn with_registry(registry: TaskRegistry, remote_deadline: Duration) -> Self {
            let settings = EngineSettings {
                remote_deadline,
                ..EngineSettings::default()
            };
            Self::build(registry, settings).await
        }

        async fn build(registry: TaskRegistry, settings: EngineSettings) -> Self {
            let store = Arc::new(MemoryStore::new());
            let provider = Arc::new(InMemoryProvider::new());
            let mut providers = ProviderRegistry::new();
            providers.register(ProviderKind::Aws, provider.clone());

            let scope = ScopeRef::new(ProviderKind::Aws, "acct", "us-east-1");
            provider.put(&scope, ExternalObservation::new(ResourceKind::Vm, "i-1", "web"));
            let mut vm = Entity::new(ResourceKind::Vm, scope.clone(), "web");
            vm.external_id = Some(String::from("i-1"));
            vm.status = EntityStatus::Available;
            let vm = store.insert(vm).await.expect("insert target");

            let services = TaskServices {
                store: store.clone(),
                providers: providers.clone(),
                drivers: Arc::new(DriverRegistry::with_defaults()),
                audit: AuditLog::new(store.clone()),
                reconciler: Arc::new(
                    ReconciliationEngine::new(store.clone(), providers).with_task_store(store.clone()),
                ),
            };
            let engine = TaskEngine::new(store.clone(), registry, services, settings);

            Self {
                store,
                provider,
                engine,
                scope,
                target: TaskTarget::of(&vm),
            }
        }
    }
}
