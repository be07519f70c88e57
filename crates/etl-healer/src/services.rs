//! Assembles the shared components from a loaded configuration.
//!
//! Each binary builds one [`Services`] and picks what it needs, so all three
//! agree on the state database, lock file, notifier and thresholds.

use etl_config::HealerConfig;
use notify::{NotificationSink, Notifier};
use std::sync::Arc;
use std::time::Duration;

use crate::alert::{AlertGate, OperatorNotifier};
use crate::error::Result;
use crate::fallback::FallbackDataStore;
use crate::health::{HealthChecker, SysinfoResources};
use crate::lock::{FileLockManager, LockManager};
use crate::manual::{ManualPaths, ManualRecovery};
use crate::pipeline::{CommandExtractor, Extractor, PipelineRunner};
use crate::process::{ProcessTable, SystemProcessTable};
use crate::recovery::RecoveryEngine;
use crate::retry::RetryManager;
use crate::store::StateStore;

pub struct Services {
    pub config: HealerConfig,
    pub store: StateStore,
    pub processes: Arc<dyn ProcessTable>,
    pub lock: Arc<dyn LockManager>,
    pub notifier: OperatorNotifier,
    pub retry: RetryManager,
}

impl Services {
    /// Open the state store and build the production adapters.
    pub fn open(config: HealerConfig) -> Result<Self> {
        let sink: Arc<dyn NotificationSink> = Arc::new(Notifier::from_env());
        Self::with_sink(config, sink)
    }

    /// Same as [`Services::open`] with a caller-provided notification sink.
    pub fn with_sink(config: HealerConfig, sink: Arc<dyn NotificationSink>) -> Result<Self> {
        let store = StateStore::open(config.paths.state_db())?;
        let processes: Arc<dyn ProcessTable> = Arc::new(SystemProcessTable);
        let lock: Arc<dyn LockManager> = Arc::new(FileLockManager::new(
            config.paths.lock_file(),
            store.clone(),
            processes.clone(),
        ));
        let notifier = OperatorNotifier::new(
            sink,
            config.notify.recipients.clone(),
            config.notify.subject_prefix.clone(),
        );
        let retry = RetryManager::new(store.clone(), &config.retry);
        Ok(Self {
            config,
            store,
            processes,
            lock,
            notifier,
            retry,
        })
    }

    #[must_use]
    pub fn fallback(&self) -> FallbackDataStore {
        FallbackDataStore::new(self.store.clone(), self.config.recovery.fallback_ttl_hours)
    }

    #[must_use]
    pub fn recovery(&self) -> RecoveryEngine {
        RecoveryEngine::new(
            self.store.clone(),
            self.retry.clone(),
            self.lock.clone(),
            self.notifier.clone(),
            self.config.paths.temp_dir(),
        )
    }

    #[must_use]
    pub fn health_checker(&self) -> HealthChecker {
        HealthChecker::new(
            self.store.clone(),
            self.config.health.clone(),
            Arc::new(SysinfoResources),
            self.config.paths.data_dir.clone(),
        )
    }

    #[must_use]
    pub fn alert_gate(&self) -> AlertGate {
        AlertGate::new(
            self.store.clone(),
            self.notifier.clone(),
            self.config.health.alert_cooldown_minutes,
        )
    }

    /// One [`CommandExtractor`] per configured source.
    #[must_use]
    pub fn extractors(&self) -> Vec<Arc<dyn Extractor>> {
        self.config
            .pipeline
            .sources
            .iter()
            .map(|source| Arc::new(CommandExtractor::from_config(source)) as Arc<dyn Extractor>)
            .collect()
    }

    #[must_use]
    pub fn pipeline(&self) -> PipelineRunner {
        PipelineRunner::new(
            self.store.clone(),
            self.retry.clone(),
            Arc::new(self.recovery()),
            self.fallback(),
            self.extractors(),
        )
        .with_process_table(self.processes.clone())
        .with_max_inline_wait(Duration::from_secs(self.config.retry.max_inline_wait_secs))
    }

    #[must_use]
    pub fn manual(&self) -> ManualRecovery {
        let paths = &self.config.paths;
        ManualRecovery::new(
            self.store.clone(),
            self.lock.clone(),
            self.retry.clone(),
            self.fallback(),
            self.health_checker(),
            self.processes.clone(),
            ManualPaths {
                temp_dir: paths.temp_dir(),
                log_dir: paths.log_dir(),
                daemon_pid_file: paths.pid_file(),
            },
            self.config.retention.clone(),
            self.config.recovery.clone(),
        )
    }
}
