//! # certfleet - TLS Certificate Lifecycle Platform
//!
//! An operator-facing lifecycle engine for a small fleet of hosts
//! coordinated through a shared consistent key-value store. It issues,
//! stores, renews and distributes X.509 certificates obtained from an ACME
//! certificate authority via DNS-01 challenges, then deploys the key
//! material to downstream consumers (local filesystems, remote SSH hosts,
//! cloud CDN providers).
//!
//! ## Core pieces
//!
//! - **Lock service**: fair, reentrant, session-backed distributed mutexes
//!   over the shared store, with a loss signal (`done()`)
//! - **Scheduler**: single-leader job dispatcher with a time-ordered heap,
//!   a bounded worker pool, and per-job execution-mode semantics
//! - **Certificate manager**: owns domain records, DNS provider
//!   credentials and deploy configs; drives renewals and auto-deploys
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use certfleet::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> certfleet::Result<()> {
//!     let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
//!     let locks = LockManager::new(store.clone(), "/certfleet/", DEFAULT_SESSION_TTL).await?;
//!     let scheduler = Scheduler::new(&locks, SchedulerOptions::default());
//!     scheduler.start();
//!     // ... build the issuer and manager, register the check task
//!     Ok(())
//! }
//! ```

// Module declarations
pub mod acme;
pub mod config;
pub mod deploy;
pub mod dns;
pub mod error;
pub mod lock;
pub mod manager;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use acme::{AcmeIssuer, AcmeOptions, IssuedCertificate, certificate_validity};
pub use config::Config;
pub use deploy::{
    CloudApiFactory, CloudJobStatus, CloudResource, CloudSslApi, Deployer, MockCloudApi,
    SSL_RESOURCE_TAGS,
};
pub use dns::{
    ChallengeProvider, CloudflareProvider, DigitalOceanProvider, GodaddyProvider,
    MockChallengeProvider, PropagationTiming, ProviderRegistry, canonical_tag, default_timing,
};
pub use error::{FleetError, Result};
pub use lock::{DEFAULT_SESSION_TTL, DistributedLock, LockManager, LockOptions};
pub use manager::{
    CERT_CHECK_TASK, CertFormat, CertManager, ConvertedCertificate, DeployStats, ManagerOptions,
    RenewalSweep,
};
pub use scheduler::{
    CronSchedule, ExecutionMode, Scheduler, SchedulerOptions, Task, TaskStatus,
};
pub use store::{EphemeralEntry, KvStore, Session, etcd::EtcdStore, memory::MemoryStore};
pub use types::{
    DeployConfig, DeployKind, DnsConfig, DnsProviderConfig, DomainCert, LockInfo,
    domain_matches, is_valid_domain, is_wildcard,
};

/// Prelude module with commonly used types
pub mod prelude {
    pub use crate::{
        acme::{AcmeIssuer, AcmeOptions, IssuedCertificate},
        config::Config,
        deploy::{CloudSslApi, Deployer},
        dns::{ChallengeProvider, ProviderRegistry},
        error::{FleetError, Result},
        lock::{DEFAULT_SESSION_TTL, DistributedLock, LockManager, LockOptions},
        manager::{CertManager, ManagerOptions},
        scheduler::{ExecutionMode, Scheduler, SchedulerOptions, Task},
        store::{KvStore, etcd::EtcdStore, memory::MemoryStore},
        types::{DeployConfig, DnsProviderConfig, DomainCert},
    };
}
