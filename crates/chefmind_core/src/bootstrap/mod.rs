//! Host detection and one-shot backend selection.
//!
//! # Responsibility
//! - Decide which storage engine the process runs on.
//! - Record every engine that was tried and why it was skipped.
//! - Seed the in-memory fallback so the application stays usable.
//!
//! # Invariants
//! - Selection happens once per `DataAccess`; the result never changes.
//! - The memory fallback is always reachable and always seeded.

mod seed;

pub use seed::{seed_sample_data, SAMPLE_SESSION_ID};

use crate::config::StorageConfig;
use crate::logging::{sanitize_message, MAX_LOGGED_ERROR_CHARS};
use crate::store::{
    BackendKind, MemoryBackend, ObjectStoreBackend, ObjectStoreSchema, SqlBackend,
    StorageBackend, StoreResult,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostEnvironment {
    /// Native process with filesystem access.
    Server,
    /// Browser-class host without the embedded SQL engine.
    Browser,
}

impl HostEnvironment {
    pub fn detect() -> Self {
        if cfg!(target_arch = "wasm32") {
            Self::Browser
        } else {
            Self::Server
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "server" | "native" => Some(Self::Server),
            "browser" | "web" => Some(Self::Browser),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Browser => "browser",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackStep {
    pub attempted: BackendKind,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendSelection {
    pub active: BackendKind,
    pub host: HostEnvironment,
    /// Engines tried before `active`, in order.
    pub fallback_chain: Vec<FallbackStep>,
    /// Number of sample records written into the fallback store.
    pub seeded_records: usize,
}

impl BackendSelection {
    pub fn used_fallback(&self) -> bool {
        !self.fallback_chain.is_empty()
    }
}

pub struct SelectedBackend {
    pub backend: Arc<dyn StorageBackend>,
    pub selection: BackendSelection,
}

/// Picks and opens the storage engine for `config`.
///
/// Server hosts try the embedded SQL engine; browser hosts try the object
/// store when it is available. Either falls back to a seeded memory store.
pub fn select_backend(config: &StorageConfig) -> StoreResult<SelectedBackend> {
    let host = config.resolved_host();
    let mut fallback_chain = Vec::new();

    let primary: Option<Arc<dyn StorageBackend>> = match host {
        HostEnvironment::Server => match SqlBackend::open(&config.sqlite) {
            Ok(backend) => Some(Arc::new(backend)),
            Err(err) => {
                fallback_chain.push(FallbackStep {
                    attempted: BackendKind::EmbeddedSql,
                    error: err.to_string(),
                });
                None
            }
        },
        HostEnvironment::Browser if config.object_store.available => {
            match ObjectStoreBackend::open(
                ObjectStoreSchema::chefmind(),
                config.object_store.persist_dir.clone(),
            ) {
                Ok(backend) => Some(Arc::new(backend)),
                Err(err) => {
                    fallback_chain.push(FallbackStep {
                        attempted: BackendKind::ObjectStore,
                        error: err.to_string(),
                    });
                    None
                }
            }
        }
        HostEnvironment::Browser => {
            fallback_chain.push(FallbackStep {
                attempted: BackendKind::ObjectStore,
                error: "object store capability is not available on this host".to_string(),
            });
            None
        }
    };

    if let Some(backend) = primary {
        let selection = BackendSelection {
            active: backend.kind(),
            host,
            fallback_chain,
            seeded_records: 0,
        };
        info!(
            "event=backend_select module=bootstrap status=ok host={} backend={}",
            host.as_str(),
            selection.active.as_str()
        );
        return Ok(SelectedBackend { backend, selection });
    }

    for step in &fallback_chain {
        warn!(
            "event=backend_select module=bootstrap status=fallback host={} attempted={} error={}",
            host.as_str(),
            step.attempted.as_str(),
            sanitize_message(&step.error, MAX_LOGGED_ERROR_CHARS)
        );
    }

    let memory = MemoryBackend::new();
    let seeded_records = seed_sample_data(&memory)?;
    info!(
        "event=backend_select module=bootstrap status=ok host={} backend=memory seeded_records={}",
        host.as_str(),
        seeded_records
    );

    Ok(SelectedBackend {
        backend: Arc::new(memory),
        selection: BackendSelection {
            active: BackendKind::Memory,
            host,
            fallback_chain,
            seeded_records,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::HostEnvironment;

    #[test]
    fn host_names_parse_case_insensitively() {
        assert_eq!(HostEnvironment::parse(" Browser "), Some(HostEnvironment::Browser));
        assert_eq!(HostEnvironment::parse("server"), Some(HostEnvironment::Server));
        assert_eq!(HostEnvironment::parse("mainframe"), None);
    }

    #[test]
    fn native_builds_detect_server() {
        if cfg!(not(target_arch = "wasm32")) {
            assert_eq!(HostEnvironment::detect(), HostEnvironment::Server);
        }
    }
}
