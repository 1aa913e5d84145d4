//! Process records, isolation scopes, and the supervision state machine.

use chrono::{DateTime, Utc};
use prism_capabilities::{PrismError, Result};
use serde::{Deserialize, Serialize};

/// The dimension along which the launcher deduplicates pattern processes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "isolation", rename_all = "snake_case")]
pub enum IsolationScope {
    None,
    Namespace { namespace: String },
    Session { namespace: String, session_id: String },
}

impl IsolationScope {
    /// Build from the loose wire fields, enforcing the pairing rules
    pub fn from_parts(
        isolation: &str,
        namespace: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Self> {
        match isolation {
            "none" => {
                if namespace.is_some() || session_id.is_some() {
                    return Err(PrismError::validation(
                        "isolation none forbids namespace and session_id",
                    ));
                }
                Ok(IsolationScope::None)
            }
            "namespace" => {
                if session_id.is_some() {
                    return Err(PrismError::validation(
                        "isolation namespace forbids session_id",
                    ));
                }
                let namespace = namespace.ok_or_else(|| {
                    PrismError::validation("isolation namespace requires a namespace")
                })?;
                Ok(IsolationScope::Namespace {
                    namespace: namespace.to_string(),
                })
            }
            "session" => {
                let namespace = namespace.ok_or_else(|| {
                    PrismError::validation("isolation session requires a namespace")
                })?;
                let session_id = session_id.ok_or_else(|| {
                    PrismError::validation("isolation session requires a session_id")
                })?;
                Ok(IsolationScope::Session {
                    namespace: namespace.to_string(),
                    session_id: session_id.to_string(),
                })
            }
            other => Err(PrismError::validation(format!(
                "unknown isolation {other:?}, expected none, namespace, or session"
            ))),
        }
    }

    /// Stable process id: the uniqueness key and the routing key
    pub fn process_id(&self, pattern_name: &str) -> String {
        match self {
            IsolationScope::None => format!("pattern:{pattern_name}"),
            IsolationScope::Namespace { namespace } => format!("ns:{namespace}:{pattern_name}"),
            IsolationScope::Session {
                namespace,
                session_id,
            } => format!("sess:{namespace}:{session_id}:{pattern_name}"),
        }
    }

    pub fn namespace(&self) -> Option<&str> {
        match self {
            IsolationScope::None => None,
            IsolationScope::Namespace { namespace }
            | IsolationScope::Session { namespace, .. } => Some(namespace),
        }
    }
}

/// Supervision states of a pattern process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Pending,
    Starting,
    Running,
    Draining,
    Terminating,
    Failed,
    Exited,
}

impl ProcessState {
    /// Terminal states never transition again (Failed is terminal once the
    /// restart budget is exhausted; the supervisor tracks that separately).
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessState::Exited)
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ProcessState::Pending
                | ProcessState::Starting
                | ProcessState::Running
                | ProcessState::Draining
                | ProcessState::Terminating
        )
    }
}

impl std::fmt::Display for ProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcessState::Pending => "pending",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Draining => "draining",
            ProcessState::Terminating => "terminating",
            ProcessState::Failed => "failed",
            ProcessState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Everything the launcher tracks about one pattern process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub process_id: String,
    pub pattern_name: String,
    pub version: String,
    #[serde(flatten)]
    pub scope: IsolationScope,
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub control_plane_address: Option<String>,
    pub data_plane_address: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_health_at: Option<DateTime<Utc>>,
    pub healthy: bool,
    pub restart_count: u32,
    pub backoff_deadline: Option<DateTime<Utc>>,
}

impl ProcessRecord {
    pub fn new(pattern_name: &str, scope: IsolationScope) -> Self {
        Self {
            process_id: scope.process_id(pattern_name),
            pattern_name: pattern_name.to_string(),
            version: String::new(),
            scope,
            state: ProcessState::Pending,
            pid: None,
            control_plane_address: None,
            data_plane_address: None,
            started_at: None,
            last_health_at: None,
            healthy: false,
            restart_count: 0,
            backoff_deadline: None,
        }
    }

    /// Is the backoff window still closed?
    pub fn in_backoff(&self) -> bool {
        matches!(self.backoff_deadline, Some(deadline) if deadline > Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_id_derivation_matches_scope() {
        assert_eq!(
            IsolationScope::None.process_id("consumer"),
            "pattern:consumer"
        );
        assert_eq!(
            IsolationScope::Namespace {
                namespace: "A".into()
            }
            .process_id("consumer"),
            "ns:A:consumer"
        );
        assert_eq!(
            IsolationScope::Session {
                namespace: "A".into(),
                session_id: "s1".into()
            }
            .process_id("consumer"),
            "sess:A:s1:consumer"
        );
    }

    #[test]
    fn isolation_pairing_rules() {
        assert!(IsolationScope::from_parts("none", None, None).is_ok());
        assert!(IsolationScope::from_parts("none", Some("A"), None).is_err());
        assert!(IsolationScope::from_parts("namespace", Some("A"), None).is_ok());
        assert!(IsolationScope::from_parts("namespace", None, None).is_err());
        assert!(IsolationScope::from_parts("namespace", Some("A"), Some("s")).is_err());
        assert!(IsolationScope::from_parts("session", Some("A"), Some("s")).is_ok());
        assert!(IsolationScope::from_parts("session", Some("A"), None).is_err());
        assert!(IsolationScope::from_parts("pod", None, None).is_err());
    }

    #[test]
    fn active_and_terminal_states() {
        assert!(ProcessState::Running.is_active());
        assert!(ProcessState::Draining.is_active());
        assert!(!ProcessState::Failed.is_active());
        assert!(ProcessState::Exited.is_terminal());
        assert!(!ProcessState::Failed.is_terminal());
    }
}
