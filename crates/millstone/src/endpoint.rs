use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::common::error::MillError;
use crate::ids::JobId;

pub const DEFAULT_PROTOCOL: &str = "http";

/// Address of a supervisor agent's control port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SupervisorEndpoint {
    pub host: String,
    pub port: u16,
}

impl SupervisorEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn base_url(&self) -> String {
        format!("{DEFAULT_PROTOCOL}://{}:{}", self.host, self.port)
    }
}

impl Display for SupervisorEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for SupervisorEndpoint {
    type Err = MillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| MillError::InvalidIdentifier(format!("missing port in `{s}`")))?;
        let port = port
            .parse()
            .map_err(|_| MillError::InvalidIdentifier(format!("invalid port in `{s}`")))?;
        if host.is_empty() {
            return Err(MillError::InvalidIdentifier(format!("missing host in `{s}`")));
        }
        Ok(Self::new(host, port))
    }
}

/// Address of a running executor, as returned by the supervisor that started it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorEndpoint {
    pub protocol: String,
    pub host: String,
    pub supervisor_port: u16,
    pub executor_port: u16,
    /// Serialized [`ExecutorIdentifier`].
    pub identifier: String,
}

impl ExecutorEndpoint {
    /// Base URL of the executor's embedded server.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.host, self.executor_port)
    }

    pub fn supervisor(&self) -> SupervisorEndpoint {
        SupervisorEndpoint::new(self.host.clone(), self.supervisor_port)
    }
}

impl Display for ExecutorEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.base_url())
    }
}

/// Locates one executor instance: `{protocol}://{host}:{port}/{namespace}/{executor_name}`.
///
/// For process executors the namespace holds the PID, for pod executors it is the
/// cluster namespace and the name is the pod name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutorIdentifier {
    pub protocol: String,
    pub host: String,
    pub port: Option<u16>,
    pub namespace: String,
    pub executor_name: String,
}

impl ExecutorIdentifier {
    pub fn new(
        host: impl Into<String>,
        port: Option<u16>,
        namespace: impl Into<String>,
        executor_name: impl Into<String>,
    ) -> Self {
        Self {
            protocol: DEFAULT_PROTOCOL.to_string(),
            host: host.into(),
            port,
            namespace: namespace.into(),
            executor_name: executor_name.into(),
        }
    }

    pub fn parse(identifier: &str) -> crate::Result<Self> {
        let url = Url::parse(identifier)?;
        let host = url
            .host_str()
            .ok_or_else(|| MillError::InvalidIdentifier(format!("missing host in `{identifier}`")))?;
        let segments: Vec<&str> = url
            .path_segments()
            .map(|s| s.filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        let [namespace, executor_name] = segments.as_slice() else {
            return Err(MillError::InvalidIdentifier(format!(
                "expected `/namespace/name` path in `{identifier}`"
            )));
        };
        Ok(Self {
            protocol: url.scheme().to_string(),
            host: host.to_string(),
            port: url.port(),
            namespace: namespace.to_string(),
            executor_name: executor_name.to_string(),
        })
    }

    /// PID of a process executor.
    pub fn pid(&self) -> Option<i32> {
        self.namespace.parse().ok().filter(|pid| *pid > 0)
    }
}

impl Display for ExecutorIdentifier {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}", self.protocol, self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{port}")?;
        }
        write!(f, "/{}/{}", self.namespace, self.executor_name)
    }
}

impl FromStr for ExecutorIdentifier {
    type Err = MillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Executor names are unique per start attempt: `{prefix}{job_id}-{yyyyMMddHHmmssSSS}`.
pub fn executor_name(prefix: &str, job_id: JobId, now: DateTime<Utc>) -> String {
    format!("{prefix}{job_id}-{}", now.format("%Y%m%d%H%M%S%3f"))
}

#[cfg(test)]
mod tests {
    use super::{ExecutorIdentifier, SupervisorEndpoint, executor_name};
    use crate::ids::JobId;
    use chrono::{TimeZone, Utc};

    #[test]
    fn identifier_display_parses_back() {
        let identifier = ExecutorIdentifier::new("10.0.0.7", Some(8989), "4211", "task-job-7-x");
        let text = identifier.to_string();
        assert_eq!(text, "http://10.0.0.7:8989/4211/task-job-7-x");
        let parsed = ExecutorIdentifier::parse(&text).unwrap();
        assert_eq!(parsed, identifier);
        assert_eq!(parsed.pid(), Some(4211));
    }

    #[test]
    fn pod_identifier_has_no_pid() {
        let parsed = ExecutorIdentifier::parse("http://pod-host/odc/task-job-1-abc").unwrap();
        assert_eq!(parsed.port, None);
        assert_eq!(parsed.namespace, "odc");
        assert_eq!(parsed.pid(), None);
    }

    #[test]
    fn identifier_requires_two_segments() {
        assert!(ExecutorIdentifier::parse("http://host:1/only").is_err());
        assert!(ExecutorIdentifier::parse("http://host:1/a/b/c").is_err());
        assert!(ExecutorIdentifier::parse("not a url").is_err());
    }

    #[test]
    fn parse_supervisor_endpoint() {
        let endpoint: SupervisorEndpoint = "127.0.0.1:9000".parse().unwrap();
        assert_eq!(endpoint, SupervisorEndpoint::new("127.0.0.1", 9000));
        assert_eq!(endpoint.base_url(), "http://127.0.0.1:9000");
        assert!("127.0.0.1".parse::<SupervisorEndpoint>().is_err());
        assert!(":80".parse::<SupervisorEndpoint>().is_err());
    }

    #[test]
    fn executor_names_carry_job_and_time() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 7, 8, 9).unwrap();
        assert_eq!(
            executor_name("task-job-", JobId::new(42), now),
            "task-job-42-20240305070809000"
        );
    }
}
