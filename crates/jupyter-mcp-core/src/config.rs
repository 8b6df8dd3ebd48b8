use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::error::{Error, Result};

/// Sentinel meaning "use the host process's own managers".
pub const LOCAL: &str = "local";

/// Where one concern (documents or interpreters) is served from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    Local,
    Remote { url: Url, token: Option<String> },
}

impl Access {
    pub fn is_local(&self) -> bool {
        matches!(self, Access::Local)
    }

    /// Applies an explicitly configured token; an empty one is ignored.
    pub fn with_token(self, token: Option<String>) -> Self {
        match (self, token.filter(|t| !t.is_empty())) {
            (Access::Remote { url, .. }, Some(token)) => Access::Remote {
                url,
                token: Some(token),
            },
            (access, _) => access,
        }
    }
}

impl FromStr for Access {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case(LOCAL) {
            return Ok(Access::Local);
        }
        let url = Url::parse(s).map_err(|e| Error::Configuration(format!("'{s}' is neither '{LOCAL}' nor a URL: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::Configuration(format!("unsupported scheme in '{s}'")));
        }
        let token = url
            .query_pairs()
            .find(|(k, _)| k == "token")
            .map(|(_, v)| v.into_owned());
        Ok(Access::Remote { url, token })
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Access::Local => f.write_str(LOCAL),
            Access::Remote { url, .. } => write!(f, "{url}"),
        }
    }
}

impl Serialize for Access {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Access {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub timeout_secs: u64,
    pub progress_interval_secs: u64,
    pub idle_wait_secs: u64,
    pub interrupt_grace_millis: u64,
    pub liveness_probe_millis: u64,
    pub code_timeout_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 300,
            progress_interval_secs: 5,
            idle_wait_secs: 30,
            interrupt_grace_millis: 2000,
            liveness_probe_millis: 1000,
            code_timeout_secs: 60,
        }
    }
}

impl ExecutionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_secs(self.progress_interval_secs.max(1))
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_secs(self.idle_wait_secs)
    }

    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_millis)
    }

    pub fn liveness_probe(&self) -> Duration {
        Duration::from_millis(self.liveness_probe_millis)
    }

    pub fn code_timeout(&self) -> Duration {
        Duration::from_secs(self.code_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub document: Access,
    pub runtime: Access,
    /// Notebook to open as the `default` session at startup.
    pub document_id: Option<String>,
    /// Interpreter to bind that session to.
    pub runtime_id: Option<String>,
    pub start_new_runtime: bool,
    /// Route document writes through the live CRDT room.
    pub collaboration: bool,
    pub allow_img_output: bool,
    pub execution: ExecutionConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            document: Access::Local,
            runtime: Access::Local,
            document_id: None,
            runtime_id: None,
            start_new_runtime: true,
            collaboration: true,
            allow_img_output: true,
            execution: ExecutionConfig::default(),
        }
    }
}

fn parse_flag(name: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Configuration(format!("{name}={other} is not a boolean"))),
    }
}

impl Config {
    /// Reads `DOCUMENT_URL`, `DOCUMENT_TOKEN`, `DOCUMENT_ID`, `RUNTIME_URL`,
    /// `RUNTIME_TOKEN`, `RUNTIME_ID`, `START_NEW_RUNTIME`, `COLLABORATION` and
    /// `ALLOW_IMG_OUTPUT`; unset variables keep their defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Config::default();
        if let Some(url) = lookup("DOCUMENT_URL") {
            config.document = url.parse()?;
        }
        config.document = config.document.with_token(lookup("DOCUMENT_TOKEN"));
        if let Some(url) = lookup("RUNTIME_URL") {
            config.runtime = url.parse()?;
        }
        config.runtime = config.runtime.with_token(lookup("RUNTIME_TOKEN"));

        config.document_id = lookup("DOCUMENT_ID").filter(|v| !v.is_empty());
        config.runtime_id = lookup("RUNTIME_ID").filter(|v| !v.is_empty());
        for (name, slot) in [
            ("START_NEW_RUNTIME", &mut config.start_new_runtime),
            ("COLLABORATION", &mut config.collaboration),
            ("ALLOW_IMG_OUTPUT", &mut config.allow_img_output),
        ] {
            if let Some(raw) = lookup(name) {
                *slot = parse_flag(name, &raw)?;
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations that cannot be honoured.
    pub fn validate(&self) -> Result<()> {
        if !self.start_new_runtime && self.runtime_id.is_none() && self.document_id.is_some() {
            return Err(Error::Configuration(
                "START_NEW_RUNTIME is off but no RUNTIME_ID was given".into(),
            ));
        }
        if self.execution.timeout_secs == 0 {
            return Err(Error::Configuration("execution timeout must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_local() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert!(config.document.is_local());
        assert!(config.runtime.is_local());
        assert!(config.collaboration);
        assert_eq!(config.execution.timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_access_parsing() {
        assert_eq!("LOCAL".parse::<Access>().unwrap(), Access::Local);
        match "http://localhost:8888/lab?token=abc".parse::<Access>().unwrap() {
            Access::Remote { url, token } => {
                assert_eq!(url.host_str(), Some("localhost"));
                assert_eq!(token.as_deref(), Some("abc"));
            }
            Access::Local => panic!("expected remote"),
        }
        assert!(matches!("ftp://x".parse::<Access>(), Err(Error::Configuration(_))));
        assert!(matches!("nonsense".parse::<Access>(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_split_concerns_and_tokens() {
        let config = Config::from_lookup(lookup(&[
            ("DOCUMENT_URL", "local"),
            ("RUNTIME_URL", "http://gpu-box:8888?token=fromquery"),
            ("RUNTIME_TOKEN", "explicit"),
            ("ALLOW_IMG_OUTPUT", "false"),
        ]))
        .unwrap();
        assert!(config.document.is_local());
        assert!(matches!(&config.runtime, Access::Remote { token: Some(t), .. } if t == "explicit"));
        assert!(!config.allow_img_output);
    }

    #[test]
    fn test_bad_flag_is_configuration_error() {
        let err = Config::from_lookup(lookup(&[("COLLABORATION", "maybe")])).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn test_reuse_without_runtime_id_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("DOCUMENT_ID", "notebook.ipynb"),
            ("START_NEW_RUNTIME", "false"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("RUNTIME_ID"));
    }

    #[test]
    fn test_deserialize_from_json() {
        let config: Config = serde_json::from_value(serde_json::json!({
            "document": "https://hub.example.com/user/me",
            "execution": {"timeout_secs": 10}
        }))
        .unwrap();
        assert!(!config.document.is_local());
        assert!(config.runtime.is_local());
        assert_eq!(config.execution.timeout_secs, 10);
        assert_eq!(config.execution.progress_interval_secs, 5);
    }
}
