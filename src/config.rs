use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ConfigurationError;

pub const ENV_PREFIX: &str = "PIPEWRIGHT_";
pub const DEFAULT_PASSWORD_ENV: &str = "PIPEWRIGHT_REGISTRY_PASSWORD";
const DEFAULT_CHANNEL: &str = "#builds";

/// Options a stage may depend on being present before the run starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKey {
    SonarServerUrl,
    NexusUrl,
    DockerRegistryCredentials,
    NotificationChannel,
}

impl ConfigKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigKey::SonarServerUrl => "sonar_server_url",
            ConfigKey::NexusUrl => "nexus_url",
            ConfigKey::DockerRegistryCredentials => "docker_registry_credentials",
            ConfigKey::NotificationChannel => "notification_channel",
        }
    }
}

/// The `config:` block of a pipeline file, before environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct ConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sonar_server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nexus_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_registry_credentials: Option<RegistryCredentialsSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RegistryCredentialsSpec {
    pub registry: String,
    pub username: String,
    /// Name of the environment variable holding the password.
    #[serde(default = "default_password_env")]
    pub password_env: String,
}

fn default_password_env() -> String {
    DEFAULT_PASSWORD_ENV.to_string()
}

#[derive(Clone, PartialEq, Eq)]
pub struct RegistryCredentials {
    pub registry: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for RegistryCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryCredentials")
            .field("registry", &self.registry)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Fully resolved settings for one run. Passed explicitly to every stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub sonar_server_url: Option<String>,
    pub nexus_url: Option<String>,
    pub docker_registry_credentials: Option<RegistryCredentials>,
    pub notification_channel: String,
    pub logs_url: Option<String>,
    pub archive_dir: PathBuf,
    /// Password variable of configured registry credentials that was unset.
    /// Reported only if a stage that runs needs the credentials.
    missing_password_env: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            sonar_server_url: None,
            nexus_url: None,
            docker_registry_credentials: None,
            notification_channel: DEFAULT_CHANNEL.to_string(),
            logs_url: None,
            archive_dir: PathBuf::from(".pipewright/archive"),
            missing_password_env: None,
        }
    }
}

impl RunConfig {
    pub fn from_env(spec: &ConfigSpec) -> Result<Self, ConfigurationError> {
        Self::resolve(spec, |name| std::env::var(name).ok())
    }

    /// Merges the file block with `PIPEWRIGHT_*` overrides read through `lookup`.
    pub fn resolve<F>(spec: &ConfigSpec, lookup: F) -> Result<Self, ConfigurationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = |suffix: &str| {
            lookup(&format!("{ENV_PREFIX}{suffix}")).filter(|value| !value.trim().is_empty())
        };

        let sonar_server_url = env("SONAR_SERVER_URL").or_else(|| spec.sonar_server_url.clone());
        if let Some(url) = &sonar_server_url {
            check_url(ConfigKey::SonarServerUrl, url)?;
        }
        let nexus_url = env("NEXUS_URL").or_else(|| spec.nexus_url.clone());
        if let Some(url) = &nexus_url {
            check_url(ConfigKey::NexusUrl, url)?;
        }

        let mut credentials = spec.docker_registry_credentials.clone();
        if let (Some(registry), Some(username)) = (env("REGISTRY"), env("REGISTRY_USERNAME")) {
            credentials = Some(RegistryCredentialsSpec {
                registry,
                username,
                password_env: default_password_env(),
            });
        }
        let mut missing_password_env = None;
        let docker_registry_credentials = match credentials {
            Some(creds) => {
                if creds.registry.trim().is_empty() || creds.username.trim().is_empty() {
                    return Err(ConfigurationError::InvalidValue {
                        key: ConfigKey::DockerRegistryCredentials.as_str(),
                        reason: "registry and username must be non-empty".into(),
                    });
                }
                match lookup(&creds.password_env).filter(|value| !value.is_empty()) {
                    Some(password) => Some(RegistryCredentials {
                        registry: creds.registry,
                        username: creds.username,
                        password,
                    }),
                    None => {
                        missing_password_env = Some(creds.password_env);
                        None
                    }
                }
            }
            None => None,
        };

        let defaults = RunConfig::default();
        Ok(Self {
            sonar_server_url,
            nexus_url,
            docker_registry_credentials,
            notification_channel: env("NOTIFICATION_CHANNEL")
                .or_else(|| spec.notification_channel.clone())
                .unwrap_or(defaults.notification_channel),
            logs_url: env("LOGS_URL").or_else(|| spec.logs_url.clone()),
            archive_dir: env("ARCHIVE_DIR")
                .map(PathBuf::from)
                .or_else(|| spec.archive_dir.clone())
                .unwrap_or(defaults.archive_dir),
            missing_password_env,
        })
    }

    pub fn has(&self, key: ConfigKey) -> bool {
        match key {
            ConfigKey::SonarServerUrl => self.sonar_server_url.is_some(),
            ConfigKey::NexusUrl => self.nexus_url.is_some(),
            ConfigKey::DockerRegistryCredentials => self.docker_registry_credentials.is_some(),
            ConfigKey::NotificationChannel => !self.notification_channel.is_empty(),
        }
    }

    /// Explains why `key` is unavailable to `stage`, if it is.
    pub fn require(&self, stage: &str, key: ConfigKey) -> Result<(), ConfigurationError> {
        if self.has(key) {
            return Ok(());
        }
        if let (ConfigKey::DockerRegistryCredentials, Some(var)) = (key, &self.missing_password_env) {
            return Err(ConfigurationError::MissingEnvironment {
                key: key.as_str(),
                var: var.clone(),
            });
        }
        Err(ConfigurationError::MissingOption {
            stage: stage.to_string(),
            key: key.as_str(),
        })
    }

    /// Values exposed to command templates. Secrets are never included.
    pub fn template_value(&self, name: &str) -> Option<String> {
        match name {
            "sonar_server_url" => self.sonar_server_url.clone(),
            "nexus_url" => self.nexus_url.clone(),
            "registry" => self
                .docker_registry_credentials
                .as_ref()
                .map(|c| c.registry.clone()),
            "notification_channel" => Some(self.notification_channel.clone()),
            "logs_url" => self.logs_url.clone(),
            _ => None,
        }
    }
}

fn check_url(key: ConfigKey, url: &str) -> Result<(), ConfigurationError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigurationError::InvalidValue {
            key: key.as_str(),
            reason: format!("'{url}' is not an http(s) URL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn environment_overrides_file_values() {
        let spec = ConfigSpec {
            sonar_server_url: Some("https://sonar.internal".into()),
            notification_channel: Some("#team".into()),
            ..ConfigSpec::default()
        };
        let config = RunConfig::resolve(
            &spec,
            lookup(&[("PIPEWRIGHT_SONAR_SERVER_URL", "https://sonar.example.com")]),
        )
        .unwrap();
        assert_eq!(
            config.sonar_server_url.as_deref(),
            Some("https://sonar.example.com")
        );
        assert_eq!(config.notification_channel, "#team");
        assert!(config.nexus_url.is_none());
    }

    #[test]
    fn missing_registry_password_is_reported_when_required() {
        let spec = ConfigSpec {
            docker_registry_credentials: Some(RegistryCredentialsSpec {
                registry: "registry.example.com".into(),
                username: "ci".into(),
                password_env: "REGISTRY_TOKEN".into(),
            }),
            ..ConfigSpec::default()
        };
        let config = RunConfig::resolve(&spec, lookup(&[])).unwrap();
        assert!(!config.has(ConfigKey::DockerRegistryCredentials));
        assert!(config.require("Build", ConfigKey::SonarServerUrl).is_err());
        assert_eq!(
            config
                .require("Push", ConfigKey::DockerRegistryCredentials)
                .unwrap_err(),
            ConfigurationError::MissingEnvironment {
                key: "docker_registry_credentials",
                var: "REGISTRY_TOKEN".into(),
            }
        );

        let config = RunConfig::resolve(&spec, lookup(&[("REGISTRY_TOKEN", "s3cret")])).unwrap();
        let creds = config.docker_registry_credentials.unwrap();
        assert_eq!(creds.password, "s3cret");
        assert!(!format!("{creds:?}").contains("s3cret"));
    }

    #[test]
    fn rejects_non_http_urls() {
        let spec = ConfigSpec {
            nexus_url: Some("nexus.local:8081".into()),
            ..ConfigSpec::default()
        };
        assert!(matches!(
            RunConfig::resolve(&spec, lookup(&[])),
            Err(ConfigurationError::InvalidValue { key: "nexus_url", .. })
        ));
    }

    #[test]
    fn template_values_hide_credentials() {
        let config = RunConfig {
            docker_registry_credentials: Some(RegistryCredentials {
                registry: "ghcr.io".into(),
                username: "bot".into(),
                password: "token".into(),
            }),
            ..RunConfig::default()
        };
        assert_eq!(config.template_value("registry").as_deref(), Some("ghcr.io"));
        assert_eq!(config.template_value("password"), None);
        assert_eq!(
            config.template_value("notification_channel").as_deref(),
            Some("#builds")
        );
    }
}
