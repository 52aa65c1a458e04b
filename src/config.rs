use std::path::Path;

use crate::error::VguestError;

pub const ENV_HOST: &str = "VMWARE_IP";
pub const ENV_USER: &str = "VMWARE_USER";
pub const ENV_PASSWORD: &str = "VMWARE_PASSWORD";
pub const ENV_ROOT_USER: &str = "VM_ROOT_USER";
pub const ENV_ROOT_PASSWORD: &str = "VM_ROOT_PASSWORD";
pub const ENV_VERIFY_SSL: &str = "VMWARE_VERIFY_SSL";

/// Required variables, in the order they are reported when missing.
const REQUIRED: [&str; 5] = [
    ENV_HOST,
    ENV_USER,
    ENV_PASSWORD,
    ENV_ROOT_USER,
    ENV_ROOT_PASSWORD,
];

/// Connection parameters for the vSphere endpoint.
#[derive(Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub username: String,
    pub password: String,
    pub verify_ssl: bool,
}

impl ConnectionConfig {
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        verify_ssl: bool,
    ) -> Result<Self, VguestError> {
        let config = Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            verify_ssl,
        };
        let missing: Vec<String> = [
            ("host", &config.host),
            ("username", &config.username),
            ("password", &config.password),
        ]
        .into_iter()
        .filter(|(_, v)| v.is_empty())
        .map(|(k, _)| k.to_string())
        .collect();
        if !missing.is_empty() {
            return Err(VguestError::MissingConfig { missing });
        }
        Ok(config)
    }

    /// SOAP endpoint of the management server.
    pub fn sdk_url(&self) -> String {
        format!("https://{}:443/sdk", self.host)
    }
}

// Keep the password out of debug output and logs.
impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("username", &self.username)
            .field("verify_ssl", &self.verify_ssl)
            .finish_non_exhaustive()
    }
}

/// Credentials used for guest operations inside the VM.
#[derive(Clone)]
pub struct GuestCredentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for GuestCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestCredentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub connection: ConnectionConfig,
    pub guest: GuestCredentials,
}

impl Settings {
    /// Load `env_path` into the process environment (if it exists), then
    /// read settings from the environment.
    pub fn load(env_path: &Path) -> Result<Self, VguestError> {
        match dotenvy::from_path(env_path) {
            Ok(()) => {
                tracing::debug!(path = %env_path.display(), "loaded env file");
            }
            Err(e) if e.not_found() => {
                tracing::debug!(path = %env_path.display(), "no env file, using process environment");
            }
            Err(e) => {
                return Err(VguestError::Config {
                    message: format!("failed to load {}: {e}", env_path.display()),
                });
            }
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup.
    ///
    /// Absent and empty values both count as missing. All missing names are
    /// reported together.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, VguestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let values: Vec<Option<String>> = REQUIRED
            .iter()
            .map(|key| lookup(key).filter(|v| !v.is_empty()))
            .collect();

        let missing: Vec<String> = REQUIRED
            .iter()
            .zip(&values)
            .filter(|(_, v)| v.is_none())
            .map(|(k, _)| k.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(VguestError::MissingConfig { missing });
        }

        let verify_ssl = match lookup(ENV_VERIFY_SSL) {
            Some(raw) if !raw.trim().is_empty() => parse_bool(&raw).ok_or_else(|| {
                VguestError::Config {
                    message: format!("{ENV_VERIFY_SSL} must be true or false (got '{raw}')"),
                }
            })?,
            _ => true,
        };

        let mut values = values.into_iter().flatten();
        let mut next = || values.next().unwrap_or_default();
        let (host, user, password, root_user, root_password) =
            (next(), next(), next(), next(), next());

        Ok(Self {
            connection: ConnectionConfig::new(host, user, password, verify_ssl)?,
            guest: GuestCredentials {
                username: root_user,
                password: root_password,
            },
        })
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
