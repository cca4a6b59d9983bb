use std::fmt;
use std::time::Duration;

use crate::types::{Identity, LoginCredentials};

/// Top-level configuration, read once from the environment at startup.
///
/// Missing required settings are fatal; everything else has a default.
/// Secrets (`API_PASSWORD`, `SMTP_PASS`) never appear in `Debug` output.
#[derive(Clone)]
pub struct Config {
    pub backend: BackendConfig,
    pub schedule: ScheduleConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub alert: AlertConfig,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("backend", &self.backend)
            .field("schedule", &self.schedule)
            .field("server", &self.server)
            .field("logging", &self.logging)
            .field("alert", &self.alert)
            .finish()
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let base_url = env
            .string("API_BASE_URL")
            .ok_or(ConfigError::Missing("API_BASE_URL"))?;
        let base_url = base_url.trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ConfigError::Invalid {
                key: "API_BASE_URL",
                reason: format!("expected an http(s) URL, got {base_url:?}"),
            });
        }

        let identity = match (env.string("API_USERNAME"), env.string("API_EMAIL")) {
            (Some(username), _) => Identity::Username(username),
            (None, Some(email)) => Identity::Email(email),
            (None, None) => return Err(ConfigError::Missing("API_USERNAME or API_EMAIL")),
        };
        let password = env
            .string("API_PASSWORD")
            .ok_or(ConfigError::Missing("API_PASSWORD"))?;

        let backend_defaults = BackendConfig::defaults(base_url, identity, password);
        let backend = BackendConfig {
            verify_session: env.bool("VERIFY_SESSION")?.unwrap_or(true),
            verify_path: env
                .string("VERIFY_PATH")
                .unwrap_or(backend_defaults.verify_path.clone()),
            login_timeout: env
                .millis("LOGIN_TIMEOUT_MS")?
                .unwrap_or(backend_defaults.login_timeout),
            logout_timeout: env
                .millis("LOGOUT_TIMEOUT_MS")?
                .unwrap_or(backend_defaults.logout_timeout),
            ..backend_defaults
        };

        let d = ScheduleConfig::default();
        let schedule = ScheduleConfig {
            interval: env.millis("KEEP_ALIVE_INTERVAL")?.unwrap_or(d.interval),
            run_on_start: env.bool("RUN_ON_START")?.unwrap_or(d.run_on_start),
            login_max_attempts: env
                .number("LOGIN_MAX_ATTEMPTS")?
                .unwrap_or(d.login_max_attempts),
            login_base_delay: env
                .millis("LOGIN_BASE_DELAY_MS")?
                .unwrap_or(d.login_base_delay),
            login_max_delay: env
                .millis("LOGIN_MAX_DELAY_MS")?
                .unwrap_or(d.login_max_delay),
            login_follow_up_batches: env
                .number("LOGIN_FOLLOW_UP_BATCHES")?
                .unwrap_or(d.login_follow_up_batches),
            logout_max_attempts: env
                .number("LOGOUT_MAX_ATTEMPTS")?
                .unwrap_or(d.logout_max_attempts),
            logout_base_delay: env
                .millis("LOGOUT_BASE_DELAY_MS")?
                .unwrap_or(d.logout_base_delay),
            failure_retry_delay: env
                .millis("FAILURE_RETRY_DELAY_MS")?
                .unwrap_or(d.failure_retry_delay),
            shutdown_logout_timeout: env
                .millis("SHUTDOWN_LOGOUT_TIMEOUT_MS")?
                .unwrap_or(d.shutdown_logout_timeout),
        };

        let d = ServerConfig::default();
        let server = ServerConfig {
            host: env.string("HOST").unwrap_or(d.host),
            port: env.number("PORT")?.unwrap_or(d.port),
        };

        let d = LoggingConfig::default();
        let logging = LoggingConfig {
            level: env.string("LOG_LEVEL").unwrap_or(d.level),
            json: match env.string("LOG_FORMAT").as_deref() {
                None | Some("pretty") | Some("text") => false,
                Some("json") => true,
                Some(other) => {
                    return Err(ConfigError::Invalid {
                        key: "LOG_FORMAT",
                        reason: format!("expected \"pretty\" or \"json\", got {other:?}"),
                    })
                }
            },
        };

        let d = AlertConfig::default();
        let smtp_user = env.string("SMTP_USER");
        let alert = AlertConfig {
            recipient: env.string("ALERT_EMAIL"),
            sender: env.string("ALERT_FROM").or_else(|| smtp_user.clone()),
            smtp_host: env.string("SMTP_HOST"),
            smtp_port: env.number("SMTP_PORT")?.unwrap_or(d.smtp_port),
            smtp_user,
            smtp_password: env.string("SMTP_PASS"),
            cooldown: env.millis("ALERT_COOLDOWN_MS")?.unwrap_or(d.cooldown),
        };

        let cfg = Config {
            backend,
            schedule,
            server,
            logging,
            alert,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    /// Semantic checks that span several settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.schedule.interval.is_zero() {
            return Err(ConfigError::Invalid {
                key: "KEEP_ALIVE_INTERVAL",
                reason: "must be greater than zero".into(),
            });
        }
        if self.schedule.login_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "LOGIN_MAX_ATTEMPTS",
                reason: "must be at least 1".into(),
            });
        }
        if self.schedule.logout_max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "LOGOUT_MAX_ATTEMPTS",
                reason: "must be at least 1".into(),
            });
        }
        if self.schedule.login_max_delay < self.schedule.login_base_delay {
            return Err(ConfigError::Invalid {
                key: "LOGIN_MAX_DELAY_MS",
                reason: "must not be smaller than LOGIN_BASE_DELAY_MS".into(),
            });
        }
        if !self.backend.verify_path.starts_with('/') {
            return Err(ConfigError::Invalid {
                key: "VERIFY_PATH",
                reason: "must start with '/'".into(),
            });
        }
        if self.alert.recipient.is_some() {
            if self.alert.smtp_host.is_none() {
                return Err(ConfigError::Invalid {
                    key: "SMTP_HOST",
                    reason: "required when ALERT_EMAIL is set".into(),
                });
            }
            if self.alert.sender.is_none() {
                return Err(ConfigError::Invalid {
                    key: "ALERT_FROM",
                    reason: "required when ALERT_EMAIL is set and SMTP_USER is not".into(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),
    #[error("invalid {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct BackendConfig {
    pub base_url: String,
    pub identity: Identity,
    pub password: String,
    pub verify_session: bool,
    pub verify_path: String,
    pub login_timeout: Duration,
    pub logout_timeout: Duration,
}

impl BackendConfig {
    pub fn defaults(base_url: String, identity: Identity, password: String) -> Self {
        Self {
            base_url,
            identity,
            password,
            verify_session: true,
            verify_path: "/api/user/me".to_string(),
            login_timeout: Duration::from_secs(10),
            logout_timeout: Duration::from_secs(5),
        }
    }

    pub fn credentials(&self) -> LoginCredentials {
        LoginCredentials {
            identity: self.identity.clone(),
            password: self.password.clone(),
        }
    }
}

impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("base_url", &self.base_url)
            .field("identity", &self.identity)
            .field("password", &"***")
            .field("verify_session", &self.verify_session)
            .field("verify_path", &self.verify_path)
            .field("login_timeout", &self.login_timeout)
            .field("logout_timeout", &self.logout_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    /// Time between ticks.
    pub interval: Duration,
    pub run_on_start: bool,
    pub login_max_attempts: u32,
    pub login_base_delay: Duration,
    pub login_max_delay: Duration,
    /// Extra full login batches run after the exhaustion alert.
    pub login_follow_up_batches: u32,
    pub logout_max_attempts: u32,
    pub logout_base_delay: Duration,
    /// Replaces `interval` for the tick after a fully failed login.
    pub failure_retry_delay: Duration,
    pub shutdown_logout_timeout: Duration,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(720_000),
            run_on_start: true,
            login_max_attempts: 10,
            login_base_delay: Duration::from_secs(1),
            login_max_delay: Duration::from_secs(30),
            login_follow_up_batches: 1,
            logout_max_attempts: 2,
            logout_base_delay: Duration::from_secs(1),
            failure_retry_delay: Duration::from_secs(60),
            shutdown_logout_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Clone)]
pub struct AlertConfig {
    /// Alert recipient; `None` means alerts are only logged.
    pub recipient: Option<String>,
    pub sender: Option<String>,
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_user: Option<String>,
    pub smtp_password: Option<String>,
    pub cooldown: Duration,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            recipient: None,
            sender: None,
            smtp_host: None,
            smtp_port: 587,
            smtp_user: None,
            smtp_password: None,
            cooldown: Duration::from_millis(60_000),
        }
    }
}

impl fmt::Debug for AlertConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlertConfig")
            .field("recipient", &self.recipient)
            .field("sender", &self.sender)
            .field("smtp_host", &self.smtp_host)
            .field("smtp_port", &self.smtp_port)
            .field("smtp_user", &self.smtp_user)
            .field("smtp_password", &self.smtp_password.as_ref().map(|_| "***"))
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Env parsing helpers
// ---------------------------------------------------------------------------

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn number<T: std::str::FromStr>(&self, key: &'static str) -> Result<Option<T>, ConfigError> {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|_| ConfigError::Invalid {
                key,
                reason: format!("expected a non-negative integer, got {raw:?}"),
            }),
        }
    }

    fn millis(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        Ok(self.number::<u64>(key)?.map(Duration::from_millis))
    }

    fn bool(&self, key: &'static str) -> Result<Option<bool>, ConfigError> {
        match self.string(key).map(|v| v.to_ascii_lowercase()).as_deref() {
            None => Ok(None),
            Some("1" | "true" | "yes" | "on") => Ok(Some(true)),
            Some("0" | "false" | "no" | "off") => Ok(Some(false)),
            Some(other) => Err(ConfigError::Invalid {
                key,
                reason: format!("expected a boolean, got {other:?}"),
            }),
        }
    }
}
