use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::enrollment::identity::{Principal, Role};
use crate::enrollment::{GuardianIdentity, ResubmissionPolicy};

/// Upper bound for retention and form lifetime settings (one hundred years).
const MAX_LIFECYCLE_DAYS: u64 = 36_500;
/// Upper bound for the reaper interval (one year).
const MAX_SWEEP_INTERVAL_SECS: u64 = 365 * 24 * 60 * 60;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub enrollment: EnrollmentConfig,
    pub store: StoreConfig,
    pub tokens: Vec<(String, Principal)>,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let retention = days_var("ENROLLMENT_RETENTION_DAYS", 30)?;
        let sweep_interval_secs = bounded(
            "ENROLLMENT_SWEEP_INTERVAL_SECS",
            number_var("ENROLLMENT_SWEEP_INTERVAL_SECS", 3600)?,
            MAX_SWEEP_INTERVAL_SECS,
        )?;
        let form_ttl = match env::var("ENROLLMENT_FORM_TTL_DAYS") {
            Ok(raw) if !raw.trim().is_empty() => {
                let value = parse_number("ENROLLMENT_FORM_TTL_DAYS", &raw)?;
                Some(days("ENROLLMENT_FORM_TTL_DAYS", value)?)
            }
            _ => None,
        };
        let resubmission = match env::var("ENROLLMENT_RESUBMISSION") {
            Ok(raw) => parse_policy(&raw)?,
            Err(_) => ResubmissionPolicy::default(),
        };
        let notify_attempts = u32::try_from(number_var("ENROLLMENT_NOTIFY_ATTEMPTS", 3)?)
            .map_err(|_| ConfigError::InvalidNumber {
                key: "ENROLLMENT_NOTIFY_ATTEMPTS",
            })?
            .max(1);
        let notify_timeout_ms = number_var("ENROLLMENT_NOTIFY_TIMEOUT_MS", 5000)?;

        let path = env::var("ENROLLMENT_STORE_PATH")
            .ok()
            .filter(|raw| !raw.trim().is_empty())
            .map(PathBuf::from);
        let timeout_ms = number_var("ENROLLMENT_STORE_TIMEOUT_MS", 2000)?;

        let tokens = match env::var("ENROLLMENT_TOKENS") {
            Ok(raw) => parse_tokens(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level },
            enrollment: EnrollmentConfig {
                retention,
                sweep_interval: Duration::from_secs(sweep_interval_secs),
                form_ttl,
                resubmission,
                notify_attempts,
                notify_timeout: Duration::from_millis(notify_timeout_ms),
            },
            store: StoreConfig {
                path,
                timeout: Duration::from_millis(timeout_ms),
            },
            tokens,
        })
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
}

/// Lifecycle knobs for enrollment forms.
#[derive(Debug, Clone)]
pub struct EnrollmentConfig {
    /// Pending forms older than this are purged by the reaper.
    pub retention: chrono::Duration,
    /// Zero disables the background reaper.
    pub sweep_interval: Duration,
    pub form_ttl: Option<chrono::Duration>,
    pub resubmission: ResubmissionPolicy,
    pub notify_attempts: u32,
    /// Cut-off for a single notification attempt.
    pub notify_timeout: Duration,
}

impl Default for EnrollmentConfig {
    fn default() -> Self {
        Self {
            retention: chrono::Duration::days(30),
            sweep_interval: Duration::from_secs(3600),
            form_ttl: None,
            resubmission: ResubmissionPolicy::default(),
            notify_attempts: 3,
            notify_timeout: Duration::from_secs(5),
        }
    }
}

/// Where the entity store keeps its snapshot and how long a call may wait.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: None,
            timeout: Duration::from_millis(2000),
        }
    }
}

fn number_var(key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(key) {
        Ok(raw) => parse_number(key, &raw),
        Err(_) => Ok(default),
    }
}

fn parse_number(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidNumber { key })
}

fn bounded(key: &'static str, value: u64, max: u64) -> Result<u64, ConfigError> {
    if value > max {
        return Err(ConfigError::InvalidNumber { key });
    }
    Ok(value)
}

fn days(key: &'static str, value: u64) -> Result<chrono::Duration, ConfigError> {
    let value = bounded(key, value, MAX_LIFECYCLE_DAYS)?;
    chrono::Duration::try_days(value as i64).ok_or(ConfigError::InvalidNumber { key })
}

fn days_var(key: &'static str, default: u64) -> Result<chrono::Duration, ConfigError> {
    days(key, number_var(key, default)?)
}

fn parse_policy(raw: &str) -> Result<ResubmissionPolicy, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "reject_approved" | "reject" => Ok(ResubmissionPolicy::RejectApproved),
        "reset_to_pending" | "reset" => Ok(ResubmissionPolicy::ResetToPending),
        other => Err(ConfigError::InvalidPolicy(other.to_string())),
    }
}

/// Parses `token=identity:role[:email]` entries separated by commas.
pub fn parse_tokens(raw: &str) -> Result<Vec<(String, Principal)>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let invalid = || ConfigError::InvalidToken(entry.to_string());
            let (token, rest) = entry.split_once('=').ok_or_else(invalid)?;
            let mut parts = rest.splitn(3, ':');
            let identity = parts.next().filter(|value| !value.is_empty()).ok_or_else(invalid)?;
            let role = match parts.next() {
                Some("admin") => Role::Admin,
                Some("guardian") => Role::Guardian,
                _ => return Err(invalid()),
            };
            let email = parts.next().map(str::to_string);
            Ok((
                token.trim().to_string(),
                Principal {
                    identity: GuardianIdentity(identity.to_string()),
                    role,
                    email,
                },
            ))
        })
        .collect()
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { key: &'static str },
    InvalidPolicy(String),
    InvalidToken(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key } => {
                write!(f, "{key} must be a non-negative integer within its allowed range")
            }
            ConfigError::InvalidPolicy(value) => write!(
                f,
                "ENROLLMENT_RESUBMISSION must be reject_approved or reset_to_pending, got '{value}'"
            ),
            ConfigError::InvalidToken(entry) => write!(
                f,
                "ENROLLMENT_TOKENS entry '{entry}' must look like token=identity:role[:email]"
            ),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for key in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "ENROLLMENT_RETENTION_DAYS",
            "ENROLLMENT_SWEEP_INTERVAL_SECS",
            "ENROLLMENT_FORM_TTL_DAYS",
            "ENROLLMENT_RESUBMISSION",
            "ENROLLMENT_NOTIFY_ATTEMPTS",
            "ENROLLMENT_NOTIFY_TIMEOUT_MS",
            "ENROLLMENT_STORE_PATH",
            "ENROLLMENT_STORE_TIMEOUT_MS",
            "ENROLLMENT_TOKENS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.enrollment.retention, chrono::Duration::days(30));
        assert_eq!(
            config.enrollment.resubmission,
            ResubmissionPolicy::RejectApproved
        );
        assert!(config.enrollment.form_ttl.is_none());
        assert!(config.store.path.is_none());
        assert_eq!(config.store.timeout, Duration::from_millis(2000));
        assert_eq!(config.enrollment.notify_timeout, Duration::from_secs(5));
        assert!(config.tokens.is_empty());
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn reads_enrollment_overrides() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ENROLLMENT_RETENTION_DAYS", "45");
        env::set_var("ENROLLMENT_FORM_TTL_DAYS", "10");
        env::set_var("ENROLLMENT_RESUBMISSION", "reset_to_pending");
        let config = AppConfig::load().expect("config loads");
        assert_eq!(config.enrollment.retention, chrono::Duration::days(45));
        assert_eq!(config.enrollment.form_ttl, Some(chrono::Duration::days(10)));
        assert_eq!(
            config.enrollment.resubmission,
            ResubmissionPolicy::ResetToPending
        );
        reset_env();
    }

    #[test]
    fn rejects_malformed_numbers_and_policies() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ENROLLMENT_RETENTION_DAYS", "thirty");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidNumber {
                key: "ENROLLMENT_RETENTION_DAYS"
            })
        ));
        reset_env();
        env::set_var("ENROLLMENT_RESUBMISSION", "merge");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidPolicy(_))
        ));
        reset_env();
    }

    #[test]
    fn rejects_day_counts_beyond_the_calendar() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("ENROLLMENT_RETENTION_DAYS", u64::MAX.to_string());
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidNumber {
                key: "ENROLLMENT_RETENTION_DAYS"
            })
        ));
        reset_env();
        env::set_var("ENROLLMENT_FORM_TTL_DAYS", "36501");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidNumber {
                key: "ENROLLMENT_FORM_TTL_DAYS"
            })
        ));
        reset_env();
        env::set_var("ENROLLMENT_NOTIFY_ATTEMPTS", "4294967296");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidNumber {
                key: "ENROLLMENT_NOTIFY_ATTEMPTS"
            })
        ));
        reset_env();
        env::set_var("ENROLLMENT_RETENTION_DAYS", "36500");
        let config = AppConfig::load().expect("upper bound accepted");
        assert_eq!(config.enrollment.retention, chrono::Duration::days(36_500));
        reset_env();
    }

    #[test]
    fn parses_token_entries() {
        let tokens = parse_tokens("abc=maria:guardian:maria@example.com, root=ops:admin")
            .expect("tokens parse");
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].0, "abc");
        assert_eq!(tokens[0].1.role, Role::Guardian);
        assert_eq!(tokens[0].1.email.as_deref(), Some("maria@example.com"));
        assert_eq!(tokens[1].1.identity, GuardianIdentity("ops".to_string()));
        assert_eq!(tokens[1].1.role, Role::Admin);

        assert!(matches!(
            parse_tokens("broken"),
            Err(ConfigError::InvalidToken(_))
        ));
        assert!(matches!(
            parse_tokens("t=who:superuser"),
            Err(ConfigError::InvalidToken(_))
        ));
    }
}
