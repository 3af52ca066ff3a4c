use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub salesforce: SalesforceConfig,
    pub auth: AuthConfig,
    pub http: HttpConfig,
    pub conversion: ConversionConfig,
    pub service: ServiceConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct SalesforceConfig {
    pub instance_url: String,
    pub token_url: String,
    pub client_id: String,
    pub client_secret: SecretString,
    pub refresh_token: SecretString,
    pub api_version: String,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub token_ttl_secs: u64,
}

#[derive(Clone, Debug)]
pub struct HttpConfig {
    pub timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct ConversionConfig {
    pub max_attempts: u32,
    pub backoff_unit_ms: u64,
    pub attempt_budget_secs: u64,
    pub converted_status: String,
    pub create_opportunity: bool,
}

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub operation_timeout_secs: u64,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub instance_url: Option<String>,
    pub token_url: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub api_version: Option<String>,
    pub token_ttl_secs: Option<u64>,
    pub conversion_max_attempts: Option<u32>,
    pub conversion_backoff_unit_ms: Option<u64>,
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            salesforce: SalesforceConfig {
                instance_url: String::new(),
                token_url: "https://login.salesforce.com/services/oauth2/token".to_string(),
                client_id: String::new(),
                client_secret: String::new().into(),
                refresh_token: String::new().into(),
                api_version: "v59.0".to_string(),
            },
            auth: AuthConfig { token_ttl_secs: 7000 },
            http: HttpConfig { timeout_secs: 30 },
            conversion: ConversionConfig {
                max_attempts: 3,
                backoff_unit_ms: 1000,
                attempt_budget_secs: 60,
                converted_status: "Closed - Converted".to_string(),
                create_opportunity: false,
            },
            service: ServiceConfig { operation_timeout_secs: 120 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl SalesforceConfig {
    /// SOAP endpoints take the bare version number (`59.0`), REST takes `v59.0`.
    pub fn soap_version(&self) -> &str {
        self.api_version.trim_start_matches('v')
    }
}

impl AuthConfig {
    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.token_ttl_secs)
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl ConversionConfig {
    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }

    /// Wall-clock limit on the RPC attempts and their backoff. Reconciliation
    /// runs after it expires.
    pub fn attempt_budget(&self) -> Duration {
        Duration::from_secs(self.attempt_budget_secs)
    }
}

impl ServiceConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected =
                options.config_path.unwrap_or_else(|| PathBuf::from("leadbridge.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(salesforce) = patch.salesforce {
            if let Some(instance_url) = salesforce.instance_url {
                self.salesforce.instance_url = instance_url;
            }
            if let Some(token_url) = salesforce.token_url {
                self.salesforce.token_url = token_url;
            }
            if let Some(client_id) = salesforce.client_id {
                self.salesforce.client_id = client_id;
            }
            if let Some(client_secret) = salesforce.client_secret {
                self.salesforce.client_secret = secret_value(client_secret);
            }
            if let Some(refresh_token) = salesforce.refresh_token {
                self.salesforce.refresh_token = secret_value(refresh_token);
            }
            if let Some(api_version) = salesforce.api_version {
                self.salesforce.api_version = api_version;
            }
        }

        if let Some(auth) = patch.auth {
            if let Some(token_ttl_secs) = auth.token_ttl_secs {
                self.auth.token_ttl_secs = token_ttl_secs;
            }
        }

        if let Some(http) = patch.http {
            if let Some(timeout_secs) = http.timeout_secs {
                self.http.timeout_secs = timeout_secs;
            }
        }

        if let Some(conversion) = patch.conversion {
            if let Some(max_attempts) = conversion.max_attempts {
                self.conversion.max_attempts = max_attempts;
            }
            if let Some(backoff_unit_ms) = conversion.backoff_unit_ms {
                self.conversion.backoff_unit_ms = backoff_unit_ms;
            }
            if let Some(attempt_budget_secs) = conversion.attempt_budget_secs {
                self.conversion.attempt_budget_secs = attempt_budget_secs;
            }
            if let Some(converted_status) = conversion.converted_status {
                self.conversion.converted_status = converted_status;
            }
            if let Some(create_opportunity) = conversion.create_opportunity {
                self.conversion.create_opportunity = create_opportunity;
            }
        }

        if let Some(service) = patch.service {
            if let Some(operation_timeout_secs) = service.operation_timeout_secs {
                self.service.operation_timeout_secs = operation_timeout_secs;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env_any(&["LEADBRIDGE_SALESFORCE_INSTANCE_URL", "SF_INSTANCE_URL"])
        {
            self.salesforce.instance_url = value;
        }
        if let Some(value) = read_env_any(&["LEADBRIDGE_SALESFORCE_TOKEN_URL", "SF_TOKEN_URL"]) {
            self.salesforce.token_url = value;
        }
        if let Some(value) = read_env_any(&["LEADBRIDGE_SALESFORCE_CLIENT_ID", "SF_CLIENT_ID"]) {
            self.salesforce.client_id = value;
        }
        if let Some(value) =
            read_env_any(&["LEADBRIDGE_SALESFORCE_CLIENT_SECRET", "SF_CLIENT_SECRET"])
        {
            self.salesforce.client_secret = secret_value(value);
        }
        if let Some(value) =
            read_env_any(&["LEADBRIDGE_SALESFORCE_REFRESH_TOKEN", "SF_REFRESH_TOKEN"])
        {
            self.salesforce.refresh_token = secret_value(value);
        }
        if let Some(value) = read_env_any(&["LEADBRIDGE_SALESFORCE_API_VERSION", "SF_API_VERSION"])
        {
            self.salesforce.api_version = value;
        }

        if let Some(value) = read_env("LEADBRIDGE_AUTH_TOKEN_TTL_SECS") {
            self.auth.token_ttl_secs = parse_u64("LEADBRIDGE_AUTH_TOKEN_TTL_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADBRIDGE_HTTP_TIMEOUT_SECS") {
            self.http.timeout_secs = parse_u64("LEADBRIDGE_HTTP_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("LEADBRIDGE_CONVERSION_MAX_ATTEMPTS") {
            self.conversion.max_attempts =
                parse_u32("LEADBRIDGE_CONVERSION_MAX_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("LEADBRIDGE_CONVERSION_BACKOFF_UNIT_MS") {
            self.conversion.backoff_unit_ms =
                parse_u64("LEADBRIDGE_CONVERSION_BACKOFF_UNIT_MS", &value)?;
        }
        if let Some(value) = read_env("LEADBRIDGE_CONVERSION_ATTEMPT_BUDGET_SECS") {
            self.conversion.attempt_budget_secs =
                parse_u64("LEADBRIDGE_CONVERSION_ATTEMPT_BUDGET_SECS", &value)?;
        }
        if let Some(value) = read_env("LEADBRIDGE_CONVERSION_CONVERTED_STATUS") {
            self.conversion.converted_status = value;
        }
        if let Some(value) = read_env("LEADBRIDGE_CONVERSION_CREATE_OPPORTUNITY") {
            self.conversion.create_opportunity =
                parse_bool("LEADBRIDGE_CONVERSION_CREATE_OPPORTUNITY", &value)?;
        }

        if let Some(value) = read_env("LEADBRIDGE_SERVICE_OPERATION_TIMEOUT_SECS") {
            self.service.operation_timeout_secs =
                parse_u64("LEADBRIDGE_SERVICE_OPERATION_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env_any(&["LEADBRIDGE_LOGGING_LEVEL", "LEADBRIDGE_LOG_LEVEL"]) {
            self.logging.level = value;
        }
        if let Some(value) = read_env_any(&["LEADBRIDGE_LOGGING_FORMAT", "LEADBRIDGE_LOG_FORMAT"])
        {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(instance_url) = overrides.instance_url {
            self.salesforce.instance_url = instance_url;
        }
        if let Some(token_url) = overrides.token_url {
            self.salesforce.token_url = token_url;
        }
        if let Some(client_id) = overrides.client_id {
            self.salesforce.client_id = client_id;
        }
        if let Some(client_secret) = overrides.client_secret {
            self.salesforce.client_secret = secret_value(client_secret);
        }
        if let Some(refresh_token) = overrides.refresh_token {
            self.salesforce.refresh_token = secret_value(refresh_token);
        }
        if let Some(api_version) = overrides.api_version {
            self.salesforce.api_version = api_version;
        }
        if let Some(token_ttl_secs) = overrides.token_ttl_secs {
            self.auth.token_ttl_secs = token_ttl_secs;
        }
        if let Some(max_attempts) = overrides.conversion_max_attempts {
            self.conversion.max_attempts = max_attempts;
        }
        if let Some(backoff_unit_ms) = overrides.conversion_backoff_unit_ms {
            self.conversion.backoff_unit_ms = backoff_unit_ms;
        }
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_salesforce(&self.salesforce)?;
        validate_timeouts(self)?;
        validate_conversion(&self.conversion)?;
        validate_logging(&self.logging)?;
        Ok(())
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("leadbridge.toml"), PathBuf::from("config/leadbridge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_url(key: &str, value: &str) -> Result<(), ConfigError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ConfigError::Validation(format!("{key} is required")));
    }
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(ConfigError::Validation(format!(
            "{key} must start with http:// or https://"
        )));
    }
    Ok(())
}

fn validate_salesforce(salesforce: &SalesforceConfig) -> Result<(), ConfigError> {
    validate_url("salesforce.instance_url", &salesforce.instance_url)?;
    validate_url("salesforce.token_url", &salesforce.token_url)?;

    if salesforce.client_id.trim().is_empty() {
        return Err(ConfigError::Validation(
            "salesforce.client_id is required. Find it under Setup > App Manager > Your Connected App > Consumer Key".to_string(),
        ));
    }
    if salesforce.client_secret.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "salesforce.client_secret is required (the connected app's Consumer Secret)"
                .to_string(),
        ));
    }
    if salesforce.refresh_token.expose_secret().trim().is_empty() {
        return Err(ConfigError::Validation(
            "salesforce.refresh_token is required (obtain one through the web-server OAuth flow with the refresh_token scope)".to_string(),
        ));
    }

    let version = salesforce.api_version.trim();
    let digits = version.strip_prefix('v').unwrap_or_default();
    let well_formed = match digits.split_once('.') {
        Some((major, minor)) => {
            !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit())
        }
        None => false,
    };
    if !well_formed {
        return Err(ConfigError::Validation(format!(
            "salesforce.api_version must look like `v59.0`, got `{version}`"
        )));
    }

    Ok(())
}

fn validate_timeouts(config: &AppConfig) -> Result<(), ConfigError> {
    if config.auth.token_ttl_secs == 0 {
        return Err(ConfigError::Validation(
            "auth.token_ttl_secs must be greater than zero".to_string(),
        ));
    }

    if config.http.timeout_secs == 0 || config.http.timeout_secs > 300 {
        return Err(ConfigError::Validation("http.timeout_secs must be in range 1..=300".to_string()));
    }

    if config.conversion.attempt_budget_secs == 0 {
        return Err(ConfigError::Validation(
            "conversion.attempt_budget_secs must be greater than zero".to_string(),
        ));
    }

    // A conversion spends one request on the pre-check, the attempt budget on
    // RPCs, and one more request on reconciliation.
    let conversion_floor = config
        .conversion
        .attempt_budget_secs
        .saturating_add(config.http.timeout_secs.saturating_mul(2));
    if config.service.operation_timeout_secs < conversion_floor {
        return Err(ConfigError::Validation(format!(
            "service.operation_timeout_secs must be at least conversion.attempt_budget_secs + \
             2 * http.timeout_secs ({conversion_floor})"
        )));
    }

    Ok(())
}

fn validate_conversion(conversion: &ConversionConfig) -> Result<(), ConfigError> {
    if conversion.max_attempts == 0 || conversion.max_attempts > 10 {
        return Err(ConfigError::Validation(
            "conversion.max_attempts must be in range 1..=10".to_string(),
        ));
    }

    if conversion.backoff_unit_ms > 60_000 {
        return Err(ConfigError::Validation(
            "conversion.backoff_unit_ms must be at most 60000".to_string(),
        ));
    }

    if conversion.converted_status.trim().is_empty() {
        return Err(ConfigError::Validation(
            "conversion.converted_status must not be empty".to_string(),
        ));
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn read_env_any(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| read_env(key))
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    salesforce: Option<SalesforcePatch>,
    auth: Option<AuthPatch>,
    http: Option<HttpPatch>,
    conversion: Option<ConversionPatch>,
    service: Option<ServicePatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct SalesforcePatch {
    instance_url: Option<String>,
    token_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    refresh_token: Option<String>,
    api_version: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AuthPatch {
    token_ttl_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct HttpPatch {
    timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConversionPatch {
    max_attempts: Option<u32>,
    backoff_unit_ms: Option<u64>,
    attempt_budget_secs: Option<u64>,
    converted_status: Option<String>,
    create_opportunity: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct ServicePatch {
    operation_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}

#[cfg(test)]
mod tests {
    use std::env;
    use std::fs;
    use std::io;
    use std::sync::{Mutex, OnceLock};
    use std::time::Duration;

    use secrecy::ExposeSecret;
    use tempfile::TempDir;

    use super::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};

    static ENV_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

    const CREDENTIAL_VARS: &[&str] = &[
        "LEADBRIDGE_SALESFORCE_INSTANCE_URL",
        "LEADBRIDGE_SALESFORCE_CLIENT_ID",
        "LEADBRIDGE_SALESFORCE_CLIENT_SECRET",
        "LEADBRIDGE_SALESFORCE_REFRESH_TOKEN",
    ];

    fn env_lock() -> &'static Mutex<()> {
        ENV_LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_vars(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    fn set_credentials() {
        env::set_var("LEADBRIDGE_SALESFORCE_INSTANCE_URL", "https://acme.my.salesforce.com");
        env::set_var("LEADBRIDGE_SALESFORCE_CLIENT_ID", "3MVG9-client");
        env::set_var("LEADBRIDGE_SALESFORCE_CLIENT_SECRET", "client-secret-value");
        env::set_var("LEADBRIDGE_SALESFORCE_REFRESH_TOKEN", "refresh-token-value");
    }

    fn ensure(condition: bool, message: &'static str) -> Result<(), String> {
        if condition {
            Ok(())
        } else {
            Err(message.to_string())
        }
    }

    #[test]
    fn file_load_supports_env_interpolation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("TEST_SF_CLIENT_SECRET", "secret-from-env");
        env::set_var("TEST_SF_REFRESH_TOKEN", "refresh-from-env");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadbridge.toml");
            fs::write(
                &path,
                r#"
[salesforce]
instance_url = "https://acme.my.salesforce.com"
client_id = "3MVG9-client"
client_secret = "${TEST_SF_CLIENT_SECRET}"
refresh_token = "${TEST_SF_REFRESH_TOKEN}"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config =
                AppConfig::load(LoadOptions { config_path: Some(path), ..LoadOptions::default() })
                    .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.salesforce.client_secret.expose_secret() == "secret-from-env",
                "client secret should be loaded from environment",
            )?;
            ensure(
                config.salesforce.refresh_token.expose_secret() == "refresh-from-env",
                "refresh token should be loaded from environment",
            )?;
            ensure(config.salesforce.soap_version() == "59.0", "default api version should apply")?;
            Ok(())
        })();

        clear_vars(&["TEST_SF_CLIENT_SECRET", "TEST_SF_REFRESH_TOKEN"]);
        result
    }

    #[test]
    fn legacy_sf_variables_are_accepted_as_aliases() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        env::set_var("SF_INSTANCE_URL", "https://legacy.my.salesforce.com");
        env::set_var("SF_CLIENT_ID", "legacy-client");
        env::set_var("SF_CLIENT_SECRET", "legacy-secret");
        env::set_var("SF_REFRESH_TOKEN", "legacy-refresh");
        env::set_var("SF_API_VERSION", "v60.0");

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;

            ensure(
                config.salesforce.instance_url == "https://legacy.my.salesforce.com",
                "legacy instance url should be used",
            )?;
            ensure(config.salesforce.api_version == "v60.0", "legacy api version should be used")?;
            Ok(())
        })();

        clear_vars(&[
            "SF_INSTANCE_URL",
            "SF_CLIENT_ID",
            "SF_CLIENT_SECRET",
            "SF_REFRESH_TOKEN",
            "SF_API_VERSION",
        ]);
        result
    }

    #[test]
    fn precedence_defaults_file_env_overrides() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_credentials();
        env::set_var("LEADBRIDGE_CONVERSION_MAX_ATTEMPTS", "4");

        let result = (|| -> Result<(), String> {
            let dir = TempDir::new().map_err(|err: io::Error| err.to_string())?;
            let path = dir.path().join("leadbridge.toml");
            fs::write(
                &path,
                r#"
[auth]
token_ttl_secs = 3600

[conversion]
max_attempts = 2
backoff_unit_ms = 250

[logging]
level = "warn"
"#,
            )
            .map_err(|err| err.to_string())?;

            let config = AppConfig::load(LoadOptions {
                config_path: Some(path),
                overrides: ConfigOverrides {
                    log_level: Some("debug".to_string()),
                    token_ttl_secs: Some(60),
                    ..ConfigOverrides::default()
                },
                ..LoadOptions::default()
            })
            .map_err(|err| format!("config load failed: {err}"))?;

            ensure(config.auth.token_ttl_secs == 60, "override ttl should win")?;
            ensure(config.logging.level == "debug", "overridden log level should be debug")?;
            ensure(config.conversion.max_attempts == 4, "env attempts should win over file")?;
            ensure(config.conversion.backoff_unit_ms == 250, "file backoff should win over default")?;
            Ok(())
        })();

        clear_vars(CREDENTIAL_VARS);
        clear_vars(&["LEADBRIDGE_CONVERSION_MAX_ATTEMPTS"]);
        result
    }

    #[test]
    fn defaults_match_observed_constants() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_credentials();
        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(config.conversion.max_attempts == 3, "default attempts should be 3")?;
            ensure(config.auth.token_ttl_secs == 7000, "default ttl should be 7000 seconds")?;
            ensure(config.salesforce.api_version == "v59.0", "default api version should be v59.0")?;
            Ok(())
        })();

        clear_vars(CREDENTIAL_VARS);
        result
    }

    #[test]
    fn operation_timeout_must_leave_room_for_reconciliation() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_credentials();
        env::set_var("LEADBRIDGE_HTTP_TIMEOUT_SECS", "30");
        env::set_var("LEADBRIDGE_CONVERSION_ATTEMPT_BUDGET_SECS", "60");
        env::set_var("LEADBRIDGE_SERVICE_OPERATION_TIMEOUT_SECS", "100");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected the operation timeout to be rejected".to_string()),
                Err(error) => error,
            };
            let names_floor = matches!(
                error,
                ConfigError::Validation(ref message)
                    if message.contains("conversion.attempt_budget_secs")
                        && message.contains("120")
            );
            ensure(names_floor, "validation failure should name the attempt budget and the floor")?;

            env::set_var("LEADBRIDGE_SERVICE_OPERATION_TIMEOUT_SECS", "120");
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            ensure(
                config.conversion.attempt_budget() == Duration::from_secs(60),
                "attempt budget should come from env",
            )
        })();

        clear_vars(CREDENTIAL_VARS);
        clear_vars(&[
            "LEADBRIDGE_HTTP_TIMEOUT_SECS",
            "LEADBRIDGE_CONVERSION_ATTEMPT_BUDGET_SECS",
            "LEADBRIDGE_SERVICE_OPERATION_TIMEOUT_SECS",
        ]);
        result
    }

    #[test]
    fn validation_fails_fast_with_actionable_error() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_credentials();
        env::remove_var("LEADBRIDGE_SALESFORCE_REFRESH_TOKEN");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => {
                    return Err("expected validation failure but config load succeeded".to_string())
                }
                Err(error) => error,
            };
            let has_message = matches!(
                error,
                ConfigError::Validation(ref message) if message.contains("salesforce.refresh_token")
            );
            ensure(has_message, "validation failure should mention salesforce.refresh_token")
        })();

        clear_vars(CREDENTIAL_VARS);
        result
    }

    #[test]
    fn invalid_numeric_env_override_is_reported() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_credentials();
        env::set_var("LEADBRIDGE_HTTP_TIMEOUT_SECS", "soon");

        let result = (|| -> Result<(), String> {
            let error = match AppConfig::load(LoadOptions::default()) {
                Ok(_) => return Err("expected env override failure".to_string()),
                Err(error) => error,
            };
            ensure(
                matches!(error, ConfigError::InvalidEnvOverride { ref key, .. } if key == "LEADBRIDGE_HTTP_TIMEOUT_SECS"),
                "error should name the offending variable",
            )
        })();

        clear_vars(CREDENTIAL_VARS);
        clear_vars(&["LEADBRIDGE_HTTP_TIMEOUT_SECS"]);
        result
    }

    #[test]
    fn secret_values_are_not_leaked_by_debug() -> Result<(), String> {
        let _guard = env_lock().lock().map_err(|_| "env lock is poisoned".to_string())?;

        set_credentials();

        let result = (|| -> Result<(), String> {
            let config = AppConfig::load(LoadOptions::default())
                .map_err(|err| format!("config load failed: {err}"))?;
            let debug = format!("{config:?}");

            ensure(
                !debug.contains("client-secret-value"),
                "debug output should not contain client secret",
            )?;
            ensure(
                !debug.contains("refresh-token-value"),
                "debug output should not contain refresh token",
            )?;
            ensure(
                matches!(config.logging.format, LogFormat::Compact),
                "default logging format should be compact",
            )?;
            Ok(())
        })();

        clear_vars(CREDENTIAL_VARS);
        result
    }
}
