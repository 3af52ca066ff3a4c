use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use leadbridge_core::config::{AppConfig, LoadOptions};
use toml::Value;

use super::CommandResult;

struct Field {
    key: &'static str,
    value: String,
    env_keys: &'static [&'static str],
}

pub fn run(options: LoadOptions) -> CommandResult {
    let explicit_path = options.config_path.clone();
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::config_failure(
                "config",
                format!("config validation failed: {error}"),
            )
        }
    };

    let config_file_path = detect_config_path(explicit_path);
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines =
        vec!["effective config (source precedence: flag > env > file > default):".to_string()];
    for field in fields(&config) {
        let source =
            field_source(&field, config_file_doc.as_ref(), config_file_path.as_deref());
        lines.push(render_line(field.key, &field.value, source));
    }

    CommandResult { exit_code: 0, output: lines.join("\n") }
}

fn fields(config: &AppConfig) -> Vec<Field> {
    let salesforce = &config.salesforce;
    vec![
        Field {
            key: "salesforce.instance_url",
            value: salesforce.instance_url.clone(),
            env_keys: &["LEADBRIDGE_SALESFORCE_INSTANCE_URL", "SF_INSTANCE_URL"],
        },
        Field {
            key: "salesforce.token_url",
            value: salesforce.token_url.clone(),
            env_keys: &["LEADBRIDGE_SALESFORCE_TOKEN_URL", "SF_TOKEN_URL"],
        },
        Field {
            key: "salesforce.client_id",
            value: redact_client_id(&salesforce.client_id),
            env_keys: &["LEADBRIDGE_SALESFORCE_CLIENT_ID", "SF_CLIENT_ID"],
        },
        Field {
            key: "salesforce.client_secret",
            value: "<redacted>".to_string(),
            env_keys: &["LEADBRIDGE_SALESFORCE_CLIENT_SECRET", "SF_CLIENT_SECRET"],
        },
        Field {
            key: "salesforce.refresh_token",
            value: "<redacted>".to_string(),
            env_keys: &["LEADBRIDGE_SALESFORCE_REFRESH_TOKEN", "SF_REFRESH_TOKEN"],
        },
        Field {
            key: "salesforce.api_version",
            value: salesforce.api_version.clone(),
            env_keys: &["LEADBRIDGE_SALESFORCE_API_VERSION", "SF_API_VERSION"],
        },
        Field {
            key: "auth.token_ttl_secs",
            value: config.auth.token_ttl_secs.to_string(),
            env_keys: &["LEADBRIDGE_AUTH_TOKEN_TTL_SECS"],
        },
        Field {
            key: "http.timeout_secs",
            value: config.http.timeout_secs.to_string(),
            env_keys: &["LEADBRIDGE_HTTP_TIMEOUT_SECS"],
        },
        Field {
            key: "conversion.max_attempts",
            value: config.conversion.max_attempts.to_string(),
            env_keys: &["LEADBRIDGE_CONVERSION_MAX_ATTEMPTS"],
        },
        Field {
            key: "conversion.backoff_unit_ms",
            value: config.conversion.backoff_unit_ms.to_string(),
            env_keys: &["LEADBRIDGE_CONVERSION_BACKOFF_UNIT_MS"],
        },
        Field {
            key: "conversion.attempt_budget_secs",
            value: config.conversion.attempt_budget_secs.to_string(),
            env_keys: &["LEADBRIDGE_CONVERSION_ATTEMPT_BUDGET_SECS"],
        },
        Field {
            key: "conversion.converted_status",
            value: config.conversion.converted_status.clone(),
            env_keys: &["LEADBRIDGE_CONVERSION_CONVERTED_STATUS"],
        },
        Field {
            key: "conversion.create_opportunity",
            value: config.conversion.create_opportunity.to_string(),
            env_keys: &["LEADBRIDGE_CONVERSION_CREATE_OPPORTUNITY"],
        },
        Field {
            key: "service.operation_timeout_secs",
            value: config.service.operation_timeout_secs.to_string(),
            env_keys: &["LEADBRIDGE_SERVICE_OPERATION_TIMEOUT_SECS"],
        },
        Field {
            key: "logging.level",
            value: config.logging.level.clone(),
            env_keys: &["LEADBRIDGE_LOGGING_LEVEL", "LEADBRIDGE_LOG_LEVEL"],
        },
        Field {
            key: "logging.format",
            value: format!("{:?}", config.logging.format).to_lowercase(),
            env_keys: &["LEADBRIDGE_LOGGING_FORMAT", "LEADBRIDGE_LOG_FORMAT"],
        },
    ]
}

fn detect_config_path(explicit_path: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path);
    }

    [PathBuf::from("leadbridge.toml"), PathBuf::from("config/leadbridge.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    field: &Field,
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = field.env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, field.key) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

/// Consumer keys are long; the first six characters identify the app.
fn redact_client_id(client_id: &str) -> String {
    let trimmed = client_id.trim();
    match trimmed.char_indices().nth(6) {
        Some((cut, _)) => format!("{}***", &trimmed[..cut]),
        None => "<redacted>".to_string(),
    }
}
