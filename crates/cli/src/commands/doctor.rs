use std::sync::Arc;

use leadbridge_client::CrmClient;
use leadbridge_core::config::{AppConfig, LoadOptions};
use leadbridge_core::PlaintextCredentialStore;
use serde::Serialize;

use super::{CommandResult, EXIT_CONFIG_FAILURE, EXIT_OPERATION_FAILURE};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

pub async fn run(options: LoadOptions, json_output: bool) -> CommandResult {
    let report = build_report(options).await;
    let exit_code = match report.checks.as_slice() {
        [config, ..] if config.status != CheckStatus::Pass => EXIT_CONFIG_FAILURE,
        _ if report.overall_status != CheckStatus::Pass => EXIT_OPERATION_FAILURE,
        _ => 0,
    };

    let output = if json_output {
        serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        })
    } else {
        render_human(&report)
    };

    CommandResult { exit_code, output }
}

async fn build_report(options: LoadOptions) -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(options) {
        Ok(config) => {
            crate::init_logging(&config.logging);
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_token_exchange(&config).await);
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            checks.push(DoctorCheck {
                name: "token_exchange",
                status: CheckStatus::Skipped,
                details: "skipped because configuration did not load".to_string(),
            });
        }
    }

    let all_pass = checks.iter().all(|check| check.status == CheckStatus::Pass);
    let overall_status = if all_pass { CheckStatus::Pass } else { CheckStatus::Fail };
    let summary = if all_pass {
        "doctor: all readiness checks passed".to_string()
    } else {
        "doctor: one or more readiness checks failed".to_string()
    };

    tracing::info!(
        event_name = "doctor.completed",
        overall_status = ?overall_status,
        "doctor checks finished"
    );

    DoctorReport { overall_status, summary, checks }
}

async fn check_token_exchange(config: &AppConfig) -> DoctorCheck {
    let client = match CrmClient::from_config(config, Arc::new(PlaintextCredentialStore)) {
        Ok(client) => client,
        Err(error) => {
            return DoctorCheck {
                name: "token_exchange",
                status: CheckStatus::Fail,
                details: error.to_string(),
            };
        }
    };

    match client.tokens.force_refresh().await {
        Ok(_) => DoctorCheck {
            name: "token_exchange",
            status: CheckStatus::Pass,
            details: format!("access token issued by `{}`", config.salesforce.token_url),
        },
        Err(error) => DoctorCheck {
            name: "token_exchange",
            status: CheckStatus::Fail,
            details: error.to_string(),
        },
    }
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
