//! Legacy `convertLead` RPC: envelope builder, response parser and the
//! transport the conversion orchestrator drives.

use std::sync::Arc;

use async_trait::async_trait;
use leadbridge_core::config::ConversionConfig;
use leadbridge_core::{CrmError, CrmResult, RecordId};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::reader::NsReader;
use reqwest::StatusCode;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::dispatch::RequestDispatcher;

pub const PARTNER_NS: &str = "urn:partner.soap.sforce.com";
pub const ENTERPRISE_NS: &str = "urn:enterprise.soap.sforce.com";
const ENVELOPE_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
const INVALID_SESSION: &str = "INVALID_SESSION_ID";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConvertLeadRequest {
    pub record_id: RecordId,
    pub converted_status: String,
    pub create_opportunity: bool,
}

/// Parsed `convertLead` reply. Only `Success` counts as confirmation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConvertResponse {
    Success { account_id: Option<String>, contact_id: Option<String> },
    Failure { messages: Vec<String> },
    Fault { code: String, message: String },
    Ambiguous(String),
}

impl ConvertResponse {
    pub fn describe(&self) -> String {
        match self {
            Self::Success { .. } => "success".to_string(),
            Self::Failure { messages } if messages.is_empty() => {
                "convertLead reported success=false".to_string()
            }
            Self::Failure { messages } => format!("convertLead failed: {}", messages.join("; ")),
            Self::Fault { code, message } => format!("SOAP fault {code}: {message}"),
            Self::Ambiguous(detail) => format!("ambiguous convertLead response: {detail}"),
        }
    }

    pub fn is_invalid_session(&self) -> bool {
        matches!(self, Self::Fault { code, .. } if code.ends_with(INVALID_SESSION))
    }
}

pub fn build_convert_envelope(session_id: &str, request: &ConvertLeadRequest) -> String {
    format!(
        concat!(
            r#"<?xml version="1.0" encoding="UTF-8"?>"#,
            r#"<soapenv:Envelope xmlns:soapenv="{envelope}" xmlns:urn="{partner}">"#,
            "<soapenv:Header><urn:SessionHeader><urn:sessionId>{session}</urn:sessionId>",
            "</urn:SessionHeader></soapenv:Header>",
            "<soapenv:Body><urn:convertLead><urn:leadConverts>",
            "<urn:convertedStatus>{status}</urn:convertedStatus>",
            "<urn:doNotCreateOpportunity>{no_opportunity}</urn:doNotCreateOpportunity>",
            "<urn:leadId>{lead_id}</urn:leadId>",
            "</urn:leadConverts></urn:convertLead></soapenv:Body></soapenv:Envelope>"
        ),
        envelope = ENVELOPE_NS,
        partner = PARTNER_NS,
        session = escape(session_id),
        status = escape(request.converted_status.as_str()),
        no_opportunity = !request.create_opportunity,
        lead_id = escape(request.record_id.as_str()),
    )
}

fn is_result_namespace(ns: &ResolveResult<'_>) -> bool {
    matches!(
        ns,
        ResolveResult::Bound(Namespace(uri))
            if *uri == PARTNER_NS.as_bytes() || *uri == ENTERPRISE_NS.as_bytes()
    )
}

pub fn parse_convert_response(body: &str) -> ConvertResponse {
    let mut reader = NsReader::from_str(body);
    reader.config_mut().trim_text(true);

    // (element in result namespace, local name)
    let mut stack: Vec<(bool, String)> = Vec::new();
    let mut success: Option<String> = None;
    let mut account_id = None;
    let mut contact_id = None;
    let mut messages = Vec::new();
    let mut fault_code: Option<String> = None;
    let mut fault_string = String::new();
    let mut saw_fault = false;

    loop {
        match reader.read_resolved_event() {
            Ok((ns, Event::Start(element))) => {
                let local = String::from_utf8_lossy(element.local_name().as_ref()).into_owned();
                if local == "Fault" {
                    saw_fault = true;
                }
                stack.push((is_result_namespace(&ns), local));
            }
            Ok((_, Event::End(_))) => {
                stack.pop();
            }
            Ok((_, Event::Text(text))) => {
                let value = match text.unescape() {
                    Ok(value) => value.into_owned(),
                    Err(error) => return ConvertResponse::Ambiguous(error.to_string()),
                };
                match stack.last() {
                    Some((true, name)) if name == "success" => {
                        success.get_or_insert(value);
                    }
                    Some((true, name)) if name == "accountId" => account_id = Some(value),
                    Some((true, name)) if name == "contactId" => contact_id = Some(value),
                    Some((true, name)) if name == "message" => messages.push(value),
                    Some((_, name)) if saw_fault && name == "faultcode" => {
                        fault_code = Some(value);
                    }
                    Some((_, name)) if saw_fault && name == "faultstring" => {
                        fault_string = value;
                    }
                    _ => {}
                }
            }
            Ok((_, Event::Eof)) => break,
            Ok(_) => {}
            Err(error) => return ConvertResponse::Ambiguous(error.to_string()),
        }
    }

    if let Some(code) = fault_code {
        return ConvertResponse::Fault { code, message: fault_string };
    }
    match success.as_deref().map(str::trim) {
        Some("true") => ConvertResponse::Success { account_id, contact_id },
        Some("false") => ConvertResponse::Failure { messages },
        Some(other) => ConvertResponse::Ambiguous(format!("success flag was `{other}`")),
        None => ConvertResponse::Ambiguous("no success indicator in response".to_string()),
    }
}

/// Only a 2xx reply confirms or rejects the conversion. Any other status is
/// ambiguous unless its body is a SOAP fault.
fn interpret_reply(status: StatusCode, body: &str) -> ConvertResponse {
    let parsed = parse_convert_response(body);
    if status.is_success() {
        return parsed;
    }
    match parsed {
        fault @ ConvertResponse::Fault { .. } => fault,
        ConvertResponse::Ambiguous(detail) => {
            ConvertResponse::Ambiguous(format!("HTTP {}: {detail}", status.as_u16()))
        }
        other => {
            ConvertResponse::Ambiguous(format!("HTTP {}: {}", status.as_u16(), other.describe()))
        }
    }
}

/// One attempt at the conversion RPC.
#[async_trait]
pub trait ConversionTransport: Send + Sync {
    async fn convert(&self, record_id: &RecordId) -> CrmResult<ConvertResponse>;
}

pub struct SoapConversionTransport {
    dispatcher: Arc<RequestDispatcher>,
    endpoint_path: String,
    converted_status: String,
    create_opportunity: bool,
}

impl SoapConversionTransport {
    pub fn new(
        dispatcher: Arc<RequestDispatcher>,
        soap_version: &str,
        conversion: &ConversionConfig,
    ) -> Self {
        Self {
            dispatcher,
            endpoint_path: format!("/services/Soap/u/{soap_version}"),
            converted_status: conversion.converted_status.clone(),
            create_opportunity: conversion.create_opportunity,
        }
    }
}

#[async_trait]
impl ConversionTransport for SoapConversionTransport {
    async fn convert(&self, record_id: &RecordId) -> CrmResult<ConvertResponse> {
        let tokens = self.dispatcher.tokens();
        let token = tokens.ensure_valid_token().await?;
        let request = ConvertLeadRequest {
            record_id: record_id.clone(),
            converted_status: self.converted_status.clone(),
            create_opportunity: self.create_opportunity,
        };
        let envelope = build_convert_envelope(token.secret().expose_secret(), &request);
        let url = format!("{}{}", self.dispatcher.instance_url(), self.endpoint_path);

        debug!(event_name = "conversion.rpc.send", record_id = %record_id, "posting convertLead");
        let response = self
            .dispatcher
            .http()
            .post(&url)
            .header("Content-Type", "text/xml; charset=UTF-8")
            .header("SOAPAction", "convertLead")
            .body(envelope)
            .send()
            .await
            .map_err(|error| CrmError::Transport(format!("convertLead: {error}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| CrmError::Transport(format!("convertLead body: {error}")))?;

        let parsed = interpret_reply(status, &body);

        if parsed.is_invalid_session() {
            warn!(
                event_name = "conversion.rpc.invalid_session",
                record_id = %record_id,
                "convertLead rejected the session; refreshing token"
            );
            tokens.refresh_after_rejection(&token).await?;
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use leadbridge_core::RecordId;

    use reqwest::StatusCode;

    use super::{
        build_convert_envelope, interpret_reply, parse_convert_response, ConvertLeadRequest,
        ConvertResponse,
    };

    fn request(status: &str) -> ConvertLeadRequest {
        ConvertLeadRequest {
            record_id: RecordId("00Q5g00000AbCdEAAA".to_string()),
            converted_status: status.to_string(),
            create_opportunity: false,
        }
    }

    #[test]
    fn envelope_escapes_markup_in_values() {
        let envelope = build_convert_envelope("tok<&>", &request("Closed </urn:convertedStatus>"));

        assert!(envelope.contains("<urn:sessionId>tok&lt;&amp;&gt;</urn:sessionId>"));
        assert!(envelope.contains(
            "<urn:convertedStatus>Closed &lt;/urn:convertedStatus&gt;</urn:convertedStatus>"
        ));
        assert!(envelope.contains("<urn:doNotCreateOpportunity>true</urn:doNotCreateOpportunity>"));
        assert!(envelope.contains("<urn:leadId>00Q5g00000AbCdEAAA</urn:leadId>"));
    }

    #[test]
    fn explicit_success_in_partner_namespace_is_confirmation() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns="urn:partner.soap.sforce.com">
  <soapenv:Body>
    <convertLeadResponse>
      <result>
        <accountId>001000000000001AAA</accountId>
        <contactId>003000000000001AAA</contactId>
        <leadId>00Q5g00000AbCdEAAA</leadId>
        <opportunityId xsi:nil="true" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"/>
        <success>true</success>
      </result>
    </convertLeadResponse>
  </soapenv:Body>
</soapenv:Envelope>"#;

        assert_eq!(
            parse_convert_response(body),
            ConvertResponse::Success {
                account_id: Some("001000000000001AAA".to_string()),
                contact_id: Some("003000000000001AAA".to_string()),
            }
        );
    }

    #[test]
    fn enterprise_namespace_with_prefix_is_accepted() {
        let body = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/" xmlns:e="urn:enterprise.soap.sforce.com">
<s:Body><e:convertLeadResponse><e:result><e:success>true</e:success></e:result></e:convertLeadResponse></s:Body></s:Envelope>"#;

        assert!(matches!(parse_convert_response(body), ConvertResponse::Success { .. }));
    }

    #[test]
    fn success_outside_result_namespace_is_ambiguous() {
        let body = r#"<Envelope><Body><result><success>true</success></result></Body></Envelope>"#;

        assert!(matches!(parse_convert_response(body), ConvertResponse::Ambiguous(_)));
    }

    #[test]
    fn explicit_failure_collects_error_messages() {
        let body = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns="urn:partner.soap.sforce.com">
<soapenv:Body><convertLeadResponse><result>
<errors><message>Converted status is invalid</message><statusCode>INVALID_STATUS</statusCode></errors>
<success>false</success>
</result></convertLeadResponse></soapenv:Body></soapenv:Envelope>"#;

        assert_eq!(
            parse_convert_response(body),
            ConvertResponse::Failure { messages: vec!["Converted status is invalid".to_string()] }
        );
    }

    #[test]
    fn soap_fault_is_reported_with_code() {
        let body = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:sf="urn:fault.partner.soap.sforce.com">
<soapenv:Body><soapenv:Fault><faultcode>sf:INVALID_SESSION_ID</faultcode>
<faultstring>INVALID_SESSION_ID: Session expired or invalid</faultstring>
</soapenv:Fault></soapenv:Body></soapenv:Envelope>"#;

        let parsed = parse_convert_response(body);
        assert!(parsed.is_invalid_session());
        assert!(parsed.describe().contains("Session expired"));
    }

    #[test]
    fn error_status_never_confirms_even_with_success_body() {
        let body = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
<soapenv:Body><convertLeadResponse xmlns="urn:partner.soap.sforce.com"><result>
<success>true</success></result></convertLeadResponse></soapenv:Body></soapenv:Envelope>"#;

        assert!(matches!(
            interpret_reply(StatusCode::OK, body),
            ConvertResponse::Success { .. }
        ));
        match interpret_reply(StatusCode::INTERNAL_SERVER_ERROR, body) {
            ConvertResponse::Ambiguous(detail) => assert!(detail.starts_with("HTTP 500: ")),
            other => panic!("expected ambiguous reply, got {other:?}"),
        }
    }

    #[test]
    fn fault_on_error_status_is_kept() {
        let body = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
<soapenv:Body><soapenv:Fault><faultcode>sf:INVALID_SESSION_ID</faultcode>
<faultstring>INVALID_SESSION_ID: Session expired or invalid</faultstring></soapenv:Fault>
</soapenv:Body></soapenv:Envelope>"#;

        let reply = interpret_reply(StatusCode::INTERNAL_SERVER_ERROR, body);
        assert!(reply.is_invalid_session());
    }

    #[test]
    fn truncated_or_non_xml_bodies_are_ambiguous() {
        assert!(matches!(parse_convert_response(""), ConvertResponse::Ambiguous(_)));
        assert!(matches!(
            parse_convert_response("<html><body>Bad Gateway</body></html>"),
            ConvertResponse::Ambiguous(_)
        ));
        assert!(matches!(
            parse_convert_response("<a xmlns=\"urn:partner.soap.sforce.com\"><success>"),
            ConvertResponse::Ambiguous(_)
        ));
    }
}
