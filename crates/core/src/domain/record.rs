use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::errors::CrmError;

/// Columns selected for every record read, in the order the API returns them.
pub const RECORD_FIELDS: &[&str] =
    &["Id", "Email", "FirstName", "LastName", "Phone", "Company", "Status", "IsConverted"];

/// Reason reported when a write is skipped because the record is converted.
pub const ALREADY_FINALIZED: &str = "already_finalized";

/// Reason reported when a write is refused because the record is closed.
pub const CLOSED_NOT_CONVERTED: &str = "not_converted";

const MAX_EMAIL_LEN: usize = 80;
const MAX_NAME_LEN: usize = 80;
const READ_ONLY_FIELDS: &[&str] = &["Id", "IsConverted"];

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub String);

impl RecordId {
    /// Accepts the 15 and 18 character alphanumeric id forms.
    pub fn parse(raw: &str) -> Result<Self, CrmError> {
        let trimmed = raw.trim();
        let valid_len = trimmed.len() == 15 || trimmed.len() == 18;
        if !valid_len || !trimmed.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CrmError::Validation(format!(
                "record id `{trimmed}` must be 15 or 18 alphanumeric characters"
            )));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(String);

impl Email {
    pub fn parse(raw: &str) -> Result<Self, CrmError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(CrmError::Validation("email is required".to_string()));
        }
        if trimmed.len() > MAX_EMAIL_LEN {
            return Err(CrmError::Validation(format!(
                "email must be at most {MAX_EMAIL_LEN} characters"
            )));
        }
        let well_formed = match trimmed.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty()
                    && domain.contains('.')
                    && !domain.starts_with('.')
                    && !domain.ends_with('.')
                    && !domain.contains('@')
            }
            None => false,
        };
        if !well_formed || trimmed.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(CrmError::Validation(format!("email `{trimmed}` is not a valid address")));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum RecordStatus {
    Open,
    Contacted,
    Qualified,
    NotConverted,
    Converted,
    Other(String),
}

impl RecordStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Open => "Open",
            Self::Contacted => "Contacted",
            Self::Qualified => "Qualified",
            Self::NotConverted => "Not Converted",
            Self::Converted => "Converted",
            Self::Other(value) => value,
        }
    }

    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "Open" => Self::Open,
            "Contacted" => Self::Contacted,
            "Qualified" => Self::Qualified,
            "Not Converted" => Self::NotConverted,
            "Converted" => Self::Converted,
            other => Self::Other(other.to_string()),
        }
    }

    /// A record marked "Not Converted" has been closed out and accepts no
    /// further status changes.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::NotConverted)
    }
}

impl Serialize for RecordStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RecordStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "Id")]
    pub id: RecordId,
    #[serde(rename = "Email", default)]
    pub email: Option<String>,
    #[serde(rename = "FirstName", default)]
    pub first_name: Option<String>,
    #[serde(rename = "LastName", default)]
    pub last_name: Option<String>,
    #[serde(rename = "Phone", default)]
    pub phone: Option<String>,
    #[serde(rename = "Company", default)]
    pub company: Option<String>,
    #[serde(rename = "Status", default)]
    pub status: Option<RecordStatus>,
    #[serde(rename = "IsConverted", default)]
    pub is_converted: bool,
}

impl Record {
    pub fn is_closed(&self) -> bool {
        self.status.as_ref().map(RecordStatus::is_closed).unwrap_or(false)
    }
}

/// Writable field map sent on create and update.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RecordFields {
    #[serde(rename = "Email", skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "LastName", skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(rename = "FirstName", skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(rename = "Phone", skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(rename = "Company", skip_serializing_if = "Option::is_none")]
    pub company: Option<String>,
    #[serde(rename = "Status", skip_serializing_if = "Option::is_none")]
    pub status: Option<RecordStatus>,
    #[serde(rename = "LeadSource", skip_serializing_if = "Option::is_none")]
    pub lead_source: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl RecordFields {
    /// Builds a field set from a caller-supplied map of API field names.
    pub fn from_map(map: BTreeMap<String, Value>) -> Result<Self, CrmError> {
        let mut fields = Self::default();
        for (name, value) in map {
            validate_field_name(&name)?;
            match name.as_str() {
                "Email" => fields.email = Some(Email::parse(&string_value(&name, &value)?)?.0),
                "LastName" => fields.last_name = Some(string_value(&name, &value)?),
                "FirstName" => fields.first_name = Some(string_value(&name, &value)?),
                "Phone" => fields.phone = Some(string_value(&name, &value)?),
                "Company" => fields.company = Some(string_value(&name, &value)?),
                "Status" => {
                    fields.status = Some(RecordStatus::parse(&string_value(&name, &value)?))
                }
                "LeadSource" => fields.lead_source = Some(string_value(&name, &value)?),
                _ => {
                    fields.extra.insert(name, value);
                }
            }
        }
        Ok(fields)
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none()
            && self.last_name.is_none()
            && self.first_name.is_none()
            && self.phone.is_none()
            && self.company.is_none()
            && self.status.is_none()
            && self.lead_source.is_none()
            && self.extra.is_empty()
    }

    /// Field set for a fresh record; `LastName` and `Company` are required remotely.
    pub fn validate_for_create(&self) -> Result<(), CrmError> {
        let last_name = self.last_name.as_deref().map(str::trim).unwrap_or_default();
        if last_name.is_empty() {
            return Err(CrmError::Validation("last name is required".to_string()));
        }
        if last_name.len() > MAX_NAME_LEN {
            return Err(CrmError::Validation(format!(
                "last name must be at most {MAX_NAME_LEN} characters"
            )));
        }
        let company = self.company.as_deref().map(str::trim).unwrap_or_default();
        if company.is_empty() {
            return Err(CrmError::Validation("company is required".to_string()));
        }
        Ok(())
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn validate_field_name(name: &str) -> Result<(), CrmError> {
    let mut chars = name.chars();
    let starts_alpha = chars.next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false);
    if !starts_alpha || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CrmError::Validation(format!("`{name}` is not a valid field name")));
    }
    // Field names are case-insensitive remotely.
    if READ_ONLY_FIELDS.iter().any(|field| field.eq_ignore_ascii_case(name)) {
        return Err(CrmError::Validation(format!("`{name}` is read-only")));
    }
    Ok(())
}

fn string_value(name: &str, value: &Value) -> Result<String, CrmError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| CrmError::Validation(format!("`{name}` must be a string")))
}
