//! Query builder for record reads. Values only ever enter a statement through
//! [`escape_literal`]; field names come from a closed enum.

use leadbridge_core::{Email, Record, RecordStatus, RECORD_FIELDS};

pub const MAX_QUERY_LIMIT: u32 = 100;
const OBJECT_NAME: &str = "Lead";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FilterField {
    Email,
    Status,
}

impl FilterField {
    pub fn api_name(&self) -> &'static str {
        match self {
            Self::Email => "Email",
            Self::Status => "Status",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Predicate {
    pub field: FilterField,
    pub value: String,
}

impl Predicate {
    pub fn matches(&self, record: &Record) -> bool {
        match self.field {
            FilterField::Email => record.email.as_deref() == Some(self.value.as_str()),
            FilterField::Status => {
                record.status.as_ref().map(RecordStatus::as_str) == Some(self.value.as_str())
            }
        }
    }
}

/// Conjunction of equality predicates.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordFilter {
    predicates: Vec<Predicate>,
}

impl RecordFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn email_eq(mut self, email: &Email) -> Self {
        self.predicates
            .push(Predicate { field: FilterField::Email, value: email.as_str().to_string() });
        self
    }

    pub fn status_eq(mut self, status: &RecordStatus) -> Self {
        self.predicates
            .push(Predicate { field: FilterField::Status, value: status.as_str().to_string() });
        self
    }

    pub fn predicates(&self) -> &[Predicate] {
        &self.predicates
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.predicates.iter().all(|predicate| predicate.matches(record))
    }

    pub fn where_clause(&self) -> Option<String> {
        if self.predicates.is_empty() {
            return None;
        }
        let clauses: Vec<String> = self
            .predicates
            .iter()
            .map(|predicate| {
                format!("{} = '{}'", predicate.field.api_name(), escape_literal(&predicate.value))
            })
            .collect();
        Some(clauses.join(" AND "))
    }
}

/// Escapes a value for use inside a single-quoted string literal.
pub fn escape_literal(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '\'' => escaped.push_str("\\'"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            '\u{8}' => escaped.push_str("\\b"),
            '\u{c}' => escaped.push_str("\\f"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Builds the select statement; `limit` is clamped to `1..=100`.
pub fn select_statement(filter: &RecordFilter, limit: u32) -> String {
    let limit = limit.clamp(1, MAX_QUERY_LIMIT);
    let mut statement = format!("SELECT {} FROM {OBJECT_NAME}", RECORD_FIELDS.join(", "));
    if let Some(clause) = filter.where_clause() {
        statement.push_str(" WHERE ");
        statement.push_str(&clause);
    }
    statement.push_str(&format!(" ORDER BY CreatedDate ASC, Id ASC LIMIT {limit}"));
    statement
}

#[cfg(test)]
mod tests {
    use leadbridge_core::{Email, RecordStatus};

    use super::{escape_literal, select_statement, RecordFilter};

    #[test]
    fn unfiltered_statement_selects_record_columns_with_limit() {
        assert_eq!(
            select_statement(&RecordFilter::new(), 50),
            "SELECT Id, Email, FirstName, LastName, Phone, Company, Status, IsConverted \
             FROM Lead ORDER BY CreatedDate ASC, Id ASC LIMIT 50"
        );
    }

    #[test]
    fn limit_is_capped_at_one_hundred() {
        assert!(select_statement(&RecordFilter::new(), 5000).ends_with("LIMIT 100"));
        assert!(select_statement(&RecordFilter::new(), 0).ends_with("LIMIT 1"));
    }

    #[test]
    fn predicates_are_joined_and_escaped() {
        let email = Email::parse("o'brien@x.com").expect("email");
        let filter = RecordFilter::new()
            .email_eq(&email)
            .status_eq(&RecordStatus::Other("Open' OR Name != '".to_string()));

        let clause = filter.where_clause().expect("clause");
        assert_eq!(clause, "Email = 'o\\'brien@x.com' AND Status = 'Open\\' OR Name != \\''");
    }

    #[test]
    fn escape_handles_control_characters_and_backslashes() {
        assert_eq!(escape_literal("a\\b\n\"c\""), "a\\\\b\\n\\\"c\\\"");
        assert_eq!(escape_literal("plain"), "plain");
    }
}
