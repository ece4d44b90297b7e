//! Minimal message selectors: `key = 'value'` clauses joined by `AND`.

use brokerpool_traits::{BrokerError, BrokerResult, Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Selector {
    clauses: Vec<(String, String)>,
}

impl Selector {
    /// Parses a selector. Blank input means "no selector".
    pub(crate) fn parse(expression: &str) -> BrokerResult<Option<Self>> {
        if expression.trim().is_empty() {
            return Ok(None);
        }

        let mut clauses = Vec::new();
        for clause in split_and(expression) {
            let invalid = || BrokerError::InvalidSelector(expression.to_string());
            let (key, value) = clause.split_once('=').ok_or_else(invalid)?;
            let key = key.trim();
            if key.is_empty()
                || !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
            {
                return Err(invalid());
            }
            let value = value
                .trim()
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(invalid)?;
            clauses.push((key.to_string(), value.to_string()));
        }

        Ok(Some(Self { clauses }))
    }

    pub(crate) fn matches(&self, message: &Message) -> bool {
        self.clauses.iter().all(|(key, expected)| {
            let actual = match key.as_str() {
                "JMSType" | "type" => message.message_type.as_deref(),
                "JMSCorrelationID" => message.correlation_id.as_deref(),
                other => message.property(other),
            };
            actual == Some(expected.as_str())
        })
    }
}

// ASCII uppercasing keeps byte offsets, so positions found in the uppercased
// copy can slice the original.
fn split_and(expression: &str) -> Vec<&str> {
    let upper = expression.to_ascii_uppercase();
    let mut parts = Vec::new();
    let mut start = 0;
    while let Some(found) = upper[start..].find(" AND ") {
        parts.push(&expression[start..start + found]);
        start += found + " AND ".len();
    }
    parts.push(&expression[start..]);
    parts
}
