use crate::domain::DomainError;

/// True for lower-case identifiers that need no escaping beyond double quotes.
pub fn is_safe_ident(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Quote a table or column name for interpolation into SQL text.
///
/// Table and metric names come from configuration, so only a conservative
/// identifier alphabet is accepted.
pub fn quote_ident(name: &str) -> Result<String, DomainError> {
    if is_safe_ident(name) {
        Ok(format!("\"{name}\""))
    } else {
        Err(DomainError::InvalidIdentifier(name.to_string()))
    }
}

/// Quote a possibly schema-qualified table name (`schema.table`).
pub fn quote_table(name: &str) -> Result<String, DomainError> {
    let parts = name
        .split('.')
        .map(quote_ident)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| DomainError::InvalidIdentifier(name.to_string()))?;
    if parts.is_empty() || parts.len() > 2 {
        return Err(DomainError::InvalidIdentifier(name.to_string()));
    }
    Ok(parts.join("."))
}
