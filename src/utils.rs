// ABOUTME: Utility functions for identifier handling, URL sanitizing and retries
// ABOUTME: Shared by the Postgres collaborators, configuration and CLI

use anyhow::{bail, Result};
use std::time::Duration;

/// Validate a name used as a SQL identifier or a pipeline/check name
///
/// Accepts letters, digits and underscores, starting with a letter or
/// underscore, up to PostgreSQL's 63 character limit.
///
/// # Examples
///
/// ```
/// # use database_rollup::utils::validate_identifier;
/// assert!(validate_identifier("sales_rollup").is_ok());
/// assert!(validate_identifier("123db").is_err());
/// assert!(validate_identifier("db\"; DROP TABLE users; --").is_err());
/// ```
pub fn validate_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        bail!("Identifier cannot be empty or whitespace-only");
    }

    if trimmed.len() > 63 {
        bail!(
            "Identifier '{}' exceeds maximum length of 63 characters (got {})",
            sanitize_identifier(trimmed),
            trimmed.len()
        );
    }

    let first_char = trimmed.chars().next().unwrap_or('_');
    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        bail!(
            "Identifier '{}' must start with a letter or underscore, not '{}'",
            sanitize_identifier(trimmed),
            first_char
        );
    }

    for (i, c) in trimmed.chars().enumerate() {
        if !c.is_ascii_alphanumeric() && c != '_' {
            bail!(
                "Identifier '{}' contains invalid character '{}' at position {}. \
                 Only letters, digits, and underscores are allowed",
                sanitize_identifier(trimmed),
                if c.is_control() {
                    format!("\\x{:02x}", c as u32)
                } else {
                    c.to_string()
                },
                i
            );
        }
    }

    Ok(())
}

/// Validate an optionally schema-qualified table name (`table` or `schema.table`).
pub fn validate_table_name(name: &str) -> Result<()> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        bail!(
            "Table must be specified as 'table' or 'schema.table', got '{}'",
            sanitize_identifier(name)
        );
    }
    for part in parts {
        validate_identifier(part)?;
    }
    Ok(())
}

/// Remove control characters and cap the length, for display only.
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a PostgreSQL identifier, escaping embedded quotes.
pub fn quote_ident(identifier: &str) -> String {
    let mut quoted = String::with_capacity(identifier.len() + 2);
    quoted.push('"');
    for ch in identifier.chars() {
        if ch == '"' {
            quoted.push('"');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Quote a possibly schema-qualified name part by part.
///
/// ```
/// # use database_rollup::utils::quote_qualified;
/// assert_eq!(quote_qualified("public.sales"), "\"public\".\"sales\"");
/// assert_eq!(quote_qualified("sales"), "\"sales\"");
/// ```
pub fn quote_qualified(name: &str) -> String {
    name.split('.')
        .map(quote_ident)
        .collect::<Vec<_>>()
        .join(".")
}

/// Replace the password of a connection URL for logging.
pub fn sanitize_url(url: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(url) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
        }
        parsed.to_string()
    } else {
        url.to_string()
    }
}

/// Retry an async operation with exponential backoff
///
/// `max_retries` counts retries after the first attempt; the delay doubles
/// after every failure.
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    max_retries: u32,
    initial_delay: Duration,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut last_error = None;

    for attempt in 0..=max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                last_error = Some(e);

                if attempt < max_retries {
                    tracing::warn!(
                        "Operation failed (attempt {}/{}), retrying in {:?}...",
                        attempt + 1,
                        max_retries + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Operation failed after retries")))
}
