//! `name=value` parameter expressions, as passed on a command line.

use crate::{Error, Result, Value};

/// Parse `name=value`.
///
/// The name is made of ASCII alphanumerics and `_`. The value is read as a
/// JSON literal (`1`, `2.5`, `true`, `null`, `"x"`, `[1,2]`); anything else
/// is taken as a bare string.
///
/// # Errors
/// `ParseError` if the expression is not of the `name=value` form.
pub fn parse_parameter(expr: &str) -> Result<(String, Value)> {
    let invalid = || Error::ParseError(expr.to_string());

    let (name, value) = expr.split_once('=').ok_or_else(invalid)?;
    let valid_name = !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    let valid_value = !value.is_empty() && !value.chars().any(char::is_whitespace);
    if !valid_name || !valid_value {
        return Err(invalid());
    }

    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((name.to_string(), value))
}

/// Parse every expression of `args`, later names overriding earlier ones.
///
/// # Errors
/// The first `ParseError` encountered.
pub fn parse_arguments<I, S>(args: I) -> Result<Vec<(String, Value)>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed: Vec<(String, Value)> = Vec::new();
    for arg in args {
        let (name, value) = parse_parameter(arg.as_ref())?;
        match parsed.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => parsed.push((name, value)),
        }
    }
    Ok(parsed)
}
