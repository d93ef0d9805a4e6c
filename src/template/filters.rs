//! Custom template filters

use minijinja::value::Value;
use minijinja::{Error, ErrorKind, State};

/// Register all custom filters with a minijinja Environment
pub fn register_filters(env: &mut minijinja::Environment) {
    env.add_filter("shell_escape", filter_shell_escape);
    env.add_filter("json", filter_json);
    env.add_filter("lines", filter_lines);
    env.add_filter("tail", filter_tail);
    env.add_filter("strftime", filter_strftime);
}

/// Escape a string for safe shell interpolation
///
/// Example: `hello 'world'` becomes `'hello '\''world'\''`
fn filter_shell_escape(_state: &State, value: Value) -> Result<Value, Error> {
    let s = value.to_string();

    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '/'))
    {
        return Ok(Value::from(s));
    }

    let mut escaped = String::with_capacity(s.len() + 10);
    escaped.push('\'');
    for c in s.chars() {
        if c == '\'' {
            escaped.push_str("'\\''");
        } else {
            escaped.push(c);
        }
    }
    escaped.push('\'');

    Ok(Value::from(escaped))
}

/// Serialize value to JSON string
fn filter_json(_state: &State, value: Value) -> Result<Value, Error> {
    let json = serde_json::to_string(&value).map_err(|e| {
        Error::new(
            ErrorKind::InvalidOperation,
            format!("JSON serialization failed: {}", e),
        )
    })?;
    Ok(Value::from(json))
}

/// Split a string into lines
fn filter_lines(_state: &State, value: Value) -> Result<Value, Error> {
    let s = value.to_string();
    Ok(Value::from_iter(s.lines().map(|l| Value::from(l.to_string()))))
}

/// Keep only the last `n` lines of a string (default 20)
///
/// Handy for feeding long loop outputs back into a prompt:
/// `{{ loop.previous_output | tail(5) }}`
fn filter_tail(_state: &State, value: Value, count: Option<usize>) -> Result<Value, Error> {
    let s = value.to_string();
    let count = count.unwrap_or(20);
    let lines: Vec<&str> = s.lines().collect();
    let start = lines.len().saturating_sub(count);
    Ok(Value::from(lines[start..].join("\n")))
}

/// Format a timestamp using a strftime format string
///
/// If the input is the string "now", uses the current UTC time.
/// Otherwise the input is parsed as an RFC3339 timestamp.
fn filter_strftime(_state: &State, value: Value, format: Value) -> Result<Value, Error> {
    let format_str = format.as_str().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidOperation,
            "strftime filter requires format string as argument",
        )
    })?;

    let datetime = match value.as_str() {
        Some("now") => chrono::Utc::now(),
        Some(s) => chrono::DateTime::parse_from_rfc3339(s)
            .map_err(|e| {
                Error::new(
                    ErrorKind::InvalidOperation,
                    format!("Failed to parse datetime: {}", e),
                )
            })?
            .with_timezone(&chrono::Utc),
        None => {
            return Err(Error::new(
                ErrorKind::InvalidOperation,
                "strftime filter requires string input (\"now\" or RFC3339 timestamp)",
            ));
        }
    };

    Ok(Value::from(datetime.format(format_str).to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use minijinja::Environment;

    fn render(template: &str, ctx: Value) -> String {
        let mut env = Environment::new();
        register_filters(&mut env);
        env.add_template("test", template).unwrap();
        env.get_template("test").unwrap().render(ctx).unwrap()
    }

    #[test]
    fn test_shell_escape() {
        let plain = render(
            "{{ value | shell_escape }}",
            minijinja::context! { value => "src/main.rs" },
        );
        assert_eq!(plain, "src/main.rs");

        let quoted = render(
            "{{ value | shell_escape }}",
            minijinja::context! { value => "it's a test" },
        );
        assert_eq!(quoted, "'it'\\''s a test'");
    }

    #[test]
    fn test_json_filter_array() {
        let result = render(
            "{{ value | json }}",
            minijinja::context! { value => vec!["a", "b"] },
        );
        assert_eq!(result, "[\"a\",\"b\"]");
    }

    #[test]
    fn test_tail_filter() {
        let result = render(
            "{{ value | tail(2) }}",
            minijinja::context! { value => "one\ntwo\nthree" },
        );
        assert_eq!(result, "two\nthree");

        let short = render(
            "{{ value | tail(10) }}",
            minijinja::context! { value => "only" },
        );
        assert_eq!(short, "only");
    }

    #[test]
    fn test_lines_filter() {
        let result = render(
            "{{ value | lines | length }}",
            minijinja::context! { value => "a\nb\nc" },
        );
        assert_eq!(result, "3");
    }

    #[test]
    fn test_strftime_filter_rfc3339() {
        let result = render(
            "{{ timestamp | strftime(\"%Y-%m-%d\") }}",
            minijinja::context! { timestamp => "2026-02-14T12:34:56Z" },
        );
        assert_eq!(result, "2026-02-14");
    }
}
