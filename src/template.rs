//! Query template compilation.
//!
//! Two independent tools live here:
//!
//! - [`compile`] expands `{{ name }}` macro blocks against a substitution map.
//!   Expansion is iterative (a substituted value may itself contain blocks)
//!   and bounded to [`MAX_EXPANSION_PASSES`] passes. Anything still unexpanded
//!   after that is left in the SQL text as-is and logged. A block naming a
//!   value that is not in the map is an error, not literal SQL.
//! - [`positional`] (and the [`sql_template!`](crate::sql_template) macro)
//!   interleave literal SQL fragments with `$1..$N` placeholders.
//!
//! Nothing in this module touches a connection.

use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, SqlTemplate};
use serde_json::Value as JsonValue;
use tracing::warn;

/// Named values available to `{{ ... }}` blocks.
pub type Substitutions = serde_json::Map<String, JsonValue>;

/// Upper bound on expansion passes.
pub const MAX_EXPANSION_PASSES: usize = 5;

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Expand macro blocks in `template.query`.
///
/// With no substitutions the template is returned unchanged. Parameter values
/// are never touched. Fails with [`DbError::InvalidInput`] when a block names
/// a value missing from `substitutions`.
pub fn compile(
    template: &SqlTemplate,
    substitutions: Option<&Substitutions>,
) -> DbResult<SqlTemplate> {
    let Some(substitutions) = substitutions else {
        return Ok(template.clone());
    };

    let (query, passes) = expand(&template.query, substitutions)?;
    if query.contains(OPEN) {
        warn!(
            passes,
            query = %query,
            "Query template still contains macro blocks after expansion"
        );
    }

    Ok(SqlTemplate {
        query,
        values: template.values.clone(),
    })
}

/// Run expansion passes until no `{{` remains or the pass limit is reached.
///
/// Returns the expanded text and the number of passes that ran.
pub(crate) fn expand(query: &str, substitutions: &Substitutions) -> DbResult<(String, usize)> {
    let mut current = query.to_string();
    let mut passes = 0;
    while passes < MAX_EXPANSION_PASSES && current.contains(OPEN) {
        current = expand_once(&current, substitutions)?;
        passes += 1;
    }
    Ok((current, passes))
}

/// Replace every `{{ expr }}` block once, left to right.
fn expand_once(input: &str, substitutions: &Substitutions) -> DbResult<String> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find(OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + OPEN.len()..];

        let Some(end) = after_open.find(CLOSE) else {
            // Unterminated block: keep the remainder verbatim.
            out.push_str(&rest[start..]);
            return Ok(out);
        };

        let block = &rest[start..start + OPEN.len() + end + CLOSE.len()];
        let expr = after_open[..end].trim();
        if expr.is_empty() {
            out.push_str(block);
        } else {
            let value = lookup(substitutions, expr).ok_or_else(|| {
                DbError::invalid_input(format!("Template references unknown value '{expr}'"))
            })?;
            out.push_str(&render(value));
        }
        rest = &after_open[end + CLOSE.len()..];
    }

    out.push_str(rest);
    Ok(out)
}

/// Resolve a dotted path (`a.b.0.c`) inside the substitution map.
fn lookup<'a>(substitutions: &'a Substitutions, expr: &str) -> Option<&'a JsonValue> {
    let mut segments = expr.split('.').map(str::trim);
    let mut value = substitutions.get(segments.next()?)?;
    for segment in segments {
        value = match value {
            JsonValue::Object(map) => map.get(segment)?,
            JsonValue::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(value)
}

fn render(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Array(items) => items.iter().map(render).collect::<Vec<_>>().join(","),
        JsonValue::Object(_) => value.to_string(),
    }
}

/// Build a positional-parameter query from literal fragments.
///
/// `positional(&["SELECT * FROM t WHERE a = ", " AND b = ", ""], vec![1.into(), "x".into()])`
/// yields `SELECT * FROM t WHERE a = $1 AND b = $2` with values `[1, "x"]`.
pub fn positional(fragments: &[&str], args: Vec<QueryParam>) -> DbResult<SqlTemplate> {
    if fragments.len() != args.len() + 1 {
        return Err(DbError::invalid_input(format!(
            "Expected {} SQL fragments for {} arguments, got {}",
            args.len() + 1,
            args.len(),
            fragments.len()
        )));
    }

    let mut query = String::from(fragments[0]);
    for (i, fragment) in fragments[1..].iter().enumerate() {
        query.push('$');
        query.push_str(&(i + 1).to_string());
        query.push_str(fragment);
    }

    Ok(SqlTemplate::with_values(query, args))
}

/// Build a positional-parameter [`SqlTemplate`](crate::models::SqlTemplate)
/// from literal fragments and arguments.
///
/// Arguments can be anything convertible into
/// [`QueryParam`](crate::models::QueryParam).
///
/// # Example
///
/// ```
/// use pgpool_lease::sql_template;
///
/// let template = sql_template!(
///     ["SELECT * FROM users WHERE id = ", " AND active = ", ""],
///     7,
///     true
/// )?;
/// assert_eq!(template.query, "SELECT * FROM users WHERE id = $1 AND active = $2");
/// # Ok::<(), pgpool_lease::DbError>(())
/// ```
#[macro_export]
macro_rules! sql_template {
    ([$($fragment:expr),+ $(,)?] $(, $arg:expr)* $(,)?) => {
        $crate::template::positional(
            &[$($fragment),+],
            vec![$($crate::models::QueryParam::from($arg)),*],
        )
    };
}
