//! 🔍 The query builder — where a rule's condition list becomes a bool query.
//!
//! 🎬 *[a JSON object assembles itself in slow motion, clause by clause]*
//! *[the `must` array fills. a single `should` group forms. somewhere,
//! `minimum_should_match` whispers "one. just one."]*
//!
//! 📜 Contract:
//! - The time range is ALWAYS the first `must` clause: `@timestamp ∈ [from, to)`
//!   in UTC, strict ISO-8601, half-open. The half-open part matters — it's what
//!   lets consecutive windows tile without double-counting the boundary doc.
//! - `logic=and` conditions append straight to the outer `must`.
//! - `logic=or` conditions pool into ONE inner `bool.should` with
//!   `minimum_should_match: 1`, appended once at the end.
//! - Results sort ascending by `@timestamp`, so the stored sample is the
//!   *earliest* matches of the window, not a random grab bag.
//!
//! ⚠️ Validation happens HERE, not at config-write time — the config surface
//! is untyped JSON and happily stores `"operator": "vibes"`. We are the ones
//! who have to say no, at execution time, with a usable error message.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Value, json};

use crate::common::{Logic, QueryCondition};
use crate::errors::ExecError;

/// 🔧 The closed operator set, parsed from the many spellings users send.
///
/// 🧠 Knowledge graph: `=`/`==`/`equals` are the same operator wearing three
/// outfits, ditto `!=`/`not_equals` and the symbol/word comparative pairs.
/// Parsing collapses the wardrobe down to one enum so the match arms below
/// stay honest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    Equals,
    NotEquals,
    Gt,
    Gte,
    Lt,
    Lte,
    Contains,
    NotContains,
    Exists,
}

impl Operator {
    fn parse(raw: &str) -> Result<Self, ExecError> {
        match raw {
            "=" | "==" | "equals" => Ok(Self::Equals),
            "!=" | "not_equals" => Ok(Self::NotEquals),
            ">" | "gt" => Ok(Self::Gt),
            ">=" | "gte" => Ok(Self::Gte),
            "<" | "lt" => Ok(Self::Lt),
            "<=" | "lte" => Ok(Self::Lte),
            "contains" => Ok(Self::Contains),
            "not_contains" => Ok(Self::NotContains),
            "exists" => Ok(Self::Exists),
            // 💀 "vibes" is not an operator. Neither is "LIKE". This is not SQL.
            other => Err(ExecError::QueryFailed(format!(
                "unknown operator '{other}' — the config surface let it through, we will not"
            ))),
        }
    }

    fn range_key(self) -> &'static str {
        match self {
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            // callers only hand comparatives to range_key
            _ => unreachable!("range_key called on a non-comparative operator"),
        }
    }
}

/// 🏗️ Builds the full search body from `(conditions, from, to)`.
///
/// The output is exactly what goes over the wire (minus the page `size`,
/// which the search client injects — page size is transport, not semantics):
///
/// ```json
/// {"query":{"bool":{"must":[...]}},"sort":[{"@timestamp":{"order":"asc"}}]}
/// ```
///
/// Deterministic by construction — same inputs, same document, every time.
/// The round-trip test below holds us to that.
pub fn build_search_body(
    conditions: &[QueryCondition],
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Value, ExecError> {
    // 🕰️ The window clause rides first, always. gte/lt = half-open [from, to).
    let mut must: Vec<Value> = vec![json!({
        "range": {
            "@timestamp": {
                "gte": from.to_rfc3339_opts(SecondsFormat::Millis, true),
                "lt": to.to_rfc3339_opts(SecondsFormat::Millis, true),
                "format": "strict_date_optional_time",
            }
        }
    })];

    // 🔀 `and` clauses go straight into `must`; `or` clauses pool here and
    // get wrapped into one should-group at the end.
    let mut should: Vec<Value> = Vec::new();

    for cond in conditions {
        let clause = leaf_clause(cond)?;
        match cond.logic {
            Logic::And => must.push(clause),
            Logic::Or => should.push(clause),
        }
    }

    if !should.is_empty() {
        // 🔀 One group, appended once. `minimum_should_match: 1` turns the
        // pool into a proper OR instead of a scoring suggestion box.
        must.push(json!({
            "bool": { "should": should, "minimum_should_match": 1 }
        }));
    }

    Ok(json!({
        "query": { "bool": { "must": must } },
        "sort": [ { "@timestamp": { "order": "asc" } } ],
    }))
}

/// 🍃 One condition → one leaf clause (possibly wrapped in a `must_not`).
fn leaf_clause(cond: &QueryCondition) -> Result<Value, ExecError> {
    if cond.field.trim().is_empty() {
        return Err(ExecError::QueryFailed(
            "condition has an empty field — nothing to match against".into(),
        ));
    }
    let field = cond.field.as_str();
    let op = Operator::parse(&cond.operator)?;

    let clause = match op {
        Operator::Equals => term_clause(field, &cond.value)?,
        Operator::NotEquals => negate(term_clause(field, &cond.value)?),
        Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
            range_clause(field, op, &cond.value)?
        }
        Operator::Contains => wildcard_clause(field, &cond.value)?,
        Operator::NotContains => negate(wildcard_clause(field, &cond.value)?),
        // `exists` ignores the value entirely — presence is the whole predicate
        Operator::Exists => json!({ "exists": { "field": field } }),
    };
    Ok(clause)
}

/// 🎯 Exact-value match. Scalars only — handing a list or an object to `term`
/// produces ES errors that read like ransom notes, so we reject it here.
fn term_clause(field: &str, value: &Value) -> Result<Value, ExecError> {
    match value {
        Value::String(_) | Value::Number(_) | Value::Bool(_) => {
            Ok(json!({ "term": { field: { "value": value } } }))
        }
        other => Err(ExecError::QueryFailed(format!(
            "equality on '{field}' needs a scalar value, got {other}"
        ))),
    }
}

/// 📏 Comparative match. Numbers compare numerically, strings lexically
/// (dates arrive as strings and that's fine — ES knows what a date is).
fn range_clause(field: &str, op: Operator, value: &Value) -> Result<Value, ExecError> {
    match value {
        Value::Number(_) | Value::String(_) => {
            Ok(json!({ "range": { field: { (op.range_key()): value } } }))
        }
        other => Err(ExecError::QueryFailed(format!(
            "comparison on '{field}' needs a number or string, got {other}"
        ))),
    }
}

/// 🃏 Substring match via `*value*`, case-insensitive, with the user's own
/// wildcard metacharacters defused to literals first.
fn wildcard_clause(field: &str, value: &Value) -> Result<Value, ExecError> {
    let Value::String(needle) = value else {
        return Err(ExecError::QueryFailed(format!(
            "contains on '{field}' needs a string value, got {value}"
        )));
    };
    Ok(json!({
        "wildcard": {
            field: {
                "value": format!("*{}*", escape_wildcard(needle)),
                "case_insensitive": true,
            }
        }
    }))
}

/// 🚫 Wrap a leaf in `bool.must_not` so it can ride inside `must` or `should`
/// without flipping the polarity of its neighbors.
fn negate(clause: Value) -> Value {
    json!({ "bool": { "must_not": [clause] } })
}

/// 🛡️ Escape `*`, `?`, and `\` so a user searching for the literal string
/// `foo*bar` matches `foo*bar` and not `foo<anything>bar`. The backslash goes
/// first in spirit — we escape per-char, so there's no double-pass to get wrong.
fn escape_wildcard(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '*' | '?' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.with_ymd_and_hms(2024, 3, 1, 11, 55, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        )
    }

    fn cond(field: &str, op: &str, value: Value, logic: Logic) -> QueryCondition {
        QueryCondition {
            field: field.into(),
            operator: op.into(),
            value,
            logic,
            legacy_type: None,
        }
    }

    #[test]
    fn the_one_where_the_window_clause_always_rides_shotgun() {
        let (from, to) = window();
        let body = build_search_body(&[], from, to).unwrap();
        let first = &body["query"]["bool"]["must"][0];
        assert_eq!(first["range"]["@timestamp"]["gte"], "2024-03-01T11:55:00.000Z");
        assert_eq!(first["range"]["@timestamp"]["lt"], "2024-03-01T12:00:00.000Z");
        assert_eq!(
            first["range"]["@timestamp"]["format"],
            "strict_date_optional_time"
        );
        // 📄 and results come back oldest-first
        assert_eq!(body["sort"][0]["@timestamp"]["order"], "asc");
    }

    #[test]
    fn the_one_where_every_operator_knows_its_costume() {
        let (from, to) = window();
        let conds = vec![
            cond("status", "=", json!("error"), Logic::And),
            cond("status", "equals", json!("error"), Logic::And),
            cond("level", "!=", json!("debug"), Logic::And),
            cond("response_code", ">=", json!(500), Logic::And),
            cond("latency_ms", "lt", json!(30), Logic::And),
            cond("message", "contains", json!("timeout"), Logic::And),
            cond("message", "not_contains", json!("expected"), Logic::And),
            cond("trace_id", "exists", Value::Null, Logic::And),
        ];
        let body = build_search_body(&conds, from, to).unwrap();
        let must = body["query"]["bool"]["must"].as_array().unwrap();
        // window + 8 and-clauses, no should-group
        assert_eq!(must.len(), 9);
        assert_eq!(must[1]["term"]["status"]["value"], "error");
        assert_eq!(must[2]["term"]["status"]["value"], "error");
        assert_eq!(must[3]["bool"]["must_not"][0]["term"]["level"]["value"], "debug");
        assert_eq!(must[4]["range"]["response_code"]["gte"], 500);
        assert_eq!(must[5]["range"]["latency_ms"]["lt"], 30);
        assert_eq!(must[6]["wildcard"]["message"]["value"], "*timeout*");
        assert_eq!(must[6]["wildcard"]["message"]["case_insensitive"], true);
        assert_eq!(
            must[7]["bool"]["must_not"][0]["wildcard"]["message"]["value"],
            "*expected*"
        );
        assert_eq!(must[8]["exists"]["field"], "trace_id");
    }

    #[test]
    fn the_one_where_or_conditions_share_one_apartment() {
        // 🔀 Two or-clauses, one and-clause → must has window + and + ONE bool.should
        let (from, to) = window();
        let conds = vec![
            cond("level", "=", json!("error"), Logic::Or),
            cond("level", "=", json!("fatal"), Logic::Or),
            cond("env", "=", json!("prod"), Logic::And),
        ];
        let body = build_search_body(&conds, from, to).unwrap();
        let must = body["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(must.len(), 3);
        assert_eq!(must[1]["term"]["env"]["value"], "prod");
        let group = &must[2]["bool"];
        assert_eq!(group["minimum_should_match"], 1);
        assert_eq!(group["should"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn the_one_where_wildcards_get_defanged() {
        // 🛡️ Spec'd escape round-trip: `*?a\b` → `\*\?a\\b`, wrapped in stars.
        assert_eq!(escape_wildcard(r"*?a\b"), r"\*\?a\\b");
        let (from, to) = window();
        let conds = vec![cond("path", "contains", json!(r"*?a\b"), Logic::And)];
        let body = build_search_body(&conds, from, to).unwrap();
        assert_eq!(
            body["query"]["bool"]["must"][1]["wildcard"]["path"]["value"],
            r"*\*\?a\\b*"
        );
    }

    #[test]
    fn the_one_where_building_twice_changes_nothing() {
        // 🔄 Determinism: same inputs, structurally equal documents.
        let (from, to) = window();
        let conds = vec![
            cond("level", "=", json!("error"), Logic::Or),
            cond("response_code", ">", json!(499), Logic::And),
            cond("message", "contains", json!("boom"), Logic::Or),
        ];
        let once = build_search_body(&conds, from, to).unwrap();
        let twice = build_search_body(&conds, from, to).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn the_one_where_vibes_is_not_an_operator() {
        let (from, to) = window();
        let conds = vec![cond("level", "vibes", json!("error"), Logic::And)];
        let err = build_search_body(&conds, from, to).unwrap_err();
        assert!(matches!(err, ExecError::QueryFailed(_)));
        assert!(err.to_string().contains("vibes"), "error should name the offender");
    }

    #[test]
    fn the_one_where_empty_fields_are_shown_the_door() {
        let (from, to) = window();
        let conds = vec![cond("  ", "=", json!("x"), Logic::And)];
        assert!(build_search_body(&conds, from, to).is_err());
    }

    #[test]
    fn the_one_where_contains_refuses_a_number() {
        // 💀 wildcard on a number is a type error, caught here not in ES
        let (from, to) = window();
        let conds = vec![cond("message", "contains", json!(42), Logic::And)];
        assert!(build_search_body(&conds, from, to).is_err());
    }

    #[test]
    fn the_one_where_equality_rejects_a_whole_list() {
        let (from, to) = window();
        let conds = vec![cond("level", "=", json!(["a", "b"]), Logic::And)];
        assert!(build_search_body(&conds, from, to).is_err());
    }
}
