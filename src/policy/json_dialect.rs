// JSON policy dialect
// The declarative policy surface stored in org definitions: each object key
// names a kind, its value the kind's arguments, and the object as a whole
// is an implicit conjunction. Evaluation helpers here are called from
// `Policy::evaluate`; construction lives in the factory.

use regex::Regex;
use serde_json::{json, Value};

use super::eval::coerce;
use super::{DifferenceOp, Verdict};
use crate::path_utils::lookup;
use crate::request::Request;
use crate::types::is_valid_iso8601;

fn verdict_from(reasons: Vec<Value>) -> Verdict {
    if reasons.is_empty() {
        Verdict::approved()
    } else {
        Verdict::rejected(Value::Array(reasons).to_string())
    }
}

/// Every listed dotted path must resolve; under `strict`, every top-level
/// body key must also be listed.
pub(crate) fn eval_required_headers(
    request: &Request,
    headers: &[String],
    strict: bool,
) -> Verdict {
    let mut reasons = Vec::new();
    for header in headers {
        if lookup(request.raw_request(), header).is_err() {
            reasons.push(json!({ header.as_str(): "missing" }));
        }
    }
    if strict {
        for header in request.headers() {
            if !headers.contains(&header) {
                reasons.push(json!({ header.as_str(): "not allowed" }));
            }
        }
    }
    verdict_from(reasons)
}

/// Each path's value must satisfy the named format. Unknown format names
/// reject the request in the reason rather than erroring.
pub(crate) fn eval_formatted_arguments(
    request: &Request,
    requirements: &[(String, String)],
) -> Verdict {
    let mut reasons = Vec::new();
    for (key, format) in requirements {
        let Ok(value) = lookup(request.raw_request(), key) else {
            reasons.push(json!({ key.as_str(): "missing" }));
            continue;
        };
        let in_format = match format.as_str() {
            "iso8601" => value.as_str().is_some_and(is_valid_iso8601),
            "dict" => value.is_object(),
            "str" => value.is_string(),
            "int" => value.is_i64() || value.is_u64(),
            "float" => value.is_f64(),
            unknown => {
                reasons.push(json!({ key.as_str(): format!("unknown format {unknown:?}") }));
                continue;
            }
        };
        if !in_format {
            reasons.push(json!({ key.as_str(): false }));
        }
    }
    verdict_from(reasons)
}

/// Each path's value must be one of the allowed values (native JSON
/// equality).
pub(crate) fn eval_match_allowed(
    request: &Request,
    arguments: &[(String, Vec<Value>)],
) -> Verdict {
    let mut reasons = Vec::new();
    for (key, allowable) in arguments {
        match lookup(request.raw_request(), key) {
            Ok(value) if allowable.contains(value) => {}
            Ok(_) => reasons.push(json!({ key.as_str(): false })),
            Err(_) => reasons.push(json!({ key.as_str(): "missing" })),
        }
    }
    verdict_from(reasons)
}

/// Each path's value must match the pattern, search semantics; an invalid
/// pattern never matches.
pub(crate) fn eval_regex_match(request: &Request, arguments: &[(String, String)]) -> Verdict {
    let mut reasons = Vec::new();
    for (key, expression) in arguments {
        let Ok(value) = lookup(request.raw_request(), key) else {
            reasons.push(json!({ key.as_str(): "missing" }));
            continue;
        };
        let matched = match Regex::new(expression) {
            Ok(pattern) => pattern.is_match(&coerce(value)),
            Err(_) => false,
        };
        if !matched {
            reasons.push(json!({ key.as_str(): false }));
        }
    }
    verdict_from(reasons)
}

/// All resolved values along the chain must be equal (native JSON
/// equality).
pub(crate) fn eval_equality_chain(request: &Request, keys: &[String]) -> Verdict {
    let mut last: Option<&Value> = None;
    for key in keys {
        let Ok(value) = lookup(request.raw_request(), key) else {
            return Verdict::rejected(format!("value {key:?} is missing"));
        };
        if let Some(previous) = last {
            if previous != value {
                return Verdict::rejected(format!("value {key:?} broke the equality chain"));
            }
        }
        last = Some(value);
    }
    Verdict::approved()
}

/// Each path's value must compare against the bound; both sides are
/// string-coerced and ordered lexicographically, the same ordering the
/// sentence comparators use.
pub(crate) fn eval_difference(
    request: &Request,
    op: DifferenceOp,
    checks: &[(String, Value)],
) -> Verdict {
    let mut reasons = Vec::new();
    for (key, bound) in checks {
        let Ok(value) = lookup(request.raw_request(), key) else {
            reasons.push(json!({ key.as_str(): "missing" }));
            continue;
        };
        let value = coerce(value);
        let bound = coerce(bound);
        let holds = match op {
            DifferenceOp::Greater => value > bound,
            DifferenceOp::GreaterEq => value >= bound,
            DifferenceOp::Lesser => value < bound,
            DifferenceOp::LesserEq => value <= bound,
        };
        if !holds {
            reasons.push(json!({ key.as_str(): false }));
        }
    }
    verdict_from(reasons)
}

/// Built-in timeslot gate: `data` must carry ISO-8601 `start_time` and
/// `end_time` with `start_time < end_time`.
pub(crate) fn eval_basic_timeslot(request: &Request) -> Verdict {
    let Ok(data) = request.data() else {
        return Verdict::rejected("request has no data to take a timeslot from");
    };
    let mut missing = Vec::new();
    for header in ["start_time", "end_time"] {
        if data.get(header).is_none() {
            missing.push(header);
        }
    }
    if !missing.is_empty() {
        return Verdict::rejected(format!("missing required headers: {missing:?}"));
    }
    let start = data.get("start_time").and_then(Value::as_str);
    let end = data.get("end_time").and_then(Value::as_str);
    let (Some(start), Some(end)) = (start, end) else {
        return Verdict::rejected("timestamps must be ISO 8601 strings, but were not");
    };
    if !is_valid_iso8601(start) || !is_valid_iso8601(end) {
        return Verdict::rejected("timestamps must be ISO 8601 strings, but were not");
    }
    if end <= start {
        return Verdict::rejected("end time must be greater than start time");
    }
    Verdict::approved()
}

/// Built-in ticket gate: `data` must carry `quantity` and a
/// `request_parameters` object.
pub(crate) fn eval_ticketed(request: &Request) -> Verdict {
    let Ok(data) = request.data() else {
        return Verdict::rejected("request has no data to take tickets from");
    };
    if data.get("quantity").is_none() {
        return Verdict::rejected("missing required header: quantity");
    }
    match data.get("request_parameters") {
        Some(Value::Object(_)) => Verdict::approved(),
        Some(_) => Verdict::rejected("expected request_parameters to be a dictionary"),
        None => Verdict::rejected("missing required header: request_parameters"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;

    fn request(raw: Value) -> Request {
        Request::from_value(Method::Post, raw).unwrap()
    }

    #[test]
    fn test_required_headers_resolve_dotted_paths() {
        let req = request(json!({"user_attributes": {"ucid": 1, "undergrad": true}}));
        let verdict = eval_required_headers(
            &req,
            &["user_attributes.ucid".into(), "user_attributes.undergrad".into()],
            false,
        );
        assert!(verdict.approved);

        let verdict =
            eval_required_headers(&req, &["user_attributes.grad".into()], false);
        assert!(!verdict.approved);
        assert!(verdict.reason.contains("missing"));
    }

    #[test]
    fn test_required_headers_strict_rejects_extras() {
        let req = request(json!({"allowed": 1, "extra": 2}));
        let verdict = eval_required_headers(&req, &["allowed".into()], true);
        assert!(!verdict.approved);
        assert!(verdict.reason.contains("not allowed"));
    }

    #[test]
    fn test_formatted_arguments_formats() {
        let req = request(json!({
            "data": {
                "date": "2024-01-12T12:30:16.001Z",
                "count": 3,
                "ratio": 1.5,
                "name": "x",
                "nested": {}
            }
        }));
        let requirements = vec![
            ("data.date".to_string(), "iso8601".to_string()),
            ("data.count".to_string(), "int".to_string()),
            ("data.ratio".to_string(), "float".to_string()),
            ("data.name".to_string(), "str".to_string()),
            ("data.nested".to_string(), "dict".to_string()),
        ];
        assert!(eval_formatted_arguments(&req, &requirements).approved);

        let bad = vec![("data.count".to_string(), "iso8601".to_string())];
        assert!(!eval_formatted_arguments(&req, &bad).approved);
    }

    #[test]
    fn test_formatted_arguments_unknown_format_rejects() {
        let req = request(json!({"x": 1}));
        let requirements = vec![("x".to_string(), "complex".to_string())];
        let verdict = eval_formatted_arguments(&req, &requirements);
        assert!(!verdict.approved);
        assert!(verdict.reason.contains("unknown format"));
    }

    #[test]
    fn test_match_allowed_native_equality() {
        let req = request(json!({"hello": "wor2ld"}));
        let arguments = vec![(
            "hello".to_string(),
            vec![json!("wor2ld"), json!("world")],
        )];
        assert!(eval_match_allowed(&req, &arguments).approved);

        let arguments = vec![("hello".to_string(), vec![json!("worlds")])];
        assert!(!eval_match_allowed(&req, &arguments).approved);
    }

    #[test]
    fn test_regex_match_search_semantics() {
        let req = request(json!({"email": "someone@example.com"}));
        let arguments = vec![("email".to_string(), "@example\\.com$".to_string())];
        assert!(eval_regex_match(&req, &arguments).approved);

        let arguments = vec![("email".to_string(), "[unclosed".to_string())];
        assert!(!eval_regex_match(&req, &arguments).approved);
    }

    #[test]
    fn test_equality_chain() {
        let req = request(json!({
            "data": {"date": "2024-01-12", "date2": "2024-01-12", "other": "x"}
        }));
        let chain = vec!["data.date".to_string(), "data.date2".to_string()];
        assert!(eval_equality_chain(&req, &chain).approved);

        let chain = vec!["data.date".to_string(), "data.other".to_string()];
        let verdict = eval_equality_chain(&req, &chain);
        assert!(!verdict.approved);
        assert!(verdict.reason.contains("equality chain"));
    }

    #[test]
    fn test_difference_is_lexicographic() {
        let req = request(json!({"data": {"date": "2024-01-12T12:30:16.001Z"}}));
        let checks = vec![(
            "data.date".to_string(),
            json!("2024-01-12T12:30:16.001Z"),
        )];
        assert!(eval_difference(&req, DifferenceOp::LesserEq, &checks).approved);
        assert!(!eval_difference(&req, DifferenceOp::Lesser, &checks).approved);
        assert!(eval_difference(&req, DifferenceOp::GreaterEq, &checks).approved);

        let checks = vec![("data.date".to_string(), json!("2025"))];
        assert!(eval_difference(&req, DifferenceOp::Lesser, &checks).approved);
    }

    #[test]
    fn test_difference_missing_key_rejects() {
        let req = request(json!({"a": 1}));
        let checks = vec![("b".to_string(), json!(1))];
        let verdict = eval_difference(&req, DifferenceOp::Greater, &checks);
        assert!(!verdict.approved);
        assert!(verdict.reason.contains("missing"));
    }

    #[test]
    fn test_basic_timeslot() {
        let good = request(json!({
            "data": {"start_time": "2024-01-02T01:00:00Z", "end_time": "2024-01-02T02:00:00Z"}
        }));
        assert!(eval_basic_timeslot(&good).approved);

        let backwards = request(json!({
            "data": {"start_time": "2024-01-02T02:00:00Z", "end_time": "2024-01-02T01:00:00Z"}
        }));
        assert!(!eval_basic_timeslot(&backwards).approved);

        let missing = request(json!({"data": {"start_time": "2024-01-02T01:00:00Z"}}));
        let verdict = eval_basic_timeslot(&missing);
        assert!(!verdict.approved);
        assert!(verdict.reason.contains("end_time"));

        let not_iso = request(json!({
            "data": {"start_time": "soon", "end_time": "later"}
        }));
        assert!(!eval_basic_timeslot(&not_iso).approved);
    }

    #[test]
    fn test_ticketed_builtin() {
        let good = request(json!({
            "data": {"quantity": 2, "request_parameters": {"seat": "A1"}}
        }));
        assert!(eval_ticketed(&good).approved);

        let bad = request(json!({"data": {"quantity": 2, "request_parameters": "A1"}}));
        assert!(!eval_ticketed(&bad).approved);

        let missing = request(json!({"data": {"request_parameters": {}}}));
        assert!(!eval_ticketed(&missing).approved);
    }
}
