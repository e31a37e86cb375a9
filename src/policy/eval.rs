// Sentence evaluator
// Pure evaluation of a parsed sentence against an immutable request
// snapshot. Comparators are lexicographic on string coercion; `~` is a
// regex search; a missing key makes the atomic false and never propagates.

use regex::Regex;
use serde_json::Value;

use super::{parser, Atomic, CompareOp, Constant, ParseError, Quantifier, Sentence};
use crate::path_utils::{all_keys, lookup};
use crate::request::Request;

/// Neighbors that mark a variable occurrence as substitutable. Anything
/// else means the character sits inside a longer identifier.
const PERMITTED_NEIGHBORS: [char; 8] = ['(', ')', '<', '>', '^', '$', '=', '~'];

/// Evaluate a sentence against a request. Only a quantifier body that fails
/// to re-parse after substitution surfaces an error; every data-shaped
/// failure folds into the boolean result.
pub fn evaluate(sentence: &Sentence, request: &Request) -> Result<bool, ParseError> {
    match sentence {
        Sentence::Atomic(atomic) => Ok(eval_atomic(atomic, request)),
        Sentence::And(lhs, rhs) => Ok(evaluate(lhs, request)? && evaluate(rhs, request)?),
        Sentence::Or(lhs, rhs) => Ok(evaluate(lhs, request)? || evaluate(rhs, request)?),
        Sentence::Not(inner) => Ok(!evaluate(inner, request)?),
        Sentence::Exists(q) => eval_quantifier(q, request, true),
        Sentence::Forall(q) => eval_quantifier(q, request, false),
    }
}

/// String coercion used by every comparator: JSON strings compare by their
/// contents, everything else by its JSON rendering ("2.2", "true", ...).
pub(crate) fn coerce(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolve a constant to its comparison string. `None` means a dotted
/// lookup missed.
fn extract(constant: &Constant, request: &Request) -> Option<String> {
    match constant {
        Constant::Path(path) => lookup(request.raw_request(), path).ok().map(coerce),
        Constant::Pattern(pattern) => Some(pattern.clone()),
        Constant::Text(text) => Some(text.clone()),
    }
}

fn eval_atomic(atomic: &Atomic, request: &Request) -> bool {
    let (Some(lhs), Some(rhs)) = (
        extract(&atomic.lhs, request),
        extract(&atomic.rhs, request),
    ) else {
        return false;
    };
    match atomic.op {
        CompareOp::Less => lhs < rhs,
        CompareOp::Greater => lhs > rhs,
        CompareOp::Equal => lhs == rhs,
        CompareOp::Matches => match Regex::new(&rhs) {
            Ok(pattern) => pattern.is_match(&lhs),
            Err(_) => false,
        },
    }
}

/// The binding set of a quantifier: every request key when unscoped,
/// otherwise each scope key verbatim, with `.*` keys expanded to the
/// recursive key set under the stripped prefix. A `.*` prefix that misses
/// the request (or names a non-object) contributes nothing; verbatim keys
/// are appended unchecked and fail later at atomic extraction instead.
fn binding_domain(q: &Quantifier, request: &Request) -> Vec<String> {
    let Some(scope) = &q.scope else {
        return all_keys(request.raw_request(), None);
    };
    let mut domain = Vec::new();
    for key in scope {
        if let Some(prefix) = key.strip_suffix(".*") {
            if let Ok(value) = lookup(request.raw_request(), prefix) {
                domain.extend(all_keys(value, Some(prefix)));
            }
        } else {
            domain.push(key.clone());
        }
    }
    domain
}

/// Substitute, re-parse, and evaluate the body once per binding.
fn eval_quantifier(
    q: &Quantifier,
    request: &Request,
    existential: bool,
) -> Result<bool, ParseError> {
    for key in binding_domain(q, request) {
        let attempt = substitute(&q.body, q.variable, &key);
        let mut table = q.regulars.clone();
        let body = parser::parse_with_table(&attempt, &mut table)?;
        let holds = evaluate(&body, request)?;
        if existential && holds {
            return Ok(true);
        }
        if !existential && !holds {
            return Ok(false);
        }
    }
    Ok(!existential)
}

/// Replace the bound variable with `key` wherever both neighbors are
/// structural characters; occurrences inside longer identifiers (or at the
/// ends of the body) are left alone.
pub(crate) fn substitute(body: &str, variable: char, key: &str) -> String {
    let chars: Vec<char> = body.chars().collect();
    let mut out = String::with_capacity(body.len() + key.len());
    for i in 0..chars.len() {
        let substitutable = chars[i] == variable
            && i > 0
            && i + 1 < chars.len()
            && PERMITTED_NEIGHBORS.contains(&chars[i - 1])
            && PERMITTED_NEIGHBORS.contains(&chars[i + 1]);
        if substitutable {
            out.push_str(key);
        } else {
            out.push(chars[i]);
        }
    }
    out
}
