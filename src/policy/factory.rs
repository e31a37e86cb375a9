// Policy factory
// Resolves a stored policy argument into a `Policy`. Strings name either a
// policy persisted under the organization or a built-in; lists compose
// conjunctively; objects are the JSON dialect. A stored file wins over a
// built-in carrying the same name.

use std::path::Path;

use serde_json::{Map, Value};

use super::{parser, DifferenceOp, Policy, PolicyError};

/// Where to look for policies persisted by a PUT: the data root plus the
/// owning organization's name.
#[derive(Debug, Clone, Copy)]
pub struct OrgContext<'a> {
    pub data_root: &'a Path,
    pub org: &'a str,
}

impl<'a> OrgContext<'a> {
    pub fn new(data_root: &'a Path, org: &'a str) -> Self {
        Self { data_root, org }
    }
}

/// Resolve a policy argument: a name, a conjunctive list, or a JSON-dialect
/// object.
pub fn from_argument(arg: &Value, ctx: Option<&OrgContext<'_>>) -> Result<Policy, PolicyError> {
    match arg {
        Value::String(name) => {
            if let Some(ctx) = ctx {
                if let Some(stored) = lookup_stored(ctx, name)? {
                    return Ok(stored);
                }
            }
            from_name(name)
        }
        Value::Array(items) => {
            let members = items
                .iter()
                .map(|item| from_argument(item, ctx))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Policy::All(members))
        }
        Value::Object(map) => from_object(map, ctx),
        _ => Err(PolicyError::InvalidDefinition(
            "could not recognize the policy argument's datatype".into(),
        )),
    }
}

/// The built-in registry.
pub fn from_name(name: &str) -> Result<Policy, PolicyError> {
    match name {
        "FullApproval" => Ok(Policy::FullApproval),
        "BasicTimeslot" => Ok(Policy::BasicTimeslot),
        "TicketedPolicy" => Ok(Policy::TicketedPolicy),
        other => Err(PolicyError::UnknownName(other.to_string())),
    }
}

/// Try the organization's persisted policies. The stored definition is an
/// object in the JSON dialect and is resolved without an org context, so a
/// file cannot chain to further files.
fn lookup_stored(ctx: &OrgContext<'_>, name: &str) -> Result<Option<Policy>, PolicyError> {
    if name.contains(['.', '/', '\\']) {
        return Ok(None);
    }
    let path = ctx
        .data_root
        .join(format!("organization_{}", ctx.org))
        .join("policies")
        .join(format!("{name}.json"));
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(&path)?;
    let definition: Value = serde_json::from_str(&text).map_err(|err| {
        PolicyError::InvalidDefinition(format!("stored policy {name} is not valid JSON: {err}"))
    })?;
    from_argument(&definition, None).map(Some)
}

/// An object is an implicit conjunction: one policy per key.
fn from_object(
    map: &Map<String, Value>,
    ctx: Option<&OrgContext<'_>>,
) -> Result<Policy, PolicyError> {
    let members = map
        .iter()
        .map(|(kind, args)| build_kind(kind, args, ctx))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Policy::All(members))
}

fn build_kind(
    kind: &str,
    args: &Value,
    ctx: Option<&OrgContext<'_>>,
) -> Result<Policy, PolicyError> {
    match kind {
        "required_headers" => {
            let headers = args
                .get("headers")
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    PolicyError::InvalidDefinition(
                        "required_headers needs a 'headers' list".into(),
                    )
                })?
                .iter()
                .map(|h| string_arg(h, "required_headers entries"))
                .collect::<Result<Vec<_>, _>>()?;
            let strict = args
                .get("strict")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            Ok(Policy::RequiredHeaders { headers, strict })
        }
        "formatted_arguments" => {
            let requirements = object_arg(args, kind)?
                .iter()
                .map(|(key, format)| {
                    Ok((key.clone(), string_arg(format, "format names")?))
                })
                .collect::<Result<Vec<_>, PolicyError>>()?;
            Ok(Policy::FormattedArguments(requirements))
        }
        "match" => {
            let arguments = object_arg(args, kind)?
                .iter()
                .map(|(key, allowed)| {
                    let allowed = allowed.as_array().ok_or_else(|| {
                        PolicyError::InvalidDefinition(
                            "match needs a list of allowable values per key".into(),
                        )
                    })?;
                    Ok((key.clone(), allowed.clone()))
                })
                .collect::<Result<Vec<_>, PolicyError>>()?;
            Ok(Policy::MatchAllowed(arguments))
        }
        "regex" => {
            let arguments = object_arg(args, kind)?
                .iter()
                .map(|(key, pattern)| Ok((key.clone(), string_arg(pattern, "regex patterns")?)))
                .collect::<Result<Vec<_>, PolicyError>>()?;
            Ok(Policy::RegexMatch(arguments))
        }
        "equality" => {
            let keys = args
                .as_array()
                .ok_or_else(|| {
                    PolicyError::InvalidDefinition("equality needs a list of keys".into())
                })?
                .iter()
                .map(|k| string_arg(k, "equality keys"))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(Policy::EqualityChain(keys))
        }
        "greater_than" => difference(args, DifferenceOp::Greater),
        "greater_than_eq" => difference(args, DifferenceOp::GreaterEq),
        "lesser_than" => difference(args, DifferenceOp::Lesser),
        "lesser_than_eq" => difference(args, DifferenceOp::LesserEq),
        "and" | "or" => {
            let members = match args {
                Value::Array(items) => items
                    .iter()
                    .map(|item| from_argument(item, ctx))
                    .collect::<Result<Vec<_>, _>>()?,
                Value::Object(map) => map
                    .iter()
                    .map(|(kind, args)| build_kind(kind, args, ctx))
                    .collect::<Result<Vec<_>, _>>()?,
                _ => {
                    return Err(PolicyError::InvalidDefinition(format!(
                        "{kind} needs a list or object of policies"
                    )))
                }
            };
            if kind == "and" {
                Ok(Policy::All(members))
            } else {
                Ok(Policy::Any(members))
            }
        }
        "fol" => {
            let sentence = args.as_str().ok_or_else(|| {
                PolicyError::InvalidDefinition("fol needs a sentence string".into())
            })?;
            Ok(Policy::Fol(parser::parse(sentence)?))
        }
        unknown => Err(PolicyError::InvalidDefinition(format!(
            "unknown policy kind {unknown:?}"
        ))),
    }
}

fn difference(args: &Value, op: DifferenceOp) -> Result<Policy, PolicyError> {
    let checks = object_arg(args, "difference policies")?
        .iter()
        .map(|(key, bound)| (key.clone(), bound.clone()))
        .collect();
    Ok(Policy::Difference { op, checks })
}

fn object_arg<'v>(args: &'v Value, kind: &str) -> Result<&'v Map<String, Value>, PolicyError> {
    args.as_object().ok_or_else(|| {
        PolicyError::InvalidDefinition(format!("{kind} needs an object of arguments"))
    })
}

fn string_arg(value: &Value, what: &str) -> Result<String, PolicyError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| PolicyError::InvalidDefinition(format!("{what} must be strings")))
}
