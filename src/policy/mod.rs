// Policy engine
// A policy decides whether a request may pass a tree node. Two surfaces feed
// the same machinery: first-order-logic sentences (parsed into a `Sentence`
// AST) and the JSON dialect (one kind per object key). Every evaluation
// produces an approval flag plus a human-readable reason.

pub mod eval;
pub mod factory;
pub mod json_dialect;
pub mod parser;

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::errors::{BrokerError, BrokerResult};
use crate::request::Request;

/// Patterns lifted out of a sentence before tokenization, keyed by the
/// generated identifiers ("0", "00", "000", ...).
pub type RegexTable = BTreeMap<String, String>;

/// Failures while parsing a policy sentence or definition.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("empty policy sentence")]
    EmptySentence,

    #[error("unbalanced brackets in {0:?}")]
    UnbalancedBrackets(String),

    #[error("unterminated pattern quote in {0:?}")]
    UnterminatedPattern(String),

    #[error("invalid connective {connective:?} in {sentence:?}")]
    InvalidConnective { connective: char, sentence: String },

    #[error("sentence {0:?} has trailing input after its closing bracket")]
    TrailingInput(String),

    #[error("quantifier in {0:?} is missing its variable")]
    MissingVariable(String),

    #[error("quantifier scope in {0:?} must be a bracketed key list")]
    MalformedScope(String),

    #[error("unknown pattern reference ^{0}")]
    UnknownPattern(String),

    #[error("atomic sentence {0:?} has no comparator")]
    MissingComparator(String),

    #[error("unexpected character {found:?} at the head of {sentence:?}")]
    UnexpectedCharacter { found: char, sentence: String },
}

/// Failures while resolving a policy definition (named, list, or object).
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("{0} is not a pre-made policy")]
    UnknownName(String),

    #[error("policy definition is invalid: {0}")]
    InvalidDefinition(String),

    #[error("could not read stored policy: {0}")]
    Io(#[from] std::io::Error),
}

/// Comparator of an atomic sentence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    /// Lexicographic `<`
    Less,
    /// Lexicographic `>`
    Greater,
    /// String equality `=`
    Equal,
    /// Regex search `~`
    Matches,
}

impl CompareOp {
    pub fn as_char(&self) -> char {
        match self {
            CompareOp::Less => '<',
            CompareOp::Greater => '>',
            CompareOp::Equal => '=',
            CompareOp::Matches => '~',
        }
    }
}

/// A constant of an atomic sentence, classified by its leading sigil at
/// parse time and immutable afterward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Constant {
    /// `$a.b`: dotted lookup into the request body.
    Path(String),
    /// `^id`: a pattern extracted from a quoted span, stored verbatim.
    Pattern(String),
    /// Anything else: literal text.
    Text(String),
}

impl fmt::Display for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Path(path) => write!(f, "${path}"),
            Constant::Pattern(pattern) => write!(f, "\"{pattern}\""),
            Constant::Text(text) => write!(f, "{text}"),
        }
    }
}

/// A single comparison between two constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Atomic {
    pub op: CompareOp,
    pub lhs: Constant,
    pub rhs: Constant,
}

/// A quantifier over request keys. The body is kept as normalized sentence
/// text and re-parsed after each variable substitution; the regex table
/// extracted up front travels with it so pattern references stay resolvable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Quantifier {
    pub variable: char,
    /// `None` ranges over every key of the request; otherwise each listed
    /// key, with a trailing `.*` expanding recursively under that key.
    pub scope: Option<Vec<String>>,
    pub body: String,
    pub regulars: RegexTable,
}

/// A first-order-logic sentence in prenex form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sentence {
    Atomic(Atomic),
    And(Box<Sentence>, Box<Sentence>),
    Or(Box<Sentence>, Box<Sentence>),
    Not(Box<Sentence>),
    Exists(Quantifier),
    Forall(Quantifier),
}

impl fmt::Display for Sentence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentence::Atomic(atomic) => {
                write!(f, "({}{}{})", atomic.lhs, atomic.op.as_char(), atomic.rhs)
            }
            Sentence::And(lhs, rhs) => write!(f, "({lhs}&{rhs})"),
            Sentence::Or(lhs, rhs) => write!(f, "({lhs}|{rhs})"),
            Sentence::Not(inner) => write!(f, "!{inner}"),
            Sentence::Exists(q) => write_quantifier(f, 'E', q),
            Sentence::Forall(q) => write_quantifier(f, 'A', q),
        }
    }
}

fn write_quantifier(f: &mut fmt::Formatter<'_>, letter: char, q: &Quantifier) -> fmt::Result {
    write!(f, "{letter}{}", q.variable)?;
    if let Some(scope) = &q.scope {
        let keys: Vec<String> = scope.iter().map(|k| format!("'{k}'")).collect();
        write!(f, "@({})", keys.join(","))?;
    }
    write!(f, "{}", q.body)
}

/// Ordering relation of a JSON-dialect difference kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DifferenceOp {
    Greater,
    GreaterEq,
    Lesser,
    LesserEq,
}

/// A resolved policy, ready to evaluate against requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Policy {
    /// Approves everything.
    FullApproval,
    /// A first-order-logic sentence.
    Fol(Sentence),
    /// Conjunction: every member must approve.
    All(Vec<Policy>),
    /// Disjunction: one approving member suffices.
    Any(Vec<Policy>),
    /// Every listed dotted path must resolve; under `strict`, every
    /// top-level body key must be listed.
    RequiredHeaders { headers: Vec<String>, strict: bool },
    /// Each path's value must satisfy the named format.
    FormattedArguments(Vec<(String, String)>),
    /// Each path's value must be one of the allowed values.
    MatchAllowed(Vec<(String, Vec<Value>)>),
    /// Each path's value must match the pattern (search semantics).
    RegexMatch(Vec<(String, String)>),
    /// All resolved values along the chain must be equal.
    EqualityChain(Vec<String>),
    /// Each path's value must compare against the bound, lexicographically
    /// on string coercion.
    Difference {
        op: DifferenceOp,
        checks: Vec<(String, Value)>,
    },
    /// Built-in: `data` carries ISO-8601 `start_time` < `end_time`.
    BasicTimeslot,
    /// Built-in: `data` carries `quantity` and a `request_parameters` object.
    TicketedPolicy,
}

/// Result of evaluating a policy against a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub approved: bool,
    pub reason: String,
}

impl Verdict {
    pub fn approved() -> Self {
        Self {
            approved: true,
            reason: "success".to_string(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            reason: reason.into(),
        }
    }
}

impl Policy {
    /// Evaluate this policy against a request snapshot. Pure: the same
    /// `(policy, request)` pair always yields the same verdict.
    pub fn evaluate(&self, request: &Request) -> BrokerResult<Verdict> {
        match self {
            Policy::FullApproval => Ok(Verdict::approved()),
            Policy::Fol(sentence) => {
                let holds = eval::evaluate(sentence, request).map_err(BrokerError::unknown)?;
                if holds {
                    Ok(Verdict::approved())
                } else {
                    Ok(Verdict::rejected(format!(
                        "request does not satisfy {sentence}"
                    )))
                }
            }
            Policy::All(members) => {
                let mut reasons = Vec::new();
                for member in members {
                    let verdict = member.evaluate(request)?;
                    if !verdict.approved {
                        reasons.push(verdict.reason);
                    }
                }
                if reasons.is_empty() {
                    Ok(Verdict::approved())
                } else {
                    Ok(Verdict::rejected(format!("[{}]", reasons.join(", "))))
                }
            }
            Policy::Any(members) => {
                let mut reasons = Vec::new();
                for member in members {
                    let verdict = member.evaluate(request)?;
                    if verdict.approved {
                        return Ok(Verdict::approved());
                    }
                    reasons.push(verdict.reason);
                }
                Ok(Verdict::rejected(format!("[{}]", reasons.join(", "))))
            }
            Policy::RequiredHeaders { headers, strict } => {
                Ok(json_dialect::eval_required_headers(request, headers, *strict))
            }
            Policy::FormattedArguments(requirements) => {
                Ok(json_dialect::eval_formatted_arguments(request, requirements))
            }
            Policy::MatchAllowed(arguments) => {
                Ok(json_dialect::eval_match_allowed(request, arguments))
            }
            Policy::RegexMatch(arguments) => {
                Ok(json_dialect::eval_regex_match(request, arguments))
            }
            Policy::EqualityChain(keys) => Ok(json_dialect::eval_equality_chain(request, keys)),
            Policy::Difference { op, checks } => {
                Ok(json_dialect::eval_difference(request, *op, checks))
            }
            Policy::BasicTimeslot => Ok(json_dialect::eval_basic_timeslot(request)),
            Policy::TicketedPolicy => Ok(json_dialect::eval_ticketed(request)),
        }
    }
}

pub use factory::{from_argument, OrgContext};
pub use parser::parse;
