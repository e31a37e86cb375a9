// Sentence parser
// Turns a prenex-form FOL sentence string into a `Sentence` AST in four
// stages: pattern extraction (quoted spans lifted into a table so their
// contents survive the rewrites), bracket normalization, quantifier peeling,
// and matrix parsing by bracket balance.

use super::{
    Atomic, CompareOp, Constant, ParseError, Quantifier, RegexTable, Sentence,
};

/// Characters that terminate an atomic constant and select the comparator.
const COMPARATORS: [char; 4] = ['<', '>', '=', '~'];

/// Parse a sentence with a fresh pattern table.
pub fn parse(literal: &str) -> Result<Sentence, ParseError> {
    let mut table = RegexTable::new();
    parse_with_table(literal, &mut table)
}

/// Parse a sentence, extracting quoted patterns into `table`. Quantifier
/// bodies re-enter here after substitution, carrying the table forward so
/// `^id` references from the first pass stay resolvable.
pub(crate) fn parse_with_table(
    literal: &str,
    table: &mut RegexTable,
) -> Result<Sentence, ParseError> {
    let extracted = extract_patterns(literal, table)?;
    let normalized = normalize(&extracted);
    let chars: Vec<char> = normalized.chars().collect();
    parse_chars(&chars, table)
}

/// Lift every maximal span between double quotes into the table, replacing
/// it with `^<id>`. Identifiers are runs of zeros ("0", "00", ...), so each
/// new id sorts after every existing one. This must run before bracket
/// normalization: quoted pattern bodies may contain brackets.
fn extract_patterns(literal: &str, table: &mut RegexTable) -> Result<String, ParseError> {
    let mut out = String::with_capacity(literal.len());
    let mut chars = literal.chars();
    while let Some(c) = chars.next() {
        if c != '"' {
            out.push(c);
            continue;
        }
        let mut pattern = String::new();
        loop {
            match chars.next() {
                Some('"') => break,
                Some(inner) => pattern.push(inner),
                None => return Err(ParseError::UnterminatedPattern(literal.to_string())),
            }
        }
        let id = "0".repeat(table.len() + 1);
        table.insert(id.clone(), pattern);
        out.push('^');
        out.push_str(&id);
    }
    Ok(out)
}

/// Strip whitespace and rewrite every bracket flavor to parentheses.
fn normalize(literal: &str) -> String {
    literal
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            '{' | '[' => '(',
            '}' | ']' => ')',
            other => other,
        })
        .collect()
}

fn apply_negation(sentence: Sentence, negations: usize) -> Sentence {
    if negations % 2 == 0 {
        sentence
    } else {
        Sentence::Not(Box::new(sentence))
    }
}

/// Parse a normalized sentence: peel negations and quantifiers off the
/// head, then hand the bracketed matrix to the compound/atomic split.
fn parse_chars(chars: &[char], table: &RegexTable) -> Result<Sentence, ParseError> {
    let mut negations = 0usize;
    let mut rest = chars;
    loop {
        match rest.first().copied() {
            None => return Err(ParseError::EmptySentence),
            Some('(') => break,
            Some('!') => {
                negations += 1;
                rest = &rest[1..];
            }
            Some('E') | Some('A') => {
                let sentence = parse_quantifier(rest, table)?;
                return Ok(apply_negation(sentence, negations));
            }
            Some(found) => {
                return Err(ParseError::UnexpectedCharacter {
                    found,
                    sentence: chars.iter().collect(),
                })
            }
        }
    }

    let close = find_matching(rest, 0)?;
    if close != rest.len() - 1 {
        return Err(ParseError::TrailingInput(rest.iter().collect()));
    }
    let interior = &rest[1..close];
    if interior.is_empty() {
        return Err(ParseError::EmptySentence);
    }
    let sentence = if interior.iter().all(|&c| c != '(') {
        Sentence::Atomic(parse_atomic(interior, table)?)
    } else {
        parse_compound(interior, table)?
    };
    Ok(apply_negation(sentence, negations))
}

/// Split `S1 OP S2` at the close of the first balanced sub-sentence. An
/// interior that is one balanced group (possibly negation-prefixed) is just
/// an over-bracketed sentence and re-enters the head parser.
fn parse_compound(interior: &[char], table: &RegexTable) -> Result<Sentence, ParseError> {
    let open = interior
        .iter()
        .position(|&c| c == '(')
        .expect("compound interior contains a bracket");
    let close = find_matching(interior, open)?;
    if close == interior.len() - 1 {
        return parse_chars(interior, table);
    }

    let connective = interior[close + 1];
    let first = &interior[..=close];
    let second = &interior[close + 2..];
    let lhs = Box::new(parse_chars(first, table)?);
    let rhs = Box::new(parse_chars(second, table)?);
    match connective {
        '&' => Ok(Sentence::And(lhs, rhs)),
        '|' => Ok(Sentence::Or(lhs, rhs)),
        other => Err(ParseError::InvalidConnective {
            connective: other,
            sentence: interior.iter().collect(),
        }),
    }
}

/// Parse `Ev`/`Av` with an optional `@(key, ...)` scope list. The remaining
/// text becomes the quantifier body, re-parsed after substitution at
/// evaluation time.
fn parse_quantifier(rest: &[char], table: &RegexTable) -> Result<Sentence, ParseError> {
    let letter = rest[0];
    let variable = match rest.get(1) {
        Some(&v) if v != '(' && v != '@' => v,
        _ => return Err(ParseError::MissingVariable(rest.iter().collect())),
    };

    let (scope, body_start) = if rest.get(2) == Some(&'@') {
        if rest.get(3) != Some(&'(') {
            return Err(ParseError::MalformedScope(rest.iter().collect()));
        }
        let close = find_matching(rest, 3)?;
        let span: String = rest[4..close].iter().collect();
        let keys = span
            .split(',')
            .filter(|k| !k.is_empty())
            .map(unquote_key)
            .collect();
        (Some(keys), close + 1)
    } else {
        (None, 2)
    };

    let body: String = rest[body_start..].iter().collect();
    if body.is_empty() {
        return Err(ParseError::EmptySentence);
    }

    let quantifier = Quantifier {
        variable,
        scope,
        body,
        regulars: table.clone(),
    };
    match letter {
        'E' => Ok(Sentence::Exists(quantifier)),
        _ => Ok(Sentence::Forall(quantifier)),
    }
}

/// Scope keys may be single-quoted; whitespace was already stripped.
fn unquote_key(key: &str) -> String {
    key.strip_prefix('\'')
        .and_then(|k| k.strip_suffix('\''))
        .unwrap_or(key)
        .to_string()
}

/// Split an atomic interior at the first comparator into two constants.
fn parse_atomic(interior: &[char], table: &RegexTable) -> Result<Atomic, ParseError> {
    let split = interior
        .iter()
        .position(|c| COMPARATORS.contains(c))
        .ok_or_else(|| ParseError::MissingComparator(interior.iter().collect()))?;
    let op = match interior[split] {
        '<' => CompareOp::Less,
        '>' => CompareOp::Greater,
        '=' => CompareOp::Equal,
        _ => CompareOp::Matches,
    };
    let lhs = classify(&interior[..split], table)?;
    let rhs = classify(&interior[split + 1..], table)?;
    Ok(Atomic { op, lhs, rhs })
}

/// Classify a constant token by its leading sigil.
fn classify(token: &[char], table: &RegexTable) -> Result<Constant, ParseError> {
    match token.first().copied() {
        Some('$') => Ok(Constant::Path(token[1..].iter().collect())),
        Some('^') => {
            let id: String = token[1..].iter().collect();
            let pattern = table
                .get(&id)
                .ok_or_else(|| ParseError::UnknownPattern(id.clone()))?;
            Ok(Constant::Pattern(pattern.clone()))
        }
        _ => Ok(Constant::Text(token.iter().collect())),
    }
}

/// Index of the bracket matching the opener at `open`.
fn find_matching(chars: &[char], open: usize) -> Result<usize, ParseError> {
    debug_assert_eq!(chars[open], '(');
    let mut level = 0i32;
    for (offset, &c) in chars[open..].iter().enumerate() {
        match c {
            '(' => level += 1,
            ')' => {
                level -= 1;
                if level == 0 {
                    return Ok(open + offset);
                }
            }
            _ => {}
        }
    }
    Err(ParseError::UnbalancedBrackets(chars.iter().collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_atomic_constants() {
        let sentence = parse("($entity=a)").unwrap();
        match sentence {
            Sentence::Atomic(atomic) => {
                assert_eq!(atomic.op, CompareOp::Equal);
                assert_eq!(atomic.lhs, Constant::Path("entity".into()));
                assert_eq!(atomic.rhs, Constant::Text("a".into()));
            }
            other => panic!("expected atomic, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_splits_at_first_comparator() {
        let sentence = parse("($a<b<c)").unwrap();
        match sentence {
            Sentence::Atomic(atomic) => {
                assert_eq!(atomic.op, CompareOp::Less);
                assert_eq!(atomic.rhs, Constant::Text("b<c".into()));
            }
            other => panic!("expected atomic, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_bracket_flavors_are_interchangeable() {
        let braces = parse("{[$a=1]&($b=2)}").unwrap();
        let parens = parse("(($a=1)&($b=2))").unwrap();
        assert_eq!(braces, parens);
    }

    #[test]
    fn test_parse_binary_connectives() {
        assert!(matches!(
            parse("[($a=1)&($b=2)]").unwrap(),
            Sentence::And(_, _)
        ));
        assert!(matches!(
            parse("[($a=1)|($b=2)]").unwrap(),
            Sentence::Or(_, _)
        ));
    }

    #[test]
    fn test_parse_rejects_invalid_connective() {
        assert!(matches!(
            parse("[($a=1)^($b=2)]"),
            Err(ParseError::InvalidConnective { connective: '^', .. })
        ));
    }

    #[test]
    fn test_negation_parity() {
        let odd = parse("!!!($entity=a)").unwrap();
        assert!(matches!(odd, Sentence::Not(_)));
        let even = parse("!!($entity=a)").unwrap();
        assert!(matches!(even, Sentence::Atomic(_)));
    }

    #[test]
    fn test_negation_on_inner_sentence() {
        let sentence = parse("[!($entity=a)|($b=2)]").unwrap();
        match sentence {
            Sentence::Or(lhs, _) => assert!(matches!(*lhs, Sentence::Not(_))),
            other => panic!("expected or, got {other:?}"),
        }
    }

    #[test]
    fn test_pattern_extraction_survives_brackets() {
        let sentence = parse(r#"($a~"[0-9]{4}")"#).unwrap();
        match sentence {
            Sentence::Atomic(atomic) => {
                assert_eq!(atomic.rhs, Constant::Pattern("[0-9]{4}".into()));
            }
            other => panic!("expected atomic, got {other:?}"),
        }
    }

    #[test]
    fn test_pattern_ids_are_sequential_zero_runs() {
        let mut table = RegexTable::new();
        let extracted = extract_patterns(r#"($a~"x")&($b~"y")"#, &mut table).unwrap();
        assert_eq!(extracted, "($a~^0)&($b~^00)");
        assert_eq!(table.get("0"), Some(&"x".to_string()));
        assert_eq!(table.get("00"), Some(&"y".to_string()));
    }

    #[test]
    fn test_unterminated_pattern_is_an_error() {
        assert!(matches!(
            parse(r#"($a~"oops)"#),
            Err(ParseError::UnterminatedPattern(_))
        ));
    }

    #[test]
    fn test_quantifier_without_scope() {
        let sentence = parse("Ex($x=2.2)").unwrap();
        match sentence {
            Sentence::Exists(q) => {
                assert_eq!(q.variable, 'x');
                assert_eq!(q.scope, None);
                assert_eq!(q.body, "($x=2.2)");
            }
            other => panic!("expected exists, got {other:?}"),
        }
    }

    #[test]
    fn test_quantifier_with_scope_list() {
        let sentence = parse("Ax@['data.*', 'data']($x>b)").unwrap();
        match sentence {
            Sentence::Forall(q) => {
                assert_eq!(q.variable, 'x');
                assert_eq!(
                    q.scope,
                    Some(vec!["data.*".to_string(), "data".to_string()])
                );
                assert_eq!(q.body, "($x>b)");
            }
            other => panic!("expected forall, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_quantifiers_keep_remaining_prefix_in_body() {
        let sentence = parse("ExEt[($x=2.2)&($t=exact)]").unwrap();
        match sentence {
            Sentence::Exists(q) => {
                assert_eq!(q.variable, 'x');
                assert_eq!(q.body, "Et(($x=2.2)&($t=exact))");
            }
            other => panic!("expected exists, got {other:?}"),
        }
    }

    #[test]
    fn test_negated_quantifier() {
        assert!(matches!(
            parse("!Ex($x=2.2)").unwrap(),
            Sentence::Not(_)
        ));
    }

    #[test]
    fn test_quantifier_missing_variable_is_an_error() {
        assert!(matches!(
            parse("E($x=1)"),
            Err(ParseError::MissingVariable(_))
        ));
    }

    #[test]
    fn test_unbalanced_brackets_are_an_error() {
        assert!(matches!(
            parse("(($a=1)"),
            Err(ParseError::UnbalancedBrackets(_))
        ));
    }

    #[test]
    fn test_trailing_input_is_an_error() {
        assert!(matches!(
            parse("($a=1)($b=2)"),
            Err(ParseError::TrailingInput(_))
        ));
    }

    #[test]
    fn test_over_bracketed_sentence_parses() {
        assert!(matches!(
            parse("(($a=1))").unwrap(),
            Sentence::Atomic(_)
        ));
        assert!(matches!(
            parse("(!($a=1))").unwrap(),
            Sentence::Not(_)
        ));
    }

    #[test]
    fn test_whitespace_is_stripped() {
        assert_eq!(parse("( $a = 1 )").unwrap(), parse("($a=1)").unwrap());
    }

    #[test]
    fn test_missing_comparator_is_an_error() {
        assert!(matches!(
            parse("(justtext)"),
            Err(ParseError::MissingComparator(_))
        ));
    }
}
