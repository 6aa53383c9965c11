//! Label-matcher selector parser
//!
//! Parses the `{name OP "value", ...}` form used by row-visibility
//! selectors. Operators are captured as raw tokens; mapping them to
//! [`MatchOp`](super::MatchOp) happens in the caller so that an unknown
//! operator is reported as such instead of as a generic syntax error.

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, take_while, take_while1},
    character::complete::{char, multispace0, none_of},
    combinator::{all_consuming, map, opt, recognize, value},
    multi::separated_list0,
    sequence::delimited,
    IResult, Parser,
};

use super::SelectorError;

/// One matcher as written, before the operator is resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RawMatcher<'a> {
    pub name: &'a str,
    pub op: &'a str,
    pub value: String,
}

/// Parse one selector string into its matchers
pub(crate) fn parse_selector(input: &str) -> Result<Vec<RawMatcher<'_>>, SelectorError> {
    match all_consuming(delimited(multispace0, parse_matchers, multispace0)).parse(input) {
        Ok((_, matchers)) => Ok(matchers),
        Err(e) => Err(SelectorError::Parse(format!(
            "invalid selector {:?}: {}",
            input, e
        ))),
    }
}

/// Parse `{ matcher, matcher, ... }`
fn parse_matchers(input: &str) -> IResult<&str, Vec<RawMatcher<'_>>> {
    delimited(
        (multispace0, char('{')),
        separated_list0((multispace0, char(','), multispace0), parse_matcher),
        (multispace0, char('}')),
    )
    .parse(input)
}

/// Parse `name OP "value"`
fn parse_matcher(input: &str) -> IResult<&str, RawMatcher<'_>> {
    let (input, _) = multispace0(input)?;
    let (input, name) = parse_label_name(input)?;
    let (input, _) = multispace0(input)?;
    let (input, op) = parse_operator(input)?;
    let (input, _) = multispace0(input)?;
    let (input, value) = parse_string_value(input)?;

    Ok((input, RawMatcher { name, op, value }))
}

/// Parse label name: `[a-zA-Z_][a-zA-Z0-9_]*`
fn parse_label_name(input: &str) -> IResult<&str, &str> {
    recognize((
        take_while1(|c: char| c.is_ascii_alphabetic() || c == '_'),
        take_while(|c: char| c.is_ascii_alphanumeric() || c == '_'),
    ))
    .parse(input)
}

/// Parse an operator-like token; validity is checked by the caller
fn parse_operator(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| matches!(c, '=' | '!' | '~' | '<' | '>')).parse(input)
}

/// Parse a double- or single-quoted string with backslash escapes
fn parse_string_value(input: &str) -> IResult<&str, String> {
    alt((
        delimited(
            char('"'),
            map(
                opt(escaped_transform(none_of("\\\""), '\\', parse_escape)),
                Option::unwrap_or_default,
            ),
            char('"'),
        ),
        delimited(
            char('\''),
            map(
                opt(escaped_transform(none_of("\\'"), '\\', parse_escape)),
                Option::unwrap_or_default,
            ),
            char('\''),
        ),
    ))
    .parse(input)
}

fn parse_escape(input: &str) -> IResult<&str, &str> {
    alt((
        value("\\", char('\\')),
        value("\"", char('"')),
        value("'", char('\'')),
        value("\n", char('n')),
        value("\t", char('t')),
    ))
    .parse(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_matcher() {
        let matchers = parse_selector(r#"{service_type="mysql"}"#).unwrap();
        assert_eq!(
            matchers,
            vec![RawMatcher {
                name: "service_type",
                op: "=",
                value: "mysql".to_string()
            }]
        );
    }

    #[test]
    fn test_parse_all_operators() {
        let matchers =
            parse_selector(r#"{ a = "1", b != "2", c =~ "x|y", d !~ "prod.*" }"#).unwrap();
        let ops: Vec<&str> = matchers.iter().map(|m| m.op).collect();
        assert_eq!(ops, vec!["=", "!=", "=~", "!~"]);
        assert_eq!(matchers[2].value, "x|y");
    }

    #[test]
    fn test_parse_escapes_and_single_quotes() {
        let matchers = parse_selector(r#"{a="say \"hi\"", b='it\'s', c=""}"#).unwrap();
        assert_eq!(matchers[0].value, "say \"hi\"");
        assert_eq!(matchers[1].value, "it's");
        assert_eq!(matchers[2].value, "");
    }

    #[test]
    fn test_unknown_operator_is_captured() {
        let matchers = parse_selector(r#"{a=="1"}"#).unwrap();
        assert_eq!(matchers[0].op, "==");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(parse_selector(r#"service_type="mysql""#).is_err());
        assert!(parse_selector(r#"{service_type="mysql""#).is_err());
        assert!(parse_selector(r#"{service_type=mysql}"#).is_err());
        assert!(parse_selector(r#"{1abc="x"}"#).is_err());
        assert!(parse_selector(r#"{a="1"} trailing"#).is_err());
    }

    #[test]
    fn test_parse_empty_braces() {
        assert!(parse_selector("{}").unwrap().is_empty());
    }
}
