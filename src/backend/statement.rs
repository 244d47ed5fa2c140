//! Statement parser for the in-process engine
//!
//! Understands exactly the dialect the compiler emits:
//!
//! ```text
//! SELECT <sensor> FROM <pattern> [, <pattern> ...] WHERE time >= <i64> AND time < <i64>
//! INSERT INTO <device>(timestamp, <sensor>) VALUES(<i64>, <literal>)
//! ```

use nom::{
    branch::alt,
    bytes::complete::{tag, tag_no_case, take_while1},
    character::complete::{char, digit0, digit1, multispace0, multispace1, none_of, one_of},
    combinator::{map, map_res, opt, recognize, value},
    multi::{fold_many0, separated_list1},
    sequence::{delimited, pair, tuple},
    IResult,
};

use crate::sql::PathSegment;

/// A parsed statement
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Statement {
    Select {
        sensor: String,
        patterns: Vec<Vec<PathSegment>>,
        start: i64,
        end: i64,
    },
    Insert {
        device: Vec<PathSegment>,
        sensor: String,
        timestamp: i64,
        value: Literal,
    },
}

/// A value literal in an insert
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Literal {
    Integer(i64),
    Double(f64),
    Text(String),
}

/// Parse one statement; the error carries a readable reason
pub(crate) fn parse_statement(input: &str) -> Result<Statement, String> {
    let input = input.trim();

    match alt((parse_select, parse_insert))(input) {
        Ok((remaining, statement)) => {
            if remaining.trim().is_empty() {
                Ok(statement)
            } else {
                Err(format!(
                    "Unexpected input after statement: '{}'",
                    remaining.trim()
                ))
            }
        }
        Err(e) => Err(format!("Parse error: {:?}", e)),
    }
}

fn parse_select(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("SELECT")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, sensor) = parse_name(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("FROM")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, patterns) = separated_list1(
        delimited(multispace0, char(','), multispace0),
        parse_path,
    )(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("WHERE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, start) = parse_bound(">=")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("AND")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, end) = parse_bound("<")(input)?;

    Ok((
        input,
        Statement::Select {
            sensor,
            patterns,
            start,
            end,
        },
    ))
}

fn parse_insert(input: &str) -> IResult<&str, Statement> {
    let (input, _) = tag_no_case("INSERT")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("INTO")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, device) = parse_path(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char('(')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = tag_no_case("timestamp")(input)?;
    let (input, _) = delimited(multispace0, char(','), multispace0)(input)?;
    let (input, sensor) = parse_name(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char(')')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = tag_no_case("VALUES")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char('(')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, timestamp) = parse_i64(input)?;
    let (input, _) = delimited(multispace0, char(','), multispace0)(input)?;
    let (input, value) = parse_literal(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = char(')')(input)?;

    Ok((
        input,
        Statement::Insert {
            device,
            sensor,
            timestamp,
            value,
        },
    ))
}

/// `time <op> <i64>`
fn parse_bound<'a>(op: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, i64> {
    move |input| {
        let (input, _) = tag_no_case("time")(input)?;
        let (input, _) = multispace0(input)?;
        let (input, _) = tag(op)(input)?;
        let (input, _) = multispace0(input)?;
        parse_i64(input)
    }
}

fn parse_path(input: &str) -> IResult<&str, Vec<PathSegment>> {
    separated_list1(char('.'), parse_segment)(input)
}

fn parse_segment(input: &str) -> IResult<&str, PathSegment> {
    alt((
        value(PathSegment::Wildcard, char('*')),
        map(parse_name, PathSegment::Value),
    ))(input)
}

/// A plain identifier or a backtick-quoted name
fn parse_name(input: &str) -> IResult<&str, String> {
    alt((
        parse_quoted('`'),
        map(
            take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
            |s: &str| s.to_string(),
        ),
    ))(input)
}

/// Text between `quote`s, with a doubled quote standing for one
fn parse_quoted<'a>(quote: char) -> impl FnMut(&'a str) -> IResult<&'a str, String> {
    move |input| {
        let escaped: &'static str = if quote == '`' { "``" } else { "''" };
        let (input, _) = char(quote)(input)?;
        let (input, text) = fold_many0(
            alt((value(quote, tag(escaped)), none_of(if quote == '`' { "`" } else { "'" }))),
            String::new,
            |mut acc, c| {
                acc.push(c);
                acc
            },
        )(input)?;
        let (input, _) = char(quote)(input)?;
        Ok((input, text))
    }
}

fn parse_i64(input: &str) -> IResult<&str, i64> {
    map_res(recognize(pair(opt(char('-')), digit1)), |s: &str| {
        s.parse::<i64>()
    })(input)
}

fn parse_literal(input: &str) -> IResult<&str, Literal> {
    alt((map(parse_quoted('\''), Literal::Text), parse_number))(input)
}

fn parse_number(input: &str) -> IResult<&str, Literal> {
    map_res(
        recognize(tuple((
            opt(char('-')),
            digit1,
            opt(pair(char('.'), digit0)),
            opt(tuple((one_of("eE"), opt(one_of("+-")), digit1))),
        ))),
        |s: &str| -> Result<Literal, String> {
            if s.contains(['.', 'e', 'E']) {
                s.parse::<f64>()
                    .map(Literal::Double)
                    .map_err(|e| e.to_string())
            } else {
                s.parse::<i64>()
                    .map(Literal::Integer)
                    .map_err(|e| e.to_string())
            }
        },
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> PathSegment {
        PathSegment::Value(s.to_string())
    }

    #[test]
    fn test_parse_select() {
        let stmt = parse_statement(
            "SELECT `cpu.usage` FROM root.*.a.*, root.*.`us-east`.b WHERE time >= 1000 AND time < 5000",
        )
        .unwrap();

        assert_eq!(
            stmt,
            Statement::Select {
                sensor: "cpu.usage".into(),
                patterns: vec![
                    vec![v("root"), PathSegment::Wildcard, v("a"), PathSegment::Wildcard],
                    vec![v("root"), PathSegment::Wildcard, v("us-east"), v("b")],
                ],
                start: 1000,
                end: 5000,
            }
        );
    }

    #[test]
    fn test_parse_insert_literals() {
        let stmt =
            parse_statement("INSERT INTO root.group_1.a._(timestamp, load) VALUES(-5, 1.5)").unwrap();
        match stmt {
            Statement::Insert {
                device,
                sensor,
                timestamp,
                value,
            } => {
                assert_eq!(device, vec![v("root"), v("group_1"), v("a"), v("_")]);
                assert_eq!(sensor, "load");
                assert_eq!(timestamp, -5);
                assert_eq!(value, Literal::Double(1.5));
            }
            other => panic!("unexpected statement: {:?}", other),
        }

        let stmt =
            parse_statement("INSERT INTO root.g.x(timestamp, s) VALUES(1, 'it''s')").unwrap();
        assert!(matches!(stmt, Statement::Insert { value: Literal::Text(ref t), .. } if t == "it's"));

        let stmt = parse_statement("INSERT INTO root.g.x(timestamp, s) VALUES(1, 42)").unwrap();
        assert!(matches!(stmt, Statement::Insert { value: Literal::Integer(42), .. }));
    }

    #[test]
    fn test_quoted_backticks() {
        let stmt = parse_statement("INSERT INTO root.g.`a``b`(timestamp, m) VALUES(1, 2)").unwrap();
        assert!(matches!(stmt, Statement::Insert { ref device, .. } if device[2] == v("a`b")));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_statement("DROP TIMESERIES root.**").is_err());
        assert!(parse_statement("SELECT m FROM root.* WHERE time >= 1 AND time < 2 LIMIT 1").is_err());
    }
}
