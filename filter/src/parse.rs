use super::*;
use winnow::{
    ModalResult, Parser,
    ascii::multispace0,
    combinator::{alt, cut_err, delimited, preceded, repeat, terminated},
    error::{StrContext, StrContextValue},
    token::{any, take_till},
};

impl std::str::FromStr for Filter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        terminated(parse_filter, multispace0)
            .parse(s)
            .map_err(|e| Error::Parse {
                offset: e.offset(),
                message: e.inner().to_string(),
            })
    }
}

// filter = '(' filter-comp ')'
fn parse_filter(input: &mut &str) -> ModalResult<Filter> {
    preceded(
        multispace0,
        delimited(
            '(',
            parse_filter_comp,
            cut_err(preceded(multispace0, ')')).context(StrContext::Expected(
                StrContextValue::Description("closing parenthesis"),
            )),
        ),
    )
    .parse_next(input)
}

// filter-comp = '&' filter* / '|' filter* / '!' filter / item
fn parse_filter_comp(input: &mut &str) -> ModalResult<Filter> {
    preceded(
        multispace0,
        alt((
            preceded('&', parse_filter_list).map(Filter::And),
            preceded('|', parse_filter_list).map(Filter::Or),
            preceded('!', cut_err(parse_filter)).map(|f| Filter::Not(Box::new(f))),
            parse_item,
        )),
    )
    .parse_next(input)
}

// Sub-filters of an AND/OR; empty lists are legal and carry the defined
// truth values. The enclosing ')' is left for parse_filter.
fn parse_filter_list(input: &mut &str) -> ModalResult<Vec<Filter>> {
    repeat(0.., parse_filter).parse_next(input)
}

// item = attr ( '~=' / '>=' / '<=' / '>' / '<' / '=' ) rhs
fn parse_item(input: &mut &str) -> ModalResult<Filter> {
    (parse_attr, parse_op)
        .map(|(attr, op)| Filter::Item(Item { attr, op }))
        .parse_next(input)
}

// attr = 1*<any character except '=' '~' '<' '>' '(' ')'>
// Trailing whitespace belongs to the token gap, not the attribute.
fn parse_attr(input: &mut &str) -> ModalResult<String> {
    cut_err(take_till(1.., ('=', '~', '<', '>', '(', ')')))
        .map(|attr: &str| attr.trim_end().to_string())
        .context(StrContext::Label("attribute"))
        .parse_next(input)
}

fn parse_op(input: &mut &str) -> ModalResult<Op> {
    alt((
        preceded(('~', cut_err('=')), parse_value).map(Op::Approx),
        preceded(">=", parse_value).map(Op::GreaterEq),
        preceded("<=", parse_value).map(Op::LessEq),
        preceded('>', parse_value).map(Op::Greater),
        preceded('<', parse_value).map(Op::Less),
        preceded('=', parse_equal_rhs),
    ))
    .parse_next(input)
}

#[derive(Clone)]
enum Fragment<'a> {
    Literal(&'a str),
    Escaped(char),
    Wildcard,
}

// escaped = '\' <any>; the escaped character is always a literal
fn parse_escaped(input: &mut &str) -> ModalResult<char> {
    preceded('\\', cut_err(any))
        .context(StrContext::Label("escaped character"))
        .parse_next(input)
}

// Fragment of a comparison value: '*' is an ordinary character here, ')'
// terminates and '(' must be escaped.
fn parse_value_fragment<'a>(input: &mut &'a str) -> ModalResult<Fragment<'a>> {
    alt((
        parse_escaped.map(Fragment::Escaped),
        take_till(1.., ('\\', '(', ')')).map(Fragment::Literal),
    ))
    .parse_next(input)
}

// Fragment of an '=' right-hand side, where an unescaped '*' is a
// substring wildcard.
fn parse_pattern_fragment<'a>(input: &mut &'a str) -> ModalResult<Fragment<'a>> {
    alt((
        '*'.value(Fragment::Wildcard),
        parse_escaped.map(Fragment::Escaped),
        take_till(1.., ('\\', '(', ')', '*')).map(Fragment::Literal),
    ))
    .parse_next(input)
}

// value = fragment+; zero-length comparison values are rejected
fn parse_value(input: &mut &str) -> ModalResult<String> {
    cut_err(repeat(1.., parse_value_fragment).fold(String::new, push_fragment))
        .context(StrContext::Label("value"))
        .parse_next(input)
}

fn push_fragment(mut value: String, fragment: Fragment<'_>) -> String {
    match fragment {
        Fragment::Literal(s) => value.push_str(s),
        Fragment::Escaped(c) => value.push(c),
        Fragment::Wildcard => value.push('*'),
    }
    value
}

// rhs = fragment*, folded into the segments between unescaped '*'s:
// no wildcard is EQUAL (an empty rhs is EQUAL against the empty string),
// a lone '*' is PRESENT, anything else is a SUBSTRING pattern.
fn parse_equal_rhs(input: &mut &str) -> ModalResult<Op> {
    let (segments, current): (Vec<String>, String) = repeat(0.., parse_pattern_fragment)
        .fold(
            || (Vec::new(), String::new()),
            |(mut segments, mut current), fragment| {
                match fragment {
                    Fragment::Wildcard => segments.push(std::mem::take(&mut current)),
                    Fragment::Escaped(c) => current.push(c),
                    Fragment::Literal(s) => current.push_str(s),
                }
                (segments, current)
            },
        )
        .parse_next(input)?;

    let lone_star =
        segments.len() == 1 && current.is_empty() && segments.iter().all(String::is_empty);
    Ok(if segments.is_empty() {
        Op::Equal(current)
    } else if lone_star {
        Op::Present
    } else {
        let mut iter = segments.into_iter();
        let first = iter.next().unwrap_or_default();
        Op::Substring(SubstringPattern {
            prefix: (!first.is_empty()).then_some(first),
            inner: iter.filter(|s| !s.is_empty()).collect(),
            suffix: (!current.is_empty()).then_some(current),
        })
    })
}
