use bosun_properties::Properties;
use std::borrow::Cow;
use thiserror::Error;

mod parse;


#[derive(Error, Debug)]
pub enum Error {
    #[error("Parse error at offset {offset}: {message}")]
    Parse { offset: usize, message: String },
}

/// A parsed LDAP-style filter expression, evaluated against [`Properties`]
/// snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(into = "String"))]
#[cfg_attr(feature = "serde", serde(try_from = "Cow<'_,str>"))]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    Item(Item),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub attr: String,
    pub op: Op,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Equal(String),
    Approx(String),
    Greater(String),
    GreaterEq(String),
    Less(String),
    LessEq(String),
    Present,
    Substring(SubstringPattern),
}

/// The chunks of a `initial? '*' (any '*')* final?` substring pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstringPattern {
    pub prefix: Option<String>,
    pub inner: Vec<String>,
    pub suffix: Option<String>,
}

impl Filter {
    /// Evaluates the filter against a property snapshot.
    ///
    /// An absent attribute makes every leaf comparison false, including
    /// PRESENT; negation is applied by enclosing NOT nodes.
    pub fn matches(&self, props: &Properties) -> bool {
        match self {
            Filter::And(children) => children.iter().all(|f| f.matches(props)),
            Filter::Or(children) => children.iter().any(|f| f.matches(props)),
            Filter::Not(inner) => !inner.matches(props),
            Filter::Item(item) => item.matches(props),
        }
    }

    /// Structural equivalence, with AND/OR children compared as multisets.
    pub fn matches_filter(&self, other: &Filter) -> bool {
        match (self, other) {
            (Filter::And(a), Filter::And(b)) | (Filter::Or(a), Filter::Or(b)) => {
                unordered_eq(a, b)
            }
            (Filter::Not(a), Filter::Not(b)) => a.matches_filter(b),
            (Filter::Item(a), Filter::Item(b)) => a == b,
            _ => false,
        }
    }
}

/// [`Filter::matches_filter`] lifted over optional filters: both-none is
/// equal, one-none is not.
pub fn filters_equivalent(lhs: Option<&Filter>, rhs: Option<&Filter>) -> bool {
    match (lhs, rhs) {
        (None, None) => true,
        (Some(l), Some(r)) => l.matches_filter(r),
        _ => false,
    }
}

fn unordered_eq(lhs: &[Filter], rhs: &[Filter]) -> bool {
    if lhs.len() != rhs.len() {
        return false;
    }
    let mut used = vec![false; rhs.len()];
    'next: for l in lhs {
        for (i, r) in rhs.iter().enumerate() {
            if !used[i] && l.matches_filter(r) {
                used[i] = true;
                continue 'next;
            }
        }
        return false;
    }
    true
}

impl Item {
    fn matches(&self, props: &Properties) -> bool {
        let Some(value) = props.get(&self.attr) else {
            return false;
        };

        match &self.op {
            Op::Present => true,
            Op::Equal(pattern) => value == pattern,
            Op::Approx(pattern) => approx_normalize(value) == approx_normalize(pattern),
            Op::Greater(pattern) => ordered_cmp(value, pattern).is_gt(),
            Op::GreaterEq(pattern) => ordered_cmp(value, pattern).is_ge(),
            Op::Less(pattern) => ordered_cmp(value, pattern).is_lt(),
            Op::LessEq(pattern) => ordered_cmp(value, pattern).is_le(),
            Op::Substring(pattern) => pattern.matches(value),
        }
    }
}

impl SubstringPattern {
    /// Left-to-right, non-overlapping match of prefix, inner chunks and
    /// suffix against `value`.
    pub fn matches(&self, value: &str) -> bool {
        let mut rest = value;
        if let Some(prefix) = &self.prefix {
            match rest.strip_prefix(prefix.as_str()) {
                Some(r) => rest = r,
                None => return false,
            }
        }
        if let Some(suffix) = &self.suffix {
            match rest.strip_suffix(suffix.as_str()) {
                Some(r) => rest = r,
                None => return false,
            }
        }
        for chunk in &self.inner {
            match rest.find(chunk.as_str()) {
                Some(at) => rest = &rest[at + chunk.len()..],
                None => return false,
            }
        }
        true
    }
}

// Lowercase, strip leading/trailing whitespace, collapse internal whitespace
// runs to a single space. Applied to both sides of `~=`.
fn approx_normalize(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for word in s.split_whitespace() {
        if !out.is_empty() {
            out.push(' ');
        }
        out.extend(word.chars().flat_map(char::to_lowercase));
    }
    out
}

// Numeric comparison when both sides parse as the same numeric type,
// code-point string order otherwise.
fn ordered_cmp(lhs: &str, rhs: &str) -> std::cmp::Ordering {
    if let (Ok(l), Ok(r)) = (lhs.trim().parse::<i64>(), rhs.trim().parse::<i64>()) {
        l.cmp(&r)
    } else if let (Ok(l), Ok(r)) = (lhs.trim().parse::<f64>(), rhs.trim().parse::<f64>()) {
        l.partial_cmp(&r).unwrap_or_else(|| lhs.cmp(rhs))
    } else {
        lhs.cmp(rhs)
    }
}

impl TryFrom<Cow<'_, str>> for Filter {
    type Error = Error;

    fn try_from(value: Cow<'_, str>) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Filter> for String {
    fn from(value: Filter) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::And(children) => {
                f.write_str("(&")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
            Filter::Or(children) => {
                f.write_str("(|")?;
                for child in children {
                    write!(f, "{child}")?;
                }
                f.write_str(")")
            }
            Filter::Not(inner) => write!(f, "(!{inner})"),
            Filter::Item(item) => write!(f, "{item}"),
        }
    }
}

impl std::fmt::Display for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}", self.attr)?;
        match &self.op {
            Op::Equal(v) => {
                f.write_str("=")?;
                write_escaped(f, v)?;
            }
            Op::Approx(v) => {
                f.write_str("~=")?;
                write_escaped(f, v)?;
            }
            Op::Greater(v) => {
                f.write_str(">")?;
                write_escaped(f, v)?;
            }
            Op::GreaterEq(v) => {
                f.write_str(">=")?;
                write_escaped(f, v)?;
            }
            Op::Less(v) => {
                f.write_str("<")?;
                write_escaped(f, v)?;
            }
            Op::LessEq(v) => {
                f.write_str("<=")?;
                write_escaped(f, v)?;
            }
            Op::Present => f.write_str("=*")?,
            Op::Substring(pattern) => {
                f.write_str("=")?;
                if let Some(prefix) = &pattern.prefix {
                    write_escaped(f, prefix)?;
                }
                for chunk in &pattern.inner {
                    f.write_str("*")?;
                    write_escaped(f, chunk)?;
                }
                f.write_str("*")?;
                if let Some(suffix) = &pattern.suffix {
                    write_escaped(f, suffix)?;
                }
            }
        }
        f.write_str(")")
    }
}

fn write_escaped(f: &mut std::fmt::Formatter<'_>, s: &str) -> std::fmt::Result {
    use std::fmt::Write;
    for c in s.chars() {
        if matches!(c, '\\' | '(' | ')' | '*') {
            f.write_char('\\')?;
        }
        f.write_char(c)?;
    }
    Ok(())
}
