use std::fmt;

use winnow::ascii::multispace0;
use winnow::combinator::{cut_err, fail, opt, peek};
use winnow::error::StrContext;
use winnow::prelude::*;
use winnow::token::take_till;

use crate::error::{Error, Result};

/// A node in a conditional dependency-specification tree.
///
/// The same grammar is shared by `DEPEND`-style atoms, `LICENSE`,
/// `SRC_URI` and `PROVIDE`; only the leaf type differs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepNode<T> {
    /// A typed element produced by the element constructor.
    Leaf(T),
    /// `( ... )`: all children apply.
    All(Vec<DepNode<T>>),
    /// `|| ( ... )`: any one child satisfies the group.
    AnyOf(Vec<DepNode<T>>),
    /// `flag? ( ... )` or `!flag? ( ... )`.
    UseConditional {
        /// USE flag name.
        flag: String,
        /// `true` for `!flag?`.
        negated: bool,
        /// Children guarded by the flag.
        entries: Vec<DepNode<T>>,
    },
}

/// A parsed depset: top-level nodes combined by AND.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepSet<T> {
    nodes: Vec<DepNode<T>>,
}

impl<T> Default for DepSet<T> {
    fn default() -> Self {
        DepSet { nodes: Vec::new() }
    }
}

impl<T> DepSet<T> {
    /// Wrap already built nodes.
    pub fn new(nodes: Vec<DepNode<T>>) -> Self {
        DepSet { nodes }
    }

    /// Top-level nodes, in source order.
    pub fn nodes(&self) -> &[DepNode<T>] {
        &self.nodes
    }

    /// Whether the tree has no nodes at all.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Every leaf, depth first, ignoring conditionals.
    pub fn leaves(&self) -> Vec<&T> {
        fn walk<'a, T>(nodes: &'a [DepNode<T>], out: &mut Vec<&'a T>) {
            for node in nodes {
                match node {
                    DepNode::Leaf(v) => out.push(v),
                    DepNode::All(entries)
                    | DepNode::AnyOf(entries)
                    | DepNode::UseConditional { entries, .. } => walk(entries, out),
                }
            }
        }
        let mut out = Vec::new();
        walk(&self.nodes, &mut out);
        out
    }

    /// Convert every leaf, keeping the tree shape.
    pub fn map<U, F>(self, mut f: F) -> DepSet<U>
    where
        F: FnMut(T) -> U,
    {
        fn convert<T, U, F: FnMut(T) -> U>(nodes: Vec<DepNode<T>>, f: &mut F) -> Vec<DepNode<U>> {
            nodes
                .into_iter()
                .map(|node| match node {
                    DepNode::Leaf(v) => DepNode::Leaf(f(v)),
                    DepNode::All(entries) => DepNode::All(convert(entries, f)),
                    DepNode::AnyOf(entries) => DepNode::AnyOf(convert(entries, f)),
                    DepNode::UseConditional {
                        flag,
                        negated,
                        entries,
                    } => DepNode::UseConditional {
                        flag,
                        negated,
                        entries: convert(entries, f),
                    },
                })
                .collect()
        }
        DepSet {
            nodes: convert(self.nodes, &mut f),
        }
    }
}

impl<T: Clone> DepSet<T> {
    /// Collapse USE conditionals for a configuration.
    ///
    /// Conditionals whose flag state matches are replaced by their contents,
    /// the others are dropped. `||` and plain groups are kept.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_cache::DepSetParser;
    ///
    /// let set = DepSetParser::new()
    ///     .parse("a ssl? ( b ) !ssl? ( c )", |t| Ok(t.to_string()))
    ///     .unwrap();
    /// let on = set.evaluate(|flag| flag == "ssl");
    /// assert_eq!(on.to_string(), "a b");
    /// let off = set.evaluate(|_| false);
    /// assert_eq!(off.to_string(), "a c");
    /// ```
    pub fn evaluate<F>(&self, enabled: F) -> DepSet<T>
    where
        F: Fn(&str) -> bool,
    {
        fn collapse<T: Clone, F: Fn(&str) -> bool>(
            nodes: &[DepNode<T>],
            enabled: &F,
            out: &mut Vec<DepNode<T>>,
        ) {
            for node in nodes {
                match node {
                    DepNode::Leaf(v) => out.push(DepNode::Leaf(v.clone())),
                    DepNode::All(entries) => {
                        let mut inner = Vec::new();
                        collapse(entries, enabled, &mut inner);
                        out.push(DepNode::All(inner));
                    }
                    DepNode::AnyOf(entries) => {
                        let mut inner = Vec::new();
                        collapse(entries, enabled, &mut inner);
                        out.push(DepNode::AnyOf(inner));
                    }
                    DepNode::UseConditional {
                        flag,
                        negated,
                        entries,
                    } => {
                        if enabled(flag) != *negated {
                            collapse(entries, enabled, out);
                        }
                    }
                }
            }
        }
        let mut nodes = Vec::new();
        collapse(&self.nodes, &enabled, &mut nodes);
        DepSet { nodes }
    }
}

fn fmt_nodes<T: fmt::Display>(f: &mut fmt::Formatter, nodes: &[DepNode<T>]) -> fmt::Result {
    for (i, node) in nodes.iter().enumerate() {
        if i > 0 {
            write!(f, " ")?;
        }
        write!(f, "{node}")?;
    }
    Ok(())
}

fn fmt_group<T: fmt::Display>(f: &mut fmt::Formatter, nodes: &[DepNode<T>]) -> fmt::Result {
    write!(f, "( ")?;
    fmt_nodes(f, nodes)?;
    if !nodes.is_empty() {
        write!(f, " ")?;
    }
    write!(f, ")")
}

impl<T: fmt::Display> fmt::Display for DepNode<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DepNode::Leaf(v) => write!(f, "{v}"),
            DepNode::All(entries) => fmt_group(f, entries),
            DepNode::AnyOf(entries) => {
                write!(f, "|| ")?;
                fmt_group(f, entries)
            }
            DepNode::UseConditional {
                flag,
                negated,
                entries,
            } => {
                if *negated {
                    write!(f, "!")?;
                }
                write!(f, "{flag}? ")?;
                fmt_group(f, entries)
            }
        }
    }
}

impl<T: fmt::Display> fmt::Display for DepSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_nodes(f, &self.nodes)
    }
}

/// Parser for the depset grammar.
///
/// Tokens are whitespace separated. A token is a leaf, `( ... )`,
/// `|| ( ... )`, or `flag? ( ... )` / `!flag? ( ... )`. Every leaf token is
/// handed to the element constructor, whose errors are returned unchanged.
#[derive(Debug, Clone, Copy)]
pub struct DepSetParser {
    allow_any_of: bool,
}

impl Default for DepSetParser {
    fn default() -> Self {
        DepSetParser { allow_any_of: true }
    }
}

impl DepSetParser {
    /// A parser accepting `|| ( )` groups.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject `||` groups (used for `SRC_URI`).
    pub fn without_any_of() -> Self {
        DepSetParser {
            allow_any_of: false,
        }
    }

    /// Parse `input`, building leaves with `element`.
    ///
    /// # Examples
    ///
    /// ```
    /// use portage_cache::{DepNode, DepSetParser};
    ///
    /// let set = DepSetParser::new()
    ///     .parse("a/b? ( cat/pkg1 ) || ( cat/pkg2 cat/pkg3 )", |t| Ok(t.to_string()))
    ///     .unwrap();
    /// assert_eq!(set.nodes().len(), 2);
    /// assert!(matches!(&set.nodes()[1], DepNode::AnyOf(e) if e.len() == 2));
    /// ```
    pub fn parse<T, F>(&self, input: &str, element: F) -> Result<DepSet<T>>
    where
        F: FnMut(&str) -> Result<T>,
    {
        let mut builder = Builder {
            element,
            allow_any_of: self.allow_any_of,
            failure: None,
        };

        let parsed = {
            let mut top = |i: &mut &str| -> ModalResult<Vec<DepNode<T>>> {
                let nodes = parse_entries(i, &mut builder)?;
                multispace0.parse_next(i)?;
                Ok(nodes)
            };
            top.parse(input).map_err(|e| format!("{e}"))
        };

        if let Some(failure) = builder.failure.take() {
            return Err(failure);
        }
        parsed
            .map(|nodes| DepSet { nodes })
            .map_err(Error::InvalidDepSet)
    }
}

struct Builder<F> {
    element: F,
    allow_any_of: bool,
    failure: Option<Error>,
}

// Winnow parsers

fn token<'s>(input: &mut &'s str) -> ModalResult<&'s str> {
    take_till(1.., char::is_whitespace).parse_next(input)
}

fn reject<O>(input: &mut &str, label: &'static str) -> ModalResult<O> {
    cut_err(fail)
        .context(StrContext::Label(label))
        .parse_next(input)
}

fn parse_entries<T, F>(input: &mut &str, b: &mut Builder<F>) -> ModalResult<Vec<DepNode<T>>>
where
    F: FnMut(&str) -> Result<T>,
{
    let mut nodes = Vec::new();
    loop {
        multispace0.parse_next(input)?;
        match opt(peek(token)).parse_next(input)? {
            None | Some(")") => return Ok(nodes),
            Some(_) => {}
        }
        let tok = token.parse_next(input)?;
        let node = match tok {
            "||" => {
                if !b.allow_any_of {
                    return reject(input, "'||' operator");
                }
                DepNode::AnyOf(parse_group(input, b)?)
            }
            "(" => DepNode::All(parse_group_body(input, b)?),
            cond if cond.ends_with('?') => {
                let cond = &cond[..cond.len() - 1];
                let (negated, flag) = match cond.strip_prefix('!') {
                    Some(flag) => (true, flag),
                    None => (false, cond),
                };
                if flag.is_empty() {
                    return reject(input, "USE flag name");
                }
                DepNode::UseConditional {
                    flag: flag.to_string(),
                    negated,
                    entries: parse_group(input, b)?,
                }
            }
            leaf => match (b.element)(leaf) {
                Ok(value) => DepNode::Leaf(value),
                Err(e) => {
                    b.failure = Some(e);
                    return reject(input, "element");
                }
            },
        };
        nodes.push(node);
    }
}

/// `( entries )` following an operator or a conditional.
fn parse_group<T, F>(input: &mut &str, b: &mut Builder<F>) -> ModalResult<Vec<DepNode<T>>>
where
    F: FnMut(&str) -> Result<T>,
{
    multispace0.parse_next(input)?;
    cut_err(token.verify(|t: &str| t == "("))
        .context(StrContext::Label("opening '('"))
        .parse_next(input)?;
    parse_group_body(input, b)
}

fn parse_group_body<T, F>(input: &mut &str, b: &mut Builder<F>) -> ModalResult<Vec<DepNode<T>>>
where
    F: FnMut(&str) -> Result<T>,
{
    let nodes = parse_entries(input, b)?;
    multispace0.parse_next(input)?;
    cut_err(token.verify(|t: &str| t == ")"))
        .context(StrContext::Label("closing ')'"))
        .parse_next(input)?;
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(input: &str) -> Result<DepSet<String>> {
        DepSetParser::new().parse(input, |t| Ok(t.to_string()))
    }

    fn leaf(s: &str) -> DepNode<String> {
        DepNode::Leaf(s.to_string())
    }

    #[test]
    fn conditional_and_any_of() {
        let set = strings("a/b? ( cat/pkg1 ) || ( cat/pkg2 cat/pkg3 )").unwrap();
        assert_eq!(
            set.nodes(),
            &[
                DepNode::UseConditional {
                    flag: "a/b".to_string(),
                    negated: false,
                    entries: vec![leaf("cat/pkg1")],
                },
                DepNode::AnyOf(vec![leaf("cat/pkg2"), leaf("cat/pkg3")]),
            ]
        );
    }

    #[test]
    fn negated_conditional() {
        let set = strings("!doc? ( x )").unwrap();
        assert!(matches!(
            &set.nodes()[0],
            DepNode::UseConditional { flag, negated: true, .. } if flag == "doc"
        ));
    }

    #[test]
    fn nested_groups() {
        let set = strings("ssl? ( || ( a ( b c ) ) ) d").unwrap();
        assert_eq!(set.leaves(), vec!["a", "b", "c", "d"]);
        match &set.nodes()[0] {
            DepNode::UseConditional { entries, .. } => match &entries[0] {
                DepNode::AnyOf(inner) => {
                    assert_eq!(inner[1], DepNode::All(vec![leaf("b"), leaf("c")]));
                }
                other => panic!("expected AnyOf, got {other:?}"),
            },
            other => panic!("expected UseConditional, got {other:?}"),
        }
    }

    #[test]
    fn whitespace_is_free_form() {
        let set = strings("\n\ta\n   x? (\n b\n)\t").unwrap();
        assert_eq!(set.to_string(), "a x? ( b )");
    }

    #[test]
    fn empty() {
        assert!(strings("").unwrap().is_empty());
        assert!(strings("   \n").unwrap().is_empty());
    }

    #[test]
    fn unbalanced() {
        assert!(matches!(strings("( a"), Err(Error::InvalidDepSet(_))));
        assert!(matches!(strings("a )"), Err(Error::InvalidDepSet(_))));
        assert!(matches!(strings("x? a"), Err(Error::InvalidDepSet(_))));
        assert!(matches!(strings("|| a"), Err(Error::InvalidDepSet(_))));
        assert!(matches!(strings("? ( a )"), Err(Error::InvalidDepSet(_))));
    }

    #[test]
    fn any_of_can_be_disabled() {
        let err = DepSetParser::without_any_of()
            .parse("|| ( a b )", |t| Ok(t.to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDepSet(_)));
    }

    #[test]
    fn constructor_error_passes_through() {
        let err = DepSetParser::new()
            .parse("good x? ( bad )", |t| {
                if t == "bad" {
                    Err(Error::MissingChksum(t.to_string()))
                } else {
                    Ok(t.to_string())
                }
            })
            .unwrap_err();
        assert!(matches!(err, Error::MissingChksum(ref f) if f == "bad"));
    }

    #[test]
    fn constructor_sees_each_leaf_once() {
        let mut seen = Vec::new();
        DepSetParser::new()
            .parse("a || ( b c ) d? ( e )", |t| {
                seen.push(t.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["a", "b", "c", "e"]);
    }

    #[test]
    fn evaluate_conditionals() {
        let set = strings("a x? ( b !y? ( c ) ) || ( d y? ( e ) )").unwrap();
        let evaluated = set.evaluate(|flag| flag == "x");
        assert_eq!(evaluated.to_string(), "a b c || ( d )");
        let evaluated = set.evaluate(|_| true);
        assert_eq!(evaluated.to_string(), "a b || ( d e )");
    }

    #[test]
    fn display_round_trip() {
        let input = "a/b? ( cat/pkg1 ) || ( cat/pkg2 cat/pkg3 ) ( x y )";
        let set = strings(input).unwrap();
        assert_eq!(set.to_string(), input);
        assert_eq!(strings(&set.to_string()).unwrap(), set);
    }

    #[test]
    fn map_keeps_shape() {
        let set = strings("a x? ( bb )").unwrap().map(|s| s.len());
        assert_eq!(set.leaves(), vec![&1, &2]);
        assert!(matches!(&set.nodes()[1], DepNode::UseConditional { .. }));
    }
}
