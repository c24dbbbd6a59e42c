//! A small CSS selector engine: type, `#id`, `.class` and attribute selectors
//! (`[a]`, `=`, `^=`, `$=`, `*=`, `~=`), the structural pseudo-classes
//! (`:first-child`, `:nth-of-type(2n+1)` and friends), descendant and child
//! combinators, and comma-separated lists. Any other pseudo-class is rejected as
//! unsupported.

use std::fmt;

use thiserror::Error;

use super::{Document, NodeKey};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SelectorError {
    #[error("empty selector")]
    Empty,

    #[error("unexpected '{found}' at offset {offset} in selector")]
    Unexpected { found: char, offset: usize },

    #[error("unsupported selector syntax: {0}")]
    Unsupported(String),

    #[error("unterminated {0} in selector")]
    Unterminated(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttrOp {
    Exists,
    Equals,
    Prefix,
    Suffix,
    Contains,
    Word,
}

#[derive(Debug, Clone, PartialEq)]
struct AttrSel {
    name: String,
    op: AttrOp,
    value: String,
}

impl AttrSel {
    fn matches(&self, actual: Option<&str>) -> bool {
        let Some(actual) = actual else {
            return false;
        };
        let v = self.value.as_str();
        match self.op {
            AttrOp::Exists => true,
            AttrOp::Equals => actual == v,
            AttrOp::Prefix => !v.is_empty() && actual.starts_with(v),
            AttrOp::Suffix => !v.is_empty() && actual.ends_with(v),
            AttrOp::Contains => !v.is_empty() && actual.contains(v),
            AttrOp::Word => actual.split_whitespace().any(|w| w == v),
        }
    }
}

/// `an+b`: matches 1-based positions `p` with `p = a*n + b` for some `n >= 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Nth {
    a: i64,
    b: i64,
}

impl Nth {
    const FIRST: Nth = Nth { a: 0, b: 1 };

    fn parse(arg: &str) -> Option<Nth> {
        let arg: String = arg.chars().filter(|c| !c.is_whitespace()).collect();
        let arg = arg.to_ascii_lowercase();
        match arg.as_str() {
            "odd" => return Some(Nth { a: 2, b: 1 }),
            "even" => return Some(Nth { a: 2, b: 0 }),
            _ => {}
        }
        let Some((coefficient, offset)) = arg.split_once('n') else {
            return Some(Nth { a: 0, b: arg.parse().ok()? });
        };
        let a = match coefficient {
            "" | "+" => 1,
            "-" => -1,
            c => c.parse().ok()?,
        };
        let b = match offset {
            "" => 0,
            o if o.starts_with('+') || o.starts_with('-') => o.parse().ok()?,
            _ => return None,
        };
        Some(Nth { a, b })
    }

    fn matches(&self, position: i64) -> bool {
        if self.a == 0 {
            return position == self.b;
        }
        let diff = position - self.b;
        diff % self.a == 0 && diff / self.a >= 0
    }
}

/// A structural pseudo-class, kept with its source text for display.
#[derive(Debug, Clone, PartialEq)]
struct Pseudo {
    source: String,
    nth: Nth,
    of_type: bool,
    from_end: bool,
}

impl Pseudo {
    fn parse(name: &str, arg: Option<&str>) -> Result<Pseudo, SelectorError> {
        let lower = name.to_ascii_lowercase();
        let source = match arg {
            Some(arg) => format!(":{lower}({})", arg.trim()),
            None => format!(":{lower}"),
        };
        let (nth, of_type, from_end) = match (lower.as_str(), arg) {
            ("first-child", None) => (Nth::FIRST, false, false),
            ("last-child", None) => (Nth::FIRST, false, true),
            ("first-of-type", None) => (Nth::FIRST, true, false),
            ("last-of-type", None) => (Nth::FIRST, true, true),
            ("nth-child", Some(arg)) => (nth_arg(arg, &source)?, false, false),
            ("nth-last-child", Some(arg)) => (nth_arg(arg, &source)?, false, true),
            ("nth-of-type", Some(arg)) => (nth_arg(arg, &source)?, true, false),
            ("nth-last-of-type", Some(arg)) => (nth_arg(arg, &source)?, true, true),
            _ => return Err(SelectorError::Unsupported(source)),
        };
        Ok(Pseudo {
            source,
            nth,
            of_type,
            from_end,
        })
    }

    fn matches(&self, doc: &Document, key: NodeKey, tag: &str) -> bool {
        let siblings: Vec<NodeKey> = match doc.parent(key) {
            Some(parent) => doc
                .children(parent)
                .iter()
                .copied()
                .filter(|&k| {
                    doc.element(k)
                        .is_ok_and(|e| !self.of_type || e.tag.eq_ignore_ascii_case(tag))
                })
                .collect(),
            None => vec![key],
        };
        let Some(index) = siblings.iter().position(|&k| k == key) else {
            return false;
        };
        let position = if self.from_end {
            siblings.len() - index
        } else {
            index + 1
        };
        self.nth.matches(position as i64)
    }
}

fn nth_arg(arg: &str, source: &str) -> Result<Nth, SelectorError> {
    Nth::parse(arg).ok_or_else(|| SelectorError::Unsupported(source.to_string()))
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Compound {
    tag: Option<String>,
    ids: Vec<String>,
    classes: Vec<String>,
    attrs: Vec<AttrSel>,
    pseudos: Vec<Pseudo>,
}

impl Compound {
    fn is_empty(&self) -> bool {
        self.tag.is_none()
            && self.ids.is_empty()
            && self.classes.is_empty()
            && self.attrs.is_empty()
            && self.pseudos.is_empty()
    }

    fn matches(&self, doc: &Document, key: NodeKey) -> bool {
        let Ok(element) = doc.element(key) else {
            return false;
        };
        if let Some(tag) = &self.tag {
            if tag != "*" && !tag.eq_ignore_ascii_case(&element.tag) {
                return false;
            }
        }
        if !self.ids.iter().all(|id| element.attr("id") == Some(id.as_str())) {
            return false;
        }
        if !self
            .classes
            .iter()
            .all(|class| element.classes().any(|c| c == class))
        {
            return false;
        }
        self.attrs.iter().all(|a| a.matches(element.attr(&a.name)))
            && self.pseudos.iter().all(|p| p.matches(doc, key, &element.tag))
    }

    fn has_id_fragment(&self) -> bool {
        !self.ids.is_empty() || self.attrs.iter().any(|a| a.name.eq_ignore_ascii_case("id"))
    }

    /// Replace digit runs in id constraints with prefix/suffix matches.
    fn wildcard_ids(&self) -> Option<Compound> {
        let mut changed = false;
        let mut out = Compound {
            tag: self.tag.clone(),
            ids: Vec::new(),
            classes: self.classes.clone(),
            attrs: Vec::new(),
            pseudos: self.pseudos.clone(),
        };

        let exact_ids = self.ids.iter().map(String::as_str).chain(
            self.attrs
                .iter()
                .filter(|a| a.name.eq_ignore_ascii_case("id") && a.op == AttrOp::Equals)
                .map(|a| a.value.as_str()),
        );
        for id in exact_ids {
            match wildcard(id) {
                Some(attrs) => {
                    changed = true;
                    out.attrs.extend(attrs);
                }
                None => out.ids.push(id.to_string()),
            }
        }
        out.attrs.extend(
            self.attrs
                .iter()
                .filter(|a| !(a.name.eq_ignore_ascii_case("id") && a.op == AttrOp::Equals))
                .cloned(),
        );
        changed.then_some(out)
    }
}

/// `btn-4821` becomes `[id^="btn-"]`; `row-17-title` also gains `[id$="-title"]`.
fn wildcard(id: &str) -> Option<Vec<AttrSel>> {
    let first = id.find(|c: char| c.is_ascii_digit())?;
    let last = id.rfind(|c: char| c.is_ascii_digit())?;
    let prefix = &id[..first];
    let suffix = &id[last + 1..];

    let mut attrs = Vec::new();
    if !prefix.is_empty() {
        attrs.push(AttrSel {
            name: "id".into(),
            op: AttrOp::Prefix,
            value: prefix.into(),
        });
    }
    if !suffix.is_empty() {
        attrs.push(AttrSel {
            name: "id".into(),
            op: AttrOp::Suffix,
            value: suffix.into(),
        });
    }
    if attrs.is_empty() {
        attrs.push(AttrSel {
            name: "id".into(),
            op: AttrOp::Exists,
            value: String::new(),
        });
    }
    Some(attrs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Combinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq)]
struct Complex {
    compounds: Vec<Compound>,
    /// `combinators[i]` joins `compounds[i]` and `compounds[i + 1]`.
    combinators: Vec<Combinator>,
}

impl Complex {
    fn matches(&self, doc: &Document, key: NodeKey) -> bool {
        self.matches_from(doc, key, self.compounds.len() - 1)
    }

    fn matches_from(&self, doc: &Document, key: NodeKey, i: usize) -> bool {
        if !self.compounds[i].matches(doc, key) {
            return false;
        }
        if i == 0 {
            return true;
        }
        match self.combinators[i - 1] {
            Combinator::Child => doc
                .parent_element(key)
                .is_some_and(|p| self.matches_from(doc, p, i - 1)),
            Combinator::Descendant => {
                let mut ancestor = doc.parent_element(key);
                while let Some(a) = ancestor {
                    if self.matches_from(doc, a, i - 1) {
                        return true;
                    }
                    ancestor = doc.parent_element(a);
                }
                false
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    alternatives: Vec<Complex>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        Parser::new(input).parse()
    }

    pub fn matches(&self, doc: &Document, key: NodeKey) -> bool {
        self.alternatives.iter().any(|c| c.matches(doc, key))
    }

    /// Whether any part of the selector pins an element id.
    pub fn has_id_fragment(&self) -> bool {
        self.alternatives
            .iter()
            .any(|c| c.compounds.iter().any(Compound::has_id_fragment))
    }

    /// A looser selector that tolerates regenerated ids, or `None` when no id carries a
    /// digit run to wildcard.
    pub fn wildcard_ids(&self) -> Option<Selector> {
        let mut changed = false;
        let alternatives = self
            .alternatives
            .iter()
            .map(|complex| Complex {
                compounds: complex
                    .compounds
                    .iter()
                    .map(|compound| match compound.wildcard_ids() {
                        Some(generic) => {
                            changed = true;
                            generic
                        }
                        None => compound.clone(),
                    })
                    .collect(),
                combinators: complex.combinators.clone(),
            })
            .collect();
        changed.then_some(Selector { alternatives })
    }
}

impl Document {
    pub fn query_selector(&self, selector: &Selector) -> Option<NodeKey> {
        self.elements()
            .into_iter()
            .find(|&k| selector.matches(self, k))
    }

    pub fn query_selector_all(&self, selector: &Selector) -> Vec<NodeKey> {
        self.elements()
            .into_iter()
            .filter(|&k| selector.matches(self, k))
            .collect()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (n, complex) in self.alternatives.iter().enumerate() {
            if n > 0 {
                f.write_str(", ")?;
            }
            for (i, compound) in complex.compounds.iter().enumerate() {
                if i > 0 {
                    match complex.combinators[i - 1] {
                        Combinator::Descendant => f.write_str(" ")?,
                        Combinator::Child => f.write_str(" > ")?,
                    }
                }
                write_compound(f, compound)?;
            }
        }
        Ok(())
    }
}

fn write_compound(f: &mut fmt::Formatter<'_>, compound: &Compound) -> fmt::Result {
    if let Some(tag) = &compound.tag {
        f.write_str(tag)?;
    }
    for id in &compound.ids {
        write!(f, "#{id}")?;
    }
    for class in &compound.classes {
        write!(f, ".{class}")?;
    }
    for attr in &compound.attrs {
        let op = match attr.op {
            AttrOp::Exists => {
                write!(f, "[{}]", attr.name)?;
                continue;
            }
            AttrOp::Equals => "=",
            AttrOp::Prefix => "^=",
            AttrOp::Suffix => "$=",
            AttrOp::Contains => "*=",
            AttrOp::Word => "~=",
        };
        write!(f, "[{}{}\"{}\"]", attr.name, op, attr.value.replace('"', "\\\""))?;
    }
    for pseudo in &compound.pseudos {
        f.write_str(&pseudo.source)?;
    }
    Ok(())
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    input: &'a str,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
            input,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn skip_ws(&mut self) -> bool {
        let start = self.pos;
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
        self.pos > start
    }

    fn unexpected(&self) -> SelectorError {
        match self.peek() {
            Some(found) => SelectorError::Unexpected {
                found,
                offset: self.pos,
            },
            None => SelectorError::Unterminated("selector"),
        }
    }

    fn parse(mut self) -> Result<Selector, SelectorError> {
        if self.input.trim().is_empty() {
            return Err(SelectorError::Empty);
        }
        let mut alternatives = vec![self.complex()?];
        while self.peek() == Some(',') {
            self.bump();
            alternatives.push(self.complex()?);
        }
        if self.peek().is_some() {
            return Err(self.unexpected());
        }
        Ok(Selector { alternatives })
    }

    fn complex(&mut self) -> Result<Complex, SelectorError> {
        self.skip_ws();
        let mut compounds = vec![self.compound()?];
        let mut combinators = Vec::new();
        loop {
            let had_ws = self.skip_ws();
            match self.peek() {
                None | Some(',') => break,
                Some('>') => {
                    self.bump();
                    self.skip_ws();
                    combinators.push(Combinator::Child);
                }
                Some(_) if had_ws => combinators.push(Combinator::Descendant),
                Some(_) => return Err(self.unexpected()),
            }
            compounds.push(self.compound()?);
        }
        Ok(Complex {
            compounds,
            combinators,
        })
    }

    fn compound(&mut self) -> Result<Compound, SelectorError> {
        let mut compound = Compound::default();
        if self.peek() == Some('*') {
            self.bump();
            compound.tag = Some("*".into());
        } else if self.peek().is_some_and(is_ident_char) {
            compound.tag = Some(self.ident()?.to_ascii_lowercase());
        }
        loop {
            match self.peek() {
                Some('#') => {
                    self.bump();
                    compound.ids.push(self.ident()?);
                }
                Some('.') => {
                    self.bump();
                    compound.classes.push(self.ident()?);
                }
                Some('[') => {
                    self.bump();
                    compound.attrs.push(self.attribute()?);
                }
                Some(':') => {
                    self.bump();
                    compound.pseudos.push(self.pseudo()?);
                }
                _ => break,
            }
        }
        if compound.is_empty() {
            return Err(self.unexpected());
        }
        Ok(compound)
    }

    fn pseudo(&mut self) -> Result<Pseudo, SelectorError> {
        if self.peek() == Some(':') {
            let rest: String = self.chars[self.pos - 1..].iter().collect();
            return Err(SelectorError::Unsupported(rest));
        }
        let name = self.ident()?;
        if self.peek() != Some('(') {
            return Pseudo::parse(&name, None);
        }
        self.bump();
        let mut arg = String::new();
        loop {
            match self.bump() {
                Some(')') => break,
                Some('(') => {
                    let rest: String = self.chars[self.pos - 1..].iter().collect();
                    return Err(SelectorError::Unsupported(format!(":{name}({arg}{rest}")));
                }
                Some(c) => arg.push(c),
                None => return Err(SelectorError::Unterminated("pseudo-class argument")),
            }
        }
        Pseudo::parse(&name, Some(&arg))
    }

    fn ident(&mut self) -> Result<String, SelectorError> {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '\\' {
                self.bump();
                out.push(self.bump().ok_or(SelectorError::Unterminated("escape"))?);
            } else if is_ident_char(c) {
                self.bump();
                out.push(c);
            } else {
                break;
            }
        }
        if out.is_empty() {
            return Err(self.unexpected());
        }
        Ok(out)
    }

    fn attribute(&mut self) -> Result<AttrSel, SelectorError> {
        self.skip_ws();
        let mut name = String::new();
        while let Some(c) = self.peek() {
            if is_ident_char(c) || c == ':' || c == '@' {
                self.bump();
                name.push(c);
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(self.unexpected());
        }
        self.skip_ws();
        let op = match self.bump() {
            Some(']') => {
                return Ok(AttrSel {
                    name,
                    op: AttrOp::Exists,
                    value: String::new(),
                });
            }
            Some('=') => AttrOp::Equals,
            Some(c @ ('^' | '$' | '*' | '~')) => {
                if self.bump() != Some('=') {
                    return Err(SelectorError::Unexpected {
                        found: c,
                        offset: self.pos.saturating_sub(1),
                    });
                }
                match c {
                    '^' => AttrOp::Prefix,
                    '$' => AttrOp::Suffix,
                    '*' => AttrOp::Contains,
                    _ => AttrOp::Word,
                }
            }
            Some(_) | None => return Err(SelectorError::Unterminated("attribute selector")),
        };
        self.skip_ws();
        let value = match self.peek() {
            Some(q @ ('"' | '\'')) => {
                self.bump();
                let mut value = String::new();
                loop {
                    match self.bump() {
                        Some('\\') => {
                            value.push(self.bump().ok_or(SelectorError::Unterminated("string"))?)
                        }
                        Some(c) if c == q => break,
                        Some(c) => value.push(c),
                        None => return Err(SelectorError::Unterminated("string")),
                    }
                }
                value
            }
            _ => self.ident()?,
        };
        self.skip_ws();
        if self.bump() != Some(']') {
            return Err(SelectorError::Unterminated("attribute selector"));
        }
        Ok(AttrSel { name, op, value })
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{DocumentSpec, el};

    fn doc() -> Document {
        DocumentSpec::new("https://example.test/")
            .root(
                el("html").child(
                    el("body").child(
                        el("form")
                            .attr("id", "login")
                            .child(el("input").attr("name", "email").attr("class", "field wide"))
                            .child(el("div").child(el("button").attr("id", "submit-8231").attr("type", "submit"))),
                    ),
                ),
            )
            .build()
    }

    fn first(doc: &Document, sel: &str) -> Option<String> {
        let selector = Selector::parse(sel).unwrap();
        doc.query_selector(&selector)
            .map(|k| doc.element(k).unwrap().tag.clone())
    }

    #[test]
    fn test_basic_matching() {
        let doc = doc();
        assert_eq!(first(&doc, "#login").as_deref(), Some("form"));
        assert_eq!(first(&doc, "input.field.wide").as_deref(), Some("input"));
        assert_eq!(first(&doc, "[name='email']").as_deref(), Some("input"));
        assert_eq!(first(&doc, "form > div > button").as_deref(), Some("button"));
        assert_eq!(first(&doc, "form button[type=submit]").as_deref(), Some("button"));
        assert_eq!(first(&doc, "form > button"), None);
        assert_eq!(first(&doc, "textarea, input").as_deref(), Some("input"));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Selector::parse("  "), Err(SelectorError::Empty));
        assert!(matches!(
            Selector::parse("a:hover"),
            Err(SelectorError::Unsupported(_))
        ));
        assert!(matches!(
            Selector::parse("li:nth-child(foo)"),
            Err(SelectorError::Unsupported(_))
        ));
        assert!(matches!(
            Selector::parse("a:not(.x)"),
            Err(SelectorError::Unsupported(_))
        ));
        assert!(matches!(Selector::parse("p::before"), Err(SelectorError::Unsupported(_))));
        assert!(Selector::parse("li:nth-child(2").is_err());
        assert!(Selector::parse("[name=").is_err());
        assert!(Selector::parse("div >").is_err());
    }

    fn list() -> Document {
        DocumentSpec::new("https://example.test/")
            .root(
                el("html").child(
                    el("body").child(
                        el("ul")
                            .child(el("li").attr("name", "a"))
                            .child(el("p").attr("name", "note"))
                            .child(el("li").attr("name", "b"))
                            .child(el("li").attr("name", "c"))
                            .child(el("li").attr("name", "d")),
                    ),
                ),
            )
            .build()
    }

    fn names(doc: &Document, sel: &str) -> Vec<String> {
        let selector = Selector::parse(sel).unwrap();
        doc.query_selector_all(&selector)
            .into_iter()
            .filter_map(|k| doc.element(k).unwrap().attr("name").map(str::to_string))
            .collect()
    }

    #[test]
    fn test_structural_pseudo_classes() {
        let doc = list();
        assert_eq!(names(&doc, "li:first-child"), ["a"]);
        assert_eq!(names(&doc, "ul > :nth-child(2)"), ["note"]);
        assert_eq!(names(&doc, "li:nth-of-type(2)"), ["b"]);
        assert_eq!(names(&doc, "li:nth-child(2)"), Vec::<String>::new());
        assert_eq!(names(&doc, "li:last-child"), ["d"]);
        assert_eq!(names(&doc, "ul li:last-of-type"), ["d"]);
        assert_eq!(names(&doc, "p:first-of-type:last-of-type"), ["note"]);
        assert_eq!(names(&doc, "li:nth-of-type(odd)"), ["a", "c"]);
        assert_eq!(names(&doc, "li:nth-of-type(2n)"), ["b", "d"]);
        assert_eq!(names(&doc, "li:nth-of-type(-n+2)"), ["a", "b"]);
        assert_eq!(names(&doc, "li:nth-last-of-type(1)"), ["d"]);
    }

    #[test]
    fn test_pseudo_classes_display_and_wildcard() {
        let selector = Selector::parse("#row-12 > TD:Nth-Of-Type( 2n+1 )").unwrap();
        assert_eq!(selector.to_string(), "#row-12 > td:nth-of-type(2n+1)");
        let generic = selector.wildcard_ids().unwrap();
        assert_eq!(generic.to_string(), "[id^=\"row-\"] > td:nth-of-type(2n+1)");
    }

    #[test]
    fn test_wildcard_ids() {
        let doc = doc();
        let exact = Selector::parse("#submit-1111").unwrap();
        assert!(exact.has_id_fragment());
        assert_eq!(doc.query_selector(&exact), None);

        let generic = exact.wildcard_ids().unwrap();
        assert_eq!(generic.to_string(), "[id^=\"submit-\"]");
        assert_eq!(
            doc.query_selector(&generic)
                .map(|k| doc.element(k).unwrap().tag.clone())
                .as_deref(),
            Some("button")
        );

        let stable = Selector::parse("#login input").unwrap();
        assert!(stable.wildcard_ids().is_none());
        assert!(!Selector::parse("input.field").unwrap().has_id_fragment());
    }

    #[test]
    fn test_wildcard_keeps_suffix() {
        let attrs = wildcard("row-17-title").unwrap();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].value, "row-");
        assert_eq!(attrs[1].value, "-title");
        assert_eq!(wildcard("1234").unwrap()[0].op, AttrOp::Exists);
        assert!(wildcard("login").is_none());
    }
}
