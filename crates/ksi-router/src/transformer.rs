//! Declarative transformers.
//!
//! A transformer is a YAML rule: on every event whose name matches
//! `source` and whose data/context satisfy `condition`, the router
//! synthesizes a new event named `target` with `mapping` rendered over
//! `{data, context}`. Rule sets validate at load and swap atomically, so
//! a bad reload never leaves routing half-configured.
//!
//! The condition language is deliberately small: dotted paths into `data`
//! and `context`, literals, comparisons, `&&`, `||`, `!` and parentheses.

use std::sync::{Arc, RwLock};

use globset::{Glob, GlobMatcher};
use ksi_core::{Event, EventName};
use serde::{Deserialize, Serialize};

use crate::error::{RouterError, RouterResult};

// ---------------------------------------------------------------------------
// Rule
// ---------------------------------------------------------------------------

/// One declarative routing rule as written in YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerRule {
    /// Glob over source event names.
    pub source: String,
    /// Name of the synthesized event.
    pub target: String,
    /// Boolean expression over `data` and `context`; absent = always.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// JSON template rendered over `{data, context}`.
    pub mapping: serde_json::Value,
    /// Whether the synthesized event's replies correlate back to the
    /// originating event as a `transformer:result`.
    #[serde(default, rename = "async")]
    pub is_async: bool,
}

struct CompiledRule {
    rule: TransformerRule,
    matcher: GlobMatcher,
    condition: Option<Expr>,
    target: EventName,
}

// ---------------------------------------------------------------------------
// TransformerSet
// ---------------------------------------------------------------------------

/// A validated, immutable set of rules.
#[derive(Default)]
pub struct TransformerSet {
    rules: Vec<CompiledRule>,
}

impl std::fmt::Debug for TransformerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerSet")
            .field("rules", &self.rules.len())
            .finish()
    }
}

/// One synthesized event.
#[derive(Debug, Clone)]
pub(crate) struct Synthesized {
    pub(crate) target: EventName,
    pub(crate) data: serde_json::Value,
    pub(crate) is_async: bool,
}

impl TransformerSet {
    /// Compile and validate a list of rules.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BadRule`] naming the first uncompilable
    /// rule (bad glob, bad target name, or unparseable condition).
    pub fn compile(rules: Vec<TransformerRule>) -> RouterResult<Self> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let matcher = Glob::new(&rule.source)
                .map_err(|e| RouterError::BadRule {
                    rule: rule.source.clone(),
                    message: format!("source: {e}"),
                })?
                .compile_matcher();
            let target = EventName::parse(&rule.target).map_err(|e| RouterError::BadRule {
                rule: rule.source.clone(),
                message: format!("target: {e}"),
            })?;
            let condition = rule
                .condition
                .as_deref()
                .map(|c| {
                    Expr::parse(c).map_err(|message| RouterError::BadRule {
                        rule: rule.source.clone(),
                        message,
                    })
                })
                .transpose()?;
            compiled.push(CompiledRule {
                rule,
                matcher,
                condition,
                target,
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Parse and compile a YAML document: either a bare rule list or a
    /// mapping with a `transformers` key.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::BadRule`] for YAML or compilation failures.
    pub fn from_yaml(yaml: &str) -> RouterResult<Self> {
        #[derive(Deserialize)]
        struct Wrapper {
            transformers: Vec<TransformerRule>,
        }
        let rules = serde_yaml::from_str::<Vec<TransformerRule>>(yaml)
            .or_else(|_| serde_yaml::from_str::<Wrapper>(yaml).map(|w| w.transformers))
            .map_err(|e| RouterError::BadRule {
                rule: "<document>".to_owned(),
                message: e.to_string(),
            })?;
        Self::compile(rules)
    }

    /// Number of compiled rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether the set holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Synthesize events for one dispatched event.
    pub(crate) fn apply(&self, event: &Event) -> Vec<Synthesized> {
        if self.rules.is_empty() {
            return Vec::new();
        }
        let scope = serde_json::json!({
            "data": event.data,
            "context": serde_json::to_value(&event.context).unwrap_or_default(),
        });
        let mut out = Vec::new();
        for rule in &self.rules {
            if !rule.matcher.is_match(event.name.as_str()) {
                continue;
            }
            if let Some(condition) = &rule.condition {
                if !truthy(&condition.eval(&scope)) {
                    continue;
                }
            }
            out.push(Synthesized {
                target: rule.target.clone(),
                data: render(&rule.rule.mapping, &scope),
                is_async: rule.rule.is_async,
            });
        }
        out
    }
}

/// Hot-swappable holder for the active rule set.
#[derive(Debug, Default)]
pub struct TransformerRegistry {
    current: RwLock<Arc<TransformerSet>>,
}

impl TransformerRegistry {
    /// Registry with no rules.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the active set.
    pub fn swap(&self, set: TransformerSet) {
        *self.current.write().expect("transformer lock poisoned") = Arc::new(set);
    }

    /// Snapshot the active set.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TransformerSet> {
        Arc::clone(&self.current.read().expect("transformer lock poisoned"))
    }
}

// ---------------------------------------------------------------------------
// Mapping templates
// ---------------------------------------------------------------------------

/// Render a mapping template: strings may interpolate `{{path}}`; a
/// string that is exactly one interpolation splices the typed value.
fn render(template: &serde_json::Value, scope: &serde_json::Value) -> serde_json::Value {
    match template {
        serde_json::Value::String(s) => render_string(s, scope),
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(|v| render(v, scope)).collect())
        },
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_string(s: &str, scope: &serde_json::Value) -> serde_json::Value {
    let trimmed = s.trim();
    if let Some(path) = trimmed
        .strip_prefix("{{")
        .and_then(|rest| rest.strip_suffix("}}"))
    {
        if !path.contains("{{") {
            return lookup(scope, path.trim()).cloned().unwrap_or(serde_json::Value::Null);
        }
    }
    let mut out = String::new();
    let mut rest = s;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let path = after[..end].trim();
        match lookup(scope, path) {
            Some(serde_json::Value::String(v)) => out.push_str(v),
            Some(other) => out.push_str(&other.to_string()),
            None => {},
        }
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    serde_json::Value::String(out)
}

/// Resolve a dotted path within a JSON value.
fn lookup<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = root;
    for part in path.split('.') {
        current = current.get(part)?;
    }
    Some(current)
}

fn truthy(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        serde_json::Value::String(s) => !s.is_empty(),
        serde_json::Value::Array(_) | serde_json::Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Condition expressions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Literal(serde_json::Value),
    Path(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Expr {
    fn parse(input: &str) -> Result<Self, String> {
        let mut parser = Parser {
            tokens: tokenize(input)?,
            pos: 0,
        };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(format!("trailing input at token {}", parser.pos));
        }
        Ok(expr)
    }

    fn eval(&self, scope: &serde_json::Value) -> serde_json::Value {
        match self {
            Self::Literal(v) => v.clone(),
            Self::Path(p) => lookup(scope, p).cloned().unwrap_or(serde_json::Value::Null),
            Self::Not(inner) => serde_json::Value::Bool(!truthy(&inner.eval(scope))),
            Self::And(a, b) => {
                serde_json::Value::Bool(truthy(&a.eval(scope)) && truthy(&b.eval(scope)))
            },
            Self::Or(a, b) => {
                serde_json::Value::Bool(truthy(&a.eval(scope)) || truthy(&b.eval(scope)))
            },
            Self::Cmp(op, a, b) => serde_json::Value::Bool(compare(*op, &a.eval(scope), &b.eval(scope))),
        }
    }
}

fn compare(op: CmpOp, a: &serde_json::Value, b: &serde_json::Value) -> bool {
    match op {
        CmpOp::Eq => a == b,
        CmpOp::Ne => a != b,
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = match (a, b) {
                (serde_json::Value::Number(x), serde_json::Value::Number(y)) => {
                    x.as_f64().partial_cmp(&y.as_f64())
                },
                (serde_json::Value::String(x), serde_json::Value::String(y)) => Some(x.cmp(y)),
                _ => None,
            };
            match ordering {
                Some(ordering) => match op {
                    CmpOp::Lt => ordering.is_lt(),
                    CmpOp::Le => ordering.is_le(),
                    CmpOp::Gt => ordering.is_gt(),
                    CmpOp::Ge => ordering.is_ge(),
                    CmpOp::Eq | CmpOp::Ne => false,
                },
                None => false,
            }
        },
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Literal(serde_json::Value),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            },
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            },
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            },
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            },
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Eq));
                i += 2;
            },
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ne));
                i += 2;
            },
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            },
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Le));
                i += 2;
            },
            '<' => {
                tokens.push(Token::Op(CmpOp::Lt));
                i += 1;
            },
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Op(CmpOp::Ge));
                i += 2;
            },
            '>' => {
                tokens.push(Token::Op(CmpOp::Gt));
                i += 1;
            },
            '\'' | '"' => {
                let quote = c;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("unterminated string literal".to_owned()),
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        },
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        },
                    }
                }
                tokens.push(Token::Literal(serde_json::Value::String(value)));
            },
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_ascii_digit() || *ch == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number: serde_json::Number = text
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64)
                    .ok_or_else(|| format!("bad number literal {text:?}"))?;
                tokens.push(Token::Literal(serde_json::Value::Number(number)));
            },
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_ascii_alphanumeric() || *ch == '_' || *ch == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(serde_json::Value::Bool(true)),
                    "false" => Token::Literal(serde_json::Value::Bool(false)),
                    "null" => Token::Literal(serde_json::Value::Null),
                    _ => Token::Path(word),
                });
            },
            other => return Err(format!("unexpected character {other:?}")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn or_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let left = self.term()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.term()?;
            return Ok(Expr::Cmp(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<Expr, String> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.or_expr()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err("expected )".to_owned());
                }
                self.pos += 1;
                Ok(inner)
            },
            Some(Token::Literal(v)) => {
                self.pos += 1;
                Ok(Expr::Literal(v))
            },
            Some(Token::Path(p)) => {
                self.pos += 1;
                Ok(Expr::Path(p))
            },
            other => Err(format!("unexpected token {other:?}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ksi_core::EventContext;
    use serde_json::json;

    fn event(name: &str, data: serde_json::Value) -> Event {
        Event::new(EventName::parse(name).unwrap(), data, EventContext::root())
    }

    fn set(yaml: &str) -> TransformerSet {
        TransformerSet::from_yaml(yaml).unwrap()
    }

    #[test]
    fn test_basic_synthesis_with_mapping() {
        let set = set(
            r#"
- source: "agent:status"
  target: "monitor:agent_status"
  mapping:
    agent: "{{data.agent_id}}"
    message: "agent {{data.agent_id}} is {{data.state}}"
"#,
        );
        let out = set.apply(&event("agent:status", json!({"agent_id": "a1", "state": "ready"})));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target.as_str(), "monitor:agent_status");
        assert_eq!(out[0].data["agent"], "a1");
        assert_eq!(out[0].data["message"], "agent a1 is ready");
    }

    #[test]
    fn test_condition_gates_synthesis() {
        let set = set(
            r#"
- source: "completion:*"
  target: "alerts:slow_completion"
  condition: "data.duration_ms > 1000 && data.status == 'completed'"
  mapping:
    request: "{{data.request_id}}"
"#,
        );
        let slow = event(
            "completion:result",
            json!({"request_id": "r1", "duration_ms": 2000, "status": "completed"}),
        );
        let fast = event(
            "completion:result",
            json!({"request_id": "r2", "duration_ms": 10, "status": "completed"}),
        );
        assert_eq!(set.apply(&slow).len(), 1);
        assert!(set.apply(&fast).is_empty());
    }

    #[test]
    fn test_whole_string_interpolation_splices_typed_value() {
        let set = set(
            r#"
- source: "a:b"
  target: "c:d"
  mapping:
    payload: "{{data}}"
    depth: "{{context.depth}}"
"#,
        );
        let out = set.apply(&event("a:b", json!({"x": 1})));
        assert_eq!(out[0].data["payload"], json!({"x": 1}));
        assert_eq!(out[0].data["depth"], json!(0));
    }

    #[test]
    fn test_bad_rules_rejected() {
        assert!(TransformerSet::from_yaml("- source: \"a:b\"\n  target: \"NOT VALID\"\n  mapping: {}\n").is_err());
        assert!(
            TransformerSet::from_yaml(
                "- source: \"a:b\"\n  target: \"c:d\"\n  condition: \"data.x ===\"\n  mapping: {}\n"
            )
            .is_err()
        );
    }

    #[test]
    fn test_registry_swaps_atomically() {
        let registry = TransformerRegistry::new();
        assert!(registry.snapshot().is_empty());
        registry.swap(set(
            "- source: \"a:*\"\n  target: \"b:c\"\n  mapping: {}\n",
        ));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_expression_operators() {
        let scope = json!({"data": {"n": 5, "s": "hi", "flag": true}, "context": {"depth": 2}});
        for (expr, expected) in [
            ("data.n >= 5", true),
            ("data.n < 5", false),
            ("data.s != 'bye'", true),
            ("!data.flag", false),
            ("data.flag && context.depth == 2", true),
            ("data.missing == null", true),
            ("(data.n > 10) || data.flag", true),
        ] {
            let parsed = Expr::parse(expr).unwrap();
            assert_eq!(truthy(&parsed.eval(&scope)), expected, "{expr}");
        }
    }
}
