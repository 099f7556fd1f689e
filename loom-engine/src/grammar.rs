//! Grammar-constrained generation for structured output.
//!
//! A [`Grammar`] is a set of named rules over character terminals and rule
//! references, compiled from a JSON schema.  During generation a
//! [`GrammarMachine`] tracks every viable parse simultaneously (NFA
//! style), so the sampler can ask whether a candidate piece keeps the
//! output inside the language and whether the output so far is a complete
//! sentence.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::Value;

use crate::error::EngineError;

/// Upper bound on simultaneously tracked parse states.  JSON grammars
/// produced by the schema compiler stay far below this; hitting the limit
/// turns the affected continuation into a rejection.
const STATE_LIMIT: usize = 4096;

// ── Grammar definition ────────────────────────────────────────────────────────

/// One element in a production.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Term {
    /// A literal character.
    Char(char),
    /// An inclusive character range.
    CharRange(char, char),
    /// Any character except the listed ones.
    CharNot(Vec<char>),
    /// A reference to another rule.
    Rule(String),
}

/// One alternative production of a rule.  An empty alternative is an
/// epsilon production.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Alt {
    pub terms: Vec<Term>,
}

impl Alt {
    pub fn new(terms: Vec<Term>) -> Self {
        Self { terms }
    }

    /// Alternative matching `text` literally, character by character.
    pub fn literal(text: &str) -> Self {
        Self {
            terms: text.chars().map(Term::Char).collect(),
        }
    }
}

/// A named rule with one or more alternatives.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub alts: Vec<Alt>,
}

/// A complete grammar with a designated root rule.
#[derive(Debug, Clone, Default)]
pub struct Grammar {
    rules: HashMap<String, Rule>,
    root: String,
}

impl Grammar {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            rules: HashMap::new(),
            root: root.into(),
        }
    }

    pub fn add_rule(&mut self, name: impl Into<String>, alts: Vec<Alt>) {
        let name = name.into();
        self.rules.insert(name.clone(), Rule { name, alts });
    }

    pub fn rule(&self, name: &str) -> Option<&Rule> {
        self.rules.get(name)
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn has_rule(&self, name: &str) -> bool {
        self.rules.contains_key(name)
    }

    /// Check that the root exists and every rule reference resolves.
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.rules.contains_key(&self.root) {
            return Err(EngineError::Grammar(format!(
                "root rule `{}` is not defined",
                self.root
            )));
        }
        for rule in self.rules.values() {
            for alt in &rule.alts {
                for term in &alt.terms {
                    if let Term::Rule(name) = term {
                        if !self.rules.contains_key(name) {
                            return Err(EngineError::Grammar(format!(
                                "rule `{}` references undefined rule `{name}`",
                                rule.name
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Compile a JSON schema (serialized form) into a grammar.
    pub fn from_json_schema(text: &str) -> Result<Self, EngineError> {
        let schema: Value =
            serde_json::from_str(text).map_err(|e| EngineError::JsonSchema(e.to_string()))?;
        let mut grammar = Grammar::new("root");
        grammar.add_rule(
            "ws",
            vec![
                Alt::default(),
                Alt::new(vec![Term::Char(' '), Term::Rule("ws".into())]),
                Alt::new(vec![Term::Char('\n'), Term::Rule("ws".into())]),
                Alt::new(vec![Term::Char('\t'), Term::Rule("ws".into())]),
            ],
        );
        compile_schema(&mut grammar, "root", &schema)?;
        grammar.validate()?;
        Ok(grammar)
    }
}

// ── JSON schema compiler ──────────────────────────────────────────────────────

fn compile_schema(grammar: &mut Grammar, name: &str, schema: &Value) -> Result<(), EngineError> {
    match schema {
        // Boolean schemas: `true` accepts anything, `false` nothing useful.
        Value::Bool(true) => {
            ensure_json_value(grammar);
            grammar.add_rule(name, vec![Alt::new(vec![Term::Rule("value".into())])]);
            return Ok(());
        }
        Value::Object(_) => {}
        _ => {
            return Err(EngineError::JsonSchema(
                "schema must be an object".to_string(),
            ))
        }
    }

    if let Some(values) = schema.get("enum") {
        let values = values
            .as_array()
            .ok_or_else(|| EngineError::JsonSchema("enum must be an array".to_string()))?;
        let mut alts = Vec::with_capacity(values.len());
        for value in values {
            let s = value.as_str().ok_or_else(|| {
                EngineError::JsonSchema("enum values must be strings".to_string())
            })?;
            alts.push(Alt::literal(&format!("\"{s}\"")));
        }
        if alts.is_empty() {
            return Err(EngineError::JsonSchema("enum must not be empty".to_string()));
        }
        grammar.add_rule(name, alts);
        return Ok(());
    }

    let ty = match schema.get("type") {
        None => {
            // Schemaless (`{}`): any JSON value.
            ensure_json_value(grammar);
            grammar.add_rule(name, vec![Alt::new(vec![Term::Rule("value".into())])]);
            return Ok(());
        }
        Some(Value::String(ty)) => ty.as_str(),
        Some(_) => {
            return Err(EngineError::JsonSchema(
                "schema `type` must be a string".to_string(),
            ))
        }
    };

    match ty {
        "object" => compile_object(grammar, name, schema),
        "array" => compile_array(grammar, name, schema),
        "string" => {
            ensure_string_content(grammar);
            grammar.add_rule(
                name,
                vec![Alt::new(vec![
                    Term::Char('"'),
                    Term::Rule("string_content".into()),
                    Term::Char('"'),
                ])],
            );
            Ok(())
        }
        "integer" => {
            ensure_digits(grammar);
            grammar.add_rule(
                name,
                vec![
                    Alt::new(vec![Term::Rule("digits".into())]),
                    Alt::new(vec![Term::Char('-'), Term::Rule("digits".into())]),
                ],
            );
            Ok(())
        }
        "number" => {
            ensure_digits(grammar);
            grammar.add_rule(name, number_alts());
            Ok(())
        }
        "boolean" => {
            grammar.add_rule(name, vec![Alt::literal("true"), Alt::literal("false")]);
            Ok(())
        }
        "null" => {
            grammar.add_rule(name, vec![Alt::literal("null")]);
            Ok(())
        }
        other => Err(EngineError::JsonSchema(format!(
            "unsupported schema type `{other}`"
        ))),
    }
}

fn compile_object(grammar: &mut Grammar, name: &str, schema: &Value) -> Result<(), EngineError> {
    let properties = match schema.get("properties") {
        None => {
            // No property list: any JSON object.
            ensure_json_value(grammar);
            grammar.add_rule(name, vec![Alt::new(vec![Term::Rule("object".into())])]);
            return Ok(());
        }
        Some(Value::Object(props)) => props,
        Some(_) => {
            return Err(EngineError::JsonSchema(
                "`properties` must be an object".to_string(),
            ))
        }
    };

    if properties.is_empty() {
        grammar.add_rule(
            name,
            vec![Alt::new(vec![
                Term::Char('{'),
                Term::Rule("ws".into()),
                Term::Char('}'),
            ])],
        );
        return Ok(());
    }

    let mut terms = vec![Term::Char('{'), Term::Rule("ws".into())];
    for (i, (prop, prop_schema)) in properties.iter().enumerate() {
        if i > 0 {
            terms.push(Term::Char(','));
            terms.push(Term::Rule("ws".into()));
        }
        for c in format!("\"{prop}\"").chars() {
            terms.push(Term::Char(c));
        }
        terms.push(Term::Rule("ws".into()));
        terms.push(Term::Char(':'));
        terms.push(Term::Rule("ws".into()));

        let prop_rule = format!("{name}_{prop}");
        compile_schema(grammar, &prop_rule, prop_schema)?;
        terms.push(Term::Rule(prop_rule));
    }
    terms.push(Term::Rule("ws".into()));
    terms.push(Term::Char('}'));

    grammar.add_rule(name, vec![Alt::new(terms)]);
    Ok(())
}

fn compile_array(grammar: &mut Grammar, name: &str, schema: &Value) -> Result<(), EngineError> {
    let item_rule = format!("{name}_item");
    match schema.get("items") {
        None => {
            ensure_json_value(grammar);
            grammar.add_rule(&item_rule, vec![Alt::new(vec![Term::Rule("value".into())])]);
        }
        Some(items) => compile_schema(grammar, &item_rule, items)?,
    }

    let more_rule = format!("{name}_more");
    grammar.add_rule(
        &more_rule,
        vec![
            Alt::default(),
            Alt::new(vec![
                Term::Char(','),
                Term::Rule("ws".into()),
                Term::Rule(item_rule.clone()),
                Term::Rule(more_rule.clone()),
            ]),
        ],
    );
    grammar.add_rule(
        name,
        vec![
            Alt::new(vec![
                Term::Char('['),
                Term::Rule("ws".into()),
                Term::Char(']'),
            ]),
            Alt::new(vec![
                Term::Char('['),
                Term::Rule("ws".into()),
                Term::Rule(item_rule),
                Term::Rule(more_rule),
                Term::Rule("ws".into()),
                Term::Char(']'),
            ]),
        ],
    );
    Ok(())
}

fn number_alts() -> Vec<Alt> {
    vec![
        Alt::new(vec![Term::Rule("digits".into())]),
        Alt::new(vec![Term::Char('-'), Term::Rule("digits".into())]),
        Alt::new(vec![
            Term::Rule("digits".into()),
            Term::Char('.'),
            Term::Rule("digits".into()),
        ]),
        Alt::new(vec![
            Term::Char('-'),
            Term::Rule("digits".into()),
            Term::Char('.'),
            Term::Rule("digits".into()),
        ]),
    ]
}

fn ensure_digits(grammar: &mut Grammar) {
    if grammar.has_rule("digits") {
        return;
    }
    grammar.add_rule(
        "digit",
        vec![Alt::new(vec![Term::CharRange('0', '9')])],
    );
    grammar.add_rule(
        "digits",
        vec![
            Alt::new(vec![Term::Rule("digit".into())]),
            Alt::new(vec![Term::Rule("digit".into()), Term::Rule("digits".into())]),
        ],
    );
}

fn ensure_string_content(grammar: &mut Grammar) {
    if grammar.has_rule("string_content") {
        return;
    }
    grammar.add_rule(
        "string_char",
        vec![
            Alt::new(vec![Term::CharNot(vec!['"', '\\', '\n'])]),
            Alt::new(vec![Term::Char('\\'), Term::Char('"')]),
            Alt::new(vec![Term::Char('\\'), Term::Char('\\')]),
            Alt::new(vec![Term::Char('\\'), Term::Char('n')]),
        ],
    );
    grammar.add_rule(
        "string_content",
        vec![
            Alt::default(),
            Alt::new(vec![
                Term::Rule("string_char".into()),
                Term::Rule("string_content".into()),
            ]),
        ],
    );
}

/// Add the mutually recursive rules for an arbitrary JSON value.
fn ensure_json_value(grammar: &mut Grammar) {
    if grammar.has_rule("value") {
        return;
    }
    ensure_digits(grammar);
    ensure_string_content(grammar);
    grammar.add_rule(
        "string",
        vec![Alt::new(vec![
            Term::Char('"'),
            Term::Rule("string_content".into()),
            Term::Char('"'),
        ])],
    );
    grammar.add_rule("number", number_alts());
    grammar.add_rule(
        "value",
        vec![
            Alt::new(vec![Term::Rule("string".into())]),
            Alt::new(vec![Term::Rule("number".into())]),
            Alt::new(vec![Term::Rule("object".into())]),
            Alt::new(vec![Term::Rule("array".into())]),
            Alt::literal("true"),
            Alt::literal("false"),
            Alt::literal("null"),
        ],
    );
    grammar.add_rule(
        "member",
        vec![Alt::new(vec![
            Term::Char('"'),
            Term::Rule("string_content".into()),
            Term::Char('"'),
            Term::Rule("ws".into()),
            Term::Char(':'),
            Term::Rule("ws".into()),
            Term::Rule("value".into()),
        ])],
    );
    grammar.add_rule(
        "members",
        vec![
            Alt::default(),
            Alt::new(vec![
                Term::Char(','),
                Term::Rule("ws".into()),
                Term::Rule("member".into()),
                Term::Rule("members".into()),
            ]),
        ],
    );
    grammar.add_rule(
        "object",
        vec![
            Alt::new(vec![
                Term::Char('{'),
                Term::Rule("ws".into()),
                Term::Char('}'),
            ]),
            Alt::new(vec![
                Term::Char('{'),
                Term::Rule("ws".into()),
                Term::Rule("member".into()),
                Term::Rule("members".into()),
                Term::Rule("ws".into()),
                Term::Char('}'),
            ]),
        ],
    );
    grammar.add_rule(
        "elements",
        vec![
            Alt::default(),
            Alt::new(vec![
                Term::Char(','),
                Term::Rule("ws".into()),
                Term::Rule("value".into()),
                Term::Rule("elements".into()),
            ]),
        ],
    );
    grammar.add_rule(
        "array",
        vec![
            Alt::new(vec![
                Term::Char('['),
                Term::Rule("ws".into()),
                Term::Char(']'),
            ]),
            Alt::new(vec![
                Term::Char('['),
                Term::Rule("ws".into()),
                Term::Rule("value".into()),
                Term::Rule("elements".into()),
                Term::Rule("ws".into()),
                Term::Char(']'),
            ]),
        ],
    );
}

// ── State machine ─────────────────────────────────────────────────────────────

/// One parse position: a rule, an alternative, an element index, and the
/// return stack of rule references entered to get here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ParseState {
    rule: String,
    alt: usize,
    idx: usize,
    stack: Vec<(String, usize, usize)>,
}

/// Tracks every viable parse of the generated text so far.
#[derive(Debug, Clone)]
pub struct GrammarMachine {
    grammar: Arc<Grammar>,
    /// States positioned on a character terminal (epsilon-closed).
    states: Vec<ParseState>,
    /// Whether some parse has consumed a complete sentence.
    complete: bool,
}

impl GrammarMachine {
    pub fn new(grammar: Grammar) -> Result<Self, EngineError> {
        grammar.validate()?;
        let grammar = Arc::new(grammar);
        let initial: Vec<ParseState> = alt_states(&grammar, grammar.root(), Vec::new());
        let (states, complete) = closure(&grammar, initial);
        Ok(Self {
            grammar,
            states,
            complete,
        })
    }

    /// Consume one character.  Returns `false` (leaving the machine
    /// unchanged) if no viable parse accepts it.
    pub fn advance(&mut self, c: char) -> bool {
        let mut next = Vec::new();
        for state in &self.states {
            if let Some(term) = current_term(&self.grammar, state) {
                if term_accepts(term, c) {
                    let mut advanced = state.clone();
                    advanced.idx += 1;
                    next.push(advanced);
                }
            }
        }
        if next.is_empty() {
            return false;
        }
        let (states, complete) = closure(&self.grammar, next);
        self.states = states;
        self.complete = complete;
        true
    }

    /// Whether emitting `piece` keeps the output inside the language.
    /// Empty pieces are rejected so special tokens cannot slip through.
    pub fn allows_piece(&self, piece: &str) -> bool {
        if piece.is_empty() {
            return false;
        }
        let mut probe = self.clone();
        piece.chars().all(|c| probe.advance(c))
    }

    /// Record an emitted piece.
    pub fn accept_piece(&mut self, piece: &str) {
        for c in piece.chars() {
            if !self.advance(c) {
                tracing::debug!(piece = %piece, "piece left the grammar; constraint disengaged");
                break;
            }
        }
    }

    /// Whether the output so far is a complete sentence of the grammar.
    pub fn is_complete(&self) -> bool {
        self.complete
    }
}

/// States for every alternative of `rule` at element 0.
fn alt_states(grammar: &Grammar, rule: &str, stack: Vec<(String, usize, usize)>) -> Vec<ParseState> {
    grammar.rule(rule).map_or_else(Vec::new, |r| {
        (0..r.alts.len())
            .map(|alt| ParseState {
                rule: rule.to_string(),
                alt,
                idx: 0,
                stack: stack.clone(),
            })
            .collect()
    })
}

fn current_term<'g>(grammar: &'g Grammar, state: &ParseState) -> Option<&'g Term> {
    grammar
        .rule(&state.rule)
        .and_then(|r| r.alts.get(state.alt))
        .and_then(|a| a.terms.get(state.idx))
}

fn term_accepts(term: &Term, c: char) -> bool {
    match term {
        Term::Char(expected) => c == *expected,
        Term::CharRange(lo, hi) => c >= *lo && c <= *hi,
        Term::CharNot(excluded) => !excluded.contains(&c),
        Term::Rule(_) => false,
    }
}

/// Epsilon closure: expand rule references and pop finished alternatives
/// until every surviving state sits on a character terminal.  Also reports
/// whether some path ran off the end of the root rule (a complete parse).
fn closure(
    grammar: &Grammar,
    seed: Vec<ParseState>,
) -> (Vec<ParseState>, bool) {
    let mut work = seed;
    let mut seen: HashSet<ParseState> = HashSet::new();
    let mut terminal = Vec::new();
    let mut complete = false;

    while let Some(state) = work.pop() {
        if seen.len() >= STATE_LIMIT {
            break;
        }
        if !seen.insert(state.clone()) {
            continue;
        }
        match current_term(grammar, &state) {
            None => {
                // End of the current alternative: return to the caller,
                // or mark a complete parse at the bottom of the stack.
                let mut stack = state.stack;
                if let Some((rule, alt, idx)) = stack.pop() {
                    work.push(ParseState {
                        rule,
                        alt,
                        idx,
                        stack,
                    });
                } else {
                    complete = true;
                }
            }
            Some(Term::Rule(name)) => {
                let mut stack = state.stack.clone();
                stack.push((state.rule.clone(), state.alt, state.idx + 1));
                work.extend(alt_states(grammar, name, stack));
            }
            Some(_) => terminal.push(state),
        }
    }
    (terminal, complete)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
