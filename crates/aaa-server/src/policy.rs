//! Compiled policy graph
//!
//! The section compiler turns a configuration section into a [`PolicyGraph`]:
//! an arena of nodes addressed by [`NodeId`]. Group nodes hold ordered
//! children, `if` nodes hold condition/branch pairs, and leaves produce a
//! result code when executed.

use crate::module::{MethodCall, ModuleInstance};
use crate::request::Request;
use aaa_proto::{AssignOp, ListRef, Location, RCode};
use regex::{Regex, RegexBuilder};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("Invalid attribute reference '{0}'")]
    InvalidAttrRef(String),
    #[error("Invalid condition '{condition}': {reason}")]
    InvalidCondition { condition: String, reason: String },
}

/// Handle to a node inside one graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

/// `&list.Attribute`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttrRef {
    pub list: ListRef,
    pub name: String,
}

impl AttrRef {
    /// Parse `&Attr`, `&control.Attr` or the same without the leading `&`
    pub fn parse(text: &str) -> Result<AttrRef, PolicyError> {
        let trimmed = text.trim();
        let body = trimmed.strip_prefix('&').unwrap_or(trimmed);
        let (list, name) = match body.split_once('.') {
            Some((prefix, rest)) => match prefix.parse::<ListRef>() {
                Ok(list) => (list, rest),
                Err(_) => return Err(PolicyError::InvalidAttrRef(text.to_string())),
            },
            None => (ListRef::Request, body),
        };

        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(PolicyError::InvalidAttrRef(text.to_string()));
        }

        Ok(AttrRef {
            list,
            name: name.to_string(),
        })
    }

    fn values<'a>(&'a self, request: &'a Request) -> impl Iterator<Item = &'a str> + 'a {
        request.list(self.list).get_all(&self.name)
    }
}

impl fmt::Display for AttrRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "&{}.{}", self.list, self.name)
    }
}

/// Test evaluated by an `if` / `elsif` branch
#[derive(Debug, Clone)]
pub enum Condition {
    Exists(AttrRef),
    NotExists(AttrRef),
    Equals(AttrRef, String),
    NotEquals(AttrRef, String),
    Matches(AttrRef, Regex),
    NotMatches(AttrRef, Regex),
}

const OPERATORS: [&str; 4] = ["==", "!=", "=~", "!~"];

impl Condition {
    /// Parse condition text such as `&User-Name == "bob"` or `&Identity =~ /^0/i`
    pub fn parse(text: &str) -> Result<Condition, PolicyError> {
        let text = text.trim();
        let invalid = |reason: &str| PolicyError::InvalidCondition {
            condition: text.to_string(),
            reason: reason.to_string(),
        };

        let operator = OPERATORS
            .iter()
            .filter_map(|op| text.find(op).map(|pos| (pos, *op)))
            .min_by_key(|(pos, _)| *pos);

        let Some((pos, op)) = operator else {
            if let Some(rest) = text.strip_prefix('!') {
                return Ok(Condition::NotExists(AttrRef::parse(rest)?));
            }
            if text.starts_with('&') {
                return Ok(Condition::Exists(AttrRef::parse(text)?));
            }
            return Err(invalid("expected an attribute reference"));
        };

        let lhs = text[..pos].trim();
        let rhs = text[pos + op.len()..].trim();
        if !lhs.starts_with('&') {
            return Err(invalid("left side must be an attribute reference"));
        }
        let attr = AttrRef::parse(lhs)?;

        match op {
            "==" => Ok(Condition::Equals(attr, unquote(rhs).to_string())),
            "!=" => Ok(Condition::NotEquals(attr, unquote(rhs).to_string())),
            _ => {
                let regex = parse_regex(rhs).map_err(|reason| invalid(&reason))?;
                if op == "=~" {
                    Ok(Condition::Matches(attr, regex))
                } else {
                    Ok(Condition::NotMatches(attr, regex))
                }
            }
        }
    }

    /// Attribute the condition reads
    pub fn attr(&self) -> &AttrRef {
        match self {
            Condition::Exists(attr)
            | Condition::NotExists(attr)
            | Condition::Equals(attr, _)
            | Condition::NotEquals(attr, _)
            | Condition::Matches(attr, _)
            | Condition::NotMatches(attr, _) => attr,
        }
    }

    /// Evaluate against a request
    ///
    /// Comparisons against an absent attribute are false, negated or not.
    pub fn eval(&self, request: &Request) -> bool {
        match self {
            Condition::Exists(attr) => request.list(attr.list).contains(&attr.name),
            Condition::NotExists(attr) => !request.list(attr.list).contains(&attr.name),
            Condition::Equals(attr, value) => attr.values(request).any(|v| v == value),
            Condition::NotEquals(attr, value) => {
                let mut values = attr.values(request).peekable();
                values.peek().is_some() && values.all(|v| v != value)
            }
            Condition::Matches(attr, regex) => attr.values(request).any(|v| regex.is_match(v)),
            Condition::NotMatches(attr, regex) => {
                let mut values = attr.values(request).peekable();
                values.peek().is_some() && values.all(|v| !regex.is_match(v))
            }
        }
    }
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn parse_regex(text: &str) -> Result<Regex, String> {
    let body = text
        .strip_prefix('/')
        .ok_or_else(|| "regular expression must be written /.../".to_string())?;
    let end = body
        .rfind('/')
        .ok_or_else(|| "unterminated regular expression".to_string())?;
    let (pattern, flags) = (&body[..end], &body[end + 1..]);

    let mut builder = RegexBuilder::new(pattern);
    for flag in flags.chars() {
        match flag {
            'i' => {
                builder.case_insensitive(true);
            }
            other => return Err(format!("unknown regex flag '{}'", other)),
        }
    }
    builder.build().map_err(|e| e.to_string())
}

/// Right-hand side of an assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignValue {
    Literal(String),
    Attr(AttrRef),
}

/// `&list.Attr op value`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub target: AttrRef,
    pub op: AssignOp,
    pub value: AssignValue,
}

impl Assignment {
    /// Apply to a request
    ///
    /// Returns `updated` when the list changed and `noop` otherwise.
    pub fn apply(&self, request: &mut Request) -> RCode {
        let value = match &self.value {
            AssignValue::Literal(value) => value.clone(),
            AssignValue::Attr(source) => match request.list(source.list).get(&source.name) {
                Some(value) => value.to_string(),
                None => return RCode::Noop,
            },
        };

        let list = request.list_mut(self.target.list);
        match self.op {
            AssignOp::Set => list.set(&self.target.name, value),
            AssignOp::Add => list.add(self.target.name.clone(), value),
            AssignOp::Default => {
                if list.contains(&self.target.name) {
                    return RCode::Noop;
                }
                list.add(self.target.name.clone(), value);
            }
        }
        RCode::Updated
    }
}

/// Call into a policy module instance
#[derive(Clone)]
pub struct ModuleCall {
    pub instance: Arc<ModuleInstance>,
    pub method: MethodCall,
    pub location: Location,
}

impl fmt::Debug for ModuleCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCall")
            .field("instance", &self.instance.name())
            .field("method", &self.method)
            .field("location", &self.location.path())
            .finish()
    }
}

/// One executable node
#[derive(Debug, Clone)]
pub enum Node {
    Group { children: Vec<NodeId> },
    If {
        branches: Vec<(Condition, NodeId)>,
        otherwise: Option<NodeId>,
    },
    Literal(RCode),
    Module(ModuleCall),
    Assign(Assignment),
    /// Run a sub-request through another virtual server
    Call { server: String, location: Location },
}

/// Arena of nodes rooted at a group
#[derive(Debug, Clone)]
pub struct PolicyGraph {
    nodes: Vec<Node>,
    root: NodeId,
}

impl Default for PolicyGraph {
    fn default() -> Self {
        PolicyGraph {
            nodes: vec![Node::Group {
                children: Vec::new(),
            }],
            root: NodeId(0),
        }
    }
}

impl PolicyGraph {
    /// Graph holding only an empty root group
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        NodeId(self.nodes.len() - 1)
    }

    pub fn set_root(&mut self, root: NodeId) {
        self.root = root;
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Indented outline of the graph for debug output
    pub fn outline(&self) -> Vec<String> {
        let mut lines = Vec::new();
        self.outline_node(self.root, 0, &mut lines);
        lines
    }

    fn outline_node(&self, id: NodeId, depth: usize, lines: &mut Vec<String>) {
        let pad = "  ".repeat(depth);
        match self.node(id) {
            Node::Group { children } => {
                for child in children {
                    self.outline_node(*child, depth, lines);
                }
            }
            Node::If {
                branches,
                otherwise,
            } => {
                for (i, (condition, branch)) in branches.iter().enumerate() {
                    let keyword = if i == 0 { "if" } else { "elsif" };
                    lines.push(format!("{}{} {} {{", pad, keyword, condition.attr()));
                    self.outline_node(*branch, depth + 1, lines);
                    lines.push(format!("{}}}", pad));
                }
                if let Some(branch) = otherwise {
                    lines.push(format!("{}else {{", pad));
                    self.outline_node(*branch, depth + 1, lines);
                    lines.push(format!("{}}}", pad));
                }
            }
            Node::Literal(rcode) => lines.push(format!("{}{}", pad, rcode)),
            Node::Module(call) => {
                lines.push(format!("{}{}.{}", pad, call.instance.name(), call.method))
            }
            Node::Assign(assign) => lines.push(format!(
                "{}{} {} ...",
                pad,
                assign.target,
                assign.op.as_str()
            )),
            Node::Call { server, .. } => lines.push(format!("{}call {}", pad, server)),
        }
    }
}
