//! Declarative sub-graph patterns.
//!
//! A [`Pattern`] names operand roles ([`OpDesc`]), the fusion categories each
//! role accepts, how many graph nodes each role may bind, and the producer →
//! consumer edges between roles. Patterns are built once through
//! [`PatternBuilder`] and are immutable afterwards.

use std::collections::BTreeSet;
use std::fmt;

use bufuse_graph::OpKind;

/// Errors detected while building a pattern.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatternError {
    #[error("pattern '{pattern}': operand '{op}' declared twice")]
    DuplicateOp { pattern: String, op: String },

    #[error("pattern '{pattern}': unknown operand '{op}'")]
    UnknownOp { pattern: String, op: String },

    #[error("pattern '{pattern}': operand '{op}' has invalid repeat range [{min}, {max}]")]
    InvalidRange {
        pattern: String,
        op: String,
        min: usize,
        max: usize,
    },

    #[error("pattern '{pattern}': outputs of '{op}' set twice")]
    DuplicateOutputs { pattern: String, op: String },

    #[error("pattern '{pattern}': no head operand declared")]
    NoHead { pattern: String },

    #[error("pattern '{pattern}': no head accepts a concrete operator kind")]
    NoTypedHead { pattern: String },

    #[error("pattern '{pattern}': head '{op}' has an incoming edge")]
    HeadHasInputs { pattern: String, op: String },
}

/// Which graph nodes an operand role accepts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TypeFilter {
    /// Nodes whose [`OpKind`] is in the set.
    Kinds(Vec<OpKind>),
    /// Any producer feeding the pattern from outside; never part of the fused
    /// kernel itself.
    AnyInput,
}

impl TypeFilter {
    pub fn kinds(kinds: &[OpKind]) -> Self {
        Self::Kinds(kinds.to_vec())
    }

    pub fn accepts(&self, kind: OpKind) -> bool {
        match self {
            Self::Kinds(kinds) => kinds.contains(&kind),
            Self::AnyInput => true,
        }
    }

    pub fn is_any_input(&self) -> bool {
        matches!(self, Self::AnyInput)
    }
}

impl fmt::Display for TypeFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kinds(kinds) => {
                let names: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
                write!(f, "{}", names.join("|"))
            }
            Self::AnyInput => f.write_str("*input*"),
        }
    }
}

/// Constraint on the real fan-out of a matched producer node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BranchMode {
    /// No constraint.
    #[default]
    None,
    /// The producer must have exactly one consumer node.
    Single,
    /// The producer must have at least two consumer nodes.
    Multi,
}

impl BranchMode {
    pub fn admits(self, fan_out: usize) -> bool {
        match self {
            Self::None => true,
            Self::Single => fan_out == 1,
            Self::Multi => fan_out >= 2,
        }
    }
}

/// An operand role in a pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OpDesc {
    pub name: String,
    pub filter: TypeFilter,
    pub min: usize,
    pub max: usize,
    /// Branch group used by de-duplication; `None` for shared operands.
    pub group: Option<u32>,
}

/// Producer → consumers edge between operand roles.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternEdge {
    pub producer: String,
    pub consumers: Vec<String>,
    pub branch: BranchMode,
    /// Every real consumer of the producer must be claimed by this edge.
    pub strict: bool,
}

/// An immutable sub-graph template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pattern {
    name: String,
    descs: Vec<OpDesc>,
    edges: Vec<PatternEdge>,
    heads: Vec<String>,
}

impl Pattern {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operand roles in declaration order.
    pub fn descs(&self) -> &[OpDesc] {
        &self.descs
    }

    pub fn desc(&self, name: &str) -> Option<&OpDesc> {
        self.descs.iter().find(|d| d.name == name)
    }

    pub fn edges(&self) -> &[PatternEdge] {
        &self.edges
    }

    pub fn heads(&self) -> &[String] {
        &self.heads
    }

    /// The edge leaving `producer`, if any.
    pub fn outputs_of(&self, producer: &str) -> Option<&PatternEdge> {
        self.edges.iter().find(|e| e.producer == producer)
    }

    /// Edges that list `consumer` among their consumers.
    pub fn edges_into<'a>(&'a self, consumer: &'a str) -> impl Iterator<Item = &'a PatternEdge> {
        self.edges
            .iter()
            .filter(move |e| e.consumers.iter().any(|c| c == consumer))
    }

    /// Number of pattern edges entering `name`.
    pub fn in_degree(&self, name: &str) -> usize {
        self.edges_into(name).count()
    }

    /// The head the matcher starts from: the first head with a concrete
    /// type filter.
    pub fn anchor_head(&self) -> &OpDesc {
        self.heads
            .iter()
            .filter_map(|h| self.desc(h))
            .find(|d| !d.filter.is_any_input())
            .unwrap_or(&self.descs[0])
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pattern {} (heads: {})", self.name, self.heads.join(", "))?;
        for d in &self.descs {
            write!(f, "  {}: {} [{}, {}]", d.name, d.filter, d.min, d.max)?;
            if let Some(g) = d.group {
                write!(f, " group {g}")?;
            }
            writeln!(f)?;
        }
        for e in &self.edges {
            writeln!(
                f,
                "  {} -> {} ({:?}{})",
                e.producer,
                e.consumers.join(", "),
                e.branch,
                if e.strict { ", strict" } else { "" }
            )?;
        }
        Ok(())
    }
}

/// Builder for [`Pattern`].
///
/// Errors are latched: the first invalid call is reported by
/// [`build`](Self::build) and later calls are ignored.
#[derive(Debug)]
pub struct PatternBuilder {
    name: String,
    descs: Vec<OpDesc>,
    edges: Vec<PatternEdge>,
    heads: Vec<String>,
    error: Option<PatternError>,
}

impl PatternBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            descs: Vec::new(),
            edges: Vec::new(),
            heads: Vec::new(),
            error: None,
        }
    }

    fn fail(&mut self, err: PatternError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }

    fn known(&mut self, op: &str) -> bool {
        if self.descs.iter().any(|d| d.name == op) {
            return true;
        }
        let err = PatternError::UnknownOp {
            pattern: self.name.clone(),
            op: op.to_string(),
        };
        self.fail(err);
        false
    }

    /// Declare an operand role.
    pub fn add_op(self, name: &str, filter: TypeFilter, min: usize, max: usize) -> Self {
        self.add_op_with_group(name, filter, min, max, None)
    }

    /// Declare an operand role belonging to a branch group.
    pub fn add_op_in_group(
        self,
        name: &str,
        filter: TypeFilter,
        min: usize,
        max: usize,
        group: u32,
    ) -> Self {
        self.add_op_with_group(name, filter, min, max, Some(group))
    }

    fn add_op_with_group(
        mut self,
        name: &str,
        filter: TypeFilter,
        min: usize,
        max: usize,
        group: Option<u32>,
    ) -> Self {
        if self.descs.iter().any(|d| d.name == name) {
            let err = PatternError::DuplicateOp {
                pattern: self.name.clone(),
                op: name.to_string(),
            };
            self.fail(err);
            return self;
        }
        if max == 0 || min > max {
            let err = PatternError::InvalidRange {
                pattern: self.name.clone(),
                op: name.to_string(),
                min,
                max,
            };
            self.fail(err);
            return self;
        }
        self.descs.push(OpDesc {
            name: name.to_string(),
            filter,
            min,
            max,
            group,
        });
        self
    }

    /// Declare the consumers fed by `producer`.
    pub fn set_outputs(
        mut self,
        producer: &str,
        consumers: &[&str],
        branch: BranchMode,
        strict: bool,
    ) -> Self {
        if !self.known(producer) || !consumers.iter().all(|c| self.known(c)) {
            return self;
        }
        if self.edges.iter().any(|e| e.producer == producer) {
            let err = PatternError::DuplicateOutputs {
                pattern: self.name.clone(),
                op: producer.to_string(),
            };
            self.fail(err);
            return self;
        }
        self.edges.push(PatternEdge {
            producer: producer.to_string(),
            consumers: consumers.iter().map(|c| c.to_string()).collect(),
            branch,
            strict,
        });
        self
    }

    /// Declare the head operands (roles with no incoming pattern edge).
    pub fn set_head(mut self, heads: &[&str]) -> Self {
        if heads.iter().all(|h| self.known(h)) {
            self.heads = heads.iter().map(|h| h.to_string()).collect();
        }
        self
    }

    pub fn build(self) -> Result<Pattern, PatternError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.heads.is_empty() {
            return Err(PatternError::NoHead { pattern: self.name });
        }
        let pattern = Pattern {
            name: self.name,
            descs: self.descs,
            edges: self.edges,
            heads: self.heads,
        };
        for head in &pattern.heads {
            if pattern.in_degree(head) > 0 {
                return Err(PatternError::HeadHasInputs {
                    pattern: pattern.name.clone(),
                    op: head.clone(),
                });
            }
        }
        let typed_head = pattern
            .heads
            .iter()
            .filter_map(|h| pattern.desc(h))
            .any(|d| !d.filter.is_any_input());
        if !typed_head {
            return Err(PatternError::NoTypedHead {
                pattern: pattern.name,
            });
        }
        Ok(pattern)
    }
}

/// Names of the operand roles that are heads of `pattern` and have no
/// incoming edge; used to check registered patterns.
pub fn heads_without_inputs(pattern: &Pattern) -> BTreeSet<&str> {
    pattern
        .heads()
        .iter()
        .filter(|h| pattern.in_degree(h) == 0)
        .map(String::as_str)
        .collect()
}
