//! Condition trees.
//!
//! A [`Condition`] is built from index handles and composed with `&`, `|`
//! and `!`. Evaluating it against a [`QueryContext`] yields a lazy
//! [`BitmapResult`]; no ID list is materialized.

use crate::bitmap::{BitmapLevel3, BitmapResult};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexRegistry;
use crate::types::IndexId;
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// A leaf of a condition tree, usually bound to one index.
pub trait ConditionLeaf<E>: Send + Sync {
    /// Resolves the leaf to a bitmap result.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] if the leaf's index was
    /// removed, or [`CoreError::Unsupported`] for lookups the index cannot
    /// answer.
    fn evaluate<'a>(&self, ctx: &QueryContext<'a, E>) -> CoreResult<BitmapResult<'a>>;

    /// Human-readable form, for logs and errors.
    fn describe(&self) -> String;
}

/// What a condition is evaluated against: the indices and the live IDs.
pub struct QueryContext<'a, E> {
    indices: &'a IndexRegistry<E>,
    live: &'a BitmapLevel3,
}

impl<'a, E: 'static> QueryContext<'a, E> {
    /// Creates a context.
    pub fn new(indices: &'a IndexRegistry<E>, live: &'a BitmapLevel3) -> Self {
        Self { indices, live }
    }

    /// The bitmap of all live entity IDs.
    #[must_use]
    pub fn live(&self) -> &'a BitmapLevel3 {
        self.live
    }

    /// The registered index `id`, as its concrete type.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::IndexNotFound`] if no index of that type is
    /// registered under `id`.
    pub fn index<X: 'static>(&self, id: IndexId, name: &str) -> CoreResult<&'a X> {
        self.indices
            .get(id)
            .and_then(|index| index.as_any().downcast_ref::<X>())
            .ok_or_else(|| CoreError::index_not_found(name))
    }
}

enum Node<E> {
    All,
    Leaf(Box<dyn ConditionLeaf<E>>),
    And(Vec<Condition<E>>),
    Or(Vec<Condition<E>>),
    Not(Box<Condition<E>>),
}

/// A predicate over the entities of a map.
pub struct Condition<E> {
    node: Node<E>,
}

impl<E: 'static> Condition<E> {
    /// Matches every live entity.
    #[must_use]
    pub fn all() -> Self {
        Self { node: Node::All }
    }

    /// Wraps a leaf.
    pub fn leaf(leaf: impl ConditionLeaf<E> + 'static) -> Self {
        Self {
            node: Node::Leaf(Box::new(leaf)),
        }
    }

    /// Matches entities matching both conditions.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::all_of([self, other])
    }

    /// Matches entities matching either condition.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::any_of([self, other])
    }

    /// Matches live entities not matching the condition.
    #[must_use]
    pub fn negate(self) -> Self {
        match self.node {
            Node::Not(inner) => *inner,
            node => Self {
                node: Node::Not(Box::new(Self { node })),
            },
        }
    }

    /// Matches entities matching every condition. Empty input matches all.
    pub fn all_of(conditions: impl IntoIterator<Item = Self>) -> Self {
        let mut children = Vec::new();
        for condition in conditions {
            match condition.node {
                Node::And(inner) => children.extend(inner),
                Node::All => {}
                node => children.push(Self { node }),
            }
        }
        match children.len() {
            0 => Self::all(),
            1 => children.remove(0),
            _ => Self {
                node: Node::And(children),
            },
        }
    }

    /// Matches entities matching any condition. Empty input matches none.
    pub fn any_of(conditions: impl IntoIterator<Item = Self>) -> Self {
        let mut children = Vec::new();
        for condition in conditions {
            match condition.node {
                Node::Or(inner) => children.extend(inner),
                node => children.push(Self { node }),
            }
        }
        match children.len() {
            1 => children.remove(0),
            _ => Self {
                node: Node::Or(children),
            },
        }
    }

    /// Resolves the condition to a bitmap result.
    ///
    /// # Errors
    ///
    /// Propagates leaf errors.
    pub fn evaluate<'a>(&self, ctx: &QueryContext<'a, E>) -> CoreResult<BitmapResult<'a>> {
        Ok(match &self.node {
            Node::All => BitmapResult::Bitmap(ctx.live()),
            Node::Leaf(leaf) => leaf.evaluate(ctx)?,
            Node::And(children) => BitmapResult::and(
                children
                    .iter()
                    .map(|child| child.evaluate(ctx))
                    .collect::<CoreResult<_>>()?,
            ),
            Node::Or(children) => BitmapResult::or(
                children
                    .iter()
                    .map(|child| child.evaluate(ctx))
                    .collect::<CoreResult<_>>()?,
            ),
            Node::Not(inner) => BitmapResult::not(inner.evaluate(ctx)?, ctx.live()),
        })
    }

    /// Human-readable form.
    #[must_use]
    pub fn describe(&self) -> String {
        match &self.node {
            Node::All => "all".to_string(),
            Node::Leaf(leaf) => leaf.describe(),
            Node::And(children) => join(children, " and "),
            Node::Or(children) if children.is_empty() => "none".to_string(),
            Node::Or(children) => join(children, " or "),
            Node::Not(inner) => format!("not {}", inner.describe()),
        }
    }
}

fn join<E: 'static>(children: &[Condition<E>], separator: &str) -> String {
    let parts: Vec<_> = children
        .iter()
        .map(|child| format!("({})", child.describe()))
        .collect();
    parts.join(separator)
}

impl<E: 'static> fmt::Display for Condition<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl<E: 'static> fmt::Debug for Condition<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Condition({})", self.describe())
    }
}

impl<E: 'static> BitAnd for Condition<E> {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        self.and(rhs)
    }
}

impl<E: 'static> BitOr for Condition<E> {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.or(rhs)
    }
}

impl<E: 'static> Not for Condition<E> {
    type Output = Self;

    fn not(self) -> Self {
        self.negate()
    }
}
