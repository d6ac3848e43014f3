//! Pre-parsed predicate trees for scans and filtered listeners

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

use crate::{AttrValue, Attributes, CacheError};

/// Deepest predicate tree accepted by [`Predicate::validate`]
const MAX_DEPTH: usize = 64;

/// Comparison operator of a [`Predicate::Compare`] node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    /// Whether `stored.cmp(literal)` satisfies this operator.
    pub fn holds(self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Eq => ordering == Ordering::Equal,
            CompareOp::Ne => ordering != Ordering::Equal,
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
        }
    }
}

/// Boolean tree of attribute comparisons.
///
/// A comparison against an attribute the entry does not carry is false,
/// whatever the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
    Compare {
        attr: String,
        op: CompareOp,
        value: AttrValue,
    },
}

impl Predicate {
    pub fn compare(attr: impl Into<String>, op: CompareOp, value: impl Into<AttrValue>) -> Self {
        Predicate::Compare {
            attr: attr.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self::compare(attr, CompareOp::Eq, value)
    }

    pub fn ne(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self::compare(attr, CompareOp::Ne, value)
    }

    pub fn lt(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self::compare(attr, CompareOp::Lt, value)
    }

    pub fn le(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self::compare(attr, CompareOp::Le, value)
    }

    pub fn gt(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self::compare(attr, CompareOp::Gt, value)
    }

    pub fn ge(attr: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self::compare(attr, CompareOp::Ge, value)
    }

    pub fn and(self, other: Predicate) -> Self {
        match self {
            Predicate::And(mut children) => {
                children.push(other);
                Predicate::And(children)
            }
            first => Predicate::And(vec![first, other]),
        }
    }

    pub fn or(self, other: Predicate) -> Self {
        match self {
            Predicate::Or(mut children) => {
                children.push(other);
                Predicate::Or(children)
            }
            first => Predicate::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Reject malformed trees before they reach the store.
    pub fn validate(&self) -> Result<(), CacheError> {
        self.validate_at(1)
    }

    fn validate_at(&self, depth: usize) -> Result<(), CacheError> {
        if depth > MAX_DEPTH {
            return Err(CacheError::InvalidPredicate(format!(
                "tree deeper than {MAX_DEPTH} levels"
            )));
        }
        match self {
            Predicate::And(children) | Predicate::Or(children) => {
                if children.is_empty() {
                    return Err(CacheError::InvalidPredicate(
                        "AND/OR node without children".into(),
                    ));
                }
                children.iter().try_for_each(|c| c.validate_at(depth + 1))
            }
            Predicate::Not(child) => child.validate_at(depth + 1),
            Predicate::Compare { attr, value, .. } => {
                if attr.is_empty() {
                    return Err(CacheError::InvalidPredicate("empty attribute name".into()));
                }
                if let AttrValue::Float(f) = value
                    && f.is_nan()
                {
                    return Err(CacheError::InvalidPredicate(format!(
                        "NaN literal for attribute '{attr}'"
                    )));
                }
                Ok(())
            }
        }
    }

    /// Evaluate against an entry's attributes.
    pub fn matches(&self, attributes: &Attributes) -> bool {
        match self {
            Predicate::And(children) => children.iter().all(|c| c.matches(attributes)),
            Predicate::Or(children) => children.iter().any(|c| c.matches(attributes)),
            Predicate::Not(child) => !child.matches(attributes),
            Predicate::Compare { attr, op, value } => attributes
                .get(attr)
                .is_some_and(|stored| op.holds(stored.cmp(value))),
        }
    }

    /// Attribute names referenced anywhere in the tree.
    pub fn attributes(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_attributes(&mut names);
        names.sort_unstable();
        names.dedup();
        names
    }

    fn collect_attributes<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Predicate::And(children) | Predicate::Or(children) => {
                children.iter().for_each(|c| c.collect_attributes(names))
            }
            Predicate::Not(child) => child.collect_attributes(names),
            Predicate::Compare { attr, .. } => names.push(attr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes;

    #[test]
    fn evaluates_compound_trees() {
        let phone = attributes([
            ("category", AttrValue::from("phone")),
            ("price", AttrValue::from(799.0)),
            ("available", AttrValue::from(true)),
        ]);
        let expensive_available =
            Predicate::gt("price", 500).and(Predicate::eq("available", true));
        assert!(expensive_available.matches(&phone));

        let cheap_or_tablet = Predicate::lt("price", 100).or(Predicate::eq("category", "tablet"));
        assert!(!cheap_or_tablet.matches(&phone));
        assert!(cheap_or_tablet.negate().matches(&phone));
    }

    #[test]
    fn missing_attribute_never_matches_a_comparison() {
        let attrs = attributes([("category", "phone")]);
        assert!(!Predicate::ne("brand", "acme").matches(&attrs));
        assert!(Predicate::ne("brand", "acme").negate().matches(&attrs));
    }

    #[test]
    fn rejects_malformed_trees() {
        assert!(matches!(
            Predicate::And(vec![]).validate(),
            Err(CacheError::InvalidPredicate(_))
        ));
        assert!(Predicate::eq("", 1).validate().is_err());
        assert!(Predicate::eq("price", f64::NAN).validate().is_err());

        let mut deep = Predicate::eq("a", 1);
        for _ in 0..MAX_DEPTH {
            deep = deep.negate();
        }
        assert!(deep.validate().is_err());
        assert!(Predicate::eq("a", 1).negate().validate().is_ok());
    }

    #[test]
    fn lists_referenced_attributes_once() {
        let p = Predicate::eq("category", "phone")
            .and(Predicate::gt("price", 10).or(Predicate::lt("price", 1)));
        assert_eq!(p.attributes(), vec!["category", "price"]);
    }
}
