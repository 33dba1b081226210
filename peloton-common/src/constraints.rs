// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Scheduling constraint evaluation over host attributes.
//!
//! A constraint is a boolean expression tree of label predicates evaluated
//! against a host's attribute map.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Comparison operator for a single label predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LabelOp {
    Equal,
    NotEqual,
    /// Key is present with any value.
    Exists,
    /// Value is one of the listed alternatives.
    In(Vec<String>),
}

/// A predicate on one host attribute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelPredicate {
    pub key: String,
    pub op: LabelOp,
    pub value: String,
}

impl LabelPredicate {
    pub fn equal(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            op: LabelOp::Equal,
            value: value.into(),
        }
    }

    fn matches(&self, attributes: &HashMap<String, String>) -> bool {
        let actual = attributes.get(&self.key);
        match &self.op {
            LabelOp::Equal => actual.is_some_and(|v| *v == self.value),
            LabelOp::NotEqual => !actual.is_some_and(|v| *v == self.value),
            LabelOp::Exists => actual.is_some(),
            LabelOp::In(values) => actual.is_some_and(|v| values.iter().any(|a| a == v)),
        }
    }
}

/// A boolean expression tree over label predicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Constraint {
    Label(LabelPredicate),
    And(Vec<Constraint>),
    Or(Vec<Constraint>),
    Not(Box<Constraint>),
}

impl Constraint {
    /// Evaluate against a host's attributes.
    pub fn evaluate(&self, attributes: &HashMap<String, String>) -> bool {
        match self {
            Constraint::Label(pred) => pred.matches(attributes),
            Constraint::And(children) => children.iter().all(|c| c.evaluate(attributes)),
            Constraint::Or(children) => children.iter().any(|c| c.evaluate(attributes)),
            Constraint::Not(child) => !child.evaluate(attributes),
        }
    }
}
