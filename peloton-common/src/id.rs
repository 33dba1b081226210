// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Typed identifiers.
//!
//! All ids are string-backed: `TaskID` is `<job>-<instance>`, and the
//! broker-visible `MesosTaskID` appends a run attempt (`<job>-<instance>-<n>`)
//! so a retried task gets a fresh identity on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn value(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// A job identifier.
    JobID
);
string_id!(
    /// A task identifier, `<job>-<instance>`.
    TaskID
);
string_id!(
    /// An offer identifier assigned by the external broker.
    OfferID
);
string_id!(
    /// A resource pool identifier.
    ResPoolID
);
string_id!(
    /// An agent identifier assigned by the external broker.
    AgentID
);

impl TaskID {
    /// Build the canonical `<job>-<instance>` task id.
    pub fn from_instance(job_id: &JobID, instance: u32) -> Self {
        Self(format!("{}-{}", job_id.value(), instance))
    }
}

/// The broker-visible task id: task id plus run attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MesosTaskID {
    pub task_id: TaskID,
    pub attempt: u32,
}

impl MesosTaskID {
    pub fn new(task_id: TaskID) -> Self {
        Self { task_id, attempt: 1 }
    }

    /// A fresh broker identity for the next run of the same task.
    pub fn next_attempt(&self) -> Self {
        Self {
            task_id: self.task_id.clone(),
            attempt: self.attempt + 1,
        }
    }
}

impl fmt::Display for MesosTaskID {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.task_id, self.attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_format() {
        let id = TaskID::from_instance(&JobID::from("job1"), 2);
        assert_eq!(id.value(), "job1-2");
    }

    #[test]
    fn test_mesos_task_id_attempts() {
        let m = MesosTaskID::new(TaskID::from("job1-0"));
        assert_eq!(m.to_string(), "job1-0-1");
        let next = m.next_attempt();
        assert_eq!(next.to_string(), "job1-0-2");
        assert_eq!(next.task_id, m.task_id);
    }
}
