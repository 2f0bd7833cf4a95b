//! Placement constraints attached to jobs, task groups, and host volumes.
//!
//! Targets are either literals or `${...}` interpolations resolved against a
//! node at placement time (`${node.id}`, `${node.name}`, `${node.pool}`,
//! `${attr.<key>}`, `${meta.<key>}`).

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConstraintOperand {
    #[serde(rename = "=")]
    Equal,
    #[serde(rename = "!=")]
    NotEqual,
    #[serde(rename = "regexp")]
    Regexp,
    #[serde(rename = "is_set")]
    IsSet,
    #[serde(rename = "is_not_set")]
    IsNotSet,
    #[serde(rename = "distinct_hosts")]
    DistinctHosts,
    #[serde(rename = "distinct_property")]
    DistinctProperty,
}

impl fmt::Display for ConstraintOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConstraintOperand::Equal => "=",
            ConstraintOperand::NotEqual => "!=",
            ConstraintOperand::Regexp => "regexp",
            ConstraintOperand::IsSet => "is_set",
            ConstraintOperand::IsNotSet => "is_not_set",
            ConstraintOperand::DistinctHosts => "distinct_hosts",
            ConstraintOperand::DistinctProperty => "distinct_property",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Constraint {
    #[serde(default)]
    pub l_target: String,
    #[serde(default)]
    pub r_target: String,
    pub operand: ConstraintOperand,
}

impl Constraint {
    pub fn new(l_target: &str, operand: ConstraintOperand, r_target: &str) -> Self {
        Self {
            l_target: l_target.to_string(),
            r_target: r_target.to_string(),
            operand,
        }
    }

    /// Check operand-specific shape requirements.
    pub fn validate(&self) -> Result<(), String> {
        match self.operand {
            ConstraintOperand::Equal | ConstraintOperand::NotEqual => {
                if self.l_target.is_empty() || self.r_target.is_empty() {
                    return Err(format!(
                        "operator {:?} requires both an LTarget and RTarget",
                        self.operand.to_string()
                    ));
                }
            }
            ConstraintOperand::Regexp => {
                if self.l_target.is_empty() {
                    return Err("regexp constraint requires an LTarget".to_string());
                }
                regex::Regex::new(&self.r_target)
                    .map_err(|e| format!("regular expression failed to compile: {e}"))?;
            }
            ConstraintOperand::IsSet | ConstraintOperand::IsNotSet => {
                if self.l_target.is_empty() {
                    return Err(format!(
                        "operator {:?} requires an LTarget",
                        self.operand.to_string()
                    ));
                }
                if !self.r_target.is_empty() {
                    return Err(format!(
                        "operator {:?} does not support an RTarget",
                        self.operand.to_string()
                    ));
                }
            }
            ConstraintOperand::DistinctHosts => {}
            ConstraintOperand::DistinctProperty => {
                if self.l_target.is_empty() {
                    return Err("distinct_property constraint requires an LTarget".to_string());
                }
                if !self.r_target.is_empty() && self.r_target.parse::<u64>().map_or(true, |n| n == 0) {
                    return Err(format!(
                        "distinct_property RTarget must be a positive integer, got {:?}",
                        self.r_target
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.l_target, self.operand, self.r_target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operand_serde_names() {
        let c = Constraint::new("${attr.os}", ConstraintOperand::Equal, "linux");
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains(r#""operand":"=""#), "{json}");

        let parsed: Constraint =
            serde_json::from_str(r#"{"l_target":"${node.pool}","operand":"distinct_hosts"}"#)
                .unwrap();
        assert_eq!(parsed.operand, ConstraintOperand::DistinctHosts);
        assert!(parsed.r_target.is_empty());
    }

    #[test]
    fn test_validate_shapes() {
        assert!(Constraint::new("${attr.os}", ConstraintOperand::Equal, "linux")
            .validate()
            .is_ok());
        assert!(Constraint::new("${attr.os}", ConstraintOperand::Equal, "")
            .validate()
            .is_err());
        assert!(Constraint::new("${attr.os}", ConstraintOperand::Regexp, "[")
            .validate()
            .is_err());
        assert!(Constraint::new("${meta.rack}", ConstraintOperand::IsSet, "")
            .validate()
            .is_ok());
        assert!(Constraint::new("${meta.rack}", ConstraintOperand::IsSet, "x")
            .validate()
            .is_err());
        assert!(Constraint::new("", ConstraintOperand::DistinctProperty, "")
            .validate()
            .is_err());
        assert!(Constraint::new("${meta.rack}", ConstraintOperand::DistinctProperty, "0")
            .validate()
            .is_err());
        assert!(Constraint::new("", ConstraintOperand::DistinctHosts, "")
            .validate()
            .is_ok());
    }

    #[test]
    fn test_display() {
        let c = Constraint::new("${node.pool}", ConstraintOperand::NotEqual, "batch");
        assert_eq!(c.to_string(), "${node.pool} != batch");
    }
}
