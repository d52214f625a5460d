//! Human-in-the-loop gating.
//!
//! The engine (never the executor) decides before each tool dispatch whether
//! to suspend. Policies are glob patterns over tool names; auto-approve
//! patterns punch holes through require patterns.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Deserialize;
use serde_json::Value;

use rv_domain::agent::HitlPolicy;
use rv_domain::config::HitlConfig;
use rv_domain::error::{Error, Result};

/// The human's verdict on a pending tool call.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Approve,
    /// Approve with replaced arguments.
    Modify { args: Value },
    Reject,
}

/// Compiled HITL matcher for one run.
#[derive(Debug)]
pub struct HitlGate {
    require: GlobSet,
    auto_approve: GlobSet,
    has_require: bool,
}

fn compile(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| Error::Config(format!("bad HITL pattern '{pattern}': {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("HITL pattern set: {e}")))
}

impl HitlGate {
    /// Merge the host config with the agent's policy; the agent can only
    /// add patterns, never remove the host's.
    pub fn compile(host: &HitlConfig, agent: &HitlPolicy) -> Result<Self> {
        let mut require = host.require_patterns.clone();
        require.extend(agent.require_patterns.iter().cloned());
        let mut auto = host.auto_approve_patterns.clone();
        auto.extend(agent.auto_approve_patterns.iter().cloned());

        Ok(Self {
            has_require: !require.is_empty(),
            require: compile(&require)?,
            auto_approve: compile(&auto)?,
        })
    }

    /// Whether dispatching `tool_name` requires a human decision first.
    /// `spec_flagged` is the registry-level HITL flag on the tool itself.
    pub fn requires_approval(&self, tool_name: &str, spec_flagged: bool) -> bool {
        if self.auto_approve.is_match(tool_name) {
            return false;
        }
        if spec_flagged {
            return true;
        }
        self.has_require && self.require.is_match(tool_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate(require: &[&str], auto: &[&str]) -> HitlGate {
        HitlGate::compile(
            &HitlConfig {
                require_patterns: require.iter().map(|s| s.to_string()).collect(),
                auto_approve_patterns: auto.iter().map(|s| s.to_string()).collect(),
            },
            &HitlPolicy::default(),
        )
        .unwrap()
    }

    #[test]
    fn require_pattern_gates_matching_tools() {
        let g = gate(&["fs.*"], &[]);
        assert!(g.requires_approval("fs.delete", false));
        assert!(!g.requires_approval("add", false));
    }

    #[test]
    fn auto_approve_wins_over_require() {
        let g = gate(&["fs.*"], &["fs.read"]);
        assert!(!g.requires_approval("fs.read", false));
        assert!(g.requires_approval("fs.write", false));
    }

    #[test]
    fn spec_flag_gates_even_without_patterns() {
        let g = gate(&[], &[]);
        assert!(g.requires_approval("delete_file", true));
        assert!(!g.requires_approval("delete_file", false));
    }

    #[test]
    fn auto_approve_also_overrides_spec_flag() {
        let g = gate(&[], &["delete_file"]);
        assert!(!g.requires_approval("delete_file", true));
    }

    #[test]
    fn agent_policy_extends_host_policy() {
        let g = HitlGate::compile(
            &HitlConfig::default(),
            &HitlPolicy {
                require_patterns: vec!["shell.*".into()],
                auto_approve_patterns: vec![],
            },
        )
        .unwrap();
        assert!(g.requires_approval("shell.exec", false));
    }

    #[test]
    fn bad_patterns_are_config_errors() {
        let err = HitlGate::compile(
            &HitlConfig {
                require_patterns: vec!["[".into()],
                auto_approve_patterns: vec![],
            },
            &HitlPolicy::default(),
        )
        .unwrap_err();
        assert_eq!(err.kind(), "config");
    }

    #[test]
    fn decision_deserializes_from_wire_form() {
        let d: Decision = serde_json::from_str(r#"{"decision":"approve"}"#).unwrap();
        assert!(matches!(d, Decision::Approve));
        let d: Decision =
            serde_json::from_str(r#"{"decision":"modify","args":{"path":"/b"}}"#).unwrap();
        assert!(matches!(d, Decision::Modify { .. }));
    }
}
