//! Cluster resource accounting.
//!
//! A static cluster descriptor is turned into a read-only [`ResourceProfile`]
//! exactly once, at scheduler construction. The profile's `ntasks` is the
//! admission-control ceiling; nothing downstream re-derives resource numbers.

use std::collections::HashMap;
use std::str::FromStr;

use serde::Deserialize;
use void::Void;

use crate::error::SweepError;
use crate::serde::{string_or_count, string_or_count_opt};

/// Accelerator descriptor from the cluster spec.
///
/// Accepts `"gpu:4"`, a typed `"gpu:a100:4"`, or a bare count. The raw form
/// is kept verbatim; parsing happens in [`ResourceProfile::new`] so malformed
/// descriptors are rejected eagerly, with the original text in the error.
#[derive(Debug, Clone)]
pub struct AcceleratorSpec(String);

impl FromStr for AcceleratorSpec {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_string()))
    }
}

impl Default for AcceleratorSpec {
    fn default() -> Self {
        Self("1".to_string())
    }
}

impl AcceleratorSpec {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Accelerator units per node. The count is the last `:`-separated field.
    pub fn units(&self) -> Option<u32> {
        let raw = self.0.trim();
        match raw.rsplit_once(':') {
            Some((_, count)) => count.parse().ok(),
            None => raw.parse().ok(),
        }
    }

    /// Resource name used in cluster submission flags. Bare counts submit
    /// under the conventional `gpu` name.
    pub fn name(&self) -> &str {
        match self.0.split_once(':') {
            Some((name, _)) => name,
            None => "gpu",
        }
    }
}

/// Static description of the execution host, straight from the experiment
/// file. All fields default so a minimal experiment runs one task per node.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSpec {
    #[serde(default = "default_count")]
    pub nodes: u32,
    #[serde(default = "default_count")]
    pub tasks_per_node: u32,
    #[serde(default = "default_count")]
    pub cpus_per_task: u32,
    #[serde(default, deserialize_with = "string_or_count")]
    pub gres: AcceleratorSpec,
}

fn default_count() -> u32 {
    1
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            nodes: 1,
            tasks_per_node: 1,
            cpus_per_task: 1,
            gres: AcceleratorSpec::default(),
        }
    }
}

/// Per-host overrides for the cluster spec. Every field is optional; missing
/// fields fall back to the experiment-wide defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterOverride {
    pub nodes: Option<u32>,
    pub tasks_per_node: Option<u32>,
    pub cpus_per_task: Option<u32>,
    #[serde(default, deserialize_with = "string_or_count_opt")]
    pub gres: Option<AcceleratorSpec>,
}

impl ClusterSpec {
    /// Resolve the effective spec for one named host.
    pub fn merged(&self, overrides: &ClusterOverride) -> ClusterSpec {
        ClusterSpec {
            nodes: overrides.nodes.unwrap_or(self.nodes),
            tasks_per_node: overrides.tasks_per_node.unwrap_or(self.tasks_per_node),
            cpus_per_task: overrides.cpus_per_task.unwrap_or(self.cpus_per_task),
            gres: overrides.gres.clone().unwrap_or_else(|| self.gres.clone()),
        }
    }
}

/// Derived resource numbers, immutable for the scheduler's lifetime.
#[derive(Debug, Clone)]
pub struct ResourceProfile {
    pub nodes: u32,
    pub tasks_per_node: u32,
    pub cpus_per_task: u32,
    /// Submission-flag name of the accelerator resource (e.g. `gpu`).
    pub accelerator_name: String,
    pub accelerators_per_node: u32,
    /// Floor division; leftover units stay unassigned.
    pub accelerators_per_task: u32,
    /// The admission-control ceiling: `nodes * tasks_per_node`.
    pub ntasks: usize,
}

impl ResourceProfile {
    pub fn new(spec: &ClusterSpec) -> Result<Self, SweepError> {
        if spec.nodes == 0 {
            return Err(SweepError::Configuration(
                "cluster must have at least one node".to_string(),
            ));
        }
        if spec.tasks_per_node == 0 {
            return Err(SweepError::Configuration(
                "tasks_per_node must be at least one".to_string(),
            ));
        }
        let accelerators_per_node = spec.gres.units().ok_or_else(|| {
            SweepError::Configuration(format!(
                "cannot parse accelerator descriptor '{}'",
                spec.gres.as_str()
            ))
        })?;
        Ok(Self {
            nodes: spec.nodes,
            tasks_per_node: spec.tasks_per_node,
            cpus_per_task: spec.cpus_per_task,
            accelerator_name: spec.gres.name().to_string(),
            accelerators_per_node,
            accelerators_per_task: accelerators_per_node / spec.tasks_per_node,
            ntasks: spec.nodes as usize * spec.tasks_per_node as usize,
        })
    }
}

/// Look up a named host's override and build its profile. With no host name
/// or no matching entry, the experiment-wide spec applies unchanged.
pub fn profile_for(
    spec: &ClusterSpec,
    overrides: &HashMap<String, ClusterOverride>,
    host: Option<&str>,
) -> Result<ResourceProfile, SweepError> {
    let effective = match host.and_then(|name| overrides.get(name)) {
        Some(host_overrides) => spec.merged(host_overrides),
        None => spec.clone(),
    };
    ResourceProfile::new(&effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(nodes: u32, tasks: u32, gres: &str) -> ClusterSpec {
        ClusterSpec {
            nodes,
            tasks_per_node: tasks,
            cpus_per_task: 8,
            gres: gres.parse().unwrap(),
        }
    }

    #[test]
    fn test_ntasks_is_nodes_times_tasks_per_node() {
        let profile = ResourceProfile::new(&spec(2, 4, "gpu:8")).unwrap();
        assert_eq!(profile.ntasks, 8);
    }

    #[test]
    fn test_accelerators_per_task_floors() {
        let profile = ResourceProfile::new(&spec(1, 3, "gpu:8")).unwrap();
        assert_eq!(profile.accelerators_per_node, 8);
        assert_eq!(profile.accelerators_per_task, 2);
    }

    #[test]
    fn test_typed_gres_descriptor() {
        let profile = ResourceProfile::new(&spec(1, 2, "gpu:a100:4")).unwrap();
        assert_eq!(profile.accelerator_name, "gpu");
        assert_eq!(profile.accelerators_per_node, 4);
        assert_eq!(profile.accelerators_per_task, 2);
    }

    #[test]
    fn test_bare_count_descriptor() {
        let profile = ResourceProfile::new(&spec(1, 1, "4")).unwrap();
        assert_eq!(profile.accelerator_name, "gpu");
        assert_eq!(profile.accelerators_per_node, 4);
    }

    #[test]
    fn test_zero_tasks_per_node_rejected() {
        let err = ResourceProfile::new(&spec(1, 0, "gpu:4")).unwrap_err();
        assert!(matches!(err, SweepError::Configuration(_)));
    }

    #[test]
    fn test_zero_nodes_rejected() {
        let err = ResourceProfile::new(&spec(0, 2, "gpu:4")).unwrap_err();
        assert!(matches!(err, SweepError::Configuration(_)));
    }

    #[test]
    fn test_unparsable_gres_rejected() {
        let err = ResourceProfile::new(&spec(1, 2, "gpu:lots")).unwrap_err();
        match err {
            SweepError::Configuration(msg) => assert!(msg.contains("gpu:lots")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_gres_from_yaml_string_or_int() {
        #[derive(Deserialize)]
        struct Wrapper {
            #[serde(deserialize_with = "string_or_count")]
            gres: AcceleratorSpec,
        }
        let string_form: Wrapper = serde_yaml::from_str("gres: gpu:4").unwrap();
        assert_eq!(string_form.gres.units(), Some(4));
        let int_form: Wrapper = serde_yaml::from_str("gres: 4").unwrap();
        assert_eq!(int_form.gres.units(), Some(4));
    }

    #[test]
    fn test_override_merging() {
        let base = spec(1, 2, "gpu:4");
        let mut overrides = HashMap::new();
        overrides.insert(
            "meluxina".to_string(),
            ClusterOverride {
                tasks_per_node: Some(4),
                gres: Some("gpu:8".parse().unwrap()),
                ..ClusterOverride::default()
            },
        );

        let profile = profile_for(&base, &overrides, Some("meluxina")).unwrap();
        assert_eq!(profile.ntasks, 4);
        assert_eq!(profile.accelerators_per_task, 2);
        assert_eq!(profile.cpus_per_task, 8);

        // Unknown host names fall back to the experiment-wide spec.
        let profile = profile_for(&base, &overrides, Some("unknown")).unwrap();
        assert_eq!(profile.ntasks, 2);
    }
}
