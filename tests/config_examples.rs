//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Integration and validation tests for the lustre-ha stack."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lustre_ha_common::{AppConfig, LogFormat, TieBreak};
use lustre_ha_redundancy::{NodeSlot, NodeStatus, Resource, ResourceStatus};

fn repo_path(path: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("..").join(path)
}

#[test]
fn example_config_parses_and_validates() {
    let config = AppConfig::from_path(&repo_path("config/lustre-ha.example.yaml")).unwrap();
    assert_eq!(config.server.ip, "10.0.0.1");
    assert_eq!(config.etcd.endpoints.len(), 3);
    assert_eq!(config.etcd.lease_ttl, Duration::from_secs(10));
    assert_eq!(config.etcd.lock_timeout, None);
    assert_eq!(config.controller.node.a, "10.0.0.1");
    assert_eq!(config.controller.node.b, "10.0.0.2");
    assert_eq!(config.watched_controllers(), vec!["ost".to_owned()]);
    assert_eq!(config.failover.tie_break, TieBreak::B);
    assert_eq!(config.liveness.resources, vec!["ost1".to_owned()]);
    assert_eq!(config.logging.format, LogFormat::StructuredJson);
    assert!(config.logging.to_file);
}

#[test]
fn example_resource_decodes() {
    let path = repo_path("config/resources/ost1.json");
    let raw = fs::read(&path).unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    let resource = Resource::from_json("/resources/ost1", &raw).unwrap();
    assert_eq!(resource.primary_slot(NodeSlot::B), NodeSlot::A);
    assert_eq!(resource.a.status, NodeStatus::Healthy);
    assert_eq!(resource.status, ResourceStatus::Unmounted);
    assert!(resource.current_node.is_empty());
}

#[test]
fn sources_carry_frontmatter_header() {
    for file in [
        "crates/lustre-ha-common/src/lib.rs",
        "crates/lustre-ha-metrics/src/lib.rs",
        "crates/lustre-ha-registry/src/lib.rs",
        "crates/lustre-ha-redundancy/src/lib.rs",
        "bin/lustre-had/src/main.rs",
    ] {
        let content = fs::read_to_string(repo_path(file)).unwrap();
        assert!(content.starts_with("//! ---"), "{file} must include frontmatter header");
        assert!(content.contains("ems_section:"), "{file} must declare its section");
    }
}
