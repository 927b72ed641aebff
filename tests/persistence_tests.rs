//! Inlining database and configuration files across runtimes

mod common;
use common::{world, AREA_BCI};

use adaptive_jit::jit::graph::CompileScopeId;
use adaptive_jit::jit::SendResolution;
use adaptive_jit::rscope::{InliningDatabase, RScopeKind};
use adaptive_jit::{Error, VmConfig};
use pretty_assertions::assert_eq;
use std::fs;

#[test]
fn test_database_carries_inlining_to_a_fresh_runtime() {
    let mut trained = world(2);
    trained.observe(&[0, 1]);
    let nm = trained.rt.compile(trained.run_key).unwrap();
    assert!(trained.rt.capture_database(nm).unwrap() >= 1);

    let dir = tempfile::tempdir().unwrap();
    for name in ["inlining.json", "inlining.db"] {
        let path = dir.path().join(name);
        trained.rt.database().save(&path).unwrap();

        // Same program, no feedback at all
        let mut fresh = world(2);
        fresh.rt.set_database(InliningDatabase::load(&path).unwrap());
        assert_eq!(fresh.rt.database(), trained.rt.database());

        let tree = fresh.rt.scope_tree(fresh.run_key).unwrap();
        let root = tree.get(tree.root()).unwrap();
        assert!(matches!(root.kind, RScopeKind::Database(_)));
        assert_eq!(tree.receiver_classes(tree.root(), AREA_BCI), fresh.shapes);

        let c = fresh.rt.prepare(fresh.run_key, 1).unwrap();
        match &c.graph.send_at(CompileScopeId(0), AREA_BCI).unwrap().resolution {
            SendResolution::TypeCase { arms, .. } => assert_eq!(arms.len(), 2),
            other => panic!("expected type case, got {:?}", other),
        }
    }
}

#[test]
fn test_corrupt_database_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("broken.db");
    fs::write(&path, [0xff, 0x01, 0x02]).unwrap();
    assert!(InliningDatabase::load(&path).is_err());
}

#[test]
fn test_partial_config_file_keeps_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vm.json");
    fs::write(&path, r#"{ "ic": { "max_entries": 6 }, "trap": { "recompile_threshold": 5 } }"#).unwrap();

    let config = VmConfig::load(&path).unwrap();
    assert_eq!(config.ic.max_entries, 6);
    assert_eq!(config.trap.recompile_threshold, 5);
    assert_eq!(config.inlining, VmConfig::default().inlining);

    let round_trip = VmConfig::from_json_str(&config.to_json().unwrap()).unwrap();
    assert_eq!(round_trip, config);
}

#[test]
fn test_invalid_config_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("vm.json");
    fs::write(&path, r#"{ "ic": { "max_entries": 1 } }"#).unwrap();
    assert!(matches!(VmConfig::load(&path), Err(Error::Config(_))));
}
