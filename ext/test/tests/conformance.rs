//! Conformance tests that run YAML fixtures against p4t
//!
//! Run with: cargo test -p p4t-test --test conformance --features p4t-test/fixtures

#![cfg(feature = "fixtures")]

use p4t_test::fixture::{Fixture, Outcome};
use std::fs;
use std::path::{Path, PathBuf};

/// The `fixtures/` directory at the workspace root
fn fixtures_dir() -> PathBuf {
    // ext/test -> ext -> workspace root
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .expect("workspace root")
        .join("fixtures")
}

fn load(name: &str) -> Vec<Fixture> {
    let path = fixtures_dir().join(name);
    let yaml = fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("Failed to read {}: {e}", path.display()));
    Fixture::from_yaml_multi(&yaml)
        .unwrap_or_else(|e| panic!("Failed to parse {}: {e}", path.display()))
}

fn run_file(name: &str) {
    let fixtures = load(name);
    assert!(!fixtures.is_empty(), "{name} holds no fixtures");
    for fixture in fixtures {
        println!("  Running: {}", fixture.name);
        fixture.run_and_assert();
    }
}

#[test]
fn test_rekey() {
    run_file("01_rekey.yaml");
}

#[test]
fn test_partition() {
    run_file("02_partition.yaml");
}

#[test]
fn test_rejections() {
    run_file("03_rejections.yaml");
}

#[test]
fn every_fixture_file_parses() {
    for entry in fs::read_dir(fixtures_dir()).expect("read fixtures dir") {
        let path = entry.expect("dir entry").path();
        if path.extension().map_or(false, |e| e == "yaml" || e == "yml") {
            let name = path.file_name().and_then(|n| n.to_str()).expect("utf-8 name");
            assert!(!load(name).is_empty());
        }
    }
}

#[test]
fn wrong_expectation_fails() {
    let mut fixture = load("01_rekey.yaml").remove(0);
    fixture.expect.error = Some("InvalidMask".into());
    assert!(matches!(fixture.run(), Outcome::Failed(_)));
}
