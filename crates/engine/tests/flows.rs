//! The fixture corpus under `tests/flows/` must validate clean and survive
//! a parse → serialize → parse round trip.

use std::fs;
use std::path::{Path, PathBuf};

use engine::Flow;

fn corpus_dir() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/flows")
}

fn load(path: &Path) -> Result<Flow, Vec<engine::ValidationError>> {
    let source = fs::read_to_string(path).expect("fixture should be readable");
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Flow::from_yaml_str(&source),
        _ => Flow::from_json_str(&source),
    }
}

#[test]
fn corpus_validates_clean() {
    let mut seen = 0;
    for entry in fs::read_dir(corpus_dir()).expect("corpus directory should exist") {
        let path = entry.expect("dir entry").path();
        seen += 1;
        match load(&path) {
            Ok(_) => {}
            Err(errors) => panic!("{} failed validation: {errors:#?}", path.display()),
        }
    }
    assert!(seen >= 4, "expected the corpus to contain fixtures");
}

#[test]
fn corpus_round_trips() {
    for entry in fs::read_dir(corpus_dir()).expect("corpus directory should exist") {
        let path = entry.expect("dir entry").path();
        let flow = load(&path).expect("fixture should validate");
        let serialized = flow.to_value().expect("serialization should succeed");
        let reparsed = Flow::from_value(&serialized)
            .unwrap_or_else(|errors| panic!("{} failed re-validation: {errors:#?}", path.display()));
        assert_eq!(flow, reparsed, "{} did not round-trip", path.display());
    }
}
