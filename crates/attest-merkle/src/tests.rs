use attest_hash::{ContentHasher, FieldValue, Record};

use crate::{diff_leaf_maps, diff_trees, DiffKind, MerkleError, MerkleTreeBuilder};

fn sha256() -> ContentHasher {
    ContentHasher::with_defaults("sha256").unwrap()
}

fn record(fields: &[(&str, &str)]) -> Record {
    fields
        .iter()
        .map(|(k, v)| (k.to_string(), FieldValue::Text(v.to_string())))
        .collect()
}

fn built_from(leaves: &[(&str, &str)]) -> MerkleTreeBuilder {
    let mut builder = MerkleTreeBuilder::new();
    for (id, hash) in leaves {
        builder.add_leaf_hash(id, *hash);
    }
    builder.build().unwrap();
    builder
}

#[test]
fn empty_tree_refuses_to_build() {
    let mut builder = MerkleTreeBuilder::new();
    assert!(matches!(builder.build(), Err(MerkleError::Empty)));
    assert!(builder.root().is_none());
}

#[test]
fn single_leaf_root_is_the_leaf() {
    let builder = built_from(&[("1", "aa")]);
    assert_eq!(builder.root(), Some("aa"));
}

#[test]
fn root_is_insertion_order_independent() {
    let forward = built_from(&[("1", "aa"), ("2", "bb"), ("3", "cc"), ("4", "dd")]);
    let backward = built_from(&[("4", "dd"), ("2", "bb"), ("3", "cc"), ("1", "aa")]);
    assert_eq!(forward.root(), backward.root());
}

#[test]
fn root_changes_when_any_leaf_changes() {
    let base = built_from(&[("1", "aa"), ("2", "bb"), ("3", "cc")]);
    let changed = built_from(&[("1", "aa"), ("2", "xx"), ("3", "cc")]);
    assert_ne!(base.root(), changed.root());
}

#[test]
fn odd_leaf_count_duplicates_the_tail() {
    // With three leaves the tail pairs with itself; adding an identical
    // fourth leaf hash under a new id must change the leaf count but is
    // indistinguishable at the tail-pair level.
    let three = built_from(&[("1", "aa"), ("2", "bb"), ("3", "cc")]);
    assert_eq!(three.leaf_count(), 3);
    assert!(three.root().is_some());
}

#[test]
fn record_leaves_hash_through_content_hasher() {
    let hasher = sha256();
    let mut builder = MerkleTreeBuilder::new();
    let rec = record(&[("id", "1"), ("msg", "hello")]);
    builder.add_leaf("1", &rec, &hasher);

    assert_eq!(
        builder.leaf_hash("1"),
        Some(hasher.hash_record(&rec).as_str())
    );
}

#[test]
fn duplicate_record_id_replaces_leaf() {
    let mut builder = MerkleTreeBuilder::new();
    builder.add_leaf_hash("1", "aa");
    builder.add_leaf_hash("1", "bb");
    assert_eq!(builder.leaf_count(), 1);
    assert_eq!(builder.leaf_hash("1"), Some("bb"));
}

#[test]
fn proofs_verify_for_every_leaf() {
    let leaves: Vec<(String, String)> = (0..13)
        .map(|i| (format!("{i}"), format!("{:02x}{:02x}", i, i * 7)))
        .collect();

    let mut builder = MerkleTreeBuilder::new();
    for (id, hash) in &leaves {
        builder.add_leaf_hash(id, hash.clone());
    }
    builder.build().unwrap();
    let root = builder.root().unwrap().to_string();

    for (id, _) in &leaves {
        let proof = builder.proof(id).unwrap();
        assert!(proof.verify(&root), "proof for {id} failed");
    }
}

#[test]
fn proof_fails_against_wrong_root() {
    let builder = built_from(&[("1", "aa"), ("2", "bb"), ("3", "cc"), ("4", "dd")]);
    let proof = builder.proof("2").unwrap();
    assert!(!proof.verify("0000000000000000"));
}

#[test]
fn proof_for_unknown_record_errors() {
    let builder = built_from(&[("1", "aa")]);
    assert!(matches!(
        builder.proof("missing"),
        Err(MerkleError::RecordNotFound(_))
    ));
}

#[test]
fn tampered_proof_is_rejected() {
    let builder = built_from(&[("1", "aa"), ("2", "bb"), ("3", "cc"), ("4", "dd")]);
    let root = builder.root().unwrap().to_string();

    let mut proof = builder.proof("3").unwrap();
    proof.leaf_hash = "ff".to_string();
    assert!(!proof.verify(&root));
}

#[test]
fn matching_trees_diff_empty() {
    let a = built_from(&[("1", "aa"), ("2", "bb")]);
    let b = built_from(&[("2", "bb"), ("1", "aa")]);
    assert!(diff_trees(&a, &b).is_empty());
}

#[test]
fn diff_classifies_all_three_kinds() {
    // expected: 1, 2, 3     actual: 1 (modified), 2, 9 (phantom); 3 deleted.
    let expected = built_from(&[("1", "aa"), ("2", "bb"), ("3", "cc")]);
    let actual = built_from(&[("1", "a1"), ("2", "bb"), ("9", "ee")]);

    let diffs = diff_trees(&expected, &actual);
    assert_eq!(diffs.len(), 3);

    let modified = diffs.iter().find(|d| d.record_id == "1").unwrap();
    assert_eq!(modified.kind, DiffKind::Modified);
    assert_eq!(modified.expected_hash.as_deref(), Some("aa"));
    assert_eq!(modified.actual_hash.as_deref(), Some("a1"));

    let deleted = diffs.iter().find(|d| d.record_id == "3").unwrap();
    assert_eq!(deleted.kind, DiffKind::MissingInActual);
    assert!(deleted.actual_hash.is_none());

    let phantom = diffs.iter().find(|d| d.record_id == "9").unwrap();
    assert_eq!(phantom.kind, DiffKind::MissingInExpected);
    assert!(phantom.expected_hash.is_none());
}

#[test]
fn leaf_map_round_trips_to_same_root() {
    let original = built_from(&[("1", "aa"), ("2", "bb"), ("3", "cc"), ("4", "dd")]);

    let mut restored = MerkleTreeBuilder::from_leaf_map(original.leaf_map().clone());
    restored.build().unwrap();

    assert_eq!(original.root(), restored.root());
    assert_eq!(original.leaf_count(), restored.leaf_count());
}

#[test]
fn internal_nodes_cover_every_level_above_leaves() {
    let builder = built_from(&[("1", "aa"), ("2", "bb"), ("3", "cc"), ("4", "dd")]);
    let nodes = builder.internal_nodes();

    // 4 leaves → 2 internal at level 1, 1 root at level 2.
    assert_eq!(nodes.len(), 3);
    assert_eq!(nodes.get("2:0").map(String::as_str), builder.root());
}

#[test]
fn map_diff_matches_tree_diff() {
    let expected = built_from(&[("1", "aa"), ("2", "bb")]);
    let actual = built_from(&[("1", "aa"), ("2", "b0")]);

    let from_trees = diff_trees(&expected, &actual);
    let from_maps = diff_leaf_maps(expected.leaf_map(), actual.leaf_map());
    assert_eq!(from_trees, from_maps);
}
