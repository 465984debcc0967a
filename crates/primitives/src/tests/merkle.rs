use super::*;

#[test]
fn test_canonical_encoding_is_sorted_and_line_oriented() {
    let mut children = BTreeMap::new();
    let _prev = children.insert("b.txt".to_owned(), Hash::digest(b"b"));
    let _prev = children.insert("a.txt".to_owned(), Hash::digest(b"a"));

    let encoding = MerkleNode::canonical_encoding(&children);
    let text = core::str::from_utf8(&encoding).unwrap();

    let expected = format!(
        "a.txt:{}\nb.txt:{}\n",
        Hash::digest(b"a").to_hex(),
        Hash::digest(b"b").to_hex()
    );
    assert_eq!(text, expected);
}

#[test]
fn test_node_hash_depends_on_child_names_and_hashes() {
    let mut children = BTreeMap::new();
    let _prev = children.insert("a".to_owned(), Hash::digest(b"1"));

    let base = MerkleNode::hash_children(&children);

    let mut renamed = children.clone();
    let moved = renamed.remove("a").unwrap();
    let _prev = renamed.insert("b".to_owned(), moved);
    assert_ne!(
        base,
        MerkleNode::hash_children(&renamed),
        "renaming a child must change the parent hash"
    );

    let mut rehashed = children.clone();
    let _prev = rehashed.insert("a".to_owned(), Hash::digest(b"2"));
    assert_ne!(
        base,
        MerkleNode::hash_children(&rehashed),
        "changing a child hash must change the parent hash"
    );
}

#[test]
fn test_empty_children_hash_is_stable() {
    let children = BTreeMap::new();

    assert_eq!(
        MerkleNode::hash_children(&children),
        Hash::digest(b""),
        "an empty node hashes the empty encoding"
    );
}

#[test]
fn test_index_id_round_trip() {
    let id = IndexId::random(&mut rand::thread_rng());
    let parsed: IndexId = id.to_string().parse().unwrap();

    assert_eq!(parsed, id);
    assert!("not-hex".parse::<IndexId>().is_err());
}
