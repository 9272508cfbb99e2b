use std::mem;

use super::*;
use crate::LeafLayout;

fn pool() -> PmPool {
    PmPool::anonymous(1 << 20, LeafLayout::Bucketed).unwrap()
}

#[test]
fn opaque_node_ptr_is_correct() {
    let pool = pool();
    let n4 = InnerNode4::allocate(&pool, 1, 0, Prefix::empty()).unwrap();
    let n16 = InnerNode16::allocate(&pool, 1, 0, Prefix::empty()).unwrap();
    let n48 = InnerNode48::allocate(&pool, 1, 0, Prefix::empty()).unwrap();
    let n256 = InnerNode256::allocate(&pool, 1, 0, Prefix::empty()).unwrap();
    let bucket = LeafBucket::allocate(&pool, 1, 1).unwrap();

    assert!(n4.to_opaque().is::<InnerNode4>());
    assert!(n16.to_opaque().is::<InnerNode16>());
    assert!(n48.to_opaque().is::<InnerNode48>());
    assert!(n256.to_opaque().is::<InnerNode256>());
    assert!(bucket.to_opaque().is::<LeafBucket>());
    assert!(!bucket.to_opaque().is::<FingerprintBucket>());

    assert_eq!(n48.to_opaque().cast::<InnerNode48>(), Some(n48));
    assert_eq!(n48.to_opaque().cast::<InnerNode4>(), None);
    assert_eq!(n16.to_opaque().offset(), n16.offset());
}

#[test]
fn opaque_node_ptr_raw_round_trip() {
    let ptr = OpaqueNodePtr::new::<FingerprintBucket>(4096 + 640).unwrap();
    assert_eq!(OpaqueNodePtr::from_raw(ptr.to_raw()), Some(ptr));
    assert_eq!(ptr.node_type(), NodeType::FingerprintBucket);

    assert_eq!(OpaqueNodePtr::from_raw(0), None);
    // Tag 0b111 is not a node type
    assert_eq!(OpaqueNodePtr::from_raw(4096 | 0b111), None);
    // A tag without an offset is not a node
    assert_eq!(OpaqueNodePtr::from_raw(0b101), None);
}

#[test]
fn concrete_node_ptr_matches_type() {
    let pool = pool();
    let n16 = InnerNode16::allocate(&pool, 1, 3, Prefix::new(b"ab", 2)).unwrap();
    let opaque = n16.to_opaque();

    assert_eq!(opaque.to_node_ptr(), ConcreteNodePtr::Node16(n16));
    assert_eq!(opaque.to_node_ptr().to_opaque(), opaque);

    let header = opaque.header(&pool).unwrap();
    assert_eq!(header.node_type(), Some(NodeType::Node16));
    assert_eq!(header.level(), 3);
    assert_eq!(header.prefix().stored(), b"ab");

    let leaf = NodePtr::<LeafNode>::create(&pool, b"k", b"v").unwrap();
    assert!(leaf.to_opaque().header(&pool).is_none());
    assert!(leaf.to_opaque().inner(&pool).is_none());
}

#[test]
#[cfg(target_pointer_width = "64")]
fn node_sizes() {
    // version + generation + meta + prefix
    assert_eq!(mem::size_of::<Header>(), 32);
    // header 32 + counts 8 + keys 4 + padding 4 + children 32, rounded to 64
    assert_eq!(mem::size_of::<InnerNode4>(), 128);
    // header 32 + counts 8 + keys 16 + children 128
    assert_eq!(mem::size_of::<InnerNode16>(), 192);
    // header 32 + count 4 + index 256 + padding 4 + children 384
    assert_eq!(mem::size_of::<InnerNode48>(), 704);
    // header 32 + count 4 + padding 4 + children 2048
    assert_eq!(mem::size_of::<InnerNode256>(), 2112);
    // header 32 + bitmap 8 + slots 512
    assert_eq!(mem::size_of::<LeafBucket>(), 576);
    // header 32 + bitmap 8 + slice length 8 + slices 512 + children 512
    assert_eq!(mem::size_of::<FingerprintBucket>(), 1088);

    for node_type in NodeType::ALL {
        if let Some(size) = node_type.allocation_size() {
            assert_eq!(size % 64, 0, "{node_type:?}");
        }
    }
}

#[test]
fn node_type_thresholds() {
    assert_eq!(NodeType::inner_for_children(0), NodeType::Node4);
    assert_eq!(NodeType::inner_for_children(4), NodeType::Node4);
    assert_eq!(NodeType::inner_for_children(5), NodeType::Node16);
    assert_eq!(NodeType::inner_for_children(48), NodeType::Node48);
    assert_eq!(NodeType::inner_for_children(49), NodeType::Node256);

    assert!(NodeType::Node16.should_shrink_inner_node(3));
    assert!(!NodeType::Node16.should_shrink_inner_node(4));
    assert!(!NodeType::Node4.should_shrink_inner_node(0));

    for node_type in NodeType::ALL {
        assert_eq!(NodeType::from_u8(node_type as u8), Some(node_type));
    }
    assert_eq!(NodeType::from_u8(7), None);
}

#[test]
fn inner_node_ref_dispatch() {
    let pool = pool();
    let n48 = InnerNode48::allocate(&pool, 1, 0, Prefix::empty()).unwrap();
    let node = n48.to_opaque().inner(&pool).unwrap();
    assert_eq!(node.node_type(), NodeType::Node48);

    let leaves: Vec<_> = (0..3u8)
        .map(|n| {
            NodePtr::<LeafNode>::create(&pool, &[n], b"")
                .unwrap()
                .to_opaque()
        })
        .collect();
    for (key, leaf) in [10u8, 20, 30].into_iter().zip(&leaves) {
        assert!(node.write_child(&pool, key, *leaf));
    }

    assert_eq!(node.num_children(), 3);
    assert_eq!(
        node.children_between(15, 30),
        vec![(20, leaves[1]), (30, leaves[2])]
    );
    assert_eq!(node.second_child(10), None);

    node.remove_child(&pool, 30);
    assert_eq!(node.second_child(10), Some((20, leaves[1])));
    assert!(node.should_shrink());
}
