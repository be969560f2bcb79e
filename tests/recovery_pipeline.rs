//! Peer-driven repair: disk read, fetch-and-compute and persist chained
//! across three workers.

mod common;

use common::*;
use ecworker::backend::ObjectBackend;
use ecworker::ec::gf;
use ecworker::staging::{keys, Location, MemoryCluster};
use ecworker::{Command, Packet};

const PACKET: usize = 16 * 1024;
const SLICE: usize = PACKET / 2;

#[test]
fn test_slices_flow_from_disk_to_rebuilt_object() {
    let cluster = MemoryCluster::new();
    let (holder, holder_backend) = worker(&cluster, "node-a", PACKET);
    let (combiner, _) = worker(&cluster, "node-b", PACKET);
    let (owner, owner_backend) = worker(&cluster, "node-c", PACKET);
    let node_a = Location::from("node-a");
    let node_b = Location::from("node-b");

    let original = file_bytes(4 * PACKET, 77);
    holder_backend.create("frag").unwrap();
    holder_backend.append("frag", &original).unwrap();

    // slice 0 of every packet to column 0, slice 1 to column 1 twice
    holder
        .handle(Command::DiskRead {
            stripe: "st".into(),
            object: "frag".into(),
            w: 2,
            packets: 4,
            columns: vec![0, 1],
            refs: vec![(1, 2)],
        })
        .unwrap();
    let staged = cluster.node(&node_a);
    assert_eq!(staged.len(&keys::slice("st", 0, 3)), 1);
    assert_eq!(staged.len(&keys::slice("st", 1, 3)), 2);

    // column 5 = slice0 + 3·slice1
    combiner
        .handle(Command::FetchCompute {
            stripe: "st".into(),
            w: 2,
            packets: 4,
            sources: vec![(0, node_a.clone()), (1, node_a.clone())],
            coefficients: vec![(5, vec![1, 3])],
            refs: vec![],
        })
        .unwrap();
    assert_eq!(cluster.node(&node_b).len(&keys::slice("st", 5, 0)), 1);
    assert_eq!(combiner.metrics().stripes_computed(), 4);

    owner
        .handle(Command::Persist {
            stripe: "st".into(),
            object: "rebuilt".into(),
            packets: 4,
            sources: vec![(1, node_a), (5, node_b)],
        })
        .unwrap();
    assert_eq!(
        pop_u32(&cluster.node(&Location::from("node-c")), &keys::write_finish("rebuilt")),
        1
    );

    let mut expected = Vec::new();
    for packet in original.chunks(PACKET) {
        let (s0, s1) = packet.split_at(SLICE);
        let combined: Vec<u8> = s0.iter().zip(s1).map(|(&a, &b)| a ^ gf::mul(3, b)).collect();
        expected.extend_from_slice(s1);
        expected.extend_from_slice(&combined);
    }
    assert_eq!(owner_backend.contents("rebuilt").unwrap(), expected);
    assert_eq!(owner.metrics().packets_persisted(), 8);
}

#[test]
fn test_fetch_compute_replicates_outputs() {
    let cluster = MemoryCluster::new();
    let (combiner, _) = worker(&cluster, "node-b", PACKET);
    let peer = Location::from("peer");
    for i in 0..2 {
        cluster.node(&peer).push(
            &keys::slice("x", 0, i),
            Packet::from_slice(&[i as u8 + 1; SLICE]).encode(),
            1,
        );
    }

    combiner
        .handle(Command::FetchCompute {
            stripe: "x".into(),
            w: 2,
            packets: 2,
            sources: vec![(0, peer)],
            coefficients: vec![(7, vec![1]), (8, vec![2])],
            refs: vec![(8, 3)],
        })
        .unwrap();

    let local = cluster.node(&Location::from("node-b"));
    assert_eq!(local.len(&keys::slice("x", 7, 1)), 1);
    assert_eq!(local.len(&keys::slice("x", 8, 1)), 3);
    let raw = local.pop(&keys::slice("x", 8, 1), None).unwrap();
    assert_eq!(Packet::decode(&raw).unwrap().data(), &[gf::mul(2, 2); SLICE][..]);
}

#[test]
fn test_coefficient_count_must_match_sources() {
    let cluster = MemoryCluster::new();
    let (combiner, _) = worker(&cluster, "node-b", PACKET);
    let result = combiner.handle(Command::FetchCompute {
        stripe: "bad".into(),
        w: 1,
        packets: 1,
        sources: vec![(0, Location::from("p"))],
        coefficients: vec![(1, vec![1, 2])],
        refs: vec![],
    });
    assert!(matches!(result, Err(ecworker::Error::Protocol(_))));
}
