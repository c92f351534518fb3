//! End-to-end scenarios: growth, interleaved streams, collapse, slant,
//! contention, capture replay

use heddle_btree::{
    Btree, BtreeDomain, MemoryCaptureSink, NullSink, OpFlags, OpStatus, TreeOpts, Tx, MAX_TRIALS,
};
use heddle_seg::MemorySegment;
use rand::seq::SliceRandom;
use std::sync::Arc;

fn k(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

fn v(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

fn tx() -> Tx<NullSink> {
    Tx::new(NullSink)
}

/// Enumerate every record in key order via slant + successor walking
async fn collect_all(tree: &Btree<MemorySegment>) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    let first = tree
        .get(&[0u8; 8], |_| Ok(()), OpFlags::SLANT, None)
        .await
        .unwrap();
    if first.status != OpStatus::Success {
        return out;
    }
    out.push((first.key.to_vec(), first.val.to_vec()));
    let mut cursor = first.key.to_vec();
    while let Some((nk, nv)) = tree.next(&cursor).await.unwrap() {
        cursor = nk.to_vec();
        out.push((nk.to_vec(), nv.to_vec()));
    }
    out
}

/// S1: basic PUT/GET over a couple thousand keys in random order
#[tokio::test]
async fn s1_random_put_get() {
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(domain, seg, TreeOpts::new(10, 8, 8))
        .await
        .unwrap();
    let tx = tx();

    let mut keys: Vec<u64> = (0..2048).collect();
    keys.shuffle(&mut rand::thread_rng());
    for &n in &keys {
        let rec = tree.insert(&k(n), &v(n), &tx).await.unwrap();
        assert_eq!(rec.status, OpStatus::Success);
    }

    tree.verify().await.unwrap();
    assert!(tree.height() >= 2);
    for n in 0..2048u64 {
        assert_eq!(
            tree.lookup(&k(n)).await.unwrap().as_deref(),
            Some(&v(n)[..]),
            "key {} lost",
            n
        );
    }
}

/// S2: interleaved disjoint streams, then a full ordered enumeration
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s2_multi_stream_interleave() {
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(domain, seg, TreeOpts::new(10, 8, 8))
        .await
        .unwrap();

    const STREAMS: u64 = 8;
    const PER_STREAM: u64 = 256;

    let mut tasks = Vec::new();
    for s in 0..STREAMS {
        let handle = tree.clone();
        tasks.push(tokio::spawn(async move {
            let tx = Tx::new(NullSink);
            for i in 1..=PER_STREAM {
                let key = s * 100_000 + i;
                let rec = handle.insert(&k(key), &v(key), &tx).await.unwrap();
                assert_eq!(rec.status, OpStatus::Success);
            }
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }

    tree.verify().await.unwrap();
    let all = collect_all(&tree).await;
    assert_eq!(all.len(), (STREAMS * PER_STREAM) as usize);
    for pair in all.windows(2) {
        assert!(pair[0].0 < pair[1].0, "enumeration must be strictly increasing");
    }
}

/// S3: grow through a root split, then delete back down to an empty root
#[tokio::test]
async fn s3_root_split_and_demotion() {
    // 512-byte nodes, 8+104-byte records: exactly four records per leaf.
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(domain, seg, TreeOpts::new(9, 8, 104))
        .await
        .unwrap();
    let tx = tx();
    let val = [3u8; 104];

    for n in 1..=17u64 {
        tree.insert(&k(n), &val, &tx).await.unwrap();
        tree.verify().await.unwrap();
    }
    assert!(tree.height() >= 2, "17 records cannot fit one leaf");

    for n in (1..=17u64).rev() {
        let rec = tree.remove(&k(n), &tx).await.unwrap();
        assert_eq!(rec.status, OpStatus::Success);
        tree.verify().await.unwrap();
    }
    assert_eq!(tree.height(), 1);
    assert!(collect_all_empty(&tree).await);
}

async fn collect_all_empty(tree: &Btree<MemorySegment>) -> bool {
    let rec = tree
        .get(&[0u8; 8], |_| Ok(()), OpFlags::SLANT, None)
        .await
        .unwrap();
    rec.status == OpStatus::KeyBtreeBoundary
}

/// S4: slant returns the key or its successor, and the boundary past the
/// greatest key
#[tokio::test]
async fn s4_slant() {
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(domain, seg, TreeOpts::new(10, 8, 8))
        .await
        .unwrap();
    let tx = tx();
    for n in [5u64, 10, 15, 20] {
        tree.insert(&k(n), &v(n), &tx).await.unwrap();
    }

    let rec = tree.get(&k(7), |_| Ok(()), OpFlags::SLANT, None).await.unwrap();
    assert_eq!(rec.status, OpStatus::Success);
    assert_eq!(rec.key.as_ref(), &k(10)[..]);
    assert_eq!(rec.val.as_ref(), &v(10)[..]);

    let rec = tree.get(&k(20), |_| Ok(()), OpFlags::SLANT, None).await.unwrap();
    assert_eq!(rec.status, OpStatus::Success);
    assert_eq!(rec.key.as_ref(), &k(20)[..]);
    assert_eq!(rec.val.as_ref(), &v(20)[..]);

    let rec = tree.get(&k(25), |_| Ok(()), OpFlags::SLANT, None).await.unwrap();
    assert_eq!(rec.status, OpStatus::KeyBtreeBoundary);
}

/// S4 continued: slant crosses a leaf boundary through the pivot descent
#[tokio::test]
async fn s4_slant_across_leaves() {
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(domain, seg, TreeOpts::new(9, 8, 104))
        .await
        .unwrap();
    let tx = tx();
    let val = [1u8; 104];
    // Even keys only, enough to split into several leaves.
    for n in 1..=12u64 {
        tree.insert(&k(n * 2), &val, &tx).await.unwrap();
    }
    assert!(tree.height() >= 2);

    for n in 1..12u64 {
        let probe = n * 2 + 1; // falls between stored keys
        let rec = tree
            .get(&k(probe), |_| Ok(()), OpFlags::SLANT, None)
            .await
            .unwrap();
        assert_eq!(rec.status, OpStatus::Success, "probe {}", probe);
        assert_eq!(rec.key.as_ref(), &k((n + 1) * 2)[..], "probe {}", probe);
    }
}

/// S5: concurrent writers with overlapping descent paths stay
/// linearizable and bounded by the escalation protocol
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn s5_contended_writers_escalate_and_finish() {
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(domain, seg, TreeOpts::new(10, 8, 8))
        .await
        .unwrap();

    const WRITERS: u64 = 2;
    const PER_WRITER: u64 = 300;

    let mut tasks = Vec::new();
    for w in 0..WRITERS {
        let handle = tree.clone();
        tasks.push(tokio::spawn(async move {
            let tx = Tx::new(NullSink);
            let mut max_restarts = 0;
            // Interleaved keys keep both writers on the same leaves.
            for i in 0..PER_WRITER {
                let key = i * WRITERS + w;
                let rec = handle.insert(&k(key), &v(key), &tx).await.unwrap();
                assert_eq!(rec.status, OpStatus::Success);
                max_restarts = max_restarts.max(rec.restarts);
            }
            max_restarts
        }));
    }
    for t in tasks {
        let max_restarts = t.await.unwrap();
        assert!(
            max_restarts <= MAX_TRIALS,
            "an operation restarted {} times without escalating",
            max_restarts
        );
    }

    tree.verify().await.unwrap();
    for n in 0..WRITERS * PER_WRITER {
        assert_eq!(tree.lookup(&k(n)).await.unwrap().as_deref(), Some(&v(n)[..]));
    }
}

/// S6: replaying the capture stream against a blank segment reproduces
/// the live tree
#[tokio::test]
async fn s6_capture_replay_rebuilds_the_tree() {
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let sink = MemoryCaptureSink::new();
    let tx = Tx::new(sink.clone());

    let tree = Btree::create_in(
        Arc::clone(&domain),
        seg.clone(),
        TreeOpts::new(9, 8, 8),
        &tx,
    )
    .await
    .unwrap();

    let mut keys: Vec<u64> = (1..=300).collect();
    keys.shuffle(&mut rand::thread_rng());
    for &n in &keys {
        tree.insert(&k(n), &v(n), &tx).await.unwrap();
    }
    // Deletions exercise collapse captures too.
    for n in (1..=300u64).filter(|n| n % 3 == 0) {
        tree.remove(&k(n), &tx).await.unwrap();
    }
    tx.commit();
    assert!(!sink.is_empty());

    tree.verify().await.unwrap();
    let live = collect_all(&tree).await;
    let root = tree.root_addr();
    let height = tree.height();

    // Rebuild from nothing but the capture stream.
    let blank = MemorySegment::new();
    sink.replay(&blank).unwrap();
    let domain2 = BtreeDomain::new();
    let replayed = Btree::open(domain2, blank, root).await.unwrap();
    replayed.verify().await.unwrap();
    assert_eq!(replayed.height(), height);
    let rebuilt = collect_all(&replayed).await;
    assert_eq!(live, rebuilt);
}

/// Mixed random churn holds the shape and order invariants throughout
#[tokio::test]
async fn random_churn_stays_consistent() {
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(domain, seg, TreeOpts::new(9, 8, 8))
        .await
        .unwrap();
    let tx = tx();

    let mut present = std::collections::BTreeSet::new();
    let mut rng = rand::thread_rng();
    let mut ops: Vec<u64> = (0..600).collect();
    ops.shuffle(&mut rng);

    for (step, n) in ops.iter().enumerate() {
        let key = n % 120;
        if present.contains(&key) {
            let rec = tree.remove(&k(key), &tx).await.unwrap();
            assert_eq!(rec.status, OpStatus::Success);
            present.remove(&key);
        } else {
            let rec = tree.insert(&k(key), &v(key), &tx).await.unwrap();
            assert_eq!(rec.status, OpStatus::Success);
            present.insert(key);
        }
        if step % 50 == 0 {
            tree.verify().await.unwrap();
        }
    }

    tree.verify().await.unwrap();
    let all = collect_all(&tree).await;
    assert_eq!(all.len(), present.len());
    for ((got, _), want) in all.iter().zip(present.iter()) {
        assert_eq!(got.as_slice(), &k(*want)[..]);
    }
}
