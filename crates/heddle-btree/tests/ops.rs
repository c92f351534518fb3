//! Operation-level tests: lookups, callbacks, undo, lifecycle

use heddle_btree::{
    Btree, BtreeDomain, BtreeErrorKind, MemoryCaptureSink, NullSink, OpFlags, OpStatus, SlotVal,
    TreeOpts, Tx,
};
use heddle_seg::{MemorySegment, Segment};
use std::sync::Arc;

fn k(n: u64) -> [u8; 8] {
    n.to_be_bytes()
}

fn v(n: u64) -> [u8; 8] {
    n.to_le_bytes()
}

async fn small_tree() -> (Arc<BtreeDomain>, MemorySegment, Btree<MemorySegment>) {
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(Arc::clone(&domain), seg.clone(), TreeOpts::new(10, 8, 8))
        .await
        .unwrap();
    (domain, seg, tree)
}

fn tx() -> Tx<NullSink> {
    Tx::new(NullSink)
}

#[tokio::test]
async fn put_then_get() {
    let (_d, _s, tree) = small_tree().await;
    let tx = tx();
    for n in [3u64, 1, 2] {
        let rec = tree.insert(&k(n), &v(n), &tx).await.unwrap();
        assert_eq!(rec.status, OpStatus::Success);
    }
    for n in [1u64, 2, 3] {
        assert_eq!(tree.lookup(&k(n)).await.unwrap().as_deref(), Some(&v(n)[..]));
    }
    assert_eq!(tree.lookup(&k(9)).await.unwrap(), None);
    tree.verify().await.unwrap();
}

#[tokio::test]
async fn put_existing_reports_key_exists() {
    let (_d, _s, tree) = small_tree().await;
    let tx = tx();
    tree.insert(&k(7), &v(7), &tx).await.unwrap();
    let rec = tree.insert(&k(7), &v(99), &tx).await.unwrap();
    assert_eq!(rec.status, OpStatus::KeyExists);
    // Nothing was mutated.
    assert_eq!(tree.lookup(&k(7)).await.unwrap().as_deref(), Some(&v(7)[..]));
}

#[tokio::test]
async fn delete_is_idempotent_by_status() {
    let (_d, _s, tree) = small_tree().await;
    let tx = tx();
    tree.insert(&k(5), &v(5), &tx).await.unwrap();

    let rec = tree.remove(&k(9), &tx).await.unwrap();
    assert_eq!(rec.status, OpStatus::KeyNotFound);

    let rec = tree.remove(&k(5), &tx).await.unwrap();
    assert_eq!(rec.status, OpStatus::Success);
    assert_eq!(rec.val.as_ref(), &v(5)[..]);

    let rec = tree.remove(&k(5), &tx).await.unwrap();
    assert_eq!(rec.status, OpStatus::KeyNotFound);
}

#[tokio::test]
async fn get_callback_sees_frame_bytes() {
    let (_d, _s, tree) = small_tree().await;
    let tx = tx();
    tree.insert(&k(11), &v(42), &tx).await.unwrap();

    let mut seen = Vec::new();
    let rec = tree
        .get(
            &k(11),
            |slot| {
                if let SlotVal::Read(val) = slot.val {
                    seen.extend_from_slice(val);
                }
                Ok(())
            },
            OpFlags::EQUAL,
            None,
        )
        .await
        .unwrap();
    assert_eq!(rec.status, OpStatus::Success);
    assert_eq!(seen, v(42));
}

#[tokio::test]
async fn put_callback_error_is_fully_undone() {
    let (_d, _s, tree) = small_tree().await;
    let tx = tx();
    for n in 0..8u64 {
        tree.insert(&k(n * 2), &v(n), &tx).await.unwrap();
    }

    let err = tree
        .put(
            &k(5),
            |_| Err("caller changed its mind".into()),
            OpFlags::NONE,
            None,
            &tx,
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), BtreeErrorKind::Callback);

    assert_eq!(tree.lookup(&k(5)).await.unwrap(), None);
    tree.verify().await.unwrap();
    // The slot is insertable again after the undo.
    tree.insert(&k(5), &v(5), &tx).await.unwrap();
    assert_eq!(tree.lookup(&k(5)).await.unwrap().as_deref(), Some(&v(5)[..]));
}

#[tokio::test]
async fn put_callback_error_undoes_a_split() {
    // 512-byte nodes with 8+104-byte records: four records per leaf.
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(domain, seg, TreeOpts::new(9, 8, 104))
        .await
        .unwrap();
    let tx = tx();
    let val = [7u8; 104];
    for n in 0..4u64 {
        tree.insert(&k(n), &val, &tx).await.unwrap();
    }
    assert_eq!(tree.height(), 1);

    // The fifth record forces a root split; failing the callback must put
    // everything back.
    let err = tree
        .put(&k(4), |_| Err("no".into()), OpFlags::NONE, None, &tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), BtreeErrorKind::Callback);
    assert_eq!(tree.height(), 1);
    tree.verify().await.unwrap();
    for n in 0..4u64 {
        assert_eq!(tree.lookup(&k(n)).await.unwrap().as_deref(), Some(&val[..]));
    }

    // And the same insert succeeds when the callback cooperates.
    tree.insert(&k(4), &val, &tx).await.unwrap();
    assert_eq!(tree.height(), 2);
    tree.verify().await.unwrap();
}

#[tokio::test]
async fn del_callback_error_vetoes_the_delete() {
    let (_d, _s, tree) = small_tree().await;
    let tx = tx();
    tree.insert(&k(1), &v(1), &tx).await.unwrap();

    let err = tree
        .del(&k(1), |_| Err("keep it".into()), OpFlags::NONE, None, &tx)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), BtreeErrorKind::Callback);
    assert_eq!(tree.lookup(&k(1)).await.unwrap().as_deref(), Some(&v(1)[..]));
}

#[tokio::test]
async fn iteration_walks_both_ways() {
    let (_d, _s, tree) = small_tree().await;
    let tx = tx();
    for n in [10u64, 20, 30, 40] {
        tree.insert(&k(n), &v(n), &tx).await.unwrap();
    }

    let (nk, _) = tree.next(&k(10)).await.unwrap().unwrap();
    assert_eq!(nk.as_ref(), &k(20)[..]);
    let (nk, _) = tree.next(&k(15)).await.unwrap().unwrap();
    assert_eq!(nk.as_ref(), &k(20)[..]);
    assert!(tree.next(&k(40)).await.unwrap().is_none());

    let (pk, _) = tree.prev(&k(40)).await.unwrap().unwrap();
    assert_eq!(pk.as_ref(), &k(30)[..]);
    let (pk, _) = tree.prev(&k(15)).await.unwrap().unwrap();
    assert_eq!(pk.as_ref(), &k(10)[..]);
    assert!(tree.prev(&k(10)).await.unwrap().is_none());
}

#[tokio::test]
async fn empty_tree_edges() {
    let (_d, _s, tree) = small_tree().await;
    assert_eq!(tree.lookup(&k(1)).await.unwrap(), None);
    assert!(tree.next(&k(0)).await.unwrap().is_none());
    assert!(tree.prev(&k(9)).await.unwrap().is_none());
    let rec = tree.remove(&k(1), &tx()).await.unwrap();
    assert_eq!(rec.status, OpStatus::KeyNotFound);
}

#[tokio::test]
async fn wrong_key_length_is_rejected() {
    let (_d, _s, tree) = small_tree().await;
    let err = tree.lookup(b"short").await.unwrap_err();
    assert_eq!(err.kind(), BtreeErrorKind::InvalidKey);
}

#[tokio::test]
async fn cookie_skips_the_descent() {
    let (_d, _s, tree) = small_tree().await;
    let tx = tx();
    for n in 0..32u64 {
        tree.insert(&k(n), &v(n), &tx).await.unwrap();
    }
    let rec = tree.get(&k(10), |_| Ok(()), OpFlags::EQUAL, None).await.unwrap();
    let cookie = rec.cookie.expect("leaf cookie");

    // An untouched leaf validates the cookie and skips straight to Lock.
    let rec = tree
        .get(&k(11), |_| Ok(()), OpFlags::COOKIE, Some(cookie))
        .await
        .unwrap();
    assert_eq!(rec.status, OpStatus::Success);
    assert_eq!(rec.val.as_ref(), &v(11)[..]);
    assert_eq!(rec.restarts, 0);

    // A mutation invalidates it; the operation falls back to a descent.
    tree.insert(&k(100), &v(100), &tx).await.unwrap();
    let rec = tree
        .get(&k(11), |_| Ok(()), OpFlags::COOKIE, Some(cookie))
        .await
        .unwrap();
    assert_eq!(rec.status, OpStatus::Success);
}

#[tokio::test]
async fn open_shares_the_descriptor() {
    let (domain, seg, tree) = small_tree().await;
    let root = tree.root_addr();
    let again = Btree::open(Arc::clone(&domain), seg.clone(), root)
        .await
        .unwrap();
    assert_eq!(domain.open_trees(), 1);
    assert_eq!(again.root_addr(), root);

    again.close().await.unwrap();
    assert_eq!(domain.open_trees(), 1);
    tree.close().await.unwrap();
    assert_eq!(domain.open_trees(), 0);
}

#[tokio::test]
async fn reopen_reads_geometry_from_the_root() {
    let domain = BtreeDomain::new();
    let seg = MemorySegment::new();
    let tree = Btree::create(Arc::clone(&domain), seg.clone(), TreeOpts::new(11, 8, 16))
        .await
        .unwrap();
    let tx = tx();
    tree.insert(&k(1), &[9u8; 16], &tx).await.unwrap();
    let root = tree.root_addr();
    tree.close().await.unwrap();

    let tree = Btree::open(domain, seg, root).await.unwrap();
    assert_eq!(tree.lookup(&k(1)).await.unwrap().as_deref(), Some(&[9u8; 16][..]));
    tree.verify().await.unwrap();
}

#[tokio::test]
async fn destroy_requires_an_empty_root() {
    let (domain, seg, tree) = small_tree().await;
    let tx = tx();
    tree.insert(&k(1), &v(1), &tx).await.unwrap();

    let err = tree.clone().destroy().await.unwrap_err();
    assert_eq!(err.kind(), BtreeErrorKind::NotEmpty);

    tree.remove(&k(1), &tx).await.unwrap();
    // The clone above still holds a reference.
    let err = tree.clone().destroy().await.unwrap_err();
    assert_eq!(err.kind(), BtreeErrorKind::NotEmpty);

    // Collapse to a single handle, then destroy for real.
    let root = tree.root_addr();
    let handle = tree.clone();
    tree.close().await.unwrap();
    handle.close().await.unwrap();
    let tree = Btree::open(Arc::clone(&domain), seg.clone(), root)
        .await
        .unwrap();
    tree.destroy().await.unwrap();
    assert_eq!(domain.open_trees(), 0);
    assert!(!seg.contains(root));
}

#[tokio::test]
async fn purge_reclaims_idle_descriptors() {
    let (domain, _s, tree) = small_tree().await;
    let tx = tx();
    for n in 0..256u64 {
        tree.insert(&k(n), &v(n), &tx).await.unwrap();
    }
    // Release the transaction pins so the LRU is actually reclaimable.
    tx.commit();
    let idle = domain.lru_len();
    assert!(idle > 0, "finished operations park descriptors on the LRU");

    let evicted = domain.purge_lru(2);
    assert_eq!(evicted, 2);
    assert_eq!(domain.lru_len(), idle - 2);

    // Purged nodes revive transparently on the next access.
    for n in 0..256u64 {
        assert_eq!(tree.lookup(&k(n)).await.unwrap().as_deref(), Some(&v(n)[..]));
    }
}

#[tokio::test]
async fn tx_pins_survive_until_commit() {
    let (domain, _s, tree) = small_tree().await;
    let sink = MemoryCaptureSink::new();
    let tx = Tx::new(sink);
    for n in 0..64u64 {
        tree.insert(&k(n), &v(n), &tx).await.unwrap();
    }
    let idle = domain.lru_len();
    // Every idle descriptor this tx touched is pinned against eviction.
    let evicted = domain.purge_lru(usize::MAX);
    assert!(evicted < idle || idle == 0);

    tx.commit();
    let freed = domain.purge_lru(usize::MAX);
    assert_eq!(domain.lru_len(), 0);
    let _ = freed;
}

#[tokio::test]
async fn lockall_flag_still_serves_reads_and_writes() {
    let (_d, _s, tree) = small_tree().await;
    let tx = tx();
    for n in 0..16u64 {
        let rec = tree
            .put(
                &k(n),
                |slot| {
                    if let SlotVal::Write(buf) = &mut slot.val {
                        buf.copy_from_slice(&v(n));
                    }
                    Ok(())
                },
                OpFlags::LOCKALL,
                None,
                &tx,
            )
            .await
            .unwrap();
        assert_eq!(rec.status, OpStatus::Success);
    }
    let rec = tree
        .get(&k(5), |_| Ok(()), OpFlags::LOCKALL | OpFlags::EQUAL, None)
        .await
        .unwrap();
    assert_eq!(rec.val.as_ref(), &v(5)[..]);
}
