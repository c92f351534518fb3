//! PUT: makespace, splitting, promotion, undo

use super::*;
use crate::format::{MoveEnd, MoveQuota};

impl<'a, S, C> OpExec<'a, S, C>
where
    S: Segment + Sync + 'static,
    C: CaptureSink + Sync,
{
    /// Open the record slot, splitting the leaf (or the root) when full
    ///
    /// Only the leaf level is touched here; promotions ascend in
    /// `propagate_put` after the callback has committed to the record, so
    /// a callback failure never has to unwind parent levels.
    pub(super) fn makespace(&mut self) -> Result<Phase> {
        let leaf_i = self.leaf_index();
        let leaf = Arc::clone(self.levels[leaf_i].node.as_ref().unwrap());
        let fmt = Arc::clone(self.fmt());
        let geom = self.tree.td().geom();

        let overflow = fmt.isoverflow(&leaf.frame().bytes());
        if !overflow {
            let idx = self.levels[leaf_i].idx;
            let zeros = vec![0u8; geom.vsize as usize];
            let spans = {
                let frame = Arc::clone(leaf.frame());
                let mut buf = frame.bytes_mut();
                let mut spans = fmt.make(&mut buf[..], idx);
                spans.extend(fmt.set_rec(&mut buf[..], idx, &self.key, &zeros));
                spans
            };
            self.mark_dirty(&leaf, spans);
            self.act_slot = Some((Arc::clone(&leaf), idx));
            self.undo = Some(UndoPlan::Make(leaf, idx));
            return Ok(Phase::Act);
        }

        // A split needs the full descent stack; a cookie hit that went
        // stale enough to overflow re-descends instead.
        if self.cookie_only {
            return self.restart();
        }
        if leaf_i == 0 {
            self.root_split(None)?;
        } else {
            self.split_leaf()?;
        }
        Ok(Phase::Act)
    }

    /// Split a non-root leaf into its reserved spare
    ///
    /// The spare becomes the left sibling (it takes the low half), so the
    /// parent insertion pairs the right node's new first key with the
    /// spare's address and every existing parent slot stays correct.
    fn split_leaf(&mut self) -> Result<()> {
        let leaf_i = self.leaf_index();
        let leaf = Arc::clone(self.levels[leaf_i].node.as_ref().unwrap());
        let spare = self.levels[leaf_i]
            .alloc
            .take()
            .ok_or_else(|| BtreeError::no_memory("leaf spare"))?;
        let fmt = Arc::clone(self.fmt());
        let geom = self.tree.td().geom();
        let zeros = vec![0u8; geom.vsize as usize];

        let (leaf_spans, spare_spans, act, promote) = {
            let lf = Arc::clone(leaf.frame());
            let sf = Arc::clone(spare.frame());
            let mut lb = lf.bytes_mut();
            let mut sb = sf.bytes_mut();

            let mut sspans = fmt.init(&mut sb[..], geom.shift, 0, geom.ksize, geom.vsize, geom.ttype);
            let mv = fmt.move_recs(&mut lb[..], &mut sb[..], MoveEnd::Front, MoveQuota::Even);
            let mut lspans = mv.src_spans;
            sspans.extend(mv.tgt_spans);

            let into_spare = self.key.as_ref() < fmt.key(&lb[..], 0);
            let (idx, act_desc) = if into_spare {
                let (idx, _) = fmt.find(&sb[..], &self.key);
                sspans.extend(fmt.make(&mut sb[..], idx));
                sspans.extend(fmt.set_rec(&mut sb[..], idx, &self.key, &zeros));
                (idx, Arc::clone(&spare))
            } else {
                let (idx, _) = fmt.find(&lb[..], &self.key);
                lspans.extend(fmt.make(&mut lb[..], idx));
                lspans.extend(fmt.set_rec(&mut lb[..], idx, &self.key, &zeros));
                (idx, Arc::clone(&leaf))
            };

            let promote = (fmt.key(&lb[..], 0).to_vec(), spare.addr());
            (lspans, sspans, (act_desc, idx), promote)
        };

        self.mark_dirty(&leaf, leaf_spans);
        self.mark_dirty(&spare, spare_spans);
        self.act_slot = Some((Arc::clone(&act.0), act.1));
        self.promote = Some(promote);
        self.undo = Some(UndoPlan::Split {
            leaf,
            spare: Arc::clone(&spare),
            inserted: act,
        });
        self.consumed.push(spare);
        tracing::debug!(level = 0, "leaf split");
        Ok(())
    }

    /// Split an internal level into its reserved spare
    ///
    /// The record at the split boundary dissolves: its child becomes the
    /// left node's sentinel and its key is the promoted key.
    fn split_internal(&mut self, i: usize, pk: Vec<u8>, paddr: Addr) -> Result<()> {
        let parent = Arc::clone(self.levels[i].node.as_ref().unwrap());
        let spare = self.levels[i]
            .alloc
            .take()
            .ok_or_else(|| BtreeError::no_memory("internal spare"))?;
        let fmt = Arc::clone(self.fmt());
        let geom = self.tree.td().geom();

        let (pspans, sspans, promote) = {
            let pf = Arc::clone(parent.frame());
            let sf = Arc::clone(spare.frame());
            let mut pb = pf.bytes_mut();
            let mut sb = sf.bytes_mut();

            let lvl = fmt.level(&pb[..]);
            let mut sspans =
                fmt.init(&mut sb[..], geom.shift, lvl, geom.ksize, geom.vsize, geom.ttype);
            let mv = fmt.move_recs(&mut pb[..], &mut sb[..], MoveEnd::Front, MoveQuota::Even);
            let mut pspans = mv.src_spans;
            sspans.extend(mv.tgt_spans);

            let bk = fmt.key(&pb[..], 0).to_vec();
            let bc = fmt.child(&pb[..], 0);
            let sent = fmt.count(&sb[..]);
            sspans.extend(fmt.set_child(&mut sb[..], sent, bc));
            pspans.extend(fmt.del(&mut pb[..], 0));

            let val = paddr.raw().to_le_bytes();
            if pk.as_slice() < bk.as_slice() {
                let (idx, _) = fmt.find(&sb[..], &pk);
                sspans.extend(fmt.make(&mut sb[..], idx));
                sspans.extend(fmt.set_rec(&mut sb[..], idx, &pk, &val));
            } else {
                let (idx, _) = fmt.find(&pb[..], &pk);
                pspans.extend(fmt.make(&mut pb[..], idx));
                pspans.extend(fmt.set_rec(&mut pb[..], idx, &pk, &val));
            }

            (pspans, sspans, (bk, spare.addr()))
        };

        self.mark_dirty(&parent, pspans);
        self.mark_dirty(&spare, sspans);
        self.promote = Some(promote);
        self.consumed.push(spare);
        tracing::debug!(level = i, "internal split");
        Ok(())
    }

    /// Split the root in place
    ///
    /// The root's frame address identifies the tree, so the old content
    /// moves out into `extra`, the extra/spare pair is split like any
    /// other level, and the root is rebuilt one level higher holding the
    /// promoted record and a sentinel pointing at `extra`.
    ///
    /// `pending` is the promotion arriving from below, or `None` when the
    /// root is itself the overflowing leaf and the user's key is the
    /// record being placed.
    pub(super) fn root_split(&mut self, pending: Option<(Vec<u8>, Addr)>) -> Result<()> {
        let root = Arc::clone(self.levels[0].node.as_ref().unwrap());
        let extra = self
            .extra
            .take()
            .ok_or_else(|| BtreeError::no_memory("root extra"))?;
        let spare = self.levels[0]
            .alloc
            .take()
            .ok_or_else(|| BtreeError::no_memory("root spare"))?;
        let fmt = Arc::clone(self.fmt());
        let geom = self.tree.td().geom();
        let is_leaf_pending = pending.is_none();

        let (root_spans, extra_spans, spare_spans, inserted) = {
            let rf = Arc::clone(root.frame());
            let ef = Arc::clone(extra.frame());
            let sf = Arc::clone(spare.frame());
            let mut rb = rf.bytes_mut();
            let mut eb = ef.bytes_mut();
            let mut sb = sf.bytes_mut();

            let rlevel = fmt.level(&rb[..]);

            // Old root content moves out into extra.
            let mut espans =
                fmt.init(&mut eb[..], geom.shift, rlevel, geom.ksize, geom.vsize, geom.ttype);
            let mv = fmt.move_recs(&mut rb[..], &mut eb[..], MoveEnd::Front, MoveQuota::Max);
            let mut rspans = mv.src_spans;
            espans.extend(mv.tgt_spans);
            if rlevel > 0 {
                let sent = fmt.child(&rb[..], 0);
                let eidx = fmt.count(&eb[..]);
                espans.extend(fmt.set_child(&mut eb[..], eidx, sent));
            }

            // Split extra into the spare and settle the pending record.
            let mut sspans =
                fmt.init(&mut sb[..], geom.shift, rlevel, geom.ksize, geom.vsize, geom.ttype);
            let mv = fmt.move_recs(&mut eb[..], &mut sb[..], MoveEnd::Front, MoveQuota::Even);
            espans.extend(mv.src_spans);
            sspans.extend(mv.tgt_spans);

            let mut inserted = None;
            let (promo_k, promo_v) = match pending {
                Some((pk, paddr)) => {
                    let bk = fmt.key(&eb[..], 0).to_vec();
                    let bc = fmt.child(&eb[..], 0);
                    let sent = fmt.count(&sb[..]);
                    sspans.extend(fmt.set_child(&mut sb[..], sent, bc));
                    espans.extend(fmt.del(&mut eb[..], 0));
                    let val = paddr.raw().to_le_bytes();
                    if pk.as_slice() < bk.as_slice() {
                        let (idx, _) = fmt.find(&sb[..], &pk);
                        sspans.extend(fmt.make(&mut sb[..], idx));
                        sspans.extend(fmt.set_rec(&mut sb[..], idx, &pk, &val));
                    } else {
                        let (idx, _) = fmt.find(&eb[..], &pk);
                        espans.extend(fmt.make(&mut eb[..], idx));
                        espans.extend(fmt.set_rec(&mut eb[..], idx, &pk, &val));
                    }
                    (bk, spare.addr())
                }
                None => {
                    let zeros = vec![0u8; geom.vsize as usize];
                    let into_spare = self.key.as_ref() < fmt.key(&eb[..], 0);
                    if into_spare {
                        let (idx, _) = fmt.find(&sb[..], &self.key);
                        sspans.extend(fmt.make(&mut sb[..], idx));
                        sspans.extend(fmt.set_rec(&mut sb[..], idx, &self.key, &zeros));
                        inserted = Some((Arc::clone(&spare), idx));
                    } else {
                        let (idx, _) = fmt.find(&eb[..], &self.key);
                        espans.extend(fmt.make(&mut eb[..], idx));
                        espans.extend(fmt.set_rec(&mut eb[..], idx, &self.key, &zeros));
                        inserted = Some((Arc::clone(&extra), idx));
                    }
                    (fmt.key(&eb[..], 0).to_vec(), spare.addr())
                }
            };

            // Rebuild the root one level higher: the promoted record on
            // the left, a sentinel carrying the old content on the right.
            rspans.extend(fmt.init(
                &mut rb[..],
                geom.shift,
                rlevel + 1,
                geom.ksize,
                geom.vsize,
                geom.ttype,
            ));
            rspans.extend(fmt.make(&mut rb[..], 0));
            rspans.extend(fmt.set_rec(&mut rb[..], 0, &promo_k, &promo_v.raw().to_le_bytes()));
            rspans.extend(fmt.set_child(&mut rb[..], 1, extra.addr().raw()));

            (rspans, espans, sspans, inserted)
        };

        self.mark_dirty(&root, root_spans);
        self.mark_dirty(&extra, extra_spans);
        self.mark_dirty(&spare, spare_spans);
        self.tree.td().set_height(self.height + 1);
        if is_leaf_pending {
            let inserted = inserted.expect("leaf pending places a record");
            self.act_slot = Some((Arc::clone(&inserted.0), inserted.1));
            self.undo = Some(UndoPlan::RootSplit {
                root,
                extra: Arc::clone(&extra),
                spare: Arc::clone(&spare),
                inserted,
            });
        }
        self.consumed.push(extra);
        self.consumed.push(spare);
        tracing::debug!(new_height = self.height + 1, "root split");
        Ok(())
    }

    /// Ascend pending promotions after the callback committed the record
    fn propagate_put(&mut self) -> Result<()> {
        let fmt = Arc::clone(self.fmt());
        let mut i = self.leaf_index();
        while let Some((pk, paddr)) = self.promote.take() {
            debug_assert!(i > 0);
            i -= 1;
            let parent = Arc::clone(self.levels[i].node.as_ref().unwrap());
            let overflow = fmt.isoverflow(&parent.frame().bytes());
            if !overflow {
                let spans = {
                    let pf = Arc::clone(parent.frame());
                    let mut pb = pf.bytes_mut();
                    let (idx, found) = fmt.find(&pb[..], &pk);
                    debug_assert!(!found);
                    let mut spans = fmt.make(&mut pb[..], idx);
                    spans.extend(fmt.set_rec(&mut pb[..], idx, &pk, &paddr.raw().to_le_bytes()));
                    spans
                };
                self.mark_dirty(&parent, spans);
            } else if i == 0 {
                self.root_split(Some((pk, paddr)))?;
            } else {
                self.split_internal(i, pk, paddr)?;
            }
        }
        Ok(())
    }

    /// Invoke the fill callback on the prepared slot and finish the PUT
    pub(super) async fn act_put(&mut self) -> Result<Phase> {
        let leaf_i = self.leaf_index();
        let fmt = Arc::clone(self.fmt());

        if self.levels[leaf_i].found {
            // Existing key: the callback sees the live record, nothing
            // is mutated.
            let leaf = Arc::clone(self.levels[leaf_i].node.as_ref().unwrap());
            let idx = self.levels[leaf_i].idx;
            let cb_res = {
                let buf = leaf.frame().bytes();
                let mut slot = RecSlot {
                    key: fmt.key(&buf, idx),
                    val: SlotVal::Read(fmt.val(&buf, idx)),
                    status: OpStatus::KeyExists,
                };
                let res = (self.cb)(&mut slot);
                if res.is_ok() {
                    self.out_key = Bytes::copy_from_slice(fmt.key(&buf, idx));
                    self.out_val = Bytes::copy_from_slice(fmt.val(&buf, idx));
                }
                res
            };
            self.guard = None;
            cb_res.map_err(BtreeError::callback)?;
            self.status = OpStatus::KeyExists;
            self.cookie_out = Some(Cookie {
                addr: leaf.addr(),
                seq: leaf.seq(),
            });
            return Ok(Phase::Cleanup);
        }

        let (tdesc, tidx) = self
            .act_slot
            .clone()
            .ok_or_else(|| BtreeError::no_memory("record slot"))?;
        let cb_res = {
            let frame = Arc::clone(tdesc.frame());
            let mut buf = frame.bytes_mut();
            let (key, val) = fmt.rec_mut(&mut buf[..], tidx);
            let mut slot = RecSlot {
                key,
                val: SlotVal::Write(val),
                status: OpStatus::Success,
            };
            (self.cb)(&mut slot)
        };

        match cb_res {
            Err(e) => {
                self.undo_put();
                self.guard = None;
                Err(BtreeError::callback(e))
            }
            Ok(()) => {
                {
                    let buf = tdesc.frame().bytes();
                    self.out_key = Bytes::copy_from_slice(fmt.key(&buf, tidx));
                    self.out_val = Bytes::copy_from_slice(fmt.val(&buf, tidx));
                }
                self.undo = None;
                self.propagate_put()?;
                self.flush_captures().await?;
                self.cookie_out = Some(Cookie {
                    addr: tdesc.addr(),
                    seq: tdesc.seq(),
                });
                self.status = OpStatus::Success;
                self.guard = None;
                Ok(Phase::Cleanup)
            }
        }
    }

    /// Fully undo MAKESPACE after a callback failure
    fn undo_put(&mut self) {
        let fmt = Arc::clone(self.fmt());
        let geom = self.tree.td().geom();
        match self.undo.take() {
            Some(UndoPlan::Make(desc, idx)) => {
                {
                    let frame = Arc::clone(desc.frame());
                    let mut buf = frame.bytes_mut();
                    fmt.del(&mut buf[..], idx);
                }
                desc.bump_seq();
            }
            Some(UndoPlan::Split {
                leaf,
                spare,
                inserted: (idesc, iidx),
            }) => {
                {
                    let f = Arc::clone(idesc.frame());
                    let mut b = f.bytes_mut();
                    fmt.del(&mut b[..], iidx);
                }
                {
                    let lf = Arc::clone(leaf.frame());
                    let sf = Arc::clone(spare.frame());
                    let mut lb = lf.bytes_mut();
                    let mut sb = sf.bytes_mut();
                    fmt.move_recs(&mut sb[..], &mut lb[..], MoveEnd::Back, MoveQuota::Max);
                    fmt.fini(&mut sb[..]);
                }
                leaf.bump_seq();
                spare.bump_seq();
                self.consumed.retain(|d| !Arc::ptr_eq(d, &spare));
                self.spare_pool.push(spare);
            }
            Some(UndoPlan::RootSplit {
                root,
                extra,
                spare,
                inserted: (idesc, iidx),
            }) => {
                {
                    let f = Arc::clone(idesc.frame());
                    let mut b = f.bytes_mut();
                    fmt.del(&mut b[..], iidx);
                }
                {
                    let rf = Arc::clone(root.frame());
                    let ef = Arc::clone(extra.frame());
                    let sf = Arc::clone(spare.frame());
                    let mut rb = rf.bytes_mut();
                    let mut eb = ef.bytes_mut();
                    let mut sb = sf.bytes_mut();
                    fmt.move_recs(&mut sb[..], &mut eb[..], MoveEnd::Back, MoveQuota::Max);
                    fmt.init(&mut rb[..], geom.shift, 0, geom.ksize, geom.vsize, geom.ttype);
                    fmt.move_recs(&mut eb[..], &mut rb[..], MoveEnd::Front, MoveQuota::Max);
                    fmt.fini(&mut eb[..]);
                    fmt.fini(&mut sb[..]);
                }
                root.bump_seq();
                extra.bump_seq();
                spare.bump_seq();
                self.tree.td().set_height(self.height);
                self.consumed
                    .retain(|d| !Arc::ptr_eq(d, &extra) && !Arc::ptr_eq(d, &spare));
                self.spare_pool.push(extra);
                self.spare_pool.push(spare);
            }
            None => {}
        }
        self.dirty.clear();
        self.promote = None;
        self.act_slot = None;
        tracing::debug!("callback failed; makespace undone");
    }
}
