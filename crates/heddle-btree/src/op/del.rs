//! DEL: record delete, underflow collapse, root demotion, frame free

use super::*;
use crate::format::{MoveEnd, MoveQuota};

impl<'a, S, C> OpExec<'a, S, C>
where
    S: Segment + Sync + 'static,
    C: CaptureSink + Sync,
{
    /// Delete the leaf record and resolve any underflow
    pub(super) async fn act_del(&mut self) -> Result<Phase> {
        let leaf_i = self.leaf_index();
        let fmt = Arc::clone(self.fmt());
        let leaf = Arc::clone(self.levels[leaf_i].node.as_ref().unwrap());
        let idx = self.levels[leaf_i].idx;

        if !self.levels[leaf_i].found {
            self.status = OpStatus::KeyNotFound;
            self.guard = None;
            return Ok(Phase::Cleanup);
        }

        // The callback reads the record before it goes; an error vetoes
        // the delete entirely.
        let cb_res = {
            let buf = leaf.frame().bytes();
            let mut slot = RecSlot {
                key: fmt.key(&buf, idx),
                val: SlotVal::Read(fmt.val(&buf, idx)),
                status: OpStatus::Success,
            };
            let res = (self.cb)(&mut slot);
            if res.is_ok() {
                self.out_key = Bytes::copy_from_slice(fmt.key(&buf, idx));
                self.out_val = Bytes::copy_from_slice(fmt.val(&buf, idx));
            }
            res
        };
        if let Err(e) = cb_res {
            self.guard = None;
            return Err(BtreeError::callback(e));
        }

        let spans = {
            let frame = Arc::clone(leaf.frame());
            let mut buf = frame.bytes_mut();
            fmt.del(&mut buf[..], idx)
        };
        self.mark_dirty(&leaf, spans);

        let empty = fmt.count(&leaf.frame().bytes()) == 0;
        if empty && self.height > 1 && !self.cookie_only {
            self.collapse_up()?;
        }

        self.flush_captures().await?;
        self.status = OpStatus::Success;
        if !self.levels[leaf_i].freenode {
            self.cookie_out = Some(Cookie {
                addr: leaf.addr(),
                seq: leaf.seq(),
            });
        }
        self.guard = None;

        let any_free = self.levels.iter().any(|l| l.freenode) || self.free_other;
        if any_free {
            self.free_cursor = 0;
            Ok(Phase::Freenode)
        } else {
            Ok(Phase::Cleanup)
        }
    }

    /// Collapse empty nodes upward from the leaf
    ///
    /// Underflow is "record count reached zero": the dying node's entry is
    /// deleted from its parent and the walk continues while parents become
    /// childless. At the root two special cases apply: a root left with
    /// only the dying child becomes the empty leaf, and a root left with
    /// one surviving child absorbs it (root demotion).
    fn collapse_up(&mut self) -> Result<()> {
        let fmt = Arc::clone(self.fmt());
        let mut i = self.height as usize - 1;
        loop {
            self.levels[i].freenode = true;
            debug_assert!(i > 0);
            i -= 1;

            let parent = Arc::clone(self.levels[i].node.as_ref().unwrap());
            let cidx = self.levels[i].idx;
            let used_before = fmt.count(&parent.frame().bytes());

            if i == 0 && used_before == 0 {
                // The root's only child is dying: the root becomes the
                // empty leaf and the tree is empty.
                let spans = {
                    let frame = Arc::clone(parent.frame());
                    let mut buf = frame.bytes_mut();
                    fmt.set_level(&mut buf[..], 0)
                };
                self.mark_dirty(&parent, spans);
                self.tree.td().set_height(1);
                tracing::debug!("tree emptied; root is the empty leaf");
                break;
            }

            self.del_child_entry(&parent, cidx, used_before);

            if i == 0 {
                if used_before == 1 {
                    self.demote_root()?;
                }
                break;
            }
            if used_before == 0 {
                // The parent lost its only child; it dies too.
                continue;
            }
            break;
        }
        Ok(())
    }

    /// Remove the entry for a dying child from an internal node
    ///
    /// A dying sentinel absorbs its left neighbor: the last keyed record's
    /// child takes over the sentinel slot and its key is dropped.
    fn del_child_entry(&mut self, parent: &Arc<NodeDesc>, cidx: u16, used_before: u16) {
        let fmt = Arc::clone(self.fmt());
        let spans = {
            let frame = Arc::clone(parent.frame());
            let mut buf = frame.bytes_mut();
            if cidx < used_before {
                fmt.del(&mut buf[..], cidx)
            } else if used_before > 0 {
                let moved = fmt.child(&buf[..], used_before - 1);
                let mut spans = fmt.set_child(&mut buf[..], used_before, moved);
                spans.extend(fmt.del(&mut buf[..], used_before - 1));
                spans
            } else {
                // Sentinel-only node losing its sentinel: nothing left to
                // delete; the caller frees the whole node.
                Vec::new()
            }
        };
        if !spans.is_empty() {
            self.mark_dirty(parent, spans);
        }
    }

    /// Copy the surviving child into the root frame and drop a level
    fn demote_root(&mut self) -> Result<()> {
        let fmt = Arc::clone(self.fmt());
        let geom = self.tree.td().geom();
        let root = Arc::clone(self.levels[0].node.as_ref().unwrap());
        let other = self
            .other_child
            .clone()
            .ok_or_else(|| BtreeError::no_memory("demotion child"))?;

        let (root_spans, other_spans) = {
            let rf = Arc::clone(root.frame());
            let of = Arc::clone(other.frame());
            let mut rb = rf.bytes_mut();
            let mut ob = of.bytes_mut();

            debug_assert_eq!(fmt.child(&rb[..], 0), other.addr().raw());
            let olevel = fmt.level(&ob[..]);
            let mut rspans =
                fmt.init(&mut rb[..], geom.shift, olevel, geom.ksize, geom.vsize, geom.ttype);
            let mv = fmt.move_recs(&mut ob[..], &mut rb[..], MoveEnd::Front, MoveQuota::Max);
            let ospans = mv.src_spans;
            rspans.extend(mv.tgt_spans);
            if olevel > 0 {
                let sent = fmt.child(&ob[..], 0);
                let ridx = fmt.count(&rb[..]);
                rspans.extend(fmt.set_child(&mut rb[..], ridx, sent));
            }
            (rspans, ospans)
        };

        self.mark_dirty(&root, root_spans);
        self.mark_dirty(&other, other_spans);
        self.free_other = true;
        self.tree.td().set_height(self.height - 1);
        tracing::debug!(new_height = self.height - 1, "root demotion");
        Ok(())
    }

    /// Free one marked frame per tick
    ///
    /// The frames are already unreachable from the tree; each gets its
    /// header invalidated (captured) and its free deferred to the last
    /// reference drop.
    pub(super) async fn freenode(&mut self) -> Result<Phase> {
        let fmt = Arc::clone(self.fmt());
        while self.free_cursor < self.levels.len() {
            let i = self.free_cursor;
            if !self.levels[i].freenode {
                self.free_cursor += 1;
                continue;
            }
            self.levels[i].freenode = false;
            self.free_cursor += 1;
            let desc = Arc::clone(self.levels[i].node.as_ref().unwrap());
            self.retire_frame(&fmt, &desc).await?;
            return Ok(Phase::Freenode);
        }
        if self.free_other {
            self.free_other = false;
            let desc = self.other_child.clone().unwrap();
            self.retire_frame(&fmt, &desc).await?;
            return Ok(Phase::Freenode);
        }
        Ok(Phase::Cleanup)
    }

    async fn retire_frame(
        &mut self,
        fmt: &Arc<dyn crate::format::NodeFormat>,
        desc: &Arc<NodeDesc>,
    ) -> Result<()> {
        let spans = {
            let frame = Arc::clone(desc.frame());
            let mut buf = frame.bytes_mut();
            fmt.fini(&mut buf[..])
        };
        desc.bump_seq();
        if let Some(tx) = self.tx {
            tx.capture_spans(desc, &spans).await?;
        }
        desc.set_delayed_free();
        tracing::trace!(addr = %desc.addr(), "frame marked for delayed free");
        Ok(())
    }
}
