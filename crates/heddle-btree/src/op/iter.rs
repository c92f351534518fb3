//! GET and ITER: slot resolution, slant, sibling leaves

use super::*;

/// Where the fetch settles
enum Target {
    /// A slot in the main leaf
    Main(u16),
    /// The extreme slot of the sibling leaf
    Sib,
    /// Ran off the edge of the tree
    Boundary,
    /// Exact lookup missed
    NotFound,
}

impl<'a, S, C> OpExec<'a, S, C>
where
    S: Segment + Sync + 'static,
    C: CaptureSink + Sync,
{
    /// Resolve the record a GET or ITER returns and run the callback
    pub(super) async fn act_fetch(&mut self) -> Result<Phase> {
        let leaf_i = self.leaf_index();
        let fmt = Arc::clone(self.fmt());
        let leaf = Arc::clone(self.levels[leaf_i].node.as_ref().unwrap());
        let idx = self.levels[leaf_i].idx;
        let found = self.levels[leaf_i].found;
        let used = fmt.count(&leaf.frame().bytes());
        let have_sib = self.levels[leaf_i].sib.is_some();

        let target = match self.op {
            Opcode::Get => {
                if self.flags.contains(OpFlags::SLANT) {
                    // Key or successor; the successor may live in the
                    // next leaf over.
                    if idx < used {
                        Target::Main(idx)
                    } else if have_sib {
                        Target::Sib
                    } else {
                        Target::Boundary
                    }
                } else if found {
                    Target::Main(idx)
                } else {
                    Target::NotFound
                }
            }
            Opcode::Iter => {
                if self.dir_next() {
                    let nidx = idx + u16::from(found);
                    if nidx < used {
                        Target::Main(nidx)
                    } else if have_sib {
                        Target::Sib
                    } else {
                        Target::Boundary
                    }
                } else if idx > 0 {
                    Target::Main(idx - 1)
                } else if have_sib {
                    Target::Sib
                } else {
                    Target::Boundary
                }
            }
            Opcode::Put | Opcode::Del => unreachable!("mutations act elsewhere"),
        };

        let (desc, ridx) = match target {
            Target::Main(i) => (leaf, i),
            Target::Sib => {
                let sib = Arc::clone(self.levels[leaf_i].sib.as_ref().unwrap());
                let sused = fmt.count(&sib.frame().bytes());
                if sused == 0 {
                    // Sibling leaves are never empty in a consistent
                    // tree; treat it as a lost race.
                    return self.restart();
                }
                let ridx = if self.dir_next() { 0 } else { sused - 1 };
                (sib, ridx)
            }
            Target::Boundary => {
                self.status = OpStatus::KeyBtreeBoundary;
                self.guard = None;
                return Ok(Phase::Cleanup);
            }
            Target::NotFound => {
                self.status = OpStatus::KeyNotFound;
                self.guard = None;
                return Ok(Phase::Cleanup);
            }
        };

        let cb_res = {
            let buf = desc.frame().bytes();
            let mut slot = RecSlot {
                key: fmt.key(&buf, ridx),
                val: SlotVal::Read(fmt.val(&buf, ridx)),
                status: OpStatus::Success,
            };
            let res = (self.cb)(&mut slot);
            if res.is_ok() {
                self.out_key = Bytes::copy_from_slice(fmt.key(&buf, ridx));
                self.out_val = Bytes::copy_from_slice(fmt.val(&buf, ridx));
            }
            res
        };
        self.guard = None;
        cb_res.map_err(BtreeError::callback)?;
        self.status = OpStatus::Success;
        self.cookie_out = Some(Cookie {
            addr: desc.addr(),
            seq: desc.seq(),
        });
        Ok(Phase::Cleanup)
    }
}
