use crate::debugger::error::{Error, TransferError};
use crate::debugger::target::{
    Beneath, DummyTarget, Stratum, Target, TargetObject, Transfer, TransferRequest,
};
use crate::debugger::CoreAddr;
use crate::sd_debug;
use std::cell::{Cell, RefCell};
use std::fmt::{Debug, Formatter};
use std::rc::Rc;

pub(super) struct TargetCell {
    stratum: Stratum,
    shortname: &'static str,
    refcount: Cell<u32>,
    closed: Cell<bool>,
    inner: RefCell<Box<dyn Target>>,
}

/// Shared handle to an opened layer.
///
/// Reference count counts stacks holding the layer, the layer is closed when it drops to zero.
#[derive(Clone)]
pub struct TargetRef(Rc<TargetCell>);

impl TargetRef {
    pub fn new(target: impl Target + 'static) -> Self {
        Self(Rc::new(TargetCell {
            stratum: target.stratum(),
            shortname: target.shortname(),
            refcount: Cell::new(0),
            closed: Cell::new(false),
            inner: RefCell::new(Box::new(target)),
        }))
    }

    pub fn stratum(&self) -> Stratum {
        self.0.stratum
    }

    pub fn shortname(&self) -> &'static str {
        self.0.shortname
    }

    pub fn refcount(&self) -> u32 {
        self.0.refcount.get()
    }

    pub fn is_closed(&self) -> bool {
        self.0.closed.get()
    }

    pub fn ptr_eq(&self, other: &TargetRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub(super) fn cell(&self) -> &RefCell<Box<dyn Target>> {
        &self.0.inner
    }

    fn incref(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Internal(format!(
                "push of closed target \"{}\"",
                self.shortname()
            )));
        }
        self.0.refcount.set(self.refcount() + 1);
        Ok(())
    }

    fn decref(&self) -> Result<(), Error> {
        let count = self.refcount();
        if count == 0 {
            return Err(Error::Internal(format!(
                "reference count underflow for target \"{}\"",
                self.shortname()
            )));
        }
        self.0.refcount.set(count - 1);
        if count == 1 {
            sd_debug!(target: "target", "closing target \"{}\"", self.shortname());
            self.0.closed.set(true);
            self.0.inner.borrow_mut().close();
        }
        Ok(())
    }
}

impl Debug for TargetRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetRef")
            .field("stratum", &self.stratum())
            .field("shortname", &self.shortname())
            .field("refcount", &self.refcount())
            .finish()
    }
}

/// Layer description, as shown by `info target-stack`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayerInfo {
    pub stratum: Stratum,
    pub shortname: &'static str,
    pub longname: String,
}

/// Per inferior stack of layers, indexed by stratum.
pub struct TargetStack {
    slots: [Option<TargetRef>; Stratum::COUNT],
    top: Stratum,
}

impl TargetStack {
    pub fn new() -> Self {
        let dummy = TargetRef::new(DummyTarget);
        dummy.0.refcount.set(1);
        let mut slots: [Option<TargetRef>; Stratum::COUNT] = Default::default();
        slots[Stratum::Dummy.index()] = Some(dummy);
        Self {
            slots,
            top: Stratum::Dummy,
        }
    }

    pub(super) fn slot(&self, idx: usize) -> Option<&TargetRef> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    fn recompute_top(&mut self) {
        self.top = self
            .slots
            .iter()
            .rposition(|s| s.is_some())
            .and_then(|idx| self.slots[idx].as_ref())
            .map(|t| t.stratum())
            .unwrap_or(Stratum::Dummy);
    }

    /// Push a layer on its stratum slot. Previous occupant of the slot is unpushed.
    pub fn push(&mut self, target: TargetRef) -> Result<(), Error> {
        let stratum = target.stratum();
        if stratum == Stratum::Dummy {
            return Err(Error::Internal(
                "dummy stratum is occupied by the permanent floor".to_string(),
            ));
        }

        if let Some(current) = self.slots[stratum.index()].clone() {
            if current.ptr_eq(&target) {
                return Ok(());
            }
            sd_debug!(
                target: "target",
                "\"{}\" replaces \"{}\" at {stratum} stratum",
                target.shortname(),
                current.shortname()
            );
            self.unpush(&current)?;
        }

        target.incref()?;
        sd_debug!(target: "target", "push \"{}\" at {stratum} stratum", target.shortname());
        self.slots[stratum.index()] = Some(target);
        self.recompute_top();
        Ok(())
    }

    /// Remove a layer from the stack.
    ///
    /// Return `Ok(false)` if the stratum slot doesn't hold exactly that layer.
    pub fn unpush(&mut self, target: &TargetRef) -> Result<bool, Error> {
        let stratum = target.stratum();
        if stratum == Stratum::Dummy {
            return Err(Error::Internal(
                "attempt to unpush the dummy target".to_string(),
            ));
        }

        let idx = stratum.index();
        match &self.slots[idx] {
            Some(current) if current.ptr_eq(target) => {}
            _ => return Ok(false),
        }

        let removed = self.slots[idx].take();
        self.recompute_top();
        sd_debug!(target: "target", "unpush \"{}\" from {stratum} stratum", target.shortname());
        if let Some(removed) = removed {
            removed.decref()?;
        }
        Ok(true)
    }

    /// Unpush whatever occupies the stratum.
    pub fn unpush_stratum(&mut self, stratum: Stratum) -> Result<bool, Error> {
        match self.find(stratum).cloned() {
            Some(target) => self.unpush(&target),
            None => Ok(false),
        }
    }

    /// Unpush every layer above `stratum`.
    pub fn unpush_above(&mut self, stratum: Stratum) -> Result<(), Error> {
        for idx in (stratum.index() + 1..Stratum::COUNT).rev() {
            if let Some(target) = self.slots[idx].clone() {
                self.unpush(&target)?;
            }
        }
        Ok(())
    }

    pub fn top_stratum(&self) -> Stratum {
        self.top
    }

    pub fn find(&self, stratum: Stratum) -> Option<&TargetRef> {
        self.slots[stratum.index()].as_ref()
    }

    pub fn has_stratum(&self, stratum: Stratum) -> bool {
        self.find(stratum).is_some()
    }

    /// Entry point for dispatching an operation, starting at the top layer.
    pub fn top(&self) -> Beneath<'_> {
        Beneath::new(self, Stratum::COUNT)
    }

    /// Dispatch handle for everything below the stratum.
    pub fn beneath(&self, stratum: Stratum) -> Beneath<'_> {
        Beneath::new(self, stratum.index())
    }

    /// Search layers top-down for the one that can transfer memory.
    ///
    /// Search stops at the first success or "unavailable" answer, and at a layer that covers the
    /// whole address space, even if it failed.
    pub fn raw_memory_xfer_partial(
        &self,
        object: TargetObject,
        offset: CoreAddr,
        mut req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        let len = req.len();
        let mut last = Transfer::Io(TransferError::Inaccessible(offset));
        for idx in (0..Stratum::COUNT).rev() {
            let Some(layer) = self.slot(idx) else {
                continue;
            };
            let res = layer.cell().borrow_mut().xfer_partial(
                Beneath::new(self, idx),
                object,
                offset,
                req.reborrow(len),
            )?;
            let res = match res {
                Transfer::Eof if len > 0 => Transfer::Io(TransferError::Inaccessible(offset)),
                res => res,
            };
            match res {
                Transfer::Done(_) | Transfer::Unavailable | Transfer::Eof => return Ok(res),
                Transfer::Io(_) => {
                    last = res;
                    if layer.cell().borrow().has_all_memory() {
                        break;
                    }
                }
            }
        }
        Ok(last)
    }

    /// Occupied layers, top first.
    pub fn layers(&self) -> Vec<LayerInfo> {
        self.slots
            .iter()
            .rev()
            .flatten()
            .map(|t| LayerInfo {
                stratum: t.stratum(),
                shortname: t.shortname(),
                longname: t.cell().borrow().longname(),
            })
            .collect()
    }
}

impl Default for TargetStack {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TargetStack {
    fn drop(&mut self) {
        for idx in (1..Stratum::COUNT).rev() {
            if let Some(target) = self.slots[idx].take() {
                // a stack never holds more references than it took
                _ = target.decref();
            }
        }
    }
}
