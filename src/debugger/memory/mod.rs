//! Memory access pipeline.
//!
//! A single partial transfer goes through: overlay remap, read-only sections shortcut, region
//! permissions, data cache, raw search over the backend stack. Breakpoint shadows are applied
//! around all of that: reads see original bytes instead of breakpoint instructions, writes over
//! an inserted breakpoint update its shadow and leave the instruction in place.

pub mod cache;
pub mod region;

pub use cache::DCache;
pub use region::{MemAccess, MemRegion, RegionTable};

use crate::config::DebuggerConfig;
use crate::debugger::error::{Error, TransferError};
use crate::debugger::target::{
    BreakpointInsertion, BreakpointSite, TargetMemory, TargetObject, TargetSection, TargetStack,
    Transfer, TransferRequest,
};
use crate::debugger::CoreAddr;
use crate::{sd_debug, sd_trace};
use std::collections::{BTreeMap, HashSet};

/// Original bytes hidden by an inserted software breakpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Shadow {
    pub bytes: Vec<u8>,
    pub insn: Vec<u8>,
    /// Breakpoint instruction was written into target memory (not handled by a layer).
    pub in_memory: bool,
}

impl Shadow {
    fn end(&self, addr: CoreAddr) -> CoreAddr {
        addr + self.bytes.len() as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct PipelineSettings {
    trust_readonly_sections: bool,
    stack_cache: bool,
    code_cache: bool,
    show_breakpoint_shadows: bool,
    overlay_debugging: bool,
    inaccessible_by_default: bool,
}

impl From<&DebuggerConfig> for PipelineSettings {
    fn from(cfg: &DebuggerConfig) -> Self {
        Self {
            trust_readonly_sections: cfg.trust_readonly_sections,
            stack_cache: cfg.stack_cache,
            code_cache: cfg.code_cache,
            show_breakpoint_shadows: cfg.show_breakpoint_shadows,
            overlay_debugging: cfg.overlay_debugging,
            inaccessible_by_default: cfg.inaccessible_by_default,
        }
    }
}

pub struct MemoryPipeline {
    regions: RegionTable,
    dcache: DCache,
    shadows: BTreeMap<CoreAddr, Shadow>,
    mapped_overlays: HashSet<String>,
    settings: PipelineSettings,
}

impl MemoryPipeline {
    pub fn new(cfg: &DebuggerConfig) -> Self {
        Self {
            regions: RegionTable::new(),
            dcache: DCache::new(cfg.dcache_line_size, cfg.dcache_size),
            shadows: BTreeMap::new(),
            mapped_overlays: HashSet::new(),
            settings: PipelineSettings::from(cfg),
        }
    }

    pub fn apply_config(&mut self, cfg: &DebuggerConfig) {
        let settings = PipelineSettings::from(cfg);
        if settings != self.settings {
            self.dcache.invalidate();
        }
        if cfg.dcache_line_size != self.dcache.line_size() {
            self.dcache = DCache::new(cfg.dcache_line_size, cfg.dcache_size);
        }
        self.settings = settings;
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    /// Mutable access to user regions. Cached data is dropped since permissions may change.
    pub fn regions_mut(&mut self) -> &mut RegionTable {
        self.dcache.invalidate();
        &mut self.regions
    }

    pub fn dcache(&self) -> &DCache {
        &self.dcache
    }

    /// Drop cached target memory. Must happen before the target is resumed.
    pub fn invalidate_cache(&mut self) {
        if !self.dcache.is_empty() {
            sd_trace!(target: "memory", "invalidate data cache ({} lines)", self.dcache.len());
        }
        self.dcache.invalidate();
    }

    pub fn map_overlay(&mut self, section: &str) {
        self.mapped_overlays.insert(section.to_string());
        self.dcache.invalidate();
    }

    pub fn unmap_overlay(&mut self, section: &str) {
        self.mapped_overlays.remove(section);
        self.dcache.invalidate();
    }

    pub fn overlay_mapped(&self, section: &str) -> bool {
        self.mapped_overlays.contains(section)
    }

    /// Perform one partial transfer through the whole pipeline.
    pub fn xfer_partial(
        &mut self,
        stack: &TargetStack,
        object: TargetObject,
        addr: CoreAddr,
        req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        if req.is_empty() {
            return Ok(Transfer::Eof);
        }

        let hide_shadows = object.shadowed() && !self.shadows.is_empty();
        let res = match req {
            TransferRequest::Read(buf) => {
                let res =
                    self.xfer_unshadowed(stack, object, addr, TransferRequest::Read(&mut *buf))?;
                if hide_shadows && !self.settings.show_breakpoint_shadows {
                    if let Transfer::Done(n) = res {
                        self.overlay_shadows(addr, &mut buf[..n.get()]);
                    }
                }
                res
            }
            TransferRequest::Write(data) if hide_shadows => {
                let mut patched = data.to_vec();
                self.keep_inserted_insns(addr, &mut patched);
                let res =
                    self.xfer_unshadowed(stack, object, addr, TransferRequest::Write(&patched))?;
                if let Transfer::Done(n) = res {
                    self.absorb_into_shadows(addr, &data[..n.get()]);
                }
                res
            }
            req => self.xfer_unshadowed(stack, object, addr, req)?,
        };

        if crate::log::transfers_traced() {
            sd_trace!(target: "memory", "{object} xfer at {addr:#x}: {res:?}");
        }
        Ok(res)
    }

    fn xfer_unshadowed(
        &mut self,
        stack: &TargetStack,
        object: TargetObject,
        addr: CoreAddr,
        mut req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        let need_sections = matches!(req, TransferRequest::Read(_))
            && (self.settings.overlay_debugging || self.settings.trust_readonly_sections);
        let sections = if need_sections {
            stack.top().section_table()
        } else {
            vec![]
        };

        if let TransferRequest::Read(ref mut buf) = req {
            if self.settings.overlay_debugging {
                if let Some(sect) = sections
                    .iter()
                    .find(|s| s.overlay && s.contains_lma(addr) && !self.overlay_mapped(&s.name))
                {
                    return Ok(Transfer::done(sect.read(addr - sect.lma, buf)));
                }
            }

            if self.settings.trust_readonly_sections {
                if let Some(sect) = find_readonly_section(&sections, addr) {
                    return Ok(Transfer::done(sect.read(addr - sect.addr, buf)));
                }
            }
        }

        let region = self
            .regions
            .lookup(addr, self.settings.inaccessible_by_default);
        let write = req.is_write();
        match region.access {
            MemAccess::None => return Ok(Transfer::Io(TransferError::Inaccessible(addr))),
            MemAccess::Flash if write => return Ok(Transfer::Io(TransferError::Flash(addr))),
            access if write && !access.allows_write() => {
                return Ok(Transfer::Io(TransferError::NotWritable(addr)))
            }
            access if !write && !access.allows_read() => {
                return Ok(Transfer::Io(TransferError::Inaccessible(addr)))
            }
            _ => {}
        }
        let len = match region.remaining(addr) {
            Some(rem) => (rem as usize).min(req.len()),
            None => req.len(),
        };
        let req = req.reborrow(len);

        let cacheable = region.cacheable
            || (object == TargetObject::StackMemory && self.settings.stack_cache)
            || (object == TargetObject::CodeMemory && self.settings.code_cache);
        if cacheable && !stack.top().is_replaying() {
            return self.cached_xfer(stack, object, addr, req);
        }

        stack.raw_memory_xfer_partial(object, addr, req)
    }

    fn cached_xfer(
        &mut self,
        stack: &TargetStack,
        object: TargetObject,
        addr: CoreAddr,
        req: TransferRequest<'_>,
    ) -> Result<Transfer, Error> {
        match req {
            TransferRequest::Read(buf) => {
                let read = self.dcache.read(addr, buf, |line, data| {
                    read_all_raw(stack, object, line, data)
                });
                if read > 0 {
                    return Ok(Transfer::done(read));
                }
                stack.raw_memory_xfer_partial(object, addr, TransferRequest::Read(buf))
            }
            TransferRequest::Write(data) => {
                let res = stack.raw_memory_xfer_partial(object, addr, TransferRequest::Write(data))?;
                if let Transfer::Done(n) = res {
                    self.dcache.update(addr, &data[..n.get()]);
                }
                Ok(res)
            }
        }
    }

    fn overlay_shadows(&self, addr: CoreAddr, buf: &mut [u8]) {
        let end = addr.saturating_add(buf.len() as u64);
        for (&bp_addr, shadow) in self.shadows_overlapping(addr, end) {
            for (i, byte) in shadow.bytes.iter().enumerate() {
                let at = bp_addr + i as u64;
                if at >= addr && at < end {
                    buf[(at - addr) as usize] = *byte;
                }
            }
        }
    }

    /// Put breakpoint instructions back over the bytes a write would clobber.
    fn keep_inserted_insns(&self, addr: CoreAddr, data: &mut [u8]) {
        let end = addr.saturating_add(data.len() as u64);
        for (&bp_addr, shadow) in self.shadows_overlapping(addr, end) {
            if !shadow.in_memory {
                continue;
            }
            for (i, insn) in shadow.insn.iter().enumerate() {
                let at = bp_addr + i as u64;
                if at >= addr && at < end {
                    data[(at - addr) as usize] = *insn;
                }
            }
        }
    }

    /// Record the written bytes as the new original contents under breakpoints. `data` is the
    /// written prefix only.
    fn absorb_into_shadows(&mut self, addr: CoreAddr, data: &[u8]) {
        let end = addr.saturating_add(data.len() as u64);
        let overlapping: Vec<CoreAddr> = self
            .shadows_overlapping(addr, end)
            .map(|(a, _)| *a)
            .collect();
        for bp_addr in overlapping {
            let Some(shadow) = self.shadows.get_mut(&bp_addr) else {
                continue;
            };
            for (i, byte) in shadow.bytes.iter_mut().enumerate() {
                let at = bp_addr + i as u64;
                if at >= addr && at < end {
                    *byte = data[(at - addr) as usize];
                }
            }
        }
    }

    fn shadows_overlapping(
        &self,
        addr: CoreAddr,
        end: CoreAddr,
    ) -> impl Iterator<Item = (&CoreAddr, &Shadow)> {
        // breakpoint instructions are short, start a bit before the range
        let from = addr.saturating_sub(16);
        self.shadows
            .range(from..end)
            .filter(move |(bp_addr, shadow)| shadow.end(**bp_addr) > addr)
    }

    /// Read exactly `buf.len()` bytes.
    pub fn read(
        &mut self,
        stack: &TargetStack,
        object: TargetObject,
        addr: CoreAddr,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        let mut done = 0;
        while done < buf.len() {
            let cur = addr + done as u64;
            match self.xfer_partial(stack, object, cur, TransferRequest::Read(&mut buf[done..]))? {
                Transfer::Done(n) => done += n.get(),
                Transfer::Io(e) => return Err(e.into()),
                Transfer::Eof | Transfer::Unavailable => {
                    return Err(TransferError::Inaccessible(cur).into())
                }
            }
        }
        Ok(())
    }

    /// Write all of `data`.
    pub fn write(
        &mut self,
        stack: &TargetStack,
        object: TargetObject,
        addr: CoreAddr,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut done = 0;
        while done < data.len() {
            let cur = addr + done as u64;
            match self.xfer_partial(stack, object, cur, TransferRequest::Write(&data[done..]))? {
                Transfer::Done(n) => done += n.get(),
                Transfer::Io(e) => return Err(e.into()),
                Transfer::Eof | Transfer::Unavailable => {
                    return Err(TransferError::Inaccessible(cur).into())
                }
            }
        }
        Ok(())
    }

    pub fn breakpoint_inserted(&self, addr: CoreAddr) -> bool {
        self.shadows.contains_key(&addr)
    }

    pub fn inserted_breakpoints(&self) -> Vec<CoreAddr> {
        self.shadows.keys().copied().collect()
    }

    pub fn shadow(&self, addr: CoreAddr) -> Option<&Shadow> {
        self.shadows.get(&addr)
    }

    /// Insert a software breakpoint, asking the backend first and patching memory if nobody
    /// handles breakpoints.
    pub fn insert_breakpoint(
        &mut self,
        stack: &TargetStack,
        site: &BreakpointSite,
    ) -> Result<(), Error> {
        if self.shadows.contains_key(&site.addr) {
            return Ok(());
        }

        let shadow = match stack.top().insert_breakpoint(site)? {
            BreakpointInsertion::Handled { shadow } => Shadow {
                bytes: shadow,
                insn: site.insn.clone(),
                in_memory: false,
            },
            BreakpointInsertion::UseMemory => {
                let mut orig = vec![0; site.insn.len()];
                self.read(stack, TargetObject::RawMemory, site.addr, &mut orig)?;
                self.write(stack, TargetObject::RawMemory, site.addr, &site.insn)?;
                Shadow {
                    bytes: orig,
                    insn: site.insn.clone(),
                    in_memory: true,
                }
            }
        };
        sd_debug!(target: "memory", "breakpoint inserted at {:#x}", site.addr);
        self.shadows.insert(site.addr, shadow);
        Ok(())
    }

    /// Remove a previously inserted software breakpoint, restoring original bytes.
    pub fn remove_breakpoint(&mut self, stack: &TargetStack, addr: CoreAddr) -> Result<(), Error> {
        let Some(shadow) = self.shadows.remove(&addr) else {
            return Ok(());
        };
        let site = BreakpointSite {
            addr,
            insn: shadow.insn.clone(),
        };
        stack.top().remove_breakpoint(&site)?;
        if shadow.in_memory {
            self.write(stack, TargetObject::RawMemory, addr, &shadow.bytes)?;
        }
        sd_debug!(target: "memory", "breakpoint removed from {addr:#x}");
        Ok(())
    }

    /// Forget inserted breakpoints without touching the target (the process is gone).
    pub fn forget_breakpoints(&mut self) {
        self.shadows.clear();
    }
}

/// Pipeline access bound to a stack, given to collaborators that read program memory.
pub struct MemoryView<'a> {
    pub pipeline: &'a mut MemoryPipeline,
    pub stack: &'a TargetStack,
    pub object: TargetObject,
}

impl<'a> TargetMemory for MemoryView<'a> {
    fn read_memory(&mut self, addr: CoreAddr, buf: &mut [u8]) -> Result<(), Error> {
        self.pipeline.read(self.stack, self.object, addr, buf)
    }

    fn write_memory(&mut self, addr: CoreAddr, data: &[u8]) -> Result<(), Error> {
        self.pipeline.write(self.stack, self.object, addr, data)
    }
}

fn find_readonly_section(sections: &[TargetSection], addr: CoreAddr) -> Option<&TargetSection> {
    sections.iter().find(|s| s.readonly && s.contains(addr))
}

fn read_all_raw(
    stack: &TargetStack,
    object: TargetObject,
    addr: CoreAddr,
    buf: &mut [u8],
) -> Result<(), Error> {
    let mut done = 0;
    while done < buf.len() {
        let cur = addr + done as u64;
        match stack.raw_memory_xfer_partial(object, cur, TransferRequest::Read(&mut buf[done..]))? {
            Transfer::Done(n) => done += n.get(),
            Transfer::Io(e) => return Err(e.into()),
            Transfer::Eof | Transfer::Unavailable => {
                return Err(TransferError::Inaccessible(cur).into())
            }
        }
    }
    Ok(())
}
