use indexmap::IndexMap;
use smallvec::SmallVec;
use strum_macros::{Display, EnumIter, EnumString};

/// Raw register value in target byte order.
pub type RegisterValue = SmallVec<[u8; 8]>;

/// Register values of a single execution unit, keyed by architecture register name.
///
/// Cache is filled by backend layers (`fetch_registers`) and flushed back by `store_registers`.
/// Absent register means "not fetched" or "unavailable".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegisterCache {
    values: IndexMap<String, RegisterValue>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supply(&mut self, name: &str, bytes: &[u8]) {
        self.values
            .insert(name.to_string(), SmallVec::from_slice(bytes));
    }

    pub fn supply_u64(&mut self, name: &str, value: u64) {
        self.supply(name, &value.to_le_bytes())
    }

    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.values.get(name).map(|v| v.as_slice())
    }

    /// Return register value as a little-endian integer (at most 8 bytes).
    pub fn get_u64(&self, name: &str) -> Option<u64> {
        let raw = self.get(name)?;
        let mut buf = [0u8; 8];
        let len = raw.len().min(8);
        buf[..len].copy_from_slice(&raw[..len]);
        Some(u64::from_le_bytes(buf))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear()
    }

    /// Copy all values from other cache, overwriting existing ones.
    pub fn merge(&mut self, other: &RegisterCache) {
        for (name, value) in other.iter() {
            self.supply(name, value);
        }
    }
}

/// x86-64 general purpose registers, as exposed by ptrace.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, EnumString, Display, EnumIter)]
#[strum(serialize_all = "snake_case")]
pub enum Register {
    Rax,
    Rbx,
    Rcx,
    Rdx,
    Rdi,
    Rsi,
    Rbp,
    Rsp,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
    Rip,
    Eflags,
    Cs,
    OrigRax,
    FsBase,
    GsBase,
    Fs,
    Gs,
    Ss,
    Ds,
    Es,
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod native {
    use super::{Register, RegisterCache};
    use nix::libc::user_regs_struct;
    use strum::IntoEnumIterator;

    fn slot(regs: &mut user_regs_struct, reg: Register) -> &mut u64 {
        match reg {
            Register::Rax => &mut regs.rax,
            Register::Rbx => &mut regs.rbx,
            Register::Rcx => &mut regs.rcx,
            Register::Rdx => &mut regs.rdx,
            Register::Rdi => &mut regs.rdi,
            Register::Rsi => &mut regs.rsi,
            Register::Rbp => &mut regs.rbp,
            Register::Rsp => &mut regs.rsp,
            Register::R8 => &mut regs.r8,
            Register::R9 => &mut regs.r9,
            Register::R10 => &mut regs.r10,
            Register::R11 => &mut regs.r11,
            Register::R12 => &mut regs.r12,
            Register::R13 => &mut regs.r13,
            Register::R14 => &mut regs.r14,
            Register::R15 => &mut regs.r15,
            Register::Rip => &mut regs.rip,
            Register::Eflags => &mut regs.eflags,
            Register::Cs => &mut regs.cs,
            Register::OrigRax => &mut regs.orig_rax,
            Register::FsBase => &mut regs.fs_base,
            Register::GsBase => &mut regs.gs_base,
            Register::Fs => &mut regs.fs,
            Register::Gs => &mut regs.gs,
            Register::Ss => &mut regs.ss,
            Register::Ds => &mut regs.ds,
            Register::Es => &mut regs.es,
        }
    }

    /// Fill cache from ptrace register set.
    pub fn supply_user_regs(cache: &mut RegisterCache, mut regs: user_regs_struct) {
        for reg in Register::iter() {
            let value = *slot(&mut regs, reg);
            cache.supply_u64(&reg.to_string(), value);
        }
    }

    /// Apply cached values to ptrace register set. Registers absent in cache stay untouched.
    pub fn collect_user_regs(cache: &RegisterCache, regs: &mut user_regs_struct) {
        for reg in Register::iter() {
            if let Some(value) = cache.get_u64(&reg.to_string()) {
                *slot(regs, reg) = value;
            }
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub use native::{collect_user_regs, supply_user_regs};
