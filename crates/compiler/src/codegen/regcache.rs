//! Register cache for frame-resident variables.
//!
//! Locals and arguments can be cached in scratch registers between uses.  The
//! discipline is strict: at most one register at a time may hold a dirty
//! cached value, evicting a dirty register writes it back to its home slot,
//! and every call site spills the whole cache (`caller_save`) because the
//! callee may clobber any scratch register.

use super::emitter::operand_str;
use crate::value::{Operand, Reg};
use std::fmt::Write as _;

/// Registers available for caching.  `%eax` is the result register, `%ebx`
/// the argument count, `%esi` the receiver; the rest of the general set is
/// fair game.
pub(crate) const CACHEABLE: [Reg; 3] = [Reg::Edx, Reg::Ecx, Reg::Edi];

#[derive(Debug)]
struct CacheEntry {
    var: String,
    home: Operand,
    reg: Reg,
    dirty: bool,
}

/// The cache state machine.  All code emission goes through the `out` buffer
/// handed in by the emitter.
#[derive(Debug, Default)]
pub(crate) struct RegCache {
    entries: Vec<CacheEntry>,
    /// Registers temporarily claimed as raw scratch (address computation,
    /// splat copies); excluded from caching until released.
    busy: Vec<Reg>,
}

impl RegCache {
    pub fn new() -> Self {
        RegCache::default()
    }

    fn free_reg(&self) -> Option<Reg> {
        CACHEABLE
            .into_iter()
            .find(|r| !self.busy.contains(r) && !self.entries.iter().any(|e| e.reg == *r))
    }

    #[cfg(test)]
    pub fn cached(&self, var: &str) -> Option<Reg> {
        self.entries.iter().find(|e| e.var == var).map(|e| e.reg)
    }

    /// Cache a variable in a register.  On a read the current value is loaded
    /// from its home slot; on a write the register is claimed and marked
    /// dirty (the caller stores into it next).  Returns `None` when no
    /// register is free; the caller then works against the home slot.
    pub fn acquire(
        &mut self,
        out: &mut String,
        var: &str,
        home: &Operand,
        for_write: bool,
    ) -> Result<Option<Reg>, std::fmt::Error> {
        if let Some(i) = self.entries.iter().position(|e| e.var == var) {
            let reg = self.entries[i].reg;
            if for_write && !self.entries[i].dirty {
                self.spill_dirty(out)?;
                self.entries[i].dirty = true;
            }
            return Ok(Some(reg));
        }

        let Some(reg) = self.free_reg() else {
            return Ok(None);
        };
        if for_write {
            // The assignment that follows supplies the value; only the
            // single-dirty rule needs enforcing first.
            self.spill_dirty(out)?;
        } else {
            writeln!(out, "\tmovl {}, {}", operand_str(home), reg)?;
        }
        self.entries.push(CacheEntry {
            var: var.to_string(),
            home: home.clone(),
            reg,
            dirty: for_write,
        });
        Ok(Some(reg))
    }

    /// Write back every dirty entry without dropping anything.
    fn spill_dirty(&mut self, out: &mut String) -> Result<(), std::fmt::Error> {
        for entry in &mut self.entries {
            if entry.dirty {
                writeln!(out, "\tmovl {}, {}", entry.reg, operand_str(&entry.home))?;
                entry.dirty = false;
            }
        }
        Ok(())
    }

    fn drop_entry(&mut self, out: &mut String, i: usize) -> Result<(), std::fmt::Error> {
        let entry = self.entries.remove(i);
        if entry.dirty {
            writeln!(out, "\tmovl {}, {}", entry.reg, operand_str(&entry.home))?;
        }
        Ok(())
    }

    pub fn evict_var(&mut self, out: &mut String, var: &str) -> Result<(), std::fmt::Error> {
        if let Some(i) = self.entries.iter().position(|e| e.var == var) {
            self.drop_entry(out, i)?;
        }
        Ok(())
    }

    pub fn evict_all(&mut self, out: &mut String) -> Result<(), std::fmt::Error> {
        while !self.entries.is_empty() {
            self.drop_entry(out, 0)?;
        }
        Ok(())
    }

    pub fn evict_regs_for(
        &mut self,
        out: &mut String,
        names: &[String],
    ) -> Result<(), std::fmt::Error> {
        for name in names {
            self.evict_var(out, name)?;
        }
        Ok(())
    }

    /// Claim a scratch register outside the cache, evicting a cached value
    /// if every cacheable register is occupied.
    pub fn take_register(&mut self, out: &mut String) -> Result<Reg, std::fmt::Error> {
        if let Some(reg) = self.free_reg() {
            self.busy.push(reg);
            return Ok(reg);
        }
        // All cacheable registers hold values; evict the oldest non-busy one.
        let i = self
            .entries
            .iter()
            .position(|e| !self.busy.contains(&e.reg))
            .expect("register cache exhausted: every scratch register is busy");
        let reg = self.entries[i].reg;
        self.drop_entry(out, i)?;
        self.busy.push(reg);
        Ok(reg)
    }

    /// Claim one specific register (division needs `%edx`, splat copies use
    /// fixed registers).
    pub fn take_specific(&mut self, out: &mut String, reg: Reg) -> Result<(), std::fmt::Error> {
        if let Some(i) = self.entries.iter().position(|e| e.reg == reg) {
            self.drop_entry(out, i)?;
        }
        if !self.busy.contains(&reg) {
            self.busy.push(reg);
        }
        Ok(())
    }

    pub fn release(&mut self, reg: Reg) {
        self.busy.retain(|r| *r != reg);
    }

    #[cfg(test)]
    pub fn dirty_count(&self) -> usize {
        self.entries.iter().filter(|e| e.dirty).count()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arg(i: usize) -> Operand {
        Operand::Arg(i)
    }

    #[test]
    fn test_read_acquire_loads_from_home() {
        let mut cache = RegCache::new();
        let mut out = String::new();
        let reg = cache.acquire(&mut out, "x", &arg(0), false).unwrap().unwrap();
        assert_eq!(reg, Reg::Edx);
        assert!(out.contains("movl 8(%ebp), %edx"));
    }

    #[test]
    fn test_single_dirty_register_invariant() {
        let mut cache = RegCache::new();
        let mut out = String::new();
        cache.acquire(&mut out, "x", &arg(0), true).unwrap().unwrap();
        assert_eq!(cache.dirty_count(), 1);
        // Marking a second variable dirty must write the first one back.
        cache.acquire(&mut out, "y", &arg(1), true).unwrap().unwrap();
        assert_eq!(cache.dirty_count(), 1);
        assert!(out.contains("movl %edx, 8(%ebp)"));
    }

    #[test]
    fn test_evict_all_writes_back_dirty_values() {
        let mut cache = RegCache::new();
        let mut out = String::new();
        cache.acquire(&mut out, "x", &arg(2), true).unwrap().unwrap();
        out.clear();
        cache.evict_all(&mut out).unwrap();
        assert!(out.contains("movl %edx, 16(%ebp)"));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_clean_eviction_is_silent() {
        let mut cache = RegCache::new();
        let mut out = String::new();
        cache.acquire(&mut out, "x", &arg(0), false).unwrap().unwrap();
        out.clear();
        cache.evict_all(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_take_register_skips_busy() {
        let mut cache = RegCache::new();
        let mut out = String::new();
        let a = cache.take_register(&mut out).unwrap();
        let b = cache.take_register(&mut out).unwrap();
        assert_ne!(a, b);
        cache.release(a);
        let c = cache.take_register(&mut out).unwrap();
        assert_eq!(a, c);
    }

    #[test]
    fn test_take_specific_evicts_holder() {
        let mut cache = RegCache::new();
        let mut out = String::new();
        cache.acquire(&mut out, "x", &arg(0), true).unwrap().unwrap();
        out.clear();
        cache.take_specific(&mut out, Reg::Edx).unwrap();
        assert!(out.contains("movl %edx, 8(%ebp)"));
        assert_eq!(cache.cached("x"), None);
    }
}
