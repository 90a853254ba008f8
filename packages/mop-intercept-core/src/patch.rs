//! Patch records: capture-original, install-replacement, restore.

use std::collections::HashSet;
use std::fmt;

use crate::error::InterceptError;
use crate::intercept_debug_log;

/// A place where an operation's implementation lives and can be swapped.
///
/// `Func` is whatever the host stores in the slot (a C function pointer for a type
/// slot, an object reference for an interpreter hook). The replacement itself is
/// owned by the slot implementation; the core only asks it to install.
pub trait DispatchSlot {
    type Func: Clone + fmt::Debug;

    /// Human-readable identifier, e.g. `int.tp_richcompare`.
    fn label(&self) -> String;

    /// The implementation currently held by the slot.
    fn current(&self) -> Option<Self::Func>;

    /// True if `func` is this interceptor's own replacement.
    fn is_replacement(&self, func: &Self::Func) -> bool;

    /// Write the interceptor's replacement into the slot.
    fn install(&self) -> Result<(), InterceptError>;

    /// Write a previously captured implementation back.
    fn restore(&self, original: Option<Self::Func>) -> Result<(), InterceptError>;
}

#[derive(Debug)]
pub struct PatchRecord<S: DispatchSlot> {
    slot: S,
    original: Option<S::Func>,
    captured: bool,
    installed: bool,
}

impl<S: DispatchSlot> PatchRecord<S> {
    pub fn new(slot: S) -> Self {
        PatchRecord {
            slot,
            original: None,
            captured: false,
            installed: false,
        }
    }

    pub fn slot(&self) -> &S {
        &self.slot
    }

    /// The captured original, if one was ever captured.
    ///
    /// Kept after restoration: copies of the replacement inherited by types created
    /// while the slot was patched still need a way back to the original.
    pub fn original(&self) -> Option<&S::Func> {
        self.original.as_ref()
    }

    pub fn has_captured(&self) -> bool {
        self.captured
    }

    pub fn is_installed(&self) -> bool {
        self.installed
    }

    fn install(&mut self) -> Result<bool, InterceptError> {
        if self.installed {
            return Ok(false);
        }
        let current = self.slot.current();
        let foreign = current
            .as_ref()
            .is_some_and(|func| self.slot.is_replacement(func));
        if foreign && !self.captured {
            // Patched by someone else and nothing to restore to: leave the slot to them.
            log::warn!("{} already holds the replacement; not taking it over", self.slot.label());
            return Ok(false);
        }
        self.slot.install()?;
        // The replacement is never recorded as an original.
        if !foreign {
            self.original = current;
        }
        self.captured = true;
        self.installed = true;
        intercept_debug_log!("patched {}", self.slot.label());
        Ok(true)
    }

    fn restore(&mut self) -> Result<bool, InterceptError> {
        if !self.installed {
            return Ok(false);
        }
        self.slot.restore(self.original.clone())?;
        self.installed = false;
        intercept_debug_log!("restored {}", self.slot.label());
        Ok(true)
    }
}

/// All patch records of one dispatch point.
#[derive(Debug)]
pub struct PatchTable<S: DispatchSlot> {
    records: Vec<PatchRecord<S>>,
}

fn distinct_records<S: DispatchSlot>(slots: impl IntoIterator<Item = S>) -> Vec<PatchRecord<S>> {
    let mut seen = HashSet::new();
    slots
        .into_iter()
        .filter(|slot| seen.insert(slot.label()))
        .map(PatchRecord::new)
        .collect()
}

impl<S: DispatchSlot> PatchTable<S> {
    /// One record per distinct slot; repeated slots are dropped.
    pub fn new(slots: impl IntoIterator<Item = S>) -> Self {
        PatchTable {
            records: distinct_records(slots),
        }
    }

    pub fn records(&self) -> &[PatchRecord<S>] {
        &self.records
    }

    pub fn labels(&self) -> Vec<String> {
        self.records.iter().map(|r| r.slot.label()).collect()
    }

    pub fn is_installed(&self) -> bool {
        self.records.iter().any(PatchRecord::is_installed)
    }

    /// Patch every record that is not already patched.
    ///
    /// Returns how many slots changed. On failure, the slots this call patched are put
    /// back before the error is returned.
    pub fn install_all(&mut self) -> Result<usize, InterceptError> {
        let mut newly = Vec::new();
        for (idx, record) in self.records.iter_mut().enumerate() {
            match record.install() {
                Ok(true) => newly.push(idx),
                Ok(false) => {}
                Err(err) => {
                    for &done in &newly {
                        if let Err(undo) = self.records[done].restore() {
                            log::warn!("rollback of {} failed: {undo}", self.records[done].slot.label());
                        }
                    }
                    return Err(err);
                }
            }
        }
        Ok(newly.len())
    }

    /// Restore every patched record. Unpatched records are left alone.
    ///
    /// Keeps going past a failing slot so one bad slot cannot pin the others; the first
    /// error is returned after all slots were attempted.
    pub fn restore_all(&mut self) -> Result<usize, InterceptError> {
        let mut restored = 0;
        let mut first_err = None;
        for record in &mut self.records {
            match record.restore() {
                Ok(true) => restored += 1,
                Ok(false) => {}
                Err(err) => {
                    log::warn!("restoring {} failed: {err}", record.slot.label());
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(restored),
        }
    }

    /// Replace the slot set. Only allowed while nothing is patched.
    pub fn replace_slots(
        &mut self,
        interceptor: &'static str,
        slots: impl IntoIterator<Item = S>,
    ) -> Result<(), InterceptError> {
        if self.is_installed() {
            return Err(InterceptError::patch_active(interceptor));
        }
        self.records = distinct_records(slots);
        Ok(())
    }
}
