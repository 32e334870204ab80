use parking_lot::RwLock;

use super::{class::ClassRef, method::MethodRef};

#[derive(Clone)]
pub struct IfTableEntry {
    pub interface: ClassRef,
    /// Implementation for each of the interface's virtual methods, in the
    /// interface's declaration order. Empty for interface classes.
    pub methods: Vec<MethodRef>,
}

/// Every interface a class implements, superclass interfaces first.
/// Array classes share one table holding `Cloneable` and `Serializable`,
/// which is filled in once those classes exist.
#[derive(Default)]
pub struct IfTable {
    entries: RwLock<Vec<IfTableEntry>>,
}

impl IfTable {
    pub fn new(entries: Vec<IfTableEntry>) -> IfTable {
        return IfTable {
            entries: RwLock::new(entries),
        };
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }

    pub fn entries(&self) -> Vec<IfTableEntry> {
        self.entries.read().clone()
    }

    pub fn interface(&self, i: usize) -> Option<ClassRef> {
        return self.entries.read().get(i).map(|e| e.interface.clone());
    }

    pub fn interfaces(&self) -> Vec<ClassRef> {
        return self.entries.read().iter().map(|e| e.interface.clone()).collect();
    }

    pub fn method_array(&self, i: usize) -> Vec<MethodRef> {
        return self
            .entries
            .read()
            .get(i)
            .map_or_else(Vec::new, |e| e.methods.clone());
    }

    pub fn push(&self, entry: IfTableEntry) {
        self.entries.write().push(entry);
    }
}
