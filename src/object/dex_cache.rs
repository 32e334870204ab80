use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use super::{class::ClassRef, field::FieldRef, method::MethodRef};
use crate::{
    dex::DexFile,
    memory::{Address, HEAP_REFERENCE_SIZE},
};

/// Per-dex-file memo of resolved strings, types, methods and fields.
///
/// Each slot is written at most once. A racing writer observes the value
/// that got there first, so every reader of a slot sees the same object.
pub struct DexCache {
    dex_file: Arc<DexFile>,
    storage: Address,
    strings: Box<[OnceLock<Arc<str>>]>,
    types: Box<[OnceLock<ClassRef>]>,
    methods: Box<[OnceLock<MethodRef>]>,
    fields: Box<[OnceLock<FieldRef>]>,
}

impl fmt::Debug for DexCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DexCache({})", self.dex_file.location())
    }
}

fn slots<T>(len: usize) -> Box<[OnceLock<T>]> {
    return (0..len).map(|_| OnceLock::new()).collect();
}

impl DexCache {
    pub const HEADER_SIZE: usize = 32;

    /// Bytes of managed storage a cache for `dex_file` occupies.
    pub fn storage_size(dex_file: &DexFile) -> usize {
        let slots = dex_file.num_string_ids()
            + dex_file.num_type_ids()
            + dex_file.num_method_ids()
            + dex_file.num_field_ids();
        return Self::HEADER_SIZE + slots * HEAP_REFERENCE_SIZE;
    }

    pub fn new(dex_file: Arc<DexFile>, storage: Address) -> DexCache {
        return DexCache {
            strings: slots(dex_file.num_string_ids()),
            types: slots(dex_file.num_type_ids()),
            methods: slots(dex_file.num_method_ids()),
            fields: slots(dex_file.num_field_ids()),
            dex_file,
            storage,
        };
    }

    pub fn dex_file(&self) -> &Arc<DexFile> {
        &self.dex_file
    }

    pub fn location(&self) -> &str {
        self.dex_file.location()
    }

    pub fn storage(&self) -> Address {
        self.storage
    }

    pub fn resolved_string(&self, string_idx: u32) -> Option<Arc<str>> {
        self.strings.get(string_idx as usize)?.get().cloned()
    }

    pub fn set_resolved_string(&self, string_idx: u32, value: Arc<str>) -> Arc<str> {
        return match self.strings.get(string_idx as usize) {
            Some(slot) => slot.get_or_init(|| value).clone(),
            None => value,
        };
    }

    pub fn resolved_type(&self, type_idx: u16) -> Option<ClassRef> {
        self.types.get(type_idx as usize)?.get().cloned()
    }

    pub fn set_resolved_type(&self, type_idx: u16, klass: ClassRef) -> ClassRef {
        return match self.types.get(type_idx as usize) {
            Some(slot) => slot.get_or_init(|| klass).clone(),
            None => klass,
        };
    }

    pub fn resolved_method(&self, method_idx: u32) -> Option<MethodRef> {
        self.methods.get(method_idx as usize)?.get().cloned()
    }

    pub fn set_resolved_method(&self, method_idx: u32, method: MethodRef) -> MethodRef {
        return match self.methods.get(method_idx as usize) {
            Some(slot) => slot.get_or_init(|| method).clone(),
            None => method,
        };
    }

    pub fn resolved_field(&self, field_idx: u32) -> Option<FieldRef> {
        self.fields.get(field_idx as usize)?.get().cloned()
    }

    pub fn set_resolved_field(&self, field_idx: u32, field: FieldRef) -> FieldRef {
        return match self.fields.get(field_idx as usize) {
            Some(slot) => slot.get_or_init(|| field).clone(),
            None => field,
        };
    }

    pub fn num_resolved_types(&self) -> usize {
        return self.types.iter().filter(|slot| slot.get().is_some()).count();
    }

    /// Visits every resolved type slot.
    pub fn visit_resolved_types<F: FnMut(&ClassRef)>(&self, mut visitor: F) {
        for klass in self.types.iter().filter_map(|slot| slot.get()) {
            visitor(klass);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::DexCache;
    use crate::{
        dex::{ClassDefBuilder, DexFileBuilder},
        memory::Address,
        object::class::{Class, ACC_PUBLIC, CLASS_HEADER_SIZE},
    };

    #[test]
    fn slots_are_write_once() {
        let mut builder = DexFileBuilder::new("test.dex", 1);
        builder.add_class(ClassDefBuilder::new("LA;", ACC_PUBLIC));
        builder.string_ref("hello");
        let dex = Arc::new(builder.build());
        let cache = DexCache::new(dex.clone(), Address::null());
        assert!(DexCache::storage_size(&dex) > DexCache::HEADER_SIZE);

        let first = Class::new("LA;", None, Address::null(), CLASS_HEADER_SIZE);
        let second = Class::new("LA;", None, Address::null(), CLASS_HEADER_SIZE);
        assert!(cache.resolved_type(0).is_none());
        let winner = cache.set_resolved_type(0, first.clone());
        let loser = cache.set_resolved_type(0, second);
        assert!(Arc::ptr_eq(&winner, &first));
        assert!(Arc::ptr_eq(&loser, &first));
        assert_eq!(cache.num_resolved_types(), 1);
    }

    #[test]
    fn out_of_range_slots_are_never_filled() {
        let mut builder = DexFileBuilder::new("test.dex", 1);
        builder.add_class(ClassDefBuilder::new("LA;", ACC_PUBLIC));
        let dex = Arc::new(builder.build());
        let cache = DexCache::new(dex.clone(), Address::null());
        let past_end = dex.num_type_ids() as u16;
        assert!(cache.resolved_type(past_end).is_none());
        let klass = Class::new("LA;", None, Address::null(), CLASS_HEADER_SIZE);
        let returned = cache.set_resolved_type(past_end, klass.clone());
        assert!(Arc::ptr_eq(&returned, &klass));
        assert!(cache.resolved_type(past_end).is_none());
        assert!(cache.resolved_method(u32::MAX).is_none());
        assert!(cache.resolved_field(u32::MAX).is_none());
        assert!(cache.resolved_string(u32::MAX).is_none());
    }
}
