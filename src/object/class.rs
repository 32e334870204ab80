use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicI8, AtomicU32, Ordering},
        Arc, Weak,
    },
    thread::ThreadId,
};

use parking_lot::{Mutex, RwLock};
use paste::paste;

use super::{
    dex_cache::DexCache,
    field::FieldRef,
    iftable::IfTable,
    method::MethodRef,
    monitor::{Monitor, ObjectLock},
    value::JValue,
};
use crate::{
    dex::{descriptor, descriptor::PrimitiveType, ClassLoadErr},
    linker::class_loader::ClassLoader,
    memory::Address,
};

pub type ClassRef = Arc<Class>;

pub const ACC_PUBLIC: u32 = 0x0001;
pub const ACC_PRIVATE: u32 = 0x0002;
pub const ACC_PROTECTED: u32 = 0x0004;
pub const ACC_STATIC: u32 = 0x0008;
pub const ACC_FINAL: u32 = 0x0010;
pub const ACC_SYNCHRONIZED: u32 = 0x0020;
pub const ACC_VOLATILE: u32 = 0x0040;
pub const ACC_TRANSIENT: u32 = 0x0080;
pub const ACC_NATIVE: u32 = 0x0100;
pub const ACC_INTERFACE: u32 = 0x0200;
pub const ACC_ABSTRACT: u32 = 0x0400;
pub const ACC_SYNTHETIC: u32 = 0x1000;
pub const ACC_ENUM: u32 = 0x4000;
pub const ACC_JAVA_FLAGS_MASK: u32 = 0xffff;

pub const ACC_CONSTRUCTOR: u32 = 0x0001_0000;
pub const ACC_DECLARED_SYNCHRONIZED: u32 = 0x0002_0000;
pub const ACC_CLASS_IS_PROXY: u32 = 0x0004_0000;
pub const ACC_PREVERIFIED: u32 = 0x0008_0000;
pub const ACC_MIRANDA: u32 = 0x0020_0000;

pub const ACC_CLASS_IS_FINALIZABLE: u32 = 0x8000_0000;
pub const ACC_CLASS_IS_REFERENCE: u32 = 0x0800_0000;
pub const ACC_CLASS_IS_WEAK_REFERENCE: u32 = 0x0400_0000;
pub const ACC_CLASS_IS_FINALIZER_REFERENCE: u32 = 0x0200_0000;
pub const ACC_CLASS_IS_PHANTOM_REFERENCE: u32 = 0x0100_0000;
pub const ACC_REFERENCE_FLAGS_MASK: u32 = ACC_CLASS_IS_REFERENCE
    | ACC_CLASS_IS_WEAK_REFERENCE
    | ACC_CLASS_IS_FINALIZER_REFERENCE
    | ACC_CLASS_IS_PHANTOM_REFERENCE;

/// Size of the object header every instance starts with.
pub const OBJECT_HEADER_SIZE: u32 = 8;
/// Size of a class object before its static field area.
pub const CLASS_HEADER_SIZE: u32 = 128;

pub const CLASS_HIGH_BIT: u32 = 0x8000_0000;
/// Reference offset bitmap value meaning "walk the superclass chain".
pub const CLASS_WALK_SUPER: u32 = 3;

/// Bit in a reference offset bitmap that stands for a reference at `offset`.
pub const fn class_offset_bit(offset: u32) -> u32 {
    return CLASS_HIGH_BIT >> (offset / 4);
}

/// Whether `offset` can be described by a reference offset bitmap.
pub const fn is_encodable_offset(offset: u32) -> bool {
    return offset / 4 < 32;
}

#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ClassStatus {
    Error = -1,
    NotReady = 0,
    Idx = 1,
    Loaded = 2,
    Resolved = 3,
    Verifying = 4,
    RetryVerificationAtRuntime = 5,
    VerifyingAtRuntime = 6,
    Verified = 7,
    Initializing = 8,
    Initialized = 9,
}

impl ClassStatus {
    pub fn from_i8(value: i8) -> ClassStatus {
        match value {
            -1 => ClassStatus::Error,
            1 => ClassStatus::Idx,
            2 => ClassStatus::Loaded,
            3 => ClassStatus::Resolved,
            4 => ClassStatus::Verifying,
            5 => ClassStatus::RetryVerificationAtRuntime,
            6 => ClassStatus::VerifyingAtRuntime,
            7 => ClassStatus::Verified,
            8 => ClassStatus::Initializing,
            9 => ClassStatus::Initialized,
            _ => ClassStatus::NotReady,
        }
    }
}

/// State filled in while a class is loaded and linked.
#[derive(Default)]
struct ClassData {
    super_class: Option<ClassRef>,
    component_type: Option<ClassRef>,
    primitive_type: Option<PrimitiveType>,
    dex_cache: Option<Arc<DexCache>>,
    dex_class_def_idx: Option<u16>,
    dex_type_idx: Option<u16>,
    interfaces: Vec<ClassRef>,
    sfields: Vec<FieldRef>,
    ifields: Vec<FieldRef>,
    direct_methods: Vec<MethodRef>,
    virtual_methods: Vec<MethodRef>,
    vtable: Option<Arc<[MethodRef]>>,
    iftable: Option<Arc<IfTable>>,
    imtable: Option<Arc<[MethodRef]>>,
    object_size: u32,
    class_size: u32,
    num_reference_instance_fields: u32,
    num_reference_static_fields: u32,
    reference_instance_offsets: u32,
    reference_static_offsets: u32,
}

macro_rules! class_data_accessors {
    ($($name:ident: $ty:ty),* $(,)?) => {
        paste! {
            $(
                pub fn $name(&self) -> $ty {
                    self.data.read().$name.clone()
                }

                pub fn [<set_ $name>](&self, value: $ty) {
                    self.data.write().$name = value;
                }
            )*
        }
    };
}

/// Runtime representation of a loaded class, array class or primitive type.
pub struct Class {
    descriptor: String,
    loader: Option<Weak<ClassLoader>>,
    storage: Address,
    status: AtomicI8,
    access_flags: AtomicU32,
    monitor: Monitor,
    clinit_thread: Mutex<Option<ThreadId>>,
    failure: Mutex<Option<ClassLoadErr>>,
    data: RwLock<ClassData>,
    statics: Mutex<HashMap<u32, JValue>>,
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Class({}, {:?})", self.descriptor, self.status())
    }
}

impl Class {
    pub fn new(
        descriptor: &str,
        loader: Option<&Arc<ClassLoader>>,
        storage: Address,
        class_size: u32,
    ) -> ClassRef {
        let data = ClassData {
            class_size,
            ..Default::default()
        };
        return Arc::new(Class {
            descriptor: descriptor.to_string(),
            loader: loader.map(Arc::downgrade),
            storage,
            status: AtomicI8::new(ClassStatus::NotReady as i8),
            access_flags: AtomicU32::new(0),
            monitor: Monitor::new(),
            clinit_thread: Mutex::new(None),
            failure: Mutex::new(None),
            data: RwLock::new(data),
            statics: Mutex::new(HashMap::new()),
        });
    }

    class_data_accessors!(
        super_class: Option<ClassRef>,
        component_type: Option<ClassRef>,
        dex_cache: Option<Arc<DexCache>>,
        dex_class_def_idx: Option<u16>,
        dex_type_idx: Option<u16>,
        interfaces: Vec<ClassRef>,
        sfields: Vec<FieldRef>,
        ifields: Vec<FieldRef>,
        direct_methods: Vec<MethodRef>,
        virtual_methods: Vec<MethodRef>,
        vtable: Option<Arc<[MethodRef]>>,
        iftable: Option<Arc<IfTable>>,
        imtable: Option<Arc<[MethodRef]>>,
        object_size: u32,
        class_size: u32,
        num_reference_instance_fields: u32,
        num_reference_static_fields: u32,
        reference_instance_offsets: u32,
        reference_static_offsets: u32,
    );

    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn pretty_descriptor(&self) -> String {
        return descriptor::pretty_descriptor(&self.descriptor);
    }

    pub fn storage(&self) -> Address {
        self.storage
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn lock(&self) -> ObjectLock<'_> {
        return ObjectLock::new(&self.monitor);
    }

    /// The defining loader; `None` for the boot loader or a collected loader.
    pub fn loader(&self) -> Option<Arc<ClassLoader>> {
        return self.loader.as_ref().and_then(|l| l.upgrade());
    }

    pub fn is_boot_class(&self) -> bool {
        self.loader.is_none()
    }

    /// Identity of the defining loader, zero for the boot loader.
    pub fn loader_id(&self) -> usize {
        return match &self.loader {
            Some(loader) => loader.as_ptr() as usize,
            None => 0,
        };
    }

    pub fn has_same_loader(&self, other: &Class) -> bool {
        return self.loader_id() == other.loader_id();
    }

    pub fn status(&self) -> ClassStatus {
        return ClassStatus::from_i8(self.status.load(Ordering::Acquire));
    }

    /// Publishes a new status and wakes anything waiting on the monitor.
    /// Status only moves forward, apart from the move to `Error`.
    pub fn set_status(&self, new_status: ClassStatus) {
        let old_status = self.status();
        if new_status != ClassStatus::Error {
            debug_assert!(
                old_status != ClassStatus::Error,
                "{}: status change {:?} -> {:?} on erroneous class",
                self.descriptor,
                old_status,
                new_status
            );
        }
        log::trace!("{} status {:?} -> {:?}", self.descriptor, old_status, new_status);
        self.status.store(new_status as i8, Ordering::Release);
        self.monitor.notify_all();
    }

    /// Marks the class erroneous, remembering the first cause recorded.
    pub fn set_erroneous(&self, cause: &ClassLoadErr) {
        {
            let mut failure = self.failure.lock();
            if failure.is_none() {
                *failure = Some(cause.clone());
            }
        }
        self.set_status(ClassStatus::Error);
    }

    pub fn failure(&self) -> Option<ClassLoadErr> {
        return self.failure.lock().clone();
    }

    /// The throwable reported to callers that touch a class already in the
    /// error state.
    pub fn earlier_failure(&self) -> ClassLoadErr {
        return match self.failure() {
            Some(ClassLoadErr::Verify(msg)) => ClassLoadErr::Verify(msg),
            Some(cause) => ClassLoadErr::NoClassDefFound(format!(
                "{} (earlier failure: {})",
                self.pretty_descriptor(),
                cause
            )),
            None => ClassLoadErr::NoClassDefFound(self.pretty_descriptor()),
        };
    }

    pub fn is_erroneous(&self) -> bool {
        self.status() == ClassStatus::Error
    }

    pub fn is_idx_loaded(&self) -> bool {
        self.status() >= ClassStatus::Idx
    }

    pub fn is_loaded(&self) -> bool {
        self.status() >= ClassStatus::Loaded
    }

    pub fn is_resolved(&self) -> bool {
        self.status() >= ClassStatus::Resolved
    }

    pub fn is_compile_time_verified(&self) -> bool {
        self.status() >= ClassStatus::RetryVerificationAtRuntime
    }

    pub fn is_verified(&self) -> bool {
        self.status() >= ClassStatus::Verified
    }

    pub fn is_initializing(&self) -> bool {
        self.status() >= ClassStatus::Initializing
    }

    pub fn is_initialized(&self) -> bool {
        self.status() == ClassStatus::Initialized
    }

    pub fn clinit_thread(&self) -> Option<ThreadId> {
        *self.clinit_thread.lock()
    }

    pub fn set_clinit_thread(&self, thread: Option<ThreadId>) {
        *self.clinit_thread.lock() = thread;
    }

    pub fn access_flags(&self) -> u32 {
        self.access_flags.load(Ordering::Acquire)
    }

    pub fn set_access_flags(&self, flags: u32) {
        self.access_flags.store(flags, Ordering::Release);
    }

    pub fn add_access_flags(&self, flags: u32) {
        self.access_flags.fetch_or(flags, Ordering::AcqRel);
    }

    fn has_flag(&self, flag: u32) -> bool {
        self.access_flags() & flag != 0
    }

    pub fn is_public(&self) -> bool {
        self.has_flag(ACC_PUBLIC)
    }

    pub fn is_final(&self) -> bool {
        self.has_flag(ACC_FINAL)
    }

    pub fn is_interface(&self) -> bool {
        self.has_flag(ACC_INTERFACE)
    }

    pub fn is_abstract(&self) -> bool {
        self.has_flag(ACC_ABSTRACT)
    }

    pub fn is_finalizable(&self) -> bool {
        self.has_flag(ACC_CLASS_IS_FINALIZABLE)
    }

    pub fn set_finalizable(&self) {
        self.add_access_flags(ACC_CLASS_IS_FINALIZABLE);
    }

    pub fn is_proxy_class(&self) -> bool {
        self.has_flag(ACC_CLASS_IS_PROXY)
    }

    pub fn is_reference_class(&self) -> bool {
        self.has_flag(ACC_CLASS_IS_REFERENCE)
    }

    pub fn is_weak_reference_class(&self) -> bool {
        self.has_flag(ACC_CLASS_IS_WEAK_REFERENCE)
    }

    pub fn is_finalizer_reference_class(&self) -> bool {
        self.has_flag(ACC_CLASS_IS_FINALIZER_REFERENCE)
    }

    pub fn is_phantom_reference_class(&self) -> bool {
        self.has_flag(ACC_CLASS_IS_PHANTOM_REFERENCE)
    }

    pub fn primitive_type(&self) -> PrimitiveType {
        return self
            .data
            .read()
            .primitive_type
            .unwrap_or(PrimitiveType::Not);
    }

    pub fn set_primitive_type(&self, primitive_type: PrimitiveType) {
        self.data.write().primitive_type = Some(primitive_type);
    }

    pub fn is_primitive(&self) -> bool {
        self.primitive_type() != PrimitiveType::Not
    }

    pub fn is_array_class(&self) -> bool {
        return self.descriptor.starts_with('[');
    }

    pub fn is_object_class(&self) -> bool {
        return self.descriptor == "Ljava/lang/Object;" && self.is_boot_class();
    }

    pub fn vtable_len(&self) -> usize {
        return self.data.read().vtable.as_ref().map_or(0, |v| v.len());
    }

    pub fn iftable_count(&self) -> usize {
        return self.data.read().iftable.as_ref().map_or(0, |t| t.count());
    }

    pub fn same_dex_cache(&self, dex_cache: &Arc<DexCache>) -> bool {
        return self
            .data
            .read()
            .dex_cache
            .as_ref()
            .map_or(false, |own| Arc::ptr_eq(own, dex_cache));
    }

    pub fn is_sub_class(&self, klass: &Class) -> bool {
        if std::ptr::eq(self, klass) {
            return true;
        }
        let mut current = self.super_class();
        while let Some(c) = current {
            if std::ptr::eq(c.as_ref(), klass) {
                return true;
            }
            current = c.super_class();
        }
        return false;
    }

    fn element_class(klass: ClassRef) -> ClassRef {
        let mut klass = klass;
        while let Some(component) = klass.component_type() {
            klass = component;
        }
        return klass;
    }

    pub fn is_in_same_package(self: &Arc<Self>, that: &ClassRef) -> bool {
        if Arc::ptr_eq(self, that) {
            return true;
        }
        if !self.has_same_loader(that) {
            return false;
        }
        let klass1 = Self::element_class(self.clone());
        let klass2 = Self::element_class(that.clone());
        if Arc::ptr_eq(&klass1, &klass2) {
            return true;
        }
        return descriptor::is_same_package(klass1.descriptor(), klass2.descriptor());
    }

    /// Whether code in this class may refer to `that`.
    pub fn can_access(self: &Arc<Self>, that: &ClassRef) -> bool {
        return that.is_public() || self.is_in_same_package(that);
    }

    /// Whether code in this class may use a member of `access_to` with the
    /// given flags.
    pub fn can_access_member(self: &Arc<Self>, access_to: &ClassRef, member_flags: u32) -> bool {
        if Arc::ptr_eq(self, access_to) {
            return true;
        }
        if member_flags & ACC_PUBLIC != 0 {
            return true;
        }
        if member_flags & ACC_PRIVATE != 0 {
            return false;
        }
        if member_flags & ACC_PROTECTED != 0 && self.is_sub_class(access_to) {
            return true;
        }
        return self.is_in_same_package(access_to);
    }

    pub fn set_preverified_flag_on_all_methods(&self) {
        let data = self.data.read();
        for method in data.direct_methods.iter().chain(data.virtual_methods.iter()) {
            if !method.is_native() && !method.is_abstract() {
                method.add_access_flags(ACC_PREVERIFIED);
            }
        }
    }

    pub fn find_declared_direct_method(&self, name: &str, signature: &str) -> Option<MethodRef> {
        return self
            .data
            .read()
            .direct_methods
            .iter()
            .find(|m| m.name() == name && m.signature() == signature)
            .cloned();
    }

    pub fn find_declared_direct_method_by_idx(
        &self,
        dex_cache: &Arc<DexCache>,
        dex_method_idx: u32,
    ) -> Option<MethodRef> {
        if !self.same_dex_cache(dex_cache) {
            return None;
        }
        return self
            .data
            .read()
            .direct_methods
            .iter()
            .find(|m| m.dex_method_index() == dex_method_idx)
            .cloned();
    }

    pub fn find_direct_method(&self, name: &str, signature: &str) -> Option<MethodRef> {
        if let Some(method) = self.find_declared_direct_method(name, signature) {
            return Some(method);
        }
        let mut klass = self.super_class();
        while let Some(k) = klass {
            if let Some(method) = k.find_declared_direct_method(name, signature) {
                return Some(method);
            }
            klass = k.super_class();
        }
        return None;
    }

    pub fn find_direct_method_by_idx(
        &self,
        dex_cache: &Arc<DexCache>,
        dex_method_idx: u32,
    ) -> Option<MethodRef> {
        if let Some(method) = self.find_declared_direct_method_by_idx(dex_cache, dex_method_idx) {
            return Some(method);
        }
        let mut klass = self.super_class();
        while let Some(k) = klass {
            if let Some(method) = k.find_declared_direct_method_by_idx(dex_cache, dex_method_idx) {
                return Some(method);
            }
            klass = k.super_class();
        }
        return None;
    }

    pub fn find_declared_virtual_method(&self, name: &str, signature: &str) -> Option<MethodRef> {
        return self
            .data
            .read()
            .virtual_methods
            .iter()
            .find(|m| m.name() == name && m.signature() == signature)
            .cloned();
    }

    pub fn find_declared_virtual_method_by_idx(
        &self,
        dex_cache: &Arc<DexCache>,
        dex_method_idx: u32,
    ) -> Option<MethodRef> {
        if !self.same_dex_cache(dex_cache) {
            return None;
        }
        return self
            .data
            .read()
            .virtual_methods
            .iter()
            .find(|m| m.dex_method_index() == dex_method_idx && !m.is_miranda())
            .cloned();
    }

    pub fn find_virtual_method(&self, name: &str, signature: &str) -> Option<MethodRef> {
        if let Some(method) = self.find_declared_virtual_method(name, signature) {
            return Some(method);
        }
        let mut klass = self.super_class();
        while let Some(k) = klass {
            if let Some(method) = k.find_declared_virtual_method(name, signature) {
                return Some(method);
            }
            klass = k.super_class();
        }
        return None;
    }

    pub fn find_virtual_method_by_idx(
        &self,
        dex_cache: &Arc<DexCache>,
        dex_method_idx: u32,
    ) -> Option<MethodRef> {
        if let Some(method) = self.find_declared_virtual_method_by_idx(dex_cache, dex_method_idx) {
            return Some(method);
        }
        let mut klass = self.super_class();
        while let Some(k) = klass {
            if let Some(method) = k.find_declared_virtual_method_by_idx(dex_cache, dex_method_idx)
            {
                return Some(method);
            }
            klass = k.super_class();
        }
        return None;
    }

    /// Searches this class's declared virtuals, then every interface in its
    /// interface table.
    pub fn find_interface_method(&self, name: &str, signature: &str) -> Option<MethodRef> {
        if let Some(method) = self.find_declared_virtual_method(name, signature) {
            return Some(method);
        }
        if let Some(iftable) = self.iftable() {
            for interface in iftable.interfaces() {
                if let Some(method) = interface.find_declared_virtual_method(name, signature) {
                    return Some(method);
                }
            }
        }
        return None;
    }

    pub fn find_interface_method_by_idx(
        &self,
        dex_cache: &Arc<DexCache>,
        dex_method_idx: u32,
    ) -> Option<MethodRef> {
        if let Some(method) = self.find_declared_virtual_method_by_idx(dex_cache, dex_method_idx) {
            return Some(method);
        }
        if let Some(iftable) = self.iftable() {
            for interface in iftable.interfaces() {
                if let Some(method) =
                    interface.find_declared_virtual_method_by_idx(dex_cache, dex_method_idx)
                {
                    return Some(method);
                }
            }
        }
        return None;
    }

    pub fn find_class_initializer(&self) -> Option<MethodRef> {
        return self
            .data
            .read()
            .direct_methods
            .iter()
            .find(|m| m.is_class_initializer())
            .cloned();
    }

    pub fn find_declared_instance_field(&self, name: &str, type_desc: &str) -> Option<FieldRef> {
        return self
            .data
            .read()
            .ifields
            .iter()
            .find(|f| f.name() == name && f.type_descriptor() == type_desc)
            .cloned();
    }

    pub fn find_declared_instance_field_by_idx(
        &self,
        dex_cache: &Arc<DexCache>,
        dex_field_idx: u32,
    ) -> Option<FieldRef> {
        if !self.same_dex_cache(dex_cache) {
            return None;
        }
        return self
            .data
            .read()
            .ifields
            .iter()
            .find(|f| f.dex_field_index() == dex_field_idx)
            .cloned();
    }

    pub fn find_instance_field(&self, name: &str, type_desc: &str) -> Option<FieldRef> {
        if let Some(field) = self.find_declared_instance_field(name, type_desc) {
            return Some(field);
        }
        let mut klass = self.super_class();
        while let Some(k) = klass {
            if let Some(field) = k.find_declared_instance_field(name, type_desc) {
                return Some(field);
            }
            klass = k.super_class();
        }
        return None;
    }

    pub fn find_instance_field_by_idx(
        &self,
        dex_cache: &Arc<DexCache>,
        dex_field_idx: u32,
    ) -> Option<FieldRef> {
        if let Some(field) = self.find_declared_instance_field_by_idx(dex_cache, dex_field_idx) {
            return Some(field);
        }
        let mut klass = self.super_class();
        while let Some(k) = klass {
            if let Some(field) = k.find_declared_instance_field_by_idx(dex_cache, dex_field_idx) {
                return Some(field);
            }
            klass = k.super_class();
        }
        return None;
    }

    pub fn find_declared_static_field(&self, name: &str, type_desc: &str) -> Option<FieldRef> {
        return self
            .data
            .read()
            .sfields
            .iter()
            .find(|f| f.name() == name && f.type_descriptor() == type_desc)
            .cloned();
    }

    pub fn find_declared_static_field_by_idx(
        &self,
        dex_cache: &Arc<DexCache>,
        dex_field_idx: u32,
    ) -> Option<FieldRef> {
        if !self.same_dex_cache(dex_cache) {
            return None;
        }
        return self
            .data
            .read()
            .sfields
            .iter()
            .find(|f| f.dex_field_index() == dex_field_idx)
            .cloned();
    }

    /// Own statics, then direct superinterfaces, then up the superclass chain.
    pub fn find_static_field(&self, name: &str, type_desc: &str) -> Option<FieldRef> {
        if let Some(field) = self.find_declared_static_field(name, type_desc) {
            return Some(field);
        }
        for interface in self.interfaces() {
            if let Some(field) = interface.find_static_field(name, type_desc) {
                return Some(field);
            }
        }
        return self
            .super_class()
            .and_then(|k| k.find_static_field(name, type_desc));
    }

    pub fn find_static_field_by_idx(
        &self,
        dex_cache: &Arc<DexCache>,
        dex_field_idx: u32,
    ) -> Option<FieldRef> {
        if let Some(field) = self.find_declared_static_field_by_idx(dex_cache, dex_field_idx) {
            return Some(field);
        }
        for interface in self.interfaces() {
            if let Some(field) = interface.find_static_field_by_idx(dex_cache, dex_field_idx) {
                return Some(field);
            }
        }
        return self
            .super_class()
            .and_then(|k| k.find_static_field_by_idx(dex_cache, dex_field_idx));
    }

    /// Field lookup in JLS order: own
    /// fields, superinterfaces, then the superclass.
    pub fn find_field(&self, name: &str, type_desc: &str) -> Option<FieldRef> {
        if let Some(field) = self.find_declared_instance_field(name, type_desc) {
            return Some(field);
        }
        if let Some(field) = self.find_declared_static_field(name, type_desc) {
            return Some(field);
        }
        for interface in self.interfaces() {
            if let Some(field) = interface.find_static_field(name, type_desc) {
                return Some(field);
            }
        }
        return self.super_class().and_then(|k| k.find_field(name, type_desc));
    }

    pub fn get_static(&self, offset: u32) -> Option<JValue> {
        return self.statics.lock().get(&offset).cloned();
    }

    pub fn set_static(&self, offset: u32, value: JValue) {
        self.statics.lock().insert(offset, value);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        class_offset_bit, is_encodable_offset, Class, ClassStatus, ACC_PRIVATE, ACC_PROTECTED,
        ACC_PUBLIC, CLASS_HEADER_SIZE,
    };
    use crate::{dex::ClassLoadErr, linker::class_loader::ClassLoader, memory::Address};

    fn class(descriptor: &str) -> Arc<Class> {
        return Class::new(descriptor, None, Address::null(), CLASS_HEADER_SIZE);
    }

    #[test]
    fn offset_bitmap_encoding() {
        assert_eq!(class_offset_bit(0), 0x8000_0000);
        assert_eq!(class_offset_bit(8), 0x2000_0000);
        assert!(is_encodable_offset(124));
        assert!(!is_encodable_offset(128));
    }

    #[test]
    fn status_ordering() {
        let klass = class("LFoo;");
        assert_eq!(klass.status(), ClassStatus::NotReady);
        klass.set_status(ClassStatus::Loaded);
        assert!(klass.is_loaded());
        assert!(!klass.is_resolved());
        klass.set_status(ClassStatus::RetryVerificationAtRuntime);
        assert!(klass.is_compile_time_verified());
        assert!(!klass.is_verified());
        assert!(ClassStatus::Error < ClassStatus::NotReady);
    }

    #[test]
    fn first_failure_is_kept() {
        let klass = class("LFoo;");
        klass.set_erroneous(&ClassLoadErr::Verify("bad branch".to_string()));
        klass.set_erroneous(&ClassLoadErr::NoClassDefFound("other".to_string()));
        assert!(klass.is_erroneous());
        assert_eq!(
            klass.earlier_failure(),
            ClassLoadErr::Verify("bad branch".to_string())
        );
    }

    #[test]
    fn package_access_needs_same_loader() {
        let object = class("Ljava/lang/Object;");
        let a = class("Lcom/x/A;");
        let b = class("Lcom/x/B;");
        let c = class("Lcom/y/C;");
        b.set_super_class(Some(object.clone()));
        c.set_super_class(Some(b.clone()));
        assert!(a.is_in_same_package(&b));
        assert!(!a.is_in_same_package(&c));
        assert!(a.can_access_member(&b, 0));
        assert!(!a.can_access_member(&b, ACC_PRIVATE));
        assert!(c.can_access_member(&b, ACC_PROTECTED));
        assert!(!a.can_access_member(&c, ACC_PROTECTED));
        assert!(a.can_access_member(&c, ACC_PUBLIC));
        assert!(!a.can_access(&c));

        let loader = ClassLoader::new("app", None, vec![]);
        let other = Class::new("Lcom/x/D;", Some(&loader), Address::null(), CLASS_HEADER_SIZE);
        assert!(!a.is_in_same_package(&other));
        assert!(c.is_sub_class(&object));
        assert!(!object.is_sub_class(&c));
    }
}
