use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;

use super::class::{
    Class, ClassRef, ACC_ABSTRACT, ACC_CONSTRUCTOR, ACC_FINAL, ACC_MIRANDA, ACC_NATIVE,
    ACC_PREVERIFIED, ACC_PRIVATE, ACC_PROTECTED, ACC_PUBLIC, ACC_STATIC, ACC_SYNCHRONIZED,
};
use crate::{
    dex::{descriptor, NO_INDEX},
    memory::Address,
};

pub type MethodRef = Arc<Method>;

/// The five ways a call site can name its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvokeType {
    Static,
    Direct,
    Virtual,
    Super,
    Interface,
}

impl fmt::Display for InvokeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InvokeType::Static => "static",
            InvokeType::Direct => "direct",
            InvokeType::Virtual => "virtual",
            InvokeType::Super => "super",
            InvokeType::Interface => "interface",
        };
        f.write_str(name)
    }
}

/// Where a call into a method lands. Stubs are named rather than pointed to;
/// compiled code is an address inside a mapped artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryPoint {
    #[default]
    None,
    Compiled(Address),
    InterpreterBridge,
    ResolutionTrampoline,
    QuickToPortableBridge,
    PortableToQuickBridge,
    PortableResolutionTrampoline,
    GenericJniTrampoline,
    ImtConflictTrampoline,
    InterpreterToInterpreterBridge,
    InterpreterToCompiledCodeBridge,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryPoints {
    pub quick: EntryPoint,
    pub portable: EntryPoint,
    pub interpreter: EntryPoint,
}

pub struct Method {
    declaring_class: Weak<Class>,
    dex_method_idx: u32,
    name: String,
    signature: String,
    has_code: bool,
    access_flags: AtomicU32,
    method_index: AtomicU32,
    entry_points: Mutex<EntryPoints>,
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Method({})", self.pretty_method())
    }
}

impl Method {
    pub fn new(
        declaring_class: &ClassRef,
        dex_method_idx: u32,
        name: &str,
        signature: &str,
        access_flags: u32,
        has_code: bool,
    ) -> MethodRef {
        return Arc::new(Method {
            declaring_class: Arc::downgrade(declaring_class),
            dex_method_idx,
            name: name.to_string(),
            signature: signature.to_string(),
            has_code,
            access_flags: AtomicU32::new(access_flags),
            method_index: AtomicU32::new(0),
            entry_points: Mutex::new(EntryPoints::default()),
        });
    }

    /// A method with no declaring class, used for the resolution and
    /// interface-conflict stubs.
    pub fn new_runtime(name: &str, quick: EntryPoint) -> MethodRef {
        return Arc::new(Method {
            declaring_class: Weak::new(),
            dex_method_idx: NO_INDEX,
            name: name.to_string(),
            signature: "()V".to_string(),
            has_code: false,
            access_flags: AtomicU32::new(0),
            method_index: AtomicU32::new(0),
            entry_points: Mutex::new(EntryPoints {
                quick,
                portable: EntryPoint::PortableResolutionTrampoline,
                interpreter: EntryPoint::None,
            }),
        });
    }

    /// A distinct copy sharing the declaring class, used to materialize an
    /// abstract interface method inside an implementing class.
    pub fn copy(&self) -> MethodRef {
        return Arc::new(Method {
            declaring_class: self.declaring_class.clone(),
            dex_method_idx: self.dex_method_idx,
            name: self.name.clone(),
            signature: self.signature.clone(),
            has_code: self.has_code,
            access_flags: AtomicU32::new(self.access_flags()),
            method_index: AtomicU32::new(self.method_index() as u32),
            entry_points: Mutex::new(*self.entry_points.lock()),
        });
    }

    pub fn declaring_class(&self) -> Option<ClassRef> {
        self.declaring_class.upgrade()
    }

    pub fn is_declared_by(&self, klass: &ClassRef) -> bool {
        return std::ptr::eq(self.declaring_class.as_ptr(), Arc::as_ptr(klass));
    }

    pub fn dex_method_index(&self) -> u32 {
        self.dex_method_idx
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn shorty(&self) -> String {
        return descriptor::shorty(&self.signature).unwrap_or_default();
    }

    pub fn return_type_descriptor(&self) -> &str {
        return descriptor::parse_signature(&self.signature).map_or("V", |(_, ret)| ret);
    }

    pub fn param_type_descriptors(&self) -> Vec<&str> {
        return descriptor::parse_signature(&self.signature).map_or(vec![], |(params, _)| params);
    }

    pub fn has_code(&self) -> bool {
        self.has_code
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

    pub fn method_index(&self) -> u16 {
        self.method_index.load(Ordering::Acquire) as u16
    }

    pub fn set_method_index(&self, index: u16) {
        self.method_index.store(index as u32, Ordering::Release);
    }

    pub fn is_public(&self) -> bool {
        self.has_flag(ACC_PUBLIC)
    }

    pub fn is_private(&self) -> bool {
        self.has_flag(ACC_PRIVATE)
    }

    pub fn is_protected(&self) -> bool {
        self.has_flag(ACC_PROTECTED)
    }

    pub fn is_static(&self) -> bool {
        self.has_flag(ACC_STATIC)
    }

    pub fn is_final(&self) -> bool {
        self.has_flag(ACC_FINAL)
    }

    pub fn is_synchronized(&self) -> bool {
        self.has_flag(ACC_SYNCHRONIZED)
    }

    pub fn is_native(&self) -> bool {
        self.has_flag(ACC_NATIVE)
    }

    pub fn is_abstract(&self) -> bool {
        self.has_flag(ACC_ABSTRACT)
    }

    pub fn is_constructor(&self) -> bool {
        self.has_flag(ACC_CONSTRUCTOR)
    }

    pub fn is_miranda(&self) -> bool {
        self.has_flag(ACC_MIRANDA)
    }

    pub fn is_preverified(&self) -> bool {
        self.has_flag(ACC_PREVERIFIED)
    }

    /// Static, private and constructor methods are dispatched directly.
    pub fn is_direct(&self) -> bool {
        self.has_flag(ACC_STATIC | ACC_PRIVATE | ACC_CONSTRUCTOR)
    }

    pub fn is_class_initializer(&self) -> bool {
        return self.is_static() && self.is_constructor() && self.name == "<clinit>";
    }

    pub fn is_runtime_method(&self) -> bool {
        return self.dex_method_idx == NO_INDEX;
    }

    pub fn has_same_name_and_signature(&self, other: &Method) -> bool {
        return self.name == other.name && self.signature == other.signature;
    }

    /// Whether invoking this method with `invoke_type` is an incompatible
    /// class change.
    pub fn check_incompatible_class_change(&self, invoke_type: InvokeType) -> bool {
        match invoke_type {
            InvokeType::Static => !self.is_static(),
            InvokeType::Direct => !self.is_direct() || self.is_static(),
            InvokeType::Virtual => {
                let declared_by_interface = self
                    .declaring_class()
                    .map_or(false, |c| c.is_interface());
                self.is_direct() || (declared_by_interface && !self.is_miranda())
            }
            InvokeType::Super => false,
            InvokeType::Interface => {
                let methods_class = self.declaring_class();
                self.is_direct()
                    || !methods_class.map_or(false, |c| c.is_interface() || c.is_object_class())
            }
        }
    }

    pub fn entry_points(&self) -> EntryPoints {
        *self.entry_points.lock()
    }

    pub fn entry_point_from_quick(&self) -> EntryPoint {
        self.entry_points.lock().quick
    }

    pub fn set_entry_point_from_quick(&self, entry: EntryPoint) {
        self.entry_points.lock().quick = entry;
    }

    pub fn entry_point_from_portable(&self) -> EntryPoint {
        self.entry_points.lock().portable
    }

    pub fn set_entry_point_from_portable(&self, entry: EntryPoint) {
        self.entry_points.lock().portable = entry;
    }

    pub fn entry_point_from_interpreter(&self) -> EntryPoint {
        self.entry_points.lock().interpreter
    }

    pub fn set_entry_point_from_interpreter(&self, entry: EntryPoint) {
        self.entry_points.lock().interpreter = entry;
    }

    pub fn pretty_method(&self) -> String {
        let class = self
            .declaring_class()
            .map_or_else(|| "<runtime>".to_string(), |c| c.pretty_descriptor());
        return format!("{}.{}{}", class, self.name, self.signature);
    }
}
