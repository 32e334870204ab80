//! Turns class definitions from dex files into linked, verified and
//! initialized runtime classes.

pub mod bootstrap;
pub mod class_loader;
pub mod class_table;
pub mod define;
pub mod fields;
pub mod init;
pub mod link;
pub mod resolve;
pub mod roots;
pub mod verify;

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use parking_lot::RwLock;

use self::{
    class_loader::ClassLoader,
    class_table::{ClassTable, VisitRootFlags},
    roots::ClassRoot,
};
use crate::{
    dex::{ClassLoadErr, DexFile},
    image::ImageSpace,
    memory::Allocator,
    oat::manager::OatFileManager,
    object::{intern::InternTable, ClassRef, DexCache, EntryPoint, IfTable, Method, MethodRef},
};

/// Number of slots in a class's interface method table.
pub const IMT_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NoFailure,
    /// The class may run, but some of its code must be checked again at
    /// runtime.
    SoftFailure,
    HardFailure,
}

/// Bytecode verifier used by [`ClassLinker::verify_class`].
pub trait Verifier: Send + Sync {
    /// Returns the outcome and, for failures, a message for the error.
    fn verify_class(&self, klass: &ClassRef, is_compiler: bool) -> (FailureKind, String);
}

/// Accepts every class.
pub struct PermissiveVerifier;

impl Verifier for PermissiveVerifier {
    fn verify_class(&self, _klass: &ClassRef, _is_compiler: bool) -> (FailureKind, String) {
        return (FailureKind::NoFailure, String::new());
    }
}

/// Executes `<clinit>` on behalf of [`ClassLinker::initialize_class`].
pub trait ClassInitializerRunner: Send + Sync {
    fn run_class_initializer(
        &self,
        linker: &ClassLinker,
        klass: &ClassRef,
        clinit: &MethodRef,
    ) -> Result<(), ClassLoadErr>;
}

/// Treats every class initializer as an empty method.
pub struct NoopInitializerRunner;

impl ClassInitializerRunner for NoopInitializerRunner {
    fn run_class_initializer(
        &self,
        _linker: &ClassLinker,
        klass: &ClassRef,
        _clinit: &MethodRef,
    ) -> Result<(), ClassLoadErr> {
        log::trace!("Skipping <clinit> of {}", klass.pretty_descriptor());
        return Ok(());
    }
}

pub struct ClassLinker {
    heap: Arc<dyn Allocator>,
    class_table: ClassTable,
    dex_caches: RwLock<Vec<Arc<DexCache>>>,
    boot_class_path: RwLock<Vec<Arc<DexFile>>>,
    class_roots: RwLock<Vec<Option<ClassRef>>>,
    /// Shared by every array class: `Cloneable` and `Serializable`.
    array_iftable: RwLock<Arc<IfTable>>,
    intern_table: InternTable,
    oat_manager: Arc<OatFileManager>,
    verifier: Arc<dyn Verifier>,
    clinit_runner: Arc<dyn ClassInitializerRunner>,
    init_done: AtomicBool,
    is_compiler: bool,
    verification_enabled: bool,
    resolution_method: MethodRef,
    imt_conflict_method: MethodRef,
    imt_unimplemented_method: MethodRef,
    default_imt: Arc<[MethodRef]>,
    num_class_inits: AtomicUsize,
}

impl ClassLinker {
    pub fn new(
        heap: Arc<dyn Allocator>,
        oat_manager: Arc<OatFileManager>,
        image: Option<ImageSpace>,
    ) -> ClassLinker {
        let imt_unimplemented_method =
            Method::new_runtime("<runtime internal imt unimplemented method>", EntryPoint::ImtConflictTrampoline);
        let default_imt: Arc<[MethodRef]> = vec![imt_unimplemented_method.clone(); IMT_SIZE].into();
        return ClassLinker {
            heap,
            class_table: ClassTable::new(image),
            dex_caches: RwLock::new(vec![]),
            boot_class_path: RwLock::new(vec![]),
            class_roots: RwLock::new(vec![None; ClassRoot::ALL.len()]),
            array_iftable: RwLock::new(Arc::new(IfTable::default())),
            intern_table: InternTable::new(),
            oat_manager,
            verifier: Arc::new(PermissiveVerifier),
            clinit_runner: Arc::new(NoopInitializerRunner),
            init_done: AtomicBool::new(false),
            is_compiler: false,
            verification_enabled: true,
            resolution_method: Method::new_runtime(
                "<runtime internal resolution method>",
                EntryPoint::ResolutionTrampoline,
            ),
            imt_conflict_method: Method::new_runtime(
                "<runtime internal imt conflict method>",
                EntryPoint::ImtConflictTrampoline,
            ),
            imt_unimplemented_method,
            default_imt,
            num_class_inits: AtomicUsize::new(0),
        };
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_initializer_runner(mut self, runner: Arc<dyn ClassInitializerRunner>) -> Self {
        self.clinit_runner = runner;
        self
    }

    /// Ahead-of-time mode: no compiled code is linked and soft verification
    /// failures are left for the runtime.
    pub fn with_compiler_mode(mut self, is_compiler: bool) -> Self {
        self.is_compiler = is_compiler;
        self
    }

    pub fn with_verification(mut self, enabled: bool) -> Self {
        self.verification_enabled = enabled;
        self
    }

    pub fn is_compiler(&self) -> bool {
        self.is_compiler
    }

    pub fn is_init_done(&self) -> bool {
        self.init_done.load(Ordering::Acquire)
    }

    pub fn heap(&self) -> &Arc<dyn Allocator> {
        &self.heap
    }

    pub fn intern_table(&self) -> &InternTable {
        &self.intern_table
    }

    pub fn oat_manager(&self) -> &Arc<OatFileManager> {
        &self.oat_manager
    }

    pub fn class_table(&self) -> &ClassTable {
        &self.class_table
    }

    pub fn resolution_method(&self) -> &MethodRef {
        &self.resolution_method
    }

    pub fn imt_conflict_method(&self) -> &MethodRef {
        &self.imt_conflict_method
    }

    pub fn imt_unimplemented_method(&self) -> &MethodRef {
        &self.imt_unimplemented_method
    }

    /// The interface method table `klass` dispatches through.
    pub fn imtable_for(&self, klass: &ClassRef) -> Arc<[MethodRef]> {
        return klass.imtable().unwrap_or_else(|| self.default_imt.clone());
    }

    pub fn array_iftable(&self) -> Arc<IfTable> {
        self.array_iftable.read().clone()
    }

    /// Number of classes whose initializer has completed.
    pub fn num_class_inits(&self) -> usize {
        self.num_class_inits.load(Ordering::Acquire)
    }

    pub fn boot_class_path(&self) -> Vec<Arc<DexFile>> {
        self.boot_class_path.read().clone()
    }

    pub fn get_class_root(&self, root: ClassRoot) -> Option<ClassRef> {
        return self.class_roots.read()[root.index()].clone();
    }

    pub(crate) fn class_root(&self, root: ClassRoot) -> Result<ClassRef, ClassLoadErr> {
        return self.get_class_root(root).ok_or_else(|| {
            ClassLoadErr::Linkage(format!("Class root {} is not initialized", root.descriptor()))
        });
    }

    pub(crate) fn set_class_root(&self, root: ClassRoot, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        if klass.descriptor() != root.descriptor() || !klass.is_boot_class() {
            return Err(ClassLoadErr::Linkage(format!(
                "Class {:?} cannot be the root {}",
                klass,
                root.descriptor()
            )));
        }
        self.class_roots.write()[root.index()] = Some(klass.clone());
        return Ok(());
    }

    pub fn lookup_class(&self, descriptor: &str, loader: Option<&Arc<ClassLoader>>) -> Option<ClassRef> {
        return self.class_table.lookup(descriptor, loader);
    }

    pub fn lookup_classes(&self, descriptor: &str) -> Vec<ClassRef> {
        return self.class_table.lookup_classes(descriptor);
    }

    pub fn remove_class(&self, descriptor: &str, loader: Option<&Arc<ClassLoader>>) -> bool {
        return self.class_table.remove(descriptor, loader);
    }

    pub fn num_loaded_classes(&self) -> usize {
        self.class_table.len()
    }

    pub fn visit_classes<F: FnMut(&ClassRef) -> bool>(&self, visitor: F) {
        self.class_table.visit_classes(visitor);
    }

    /// Reports the class roots and the registered classes selected by
    /// `flags` to a collector.
    pub fn visit_roots<F: FnMut(&ClassRef)>(&self, mut visitor: F, flags: VisitRootFlags) {
        if flags.contains(VisitRootFlags::ALL_ROOTS) {
            for klass in self.class_roots.read().iter().flatten() {
                visitor(klass);
            }
            for dex_cache in self.dex_caches.read().iter() {
                dex_cache.visit_resolved_types(|klass| visitor(klass));
            }
        }
        self.class_table.visit_roots(visitor, flags);
    }

    pub fn dump_for_sig_quit(&self) -> String {
        return self.class_table.dump_for_sig_quit();
    }
}
