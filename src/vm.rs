use std::{fmt, path::PathBuf, str::FromStr, sync::Arc};

use crate::{
    dex::{ClassLoadErr, DexFile},
    image::ImageHeader,
    linker::ClassLinker,
    memory::{heap::Heap, MB},
    oat::{
        compiler::{Dex2OatCompiler, OatCompiler},
        manager::{OatDexFileRef, OatFileManager},
        InstructionSet,
    },
};

#[derive(Debug, Clone)]
pub struct VMConfig {
    boot_class_path: Vec<String>,
    dalvik_cache: String,
    instruction_set: String,
    compiler: String,
    compiler_options: Vec<String>,
    image: Option<String>,
    is_compiler: bool,
    verification: bool,
    heap_capacity: usize,
    non_moving_capacity: usize,
}

impl Default for VMConfig {
    fn default() -> Self {
        return VMConfig {
            boot_class_path: vec![],
            dalvik_cache: "/data/dalvik-cache".to_string(),
            instruction_set: InstructionSet::runtime_isa().name().to_string(),
            compiler: "dex2oat".to_string(),
            compiler_options: vec![],
            image: None,
            is_compiler: false,
            verification: true,
            heap_capacity: 64 * MB,
            non_moving_capacity: 16 * MB,
        };
    }
}

impl VMConfig {
    pub fn boot_class_path(&self) -> &[String] {
        &self.boot_class_path
    }

    /// Colon separated list of dex locations.
    pub fn set_boot_class_path(&mut self, boot_class_path: &str) {
        self.boot_class_path = boot_class_path
            .split(':')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
    }

    pub fn dalvik_cache(&self) -> &str {
        &self.dalvik_cache
    }

    pub fn set_dalvik_cache(&mut self, dalvik_cache: &str) {
        self.dalvik_cache = dalvik_cache.to_string();
    }

    pub fn instruction_set(&self) -> &str {
        &self.instruction_set
    }

    pub fn set_instruction_set(&mut self, instruction_set: &str) {
        self.instruction_set = instruction_set.to_string();
    }

    pub fn compiler(&self) -> &str {
        &self.compiler
    }

    pub fn set_compiler(&mut self, compiler: &str) {
        self.compiler = compiler.to_string();
    }

    pub fn compiler_options(&self) -> &[String] {
        &self.compiler_options
    }

    pub fn add_compiler_option(&mut self, option: &str) {
        self.compiler_options.push(option.to_string());
    }

    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn set_image(&mut self, image: &str) {
        self.image = Some(image.to_string());
    }

    pub fn is_compiler(&self) -> bool {
        self.is_compiler
    }

    pub fn set_is_compiler(&mut self, is_compiler: bool) {
        self.is_compiler = is_compiler;
    }

    pub fn verification(&self) -> bool {
        self.verification
    }

    pub fn set_verification(&mut self, enabled: bool) {
        self.verification = enabled;
    }

    pub fn heap_capacity(&self) -> usize {
        self.heap_capacity
    }

    pub fn set_heap_capacity(&mut self, capacity: usize) {
        self.heap_capacity = capacity;
    }

    pub fn non_moving_capacity(&self) -> usize {
        self.non_moving_capacity
    }

    pub fn set_non_moving_capacity(&mut self, capacity: usize) {
        self.non_moving_capacity = capacity;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VMError {
    InvalidConfig(String),
    HeapReservation(String),
    ClassLoaderErr(ClassLoadErr),
    ClassInitError(ClassLoadErr),
}

impl fmt::Display for VMError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VMError::InvalidConfig(msg) => write!(f, "invalid configuration: {}", msg),
            VMError::HeapReservation(msg) => write!(f, "heap reservation failed: {}", msg),
            VMError::ClassLoaderErr(e) => write!(f, "{}", e),
            VMError::ClassInitError(e) => write!(f, "class initialization failed: {}", e),
        }
    }
}

impl std::error::Error for VMError {}

/// The linker together with the heap and the artifact cache it runs on.
pub struct VM {
    config: VMConfig,
    heap: Arc<Heap>,
    oat_manager: Arc<OatFileManager>,
    linker: Arc<ClassLinker>,
}

impl VM {
    pub fn new(cfg: &VMConfig) -> Result<VM, VMError> {
        let mut compiler = Dex2OatCompiler::new(PathBuf::from(cfg.compiler()), &cfg.boot_class_path().join(":"))
            .with_verification(cfg.verification())
            .with_options(cfg.compiler_options().to_vec());
        if let Some(image) = cfg.image() {
            compiler = compiler.with_boot_image(image);
        }
        return VM::with_compiler(cfg, Arc::new(compiler));
    }

    /// Like [`VM::new`], with `compiler` generating missing artifacts.
    pub fn with_compiler(cfg: &VMConfig, compiler: Arc<dyn OatCompiler>) -> Result<VM, VMError> {
        let instruction_set = InstructionSet::from_str(cfg.instruction_set()).map_err(VMError::InvalidConfig)?;
        let heap = Heap::new(cfg.heap_capacity(), cfg.non_moving_capacity()).ok_or_else(|| {
            VMError::HeapReservation(format!(
                "{} + {} bytes: {}",
                cfg.heap_capacity(),
                cfg.non_moving_capacity(),
                crate::os::last_os_error()
            ))
        })?;
        let heap = Arc::new(heap);
        let oat_manager = Arc::new(OatFileManager::new(
            PathBuf::from(cfg.dalvik_cache()),
            instruction_set,
            ImageHeader::default(),
            compiler,
            !cfg.is_compiler(),
        ));
        let linker = ClassLinker::new(heap.clone(), oat_manager.clone(), None)
            .with_compiler_mode(cfg.is_compiler())
            .with_verification(cfg.verification());
        log::debug!(
            "VM for {} with dalvik cache {}",
            instruction_set.name(),
            cfg.dalvik_cache()
        );
        return Ok(VM {
            config: cfg.clone(),
            heap,
            oat_manager,
            linker: Arc::new(linker),
        });
    }

    /// Starts the linker from `boot_class_path` and runs the initializers
    /// of the class roots.
    pub fn init(&self, boot_class_path: Vec<Arc<DexFile>>) -> Result<(), VMError> {
        self.linker
            .init_from_compiler(boot_class_path)
            .map_err(VMError::ClassLoaderErr)?;
        self.linker.run_root_clinits().map_err(VMError::ClassInitError)?;
        log::info!(
            "VM initialized with {} classes, {} bytes allocated",
            self.linker.num_loaded_classes(),
            self.heap.bytes_allocated()
        );
        return Ok(());
    }

    pub fn config(&self) -> &VMConfig {
        &self.config
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.heap
    }

    pub fn linker(&self) -> &Arc<ClassLinker> {
        &self.linker
    }

    pub fn oat_manager(&self) -> &Arc<OatFileManager> {
        &self.oat_manager
    }

    /// Locates, or generates, the compiled artifact for `dex_location`.
    pub fn find_artifact(&self, dex_location: &str) -> Result<OatDexFileRef, VMError> {
        return self
            .oat_manager
            .open_oat_file_from_dex_location(dex_location)
            .map_err(VMError::ClassLoaderErr);
    }
}
