//! Startup of the linker, either from dex files alone or from a boot image
//! holding classes linked by an earlier runtime.

use std::sync::{atomic::Ordering, Arc};

use super::{
    define::size_of_class,
    roots::{
        ClassRoot, ART_FIELD_INSTANCE_SIZE, ART_METHOD_INSTANCE_SIZE, DEX_CACHE_INSTANCE_SIZE,
        OBJECT_INSTANCE_SIZE, STRING_INSTANCE_SIZE,
    },
    ClassLinker,
};
use crate::{
    dex::{descriptor::PrimitiveType, ClassLoadErr, DexFile},
    object::{
        class::{
            ACC_CLASS_IS_FINALIZER_REFERENCE, ACC_CLASS_IS_PHANTOM_REFERENCE, ACC_CLASS_IS_REFERENCE,
            ACC_CLASS_IS_WEAK_REFERENCE, CLASS_HEADER_SIZE,
        },
        ClassRef, ClassStatus, IfTable, IfTableEntry,
    },
};

/// Subclasses of `java.lang.ref.Reference` the collector treats specially.
const REFERENCE_KINDS: &[(&str, u32)] = &[
    (
        "Ljava/lang/ref/FinalizerReference;",
        ACC_CLASS_IS_REFERENCE | ACC_CLASS_IS_FINALIZER_REFERENCE,
    ),
    (
        "Ljava/lang/ref/PhantomReference;",
        ACC_CLASS_IS_REFERENCE | ACC_CLASS_IS_PHANTOM_REFERENCE,
    ),
    ("Ljava/lang/ref/SoftReference;", ACC_CLASS_IS_REFERENCE),
    (
        "Ljava/lang/ref/WeakReference;",
        ACC_CLASS_IS_REFERENCE | ACC_CLASS_IS_WEAK_REFERENCE,
    ),
];

/// Instance fields of `java.lang.ref.Reference` in layout order.
const REFERENCE_FIELDS: &[(&str, &str)] = &[
    ("pendingNext", "Ljava/lang/ref/Reference;"),
    ("queue", "Ljava/lang/ref/ReferenceQueue;"),
    ("queueNext", "Ljava/lang/ref/Reference;"),
    ("referent", "Ljava/lang/Object;"),
];

const PRIMITIVE_ROOTS: &[(ClassRoot, PrimitiveType)] = &[
    (ClassRoot::PrimitiveBoolean, PrimitiveType::Boolean),
    (ClassRoot::PrimitiveByte, PrimitiveType::Byte),
    (ClassRoot::PrimitiveChar, PrimitiveType::Char),
    (ClassRoot::PrimitiveShort, PrimitiveType::Short),
    (ClassRoot::PrimitiveInt, PrimitiveType::Int),
    (ClassRoot::PrimitiveLong, PrimitiveType::Long),
    (ClassRoot::PrimitiveFloat, PrimitiveType::Float),
    (ClassRoot::PrimitiveDouble, PrimitiveType::Double),
    (ClassRoot::PrimitiveVoid, PrimitiveType::Void),
];

const PRIMITIVE_ARRAY_ROOTS: &[ClassRoot] = &[
    ClassRoot::BooleanArrayClass,
    ClassRoot::ByteArrayClass,
    ClassRoot::ShortArrayClass,
    ClassRoot::LongArrayClass,
    ClassRoot::FloatArrayClass,
    ClassRoot::DoubleArrayClass,
];

fn expect_root(found: &ClassRef, expected: &ClassRef) -> Result<(), ClassLoadErr> {
    if !Arc::ptr_eq(found, expected) {
        return Err(ClassLoadErr::Linkage(format!(
            "Class {} was defined again instead of reusing the bootstrap class",
            found.pretty_descriptor()
        )));
    }
    return Ok(());
}

impl ClassLinker {
    /// Size of the class object for a hand-crafted class, taken from its
    /// definition on the boot class path when there is one.
    fn hand_crafted_class_size(&self, boot_class_path: &[Arc<DexFile>], descriptor: &str) -> u32 {
        for dex_file in boot_class_path.iter() {
            if let Some(class_def_idx) = dex_file.find_class_def(descriptor) {
                return size_of_class(dex_file, class_def_idx);
            }
        }
        return CLASS_HEADER_SIZE;
    }

    fn alloc_bootstrap_class(
        &self,
        boot_class_path: &[Arc<DexFile>],
        root: ClassRoot,
    ) -> Result<ClassRef, ClassLoadErr> {
        let class_size = self.hand_crafted_class_size(boot_class_path, root.descriptor());
        let klass = self.alloc_class(root.descriptor(), None, class_size)?;
        self.set_class_root(root, &klass)?;
        return Ok(klass);
    }

    fn alloc_bootstrap_array_class(&self, root: ClassRoot, component: &ClassRef) -> Result<ClassRef, ClassLoadErr> {
        let klass = self.alloc_class(root.descriptor(), None, CLASS_HEADER_SIZE)?;
        klass.set_component_type(Some(component.clone()));
        self.set_class_root(root, &klass)?;
        return Ok(klass);
    }

    /// Builds the class roots from `boot_class_path` without an image.
    ///
    /// The classes whose layout the runtime depends on are created by hand
    /// first; defining them from their dex files later reuses those objects.
    pub fn init_from_compiler(&self, boot_class_path: Vec<Arc<DexFile>>) -> Result<(), ClassLoadErr> {
        log::debug!("Linker init from {} boot dex files", boot_class_path.len());
        if boot_class_path.is_empty() {
            return Err(ClassLoadErr::Linkage("Boot class path is empty".to_string()));
        }

        let java_lang_class = self.alloc_bootstrap_class(&boot_class_path, ClassRoot::JavaLangClass)?;
        let java_lang_object = self.alloc_bootstrap_class(&boot_class_path, ClassRoot::JavaLangObject)?;
        java_lang_class.set_super_class(Some(java_lang_object.clone()));
        java_lang_object.set_object_size(OBJECT_INSTANCE_SIZE);
        let class_array_class = self.alloc_bootstrap_array_class(ClassRoot::ClassArrayClass, &java_lang_class)?;
        let object_array_class = self.alloc_bootstrap_array_class(ClassRoot::ObjectArrayClass, &java_lang_object)?;

        for (root, primitive_type) in PRIMITIVE_ROOTS.iter() {
            let klass = self.create_primitive_class(*primitive_type)?;
            self.set_class_root(*root, &klass)?;
        }
        let char_array_class =
            self.alloc_bootstrap_array_class(ClassRoot::CharArrayClass, &self.class_root(ClassRoot::PrimitiveChar)?)?;
        let int_array_class =
            self.alloc_bootstrap_array_class(ClassRoot::IntArrayClass, &self.class_root(ClassRoot::PrimitiveInt)?)?;

        let mut resolved_roots = vec![];
        for (root, object_size) in [
            (ClassRoot::JavaLangString, STRING_INSTANCE_SIZE),
            (ClassRoot::JavaLangDexCache, DEX_CACHE_INSTANCE_SIZE),
            (ClassRoot::JavaLangReflectArtField, ART_FIELD_INSTANCE_SIZE),
            (ClassRoot::JavaLangReflectArtMethod, ART_METHOD_INSTANCE_SIZE),
        ] {
            let klass = self.alloc_bootstrap_class(&boot_class_path, root)?;
            klass.set_object_size(object_size);
            klass.set_status(ClassStatus::Resolved);
            resolved_roots.push(klass);
        }
        let string_array_class =
            self.alloc_bootstrap_array_class(ClassRoot::JavaLangStringArrayClass, &resolved_roots[0])?;
        let art_field_array_class =
            self.alloc_bootstrap_array_class(ClassRoot::JavaLangReflectArtFieldArrayClass, &resolved_roots[2])?;
        let art_method_array_class =
            self.alloc_bootstrap_array_class(ClassRoot::JavaLangReflectArtMethodArrayClass, &resolved_roots[3])?;

        for dex_file in boot_class_path.into_iter() {
            self.append_to_boot_class_path(dex_file)?;
        }

        // Object, String and DexCache come first: every other definition
        // needs them.
        expect_root(&self.find_system_class("Ljava/lang/Object;")?, &java_lang_object)?;
        for klass in resolved_roots[..2].iter() {
            expect_root(&self.find_system_class(klass.descriptor())?, klass)?;
        }
        for root in PRIMITIVE_ARRAY_ROOTS.iter() {
            let klass = self.find_system_class(root.descriptor())?;
            self.set_class_root(*root, &klass)?;
        }
        expect_root(&self.find_system_class("[C")?, &char_array_class)?;
        expect_root(&self.find_system_class("[I")?, &int_array_class)?;
        expect_root(&self.find_system_class("[Ljava/lang/Class;")?, &class_array_class)?;
        expect_root(&self.find_system_class("[Ljava/lang/Object;")?, &object_array_class)?;

        let array_iftable = self.array_iftable();
        for interface in ["Ljava/lang/Cloneable;", "Ljava/io/Serializable;"] {
            let interface = self.find_system_class(interface)?;
            array_iftable.push(IfTableEntry {
                interface,
                methods: vec![],
            });
        }

        expect_root(&self.find_system_class("Ljava/lang/Class;")?, &java_lang_class)?;
        for klass in resolved_roots[2..].iter() {
            expect_root(&self.find_system_class(klass.descriptor())?, klass)?;
        }
        expect_root(&self.find_system_class("[Ljava/lang/String;")?, &string_array_class)?;
        expect_root(
            &self.find_system_class("[Ljava/lang/reflect/ArtField;")?,
            &art_field_array_class,
        )?;
        expect_root(
            &self.find_system_class("[Ljava/lang/reflect/ArtMethod;")?,
            &art_method_array_class,
        )?;

        for root in [ClassRoot::JavaLangReflectProxy, ClassRoot::JavaLangRefReference] {
            let klass = self.find_system_class(root.descriptor())?;
            self.set_class_root(root, &klass)?;
        }
        for (descriptor, flags) in REFERENCE_KINDS.iter() {
            if self.find_in_boot_class_path(descriptor).is_none() {
                log::debug!("No {} on the boot class path", descriptor);
                continue;
            }
            self.find_system_class(descriptor)?.add_access_flags(*flags);
        }
        for root in [
            ClassRoot::JavaLangClassLoader,
            ClassRoot::JavaLangThrowable,
            ClassRoot::JavaLangClassNotFoundException,
            ClassRoot::JavaLangStackTraceElement,
            ClassRoot::JavaLangStackTraceElementArrayClass,
        ] {
            let klass = self.find_system_class(root.descriptor())?;
            self.set_class_root(root, &klass)?;
        }

        return self.finish_init();
    }

    /// Takes the class roots from the image the linker was created with.
    pub fn init_from_image(&self) -> Result<(), ClassLoadErr> {
        let image = self.class_table.image().ok_or_else(|| {
            ClassLoadErr::Linkage("Linker was created without an image".to_string())
        })?;
        log::debug!("Linker init from image {}", image.location());
        for dex_cache in image.dex_caches().iter() {
            let dex_cache = self.register_dex_cache(dex_cache.clone());
            self.boot_class_path.write().push(dex_cache.dex_file().clone());
        }

        // Arrays share their interface table with the image's Object[].
        let array_iftable = match self
            .lookup_class("[Ljava/lang/Object;", None)
            .and_then(|klass| klass.iftable())
        {
            Some(iftable) => iftable,
            None => {
                let iftable = IfTable::default();
                for interface in ["Ljava/lang/Cloneable;", "Ljava/io/Serializable;"] {
                    iftable.push(IfTableEntry {
                        interface: self.find_system_class(interface)?,
                        methods: vec![],
                    });
                }
                Arc::new(iftable)
            }
        };
        *self.array_iftable.write() = array_iftable;

        for root in ClassRoot::ALL.iter() {
            let klass = match self.lookup_class(root.descriptor(), None) {
                Some(klass) => klass,
                None if root.is_primitive() => {
                    let primitive_type = PrimitiveType::from_descriptor(root.descriptor());
                    self.create_primitive_class(primitive_type)?
                }
                None if root.is_array() => self.find_system_class(root.descriptor())?,
                None => {
                    return Err(ClassLoadErr::Linkage(format!(
                        "Image {} is missing class root {}",
                        image.location(),
                        root.descriptor()
                    )))
                }
            };
            self.set_class_root(*root, &klass)?;
        }
        return self.finish_init();
    }

    /// Checks the layouts the runtime depends on and switches off the
    /// bootstrap paths.
    fn finish_init(&self) -> Result<(), ClassLoadErr> {
        let reference = self.class_root(ClassRoot::JavaLangRefReference)?;
        let ifields = reference.ifields();
        if ifields.len() != REFERENCE_FIELDS.len() {
            return Err(ClassLoadErr::Linkage(format!(
                "java.lang.ref.Reference has {} instance fields, expected {}",
                ifields.len(),
                REFERENCE_FIELDS.len()
            )));
        }
        for (field, (name, type_descriptor)) in ifields.iter().zip(REFERENCE_FIELDS.iter()) {
            if field.name() != *name || field.type_descriptor() != *type_descriptor {
                return Err(ClassLoadErr::Linkage(format!(
                    "Unexpected field {} in java.lang.ref.Reference, expected {} of type {}",
                    field.pretty_field(),
                    name,
                    type_descriptor
                )));
            }
        }

        for root in ClassRoot::ALL.iter() {
            let klass = self.class_root(*root)?;
            if !root.is_array() && !root.is_primitive() && klass.dex_cache().is_none() {
                return Err(ClassLoadErr::Linkage(format!(
                    "Class root {} has no dex cache",
                    root.descriptor()
                )));
            }
        }
        for (root, object_size) in [
            (ClassRoot::JavaLangObject, OBJECT_INSTANCE_SIZE),
            (ClassRoot::JavaLangString, STRING_INSTANCE_SIZE),
            (ClassRoot::JavaLangDexCache, DEX_CACHE_INSTANCE_SIZE),
            (ClassRoot::JavaLangReflectArtField, ART_FIELD_INSTANCE_SIZE),
            (ClassRoot::JavaLangReflectArtMethod, ART_METHOD_INSTANCE_SIZE),
        ] {
            let klass = self.class_root(root)?;
            if klass.object_size() != object_size {
                return Err(ClassLoadErr::Linkage(format!(
                    "Linked size {} of {} does not match the runtime layout size {}",
                    klass.object_size(),
                    klass.pretty_descriptor(),
                    object_size
                )));
            }
        }
        if self.array_iftable().count() != 2 {
            return Err(ClassLoadErr::Linkage(
                "Array interface table is not set up".to_string(),
            ));
        }

        self.init_done.store(true, Ordering::Release);
        log::debug!("Linker init done with {} classes", self.num_loaded_classes());
        return Ok(());
    }
}
