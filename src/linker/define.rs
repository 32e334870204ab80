use std::{sync::Arc, thread};

use super::{
    class_loader::ClassLoader,
    roots::{ClassRoot, HAND_CRAFTED_ARRAY_CLASSES, HAND_CRAFTED_CLASSES},
    ClassLinker,
};
use crate::{
    dex::{
        descriptor::{self, PrimitiveType},
        ClassLoadErr, DexFile, MemberDef,
    },
    memory::HEAP_REFERENCE_SIZE,
    oat::OatClass,
    object::{
        class::{
            Class, ACC_ABSTRACT, ACC_CONSTRUCTOR, ACC_FINAL, ACC_INTERFACE, ACC_JAVA_FLAGS_MASK,
            ACC_PUBLIC, CLASS_HEADER_SIZE,
        },
        ClassRef, ClassStatus, EntryPoint, Field, FieldRef, Method, MethodRef,
    },
};

/// Size of the class object for a definition, static field storage
/// included, computed the same way static fields are laid out later.
pub fn size_of_class(dex_file: &DexFile, class_def_idx: u16) -> u32 {
    let class_def = dex_file.class_def(class_def_idx);
    let mut num_ref = 0;
    let mut num_32 = 0;
    let mut num_64 = 0;
    if let Some(class_data) = &class_def.class_data {
        for field in class_data.static_fields.iter() {
            let type_descriptor = dex_file.field_type_descriptor(field.member_idx);
            if descriptor::is_reference_descriptor(type_descriptor) {
                num_ref += 1;
            } else if PrimitiveType::from_descriptor(type_descriptor).is_64bit() {
                num_64 += 1;
            } else {
                num_32 += 1;
            }
        }
    }
    let mut size = CLASS_HEADER_SIZE + num_ref * HEAP_REFERENCE_SIZE as u32;
    if num_64 != 0 && size % 8 != 0 {
        // One 32-bit field, or padding, fills the gap before the 64-bit fields.
        if num_32 != 0 {
            num_32 -= 1;
        }
        size += 4;
    }
    size += num_64 * 8 + num_32 * 4;
    return size;
}

impl ClassLinker {
    pub fn find_system_class(&self, descriptor: &str) -> Result<ClassRef, ClassLoadErr> {
        return self.find_class(descriptor, None);
    }

    /// Finds, defining if needed, the class named `descriptor` as seen by
    /// `loader` (`None` is the boot loader).
    pub fn find_class(
        &self,
        descriptor: &str,
        loader: Option<&Arc<ClassLoader>>,
    ) -> Result<ClassRef, ClassLoadErr> {
        if descriptor.len() == 1 {
            return self.find_primitive_class(descriptor.as_bytes()[0]);
        }
        if descriptor::is_array_descriptor(descriptor) {
            if let Some(klass) = self.lookup_class(descriptor, loader) {
                return self.ensure_resolved(klass);
            }
            return self.create_array_class(descriptor, loader);
        }
        if let Some(klass) = self.find_class_or_none(descriptor, loader)? {
            return Ok(klass);
        }
        return Err(match loader {
            None => ClassLoadErr::NoClassDefFound(format!("Class {} not found", descriptor)),
            Some(loader) => ClassLoadErr::ClassNotFound(format!(
                "Didn't find class \"{}\" on path: {}",
                descriptor::pretty_descriptor(descriptor),
                loader.class_path()
            )),
        });
    }

    /// `Ok(None)` when no loader in the delegation chain defines the class.
    fn find_class_or_none(
        &self,
        descriptor: &str,
        loader: Option<&Arc<ClassLoader>>,
    ) -> Result<Option<ClassRef>, ClassLoadErr> {
        if let Some(klass) = self.lookup_class(descriptor, loader) {
            return self.ensure_resolved(klass).map(Some);
        }
        let loader = match loader {
            Some(loader) => loader,
            None => {
                return match self.find_in_boot_class_path(descriptor) {
                    Some((dex_file, class_def_idx)) => self
                        .define_class(descriptor, None, &dex_file, class_def_idx)
                        .map(Some),
                    None => Ok(None),
                };
            }
        };
        if let Some(klass) = self.find_class_or_none(descriptor, loader.parent())? {
            return Ok(Some(klass));
        }
        return match loader.find_class_def(descriptor) {
            Some((dex_file, class_def_idx)) => {
                let dex_file = dex_file.clone();
                self.define_class(descriptor, Some(loader), &dex_file, class_def_idx)
                    .map(Some)
            }
            None => Ok(None),
        };
    }

    pub(crate) fn find_in_boot_class_path(&self, descriptor: &str) -> Option<(Arc<DexFile>, u16)> {
        for dex_file in self.boot_class_path.read().iter() {
            if let Some(class_def_idx) = dex_file.find_class_def(descriptor) {
                return Some((dex_file.clone(), class_def_idx));
            }
        }
        return None;
    }

    /// Waits until a class found in the table is resolved by whichever
    /// thread is defining it.
    pub(crate) fn ensure_resolved(&self, klass: ClassRef) -> Result<ClassRef, ClassLoadErr> {
        if !klass.is_resolved() && !klass.is_erroneous() {
            let lock = klass.lock();
            if !klass.is_resolved() && klass.clinit_thread() == Some(thread::current().id()) {
                let err = ClassLoadErr::ClassCircularity(klass.pretty_descriptor());
                klass.set_erroneous(&err);
                return Err(err);
            }
            while !klass.is_resolved() && !klass.is_erroneous() {
                lock.wait();
            }
        }
        if klass.is_erroneous() {
            log::info!(
                "Rejecting re-init on previously-failed class {}",
                klass.pretty_descriptor()
            );
            return Err(klass.earlier_failure());
        }
        return Ok(klass);
    }

    pub(crate) fn alloc_class(
        &self,
        descriptor: &str,
        loader: Option<&Arc<ClassLoader>>,
        class_size: u32,
    ) -> Result<ClassRef, ClassLoadErr> {
        let storage = self.heap.alloc_non_movable_object(class_size as usize);
        if storage.is_null() {
            return Err(ClassLoadErr::OutOfMemory(format!(
                "Failed to allocate class {} of size {}",
                descriptor::pretty_descriptor(descriptor),
                class_size
            )));
        }
        return Ok(Class::new(descriptor, loader, storage, class_size));
    }

    fn hand_crafted_class(&self, roots: &[ClassRoot], descriptor: &str) -> Option<ClassRef> {
        if self.is_init_done() {
            return None;
        }
        let root = roots.iter().find(|r| r.descriptor() == descriptor)?;
        return self.get_class_root(*root);
    }

    /// Creates the class for `class_def_idx` of `dex_file`, loads, links and
    /// registers it. When another thread registers the same class first,
    /// that class is returned once it is resolved.
    pub fn define_class(
        &self,
        descriptor: &str,
        loader: Option<&Arc<ClassLoader>>,
        dex_file: &Arc<DexFile>,
        class_def_idx: u16,
    ) -> Result<ClassRef, ClassLoadErr> {
        let hand_crafted = if loader.is_none() {
            self.hand_crafted_class(HAND_CRAFTED_CLASSES, descriptor)
        } else {
            None
        };
        let klass = match hand_crafted {
            Some(klass) => klass,
            None => self.alloc_class(descriptor, loader, size_of_class(dex_file, class_def_idx))?,
        };
        let dex_cache = self.register_dex_file(dex_file)?;
        klass.set_dex_cache(Some(dex_cache));
        if let Err(e) = self.load_class(dex_file, class_def_idx, &klass) {
            klass.set_erroneous(&e);
            return Err(e);
        }

        let lock = klass.lock();
        klass.set_clinit_thread(Some(thread::current().id()));
        if let Some(existing) = self.class_table.insert(&klass) {
            drop(lock);
            log::debug!("Lost the race to define {}", descriptor);
            return self.ensure_resolved(existing);
        }
        let linked = self
            .load_super_and_interfaces(&klass, dex_file, class_def_idx)
            .and_then(|_| self.link_class(&klass));
        if let Err(e) = linked {
            klass.set_erroneous(&e);
            return Err(e);
        }
        drop(lock);
        log::debug!("Defined {:?}", klass);
        return Ok(klass);
    }

    fn load_class(
        &self,
        dex_file: &DexFile,
        class_def_idx: u16,
        klass: &ClassRef,
    ) -> Result<(), ClassLoadErr> {
        let class_def = dex_file.class_def(class_def_idx);
        if class_def.access_flags & !ACC_JAVA_FLAGS_MASK != 0 {
            return Err(ClassLoadErr::ClassFormat(format!(
                "Invalid access flags 0x{:x} for class {}",
                class_def.access_flags,
                klass.pretty_descriptor()
            )));
        }
        klass.set_access_flags(class_def.access_flags);
        klass.set_status(ClassStatus::Idx);
        klass.set_dex_class_def_idx(Some(class_def_idx));
        klass.set_dex_type_idx(Some(class_def.class_idx));

        let class_data = match &class_def.class_data {
            Some(class_data) => class_data,
            None => return Ok(()),
        };
        if class_data.direct_methods.len() > u16::MAX as usize {
            return Err(ClassLoadErr::ClassFormat(format!(
                "Too many direct methods on class {}: {}",
                klass.pretty_descriptor(),
                class_data.direct_methods.len()
            )));
        }
        let oat_class = if self.is_compiler {
            None
        } else {
            self.oat_manager.find_oat_class(dex_file, class_def_idx)
        };

        let sfields: Vec<FieldRef> = class_data
            .static_fields
            .iter()
            .map(|f| self.load_field(dex_file, f, klass))
            .collect();
        klass.set_sfields(sfields);
        let ifields: Vec<FieldRef> = class_data
            .instance_fields
            .iter()
            .map(|f| self.load_field(dex_file, f, klass))
            .collect();
        klass.set_ifields(ifields);

        let mut class_def_method_index = 0;
        let mut direct_methods = Vec::with_capacity(class_data.direct_methods.len());
        for (i, m) in class_data.direct_methods.iter().enumerate() {
            let method = self.load_method(dex_file, m, klass);
            self.link_code(&method, oat_class.as_ref(), class_def_method_index);
            method.set_method_index(i as u16);
            direct_methods.push(method);
            class_def_method_index += 1;
        }
        klass.set_direct_methods(direct_methods);
        let mut virtual_methods = Vec::with_capacity(class_data.virtual_methods.len());
        for m in class_data.virtual_methods.iter() {
            let method = self.load_method(dex_file, m, klass);
            self.link_code(&method, oat_class.as_ref(), class_def_method_index);
            virtual_methods.push(method);
            class_def_method_index += 1;
        }
        klass.set_virtual_methods(virtual_methods);
        return Ok(());
    }

    fn load_field(&self, dex_file: &DexFile, field: &MemberDef, klass: &ClassRef) -> FieldRef {
        return Field::new(
            klass,
            field.member_idx,
            dex_file.field_name(field.member_idx),
            dex_file.field_type_descriptor(field.member_idx),
            field.access_flags,
        );
    }

    fn load_method(&self, dex_file: &DexFile, method: &MemberDef, klass: &ClassRef) -> MethodRef {
        let name = dex_file.method_name(method.member_idx);
        let signature = dex_file.method_signature(method.member_idx);
        let mut access_flags = method.access_flags;
        if name == "finalize" && signature == "()V" {
            // Object and Enum declare finalize() but do not need finalization.
            let exempt = klass.is_boot_class()
                && (klass.descriptor() == "Ljava/lang/Object;"
                    || klass.descriptor() == "Ljava/lang/Enum;");
            if !exempt {
                klass.set_finalizable();
            }
        } else if name.starts_with('<') {
            if name == "<init>" || name == "<clinit>" {
                if access_flags & ACC_CONSTRUCTOR == 0 {
                    log::warn!(
                        "{} didn't have expected constructor access flag in class {} in dex file {}",
                        name,
                        klass.pretty_descriptor(),
                        dex_file.location()
                    );
                    access_flags |= ACC_CONSTRUCTOR;
                }
            } else {
                log::warn!("Unexpected '<' at start of method name {}", name);
            }
        }
        return Method::new(
            klass,
            method.member_idx,
            name,
            &signature,
            access_flags,
            method.has_code,
        );
    }

    /// Points the method's entry points at its compiled code, or at the
    /// bridge or trampoline that stands in for it.
    pub(crate) fn link_code(
        &self,
        method: &MethodRef,
        oat_class: Option<&OatClass>,
        class_def_method_index: usize,
    ) {
        if self.is_compiler {
            return;
        }
        let oat_method = oat_class.and_then(|c| c.oat_method(class_def_method_index));
        let quick_code = oat_method.as_ref().and_then(|m| m.quick_code());
        let portable_code = oat_method.as_ref().and_then(|m| m.portable_code());
        if let Some(code) = quick_code {
            method.set_entry_point_from_quick(EntryPoint::Compiled(code));
        }
        if let Some(code) = portable_code {
            method.set_entry_point_from_portable(EntryPoint::Compiled(code));
        }

        let enter_interpreter = quick_code.is_none() && portable_code.is_none();
        if enter_interpreter && !method.is_native() {
            method.set_entry_point_from_interpreter(EntryPoint::InterpreterToInterpreterBridge);
        } else {
            method.set_entry_point_from_interpreter(EntryPoint::InterpreterToCompiledCodeBridge);
        }

        if method.is_abstract() {
            method.set_entry_point_from_quick(EntryPoint::InterpreterBridge);
            method.set_entry_point_from_portable(EntryPoint::InterpreterBridge);
            return;
        }
        if method.is_static() && !method.is_constructor() {
            // Calls go through the trampoline until the class is initialized.
            method.set_entry_point_from_quick(EntryPoint::ResolutionTrampoline);
            method.set_entry_point_from_portable(EntryPoint::PortableResolutionTrampoline);
        } else if enter_interpreter {
            if !method.is_native() {
                method.set_entry_point_from_quick(EntryPoint::InterpreterBridge);
                method.set_entry_point_from_portable(EntryPoint::InterpreterBridge);
            } else {
                method.set_entry_point_from_quick(EntryPoint::GenericJniTrampoline);
                method.set_entry_point_from_portable(EntryPoint::PortableToQuickBridge);
            }
        } else if portable_code.is_some() {
            method.set_entry_point_from_quick(EntryPoint::QuickToPortableBridge);
        } else {
            method.set_entry_point_from_portable(EntryPoint::PortableToQuickBridge);
        }
    }

    fn load_super_and_interfaces(
        &self,
        klass: &ClassRef,
        dex_file: &DexFile,
        class_def_idx: u16,
    ) -> Result<(), ClassLoadErr> {
        let class_def = dex_file.class_def(class_def_idx);
        if class_def.superclass_idx != crate::dex::NO_INDEX_16 {
            let super_class = self.resolve_type_for_class(class_def.superclass_idx, klass)?;
            if !klass.can_access(&super_class) {
                return Err(ClassLoadErr::IllegalAccess(format!(
                    "Class {} extended by class {} is inaccessible",
                    super_class.pretty_descriptor(),
                    klass.pretty_descriptor()
                )));
            }
            klass.set_super_class(Some(super_class));
        }
        let mut interfaces = Vec::with_capacity(class_def.interfaces.len());
        for type_idx in class_def.interfaces.iter() {
            let interface = self.resolve_type_for_class(*type_idx, klass)?;
            if !klass.can_access(&interface) {
                return Err(ClassLoadErr::IllegalAccess(format!(
                    "Interface {} implemented by class {} is inaccessible",
                    interface.pretty_descriptor(),
                    klass.pretty_descriptor()
                )));
            }
            interfaces.push(interface);
        }
        klass.set_interfaces(interfaces);
        klass.set_status(ClassStatus::Loaded);
        return Ok(());
    }

    /// Array class for `descriptor`, defined in its component's loader.
    pub fn create_array_class(
        &self,
        descriptor: &str,
        loader: Option<&Arc<ClassLoader>>,
    ) -> Result<ClassRef, ClassLoadErr> {
        let component_descriptor = descriptor::component_descriptor(descriptor).ok_or_else(|| {
            ClassLoadErr::NoClassDefFound(format!("Invalid array descriptor {}", descriptor))
        })?;
        let component = match self.find_class(component_descriptor, loader) {
            Ok(component) => component,
            Err(e) => match self.lookup_class(component_descriptor, loader) {
                // Erroneous classes are accepted as components.
                Some(component) => component,
                None => return Err(e),
            },
        };
        if component.primitive_type() == PrimitiveType::Void {
            return Err(ClassLoadErr::NoClassDefFound(
                "Attempt to create array of void primitive type".to_string(),
            ));
        }
        let component_loader = component.loader();
        let requested_loader_id = loader.map_or(0, |l| Arc::as_ptr(l) as usize);
        if component.loader_id() != requested_loader_id {
            if let Some(existing) = self.lookup_class(descriptor, component_loader.as_ref()) {
                return Ok(existing);
            }
        }

        let new_class = match self.hand_crafted_class(HAND_CRAFTED_ARRAY_CLASSES, descriptor) {
            Some(klass) => klass,
            None => self.alloc_class(descriptor, component_loader.as_ref(), CLASS_HEADER_SIZE)?,
        };
        let object = self.class_root(ClassRoot::JavaLangObject)?;
        {
            let _lock = new_class.lock();
            new_class.set_component_type(Some(component.clone()));
            new_class.set_super_class(Some(object.clone()));
            new_class.set_vtable(object.vtable());
            new_class.set_primitive_type(PrimitiveType::Not);
            new_class.set_iftable(Some(self.array_iftable()));
            let mut access_flags = component.access_flags() & ACC_JAVA_FLAGS_MASK;
            access_flags |= ACC_ABSTRACT | ACC_FINAL;
            access_flags &= !ACC_INTERFACE;
            new_class.set_access_flags(access_flags);
            new_class.set_status(ClassStatus::Initialized);
        }
        if let Some(existing) = self.class_table.insert(&new_class) {
            return Ok(existing);
        }
        return Ok(new_class);
    }

    pub fn create_primitive_class(&self, primitive_type: PrimitiveType) -> Result<ClassRef, ClassLoadErr> {
        let klass = self.alloc_class(primitive_type.descriptor(), None, CLASS_HEADER_SIZE)?;
        return self.init_primitive_class(klass, primitive_type);
    }

    pub(crate) fn init_primitive_class(
        &self,
        klass: ClassRef,
        primitive_type: PrimitiveType,
    ) -> Result<ClassRef, ClassLoadErr> {
        {
            let _lock = klass.lock();
            klass.set_access_flags(ACC_PUBLIC | ACC_FINAL | ACC_ABSTRACT);
            klass.set_primitive_type(primitive_type);
            klass.set_status(ClassStatus::Initialized);
        }
        if let Some(existing) = self.class_table.insert(&klass) {
            return Ok(existing);
        }
        return Ok(klass);
    }

    pub fn find_primitive_class(&self, type_char: u8) -> Result<ClassRef, ClassLoadErr> {
        let root = match type_char {
            b'Z' => ClassRoot::PrimitiveBoolean,
            b'B' => ClassRoot::PrimitiveByte,
            b'C' => ClassRoot::PrimitiveChar,
            b'D' => ClassRoot::PrimitiveDouble,
            b'F' => ClassRoot::PrimitiveFloat,
            b'I' => ClassRoot::PrimitiveInt,
            b'J' => ClassRoot::PrimitiveLong,
            b'S' => ClassRoot::PrimitiveShort,
            b'V' => ClassRoot::PrimitiveVoid,
            _ => {
                return Err(ClassLoadErr::NoClassDefFound(format!(
                    "Not a primitive type: '{}'",
                    type_char as char
                )))
            }
        };
        return self.class_root(root);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::size_of_class;
    use crate::{
        dex::{ClassDefBuilder, ClassLoadErr, DexFileBuilder},
        linker::{class_loader::ClassLoader, roots::ClassRoot},
        object::{
            class::{
                ACC_ABSTRACT, ACC_CONSTRUCTOR, ACC_FINAL, ACC_INTERFACE, ACC_NATIVE, ACC_PRIVATE,
                ACC_PROTECTED, ACC_PUBLIC, ACC_STATIC,
            },
            ClassStatus, EntryPoint,
        },
        test::{app_dex, boot_linker, boot_linker_with, run_in_threads},
    };

    #[test]
    fn class_size_accounts_for_alignment() {
        let mut builder = DexFileBuilder::new("/data/app/sizes.dex", 1);
        let one_ref_one_long = builder.add_class(
            ClassDefBuilder::new("LA;", ACC_PUBLIC)
                .static_field("r", "Ljava/lang/Object;", ACC_STATIC)
                .static_field("j", "J", ACC_STATIC)
                .static_field("i", "I", ACC_STATIC)
                .static_field("z", "Z", ACC_STATIC),
        );
        let only_long = builder.add_class(
            ClassDefBuilder::new("LB;", ACC_PUBLIC)
                .static_field("r", "[I", ACC_STATIC)
                .static_field("d", "D", ACC_STATIC),
        );
        let empty = builder.add_class(ClassDefBuilder::new("LC;", ACC_PUBLIC));
        let dex = builder.build();
        // 128 + 4 (r) + 4 (i pulled forward) + 8 (j) + 4 (z)
        assert_eq!(size_of_class(&dex, one_ref_one_long), 148);
        // 128 + 4 (r) + 4 padding + 8 (d)
        assert_eq!(size_of_class(&dex, only_long), 144);
        assert_eq!(size_of_class(&dex, empty), 128);
    }

    #[test]
    fn primitive_classes() {
        let linker = boot_linker();
        let int_class = linker.find_system_class("I").unwrap();
        assert!(int_class.is_primitive());
        assert!(int_class.is_initialized());
        assert_eq!(int_class.access_flags(), ACC_PUBLIC | ACC_FINAL | ACC_ABSTRACT);
        assert!(Arc::ptr_eq(
            &int_class,
            &linker.get_class_root(ClassRoot::PrimitiveInt).unwrap()
        ));
        let err = linker.find_primitive_class(b'Q').unwrap_err();
        assert_eq!(err, ClassLoadErr::NoClassDefFound("Not a primitive type: 'Q'".to_string()));
    }

    #[test]
    fn array_classes_share_object_tables() {
        let linker = boot_linker();
        let object = linker.find_system_class("Ljava/lang/Object;").unwrap();
        let string_array2 = linker.find_system_class("[[Ljava/lang/String;").unwrap();
        let string_array = string_array2.component_type().unwrap();
        assert_eq!(string_array.descriptor(), "[Ljava/lang/String;");
        assert!(Arc::ptr_eq(&string_array2.super_class().unwrap(), &object));
        assert!(string_array2.is_initialized());
        assert!(string_array2.is_final() && string_array2.is_abstract());
        assert!(string_array2.is_public());
        assert!(Arc::ptr_eq(
            &string_array2.iftable().unwrap(),
            &string_array.iftable().unwrap()
        ));
        assert_eq!(string_array2.iftable_count(), 2);
        assert_eq!(string_array2.vtable_len(), object.vtable_len());

        let runnable_array = linker.find_system_class("[Ljava/lang/Runnable;").unwrap();
        assert_eq!(runnable_array.access_flags() & ACC_INTERFACE, 0);

        let err = linker.find_system_class("[V").unwrap_err();
        assert_eq!(
            err,
            ClassLoadErr::NoClassDefFound("Attempt to create array of void primitive type".to_string())
        );
        assert!(linker.find_system_class("[Lno/Such;").is_err());
    }

    #[test]
    fn array_is_defined_in_component_loader() {
        let linker = boot_linker();
        let loader = ClassLoader::new("app", None, vec![app_dex()]);
        let array = linker.find_class("[Ljava/lang/Object;", Some(&loader)).unwrap();
        assert!(array.is_boot_class());
        let app_array = linker.find_class("[Lapp/Main;", Some(&loader)).unwrap();
        assert_eq!(app_array.loader_id(), Arc::as_ptr(&loader) as usize);
        assert!(Arc::ptr_eq(
            &linker.find_class("[Lapp/Main;", Some(&loader)).unwrap(),
            &app_array
        ));
    }

    #[test]
    fn missing_classes() {
        let linker = boot_linker();
        let err = linker.find_system_class("Lno/Such;").unwrap_err();
        assert_eq!(err, ClassLoadErr::NoClassDefFound("Class Lno/Such; not found".to_string()));

        let loader = ClassLoader::new("app", None, vec![app_dex()]);
        let err = linker.find_class("Lno/Such;", Some(&loader)).unwrap_err();
        assert_eq!(
            err,
            ClassLoadErr::ClassNotFound(
                "Didn't find class \"no.Such\" on path: /data/app/app.dex".to_string()
            )
        );
    }

    #[test]
    fn parent_loader_is_asked_first() {
        let linker = boot_linker();
        let mut builder = DexFileBuilder::new("/data/app/shadow.dex", 3);
        builder.add_class(
            ClassDefBuilder::new("Ljava/lang/Runnable;", ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
                .superclass("Ljava/lang/Object;"),
        );
        builder.add_class(ClassDefBuilder::new("Lapp/Own;", ACC_PUBLIC).superclass("Ljava/lang/Object;"));
        let parent = ClassLoader::new("parent", None, vec![Arc::new(builder.build())]);
        let child = ClassLoader::new("child", Some(parent.clone()), vec![app_dex()]);

        let runnable = linker.find_class("Ljava/lang/Runnable;", Some(&child)).unwrap();
        assert!(runnable.is_boot_class());
        let own = linker.find_class("Lapp/Own;", Some(&child)).unwrap();
        assert_eq!(own.loader_id(), Arc::as_ptr(&parent) as usize);
        let main = linker.find_class("Lapp/Main;", Some(&child)).unwrap();
        assert_eq!(main.loader_id(), Arc::as_ptr(&child) as usize);
        assert!(main.is_resolved());
    }

    #[test]
    fn methods_are_loaded_with_entry_points() {
        let linker = boot_linker();
        let mut builder = DexFileBuilder::new("/data/app/methods.dex", 4);
        builder.add_class(
            ClassDefBuilder::new("Lapp/Methods;", ACC_PUBLIC | ACC_ABSTRACT)
                .superclass("Ljava/lang/Object;")
                .direct_method("<init>", "()V", ACC_PUBLIC)
                .direct_method("<clinit>", "()V", ACC_STATIC)
                .direct_method("helper", "()I", ACC_PRIVATE | ACC_STATIC)
                .direct_method("load", "()V", ACC_PRIVATE | ACC_NATIVE)
                .virtual_method("run", "()V", ACC_PUBLIC | ACC_ABSTRACT)
                .virtual_method("finalize", "()V", ACC_PROTECTED),
        );
        let loader = ClassLoader::new("app", None, vec![Arc::new(builder.build())]);
        let klass = linker.find_class("Lapp/Methods;", Some(&loader)).unwrap();
        assert!(klass.is_finalizable());

        let init = klass.find_declared_direct_method("<init>", "()V").unwrap();
        assert_ne!(init.access_flags() & ACC_CONSTRUCTOR, 0);
        assert_eq!(init.entry_point_from_quick(), EntryPoint::InterpreterBridge);
        assert_eq!(
            init.entry_point_from_interpreter(),
            EntryPoint::InterpreterToInterpreterBridge
        );
        let clinit = klass.find_class_initializer().unwrap();
        assert_eq!(clinit.method_index(), 1);
        let helper = klass.find_declared_direct_method("helper", "()I").unwrap();
        assert_eq!(helper.entry_point_from_quick(), EntryPoint::ResolutionTrampoline);
        assert_eq!(
            helper.entry_point_from_portable(),
            EntryPoint::PortableResolutionTrampoline
        );
        let native = klass.find_declared_direct_method("load", "()V").unwrap();
        assert_eq!(native.entry_point_from_quick(), EntryPoint::GenericJniTrampoline);
        assert_eq!(
            native.entry_point_from_interpreter(),
            EntryPoint::InterpreterToCompiledCodeBridge
        );
        let run = klass.find_declared_virtual_method("run", "()V").unwrap();
        assert_eq!(run.entry_point_from_portable(), EntryPoint::InterpreterBridge);
    }

    #[test]
    fn object_finalize_does_not_make_classes_finalizable() {
        let linker = boot_linker();
        let object = linker.find_system_class("Ljava/lang/Object;").unwrap();
        assert!(object.find_declared_virtual_method("finalize", "()V").is_some());
        assert!(!object.is_finalizable());
        let main = linker
            .find_class("Lapp/Main;", Some(&ClassLoader::new("app", None, vec![app_dex()])))
            .unwrap();
        assert!(!main.is_finalizable());
    }

    #[test]
    fn concurrent_define_has_one_winner() {
        let linker = boot_linker_with(|l| l);
        let loader = ClassLoader::new("app", None, vec![app_dex()]);
        let loaded = Arc::new(parking_lot::Mutex::new(vec![]));
        let count = Arc::new(AtomicUsize::new(0));
        {
            let linker = linker.clone();
            let loader = loader.clone();
            let loaded = loaded.clone();
            let count = count.clone();
            run_in_threads(8, move |_| {
                let klass = linker.find_class("Lapp/Main;", Some(&loader)).unwrap();
                count.fetch_add(1, Ordering::AcqRel);
                loaded.lock().push(klass);
            });
        }
        assert_eq!(count.load(Ordering::Acquire), 8);
        let loaded = loaded.lock();
        assert!(loaded.iter().all(|k| Arc::ptr_eq(k, &loaded[0])));
        assert_eq!(loaded[0].status(), ClassStatus::Resolved);
        assert_eq!(linker.lookup_classes("Lapp/Main;").len(), 1);
    }

    #[test]
    fn circular_superclasses_are_rejected() {
        let linker = boot_linker();
        let mut builder = DexFileBuilder::new("/data/app/cycle.dex", 5);
        builder.add_class(ClassDefBuilder::new("Lapp/A;", ACC_PUBLIC).superclass("Lapp/B;"));
        builder.add_class(ClassDefBuilder::new("Lapp/B;", ACC_PUBLIC).superclass("Lapp/A;"));
        let loader = ClassLoader::new("app", None, vec![Arc::new(builder.build())]);
        let err = linker.find_class("Lapp/A;", Some(&loader)).unwrap_err();
        assert!(matches!(err, ClassLoadErr::ClassCircularity(_)), "{}", err);
        let a = linker.lookup_class("Lapp/A;", Some(&loader)).unwrap();
        assert!(a.is_erroneous());
        let again = linker.find_class("Lapp/A;", Some(&loader)).unwrap_err();
        assert!(matches!(again, ClassLoadErr::NoClassDefFound(_)), "{}", again);
    }
}
