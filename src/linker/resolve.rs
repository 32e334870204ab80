use std::sync::Arc;

use super::{class_loader::ClassLoader, ClassLinker};
use crate::{
    dex::{descriptor, ClassLoadErr, DexFile},
    object::{ClassRef, DexCache, FieldRef, InvokeType, MethodRef},
};

impl ClassLinker {
    /// Creates the resolution cache for `dex_file`, or returns the one
    /// already registered for it.
    pub fn register_dex_file(&self, dex_file: &Arc<DexFile>) -> Result<Arc<DexCache>, ClassLoadErr> {
        if let Some(dex_cache) = self.find_dex_cache(dex_file) {
            return Ok(dex_cache);
        }
        let storage = self
            .heap
            .alloc_non_movable_object(DexCache::storage_size(dex_file));
        if storage.is_null() {
            return Err(ClassLoadErr::OutOfMemory(format!(
                "Failed to allocate dex cache for {}",
                dex_file.location()
            )));
        }
        let dex_cache = Arc::new(DexCache::new(dex_file.clone(), storage));
        return Ok(self.register_dex_cache(dex_cache));
    }

    /// Registers a cache built elsewhere, such as one from the image. When a
    /// cache for the same dex file is already present that one is kept.
    pub fn register_dex_cache(&self, dex_cache: Arc<DexCache>) -> Arc<DexCache> {
        let mut dex_caches = self.dex_caches.write();
        if let Some(existing) = dex_caches
            .iter()
            .find(|d| Arc::ptr_eq(d.dex_file(), dex_cache.dex_file()))
        {
            return existing.clone();
        }
        log::debug!("Registered dex file {}", dex_cache.location());
        dex_caches.push(dex_cache.clone());
        return dex_cache;
    }

    pub fn is_dex_file_registered(&self, dex_file: &DexFile) -> bool {
        return self.find_dex_cache(dex_file).is_some();
    }

    pub fn find_dex_cache(&self, dex_file: &DexFile) -> Option<Arc<DexCache>> {
        return self
            .dex_caches
            .read()
            .iter()
            .find(|d| std::ptr::eq(d.dex_file().as_ref(), dex_file))
            .cloned();
    }

    /// Adds a dex file to the end of the boot class path.
    pub fn append_to_boot_class_path(&self, dex_file: Arc<DexFile>) -> Result<(), ClassLoadErr> {
        self.register_dex_file(&dex_file)?;
        self.boot_class_path.write().push(dex_file);
        return Ok(());
    }

    pub fn resolve_string(&self, dex_cache: &DexCache, string_idx: u32) -> Result<Arc<str>, ClassLoadErr> {
        if let Some(resolved) = dex_cache.resolved_string(string_idx) {
            return Ok(resolved);
        }
        let dex_file = dex_cache.dex_file();
        dex_file.check_string_idx(string_idx)?;
        let interned = self.intern_table.intern_strong(dex_file.string_data(string_idx));
        return Ok(dex_cache.set_resolved_string(string_idx, interned));
    }

    pub fn resolve_type(
        &self,
        dex_cache: &DexCache,
        type_idx: u16,
        loader: Option<&Arc<ClassLoader>>,
    ) -> Result<ClassRef, ClassLoadErr> {
        if let Some(resolved) = dex_cache.resolved_type(type_idx) {
            return Ok(resolved);
        }
        dex_cache.dex_file().check_type_idx(type_idx)?;
        let type_descriptor = dex_cache.dex_file().type_descriptor(type_idx);
        let resolved = match self.find_class(type_descriptor, loader) {
            Ok(resolved) => resolved,
            // A missing class seen through a symbolic reference is a
            // definition error, not a lookup failure.
            Err(ClassLoadErr::ClassNotFound(_)) => {
                return Err(ClassLoadErr::NoClassDefFound(format!(
                    "Failed resolution of: {}",
                    type_descriptor
                )))
            }
            Err(e) => return Err(e),
        };
        return Ok(dex_cache.set_resolved_type(type_idx, resolved));
    }

    /// Resolves a type named by `klass`'s own dex file, as seen by its
    /// defining loader.
    pub fn resolve_type_for_class(&self, type_idx: u16, klass: &ClassRef) -> Result<ClassRef, ClassLoadErr> {
        let dex_cache = referrer_dex_cache(klass)?;
        return self.resolve_type(&dex_cache, type_idx, klass.loader().as_ref());
    }

    /// Resolves `method_idx` for a call site of kind `invoke_type`. The
    /// index lookup only hits inside the same dex file; the name and
    /// signature lookup works across dex files.
    ///
    /// A method of the wrong kind, or one `referrer` may not access, is an
    /// error and never lands in the cache.
    pub fn resolve_method(
        &self,
        dex_cache: &Arc<DexCache>,
        method_idx: u32,
        loader: Option<&Arc<ClassLoader>>,
        referrer: Option<&MethodRef>,
        invoke_type: InvokeType,
    ) -> Result<MethodRef, ClassLoadErr> {
        let dex_file = dex_cache.dex_file();
        dex_file.check_method_idx(method_idx)?;
        if let Some(resolved) = dex_cache.resolved_method(method_idx) {
            // A kind mismatch on a cached method falls through to the
            // lookup below, which classifies the error.
            if !resolved.is_runtime_method() && !resolved.check_incompatible_class_change(invoke_type) {
                check_method_access(referrer, &resolved, invoke_type)?;
                return Ok(resolved);
            }
        }
        let method_id = dex_file.method_id(method_idx);
        let klass = self.resolve_type(dex_cache, method_id.class_idx, loader)?;

        let mut resolved = match invoke_type {
            InvokeType::Direct | InvokeType::Static => klass.find_direct_method_by_idx(dex_cache, method_idx),
            InvokeType::Interface => klass.find_interface_method_by_idx(dex_cache, method_idx),
            InvokeType::Super | InvokeType::Virtual => klass.find_virtual_method_by_idx(dex_cache, method_idx),
        };
        let name = dex_file.method_name(method_idx);
        let signature = dex_file.method_signature(method_idx);
        if resolved.is_none() {
            log::trace!(
                "Resolving {}{} in {} by name",
                name,
                signature,
                klass.pretty_descriptor()
            );
            resolved = match invoke_type {
                InvokeType::Direct | InvokeType::Static => klass.find_direct_method(name, &signature),
                InvokeType::Interface => klass.find_interface_method(name, &signature),
                InvokeType::Super | InvokeType::Virtual => klass.find_virtual_method(name, &signature),
            };
        }
        if let Some(method) = resolved {
            if !method.check_incompatible_class_change(invoke_type) {
                check_method_access(referrer, &method, invoke_type)?;
                return Ok(dex_cache.set_resolved_method(method_idx, method));
            }
        }

        // Nothing usable: work out whether it is an access error, an
        // incompatible class change or a missing method.
        let other = match invoke_type {
            InvokeType::Direct | InvokeType::Static => klass.find_virtual_method(name, &signature),
            InvokeType::Interface | InvokeType::Virtual | InvokeType::Super => {
                klass.find_direct_method(name, &signature)
            }
        };
        if let Some(method) = &other {
            check_method_access(referrer, method, invoke_type)?;
        }

        let no_such_method = || {
            ClassLoadErr::NoSuchMethod(format!(
                "No {} method {}{} in class {} or its super classes",
                invoke_type,
                name,
                signature,
                klass.descriptor()
            ))
        };
        let (found, found_type) = match invoke_type {
            InvokeType::Super => return Err(no_such_method()),
            InvokeType::Direct | InvokeType::Static => match other {
                Some(method) => (method, InvokeType::Virtual),
                None => match klass.find_interface_method(name, &signature) {
                    Some(method) => (method, InvokeType::Interface),
                    None => return Err(no_such_method()),
                },
            },
            InvokeType::Interface => match other {
                Some(method) => (method, InvokeType::Direct),
                None => match klass.find_virtual_method(name, &signature) {
                    Some(method) => (method, InvokeType::Virtual),
                    None => return Err(no_such_method()),
                },
            },
            InvokeType::Virtual => match other {
                Some(method) => (method, InvokeType::Direct),
                None => match klass.find_interface_method(name, &signature) {
                    Some(method) => (method, InvokeType::Interface),
                    None => return Err(no_such_method()),
                },
            },
        };
        return Err(ClassLoadErr::IncompatibleClassChange(format!(
            "The method '{}' was expected to be of type {} but instead was found to be of type {}",
            found.pretty_method(),
            invoke_type,
            found_type
        )));
    }

    /// Resolves a method named by the dex file of `referrer`'s class, as
    /// seen by that class's loader.
    pub fn resolve_method_for_referrer(
        &self,
        method_idx: u32,
        referrer: &MethodRef,
        invoke_type: InvokeType,
    ) -> Result<MethodRef, ClassLoadErr> {
        let referring_class = referrer.declaring_class().ok_or_else(|| {
            ClassLoadErr::Linkage(format!("Runtime method {} has no dex file", referrer.name()))
        })?;
        let dex_cache = referrer_dex_cache(&referring_class)?;
        return self.resolve_method(
            &dex_cache,
            method_idx,
            referring_class.loader().as_ref(),
            Some(referrer),
            invoke_type,
        );
    }

    pub fn resolve_field(
        &self,
        dex_cache: &Arc<DexCache>,
        field_idx: u32,
        loader: Option<&Arc<ClassLoader>>,
        referrer: Option<&MethodRef>,
        is_static: bool,
    ) -> Result<FieldRef, ClassLoadErr> {
        let dex_file = dex_cache.dex_file();
        dex_file.check_field_idx(field_idx)?;
        if let Some(resolved) = dex_cache.resolved_field(field_idx) {
            check_field_access(referrer, &resolved)?;
            return Ok(resolved);
        }
        let klass = self.resolve_type(dex_cache, dex_file.field_id(field_idx).class_idx, loader)?;
        let mut resolved = if is_static {
            klass.find_static_field_by_idx(dex_cache, field_idx)
        } else {
            klass.find_instance_field_by_idx(dex_cache, field_idx)
        };
        if resolved.is_none() {
            let name = dex_file.field_name(field_idx);
            let type_descriptor = dex_file.field_type_descriptor(field_idx);
            resolved = if is_static {
                klass.find_static_field(name, type_descriptor)
            } else {
                klass.find_instance_field(name, type_descriptor)
            };
        }
        return match resolved {
            Some(field) => {
                check_field_access(referrer, &field)?;
                Ok(dex_cache.set_resolved_field(field_idx, field))
            }
            None => Err(no_such_field(
                if is_static { "static " } else { "instance " },
                &klass,
                dex_file,
                field_idx,
            )),
        };
    }

    /// Field resolution that ignores whether the field is static, searching
    /// in language order: declared fields, interfaces, then superclasses.
    pub fn resolve_field_jls(
        &self,
        dex_cache: &Arc<DexCache>,
        field_idx: u32,
        loader: Option<&Arc<ClassLoader>>,
        referrer: Option<&MethodRef>,
    ) -> Result<FieldRef, ClassLoadErr> {
        let dex_file = dex_cache.dex_file();
        dex_file.check_field_idx(field_idx)?;
        if let Some(resolved) = dex_cache.resolved_field(field_idx) {
            check_field_access(referrer, &resolved)?;
            return Ok(resolved);
        }
        let klass = self.resolve_type(dex_cache, dex_file.field_id(field_idx).class_idx, loader)?;
        let name = dex_file.field_name(field_idx);
        let type_descriptor = dex_file.field_type_descriptor(field_idx);
        return match klass.find_field(name, type_descriptor) {
            Some(field) => {
                check_field_access(referrer, &field)?;
                Ok(dex_cache.set_resolved_field(field_idx, field))
            }
            None => Err(no_such_field("", &klass, dex_file, field_idx)),
        };
    }
}

fn referrer_dex_cache(klass: &ClassRef) -> Result<Arc<DexCache>, ClassLoadErr> {
    return klass.dex_cache().ok_or_else(|| {
        ClassLoadErr::Linkage(format!(
            "Class {} has no dex cache to resolve against",
            klass.pretty_descriptor()
        ))
    });
}

fn check_method_access(
    referrer: Option<&MethodRef>,
    method: &MethodRef,
    invoke_type: InvokeType,
) -> Result<(), ClassLoadErr> {
    let referring_class = match referrer.and_then(|r| r.declaring_class()) {
        Some(klass) => klass,
        None => return Ok(()),
    };
    let methods_class = match method.declaring_class() {
        Some(klass) => klass,
        None => return Ok(()),
    };
    if !referring_class.can_access(&methods_class) {
        return Err(ClassLoadErr::IllegalAccess(format!(
            "Illegal class access: '{}' attempting to access '{}' via {} invocation of {}",
            referring_class.pretty_descriptor(),
            methods_class.pretty_descriptor(),
            invoke_type,
            method.pretty_method()
        )));
    }
    if !referring_class.can_access_member(&methods_class, method.access_flags()) {
        return Err(ClassLoadErr::IllegalAccess(format!(
            "Method '{}' is inaccessible to class '{}'",
            method.pretty_method(),
            referring_class.pretty_descriptor()
        )));
    }
    return Ok(());
}

fn check_field_access(referrer: Option<&MethodRef>, field: &FieldRef) -> Result<(), ClassLoadErr> {
    let referring_class = match referrer.and_then(|r| r.declaring_class()) {
        Some(klass) => klass,
        None => return Ok(()),
    };
    let fields_class = match field.declaring_class() {
        Some(klass) => klass,
        None => return Ok(()),
    };
    if !referring_class.can_access(&fields_class) {
        return Err(ClassLoadErr::IllegalAccess(format!(
            "Illegal class access: '{}' attempting to access '{}' via field {}",
            referring_class.pretty_descriptor(),
            fields_class.pretty_descriptor(),
            field.pretty_field()
        )));
    }
    if !referring_class.can_access_member(&fields_class, field.access_flags()) {
        return Err(ClassLoadErr::IllegalAccess(format!(
            "Field '{}' is inaccessible to class '{}'",
            field.pretty_field(),
            referring_class.pretty_descriptor()
        )));
    }
    return Ok(());
}

fn no_such_field(kind: &str, klass: &ClassRef, dex_file: &DexFile, field_idx: u32) -> ClassLoadErr {
    return ClassLoadErr::NoSuchField(format!(
        "No {}field {} of type {} in class {} or its superclasses",
        kind,
        dex_file.field_name(field_idx),
        descriptor::pretty_descriptor(dex_file.field_type_descriptor(field_idx)),
        klass.descriptor()
    ));
}
