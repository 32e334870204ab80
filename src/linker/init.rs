use std::{
    collections::HashMap,
    sync::{atomic::Ordering, Arc},
    thread,
};

use super::{roots::ClassRoot, ClassLinker};
use crate::{
    dex::{ClassLoadErr, EncodedValue},
    object::{monitor::ObjectLock, ClassRef, ClassStatus, EntryPoint, JValue, MethodRef},
};

/// Whether `klass` can be initialized without the capabilities the caller
/// withholds: running static initializers or initializing superclasses.
pub fn can_we_initialize_class(klass: &ClassRef, can_init_statics: bool, can_init_parents: bool) -> bool {
    if can_init_statics && can_init_parents {
        return true;
    }
    if !can_init_statics {
        if klass.find_class_initializer().is_some() {
            return false;
        }
        if !klass.sfields().is_empty() && has_static_values(klass) {
            return false;
        }
    }
    if klass.is_interface() {
        return true;
    }
    return match klass.super_class() {
        Some(super_class) => {
            if !can_init_parents && !super_class.is_initialized() {
                return false;
            }
            can_we_initialize_class(&super_class, can_init_statics, can_init_parents)
        }
        None => true,
    };
}

fn has_static_values(klass: &ClassRef) -> bool {
    return match (klass.dex_cache(), klass.dex_class_def_idx()) {
        (Some(dex_cache), Some(idx)) => !dex_cache.dex_file().class_def(idx).static_values.is_empty(),
        _ => false,
    };
}

impl ClassLinker {
    /// Runs the initialization protocol for `klass`. `Ok(false)` means the
    /// class could not be initialized now without running code the caller
    /// disallowed, or that its verification is deferred to runtime.
    pub fn initialize_class(
        &self,
        klass: &ClassRef,
        can_init_statics: bool,
        can_init_parents: bool,
    ) -> Result<bool, ClassLoadErr> {
        if klass.is_initialized() {
            return Ok(true);
        }
        if !can_we_initialize_class(klass, can_init_statics, can_init_parents) {
            return Ok(false);
        }

        {
            let lock = klass.lock();
            if klass.is_initialized() {
                return Ok(true);
            }
            if klass.is_erroneous() {
                return Err(klass.earlier_failure());
            }
            if !klass.is_resolved() {
                return Err(ClassLoadErr::Linkage(format!(
                    "Attempt to initialize {} in state {:?}",
                    klass.pretty_descriptor(),
                    klass.status()
                )));
            }
            if !klass.is_verified() {
                self.verify_class(klass)?;
                if !klass.is_verified() {
                    // Left for runtime verification by the compiler.
                    return Ok(false);
                }
            }
            if klass.status() == ClassStatus::Initializing {
                if klass.clinit_thread() == Some(thread::current().id()) {
                    return Ok(true);
                }
                return self.wait_for_initialize_class(klass, &lock);
            }
            if let Err(e) = self.validate_super_class_descriptors(klass) {
                klass.set_erroneous(&e);
                return Err(e);
            }
            klass.set_clinit_thread(Some(thread::current().id()));
            klass.set_status(ClassStatus::Initializing);
        }

        if !klass.is_interface() {
            if let Some(super_class) = klass.super_class() {
                if !super_class.is_initialized() {
                    let super_initialized = self.initialize_class(&super_class, can_init_statics, true);
                    if !matches!(super_initialized, Ok(true)) {
                        let _lock = klass.lock();
                        let err = match super_initialized {
                            Err(e) => e,
                            Ok(_) => super_class.earlier_failure(),
                        };
                        log::debug!(
                            "Superclass {} of {} failed to initialize",
                            super_class.pretty_descriptor(),
                            klass.pretty_descriptor()
                        );
                        klass.set_erroneous(&err);
                        return Err(err);
                    }
                }
            }
        }

        let result = self
            .init_static_values(klass)
            .and_then(|_| match klass.find_class_initializer() {
                Some(clinit) => self.clinit_runner.run_class_initializer(self, klass, &clinit),
                None => Ok(()),
            });

        let _lock = klass.lock();
        if let Err(e) = result {
            let err = if e.is_error() {
                e
            } else {
                ClassLoadErr::ExceptionInInitializer(e.to_string())
            };
            log::debug!("Initialization of {} failed: {}", klass.pretty_descriptor(), err);
            klass.set_erroneous(&err);
            return Err(err);
        }
        self.num_class_inits.fetch_add(1, Ordering::AcqRel);
        klass.set_status(ClassStatus::Initialized);
        log::trace!("Initialized class {}", klass.descriptor());
        self.fixup_static_trampolines(klass);
        return Ok(true);
    }

    fn wait_for_initialize_class(
        &self,
        klass: &ClassRef,
        lock: &ObjectLock<'_>,
    ) -> Result<bool, ClassLoadErr> {
        loop {
            lock.wait();
            match klass.status() {
                ClassStatus::Initializing => continue,
                ClassStatus::Verified if self.is_compiler => return Ok(false),
                ClassStatus::Error => {
                    return Err(ClassLoadErr::NoClassDefFound(format!(
                        "<clinit> failed for class {}; see exception in other thread",
                        klass.pretty_descriptor()
                    )))
                }
                ClassStatus::Initialized => return Ok(true),
                status => {
                    return Err(ClassLoadErr::Linkage(format!(
                        "Unexpected class status. {} is {:?}",
                        klass.pretty_descriptor(),
                        status
                    )))
                }
            }
        }
    }

    /// Initializes `klass` unless it already is. Convenience for callers
    /// that need the class usable right away.
    pub fn ensure_initialized(
        &self,
        klass: &ClassRef,
        can_init_fields: bool,
        can_init_parents: bool,
    ) -> Result<bool, ClassLoadErr> {
        if klass.is_initialized() {
            return Ok(true);
        }
        return self.initialize_class(klass, can_init_fields, can_init_parents);
    }

    /// Initializes every class root that is neither a primitive nor an
    /// array.
    pub fn run_root_clinits(&self) -> Result<(), ClassLoadErr> {
        for root in ClassRoot::ALL.iter() {
            if root.is_primitive() || root.is_array() {
                continue;
            }
            let klass = self.class_root(*root)?;
            self.ensure_initialized(&klass, true, true)?;
        }
        return Ok(());
    }

    /// When a class and its superclass, or an interface it implements,
    /// come from different loaders, every overriding method must name the
    /// same classes in both loaders.
    pub fn validate_super_class_descriptors(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        if klass.is_interface() {
            return Ok(());
        }
        if let Some(super_class) = klass.super_class() {
            if !klass.has_same_loader(&super_class) {
                let vtable = klass.vtable().map(|v| v.to_vec()).unwrap_or_default();
                let super_vtable = super_class.vtable().map(|v| v.to_vec()).unwrap_or_default();
                for (method, super_method) in vtable.iter().zip(super_vtable.iter()).rev() {
                    if !Arc::ptr_eq(method, super_method)
                        && !self.has_same_signature_with_different_class_loaders(method, super_method)
                    {
                        return Err(ClassLoadErr::Linkage(format!(
                            "Class {} method {} resolves differently in superclass {}",
                            klass.pretty_descriptor(),
                            method.pretty_method(),
                            super_class.pretty_descriptor()
                        )));
                    }
                }
            }
        }
        if let Some(iftable) = klass.iftable() {
            for entry in iftable.entries() {
                if klass.has_same_loader(&entry.interface) {
                    continue;
                }
                let interface_methods = entry.interface.virtual_methods();
                for (method, interface_method) in entry.methods.iter().zip(interface_methods.iter()) {
                    if !Arc::ptr_eq(method, interface_method)
                        && !self.has_same_signature_with_different_class_loaders(method, interface_method)
                    {
                        return Err(ClassLoadErr::Linkage(format!(
                            "Class {} method {} resolves differently in interface {}",
                            klass.pretty_descriptor(),
                            method.pretty_method(),
                            entry.interface.pretty_descriptor()
                        )));
                    }
                }
            }
        }
        return Ok(());
    }

    fn has_same_signature_with_different_class_loaders(&self, m1: &MethodRef, m2: &MethodRef) -> bool {
        let (c1, c2) = match (m1.declaring_class(), m2.declaring_class()) {
            (Some(c1), Some(c2)) => (c1, c2),
            _ => return false,
        };
        let (l1, l2) = (c1.loader(), c2.loader());
        let mut types = vec![m1.return_type_descriptor()];
        types.extend(m1.param_type_descriptors());
        for type_descriptor in types {
            // Primitives are the same class in every loader.
            if type_descriptor.len() == 1 {
                continue;
            }
            let t1 = self.find_class(type_descriptor, l1.as_ref());
            let t2 = self.find_class(type_descriptor, l2.as_ref());
            match (t1, t2) {
                (Ok(t1), Ok(t2)) if Arc::ptr_eq(&t1, &t2) => {}
                _ => return false,
            }
        }
        return true;
    }

    /// Writes the encoded static values of the class definition into the
    /// static fields. Fields were reordered by layout, so values are
    /// matched by field index.
    fn init_static_values(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        if klass.sfields().is_empty() {
            return Ok(());
        }
        let (dex_cache, class_def_idx) = match (klass.dex_cache(), klass.dex_class_def_idx()) {
            (Some(dex_cache), Some(idx)) => (dex_cache, idx),
            _ => return Ok(()),
        };
        let dex_file = dex_cache.dex_file().clone();
        let class_def = dex_file.class_def(class_def_idx);
        let declared = match &class_def.class_data {
            Some(class_data) => &class_data.static_fields,
            None => return Ok(()),
        };
        let by_index: HashMap<u32, _> = klass
            .sfields()
            .iter()
            .map(|f| (f.dex_field_index(), f.clone()))
            .collect();
        let loader = klass.loader();
        for (value, member) in class_def.static_values.iter().zip(declared.iter()) {
            let field = match by_index.get(&member.member_idx) {
                Some(field) => field,
                None => continue,
            };
            let value = match value {
                EncodedValue::Boolean(v) => JValue::Boolean(*v),
                EncodedValue::Byte(v) => JValue::Byte(*v),
                EncodedValue::Short(v) => JValue::Short(*v),
                EncodedValue::Char(v) => JValue::Char(*v),
                EncodedValue::Int(v) => JValue::Int(*v),
                EncodedValue::Long(v) => JValue::Long(*v),
                EncodedValue::Float(v) => JValue::Float(*v),
                EncodedValue::Double(v) => JValue::Double(*v),
                EncodedValue::String(idx) => JValue::Str(self.resolve_string(&dex_cache, *idx)?),
                EncodedValue::Type(idx) => JValue::Class(self.resolve_type(&dex_cache, *idx, loader.as_ref())?),
                EncodedValue::Null => JValue::Null,
            };
            klass.set_static(field.offset(), value);
        }
        return Ok(());
    }

    /// Points the static methods of a freshly initialized class at their
    /// code, replacing the resolution trampoline installed at load time.
    pub(crate) fn fixup_static_trampolines(&self, klass: &ClassRef) {
        let direct_methods = klass.direct_methods();
        if direct_methods.is_empty() || self.is_compiler {
            return;
        }
        let oat_class = match (klass.dex_cache(), klass.dex_class_def_idx()) {
            (Some(dex_cache), Some(idx)) => self.oat_manager.find_oat_class(dex_cache.dex_file(), idx),
            _ => None,
        };
        for (method_index, method) in direct_methods.iter().enumerate() {
            if !method.is_static() {
                continue;
            }
            let oat_method = oat_class.as_ref().and_then(|c| c.oat_method(method_index));
            let quick_code = oat_method.as_ref().and_then(|m| m.quick_code());
            let portable_code = oat_method.as_ref().and_then(|m| m.portable_code());
            let (quick, portable) = match (quick_code, portable_code) {
                (None, None) if method.is_native() => {
                    (EntryPoint::GenericJniTrampoline, EntryPoint::PortableToQuickBridge)
                }
                (None, None) => (EntryPoint::InterpreterBridge, EntryPoint::InterpreterBridge),
                (quick, portable) => (
                    quick.map_or(EntryPoint::QuickToPortableBridge, EntryPoint::Compiled),
                    portable.map_or(EntryPoint::PortableToQuickBridge, EntryPoint::Compiled),
                ),
            };
            method.set_entry_point_from_quick(quick);
            method.set_entry_point_from_portable(portable);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::can_we_initialize_class;
    use crate::{
        dex::{ClassDefBuilder, ClassLoadErr, DexFileBuilder, StaticValue},
        linker::{class_loader::ClassLoader, FailureKind},
        object::{
            class::{ACC_CONSTRUCTOR, ACC_FINAL, ACC_PUBLIC, ACC_STATIC},
            ClassStatus, EntryPoint, JValue,
        },
        test::{boot_linker, boot_linker_with, run_in_threads, ScriptedInitializer, ScriptedVerifier},
    };

    fn loader() -> Arc<ClassLoader> {
        let mut builder = DexFileBuilder::new("/data/app/init.dex", 5);
        builder.add_class(
            ClassDefBuilder::new("Lpkg/Bar;", ACC_PUBLIC)
                .superclass("Ljava/lang/Object;")
                .direct_method("<clinit>", "()V", ACC_STATIC | ACC_CONSTRUCTOR),
        );
        builder.add_class(
            ClassDefBuilder::new("Lpkg/Foo;", ACC_PUBLIC)
                .superclass("Lpkg/Bar;")
                .direct_method("<clinit>", "()V", ACC_STATIC | ACC_CONSTRUCTOR)
                .direct_method("make", "()Lpkg/Foo;", ACC_PUBLIC | ACC_STATIC),
        );
        builder.add_class(
            ClassDefBuilder::new("Lpkg/Consts;", ACC_PUBLIC)
                .superclass("Ljava/lang/Object;")
                .static_field("NAME", "Ljava/lang/String;", ACC_STATIC | ACC_FINAL)
                .static_field("LIMIT", "J", ACC_STATIC | ACC_FINAL)
                .static_field("ANSWER", "I", ACC_STATIC | ACC_FINAL)
                .static_field("SELF", "Ljava/lang/Class;", ACC_STATIC | ACC_FINAL)
                .static_value(StaticValue::Str("consts".to_string()))
                .static_value(StaticValue::Long(1 << 40))
                .static_value(StaticValue::Int(42))
                .static_value(StaticValue::Type("Lpkg/Consts;".to_string())),
        );
        return ClassLoader::new("app", None, vec![Arc::new(builder.build())]);
    }

    #[test]
    fn concurrent_initialization_runs_clinit_once() {
        let runner = ScriptedInitializer::new();
        runner.delay("Lpkg/Bar;", 50);
        let linker = boot_linker_with(|l| l.with_initializer_runner(runner.clone()));
        let loader = loader();
        let bar = linker.find_class("Lpkg/Bar;", Some(&loader)).unwrap();
        {
            let (linker, bar) = (linker.clone(), bar.clone());
            run_in_threads(6, move |_| {
                assert_eq!(linker.initialize_class(&bar, true, true), Ok(true));
                assert!(bar.is_initialized());
            });
        }
        assert_eq!(runner.runs("Lpkg/Bar;"), 1);
        assert_eq!(bar.status(), ClassStatus::Initialized);
    }

    #[test]
    fn concurrent_initialization_failure_is_seen_by_all() {
        let runner = ScriptedInitializer::new();
        runner.delay("Lpkg/Bar;", 50);
        runner.fail("Lpkg/Bar;", ClassLoadErr::Exception {
            descriptor: "Ljava/lang/IllegalStateException;".to_string(),
            message: "boom".to_string(),
        });
        let linker = boot_linker_with(|l| l.with_initializer_runner(runner.clone()));
        let loader = loader();
        let bar = linker.find_class("Lpkg/Bar;", Some(&loader)).unwrap();
        let failures = Arc::new(parking_lot::Mutex::new(vec![]));
        {
            let (linker, bar, failures) = (linker.clone(), bar.clone(), failures.clone());
            run_in_threads(4, move |_| {
                failures.lock().push(linker.initialize_class(&bar, true, true).unwrap_err());
            });
        }
        assert_eq!(runner.runs("Lpkg/Bar;"), 1);
        let failures = failures.lock();
        let wrapped = ClassLoadErr::ExceptionInInitializer("java.lang.IllegalStateException: boom".to_string());
        assert_eq!(failures.iter().filter(|e| **e == wrapped).count(), 1);
        assert!(failures
            .iter()
            .filter(|e| **e != wrapped)
            .all(|e| matches!(e, ClassLoadErr::NoClassDefFound(_))));
    }

    #[test]
    fn erroneous_superclass_skips_subclass_clinit() {
        let runner = ScriptedInitializer::new();
        runner.fail("Lpkg/Bar;", ClassLoadErr::Exception {
            descriptor: "Ljava/lang/RuntimeException;".to_string(),
            message: "bad".to_string(),
        });
        let linker = boot_linker_with(|l| l.with_initializer_runner(runner.clone()));
        let loader = loader();
        let foo = linker.find_class("Lpkg/Foo;", Some(&loader)).unwrap();
        let err = linker.initialize_class(&foo, true, true).unwrap_err();
        assert!(matches!(err, ClassLoadErr::ExceptionInInitializer(_)));
        assert!(foo.is_erroneous());
        assert!(foo.super_class().unwrap().is_erroneous());
        assert_eq!(runner.runs("Lpkg/Foo;"), 0);

        // Later attempts report the earlier failure without running anything.
        let again = linker.initialize_class(&foo, true, true).unwrap_err();
        assert!(matches!(again, ClassLoadErr::NoClassDefFound(_)));
        assert_eq!(runner.runs("Lpkg/Bar;"), 1);
    }

    #[test]
    fn hard_verification_failure_prevents_initialization() {
        let verifier = ScriptedVerifier::new();
        verifier.script("Lpkg/Bar;", FailureKind::HardFailure, "bad stack");
        let runner = ScriptedInitializer::new();
        let linker = boot_linker_with(|l| {
            l.with_verifier(verifier.clone())
                .with_initializer_runner(runner.clone())
        });
        let loader = loader();
        let bar = linker.find_class("Lpkg/Bar;", Some(&loader)).unwrap();
        let err = linker.initialize_class(&bar, true, true).unwrap_err();
        assert_eq!(err, ClassLoadErr::Verify("bad stack".to_string()));
        assert_eq!(runner.runs("Lpkg/Bar;"), 0);
    }

    #[test]
    fn soft_failure_defers_initialization_when_compiling() {
        let verifier = ScriptedVerifier::new();
        verifier.script("Lpkg/Bar;", FailureKind::SoftFailure, "unresolved");
        let linker = boot_linker_with(|l| l.with_verifier(verifier.clone()).with_compiler_mode(true));
        let loader = loader();
        let bar = linker.find_class("Lpkg/Bar;", Some(&loader)).unwrap();
        assert_eq!(linker.initialize_class(&bar, true, true), Ok(false));
        assert_eq!(bar.status(), ClassStatus::RetryVerificationAtRuntime);
    }

    #[test]
    fn initialization_can_be_refused() {
        let runner = ScriptedInitializer::new();
        let linker = boot_linker_with(|l| l.with_initializer_runner(runner.clone()));
        let loader = loader();
        let foo = linker.find_class("Lpkg/Foo;", Some(&loader)).unwrap();
        assert!(!can_we_initialize_class(&foo, false, true));
        assert!(!can_we_initialize_class(&foo, true, false));
        assert_eq!(linker.initialize_class(&foo, true, false), Ok(false));
        assert_eq!(foo.status(), ClassStatus::Resolved);
        assert_eq!(runner.runs("Lpkg/Foo;"), 0);

        let count_before = linker.num_class_inits();
        assert_eq!(linker.ensure_initialized(&foo, true, true), Ok(true));
        assert_eq!(linker.num_class_inits(), count_before + 2);
        assert_eq!(runner.runs("Lpkg/Bar;"), 1);
        assert_eq!(runner.runs("Lpkg/Foo;"), 1);
    }

    #[test]
    fn reentrant_initialization_from_clinit() {
        let runner = ScriptedInitializer::new();
        runner.reenter("Lpkg/Bar;");
        let linker = boot_linker_with(|l| l.with_initializer_runner(runner.clone()));
        let loader = loader();
        let bar = linker.find_class("Lpkg/Bar;", Some(&loader)).unwrap();
        assert_eq!(linker.initialize_class(&bar, true, true), Ok(true));
        assert_eq!(runner.runs("Lpkg/Bar;"), 1);
    }

    #[test]
    fn static_values_follow_field_indexes() {
        let linker = boot_linker();
        let loader = loader();
        let consts = linker.find_class("Lpkg/Consts;", Some(&loader)).unwrap();
        assert_eq!(linker.initialize_class(&consts, true, true), Ok(true));
        let value = |name: &str| {
            let field = consts.sfields().iter().find(|f| f.name() == name).cloned().unwrap();
            consts.get_static(field.offset()).unwrap()
        };
        assert_eq!(value("NAME").as_str().as_deref(), Some("consts"));
        assert_eq!(value("LIMIT").as_long(), Some(1 << 40));
        assert_eq!(value("ANSWER").as_int(), Some(42));
        assert!(Arc::ptr_eq(&value("SELF").as_class().unwrap(), &consts));
        assert!(matches!(value("NAME"), JValue::Str(_)));
    }

    #[test]
    fn static_trampolines_are_fixed_up() {
        let linker = boot_linker();
        let loader = loader();
        let foo = linker.find_class("Lpkg/Foo;", Some(&loader)).unwrap();
        let make = foo.find_declared_direct_method("make", "()Lpkg/Foo;").unwrap();
        assert_eq!(make.entry_point_from_quick(), EntryPoint::ResolutionTrampoline);
        linker.initialize_class(&foo, true, true).unwrap();
        assert_eq!(make.entry_point_from_quick(), EntryPoint::InterpreterBridge);
        assert_eq!(make.entry_point_from_portable(), EntryPoint::InterpreterBridge);
    }

    #[test]
    fn cross_loader_overrides_must_agree() {
        // The parent and child loaders each define their own Lshared/Token;.
        let mut parent_dex = DexFileBuilder::new("/data/app/parent.dex", 1);
        parent_dex.add_class(ClassDefBuilder::new("Lshared/Token;", ACC_PUBLIC).superclass("Ljava/lang/Object;"));
        parent_dex.add_class(
            ClassDefBuilder::new("Lshared/Base;", ACC_PUBLIC)
                .superclass("Ljava/lang/Object;")
                .virtual_method("token", "()Lshared/Token;", ACC_PUBLIC),
        );
        let parent = ClassLoader::new("parent", None, vec![Arc::new(parent_dex.build())]);
        let mut child_dex = DexFileBuilder::new("/data/app/child.dex", 2);
        child_dex.add_class(
            ClassDefBuilder::new("Lother/Impl;", ACC_PUBLIC)
                .superclass("Lshared/Base;")
                .virtual_method("token", "()Lshared/Token;", ACC_PUBLIC),
        );
        child_dex.add_class(ClassDefBuilder::new("Lshared/Token;", ACC_PUBLIC).superclass("Ljava/lang/Object;"));
        let child_dex = Arc::new(child_dex.build());

        let linker = boot_linker();
        // Delegating to the parent finds the parent's Token: no conflict.
        let delegating = ClassLoader::new("delegating", Some(parent.clone()), vec![child_dex.clone()]);
        let agreeing = linker.find_class("Lother/Impl;", Some(&delegating)).unwrap();
        assert_eq!(linker.initialize_class(&agreeing, true, true), Ok(true));

        // A loader that defines Impl and Token itself but extends the parent's Base.
        let base = linker.find_class("Lshared/Base;", Some(&parent)).unwrap();
        let isolated = ClassLoader::new("isolated", None, vec![child_dex]);
        let impl_class = crate::object::Class::new(
            "Lother/Impl;",
            Some(&isolated),
            crate::memory::Address::null(),
            crate::object::class::CLASS_HEADER_SIZE,
        );
        let token_impl = crate::object::Method::new(&impl_class, 0, "token", "()Lshared/Token;", ACC_PUBLIC, true);
        let mut vtable: Vec<_> = base.vtable().unwrap().to_vec();
        let slot = vtable.iter().position(|m| m.name() == "token").unwrap();
        vtable[slot] = token_impl;
        impl_class.set_super_class(Some(base));
        impl_class.set_vtable(Some(vtable.into()));
        let err = linker.validate_super_class_descriptors(&impl_class).unwrap_err();
        assert_eq!(
            err,
            ClassLoadErr::Linkage(
                "Class other.Impl method other.Impl.token()Lshared/Token; resolves differently in superclass shared.Base"
                    .to_string()
            )
        );
    }
}
