use std::sync::Arc;

use super::{roots::ClassRoot, ClassLinker, IMT_SIZE};
use crate::{
    dex::ClassLoadErr,
    object::{
        class::{ACC_MIRANDA, ACC_REFERENCE_FLAGS_MASK},
        ClassRef, ClassStatus, IfTable, IfTableEntry, MethodRef,
    },
};

impl ClassLinker {
    /// Lays out a loaded class: superclass checks, dispatch tables, field
    /// offsets and reference bitmaps. Leaves the class resolved.
    pub(crate) fn link_class(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        self.link_super_class(klass)?;
        self.link_methods(klass)?;
        self.link_instance_fields(klass)?;
        self.link_static_fields(klass)?;
        self.create_reference_instance_offsets(klass);
        self.create_reference_static_offsets(klass);
        klass.set_status(ClassStatus::Resolved);
        return Ok(());
    }

    fn link_super_class(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        let super_class = klass.super_class();
        let is_object = match self.get_class_root(ClassRoot::JavaLangObject) {
            Some(object) => Arc::ptr_eq(&object, klass),
            None => false,
        };
        if is_object {
            if super_class.is_some() {
                return Err(ClassLoadErr::ClassFormat(
                    "java.lang.Object must not have a superclass".to_string(),
                ));
            }
            return Ok(());
        }
        let super_class = match super_class {
            Some(super_class) => super_class,
            None => {
                return Err(ClassLoadErr::Linkage(format!(
                    "No superclass defined for class {}",
                    klass.pretty_descriptor()
                )))
            }
        };
        if super_class.is_final() || super_class.is_interface() {
            return Err(ClassLoadErr::IncompatibleClassChange(format!(
                "Superclass {} of {} is {}",
                super_class.pretty_descriptor(),
                klass.pretty_descriptor(),
                if super_class.is_final() {
                    "declared final"
                } else {
                    "an interface"
                }
            )));
        }
        if !klass.can_access(&super_class) {
            return Err(ClassLoadErr::IllegalAccess(format!(
                "Superclass {} is inaccessible to class {}",
                super_class.pretty_descriptor(),
                klass.pretty_descriptor()
            )));
        }
        // A class that does not override finalize() still needs finalization.
        if super_class.is_finalizable() {
            klass.set_finalizable();
        }
        let reference_flags = super_class.access_flags() & ACC_REFERENCE_FLAGS_MASK;
        if reference_flags != 0 {
            klass.add_access_flags(reference_flags);
        }
        if self.is_init_done() {
            if let Some(reference) = self.get_class_root(ClassRoot::JavaLangRefReference) {
                if Arc::ptr_eq(&reference, &super_class) {
                    return Err(ClassLoadErr::Linkage(format!(
                        "Class {} attempts to subclass java.lang.ref.Reference, which is not allowed",
                        klass.pretty_descriptor()
                    )));
                }
            }
        }
        debug_assert!({
            let mut current = Some(super_class);
            let mut all_resolved = true;
            while let Some(c) = current {
                all_resolved &= c.is_resolved();
                current = c.super_class();
            }
            all_resolved
        });
        return Ok(());
    }

    fn link_methods(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        if klass.is_interface() {
            // Interfaces have no vtable; their methods are indexed in place.
            let methods = klass.virtual_methods();
            if methods.len() > u16::MAX as usize {
                return Err(ClassLoadErr::ClassFormat(format!(
                    "Too many methods on interface: {}",
                    methods.len()
                )));
            }
            for (i, method) in methods.iter().enumerate() {
                method.set_method_index(i as u16);
            }
        } else {
            self.link_virtual_methods(klass)?;
        }
        return self.link_interface_methods(klass);
    }

    fn link_virtual_methods(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        let local_methods = klass.virtual_methods();
        let super_class = match klass.super_class() {
            Some(super_class) => super_class,
            None => {
                if local_methods.len() > u16::MAX as usize {
                    return Err(ClassLoadErr::ClassFormat(format!(
                        "Too many methods: {}",
                        local_methods.len()
                    )));
                }
                for (i, method) in local_methods.iter().enumerate() {
                    method.set_method_index(i as u16);
                }
                klass.set_vtable(Some(local_methods.into()));
                return Ok(());
            }
        };

        let super_vtable = super_class.vtable();
        let super_vtable: &[MethodRef] = super_vtable.as_deref().unwrap_or(&[]);
        let mut vtable = Vec::with_capacity(super_vtable.len() + local_methods.len());
        vtable.extend_from_slice(super_vtable);
        for local_method in local_methods.iter() {
            let mut overridden = false;
            for j in (0..vtable.len()).rev() {
                let super_method = &vtable[j];
                if !local_method.has_same_name_and_signature(super_method) {
                    continue;
                }
                let super_method_class = match super_method.declaring_class() {
                    Some(c) => c,
                    None => continue,
                };
                if klass.can_access_member(&super_method_class, super_method.access_flags()) {
                    if super_method.is_final() {
                        return Err(ClassLoadErr::Linkage(format!(
                            "Method {} overrides final method in class {}",
                            local_method.pretty_method(),
                            super_method_class.pretty_descriptor()
                        )));
                    }
                    vtable[j] = local_method.clone();
                    local_method.set_method_index(j as u16);
                    overridden = true;
                    break;
                }
                log::warn!(
                    "Method {} does not override the package-private method in {}",
                    local_method.pretty_method(),
                    super_method_class.pretty_descriptor()
                );
            }
            if !overridden {
                if vtable.len() >= u16::MAX as usize {
                    return Err(ClassLoadErr::ClassFormat(format!(
                        "Too many methods defined on class: {}",
                        vtable.len() + 1
                    )));
                }
                local_method.set_method_index(vtable.len() as u16);
                vtable.push(local_method.clone());
            }
        }
        log::debug!(
            "{}: vtable of {} ({} inherited)",
            klass.pretty_descriptor(),
            vtable.len(),
            super_vtable.len()
        );
        klass.set_vtable(Some(vtable.into()));
        return Ok(());
    }

    fn link_interface_methods(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        let super_iftable = klass.super_class().and_then(|c| c.iftable());
        let super_ifcount = super_iftable.as_ref().map_or(0, |t| t.count());
        let interfaces = klass.interfaces();
        let mut ifcount = super_ifcount + interfaces.len();
        for interface in interfaces.iter() {
            ifcount += interface.iftable_count();
        }
        if ifcount == 0 {
            return Ok(());
        }
        if ifcount == super_ifcount {
            if let Some(super_iftable) = &super_iftable {
                let has_non_marker_interface = super_iftable
                    .entries()
                    .iter()
                    .any(|e| !e.methods.is_empty());
                if !has_non_marker_interface {
                    // Only marker interfaces are inherited: share the table.
                    klass.set_iftable(Some(super_iftable.clone()));
                    return Ok(());
                }
            }
        }

        let mut ordered: Vec<ClassRef> = Vec::with_capacity(ifcount);
        if let Some(super_iftable) = &super_iftable {
            ordered.extend(super_iftable.interfaces());
        }
        for interface in interfaces.iter() {
            if !interface.is_interface() {
                return Err(ClassLoadErr::IncompatibleClassChange(format!(
                    "Class {} implements non-interface class {}",
                    klass.pretty_descriptor(),
                    interface.pretty_descriptor()
                )));
            }
            if ordered.iter().any(|i| Arc::ptr_eq(i, interface)) {
                continue;
            }
            ordered.push(interface.clone());
            for super_interface in interface.iftable().map_or_else(Vec::new, |t| t.interfaces()) {
                if !ordered.iter().any(|i| Arc::ptr_eq(i, &super_interface)) {
                    ordered.push(super_interface);
                }
            }
        }

        if klass.is_interface() {
            let entries = ordered
                .into_iter()
                .map(|interface| IfTableEntry {
                    interface,
                    methods: vec![],
                })
                .collect();
            klass.set_iftable(Some(Arc::new(IfTable::new(entries))));
            return Ok(());
        }

        let mut vtable: Vec<MethodRef> = klass.vtable().map_or_else(Vec::new, |v| v.to_vec());
        let mut imtable: Vec<Option<MethodRef>> = vec![None; IMT_SIZE];
        let mut imtable_changed = false;
        let mut miranda_list: Vec<MethodRef> = vec![];
        let mut entries = Vec::with_capacity(ordered.len());
        for interface in ordered.into_iter() {
            let interface_methods = interface.virtual_methods();
            let mut methods = Vec::with_capacity(interface_methods.len());
            for interface_method in interface_methods.iter() {
                // Walking back from the end favors the subclass.
                let found = vtable
                    .iter()
                    .rev()
                    .find(|m| m.has_same_name_and_signature(interface_method))
                    .cloned();
                match found {
                    Some(vtable_method) => {
                        if !vtable_method.is_abstract() && !vtable_method.is_public() {
                            return Err(ClassLoadErr::IllegalAccess(format!(
                                "Method '{}' implementing interface method '{}' is not public",
                                vtable_method.pretty_method(),
                                interface_method.pretty_method()
                            )));
                        }
                        let imt_index = interface_method.dex_method_index() as usize % IMT_SIZE;
                        match &imtable[imt_index] {
                            None => {
                                imtable[imt_index] = Some(vtable_method.clone());
                                imtable_changed = true;
                            }
                            Some(existing) if Arc::ptr_eq(existing, &vtable_method) => {}
                            Some(_) => {
                                imtable[imt_index] = Some(self.imt_conflict_method.clone());
                            }
                        }
                        methods.push(vtable_method);
                    }
                    None => {
                        let miranda = match miranda_list
                            .iter()
                            .find(|m| m.has_same_name_and_signature(interface_method))
                        {
                            Some(miranda) => miranda.clone(),
                            None => {
                                let miranda = interface_method.copy();
                                miranda_list.push(miranda.clone());
                                miranda
                            }
                        };
                        methods.push(miranda);
                    }
                }
            }
            entries.push(IfTableEntry { interface, methods });
        }
        klass.set_iftable(Some(Arc::new(IfTable::new(entries))));

        if imtable_changed {
            let imtable: Vec<MethodRef> = imtable
                .into_iter()
                .map(|m| m.unwrap_or_else(|| self.imt_conflict_method.clone()))
                .collect();
            klass.set_imtable(Some(imtable.into()));
        }

        if !miranda_list.is_empty() {
            let mut virtual_methods = klass.virtual_methods();
            for miranda in miranda_list.iter() {
                // The declaring class stays the interface: type indices are
                // relative to it.
                miranda.add_access_flags(ACC_MIRANDA);
                miranda.set_method_index(vtable.len() as u16);
                virtual_methods.push(miranda.clone());
                vtable.push(miranda.clone());
            }
            log::debug!(
                "{}: {} miranda methods",
                klass.pretty_descriptor(),
                miranda_list.len()
            );
            klass.set_virtual_methods(virtual_methods);
            klass.set_vtable(Some(vtable.into()));
        }
        return Ok(());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        dex::{ClassDefBuilder, ClassLoadErr, DexFileBuilder},
        linker::{class_loader::ClassLoader, IMT_SIZE},
        object::class::{
            ACC_ABSTRACT, ACC_FINAL, ACC_INTERFACE, ACC_PUBLIC, ACC_STATIC,
        },
        test::boot_linker,
    };

    fn app_loader(classes: Vec<ClassDefBuilder>) -> Arc<ClassLoader> {
        let mut builder = DexFileBuilder::new("/data/app/link.dex", 11);
        for class in classes {
            builder.add_class(class);
        }
        return ClassLoader::new("app", None, vec![Arc::new(builder.build())]);
    }

    #[test]
    fn overrides_keep_superclass_slots() {
        let linker = boot_linker();
        let loader = app_loader(vec![
            ClassDefBuilder::new("Lapp/Base;", ACC_PUBLIC)
                .superclass("Ljava/lang/Object;")
                .virtual_method("a", "()V", ACC_PUBLIC)
                .virtual_method("b", "()V", ACC_PUBLIC),
            ClassDefBuilder::new("Lapp/Derived;", ACC_PUBLIC)
                .superclass("Lapp/Base;")
                .virtual_method("b", "()V", ACC_PUBLIC)
                .virtual_method("c", "()V", ACC_PUBLIC)
                .virtual_method("toString", "()Ljava/lang/String;", ACC_PUBLIC),
        ]);
        let object = linker.find_system_class("Ljava/lang/Object;").unwrap();
        let base = linker.find_class("Lapp/Base;", Some(&loader)).unwrap();
        let derived = linker.find_class("Lapp/Derived;", Some(&loader)).unwrap();
        let base_vtable = base.vtable().unwrap();
        let derived_vtable = derived.vtable().unwrap();

        for klass in [&base, &derived] {
            let vtable = klass.vtable().unwrap();
            let super_vtable = klass.super_class().unwrap().vtable().unwrap();
            assert!(vtable.len() >= super_vtable.len());
            for (i, method) in super_vtable.iter().enumerate() {
                assert!(vtable[i].has_same_name_and_signature(method));
            }
            for (i, method) in vtable.iter().enumerate() {
                assert_eq!(method.method_index() as usize, i);
            }
        }
        assert_eq!(base_vtable.len(), object.vtable_len() + 2);
        assert_eq!(derived_vtable.len(), base_vtable.len() + 1);

        let b = derived.find_declared_virtual_method("b", "()V").unwrap();
        let base_b = base.find_declared_virtual_method("b", "()V").unwrap();
        assert_eq!(b.method_index(), base_b.method_index());
        assert!(Arc::ptr_eq(&derived_vtable[b.method_index() as usize], &b));
        let to_string = derived
            .find_declared_virtual_method("toString", "()Ljava/lang/String;")
            .unwrap();
        let object_to_string = object
            .find_declared_virtual_method("toString", "()Ljava/lang/String;")
            .unwrap();
        assert_eq!(to_string.method_index(), object_to_string.method_index());
    }

    #[test]
    fn final_methods_cannot_be_overridden() {
        let linker = boot_linker();
        let loader = app_loader(vec![
            ClassDefBuilder::new("Lapp/Base;", ACC_PUBLIC)
                .superclass("Ljava/lang/Object;")
                .virtual_method("a", "()V", ACC_PUBLIC | ACC_FINAL),
            ClassDefBuilder::new("Lapp/Derived;", ACC_PUBLIC)
                .superclass("Lapp/Base;")
                .virtual_method("a", "()V", ACC_PUBLIC),
            ClassDefBuilder::new("Lapp/Sealed;", ACC_PUBLIC | ACC_FINAL)
                .superclass("Ljava/lang/Object;"),
            ClassDefBuilder::new("Lapp/Unsealed;", ACC_PUBLIC).superclass("Lapp/Sealed;"),
        ]);
        let err = linker.find_class("Lapp/Derived;", Some(&loader)).unwrap_err();
        assert_eq!(
            err,
            ClassLoadErr::Linkage(
                "Method app.Derived.a()V overrides final method in class app.Base".to_string()
            )
        );
        let err = linker.find_class("Lapp/Unsealed;", Some(&loader)).unwrap_err();
        assert!(matches!(err, ClassLoadErr::IncompatibleClassChange(_)), "{}", err);
    }

    #[test]
    fn unimplemented_interface_methods_become_mirandas() {
        let linker = boot_linker();
        let loader = app_loader(vec![
            ClassDefBuilder::new("Lapp/Shape;", ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
                .superclass("Ljava/lang/Object;")
                .virtual_method("area", "()D", ACC_PUBLIC | ACC_ABSTRACT)
                .virtual_method("name", "()Ljava/lang/String;", ACC_PUBLIC | ACC_ABSTRACT)
                .virtual_method("sides", "()I", ACC_PUBLIC | ACC_ABSTRACT),
            ClassDefBuilder::new("Lapp/Drawable;", ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT)
                .superclass("Ljava/lang/Object;")
                .virtual_method("draw", "()V", ACC_PUBLIC | ACC_ABSTRACT)
                .virtual_method("scale", "(I)V", ACC_PUBLIC | ACC_ABSTRACT),
            ClassDefBuilder::new("Lapp/Square;", ACC_PUBLIC | ACC_ABSTRACT)
                .superclass("Ljava/lang/Object;")
                .interface("Lapp/Shape;")
                .interface("Lapp/Drawable;")
                .virtual_method("area", "()D", ACC_PUBLIC)
                .virtual_method("sides", "()I", ACC_PUBLIC)
                .virtual_method("draw", "()V", ACC_PUBLIC),
        ]);
        let square = linker.find_class("Lapp/Square;", Some(&loader)).unwrap();
        let object = linker.find_system_class("Ljava/lang/Object;").unwrap();
        let vtable = square.vtable().unwrap();
        assert_eq!(vtable.len(), object.vtable_len() + 5);

        let mirandas: Vec<_> = vtable.iter().filter(|m| m.is_miranda()).collect();
        assert_eq!(mirandas.len(), 2);
        let mut names: Vec<_> = mirandas.iter().map(|m| m.name().to_string()).collect();
        names.sort();
        assert_eq!(names, vec!["name", "scale"]);
        for miranda in mirandas.iter() {
            assert!(miranda.is_abstract());
            assert!(Arc::ptr_eq(&vtable[miranda.method_index() as usize], miranda));
            assert!(miranda.declaring_class().unwrap().is_interface());
        }
        // Mirandas follow every real method.
        assert!(vtable[vtable.len() - 2].is_miranda() && vtable[vtable.len() - 1].is_miranda());
        assert_eq!(square.virtual_methods().len(), 5);

        let iftable = square.iftable().unwrap();
        assert_eq!(iftable.count(), 2);
        let shape_methods = iftable.method_array(0);
        assert!(Arc::ptr_eq(
            &shape_methods[0],
            &square.find_declared_virtual_method("area", "()D").unwrap()
        ));
        assert!(shape_methods[1].is_miranda());
    }

    #[test]
    fn interface_method_table_slots() {
        let linker = boot_linker();
        let loader = app_loader(vec![
            ClassDefBuilder::new("Lapp/Task;", ACC_PUBLIC).superclass("Ljava/lang/Object;")
                .interface("Ljava/lang/Runnable;")
                .virtual_method("run", "()V", ACC_PUBLIC),
            ClassDefBuilder::new("Lapp/Hidden;", ACC_PUBLIC | ACC_ABSTRACT)
                .superclass("Ljava/lang/Object;")
                .interface("Ljava/lang/Runnable;")
                .direct_method("run", "()V", ACC_STATIC),
            ClassDefBuilder::new("Lapp/Quiet;", ACC_PUBLIC).superclass("Ljava/lang/Object;")
                .interface("Ljava/lang/Runnable;")
                .virtual_method("run", "()V", 0),
        ]);
        let task = linker.find_class("Lapp/Task;", Some(&loader)).unwrap();
        let runnable = linker.find_system_class("Ljava/lang/Runnable;").unwrap();
        let interface_run = runnable.find_declared_virtual_method("run", "()V").unwrap();
        let run = task.find_declared_virtual_method("run", "()V").unwrap();
        let imtable = linker.imtable_for(&task);
        assert_eq!(imtable.len(), IMT_SIZE);
        let slot = interface_run.dex_method_index() as usize % IMT_SIZE;
        assert!(Arc::ptr_eq(&imtable[slot], &run));
        let conflicts = imtable
            .iter()
            .filter(|m| Arc::ptr_eq(m, linker.imt_conflict_method()))
            .count();
        assert_eq!(conflicts, IMT_SIZE - 1);

        let object = linker.find_system_class("Ljava/lang/Object;").unwrap();
        assert!(Arc::ptr_eq(&linker.imtable_for(&object)[0], linker.imt_unimplemented_method()));

        let err = linker.find_class("Lapp/Quiet;", Some(&loader)).unwrap_err();
        assert_eq!(
            err,
            ClassLoadErr::IllegalAccess(
                "Method 'app.Quiet.run()V' implementing interface method 'java.lang.Runnable.run()V' is not public"
                    .to_string()
            )
        );
        let hidden = linker.find_class("Lapp/Hidden;", Some(&loader)).unwrap();
        assert!(hidden.vtable().unwrap().last().unwrap().is_miranda());
    }

    #[test]
    fn marker_interfaces_share_the_superclass_table() {
        let linker = boot_linker();
        let loader = app_loader(vec![
            ClassDefBuilder::new("Lapp/Value;", ACC_PUBLIC)
                .superclass("Ljava/lang/Object;")
                .interface("Ljava/io/Serializable;"),
            ClassDefBuilder::new("Lapp/Money;", ACC_PUBLIC).superclass("Lapp/Value;"),
            ClassDefBuilder::new("Lapp/Again;", ACC_PUBLIC)
                .superclass("Lapp/Value;")
                .interface("Ljava/io/Serializable;"),
        ]);
        let value = linker.find_class("Lapp/Value;", Some(&loader)).unwrap();
        let money = linker.find_class("Lapp/Money;", Some(&loader)).unwrap();
        let again = linker.find_class("Lapp/Again;", Some(&loader)).unwrap();
        assert!(Arc::ptr_eq(&value.iftable().unwrap(), &money.iftable().unwrap()));
        // Duplicates collapse, but the table is rebuilt when new interfaces
        // are declared.
        assert_eq!(again.iftable_count(), 1);
        assert!(money.imtable().is_none());
    }

    #[test]
    fn implementing_a_class_is_rejected() {
        let linker = boot_linker();
        let loader = app_loader(vec![
            ClassDefBuilder::new("Lapp/Base;", ACC_PUBLIC).superclass("Ljava/lang/Object;"),
            ClassDefBuilder::new("Lapp/Wrong;", ACC_PUBLIC)
                .superclass("Ljava/lang/Object;")
                .interface("Lapp/Base;"),
        ]);
        let err = linker.find_class("Lapp/Wrong;", Some(&loader)).unwrap_err();
        assert_eq!(
            err,
            ClassLoadErr::IncompatibleClassChange(
                "Class app.Wrong implements non-interface class app.Base".to_string()
            )
        );
    }

    #[test]
    fn reference_cannot_be_subclassed_after_bootstrap() {
        let linker = boot_linker();
        let loader = app_loader(vec![ClassDefBuilder::new("Lapp/MyRef;", ACC_PUBLIC)
            .superclass("Ljava/lang/ref/Reference;")]);
        let err = linker.find_class("Lapp/MyRef;", Some(&loader)).unwrap_err();
        assert!(matches!(err, ClassLoadErr::Linkage(_)), "{}", err);

        let weak = linker.find_system_class("Ljava/lang/ref/WeakReference;").unwrap();
        assert!(weak.is_reference_class() && weak.is_weak_reference_class());
    }
}
