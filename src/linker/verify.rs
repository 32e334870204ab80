use super::{ClassLinker, FailureKind};
use crate::{
    dex::ClassLoadErr,
    object::{ClassRef, ClassStatus},
};

impl ClassLinker {
    /// Drives a resolved class to verified, or to retry-at-runtime when
    /// compiling ahead of time.
    pub fn verify_class(&self, klass: &ClassRef) -> Result<(), ClassLoadErr> {
        let _lock = klass.lock();
        if klass.is_verified() || (klass.is_compile_time_verified() && self.is_compiler) {
            return Ok(());
        }
        if klass.is_erroneous() {
            return Err(klass.earlier_failure());
        }
        match klass.status() {
            ClassStatus::Resolved => klass.set_status(ClassStatus::Verifying),
            ClassStatus::RetryVerificationAtRuntime if !self.is_compiler => {
                klass.set_status(ClassStatus::VerifyingAtRuntime)
            }
            status => {
                return Err(ClassLoadErr::Linkage(format!(
                    "Attempt to verify {} in state {:?}",
                    klass.pretty_descriptor(),
                    status
                )))
            }
        }
        if !self.verification_enabled {
            klass.set_status(ClassStatus::Verified);
            return Ok(());
        }

        let super_class = klass.super_class();
        if let Some(super_class) = &super_class {
            let _super_lock = super_class.lock();
            if !super_class.is_verified() && !super_class.is_erroneous() {
                // The superclass failure is reported through the subclass.
                let _ = self.verify_class(super_class);
            }
            if !super_class.is_compile_time_verified() {
                let msg = format!(
                    "Rejecting class {} that attempts to sub-class erroneous class {}",
                    klass.pretty_descriptor(),
                    super_class.pretty_descriptor()
                );
                log::error!("{} in {}", msg, dex_location(klass));
                return Err(self.reject(klass, msg));
            }
        }

        let (preverified, oat_status) = self.verify_class_using_oat_file(klass);
        if oat_status == Some(ClassStatus::Error) {
            log::debug!(
                "Skipping runtime verification of erroneous class {} in {}",
                klass.pretty_descriptor(),
                dex_location(klass)
            );
            let msg = format!(
                "Rejecting class {} because it failed compile-time verification",
                klass.pretty_descriptor()
            );
            return Err(self.reject(klass, msg));
        }

        let (mut failure, msg) = if preverified {
            (FailureKind::NoFailure, String::new())
        } else {
            self.verifier.verify_class(klass, self.is_compiler)
        };
        match failure {
            FailureKind::HardFailure => {
                log::error!(
                    "Verification failed on class {} in {} because: {}",
                    klass.pretty_descriptor(),
                    dex_location(klass),
                    msg
                );
                return Err(self.reject(klass, msg));
            }
            FailureKind::NoFailure => {
                // A clean class still inherits the superclass's deferral.
                match &super_class {
                    Some(s) if !s.is_verified() => {
                        klass.set_status(ClassStatus::RetryVerificationAtRuntime);
                        failure = FailureKind::SoftFailure;
                    }
                    _ => klass.set_status(ClassStatus::Verified),
                }
            }
            FailureKind::SoftFailure => {
                log::debug!(
                    "Soft verification failure in class {} in {} because: {}",
                    klass.pretty_descriptor(),
                    dex_location(klass),
                    msg
                );
                // At runtime the slow paths in compiled code cover soft failures.
                if self.is_compiler {
                    klass.set_status(ClassStatus::RetryVerificationAtRuntime);
                } else {
                    klass.set_status(ClassStatus::Verified);
                }
            }
        }
        if preverified || failure == FailureKind::NoFailure {
            klass.set_preverified_flag_on_all_methods();
        }
        return Ok(());
    }

    fn reject(&self, klass: &ClassRef, msg: String) -> ClassLoadErr {
        let err = ClassLoadErr::Verify(msg);
        klass.set_erroneous(&err);
        return err;
    }

    /// Whether the artifact compiled for the class's dex file already
    /// verified it, together with the status the artifact recorded.
    fn verify_class_using_oat_file(&self, klass: &ClassRef) -> (bool, Option<ClassStatus>) {
        // Ahead-of-time compilation only trusts artifacts for boot classes.
        if self.is_compiler && !klass.is_boot_class() {
            return (false, None);
        }
        let (dex_cache, class_def_idx) = match (klass.dex_cache(), klass.dex_class_def_idx()) {
            (Some(dex_cache), Some(idx)) => (dex_cache, idx),
            _ => return (false, None),
        };
        let oat_class = match self.oat_manager.find_oat_class(dex_cache.dex_file(), class_def_idx) {
            Some(oat_class) => oat_class,
            None => return (false, None),
        };
        let status = oat_class.status();
        let preverified = matches!(status, ClassStatus::Verified | ClassStatus::Initialized);
        return (preverified, Some(status));
    }
}

fn dex_location(klass: &ClassRef) -> String {
    return klass
        .dex_cache()
        .map_or_else(|| "<unknown>".to_string(), |d| d.location().to_string());
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        dex::{ClassDefBuilder, ClassLoadErr, DexFileBuilder},
        linker::{class_loader::ClassLoader, FailureKind},
        object::{class::ACC_PUBLIC, ClassStatus},
        test::{boot_linker_with, ScriptedVerifier},
    };

    fn loader() -> Arc<ClassLoader> {
        let mut builder = DexFileBuilder::new("/data/app/verify.dex", 31);
        builder.add_class(
            ClassDefBuilder::new("Lapp/Base;", ACC_PUBLIC)
                .superclass("Ljava/lang/Object;")
                .virtual_method("go", "()V", ACC_PUBLIC),
        );
        builder.add_class(ClassDefBuilder::new("Lapp/Child;", ACC_PUBLIC).superclass("Lapp/Base;"));
        builder.add_class(ClassDefBuilder::new("Lapp/Other;", ACC_PUBLIC).superclass("Ljava/lang/Object;"));
        return ClassLoader::new("app", None, vec![Arc::new(builder.build())]);
    }

    #[test]
    fn clean_classes_are_preverified() {
        let verifier = ScriptedVerifier::new();
        let linker = boot_linker_with(|l| l.with_verifier(verifier.clone()));
        let loader = loader();
        let base = linker.find_class("Lapp/Base;", Some(&loader)).unwrap();
        linker.verify_class(&base).unwrap();
        assert_eq!(base.status(), ClassStatus::Verified);
        assert!(base.virtual_methods()[0].is_preverified());
        assert_eq!(verifier.calls("Lapp/Base;"), 1);
        linker.verify_class(&base).unwrap();
        assert_eq!(verifier.calls("Lapp/Base;"), 1);
    }

    #[test]
    fn hard_failures_are_terminal() {
        let verifier = ScriptedVerifier::new();
        verifier.script("Lapp/Base;", FailureKind::HardFailure, "bad register v3");
        let linker = boot_linker_with(|l| l.with_verifier(verifier.clone()));
        let loader = loader();
        let base = linker.find_class("Lapp/Base;", Some(&loader)).unwrap();
        let child = linker.find_class("Lapp/Child;", Some(&loader)).unwrap();
        let err = linker.verify_class(&base).unwrap_err();
        assert_eq!(err, ClassLoadErr::Verify("bad register v3".to_string()));
        assert!(base.is_erroneous());
        assert_eq!(linker.verify_class(&base).unwrap_err(), err);

        let err = linker.verify_class(&child).unwrap_err();
        assert_eq!(
            err,
            ClassLoadErr::Verify(
                "Rejecting class app.Child that attempts to sub-class erroneous class app.Base"
                    .to_string()
            )
        );
        assert!(child.is_erroneous());
        assert_eq!(verifier.calls("Lapp/Child;"), 0);
    }

    #[test]
    fn soft_failures_depend_on_mode() {
        let verifier = ScriptedVerifier::new();
        verifier.script("Lapp/Base;", FailureKind::SoftFailure, "unresolved type");
        let runtime = boot_linker_with(|l| l.with_verifier(verifier.clone()));
        let runtime_loader = loader();
        let base = runtime.find_class("Lapp/Base;", Some(&runtime_loader)).unwrap();
        runtime.verify_class(&base).unwrap();
        assert_eq!(base.status(), ClassStatus::Verified);
        assert!(!base.virtual_methods()[0].is_preverified());

        let compiler = boot_linker_with(|l| l.with_verifier(verifier.clone()).with_compiler_mode(true));
        let loader = loader();
        let base = compiler.find_class("Lapp/Base;", Some(&loader)).unwrap();
        compiler.verify_class(&base).unwrap();
        assert_eq!(base.status(), ClassStatus::RetryVerificationAtRuntime);
        // Already compile-time verified: no second attempt while compiling.
        compiler.verify_class(&base).unwrap();
        assert_eq!(verifier.calls("Lapp/Base;"), 2);

        // A clean subclass inherits the deferral.
        let child = compiler.find_class("Lapp/Child;", Some(&loader)).unwrap();
        compiler.verify_class(&child).unwrap();
        assert_eq!(child.status(), ClassStatus::RetryVerificationAtRuntime);
    }

    #[test]
    fn verification_can_be_disabled() {
        let verifier = ScriptedVerifier::new();
        verifier.script("Lapp/Other;", FailureKind::HardFailure, "never consulted");
        let linker = boot_linker_with(|l| l.with_verifier(verifier.clone()).with_verification(false));
        let loader = loader();
        let other = linker.find_class("Lapp/Other;", Some(&loader)).unwrap();
        linker.verify_class(&other).unwrap();
        assert_eq!(other.status(), ClassStatus::Verified);
        assert_eq!(verifier.calls("Lapp/Other;"), 0);
    }
}
