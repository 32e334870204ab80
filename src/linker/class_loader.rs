use std::{fmt, sync::Arc};

use crate::dex::DexFile;

/// A defining loader other than the boot loader. Lookups go to the parent
/// first (the boot loader when there is none), then to this loader's own
/// dex files in order.
pub struct ClassLoader {
    name: String,
    parent: Option<Arc<ClassLoader>>,
    dex_files: Vec<Arc<DexFile>>,
}

impl fmt::Debug for ClassLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClassLoader({})", self.name)
    }
}

impl ClassLoader {
    pub fn new(
        name: &str,
        parent: Option<Arc<ClassLoader>>,
        dex_files: Vec<Arc<DexFile>>,
    ) -> Arc<ClassLoader> {
        return Arc::new(ClassLoader {
            name: name.to_string(),
            parent,
            dex_files,
        });
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<&Arc<ClassLoader>> {
        self.parent.as_ref()
    }

    pub fn dex_files(&self) -> &[Arc<DexFile>] {
        &self.dex_files
    }

    /// First of this loader's own dex files that defines `descriptor`.
    pub fn find_class_def(&self, descriptor: &str) -> Option<(&Arc<DexFile>, u16)> {
        for dex_file in self.dex_files.iter() {
            if let Some(class_def_idx) = dex_file.find_class_def(descriptor) {
                return Some((dex_file, class_def_idx));
            }
        }
        return None;
    }

    /// Colon separated locations, as reported when a lookup fails.
    pub fn class_path(&self) -> String {
        return self
            .dex_files
            .iter()
            .map(|d| d.location())
            .collect::<Vec<_>>()
            .join(":");
    }
}
