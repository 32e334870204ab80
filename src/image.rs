//! Boot image: classes preloaded into an earlier runtime, exposed to a new
//! linker so that lookups can be satisfied without loading them again.
//!
//! Image classes are reachable only through the resolved-type slots of the
//! image's dex caches, the same way a lookup inside compiled code finds them.

use std::sync::Arc;

use crate::object::{ClassRef, DexCache};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ImageHeader {
    oat_checksum: u32,
    oat_data_begin: u32,
}

impl ImageHeader {
    pub fn new(oat_checksum: u32, oat_data_begin: u32) -> ImageHeader {
        return ImageHeader {
            oat_checksum,
            oat_data_begin,
        };
    }

    /// Checksum of the artifact the image was compiled against. Every other
    /// artifact must record the same value.
    pub fn oat_checksum(&self) -> u32 {
        self.oat_checksum
    }

    pub fn oat_data_begin(&self) -> u32 {
        self.oat_data_begin
    }
}

pub struct ImageSpace {
    location: String,
    header: ImageHeader,
    dex_caches: Vec<Arc<DexCache>>,
}

impl ImageSpace {
    pub fn new(location: &str, header: ImageHeader, dex_caches: Vec<Arc<DexCache>>) -> ImageSpace {
        return ImageSpace {
            location: location.to_string(),
            header,
            dex_caches,
        };
    }

    /// Writes an image from the boot classes of a running linker: every
    /// boot class is stored into each dex cache whose dex file names its
    /// type, then the dex caches are kept.
    pub fn create(
        location: &str,
        header: ImageHeader,
        classes: &[ClassRef],
        dex_caches: Vec<Arc<DexCache>>,
    ) -> ImageSpace {
        for klass in classes.iter().filter(|c| c.is_boot_class()) {
            for dex_cache in dex_caches.iter() {
                if let Some(type_idx) = dex_cache.dex_file().find_type_id(klass.descriptor()) {
                    dex_cache.set_resolved_type(type_idx, klass.clone());
                }
            }
        }
        log::debug!(
            "Created image {} with {} dex caches from {} classes",
            location,
            dex_caches.len(),
            classes.len()
        );
        return ImageSpace::new(location, header, dex_caches);
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn header(&self) -> &ImageHeader {
        &self.header
    }

    pub fn dex_caches(&self) -> &[Arc<DexCache>] {
        &self.dex_caches
    }

    /// Boot class named `descriptor`, found through the dex caches'
    /// resolved types.
    pub fn lookup_class(&self, descriptor: &str) -> Option<ClassRef> {
        for dex_cache in self.dex_caches.iter() {
            let type_idx = match dex_cache.dex_file().find_type_id(descriptor) {
                Some(idx) => idx,
                None => continue,
            };
            if let Some(klass) = dex_cache.resolved_type(type_idx) {
                if klass.is_boot_class() && klass.descriptor() == descriptor {
                    return Some(klass);
                }
            }
        }
        return None;
    }

    /// Visits every boot class in the image's dex caches. A class referenced
    /// by several dex files is visited once per reference.
    pub fn visit_classes<F: FnMut(&ClassRef)>(&self, mut visitor: F) {
        for dex_cache in self.dex_caches.iter() {
            dex_cache.visit_resolved_types(|klass| {
                if klass.is_boot_class() {
                    visitor(klass);
                }
            });
        }
    }
}
