use std::{
    collections::HashMap,
    ops::BitOr,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};

use super::class_loader::ClassLoader;
use crate::{image::ImageSpace, object::ClassRef};

/// Failed image lookups tolerated before every image class is moved into
/// the table at once.
pub const MAX_FAILED_IMAGE_LOOKUPS: usize = 1000;

/// Which roots a [`ClassTable::visit_roots`] call reports, and how the
/// new-roots log changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VisitRootFlags(u32);

impl VisitRootFlags {
    pub const ALL_ROOTS: VisitRootFlags = VisitRootFlags(0x1);
    pub const NEW_ROOTS: VisitRootFlags = VisitRootFlags(0x2);
    pub const CLEAR_ROOT_LOG: VisitRootFlags = VisitRootFlags(0x4);
    pub const START_LOGGING_NEW_ROOTS: VisitRootFlags = VisitRootFlags(0x8);
    pub const STOP_LOGGING_NEW_ROOTS: VisitRootFlags = VisitRootFlags(0x10);

    pub fn contains(&self, other: VisitRootFlags) -> bool {
        return self.0 & other.0 == other.0;
    }
}

impl BitOr for VisitRootFlags {
    type Output = VisitRootFlags;

    fn bitor(self, rhs: VisitRootFlags) -> VisitRootFlags {
        VisitRootFlags(self.0 | rhs.0)
    }
}

/// Java `String.hashCode` over the descriptor.
pub fn descriptor_hash(descriptor: &str) -> u32 {
    let mut hash: u32 = 0;
    for c in descriptor.chars() {
        hash = hash.wrapping_mul(31).wrapping_add(c as u32);
    }
    return hash;
}

fn loader_id(loader: Option<&Arc<ClassLoader>>) -> usize {
    return loader.map_or(0, |l| Arc::as_ptr(l) as usize);
}

/// Every class defined so far, keyed by descriptor and defining loader.
///
/// Boot classes of the image are not copied in up front: they are found
/// through the image on first lookup.
pub struct ClassTable {
    classes: RwLock<HashMap<u32, Vec<ClassRef>>>,
    new_class_roots: Mutex<Vec<ClassRef>>,
    log_new_class_table_roots: AtomicBool,
    image: Option<ImageSpace>,
    image_class_lookup_required: AtomicBool,
    failed_image_lookups: AtomicUsize,
}

impl ClassTable {
    pub fn new(image: Option<ImageSpace>) -> ClassTable {
        let lookup_required = image.is_some();
        return ClassTable {
            classes: RwLock::new(HashMap::new()),
            new_class_roots: Mutex::new(vec![]),
            log_new_class_table_roots: AtomicBool::new(false),
            image,
            image_class_lookup_required: AtomicBool::new(lookup_required),
            failed_image_lookups: AtomicUsize::new(0),
        };
    }

    pub fn image(&self) -> Option<&ImageSpace> {
        self.image.as_ref()
    }

    fn lookup_in_table(
        classes: &HashMap<u32, Vec<ClassRef>>,
        descriptor: &str,
        loader_id: usize,
    ) -> Option<ClassRef> {
        let bucket = classes.get(&descriptor_hash(descriptor))?;
        return bucket
            .iter()
            .find(|k| k.descriptor() == descriptor && k.loader_id() == loader_id)
            .cloned();
    }

    /// Inserts `klass` unless a class with the same descriptor and loader is
    /// already present, in which case that class is returned and `klass` is
    /// dropped.
    pub fn insert(&self, klass: &ClassRef) -> Option<ClassRef> {
        let hash = descriptor_hash(klass.descriptor());
        let mut classes = self.classes.write();
        if let Some(existing) =
            Self::lookup_in_table(&classes, klass.descriptor(), klass.loader_id())
        {
            return Some(existing);
        }
        if klass.is_boot_class() && self.image_class_lookup_required.load(Ordering::Acquire) {
            if let Some(existing) = self.image.as_ref().and_then(|i| i.lookup_class(klass.descriptor()))
            {
                classes.entry(hash).or_default().push(existing.clone());
                return Some(existing);
            }
        }
        log::trace!("Inserting class {:?}", klass);
        classes.entry(hash).or_default().push(klass.clone());
        if self.log_new_class_table_roots.load(Ordering::Acquire) {
            self.new_class_roots.lock().push(klass.clone());
        }
        return None;
    }

    pub fn lookup(&self, descriptor: &str, loader: Option<&Arc<ClassLoader>>) -> Option<ClassRef> {
        let loader_id = loader_id(loader);
        if let Some(klass) = Self::lookup_in_table(&self.classes.read(), descriptor, loader_id) {
            return Some(klass);
        }
        if loader.is_some() || !self.image_class_lookup_required.load(Ordering::Acquire) {
            return None;
        }
        let image = self.image.as_ref()?;
        if let Some(klass) = image.lookup_class(descriptor) {
            let mut classes = self.classes.write();
            if let Some(existing) = Self::lookup_in_table(&classes, descriptor, 0) {
                return Some(existing);
            }
            classes
                .entry(descriptor_hash(descriptor))
                .or_default()
                .push(klass.clone());
            return Some(klass);
        }
        let failed = self.failed_image_lookups.fetch_add(1, Ordering::AcqRel) + 1;
        if failed > MAX_FAILED_IMAGE_LOOKUPS {
            self.move_image_classes_to_class_table();
        }
        return None;
    }

    /// All classes named `descriptor`, whatever their loader.
    pub fn lookup_classes(&self, descriptor: &str) -> Vec<ClassRef> {
        self.move_image_classes_to_class_table();
        let classes = self.classes.read();
        return classes
            .get(&descriptor_hash(descriptor))
            .map(|bucket| {
                bucket
                    .iter()
                    .filter(|k| k.descriptor() == descriptor)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
    }

    /// Copies every class of the image into the table. Afterwards lookups
    /// no longer consult the image.
    pub fn move_image_classes_to_class_table(&self) {
        if !self.image_class_lookup_required.load(Ordering::Acquire) {
            return;
        }
        let image = match self.image.as_ref() {
            Some(image) => image,
            None => return,
        };
        let mut classes = self.classes.write();
        if !self.image_class_lookup_required.load(Ordering::Acquire) {
            return;
        }
        let mut moved = 0;
        image.visit_classes(|klass| {
            if Self::lookup_in_table(&classes, klass.descriptor(), 0).is_none() {
                classes
                    .entry(descriptor_hash(klass.descriptor()))
                    .or_default()
                    .push(klass.clone());
                moved += 1;
            }
        });
        self.image_class_lookup_required.store(false, Ordering::Release);
        log::debug!("Moved {} image classes to the class table", moved);
    }

    pub fn is_image_class_lookup_required(&self) -> bool {
        self.image_class_lookup_required.load(Ordering::Acquire)
    }

    pub fn remove(&self, descriptor: &str, loader: Option<&Arc<ClassLoader>>) -> bool {
        let loader_id = loader_id(loader);
        let mut classes = self.classes.write();
        if let Some(bucket) = classes.get_mut(&descriptor_hash(descriptor)) {
            if let Some(pos) = bucket
                .iter()
                .position(|k| k.descriptor() == descriptor && k.loader_id() == loader_id)
            {
                bucket.remove(pos);
                return true;
            }
        }
        return false;
    }

    pub fn len(&self) -> usize {
        return self.classes.read().values().map(|b| b.len()).sum();
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `visitor` on every class until it returns false.
    pub fn visit_classes<F: FnMut(&ClassRef) -> bool>(&self, mut visitor: F) {
        self.move_image_classes_to_class_table();
        let snapshot: Vec<ClassRef> = self.classes.read().values().flatten().cloned().collect();
        for klass in snapshot.iter() {
            if !visitor(klass) {
                return;
            }
        }
    }

    pub fn visit_roots<F: FnMut(&ClassRef)>(&self, mut visitor: F, flags: VisitRootFlags) {
        if flags.contains(VisitRootFlags::ALL_ROOTS) {
            for klass in self.classes.read().values().flatten() {
                visitor(klass);
            }
        } else if flags.contains(VisitRootFlags::NEW_ROOTS) {
            for klass in self.new_class_roots.lock().iter() {
                visitor(klass);
            }
        }
        if flags.contains(VisitRootFlags::CLEAR_ROOT_LOG) {
            self.new_class_roots.lock().clear();
        }
        if flags.contains(VisitRootFlags::START_LOGGING_NEW_ROOTS) {
            self.log_new_class_table_roots.store(true, Ordering::Release);
        } else if flags.contains(VisitRootFlags::STOP_LOGGING_NEW_ROOTS) {
            self.log_new_class_table_roots.store(false, Ordering::Release);
        }
    }

    pub fn dump_for_sig_quit(&self) -> String {
        self.move_image_classes_to_class_table();
        return format!("Loaded classes: {} allocated classes", self.len());
    }
}
