use std::{collections::HashSet, sync::Arc};

use parking_lot::RwLock;

/// Strong intern table for string constants. Interning the same contents
/// twice yields the same `Arc`.
#[derive(Default)]
pub struct InternTable {
    strong: RwLock<HashSet<Arc<str>>>,
}

impl InternTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern_strong(&self, content: &str) -> Arc<str> {
        if let Some(interned) = self.strong.read().get(content) {
            return interned.clone();
        }
        let mut table = self.strong.write();
        if let Some(interned) = table.get(content) {
            return interned.clone();
        }
        let interned: Arc<str> = Arc::from(content);
        table.insert(interned.clone());
        return interned;
    }

    pub fn lookup(&self, content: &str) -> Option<Arc<str>> {
        return self.strong.read().get(content).cloned();
    }

    pub fn len(&self) -> usize {
        self.strong.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::InternTable;

    #[test]
    fn interning_is_canonical() {
        let table = InternTable::new();
        let a = table.intern_strong("hello");
        let b = table.intern_strong(&String::from("hello"));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
        assert!(table.lookup("missing").is_none());
    }
}
