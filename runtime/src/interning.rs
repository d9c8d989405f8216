use std::{
    collections::HashMap,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use parking_lot::RwLock;

/// A message name. Interned selectors compare by pointer first.
#[derive(Clone)]
pub struct Selector(Arc<str>);

impl Selector {
    /// Creates a selector without going through an interning table.
    pub fn new(name: &str) -> Self {
        Self(Arc::from(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for Selector {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || *self.0 == *other.0
    }
}

impl Eq for Selector {}

impl Hash for Selector {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}", self.0)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Selector {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

struct InternedSelectorsImpl {
    mappings: HashMap<Arc<str>, Selector>,
}

impl InternedSelectorsImpl {
    fn new() -> Self {
        Self {
            mappings: HashMap::new(),
        }
    }

    fn get_or_add(&mut self, name: &str) -> Selector {
        if let Some(selector) = self.mappings.get(name) {
            return selector.clone();
        }
        let selector = Selector::new(name);
        self.mappings.insert(selector.0.clone(), selector.clone());
        selector
    }

    fn get(&self, name: &str) -> Option<Selector> {
        self.mappings.get(name).cloned()
    }
}

#[derive(Clone)]
pub struct InternedSelectors(Arc<RwLock<InternedSelectorsImpl>>);

impl InternedSelectors {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(InternedSelectorsImpl::new())))
    }

    pub fn intern(&self, name: &str) -> Selector {
        if let Some(selector) = self.0.read().get(name) {
            return selector;
        }
        self.0.write().get_or_add(name)
    }

}

impl Default for InternedSelectors {
    fn default() -> Self {
        Self::new()
    }
}
