use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use parking_lot::{Mutex, RwLock};

use crate::{CallKind, RuntimeError, Selector, Shape, ShapeId, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Public,
    Protected,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exact(usize),
    AtLeast(usize),
}

impl Arity {
    #[inline]
    pub fn accepts(self, given: usize) -> bool {
        match self {
            Arity::Exact(n) => given == n,
            Arity::AtLeast(n) => given >= n,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "{n}+"),
        }
    }
}

pub type MethodBody =
    Arc<dyn Fn(&Value, &[Value]) -> Result<Value, RuntimeError> + Send + Sync>;

/// A bound method body. Immutable: renaming or changing visibility
/// produces a new `Method` sharing the same body.
#[derive(Clone)]
pub struct Method {
    name: Selector,
    owner: Arc<str>,
    visibility: Visibility,
    arity: Arity,
    body: MethodBody,
}

impl Method {
    pub fn new<F>(
        name: Selector,
        owner: Arc<str>,
        visibility: Visibility,
        arity: Arity,
        body: F,
    ) -> Self
    where
        F: Fn(&Value, &[Value]) -> Result<Value, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name,
            owner,
            visibility,
            arity,
            body: Arc::new(body),
        }
    }

    pub fn name(&self) -> &Selector {
        &self.name
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn arity(&self) -> Arity {
        self.arity
    }

    pub fn is_visible_to(&self, kind: CallKind) -> bool {
        self.visibility == Visibility::Public || kind == CallKind::Functional
    }

    pub fn invoke(
        &self,
        receiver: &Value,
        args: &[Value],
    ) -> Result<Value, RuntimeError> {
        if !self.arity.accepts(args.len()) {
            return Err(RuntimeError::ArgumentCount {
                selector: self.name.clone(),
                given: args.len(),
                expected: self.arity,
            });
        }
        (self.body)(receiver, args)
    }

    pub fn with_name(&self, name: Selector) -> Method {
        Method {
            name,
            ..self.clone()
        }
    }

    pub fn with_visibility(&self, visibility: Visibility) -> Method {
        Method {
            visibility,
            ..self.clone()
        }
    }

    fn with_owner(&self, owner: Arc<str>) -> Method {
        Method {
            owner,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("visibility", &self.visibility)
            .field("arity", &self.arity)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
enum MethodEntry {
    Defined(Arc<Method>),
    /// `undef_method` marker: lookup stops here instead of
    /// continuing in the superclass.
    Undefined,
}

/// A class or module with its own method table.
///
/// Every structural change to the table mints a new [`Shape`] for this
/// module and for all of its live subclasses, since their lookups pass
/// through this table too.
pub struct Module {
    name: Arc<str>,
    superclass: Option<Arc<Module>>,
    subclasses: Mutex<Vec<Weak<Module>>>,
    methods: RwLock<HashMap<Selector, MethodEntry>>,
    shape: Mutex<Shape>,
    /// Mirror of `shape.id()` for the dispatch fast path.
    shape_id: AtomicU64,
}

impl Module {
    pub fn new(name: &str, superclass: Option<&Arc<Module>>) -> Arc<Self> {
        let shape = Shape::new();
        let module = Arc::new(Self {
            name: Arc::from(name),
            superclass: superclass.cloned(),
            subclasses: Mutex::new(Vec::new()),
            methods: RwLock::new(HashMap::new()),
            shape_id: AtomicU64::new(shape.id().raw()),
            shape: Mutex::new(shape),
        });
        if let Some(parent) = superclass {
            parent.subclasses.lock().push(Arc::downgrade(&module));
        }
        module
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn superclass(&self) -> Option<&Arc<Module>> {
        self.superclass.as_ref()
    }

    #[inline(always)]
    pub fn shape_id(&self) -> ShapeId {
        ShapeId::from_raw(self.shape_id.load(Ordering::Acquire))
    }

    pub fn shape(&self) -> Shape {
        self.shape.lock().clone()
    }

    /// Walks this module and its superclasses.
    pub fn lookup_method(&self, name: &Selector) -> Option<Arc<Method>> {
        let mut current = Some(self);
        while let Some(module) = current {
            match module.methods.read().get(name) {
                Some(MethodEntry::Defined(method)) => {
                    return Some(method.clone());
                }
                Some(MethodEntry::Undefined) => return None,
                None => {}
            }
            current = module.superclass.as_deref();
        }
        None
    }

    pub fn define_method<F>(
        &self,
        name: Selector,
        visibility: Visibility,
        arity: Arity,
        body: F,
    ) -> Arc<Method>
    where
        F: Fn(&Value, &[Value]) -> Result<Value, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        let method = Arc::new(Method::new(
            name.clone(),
            self.name.clone(),
            visibility,
            arity,
            body,
        ));
        self.insert_entry(name, MethodEntry::Defined(method.clone()));
        method
    }

    /// Removes a definition from this module only; lookup continues in
    /// the superclass afterwards.
    pub fn remove_method(
        &self,
        name: &Selector,
    ) -> Result<Arc<Method>, RuntimeError> {
        self.mutate(|table| match table.get(name) {
            Some(MethodEntry::Defined(method)) => {
                let method = method.clone();
                table.remove(name);
                Ok(method)
            }
            _ => Err(self.name_error(name)),
        })
    }

    /// Hides `name` for this module and its subclasses, including any
    /// superclass definition.
    pub fn undef_method(&self, name: &Selector) -> Result<(), RuntimeError> {
        if self.lookup_method(name).is_none() {
            return Err(self.name_error(name));
        }
        self.insert_entry(name.clone(), MethodEntry::Undefined);
        Ok(())
    }

    pub fn alias_method(
        &self,
        new_name: Selector,
        old_name: &Selector,
    ) -> Result<(), RuntimeError> {
        let method = self
            .lookup_method(old_name)
            .ok_or_else(|| self.name_error(old_name))?;
        let alias = Arc::new(method.with_name(new_name.clone()));
        self.insert_entry(new_name, MethodEntry::Defined(alias));
        Ok(())
    }

    /// Changes the visibility of `name` as seen through this module. An
    /// inherited method is copied into this table with the new visibility.
    pub fn set_visibility(
        &self,
        name: &Selector,
        visibility: Visibility,
    ) -> Result<(), RuntimeError> {
        let method = self
            .lookup_method(name)
            .ok_or_else(|| self.name_error(name))?;
        if method.visibility() == visibility {
            return Ok(());
        }
        let updated = Arc::new(
            method
                .with_visibility(visibility)
                .with_owner(self.name.clone()),
        );
        self.insert_entry(name.clone(), MethodEntry::Defined(updated));
        Ok(())
    }

    fn name_error(&self, name: &Selector) -> RuntimeError {
        RuntimeError::NameError {
            selector: name.clone(),
            module: self.name.clone(),
        }
    }

    fn insert_entry(&self, name: Selector, entry: MethodEntry) {
        let mut table = self.methods.write();
        table.insert(name, entry);
        self.invalidate_shapes();
    }

    /// Runs `f` on the table and mints new shapes if it succeeded.
    fn mutate<R>(
        &self,
        f: impl FnOnce(
            &mut HashMap<Selector, MethodEntry>,
        ) -> Result<R, RuntimeError>,
    ) -> Result<R, RuntimeError> {
        let mut table = self.methods.write();
        let result = f(&mut table)?;
        // still under the table lock: a resolver that read the old shape
        // either saw the old table or gets an entry that is already dead
        self.invalidate_shapes();
        drop(table);
        Ok(result)
    }

    fn invalidate_shapes(&self) {
        {
            let mut shape = self.shape.lock();
            let next = shape.succeed();
            self.shape_id.store(next.id().raw(), Ordering::Release);
            log::trace!(
                "{}: shape {} -> {}",
                self.name,
                shape.id(),
                next.id()
            );
            *shape = next;
        }

        let subclasses: Vec<Arc<Module>> = {
            let mut subclasses = self.subclasses.lock();
            subclasses.retain(|weak| weak.strong_count() > 0);
            subclasses.iter().filter_map(Weak::upgrade).collect()
        };
        for subclass in subclasses {
            subclass.invalidate_shapes();
        }
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .field("shape", &self.shape_id())
            .field(
                "superclass",
                &self.superclass.as_ref().map(|s| s.name.clone()),
            )
            .finish_non_exhaustive()
    }
}
