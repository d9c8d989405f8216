use std::{collections::HashMap, sync::Arc};

use parking_lot::RwLock;

use crate::{
    Arity, CallKind, Instance, InternedSelectors, Method, Module,
    ObjectModel, Resolution, RuntimeError, Selector, ShapeId, Value,
    Visibility,
};

pub struct Builtins {
    pub object: Arc<Module>,
    pub nil_class: Arc<Module>,
    pub true_class: Arc<Module>,
    pub false_class: Arc<Module>,
    pub integer: Arc<Module>,
    pub string: Arc<Module>,
    pub symbol: Arc<Module>,
}

/// Class registry and method resolution for the reference object model.
pub struct Universe {
    builtins: Builtins,
    classes: RwLock<HashMap<Arc<str>, Arc<Module>>>,
    selectors: InternedSelectors,
    method_missing: Selector,
}

impl Universe {
    pub fn new() -> Self {
        let object = Module::new("Object", None);
        let builtins = Builtins {
            nil_class: Module::new("NilClass", Some(&object)),
            true_class: Module::new("TrueClass", Some(&object)),
            false_class: Module::new("FalseClass", Some(&object)),
            integer: Module::new("Integer", Some(&object)),
            string: Module::new("String", Some(&object)),
            symbol: Module::new("Symbol", Some(&object)),
            object,
        };

        let classes = [
            &builtins.object,
            &builtins.nil_class,
            &builtins.true_class,
            &builtins.false_class,
            &builtins.integer,
            &builtins.string,
            &builtins.symbol,
        ]
        .into_iter()
        .map(|class| (class.name_arc(), class.clone()))
        .collect();

        let selectors = InternedSelectors::new();
        let method_missing = selectors.intern("method_missing");
        let universe = Self {
            builtins,
            classes: RwLock::new(classes),
            selectors,
            method_missing,
        };
        universe.define_core_methods();
        universe
    }

    fn define_core_methods(&self) {
        let b = &self.builtins;
        b.object.define_method(
            self.selector("itself"),
            Visibility::Public,
            Arity::Exact(0),
            |recv, _| Ok(recv.clone()),
        );
        b.object.define_method(
            self.selector("=="),
            Visibility::Public,
            Arity::Exact(1),
            |recv, args| Ok(Value::Bool(*recv == args[0])),
        );
        b.object.define_method(
            self.selector("to_s"),
            Visibility::Public,
            Arity::Exact(0),
            |recv, _| Ok(Value::Str(Arc::from(recv.to_string()))),
        );
        b.integer.define_method(
            self.selector("+"),
            Visibility::Public,
            Arity::Exact(1),
            |recv, args| {
                let lhs = recv.as_integer()?;
                let rhs = args[0].as_integer()?;
                Ok(Value::Integer(lhs.wrapping_add(rhs)))
            },
        );
        b.integer.define_method(
            self.selector("succ"),
            Visibility::Public,
            Arity::Exact(0),
            |recv, _| Ok(Value::Integer(recv.as_integer()?.wrapping_add(1))),
        );
    }

    pub fn builtins(&self) -> &Builtins {
        &self.builtins
    }

    pub fn selector(&self, name: &str) -> Selector {
        self.selectors.intern(name)
    }

    /// Returns the class named `name`, creating it under `superclass`
    /// (default `Object`) if it does not exist yet. An existing class is
    /// reopened as is.
    pub fn define_class(
        &self,
        name: &str,
        superclass: Option<&Arc<Module>>,
    ) -> Arc<Module> {
        if let Some(class) = self.class_named(name) {
            return class;
        }
        let mut classes = self.classes.write();
        if let Some(class) = classes.get(name) {
            return class.clone();
        }
        let parent = superclass.unwrap_or(&self.builtins.object);
        let class = Module::new(name, Some(parent));
        log::debug!("defined class {name} < {}", parent.name());
        classes.insert(class.name_arc(), class.clone());
        class
    }

    pub fn class_named(&self, name: &str) -> Option<Arc<Module>> {
        self.classes.read().get(name).cloned()
    }

    pub fn class_of<'a>(&'a self, value: &'a Value) -> &'a Arc<Module> {
        let b = &self.builtins;
        match value {
            Value::Nil => &b.nil_class,
            Value::Bool(true) => &b.true_class,
            Value::Bool(false) => &b.false_class,
            Value::Integer(_) => &b.integer,
            Value::Str(_) => &b.string,
            Value::Symbol(_) => &b.symbol,
            Value::Object(instance) => instance.class(),
        }
    }

    pub fn instantiate(&self, class: &Arc<Module>) -> Value {
        Value::Object(Arc::new(Instance::new(class.clone())))
    }

    fn forward_to_method_missing(
        selector: &Selector,
        handler: Arc<Method>,
    ) -> Method {
        let name = selector.clone();
        Method::new(
            selector.clone(),
            Arc::from(handler.owner()),
            Visibility::Public,
            Arity::AtLeast(0),
            move |recv, args| {
                let mut forwarded = Vec::with_capacity(args.len() + 1);
                forwarded.push(Value::Symbol(name.clone()));
                forwarded.extend_from_slice(args);
                handler.invoke(recv, &forwarded)
            },
        )
    }
}

impl Default for Universe {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectModel for Universe {
    #[inline]
    fn current_shape(&self, receiver: &Value) -> ShapeId {
        self.class_of(receiver).shape_id()
    }

    fn resolve(
        &self,
        receiver: &Value,
        selector: &Selector,
        kind: CallKind,
    ) -> Result<Resolution, RuntimeError> {
        let class = self.class_of(receiver);
        // shape first: a mutation after this point leaves it invalid
        let shape = class.shape();

        match class.lookup_method(selector) {
            Some(method) if method.is_visible_to(kind) => {
                Ok(Resolution { shape, method })
            }
            Some(method) => Err(match method.visibility() {
                Visibility::Protected => RuntimeError::ProtectedMethod {
                    selector: selector.clone(),
                    class: class.name_arc(),
                },
                _ => RuntimeError::PrivateMethod {
                    selector: selector.clone(),
                    class: class.name_arc(),
                },
            }),
            None => {
                let handler = class
                    .lookup_method(&self.method_missing)
                    .filter(|_| *selector != self.method_missing)
                    .ok_or_else(|| RuntimeError::NoMethod {
                        selector: selector.clone(),
                        class: class.name_arc(),
                    })?;
                log::trace!("{selector} on {} -> method_missing", class.name());
                Ok(Resolution {
                    shape,
                    method: Arc::new(Self::forward_to_method_missing(
                        selector, handler,
                    )),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_classes_are_registered() {
        let universe = Universe::new();
        for name in [
            "Object",
            "NilClass",
            "TrueClass",
            "FalseClass",
            "Integer",
            "String",
            "Symbol",
        ] {
            assert!(universe.class_named(name).is_some(), "{name}");
        }
        assert_eq!(universe.class_of(&Value::Integer(1)).name(), "Integer");
        assert_eq!(universe.class_of(&Value::Bool(false)).name(), "FalseClass");
    }

    #[test]
    fn define_class_reopens_existing() {
        let universe = Universe::new();
        let a = universe.define_class("Point", None);
        let b = universe.define_class("Point", None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.superclass().unwrap().name(), "Object");
    }

    #[test]
    fn resolve_finds_inherited_core_methods() {
        let universe = Universe::new();
        let point = universe.define_class("Point", None);
        let p = universe.instantiate(&point);
        let res = universe
            .resolve(&p, &universe.selector("itself"), CallKind::Public)
            .unwrap();
        assert_eq!(res.method.owner(), "Object");
        assert_eq!(res.shape.id(), point.shape_id());
        assert_eq!(res.method.invoke(&p, &[]).unwrap(), p);
    }

    #[test]
    fn visibility_is_enforced_for_explicit_receivers() {
        let universe = Universe::new();
        let class = universe.define_class("Account", None);
        class.define_method(
            universe.selector("balance"),
            Visibility::Private,
            Arity::Exact(0),
            |_, _| Ok(Value::Integer(10)),
        );
        class.define_method(
            universe.selector("peer"),
            Visibility::Protected,
            Arity::Exact(0),
            |_, _| Ok(Value::Nil),
        );
        let account = universe.instantiate(&class);

        let private = universe
            .resolve(&account, &universe.selector("balance"), CallKind::Public)
            .unwrap_err();
        assert!(matches!(private, RuntimeError::PrivateMethod { .. }));
        let protected = universe
            .resolve(&account, &universe.selector("peer"), CallKind::Public)
            .unwrap_err();
        assert!(matches!(protected, RuntimeError::ProtectedMethod { .. }));

        assert!(
            universe
                .resolve(&account, &universe.selector("balance"), CallKind::Functional)
                .is_ok()
        );
    }

    #[test]
    fn missing_methods_report_the_receiver_class() {
        let universe = Universe::new();
        let err = universe
            .resolve(&Value::Nil, &universe.selector("frobnicate"), CallKind::Public)
            .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::NoMethod {
                selector: Selector::new("frobnicate"),
                class: Arc::from("NilClass"),
            }
        );
        assert!(err.is_lookup_failure());
    }

    #[test]
    fn method_missing_receives_the_selector_and_arguments() {
        let universe = Universe::new();
        let class = universe.define_class("Ghost", None);
        class.define_method(
            universe.selector("method_missing"),
            Visibility::Private,
            Arity::AtLeast(1),
            |_, args| Ok(Value::Integer(args.len() as i64)),
        );
        let ghost = universe.instantiate(&class);
        let res = universe
            .resolve(&ghost, &universe.selector("boo"), CallKind::Public)
            .unwrap();
        assert_eq!(res.method.name(), &Selector::new("boo"));
        assert_eq!(
            res.method.invoke(&ghost, &[Value::Nil, Value::Nil]).unwrap(),
            Value::Integer(3)
        );
    }

    #[test]
    fn integer_arithmetic_checks_operand_types() {
        let universe = Universe::new();
        let plus = universe
            .resolve(&Value::Integer(2), &universe.selector("+"), CallKind::Public)
            .unwrap()
            .method;
        assert_eq!(
            plus.invoke(&Value::Integer(2), &[Value::Integer(3)]).unwrap(),
            Value::Integer(5)
        );
        assert!(matches!(
            plus.invoke(&Value::Integer(2), &[Value::Nil]),
            Err(RuntimeError::TypeError { .. })
        ));
    }
}
