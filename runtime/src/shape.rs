use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

static NEXT_SHAPE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one structural version of a method table.
///
/// Ids are never reused: a mutated table always gets a fresh id, so two
/// equal ids always describe the same set of methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShapeId(u64);

impl ShapeId {
    fn mint() -> Self {
        Self(NEXT_SHAPE_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[inline(always)]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ShapeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Single-use validity flag shared by everything that cached a shape.
///
/// Starts valid and flips to invalid exactly once. There is no way back:
/// a mutated table gets a new [`Shape`] with a new token instead.
#[derive(Debug, Clone)]
pub struct ValidityToken(Arc<AtomicBool>);

impl ValidityToken {
    fn new() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns `true` if this call performed the transition.
    pub fn invalidate(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// A shape identity together with the token bound to it at creation.
#[derive(Debug, Clone)]
pub struct Shape {
    id: ShapeId,
    token: ValidityToken,
}

impl Shape {
    pub fn new() -> Self {
        Self {
            id: ShapeId::mint(),
            token: ValidityToken::new(),
        }
    }

    #[inline(always)]
    pub fn id(&self) -> ShapeId {
        self.id
    }

    #[inline(always)]
    pub fn token(&self) -> &ValidityToken {
        &self.token
    }

    #[inline(always)]
    pub fn is_valid(&self) -> bool {
        self.token.is_valid()
    }

    /// Kills this shape and mints the one that replaces it.
    pub fn succeed(&self) -> Shape {
        self.token.invalidate();
        Shape::new()
    }
}

impl Default for Shape {
    fn default() -> Self {
        Self::new()
    }
}
