//! The key under which tasks are serialized against each other
//!
//! A `TaskKey` wraps an arbitrary caller supplied value. Two keys are equal
//! if they wrap values of the same type that compare equal. The hash of the
//! wrapped value is computed once at construction so that registry lookups do
//! not rehash the value on every access.

use std::{
    any::{Any, TypeId},
    cmp::Ordering,
    collections::hash_map::DefaultHasher,
    fmt::{self, Debug, Display},
    hash::{Hash, Hasher},
    sync::Arc,
    thread,
};

use uuid::Uuid;

// ----------------
// | Erased Value |
// ----------------

/// A type erased key value
trait KeyValue: Debug + Send + Sync {
    /// The wrapped value as a `dyn Any`, used to downcast the other side of a
    /// comparison
    fn value(&self) -> &dyn Any;
    /// Whether the wrapped value equals the value wrapped by `other`
    fn eq_value(&self, other: &dyn KeyValue) -> bool;
    /// Compare against `other` using the wrapped value's natural order, if the
    /// two values are mutually comparable
    fn cmp_value(&self, other: &dyn KeyValue) -> Option<Ordering>;
    /// Hash the wrapped value, including its type
    fn hash_value(&self) -> u64;
}

/// Hash a value together with its type id
fn hash_with_type<T: Hash + 'static>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    TypeId::of::<T>().hash(&mut hasher);
    value.hash(&mut hasher);
    hasher.finish()
}

/// A key value without a usable natural order
struct Unordered<T>(T);

impl<T: Debug> Debug for Unordered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T> KeyValue for Unordered<T>
where
    T: Hash + Eq + Debug + Send + Sync + 'static,
{
    fn value(&self) -> &dyn Any {
        &self.0
    }

    fn eq_value(&self, other: &dyn KeyValue) -> bool {
        other.value().downcast_ref::<T>().is_some_and(|other| *other == self.0)
    }

    fn cmp_value(&self, _other: &dyn KeyValue) -> Option<Ordering> {
        None
    }

    fn hash_value(&self) -> u64 {
        hash_with_type(&self.0)
    }
}

/// A key value ordered by its `Ord` implementation
struct Ordered<T>(T);

impl<T: Debug> Debug for Ordered<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T> KeyValue for Ordered<T>
where
    T: Ord + Hash + Debug + Send + Sync + 'static,
{
    fn value(&self) -> &dyn Any {
        &self.0
    }

    fn eq_value(&self, other: &dyn KeyValue) -> bool {
        other.value().downcast_ref::<T>().is_some_and(|other| *other == self.0)
    }

    fn cmp_value(&self, other: &dyn KeyValue) -> Option<Ordering> {
        other.value().downcast_ref::<T>().map(|other| self.0.cmp(other))
    }

    fn hash_value(&self) -> u64 {
        hash_with_type(&self.0)
    }
}

// ------------
// | Task Key |
// ------------

/// The identity under which tasks are serialized
///
/// Cloning a key is cheap, the wrapped value is reference counted
#[derive(Clone)]
pub struct TaskKey {
    /// The wrapped value
    value: Arc<dyn KeyValue>,
    /// The precomputed hash of the wrapped value
    hash: u64,
}

impl TaskKey {
    /// Create a key from a value that has no natural order
    ///
    /// Keys created this way are ordered by hash
    pub fn new<T>(value: T) -> Self
    where
        T: Hash + Eq + Debug + Send + Sync + 'static,
    {
        Self::from_value(Unordered(value))
    }

    /// Create a key that is ordered by the natural order of the value
    pub fn ordered<T>(value: T) -> Self
    where
        T: Ord + Hash + Debug + Send + Sync + 'static,
    {
        Self::from_value(Ordered(value))
    }

    /// The key identifying the calling thread
    ///
    /// Used when a task is submitted without a key
    pub fn current_thread() -> Self {
        Self::new(thread::current().id())
    }

    /// Wrap an erased value and compute its hash
    fn from_value<V: KeyValue + 'static>(value: V) -> Self {
        let hash = value.hash_value();
        Self { value: Arc::new(value), hash }
    }

    /// Get a reference to the wrapped value if it is of type `T`
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.value.value().downcast_ref::<T>()
    }
}

impl PartialEq for TaskKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash && self.value.eq_value(other.value.as_ref())
    }
}

impl Eq for TaskKey {}

impl Hash for TaskKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash);
    }
}

impl PartialOrd for TaskKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskKey {
    /// Compares by the wrapped values' natural order when either side knows
    /// how to compare against the other, and by hash otherwise
    ///
    /// The hash fallback is not a total order over distinct values with equal
    /// hashes; the order is only meant for tie breaking
    fn cmp(&self, other: &Self) -> Ordering {
        self.value
            .cmp_value(other.value.as_ref())
            .or_else(|| other.value.cmp_value(self.value.as_ref()).map(Ordering::reverse))
            .unwrap_or_else(|| self.hash.cmp(&other.hash))
    }
}

impl Debug for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskKey({:?})", self.value)
    }
}

impl Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.value)
    }
}

// ---------------
// | Conversions |
// ---------------

impl From<&str> for TaskKey {
    fn from(value: &str) -> Self {
        Self::ordered(value.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(value: String) -> Self {
        Self::ordered(value)
    }
}

impl From<Uuid> for TaskKey {
    fn from(value: Uuid) -> Self {
        Self::ordered(value)
    }
}

/// Implement `From` for integer types, ordered numerically
macro_rules! impl_from_integer {
    ($($t:ty),*) => {
        $(
            impl From<$t> for TaskKey {
                fn from(value: $t) -> Self {
                    Self::ordered(value)
                }
            }
        )*
    };
}

impl_from_integer!(u32, u64, usize, i32, i64);
