//! Initialization-guarded global values.

use std::sync::atomic::{AtomicBool, Ordering};

/// A `Flag` tracks whether a global value has been initialized.
pub struct Flag(AtomicBool);

impl Flag {
    /// Creates a new global variable `Flag`.
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    /// Marks the global variable as initialized.
    #[inline]
    pub fn set(&'static self) {
        self.0.store(true, Ordering::Release);
    }

    /// Marks the global variable as dropped.
    #[inline]
    pub fn unset(&'static self) {
        self.0.store(false, Ordering::Release);
    }

    /// Checks if the global variable is initialized.
    #[inline]
    pub fn test(&'static self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

/// A `Global` holds a lazily-initialized global value.
///
/// Reads are thread safe; setting or dropping the value is not, and is
/// reserved for the library's init and shutdown paths.
pub struct Global<T> {
    flag: Flag,
    value: Option<T>,
}

impl<T: 'static> Global<T> {
    /// Creates a new global variable handle.
    pub const fn new() -> Self {
        Self {
            flag: Flag::new(),
            value: None,
        }
    }

    /// Initializes the global variable with a `value`.
    #[inline]
    pub fn set(&'static mut self, value: T) {
        self.value = Some(value);
        self.flag.set();
    }

    /// Drops the global variable.
    #[inline]
    pub fn drop(&'static mut self) -> Option<T> {
        self.flag.unset();
        self.value.take()
    }
}

impl<T: 'static> Default for Global<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Sync + 'static> Global<T> {
    /// Reads the global variable, if it was initialized.
    ///
    /// The returned reference is valid for as long as the value is not
    /// dropped; dropping globals is the very last thing a process using
    /// this library should do.
    #[inline]
    pub fn get(&'static self) -> Option<&'static T> {
        if self.flag.test() {
            self.value.as_ref()
        } else {
            None
        }
    }
}
