/// Utility trait for components whose lifetime spans the entire
/// program and which other threads access concurrently.
///
/// Leaking such a component to a static reference eliminates the
/// reference-counter maintenance cost on every access.
///
/// # Safety
///
/// Implementors must guarantee that after `drop_static`, no thread
/// accesses the leaked reference anymore.
pub unsafe trait StaticLifetime: Sized {
    /// Create a leaked static reference from given instance.
    fn new_static(this: Self) -> &'static Self {
        Box::leak(Box::new(this))
    }

    /// Drop the leaked reference as the actually owned object.
    ///
    /// # Safety
    ///
    /// Caller must guarantee no thread accesses this reference after it
    /// is dropped. If multiple static objects depend on each other, the
    /// drop order matters.
    unsafe fn drop_static(this: &'static Self) {
        unsafe {
            drop(Box::from_raw(this as *const Self as *mut Self));
        }
    }
}
