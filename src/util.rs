use std::cell::Cell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, Ordering};

/// Wrap struct into WrappedAlign64Type to make it 64bytes aligned.
#[repr(align(64))]
pub struct WrappedAlign64Type<T>(pub T);

impl<T> Default for WrappedAlign64Type<T>
where
    T: Default,
{
    fn default() -> Self {
        WrappedAlign64Type(T::default())
    }
}

impl<T> Deref for WrappedAlign64Type<T> {
    type Target = T;

    fn deref(&self) -> &<Self as Deref>::Target {
        &self.0
    }
}

impl<T> DerefMut for WrappedAlign64Type<T> {
    fn deref_mut(&mut self) -> &mut <Self as Deref>::Target {
        &mut self.0
    }
}

static GLOBAL_THREAD_ID: AtomicI64 = AtomicI64::new(0);

/// Return an unique ID for current thread.
pub fn get_thread_id() -> i64 {
    thread_local!(static THREAD_ID: Cell<i64> = Cell::new(-1));
    THREAD_ID.with(|tid| {
        if -1 == tid.get() {
            tid.set(GLOBAL_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        }
        tid.get()
    })
}

/// Hint the CPU that the current thread is spinning.
#[inline]
pub fn pause() {
    std::hint::spin_loop();
}

#[cfg(test)]
mod test {

    #[test]
    fn test_thread_id() {
        use crate::util::get_thread_id;
        use std::thread;

        let id = get_thread_id();
        assert_eq!(id, get_thread_id());
        let other = thread::spawn(get_thread_id).join().unwrap();
        assert_ne!(id, other);
    }
}
