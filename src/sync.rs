//! A common lock / yield / sleep interface.
//!
//! Nothing here implements poisoning! If you panic while having locked one of
//! these mutexes, no guarantees about what happens next!
//!
//! (We are okay with this because, as configured, we can't recover from panics
//! on embedded anyways — our panic handler just spins forever.)
//!
//! Besides the mutex the manager needs two scheduler hooks: [`yield_now`] for
//! the saturated-cache restart loop and [`sleep_ms`] for driver-busy backoff.
//! Both are selected alongside the mutex.

pub trait MutexInterface<T>: Sync {
    fn new(inner: T) -> Self;

    // Run a function in a critical section:
    fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R;

    // Get mutable access to the inner data *using a mutable reference*.
    // Since Rust can statically prove that we have exclusive access in this
    // case, no locking occurs.
    fn get_mut(&mut self) -> &mut T;
}

#[cfg(not(feature = "no_std"))]
pub mod from_std {
    use super::MutexInterface;

    pub use std::sync::Mutex;

    impl<T: Send> MutexInterface<T> for Mutex<T> {
        fn new(inner: T) -> Self {
            Mutex::new(inner)
        }

        #[inline]
        fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R {
            let mut inner = self.lock().unwrap();

            func(&mut *inner)
        }

        #[inline]
        fn get_mut(&mut self) -> &mut T {
            self.get_mut().unwrap()
        }
    }

    #[inline]
    pub fn yield_now() {
        std::thread::yield_now()
    }

    #[inline]
    pub fn sleep_ms(ms: u64) {
        std::thread::sleep(std::time::Duration::from_millis(ms))
    }
}

#[cfg(feature = "external_mutex")]
pub mod external_mutex {
    use super::MutexInterface;

    use core::ptr;
    use core::cell::Cell;

    // Represents an opaque type on the C side.
    #[repr(C)] pub struct TaskList { _priv: [u8; 0] }

    #[repr(C)]
    pub struct Semaphore {
        locked: u8,
        blocked: *mut TaskList,
    }

    extern "C" {
        pub fn ff_port_semaphore_init(s: *mut Semaphore, locked: u8);
        pub fn ff_port_semaphore_wait(s: *mut Semaphore);
        pub fn ff_port_semaphore_signal(s: *mut Semaphore);
        pub fn ff_port_yield();
        pub fn ff_port_sleep_ms(ms: u32);
    }

    pub struct Mutex<T> {
        semaphore: Cell<Semaphore>,
        inner: Cell<T>,
    }

    impl<T: Send> MutexInterface<T> for Mutex<T> {
        fn new(inner: T) -> Self {
            let semaphore = Cell::new(Semaphore {
                locked: 0,
                blocked: ptr::null::<TaskList>() as *mut TaskList,
            });

            unsafe { ff_port_semaphore_init(semaphore.as_ptr(), 0); }

            Self {
                semaphore,
                inner: Cell::new(inner),
            }
        }

        #[inline]
        fn cs<F: FnOnce(&mut T) -> R, R>(&self, func: F) -> R {
            unsafe { ff_port_semaphore_wait(self.semaphore.as_ptr()); }

            let res = func(unsafe { &mut *self.inner.as_ptr() });

            unsafe { ff_port_semaphore_signal(self.semaphore.as_ptr()); }

            res
        }

        #[inline]
        fn get_mut(&mut self) -> &mut T {
            self.inner.get_mut()
        }
    }

    // It's Sync! The people who implemented the semaphore promised!
    unsafe impl<T> Sync for Mutex<T> where T: Send { }

    #[inline]
    pub fn yield_now() {
        unsafe { ff_port_yield() }
    }

    #[inline]
    pub fn sleep_ms(ms: u64) {
        unsafe { ff_port_sleep_ms(ms as u32) }
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "external_mutex")] {
        pub use external_mutex::{Mutex, sleep_ms, yield_now};
    } else if #[cfg(not(feature = "no_std"))] {
        pub use from_std::{Mutex, sleep_ms, yield_now};
    } else if #[cfg(feature = "no_std")] {
        compile_error!("Please enable the `external_mutex` feature and provide \
            the ff_port_* lock/yield/sleep functions.");
    } else {
        compile_error!("Unreachable!!");
    }
}
