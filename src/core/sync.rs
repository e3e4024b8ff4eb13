pub use std::sync::atomic::Ordering;

#[cfg(not(loom))] pub use std::{
    sync::{
        Arc, Mutex, Condvar,
        atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, fence},
    },
    thread,
};


#[cfg(loom)] pub use loom::{
    sync::{
        Arc, Mutex, Condvar,
        atomic::{AtomicBool, AtomicIsize, AtomicU32, AtomicU64, AtomicUsize, fence},
    },
    thread
};
