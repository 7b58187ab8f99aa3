//! Slice-level building blocks shared by the host kernels.
//!
//! Dependency order: [`tile`] (dot / accumulate) → [`online_softmax`]
//! (running max/sum merge) → the streaming attention kernels in
//! `ops::cpu::attention`, which also draw their dropout mask from
//! [`dropout`]. The sparse kernels use [`tile`] and [`reduce`] only.

pub mod atomic;
pub mod dropout;
pub mod online_softmax;
pub mod reduce;
pub mod tile;

pub use atomic::AtomicF32Slice;
pub use dropout::Dropout;
pub use online_softmax::{RunningStats, rescale_factor};
