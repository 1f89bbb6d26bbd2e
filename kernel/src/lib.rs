//! Vesper Kernel
//!
//! A small preemptive, SMP-capable, microkernel-style operating system
//! core. The interesting machinery lives in the kernel executive (`ke`):
//!
//! - **IPL machine**: per-CPU interrupt priority levels gating interrupt
//!   delivery, deferred work, and preemption
//! - **DPC**: per-CPU deferred procedure calls drained below DPC level
//! - **APC**: per-thread asynchronous procedure calls in three tiers
//! - **Dispatcher objects**: events, mutexes, semaphores, timers, threads
//!   and processes, all waitable through a common header
//! - **Scheduler**: 8 priority levels, per-CPU ready queues, quantum
//!   accounting, cross-CPU ready insertion and TLB shootdown
//!
//! Everything above the `hal` seam is portable; the unit tests drive the
//! executive against a simulated HAL with a virtual clock and simulated
//! processors.
//!
//! # IPL (Interrupt Priority Level)
//!
//! - NORMAL (0): ordinary thread execution
//! - APC (3): asynchronous procedure call delivery
//! - DPC (4): deferred procedure calls, the scheduler
//! - DEVICE0..DEVICE8 (5-13): device interrupt tiers
//! - CLOCK (14): the clock tick
//! - NO_INTERRUPTS (15): everything masked

#![cfg_attr(not(test), no_std)]
#![allow(dead_code)]
#![allow(static_mut_refs)]
#![allow(clippy::missing_safety_doc)]
#![allow(clippy::declare_interior_mutable_const)]
#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(clippy::mut_from_ref)]

pub mod arch;
pub mod hal;
pub mod kd;
pub mod ke;
pub mod mm;
pub mod rtl;
pub mod status;
