//! Architecture support
//!
//! Everything the portable executive needs from the machine sits behind
//! `hal`; this module holds the implementations. Only x86_64 is wired up.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;
