//! # KeOS: KAIST Educational Operating System (hosted kernel services)
//!
//! This crate provides the kernel services the virtual memory subsystem is
//! built on, in a *hosted* form that runs as an ordinary process: physical
//! memory is a pool of frames in the process heap, the translation hardware is
//! a software page table that behaves like the MMU, and the disks are arrays
//! of sectors in memory. Everything above these interfaces is written exactly
//! as it would be in the bare-metal kernel.
//!
//! ## Components
//!
//! - [`addressing`]: [`Va`](addressing::Va) and [`Pa`](addressing::Pa) along
//!   with the layout of the user address space.
//! - [`mm`]: the physical frame allocator ([`mm::Palloc`]) and the per-address
//!   space translation table ([`mm::page_table::PageTable`]).
//! - [`fs`]: regular files and raw disks.
//! - [`swap`]: the swap area built on a disk.
//! - [`sync`]: the kernel spin lock.
//! - [`kprint`]: kernel logging.
//!
//! ## Errors
//!
//! Every fallible kernel operation reports a [`KernelError`], which maps
//! one-to-one to the errno value returned to user programs.
//!
//! ## Configuration
//!
//! Sizes of the simulated machine are described by a [`SystemConfiguration`],
//! assembled with a [`SystemConfigurationBuilder`], usually from the
//! environment:
//!
//! ```
//! let config = keos::SystemConfigurationBuilder::from_env()
//!     .user_frames(64)
//!     .build();
//! assert_eq!(config.user_frames, 64);
//! ```
//!
//! ## Selectively run tests
//!
//! Test binaries are driven by [`TestDriver`]. You can run one or more specific
//! test cases by passing their names as arguments to the test runner:
//!
//! ```bash
//! $ cargo run -p keos-vm-grader -- eviction::anon_round_trip fork::no_aliasing
//! ```
//!
//! This command runs exactly the listed test cases.
#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod addressing;
pub mod fs;
pub mod kprint;
pub mod mm;
pub mod swap;
pub mod sync;
pub mod task;
pub mod util;

pub use log;

use std::collections::BTreeSet;

/// Enum representing errors that can occur during a kernel operation.
///
/// Each variant corresponds to a specific type of error that might occur
/// during the handling of a kernel operation. These errors can be returned to
/// the user program to indicate the nature of the failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KernelError {
    /// Operation is not permitted. (EPERM)
    OperationNotPermitted,
    /// No such file or directory. (ENOENT)
    NoSuchEntry,
    /// IO Error. (EIO)
    IOError,
    /// BAD file descriptor. (EBADF)
    BadFileDescriptor,
    /// Out of memory. (ENOMEM)
    NoMemory,
    /// Permission denied. (EACCES)
    InvalidAccess,
    /// Bad address. (EFAULT)
    BadAddress,
    /// Device or resource busy. (EBUSY)
    Busy,
    /// File exists. (EEXIST)
    FileExist,
    /// Invalid arguement. (EINVAL)
    InvalidArgument,
    /// No space left on device. (ENOSPC)
    NoSpace,
    /// Operation is not supported. (ENOTSUPP)
    NotSupportedOperation,
}

impl KernelError {
    /// Converts the [`KernelError`] enum into a corresponding `usize` error
    /// code. The result is cast to `usize` for use as a return value in
    /// system calls.
    pub fn into_usize(self) -> usize {
        (match self {
            KernelError::OperationNotPermitted => -1isize,
            KernelError::NoSuchEntry => -2,
            KernelError::IOError => -5,
            KernelError::BadFileDescriptor => -9,
            KernelError::NoMemory => -12,
            KernelError::InvalidAccess => -13,
            KernelError::BadAddress => -14,
            KernelError::Busy => -16,
            KernelError::FileExist => -17,
            KernelError::InvalidArgument => -22,
            KernelError::NoSpace => -28,
            KernelError::NotSupportedOperation => -524,
        }) as usize
    }
}

/// The given `isize` does not indicate an [`KernelError`].
#[derive(Debug, Eq, PartialEq)]
pub struct TryFromError {
    e: isize,
}

impl TryFrom<isize> for KernelError {
    type Error = TryFromError;

    fn try_from(value: isize) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::OperationNotPermitted),
            -2 => Ok(Self::NoSuchEntry),
            -5 => Ok(Self::IOError),
            -9 => Ok(Self::BadFileDescriptor),
            -12 => Ok(Self::NoMemory),
            -13 => Ok(Self::InvalidAccess),
            -14 => Ok(Self::BadAddress),
            -16 => Ok(Self::Busy),
            -17 => Ok(Self::FileExist),
            -22 => Ok(Self::InvalidArgument),
            -28 => Ok(Self::NoSpace),
            -524 => Ok(Self::NotSupportedOperation),
            e => Err(TryFromError { e }),
        }
    }
}

/// Sizes and policies of the simulated machine.
#[derive(Debug, Clone)]
pub struct SystemConfiguration {
    /// Number of physical frames available for user pages.
    pub user_frames: usize,
    /// Number of page-sized slots of the swap area.
    pub swap_pages: usize,
    /// Maximum level of the kernel log.
    pub log_level: log::LevelFilter,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            user_frames: 256,
            swap_pages: 1024,
            log_level: log::LevelFilter::Info,
        }
    }
}

/// A builder for system configuration settings.
///
/// The [`SystemConfigurationBuilder`] provides an interface for configuring
/// system-wide settings before initialization.
pub struct SystemConfigurationBuilder {
    conf: SystemConfiguration,
}

impl SystemConfigurationBuilder {
    /// Starts from the default configuration.
    pub fn new() -> Self {
        Self {
            conf: SystemConfiguration::default(),
        }
    }

    /// Starts from the default configuration overridden by the environment.
    ///
    /// Recognized variables are `KEOS_USER_FRAMES`, `KEOS_SWAP_PAGES` and
    /// `KEOS_LOG` (`off`, `error`, `warn`, `info`, `debug` or `trace`).
    /// Malformed values are ignored.
    pub fn from_env() -> Self {
        fn var<T: core::str::FromStr>(name: &str) -> Option<T> {
            std::env::var(name).ok()?.trim().parse().ok()
        }
        let mut builder = Self::new();
        if let Some(n) = var("KEOS_USER_FRAMES") {
            builder = builder.user_frames(n);
        }
        if let Some(n) = var("KEOS_SWAP_PAGES") {
            builder = builder.swap_pages(n);
        }
        if let Some(level) = var("KEOS_LOG") {
            builder = builder.log_level(level);
        }
        builder
    }

    /// Sets the number of physical frames for user pages.
    pub fn user_frames(mut self, n: usize) -> Self {
        self.conf.user_frames = n;
        self
    }

    /// Sets the number of slots of the swap area.
    pub fn swap_pages(mut self, n: usize) -> Self {
        self.conf.swap_pages = n;
        self
    }

    /// Sets the maximum log level.
    pub fn log_level(mut self, level: log::LevelFilter) -> Self {
        self.conf.log_level = level;
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> SystemConfiguration {
        self.conf
    }
}

impl Default for SystemConfigurationBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// Test utilities
#[doc(hidden)]
pub trait TestCase
where
    Self: Sync + Send,
{
    fn name(&'static self) -> &'static str;
    fn run(&'static self) -> bool;
}

impl<T> TestCase for T
where
    T: Fn() + Send + Sync + 'static,
{
    fn name(&'static self) -> &'static str {
        core::any::type_name::<T>()
    }

    fn run(&'static self) -> bool {
        let name = core::any::type_name::<T>();
        print!("test {} ... ", name);
        let passed = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || self())
            .map(|handle| handle.join().is_ok())
            .unwrap_or(false);
        if passed {
            println!("ok");
        } else {
            println!("FAILED");
        }
        passed
    }
}

/// A driver for running tests.
pub struct TestDriver;

impl TestDriver {
    /// Run the given tests, selected by the command line arguments.
    ///
    /// Returns `true` if every selected test passed.
    pub fn start<const TC: usize>(tests: [&'static dyn TestCase; TC]) -> bool {
        Self::start_filtered(tests, std::env::args().skip(1))
    }

    /// Run the given tests whose names appear in `filter`, or all of them if
    /// `filter` is empty.
    ///
    /// A name is the path of the test function without its crate, e.g.
    /// `fault::stack_growth`.
    pub fn start_filtered<const TC: usize>(
        tests: [&'static dyn TestCase; TC],
        filter: impl IntoIterator<Item = String>,
    ) -> bool {
        let filter = filter.into_iter().collect::<BTreeSet<_>>();
        let tests = tests
            .iter()
            .filter(|test| {
                let name = test.name();
                let r = name.split("::").next().map(|n| n.len() + 2).unwrap_or(0);
                filter.is_empty() || filter.contains(name.get(r..).unwrap_or(name))
            })
            .collect::<Vec<_>>();
        let (total, mut succ) = (tests.len(), 0);
        println!(
            "Running {} test{}",
            total,
            if total == 1 { "" } else { "s" }
        );

        for test in tests {
            if test.run() {
                succ += 1;
            }
        }
        println!(
            "test result: {}. {} passed; {} failed",
            if total == succ { "ok" } else { "FAILED" },
            succ,
            total - succ
        );
        total == succ
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_round_trip() {
        for e in [
            KernelError::NoMemory,
            KernelError::BadAddress,
            KernelError::FileExist,
            KernelError::NoSpace,
        ] {
            assert_eq!(KernelError::try_from(e.into_usize() as isize), Ok(e));
        }
        assert!(KernelError::try_from(-4095).is_err());
    }

    #[test]
    fn builder_overrides_defaults() {
        let conf = SystemConfigurationBuilder::new()
            .user_frames(8)
            .swap_pages(3)
            .log_level(log::LevelFilter::Off)
            .build();
        assert_eq!(conf.user_frames, 8);
        assert_eq!(conf.swap_pages, 3);
        assert_eq!(conf.log_level, log::LevelFilter::Off);
    }
}
