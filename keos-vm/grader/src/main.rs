// Scenario tests of the virtual memory subsystem.
extern crate keos;
extern crate keos_vm;

pub mod eviction;
pub mod fork;
pub mod lazy_load;
pub mod mmap;
pub mod page_fault;

use keos::{SystemConfigurationBuilder, TestCase, TestDriver};

const TESTS: [&'static dyn TestCase; 19] = [
    // Lazy loading.
    &lazy_load::uninit_until_touched,
    &lazy_load::segment_from_file,
    &lazy_load::access_ok_does_not_claim,
    // Eviction.
    &eviction::anon_round_trip,
    &eviction::second_chance,
    &eviction::swap_write_failure,
    &eviction::swap_exhausted,
    // Page faults.
    &page_fault::stack_growth,
    &page_fault::stack_limit,
    &page_fault::kernel_address,
    &page_fault::bad_code_write,
    // Fork.
    &fork::no_aliasing,
    &fork::fork_after_eviction,
    &fork::child_outlives_parent,
    // Mmap.
    &mmap::clean_unmap,
    &mmap::dirty_writeback,
    &mmap::partial_last_page,
    &mmap::bad_arguments,
    &mmap::exit_writes_back,
];

fn main() {
    let config = SystemConfigurationBuilder::from_env().build();
    keos::kprint::init(config.log_level);
    if !TestDriver::start(TESTS) {
        std::process::exit(1);
    }
}

#[cfg(test)]
#[test]
fn grade() {
    assert!(TestDriver::start_filtered(TESTS, Vec::<String>::new()));
}
