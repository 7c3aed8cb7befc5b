#![cfg(all(feature = "shuttle", not(loom)))]

mod common;

#[test]
fn two_thread_accumulation_shuttle_test() {
    shuttle::check_random(|| {
        common::two_thread_accumulation_test(8);
    }, 2000);
}
