#![cfg(loom)]

mod common;

use loom::thread;
use tricell::local_rcu;

#[test]
fn two_thread_accumulation_loom_test() {
    loom::model(|| {
        common::two_thread_accumulation_test(2);
    });
}

#[test]
fn rcu_reader_sees_monotone_values_loom_test() {
    loom::model(|| {
        let (mut reader, mut updater) = local_rcu::pair_with(0i32);

        let updater_handle = thread::spawn(move || {
            *updater.get_mut() = 1;
            updater.force_update();
            *updater.get_mut() = 2;
            updater.force_update();
        });

        let mut last = 0;
        for _ in 0..2 {
            reader.try_read();
            let seen = *reader.get_mut();
            assert!(seen >= last, "the reader went back from {last} to {seen}");
            assert!(seen <= 2);
            last = seen;
        }

        updater_handle.join().unwrap();
        reader.try_read();
        let seen = *reader.get_mut();
        assert!(seen >= last);
    });
}

#[test]
fn rcu_try_update_backlog_loom_test() {
    loom::model(|| {
        let (mut reader, mut updater) = local_rcu::pair_with(0i32);

        let reader_handle = thread::spawn(move || {
            reader.try_read();
            let first = *reader.get_mut();
            reader.try_read();
            let second = *reader.get_mut();
            assert!(first <= second);
            reader
        });

        *updater.get_mut() = 1;
        assert!(updater.try_update());
        *updater.get_mut() = 2;
        // Succeeds only once the reader advanced past the first publication.
        updater.try_update();

        let mut reader = reader_handle.join().unwrap();
        reader.try_read();
        assert!(*reader.get_mut() <= 2);
    });
}
