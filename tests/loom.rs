#[cfg(loom)]
use coalesce_rcu::{Options, Rcu};
#[cfg(loom)]
use loom::thread;

// Loom does not instrument the pending-update queue, so every model keeps a
// single updating thread: elections are always won outright and the queue
// stays untouched.

#[cfg(loom)]
fn eager() -> Options {
    Options {
        flush_threshold: 20,
        cleanup_threshold: 1,
        queue_capacity: 8,
    }
}

#[cfg(loom)]
#[test]
fn loom_publish_one_to_one_reader() {
    loom::model(|| {
        let rcu = Rcu::with_options(0usize, eager());
        let mut reader = rcu.reader();

        let rx_t = thread::spawn(move || loop {
            let i = *reader.read();
            match i {
                0 => {}
                1 => break,
                _ => panic!("unexpected {i}"),
            }
            loom::thread::yield_now();
        });

        rcu.update(|v| *v = 1);

        rx_t.join().unwrap();
    });
}

#[cfg(loom)]
#[test]
fn loom_observations_stay_monotonic() {
    loom::model(|| {
        let n = 2usize;
        let rcu = Rcu::with_options(0usize, eager());
        let mut reader = rcu.reader();

        let rx_t = thread::spawn(move || {
            let mut prev = 0;
            loop {
                let i = *reader.read();
                if prev > i {
                    panic!("prev {prev:x} > i {i:x}");
                }
                if i > n {
                    panic!("i {i:x} > n {n:x}");
                }
                if i == n {
                    break;
                }
                prev = i;
                loom::thread::yield_now();
            }
        });

        let tx = rcu.clone();
        let tx_t = thread::spawn(move || {
            for i in 1..=n {
                tx.update(move |v| *v = i);
                loom::thread::yield_now();
            }
        });

        tx_t.join().unwrap();
        rx_t.join().unwrap();
    });
}

#[cfg(loom)]
#[test]
fn loom_guard_rides_out_reclamation() {
    loom::model(|| {
        let rcu = Rcu::with_options(0usize, eager());
        let mut reader = rcu.reader();

        let tx = rcu.clone();
        let tx_t = thread::spawn(move || {
            for i in 1..=2 {
                tx.update(move |v| *v = i);
            }
        });

        let first = {
            let guard = reader.read();
            assert!(*guard <= 2);
            *guard
        };
        let second = *reader.read();
        assert!(second >= first);

        tx_t.join().unwrap();
    });
}
