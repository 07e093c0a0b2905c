//! Task dispatcher ordering across submitting threads.

use std::sync::{Arc, Mutex};
use std::thread;

use proptest::prelude::*;
use vcomputer::dispatcher::TaskDispatcher;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Every task runs exactly once, on the owner thread, and each
    /// submitter's tasks run in the order it submitted them.
    #[test]
    fn tasks_run_once_in_per_submitter_order(plan in prop::collection::vec(1usize..20, 1..6)) {
        let (dispatcher, owner) = TaskDispatcher::spawn_owner("prop-owner").unwrap();
        let owner_id = owner.thread().id();
        let ran: Arc<Mutex<Vec<(usize, usize)>>> = Arc::default();

        let submitters: Vec<_> = plan
            .iter()
            .enumerate()
            .map(|(who, &count)| {
                let dispatcher = Arc::clone(&dispatcher);
                let ran = Arc::clone(&ran);
                thread::spawn(move || {
                    for n in 0..count {
                        let ran = Arc::clone(&ran);
                        if n % 2 == 0 {
                            dispatcher.submit_async(move || {
                                if thread::current().id() == owner_id {
                                    ran.lock().unwrap().push((who, n));
                                }
                                Ok(())
                            });
                        } else {
                            let on_owner = dispatcher
                                .submit(move || {
                                    ran.lock().unwrap().push((who, n));
                                    Ok(thread::current().id() == owner_id)
                                })
                                .unwrap();
                            assert!(on_owner);
                        }
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }
        // Drains anything queued asynchronously after the last sync submit.
        dispatcher.submit(|| Ok(())).unwrap();
        dispatcher.shutdown();
        owner.join().unwrap();

        let ran = ran.lock().unwrap();
        prop_assert_eq!(ran.len(), plan.iter().sum::<usize>());
        for (who, &count) in plan.iter().enumerate() {
            let order: Vec<usize> = ran.iter().filter(|(w, _)| *w == who).map(|(_, n)| *n).collect();
            prop_assert_eq!(order, (0..count).collect::<Vec<_>>());
        }
    }
}
