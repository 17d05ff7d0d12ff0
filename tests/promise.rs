//! End-to-end tests for promise chaining, combinators, and the failure
//! hooks.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use segue::Callback;
use segue::Promise;
use segue::Rejection;
use segue::Value;
use segue::set_bad_cast_hook;
use segue::set_undelivered_rejection_hook;

#[test]
fn settlement_routes_through_the_matching_channel() {
    let fulfils = Arc::new(AtomicUsize::new(0));
    let rejects = Arc::new(AtomicUsize::new(0));

    let p = Promise::new();
    let q = {
        let fulfils = fulfils.clone();
        let rejects = rejects.clone();
        p.then_catch(
            Callback::map(move |_x: &i32| {
                fulfils.fetch_add(1, Ordering::Relaxed);
                42_i32
            }),
            Callback::catch(move |_e: &Rejection| {
                rejects.fetch_add(1, Ordering::Relaxed);
                13_i32
            }),
        )
        .unwrap()
    };

    p.settle(0_i32).unwrap();

    let seen = Arc::new(AtomicI32::new(0));
    {
        let seen = seen.clone();
        q.then(Callback::map(move |x: &i32| {
            seen.store(*x, Ordering::Relaxed);
        }))
        .unwrap();
    }

    assert_eq!(seen.load(Ordering::Relaxed), 42);
    assert_eq!(fulfils.load(Ordering::Relaxed), 1);
    assert_eq!(rejects.load(Ordering::Relaxed), 0);
}

#[test]
fn chain_recovers_from_a_panicking_callback() {
    let calls = Arc::new(AtomicUsize::new(0));
    let p = Promise::new();

    let tail = {
        let c1 = calls.clone();
        let c2 = calls.clone();
        let c3 = calls.clone();
        let c4 = calls.clone();
        p.then(Callback::map(move |x: &i32| {
            c1.fetch_add(1, Ordering::Relaxed);
            x + 1
        }))
        .unwrap()
        .then(Callback::map(move |_x: &i32| -> i32 {
            c2.fetch_add(1, Ordering::Relaxed);
            panic!("expected failure");
        }))
        .unwrap()
        .except(Callback::catch(move |_e: &Rejection| {
            c3.fetch_add(1, Ordering::Relaxed);
            2_i32
        }))
        .unwrap()
        .then(Callback::map(move |x: &i32| {
            c4.fetch_add(1, Ordering::Relaxed);
            *x
        }))
        .unwrap()
    };

    p.settle(0_i32).unwrap();

    assert!(tail.is_settled());
    assert_eq!(calls.load(Ordering::Relaxed), 4);

    let out = Arc::new(AtomicI32::new(0));
    {
        let out = out.clone();
        tail.then(Callback::consume(move |x: i32| {
            out.store(x, Ordering::Relaxed);
        }))
        .unwrap();
    }
    assert_eq!(out.load(Ordering::Relaxed), 2);
}

#[test]
fn all_collects_values_in_input_order() {
    let promises: Vec<Promise> = (0..4).map(|_| Promise::new()).collect();
    let combined = Promise::all(promises.iter().cloned()).unwrap();

    for index in [1_usize, 3, 0, 2] {
        assert!(!combined.is_settled());
        promises[index].settle(index as i32).unwrap();
    }
    assert!(combined.is_settled());

    let collected = Arc::new(Mutex::new(Vec::new()));
    {
        let collected = collected.clone();
        combined
            .then(Callback::map(move |values: &Vec<Value>| {
                let ints: Vec<i32> = values
                    .iter()
                    .map(|value| *value.borrow::<i32>().unwrap())
                    .collect();
                *collected.lock().unwrap() = ints;
            }))
            .unwrap();
    }
    assert_eq!(*collected.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn all_rejects_with_the_first_rejection() {
    let promises: Vec<Promise> = (0..4).map(|_| Promise::new()).collect();
    let combined = Promise::all(promises.iter().cloned()).unwrap();

    let message = Arc::new(Mutex::new(String::new()));
    {
        let message = message.clone();
        combined
            .except(Callback::catch(move |e: &Rejection| {
                *message.lock().unwrap() = e.message().to_owned();
            }))
            .unwrap();
    }

    promises[3].reject("foo").unwrap();
    assert!(combined.is_settled());

    // Later settlements of the other inputs change nothing.
    promises[0].settle(0_i32).unwrap();
    promises[1].settle(1_i32).unwrap();
    promises[2].reject("bar").unwrap();

    assert_eq!(*message.lock().unwrap(), "foo");
}

#[test]
fn all_of_nothing_fulfils_immediately() {
    let combined = Promise::all(std::iter::empty()).unwrap();
    assert!(combined.is_settled());

    let len = Arc::new(AtomicUsize::new(usize::MAX));
    {
        let len = len.clone();
        combined
            .then(Callback::map(move |values: &Vec<Value>| {
                len.store(values.len(), Ordering::Relaxed);
            }))
            .unwrap();
    }
    assert_eq!(len.load(Ordering::Relaxed), 0);
}

#[test]
fn any_settles_with_the_first_fulfilment() {
    let promises: Vec<Promise> = (0..4).map(|_| Promise::new()).collect();
    let combined = Promise::any(promises.iter().cloned()).unwrap();

    promises[0].reject("ignored").unwrap();
    assert!(!combined.is_settled());
    promises[2].settle(7_i32).unwrap();
    assert!(combined.is_settled());

    promises[1].settle(8_i32).unwrap();
    promises[3].reject("also ignored").unwrap();

    let seen = Arc::new(AtomicI32::new(0));
    {
        let seen = seen.clone();
        combined
            .then(Callback::map(move |x: &i32| {
                seen.store(*x, Ordering::Relaxed);
            }))
            .unwrap();
    }
    assert_eq!(seen.load(Ordering::Relaxed), 7);
}

#[test]
fn any_rejects_once_every_input_rejects() {
    let promises: Vec<Promise> = (0..3).map(|_| Promise::new()).collect();
    let combined = Promise::any(promises.iter().cloned()).unwrap();

    let rejected = Arc::new(AtomicUsize::new(0));
    {
        let rejected = rejected.clone();
        combined
            .except(Callback::catch(move |_e: &Rejection| {
                rejected.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
    }

    for (index, promise) in promises.iter().enumerate() {
        assert!(!combined.is_settled());
        promise.reject(format!("failure {index}")).unwrap();
    }
    assert!(combined.is_settled());
    assert_eq!(rejected.load(Ordering::Relaxed), 1);
}

#[test]
fn any_of_nothing_rejects_immediately() {
    let combined = Promise::any(std::iter::empty()).unwrap();
    assert!(combined.is_settled());

    let rejected = Arc::new(AtomicUsize::new(0));
    {
        let rejected = rejected.clone();
        combined
            .except(Callback::catch(move |_e: &Rejection| {
                rejected.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
    }
    assert_eq!(rejected.load(Ordering::Relaxed), 1);
}

#[test]
fn non_cloneable_payload_moves_through_a_consuming_chain() {
    // Deliberately not Clone: any attempted fan-out would surface as a
    // rejection instead of reaching the tail callback.
    struct Token {
        payload: String,
    }

    let p = Promise::new();
    let tail = p
        .then(Callback::consume_unique(|t: Token| t))
        .unwrap()
        .then(Callback::consume_unique(|t: Token| t))
        .unwrap()
        .then(Callback::consume_unique(|t: Token| t))
        .unwrap();

    let delivered = Arc::new(Mutex::new(String::new()));
    let failed = Arc::new(AtomicUsize::new(0));
    let observed = {
        let delivered = delivered.clone();
        tail.then(Callback::consume(move |t: Token| {
            *delivered.lock().unwrap() = t.payload;
        }))
        .unwrap()
    };
    {
        let failed = failed.clone();
        observed
            .except(Callback::catch(move |_e: &Rejection| {
                failed.fetch_add(1, Ordering::Relaxed);
            }))
            .unwrap();
    }

    p.settle_unique(Token {
        payload: String::from("moved, never cloned"),
    })
    .unwrap();

    assert_eq!(*delivered.lock().unwrap(), "moved, never cloned");
    assert_eq!(failed.load(Ordering::Relaxed), 0);
}

#[test]
fn callback_promise_results_are_absorbed() {
    let inner = Promise::new();
    let p = Promise::new();

    let q = {
        let inner = inner.clone();
        p.then(Callback::map(move |_x: &i32| inner.clone())).unwrap()
    };

    p.settle(1_i32).unwrap();
    // The enclosing promise now waits on the returned one.
    assert!(!q.is_settled());

    inner.settle(9_i32).unwrap();
    assert!(q.is_settled());

    let seen = Arc::new(AtomicI32::new(0));
    {
        let seen = seen.clone();
        q.then(Callback::map(move |x: &i32| {
            seen.store(*x, Ordering::Relaxed);
        }))
        .unwrap();
    }
    assert_eq!(seen.load(Ordering::Relaxed), 9);
}

#[test]
fn undelivered_rejection_reaches_the_hook_exactly_once() {
    let seen = Arc::new((AtomicUsize::new(0), Mutex::new(String::new())));
    let previous = {
        let seen = seen.clone();
        set_undelivered_rejection_hook(Box::new(move |rejection| {
            seen.0.fetch_add(1, Ordering::Relaxed);
            *seen.1.lock().unwrap() = rejection.message().to_owned();
        }))
    };

    {
        let p = Promise::new();
        let d = p
            .except(Callback::catch(|_e: &Rejection| -> i32 {
                panic!("secondary failure");
            }))
            .unwrap();
        let s = d.then(Callback::map(|x: &i32| *x)).unwrap();

        p.reject("primary failure").unwrap();
        assert!(s.is_settled());
        // The rejection produced by the reject callback dies with `s`.
    }

    drop(set_undelivered_rejection_hook(previous));

    assert_eq!(seen.0.load(Ordering::Relaxed), 1);
    assert_eq!(*seen.1.lock().unwrap(), "secondary failure");
}

#[test]
fn deferred_bad_cast_goes_through_the_hook() {
    let casts = Arc::new(AtomicUsize::new(0));
    let previous = {
        let casts = casts.clone();
        // Returning normally routes the error into the rejection channel.
        set_bad_cast_hook(Box::new(move |_error| {
            casts.fetch_add(1, Ordering::Relaxed);
        }))
    };

    // No callbacks on `p`, so the attach-time check is inconclusive and
    // the mismatch is only found during propagation.
    let p = Promise::new();
    let q = p.then(Callback::map(|s: &String| s.len())).unwrap();

    let message = Arc::new(Mutex::new(String::new()));
    {
        let message = message.clone();
        q.except(Callback::catch(move |e: &Rejection| {
            *message.lock().unwrap() = e.message().to_owned();
        }))
        .unwrap();
    }

    p.settle(1_i32).unwrap();

    drop(set_bad_cast_hook(previous));

    assert_eq!(casts.load(Ordering::Relaxed), 1);
    assert!(message.lock().unwrap().contains("failed cast from i32"));
}

#[test]
fn settlement_is_monotonic() {
    let p = Promise::new();
    assert!(!p.is_settled());
    p.settle(3_i32).unwrap();
    for _ in 0..10 {
        assert!(p.is_settled());
    }

    p.close();
    for _ in 0..10 {
        assert!(p.is_closed());
    }
}
