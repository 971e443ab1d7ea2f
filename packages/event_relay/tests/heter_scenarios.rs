//! End-to-end behavior of [`HeterQueue`]: mixed-signature delivery, visitor parity and
//! partial draining over type-erased payloads.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use event_relay::{Error, HeterQueue};

type Log<T> = Arc<Mutex<Vec<T>>>;

fn log<T>() -> Log<T> {
    Arc::new(Mutex::new(Vec::new()))
}

/// Renders an erased payload the way the tests' listeners record them.
fn render(args: &dyn Any) -> String {
    if let Some(value) = args.downcast_ref::<i64>() {
        value.to_string()
    } else if let Some(value) = args.downcast_ref::<String>() {
        value.clone()
    } else {
        panic!("unexpected argument type in test");
    }
}

#[test]
fn visitor_dispatch_matches_listener_dispatch() {
    let enqueues: [Box<dyn Fn(&HeterQueue<u32>)>; 3] = [
        Box::new(|queue| queue.enqueue(1, 10_i64).unwrap()),
        Box::new(|queue| queue.enqueue(2, "b".to_string()).unwrap()),
        Box::new(|queue| queue.enqueue(3, 30_i64).unwrap()),
    ];

    // Collect through listeners registered per event.
    let listener_queue = HeterQueue::<u32>::new();
    let by_listener = log::<(u32, String)>();

    for event in [1_u32, 3] {
        let seen = Arc::clone(&by_listener);
        listener_queue
            .append_listener(event, move |args: &i64| {
                seen.lock().unwrap().push((event, args.to_string()));
            })
            .unwrap();
    }
    {
        let seen = Arc::clone(&by_listener);
        listener_queue
            .append_listener(2, move |args: &String| {
                seen.lock().unwrap().push((2, args.clone()));
            })
            .unwrap();
    }

    for enqueue in &enqueues {
        enqueue(&listener_queue);
    }
    assert!(listener_queue.process().unwrap());

    // Collect through the visitor path.
    let visitor_queue = HeterQueue::<u32>::new();
    for enqueue in &enqueues {
        enqueue(&visitor_queue);
    }

    let mut by_visitor = Vec::new();
    assert!(visitor_queue.process_queue_with(|event, args| {
        by_visitor.push((*event, render(args)));
    }));

    assert_eq!(by_visitor, *by_listener.lock().unwrap());
}

#[test]
fn process_one_with_leaves_remainder() {
    let queue = HeterQueue::<u32>::new();

    queue.enqueue(1, 10_i64).unwrap();
    queue.enqueue(2, "late".to_string()).unwrap();

    let mut first = None;
    assert!(queue.process_one_with(|event, args| first = Some((*event, render(args)))));
    assert_eq!(first, Some((1, "10".to_string())));
    assert!(!queue.is_empty());

    let mut second = None;
    assert!(queue.process_one_with(|event, args| second = Some((*event, render(args)))));
    assert_eq!(second, Some((2, "late".to_string())));

    assert!(!queue.process_one_with(|_event, _args| panic!("queue is empty")));
}

#[test]
fn process_if_keeps_non_matching_events_in_order() {
    let queue = HeterQueue::<u32>::new();
    let seen = log::<i64>();

    {
        let seen = Arc::clone(&seen);
        queue
            .append_listener(1, move |args: &i64| seen.lock().unwrap().push(*args))
            .unwrap();
    }

    for value in [1_i64, 2, 3, 4, 5, 6] {
        queue.enqueue(1, value).unwrap();
    }

    // Only even payloads this pass.
    assert!(queue
        .process_if(|_event, args| {
            args.downcast_ref::<i64>().is_some_and(|value| value % 2 == 0)
        })
        .unwrap());
    assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6]);

    // The rest is still queued, in its original order.
    assert!(queue.process().unwrap());
    assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6, 1, 3, 5]);
}

#[test]
fn process_if_mismatch_keeps_kept_and_unexamined_events() {
    let queue = HeterQueue::<u32>::new();

    queue.append_listener(1, |_args: &i64| {}).unwrap();

    // Kept (predicate false), mismatching (predicate true), unexamined.
    queue.enqueue(2, "keep".to_string()).unwrap();
    queue.enqueue(1, "bad".to_string()).unwrap();
    queue.enqueue(1, 5_i64).unwrap();

    let result = queue.process_if(|event, _args| *event == 1);
    assert!(matches!(result, Err(Error::SignatureMismatch { .. })));

    // The mismatching event is consumed; the kept event comes back first.
    let mut remaining = Vec::new();
    assert!(queue.process_queue_with(|event, args| remaining.push((*event, render(args)))));
    assert_eq!(
        remaining,
        vec![(2, "keep".to_string()), (1, "5".to_string())]
    );
}

#[test]
fn process_until_respects_the_deadline() {
    let queue = HeterQueue::<u32>::new();
    let seen = log::<i64>();

    {
        let seen = Arc::clone(&seen);
        queue
            .append_listener(1, move |args: &i64| seen.lock().unwrap().push(*args))
            .unwrap();
    }

    for value in 0..4 {
        queue.enqueue(1, i64::from(value)).unwrap();
    }

    // An already expired deadline processes nothing and loses nothing.
    assert!(!queue
        .process_until(Instant::now() - Duration::from_millis(1))
        .unwrap());
    assert!(!queue.is_empty());

    // A generous deadline drains everything.
    assert!(queue
        .process_until(Instant::now() + Duration::from_secs(60))
        .unwrap());
    assert!(queue.is_empty());
    assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[test]
fn peek_and_take() {
    let queue = HeterQueue::<u32>::new();

    queue.enqueue(7, 5_i64).unwrap();
    queue.enqueue(8, "back".to_string()).unwrap();

    assert_eq!(queue.peek_event(), Some(7));
    // Peeking does not consume.
    assert_eq!(queue.peek_event(), Some(7));

    let (event, args) = queue.take_event().unwrap();
    assert_eq!(event, 7);
    assert_eq!(args.downcast_ref::<i64>(), Some(&5));

    let (event, args) = queue.take_event().unwrap();
    assert_eq!(event, 8);
    assert_eq!(*args.downcast::<String>().unwrap(), "back");

    assert!(queue.take_event().is_none());
    assert_eq!(queue.peek_event(), None);
}

#[test]
fn mismatch_keeps_undelivered_events_queued() {
    let queue = HeterQueue::<u32>::new();
    let seen = log::<i64>();

    {
        let seen = Arc::clone(&seen);
        queue
            .append_listener(1, move |args: &i64| seen.lock().unwrap().push(*args))
            .unwrap();
    }

    queue.enqueue(1, 1_i64).unwrap();
    queue.enqueue(1, "oops".to_string()).unwrap();
    queue.enqueue(1, 3_i64).unwrap();

    // The drain stops at the mismatch; events after it stay buffered.
    assert!(matches!(
        queue.process(),
        Err(Error::SignatureMismatch { .. })
    ));
    assert_eq!(*seen.lock().unwrap(), vec![1]);
    assert!(!queue.is_empty());

    assert!(queue.process().unwrap());
    assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
}

#[test]
fn empty_queue_operations_are_no_ops() {
    let queue = HeterQueue::<u32>::new();

    assert!(!queue.process().unwrap());
    assert!(!queue.process_one().unwrap());
    assert!(!queue.process_if(|_event, _args| true).unwrap());
    assert!(!queue
        .process_until(Instant::now() + Duration::from_secs(1))
        .unwrap());
    assert!(!queue.process_queue_with(|_event, _args| {}));
    assert!(!queue.process_one_with(|_event, _args| {}));
    assert_eq!(queue.peek_event(), None);
    assert!(queue.take_event().is_none());
}
