// Public API tests for the typed event emitter.

use std::sync::{Arc, Mutex};

use streamdeck_hass_plugin::{EventEmitter, Topic};

#[derive(Debug, Clone, PartialEq)]
struct Press {
    context: String,
}

const PRESS: Topic<Press> = Topic::new("press");
const COUNT: Topic<u32> = Topic::new("count");

#[test]
fn test_topics_with_distinct_payloads_do_not_mix() {
    let events = EventEmitter::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    let sink = seen.clone();
    events.on(PRESS, move |press: &Press| {
        sink.lock().unwrap().push(press.context.clone());
    });
    let sink = seen.clone();
    events.on(COUNT, move |n: &u32| {
        sink.lock().unwrap().push(n.to_string());
    });

    events.emit(PRESS, &Press { context: "ctx1".into() });
    events.emit(COUNT, &7);

    assert_eq!(*seen.lock().unwrap(), vec!["ctx1", "7"]);
}

#[test]
fn test_once_and_unsubscribe_through_clones() {
    let events = EventEmitter::new();
    let clone = events.clone();
    let total = Arc::new(Mutex::new(0));

    let sink = total.clone();
    let once = clone.once(COUNT, move |n: &u32| *sink.lock().unwrap() += n);
    let sink = total.clone();
    let always = events.on(COUNT, move |n: &u32| *sink.lock().unwrap() += n * 10);

    events.emit(COUNT, &1);
    events.emit(COUNT, &2);
    assert_eq!(*total.lock().unwrap(), 1 + 10 + 20);

    assert!(!once.unsubscribe());
    assert!(always.unsubscribe());
    assert!(!always.unsubscribe());
    assert!(!clone.has_listener(COUNT));

    events.emit(COUNT, &100);
    assert_eq!(*total.lock().unwrap(), 31);
}
