use crate::{capture_warnings, MockEngine};
use plrx::prelude::*;
use plrx::security::with_context;
use plrx::xact::{self, add_xact_listener, remove_xact_listener};
use proptest::prelude::*;
use std::cell::RefCell;
use std::rc::{Rc, Weak};

type Log = Rc<RefCell<Vec<(&'static str, String)>>>;

fn logging(name: &'static str, event: XactEvent, log: &Log) -> Rc<XactListener> {
    let log = Rc::clone(log);
    Rc::new(XactListener::new().on(event, move |_| {
        log.borrow_mut().push((name, SecurityContext::current().user().to_owned()));
        Ok(())
    }))
}

fn failing(name: &'static str, event: XactEvent, log: &Log) -> Rc<XactListener> {
    let log = Rc::clone(log);
    Rc::new(XactListener::new().on(event, move |_| {
        log.borrow_mut().push((name, String::new()));
        Err(name.into())
    }))
}

#[test]
fn most_recent_first_in_their_own_context() -> eyre::Result<()> {
    let engine = MockEngine::install();
    let log = Log::default();
    let a = logging("A", XactEvent::Commit, &log);
    let b = logging("B", XactEvent::Commit, &log);
    with_context(&SecurityContext::new("alice", false), || add_xact_listener(&a))?;
    with_context(&SecurityContext::new("bob", false), || add_xact_listener(&b))?;

    let dispatcher = SecurityContext::new("dispatcher", true);
    with_context(&dispatcher, || engine.commit())?;
    assert_eq!(*log.borrow(), [("B", "bob".to_owned()), ("A", "alice".to_owned())]);
    assert_eq!(SecurityContext::current(), SecurityContext::system());
    Ok(())
}

#[test]
fn duplicates_and_unknowns_are_ignored() -> eyre::Result<()> {
    let engine = MockEngine::install();
    let log = Log::default();
    let a = logging("A", XactEvent::Commit, &log);
    let b = logging("B", XactEvent::Commit, &log);

    assert!(add_xact_listener(&a)?);
    assert!(!add_xact_listener(&a)?);
    assert!(add_xact_listener(&b)?);
    assert_eq!(xact::listener_counts()?, (2, 0));
    assert_eq!(engine.calls().register_xact, 1);

    engine.commit()?;
    assert_eq!(log.borrow().len(), 2);

    assert!(remove_xact_listener(&a)?);
    assert!(!remove_xact_listener(&a)?);
    assert_eq!(engine.calls().unregister_xact, 0);
    assert!(remove_xact_listener(&b)?);
    assert_eq!(engine.calls().unregister_xact, 1);
    assert_eq!(engine.delivering(), (false, false));
    Ok(())
}

#[test]
fn terminal_events_reach_every_listener() -> eyre::Result<()> {
    let engine = MockEngine::install();
    let log = Log::default();
    let x = logging("X", XactEvent::Abort, &log);
    let y = failing("Y", XactEvent::Abort, &log);
    let z = failing("Z", XactEvent::Abort, &log);
    for listener in [&x, &y, &z] {
        add_xact_listener(listener)?;
    }

    let (aborted, warnings) = capture_warnings(|| engine.abort());
    let names: Vec<_> = log.borrow().iter().map(|(name, _)| *name).collect();
    assert_eq!(names, ["Z", "Y", "X"]);
    match aborted {
        Err(BridgeError::Listener { event, source }) => {
            assert_eq!(event, "transaction Abort");
            assert_eq!(source.to_string(), "Z");
        }
        other => panic!("expected a listener error, got {other:?}"),
    }
    assert_eq!(warnings, ["additional listener failure"]);
    Ok(())
}

#[test]
fn other_events_stop_at_the_first_failure() -> eyre::Result<()> {
    let engine = MockEngine::install();
    let log = Log::default();
    let committed = logging("committed", XactEvent::Commit, &log);
    let first = logging("X", XactEvent::PreCommit, &log);
    let veto = failing("veto", XactEvent::PreCommit, &log);
    for listener in [&committed, &first, &veto] {
        add_xact_listener(listener)?;
    }

    assert!(matches!(engine.commit(), Err(BridgeError::Listener { .. })));
    let names: Vec<_> = log.borrow().iter().map(|(name, _)| *name).collect();
    assert_eq!(names, ["veto"]);
    Ok(())
}

#[test]
fn listener_may_remove_itself_while_dispatched() -> eyre::Result<()> {
    let engine = MockEngine::install();
    let log = Log::default();
    let other = logging("other", XactEvent::Commit, &log);
    add_xact_listener(&other)?;
    let once = Rc::new_cyclic(|me: &Weak<XactListener>| {
        let me = me.clone();
        XactListener::new().on(XactEvent::Commit, move |_| {
            if let Some(me) = me.upgrade() {
                remove_xact_listener(&me)?;
            }
            Ok(())
        })
    });
    add_xact_listener(&once)?;

    engine.commit()?;
    assert_eq!(xact::listener_counts()?, (1, 0));
    assert_eq!(log.borrow().len(), 1);
    engine.commit()?;
    assert_eq!(log.borrow().len(), 2);
    Ok(())
}

#[test]
fn listener_without_a_handler_is_skipped() -> eyre::Result<()> {
    let engine = MockEngine::install();
    let log = Log::default();
    let listener = logging("abort only", XactEvent::Abort, &log);
    assert!(listener.handles(XactEvent::Abort) && !listener.handles(XactEvent::Commit));
    add_xact_listener(&listener)?;
    engine.commit()?;
    assert!(log.borrow().is_empty());
    Ok(())
}

#[derive(Copy, Clone, Debug)]
enum Change {
    Add(usize),
    Remove(usize),
}

proptest! {
    #[test]
    fn delivery_toggles_once_per_transition(
        changes in proptest::collection::vec(
            prop_oneof![(0..3usize).prop_map(Change::Add), (0..3usize).prop_map(Change::Remove)],
            0..64,
        )
    ) {
        let engine = MockEngine::install();
        let before = engine.calls();
        let listeners: Vec<Rc<SubXactListener>> = (0..3).map(|_| Rc::new(SubXactListener::new())).collect();
        let mut registered = [false; 3];
        let (mut starts, mut stops) = (0, 0);

        for change in changes {
            let was_empty = !registered.iter().any(|r| *r);
            match change {
                Change::Add(i) => {
                    prop_assert_eq!(xact::add_subxact_listener(&listeners[i]).unwrap(), !registered[i]);
                    registered[i] = true;
                }
                Change::Remove(i) => {
                    prop_assert_eq!(xact::remove_subxact_listener(&listeners[i]).unwrap(), registered[i]);
                    registered[i] = false;
                }
            }
            let is_empty = !registered.iter().any(|r| *r);
            starts += u32::from(was_empty && !is_empty);
            stops += u32::from(!was_empty && is_empty);
            prop_assert_eq!(engine.delivering().1, !is_empty);
        }

        let after = engine.calls();
        prop_assert_eq!(after.register_subxact - before.register_subxact, starts);
        prop_assert_eq!(after.unregister_subxact - before.unregister_subxact, stops);

        for listener in &listeners {
            xact::remove_subxact_listener(listener).unwrap();
        }
    }
}
