use crate::{capture_warnings, Fault, MockEngine};
use plrx::prelude::*;
use plrx::{guc, invocation, xact};
use std::cell::RefCell;
use std::rc::Rc;

type Seen = Rc<RefCell<Vec<(SubXactEvent, SubXactId, SubXactId, Option<Savepoint>, Option<Savepoint>)>>>;

fn recording_listener(seen: &Seen) -> Rc<SubXactListener> {
    let mut listener = SubXactListener::new();
    for event in [SubXactEvent::Start, SubXactEvent::Commit, SubXactEvent::Abort] {
        let seen = Rc::clone(seen);
        listener = listener.on(event, move |info| {
            seen.borrow_mut().push((
                info.event,
                info.id,
                info.parent,
                info.savepoint.clone(),
                info.parent_savepoint.clone(),
            ));
            Ok(())
        });
    }
    Rc::new(listener)
}

#[test]
fn establish_is_visible_to_reentrant_lookups() -> eyre::Result<()> {
    let engine = MockEngine::install();
    engine.enter()?;
    let seen = Seen::default();
    xact::add_subxact_listener(&recording_listener(&seen))?;

    let savepoint = Savepoint::new(Some("outer"));
    assert_eq!(savepoint.id(), SubXactId::INVALID);
    savepoint.establish()?;
    assert!(savepoint.id().is_valid() && savepoint.is_open());
    assert_eq!(savepoint.nest_level(), 2);
    assert_eq!(savepoint.name(), Some("outer"));

    {
        let seen = seen.borrow();
        let (event, id, _, found, parent) = &seen[0];
        assert_eq!((*event, *id), (SubXactEvent::Start, savepoint.id()));
        assert!(found.as_ref().is_some_and(|sp| sp.ptr_eq(&savepoint)));
        assert!(parent.is_none());
    }
    assert!(Invocation::current()?.savepoint().is_some_and(|sp| sp.ptr_eq(&savepoint)));
    assert!(Savepoint::for_id(savepoint.id())?.is_some_and(|sp| sp.ptr_eq(&savepoint)));

    savepoint.release()?;
    assert!(!savepoint.is_open());
    assert_eq!(seen.borrow()[1].0, SubXactEvent::Commit);
    assert!(seen.borrow()[1].3.is_some());
    assert!(Savepoint::for_id(savepoint.id())?.is_none());
    assert!(Invocation::current()?.savepoint().is_none());

    savepoint.release()?;
    savepoint.rollback()?;
    assert_eq!(engine.calls().release_savepoint, 1);
    assert_eq!(engine.calls().rollback_savepoint, 0);
    assert!(matches!(
        savepoint.establish(),
        Err(BridgeError::Usage(UsageError::AlreadyEstablished))
    ));
    assert!(matches!(
        Savepoint::new(None).release(),
        Err(BridgeError::Usage(UsageError::NotEstablished))
    ));
    engine.exit(false)?;
    Ok(())
}

#[test]
fn nested_savepoints_report_their_parent() -> eyre::Result<()> {
    let engine = MockEngine::install();
    engine.enter()?;
    let seen = Seen::default();
    xact::add_subxact_listener(&recording_listener(&seen))?;

    let outer = Savepoint::set(Some("outer"))?;
    let inner = Savepoint::set(Some("inner"))?;
    assert_eq!(inner.nest_level(), outer.nest_level() + 1);
    {
        let seen = seen.borrow();
        assert_eq!(seen[1].1, inner.id());
        assert_eq!(seen[1].2, outer.id());
        assert!(seen[1].3.as_ref().is_some_and(|sp| sp.ptr_eq(&inner)));
        assert!(seen[1].4.as_ref().is_some_and(|sp| sp.ptr_eq(&outer)));
    }
    // the invocation remembers the outermost one
    assert!(Invocation::current()?.savepoint().is_some_and(|sp| sp.ptr_eq(&outer)));

    outer.rollback()?;
    let aborted: Vec<SubXactId> = seen
        .borrow()
        .iter()
        .filter(|(event, ..)| *event == SubXactEvent::Abort)
        .map(|(_, id, ..)| *id)
        .collect();
    assert_eq!(aborted, [inner.id(), outer.id()]);
    assert!(!inner.is_open());
    engine.exit(false)?;
    Ok(())
}

#[test]
fn rollback_resolves_the_pending_error() -> eyre::Result<()> {
    let engine = MockEngine::install();
    engine.enter()?;
    let outer = Savepoint::set(Some("outer"))?;
    let inner = Savepoint::set(Some("inner"))?;

    engine.inject(Fault::SetSavepoint);
    assert!(Savepoint::set(None).is_err());
    engine.heal(Fault::SetSavepoint);
    assert!(Invocation::error_occurred()?);
    assert!(matches!(inner.release(), Err(BridgeError::Unhandled { .. })));

    outer.rollback()?;
    assert!(!outer.is_open() && !inner.is_open());
    assert!(!Invocation::error_occurred()?);
    assert!(invocation::pending_error()?.is_none());
    assert_eq!(engine.open_subxacts(), 0);
    assert!(Invocation::current()?.savepoint().is_none());

    let (exited, warnings) = capture_warnings(|| engine.exit(false));
    exited?;
    assert!(warnings.is_empty());
    assert_eq!(engine.calls().rollback_savepoint, 1);
    Ok(())
}

#[test]
fn lingering_savepoint_is_rolled_back_by_default() -> eyre::Result<()> {
    let engine = MockEngine::install();
    engine.enter()?;
    let savepoint = Savepoint::set(Some("lingering"))?;

    let (exited, warnings) = capture_warnings(|| engine.exit(false));
    exited?;
    assert_eq!(engine.calls().rollback_savepoint, 1);
    assert_eq!(engine.calls().release_savepoint, 0);
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("rolling it back"));
    assert!(!savepoint.is_open());
    assert_eq!(engine.open_subxacts(), 0);
    Ok(())
}

#[test]
fn lingering_savepoint_is_released_when_configured() -> eyre::Result<()> {
    let engine = MockEngine::install_with(&[(guc::RELEASE_LINGERING_SAVEPOINTS, "on")]);
    assert!(guc::config()?.release_lingering_savepoints);

    engine.enter()?;
    Savepoint::set(None)?;
    let (exited, warnings) = capture_warnings(|| engine.exit(false));
    exited?;
    assert_eq!(engine.calls().release_savepoint, 1);
    assert!(warnings[0].contains("releasing it"));

    // an error exit always rolls back
    engine.enter()?;
    Savepoint::set(None)?;
    engine.exit(true)?;
    assert_eq!(engine.calls().rollback_savepoint, 1);

    guc::set_release_lingering_savepoints(false)?;
    engine.enter()?;
    Savepoint::set(None)?;
    engine.exit(false)?;
    assert_eq!(engine.calls().rollback_savepoint, 2);
    assert_eq!(engine.calls().release_savepoint, 1);
    Ok(())
}

#[test]
fn pending_error_rolls_back_even_when_release_is_configured() -> eyre::Result<()> {
    let engine = MockEngine::install_with(&[(guc::RELEASE_LINGERING_SAVEPOINTS, "on")]);
    engine.enter()?;
    let savepoint = Savepoint::set(Some("lingering"))?;

    engine.inject(Fault::SetSavepoint);
    assert!(Savepoint::set(None).is_err());
    engine.heal(Fault::SetSavepoint);
    assert!(invocation::pending_error()?.is_some());

    let (exited, warnings) = capture_warnings(|| engine.exit(false));
    exited?;
    assert_eq!(engine.calls().rollback_savepoint, 1);
    assert_eq!(engine.calls().release_savepoint, 0);
    assert_eq!(engine.open_subxacts(), 0);
    assert!(!savepoint.is_open());
    assert!(invocation::pending_error()?.is_none());
    assert!(warnings.iter().any(|w| w.contains("caught but not resolved")));
    assert!(warnings.iter().any(|w| w.contains("rolling it back")));
    assert!(!warnings.iter().any(|w| w.contains("releasing it")));
    Ok(())
}

#[test]
fn resolved_savepoint_needs_nothing_at_exit() -> eyre::Result<()> {
    let engine = MockEngine::install();
    engine.enter()?;
    Savepoint::set(None)?.rollback()?;
    let before = engine.calls();

    let (exited, warnings) = capture_warnings(|| engine.exit(true));
    exited?;
    assert_eq!(engine.calls(), before);
    assert!(warnings.is_empty());
    Ok(())
}

#[test]
fn establishing_from_inside_establish_is_refused() -> eyre::Result<()> {
    let engine = MockEngine::install();
    engine.enter()?;
    let refused = Rc::new(RefCell::new(None));
    let record = Rc::clone(&refused);
    let listener = Rc::new(SubXactListener::new().on(SubXactEvent::Start, move |_| {
        *record.borrow_mut() = Some(Savepoint::set(None).err());
        Ok(())
    }));
    xact::add_subxact_listener(&listener)?;

    let outer = Savepoint::set(None)?;
    assert!(matches!(
        refused.borrow_mut().take(),
        Some(Some(BridgeError::Usage(UsageError::NurseryOccupied)))
    ));
    xact::remove_subxact_listener(&listener)?;
    outer.release()?;
    engine.exit(false)?;
    Ok(())
}

#[test]
fn transaction_end_forgets_savepoints() -> eyre::Result<()> {
    let engine = MockEngine::install();
    let listener = Rc::new(XactListener::new());
    xact::add_xact_listener(&listener)?;

    engine.enter()?;
    let savepoint = Savepoint::set(None)?;
    engine.abort()?;
    assert!(!savepoint.is_open());
    assert!(Invocation::current()?.savepoint().is_none());

    let (exited, warnings) = capture_warnings(|| engine.exit(true));
    exited?;
    assert!(warnings.is_empty());
    assert_eq!(engine.calls().rollback_savepoint, 0);
    Ok(())
}
