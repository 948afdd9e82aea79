use crate::MockEngine;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[test]
fn hand_off_runs_at_next_entry() -> eyre::Result<()> {
    let engine = MockEngine::install();
    let gate = plrx::gate()?;
    assert!(gate.is_native_thread());

    let worker = {
        let gate = Arc::clone(&gate);
        thread::spawn(move || {
            assert!(!gate.is_native_thread());
            gate.run(|| plrx::statistics().map(|stats| stats.constructed))
        })
    };
    while gate.queued() == 0 {
        thread::sleep(Duration::from_millis(1));
    }
    engine.enter()?;
    assert_eq!(gate.queued(), 0);

    let constructed = worker.join().map_err(|_| eyre::eyre!("worker panicked"))???;
    assert_eq!(constructed, 0);
    engine.exit(false)?;
    Ok(())
}

#[test]
fn hand_off_from_native_thread_runs_inline() -> eyre::Result<()> {
    MockEngine::install();
    let gate = plrx::gate()?;
    assert_eq!(gate.run(|| 7)?, 7);
    assert!(matches!(gate.service(), Ok(0)));
    Ok(())
}
