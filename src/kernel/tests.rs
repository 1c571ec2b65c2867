use crate::errors::{Error, Result};
use crate::kernel::selector::Interest;
use crate::kernel::{context, run, Builder};
use crate::signals::{Signal, SignalSet};
use crate::sync::{Condition, Event, Lock, Queue, Semaphore};
use crate::task::{current_task, spawn, spawn_daemon, Task, TaskRef};
use crate::time::{ignore_after, sleep, timeout_after};
use crate::traps;
use crate::workers::{abide, run_in_process, run_in_thread, AbideLock, SyncLock};
use anyhow::anyhow;
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::os::fd::AsRawFd;
use std::process::Command;
use std::rc::Rc;
use std::time::{Duration, Instant};

type TestResult = anyhow::Result<()>;

// Generous upper bounds keep the timing assertions honest on loaded CI
// machines; the lower bounds are the real contract.
const SLACK: Duration = Duration::from_millis(400);

#[test]
fn test_run_returns_root_value() -> TestResult {
    let value = run(async { Ok(21 * 2) })?;
    assert_eq!(value, 42);
    Ok(())
}

#[test]
fn test_spawn_runs_child_one_cycle_before_returning() -> TestResult {
    run(async {
        let child = spawn(async {
            traps::yield_now().await?;
            Ok(())
        })
        .await?;
        // The child has been resumed at least once by the time spawn
        // returns.
        assert!(child.cycles() >= 1);
        child.join().await?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_sleep_wakeup_ordering() -> TestResult {
    let order: Rc<RefCell<Vec<u64>>> = Rc::new(RefCell::new(Vec::new()));
    let observed = Rc::clone(&order);

    run(async move {
        let mut children = Vec::new();
        for ms in [100u64, 50, 200] {
            let order = Rc::clone(&order);
            children.push(
                spawn(async move {
                    sleep(Duration::from_millis(ms)).await?;
                    order.borrow_mut().push(ms);
                    Ok(())
                })
                .await?,
            );
        }
        for child in children {
            child.join().await?;
        }
        Ok(())
    })?;

    assert_eq!(*observed.borrow(), vec![50, 100, 200]);
    Ok(())
}

#[test]
fn test_sleep_zero_yields_to_other_ready_tasks() -> TestResult {
    let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
    let observed = Rc::clone(&order);

    run(async move {
        let sibling = {
            let order = Rc::clone(&order);
            spawn(async move {
                order.borrow_mut().push("sibling");
                Ok(())
            })
            .await?
        };
        sleep(Duration::ZERO).await?;
        order.borrow_mut().push("main");
        sibling.join().await?;
        Ok(())
    })?;

    assert_eq!(*observed.borrow(), vec!["sibling", "main"]);
    Ok(())
}

#[test]
fn test_timeout_after_raises_on_expiry() -> TestResult {
    run(async {
        let start = Instant::now();
        let res = timeout_after(Duration::from_millis(50), sleep(Duration::from_secs(1))).await;
        assert!(matches!(res, Err(Error::Timeout)));

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "fired early: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(50) + SLACK, "fired late: {elapsed:?}");
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_timeout_scope_restores_cleanly() -> TestResult {
    run(async {
        // R1: completing inside the deadline leaves no timeout behind.
        let v = timeout_after(Duration::from_millis(200), async { Ok(7) }).await?;
        assert_eq!(v, 7);
        sleep(Duration::from_millis(20)).await?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_ignore_after_returns_none_on_expiry() -> TestResult {
    run(async {
        let start = Instant::now();
        let res = ignore_after(Duration::from_millis(50), sleep(Duration::from_secs(1))).await?;
        assert!(res.is_none());
        assert!(start.elapsed() < Duration::from_millis(50) + SLACK);

        // And passes values through when the inner future wins.
        let res = ignore_after(Duration::from_millis(200), async { Ok("done") }).await?;
        assert_eq!(res, Some("done"));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_nested_timeout_scopes() -> TestResult {
    run(async {
        // The inner (longer) deadline never fires; the outer swallows its
        // own expiry.
        let res = ignore_after(
            Duration::from_millis(50),
            timeout_after(Duration::from_secs(10), sleep(Duration::from_secs(1))),
        )
        .await?;
        assert!(res.is_none());
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_lock_handoff_is_fifo() -> TestResult {
    let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let observed = Rc::clone(&order);

    run(async move {
        let lock = Lock::new();
        lock.acquire().await?;

        let mut children = Vec::new();
        for i in 0..10 {
            let lock = lock.clone();
            let order = Rc::clone(&order);
            children.push(
                spawn(async move {
                    lock.acquire().await?;
                    order.borrow_mut().push(i);
                    lock.release().await?;
                    Ok(())
                })
                .await?,
            );
        }

        lock.release().await?;
        for child in children {
            child.join().await?;
        }

        // R2: uncontended afterwards.
        lock.acquire().await?;
        lock.release().await?;
        assert!(!lock.locked());
        Ok(())
    })?;

    assert_eq!(*observed.borrow(), (0..10).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_release_unheld_lock_errors() -> TestResult {
    run(async {
        let lock = Lock::new();
        assert!(matches!(lock.release().await, Err(Error::NotHeld)));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_cancel_while_blocked_on_io() -> TestResult {
    let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;

    run(async move {
        let fd = rd.as_raw_fd();
        let blocked = spawn(async move { traps::read_wait(fd).await }).await?;
        let blocked_ref = blocked.as_ref();

        sleep(Duration::from_millis(10)).await?;
        assert_eq!(blocked_ref.state(), "READ_WAIT");

        let was_cancelled = blocked_ref.cancel().await?;
        assert!(was_cancelled);
        assert!(blocked_ref.terminated());
        assert!(blocked_ref.cancelled());

        // The selector registration is gone (P3).
        let registered = context::with_core(|core| core.registered_fds())?;
        assert_eq!(registered, 0);

        assert!(matches!(blocked.join().await, Err(Error::Cancelled)));
        drop(wr);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_io_wakeup_beats_stale_timeout_in_same_tick() -> TestResult {
    let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;

    run(async move {
        let fd = rd.as_raw_fd();
        let reader = spawn(async move {
            timeout_after(Duration::from_millis(50), traps::read_wait(fd)).await
        })
        .await?;

        sleep(Duration::from_millis(20)).await?;
        let mut wr = std::fs::File::from(wr);
        wr.write_all(b"x").map_err(Error::Io)?;
        // Stall the loop past the reader's deadline so the next tick sees
        // the readiness event and the due timer entry together.
        std::thread::sleep(Duration::from_millis(60));

        // Readiness rescheduled the reader first; the stale deadline is
        // discarded rather than clobbering the completed read.
        reader.join().await?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_cancel_terminated_task_returns_false() -> TestResult {
    run(async {
        let task = spawn(async { Ok(1) }).await?;
        let r = task.as_ref();
        task.join().await?;

        assert!(!r.cancel().await?);
        assert!(!r.cancelled());
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_self_cancel_is_rejected() -> TestResult {
    run(async {
        let me = current_task().await?;
        assert!(matches!(me.cancel().await, Err(Error::SelfCancel)));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_two_cancellers_piggyback() -> TestResult {
    run(async {
        let target = spawn(async { sleep(Duration::from_secs(10)).await }).await?;
        let (a, b) = (target.as_ref(), target.as_ref());

        let first = spawn(async move { a.cancel().await }).await?;
        let second = spawn(async move { b.cancel().await }).await?;

        assert!(first.join().await?);
        assert!(second.join().await?);
        assert!(target.cancelled());
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_worker_thread_cancellation_sets_worker_aside() -> TestResult {
    run(async {
        let start = Instant::now();
        let task =
            spawn(async { run_in_thread(|| std::thread::sleep(Duration::from_millis(300))).await })
                .await?;
        let task_ref = task.as_ref();

        sleep(Duration::from_millis(10)).await?;
        assert!(task_ref.cancel().await?);
        assert!(
            start.elapsed() < Duration::from_millis(250),
            "cancel had to preempt the worker, not wait for it"
        );

        // The pool is not exhausted: the zombie worker finishes in the
        // background while a fresh call succeeds.
        let value = run_in_thread(|| 6 * 7).await?;
        assert_eq!(value, 42);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_worker_panic_is_captured() -> TestResult {
    run(async {
        let res = run_in_thread(|| panic!("boom in worker")).await;
        match res {
            Err(Error::Panicked(msg)) => assert!(msg.contains("boom in worker")),
            other => panic!("unexpected: {other:?}"),
        }
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_event_broadcast_wakes_all_waiters() -> TestResult {
    let woken: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));
    let observed = Rc::clone(&woken);

    run(async move {
        let event = Event::new();

        let mut waiters = Vec::new();
        for i in 0..3 {
            let event = event.clone();
            let woken = Rc::clone(&woken);
            waiters.push(
                spawn(async move {
                    event.wait().await?;
                    woken.borrow_mut().push(i);
                    Ok(())
                })
                .await?,
            );
        }

        sleep(Duration::from_millis(10)).await?;
        event.set().await?;
        for waiter in waiters {
            waiter.join().await?;
        }

        assert!(event.is_set());
        // Set: waits return immediately.
        event.wait().await?;

        // Cleared: waits park again.
        event.clear();
        let res = ignore_after(Duration::from_millis(20), event.wait()).await?;
        assert!(res.is_none());
        Ok(())
    })?;

    assert_eq!(observed.borrow().len(), 3);
    Ok(())
}

#[test]
fn test_bounded_queue_blocks_producer() -> TestResult {
    let order: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));
    let observed = Rc::clone(&order);

    run(async move {
        let queue: Queue<u32> = Queue::with_maxsize(1);

        let producer = {
            let queue = queue.clone();
            let order = Rc::clone(&order);
            spawn(async move {
                for i in 1..=2 {
                    queue.put(i).await?;
                    order.borrow_mut().push(format!("put:{i}"));
                }
                Ok(())
            })
            .await?
        };

        let consumer = {
            let queue = queue.clone();
            let order = Rc::clone(&order);
            spawn(async move {
                sleep(Duration::from_millis(20)).await?;
                for _ in 0..2 {
                    let item = queue.get().await?;
                    order.borrow_mut().push(format!("get:{item}"));
                }
                Ok(())
            })
            .await?
        };

        producer.join().await?;
        consumer.join().await?;
        Ok(())
    })?;

    // The second put only goes through after the consumer drains one item.
    assert_eq!(
        *observed.borrow(),
        vec!["put:1", "get:1", "put:2", "get:2"]
    );
    Ok(())
}

#[test]
fn test_queue_round_trip_and_join() -> TestResult {
    run(async {
        let queue: Queue<&'static str> = Queue::new();

        // R3: FIFO round trip on an unbounded queue.
        queue.put("x").await?;
        assert_eq!(queue.get().await?, "x");

        queue.put("work").await?;
        let worker = {
            let queue = queue.clone();
            spawn(async move {
                let _item = queue.get().await?;
                queue.task_done().await?;
                Ok(())
            })
            .await?
        };
        queue.join().await?;
        worker.join().await?;

        // task_done must not outnumber puts.
        assert!(matches!(
            queue.task_done().await,
            Err(Error::TooManyTaskDone)
        ));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_semaphore_bounded_over_release() -> TestResult {
    run(async {
        let sem = Semaphore::bounded(1);
        sem.acquire().await?;
        sem.release().await?;
        assert!(matches!(
            sem.release().await,
            Err(Error::SemaphoreOverflow)
        ));

        // Contended hand-off serves waiters in order.
        let sem2 = Semaphore::new(1);
        sem2.acquire().await?;
        let waiter = {
            let sem2 = sem2.clone();
            spawn(async move {
                sem2.acquire().await?;
                sem2.release().await?;
                Ok(())
            })
            .await?
        };
        sem2.release().await?;
        waiter.join().await?;
        assert_eq!(sem2.value(), 1);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_condition_notify_moves_waiters_through_lock() -> TestResult {
    run(async {
        let cond = Condition::new();
        let flag = Rc::new(Cell::new(false));

        let consumer = {
            let cond = cond.clone();
            let flag = Rc::clone(&flag);
            spawn(async move {
                cond.acquire().await?;
                cond.wait_for(|| flag.get()).await?;
                // The lock is held again on the way out.
                assert!(cond.lock().locked());
                cond.release().await?;
                Ok(())
            })
            .await?
        };

        sleep(Duration::from_millis(10)).await?;
        cond.acquire().await?;
        flag.set(true);
        cond.notify_all().await?;
        cond.release().await?;

        consumer.join().await?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_condition_wait_without_lock_errors() -> TestResult {
    run(async {
        let cond = Condition::new();
        assert!(matches!(cond.wait().await, Err(Error::NotHeld)));
        assert!(matches!(cond.notify(1).await, Err(Error::NotHeld)));
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_io_wait_retries_would_block() -> TestResult {
    let (rd, wr) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;

    run(async move {
        let writer = spawn(async move {
            sleep(Duration::from_millis(20)).await?;
            let mut wr = std::fs::File::from(wr);
            wr.write_all(b"ping").map_err(Error::Io)?;
            Ok(())
        })
        .await?;

        let mut rd = std::fs::File::from(rd);
        let fd = rd.as_raw_fd();
        let mut buf = [0u8; 8];
        let n = traps::io_wait(fd, Interest::READ, || rd.read(&mut buf)).await?;
        assert_eq!(&buf[..n], b"ping");

        writer.join().await?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_signal_delivery_through_event_loop() -> TestResult {
    run(async {
        let signals = SignalSet::new(&[Signal::SIGUSR1]);
        signals.watch().await?;

        let waiter = spawn(async move {
            let got = signals.wait().await?;
            Ok(got)
        })
        .await?;

        sleep(Duration::from_millis(10)).await?;
        let rc = unsafe { libc::raise(libc::SIGUSR1) };
        assert_eq!(rc, 0);

        let got = waiter.join().await?;
        assert_eq!(got, Signal::SIGUSR1);
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_run_in_process_captures_output() -> TestResult {
    run(async {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let output = run_in_process(cmd).await?;
        assert!(output.status.success());
        assert_eq!(output.stdout, b"hello\n");
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_run_in_process_cancellation_terminates_child() -> TestResult {
    run(async {
        let start = Instant::now();
        let task = spawn(async {
            let mut cmd = Command::new("sleep");
            cmd.arg("5");
            run_in_process(cmd).await?;
            Ok(())
        })
        .await?;
        let task_ref = task.as_ref();

        sleep(Duration::from_millis(20)).await?;
        assert!(task_ref.cancel().await?);
        assert!(start.elapsed() < Duration::from_secs(2));

        // The freed slot is usable again.
        let cmd = Command::new("true");
        let output = run_in_process(cmd).await?;
        assert!(output.status.success());
        Ok(())
    })?;
    Ok(())
}

struct ForeignLock(parking_lot::RawMutex);

impl SyncLock for ForeignLock {
    fn acquire(&self) {
        use parking_lot::lock_api::RawMutex as _;
        self.0.lock();
    }

    fn release(&self) {
        use parking_lot::lock_api::RawMutex as _;
        // Safety: the adapter pairs every release with a completed acquire.
        unsafe { self.0.unlock() }
    }
}

#[test]
fn test_abide_routes_callables_and_locks() -> TestResult {
    run(async {
        let value = abide(|| 19 + 23).await?;
        assert_eq!(value, 42);

        use parking_lot::lock_api::RawMutex as _;
        let lock = AbideLock::new(ForeignLock(parking_lot::RawMutex::INIT));
        lock.acquire().await?;
        lock.release().await?;
        // Non-reentrant contract: a second acquire after release works.
        lock.acquire().await?;
        lock.release().await?;
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_joining_failed_task_wraps_error() -> TestResult {
    let mut kernel = Builder::new().log_errors(false).try_build()?;
    kernel.run(async {
        let task: Task<()> = spawn(async { Err(Error::Other(anyhow!("boom"))) }).await?;
        let task_ref = task.as_ref();

        match task.join().await {
            Err(Error::TaskError { id, source }) => {
                assert_eq!(id, task_ref.id());
                assert!(source.to_string().contains("boom"));
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(task_ref.terminated());
        assert!(!task_ref.cancelled());
        assert!(task_ref.error().is_some());
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_panicking_task_surfaces_to_joiner() -> TestResult {
    let mut kernel = Builder::new().log_errors(false).try_build()?;
    kernel.run(async {
        let task: Task<()> = spawn(async { panic!("kaboom") }).await?;

        match task.join().await {
            Err(Error::TaskError { source, .. }) => {
                assert!(matches!(&*source, Error::Panicked(_)));
            }
            other => panic!("unexpected: {other:?}"),
        }
        Ok(())
    })?;
    Ok(())
}

#[test]
fn test_daemon_does_not_block_run_and_is_cancelled_at_shutdown() -> TestResult {
    let mut kernel = Builder::new().try_build()?;

    let daemon: TaskRef = kernel.run(async {
        let d = spawn_daemon(async { sleep(Duration::from_secs(60)).await }).await?;
        Ok(d.as_ref())
    })?;

    // run returned while the daemon still sleeps.
    assert!(!daemon.terminated());

    kernel.shutdown()?;
    assert!(daemon.terminated());
    assert!(daemon.cancelled());
    Ok(())
}

#[test]
fn test_kernel_tracks_no_tasks_after_run() -> TestResult {
    let mut kernel = Builder::new().try_build()?;
    kernel.run(async {
        let t = spawn(async { Ok(()) }).await?;
        t.join().await?;
        Ok(())
    })?;
    // Everything non-daemon has been reaped from the table (I4).
    context::install(std::rc::Rc::clone(&kernel_core(&kernel)))?;
    let live = context::with_core(|core| core.live_tasks())?;
    context::uninstall();
    assert_eq!(live, 0);
    Ok(())
}

// Test-only peek at the kernel internals.
fn kernel_core(kernel: &crate::kernel::Kernel) -> std::rc::Rc<crate::kernel::core::Core> {
    kernel.core_for_tests()
}
