//! Integration tests for hw3d
//!
//! End-to-end hand-off scenarios driven from several threads, each thread
//! standing in for a user-space process, against the mock platform.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hw3d::mock::{msm_resources, probe_msm, MockPlatform};
use hw3d::{
    AccessState, Hw3d, Hw3dCommand, Hw3dConfig, Hw3dError, IoctlReply, MemoryMapper, Pid,
    RegionId, Role, REGS_LEN,
};

const REGION_LEN: usize = 0x10_0000;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn setup(timeout: Duration) -> (Arc<MockPlatform>, Arc<Hw3d<MockPlatform>>) {
    init_logger();
    probe_msm(Hw3dConfig::default().with_revoke_timeout(timeout)).unwrap()
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        thread::sleep(Duration::from_millis(2));
    }
}

fn assert_idle_and_powered_down(platform: &MockPlatform, hw3d: &Hw3d<MockPlatform>) {
    let status = hw3d.status();
    assert_eq!(status.state, AccessState::Idle);
    assert!(!status.hw_enabled());
    assert!(!status.wake_locked());
    assert_eq!(platform.clock_refcount("grp_clk"), 0);
    assert_eq!(platform.clock_refcount("imem_clk"), 0);
    assert!(!platform.wake_locked());
}

#[test]
fn test_cooperative_handoff() {
    let (platform, hw3d) = setup(Duration::from_secs(10));

    let a = hw3d.open(Role::Client, Pid(100)).unwrap();
    let regs = hw3d.mmap(&a, Pid(100), 0, REGION_LEN).unwrap();
    assert_eq!(platform.mappings_of(Pid(100)), 1);

    // Process A: wait for revoke, then close
    let a_thread = {
        let hw3d = Arc::clone(&hw3d);
        let a = Arc::clone(&a);
        thread::spawn(move || {
            let reply = hw3d.ioctl(&a, Pid(100), Hw3dCommand::WaitForRevoke);
            hw3d.flush(&a);
            hw3d.release(&a);
            reply
        })
    };

    let b = hw3d.open(Role::Client, Pid(200)).unwrap();
    assert_eq!(a_thread.join().unwrap().unwrap(), IoctlReply::Done);

    let status = hw3d.status();
    assert_eq!(status.state, AccessState::Owned);
    assert_eq!(status.owner, Some(Pid(200)));
    assert!(platform.terminated().is_empty());
    assert!(platform.mapping(regs.handle).is_none());
    assert!(!platform.wake_locked());
    assert_eq!(platform.clock_refcount("grp_clk"), 1);

    // B can map the registers A gave up
    assert!(hw3d.mmap(&b, Pid(200), 0, REGION_LEN).is_ok());

    hw3d.flush(&b);
    hw3d.release(&b);
    assert_idle_and_powered_down(&platform, &hw3d);
}

#[test]
fn test_unresponsive_owner_killed_and_memory_scrubbed() {
    let (platform, hw3d) = setup(Duration::from_millis(100));

    let a = hw3d.open(Role::Client, Pid(100)).unwrap();
    hw3d.mmap(&a, Pid(100), 0, REGION_LEN).unwrap();
    let smi = hw3d
        .mmap(&a, Pid(100), RegionId::Smi.map_offset(), REGION_LEN)
        .unwrap();
    assert!(platform.write_mapping(smi.handle, 0x40, b"secret"));

    // A never answers the revoke
    let started = Instant::now();
    let b = hw3d.open(Role::Client, Pid(200)).unwrap();
    assert!(started.elapsed() >= Duration::from_millis(100));

    assert_eq!(platform.terminated(), vec![Pid(100)]);
    assert_eq!(platform.mappings_of(Pid(100)), 0);
    assert_eq!(platform.pinned(Pid(100)), 0);
    assert_eq!(hw3d.status().owner, Some(Pid(200)));

    // A's blocking calls now fail, and its late close changes nothing
    assert!(matches!(
        hw3d.wait_for_interrupt(&a, Pid(100)),
        Err(Hw3dError::Interrupted)
    ));
    hw3d.flush(&a);
    hw3d.release(&a);
    assert_eq!(hw3d.status().owner, Some(Pid(200)));

    let regs = hw3d.mmap(&b, Pid(200), 0, REGION_LEN).unwrap();
    let smi = hw3d
        .mmap(&b, Pid(200), RegionId::Smi.map_offset(), REGION_LEN)
        .unwrap();
    assert!(platform.read_mapping(regs.handle, 0, 4).is_some());
    assert_eq!(platform.read_mapping(smi.handle, 0x40, 6).unwrap(), vec![0; 6]);
}

#[test]
fn test_release_racing_deadline_converges() {
    let (platform, hw3d) = setup(Duration::from_millis(1));

    for round in 0..50 {
        let client = hw3d.open(Role::Client, Pid(300)).unwrap();
        hw3d.suspend();

        if round % 2 == 0 {
            thread::sleep(Duration::from_millis(1));
        }
        hw3d.flush(&client);
        hw3d.release(&client);

        wait_until(|| hw3d.status().state == AccessState::Idle);
        assert_idle_and_powered_down(&platform, &hw3d);
        assert_eq!(platform.pinned(Pid(300)), 0);
        hw3d.resume();
    }
}

#[test]
fn test_concurrent_openers_one_wins() {
    let (_platform, hw3d) = setup(Duration::from_secs(10));
    let a = hw3d.open(Role::Client, Pid(100)).unwrap();

    let openers: Vec<_> = [Pid(200), Pid(300)]
        .into_iter()
        .map(|pid| {
            let hw3d = Arc::clone(&hw3d);
            thread::spawn(move || hw3d.open(Role::Client, pid).map(|file| (pid, file)))
        })
        .collect();

    wait_until(|| hw3d.status().open_waiters == 2);
    hw3d.flush(&a);
    hw3d.release(&a);

    let results: Vec<_> = openers.into_iter().map(|t| t.join().unwrap()).collect();
    let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
    let busy = results
        .iter()
        .filter(|r| matches!(r, Err(Hw3dError::Busy { .. })))
        .count();

    assert_eq!(winners.len(), 1);
    assert_eq!(busy, 1);
    assert_eq!(hw3d.status().owner, Some(winners[0].0));
}

#[test]
fn test_newest_opener_preempts_owner() {
    let (_platform, hw3d) = setup(Duration::from_secs(10));
    let a = hw3d.open(Role::Client, Pid(100)).unwrap();

    let b_thread = {
        let hw3d = Arc::clone(&hw3d);
        thread::spawn(move || hw3d.open(Role::Client, Pid(200)))
    };
    wait_until(|| hw3d.status().open_waiters == 1);
    hw3d.release(&a);
    let b = b_thread.join().unwrap().unwrap();

    // B only just got the GPU, and C takes it away again
    let c_thread = {
        let hw3d = Arc::clone(&hw3d);
        thread::spawn(move || hw3d.open(Role::Client, Pid(300)))
    };
    hw3d.wait_for_revoke(&b, Pid(200)).unwrap();
    assert_eq!(hw3d.status().state, AccessState::Revoking);

    hw3d.release(&b);
    let _c = c_thread.join().unwrap().unwrap();
    assert_eq!(hw3d.status().owner, Some(Pid(300)));
}

#[test]
fn test_interrupts_coalesce_for_owner() {
    let (platform, hw3d) = setup(Duration::from_secs(10));
    let client = hw3d.open(Role::Client, Pid(100)).unwrap();

    for _ in 0..8 {
        hw3d.handle_irq();
    }
    hw3d.ioctl(&client, Pid(100), Hw3dCommand::WaitForInterrupt)
        .unwrap();

    let waiter = {
        let hw3d = Arc::clone(&hw3d);
        let client = Arc::clone(&client);
        thread::spawn(move || hw3d.ioctl(&client, Pid(100), Hw3dCommand::WaitForInterrupt))
    };

    wait_until(|| platform.irq_enabled());
    assert!(!waiter.is_finished());

    hw3d.handle_irq();
    assert_eq!(waiter.join().unwrap().unwrap(), IoctlReply::Done);
    assert!(!platform.irq_enabled());
}

#[test]
fn test_double_map_then_remap_reads_zero() {
    let (platform, hw3d) = setup(Duration::from_secs(10));
    let client = hw3d.open(Role::Client, Pid(100)).unwrap();
    let ebi = RegionId::Ebi.map_offset();

    let first = hw3d.mmap(&client, Pid(100), ebi, REGION_LEN).unwrap();
    assert!(matches!(
        hw3d.mmap(&client, Pid(100), ebi, REGION_LEN),
        Err(Hw3dError::Busy { .. })
    ));

    assert!(platform.write_mapping(first.handle, 0, &[0x5a; 16]));
    platform.unmap(first.handle);
    hw3d.vma_close(&client, first.handle);

    let second = hw3d.mmap(&client, Pid(100), ebi, REGION_LEN).unwrap();
    assert_eq!(platform.read_mapping(second.handle, 0, 16).unwrap(), vec![0; 16]);
}

#[test]
fn test_suspend_resume_cycle() {
    let (platform, hw3d) = setup(Duration::from_secs(10));
    let a = hw3d.open(Role::Client, Pid(100)).unwrap();

    let a_thread = {
        let hw3d = Arc::clone(&hw3d);
        let a = Arc::clone(&a);
        thread::spawn(move || {
            hw3d.wait_for_revoke(&a, Pid(100))?;
            hw3d.release(&a);
            Ok::<_, Hw3dError>(())
        })
    };

    hw3d.suspend();
    a_thread.join().unwrap().unwrap();
    assert_idle_and_powered_down(&platform, &hw3d);

    let err = hw3d.open(Role::Client, Pid(200)).unwrap_err();
    assert_eq!(err.errno(), 1);

    hw3d.resume();
    assert!(!hw3d.status().suspending());
    assert!(hw3d.open(Role::Client, Pid(200)).is_ok());
}

#[test]
fn test_grant_path_independent_of_ownership() {
    let (platform, hw3d) = setup(Duration::from_secs(10));
    let master = hw3d.open(Role::Master, Pid(1)).unwrap();
    let _client = hw3d.open(Role::Client, Pid(100)).unwrap();

    hw3d.ioctl(&master, Pid(1), Hw3dCommand::GrantGpu).unwrap();
    assert_eq!(platform.clock_refcount("grp_clk"), 2);
    assert_eq!(platform.mappings_of(Pid(1)), 1);

    let handle = (1..=8)
        .map(hw3d::MappingHandle)
        .find(|h| platform.mapping(*h).is_some_and(|m| m.pid == Pid(1)))
        .unwrap();
    assert_eq!(platform.mapping(handle).unwrap().size, REGS_LEN);

    hw3d.release(&master);
    assert_eq!(platform.clock_refcount("grp_clk"), 1);
    assert_eq!(hw3d.status().owner, Some(Pid(100)));
}

#[test]
fn test_open_release_stress_single_owner() {
    let (platform, hw3d) = setup(Duration::from_secs(10));
    let holders = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let hw3d = Arc::clone(&hw3d);
            let holders = Arc::clone(&holders);
            thread::spawn(move || {
                let pid = Pid(1000 + n);
                let mut acquired = 0;
                while acquired < 25 {
                    match hw3d.open(Role::Client, pid) {
                        Ok(file) => {
                            assert_eq!(holders.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(hw3d.status().owner, Some(pid));
                            holders.fetch_sub(1, Ordering::SeqCst);
                            hw3d.flush(&file);
                            hw3d.release(&file);
                            acquired += 1;
                        }
                        Err(Hw3dError::Busy { .. }) => thread::yield_now(),
                        Err(e) => panic!("unexpected open failure: {}", e),
                    }
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    assert_idle_and_powered_down(&platform, &hw3d);
    assert!(platform.terminated().is_empty());
}

#[test]
fn test_probe_failure_leaves_nothing_behind() {
    init_logger();
    let platform = Arc::new(MockPlatform::new());
    let (regions, _) = msm_resources().resolve().unwrap();
    platform.fail_ioremap(regions[RegionId::Ebi.index()].start);

    let result = Hw3d::probe(
        Arc::clone(&platform),
        &msm_resources(),
        Hw3dConfig::default(),
    );

    assert!(result.is_err());
    assert!(platform.registered_nodes().is_empty());
    assert_eq!(platform.ioremapped_count(), 0);
    assert_eq!(platform.clocks_held(), 0);
    assert!(!platform.irq_claimed());
}

#[test]
fn test_missing_resource_reports_not_found() {
    init_logger();
    let platform = Arc::new(MockPlatform::new());
    let mut resources = msm_resources();
    resources.ebi = None;

    let err = Hw3d::probe(Arc::clone(&platform), &resources, Hw3dConfig::default())
        .err()
        .unwrap();
    assert_eq!(err.errno(), 19);
    assert_eq!(platform.clocks_held(), 0);
}
