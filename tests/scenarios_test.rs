//! End-to-end scenarios: several subsystems cooperating across many traps.

use vos_kernel::interrupts::KEYBOARD_LINE;
use vos_kernel::scheduler::TaskState;
use vos_kernel::syscall::SyscallId;
use vos_kernel::testing::{self, Driver, MemVfs, TEST_DATA};
use vos_kernel::KernelConfig;

/// Contract: a sleeping task yields the CPU and comes back only after its deadline.
/// Given: Tasks A and B at 1000 Hz.
/// When: A sleeps 50 ms.
/// Then: A is Sleeping with wake tick now + 50, B runs meanwhile, and A resumes after the deadline.
/// Failure Impact: Sleep would busy-wait or return early.
#[test]
fn test_scenario_sleep() {
    let mut d = Driver::new(KernelConfig::default());
    let a = d.spawn("a");
    let b = d.spawn("b");
    assert_eq!(d.tick(), a);

    let now = d.kernel.ticks();
    assert_eq!(d.syscall(SyscallId::Sleep, &[50]), b);
    assert_eq!(d.kernel.task_state(a), Some(TaskState::Sleeping { wake_tick: now + 50 }));

    let mut ran_b = 0;
    while d.tick() != a {
        assert!(d.kernel.ticks() < now + 60, "A overslept");
        if d.kernel.current_pid() == b {
            ran_b += 1;
        }
    }
    assert!(ran_b > 0);
    assert!(d.kernel.ticks() >= now + 50);
    assert_eq!(d.frame.eax, 0);
}

/// Contract: a parent spawned child's exit code is delivered through wait.
/// Given: A running from a loaded image, /bin/b in the VFS.
/// When: A spawns B, waits before B exits, and B exits with 7.
/// Then: A is Waiting, then resumes with 7, and B's slot is gone.
/// Failure Impact: Shells could not report child status.
#[test]
fn test_scenario_spawn_wait_exit() {
    let vfs = MemVfs::new()
        .with_file("/bin/a", &[0xEB, 0xFE])
        .with_file("/bin/b", &[0xF4]);
    let mut d = Driver::with_services(
        KernelConfig::default(),
        testing::test_services().with_vfs(vfs),
    );
    let a = d.kernel.spawn_path("/bin/a", &["/bin/a".into()]).expect("spawn a");
    assert_eq!(d.tick(), a);

    // A's image page is mapped writable by the loader; use it for the path.
    let path = vos_kernel::memory::vmm::USER_BASE + 0x100;
    d.poke_str(path, "/bin/b");
    let b = d.call(SyscallId::Spawn, &[path, 0, 0]).expect("spawn b");
    assert_eq!(d.kernel.task_count(), 3);

    assert_eq!(d.syscall(SyscallId::Wait, &[b]), b);
    assert_eq!(d.kernel.task_state(a), Some(TaskState::Waiting { target: b }));
    assert_eq!(d.kernel.task_info_by_pid(b).map(|i| i.name), Some("b".into()));

    assert_eq!(d.syscall(SyscallId::Exit, &[7]), a);
    assert_eq!(d.frame.eax, 7);
    assert_eq!(d.kernel.task_state(b), None);
    assert_eq!(d.kernel.task_count(), 2);
}

/// Contract: a null dereference kills only the offender; the system keeps going.
/// Given: Two user tasks, the first about to touch address 0.
/// When: The page fault arrives, then timer ticks and a console write follow.
/// Then: The report decodes present=0 user=1, the task exits with -14, and the other task keeps printing.
/// Failure Impact: One faulty program takes down the machine.
#[test]
fn test_scenario_null_dereference() {
    let mut d = Driver::new(KernelConfig::default());
    let bad = d.spawn("bad");
    let good = d.spawn("good");
    assert_eq!(d.tick(), bad);

    d.kernel.machine_mut().cr2 = 0;
    d.kernel.machine_mut().clear_output();
    d.frame = d.kernel.dispatch(testing::exception(&d.frame, 14, 0b100));
    assert_eq!(d.kernel.current_pid(), good);
    assert_eq!(d.kernel.task_state(bad), Some(TaskState::Zombie { exit_code: -14 }));
    let report = d.kernel.machine().console_text();
    assert!(report.contains("present=0 write=0 user=1"), "report: {}", report);

    for _ in 0..25 {
        assert_eq!(d.tick(), good);
    }
    d.poke(TEST_DATA, b"still here");
    assert_eq!(d.call(SyscallId::Write, &[1, TEST_DATA, 10]), Ok(10));
    assert!(d.kernel.machine().console_text().ends_with("still here"));
}

/// Contract: killing the running task takes effect on its next return path.
/// Given: Task B executing, task A runnable.
/// When: Kernel code kills B with 9 while B runs, then a keyboard IRQ arrives.
/// Then: B keeps running until the IRQ returns; the return path substitutes A and B is a zombie with 9.
/// Failure Impact: A kill could tear down a task in the middle of kernel work.
#[test]
fn test_scenario_kill_running_task() {
    let mut d = Driver::new(KernelConfig::default());
    let a = d.spawn("a");
    let b = d.spawn("b");
    assert_eq!(d.tick(), a);
    assert_eq!(d.syscall(SyscallId::Yield, &[]), b);

    d.kernel.kill(b, 9).expect("kill");
    assert_eq!(d.kernel.current_pid(), b);
    assert_eq!(d.kernel.task_state(b), Some(TaskState::Runnable));

    d.frame = d.kernel.dispatch(testing::irq(&d.frame, KEYBOARD_LINE));
    assert_eq!(d.kernel.current_pid(), a);
    assert_eq!(d.kernel.task_state(b), Some(TaskState::Zombie { exit_code: 9 }));
    assert!(testing::is_user_frame(&d.frame));
}
