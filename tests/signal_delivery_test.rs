//! Deferred kill delivery: requests are parked on the target and applied on
//! the return path right before it would resume.

use vos_kernel::scheduler::{TaskState, IDLE_PID};
use vos_kernel::syscall::{decode_result, Errno, SyscallId};
use vos_kernel::testing::{self, Driver};
use vos_kernel::KernelConfig;

fn driver() -> Driver {
    Driver::new(KernelConfig::default().with_quantum_ticks(100))
}

/// Contract: killing a sleeping task wakes it and terminates it on resume.
/// Given: Task A sleeping for a second, task B running.
/// When: B kills A with code 9, then yields.
/// Then: The kill is pending until A is selected; A then becomes a zombie with 9 and B resumes.
/// Failure Impact: A blocked task could never be killed.
#[test]
fn test_kill_sleeping_task() {
    let mut d = driver();
    let a = d.spawn("a");
    let b = d.spawn("b");
    assert_eq!(d.tick(), a);
    assert_eq!(d.syscall(SyscallId::Sleep, &[1000]), b);

    assert_eq!(d.call(SyscallId::Kill, &[a, 9]), Ok(0));
    assert!(d.kernel.has_pending_kill(a));
    assert_eq!(d.kernel.task_state(a), Some(TaskState::Runnable));

    assert_eq!(d.syscall(SyscallId::Yield, &[]), b);
    assert_eq!(d.kernel.task_state(a), Some(TaskState::Zombie { exit_code: 9 }));
    assert!(!d.kernel.has_pending_kill(a));
    assert_eq!(d.frame.eax, 0, "B resumes from its yield");
}

/// Contract: a killed waiter dies instead of collecting its target.
/// Given: A parent blocked in wait on a running child.
/// When: A third task kills the parent, the parent is scheduled, then the child exits.
/// Then: The parent dies with the kill code and the child stays a zombie.
/// Failure Impact: A waiter could be resurrected by the exit it was waiting for.
#[test]
fn test_kill_waiting_task() {
    let mut d = driver();
    let parent = d.spawn("parent");
    let child = d.spawn("child");
    let killer = d.spawn("killer");
    assert_eq!(d.tick(), parent);
    assert_eq!(d.syscall(SyscallId::Wait, &[child]), child);
    assert_eq!(d.syscall(SyscallId::Yield, &[]), killer);

    assert_eq!(d.call(SyscallId::Kill, &[parent, 77]), Ok(0));
    assert_eq!(d.kernel.task_state(parent), Some(TaskState::Runnable));
    assert_eq!(d.syscall(SyscallId::Yield, &[]), child, "parent died on resume");
    assert_eq!(d.kernel.task_state(parent), Some(TaskState::Zombie { exit_code: 77 }));

    d.syscall(SyscallId::Exit, &[1]);
    assert_eq!(d.kernel.task_state(child), Some(TaskState::Zombie { exit_code: 1 }));
}

/// Contract: killing yourself takes effect before returning to user mode.
/// Given: Two runnable tasks.
/// When: The current task kills its own pid.
/// Then: It never resumes; the other task runs and the killer is a zombie.
/// Failure Impact: A task could keep running after asking to die.
#[test]
fn test_self_kill_is_immediate() {
    let mut d = driver();
    let a = d.spawn("a");
    let b = d.spawn("b");
    assert_eq!(d.tick(), a);
    assert_eq!(d.syscall(SyscallId::Kill, &[a, 3]), b);
    assert_eq!(d.kernel.task_state(a), Some(TaskState::Zombie { exit_code: 3 }));
}

/// Contract: a kill on a runnable task is applied the next time it is selected.
/// Given: Tasks A and B with a two-tick quantum.
/// When: A kills B and the timer runs on.
/// Then: B never executes; A is running again after the boundary and B is a zombie.
/// Failure Impact: A killed task would run one more slice with its state intact.
#[test]
fn test_kill_applies_at_preemption() {
    let mut d = Driver::new(KernelConfig::default().with_quantum_ticks(2));
    let a = d.spawn("a");
    let b = d.spawn("b");
    assert_eq!(d.tick(), a);
    assert_eq!(d.call(SyscallId::Kill, &[b, 5]), Ok(0));
    assert_eq!(d.kernel.task_state(b), Some(TaskState::Runnable));

    assert_eq!(d.tick(), a);
    assert_eq!(d.tick(), a, "B was selected, killed, and A resumed");
    assert_eq!(d.kernel.task_state(b), Some(TaskState::Zombie { exit_code: 5 }));
    assert_eq!(d.kernel.task_info_by_pid(b).map(|i| i.cpu_ticks), Some(0));
}

/// Contract: a waiter collects the exit code a kill imposes.
/// Given: A kills B, then waits on it.
/// When: B is selected and terminated by the pending kill.
/// Then: A resumes from wait with B's kill code and B is reaped.
/// Failure Impact: Parents could not observe that a child was killed.
#[test]
fn test_wait_observes_kill_code() {
    let mut d = driver();
    let a = d.spawn("a");
    let b = d.spawn("b");
    assert_eq!(d.tick(), a);
    assert_eq!(d.call(SyscallId::Kill, &[b, 42]), Ok(0));

    assert_eq!(d.syscall(SyscallId::Wait, &[b]), a);
    assert_eq!(d.frame.eax, 42);
    assert_eq!(d.kernel.task_state(b), None);
}

/// Contract: kill validates its target.
/// Given: Idle, one kernel task, one zombie and one live user task.
/// When: Each is killed, plus a pid never handed out.
/// Then: Kernel tasks give EPERM; unknown pids and zombies give ESRCH.
/// Failure Impact: A user program could kill the idle task and hang the machine.
#[test]
fn test_kill_errors() {
    let mut d = driver();
    let a = d.spawn("a");
    let z = d.spawn("z");
    let k = d.kernel.spawn_kernel("kworker", 0x0010_0800).expect("kernel task");
    assert_eq!(d.tick(), a);
    assert_eq!(d.syscall(SyscallId::Yield, &[]), z);
    assert_eq!(d.syscall(SyscallId::Exit, &[0]), k);
    assert_eq!(d.syscall(SyscallId::Yield, &[]), a);

    assert_eq!(d.call(SyscallId::Kill, &[IDLE_PID, 1]), Err(Errno::EPERM));
    assert_eq!(d.call(SyscallId::Kill, &[k, 1]), Err(Errno::EPERM));
    assert_eq!(d.call(SyscallId::Kill, &[z, 1]), Err(Errno::ESRCH));
    assert_eq!(d.call(SyscallId::Kill, &[999, 1]), Err(Errno::ESRCH));
    assert_eq!(d.kernel.kill(0, 1), Err(Errno::ESRCH));
}

/// Contract: a crashing child reports its fault as the exit code.
/// Given: A parent waiting on a child.
/// When: The child dereferences a null pointer.
/// Then: The parent resumes with -14 and the child is reaped.
/// Failure Impact: A shell could not tell a segfault from a normal exit.
#[test]
fn test_fault_exit_code_reaches_waiter() {
    let mut d = driver();
    let parent = d.spawn("parent");
    let child = d.spawn("child");
    assert_eq!(d.tick(), parent);
    assert_eq!(d.syscall(SyscallId::Wait, &[child]), child);

    d.kernel.machine_mut().cr2 = 0;
    d.frame = d.kernel.dispatch(testing::exception(&d.frame, 14, 0b100));
    assert_eq!(d.kernel.current_pid(), parent);
    assert_eq!(d.frame.eax as i32, -14);
    assert_eq!(d.kernel.task_state(child), None);

    d.syscall(SyscallId::Wait, &[child]);
    assert_eq!(decode_result(d.frame.eax), Err(Errno::ECHILD));
}
