use greenrt::{faults_reported, install_fault_handlers, run, spawn};

/// Fork, run `child` in the child process and return its wait status.
fn in_child(child: impl FnOnce()) -> libc::c_int {
    unsafe {
        let pid = libc::fork();
        assert!(pid >= 0, "fork failed");
        if pid == 0 {
            child();
            libc::_exit(0);
        }
        let mut status = 0;
        assert_eq!(libc::waitpid(pid, &mut status, 0), pid);
        status
    }
}

#[test]
fn interrupt_terminates_with_conventional_status() {
    let status = in_child(|| unsafe {
        if install_fault_handlers().is_err() {
            libc::_exit(1);
        }
        libc::raise(libc::SIGINT);
        libc::_exit(2);
    });

    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 128 + libc::SIGINT);
}

#[test]
fn interrupt_inside_a_green_thread_terminates_the_process() {
    let status = in_child(|| unsafe {
        if install_fault_handlers().is_err() {
            libc::_exit(1);
        }
        let spawned = spawn(|| {
            libc::raise(libc::SIGINT);
        });
        if spawned.is_err() {
            libc::_exit(1);
        }
        let _ = run();
        libc::_exit(2);
    });

    assert!(libc::WIFEXITED(status));
    assert_eq!(libc::WEXITSTATUS(status), 128 + libc::SIGINT);
}

#[test]
fn fault_outside_green_threads_is_fatal() {
    let status = in_child(|| unsafe {
        if install_fault_handlers().is_err() {
            libc::_exit(1);
        }
        let before = faults_reported();
        libc::raise(libc::SIGFPE);
        // Only reached if the handler swallowed the fault
        libc::_exit(if faults_reported() > before { 3 } else { 2 });
    });

    assert!(libc::WIFSIGNALED(status));
    assert_eq!(libc::WTERMSIG(status), libc::SIGFPE);
}
