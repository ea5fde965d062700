//! Integration tests for spawner-rs
//!
//! Tests that spawn real sandboxed children need unprivileged user
//! namespaces (and fork the test binary), so they are marked #[ignore] and
//! can be run with:
//!   cargo test -- --ignored

use std::error::Error;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use spawner_rs::{
    ArgValue, ChildProcess, NetworkConfig, Registry, SandboxConfig, SandboxStep, Spawner,
    SpawnerBuilder, SpawnerError,
};

/// Each test forks its own spawner; serialize them so fork never races
/// another test's threads through the same address space.
static INTEGRATION_TEST_LOCK: Mutex<()> = Mutex::new(());

/// Set by the preload inside the spawner process; children inherit the
/// post-preload state copy-on-write.
static PRELOADED: AtomicBool = AtomicBool::new(false);

fn preload_marker() -> Result<(), Box<dyn Error>> {
    PRELOADED.store(true, Ordering::SeqCst);
    Ok(())
}

fn preload_failing() -> Result<(), Box<dyn Error>> {
    Err("deliberate preload failure".into())
}

/// Single entry point; the first argument selects the behavior under test.
fn test_main(args: Vec<ArgValue>) -> Result<(), Box<dyn Error>> {
    let mut args = args.into_iter();
    let command = match args.next() {
        Some(ArgValue::Text(command)) => command,
        other => return Err(format!("expected command, got {other:?}").into()),
    };

    match command.as_str() {
        "echo" => {
            for arg in args {
                if let ArgValue::Text(text) = arg {
                    println!("{text}");
                }
            }
            Ok(())
        }
        "cat" => {
            let mut input = Vec::new();
            std::io::stdin().read_to_end(&mut input)?;
            std::io::stdout().write_all(&input)?;
            Ok(())
        }
        "env" => {
            let mut vars: Vec<_> = std::env::vars().collect();
            vars.sort();
            for (key, value) in vars {
                println!("{key}={value}");
            }
            Ok(())
        }
        "pid" => {
            println!("{}", std::process::id());
            Ok(())
        }
        "fd-probe" => {
            // Nothing in [3, 1024) may be open that the entry did not
            // create itself
            for fd in 3..1024 {
                if unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1 {
                    return Err(format!("fd {fd} is unexpectedly open").into());
                }
            }
            println!("fds-clean");
            Ok(())
        }
        "caps" => {
            let status = std::fs::read_to_string("/proc/self/status")?;
            for line in status.lines() {
                if line.starts_with("CapEff:") || line.starts_with("NoNewPrivs:") {
                    println!("{line}");
                }
            }
            Ok(())
        }
        "net" => {
            match std::net::TcpStream::connect(("1.1.1.1", 80)) {
                Ok(_) => Err("connect should not succeed without networking".into()),
                Err(e) if e.raw_os_error() == Some(libc::ENETUNREACH) => {
                    println!("unreachable");
                    Ok(())
                }
                Err(e) => Err(format!("expected ENETUNREACH, got {e}").into()),
            }
        }
        "net-veth" => {
            let gateway = match args.next() {
                Some(ArgValue::Text(ip)) => ip,
                other => return Err(format!("expected gateway ip, got {other:?}").into()),
            };
            let timeout = Duration::from_secs(3);

            // Nothing listens on the gateway, so a refused connect proves
            // the packet reached it and an RST came back
            let gateway_addr: std::net::SocketAddr = format!("{gateway}:19999").parse()?;
            match std::net::TcpStream::connect_timeout(&gateway_addr, timeout) {
                Ok(_) => return Err("unexpected listener on the gateway".into()),
                Err(e) if e.raw_os_error() == Some(libc::ECONNREFUSED) => {
                    println!("gateway-reachable");
                }
                Err(e) => return Err(format!("gateway not reachable: {e}").into()),
            }

            // No NAT is configured for the test, so addresses beyond the
            // veth subnet must stay out of reach one way or another
            let private_addr: std::net::SocketAddr = "10.2.3.4:5432".parse()?;
            match std::net::TcpStream::connect_timeout(&private_addr, timeout) {
                Ok(_) => Err("reached an address beyond the veth subnet".into()),
                Err(_) => {
                    println!("private-blocked");
                    Ok(())
                }
            }
        }
        "exe-probe" => {
            // Inside a chroot with no /proc, the exe symlink cannot exist
            match std::fs::File::open("/proc/self/exe") {
                Ok(_) => Err("/proc/self/exe is visible inside the chroot".into()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    println!("confined");
                    Ok(())
                }
                Err(e) => Err(format!("expected ENOENT, got {e}").into()),
            }
        }
        "setuid" => {
            // The seccomp filter kills this before the kernel ever sees it
            unsafe { libc::setuid(2) };
            println!("setuid survived");
            Ok(())
        }
        "sleep-tree" => {
            // A grandchild that outlives its parent unless the namespace
            // collapses
            if unsafe { libc::fork() } == 0 {
                std::thread::sleep(Duration::from_secs(600));
                std::process::exit(0);
            }
            std::thread::sleep(Duration::from_secs(600));
            Ok(())
        }
        "preload-check" => {
            println!("preloaded={}", PRELOADED.load(Ordering::SeqCst));
            Ok(())
        }
        "fail" => Err("deliberate failure".into()),
        "panic" => panic!("deliberate panic"),
        other => Err(format!("unknown command '{other}'").into()),
    }
}

fn test_registry() -> Registry {
    Registry::new()
        .entry("tests.main", test_main)
        .preload("marker", preload_marker)
        .preload("failing", preload_failing)
}

fn open_spawner() -> Spawner {
    SpawnerBuilder::new(test_registry(), "tests.main")
        .env("LC_ALL", "C.UTF-8")
        .env("TEST_ENV", "yes")
        .preload("marker")
        .open()
        .expect("spawner should start")
}

fn text_args(words: &[&str]) -> Vec<ArgValue> {
    words.iter().map(|w| ArgValue::from(*w)).collect()
}

/// Spawn, feed stdin, drain both pipes, wait. Returns (status, stdout,
/// stderr).
fn spawn_and_communicate(
    spawner: &mut Spawner,
    args: &[ArgValue],
    config: &SandboxConfig,
    stdin: &[u8],
) -> (WaitStatus, String, String) {
    let mut child = spawner
        .spawn(args, "spawner-test", config)
        .expect("spawn should succeed");

    let mut stdin_pipe = child.stdin.take().unwrap();
    stdin_pipe.write_all(stdin).unwrap();
    drop(stdin_pipe);

    let mut stdout = String::new();
    child
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut stdout)
        .unwrap();
    let mut stderr = String::new();
    child
        .stderr
        .take()
        .unwrap()
        .read_to_string(&mut stderr)
        .unwrap();

    let status = child.wait().unwrap();
    (status, stdout, stderr)
}

fn assert_exited_zero(status: WaitStatus, stderr: &str) {
    assert_eq!(
        status,
        WaitStatus::Exited(pid_of(status), 0),
        "unexpected status {status:?}, stderr: {stderr}"
    );
}

fn pid_of(status: WaitStatus) -> nix::unistd::Pid {
    match status {
        WaitStatus::Exited(pid, _) | WaitStatus::Signaled(pid, _, _) => pid,
        other => panic!("status without pid: {other:?}"),
    }
}

fn open_fd_count() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .count()
        .saturating_sub(1)
}

// Tests below run everywhere: they exercise startup and shutdown, which
// need fork but no namespaces.

#[test]
fn test_open_and_close() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let spawner = open_spawner();
    assert!(!spawner.is_poisoned());
    spawner.close().expect("close should reap the spawner");
}

#[test]
fn test_fd_count_restored_after_close() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let baseline = open_fd_count();
    let spawner = open_spawner();
    assert_eq!(open_fd_count(), baseline + 1, "handle owns exactly one fd");
    spawner.close().unwrap();
    assert_eq!(open_fd_count(), baseline);
}

#[test]
fn test_preload_failure_surfaces_as_startup_error() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = SpawnerBuilder::new(test_registry(), "tests.main")
        .preload("failing")
        .open()
        .expect("open itself succeeds; the failure is observed on first use");

    let err = spawner
        .spawn(&text_args(&["echo"]), "t", &SandboxConfig::default())
        .unwrap_err();
    assert!(matches!(err, SpawnerError::Startup(_)), "got {err:?}");
    assert!(spawner.is_poisoned());
}

#[test]
fn test_unknown_entry_point_fails_before_fork() {
    let err = SpawnerBuilder::new(test_registry(), "tests.missing")
        .open()
        .unwrap_err();
    assert!(matches!(err, SpawnerError::InvalidConfig(_)));
}

// Tests below spawn real sandboxed children and need unprivileged user
// namespaces. Run with: cargo test -- --ignored

#[test]
#[ignore]
fn test_happy_path_stdout() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["echo", "hello"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "hello\n");
    assert_eq!(stderr, "");
}

#[test]
#[ignore]
fn test_stdin_reaches_child() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["cat"]),
        &SandboxConfig::default(),
        b"through the pipe",
    );
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "through the pipe");
}

#[test]
#[ignore]
fn test_second_spawn_is_fast() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, _, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["echo", "warmup"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_exited_zero(status, &stderr);

    let start = Instant::now();
    let child = spawner
        .spawn(
            &text_args(&["echo", "timed"]),
            "t2",
            &SandboxConfig::default(),
        )
        .unwrap();
    let elapsed = start.elapsed();
    drain_and_reap(child);
    assert!(elapsed < Duration::from_millis(500), "spawn took {elapsed:?}");
}

#[test]
#[ignore]
fn test_environment_is_fully_replaced() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["env"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "LC_ALL=C.UTF-8\nTEST_ENV=yes\n");
}

#[test]
#[ignore]
fn test_child_sees_itself_as_pid_one() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["pid"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "1\n");
}

#[test]
#[ignore]
fn test_child_fd_hygiene() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["fd-probe"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "fds-clean\n");
}

#[test]
#[ignore]
fn test_parent_fd_hygiene_per_spawn() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let baseline = open_fd_count();
    let child = spawner
        .spawn(
            &text_args(&["echo", "x"]),
            "t",
            &SandboxConfig::default(),
        )
        .unwrap();
    assert_eq!(open_fd_count(), baseline + 3);
    drain_and_reap(child);
    assert_eq!(open_fd_count(), baseline);
}

#[test]
#[ignore]
fn test_capabilities_dropped_and_no_new_privs() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["caps"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_exited_zero(status, &stderr);
    assert!(
        stdout.contains("CapEff:\t0000000000000000"),
        "capabilities not empty: {stdout}"
    );
    assert!(
        stdout.contains("NoNewPrivs:\t1"),
        "no_new_privs not set: {stdout}"
    );
}

#[test]
#[ignore]
fn test_network_unreachable_without_config() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["net"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "unreachable\n");
}

#[test]
#[ignore]
fn test_network_config_reaches_gateway_only() {
    // On top of user namespaces this needs CAP_NET_ADMIN in the test
    // process's network namespace: the spawner creates the veth pair there.
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let config = SandboxConfig {
        network: Some(NetworkConfig {
            kernel_veth_name: "vethspwn-k".to_string(),
            child_veth_name: "vethspwn-c".to_string(),
            kernel_ipv4: "192.168.123.1".parse().unwrap(),
            child_ipv4: "192.168.123.2".parse().unwrap(),
            child_ipv4_gateway: "192.168.123.1".parse().unwrap(),
        }),
        ..Default::default()
    };
    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["net-veth", "192.168.123.1"]),
        &config,
        b"",
    );
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "gateway-reachable\nprivate-blocked\n");
}

#[test]
#[ignore]
fn test_seccomp_kills_forbidden_syscall() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let mut child = spawner
        .spawn(
            &text_args(&["setuid"]),
            "t",
            &SandboxConfig::default(),
        )
        .unwrap();
    let mut stdout = String::new();
    child
        .stdout
        .take()
        .unwrap()
        .read_to_string(&mut stdout)
        .unwrap();
    let status = child.wait().unwrap();

    // The supervisor mirrors a SIGSYS death as 128 + signal
    assert_eq!(
        status,
        WaitStatus::Exited(pid_of(status), 128 + libc::SIGSYS),
        "expected SIGSYS kill, stdout: {stdout}"
    );
    assert_eq!(stdout, "", "setuid must not return");
}

#[test]
#[ignore]
fn test_skip_sandbox_seccomp_lets_setuid_fail_softly() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    // Without the filter the syscall reaches the kernel, which refuses it
    // (no capabilities), and the entry returns normally
    let config = SandboxConfig {
        skip_sandbox_seccomp: true,
        ..Default::default()
    };
    let (status, stdout, stderr) =
        spawn_and_communicate(&mut spawner, &text_args(&["setuid"]), &config, b"");
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "setuid survived\n");
}

#[test]
#[ignore]
fn test_chroot_confinement() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let jail = tempfile::tempdir().unwrap();
    // so the child can chdir into its chroot
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(jail.path(), std::fs::Permissions::from_mode(0o755)).unwrap();

    let config = SandboxConfig {
        chroot_dir: Some(jail.path().to_path_buf()),
        ..Default::default()
    };
    let (status, stdout, stderr) =
        spawn_and_communicate(&mut spawner, &text_args(&["exe-probe"]), &config, b"");
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "confined\n");
}

#[test]
#[ignore]
fn test_missing_chroot_dir_reports_filesystem_step() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let config = SandboxConfig {
        chroot_dir: Some("/nonexistent/spawner-jail".into()),
        ..Default::default()
    };
    let (status, _, stderr) =
        spawn_and_communicate(&mut spawner, &text_args(&["echo", "x"]), &config, b"");
    assert_eq!(
        ChildProcess::sandbox_failure(&status),
        Some(SandboxStep::Filesystem),
        "status {status:?}, stderr: {stderr}"
    );
}

#[test]
#[ignore]
fn test_subtree_kill_collapses_namespace() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let mut child = spawner
        .spawn(
            &text_args(&["sleep-tree"]),
            "t",
            &SandboxConfig::default(),
        )
        .unwrap();
    // Give the tree a moment to fork its grandchild
    std::thread::sleep(Duration::from_millis(300));

    let start = Instant::now();
    child.kill().unwrap();
    let status = child.wait().unwrap();
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "kill did not collapse the subtree promptly"
    );
    assert_eq!(status, WaitStatus::Signaled(pid_of(status), Signal::SIGKILL, false));

    // Both pipes must reach EOF: every process holding the write ends died
    let mut rest = Vec::new();
    child.stdout.take().unwrap().read_to_end(&mut rest).unwrap();
    child.stderr.take().unwrap().read_to_end(&mut rest).unwrap();
}

#[test]
#[ignore]
fn test_entry_error_leaves_spawner_serving() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, _, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["fail"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_eq!(status, WaitStatus::Exited(pid_of(status), 1));
    assert!(stderr.contains("deliberate failure"));

    // The spawner lives on and serves the next request
    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["echo", "still alive"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "still alive\n");
}

#[test]
#[ignore]
fn test_entry_panic_goes_to_stderr() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    let (status, _, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["panic"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_eq!(status, WaitStatus::Exited(pid_of(status), 1));
    assert!(stderr.contains("deliberate panic"));
}

#[test]
#[ignore]
fn test_preload_state_is_inherited() {
    let _lock = INTEGRATION_TEST_LOCK.lock().unwrap();
    let mut spawner = open_spawner();

    // PRELOADED is false in this process and in any child of a spawner
    // opened without the preload; the marker preload flips it in the
    // spawner, and the child sees the flipped copy.
    assert!(!PRELOADED.load(Ordering::SeqCst));
    let (status, stdout, stderr) = spawn_and_communicate(
        &mut spawner,
        &text_args(&["preload-check"]),
        &SandboxConfig::default(),
        b"",
    );
    assert_exited_zero(status, &stderr);
    assert_eq!(stdout, "preloaded=true\n");
}

fn drain_and_reap(mut child: ChildProcess) {
    let mut sink = Vec::new();
    child.stdout.take().unwrap().read_to_end(&mut sink).unwrap();
    child.stderr.take().unwrap().read_to_end(&mut sink).unwrap();
    let _ = child.wait();
}
