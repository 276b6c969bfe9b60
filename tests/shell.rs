use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::io::Write;
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::Duration;

fn spawn_shell(args: &[&str]) -> Child {
    Command::new(env!("CARGO_BIN_EXE_mysh"))
        .args(args)
        .env_remove("MYSH_LOG")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn mysh")
}

/// Runs the shell over `script` with an empty prompt so stdout holds only
/// command output.
fn run_script(extra_args: &[&str], script: &str) -> Output {
    let mut args = vec!["--prompt", ""];
    args.extend_from_slice(extra_args);
    let mut child = spawn_shell(&args);
    child
        .stdin
        .take()
        .unwrap()
        .write_all(script.as_bytes())
        .unwrap();
    child.wait_with_output().expect("wait for mysh")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_prompt_is_printed_before_each_line() {
    let output = Command::new(env!("CARGO_BIN_EXE_mysh"))
        .stdin(Stdio::null())
        .output()
        .unwrap();
    assert_eq!(stdout_of(&output), "mysh$ ");
    assert!(output.status.success());
}

#[test]
fn test_builtin_pipeline_prints_once() {
    let output = run_script(&[], "echo a | cat\n");
    assert_eq!(stdout_of(&output), "a\n");
    assert_eq!(stderr_of(&output), "");
}

#[test]
fn test_three_stage_pipeline() {
    let output = run_script(&[], "echo a b c | cat | wc\n");
    assert_eq!(
        stdout_of(&output),
        "word count 3\ncharacter count 6\nnewline count 1\n"
    );
}

#[test]
fn test_external_pipeline() {
    let output = run_script(&[], "echo hello | tr a-z A-Z\n");
    assert_eq!(stdout_of(&output), "HELLO\n");
}

#[test]
fn test_file_through_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "one two\nthree\n").unwrap();

    let output = run_script(&[], &format!("cat {} | wc\n", path.display()));
    assert_eq!(
        stdout_of(&output),
        "word count 3\ncharacter count 14\nnewline count 2\n"
    );
}

#[test]
fn test_variables_expand_before_dispatch() {
    let output = run_script(&[], "echo $X\nX=hi\necho $X there\nY=$X$X\necho $Y\n");
    assert_eq!(stdout_of(&output), "\nhi there\nhihi\n");
}

#[test]
fn test_unknown_command_is_reported_and_shell_continues() {
    let output = run_script(&[], "zzzqx\necho still here\n");
    assert_eq!(stderr_of(&output), "ERROR: Unknown command: zzzqx\n");
    assert_eq!(stdout_of(&output), "still here\n");
    assert!(output.status.success());
}

#[test]
fn test_unknown_command_inside_pipeline() {
    let output = run_script(&[], "zzzqx | cat\n");
    assert!(
        stderr_of(&output).contains("ERROR: Unknown command: zzzqx"),
        "{}",
        stderr_of(&output)
    );
}

#[test]
fn test_failing_stage_is_reported() {
    let output = run_script(&[], "false | echo ok\n");
    assert_eq!(stderr_of(&output), "ERROR: Command failed: false\n");
    assert_eq!(stdout_of(&output), "ok\n");
}

#[test]
fn test_empty_segment_spawns_nothing() {
    let output = run_script(&[], "echo a | | cat\necho ok\n");
    assert!(
        stderr_of(&output).starts_with("ERROR: Empty command in pipeline"),
        "{}",
        stderr_of(&output)
    );
    assert_eq!(stdout_of(&output), "ok\n");
}

#[test]
fn test_background_job_is_announced_and_reaped() {
    let output = run_script(&[], "true &\nsleep 0.5\nps\n");
    let stdout = stdout_of(&output);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{stdout}");
    assert!(lines[0].starts_with("[1] "), "{stdout}");
    assert_eq!(lines[1], "[1]+  Done true");
}

#[test]
fn test_background_pipeline() {
    let output = run_script(&[], "echo a | cat &\nsleep 0.5\n");
    let stdout = stdout_of(&output);
    let lines: Vec<&str> = stdout.lines().collect();
    assert!(lines.iter().any(|l| l.starts_with("[1] ")), "{stdout}");
    assert!(lines.contains(&"a"), "{stdout}");
    assert!(lines.contains(&"[1]+  Done echo a | cat"), "{stdout}");
}

#[test]
fn test_ps_lists_running_jobs() {
    let output = run_script(&[], "sleep 1 &\nps\n");
    let stdout = stdout_of(&output);
    let lines: Vec<&str> = stdout.lines().collect();
    let pid = lines[0].strip_prefix("[1] ").expect("job announcement");
    assert_eq!(lines[1], format!("sleep 1 {pid}"));
}

#[test]
fn test_background_capacity_is_enforced() {
    let output = run_script(&["--max-jobs", "1"], "sleep 1 &\nsleep 1 &\nps\n");
    assert_eq!(stderr_of(&output), "ERROR: Too many background processes\n");
    let stdout = stdout_of(&output);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{stdout}");
    assert!(lines[1].starts_with("sleep 1 "), "{stdout}");
}

#[test]
fn test_exit_stops_reading() {
    let output = run_script(&[], "exit\necho after\n");
    assert_eq!(stdout_of(&output), "");
    assert!(output.status.success());
}

#[test]
fn test_builtin_error_is_one_line() {
    let output = run_script(&[], "kill 1 999\necho next\n");
    let stderr = stderr_of(&output);
    assert_eq!(stderr.lines().count(), 1, "{stderr}");
    assert!(stderr.starts_with("ERROR: Invalid signal specified"), "{stderr}");
    assert_eq!(stdout_of(&output), "next\n");
}

#[test]
fn test_job_finished_while_idle_is_gone_from_ps() {
    let mut child = spawn_shell(&["--prompt", ""]);
    let mut stdin = child.stdin.take().unwrap();
    stdin.write_all(b"sleep 0.2 &\n").unwrap();
    thread::sleep(Duration::from_millis(1000));
    stdin.write_all(b"ps\n").unwrap();
    drop(stdin);

    let output = child.wait_with_output().unwrap();
    let stdout = stdout_of(&output);
    let lines: Vec<&str> = stdout.lines().collect();
    assert_eq!(lines.len(), 2, "{stdout}");
    assert!(lines[0].starts_with("[1] "), "{stdout}");
    assert_eq!(lines[1], "[1]+  Done sleep 0.2");
}

#[test]
fn test_interrupt_at_prompt_shows_fresh_prompt() {
    let mut child = spawn_shell(&[]);
    let mut stdin = child.stdin.take().unwrap();
    thread::sleep(Duration::from_millis(500));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();
    thread::sleep(Duration::from_millis(200));
    stdin.write_all(b"echo x\n").unwrap();
    drop(stdin);

    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(stdout_of(&output), "mysh$ \nmysh$ x\nmysh$ ");
}

#[test]
fn test_exit_with_background_marker_ends_session() {
    let output = run_script(&[], "exit &\necho after\n");
    assert_eq!(stdout_of(&output), "");
    assert!(output.status.success());
}
