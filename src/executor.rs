//! Running shell commands inside a guest through the guest operations API.
//!
//! The command is written to a throwaway script under `/tmp`, started with
//! `StartProgramInGuest` with output redirected to a sibling `.out` file,
//! polled until it reports an end time, and its output is read back.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::GuestCredentials;
use crate::error::VguestError;
use crate::guest::ensure_tools_running;
use crate::locator::{VmHandle, find_vm_by_name};
use crate::vim::{GuestAuth, ProgramSpec, VimApi};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_OUTPUT_LINES: usize = 5000;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const SCRIPT_DIR: &str = "/tmp";
const SCRIPT_PREFIX: &str = "remote_command_";
const GUEST_SHELL: &str = "/bin/bash";

/// Output of a finished guest command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub stdout: String,
    pub exit_code: Option<i32>,
}

/// A launched guest process and the files backing it.
#[derive(Debug, Clone)]
pub struct GuestProcess {
    pub pid: i64,
    pub script_path: String,
    pub output_path: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub exit_code: Option<i32>,
}

/// Per-invocation guest file names. The random suffix keeps concurrent runs
/// against the same guest apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptPaths {
    pub script: String,
    pub output: String,
}

impl ScriptPaths {
    pub fn generate() -> Self {
        let suffix = format!("{:016x}", rand::random::<u64>());
        Self {
            script: format!("{SCRIPT_DIR}/{SCRIPT_PREFIX}{suffix}.sh"),
            output: format!("{SCRIPT_DIR}/{SCRIPT_PREFIX}{suffix}.out"),
        }
    }

    /// Arguments for `/bin/bash` that run the script with all output captured.
    fn launch_spec(&self) -> ProgramSpec {
        ProgramSpec {
            program_path: GUEST_SHELL.to_string(),
            arguments: format!(
                "-c \"{GUEST_SHELL} {} > {} 2>&1\"",
                self.script, self.output
            ),
        }
    }
}

/// Script body: the command verbatim, exiting with its status.
pub fn script_content(command: &str) -> String {
    format!("#!/bin/bash\n{command}\nexit $?\n")
}

/// Keep at most `max` lines, preserving line endings.
pub fn cap_lines(text: &str, max: usize) -> String {
    text.split_inclusive('\n').take(max).collect()
}

pub struct GuestCommandExecutor<'a, A> {
    api: &'a A,
    auth: GuestAuth,
    poll_interval: Duration,
    max_output_lines: usize,
}

impl<'a, A: VimApi> GuestCommandExecutor<'a, A> {
    pub fn new(api: &'a A, credentials: &GuestCredentials) -> Self {
        Self {
            api,
            auth: GuestAuth::from(credentials),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_output_lines(mut self, lines: usize) -> Self {
        self.max_output_lines = lines;
        self
    }

    /// Run `command` in the guest of `vm_name` and return its output.
    ///
    /// On timeout the guest process keeps running and its script and output
    /// files are left in place. Any other failure after the VM is resolved,
    /// including a failed script delete once output was read, discards the
    /// output and makes one best-effort pass over both files.
    pub async fn run(
        &self,
        vm_name: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, VguestError> {
        let vm = find_vm_by_name(self.api, vm_name).await?;
        ensure_tools_running(self.api, &vm).await?;

        let paths = ScriptPaths::generate();
        match self.execute(&vm, &paths, command, timeout).await {
            Ok(result) => Ok(result),
            Err(e @ VguestError::Timeout { .. }) => Err(e),
            Err(e) => {
                self.cleanup(&vm, &paths).await;
                Err(e.into_execution())
            }
        }
    }

    async fn execute(
        &self,
        vm: &VmHandle,
        paths: &ScriptPaths,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, VguestError> {
        let script = script_content(command);
        self.api
            .upload_guest_file(&vm.moref, &self.auth, &paths.script, script.as_bytes())
            .await?;

        let deadline = Instant::now() + timeout;
        let pid = self
            .api
            .start_program(&vm.moref, &self.auth, &paths.launch_spec())
            .await?;
        tracing::info!(vm = %vm.name, pid, script = %paths.script, "started guest command");

        let process = self.wait_for_exit(vm, paths, pid, deadline, timeout).await?;
        tracing::info!(
            vm = %vm.name,
            pid,
            exit_code = ?process.exit_code,
            "guest command finished"
        );

        let raw = self
            .api
            .download_guest_file(
                &vm.moref,
                &self.auth,
                &process.output_path,
                self.max_output_lines,
            )
            .await?;
        let stdout = cap_lines(&String::from_utf8_lossy(&raw), self.max_output_lines);

        self.api
            .delete_guest_file(&vm.moref, &self.auth, &process.script_path)
            .await?;
        // Output is already captured; a leftover .out file is not worth failing for.
        if let Err(e) = self
            .api
            .delete_guest_file(&vm.moref, &self.auth, &process.output_path)
            .await
        {
            tracing::debug!(path = %process.output_path, "could not remove output file: {e}");
        }

        Ok(CommandResult {
            stdout,
            exit_code: process.exit_code,
        })
    }

    async fn wait_for_exit(
        &self,
        vm: &VmHandle,
        paths: &ScriptPaths,
        pid: i64,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<GuestProcess, VguestError> {
        loop {
            let info = self
                .api
                .list_processes(&vm.moref, &self.auth, &[pid])
                .await?
                .into_iter()
                .find(|p| p.pid == pid)
                .ok_or_else(|| VguestError::Execution {
                    message: format!("guest process {pid} is no longer listed"),
                })?;

            if info.end_time.is_some() {
                return Ok(GuestProcess {
                    pid,
                    script_path: paths.script.clone(),
                    output_path: paths.output.clone(),
                    start_time: info.start_time,
                    end_time: info.end_time,
                    exit_code: info.exit_code,
                });
            }

            if Instant::now() >= deadline {
                tracing::warn!(vm = %vm.name, pid, "guest command timed out, leaving it running");
                return Err(VguestError::Timeout {
                    seconds: timeout.as_secs(),
                    hint: format!(
                        "guest process {pid} was left running; {} and {} were not removed",
                        paths.script, paths.output
                    ),
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Best-effort removal of the invocation's files after a failure.
    /// Never returns an error.
    async fn cleanup(&self, vm: &VmHandle, paths: &ScriptPaths) {
        for path in [&paths.script, &paths.output] {
            if let Err(e) = self.api.delete_guest_file(&vm.moref, &self.auth, path).await {
                tracing::debug!(%path, "cleanup after failure: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeVim;

    fn creds() -> GuestCredentials {
        GuestCredentials {
            username: "root".into(),
            password: "toor".into(),
        }
    }

    fn script_deletes(fake: &FakeVim) -> usize {
        fake.calls()
            .deletes
            .iter()
            .filter(|p| p.ends_with(".sh"))
            .count()
    }

    #[test]
    fn script_paths_are_random_hex_under_tmp() {
        let paths = ScriptPaths::generate();
        let suffix = paths
            .script
            .strip_prefix("/tmp/remote_command_")
            .and_then(|s| s.strip_suffix(".sh"))
            .unwrap();
        assert_eq!(suffix.len(), 16);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(paths.output, format!("/tmp/remote_command_{suffix}.out"));
    }

    #[test]
    fn script_paths_do_not_collide() {
        let a = ScriptPaths::generate();
        let b = ScriptPaths::generate();
        assert_ne!(a.script, b.script);
    }

    #[test]
    fn script_exits_with_command_status() {
        assert_eq!(
            script_content("uptime && df -h"),
            "#!/bin/bash\nuptime && df -h\nexit $?\n"
        );
    }

    #[test]
    fn cap_lines_keeps_first_lines() {
        assert_eq!(cap_lines("a\nb\nc\n", 2), "a\nb\n");
        assert_eq!(cap_lines("a\nb", 5), "a\nb");
        assert_eq!(cap_lines("", 5), "");
    }

    #[tokio::test]
    async fn tools_not_running_never_launches() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.set_tools_status(Some("guestToolsNotRunning"));
        let exec = GuestCommandExecutor::new(&fake, &creds());

        let err = exec.run("web-01", "uptime", DEFAULT_TIMEOUT).await.unwrap_err();
        match err {
            VguestError::ToolsNotRunning { vm, status } => {
                assert_eq!(vm, "web-01");
                assert_eq!(status, "guestToolsNotRunning");
            }
            other => panic!("expected ToolsNotRunning, got {other:?}"),
        }
        let calls = fake.calls();
        assert!(calls.starts.is_empty());
        assert!(calls.uploads.is_empty());
        assert!(calls.deletes.is_empty());
    }

    #[tokio::test]
    async fn missing_guest_info_counts_as_not_running() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.set_tools_status(None);
        let exec = GuestCommandExecutor::new(&fake, &creds());
        assert!(matches!(
            exec.run("web-01", "uptime", DEFAULT_TIMEOUT).await.unwrap_err(),
            VguestError::ToolsNotRunning { .. }
        ));
        assert!(fake.calls().starts.is_empty());
    }

    #[tokio::test]
    async fn unknown_vm_propagates_not_found() {
        let fake = FakeVim::with_vms(&["web-01"]);
        let exec = GuestCommandExecutor::new(&fake, &creds());
        assert!(matches!(
            exec.run("db-01", "uptime", DEFAULT_TIMEOUT).await.unwrap_err(),
            VguestError::VmNotFound { .. }
        ));
        assert_eq!(fake.calls().views_destroyed, 1);
    }

    #[tokio::test]
    async fn completed_command_returns_stdout_and_deletes_script_once() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.set_stdout(" 08:00:01 up 3 days\n", 0);
        let exec = GuestCommandExecutor::new(&fake, &creds());

        let result = exec.run("web-01", "uptime", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(result.stdout, " 08:00:01 up 3 days\n");
        assert_eq!(result.exit_code, Some(0));

        let calls = fake.calls();
        assert_eq!(calls.uploads.len(), 1);
        let (script_path, body) = &calls.uploads[0];
        assert_eq!(body, b"#!/bin/bash\nuptime\nexit $?\n");

        assert_eq!(calls.starts.len(), 1);
        assert_eq!(calls.starts[0].program_path, "/bin/bash");
        assert!(calls.starts[0].arguments.contains(script_path.as_str()));

        assert_eq!(script_deletes(&fake), 1);
        assert_eq!(calls.deletes[0], *script_path);
    }

    #[tokio::test]
    async fn non_zero_exit_is_reported_not_raised() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.set_stdout("ls: cannot access '/nope'\n", 2);
        let exec = GuestCommandExecutor::new(&fake, &creds());
        let result = exec.run("web-01", "ls /nope", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(result.exit_code, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn polls_until_end_time_appears() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.finish_after(4);
        let exec = GuestCommandExecutor::new(&fake, &creds());

        let start = Instant::now();
        exec.run("web-01", "sleep 1", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(fake.calls().list_calls, 4);
        assert_eq!(start.elapsed(), DEFAULT_POLL_INTERVAL * 3);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_poll_interval_is_honoured() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.finish_after(3);
        let exec = GuestCommandExecutor::new(&fake, &creds())
            .with_poll_interval(Duration::from_secs(2));

        let start = Instant::now();
        exec.run("web-01", "sleep 3", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_after_budget_leaves_script_in_place() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.never_finish();
        let exec = GuestCommandExecutor::new(&fake, &creds());
        let timeout = Duration::from_secs(5);

        let start = Instant::now();
        let err = exec.run("web-01", "sleep 999", timeout).await.unwrap_err();
        let elapsed = start.elapsed();

        assert!(matches!(err, VguestError::Timeout { seconds: 5, .. }));
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + DEFAULT_POLL_INTERVAL);
        let calls = fake.calls();
        assert!(calls.deletes.is_empty());
        assert!(calls.downloads.is_empty());
    }

    #[tokio::test]
    async fn concurrent_runs_use_distinct_scripts() {
        let fake = FakeVim::with_vms(&["web-01"]);
        let exec = GuestCommandExecutor::new(&fake, &creds());

        let (a, b) = tokio::join!(
            exec.run("web-01", "hostname", DEFAULT_TIMEOUT),
            exec.run("web-01", "whoami", DEFAULT_TIMEOUT),
        );
        a.unwrap();
        b.unwrap();

        let calls = fake.calls();
        assert_eq!(calls.uploads.len(), 2);
        assert_ne!(calls.uploads[0].0, calls.uploads[1].0);
    }

    #[tokio::test]
    async fn launch_fault_is_api_error_and_cleans_up() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.fail_start("InvalidGuestLogin: Failed to authenticate with the guest operating system");
        let exec = GuestCommandExecutor::new(&fake, &creds());

        let err = exec.run("web-01", "uptime", DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, VguestError::Api { ref message } if message.contains("InvalidGuestLogin")));
        assert_eq!(script_deletes(&fake), 1);
    }

    #[tokio::test]
    async fn upload_fault_still_attempts_cleanup() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.fail_upload("GuestPermissionDenied: /tmp is not writable");
        let exec = GuestCommandExecutor::new(&fake, &creds());

        let err = exec.run("web-01", "uptime", DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, VguestError::Api { .. }));
        assert!(fake.calls().starts.is_empty());
        assert_eq!(script_deletes(&fake), 1);
    }

    #[tokio::test]
    async fn transport_failure_becomes_execution_error() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.fail_download_transport();
        let exec = GuestCommandExecutor::new(&fake, &creds());

        let err = exec.run("web-01", "uptime", DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(matches!(err, VguestError::Execution { ref message } if message.contains("connection reset")));
        assert_eq!(script_deletes(&fake), 1);
    }

    #[tokio::test]
    async fn script_already_gone_is_api_error_with_one_cleanup_pass() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.set_stdout("done\n", 0);
        fake.script_removed_by_command();
        let exec = GuestCommandExecutor::new(&fake, &creds());

        let err = exec
            .run("web-01", "rm -f /tmp/remote_command_*", DEFAULT_TIMEOUT)
            .await
            .unwrap_err();

        let calls = fake.calls();
        let script = calls.uploads[0].0.clone();
        let output = script.replace(".sh", ".out");
        match err {
            VguestError::Api { message } => assert_eq!(message, format!("FileNotFound: {script}")),
            other => panic!("expected Api, got {other:?}"),
        }
        // the failed delete, then cleanup of both files
        assert_eq!(calls.deletes, vec![script.clone(), script, output]);
    }

    #[tokio::test]
    async fn missing_output_file_is_api_error() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.output_missing();
        let exec = GuestCommandExecutor::new(&fake, &creds());

        let err = exec.run("web-01", "uptime", DEFAULT_TIMEOUT).await.unwrap_err();
        assert!(
            matches!(err, VguestError::Api { ref message } if message.starts_with("FileNotFound: /tmp/remote_command_") && message.ends_with(".out"))
        );
        assert_eq!(script_deletes(&fake), 1);
    }

    #[tokio::test]
    async fn vanished_process_is_execution_error() {
        let fake = FakeVim::with_vms(&["web-01"]);
        fake.drop_pid();
        let exec = GuestCommandExecutor::new(&fake, &creds());
        assert!(matches!(
            exec.run("web-01", "uptime", DEFAULT_TIMEOUT).await.unwrap_err(),
            VguestError::Execution { .. }
        ));
    }

    #[tokio::test]
    async fn output_is_capped_to_max_lines() {
        let fake = FakeVim::with_vms(&["web-01"]);
        let long: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        fake.set_stdout(&long, 0);
        let exec = GuestCommandExecutor::new(&fake, &creds()).with_max_output_lines(3);

        let result = exec.run("web-01", "seq 10", DEFAULT_TIMEOUT).await.unwrap();
        assert_eq!(result.stdout, "line 1\nline 2\nline 3\n");
    }
}
