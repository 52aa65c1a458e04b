//! In-memory `VimApi` used by unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::VguestError;
use crate::vim::{GuestAuth, GuestProcessInfo, ManagedObject, ProgramSpec, TOOLS_RUNNING, VimApi};

const FIRST_PID: i64 = 1000;

/// Everything the fake has been asked to do.
#[derive(Debug, Clone, Default)]
pub struct Calls {
    pub views_created: usize,
    pub views_destroyed: usize,
    pub uploads: Vec<(String, Vec<u8>)>,
    pub starts: Vec<ProgramSpec>,
    pub list_calls: usize,
    pub downloads: Vec<String>,
    pub deletes: Vec<String>,
}

#[derive(Default)]
struct State {
    vms: Vec<(ManagedObject, String)>,
    tools_status: Option<String>,
    files: HashMap<String, Vec<u8>>,
    stdout: Vec<u8>,
    exit_code: i32,
    /// `None` = never finishes.
    finish_after_polls: Option<usize>,
    drop_pid: bool,
    scan_fault: Option<String>,
    destroy_fails: bool,
    start_fault: Option<String>,
    upload_fault: Option<String>,
    download_transport_error: bool,
    script_removed_by_command: bool,
    output_missing: bool,
    calls: Calls,
}

pub struct FakeVim {
    state: Mutex<State>,
}

impl FakeVim {
    /// A fake inventory with VMs `vm-1`, `vm-2`, … named in order, tools
    /// running, and commands that finish on the first poll.
    pub fn with_vms(names: &[&str]) -> Self {
        let vms = names
            .iter()
            .enumerate()
            .map(|(i, n)| {
                (
                    ManagedObject::new("VirtualMachine", format!("vm-{}", i + 1)),
                    n.to_string(),
                )
            })
            .collect();
        Self {
            state: Mutex::new(State {
                vms,
                tools_status: Some(TOOLS_RUNNING.to_string()),
                finish_after_polls: Some(1),
                ..Default::default()
            }),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut State) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn calls(&self) -> Calls {
        self.with(|s| s.calls.clone())
    }

    pub fn set_tools_status(&self, status: Option<&str>) {
        self.with(|s| s.tools_status = status.map(str::to_string));
    }

    pub fn set_stdout(&self, stdout: &str, exit_code: i32) {
        self.with(|s| {
            s.stdout = stdout.as_bytes().to_vec();
            s.exit_code = exit_code;
        });
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.with(|s| {
            s.files.insert(path.to_string(), content.as_bytes().to_vec());
        });
    }

    pub fn finish_after(&self, polls: usize) {
        self.with(|s| s.finish_after_polls = Some(polls));
    }

    pub fn never_finish(&self) {
        self.with(|s| s.finish_after_polls = None);
    }

    pub fn drop_pid(&self) {
        self.with(|s| s.drop_pid = true);
    }

    pub fn fail_view_scan(&self, message: &str) {
        self.with(|s| s.scan_fault = Some(message.to_string()));
    }

    pub fn fail_destroy_view(&self) {
        self.with(|s| s.destroy_fails = true);
    }

    pub fn fail_start(&self, message: &str) {
        self.with(|s| s.start_fault = Some(message.to_string()));
    }

    pub fn fail_upload(&self, message: &str) {
        self.with(|s| s.upload_fault = Some(message.to_string()));
    }

    pub fn fail_download_transport(&self) {
        self.with(|s| s.download_transport_error = true);
    }

    /// Deleting any `.sh` file faults with `FileNotFound`.
    pub fn script_removed_by_command(&self) {
        self.with(|s| s.script_removed_by_command = true);
    }

    /// The command never produces its `.out` file.
    pub fn output_missing(&self) {
        self.with(|s| s.output_missing = true);
    }
}

fn api_fault(message: &str) -> VguestError {
    VguestError::Api {
        message: message.to_string(),
    }
}

impl VimApi for FakeVim {
    async fn create_vm_view(&self) -> Result<ManagedObject, VguestError> {
        self.with(|s| {
            s.calls.views_created += 1;
            Ok(ManagedObject::new(
                "ContainerView",
                format!("session[fake]view-{}", s.calls.views_created),
            ))
        })
    }

    async fn vm_names_in_view(
        &self,
        _view: &ManagedObject,
    ) -> Result<Vec<(ManagedObject, String)>, VguestError> {
        self.with(|s| match &s.scan_fault {
            Some(msg) => Err(api_fault(msg)),
            None => Ok(s.vms.clone()),
        })
    }

    async fn destroy_view(&self, _view: &ManagedObject) -> Result<(), VguestError> {
        self.with(|s| {
            s.calls.views_destroyed += 1;
            if s.destroy_fails {
                Err(api_fault("ManagedObjectNotFound: view already gone"))
            } else {
                Ok(())
            }
        })
    }

    async fn tools_running_status(
        &self,
        _vm: &ManagedObject,
    ) -> Result<Option<String>, VguestError> {
        self.with(|s| Ok(s.tools_status.clone()))
    }

    async fn upload_guest_file(
        &self,
        _vm: &ManagedObject,
        _auth: &GuestAuth,
        path: &str,
        content: &[u8],
    ) -> Result<(), VguestError> {
        self.with(|s| {
            if let Some(msg) = &s.upload_fault {
                return Err(api_fault(msg));
            }
            s.calls.uploads.push((path.to_string(), content.to_vec()));
            s.files.insert(path.to_string(), content.to_vec());
            Ok(())
        })
    }

    async fn download_guest_file(
        &self,
        _vm: &ManagedObject,
        _auth: &GuestAuth,
        path: &str,
        _max_lines: usize,
    ) -> Result<Vec<u8>, VguestError> {
        self.with(|s| {
            s.calls.downloads.push(path.to_string());
            if s.download_transport_error {
                return Err(VguestError::Transport {
                    message: "connection reset by peer".into(),
                });
            }
            if let Some(content) = s.files.get(path) {
                return Ok(content.clone());
            }
            if path.ends_with(".out") && !s.calls.starts.is_empty() && !s.output_missing {
                return Ok(s.stdout.clone());
            }
            Err(VguestError::FileNotFound {
                path: path.to_string(),
            })
        })
    }

    async fn delete_guest_file(
        &self,
        _vm: &ManagedObject,
        _auth: &GuestAuth,
        path: &str,
    ) -> Result<(), VguestError> {
        self.with(|s| {
            s.calls.deletes.push(path.to_string());
            if s.script_removed_by_command && path.ends_with(".sh") {
                return Err(VguestError::FileNotFound {
                    path: path.to_string(),
                });
            }
            s.files.remove(path);
            Ok(())
        })
    }

    async fn start_program(
        &self,
        _vm: &ManagedObject,
        _auth: &GuestAuth,
        spec: &ProgramSpec,
    ) -> Result<i64, VguestError> {
        self.with(|s| {
            if let Some(msg) = &s.start_fault {
                return Err(api_fault(msg));
            }
            s.calls.starts.push(spec.clone());
            Ok(FIRST_PID + s.calls.starts.len() as i64 - 1)
        })
    }

    async fn list_processes(
        &self,
        _vm: &ManagedObject,
        _auth: &GuestAuth,
        pids: &[i64],
    ) -> Result<Vec<GuestProcessInfo>, VguestError> {
        self.with(|s| {
            s.calls.list_calls += 1;
            if s.drop_pid {
                return Ok(Vec::new());
            }
            let finished = s
                .finish_after_polls
                .is_some_and(|n| s.calls.list_calls >= n);
            Ok(pids
                .iter()
                .map(|&pid| GuestProcessInfo {
                    pid,
                    name: "bash".into(),
                    start_time: Some("2026-10-16T08:00:00Z".into()),
                    end_time: finished.then(|| "2026-10-16T08:00:01Z".into()),
                    exit_code: finished.then_some(s.exit_code),
                })
                .collect())
        })
    }
}
