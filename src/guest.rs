use crate::error::VguestError;
use crate::locator::VmHandle;
use crate::vim::{TOOLS_RUNNING, VimApi};

/// Fail with `ToolsNotRunning` unless the guest agent reports it is running.
pub async fn ensure_tools_running<A: VimApi>(api: &A, vm: &VmHandle) -> Result<(), VguestError> {
    let status = api.tools_running_status(&vm.moref).await?;
    match status.as_deref() {
        Some(TOOLS_RUNNING) => Ok(()),
        other => {
            let status = other.unwrap_or("no guest info").to_string();
            tracing::debug!(vm = %vm.name, %status, "guest tools not running");
            Err(VguestError::ToolsNotRunning {
                vm: vm.name.clone(),
                status,
            })
        }
    }
}
