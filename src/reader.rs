use crate::config::GuestCredentials;
use crate::error::VguestError;
use crate::executor::cap_lines;
use crate::guest::ensure_tools_running;
use crate::locator::find_vm_by_name;
use crate::vim::{GuestAuth, VimApi};

pub const DEFAULT_MAX_LINES: usize = 5000;

/// Reads text files out of a guest.
pub struct GuestFileReader<'a, A> {
    api: &'a A,
    auth: GuestAuth,
}

impl<'a, A: VimApi> GuestFileReader<'a, A> {
    pub fn new(api: &'a A, credentials: &GuestCredentials) -> Self {
        Self {
            api,
            auth: GuestAuth::from(credentials),
        }
    }

    /// Read `path` from the guest of `vm_name`, keeping at most `max_lines`.
    /// The transfer stops once that many lines have arrived. Invalid UTF-8 is
    /// replaced rather than rejected.
    pub async fn read_file(
        &self,
        vm_name: &str,
        path: &str,
        max_lines: usize,
    ) -> Result<String, VguestError> {
        let vm = find_vm_by_name(self.api, vm_name).await?;
        ensure_tools_running(self.api, &vm).await?;

        let raw = self
            .api
            .download_guest_file(&vm.moref, &self.auth, path, max_lines)
            .await
            .map_err(|e| match e {
                VguestError::FileNotFound { .. } => VguestError::FileNotFound {
                    path: path.to_string(),
                },
                other => other,
            })?;
        tracing::debug!(vm = %vm.name, path, bytes = raw.len(), "read guest file");

        Ok(cap_lines(&String::from_utf8_lossy(&raw), max_lines))
    }
}
