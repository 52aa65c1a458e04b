use crate::error::VguestError;
use crate::vim::{ManagedObject, VimApi};

/// A VM found in the inventory. Only usable while its session is connected.
#[derive(Debug, Clone, PartialEq)]
pub struct VmHandle {
    pub name: String,
    pub moref: ManagedObject,
}

/// Find a VM by exact, case-sensitive name. The first match in inventory
/// order wins.
///
/// The container view is destroyed before returning on every path once it
/// has been created.
pub async fn find_vm_by_name<A: VimApi>(api: &A, name: &str) -> Result<VmHandle, VguestError> {
    let view = api.create_vm_view().await?;

    let scanned = scan_view(api, &view, name).await;

    if let Err(e) = api.destroy_view(&view).await {
        tracing::warn!(view = %view, "failed to destroy container view: {e}");
    }

    let handle = scanned?;
    tracing::debug!(vm = %handle.name, moref = %handle.moref, "found VM");
    Ok(handle)
}

async fn scan_view<A: VimApi>(
    api: &A,
    view: &ManagedObject,
    name: &str,
) -> Result<VmHandle, VguestError> {
    api.vm_names_in_view(view)
        .await?
        .into_iter()
        .find(|(_, vm_name)| vm_name == name)
        .map(|(moref, vm_name)| VmHandle {
            name: vm_name,
            moref,
        })
        .ok_or_else(|| VguestError::VmNotFound {
            name: name.to_string(),
        })
}
