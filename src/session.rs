use crate::config::ConnectionConfig;
use crate::error::VguestError;
use crate::soap::SoapClient;
use crate::vim::{
    self, GuestAuth, GuestProcessInfo, ManagedObject, ProgramSpec, ServiceContent, VimApi,
};

/// Permissions for uploaded guest files (0700).
const GUEST_FILE_MODE: u32 = 0o700;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Disconnected,
}

/// Managers resolved from the `GuestOperationsManager` at connect time.
#[derive(Debug, Clone)]
struct GuestManagers {
    process: ManagedObject,
    file: ManagedObject,
}

/// A logged-in vim session.
///
/// Handles obtained through a session (VMs, views) are only meaningful while
/// it is connected; every call after `disconnect` fails with a connection
/// error.
pub struct Session {
    client: SoapClient,
    content: ServiceContent,
    guest: GuestManagers,
    host: String,
    state: SessionState,
}

impl Session {
    /// Connect and log in. Every failure is reported as `Connection`.
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, VguestError> {
        let client = SoapClient::new(config).map_err(into_connection)?;
        Self::connect_with(client, config).await
    }

    async fn connect_with(client: SoapClient, config: &ConnectionConfig) -> Result<Self, VguestError> {
        Self::establish(client, config)
            .await
            .map_err(into_connection)
    }

    async fn establish(client: SoapClient, config: &ConnectionConfig) -> Result<Self, VguestError> {
        let resp = client
            .call(
                "RetrieveServiceContent",
                &vim::service_instance().to_xml("_this"),
            )
            .await?;
        let content = vim::parse_service_content(&resp)?;

        client
            .call(
                "Login",
                &vim::login_body(&content.session_manager, &config.username, &config.password),
            )
            .await?;

        let guest = match resolve_guest_managers(&client, &content).await {
            Ok(guest) => guest,
            Err(e) => {
                let body = content.session_manager.to_xml("_this");
                if let Err(logout) = client.call("Logout", &body).await {
                    tracing::warn!(host = %config.host, "logout after failed connect: {logout}");
                }
                return Err(e);
            }
        };

        tracing::info!(host = %config.host, product = %content.product, "connected to vSphere");

        Ok(Self {
            client,
            content,
            guest,
            host: config.host.clone(),
            state: SessionState::Connected,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn product(&self) -> &str {
        &self.content.product
    }

    /// Log out. Calling this on a disconnected session does nothing.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Disconnected {
            return;
        }
        let body = self.content.session_manager.to_xml("_this");
        if let Err(e) = self.client.call("Logout", &body).await {
            tracing::warn!(host = %self.host, "logout failed: {e}");
        }
        self.state = SessionState::Disconnected;
        tracing::info!(host = %self.host, "disconnected from vSphere");
    }

    fn ensure_connected(&self) -> Result<(), VguestError> {
        match self.state {
            SessionState::Connected => Ok(()),
            SessionState::Disconnected => Err(VguestError::Connection {
                message: "session is not connected".into(),
            }),
        }
    }

    async fn call(&self, method: &str, body: &str) -> Result<crate::soap::xml::Element, VguestError> {
        self.ensure_connected()?;
        self.client.call(method, body).await
    }

    async fn retrieve_all(&self, body: &str) -> Result<Vec<vim::ObjectContent>, VguestError> {
        let resp = self.call("RetrievePropertiesEx", body).await?;
        let mut page = vim::parse_retrieve_result(&resp)?;
        let mut objects = std::mem::take(&mut page.objects);
        while let Some(token) = page.token.take() {
            let body = vim::continue_body(&self.content.property_collector, &token);
            let resp = self.call("ContinueRetrievePropertiesEx", &body).await?;
            page = vim::parse_retrieve_result(&resp)?;
            objects.append(&mut page.objects);
        }
        Ok(objects)
    }
}

fn into_connection(e: VguestError) -> VguestError {
    VguestError::Connection {
        message: match e {
            VguestError::Api { message } | VguestError::Transport { message } => message,
            other => other.to_string(),
        },
    }
}

async fn resolve_guest_managers(
    client: &SoapClient,
    content: &ServiceContent,
) -> Result<GuestManagers, VguestError> {
    let resp = client
        .call(
            "RetrievePropertiesEx",
            &vim::object_properties_body(
                &content.property_collector,
                &content.guest_operations_manager,
                &["processManager", "fileManager"],
            ),
        )
        .await?;
    let result = vim::parse_retrieve_result(&resp)?;
    let manager = |name: &str| -> Result<ManagedObject, VguestError> {
        let val = result
            .objects
            .first()
            .and_then(|o| o.prop(name))
            .ok_or_else(|| VguestError::Api {
                message: format!("guest operations manager has no {name}"),
            })?;
        Ok(ManagedObject::new(
            val.attr("type").unwrap_or_default(),
            val.text.clone(),
        ))
    };
    Ok(GuestManagers {
        process: manager("processManager")?,
        file: manager("fileManager")?,
    })
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state == SessionState::Connected {
            tracing::debug!(host = %self.host, "session dropped without logout; server will expire it");
        }
    }
}

impl VimApi for Session {
    async fn create_vm_view(&self) -> Result<ManagedObject, VguestError> {
        let body =
            vim::create_vm_view_body(&self.content.view_manager, &self.content.root_folder);
        let resp = self.call("CreateContainerView", &body).await?;
        vim::parse_moref_return(&resp)
    }

    async fn vm_names_in_view(
        &self,
        view: &ManagedObject,
    ) -> Result<Vec<(ManagedObject, String)>, VguestError> {
        let body = vim::view_properties_body(&self.content.property_collector, view, &["name"]);
        let objects = self.retrieve_all(&body).await?;
        Ok(objects
            .into_iter()
            .filter_map(|o| {
                let name = o.prop("name")?.text.clone();
                Some((o.obj, name))
            })
            .collect())
    }

    async fn destroy_view(&self, view: &ManagedObject) -> Result<(), VguestError> {
        self.call("DestroyView", &view.to_xml("_this")).await?;
        Ok(())
    }

    async fn tools_running_status(
        &self,
        vm: &ManagedObject,
    ) -> Result<Option<String>, VguestError> {
        let body = vim::object_properties_body(
            &self.content.property_collector,
            vm,
            &["guest.toolsRunningStatus"],
        );
        let objects = self.retrieve_all(&body).await?;
        Ok(objects
            .first()
            .and_then(|o| o.prop("guest.toolsRunningStatus"))
            .map(|v| v.text.clone()))
    }

    async fn upload_guest_file(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        path: &str,
        content: &[u8],
    ) -> Result<(), VguestError> {
        let body = vim::transfer_to_guest_body(
            &self.guest.file,
            vm,
            auth,
            path,
            content.len(),
            GUEST_FILE_MODE,
        );
        let resp = self.call("InitiateFileTransferToGuest", &body).await?;
        let url = vim::parse_transfer_url(&resp)?;
        self.client.upload(&url, content.to_vec()).await
    }

    async fn download_guest_file(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        path: &str,
        max_lines: usize,
    ) -> Result<Vec<u8>, VguestError> {
        let body = vim::transfer_from_guest_body(&self.guest.file, vm, auth, path);
        let resp = self
            .call("InitiateFileTransferFromGuest", &body)
            .await
            .map_err(|e| match e {
                VguestError::FileNotFound { .. } => VguestError::FileNotFound {
                    path: path.to_string(),
                },
                other => other,
            })?;
        let url = vim::parse_transfer_url(&resp)?;
        self.client.download(&url, max_lines).await
    }

    async fn delete_guest_file(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        path: &str,
    ) -> Result<(), VguestError> {
        let body = vim::delete_file_body(&self.guest.file, vm, auth, path);
        self.call("DeleteFileInGuest", &body).await?;
        Ok(())
    }

    async fn start_program(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        spec: &ProgramSpec,
    ) -> Result<i64, VguestError> {
        let body = vim::start_program_body(&self.guest.process, vm, auth, spec);
        let resp = self.call("StartProgramInGuest", &body).await?;
        vim::parse_pid(&resp)
    }

    async fn list_processes(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        pids: &[i64],
    ) -> Result<Vec<GuestProcessInfo>, VguestError> {
        let body = vim::list_processes_body(&self.guest.process, vm, auth, pids);
        let resp = self.call("ListProcessesInGuest", &body).await?;
        vim::parse_process_list(&resp)
    }
}
