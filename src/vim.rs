//! vim25 managed objects, request bodies and response parsing.
//!
//! Request bodies are built with `format!` and escaped values; the element
//! order follows the WSDL sequences, which the server enforces.

use crate::config::GuestCredentials;
use crate::error::VguestError;
use crate::soap::esc;
use crate::soap::xml::Element;

/// The value of `guest.toolsRunningStatus` when guest operations are possible.
pub const TOOLS_RUNNING: &str = "guestToolsRunning";

/// A managed object reference: `<obj type="VirtualMachine">vm-42</obj>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManagedObject {
    pub kind: String,
    pub value: String,
}

impl ManagedObject {
    pub fn new(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: value.into(),
        }
    }

    /// Serialize as an element named `tag`.
    pub fn to_xml(&self, tag: &str) -> String {
        format!(
            r#"<{tag} type="{}">{}</{tag}>"#,
            esc(&self.kind),
            esc(&self.value)
        )
    }

    fn from_element(el: &Element) -> Result<Self, VguestError> {
        let kind = el.attr("type").ok_or_else(|| malformed(&el.name, "missing type"))?;
        Ok(Self::new(kind, el.text.clone()))
    }
}

impl std::fmt::Display for ManagedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

fn malformed(what: &str, why: &str) -> VguestError {
    VguestError::Transport {
        message: format!("unexpected {what} in response: {why}"),
    }
}

fn returnval(resp: &Element) -> Result<&Element, VguestError> {
    resp.child("returnval")
        .ok_or_else(|| malformed(&resp.name, "no returnval"))
}

// ── service content ──────────────────────────────────────

/// The subset of `ServiceContent` this crate needs.
#[derive(Debug, Clone)]
pub struct ServiceContent {
    pub root_folder: ManagedObject,
    pub property_collector: ManagedObject,
    pub view_manager: ManagedObject,
    pub session_manager: ManagedObject,
    pub guest_operations_manager: ManagedObject,
    pub product: String,
}

pub fn service_instance() -> ManagedObject {
    ManagedObject::new("ServiceInstance", "ServiceInstance")
}

pub fn parse_service_content(resp: &Element) -> Result<ServiceContent, VguestError> {
    let rv = returnval(resp)?;
    let mor = |name: &str| -> Result<ManagedObject, VguestError> {
        let el = rv
            .child(name)
            .ok_or_else(|| malformed("ServiceContent", &format!("no {name}")))?;
        ManagedObject::from_element(el)
    };
    Ok(ServiceContent {
        root_folder: mor("rootFolder")?,
        property_collector: mor("propertyCollector")?,
        view_manager: mor("viewManager")?,
        session_manager: mor("sessionManager")?,
        guest_operations_manager: mor("guestOperationsManager").map_err(|_| {
            VguestError::Api {
                message: "endpoint does not expose the guest operations manager".into(),
            }
        })?,
        product: rv
            .child("about")
            .and_then(|a| a.child_text("fullName"))
            .unwrap_or("unknown")
            .to_string(),
    })
}

pub fn login_body(session_manager: &ManagedObject, user: &str, password: &str) -> String {
    format!(
        "{}<userName>{}</userName><password>{}</password>",
        session_manager.to_xml("_this"),
        esc(user),
        esc(password)
    )
}

// ── property collector ───────────────────────────────────

/// One object from a property collector result.
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectContent {
    pub obj: ManagedObject,
    /// `(name, value element)` pairs.
    pub props: Vec<(String, Element)>,
}

impl ObjectContent {
    pub fn prop(&self, name: &str) -> Option<&Element> {
        self.props.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }
}

/// A page of property collector results.
#[derive(Debug, Clone, Default)]
pub struct RetrieveResult {
    pub objects: Vec<ObjectContent>,
    pub token: Option<String>,
}

/// Retrieve `paths` of the VMs reachable through a container view.
pub fn view_properties_body(
    collector: &ManagedObject,
    view: &ManagedObject,
    paths: &[&str],
) -> String {
    let path_set: String = paths
        .iter()
        .map(|p| format!("<pathSet>{}</pathSet>", esc(p)))
        .collect();
    format!(
        "{this}<specSet><propSet><type>VirtualMachine</type>{path_set}</propSet>\
<objectSet>{obj}<skip>true</skip><selectSet xsi:type=\"TraversalSpec\">\
<name>traverseView</name><type>ContainerView</type><path>view</path><skip>false</skip>\
</selectSet></objectSet></specSet><options/>",
        this = collector.to_xml("_this"),
        obj = view.to_xml("obj"),
    )
}

/// Retrieve `paths` of a single object.
pub fn object_properties_body(
    collector: &ManagedObject,
    obj: &ManagedObject,
    paths: &[&str],
) -> String {
    let path_set: String = paths
        .iter()
        .map(|p| format!("<pathSet>{}</pathSet>", esc(p)))
        .collect();
    format!(
        "{this}<specSet><propSet><type>{kind}</type>{path_set}</propSet>\
<objectSet>{obj}<skip>false</skip></objectSet></specSet><options/>",
        this = collector.to_xml("_this"),
        kind = esc(&obj.kind),
        obj = obj.to_xml("obj"),
    )
}

pub fn continue_body(collector: &ManagedObject, token: &str) -> String {
    format!("{}<token>{}</token>", collector.to_xml("_this"), esc(token))
}

/// Parse `RetrievePropertiesEx` / `ContinueRetrievePropertiesEx` responses.
/// An empty result has no `returnval` at all.
pub fn parse_retrieve_result(resp: &Element) -> Result<RetrieveResult, VguestError> {
    let Some(rv) = resp.child("returnval") else {
        return Ok(RetrieveResult::default());
    };
    let mut objects = Vec::new();
    for oc in rv.children_named("objects") {
        let obj = oc
            .child("obj")
            .ok_or_else(|| malformed("ObjectContent", "no obj"))?;
        let props = oc
            .children_named("propSet")
            .filter_map(|ps| Some((ps.child_text("name")?.to_string(), ps.child("val")?.clone())))
            .collect();
        objects.push(ObjectContent {
            obj: ManagedObject::from_element(obj)?,
            props,
        });
    }
    Ok(RetrieveResult {
        objects,
        token: rv.child_text("token").map(str::to_string),
    })
}

// ── container views ──────────────────────────────────────

pub fn create_vm_view_body(view_manager: &ManagedObject, root: &ManagedObject) -> String {
    format!(
        "{}{}<type>VirtualMachine</type><recursive>true</recursive>",
        view_manager.to_xml("_this"),
        root.to_xml("container")
    )
}

pub fn parse_moref_return(resp: &Element) -> Result<ManagedObject, VguestError> {
    ManagedObject::from_element(returnval(resp)?)
}

// ── guest operations ─────────────────────────────────────

/// `NamePasswordAuthentication` for guest operations.
#[derive(Clone)]
pub struct GuestAuth {
    pub username: String,
    pub password: String,
}

impl From<&GuestCredentials> for GuestAuth {
    fn from(c: &GuestCredentials) -> Self {
        Self {
            username: c.username.clone(),
            password: c.password.clone(),
        }
    }
}

impl std::fmt::Debug for GuestAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestAuth")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl GuestAuth {
    fn to_xml(&self) -> String {
        format!(
            "<auth xsi:type=\"NamePasswordAuthentication\"><interactiveSession>false</interactiveSession>\
<username>{}</username><password>{}</password></auth>",
            esc(&self.username),
            esc(&self.password)
        )
    }
}

/// `GuestProgramSpec`.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgramSpec {
    pub program_path: String,
    pub arguments: String,
}

/// `GuestProcessInfo` as returned by `ListProcessesInGuest`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GuestProcessInfo {
    pub pid: i64,
    pub name: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub exit_code: Option<i32>,
}

fn guest_call_prefix(manager: &ManagedObject, vm: &ManagedObject, auth: &GuestAuth) -> String {
    format!("{}{}{}", manager.to_xml("_this"), vm.to_xml("vm"), auth.to_xml())
}

pub fn start_program_body(
    process_manager: &ManagedObject,
    vm: &ManagedObject,
    auth: &GuestAuth,
    spec: &ProgramSpec,
) -> String {
    format!(
        "{}<spec xsi:type=\"GuestProgramSpec\"><programPath>{}</programPath><arguments>{}</arguments></spec>",
        guest_call_prefix(process_manager, vm, auth),
        esc(&spec.program_path),
        esc(&spec.arguments)
    )
}

pub fn parse_pid(resp: &Element) -> Result<i64, VguestError> {
    let rv = returnval(resp)?;
    rv.text
        .trim()
        .parse()
        .map_err(|_| malformed("StartProgramInGuest", &format!("bad pid '{}'", rv.text)))
}

pub fn list_processes_body(
    process_manager: &ManagedObject,
    vm: &ManagedObject,
    auth: &GuestAuth,
    pids: &[i64],
) -> String {
    let pids: String = pids.iter().map(|p| format!("<pids>{p}</pids>")).collect();
    format!("{}{pids}", guest_call_prefix(process_manager, vm, auth))
}

pub fn parse_process_list(resp: &Element) -> Result<Vec<GuestProcessInfo>, VguestError> {
    resp.children_named("returnval")
        .map(|rv| {
            let pid = rv
                .child_text("pid")
                .and_then(|p| p.trim().parse().ok())
                .ok_or_else(|| malformed("GuestProcessInfo", "missing pid"))?;
            Ok(GuestProcessInfo {
                pid,
                name: rv.child_text("name").unwrap_or_default().to_string(),
                start_time: rv.child_text("startTime").map(str::to_string),
                end_time: rv.child_text("endTime").map(str::to_string),
                exit_code: rv.child_text("exitCode").and_then(|c| c.trim().parse().ok()),
            })
        })
        .collect()
}

pub fn transfer_to_guest_body(
    file_manager: &ManagedObject,
    vm: &ManagedObject,
    auth: &GuestAuth,
    path: &str,
    size: usize,
    permissions: u32,
) -> String {
    format!(
        "{}<guestFilePath>{}</guestFilePath>\
<fileAttributes xsi:type=\"GuestPosixFileAttributes\"><permissions>{permissions}</permissions></fileAttributes>\
<fileSize>{size}</fileSize><overwrite>true</overwrite>",
        guest_call_prefix(file_manager, vm, auth),
        esc(path)
    )
}

pub fn transfer_from_guest_body(
    file_manager: &ManagedObject,
    vm: &ManagedObject,
    auth: &GuestAuth,
    path: &str,
) -> String {
    format!(
        "{}<guestFilePath>{}</guestFilePath>",
        guest_call_prefix(file_manager, vm, auth),
        esc(path)
    )
}

/// URL from `InitiateFileTransferToGuest` (a bare string) or
/// `InitiateFileTransferFromGuest` (a `FileTransferInformation`).
pub fn parse_transfer_url(resp: &Element) -> Result<String, VguestError> {
    let rv = returnval(resp)?;
    let url = rv.child_text("url").unwrap_or(&rv.text);
    if url.is_empty() {
        return Err(malformed(&resp.name, "empty transfer url"));
    }
    Ok(url.to_string())
}

pub fn delete_file_body(
    file_manager: &ManagedObject,
    vm: &ManagedObject,
    auth: &GuestAuth,
    path: &str,
) -> String {
    format!(
        "{}<filePath>{}</filePath>",
        guest_call_prefix(file_manager, vm, auth),
        esc(path)
    )
}

// ── API seam ─────────────────────────────────────────────

/// The vim operations the locator, executor and file reader depend on.
#[allow(async_fn_in_trait)] // trait is internal-only
pub trait VimApi {
    /// Create a recursive container view of all VMs under the root folder.
    async fn create_vm_view(&self) -> Result<ManagedObject, VguestError>;
    /// Names of every VM in the view, in inventory order.
    async fn vm_names_in_view(
        &self,
        view: &ManagedObject,
    ) -> Result<Vec<(ManagedObject, String)>, VguestError>;
    async fn destroy_view(&self, view: &ManagedObject) -> Result<(), VguestError>;

    /// `guest.toolsRunningStatus`, or `None` if the VM reports no guest info.
    async fn tools_running_status(&self, vm: &ManagedObject)
    -> Result<Option<String>, VguestError>;

    async fn upload_guest_file(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        path: &str,
        content: &[u8],
    ) -> Result<(), VguestError>;
    async fn download_guest_file(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        path: &str,
        max_lines: usize,
    ) -> Result<Vec<u8>, VguestError>;
    async fn delete_guest_file(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        path: &str,
    ) -> Result<(), VguestError>;

    async fn start_program(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        spec: &ProgramSpec,
    ) -> Result<i64, VguestError>;
    async fn list_processes(
        &self,
        vm: &ManagedObject,
        auth: &GuestAuth,
        pids: &[i64],
    ) -> Result<Vec<GuestProcessInfo>, VguestError>;
}
