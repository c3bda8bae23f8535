//! SOAP transport for the vSphere Web Services endpoint. Request envelopes
//! are built by hand and responses parsed with `roxmltree`; the vim25 surface
//! here is exactly the eleven operations of [`VimPort`].

use async_trait::async_trait;
use roxmltree::{Document, Node};
use tracing::debug;

use crate::error::{PropertyErrorKind, VimError, VimResult};
use crate::port::VimPort;
use crate::types::{
    ConfigSpec, EthernetCard, FaultKind, InstantCloneSpec, ManagedObjectRef, MethodFault,
    NetworkBacking, OptionValue, PropertyValue, TaskInfo, TaskState,
};

const XSI: &str = "http://www.w3.org/2001/XMLSchema-instance";

pub struct SoapPort {
    http: reqwest::Client,
    endpoint: String,
}

impl SoapPort {
    /// `endpoint` is the SDK URL, e.g. `https://vcenter.example.com/sdk`.
    pub fn new(endpoint: impl Into<String>) -> VimResult<Self> {
        Self::build(endpoint, false)
    }

    /// Accepts self-signed certificates; common on lab vCenters.
    pub fn new_insecure(endpoint: impl Into<String>) -> VimResult<Self> {
        Self::build(endpoint, true)
    }

    fn build(endpoint: impl Into<String>, insecure: bool) -> VimResult<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .danger_accept_invalid_certs(insecure)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.into(),
        })
    }

    /// Posts one method invocation and returns the raw response body.
    /// SOAP faults are classified here; `NotAuthenticated` becomes
    /// [`VimError::Auth`] so the session wrapper can recover.
    async fn call(&self, operation: &str, body: String) -> VimResult<String> {
        let envelope = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
<soapenv:Envelope xmlns:soapenv=\"http://schemas.xmlsoap.org/soap/envelope/\" \
xmlns:xsi=\"{XSI}\" xmlns:xsd=\"http://www.w3.org/2001/XMLSchema\">\
<soapenv:Body>{body}</soapenv:Body>\
</soapenv:Envelope>"
        );

        debug!(operation, "vim soap call");

        let resp = self
            .http
            .post(&self.endpoint)
            .header("SOAPAction", "urn:vim25/8.0.0.0")
            .header("Content-Type", "text/xml; charset=\"utf-8\"")
            .body(envelope)
            .send()
            .await?;

        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if let Some(fault) = parse_fault(&text) {
            if fault.kind == FaultKind::NotAuthenticated {
                return Err(VimError::Auth(fault.message));
            }
            return Err(VimError::Fault(fault));
        }
        if !status.is_success() {
            return Err(VimError::Protocol(format!(
                "{operation} failed with status {status}"
            )));
        }
        Ok(text)
    }

    async fn task_call(&self, operation: &str, body: String) -> VimResult<ManagedObjectRef> {
        let text = self.call(operation, body).await?;
        parse_returnval_mor(&text)?
            .ok_or_else(|| VimError::Protocol(format!("{operation} returned no task reference")))
    }
}

#[async_trait]
impl VimPort for SoapPort {
    async fn login(&self, username: &str, password: &str) -> VimResult<String> {
        let body = format!(
            "<Login xmlns=\"urn:vim25\">{}<userName>{}</userName><password>{}</password></Login>",
            this_ref("SessionManager", "SessionManager"),
            escape_xml(username),
            escape_xml(password),
        );
        let text = self.call("Login", body).await?;
        let doc = parse_doc(&text)?;
        first_element(&doc, "key")
            .and_then(|n| n.text())
            .map(|s| s.to_string())
            .ok_or_else(|| VimError::Protocol("login response carried no session key".into()))
    }

    async fn session_is_active(&self, key: &str, username: &str) -> VimResult<bool> {
        let body = format!(
            "<SessionIsActive xmlns=\"urn:vim25\">{}<sessionID>{}</sessionID><userName>{}</userName></SessionIsActive>",
            this_ref("SessionManager", "SessionManager"),
            escape_xml(key),
            escape_xml(username),
        );
        let text = self.call("SessionIsActive", body).await?;
        let doc = parse_doc(&text)?;
        Ok(first_element(&doc, "returnval")
            .and_then(|n| n.text())
            .map(|t| t.trim() == "true")
            .unwrap_or(false))
    }

    async fn logout(&self) -> VimResult<()> {
        let body = format!(
            "<Logout xmlns=\"urn:vim25\">{}</Logout>",
            this_ref("SessionManager", "SessionManager"),
        );
        self.call("Logout", body).await.map(|_| ())
    }

    async fn find_by_inventory_path(&self, path: &str) -> VimResult<Option<ManagedObjectRef>> {
        let body = format!(
            "<FindByInventoryPath xmlns=\"urn:vim25\">{}<inventoryPath>{}</inventoryPath></FindByInventoryPath>",
            this_ref("SearchIndex", "SearchIndex"),
            escape_xml(path),
        );
        let text = self.call("FindByInventoryPath", body).await?;
        parse_returnval_mor(&text)
    }

    async fn retrieve_property(
        &self,
        obj: &ManagedObjectRef,
        path: &str,
    ) -> VimResult<PropertyValue> {
        let body = format!(
            "<RetrievePropertiesEx xmlns=\"urn:vim25\">{}\
<specSet>\
<propSet><type>{}</type><pathSet>{}</pathSet></propSet>\
<objectSet><obj type=\"{}\">{}</obj><skip>false</skip></objectSet>\
</specSet>\
<options/>\
</RetrievePropertiesEx>",
            this_ref("PropertyCollector", "propertyCollector"),
            escape_xml(&obj.kind),
            escape_xml(path),
            escape_xml(&obj.kind),
            escape_xml(&obj.value),
        );
        let text = self.call("RetrievePropertiesEx", body).await?;
        parse_retrieve_result(&text, path)
    }

    async fn instant_clone_task(
        &self,
        source: &ManagedObjectRef,
        spec: &InstantCloneSpec,
    ) -> VimResult<ManagedObjectRef> {
        let mut xml = String::new();
        xml.push_str(&format!("<name>{}</name>", escape_xml(&spec.name)));
        xml.push_str(&relocate_xml(&spec.location));
        for entry in &spec.extra_config {
            xml.push_str(&option_value_xml("config", entry));
        }
        let body = format!(
            "<InstantClone_Task xmlns=\"urn:vim25\">{}<spec>{}</spec></InstantClone_Task>",
            mor_this(source),
            xml,
        );
        self.task_call("InstantClone_Task", body).await
    }

    async fn power_off_task(&self, vm: &ManagedObjectRef) -> VimResult<ManagedObjectRef> {
        let body = format!(
            "<PowerOffVM_Task xmlns=\"urn:vim25\">{}</PowerOffVM_Task>",
            mor_this(vm),
        );
        self.task_call("PowerOffVM_Task", body).await
    }

    async fn destroy_task(&self, vm: &ManagedObjectRef) -> VimResult<ManagedObjectRef> {
        let body = format!(
            "<Destroy_Task xmlns=\"urn:vim25\">{}</Destroy_Task>",
            mor_this(vm),
        );
        self.task_call("Destroy_Task", body).await
    }

    async fn reconfig_task(
        &self,
        vm: &ManagedObjectRef,
        spec: &ConfigSpec,
    ) -> VimResult<ManagedObjectRef> {
        let mut xml = String::new();
        if let Some(name) = &spec.name {
            xml.push_str(&format!("<name>{}</name>", escape_xml(name)));
        }
        for entry in &spec.extra_config {
            xml.push_str(&option_value_xml("extraConfig", entry));
        }
        let body = format!(
            "<ReconfigVM_Task xmlns=\"urn:vim25\">{}<spec>{}</spec></ReconfigVM_Task>",
            mor_this(vm),
            xml,
        );
        self.task_call("ReconfigVM_Task", body).await
    }

    async fn reset_task(&self, vm: &ManagedObjectRef) -> VimResult<ManagedObjectRef> {
        let body = format!(
            "<ResetVM_Task xmlns=\"urn:vim25\">{}</ResetVM_Task>",
            mor_this(vm),
        );
        self.task_call("ResetVM_Task", body).await
    }

    async fn shutdown_guest(&self, vm: &ManagedObjectRef) -> VimResult<()> {
        let body = format!(
            "<ShutdownGuest xmlns=\"urn:vim25\">{}</ShutdownGuest>",
            mor_this(vm),
        );
        self.call("ShutdownGuest", body).await.map(|_| ())
    }
}

// --- request builders ---

fn this_ref(kind: &str, value: &str) -> String {
    format!("<_this type=\"{kind}\">{value}</_this>")
}

fn mor_this(mor: &ManagedObjectRef) -> String {
    format!(
        "<_this type=\"{}\">{}</_this>",
        escape_xml(&mor.kind),
        escape_xml(&mor.value)
    )
}

fn mor_field(tag: &str, mor: &ManagedObjectRef) -> String {
    format!(
        "<{tag} type=\"{}\">{}</{tag}>",
        escape_xml(&mor.kind),
        escape_xml(&mor.value)
    )
}

fn option_value_xml(tag: &str, entry: &OptionValue) -> String {
    format!(
        "<{tag}><key>{}</key><value xsi:type=\"xsd:string\">{}</value></{tag}>",
        escape_xml(&entry.key),
        escape_xml(&entry.value),
    )
}

// Field order follows the vim25 sequence: folder, datastore, pool, deviceChange.
fn relocate_xml(spec: &crate::types::RelocateSpec) -> String {
    let mut xml = String::from("<location>");
    xml.push_str(&mor_field("folder", &spec.folder));
    if let Some(datastore) = &spec.datastore {
        xml.push_str(&mor_field("datastore", datastore));
    }
    if let Some(pool) = &spec.pool {
        xml.push_str(&mor_field("pool", pool));
    }
    for change in &spec.nic_changes {
        let backing = match &change.backing {
            NetworkBacking::Standard {
                network,
                device_name,
            } => format!(
                "<backing xsi:type=\"VirtualEthernetCardNetworkBackingInfo\">\
<deviceName>{}</deviceName><useAutoDetect>true</useAutoDetect>{}</backing>",
                escape_xml(device_name),
                mor_field("network", network),
            ),
            NetworkBacking::Distributed {
                portgroup_key,
                switch_uuid,
            } => format!(
                "<backing xsi:type=\"VirtualEthernetCardDistributedVirtualPortBackingInfo\">\
<port><switchUuid>{}</switchUuid><portgroupKey>{}</portgroupKey></port></backing>",
                escape_xml(switch_uuid),
                escape_xml(portgroup_key),
            ),
        };
        xml.push_str(&format!(
            "<deviceChange><operation>edit</operation>\
<device xsi:type=\"{}\"><key>{}</key>{}</device></deviceChange>",
            escape_xml(&change.device.kind),
            change.device.key,
            backing,
        ));
    }
    xml.push_str("</location>");
    xml
}

fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(ch),
        }
    }
    out
}

// --- response parsing ---

fn parse_doc(xml: &str) -> VimResult<Document<'_>> {
    Document::parse(xml).map_err(|e| VimError::Protocol(format!("unparseable response: {e}")))
}

fn first_element<'a>(doc: &'a Document<'a>, local_name: &str) -> Option<Node<'a, 'a>> {
    doc.descendants()
        .find(|n| n.is_element() && n.tag_name().name() == local_name)
}

fn xsi_type<'a>(node: &Node<'a, '_>) -> Option<&'a str> {
    node.attribute((XSI, "type"))
        .map(|t| t.rsplit(':').next().unwrap_or(t))
}

/// Returns the classified fault if the response body is a SOAP fault.
fn parse_fault(xml: &str) -> Option<MethodFault> {
    let doc = Document::parse(xml).ok()?;
    let fault = doc
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "Fault")?;

    let message = fault
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "faultstring")
        .and_then(|n| n.text())
        .unwrap_or("")
        .to_string();

    let kind = fault
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "detail")
        .and_then(|detail| detail.children().find(|n| n.is_element()))
        .map(|n| FaultKind::from_wire(n.tag_name().name()))
        .unwrap_or(FaultKind::Other(String::new()));

    Some(MethodFault { kind, message })
}

fn parse_returnval_mor(xml: &str) -> VimResult<Option<ManagedObjectRef>> {
    let doc = parse_doc(xml)?;
    let Some(node) = first_element(&doc, "returnval") else {
        return Ok(None);
    };
    let kind = node
        .attribute("type")
        .ok_or_else(|| VimError::Protocol("returnval without type attribute".into()))?;
    let value = node
        .text()
        .ok_or_else(|| VimError::Protocol("returnval without object id".into()))?;
    Ok(Some(ManagedObjectRef::new(kind, value.trim())))
}

fn node_mor(node: &Node<'_, '_>) -> Option<ManagedObjectRef> {
    let kind = node.attribute("type")?;
    let value = node.text()?;
    Some(ManagedObjectRef::new(kind, value.trim()))
}

fn child_text<'a>(node: &Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|n| n.is_element() && n.tag_name().name() == name)
        .and_then(|n| n.text())
}

fn parse_retrieve_result(xml: &str, path: &str) -> VimResult<PropertyValue> {
    let doc = parse_doc(xml)?;
    let Some(object) = first_element(&doc, "objects") else {
        return Err(VimError::property(
            path,
            PropertyErrorKind::ObjectNotFound,
            "no such object",
        ));
    };

    if let Some(missing) = object
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "missingSet")
    {
        return Err(classify_missing(&missing, path));
    }

    let val = object
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "val")
        .ok_or_else(|| {
            VimError::property(path, PropertyErrorKind::Other, "property set was empty")
        })?;
    parse_property_value(&val, path)
}

fn classify_missing(missing: &Node<'_, '_>, path: &str) -> VimError {
    let fault_type = missing
        .descendants()
        .filter(|n| n.is_element())
        .find_map(|n| xsi_type(&n).map(str::to_string))
        .unwrap_or_default();
    let message = missing
        .descendants()
        .find(|n| n.is_element() && n.tag_name().name() == "localizedMessage")
        .and_then(|n| n.text())
        .unwrap_or("property unavailable")
        .to_string();

    match FaultKind::from_wire(&fault_type) {
        FaultKind::NotAuthenticated => VimError::Auth(message),
        FaultKind::InvalidProperty => {
            VimError::property(path, PropertyErrorKind::InvalidPath, message)
        }
        FaultKind::ManagedObjectNotFound => {
            VimError::property(path, PropertyErrorKind::ObjectNotFound, message)
        }
        _ => VimError::property(path, PropertyErrorKind::Other, message),
    }
}

fn parse_property_value(val: &Node<'_, '_>, path: &str) -> VimResult<PropertyValue> {
    match xsi_type(val).unwrap_or("string") {
        "string" => Ok(PropertyValue::Str(
            val.text().unwrap_or("").trim().to_string(),
        )),
        "boolean" => Ok(PropertyValue::Bool(val.text().map(str::trim) == Some("true"))),
        "ManagedObjectReference" => node_mor(val)
            .map(PropertyValue::Mor)
            .ok_or_else(|| VimError::Protocol("malformed object reference".into())),
        "ArrayOfManagedObjectReference" => Ok(PropertyValue::MorList(
            val.children()
                .filter(|n| n.is_element())
                .filter_map(|n| node_mor(&n))
                .collect(),
        )),
        "ArrayOfOptionValue" => Ok(PropertyValue::Options(
            val.children()
                .filter(|n| n.is_element())
                .filter_map(|n| {
                    Some(OptionValue::new(
                        child_text(&n, "key")?,
                        child_text(&n, "value").unwrap_or(""),
                    ))
                })
                .collect(),
        )),
        // Device lists are narrowed to ethernet cards, recognizable by a MAC.
        "ArrayOfVirtualDevice" => Ok(PropertyValue::Ethernets(
            val.children()
                .filter(|n| n.is_element())
                .filter(|n| child_text(n, "macAddress").is_some())
                .filter_map(|n| {
                    Some(EthernetCard {
                        key: child_text(&n, "key")?.parse().ok()?,
                        kind: xsi_type(&n).unwrap_or("VirtualEthernetCard").to_string(),
                    })
                })
                .collect(),
        )),
        "TaskInfo" => Ok(PropertyValue::Task(parse_task_info(val))),
        other => Err(VimError::Protocol(format!(
            "unsupported property type '{other}' at '{path}'"
        ))),
    }
}

fn parse_task_info(val: &Node<'_, '_>) -> TaskInfo {
    let state = child_text(val, "state")
        .map(TaskState::from_wire)
        .unwrap_or(TaskState::Error);

    let error = val
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "error")
        .map(|err| {
            let kind = err
                .children()
                .find(|n| n.is_element() && n.tag_name().name() == "fault")
                .and_then(|f| xsi_type(&f).map(FaultKind::from_wire))
                .unwrap_or(FaultKind::Other(String::new()));
            let message = child_text(&err, "localizedMessage")
                .unwrap_or("task failed")
                .to_string();
            MethodFault { kind, message }
        });

    let result = val
        .children()
        .find(|n| n.is_element() && n.tag_name().name() == "result")
        .and_then(|n| node_mor(&n));

    TaskInfo {
        state,
        error,
        result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_authenticated_fault() {
        let xml = r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/">
<soapenv:Body><soapenv:Fault><faultcode>ServerFaultCode</faultcode>
<faultstring>The session is not authenticated.</faultstring>
<detail><NotAuthenticatedFault xmlns="urn:vim25"/></detail>
</soapenv:Fault></soapenv:Body></soapenv:Envelope>"#;
        let fault = parse_fault(xml).unwrap();
        assert_eq!(fault.kind, FaultKind::NotAuthenticated);
        assert!(fault.message.contains("not authenticated"));
    }

    #[test]
    fn parses_string_property() {
        let xml = wrap_objects(
            r#"<propSet><name>name</name><val xsi:type="xsd:string">agent-3</val></propSet>"#,
        );
        let value = parse_retrieve_result(&xml, "name").unwrap();
        assert_eq!(value.as_str(), Some("agent-3"));
    }

    #[test]
    fn parses_frozen_marker() {
        let xml = wrap_objects(
            r#"<propSet><name>runtime.instantCloneFrozen</name><val xsi:type="xsd:boolean">true</val></propSet>"#,
        );
        let value = parse_retrieve_result(&xml, "runtime.instantCloneFrozen").unwrap();
        assert_eq!(value.as_bool(), Some(true));
    }

    #[test]
    fn missing_invalid_property_fails_loudly() {
        let xml = wrap_objects(
            r#"<missingSet><path>no.such.path</path><fault><fault xsi:type="InvalidProperty"/><localizedMessage>bad path</localizedMessage></fault></missingSet>"#,
        );
        let err = parse_retrieve_result(&xml, "no.such.path").unwrap_err();
        match err {
            VimError::Property { kind, .. } => assert_eq!(kind, PropertyErrorKind::InvalidPath),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_not_authenticated_maps_to_auth() {
        let xml = wrap_objects(
            r#"<missingSet><path>name</path><fault><fault xsi:type="NotAuthenticated"/><localizedMessage>expired</localizedMessage></fault></missingSet>"#,
        );
        assert!(parse_retrieve_result(&xml, "name").unwrap_err().is_auth());
    }

    #[test]
    fn parses_task_info_with_duplicate_name() {
        let xml = wrap_objects(
            r#"<propSet><name>info</name><val xsi:type="TaskInfo">
<state>error</state>
<error><fault xsi:type="DuplicateName"/><localizedMessage>name taken</localizedMessage></error>
</val></propSet>"#,
        );
        let info = parse_retrieve_result(&xml, "info")
            .unwrap()
            .into_task()
            .unwrap();
        assert_eq!(info.state, TaskState::Error);
        assert_eq!(info.error.unwrap().kind, FaultKind::DuplicateName);
    }

    #[test]
    fn parses_device_list_to_ethernets() {
        let xml = wrap_objects(
            r#"<propSet><name>config.hardware.device</name><val xsi:type="ArrayOfVirtualDevice">
<VirtualDevice xsi:type="VirtualDisk"><key>2000</key></VirtualDevice>
<VirtualDevice xsi:type="VirtualVmxnet3"><key>4000</key><macAddress>00:50:56:aa:bb:cc</macAddress></VirtualDevice>
</val></propSet>"#,
        );
        let cards = parse_retrieve_result(&xml, "config.hardware.device")
            .unwrap()
            .into_ethernets()
            .unwrap();
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].key, 4000);
        assert_eq!(cards[0].kind, "VirtualVmxnet3");
    }

    #[test]
    fn relocate_spec_serializes_device_changes() {
        let spec = crate::types::RelocateSpec {
            folder: ManagedObjectRef::new("Folder", "group-v2"),
            pool: Some(ManagedObjectRef::new("ResourcePool", "resgroup-8")),
            datastore: None,
            nic_changes: vec![crate::types::NicChange {
                device: EthernetCard {
                    key: 4000,
                    kind: "VirtualVmxnet3".into(),
                },
                backing: NetworkBacking::Standard {
                    network: ManagedObjectRef::new("Network", "network-11"),
                    device_name: "ci-lan".into(),
                },
            }],
        };
        let xml = relocate_xml(&spec);
        assert!(xml.contains("<folder type=\"Folder\">group-v2</folder>"));
        assert!(xml.contains("<operation>edit</operation>"));
        assert!(xml.contains("<deviceName>ci-lan</deviceName>"));
        // datastore omitted, pool present, in sequence order
        assert!(!xml.contains("<datastore"));
        assert!(xml.find("<pool").unwrap() < xml.find("<deviceChange").unwrap());
    }

    fn wrap_objects(inner: &str) -> String {
        format!(
            r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/" xmlns:xsi="{XSI}" xmlns:xsd="http://www.w3.org/2001/XMLSchema">
<soapenv:Body><RetrievePropertiesExResponse xmlns="urn:vim25"><returnval>
<objects><obj type="VirtualMachine">vm-42</obj>{inner}</objects>
</returnval></RetrievePropertiesExResponse></soapenv:Body></soapenv:Envelope>"#
        )
    }
}
